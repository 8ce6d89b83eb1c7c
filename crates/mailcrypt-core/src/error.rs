//! Error types for the session layer.

use std::path::PathBuf;

/// Convenient result alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the session layer.
///
/// Recoverable operation conditions (bad passphrase, untrusted keys,
/// missing keys) are not errors; they travel as status flags and are
/// resolved interactively. This enum covers the genuinely fallible
/// plumbing around them.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Tool invocation failed below the session layer.
    #[error(transparent)]
    Pgp(#[from] mailcrypt_pgp::Error),

    /// Filesystem trouble while reading or writing the configuration.
    #[error("config file {path}: {source}")]
    ConfigIo {
        /// The file involved.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file exists but does not parse.
    #[error("config file {path} is malformed: {source}")]
    ConfigFormat {
        /// The file involved.
        path: PathBuf,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },

    /// No per-user configuration directory could be determined.
    #[error("no configuration directory available on this system")]
    NoConfigDir,
}
