//! Error types for the PGP adapter library.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while driving an external OpenPGP tool.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error while talking to the child process.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The tool binary could not be started.
    #[error("Failed to start {tool}: {source}")]
    Spawn {
        /// Binary that failed to launch.
        tool: String,
        /// Underlying spawn error.
        #[source]
        source: std::io::Error,
    },

    /// The tool did not finish within the configured time limit.
    ///
    /// The child process is killed when this is returned.
    #[error("{tool} did not finish within {limit:?}")]
    Timeout {
        /// Binary that was killed.
        tool: String,
        /// Time limit that expired.
        limit: Duration,
    },

    /// The tool's key listing could not be interpreted.
    #[error("Unparsable key listing from {tool}: {detail}")]
    KeyListing {
        /// Binary that produced the listing.
        tool: String,
        /// Description of what went wrong.
        detail: String,
    },
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
