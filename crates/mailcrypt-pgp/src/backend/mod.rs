//! Tool-family dispatch for the supported OpenPGP implementations.
//!
//! Every supported tool family (GnuPG plus three legacy PGP command-line
//! generations) gets its own adapter that knows how to invoke its binary,
//! format its argument dialect and parse its particular output grammar.
//! [`Backend`] is a closed enum over those adapters; reselection builds a
//! fresh value and drops the old one.

mod gpg;
mod null;
mod pgp2;
mod pgp5;
mod pgp6;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::envelope::{BlockKind, Envelope};
use crate::exec::{ToolCommand, find_in_path};
use crate::status::Status;
use crate::Result;

pub use gpg::GpgBackend;
pub use null::NullBackend;
pub use pgp2::Pgp2Backend;
pub use pgp5::Pgp5Backend;
pub use pgp6::Pgp6Backend;

/// The configured tool family. `Auto` probes for installed binaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    /// Probe the filesystem and lock in the first tool found.
    #[default]
    Auto,
    /// GnuPG.
    Gpg,
    /// PGP 2.6.x.
    Pgp2,
    /// PGP 5.x (split `pgpe`/`pgps`/`pgpv`/`pgpk` binaries).
    Pgp5,
    /// PGP 6.x.
    Pgp6,
}

/// Settings every adapter needs: identity, behavior flags and limits.
#[derive(Debug, Clone)]
pub struct ToolConfig {
    /// The user identity signing is performed as (may be empty).
    pub user: String,
    /// Also encrypt outgoing messages to the user's own key.
    pub encrypt_to_self: bool,
    /// Explicit path to the tool binary, overriding the `$PATH` probe.
    pub binary_override: Option<PathBuf>,
    /// Hard limit on one tool invocation.
    pub timeout: Duration,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            user: String::new(),
            encrypt_to_self: false,
            binary_override: None,
            timeout: Duration::from_secs(60),
        }
    }
}

/// One free-text line describing a public key, as emitted by the tool's
/// key-listing command.
///
/// The line is deliberately kept opaque and matched by substring; the
/// backend tool remains the source of truth for key validity. The first
/// whitespace-separated token is the key identifier the tool accepts back
/// as a recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDescriptor(String);

impl KeyDescriptor {
    /// Wraps one key-listing line.
    #[must_use]
    pub fn new(line: impl Into<String>) -> Self {
        Self(line.into())
    }

    /// The whole descriptor line.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The key identifier (first token of the line).
    #[must_use]
    pub fn key_id(&self) -> &str {
        self.0.split_whitespace().next().unwrap_or("")
    }
}

impl std::fmt::Display for KeyDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-message parse and run state shared by every adapter.
#[derive(Debug, Default)]
pub(crate) struct MessageState {
    /// The armored block (or the whole body when no block was found).
    pub input: String,
    /// The processed substitute for the block; empty until a run succeeds.
    pub output: String,
    /// Accumulated human-readable diagnostics from the tool.
    pub diagnostics: String,
    /// Flags from the most recent run.
    pub status: Status,
    /// The block is an encrypted PGP MESSAGE.
    pub encrypted: bool,
    /// The block carries a signature.
    pub signed: bool,
    /// Identity of the signer, when known.
    pub signed_by: Option<String>,
    /// Key id of the signer, when known.
    pub signed_by_key: Option<String>,
    /// The signature checked out.
    pub sig_good: bool,
    /// Key ids the message was encrypted for.
    pub receivers: Vec<String>,
}

impl MessageState {
    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }

    pub(crate) fn load(&mut self, raw: &str) -> Option<Envelope> {
        self.clear();
        match Envelope::parse(raw) {
            Some(env) => {
                self.input = env.block.clone();
                self.encrypted = env.kind == BlockKind::Message;
                self.signed = env.kind == BlockKind::SignedMessage;
                Some(env)
            }
            None => {
                // No armored block: keep the whole body so a later
                // encrypt/sign call has its plaintext.
                self.input = raw.to_string();
                None
            }
        }
    }

    /// The processed message, falling back to the input while no run has
    /// produced output (or after the output was discarded).
    pub(crate) fn message(&self) -> &str {
        if self.output.is_empty() {
            &self.input
        } else {
            &self.output
        }
    }

    pub(crate) fn note(&mut self, line: &str) {
        self.diagnostics.push_str(line);
        self.diagnostics.push('\n');
    }
}

/// The active tool adapter.
///
/// Holds the last loaded message and the results of the last run; the
/// accessors return empty/false defaults before any successful
/// `set_message`/`decrypt`.
#[derive(Debug)]
pub enum Backend {
    /// GnuPG adapter.
    Gpg(GpgBackend),
    /// PGP 2.6.x adapter.
    Pgp2(Pgp2Backend),
    /// PGP 5.x adapter.
    Pgp5(Pgp5Backend),
    /// PGP 6.x adapter.
    Pgp6(Pgp6Backend),
    /// Installed-tool-free fallback: every capability degrades to
    /// "cannot do crypto" instead of failing hard.
    Null(NullBackend),
}

impl Backend {
    /// Builds the adapter for `kind`, probing the filesystem for `Auto`.
    ///
    /// An explicitly selected tool whose binary is missing, and an `Auto`
    /// probe that finds nothing, both yield the [`NullBackend`].
    pub async fn select(kind: ToolKind, config: &ToolConfig) -> Self {
        match kind {
            ToolKind::Gpg => Self::with_binary(config, "gpg", |p, c| {
                Self::Gpg(GpgBackend::new(p, c))
            }),
            ToolKind::Pgp2 => Self::with_binary(config, "pgp", |p, c| {
                Self::Pgp2(Pgp2Backend::new(p, c))
            }),
            ToolKind::Pgp5 => Self::with_binary(config, "pgpe", |p, c| {
                Self::Pgp5(Pgp5Backend::new(p, c))
            }),
            ToolKind::Pgp6 => Self::with_binary(config, "pgp", |p, c| {
                Self::Pgp6(Pgp6Backend::new(p, c))
            }),
            ToolKind::Auto => Self::probe(config).await,
        }
    }

    fn with_binary(
        config: &ToolConfig,
        default_name: &str,
        build: impl FnOnce(String, ToolConfig) -> Self,
    ) -> Self {
        let resolved = config.binary_override.as_ref().map_or_else(
            || find_in_path(default_name),
            |p| Some(p.clone()),
        );
        match resolved {
            Some(path) => build(path.to_string_lossy().into_owned(), config.clone()),
            None => {
                warn!(binary = default_name, "selected tool is not installed");
                Self::Null(NullBackend::default())
            }
        }
    }

    /// Probes `$PATH` in fixed preference order: GnuPG first, then the
    /// legacy generations. The single `pgp` binary serves both 2.6.x and
    /// 6.x and is told apart by its version banner.
    async fn probe(config: &ToolConfig) -> Self {
        if let Some(path) = find_in_path("gpg") {
            debug!(path = %path.display(), "auto-detected gpg");
            return Self::Gpg(GpgBackend::new(
                path.to_string_lossy().into_owned(),
                config.clone(),
            ));
        }
        if let Some(path) = find_in_path("pgpe") {
            debug!(path = %path.display(), "auto-detected pgp 5");
            return Self::Pgp5(Pgp5Backend::new(
                path.to_string_lossy().into_owned(),
                config.clone(),
            ));
        }
        if let Some(path) = find_in_path("pgp") {
            let program = path.to_string_lossy().into_owned();
            if banner_is_version_6(&program, config.timeout).await {
                debug!(path = %path.display(), "auto-detected pgp 6");
                return Self::Pgp6(Pgp6Backend::new(program, config.clone()));
            }
            debug!(path = %path.display(), "auto-detected pgp 2");
            return Self::Pgp2(Pgp2Backend::new(program, config.clone()));
        }
        debug!("no OpenPGP tool found, using null backend");
        Self::Null(NullBackend::default())
    }

    /// True unless this is the null fallback.
    #[must_use]
    pub const fn is_available(&self) -> bool {
        !matches!(self, Self::Null(_))
    }

    /// The concrete tool family in use, `None` for the null fallback.
    #[must_use]
    pub const fn kind(&self) -> Option<ToolKind> {
        match self {
            Self::Gpg(_) => Some(ToolKind::Gpg),
            Self::Pgp2(_) => Some(ToolKind::Pgp2),
            Self::Pgp5(_) => Some(ToolKind::Pgp5),
            Self::Pgp6(_) => Some(ToolKind::Pgp6),
            Self::Null(_) => None,
        }
    }

    fn state(&self) -> &MessageState {
        match self {
            Self::Gpg(b) => b.state(),
            Self::Pgp2(b) => b.state(),
            Self::Pgp5(b) => b.state(),
            Self::Pgp6(b) => b.state(),
            Self::Null(b) => b.state(),
        }
    }

    fn state_mut(&mut self) -> &mut MessageState {
        match self {
            Self::Gpg(b) => b.state_mut(),
            Self::Pgp2(b) => b.state_mut(),
            Self::Pgp5(b) => b.state_mut(),
            Self::Pgp6(b) => b.state_mut(),
            Self::Null(b) => b.state_mut(),
        }
    }

    /// Loads a message body, splitting it around its armored block.
    ///
    /// Returns the envelope when a `-----BEGIN PGP` marker was found.
    /// Without a marker the body is still retained as plaintext input for
    /// a later encrypt/sign call, and `None` is returned.
    pub fn set_message(&mut self, raw: &str) -> Option<Envelope> {
        self.state_mut().load(raw)
    }

    /// Decrypts the loaded block.
    ///
    /// No-op success when the message is not flagged encrypted. The
    /// passphrase is borrowed for this call only and never stored.
    pub async fn decrypt(&mut self, passphrase: Option<&str>) -> Status {
        if !self.state().encrypted {
            return Status::OK;
        }
        match self {
            Self::Gpg(b) => b.decrypt(passphrase).await,
            Self::Pgp2(b) => b.decrypt(passphrase).await,
            Self::Pgp5(b) => b.decrypt(passphrase).await,
            Self::Pgp6(b) => b.decrypt(passphrase).await,
            Self::Null(b) => b.refuse(),
        }
    }

    /// Verifies the signature of a clearsigned block.
    pub async fn verify(&mut self) -> Status {
        match self {
            Self::Gpg(b) => b.decrypt(None).await,
            Self::Pgp2(b) => b.decrypt(None).await,
            Self::Pgp5(b) => b.verify().await,
            Self::Pgp6(b) => b.decrypt(None).await,
            Self::Null(b) => b.refuse(),
        }
    }

    /// Encrypts the loaded input for the given (already resolved) key ids.
    pub async fn encrypt(&mut self, recipients: &[String], ignore_untrusted: bool) -> Status {
        match self {
            Self::Gpg(b) => b.encrypt(recipients, None, ignore_untrusted).await,
            Self::Pgp2(b) => b.encrypt(recipients, None, ignore_untrusted).await,
            Self::Pgp5(b) => b.encrypt(recipients, None, ignore_untrusted).await,
            Self::Pgp6(b) => b.encrypt(recipients, None, ignore_untrusted).await,
            Self::Null(b) => b.refuse(),
        }
    }

    /// Encrypts and signs in one pass.
    pub async fn encsign(
        &mut self,
        recipients: &[String],
        passphrase: Option<&str>,
        ignore_untrusted: bool,
    ) -> Status {
        match self {
            Self::Gpg(b) => b.encrypt(recipients, passphrase, ignore_untrusted).await,
            Self::Pgp2(b) => b.encrypt(recipients, passphrase, ignore_untrusted).await,
            Self::Pgp5(b) => b.encrypt(recipients, passphrase, ignore_untrusted).await,
            Self::Pgp6(b) => b.encrypt(recipients, passphrase, ignore_untrusted).await,
            Self::Null(b) => b.refuse(),
        }
    }

    /// Clearsigns the loaded input.
    pub async fn sign(&mut self, passphrase: &str) -> Status {
        match self {
            Self::Gpg(b) => b.sign(passphrase).await,
            Self::Pgp2(b) => b.sign(passphrase).await,
            Self::Pgp5(b) => b.sign(passphrase).await,
            Self::Pgp6(b) => b.sign(passphrase).await,
            Self::Null(b) => b.refuse(),
        }
    }

    /// Certifies the given public key with the user's secret key.
    pub async fn sign_key(&mut self, key_id: &str, passphrase: &str) -> Status {
        match self {
            Self::Gpg(b) => b.sign_key(key_id, passphrase).await,
            Self::Pgp2(b) => b.sign_key(key_id, passphrase).await,
            Self::Pgp5(b) => b.sign_key(key_id, passphrase).await,
            Self::Pgp6(b) => b.sign_key(key_id, passphrase).await,
            Self::Null(b) => b.refuse(),
        }
    }

    /// Runs the tool's key-listing command and returns every descriptor.
    ///
    /// # Errors
    ///
    /// Propagates tool invocation failures; the null backend returns an
    /// empty list.
    pub async fn pub_keys(&self) -> Result<Vec<KeyDescriptor>> {
        match self {
            Self::Gpg(b) => b.pub_keys().await,
            Self::Pgp2(b) => b.pub_keys().await,
            Self::Pgp5(b) => b.pub_keys().await,
            Self::Pgp6(b) => b.pub_keys().await,
            Self::Null(_) => Ok(Vec::new()),
        }
    }

    /// ASCII-armored export of the public key matching `identity`.
    ///
    /// # Errors
    ///
    /// Propagates tool invocation failures.
    pub async fn public_key_armored(&self, identity: &str) -> Result<String> {
        match self {
            Self::Gpg(b) => b.public_key_armored(identity).await,
            Self::Pgp2(b) => b.public_key_armored(identity).await,
            Self::Pgp5(b) => b.public_key_armored(identity).await,
            Self::Pgp6(b) => b.public_key_armored(identity).await,
            Self::Null(_) => Ok(String::new()),
        }
    }

    /// Whether the loaded block is an encrypted message.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.state().encrypted
    }

    /// Whether the loaded block carries a signature.
    #[must_use]
    pub fn is_signed(&self) -> bool {
        self.state().signed
    }

    /// Identity of the signer, when a run has established it.
    #[must_use]
    pub fn signed_by(&self) -> Option<&str> {
        self.state().signed_by.as_deref()
    }

    /// Key id of the signer, when a run has established it.
    #[must_use]
    pub fn signed_by_key(&self) -> Option<&str> {
        self.state().signed_by_key.as_deref()
    }

    /// Whether the last verified signature checked out.
    #[must_use]
    pub fn is_sig_good(&self) -> bool {
        self.state().sig_good
    }

    /// The key the message was encrypted for (first reported), used as a
    /// passphrase prompt hint.
    #[must_use]
    pub fn encrypted_for(&self) -> Option<&str> {
        self.state().receivers.first().map(String::as_str)
    }

    /// Every key id the message was encrypted for.
    #[must_use]
    pub fn receivers(&self) -> &[String] {
        &self.state().receivers
    }

    /// The processed message (decrypted/encrypted/signed substitute), or
    /// the unmodified input while no run has produced output.
    #[must_use]
    pub fn message(&self) -> &str {
        self.state().message()
    }

    /// Discards the processed output, reverting [`Self::message`] to the
    /// unmodified input ("send unencrypted" path).
    pub fn clear_output(&mut self) {
        self.state_mut().output.clear();
    }

    /// Diagnostic text accumulated during the last run.
    #[must_use]
    pub fn last_error(&self) -> &str {
        &self.state().diagnostics
    }

    /// Flags from the most recent run.
    #[must_use]
    pub fn status(&self) -> Status {
        self.state().status
    }
}

/// Runs `pgp` bare and checks its version banner for a 6.x release.
async fn banner_is_version_6(program: &str, limit: Duration) -> bool {
    let run = ToolCommand::new(program, limit).run().await;
    match run {
        Ok(out) => {
            let banner = format!("{}{}", out.stdout_text(), out.stderr_text());
            banner
                .lines()
                .take(4)
                .any(|line| line.contains("6.") && line.to_lowercase().contains("pgp"))
        }
        Err(_) => false,
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn key_descriptor_first_token_is_id() {
        let key = KeyDescriptor::new("5F34A2B1 Bob Example <bob@x.com>");
        assert_eq!(key.key_id(), "5F34A2B1");
        assert!(key.as_str().contains("<bob@x.com>"));
    }

    #[test]
    fn message_state_load_splits_block() {
        let mut state = MessageState::default();
        let env = state
            .load("a\n-----BEGIN PGP MESSAGE-----\nx\n-----END PGP MESSAGE-----\nb\n")
            .unwrap();
        assert!(state.encrypted);
        assert!(!state.signed);
        assert_eq!(env.front, "a\n");
        assert_eq!(env.back, "b\n");
    }

    #[test]
    fn message_state_keeps_plaintext_without_block() {
        let mut state = MessageState::default();
        assert!(state.load("plain text to encrypt later").is_none());
        assert_eq!(state.message(), "plain text to encrypt later");
        assert!(!state.encrypted);
    }

    #[test]
    fn output_falls_back_after_clear() {
        let mut state = MessageState::default();
        state.load("body");
        state.output = "ciphertext".to_string();
        assert_eq!(state.message(), "ciphertext");
        state.output.clear();
        assert_eq!(state.message(), "body");
    }

    #[tokio::test]
    async fn null_backend_when_nothing_installed() {
        let config = ToolConfig {
            binary_override: Some(PathBuf::from("/nonexistent/gpg")),
            ..ToolConfig::default()
        };
        // An override pointing nowhere still builds the concrete adapter;
        // probing is only bypassed, not validated here.
        let backend = Backend::select(ToolKind::Gpg, &config).await;
        assert!(backend.is_available());
        assert_eq!(backend.kind(), Some(ToolKind::Gpg));
    }

    #[tokio::test]
    async fn accessors_default_before_any_message() {
        let backend = Backend::Null(NullBackend::default());
        assert!(!backend.is_encrypted());
        assert!(!backend.is_signed());
        assert!(backend.signed_by().is_none());
        assert!(!backend.is_sig_good());
        assert!(backend.receivers().is_empty());
        assert_eq!(backend.message(), "");
        assert_eq!(backend.last_error(), "");
    }

    #[tokio::test]
    async fn null_backend_reports_no_sec_key() {
        let mut backend = Backend::Null(NullBackend::default());
        backend.set_message("-----BEGIN PGP MESSAGE-----\nx\n-----END PGP MESSAGE-----\n");
        let status = backend.decrypt(None).await;
        assert!(status.no_sec_key);
        assert!(!status.is_ok());
        assert!(backend.pub_keys().await.unwrap().is_empty());
    }
}
