//! The crypto session state machine.
//!
//! A [`Session`] owns one in-flight cryptographic operation over one
//! message: load, then decrypt/verify or encrypt/sign, then resolution.
//! It is the single place where backend status flags are translated
//! into user decisions; the tool adapters never prompt and the prompts
//! never touch the tool. Callers construct a session explicitly and
//! run one operation at a time.

use mailcrypt_pgp::{Backend, Envelope, KeyDescriptor, Status};
use tracing::{debug, warn};

use crate::Result;
use crate::config::SessionConfig;
use crate::keys::{self, KeyDirectory};
use crate::passphrase::Passphrase;
use crate::prompt::{Choice2, Choice3, Prompter};

const NO_TOOL_MSG: &str = "Could not find PGP executable, please check your installation.";

/// How the last operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The operation ran to completion.
    Success,
    /// The user aborted at a prompt.
    Declined,
    /// The tool reported an unrecoverable error; see `last_error_msg`.
    Failed,
}

/// Where the session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No message loaded.
    Idle,
    /// A message with a PGP block is loaded and unprocessed.
    MessageLoaded,
    /// The last operation resolved.
    Resolved(Outcome),
}

/// Session controller driving one OpenPGP operation at a time.
pub struct Session<P: Prompter> {
    prompter: P,
    config: SessionConfig,
    backend: Backend,
    directory: KeyDirectory,
    passphrase: Option<Passphrase>,
    envelope: Option<Envelope>,
    state: SessionState,
    last_error: String,
}

impl<P: Prompter> Session<P> {
    /// Builds a session with configuration loaded from disk.
    pub async fn new(prompter: P) -> Self {
        Self::with_config(prompter, SessionConfig::load()).await
    }

    /// Builds a session with an explicit configuration.
    pub async fn with_config(prompter: P, config: SessionConfig) -> Self {
        let backend = Backend::select(config.tool, &config.tool_config()).await;
        Self {
            prompter,
            config,
            backend,
            directory: KeyDirectory::default(),
            passphrase: None,
            envelope: None,
            state: SessionState::Idle,
            last_error: String::new(),
        }
    }

    /// Re-selects the tool from the current configuration, discarding
    /// the previous adapter and the cached key directory.
    pub async fn assign_backend(&mut self) {
        self.backend = Backend::select(self.config.tool, &self.config.tool_config()).await;
        self.directory.invalidate();
        debug!(kind = ?self.backend.kind(), "backend assigned");
    }

    /// Persists the configuration and re-selects the backend so the
    /// change takes effect immediately.
    ///
    /// # Errors
    ///
    /// Propagates configuration write failures; the backend is
    /// re-selected regardless.
    pub async fn write_config(&mut self) -> Result<()> {
        let stored = self.config.store();
        self.assign_backend().await;
        stored
    }

    /// Whether an OpenPGP tool is installed and selected.
    #[must_use]
    pub const fn have_pgp(&self) -> bool {
        self.backend.is_available()
    }

    /// Loads a message body for processing.
    ///
    /// Returns true and moves to `MessageLoaded` when the body carries a
    /// PGP block and a tool is available. A body without a block leaves
    /// the session idle; a block without an installed tool records the
    /// missing-tool error. In both cases the body is retained so later
    /// encrypt/sign calls have their plaintext.
    pub fn set_message(&mut self, raw: &str) -> bool {
        self.last_error.clear();
        self.state = SessionState::Idle;
        self.envelope = self.backend.set_message(raw);
        if self.envelope.is_none() {
            return false;
        }
        if !self.backend.is_available() {
            warn!("message carries a PGP block but no tool is installed");
            self.last_error = NO_TOOL_MSG.to_string();
            return false;
        }
        self.state = SessionState::MessageLoaded;
        true
    }

    /// Checks preconditions for a run and solicits the passphrase when
    /// one is needed and none is cached.
    async fn prepare(&mut self, need_passphrase: bool) -> bool {
        if !self.backend.is_available() {
            self.last_error = NO_TOOL_MSG.to_string();
            self.state = SessionState::Resolved(Outcome::Failed);
            return false;
        }
        if self.backend.status().no_sec_key {
            self.last_error =
                "You do not have the secret key needed for this message.".to_string();
            self.state = SessionState::Resolved(Outcome::Failed);
            return false;
        }
        if need_passphrase && self.passphrase.is_none() {
            let hint = self
                .backend
                .encrypted_for()
                .unwrap_or(&self.config.user)
                .to_string();
            match self.prompter.request_passphrase(&hint).await {
                Some(pass) => self.passphrase = Some(pass),
                None => {
                    debug!("passphrase prompt cancelled");
                    return self.decline();
                }
            }
        }
        true
    }

    /// Wipes the cached passphrase unless the user opted to keep it.
    /// The buffer is overwritten, not merely dropped.
    fn cleanup_pass(&mut self) {
        if !self.config.store_pass {
            self.passphrase = None;
        }
    }

    /// Caches a passphrase (`None` wipes the current one).
    pub fn set_passphrase(&mut self, pass: Option<Passphrase>) {
        self.passphrase = pass;
    }

    /// Decrypts the loaded message.
    ///
    /// Immediate success when the message is not encrypted: no tool
    /// run, no prompt. A rejected passphrase invalidates the cache so
    /// the next attempt re-prompts, but this call does not loop.
    pub async fn decrypt(&mut self) -> bool {
        if !self.backend.is_encrypted() {
            return true;
        }
        if !self.prepare(true).await {
            return false;
        }
        let pass = self.passphrase.clone();
        let status = self
            .backend
            .decrypt(pass.as_ref().map(Passphrase::as_str))
            .await;
        self.cleanup_pass();
        if status.bad_phrase {
            self.passphrase = None;
            return self.fail("The passphrase you entered is invalid.");
        }
        if !status.is_ok() {
            return self.fail_from_backend();
        }
        self.succeed()
    }

    /// Verifies the signature of a clearsigned message.
    pub async fn verify(&mut self) -> bool {
        if !self.prepare(false).await {
            return false;
        }
        let status = self.backend.verify().await;
        if !status.is_ok() {
            return self.fail_from_backend();
        }
        self.succeed()
    }

    /// Clearsigns the loaded message.
    pub async fn sign(&mut self) -> bool {
        self.encrypt_for(&[], true).await
    }

    /// Encrypts (and optionally signs) the loaded message for the given
    /// addressees.
    ///
    /// Addressees are resolved through the key directory first;
    /// unresolvable ones are reported with a continue/cancel choice.
    /// Recoverable tool conditions are then worked through in fixed
    /// order: bad passphrase (retry / send unsigned / abort, looping on
    /// retry), untrusted keys (encrypt anyway / send unencrypted /
    /// abort), missing key (send as is / abort). Anything still failing
    /// after that is terminal.
    pub async fn encrypt_for(&mut self, recipients: &[String], should_sign: bool) -> bool {
        self.last_error.clear();

        let mut key_ids: Vec<String> = Vec::new();
        let mut unresolved: Vec<String> = Vec::new();
        if self.backend.is_available() {
            for person in recipients {
                match self.get_public_key(person).await {
                    Some(key) => key_ids.push(key.key_id().to_string()),
                    None => unresolved.push(person.clone()),
                }
            }
        } else {
            unresolved.extend(recipients.iter().cloned());
        }

        if !unresolved.is_empty() {
            let text = format!(
                "No public key was found for:\n{}\nThe message will not be readable by them. Send anyway?",
                unresolved.join("\n")
            );
            if self.prompter.request_continue(&text, "Send").await == Choice2::Cancel {
                return self.decline();
            }
        }
        if key_ids.is_empty() && !recipients.is_empty() {
            let text = "No encryption keys are usable. The message will not be encrypted.";
            if self
                .prompter
                .request_continue(text, "Send unencrypted")
                .await
                == Choice2::Cancel
            {
                return self.decline();
            }
        }

        if should_sign && !self.prepare(true).await {
            return false;
        }

        let mut sign = should_sign;
        let mut ignore_untrusted = false;
        loop {
            let status = self.run_enc_sign(&key_ids, sign, ignore_untrusted).await;
            self.cleanup_pass();

            if status.bad_phrase {
                self.passphrase = None;
                match self
                    .prompter
                    .request_retry_or_demote(
                        "The passphrase you entered is invalid.",
                        "Enter new passphrase",
                        "Send unsigned",
                    )
                    .await
                {
                    Choice3::Retry => {
                        if !self.prepare(true).await {
                            return false;
                        }
                        continue;
                    }
                    Choice3::Demote => {
                        sign = false;
                        continue;
                    }
                    Choice3::Cancel => return self.decline(),
                }
            }
            if status.bad_keys {
                match self
                    .prompter
                    .request_retry_or_demote(
                        "A recipient key is expired, revoked or not trusted.",
                        "Encrypt anyway",
                        "Send unencrypted",
                    )
                    .await
                {
                    Choice3::Retry => {
                        ignore_untrusted = true;
                        // The passphrase was wiped after the failed
                        // attempt; a signed retry needs it back.
                        if sign && !self.prepare(true).await {
                            return false;
                        }
                        continue;
                    }
                    Choice3::Demote => {
                        self.backend.clear_output();
                        return self.succeed();
                    }
                    Choice3::Cancel => return self.decline(),
                }
            }
            if status.missing_key {
                let text = format!(
                    "A recipient has no public key.\n{}\nSend the message as is?",
                    self.backend.last_error().trim()
                );
                match self.prompter.request_continue(&text, "Send as is").await {
                    Choice2::Proceed => {
                        self.backend.clear_output();
                        return self.succeed();
                    }
                    Choice2::Cancel => return self.decline(),
                }
            }
            if !status.is_ok() {
                return self.fail_from_backend();
            }
            return self.succeed();
        }
    }

    async fn run_enc_sign(&mut self, key_ids: &[String], sign: bool, ignore_untrusted: bool) -> Status {
        let pass = self.passphrase.clone();
        let pass = pass.as_ref().map(Passphrase::as_str);
        if key_ids.is_empty() {
            return match (sign, pass) {
                (true, Some(p)) => self.backend.sign(p).await,
                _ => Status::OK,
            };
        }
        if sign {
            self.backend.encsign(key_ids, pass, ignore_untrusted).await
        } else {
            self.backend.encrypt(key_ids, ignore_untrusted).await
        }
    }

    /// Certifies a public key with the user's secret key.
    pub async fn sign_key(&mut self, key_id: &str) -> bool {
        if !self.prepare(true).await {
            return false;
        }
        let Some(pass) = self.passphrase.clone() else {
            return self.fail("No passphrase available for key signing.");
        };
        let status = self.backend.sign_key(key_id, pass.as_str()).await;
        self.cleanup_pass();
        if !status.is_ok() {
            return self.fail_from_backend();
        }
        self.succeed()
    }

    /// Finds the public key for one addressee.
    ///
    /// Tries the cached directory by canonical then raw address, then
    /// refreshes the directory once and retries with the looser reverse
    /// tier included, and finally asks the user to pick a key out of
    /// the whole directory.
    pub async fn get_public_key(&mut self, person: &str) -> Option<KeyDescriptor> {
        let cached = keys::match_address(self.directory.keys(&self.backend).await, person);
        if let Some(key) = cached {
            return Some(key.clone());
        }
        let refreshed = self.directory.refresh(&self.backend).await;
        if let Some(key) = keys::match_key(refreshed, person) {
            return Some(key.clone());
        }
        let candidates = refreshed.to_vec();
        if candidates.is_empty() {
            debug!(person, "no keys in directory");
            return None;
        }
        self.prompter.request_key_selection(&candidates, person).await
    }

    /// Whether any key plausibly belongs to this addressee.
    ///
    /// With no tool installed this answers true so composing a message
    /// is not blocked by the environment; the actual send degrades
    /// later. A miss refreshes the directory once.
    pub async fn have_public_key(&mut self, person: &str) -> bool {
        if !self.backend.is_available() {
            return true;
        }
        let hit = self
            .directory
            .keys(&self.backend)
            .await
            .iter()
            .any(|key| keys::matches_canonical(key, person));
        if hit {
            return true;
        }
        self.directory
            .refresh(&self.backend)
            .await
            .iter()
            .any(|key| keys::matches_canonical(key, person))
    }

    /// ASCII-armored export of the public key matching `identity`.
    ///
    /// # Errors
    ///
    /// Propagates tool invocation failures.
    pub async fn public_key_armored(&self, identity: &str) -> Result<String> {
        Ok(self.backend.public_key_armored(identity).await?)
    }

    fn succeed(&mut self) -> bool {
        self.state = SessionState::Resolved(Outcome::Success);
        true
    }

    fn decline(&mut self) -> bool {
        debug!("operation declined by the user");
        self.state = SessionState::Resolved(Outcome::Declined);
        false
    }

    fn fail(&mut self, msg: &str) -> bool {
        self.last_error = msg.to_string();
        self.state = SessionState::Resolved(Outcome::Failed);
        false
    }

    fn fail_from_backend(&mut self) -> bool {
        let diagnostics = self.backend.last_error().trim();
        let msg = if diagnostics.is_empty() {
            "The operation failed without diagnostics.".to_string()
        } else {
            diagnostics.to_string()
        };
        warn!(error = %msg, "operation failed");
        self.fail(&msg)
    }

    /// Where the session stands.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Text preceding the PGP block of the loaded message.
    #[must_use]
    pub fn frontmatter(&self) -> &str {
        self.envelope.as_ref().map_or("", |env| env.front.as_str())
    }

    /// Text following the PGP block of the loaded message.
    #[must_use]
    pub fn backmatter(&self) -> &str {
        self.envelope.as_ref().map_or("", |env| env.back.as_str())
    }

    /// The processed message block (or the unmodified input before any
    /// run).
    #[must_use]
    pub fn message(&self) -> &str {
        self.backend.message()
    }

    /// Whether the loaded block is an encrypted message.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.backend.is_encrypted()
    }

    /// Key ids the loaded message was encrypted for.
    #[must_use]
    pub fn receivers(&self) -> &[String] {
        self.backend.receivers()
    }

    /// The key the passphrase prompt should name.
    #[must_use]
    pub fn key_to_decrypt(&self) -> Option<&str> {
        self.backend.encrypted_for()
    }

    /// Whether the loaded block carries a signature.
    #[must_use]
    pub fn is_signed(&self) -> bool {
        self.backend.is_signed()
    }

    /// Identity of the signer, when known.
    #[must_use]
    pub fn signed_by(&self) -> Option<&str> {
        self.backend.signed_by()
    }

    /// Key id of the signer, when known.
    #[must_use]
    pub fn signed_by_key(&self) -> Option<&str> {
        self.backend.signed_by_key()
    }

    /// Whether the last verified signature checked out.
    #[must_use]
    pub fn good_signature(&self) -> bool {
        self.backend.is_sig_good()
    }

    /// Human-readable description of the last failure.
    #[must_use]
    pub fn last_error_msg(&self) -> &str {
        if self.last_error.is_empty() {
            self.backend.last_error()
        } else {
            &self.last_error
        }
    }

    /// The configured signing identity.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.config.user
    }

    /// Sets the signing identity (takes effect on the next
    /// [`Self::write_config`] or [`Self::assign_backend`]).
    pub fn set_user(&mut self, user: impl Into<String>) {
        self.config.user = user.into();
    }

    /// Whether outgoing messages are also encrypted to the user's key.
    #[must_use]
    pub const fn encrypt_to_self(&self) -> bool {
        self.config.encrypt_to_self
    }

    /// Sets encrypt-to-self (takes effect on the next backend
    /// assignment).
    pub const fn set_encrypt_to_self(&mut self, flag: bool) {
        self.config.encrypt_to_self = flag;
    }

    /// Whether the passphrase is kept between operations.
    #[must_use]
    pub const fn store_passphrase(&self) -> bool {
        self.config.store_pass
    }

    /// Sets passphrase retention; turning it off wipes the cached
    /// passphrase immediately.
    pub fn set_store_passphrase(&mut self, flag: bool) {
        self.config.store_pass = flag;
        if !flag {
            self.passphrase = None;
        }
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
    use std::path::PathBuf;
    use std::sync::Mutex;

    use mailcrypt_pgp::ToolKind;
    use mailcrypt_pgp::backend::NullBackend;

    use super::*;

    /// Prompter answering from a fixed script, counting every ask.
    #[derive(Default)]
    struct Scripted {
        passphrase: Option<String>,
        choice2: Choice2Answer,
        choice3: Choice3Answer,
        counts: Mutex<Counts>,
    }

    #[derive(Default)]
    struct Counts {
        passphrases: usize,
        continues: usize,
        retries: usize,
        selections: usize,
    }

    #[derive(Default, Clone, Copy)]
    enum Choice2Answer {
        #[default]
        Proceed,
        Cancel,
    }

    #[derive(Default, Clone, Copy)]
    enum Choice3Answer {
        #[default]
        Retry,
        Cancel,
    }

    impl Prompter for Scripted {
        async fn request_passphrase(&self, _key_hint: &str) -> Option<Passphrase> {
            self.counts.lock().unwrap().passphrases += 1;
            self.passphrase.as_deref().map(Passphrase::new)
        }

        async fn request_key_selection(
            &self,
            candidates: &[KeyDescriptor],
            _recipient: &str,
        ) -> Option<KeyDescriptor> {
            self.counts.lock().unwrap().selections += 1;
            candidates.first().cloned()
        }

        async fn request_continue(&self, _text: &str, _affirmative: &str) -> Choice2 {
            self.counts.lock().unwrap().continues += 1;
            match self.choice2 {
                Choice2Answer::Proceed => Choice2::Proceed,
                Choice2Answer::Cancel => Choice2::Cancel,
            }
        }

        async fn request_retry_or_demote(
            &self,
            _text: &str,
            _retry: &str,
            _demote: &str,
        ) -> Choice3 {
            self.counts.lock().unwrap().retries += 1;
            match self.choice3 {
                Choice3Answer::Retry => Choice3::Retry,
                Choice3Answer::Cancel => Choice3::Cancel,
            }
        }
    }

    const SIGNED: &str = "-----BEGIN PGP SIGNED MESSAGE-----\nHash: SHA1\n\nhi\n-----BEGIN PGP SIGNATURE-----\nabc\n-----END PGP SIGNATURE-----\n";

    /// A session whose backend looks installed but points at nothing;
    /// paths that never spawn the tool behave normally.
    async fn session_with_ghost_tool(prompter: Scripted) -> Session<Scripted> {
        let config = SessionConfig {
            tool: ToolKind::Gpg,
            binary_override: Some(PathBuf::from("/nonexistent/gpg")),
            ..SessionConfig::default()
        };
        Session::with_config(prompter, config).await
    }

    fn null_session(prompter: Scripted) -> Session<Scripted> {
        Session {
            prompter,
            config: SessionConfig::default(),
            backend: Backend::Null(NullBackend::default()),
            directory: KeyDirectory::default(),
            passphrase: None,
            envelope: None,
            state: SessionState::Idle,
            last_error: String::new(),
        }
    }

    #[tokio::test]
    async fn body_without_marker_stays_idle() {
        let mut session = session_with_ghost_tool(Scripted::default()).await;
        assert!(!session.set_message("plain text, nothing armored"));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.last_error_msg().is_empty());
        // The body is retained for a later encrypt call.
        assert_eq!(session.message(), "plain text, nothing armored");
    }

    #[tokio::test]
    async fn block_without_tool_records_the_error() {
        let mut session = null_session(Scripted::default());
        assert!(!session.set_message(SIGNED));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.last_error_msg().contains("PGP executable"));
        assert_eq!(session.frontmatter(), "");
    }

    #[tokio::test]
    async fn decrypt_of_unencrypted_message_is_immediate() {
        let prompter = Scripted {
            // No passphrase scripted: any prompt would return None and
            // flip the outcome to Declined.
            passphrase: None,
            ..Scripted::default()
        };
        let mut session = session_with_ghost_tool(prompter).await;
        assert!(session.set_message(SIGNED));
        assert!(!session.is_encrypted());
        assert!(session.decrypt().await);
        assert_eq!(session.prompter.counts.lock().unwrap().passphrases, 0);
    }

    #[tokio::test]
    async fn cleanup_pass_forces_a_reprompt() {
        let prompter = Scripted {
            passphrase: Some("hunter2".to_string()),
            ..Scripted::default()
        };
        let mut session = session_with_ghost_tool(prompter).await;

        assert!(session.prepare(true).await);
        session.cleanup_pass();
        assert!(session.passphrase.is_none());
        assert!(session.prepare(true).await);
        assert_eq!(session.prompter.counts.lock().unwrap().passphrases, 2);
    }

    #[tokio::test]
    async fn stored_passphrase_survives_cleanup() {
        let prompter = Scripted {
            passphrase: Some("hunter2".to_string()),
            ..Scripted::default()
        };
        let mut session = session_with_ghost_tool(prompter).await;
        session.config.store_pass = true;

        assert!(session.prepare(true).await);
        session.cleanup_pass();
        assert!(session.prepare(true).await);
        assert_eq!(session.prompter.counts.lock().unwrap().passphrases, 1);

        // Turning retention off wipes immediately.
        session.set_store_passphrase(false);
        assert!(session.passphrase.is_none());
    }

    #[tokio::test]
    async fn unresolvable_recipient_offers_cancel() {
        let prompter = Scripted {
            choice2: Choice2Answer::Cancel,
            ..Scripted::default()
        };
        let mut session = session_with_ghost_tool(prompter).await;
        session.set_message("dear bob");

        let sent = session
            .encrypt_for(&["bob@example.com".to_string()], false)
            .await;
        assert!(!sent);
        assert_eq!(session.state(), SessionState::Resolved(Outcome::Declined));
        assert_eq!(session.prompter.counts.lock().unwrap().continues, 1);
    }

    #[tokio::test]
    async fn zero_resolved_recipients_short_circuits() {
        let prompter = Scripted::default(); // proceeds at every prompt
        let mut session = session_with_ghost_tool(prompter).await;
        session.set_message("dear bob");

        let sent = session
            .encrypt_for(&["bob@example.com".to_string()], false)
            .await;
        assert!(sent, "user chose to send unencrypted");
        assert_eq!(session.state(), SessionState::Resolved(Outcome::Success));
        // The message is untouched: no tool run happened.
        assert_eq!(session.message(), "dear bob");
        // One prompt for the unresolved list, one for "will not be
        // encrypted".
        assert_eq!(session.prompter.counts.lock().unwrap().continues, 2);
    }

    #[tokio::test]
    async fn passphrase_cancel_declines_the_operation() {
        let prompter = Scripted {
            passphrase: None,
            ..Scripted::default()
        };
        let mut session = session_with_ghost_tool(prompter).await;
        session.set_message("sign me");

        assert!(!session.sign().await);
        assert_eq!(session.state(), SessionState::Resolved(Outcome::Declined));
    }

    #[tokio::test]
    async fn null_backend_never_blocks_composing() {
        let mut session = null_session(Scripted::default());
        assert!(session.have_public_key("anyone@example.com").await);
        assert!(!session.have_pgp());
    }
}
