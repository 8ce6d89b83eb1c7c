//! GnuPG adapter.
//!
//! GnuPG is the one tool family with a machine-readable status channel:
//! `--status-fd 2` interleaves `[GNUPG:]` lines with the human diagnostics
//! on stderr. Classification works off those status lines first and falls
//! back to the exit code; the human lines are accumulated verbatim as the
//! diagnostic text shown to the user.

use tracing::debug;

use crate::exec::{ToolCommand, ToolOutput, passphrase_file};
use crate::status::Status;
use crate::{Error, Result};

use super::{KeyDescriptor, MessageState, ToolConfig};

const STATUS_PREFIX: &str = "[GNUPG:] ";

/// Adapter for GnuPG (`gpg`).
#[derive(Debug)]
pub struct GpgBackend {
    program: String,
    config: ToolConfig,
    state: MessageState,
}

impl GpgBackend {
    pub(crate) fn new(program: String, config: ToolConfig) -> Self {
        Self {
            program,
            config,
            state: MessageState::default(),
        }
    }

    pub(crate) const fn state(&self) -> &MessageState {
        &self.state
    }

    pub(crate) const fn state_mut(&mut self) -> &mut MessageState {
        &mut self.state
    }

    fn base(&self) -> ToolCommand {
        ToolCommand::new(&self.program, self.config.timeout)
            .args(["--batch", "--no-tty", "--status-fd", "2"])
    }

    async fn run_or_fail(&mut self, cmd: ToolCommand) -> Option<ToolOutput> {
        match cmd.run().await {
            Ok(out) => Some(out),
            Err(e) => {
                self.state.status = Status::run_failed();
                self.state.note(&format!("error running gpg: {e}"));
                None
            }
        }
    }

    /// Decrypts the loaded block; also verifies a clearsigned block when
    /// called without a passphrase (gpg reports signature facts on the
    /// same run).
    pub(crate) async fn decrypt(&mut self, passphrase: Option<&str>) -> Status {
        let mut cmd = self.base().arg("--decrypt").input(self.state.input.clone());

        let mut _pass_guard = None;
        if let Some(pass) = passphrase {
            match passphrase_file(pass) {
                Ok(file) => {
                    cmd = cmd
                        .args(["--pinentry-mode", "loopback", "--passphrase-file"])
                        .arg(file.path().to_string_lossy().into_owned());
                    _pass_guard = Some(file);
                }
                Err(e) => {
                    self.state.status = Status::run_failed();
                    self.state.note(&format!("cannot hand gpg the passphrase: {e}"));
                    return self.state.status;
                }
            }
        }

        let Some(out) = self.run_or_fail(cmd).await else {
            return self.state.status;
        };
        self.classify_decrypt(&out)
    }

    fn classify_decrypt(&mut self, out: &ToolOutput) -> Status {
        let mut status = Status::OK;
        self.state.receivers.clear();

        for line in out.stderr_text().lines() {
            if let Some(rest) = line.strip_prefix(STATUS_PREFIX) {
                let mut parts = rest.split_whitespace();
                match parts.next().unwrap_or("") {
                    "ENC_TO" => {
                        self.state.encrypted = true;
                        if let Some(keyid) = parts.next() {
                            self.state.receivers.push(keyid.to_string());
                        }
                    }
                    "GOODSIG" => {
                        self.state.signed = true;
                        self.state.sig_good = true;
                        self.state.signed_by_key = parts.next().map(str::to_string);
                        let who = parts.collect::<Vec<_>>().join(" ");
                        if !who.is_empty() {
                            self.state.signed_by = Some(who);
                        }
                    }
                    "BADSIG" => {
                        self.state.signed = true;
                        self.state.sig_good = false;
                        self.state.signed_by_key = parts.next().map(str::to_string);
                        let who = parts.collect::<Vec<_>>().join(" ");
                        if !who.is_empty() {
                            self.state.signed_by = Some(who);
                        }
                        self.state.note("Warning: the signature is bad.");
                    }
                    "ERRSIG" => {
                        self.state.signed = true;
                        self.state.sig_good = false;
                        self.state.signed_by_key = parts.next().map(str::to_string);
                        self.state
                            .note("The signature could not be checked (unknown key?).");
                    }
                    "BAD_PASSPHRASE" | "MISSING_PASSPHRASE" => {
                        status.bad_phrase = true;
                        status.error = true;
                    }
                    "NO_SECKEY" => {
                        status.no_sec_key = true;
                        status.error = true;
                    }
                    "DECRYPTION_FAILED" => status.error = true,
                    "NODATA" => {
                        status.error = true;
                        self.state.note("gpg found no processable data.");
                    }
                    _ => {}
                }
            } else if !line.trim().is_empty() {
                self.state.note(line);
            }
        }

        if !out.success && status == Status::OK {
            status.error = true;
        }
        if status.is_ok() {
            self.state.output = out.stdout_text();
        }
        debug!(?status, "gpg decrypt classified");
        self.state.status = status;
        status
    }

    /// Encrypts for the given key ids; with a passphrase the output is
    /// also signed. With no recipients but a passphrase this degrades to
    /// a clearsign (the "sign only" path).
    pub(crate) async fn encrypt(
        &mut self,
        recipients: &[String],
        passphrase: Option<&str>,
        ignore_untrusted: bool,
    ) -> Status {
        if recipients.is_empty() {
            return match passphrase {
                Some(pass) => self.sign(pass).await,
                None => Status::OK,
            };
        }

        let mut cmd = self.base().arg("--armor");
        let mut _pass_guard = None;
        if let Some(pass) = passphrase {
            cmd = cmd.arg("--sign");
            if !self.config.user.is_empty() {
                cmd = cmd.arg("--local-user").arg(&self.config.user);
            }
            match passphrase_file(pass) {
                Ok(file) => {
                    cmd = cmd
                        .args(["--pinentry-mode", "loopback", "--passphrase-file"])
                        .arg(file.path().to_string_lossy().into_owned());
                    _pass_guard = Some(file);
                }
                Err(e) => {
                    self.state.status = Status::run_failed();
                    self.state.note(&format!("cannot hand gpg the passphrase: {e}"));
                    return self.state.status;
                }
            }
        }
        if ignore_untrusted {
            cmd = cmd.arg("--always-trust");
        }
        cmd = cmd.arg("--encrypt");
        for recipient in recipients {
            cmd = cmd.arg("-r").arg(recipient);
        }
        if self.config.encrypt_to_self && !self.config.user.is_empty() {
            cmd = cmd.arg("-r").arg(&self.config.user);
        }
        cmd = cmd.input(self.state.input.clone());

        let Some(out) = self.run_or_fail(cmd).await else {
            return self.state.status;
        };
        self.classify_encrypt(&out, passphrase.is_some())
    }

    fn classify_encrypt(&mut self, out: &ToolOutput, signing: bool) -> Status {
        let mut status = Status::OK;

        for line in out.stderr_text().lines() {
            if let Some(rest) = line.strip_prefix(STATUS_PREFIX) {
                let mut parts = rest.split_whitespace();
                match parts.next().unwrap_or("") {
                    "INV_RECP" => {
                        let code = parts.next().unwrap_or("0");
                        let who = parts.collect::<Vec<_>>().join(" ");
                        status.error = true;
                        match code {
                            // 1 not found, 11/12 missing certificates
                            "1" | "11" | "12" => {
                                status.missing_key = true;
                                self.state.note(&format!("No public key for {who}."));
                            }
                            // 4 revoked, 5 expired, 10 not trusted
                            "4" | "5" | "10" => {
                                status.bad_keys = true;
                                self.state
                                    .note(&format!("The key for {who} is expired, revoked or not trusted."));
                            }
                            _ => {
                                self.state.note(&format!("Key for {who} is unusable."));
                            }
                        }
                    }
                    "KEYEXPIRED" | "KEYREVOKED" => {
                        status.bad_keys = true;
                        status.error = true;
                    }
                    "BAD_PASSPHRASE" | "MISSING_PASSPHRASE" => {
                        status.bad_phrase = true;
                        status.error = true;
                        if signing {
                            status.err_signing = true;
                        }
                    }
                    _ => {}
                }
            } else if !line.trim().is_empty() {
                self.state.note(line);
            }
        }

        if !out.success && status == Status::OK {
            status.error = true;
        }
        if status.is_ok() {
            self.state.output = out.stdout_text();
        }
        debug!(?status, signing, "gpg encrypt classified");
        self.state.status = status;
        status
    }

    /// Clearsigns the loaded input.
    pub(crate) async fn sign(&mut self, passphrase: &str) -> Status {
        let mut cmd = self.base().arg("--clearsign");
        if !self.config.user.is_empty() {
            cmd = cmd.arg("--local-user").arg(&self.config.user);
        }
        let file = match passphrase_file(passphrase) {
            Ok(file) => file,
            Err(e) => {
                self.state.status = Status::run_failed();
                self.state.note(&format!("cannot hand gpg the passphrase: {e}"));
                return self.state.status;
            }
        };
        cmd = cmd
            .args(["--pinentry-mode", "loopback", "--passphrase-file"])
            .arg(file.path().to_string_lossy().into_owned())
            .input(self.state.input.clone());

        let Some(out) = self.run_or_fail(cmd).await else {
            return self.state.status;
        };
        let mut status = self.classify_encrypt(&out, true);
        if status.error {
            status.err_signing = true;
            self.state.status = status;
        }
        status
    }

    /// Certifies `key_id` with the user's secret key.
    pub(crate) async fn sign_key(&mut self, key_id: &str, passphrase: &str) -> Status {
        let file = match passphrase_file(passphrase) {
            Ok(file) => file,
            Err(e) => {
                self.state.status = Status::run_failed();
                self.state.note(&format!("cannot hand gpg the passphrase: {e}"));
                return self.state.status;
            }
        };
        let cmd = self
            .base()
            .args(["--pinentry-mode", "loopback", "--passphrase-file"])
            .arg(file.path().to_string_lossy().into_owned())
            .args(["--yes", "--sign-key"])
            .arg(key_id);

        let Some(out) = self.run_or_fail(cmd).await else {
            return self.state.status;
        };
        self.classify_encrypt(&out, true)
    }

    /// Lists public keys via the colon-delimited machine format.
    pub(crate) async fn pub_keys(&self) -> Result<Vec<KeyDescriptor>> {
        let out = self
            .base()
            .args(["--with-colons", "--list-keys"])
            .run()
            .await?;
        if !out.success {
            return Err(Error::KeyListing {
                tool: self.program.clone(),
                detail: out.stderr_text().lines().next().unwrap_or("").to_string(),
            });
        }

        let keys = parse_listing(&out.stdout_text());
        debug!(count = keys.len(), "gpg key listing parsed");
        Ok(keys)
    }

    /// ASCII-armored export of one public key.
    pub(crate) async fn public_key_armored(&self, identity: &str) -> Result<String> {
        let out = self
            .base()
            .args(["--armor", "--export"])
            .arg(identity)
            .run()
            .await?;
        Ok(out.stdout_text())
    }
}

/// Parses `--with-colons --list-keys` output: `pub` rows carry the key
/// id in field 4, `uid` rows carry the identity in field 9 and attach
/// to the preceding `pub` row.
fn parse_listing(listing: &str) -> Vec<KeyDescriptor> {
    let mut keys = Vec::new();
    let mut current_id: Option<String> = None;
    for line in listing.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        match fields.first().copied() {
            Some("pub") => {
                current_id = fields.get(4).map(|id| (*id).to_string());
            }
            Some("uid") => {
                if let (Some(id), Some(uid)) = (&current_id, fields.get(9)) {
                    if !uid.is_empty() {
                        keys.push(KeyDescriptor::new(format!("{id} {uid}")));
                    }
                }
            }
            _ => {}
        }
    }
    keys
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

    fn backend() -> GpgBackend {
        GpgBackend::new("gpg".to_string(), ToolConfig::default())
    }

    fn fake_output(success: bool, stdout: &str, stderr: &str) -> ToolOutput {
        ToolOutput {
            success,
            code: Some(i32::from(!success)),
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[test]
    fn bad_passphrase_is_distinct_from_error() {
        let mut b = backend();
        let out = fake_output(
            false,
            "",
            "[GNUPG:] ENC_TO 5F34A2B1 1 0\ngpg: decryption failed\n[GNUPG:] BAD_PASSPHRASE 5F34A2B1\n",
        );
        let status = b.classify_decrypt(&out);
        assert!(status.bad_phrase);
        assert!(status.error);
        assert!(!status.no_sec_key);
        assert_eq!(b.state().receivers, vec!["5F34A2B1".to_string()]);
    }

    #[test]
    fn no_secret_key_detected() {
        let mut b = backend();
        let out = fake_output(false, "", "[GNUPG:] NO_SECKEY 5F34A2B1\n");
        let status = b.classify_decrypt(&out);
        assert!(status.no_sec_key);
        assert!(status.error);
    }

    #[test]
    fn good_signature_fills_signer() {
        let mut b = backend();
        let out = fake_output(
            true,
            "the plain text\n",
            "[GNUPG:] GOODSIG 5F34A2B1 Alice Example <alice@x.com>\n",
        );
        let status = b.classify_decrypt(&out);
        assert!(status.is_ok());
        assert!(b.state().signed);
        assert!(b.state().sig_good);
        assert_eq!(b.state().signed_by.as_deref(), Some("Alice Example <alice@x.com>"));
        assert_eq!(b.state().signed_by_key.as_deref(), Some("5F34A2B1"));
        assert_eq!(b.state().message(), "the plain text\n");
    }

    #[test]
    fn bad_signature_still_succeeds_run() {
        let mut b = backend();
        let out = fake_output(
            true,
            "text\n",
            "[GNUPG:] BADSIG 5F34A2B1 Mallory <m@x.com>\n",
        );
        let status = b.classify_decrypt(&out);
        assert!(status.is_ok());
        assert!(b.state().signed);
        assert!(!b.state().sig_good);
    }

    #[test]
    fn untrusted_recipient_maps_to_bad_keys() {
        let mut b = backend();
        let out = fake_output(false, "", "[GNUPG:] INV_RECP 10 bob@x.com\n");
        let status = b.classify_encrypt(&out, false);
        assert!(status.bad_keys);
        assert!(status.error);
        assert!(!status.missing_key);
        assert!(b.state().diagnostics.contains("bob@x.com"));
    }

    #[test]
    fn unknown_recipient_maps_to_missing_key() {
        let mut b = backend();
        let out = fake_output(false, "", "[GNUPG:] INV_RECP 1 carol@x.com\n");
        let status = b.classify_encrypt(&out, false);
        assert!(status.missing_key);
        assert!(!status.bad_keys);
    }

    #[test]
    fn unrecognized_failure_is_generic_error() {
        let mut b = backend();
        let out = fake_output(false, "", "gpg: something exploded\n");
        let status = b.classify_decrypt(&out);
        assert!(status.error);
        assert!(!status.bad_phrase);
        assert!(b.state().diagnostics.contains("something exploded"));
    }

    #[test]
    fn colon_listing_parses_one_line_per_uid() {
        let listing = "tru::1:1:1\npub:u:255:22:AB12CD34:1:::u:::scESC::::::23::0:\nuid:u::::1::HASH::Bob Example <bob@x.com>::::::::::0:\nuid:u::::1::HASH2::Robert <rob@y.org>::::::::::0:\n";
        let keys = parse_listing(listing);
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].key_id(), "AB12CD34");
        assert!(keys[0].as_str().contains("<bob@x.com>"));
        assert!(keys[1].as_str().contains("rob@y.org"));
    }

    #[test]
    fn uid_rows_without_a_pub_row_are_dropped() {
        let listing = "uid:u::::1::HASH::Orphan <o@x.com>::::::::::0:\n";
        assert!(parse_listing(listing).is_empty());
    }
}
