//! PGP 5.x adapter.
//!
//! The 5.x generation splits the tool into four binaries: `pgpe`
//! (encrypt), `pgps` (sign), `pgpv` (verify/decrypt) and `pgpk` (key
//! management). They are located as siblings of the configured `pgpe`
//! path. Classification is stderr scraping, as with the other legacy
//! generations.

use std::path::Path;

use tracing::debug;

use crate::exec::{ToolCommand, ToolOutput};
use crate::status::Status;
use crate::{Error, Result};

use super::{KeyDescriptor, MessageState, ToolConfig};

/// Adapter for PGP 5.x (`pgpe`/`pgps`/`pgpv`/`pgpk`).
#[derive(Debug)]
pub struct Pgp5Backend {
    encrypt_bin: String,
    sign_bin: String,
    verify_bin: String,
    keys_bin: String,
    config: ToolConfig,
    state: MessageState,
}

impl Pgp5Backend {
    pub(crate) fn new(encrypt_bin: String, config: ToolConfig) -> Self {
        Self {
            sign_bin: sibling(&encrypt_bin, "pgps"),
            verify_bin: sibling(&encrypt_bin, "pgpv"),
            keys_bin: sibling(&encrypt_bin, "pgpk"),
            encrypt_bin,
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

    fn base(&self, program: &str) -> ToolCommand {
        ToolCommand::new(program, self.config.timeout).args(["+batchmode=1", "+language=us"])
    }

    fn feed(cmd: ToolCommand, passphrase: Option<&str>, input: &str) -> ToolCommand {
        match passphrase {
            Some(pass) => cmd
                .env("PGPPASSFD", "0")
                .input(format!("{pass}\n{input}")),
            None => cmd.input(input.to_string()),
        }
    }

    async fn run_or_fail(&mut self, program: &str, cmd: ToolCommand) -> Option<ToolOutput> {
        match cmd.run().await {
            Ok(out) => Some(out),
            Err(e) => {
                self.state.status = Status::run_failed();
                self.state.note(&format!("error running {program}: {e}"));
                None
            }
        }
    }

    pub(crate) async fn decrypt(&mut self, passphrase: Option<&str>) -> Status {
        let program = self.verify_bin.clone();
        let cmd = Self::feed(
            self.base(&program).arg("-f"),
            passphrase,
            &self.state.input.clone(),
        );
        let Some(out) = self.run_or_fail(&program, cmd).await else {
            return self.state.status;
        };
        self.classify_decrypt(&out)
    }

    /// Verification of a clearsigned block is the passphrase-free decrypt.
    pub(crate) async fn verify(&mut self) -> Status {
        self.decrypt(None).await
    }

    fn classify_decrypt(&mut self, out: &ToolOutput) -> Status {
        let mut status = Status::OK;
        let stderr = out.stderr_text();

        let mut lines = stderr.lines().peekable();
        while let Some(line) = lines.next() {
            if line.contains("Bad pass phrase") || line.contains("Cannot unlock private key") {
                status.bad_phrase = true;
                status.error = true;
            } else if line.contains("Cannot decrypt message")
                || line.contains("It can only be decrypted by")
            {
                status.no_sec_key = true;
                status.error = true;
                self.state.note(line.trim());
            } else if line.contains("Good signature made") {
                self.state.signed = true;
                self.state.sig_good = true;
                // The signer uid follows on the next non-empty line.
                if let Some(next) = lines.peek() {
                    let who = next.trim().trim_matches('"').to_string();
                    if !who.is_empty() {
                        self.state.signed_by = Some(who);
                    }
                }
            } else if line.contains("BAD signature made") {
                self.state.signed = true;
                self.state.sig_good = false;
                self.state.note("Warning: the signature is bad.");
            } else if line.contains("Signature by unknown keyid:") {
                self.state.signed = true;
                self.state.sig_good = false;
                self.state.signed_by_key = line
                    .split("keyid:")
                    .nth(1)
                    .map(|id| id.trim().to_string());
                self.state
                    .note("The signature could not be checked (unknown key).");
            } else if line.contains("Error") || line.contains("WARNING") {
                self.state.note(line.trim());
            }
        }

        if !out.success && status == Status::OK {
            status.error = true;
            if self.state.diagnostics.is_empty() {
                self.state.note(stderr.trim());
            }
        }
        if status.is_ok() {
            self.state.output = out.stdout_text();
        }
        debug!(?status, "pgp5 decrypt classified");
        self.state.status = status;
        status
    }

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

        let program = self.encrypt_bin.clone();
        let mut cmd = self.base(&program).args(["-aft"]);
        if passphrase.is_some() {
            cmd = cmd.arg("-s");
            if !self.config.user.is_empty() {
                cmd = cmd.arg("-u").arg(&self.config.user);
            }
        }
        if ignore_untrusted {
            cmd = cmd.arg("+NoBatchInvalidKeys=off");
        }
        for recipient in recipients {
            cmd = cmd.arg("-r").arg(recipient);
        }
        if self.config.encrypt_to_self && !self.config.user.is_empty() {
            cmd = cmd.arg("-r").arg(&self.config.user);
        }
        let cmd = Self::feed(cmd, passphrase, &self.state.input.clone());

        let Some(out) = self.run_or_fail(&program, cmd).await else {
            return self.state.status;
        };
        self.classify_encrypt(&out, passphrase.is_some())
    }

    fn classify_encrypt(&mut self, out: &ToolOutput, signing: bool) -> Status {
        let mut status = Status::OK;
        let stderr = out.stderr_text();

        for line in stderr.lines() {
            if line.contains("No encryption keys found for") {
                status.missing_key = true;
                status.error = true;
                self.state.note(line.trim());
            } else if line.contains("The above key is not trusted")
                || line.contains("Invalid key")
            {
                status.bad_keys = true;
                status.error = true;
                self.state.note(line.trim());
            } else if line.contains("Bad pass phrase") || line.contains("Cannot unlock private key")
            {
                status.bad_phrase = true;
                status.error = true;
                if signing {
                    status.err_signing = true;
                }
            } else if line.contains("Error") || line.contains("WARNING") {
                self.state.note(line.trim());
            }
        }

        if !out.success && status == Status::OK {
            status.error = true;
            if self.state.diagnostics.is_empty() {
                self.state.note(stderr.trim());
            }
        }
        if status.is_ok() {
            self.state.output = out.stdout_text();
        }
        debug!(?status, signing, "pgp5 encrypt classified");
        self.state.status = status;
        status
    }

    pub(crate) async fn sign(&mut self, passphrase: &str) -> Status {
        let program = self.sign_bin.clone();
        let mut cmd = self.base(&program).args(["-atf"]);
        if !self.config.user.is_empty() {
            cmd = cmd.arg("-u").arg(&self.config.user);
        }
        let cmd = Self::feed(cmd, Some(passphrase), &self.state.input.clone());

        let Some(out) = self.run_or_fail(&program, cmd).await else {
            return self.state.status;
        };
        let mut status = self.classify_encrypt(&out, true);
        if status.error {
            status.err_signing = true;
            self.state.status = status;
        }
        status
    }

    pub(crate) async fn sign_key(&mut self, key_id: &str, passphrase: &str) -> Status {
        let program = self.keys_bin.clone();
        let cmd = Self::feed(
            self.base(&program).arg("-s").arg(key_id),
            Some(passphrase),
            "",
        );
        let Some(out) = self.run_or_fail(&program, cmd).await else {
            return self.state.status;
        };
        self.classify_encrypt(&out, true)
    }

    pub(crate) async fn pub_keys(&self) -> Result<Vec<KeyDescriptor>> {
        let out = self.base(&self.keys_bin).arg("-l").run().await?;
        if !out.success {
            return Err(Error::KeyListing {
                tool: self.keys_bin.clone(),
                detail: out.stderr_text().lines().next().unwrap_or("").to_string(),
            });
        }
        Ok(parse_listing(&out.stdout_text()))
    }

    pub(crate) async fn public_key_armored(&self, identity: &str) -> Result<String> {
        let out = self.base(&self.keys_bin).arg("-xa").arg(identity).run().await?;
        Ok(out.stdout_text())
    }
}

/// Resolves a sibling binary next to the configured `pgpe` path.
fn sibling(encrypt_bin: &str, name: &str) -> String {
    Path::new(encrypt_bin).parent().map_or_else(
        || name.to_string(),
        |dir| {
            if dir.as_os_str().is_empty() {
                name.to_string()
            } else {
                dir.join(name).to_string_lossy().into_owned()
            }
        },
    )
}

/// Parses the `pgpk -l` table: `pub` rows carry `0x`-prefixed key ids,
/// `uid` rows carry the identities.
fn parse_listing(listing: &str) -> Vec<KeyDescriptor> {
    let mut keys = Vec::new();
    let mut current_id: Option<String> = None;
    for line in listing.lines() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("pub") => {
                current_id = parts
                    .find(|token| token.starts_with("0x"))
                    .map(str::to_string);
            }
            Some("uid") => {
                if let Some(id) = &current_id {
                    let uid = parts.collect::<Vec<_>>().join(" ");
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

    fn backend() -> Pgp5Backend {
        Pgp5Backend::new("/usr/local/bin/pgpe".to_string(), ToolConfig::default())
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
    fn sibling_binaries_share_the_directory() {
        let b = backend();
        assert_eq!(b.verify_bin, "/usr/local/bin/pgpv");
        assert_eq!(b.keys_bin, "/usr/local/bin/pgpk");
        let bare = Pgp5Backend::new("pgpe".to_string(), ToolConfig::default());
        assert_eq!(bare.sign_bin, "pgps");
    }

    #[test]
    fn cannot_decrypt_is_no_sec_key() {
        let mut b = backend();
        let out = fake_output(
            false,
            "",
            "Cannot decrypt message.  It can only be decrypted by:\n  1024 bits, Key ID AB12CD34\n",
        );
        let status = b.classify_decrypt(&out);
        assert!(status.no_sec_key);
        assert!(status.error);
    }

    #[test]
    fn good_signature_takes_following_uid_line() {
        let mut b = backend();
        let out = fake_output(
            true,
            "plain\n",
            "Good signature made 1999-03-01 12:00 GMT by key:\n  1024 bits, Key ID AB12CD34, \"Alice <alice@x.com>\"\n",
        );
        let status = b.classify_decrypt(&out);
        assert!(status.is_ok());
        assert!(b.state().sig_good);
        assert!(b.state().signed_by.as_deref().unwrap().contains("alice@x.com"));
    }

    #[test]
    fn no_encryption_keys_is_missing_key() {
        let mut b = backend();
        let out = fake_output(false, "", "No encryption keys found for: carol@x.com\n");
        let status = b.classify_encrypt(&out, false);
        assert!(status.missing_key);
    }

    #[test]
    fn listing_groups_uids_under_pub_rows() {
        let listing = "Type Bits KeyID      Created    Expires  Algorithm Use\npub  1024 0xAB12CD34 1997-01-01 ---------- DSS Sign & Encrypt\nuid  Bob Example <bob@x.com>\nuid  Robert <rob@y.org>\n";
        let keys = parse_listing(listing);
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].key_id(), "0xAB12CD34");
        assert!(keys[1].as_str().contains("rob@y.org"));
    }
}
