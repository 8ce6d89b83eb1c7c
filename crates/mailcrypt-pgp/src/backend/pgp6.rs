//! PGP 6.5.x adapter.
//!
//! Same single `pgp` binary and stdin passphrase convention as the 2.6.x
//! generation, but the output grammar moved: the passphrase complaint
//! lost a space ("Bad passphrase"), signature reports name the key id,
//! and the key listing spreads user ids over continuation lines.

use tracing::debug;

use crate::exec::{ToolCommand, ToolOutput};
use crate::status::Status;
use crate::{Error, Result};

use super::{KeyDescriptor, MessageState, ToolConfig};

/// Adapter for PGP 6.5.x (`pgp`).
#[derive(Debug)]
pub struct Pgp6Backend {
    program: String,
    config: ToolConfig,
    state: MessageState,
}

impl Pgp6Backend {
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
            .args(["+batchmode", "+language=us", "+verbose=0"])
    }

    fn feed(cmd: ToolCommand, passphrase: Option<&str>, input: &str) -> ToolCommand {
        match passphrase {
            Some(pass) => cmd
                .env("PGPPASSFD", "0")
                .input(format!("{pass}\n{input}")),
            None => cmd.input(input.to_string()),
        }
    }

    async fn run_or_fail(&mut self, cmd: ToolCommand) -> Option<ToolOutput> {
        match cmd.run().await {
            Ok(out) => Some(out),
            Err(e) => {
                self.state.status = Status::run_failed();
                self.state.note(&format!("error running pgp: {e}"));
                None
            }
        }
    }

    pub(crate) async fn decrypt(&mut self, passphrase: Option<&str>) -> Status {
        let cmd = Self::feed(self.base().arg("-f"), passphrase, &self.state.input.clone());
        let Some(out) = self.run_or_fail(cmd).await else {
            return self.state.status;
        };
        self.classify_decrypt(&out)
    }

    fn classify_decrypt(&mut self, out: &ToolOutput) -> Status {
        let mut status = Status::OK;
        let stderr = out.stderr_text();

        for line in stderr.lines() {
            if line.contains("Bad passphrase") {
                status.bad_phrase = true;
                status.error = true;
            } else if line.contains("Cannot decrypt message")
                || line.contains("You do not have the secret key")
            {
                status.no_sec_key = true;
                status.error = true;
                self.state.note(line.trim());
            } else if let Some(rest) = line.split("Good signature from").nth(1) {
                self.state.signed = true;
                self.state.sig_good = true;
                self.state.signed_by = Some(unquote(rest));
            } else if line.contains("Bad signature") || line.contains("BAD signature") {
                self.state.signed = true;
                self.state.sig_good = false;
                self.state.note("Warning: the signature is bad.");
            } else if line.contains("Signature by unknown keyid:")
                || line.contains("signing key:")
            {
                self.state.signed = true;
                self.state.sig_good = false;
                self.state.signed_by_key = line
                    .split("0x")
                    .nth(1)
                    .and_then(|rest| rest.split_whitespace().next())
                    .map(|id| format!("0x{id}"));
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
        debug!(?status, "pgp6 decrypt classified");
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

        let mut cmd = self.base().arg("-f");
        cmd = if passphrase.is_some() {
            cmd.arg("-sea")
        } else {
            cmd.arg("-ea")
        };
        if ignore_untrusted {
            cmd = cmd.arg("+force");
        }
        if !self.config.user.is_empty() && passphrase.is_some() {
            cmd = cmd.arg("-u").arg(&self.config.user);
        }
        for recipient in recipients {
            cmd = cmd.arg(recipient);
        }
        if self.config.encrypt_to_self && !self.config.user.is_empty() {
            cmd = cmd.arg(&self.config.user);
        }
        let cmd = Self::feed(cmd, passphrase, &self.state.input.clone());

        let Some(out) = self.run_or_fail(cmd).await else {
            return self.state.status;
        };
        self.classify_encrypt(&out, passphrase.is_some())
    }

    fn classify_encrypt(&mut self, out: &ToolOutput, signing: bool) -> Status {
        let mut status = Status::OK;
        let stderr = out.stderr_text();

        for line in stderr.lines() {
            if line.contains("No encryption keys found for")
                || (line.contains("not found") && line.contains("Key matching userid"))
            {
                status.missing_key = true;
                status.error = true;
                self.state.note(line.trim());
            } else if line.contains("not trusted") || line.contains("Invalid key") {
                status.bad_keys = true;
                status.error = true;
                self.state.note(line.trim());
            } else if line.contains("Bad passphrase") {
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
        debug!(?status, signing, "pgp6 encrypt classified");
        self.state.status = status;
        status
    }

    pub(crate) async fn sign(&mut self, passphrase: &str) -> Status {
        let mut cmd = self.base().args(["-sta", "+clearsig=on", "-f"]);
        if !self.config.user.is_empty() {
            cmd = cmd.arg("-u").arg(&self.config.user);
        }
        let cmd = Self::feed(cmd, Some(passphrase), &self.state.input.clone());

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

    pub(crate) async fn sign_key(&mut self, key_id: &str, passphrase: &str) -> Status {
        let cmd = Self::feed(
            self.base().arg("-ks").arg(key_id),
            Some(passphrase),
            "",
        );
        let Some(out) = self.run_or_fail(cmd).await else {
            return self.state.status;
        };
        self.classify_encrypt(&out, true)
    }

    pub(crate) async fn pub_keys(&self) -> Result<Vec<KeyDescriptor>> {
        let out = self.base().arg("-kv").run().await?;
        if !out.success {
            return Err(Error::KeyListing {
                tool: self.program.clone(),
                detail: out.stderr_text().lines().next().unwrap_or("").to_string(),
            });
        }
        Ok(parse_listing(&out.stdout_text()))
    }

    pub(crate) async fn public_key_armored(&self, identity: &str) -> Result<String> {
        let out = self.base().arg("-kxaf").arg(identity).run().await?;
        Ok(out.stdout_text())
    }
}

/// Parses the 6.x `pgp -kv` table. Key rows carry an `0x`-prefixed id;
/// the user ids follow on `uid` continuation lines that attach to the
/// preceding key row.
fn parse_listing(listing: &str) -> Vec<KeyDescriptor> {
    let mut keys = Vec::new();
    let mut current_id: Option<String> = None;
    for line in listing.lines() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some(tag) if tag.starts_with("pub") || tag.starts_with("sec") => {
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

fn unquote(raw: &str) -> String {
    raw.trim().trim_matches(|c| c == '"' || c == '.').to_string()
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

    fn backend() -> Pgp6Backend {
        Pgp6Backend::new("pgp".to_string(), ToolConfig::default())
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
    fn six_x_passphrase_phrase_has_no_space() {
        let mut b = backend();
        let out = fake_output(false, "", "Error:  Bad passphrase\n");
        let status = b.classify_decrypt(&out);
        assert!(status.bad_phrase);
        // The 2.6.x phrase must not trip this dialect's matcher.
        let mut b2 = backend();
        let benign = fake_output(true, "plain\n", "");
        assert!(b2.classify_decrypt(&benign).is_ok());
    }

    #[test]
    fn unknown_signer_captures_hex_key_id() {
        let mut b = backend();
        let out = fake_output(
            true,
            "plain\n",
            "Signature by unknown keyid: 0xAB12CD34\n",
        );
        let status = b.classify_decrypt(&out);
        assert!(status.is_ok());
        assert!(b.state().signed);
        assert!(!b.state().sig_good);
        assert_eq!(b.state().signed_by_key.as_deref(), Some("0xAB12CD34"));
    }

    #[test]
    fn listing_attaches_continuation_uids() {
        let listing = "Type Bits KeyID              Created    Expires  Algorithm Use\npub  2048 0x12AB34CD         1999-02-03 ---------- RSA Sign & Encrypt\nuid  Bob Example <bob@x.com>\nuid  Robert <rob@y.org>\npub  1024 0x99EE88FF         1998-12-24 ---------- DSS Sign only\nuid  Carol <carol@z.net>\n";
        let keys = parse_listing(listing);
        assert_eq!(keys.len(), 3);
        assert_eq!(keys[0].key_id(), "0x12AB34CD");
        assert!(keys[1].as_str().contains("rob@y.org"));
        assert_eq!(keys[2].key_id(), "0x99EE88FF");
        assert!(keys[2].as_str().contains("carol@z.net"));
    }

    #[test]
    fn untrusted_key_is_bad_keys() {
        let mut b = backend();
        let out = fake_output(false, "", "WARNING: The above key is not trusted\n");
        let status = b.classify_encrypt(&out, false);
        assert!(status.bad_keys);
        assert!(status.error);
    }
}
