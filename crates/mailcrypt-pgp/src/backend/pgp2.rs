//! PGP 2.6.x adapter.
//!
//! The oldest dialect: one `pgp` binary, no machine status channel, all
//! classification scraped from English stderr phrases (`+language=en` is
//! forced so the phrases are stable). The passphrase travels over the
//! `PGPPASSFD=0` convention: first line of stdin, message after it.

use tracing::debug;

use crate::exec::{ToolCommand, ToolOutput};
use crate::status::Status;
use crate::{Error, Result};

use super::{KeyDescriptor, MessageState, ToolConfig};

/// Adapter for PGP 2.6.x (`pgp`).
#[derive(Debug)]
pub struct Pgp2Backend {
    program: String,
    config: ToolConfig,
    state: MessageState,
}

impl Pgp2Backend {
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
            .args(["+batchmode", "+language=en", "+verbose=0"])
    }

    /// Wires the passphrase as the first stdin line, the pgp 2 way.
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
            if line.contains("Bad pass phrase") {
                status.bad_phrase = true;
                status.error = true;
            } else if line.contains("You do not have the secret key") {
                status.no_sec_key = true;
                status.error = true;
                self.state.note(line.trim());
            } else if let Some(rest) = line.split("Good signature from user").nth(1) {
                self.state.signed = true;
                self.state.sig_good = true;
                self.state.signed_by = Some(unquote(rest));
            } else if line.contains("Bad signature") {
                self.state.signed = true;
                self.state.sig_good = false;
                self.state.note("Warning: the signature is bad.");
            } else if line.contains("Key matching expected Key ID") {
                self.state.signed = true;
                self.state.sig_good = false;
                self.state.signed_by_key = line
                    .split("Key ID ")
                    .nth(1)
                    .and_then(|rest| rest.split_whitespace().next())
                    .map(str::to_string);
                self.state
                    .note("The signature could not be checked (unknown key).");
            } else if line.contains("ERROR") || line.contains("WARNING") {
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
        debug!(?status, "pgp2 decrypt classified");
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
            if line.contains("not found") && line.contains("Key matching userid") {
                status.missing_key = true;
                status.error = true;
                self.state.note(line.trim());
            } else if line.contains("not certified with a trusted signature")
                || line.contains("not trusted")
            {
                status.bad_keys = true;
                status.error = true;
                self.state.note(line.trim());
            } else if line.contains("Bad pass phrase") {
                status.bad_phrase = true;
                status.error = true;
                if signing {
                    status.err_signing = true;
                }
            } else if line.contains("ERROR") || line.contains("WARNING") {
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
        debug!(?status, signing, "pgp2 encrypt classified");
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

/// Parses the `pgp -kv` table:
/// `pub  1024/AB12CD34 1997/01/01 Bob Example <bob@x.com>`.
fn parse_listing(listing: &str) -> Vec<KeyDescriptor> {
    let mut keys = Vec::new();
    for line in listing.lines() {
        let mut parts = line.split_whitespace();
        if parts.next() != Some("pub") {
            continue;
        }
        let Some(id) = parts.next().and_then(|bits_id| bits_id.split('/').nth(1)) else {
            continue;
        };
        let _date = parts.next();
        let uid = parts.collect::<Vec<_>>().join(" ");
        if !uid.is_empty() {
            keys.push(KeyDescriptor::new(format!("{id} {uid}")));
        }
    }
    keys
}

/// Strips surrounding quotes, punctuation and whitespace from a scraped
/// user id.
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

    fn backend() -> Pgp2Backend {
        Pgp2Backend::new("pgp".to_string(), ToolConfig::default())
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
    fn bad_passphrase_phrase_is_detected() {
        let mut b = backend();
        let out = fake_output(false, "", "Error:  Bad pass phrase.\n");
        let status = b.classify_decrypt(&out);
        assert!(status.bad_phrase);
        assert!(status.error);
    }

    #[test]
    fn good_signature_scrapes_quoted_user() {
        let mut b = backend();
        let out = fake_output(
            true,
            "plain\n",
            "Good signature from user \"Alice Example <alice@x.com>\".\n",
        );
        let status = b.classify_decrypt(&out);
        assert!(status.is_ok());
        assert!(b.state().sig_good);
        assert_eq!(
            b.state().signed_by.as_deref(),
            Some("Alice Example <alice@x.com>")
        );
    }

    #[test]
    fn missing_recipient_key() {
        let mut b = backend();
        let out = fake_output(
            false,
            "",
            "Key matching userid 'carol@x.com' not found in file '/home/u/.pgp/pubring.pgp'.\n",
        );
        let status = b.classify_encrypt(&out, false);
        assert!(status.missing_key);
        assert!(!status.bad_keys);
    }

    #[test]
    fn untrusted_key_is_bad_keys() {
        let mut b = backend();
        let out = fake_output(
            false,
            "",
            "WARNING:  Because this public key is not certified with a trusted signature,\nit is not known with high confidence that this public key actually belongs to bob.\n",
        );
        let status = b.classify_encrypt(&out, false);
        assert!(status.bad_keys);
    }

    #[test]
    fn listing_parses_key_lines() {
        let listing = "Type bits/keyID    Date       User ID\npub  1024/AB12CD34 1997/01/01 Bob Example <bob@x.com>\npub   768/EF56AB78 1996/11/03 Carol <carol@y.org>\n2 matching keys found.\n";
        let keys = parse_listing(listing);
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].key_id(), "AB12CD34");
        assert!(keys[1].as_str().contains("carol@y.org"));
    }
}
