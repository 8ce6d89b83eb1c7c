//! End-to-end session flows against a scripted stand-in for gpg.
//!
//! Each test drops a small shell script into a temp directory and
//! points the session's binary override at it, so the whole stack runs
//! (subprocess, status parsing, recovery prompts) without a real key
//! ring.

#![cfg(unix)]
#![allow(clippy::unwrap_used)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use mailcrypt_core::{
    Choice2, Choice3, KeyDescriptor, Outcome, Passphrase, Prompter, Session, SessionConfig,
    SessionState, ToolKind,
};
use tempfile::TempDir;

#[derive(Debug, Default)]
struct Counters {
    passphrases: AtomicUsize,
    continues: AtomicUsize,
    retries: AtomicUsize,
}

/// Prompter with fixed answers, counting every question asked.
struct Scripted {
    passphrase: Option<String>,
    two: Choice2,
    three: Choice3,
    counts: Arc<Counters>,
}

impl Scripted {
    fn new(passphrase: Option<&str>, two: Choice2, three: Choice3) -> (Self, Arc<Counters>) {
        let counts = Arc::new(Counters::default());
        (
            Self {
                passphrase: passphrase.map(str::to_string),
                two,
                three,
                counts: Arc::clone(&counts),
            },
            counts,
        )
    }
}

impl Prompter for Scripted {
    async fn request_passphrase(&self, _key_hint: &str) -> Option<Passphrase> {
        self.counts.passphrases.fetch_add(1, Ordering::SeqCst);
        self.passphrase.as_deref().map(Passphrase::new)
    }

    async fn request_key_selection(
        &self,
        candidates: &[KeyDescriptor],
        _recipient: &str,
    ) -> Option<KeyDescriptor> {
        candidates.first().cloned()
    }

    async fn request_continue(&self, _text: &str, _affirmative: &str) -> Choice2 {
        self.counts.continues.fetch_add(1, Ordering::SeqCst);
        self.two
    }

    async fn request_retry_or_demote(&self, _text: &str, _retry: &str, _demote: &str) -> Choice3 {
        self.counts.retries.fetch_add(1, Ordering::SeqCst);
        self.three
    }
}

/// One key ring entry in gpg's colon format, served on `--list-keys`.
const LISTING: &str = r"printf 'pub:u:2048:1:AB12CD34:1::u:::scESC:\nuid:u::::::::Bob <bob@example.com>:\n'";

fn write_script(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("gpg");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

async fn session_with_script(
    dir: &TempDir,
    body: &str,
    prompter: Scripted,
) -> Session<Scripted> {
    let config = SessionConfig {
        tool: ToolKind::Gpg,
        binary_override: Some(write_script(dir.path(), body)),
        user: "me@example.com".to_string(),
        ..SessionConfig::default()
    };
    Session::with_config(prompter, config).await
}

#[tokio::test]
async fn decrypt_flow_preserves_surrounding_text() {
    let dir = tempfile::tempdir().unwrap();
    let body = r#"
cat >/dev/null
echo "[GNUPG:] ENC_TO AB12CD34 1 0" >&2
echo "[GNUPG:] GOODSIG AB12CD34 Bob <bob@example.com>" >&2
printf 'the secret plan\n'
exit 0"#;
    let (prompter, counts) = Scripted::new(Some("hunter2"), Choice2::Proceed, Choice3::Cancel);
    let mut session = session_with_script(&dir, body, prompter).await;

    let raw = "intro\n-----BEGIN PGP MESSAGE-----\nhQEMA0\n-----END PGP MESSAGE-----\ntail\n";
    assert!(session.set_message(raw));
    assert_eq!(session.state(), SessionState::MessageLoaded);
    assert!(session.is_encrypted());

    assert!(session.decrypt().await);
    assert_eq!(session.state(), SessionState::Resolved(Outcome::Success));
    assert_eq!(session.message(), "the secret plan\n");
    assert_eq!(session.frontmatter(), "intro\n");
    assert_eq!(session.backmatter(), "tail\n");
    assert_eq!(session.signed_by(), Some("Bob <bob@example.com>"));
    assert!(session.good_signature());
    assert_eq!(counts.passphrases.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn bad_passphrase_reprompts_once_then_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let body = format!(
        r#"case "$*" in *--list-keys*) {LISTING}; exit 0;; esac
state="$0.state"
if [ ! -f "$state" ]; then
  touch "$state"
  echo "[GNUPG:] BAD_PASSPHRASE AB12CD34" >&2
  exit 2
fi
cat >/dev/null
printf -- '-----BEGIN PGP MESSAGE-----\nciphertext\n-----END PGP MESSAGE-----\n'
exit 0"#
    );
    let (prompter, counts) = Scripted::new(Some("hunter2"), Choice2::Proceed, Choice3::Retry);
    let mut session = session_with_script(&dir, &body, prompter).await;

    session.set_message("hello bob\n");
    let sent = session
        .encrypt_for(&["bob@example.com".to_string()], true)
        .await;

    assert!(sent);
    assert_eq!(session.state(), SessionState::Resolved(Outcome::Success));
    assert!(session.message().contains("BEGIN PGP MESSAGE"));
    // One prompt up front, one after the rejection; no third.
    assert_eq!(counts.passphrases.load(Ordering::SeqCst), 2);
    assert_eq!(counts.retries.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn untrusted_key_encrypt_anyway_relaxes_trust() {
    let dir = tempfile::tempdir().unwrap();
    let body = format!(
        r#"case "$*" in
  *--list-keys*) {LISTING}; exit 0;;
  *--always-trust*) cat >/dev/null; printf 'RELAXED ARMOR\n'; exit 0;;
  *) cat >/dev/null; echo "[GNUPG:] INV_RECP 10 bob@example.com" >&2; exit 2;;
esac"#
    );
    let (prompter, counts) = Scripted::new(None, Choice2::Proceed, Choice3::Retry);
    let mut session = session_with_script(&dir, &body, prompter).await;

    session.set_message("hello bob\n");
    let sent = session
        .encrypt_for(&["bob@example.com".to_string()], false)
        .await;

    assert!(sent);
    assert_eq!(session.message(), "RELAXED ARMOR\n");
    assert_eq!(counts.retries.load(Ordering::SeqCst), 1);
    assert_eq!(counts.passphrases.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn untrusted_key_retry_keeps_the_signature() {
    let dir = tempfile::tempdir().unwrap();
    // The retry only counts as signed if --sign survives into the
    // relaxed-trust invocation.
    let body = format!(
        r#"case "$*" in
  *--list-keys*) {LISTING}; exit 0;;
  *--always-trust*)
    cat >/dev/null
    case "$*" in
      *--sign*) printf 'SIGNED ARMOR\n';;
      *) printf 'UNSIGNED ARMOR\n';;
    esac
    exit 0;;
  *) cat >/dev/null; echo "[GNUPG:] INV_RECP 10 bob@example.com" >&2; exit 2;;
esac"#
    );
    let (prompter, counts) = Scripted::new(Some("hunter2"), Choice2::Proceed, Choice3::Retry);
    let mut session = session_with_script(&dir, &body, prompter).await;

    session.set_message("hello bob\n");
    assert!(
        session
            .encrypt_for(&["bob@example.com".to_string()], true)
            .await
    );
    assert_eq!(session.message(), "SIGNED ARMOR\n");
    // The wiped passphrase was solicited again for the retry.
    assert_eq!(counts.passphrases.load(Ordering::SeqCst), 2);
    assert_eq!(counts.retries.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn untrusted_key_demote_sends_plaintext() {
    let dir = tempfile::tempdir().unwrap();
    let body = format!(
        r#"case "$*" in *--list-keys*) {LISTING}; exit 0;; esac
cat >/dev/null
echo "[GNUPG:] INV_RECP 10 bob@example.com" >&2
exit 2"#
    );
    let (prompter, _counts) = Scripted::new(None, Choice2::Proceed, Choice3::Demote);
    let mut session = session_with_script(&dir, &body, prompter).await;

    session.set_message("hello bob\n");
    assert!(
        session
            .encrypt_for(&["bob@example.com".to_string()], false)
            .await
    );
    // "Send unencrypted": the output was discarded, the plaintext stands.
    assert_eq!(session.message(), "hello bob\n");
}

#[tokio::test]
async fn missing_key_send_as_is_or_abort() {
    let dir = tempfile::tempdir().unwrap();
    let body = format!(
        r#"case "$*" in *--list-keys*) {LISTING}; exit 0;; esac
cat >/dev/null
echo "[GNUPG:] INV_RECP 1 bob@example.com" >&2
exit 2"#
    );

    let (prompter, counts) = Scripted::new(None, Choice2::Proceed, Choice3::Cancel);
    let mut session = session_with_script(&dir, &body, prompter).await;
    session.set_message("hello bob\n");
    assert!(
        session
            .encrypt_for(&["bob@example.com".to_string()], false)
            .await
    );
    assert_eq!(session.message(), "hello bob\n");
    assert_eq!(counts.continues.load(Ordering::SeqCst), 1);

    let (prompter, _) = Scripted::new(None, Choice2::Cancel, Choice3::Cancel);
    let mut session = session_with_script(&dir, &body, prompter).await;
    session.set_message("hello bob\n");
    assert!(
        !session
            .encrypt_for(&["bob@example.com".to_string()], false)
            .await
    );
    assert_eq!(session.state(), SessionState::Resolved(Outcome::Declined));
}

#[tokio::test]
async fn terminal_error_carries_diagnostics() {
    let dir = tempfile::tempdir().unwrap();
    let body = format!(
        r#"case "$*" in *--list-keys*) {LISTING}; exit 0;; esac
cat >/dev/null
echo "gpg: disk full while writing output" >&2
exit 2"#
    );
    let (prompter, _) = Scripted::new(None, Choice2::Proceed, Choice3::Cancel);
    let mut session = session_with_script(&dir, &body, prompter).await;

    session.set_message("hello bob\n");
    assert!(
        !session
            .encrypt_for(&["bob@example.com".to_string()], false)
            .await
    );
    assert_eq!(session.state(), SessionState::Resolved(Outcome::Failed));
    assert!(session.last_error_msg().contains("disk full"));
}
