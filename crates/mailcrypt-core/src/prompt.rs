//! Interaction contracts between the session and the host application.
//!
//! The session never renders dialogs. Whenever a flow needs a human
//! decision it suspends on one of these methods and the host answers
//! however it likes (dialog, TUI, scripted policy). Cancelling a prompt
//! behaves exactly like choosing the abort option.

use mailcrypt_pgp::KeyDescriptor;

use crate::passphrase::Passphrase;

/// Answer to a two-way continue/cancel question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Choice2 {
    /// Go ahead with the described action.
    Proceed,
    /// Abort the operation.
    Cancel,
}

/// Answer to a three-way retry/demote/cancel question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Choice3 {
    /// Try the failed step again (with a new passphrase or relaxed
    /// trust, depending on the question).
    Retry,
    /// Drop the failing aspect and continue (send unsigned, send
    /// unencrypted).
    Demote,
    /// Abort the operation.
    Cancel,
}

/// The session's window to the user.
///
/// Implementations are expected to block (asynchronously) until the
/// user answers; the session holds no other state while suspended.
pub trait Prompter: Send + Sync {
    /// Asks for the passphrase unlocking the secret key.
    ///
    /// `key_hint` names the key the operation needs (the key a message
    /// was encrypted for, or the signing identity); it may be empty.
    /// `None` means the user cancelled.
    fn request_passphrase(
        &self,
        key_hint: &str,
    ) -> impl Future<Output = Option<Passphrase>> + Send;

    /// Asks the user to pick one key for `recipient` out of several
    /// plausible candidates. `None` means the user cancelled.
    fn request_key_selection(
        &self,
        candidates: &[KeyDescriptor],
        recipient: &str,
    ) -> impl Future<Output = Option<KeyDescriptor>> + Send;

    /// Asks a yes/no question; `affirmative` labels the proceed button.
    fn request_continue(
        &self,
        text: &str,
        affirmative: &str,
    ) -> impl Future<Output = Choice2> + Send;

    /// Asks a three-way question for the encrypt/sign recovery ladder;
    /// `retry_label` and `demote_label` caption the non-abort options.
    fn request_retry_or_demote(
        &self,
        text: &str,
        retry_label: &str,
        demote_label: &str,
    ) -> impl Future<Output = Choice3> + Send;
}
