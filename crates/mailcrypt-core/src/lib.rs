//! OpenPGP session layer for mail clients.
//!
//! Sits between a mail client's composing/reading surfaces and the
//! external OpenPGP tools driven by `mailcrypt-pgp`. The [`Session`]
//! state machine owns one operation at a time, resolves addressees to
//! keys through the cached [`keys::KeyDirectory`], and works through
//! recoverable tool conditions (wrong passphrase, untrusted or missing
//! keys) by asking the user through the [`Prompter`] contract. No
//! widget code lives here; the prompter trait is the entire UI
//! boundary.

pub mod config;
mod error;
pub mod keys;
mod passphrase;
pub mod prompt;
mod session;

pub use config::SessionConfig;
pub use error::{Error, Result};
pub use keys::{KeyDirectory, canonical_address, match_address, match_key};
pub use passphrase::Passphrase;
pub use prompt::{Choice2, Choice3, Prompter};
pub use session::{Outcome, Session, SessionState};

pub use mailcrypt_pgp::{Backend, BlockKind, Envelope, KeyDescriptor, Status, ToolKind};
