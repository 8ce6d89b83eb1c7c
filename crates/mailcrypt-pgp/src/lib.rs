//! OpenPGP tool adapters for mailcrypt.
//!
//! This crate drives external OpenPGP command-line tools (GnuPG and the
//! legacy PGP 2.6.x/5.x/6.5.x generations) as subprocesses and turns
//! their tool-specific output grammars into one uniform [`Status`] and
//! message state. Higher layers talk to a [`Backend`] and never see
//! which dialect is underneath.
//!
//! The crate does no cryptography itself; the installed tool remains
//! the source of truth for keys, trust and algorithms.

pub mod backend;
pub mod envelope;
mod error;
pub mod exec;
pub mod status;

pub use backend::{Backend, KeyDescriptor, ToolConfig, ToolKind};
pub use envelope::{BlockKind, Envelope};
pub use error::{Error, Result};
pub use exec::{ToolCommand, ToolOutput, find_in_path};
pub use status::Status;
