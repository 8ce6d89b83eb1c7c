//! Fallback adapter for hosts without any OpenPGP tool.

use crate::status::Status;

use super::MessageState;

/// Adapter used when no tool is installed.
///
/// Messages can still be loaded and inspected for armor markers, but
/// every cryptographic capability reports `no_sec_key` so the caller
/// degrades to "cannot do crypto" instead of crashing.
#[derive(Debug, Default)]
pub struct NullBackend {
    state: MessageState,
}

impl NullBackend {
    pub(crate) const fn state(&self) -> &MessageState {
        &self.state
    }

    pub(crate) const fn state_mut(&mut self) -> &mut MessageState {
        &mut self.state
    }

    /// The uniform answer for every capability: cannot do crypto.
    pub(crate) fn refuse(&mut self) -> Status {
        let status = Status {
            no_sec_key: true,
            error: true,
            ..Status::OK
        };
        self.state.status = status;
        self.state
            .note("No OpenPGP tool is installed; cannot perform cryptographic operations.");
        status
    }
}
