//! Normalized outcome of one tool invocation.
//!
//! The external tools report conditions through a mix of exit codes,
//! human-readable diagnostics and (for GnuPG) machine status lines. Each
//! adapter folds that into a [`Status`], a set of independently combinable
//! condition flags. Several flags may be set at once: `bad_keys` together
//! with `error` describes a decision point for the caller, not a terminal
//! failure.

/// Condition flags produced by one invocation of the external tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Status {
    /// The tool could not be run at all (spawn failure, timeout, broken pipe).
    pub run_err: bool,
    /// The operation failed; diagnostics explain why.
    pub error: bool,
    /// The supplied passphrase was rejected. Callers retry only on this.
    pub bad_phrase: bool,
    /// A recipient key is expired, revoked or not trusted.
    pub bad_keys: bool,
    /// An addressee has no key at all.
    pub missing_key: bool,
    /// No usable secret key is available for decryption.
    pub no_sec_key: bool,
    /// Signing failed while the rest of the operation may have succeeded.
    pub err_signing: bool,
}

impl Status {
    /// Outcome with no condition flags set.
    pub const OK: Self = Self {
        run_err: false,
        error: false,
        bad_phrase: false,
        bad_keys: false,
        missing_key: false,
        no_sec_key: false,
        err_signing: false,
    };

    /// Returns true when neither `error` nor `run_err` is set.
    #[must_use]
    pub const fn is_ok(self) -> bool {
        !self.error && !self.run_err
    }

    /// Returns an outcome for a failed tool run.
    #[must_use]
    pub const fn run_failed() -> Self {
        Self {
            run_err: true,
            error: true,
            ..Self::OK
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
    use super::*;

    #[test]
    fn ok_has_no_flags() {
        assert!(Status::OK.is_ok());
        assert!(!Status::OK.bad_phrase);
    }

    #[test]
    fn failed_run_is_not_ok() {
        let status = Status::run_failed();
        assert!(!status.is_ok());
        assert!(status.run_err);
        assert!(status.error);
    }

    #[test]
    fn decision_point_is_representable() {
        // bad_keys + error together describe a retryable decision,
        // not a terminal failure.
        let status = Status {
            bad_keys: true,
            error: true,
            ..Status::OK
        };
        assert!(!status.is_ok());
        assert!(status.bad_keys);
        assert!(!status.bad_phrase);
    }
}
