//! Passphrase buffer with overwrite-on-clear semantics.

use zeroize::Zeroizing;

/// A passphrase held in memory.
///
/// The backing buffer is overwritten with zeros when the value is
/// dropped, so clearing the cached passphrase is a real wipe rather
/// than a pointer drop. `Debug` never reveals the content.
#[derive(Clone)]
pub struct Passphrase(Zeroizing<String>);

impl Passphrase {
    /// Wraps a passphrase string.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(Zeroizing::new(raw.into()))
    }

    /// Borrows the passphrase for a single tool invocation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the passphrase is the empty string.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Passphrase(<redacted>)")
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
    fn debug_is_redacted() {
        let pass = Passphrase::new("hunter2");
        assert_eq!(format!("{pass:?}"), "Passphrase(<redacted>)");
        assert_eq!(pass.as_str(), "hunter2");
    }

    #[test]
    fn empty_is_detected() {
        assert!(Passphrase::new("").is_empty());
        assert!(!Passphrase::new("x").is_empty());
    }
}
