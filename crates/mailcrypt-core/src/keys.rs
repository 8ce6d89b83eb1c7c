//! Key directory cache and address-to-key matching.
//!
//! The key listing of the external tool is expensive to produce, so it
//! is fetched once and cached until something invalidates it (a miss
//! worth re-checking, or an explicit refresh). Matching an addressee to
//! a key descriptor is plain substring containment over the free-text
//! descriptor lines; the tool remains the authority on key validity.

use mailcrypt_pgp::{Backend, KeyDescriptor};
use tracing::{debug, warn};

/// Normalizes an addressee to angle-bracket `<local@host>` form.
///
/// An address already carrying brackets keeps its bracketed part (a
/// missing closing bracket is repaired). A bare `local@host` is
/// wrapped. A bare local part is completed with the machine's hostname.
#[must_use]
pub fn canonical_address(addr: &str) -> String {
    let addr = addr.trim();
    if let Some(start) = addr.find('<') {
        let rest = &addr[start..];
        return rest.find('>').map_or_else(
            || format!("{rest}>"),
            |end| rest[..=end].to_string(),
        );
    }
    if let Some(token) = addr.split_whitespace().find(|t| t.contains('@')) {
        return format!("<{token}>");
    }
    format!("<{addr}@{}>", hostname())
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// Whether `key` matches the canonical `<local@host>` form of `person`.
///
/// This is the strict first matching tier, also used on its own by the
/// cheap "do we have any key for this person" check.
#[must_use]
pub fn matches_canonical(key: &KeyDescriptor, person: &str) -> bool {
    let needle = canonical_address(person).to_lowercase();
    key.as_str().to_lowercase().contains(&needle)
}

/// Finds the key for `person` by address containment: the canonical
/// lower-cased `<local@host>` inside the descriptor first, the raw
/// lower-cased address second.
#[must_use]
pub fn match_address<'a>(keys: &'a [KeyDescriptor], person: &str) -> Option<&'a KeyDescriptor> {
    let canonical = canonical_address(person).to_lowercase();
    let raw = person.trim().to_lowercase();

    keys.iter()
        .find(|key| key.as_str().to_lowercase().contains(&canonical))
        .or_else(|| {
            keys.iter()
                .find(|key| key.as_str().to_lowercase().contains(&raw))
        })
}

/// Finds the key for `person`, trying the address tiers of
/// [`match_address`] first and the reverse tier last: the descriptor's
/// user-id text inside the address (catches descriptors that carry a
/// bare name).
#[must_use]
pub fn match_key<'a>(keys: &'a [KeyDescriptor], person: &str) -> Option<&'a KeyDescriptor> {
    let raw = person.trim().to_lowercase();
    match_address(keys, person).or_else(|| keys.iter().find(|key| reverse_match(key, &raw)))
}

/// Tier three: the descriptor's user id appears inside the address.
fn reverse_match(key: &KeyDescriptor, raw_lower: &str) -> bool {
    let uid = key
        .as_str()
        .split_once(char::is_whitespace)
        .map_or("", |(_, rest)| rest)
        .trim()
        .to_lowercase();
    !uid.is_empty() && raw_lower.contains(&uid)
}

/// Lazily populated cache over the tool's public key listing.
#[derive(Debug, Default)]
pub struct KeyDirectory {
    keys: Vec<KeyDescriptor>,
    loaded: bool,
}

impl KeyDirectory {
    /// The cached listing, fetched from the tool on first use.
    ///
    /// A listing failure is logged and treated as an empty directory;
    /// the cache is still marked loaded so one failure does not turn
    /// into a listing run per addressee.
    pub async fn keys(&mut self, backend: &Backend) -> &[KeyDescriptor] {
        if !self.loaded {
            match backend.pub_keys().await {
                Ok(keys) => {
                    debug!(count = keys.len(), "key directory populated");
                    self.keys = keys;
                }
                Err(e) => {
                    warn!(error = %e, "key listing failed, directory left empty");
                    self.keys.clear();
                }
            }
            self.loaded = true;
        }
        &self.keys
    }

    /// Drops the cached listing; the next [`Self::keys`] call re-reads.
    pub fn invalidate(&mut self) {
        self.loaded = false;
    }

    /// Re-reads the listing immediately.
    pub async fn refresh(&mut self, backend: &Backend) -> &[KeyDescriptor] {
        self.invalidate();
        self.keys(backend).await
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

    fn keys() -> Vec<KeyDescriptor> {
        vec![
            KeyDescriptor::new("AB12CD34 Alice Example <alice@example.com>"),
            KeyDescriptor::new("EF56AB78 Bob <bob@example.com>"),
            KeyDescriptor::new("99EE88FF Carol"),
        ]
    }

    #[test]
    fn canonical_address_forms() {
        assert_eq!(
            canonical_address("Alice <Alice@Example.com>"),
            "<Alice@Example.com>"
        );
        assert_eq!(canonical_address("bob@example.com"), "<bob@example.com>");
        assert_eq!(
            canonical_address("Bob Example bob@example.com"),
            "<bob@example.com>"
        );
        // A truncated bracket is repaired.
        assert_eq!(canonical_address("x <a@b.c"), "<a@b.c>");
    }

    #[test]
    fn bare_local_part_gets_a_hostname() {
        let canonical = canonical_address("carol");
        assert!(canonical.starts_with("<carol@"));
        assert!(canonical.ends_with('>'));
    }

    #[test]
    fn canonical_tier_wins_over_looser_tiers() {
        let keys = keys();
        let found = match_key(&keys, "alice@example.com").unwrap();
        assert_eq!(found.key_id(), "AB12CD34");
        // A person whose address appears bracketed in one descriptor and
        // whose name appears in another must resolve to the bracketed one.
        let list = vec![
            KeyDescriptor::new("99EE88FF bob"),
            KeyDescriptor::new("EF56AB78 Bob <bob@example.com>"),
        ];
        let found = match_key(&list, "bob <bob@example.com>").unwrap();
        assert_eq!(found.key_id(), "EF56AB78");
    }

    #[test]
    fn raw_containment_is_second() {
        // No angle brackets in the descriptor for this person, but the
        // raw name appears verbatim.
        let list = vec![KeyDescriptor::new("11223344 dave (work key)")];
        assert_eq!(match_key(&list, "dave").unwrap().key_id(), "11223344");
    }

    #[test]
    fn reverse_containment_catches_bare_name_descriptors() {
        // Neither "<carol@elsewhere.org>" nor the raw address appear in
        // any descriptor, but the Carol descriptor's uid appears in the
        // address.
        let keys = keys();
        let found = match_key(&keys, "carol <carol@elsewhere.org>");
        assert_eq!(found.unwrap().key_id(), "99EE88FF");
    }

    #[test]
    fn matching_is_case_insensitive() {
        let keys = keys();
        let found = match_key(&keys, "BOB@EXAMPLE.COM").unwrap();
        assert_eq!(found.key_id(), "EF56AB78");
        assert!(matches_canonical(&keys[1], "Bob <BOB@example.com>"));
    }

    #[test]
    fn unknown_person_matches_nothing() {
        assert!(match_key(&keys(), "nobody@nowhere.invalid").is_none());
    }
}
