//! Splitting a message body around its PGP-armored block.
//!
//! Mail bodies routinely carry plain text before and after the armored
//! block (mailing list footers, reply quoting, signatures). Decrypt and
//! verify only ever rewrite the block itself; the surrounding text must
//! survive byte-for-byte so the caller can reassemble the message.

const BEGIN_MARKER: &str = "-----BEGIN PGP";
const END_MARKER: &str = "-----END PGP";

/// What kind of armored block was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// `BEGIN PGP MESSAGE` - encrypted (possibly also signed) data.
    Message,
    /// `BEGIN PGP SIGNED MESSAGE` - clearsigned text.
    SignedMessage,
    /// `BEGIN PGP PUBLIC KEY BLOCK` - an exported public key.
    PublicKey,
    /// `BEGIN PGP SIGNATURE` - a detached signature.
    Signature,
    /// An armor header this library does not act on.
    Other,
}

impl BlockKind {
    /// Classifies a block from its armor header line.
    #[must_use]
    pub fn detect(block: &str) -> Self {
        let header = block.lines().next().unwrap_or("");
        // SIGNED MESSAGE must be checked before MESSAGE.
        if header.contains("PGP SIGNED MESSAGE") {
            Self::SignedMessage
        } else if header.contains("PGP MESSAGE") {
            Self::Message
        } else if header.contains("PGP PUBLIC KEY BLOCK") {
            Self::PublicKey
        } else if header.contains("PGP SIGNATURE") {
            Self::Signature
        } else {
            Self::Other
        }
    }
}

/// A message body split around its armored block.
///
/// Invariant: `front + block + back` reproduces the parsed input exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Text preceding the armored block. Never rewritten.
    pub front: String,
    /// The armored block, from `-----BEGIN PGP` through the end of the
    /// `-----END PGP` line (trailing newline included when present).
    pub block: String,
    /// Text following the armored block. Never rewritten.
    pub back: String,
    /// Classification of the block.
    pub kind: BlockKind,
}

impl Envelope {
    /// Splits `raw` around its first PGP-armored block.
    ///
    /// Returns `None` when no `-----BEGIN PGP` marker is present. A block
    /// with a missing or truncated `-----END PGP` line extends to the end
    /// of the input.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let begin = raw.find(BEGIN_MARKER)?;
        let front = raw[..begin].to_string();

        let block_end = raw[begin..]
            .find(END_MARKER)
            .map(|rel| {
                let end_line = begin + rel;
                raw[end_line..]
                    .find('\n')
                    .map_or(raw.len(), |nl| end_line + nl + 1)
            })
            .unwrap_or(raw.len());

        let block = raw[begin..block_end].to_string();
        let back = raw[block_end..].to_string();
        let kind = BlockKind::detect(&block);

        Some(Self {
            front,
            block,
            back,
            kind,
        })
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

    const ENCRYPTED: &str = "Hi,\nsee below.\n\n-----BEGIN PGP MESSAGE-----\nVersion: 1\n\nhQEMA0\n-----END PGP MESSAGE-----\n\nregards\n";

    #[test]
    fn no_marker_is_none() {
        assert!(Envelope::parse("just some text").is_none());
        assert!(Envelope::parse("").is_none());
    }

    #[test]
    fn splits_front_block_back() {
        let env = Envelope::parse(ENCRYPTED).unwrap();
        assert_eq!(env.front, "Hi,\nsee below.\n\n");
        assert!(env.block.starts_with("-----BEGIN PGP MESSAGE-----"));
        assert!(env.block.ends_with("-----END PGP MESSAGE-----\n"));
        assert_eq!(env.back, "\nregards\n");
        assert_eq!(env.kind, BlockKind::Message);
    }

    #[test]
    fn reconstruction_is_exact() {
        let env = Envelope::parse(ENCRYPTED).unwrap();
        let rebuilt = format!("{}{}{}", env.front, env.block, env.back);
        assert_eq!(rebuilt, ENCRYPTED);
    }

    #[test]
    fn clearsigned_is_detected_before_message() {
        let raw = "-----BEGIN PGP SIGNED MESSAGE-----\nHash: SHA1\n\nhello\n-----BEGIN PGP SIGNATURE-----\nabc\n-----END PGP SIGNATURE-----\n";
        let env = Envelope::parse(raw).unwrap();
        assert_eq!(env.kind, BlockKind::SignedMessage);
        // The whole clearsigned unit is one block.
        assert!(env.block.ends_with("-----END PGP SIGNATURE-----\n"));
    }

    #[test]
    fn truncated_block_extends_to_end() {
        let raw = "x\n-----BEGIN PGP MESSAGE-----\ndata without end marker";
        let env = Envelope::parse(raw).unwrap();
        assert_eq!(env.front, "x\n");
        assert_eq!(env.back, "");
        assert_eq!(format!("{}{}{}", env.front, env.block, env.back), raw);
    }

    #[test]
    fn end_line_without_newline() {
        let raw = "-----BEGIN PGP MESSAGE-----\nabc\n-----END PGP MESSAGE-----";
        let env = Envelope::parse(raw).unwrap();
        assert_eq!(env.back, "");
        assert_eq!(format!("{}{}{}", env.front, env.block, env.back), raw);
    }

    #[test]
    fn public_key_block_kind() {
        let raw = "-----BEGIN PGP PUBLIC KEY BLOCK-----\nmQ\n-----END PGP PUBLIC KEY BLOCK-----\n";
        assert_eq!(Envelope::parse(raw).unwrap().kind, BlockKind::PublicKey);
    }
}
