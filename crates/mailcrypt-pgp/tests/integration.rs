//! Integration tests exercising the public surface of mailcrypt-pgp.

#![allow(clippy::unwrap_used)]

use mailcrypt_pgp::{Backend, BlockKind, Envelope, Status, backend::NullBackend};
use proptest::prelude::*;

#[tokio::test]
async fn null_backend_round_trip_degrades_gracefully() {
    let mut backend = Backend::Null(NullBackend::default());
    let body = "hello\n-----BEGIN PGP MESSAGE-----\nhQEMA0\n-----END PGP MESSAGE-----\ntail\n";

    let env = backend.set_message(body).unwrap();
    assert_eq!(env.kind, BlockKind::Message);
    assert!(backend.is_encrypted());

    let status = backend.decrypt(Some("sekrit")).await;
    assert!(status.no_sec_key);
    assert!(!status.is_ok());
    assert!(!backend.last_error().is_empty());

    // The block is still there untouched for the caller to reassemble.
    assert_eq!(format!("{}{}{}", env.front, backend.message(), env.back), body);
}

#[tokio::test]
async fn plaintext_body_is_kept_for_later_encryption() {
    let mut backend = Backend::Null(NullBackend::default());
    assert!(backend.set_message("no armor here").is_none());
    assert!(!backend.is_encrypted());
    assert_eq!(backend.message(), "no armor here");
    assert_eq!(backend.status(), Status::OK);
}

proptest! {
    /// Splitting any body around its armored block must lose no bytes.
    #[test]
    fn envelope_reconstruction_is_lossless(
        front in "[a-zA-Z0-9 .,\n]{0,80}",
        payload in "[a-zA-Z0-9+/=\n]{1,120}",
        back in "[a-zA-Z0-9 .,\n]{0,80}",
    ) {
        let raw = format!(
            "{front}-----BEGIN PGP MESSAGE-----\n\n{payload}\n-----END PGP MESSAGE-----\n{back}"
        );
        let env = Envelope::parse(&raw).unwrap();
        prop_assert_eq!(format!("{}{}{}", env.front, env.block, env.back), raw);
        prop_assert_eq!(env.kind, BlockKind::Message);
        prop_assert!(env.front.len() <= front.len());
    }

    /// Bodies without a marker never split.
    #[test]
    fn no_marker_never_splits(body in "[a-zA-Z0-9 .,\n-]{0,200}") {
        prop_assume!(!body.contains("-----BEGIN PGP"));
        prop_assert!(Envelope::parse(&body).is_none());
    }
}
