//! Tests for the classic suite primitives through the public CryptoProvider API
//!
//! - X25519 key agreement
//! - Ed25519 signatures
//! - ChaCha20-Poly1305 with associated data
//! - HKDF, KDF_RK, KDF_CK

use signet_core::crypto::suites::classic::ClassicSuiteProvider;
use signet_core::crypto::{CryptoProvider, CLASSIC_SUITE_ID};

type Suite = ClassicSuiteProvider;

#[test]
fn test_classic_suite_id() {
    assert_eq!(Suite::suite_id(), CLASSIC_SUITE_ID);
}

#[test]
fn test_dh_agreement_is_symmetric() {
    let (alice_private, alice_public) = Suite::generate_dh_keys().unwrap();
    let (bob_private, bob_public) = Suite::generate_dh_keys().unwrap();

    assert_eq!(AsRef::<[u8]>::as_ref(&alice_public).len(), 32, "X25519 public key should be 32 bytes");

    let alice_shared = Suite::dh(&alice_private, &bob_public).unwrap();
    let bob_shared = Suite::dh(&bob_private, &alice_public).unwrap();
    assert_eq!(alice_shared, bob_shared);

    let derived = Suite::dh_public_from_private(&alice_private).unwrap();
    assert_eq!(AsRef::<[u8]>::as_ref(&derived), AsRef::<[u8]>::as_ref(&alice_public));
}

#[test]
fn test_dh_rejects_wrong_key_length() {
    assert!(Suite::dh_public_key_from_bytes(&[7u8; 31]).is_err());
    assert!(Suite::dh_private_key_from_bytes(&[7u8; 33]).is_err());
}

#[test]
fn test_sign_verify() {
    let (signing_key, verifying_key) = Suite::generate_signature_keys().unwrap();
    let message = b"Hello, Signet!";

    let signature = Suite::sign(&signing_key, message).unwrap();
    assert_eq!(signature.len(), 64, "Signature should be 64 bytes");
    assert!(Suite::verify(&verifying_key, message, &signature).is_ok());

    // Подпись не переносится на другое сообщение
    assert!(Suite::verify(&verifying_key, b"Modified message", &signature).is_err());

    let (_, other_key) = Suite::generate_signature_keys().unwrap();
    assert!(Suite::verify(&other_key, message, &signature).is_err());
}

#[test]
fn test_aead_roundtrip_and_tamper_detection() {
    let key = Suite::aead_key_from_bytes(&[0u8; 32]).unwrap();
    let wrong_key = Suite::aead_key_from_bytes(&[1u8; 32]).unwrap();
    let nonce = Suite::random_bytes(12).unwrap();
    let plaintext = b"Secret message for encryption test";
    let aad = b"associated data";

    let ciphertext = Suite::aead_encrypt(&key, &nonce, plaintext, aad).unwrap();
    assert_eq!(ciphertext.len(), plaintext.len() + 16, "Ciphertext should carry a 16-byte tag");
    assert_eq!(Suite::aead_decrypt(&key, &nonce, &ciphertext, aad).unwrap(), plaintext);

    assert!(Suite::aead_decrypt(&wrong_key, &nonce, &ciphertext, aad).is_err());
    assert!(Suite::aead_decrypt(&key, &nonce, &ciphertext, b"other data").is_err());

    let wrong_nonce = Suite::random_bytes(12).unwrap();
    assert!(Suite::aead_decrypt(&key, &wrong_nonce, &ciphertext, aad).is_err());

    let mut tampered = ciphertext.clone();
    tampered[0] ^= 0x80;
    assert!(Suite::aead_decrypt(&key, &nonce, &tampered, aad).is_err());
}

#[test]
fn test_hkdf_is_deterministic() {
    let key = Suite::hkdf_derive_key(b"salt", b"input key material", b"context", 32).unwrap();
    assert_eq!(key.len(), 32);
    assert_eq!(
        key,
        Suite::hkdf_derive_key(b"salt", b"input key material", b"context", 32).unwrap()
    );
    assert_ne!(
        key,
        Suite::hkdf_derive_key(b"salt", b"input key material", b"other context", 32).unwrap()
    );
}

#[test]
fn test_kdf_rk_and_ck() {
    let root_key = Suite::aead_key_from_bytes(&[0u8; 32]).unwrap();
    let (new_root, chain_key) = Suite::kdf_rk(&root_key, &[1u8; 32]).unwrap();
    assert_eq!(AsRef::<[u8]>::as_ref(&new_root).len(), 32);
    assert_eq!(AsRef::<[u8]>::as_ref(&chain_key).len(), 32);
    assert_ne!(AsRef::<[u8]>::as_ref(&new_root), AsRef::<[u8]>::as_ref(&root_key));

    let (message_key, next_chain) = Suite::kdf_ck(&chain_key).unwrap();
    assert_eq!(AsRef::<[u8]>::as_ref(&message_key).len(), 32);
    assert_ne!(AsRef::<[u8]>::as_ref(&message_key), AsRef::<[u8]>::as_ref(&next_chain));

    // Цепочка детерминирована
    let (again, _) = Suite::kdf_ck(&chain_key).unwrap();
    assert_eq!(AsRef::<[u8]>::as_ref(&message_key), AsRef::<[u8]>::as_ref(&again));
}

#[test]
fn test_random_bytes_are_unique() {
    let mut seen = std::collections::HashSet::new();
    for _ in 0..100 {
        let nonce = Suite::random_bytes(12).unwrap();
        assert!(seen.insert(hex::encode(&nonce)), "Duplicate nonce generated");
    }
}
