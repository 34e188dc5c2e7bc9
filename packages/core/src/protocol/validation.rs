// Валидация входящих данных
// Проверяется форма (длины ключей, обязательные поля) до любой криптографии

use crate::config::Config;
use crate::crypto::handshake::PreKeyBundle;
use crate::protocol::messages::{Envelope, EnvelopeType, PreKeySignalMessage, SignalMessage};
use crate::utils::error::{CoreError, Result};

/// X25519 / Ed25519 public key
pub const PUBLIC_KEY_LENGTH: usize = 32;
pub const SIGNATURE_LENGTH: usize = 64;
/// Poly1305 tag
const AEAD_TAG_LENGTH: usize = 16;
const MAX_ADDRESS_LENGTH: usize = 256;

fn invalid(message: impl Into<String>) -> CoreError {
    CoreError::ValidationError(message.into())
}

fn check_key(name: &str, key: &[u8], length: usize) -> Result<()> {
    if key.len() != length {
        return Err(invalid(format!(
            "{} must be {} bytes, got {}",
            name,
            length,
            key.len()
        )));
    }
    Ok(())
}

/// Валидация адреса собеседника
pub fn validate_address(peer: &str) -> Result<()> {
    if peer.is_empty() || peer.len() > MAX_ADDRESS_LENGTH {
        return Err(invalid("Peer address must be 1..=256 bytes"));
    }
    if peer.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(invalid("Peer address contains whitespace or control characters"));
    }
    Ok(())
}

pub fn validate_envelope(envelope: &Envelope) -> Result<()> {
    validate_address(&envelope.source)?;
    validate_address(&envelope.destination)?;

    if envelope.source_device == 0 {
        return Err(invalid("Source device id must be non-zero"));
    }
    if envelope.timestamp == 0 {
        return Err(invalid("Envelope timestamp is missing"));
    }

    match envelope.envelope_type {
        EnvelopeType::Receipt => Ok(()),
        EnvelopeType::PreKeyBundle | EnvelopeType::Ciphertext if envelope.content.is_empty() => {
            Err(invalid("Envelope content cannot be empty"))
        }
        _ => Ok(()),
    }
}

pub fn validate_signal_message(message: &SignalMessage) -> Result<()> {
    check_key("Ratchet key", &message.ratchet_key, PUBLIC_KEY_LENGTH)?;
    check_key(
        "Nonce",
        &message.nonce,
        Config::global().chacha_nonce_length,
    )?;
    if message.ciphertext.len() < AEAD_TAG_LENGTH {
        return Err(invalid("Ciphertext is shorter than the authentication tag"));
    }
    Ok(())
}

pub fn validate_prekey_message(message: &PreKeySignalMessage) -> Result<()> {
    check_key("Base key", &message.base_key, PUBLIC_KEY_LENGTH)?;
    check_key("Identity key", &message.identity_key, PUBLIC_KEY_LENGTH)?;
    check_key("Verifying key", &message.verifying_key, PUBLIC_KEY_LENGTH)?;
    validate_signal_message(&message.message)
}

/// Валидация bundle из директории (подпись проверяет X3DH)
pub fn validate_bundle(bundle: &PreKeyBundle) -> Result<()> {
    check_key("Identity key", &bundle.identity_key, PUBLIC_KEY_LENGTH)?;
    check_key("Verifying key", &bundle.verifying_key, PUBLIC_KEY_LENGTH)?;
    check_key("Signed pre-key", &bundle.signed_prekey_public, PUBLIC_KEY_LENGTH)?;
    check_key(
        "Signed pre-key signature",
        &bundle.signed_prekey_signature,
        SIGNATURE_LENGTH,
    )?;
    if let Some(one_time) = &bundle.one_time_prekey {
        check_key("One-time pre-key", &one_time.public_key, PUBLIC_KEY_LENGTH)?;
    }
    if bundle.device_id == 0 {
        return Err(invalid("Bundle device id must be non-zero"));
    }
    Ok(())
}
