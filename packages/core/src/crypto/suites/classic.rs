use crate::crypto::provider::CryptoProvider;
use crate::error::CryptoError;
use chacha20poly1305::{
    aead::{Aead, Payload},
    ChaCha20Poly1305, Key as ChachaKey, KeyInit, Nonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand_core::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

const ROOT_KDF_INFO: &[u8] = b"Signet-Ratchet-Root";
const CHAIN_KDF_INFO: &[u8] = b"Signet-Ratchet-Chain";

/// X25519 + Ed25519 + ChaCha20-Poly1305 + HKDF-SHA256.
pub struct ClassicSuiteProvider;

fn to_array<const N: usize>(bytes: &[u8], what: &str) -> Result<[u8; N], CryptoError> {
    bytes.try_into().map_err(|_| {
        CryptoError::InvalidInputError(format!(
            "Invalid {} length: expected {}, got {}",
            what,
            N,
            bytes.len()
        ))
    })
}

impl CryptoProvider for ClassicSuiteProvider {
    type DhPublicKey = Vec<u8>;
    type DhPrivateKey = Vec<u8>;
    type SignaturePublicKey = Vec<u8>;
    type SignaturePrivateKey = Vec<u8>;
    type AeadKey = Vec<u8>;

    fn generate_dh_keys() -> Result<(Self::DhPrivateKey, Self::DhPublicKey), CryptoError> {
        let private_key = StaticSecret::random_from_rng(OsRng);
        let public_key = X25519Public::from(&private_key);
        Ok((private_key.to_bytes().to_vec(), public_key.to_bytes().to_vec()))
    }

    fn dh_public_from_private(
        private_key: &Self::DhPrivateKey,
    ) -> Result<Self::DhPublicKey, CryptoError> {
        let secret = StaticSecret::from(to_array::<32>(private_key, "DH private key")?);
        Ok(X25519Public::from(&secret).to_bytes().to_vec())
    }

    fn dh_public_key_from_bytes(bytes: &[u8]) -> Result<Self::DhPublicKey, CryptoError> {
        to_array::<32>(bytes, "DH public key").map(|b| b.to_vec())
    }

    fn dh_private_key_from_bytes(bytes: &[u8]) -> Result<Self::DhPrivateKey, CryptoError> {
        to_array::<32>(bytes, "DH private key").map(|b| b.to_vec())
    }

    fn dh(
        private_key: &Self::DhPrivateKey,
        public_key: &Self::DhPublicKey,
    ) -> Result<Vec<u8>, CryptoError> {
        let secret = StaticSecret::from(to_array::<32>(private_key, "DH private key")?);
        let public = X25519Public::from(to_array::<32>(public_key, "DH public key")?);

        let shared = secret.diffie_hellman(&public);
        if !shared.was_contributory() {
            return Err(CryptoError::KeyAgreementError(
                "Non-contributory DH output (low-order point)".to_string(),
            ));
        }
        Ok(shared.to_bytes().to_vec())
    }

    fn generate_signature_keys(
    ) -> Result<(Self::SignaturePrivateKey, Self::SignaturePublicKey), CryptoError> {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Ok((
            signing_key.to_bytes().to_vec(),
            verifying_key.to_bytes().to_vec(),
        ))
    }

    fn signature_public_from_private(
        private_key: &Self::SignaturePrivateKey,
    ) -> Result<Self::SignaturePublicKey, CryptoError> {
        let signing_key = SigningKey::from_bytes(&to_array::<32>(private_key, "signing key")?);
        Ok(signing_key.verifying_key().to_bytes().to_vec())
    }

    fn signature_public_key_from_bytes(
        bytes: &[u8],
    ) -> Result<Self::SignaturePublicKey, CryptoError> {
        let raw = to_array::<32>(bytes, "verifying key")?;
        // Проверяем, что точка валидна
        VerifyingKey::from_bytes(&raw)?;
        Ok(raw.to_vec())
    }

    fn signature_private_key_from_bytes(
        bytes: &[u8],
    ) -> Result<Self::SignaturePrivateKey, CryptoError> {
        to_array::<32>(bytes, "signing key").map(|b| b.to_vec())
    }

    fn sign(private_key: &Self::SignaturePrivateKey, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let signing_key = SigningKey::from_bytes(&to_array::<32>(private_key, "signing key")?);
        Ok(signing_key.sign(message).to_bytes().to_vec())
    }

    fn verify(
        public_key: &Self::SignaturePublicKey,
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), CryptoError> {
        let verifying_key = VerifyingKey::from_bytes(&to_array::<32>(public_key, "verifying key")?)
            .map_err(|e| CryptoError::InvalidInputError(format!("Invalid verifying key: {}", e)))?;
        let signature = Signature::from_bytes(&to_array::<64>(signature, "signature")?);

        verifying_key
            .verify(message, &signature)
            .map_err(|e| CryptoError::SignatureVerificationError(e.to_string()))
    }

    fn aead_key_from_bytes(bytes: &[u8]) -> Result<Self::AeadKey, CryptoError> {
        to_array::<32>(bytes, "AEAD key").map(|b| b.to_vec())
    }

    fn aead_encrypt(
        key: &Self::AeadKey,
        nonce: &[u8],
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let key = to_array::<32>(key, "AEAD key")?;
        let nonce = to_array::<12>(nonce, "nonce")?;
        let cipher = ChaCha20Poly1305::new(ChachaKey::from_slice(&key));

        cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: associated_data,
                },
            )
            .map_err(|e| CryptoError::AeadEncryptionError(e.to_string()))
    }

    fn aead_decrypt(
        key: &Self::AeadKey,
        nonce: &[u8],
        ciphertext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let key = to_array::<32>(key, "AEAD key")?;
        let nonce = to_array::<12>(nonce, "nonce")?;
        let cipher = ChaCha20Poly1305::new(ChachaKey::from_slice(&key));

        cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad: associated_data,
                },
            )
            .map_err(|e| CryptoError::AeadDecryptionError(e.to_string()))
    }

    fn hkdf_derive_key(
        salt: &[u8],
        ikm: &[u8],
        info: &[u8],
        len: usize,
    ) -> Result<Vec<u8>, CryptoError> {
        let hkdf = Hkdf::<Sha256>::new(Some(salt), ikm);
        let mut okm = vec![0u8; len];
        hkdf.expand(info, &mut okm)
            .map_err(|e| CryptoError::KeyDerivationError(e.to_string()))?;
        Ok(okm)
    }

    fn kdf_rk(
        root_key: &Self::AeadKey,
        dh_output: &[u8],
    ) -> Result<(Self::AeadKey, Self::AeadKey), CryptoError> {
        let mut output = Self::hkdf_derive_key(root_key, dh_output, ROOT_KDF_INFO, 64)?;
        let chain_key = output.split_off(32);
        Ok((output, chain_key))
    }

    fn kdf_ck(chain_key: &Self::AeadKey) -> Result<(Self::AeadKey, Self::AeadKey), CryptoError> {
        let mut output = Self::hkdf_derive_key(chain_key, &[0x01], CHAIN_KDF_INFO, 64)?;
        let next_chain = output.split_off(32);
        Ok((output, next_chain))
    }

    fn random_bytes(len: usize) -> Result<Vec<u8>, CryptoError> {
        let mut bytes = vec![0u8; len];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| CryptoError::KeyGenerationError(e.to_string()))?;
        Ok(bytes)
    }

    fn suite_id() -> u16 {
        crate::config::Config::global().classic_suite_id
    }
}
