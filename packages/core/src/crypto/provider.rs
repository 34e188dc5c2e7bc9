//! Defines the CryptoProvider trait for crypto-agility.

use crate::error::CryptoError;
use core::fmt::Debug;
use zeroize::Zeroize;

/// Trait that formalizes all cryptographic operations for a specific cipher suite.
///
/// Ratchet, handshake and key store code only talk to primitives through this
/// trait, so a suite can be swapped without touching the session engine.
pub trait CryptoProvider: Send + Sync + 'static {
    type DhPublicKey: AsRef<[u8]> + Debug + Clone + Send + Sync + 'static;
    type DhPrivateKey: AsRef<[u8]> + Clone + Zeroize + Send + Sync + 'static;
    type SignaturePublicKey: AsRef<[u8]> + Debug + Clone + Send + Sync + 'static;
    type SignaturePrivateKey: AsRef<[u8]> + Clone + Zeroize + Send + Sync + 'static;
    type AeadKey: AsRef<[u8]> + Clone + Default + Zeroize + Send + Sync + 'static;

    /// Generates a new X25519-style key pair.
    fn generate_dh_keys() -> Result<(Self::DhPrivateKey, Self::DhPublicKey), CryptoError>;

    /// Derives the public half of a DH private key.
    fn dh_public_from_private(
        private_key: &Self::DhPrivateKey,
    ) -> Result<Self::DhPublicKey, CryptoError>;

    /// Parses a DH public key, validating its length.
    fn dh_public_key_from_bytes(bytes: &[u8]) -> Result<Self::DhPublicKey, CryptoError>;

    /// Parses a DH private key, validating its length.
    fn dh_private_key_from_bytes(bytes: &[u8]) -> Result<Self::DhPrivateKey, CryptoError>;

    /// Diffie-Hellman between our private key and their public key.
    fn dh(
        private_key: &Self::DhPrivateKey,
        public_key: &Self::DhPublicKey,
    ) -> Result<Vec<u8>, CryptoError>;

    /// Generates a new Signature key pair.
    fn generate_signature_keys(
    ) -> Result<(Self::SignaturePrivateKey, Self::SignaturePublicKey), CryptoError>;

    /// Derives a Signature public key from a Signature private key.
    fn signature_public_from_private(
        private_key: &Self::SignaturePrivateKey,
    ) -> Result<Self::SignaturePublicKey, CryptoError>;

    fn signature_public_key_from_bytes(
        bytes: &[u8],
    ) -> Result<Self::SignaturePublicKey, CryptoError>;

    fn signature_private_key_from_bytes(
        bytes: &[u8],
    ) -> Result<Self::SignaturePrivateKey, CryptoError>;

    /// Signs a message with the given private key.
    fn sign(private_key: &Self::SignaturePrivateKey, message: &[u8])
        -> Result<Vec<u8>, CryptoError>;

    /// Verifies a signature with the given public key.
    fn verify(
        public_key: &Self::SignaturePublicKey,
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), CryptoError>;

    /// Creates an AEAD key from raw bytes
    fn aead_key_from_bytes(bytes: &[u8]) -> Result<Self::AeadKey, CryptoError>;

    /// Performs AEAD encryption. Returns ciphertext with tag appended.
    fn aead_encrypt(
        key: &Self::AeadKey,
        nonce: &[u8],
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// Performs AEAD decryption.
    fn aead_decrypt(
        key: &Self::AeadKey,
        nonce: &[u8],
        ciphertext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// Derives a key from input key material using HKDF.
    fn hkdf_derive_key(
        salt: &[u8],
        ikm: &[u8],
        info: &[u8],
        len: usize,
    ) -> Result<Vec<u8>, CryptoError>;

    /// KDF_RK: derives a new root key and a chain key from the current root key and DH output.
    fn kdf_rk(
        root_key: &Self::AeadKey,
        dh_output: &[u8],
    ) -> Result<(Self::AeadKey, Self::AeadKey), CryptoError>;

    /// KDF_CK: derives a message key and the next chain key from the current chain key.
    fn kdf_ck(chain_key: &Self::AeadKey) -> Result<(Self::AeadKey, Self::AeadKey), CryptoError>;

    /// Fills a buffer of the given length from the OS RNG.
    fn random_bytes(len: usize) -> Result<Vec<u8>, CryptoError>;

    /// Returns the SuiteID associated with this CryptoProvider.
    fn suite_id() -> u16;
}
