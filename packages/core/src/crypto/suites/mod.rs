//! Криптографические наборы (Crypto Suites)
//!
//! Реализации [`CryptoProvider`](crate::crypto::provider::CryptoProvider).
//!
//! ### Classic Suite
//! - **DH**: X25519
//! - **Signatures**: Ed25519
//! - **AEAD**: ChaCha20-Poly1305
//! - **KDF**: HKDF-SHA256
//! - **Suite ID**: 1
//!
//! ```rust
//! use signet_core::crypto::suites::classic::ClassicSuiteProvider;
//! use signet_core::crypto::provider::CryptoProvider;
//!
//! let (private_key, public_key) = ClassicSuiteProvider::generate_dh_keys().unwrap();
//! assert_eq!(
//!     AsRef::<[u8]>::as_ref(&ClassicSuiteProvider::dh_public_from_private(&private_key).unwrap()),
//!     AsRef::<[u8]>::as_ref(&public_key)
//! );
//! ```

pub mod classic;
