//! Криптографический модуль
//!
//! # Архитектура
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              MessagePipeline / SessionStore                 │
//! │  - Одна ActiveSession на адрес (peer, device)               │
//! │  - Trust и дедупликация                                     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                ┌─────────────┴─────────────┐
//!                ▼                           ▼
//! ┌───────────────────────────┐  ┌──────────────────────────┐
//! │   KeyAgreement (X3DH)     │  │  SecureMessaging (DR)    │
//! │  - Pre-key bundles        │  │  - Double Ratchet        │
//! │  - Root key derivation    │  │  - Skipped message keys  │
//! └───────────────────────────┘  └──────────────────────────┘
//!                │                           │
//!                └─────────────┬─────────────┘
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              CryptoProvider (Crypto-Agility)                │
//! │  - DH (X25519)                                              │
//! │  - Signatures (Ed25519)                                     │
//! │  - AEAD (ChaCha20-Poly1305)                                 │
//! │  - KDF (HKDF-SHA256)                                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Модули
//!
//! - [`provider`]: CryptoProvider trait
//! - [`handshake`]: KeyAgreement и X3DH
//! - [`messaging`]: SecureMessaging и Double Ratchet
//! - [`suites`]: реализации CryptoProvider
//! - [`keys`]: IdentityKeyStore, долгосрочные ключи и pre-keys
//! - [`fingerprint`]: safety numbers
//! - `master_key`: мастер-ключ хранилища из пароля

pub mod provider;

/// Key Agreement protocols (X3DH)
pub mod handshake;

/// Secure Messaging protocols (Double Ratchet)
pub mod messaging;

pub mod suites;

pub mod keys;

pub mod fingerprint;

pub mod master_key;

pub use provider::CryptoProvider;

pub type SuiteID = u16;

/// Suite ID for the classic suite
pub const CLASSIC_SUITE_ID: SuiteID = 1;
