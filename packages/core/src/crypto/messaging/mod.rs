//! Secure Messaging Protocols
//!
//! Протоколы защищённого обмена сообщениями поверх общего секрета из
//! KeyAgreement.
//!
//! ## Dataflow
//! ```text
//! Alice (инициатор)                          Bob (получатель)
//! ==================                         =================
//!
//! 1. new_initiator_session(root_key, SPK_B)
//!    → sending chain = KDF_RK(root_key, DH(A0, SPK_B))
//!
//! 2. encrypt(msg1) → PreKeySignalMessage → Bob
//!
//!                                            1. new_responder_session(root_key, spk_B)
//!                                            2. decrypt(msg1): видит новый ratchet key A0,
//!                                               делает DH ratchet step
//!                                            3. encrypt(reply) с новым ключом B1
//!
//! 3. decrypt(reply): DH ratchet step
//! ```
//!
//! ## Security Properties
//!
//! - **Forward Secrecy**: message keys одноразовые и затираются после использования.
//! - **Break-in Recovery**: каждый DH ratchet step добавляет свежую энтропию.
//! - **Out-of-Order**: skipped message keys хранятся в ограниченном окне.

use crate::crypto::provider::CryptoProvider;
use crate::utils::error::{DecryptionError, SessionError};

/// Протокол защищённого обмена сообщениями
///
/// ## Не отвечает за:
/// - Key agreement / handshake (это делает KeyAgreement)
/// - Управление множественными сессиями (это делает SessionStore)
/// - Дедупликацию envelope (это делает pipeline)
pub trait SecureMessaging<P: CryptoProvider>: Sized {
    /// Зашифрованное сообщение в wire format
    type EncryptedMessage;

    /// Зашифровать сообщение, продвинув sending chain ровно на один шаг
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Self::EncryptedMessage, SessionError>;

    /// Расшифровать сообщение
    ///
    /// Состояние меняется только при успехе: неудачная расшифровка
    /// оставляет сессию такой же, какой она была до вызова.
    fn decrypt(&mut self, message: &Self::EncryptedMessage) -> Result<Vec<u8>, DecryptionError>;

    fn session_id(&self) -> &str;

    /// Удалить skipped message keys старше `max_age_seconds`, возвращает число удалённых
    fn cleanup_old_skipped_keys(&mut self, max_age_seconds: i64) -> usize;
}

pub mod double_ratchet;

pub use double_ratchet::{
    DoubleRatchetSession, EncryptedRatchetMessage, RatchetLimits, SerializableSession,
};
