// Типы ошибок
//
// Иерархия:
// - CoreError       - общая ошибка крейта (то, что видит приложение)
//   ├── SessionError    - ошибки состояния сессии (encrypt, pre-key обмен)
//   ├── DecryptionError - терминальные ошибки одного сообщения
//   ├── KeyStoreError   - identity / pre-key хранилище
//   ├── StorageError    - персистентное хранилище
//   └── TransportError  - сеть (ретраится снаружи)

use crate::error::CryptoError;
use thiserror::Error;

/// Класс ошибки: определяет, как приложение должно на неё реагировать
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Блокирует дальнейшую работу (повреждение identity, исчерпаны попытки unlock)
    Fatal,
    /// Лечится сбросом сессии или подтверждением identity
    PerSession,
    /// Одно сообщение не расшифровано, разговор продолжается
    PerMessage,
    /// Сеть; ретраится с backoff
    Transient,
}

/// Ошибки состояния сессии
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("No session with {peer}.{device}")]
    NoSession { peer: String, device: u32 },

    #[error("Pre-key {0} not found")]
    PreKeyNotFound(u32),

    #[error("Pre-key {0} was already used")]
    PreKeyAlreadyUsed(u32),

    #[error("Signed pre-key {0} not found")]
    SignedPreKeyNotFound(u32),

    #[error("Too many skipped messages: requested jump of {requested}, limit {limit}")]
    TooManySkippedMessages { requested: u32, limit: u32 },

    #[error("Identity of {0} changed and has not been confirmed")]
    UntrustedIdentity(String),

    #[error("Invalid session transition: {from} on {event}")]
    InvalidTransition {
        from: &'static str,
        event: &'static str,
    },

    #[error("Send was cancelled")]
    Cancelled,

    #[error("Session protocol error: {0}")]
    Protocol(String),
}

/// Терминальные ошибки расшифровки одного envelope
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecryptionError {
    #[error("Duplicate message from {sender}.{device} at {timestamp}")]
    DuplicateMessage {
        sender: String,
        device: u32,
        timestamp: u64,
    },

    #[error("Message key for counter {0} was already consumed")]
    MessageKeyConsumed(u32),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Could not decrypt: {0}")]
    Corrupted(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl DecryptionError {
    /// Повторная доставка уже обработанного сообщения
    pub fn is_duplicate(&self) -> bool {
        matches!(
            self,
            DecryptionError::DuplicateMessage { .. } | DecryptionError::MessageKeyConsumed(_)
        )
    }
}

/// Ошибки identity / pre-key хранилища
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyStoreError {
    #[error("Failed to generate keys: {0}")]
    KeyGeneration(String),

    #[error("Wrong password")]
    Auth,

    #[error("Too many failed unlock attempts ({0})")]
    UnlockAttemptsExhausted(u32),

    #[error("Identity is not initialized")]
    NoIdentity,

    #[error("Identity store is corrupted: {0}")]
    Corrupted(String),
}

/// Ошибки хранилища
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Storage is locked")]
    Locked,

    #[error("Lock poisoned")]
    LockPoisoned,

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Corrupted record {key}: {reason}")]
    Corrupted { key: String, reason: String },
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

/// Ошибки транспорта (сеть, сервер)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Network unavailable: {0}")]
    Unavailable(String),

    #[error("Server rejected request: {0}")]
    Rejected(String),

    #[error("Timed out")]
    Timeout,
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Decryption(#[from] DecryptionError),

    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl CoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CoreError::KeyStore(KeyStoreError::Auth) => ErrorClass::PerSession,
            CoreError::KeyStore(_) => ErrorClass::Fatal,
            CoreError::Storage(StorageError::Corrupted { .. }) => ErrorClass::PerSession,
            CoreError::Storage(_) => ErrorClass::Fatal,
            CoreError::Session(SessionError::Cancelled) => ErrorClass::PerMessage,
            CoreError::Session(_) => ErrorClass::PerSession,
            CoreError::Decryption(DecryptionError::Session(_)) => ErrorClass::PerSession,
            CoreError::Decryption(_) => ErrorClass::PerMessage,
            CoreError::Transport(_) => ErrorClass::Transient,
            CoreError::Crypto(CryptoError::KeyGenerationError(_)) => ErrorClass::Fatal,
            CoreError::Crypto(_)
            | CoreError::SerializationError(_)
            | CoreError::ValidationError(_)
            | CoreError::NotFound(_) => ErrorClass::PerMessage,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
