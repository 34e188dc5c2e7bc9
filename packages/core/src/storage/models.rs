// Модели данных для хранилища
//
// Все записи сериализуются bincode и пишутся через BlobStore. Записи с
// приватными ключами затираются при drop.

use crate::crypto::messaging::SerializableSession;
use crate::trust::TrustState;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Signed pre-key с приватной частью
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct StoredSignedPreKey {
    pub id: u32,
    pub private_key: Vec<u8>,
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
    pub created_at: i64,
    /// Base keys принятых pre-key сообщений без one-time pre-key
    pub accepted_base_keys: Vec<Vec<u8>>,
}

#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct StoredOneTimePreKey {
    pub id: u32,
    pub private_key: Vec<u8>,
    pub public_key: Vec<u8>,
}

/// Локальная identity и все pre-keys (namespace `identity`)
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct StoredIdentity {
    pub registration_id: u32,
    pub device_id: u32,
    pub identity_private: Vec<u8>,
    pub identity_public: Vec<u8>,
    pub signing_private: Vec<u8>,
    pub verifying_key: Vec<u8>,

    pub current_signed_prekey: Option<StoredSignedPreKey>,
    /// Старые signed pre-keys, ещё принимаемые в pre-key сообщениях
    pub archived_signed_prekeys: Vec<StoredSignedPreKey>,
    pub one_time_prekeys: Vec<StoredOneTimePreKey>,

    pub next_signed_prekey_id: u32,
    pub next_one_time_prekey_id: u32,
    pub last_rotation_at: i64,
    pub created_at: i64,
}

/// Данные pre-key обмена, которые инициатор повторяет до первого ответа
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPendingPreKey {
    pub base_key: Vec<u8>,
    pub signed_prekey_id: u32,
    pub one_time_prekey_id: Option<u32>,
}

/// Фаза сессии в хранилище
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoredSessionPhase {
    Pending,
    Established,
}

/// Сессия Double Ratchet в хранилище (namespace `sessions`)
#[derive(Serialize, Deserialize)]
pub struct StoredSession {
    pub peer: String,
    pub device: u32,
    pub phase: StoredSessionPhase,
    /// Base key X3DH, на котором построена сессия
    pub base_key: Vec<u8>,
    pub remote_identity: Vec<u8>,
    pub remote_registration_id: u32,
    pub pending_prekey: Option<StoredPendingPreKey>,
    pub ratchet: SerializableSession,
    pub created_at: i64,
    pub last_used: i64,
}

/// Режим шифрования хранилища
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageEncryption {
    /// Ключ выводится из пароля пользователя
    Password,
    /// Ключ хранится рядом с данными, unlock без пароля
    AutoUnlock,
}

/// Метаданные шифрования (namespace `meta`, хранятся открыто)
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct StoredEncryptionMeta {
    #[zeroize(skip)]
    pub encryption: StorageEncryption,
    pub salt: Vec<u8>,
    pub verifier: Vec<u8>,
    pub auto_unlock_key: Option<Vec<u8>>,
    pub failed_attempts: u32,
    pub created_at: i64,
}

/// Запись о доверии к identity собеседника (namespace `trust`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTrustRecord {
    pub identity_key: Vec<u8>,
    pub verifying_key: Vec<u8>,
    pub state: TrustState,
    pub first_seen: i64,
    /// Время последней смены identity key
    pub changed_at: Option<i64>,
    pub verified_at: Option<i64>,
}
