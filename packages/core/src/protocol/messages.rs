// Типы сообщений протокола
// Envelope (транспорт), pre-key / обычные шифротексты, расшифрованный Content

use crate::crypto::handshake::{OneTimePreKeyPublic, PreKeyBundle};
use crate::crypto::messaging::EncryptedRatchetMessage;
use crate::crypto::SuiteID;
use crate::utils::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Обычное сообщение Double Ratchet
pub type SignalMessage = EncryptedRatchetMessage;

/// Идентификатор исходящего сообщения, возвращается приложению
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Тип содержимого envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EnvelopeType {
    /// `content` - PreKeySignalMessage (первые сообщения новой сессии)
    PreKeyBundle,
    /// `content` - SignalMessage
    Ciphertext,
    /// Серверная квитанция о доставке, без содержимого
    Receipt,
}

/// Транспортная обёртка вокруг шифротекста
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub envelope_type: EnvelopeType,
    pub source: String,
    pub source_device: u32,
    pub destination: String,
    pub destination_device: u32,
    /// Время отправки в миллисекундах, часть ключа дедупликации
    pub timestamp: u64,
    #[serde(with = "serde_bytes")]
    pub content: Vec<u8>,
    /// Нужно ли будить получателя push-уведомлением
    pub urgent: bool,
}

/// Сообщение, открывающее сессию
///
/// Инициатор повторяет эти поля в каждом сообщении, пока не получит ответ.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeySignalMessage {
    pub registration_id: u32,
    pub signed_prekey_id: u32,
    pub one_time_prekey_id: Option<u32>,
    #[serde(with = "serde_bytes")]
    pub base_key: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub identity_key: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub verifying_key: Vec<u8>,
    pub message: SignalMessage,
}

/// Ссылка на вложение, загруженное внешним сервисом
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub content_type: String,
    pub size: u64,
    /// Ключ, которым зашифровано вложение
    #[serde(with = "serde_bytes")]
    pub key: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub digest: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataMessage {
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
    pub attachments: Vec<Attachment>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReceiptKind {
    Delivery,
    Read,
    Viewed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptMessage {
    pub kind: ReceiptKind,
    /// Timestamps подтверждаемых сообщений
    pub timestamps: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionMessage {
    pub emoji: String,
    pub target_author: String,
    pub target_timestamp: u64,
    pub remove: bool,
}

/// Расшифрованное содержимое сообщения
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Content {
    Data(DataMessage),
    Receipt(ReceiptMessage),
    Reaction(ReactionMessage),
    /// Отправитель сбросил сессию; получатель удаляет свою
    EndSession,
}

/// Публичная часть signed pre-key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPreKeyPublic {
    pub id: u32,
    #[serde(with = "serde_bytes")]
    pub public_key: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

/// Всё, что публикуется в директории ключей для одного устройства
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyUpload {
    pub registration_id: u32,
    pub device_id: u32,
    #[serde(with = "serde_bytes")]
    pub identity_key: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub verifying_key: Vec<u8>,
    pub signed_prekey: SignedPreKeyPublic,
    pub one_time_prekeys: Vec<OneTimePreKeyPublic>,
    pub suite_id: SuiteID,
}

impl PreKeyUpload {
    /// Bundle, который директория выдаёт инициатору
    ///
    /// `one_time_index` выбирает one-time pre-key из загруженных; None -
    /// bundle без one-time pre-key (пул исчерпан).
    pub fn to_bundle(&self, one_time_index: Option<usize>) -> Result<PreKeyBundle, CoreError> {
        let one_time_prekey = match one_time_index {
            Some(index) => Some(self.one_time_prekeys.get(index).cloned().ok_or_else(|| {
                CoreError::NotFound(format!("One-time pre-key at index {}", index))
            })?),
            None => None,
        };

        Ok(PreKeyBundle {
            registration_id: self.registration_id,
            device_id: self.device_id,
            identity_key: self.identity_key.clone(),
            verifying_key: self.verifying_key.clone(),
            signed_prekey_id: self.signed_prekey.id,
            signed_prekey_public: self.signed_prekey.public_key.clone(),
            signed_prekey_signature: self.signed_prekey.signature.clone(),
            one_time_prekey,
            suite_id: self.suite_id,
        })
    }
}
