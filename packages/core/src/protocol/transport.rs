// Внешние коллабораторы: транспорт envelope и директория pre-key bundles
//
// Сеть (websocket, HTTP) живёт снаружи ядра. Здесь только порты;
// in-memory реализации для тестов лежат в `protocol::memory`.

use crate::crypto::handshake::PreKeyBundle;
use crate::protocol::messages::PreKeyUpload;
use crate::utils::error::TransportError;
use async_trait::async_trait;

/// Отправка упакованных envelope
///
/// После успешного `send_envelope` сообщение считается переданным:
/// отозвать его уже нельзя.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_envelope(&self, envelope: Vec<u8>) -> Result<(), TransportError>;
}

/// Директория ключей на сервере
#[async_trait]
pub trait KeyDirectory: Send + Sync {
    /// Bundles всех устройств собеседника; каждый выдаёт не больше одного one-time pre-key
    async fn fetch_bundles(&self, peer: &str) -> Result<Vec<PreKeyBundle>, TransportError>;

    /// Опубликовать ключи локального устройства
    async fn publish(&self, peer: &str, upload: PreKeyUpload) -> Result<(), TransportError>;
}
