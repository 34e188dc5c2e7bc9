// Wire format (MessagePack сериализация)
// Структуры пишутся как map, чтобы новые поля не ломали старых клиентов

use crate::protocol::messages::{Content, Envelope, PreKeySignalMessage, SignalMessage};
use crate::utils::error::{CoreError, Result};
use rmp_serde::{Deserializer, Serializer};
use serde::{Deserialize, Serialize};

/// Упаковать произвольные данные в MessagePack
pub fn pack_raw<T: Serialize>(data: &T) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    data.serialize(&mut Serializer::new(&mut buffer).with_struct_map())
        .map_err(|e| CoreError::SerializationError(format!("MessagePack pack error: {}", e)))?;
    Ok(buffer)
}

/// Распаковать MessagePack в произвольный тип
pub fn unpack_raw<'a, T: Deserialize<'a>>(data: &'a [u8]) -> Result<T> {
    let mut deserializer = Deserializer::new(data);
    T::deserialize(&mut deserializer)
        .map_err(|e| CoreError::SerializationError(format!("MessagePack unpack error: {}", e)))
}

pub fn pack_envelope(envelope: &Envelope) -> Result<Vec<u8>> {
    pack_raw(envelope)
}

pub fn unpack_envelope(data: &[u8]) -> Result<Envelope> {
    unpack_raw(data)
}

pub fn pack_prekey_message(message: &PreKeySignalMessage) -> Result<Vec<u8>> {
    pack_raw(message)
}

pub fn unpack_prekey_message(data: &[u8]) -> Result<PreKeySignalMessage> {
    unpack_raw(data)
}

pub fn pack_signal_message(message: &SignalMessage) -> Result<Vec<u8>> {
    pack_raw(message)
}

pub fn unpack_signal_message(data: &[u8]) -> Result<SignalMessage> {
    unpack_raw(data)
}

pub fn pack_content(content: &Content) -> Result<Vec<u8>> {
    pack_raw(content)
}

pub fn unpack_content(data: &[u8]) -> Result<Content> {
    unpack_raw(data)
}
