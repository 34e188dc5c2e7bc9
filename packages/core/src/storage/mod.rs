// Модуль хранилища
//
// BlobStore - плоское key-value хранилище, разбитое на namespaces.
// Реализации: MemoryBlobStore (тесты), FileBlobStore (диск).
// EncryptedStore оборачивает любую из них и шифрует значения.

pub mod encrypted;
pub mod file;
pub mod memory;
pub mod models;

use crate::utils::error::StorageError;
use serde::{de::DeserializeOwned, Serialize};

pub use encrypted::EncryptedStore;
pub use file::FileBlobStore;
pub use memory::MemoryBlobStore;
pub use models::StorageEncryption;

/// Namespaces, которые использует ядро
pub mod namespaces {
    pub const IDENTITY: &str = "identity";
    pub const SESSIONS: &str = "sessions";
    pub const TRUST: &str = "trust";
    pub const META: &str = "meta";

    pub const ALL: [&str; 4] = [IDENTITY, SESSIONS, TRUST, META];
}

/// Key-value хранилище бинарных записей
///
/// Операции синхронные: хранилище локальное, и сессии пишутся прямо под
/// per-address lock без перехода через await.
pub trait BlobStore: Send + Sync {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Возвращает true, если запись существовала
    fn delete(&self, namespace: &str, key: &str) -> Result<bool, StorageError>;

    fn list(&self, namespace: &str) -> Result<Vec<String>, StorageError>;

    /// Удалить все записи namespace, возвращает их число
    fn clear(&self, namespace: &str) -> Result<usize, StorageError> {
        let keys = self.list(namespace)?;
        let mut removed = 0;
        for key in keys {
            if self.delete(namespace, &key)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Записать serde-значение (bincode)
pub fn put_record<S, T>(store: &S, namespace: &str, key: &str, value: &T) -> Result<(), StorageError>
where
    S: BlobStore + ?Sized,
    T: Serialize,
{
    let bytes = bincode::serialize(value).map_err(|e| StorageError::Corrupted {
        key: format!("{}/{}", namespace, key),
        reason: e.to_string(),
    })?;
    store.put(namespace, key, &bytes)
}

/// Прочитать serde-значение; запись, которая не декодируется, считается повреждённой
pub fn get_record<S, T>(store: &S, namespace: &str, key: &str) -> Result<Option<T>, StorageError>
where
    S: BlobStore + ?Sized,
    T: DeserializeOwned,
{
    match store.get(namespace, key)? {
        Some(bytes) => bincode::deserialize(&bytes)
            .map(Some)
            .map_err(|e| StorageError::Corrupted {
                key: format!("{}/{}", namespace, key),
                reason: e.to_string(),
            }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        id: u32,
        name: String,
    }

    #[test]
    fn test_typed_records() {
        let store = MemoryBlobStore::new();
        let record = Record {
            id: 7,
            name: "alice".into(),
        };

        put_record(&store, namespaces::TRUST, "alice", &record).unwrap();
        let loaded: Option<Record> = get_record(&store, namespaces::TRUST, "alice").unwrap();
        assert_eq!(loaded, Some(record));

        let missing: Option<Record> = get_record(&store, namespaces::TRUST, "bob").unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_garbage_is_reported_as_corrupted() {
        let store = MemoryBlobStore::new();
        store.put(namespaces::TRUST, "alice", &[0xFF]).unwrap();

        let result: Result<Option<Record>, _> = get_record(&store, namespaces::TRUST, "alice");
        assert!(matches!(result, Err(StorageError::Corrupted { .. })));
    }

    #[test]
    fn test_clear_namespace() {
        let store = MemoryBlobStore::new();
        store.put(namespaces::SESSIONS, "a.1", b"1").unwrap();
        store.put(namespaces::SESSIONS, "a.2", b"2").unwrap();
        store.put(namespaces::TRUST, "a", b"t").unwrap();

        assert_eq!(store.clear(namespaces::SESSIONS).unwrap(), 2);
        assert!(store.list(namespaces::SESSIONS).unwrap().is_empty());
        assert_eq!(store.list(namespaces::TRUST).unwrap(), vec!["a".to_string()]);
    }
}
