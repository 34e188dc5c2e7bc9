// In-memory хранилище для тестов и эфемерных профилей

use crate::storage::BlobStore;
use crate::utils::error::StorageError;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use zeroize::Zeroize;

/// In-memory хранилище
#[derive(Default)]
pub struct MemoryBlobStore {
    namespaces: RwLock<HashMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Общее число записей во всех namespaces
    pub fn len(&self) -> usize {
        self.namespaces
            .read()
            .map(|map| map.values().map(BTreeMap::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let map = self.namespaces.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(map.get(namespace).and_then(|ns| ns.get(key)).cloned())
    }

    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let mut map = self.namespaces.write().map_err(|_| StorageError::LockPoisoned)?;
        let previous = map
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        if let Some(mut old) = previous {
            old.zeroize();
        }
        Ok(())
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<bool, StorageError> {
        let mut map = self.namespaces.write().map_err(|_| StorageError::LockPoisoned)?;
        match map.get_mut(namespace).and_then(|ns| ns.remove(key)) {
            Some(mut old) => {
                old.zeroize();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn list(&self, namespace: &str) -> Result<Vec<String>, StorageError> {
        let map = self.namespaces.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(map
            .get(namespace)
            .map(|ns| ns.keys().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_storage_roundtrip() {
        let storage = MemoryBlobStore::new();
        assert!(storage.is_empty());

        storage.put("sessions", "alice.1", &[1, 2, 3]).unwrap();
        assert_eq!(storage.get("sessions", "alice.1").unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(storage.get("sessions", "alice.2").unwrap(), None);
        assert_eq!(storage.get("trust", "alice.1").unwrap(), None);

        storage.put("sessions", "alice.1", &[4]).unwrap();
        assert_eq!(storage.get("sessions", "alice.1").unwrap(), Some(vec![4]));
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn test_memory_storage_delete_and_list() {
        let storage = MemoryBlobStore::new();
        storage.put("sessions", "bob.2", b"b2").unwrap();
        storage.put("sessions", "bob.1", b"b1").unwrap();

        // BTreeMap: ключи отсортированы
        assert_eq!(
            storage.list("sessions").unwrap(),
            vec!["bob.1".to_string(), "bob.2".to_string()]
        );

        assert!(storage.delete("sessions", "bob.1").unwrap());
        assert!(!storage.delete("sessions", "bob.1").unwrap());
        assert_eq!(storage.list("sessions").unwrap(), vec!["bob.2".to_string()]);
        assert!(storage.list("unknown").unwrap().is_empty());
    }
}
