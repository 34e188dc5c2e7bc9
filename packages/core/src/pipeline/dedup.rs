// Защита от повторной расшифровки одного envelope
//
// Ключ - (sender, device, timestamp). Проверка и запись делаются под
// локом сессии отправителя, поэтому check-then-insert атомарен для адреса.

use lru::LruCache;
use std::num::NonZeroUsize;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub sender: String,
    pub device: u32,
    pub timestamp: u64,
}

impl DedupKey {
    pub fn new(sender: impl Into<String>, device: u32, timestamp: u64) -> Self {
        Self {
            sender: sender.into(),
            device,
            timestamp,
        }
    }
}

/// Ограниченный кеш уже расшифрованных envelope
pub struct DedupCache {
    seen: LruCache<DedupKey, ()>,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    pub fn contains(&self, key: &DedupKey) -> bool {
        self.seen.contains(key)
    }

    /// Запомнить envelope; false, если он уже был
    pub fn insert(&mut self, key: DedupKey) -> bool {
        self.seen.put(key, ()).is_none()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_detection() {
        let mut cache = DedupCache::new(8);
        let key = DedupKey::new("alice", 1, 1000);

        assert!(!cache.contains(&key));
        assert!(cache.insert(key.clone()));
        assert!(cache.contains(&key));
        assert!(!cache.insert(key));

        // Другое устройство с тем же timestamp - другое сообщение
        assert!(!cache.contains(&DedupKey::new("alice", 2, 1000)));
    }

    #[test]
    fn test_oldest_entries_are_evicted() {
        let mut cache = DedupCache::new(2);
        cache.insert(DedupKey::new("alice", 1, 1));
        cache.insert(DedupKey::new("alice", 1, 2));
        cache.insert(DedupKey::new("alice", 1, 3));

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&DedupKey::new("alice", 1, 1)));
        assert!(cache.contains(&DedupKey::new("alice", 1, 3)));
    }
}
