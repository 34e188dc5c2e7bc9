// Исходящие сообщения, ещё не переданные транспорту
//
// Отмена возможна, пока сообщение не передано в Transport::send_envelope.
// Переход «передаётся» атомарен с проверкой отмены.

use crate::protocol::messages::MessageId;
use crate::utils::error::{SessionError, StorageError};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Queued,
    HandingOff,
    Cancelled,
}

#[derive(Debug)]
struct Entry {
    peer: String,
    phase: Phase,
}

#[derive(Default)]
pub struct Outbox {
    entries: Mutex<HashMap<MessageId, Entry>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<MutexGuard<'_, HashMap<MessageId, Entry>>, StorageError> {
        self.entries.lock().map_err(|_| StorageError::LockPoisoned)
    }

    pub fn register(&self, id: MessageId, peer: &str) -> Result<(), StorageError> {
        self.entries()?.insert(
            id,
            Entry {
                peer: peer.to_string(),
                phase: Phase::Queued,
            },
        );
        Ok(())
    }

    /// Начать передачу транспорту; ошибка `Cancelled`, если сообщение отменено
    pub fn begin_handoff(&self, id: MessageId) -> Result<(), SessionError> {
        let mut entries = self
            .entries()
            .map_err(|e| SessionError::Protocol(e.to_string()))?;
        match entries.get_mut(&id) {
            Some(entry) if entry.phase == Phase::Cancelled => Err(SessionError::Cancelled),
            Some(entry) => {
                entry.phase = Phase::HandingOff;
                Ok(())
            }
            None => Err(SessionError::Cancelled),
        }
    }

    /// Транспорт вернул ошибку: до следующей попытки сообщение снова можно отменить
    pub fn handoff_failed(&self, id: MessageId) {
        if let Ok(mut entries) = self.entries() {
            if let Some(entry) = entries.get_mut(&id) {
                if entry.phase == Phase::HandingOff {
                    entry.phase = Phase::Queued;
                }
            }
        }
    }

    pub fn is_cancelled(&self, id: MessageId) -> bool {
        self.entries()
            .map(|entries| {
                entries
                    .get(&id)
                    .map(|entry| entry.phase == Phase::Cancelled)
                    .unwrap_or(true)
            })
            .unwrap_or(true)
    }

    /// Отменить сообщение; false, если оно уже передаётся или завершено
    pub fn cancel(&self, id: MessageId) -> bool {
        let Ok(mut entries) = self.entries() else {
            return false;
        };
        match entries.get_mut(&id) {
            Some(entry) if entry.phase == Phase::Queued => {
                entry.phase = Phase::Cancelled;
                debug!(target: "pipeline", message_id = %id, "Send cancelled");
                true
            }
            _ => false,
        }
    }

    /// Отменить все ожидающие сообщения собеседнику (выход из разговора)
    pub fn cancel_peer(&self, peer: &str) -> usize {
        let Ok(mut entries) = self.entries() else {
            return 0;
        };
        let mut cancelled = 0;
        for entry in entries.values_mut() {
            if entry.peer == peer && entry.phase == Phase::Queued {
                entry.phase = Phase::Cancelled;
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn complete(&self, id: MessageId) {
        if let Ok(mut entries) = self.entries() {
            entries.remove(&id);
        }
    }

    pub fn pending(&self) -> usize {
        self.entries().map(|entries| entries.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_before_handoff() {
        let outbox = Outbox::new();
        let id = MessageId::new();
        outbox.register(id, "bob").unwrap();

        assert!(outbox.cancel(id));
        assert!(outbox.is_cancelled(id));
        assert_eq!(outbox.begin_handoff(id), Err(SessionError::Cancelled));
    }

    #[test]
    fn test_no_cancel_after_handoff() {
        let outbox = Outbox::new();
        let id = MessageId::new();
        outbox.register(id, "bob").unwrap();

        outbox.begin_handoff(id).unwrap();
        assert!(!outbox.cancel(id));

        // Неудачная попытка снова открывает окно отмены
        outbox.handoff_failed(id);
        assert!(outbox.cancel(id));

        outbox.complete(id);
        assert_eq!(outbox.pending(), 0);
    }

    #[test]
    fn test_cancel_peer() {
        let outbox = Outbox::new();
        let handed_off = MessageId::new();
        for id in [MessageId::new(), MessageId::new(), handed_off] {
            outbox.register(id, "bob").unwrap();
        }
        outbox.register(MessageId::new(), "carol").unwrap();
        outbox.begin_handoff(handed_off).unwrap();

        assert_eq!(outbox.cancel_peer("bob"), 2);
    }
}
