// Хранилище сессий
//
// Каждый адрес (peer, device) имеет свой слот под отдельным Mutex. Все
// операции с сессией одного адреса сериализуются через этот слот; разные
// адреса работают параллельно. Запись на диск происходит под тем же
// локом, сеть под ним никогда не вызывается (std MutexGuard не Send).

use super::{ActiveSession, SessionAddress, SessionEvent, SessionState};
use crate::crypto::messaging::RatchetLimits;
use crate::crypto::CryptoProvider;
use crate::storage::models::StoredSession;
use crate::storage::{get_record, namespaces, put_record, BlobStore, EncryptedStore};
use crate::utils::error::{CoreError, StorageError};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Снимок сессии без ключевого материала
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub address: SessionAddress,
    pub state: SessionState,
    pub remote_identity: Vec<u8>,
    pub remote_registration_id: u32,
    /// Меняется при каждой замене или удалении сессии по адресу
    pub generation: u64,
    pub created_at: i64,
    pub last_used: i64,
}

/// Слот одного адреса
pub struct SessionSlot<P: CryptoProvider> {
    session: Option<ActiveSession<P>>,
    generation: u64,
    loaded: bool,
    dirty: bool,
}

impl<P: CryptoProvider> SessionSlot<P> {
    fn empty() -> Self {
        Self {
            session: None,
            generation: 0,
            loaded: false,
            dirty: false,
        }
    }

    pub fn session(&self) -> Option<&ActiveSession<P>> {
        self.session.as_ref()
    }

    /// Доступ на изменение; слот будет записан после операции
    pub fn session_mut(&mut self) -> Option<&mut ActiveSession<P>> {
        if self.session.is_some() {
            self.dirty = true;
        }
        self.session.as_mut()
    }

    pub fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map(|s| s.state())
            .unwrap_or(SessionState::NoSession)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Установить новую сессию, вытеснив текущую
    ///
    /// Возвращает состояние вытесненной сессии.
    pub fn install(&mut self, session: ActiveSession<P>) -> Option<SessionState> {
        let previous = self.session.take().map(|mut old| {
            let state = old.state();
            if let Err(e) = old.apply(SessionEvent::Superseded) {
                debug!(target: "session::store", address = %old.address(), error = %e, "Replaced inactive session");
            }
            state
        });

        debug!(
            target: "session::store",
            address = %session.address(),
            state = %session.state(),
            generation = self.generation + 1,
            "Session installed"
        );
        self.session = Some(session);
        self.generation += 1;
        self.dirty = true;
        previous
    }

    /// Удалить сессию; true, если она была
    pub fn clear(&mut self) -> bool {
        let existed = self.session.take().is_some();
        if existed {
            self.generation += 1;
            self.dirty = true;
        }
        existed
    }

    fn info(&self) -> Option<SessionInfo> {
        self.session.as_ref().map(|s| SessionInfo {
            address: s.address().clone(),
            state: s.state(),
            remote_identity: s.remote_identity().to_vec(),
            remote_registration_id: s.remote_registration_id(),
            generation: self.generation,
            created_at: s.created_at(),
            last_used: s.last_used(),
        })
    }
}

type SharedSlot<P> = Arc<Mutex<SessionSlot<P>>>;

pub struct SessionStore<P: CryptoProvider> {
    store: Arc<EncryptedStore>,
    limits: RatchetLimits,
    // Слоты не удаляются из карты, поэтому generation монотонен в пределах процесса
    slots: RwLock<HashMap<SessionAddress, SharedSlot<P>>>,
}

impl<P: CryptoProvider> SessionStore<P> {
    pub fn new(store: Arc<EncryptedStore>, limits: RatchetLimits) -> Self {
        Self {
            store,
            limits,
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn limits(&self) -> RatchetLimits {
        self.limits
    }

    fn slot(&self, address: &SessionAddress) -> Result<SharedSlot<P>, StorageError> {
        {
            let slots = self.slots.read().map_err(|_| StorageError::LockPoisoned)?;
            if let Some(slot) = slots.get(address) {
                return Ok(Arc::clone(slot));
            }
        }

        let mut slots = self.slots.write().map_err(|_| StorageError::LockPoisoned)?;
        Ok(Arc::clone(
            slots
                .entry(address.clone())
                .or_insert_with(|| Arc::new(Mutex::new(SessionSlot::empty()))),
        ))
    }

    fn load(&self, address: &SessionAddress, slot: &mut SessionSlot<P>) -> Result<(), CoreError> {
        if slot.loaded {
            return Ok(());
        }

        let stored: Option<StoredSession> =
            get_record(self.store.as_ref(), namespaces::SESSIONS, &address.storage_key())?;
        slot.session = stored
            .map(|s| ActiveSession::from_stored(&s, self.limits))
            .transpose()?;
        slot.loaded = true;
        Ok(())
    }

    fn persist(&self, address: &SessionAddress, slot: &SessionSlot<P>) -> Result<(), CoreError> {
        let key = address.storage_key();
        match &slot.session {
            Some(session) => {
                let stored = session.to_stored()?;
                put_record(self.store.as_ref(), namespaces::SESSIONS, &key, &stored)?;
            }
            None => {
                self.store.delete(namespaces::SESSIONS, &key)?;
            }
        }
        Ok(())
    }

    /// Выполнить операцию над слотом адреса под его локом
    ///
    /// Если операция изменила слот, он записывается в хранилище до
    /// освобождения лока. При ошибке записи слот перечитывается с диска
    /// при следующем обращении.
    pub fn with_session<T, E>(
        &self,
        address: &SessionAddress,
        f: impl FnOnce(&mut SessionSlot<P>) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<CoreError>,
    {
        let slot = self.slot(address).map_err(CoreError::from)?;
        let mut slot = slot
            .lock()
            .map_err(|_| CoreError::from(StorageError::LockPoisoned))?;
        self.load(address, &mut *slot)?;

        let result = f(&mut *slot);

        if slot.dirty {
            slot.dirty = false;
            if let Err(e) = self.persist(address, &*slot) {
                warn!(target: "session::store", address = %address, error = %e, "Failed to persist session");
                slot.loaded = false;
                slot.session = None;
                return Err(e.into());
            }
        }
        result
    }

    pub fn get_session(&self, address: &SessionAddress) -> Result<Option<SessionInfo>, CoreError> {
        self.with_session(address, |slot| Ok::<_, CoreError>(slot.info()))
    }

    pub fn generation(&self, address: &SessionAddress) -> Result<u64, CoreError> {
        self.with_session(address, |slot| Ok::<_, CoreError>(slot.generation()))
    }

    /// Сохранить сессию, вытеснив существующую по тому же адресу
    pub fn put_session(&self, session: ActiveSession<P>) -> Result<Option<SessionState>, CoreError> {
        let address = session.address().clone();
        self.with_session(&address, |slot| Ok::<_, CoreError>(slot.install(session)))
    }

    /// Удалить сессию адреса
    ///
    /// Работает и для записи, которая не читается: повреждённую сессию
    /// можно только удалить.
    pub fn delete_session(&self, address: &SessionAddress) -> Result<bool, CoreError> {
        let slot = self.slot(address)?;
        let mut slot = slot.lock().map_err(|_| StorageError::LockPoisoned)?;

        let in_memory = slot.clear();
        slot.loaded = true;
        slot.dirty = false;
        let on_disk = self.store.delete(namespaces::SESSIONS, &address.storage_key())?;
        if on_disk && !in_memory {
            slot.generation += 1;
        }

        if in_memory || on_disk {
            info!(target: "session::store", address = %address, "Session deleted");
        }
        Ok(in_memory || on_disk)
    }

    /// Все адреса с сохранёнными или активными сессиями
    pub fn addresses(&self) -> Result<Vec<SessionAddress>, CoreError> {
        let mut addresses: BTreeSet<(String, u32)> = self
            .store
            .list(namespaces::SESSIONS)?
            .iter()
            .filter_map(|key| SessionAddress::from_storage_key(key))
            .map(|a| (a.peer, a.device))
            .collect();

        let loaded: Vec<SharedSlot<P>> = {
            let slots = self.slots.read().map_err(|_| StorageError::LockPoisoned)?;
            slots.values().cloned().collect()
        };
        for slot in loaded {
            let slot = slot.lock().map_err(|_| StorageError::LockPoisoned)?;
            if let Some(session) = slot.session() {
                let address = session.address();
                addresses.insert((address.peer.clone(), address.device));
            }
        }

        Ok(addresses
            .into_iter()
            .map(|(peer, device)| SessionAddress::new(peer, device))
            .collect())
    }

    /// Устройства собеседника, с которыми есть сессия
    pub fn sub_device_sessions(&self, peer: &str) -> Result<Vec<u32>, CoreError> {
        Ok(self
            .addresses()?
            .into_iter()
            .filter(|a| a.peer == peer)
            .map(|a| a.device)
            .collect())
    }

    /// Удалить сессии со всеми устройствами собеседника
    pub fn delete_all_sessions(&self, peer: &str) -> Result<usize, CoreError> {
        let mut removed = 0;
        for device in self.sub_device_sessions(peer)? {
            if self.delete_session(&SessionAddress::new(peer, device))? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Удалить устаревшие skipped message keys во всех сессиях
    ///
    /// Повреждённые записи пропускаются с предупреждением.
    pub fn cleanup_skipped_keys(&self, max_age_seconds: i64) -> Result<usize, CoreError> {
        let mut removed = 0;
        for address in self.addresses()? {
            let result = self.with_session(&address, |slot| {
                let has_skipped = slot
                    .session()
                    .map(|s| s.skipped_key_count() > 0)
                    .unwrap_or(false);
                let count = if has_skipped {
                    slot.session_mut()
                        .map(|s| s.cleanup_old_skipped_keys(max_age_seconds))
                        .unwrap_or(0)
                } else {
                    0
                };
                if count == 0 {
                    // Нечего записывать
                    slot.dirty = false;
                }
                Ok::<_, CoreError>(count)
            });

            match result {
                Ok(count) => removed += count,
                Err(e) => {
                    warn!(target: "session::store", address = %address, error = %e, "Skipped key cleanup failed")
                }
            }
        }

        if removed > 0 {
            debug!(target: "session::store", removed, "Expired skipped message keys removed");
        }
        Ok(removed)
    }

    /// Удалить все сессии (смена identity, wipe)
    pub fn delete_all(&self) -> Result<usize, CoreError> {
        let mut removed = 0;
        for address in self.addresses()? {
            if self.delete_session(&address)? {
                removed += 1;
            }
        }
        self.store.clear(namespaces::SESSIONS)?;
        Ok(removed)
    }

    /// Забыть загруженные сессии (после lock хранилища)
    pub fn evict_cache(&self) -> Result<(), CoreError> {
        let slots = self.slots.read().map_err(|_| StorageError::LockPoisoned)?;
        for slot in slots.values() {
            let mut slot = slot.lock().map_err(|_| StorageError::LockPoisoned)?;
            slot.session = None;
            slot.loaded = false;
            slot.dirty = false;
        }
        Ok(())
    }
}
