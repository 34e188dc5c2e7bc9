// Доверие к identity собеседников
//
//   Untrusted(New) ──ExchangeCompleted──▶ AcceptedImplicitly
//        │                                      │
//        └──────SafetyNumberVerified──▶ UserVerified
//
//   любое состояние ──IdentityChanged──▶ Untrusted(Changed)
//   Untrusted(Changed) ──UserConfirmed──▶ AcceptedImplicitly
//
// Смена ключа никогда не проходит молча: из Untrusted(Changed) выводит
// только явное действие пользователя.

use crate::crypto::fingerprint::{fingerprint_key, SafetyNumber};
use crate::crypto::keys::IdentityPublic;
use crate::storage::models::StoredTrustRecord;
use crate::storage::{get_record, namespaces, put_record, BlobStore, EncryptedStore};
use crate::utils::error::{CoreError, StorageError};
use crate::utils::logging::key_prefix;
use crate::utils::time::current_timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UntrustedReason {
    /// Identity впервые увидена
    New,
    /// Identity сменилась по сравнению с сохранённой
    Changed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrustState {
    Untrusted(UntrustedReason),
    /// Пользователь сравнил safety number
    UserVerified,
    /// Переписка без проверки (поведение по умолчанию)
    AcceptedImplicitly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustEvent {
    ExchangeCompleted,
    UserConfirmed,
    SafetyNumberVerified,
    IdentityChanged,
}

impl TrustState {
    pub fn transition(self, event: TrustEvent) -> TrustState {
        use TrustEvent as E;
        use TrustState as S;

        match (self, event) {
            (_, E::IdentityChanged) => S::Untrusted(UntrustedReason::Changed),
            (_, E::SafetyNumberVerified) => S::UserVerified,

            (S::Untrusted(UntrustedReason::New), E::ExchangeCompleted) => S::AcceptedImplicitly,
            (S::Untrusted(UntrustedReason::Changed), E::ExchangeCompleted) => self,
            (S::UserVerified | S::AcceptedImplicitly, E::ExchangeCompleted) => self,

            (S::UserVerified, E::UserConfirmed) => S::UserVerified,
            (S::Untrusted(_) | S::AcceptedImplicitly, E::UserConfirmed) => S::AcceptedImplicitly,
        }
    }

    /// Можно ли шифровать для собеседника без подтверждения
    pub fn allows_send(&self) -> bool {
        !matches!(self, TrustState::Untrusted(UntrustedReason::Changed))
    }

    pub fn name(&self) -> &'static str {
        match self {
            TrustState::Untrusted(UntrustedReason::New) => "untrusted-new",
            TrustState::Untrusted(UntrustedReason::Changed) => "untrusted-changed",
            TrustState::UserVerified => "user-verified",
            TrustState::AcceptedImplicitly => "accepted-implicitly",
        }
    }
}

impl fmt::Display for TrustState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Результат сравнения увиденной identity с сохранённой
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityChange {
    NewOrUnchanged,
    ReplacedExisting,
}

/// Записи доверия по собеседникам (TOFU)
///
/// Один собеседник = одна identity на все его устройства.
pub struct TrustStore {
    store: Arc<EncryptedStore>,
    // Сериализует read-modify-write записей
    guard: Mutex<()>,
}

impl TrustStore {
    pub fn new(store: Arc<EncryptedStore>) -> Self {
        Self {
            store,
            guard: Mutex::new(()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, StorageError> {
        self.guard.lock().map_err(|_| StorageError::LockPoisoned)
    }

    fn load(&self, peer: &str) -> Result<Option<StoredTrustRecord>, StorageError> {
        get_record(self.store.as_ref(), namespaces::TRUST, peer)
    }

    fn save(&self, peer: &str, record: &StoredTrustRecord) -> Result<(), StorageError> {
        put_record(self.store.as_ref(), namespaces::TRUST, peer, record)
    }

    fn apply(&self, peer: &str, event: TrustEvent) -> Result<TrustState, CoreError> {
        let _guard = self.lock()?;
        let mut record = self
            .load(peer)?
            .ok_or_else(|| CoreError::NotFound(format!("No identity recorded for {}", peer)))?;

        let next = record.state.transition(event);
        if next != record.state {
            debug!(target: "trust", peer = %peer, from = %record.state, to = %next, "Trust state changed");
            if next == TrustState::UserVerified {
                record.verified_at = Some(current_timestamp());
            }
            record.state = next;
            self.save(peer, &record)?;
        }
        Ok(next)
    }

    /// Сверить identity из сообщения или bundle с сохранённой
    ///
    /// Новая identity запоминается как `Untrusted(New)`. Отличающаяся
    /// заменяет сохранённую и переводит собеседника в `Untrusted(Changed)`.
    pub fn observe_identity(
        &self,
        peer: &str,
        identity_key: &[u8],
        verifying_key: &[u8],
    ) -> Result<IdentityChange, CoreError> {
        let _guard = self.lock()?;
        let now = current_timestamp();

        match self.load(peer)? {
            None => {
                let record = StoredTrustRecord {
                    identity_key: identity_key.to_vec(),
                    verifying_key: verifying_key.to_vec(),
                    state: TrustState::Untrusted(UntrustedReason::New),
                    first_seen: now,
                    changed_at: None,
                    verified_at: None,
                };
                self.save(peer, &record)?;
                debug!(target: "trust", peer = %peer, identity = %key_prefix(identity_key), "New identity recorded");
                Ok(IdentityChange::NewOrUnchanged)
            }
            Some(record)
                if record.identity_key == identity_key && record.verifying_key == verifying_key =>
            {
                Ok(IdentityChange::NewOrUnchanged)
            }
            Some(mut record) => {
                warn!(
                    target: "trust",
                    peer = %peer,
                    previous = %key_prefix(&record.identity_key),
                    current = %key_prefix(identity_key),
                    was = %record.state,
                    "Identity key changed"
                );
                record.identity_key = identity_key.to_vec();
                record.verifying_key = verifying_key.to_vec();
                record.state = record.state.transition(TrustEvent::IdentityChanged);
                record.changed_at = Some(now);
                record.verified_at = None;
                self.save(peer, &record)?;
                Ok(IdentityChange::ReplacedExisting)
            }
        }
    }

    pub fn trust_state(&self, peer: &str) -> Result<Option<TrustState>, CoreError> {
        Ok(self.load(peer)?.map(|r| r.state))
    }

    pub fn record(&self, peer: &str) -> Result<Option<StoredTrustRecord>, CoreError> {
        Ok(self.load(peer)?)
    }

    /// Неизвестный собеседник допускается: его identity придёт с bundle
    pub fn is_trusted_for_send(&self, peer: &str) -> Result<bool, CoreError> {
        Ok(self
            .load(peer)?
            .map(|r| r.state.allows_send())
            .unwrap_or(true))
    }

    /// Успешный обмен сообщениями
    pub fn note_exchange(&self, peer: &str) -> Result<TrustState, CoreError> {
        self.apply(peer, TrustEvent::ExchangeCompleted)
    }

    /// Пользователь принял текущую identity собеседника
    pub fn confirm_identity(&self, peer: &str) -> Result<TrustState, CoreError> {
        let state = self.apply(peer, TrustEvent::UserConfirmed)?;
        info!(target: "trust", peer = %peer, state = %state, "Identity confirmed by user");
        Ok(state)
    }

    pub fn mark_verified(&self, peer: &str) -> Result<TrustState, CoreError> {
        let state = self.apply(peer, TrustEvent::SafetyNumberVerified)?;
        info!(target: "trust", peer = %peer, "Safety number verified");
        Ok(state)
    }

    /// Safety number для пары (локальная identity, сохранённая identity собеседника)
    pub fn safety_number(
        &self,
        local_id: &str,
        local: &IdentityPublic,
        peer: &str,
    ) -> Result<SafetyNumber, CoreError> {
        let record = self
            .load(peer)?
            .ok_or_else(|| CoreError::NotFound(format!("No identity recorded for {}", peer)))?;

        Ok(SafetyNumber::compute(
            local_id,
            &fingerprint_key(&local.identity_key, &local.verifying_key),
            peer,
            &fingerprint_key(&record.identity_key, &record.verifying_key),
        ))
    }

    /// Сравнить safety number, введённый или отсканированный пользователем
    ///
    /// При совпадении собеседник становится `UserVerified`.
    pub fn verify_safety_number(
        &self,
        local_id: &str,
        local: &IdentityPublic,
        peer: &str,
        candidate: &str,
    ) -> Result<bool, CoreError> {
        if !self.safety_number(local_id, local, peer)?.matches(candidate) {
            warn!(target: "trust", peer = %peer, "Safety number mismatch");
            return Ok(false);
        }
        self.mark_verified(peer)?;
        Ok(true)
    }

    pub fn forget(&self, peer: &str) -> Result<bool, CoreError> {
        let _guard = self.lock()?;
        Ok(self.store.delete(namespaces::TRUST, peer)?)
    }

    pub fn wipe(&self) -> Result<usize, CoreError> {
        let _guard = self.lock()?;
        Ok(self.store.clear(namespaces::TRUST)?)
    }
}
