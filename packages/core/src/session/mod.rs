//! Сессии
//!
//! [`ActiveSession`] объединяет X3DH и Double Ratchet для одной пары
//! (peer, device) и несёт состояние из [`state::SessionState`]. Значение
//! `ActiveSession` существует только для активных сессий, поэтому
//! шифрование без сессии невозможно по построению: `NoSession` - это
//! отсутствие значения в слоте [`store::SessionStore`].

pub mod state;
pub mod store;

use crate::crypto::handshake::{KeyAgreement, PreKeyBundle, X3DHProtocol};
use crate::crypto::keys::IdentityPublic;
use crate::crypto::messaging::{DoubleRatchetSession, RatchetLimits, SecureMessaging};
use crate::crypto::CryptoProvider;
use crate::protocol::messages::{EnvelopeType, PreKeySignalMessage, SignalMessage};
use crate::protocol::wire::{pack_prekey_message, pack_signal_message};
use crate::storage::models::{StoredPendingPreKey, StoredSession, StoredSessionPhase};
use crate::utils::error::{CoreError, DecryptionError, SessionError, StorageError};
use crate::utils::logging::key_prefix;
use crate::utils::time::current_timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

pub use state::{SessionEvent, SessionState};
pub use store::{SessionInfo, SessionSlot, SessionStore};

/// Адрес сессии: собеседник и его устройство
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionAddress {
    pub peer: String,
    pub device: u32,
}

impl SessionAddress {
    pub fn new(peer: impl Into<String>, device: u32) -> Self {
        Self {
            peer: peer.into(),
            device,
        }
    }

    /// Ключ записи в хранилище
    pub(crate) fn storage_key(&self) -> String {
        format!("{}.{}", self.peer, self.device)
    }

    pub(crate) fn from_storage_key(key: &str) -> Option<Self> {
        let (peer, device) = key.rsplit_once('.')?;
        Some(Self::new(peer, device.parse().ok()?))
    }
}

impl fmt::Display for SessionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.peer, self.device)
    }
}

/// Зашифрованное содержимое envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ciphertext {
    pub envelope_type: EnvelopeType,
    pub body: Vec<u8>,
}

/// AD = IK_initiator || IK_responder
fn associated_data(initiator_identity: &[u8], responder_identity: &[u8]) -> Vec<u8> {
    let mut ad = Vec::with_capacity(initiator_identity.len() + responder_identity.len());
    ad.extend_from_slice(initiator_identity);
    ad.extend_from_slice(responder_identity);
    ad
}

/// Активная сессия с одним устройством собеседника
pub struct ActiveSession<P: CryptoProvider> {
    address: SessionAddress,
    state: SessionState,
    ratchet: DoubleRatchetSession<P>,
    /// Base key X3DH; по нему pre-key сообщение узнаёт «свою» сессию
    base_key: Vec<u8>,
    remote_identity: Vec<u8>,
    remote_registration_id: u32,
    /// Пока Some, исходящие сообщения уходят как pre-key
    pending_prekey: Option<StoredPendingPreKey>,
    created_at: i64,
    last_used: i64,
}

impl<P: CryptoProvider> Clone for ActiveSession<P> {
    fn clone(&self) -> Self {
        Self {
            address: self.address.clone(),
            state: self.state,
            ratchet: self.ratchet.clone(),
            base_key: self.base_key.clone(),
            remote_identity: self.remote_identity.clone(),
            remote_registration_id: self.remote_registration_id,
            pending_prekey: self.pending_prekey.clone(),
            created_at: self.created_at,
            last_used: self.last_used,
        }
    }
}

impl<P: CryptoProvider> ActiveSession<P> {
    /// Начать сессию по bundle собеседника (Alice)
    pub fn initiate(
        address: SessionAddress,
        local: &IdentityPublic,
        identity_private: &P::DhPrivateKey,
        bundle: &PreKeyBundle,
        limits: RatchetLimits,
    ) -> Result<Self, CoreError> {
        let state = SessionState::NoSession.transition(SessionEvent::InitiatorStarted)?;
        let (root_key, handshake) =
            X3DHProtocol::<P>::perform_as_initiator(identity_private, bundle)?;

        let ratchet = DoubleRatchetSession::new_initiator_session(
            &root_key,
            &handshake.remote_signed_prekey,
            associated_data(&local.identity_key, &bundle.identity_key),
            limits,
        )?;

        let base_key = handshake.base_key_public.as_ref().to_vec();
        info!(
            target: "session::store",
            address = %address,
            base_key = %key_prefix(&base_key),
            one_time_prekey = ?handshake.one_time_prekey_id,
            "Initiated session"
        );

        let now = current_timestamp();
        Ok(Self {
            address,
            state,
            ratchet,
            pending_prekey: Some(StoredPendingPreKey {
                base_key: base_key.clone(),
                signed_prekey_id: handshake.signed_prekey_id,
                one_time_prekey_id: handshake.one_time_prekey_id,
            }),
            base_key,
            remote_identity: bundle.identity_key.clone(),
            remote_registration_id: bundle.registration_id,
            created_at: now,
            last_used: now,
        })
    }

    /// Построить сессию из полученного pre-key сообщения (Bob)
    ///
    /// Сообщение внутри ещё не расшифровано: вызывающий код делает
    /// [`ActiveSession::decrypt`] и устанавливает сессию только при успехе.
    pub fn accept(
        address: SessionAddress,
        local: &IdentityPublic,
        identity_private: &P::DhPrivateKey,
        signed_prekey: P::DhPrivateKey,
        one_time_prekey: Option<&P::DhPrivateKey>,
        message: &PreKeySignalMessage,
        limits: RatchetLimits,
    ) -> Result<Self, CoreError> {
        let state = SessionState::NoSession.transition(SessionEvent::PreKeyAccepted)?;
        let remote_identity = P::dh_public_key_from_bytes(&message.identity_key)?;
        let remote_base_key = P::dh_public_key_from_bytes(&message.base_key)?;

        let root_key = X3DHProtocol::<P>::perform_as_responder(
            identity_private,
            &signed_prekey,
            one_time_prekey,
            &remote_identity,
            &remote_base_key,
        )?;

        let ratchet = DoubleRatchetSession::new_responder_session(
            &root_key,
            signed_prekey,
            associated_data(&message.identity_key, &local.identity_key),
            limits,
        )?;

        debug!(
            target: "session::store",
            address = %address,
            base_key = %key_prefix(&message.base_key),
            "Built responder session"
        );

        let now = current_timestamp();
        Ok(Self {
            address,
            state,
            ratchet,
            base_key: message.base_key.clone(),
            remote_identity: message.identity_key.clone(),
            remote_registration_id: message.registration_id,
            pending_prekey: None,
            created_at: now,
            last_used: now,
        })
    }

    pub fn address(&self) -> &SessionAddress {
        &self.address
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn base_key(&self) -> &[u8] {
        &self.base_key
    }

    pub fn remote_identity(&self) -> &[u8] {
        &self.remote_identity
    }

    pub fn remote_registration_id(&self) -> u32 {
        self.remote_registration_id
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn last_used(&self) -> i64 {
        self.last_used
    }

    pub fn skipped_key_count(&self) -> usize {
        self.ratchet.skipped_key_count()
    }

    pub fn apply(&mut self, event: SessionEvent) -> Result<SessionState, SessionError> {
        self.state = self.state.transition(event)?;
        Ok(self.state)
    }

    /// Зашифровать сообщение, продвинув sending chain на один шаг
    ///
    /// До первого ответа собеседника результат - pre-key сообщение.
    pub fn encrypt(&mut self, local: &IdentityPublic, plaintext: &[u8]) -> Result<Ciphertext, SessionError> {
        let next_state = self.state.transition(SessionEvent::MessageSent)?;

        // Ratchet продвигается на копии: если упаковка не удалась, ключ не потерян
        let mut staged = self.ratchet.clone();
        let message = staged.encrypt(plaintext)?;

        let ciphertext = match &self.pending_prekey {
            Some(pending) => {
                let prekey_message = PreKeySignalMessage {
                    registration_id: local.registration_id,
                    signed_prekey_id: pending.signed_prekey_id,
                    one_time_prekey_id: pending.one_time_prekey_id,
                    base_key: pending.base_key.clone(),
                    identity_key: local.identity_key.clone(),
                    verifying_key: local.verifying_key.clone(),
                    message,
                };
                Ciphertext {
                    envelope_type: EnvelopeType::PreKeyBundle,
                    body: pack_prekey_message(&prekey_message)
                        .map_err(|e| SessionError::Protocol(e.to_string()))?,
                }
            }
            None => Ciphertext {
                envelope_type: EnvelopeType::Ciphertext,
                body: pack_signal_message(&message)
                    .map_err(|e| SessionError::Protocol(e.to_string()))?,
            },
        };

        self.ratchet = staged;
        self.state = next_state;
        self.last_used = current_timestamp();
        Ok(ciphertext)
    }

    /// Расшифровать сообщение; при ошибке сессия не меняется
    pub fn decrypt(&mut self, message: &SignalMessage) -> Result<Vec<u8>, DecryptionError> {
        let next_state = self.state.transition(SessionEvent::MessageReceived)?;
        let plaintext = self.ratchet.decrypt(message)?;

        if self.state == SessionState::Pending {
            debug!(target: "session::store", address = %self.address, "First reply received, session established");
        }
        self.state = next_state;
        self.pending_prekey = None;
        self.last_used = current_timestamp();
        Ok(plaintext)
    }

    /// Удалить skipped message keys старше `max_age_seconds`
    pub fn cleanup_old_skipped_keys(&mut self, max_age_seconds: i64) -> usize {
        self.ratchet.cleanup_old_skipped_keys(max_age_seconds)
    }

    pub(crate) fn to_stored(&self) -> Result<StoredSession, SessionError> {
        let phase = match self.state {
            SessionState::Pending => StoredSessionPhase::Pending,
            SessionState::Established => StoredSessionPhase::Established,
            other => {
                return Err(SessionError::InvalidTransition {
                    from: other.name(),
                    event: "persist",
                })
            }
        };

        Ok(StoredSession {
            peer: self.address.peer.clone(),
            device: self.address.device,
            phase,
            base_key: self.base_key.clone(),
            remote_identity: self.remote_identity.clone(),
            remote_registration_id: self.remote_registration_id,
            pending_prekey: self.pending_prekey.clone(),
            ratchet: self.ratchet.to_serializable(),
            created_at: self.created_at,
            last_used: self.last_used,
        })
    }

    pub(crate) fn from_stored(stored: &StoredSession, limits: RatchetLimits) -> Result<Self, CoreError> {
        let ratchet = DoubleRatchetSession::from_serializable(&stored.ratchet, limits)
            .map_err(|e| StorageError::Corrupted {
                key: format!("{}.{}", stored.peer, stored.device),
                reason: e.to_string(),
            })?;

        Ok(Self {
            address: SessionAddress::new(stored.peer.clone(), stored.device),
            state: match stored.phase {
                StoredSessionPhase::Pending => SessionState::Pending,
                StoredSessionPhase::Established => SessionState::Established,
            },
            ratchet,
            base_key: stored.base_key.clone(),
            remote_identity: stored.remote_identity.clone(),
            remote_registration_id: stored.remote_registration_id,
            pending_prekey: stored.pending_prekey.clone(),
            created_at: stored.created_at,
            last_used: stored.last_used,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{limits, party};
    use super::*;
    use crate::crypto::suites::classic::ClassicSuiteProvider as Suite;
    use crate::protocol::wire::{unpack_prekey_message, unpack_signal_message};

    #[test]
    fn test_pending_until_first_reply() {
        let alice = party(1);
        let bob = party(2);

        let mut alice_session = ActiveSession::<Suite>::initiate(
            SessionAddress::new("bob", 1),
            &alice.public,
            &alice.identity_private,
            &bob.bundle,
            limits(),
        )
        .unwrap();
        assert_eq!(alice_session.state(), SessionState::Pending);

        // Пока нет ответа, каждое сообщение - pre-key
        let first = alice_session.encrypt(&alice.public, b"one").unwrap();
        let second = alice_session.encrypt(&alice.public, b"two").unwrap();
        assert_eq!(first.envelope_type, EnvelopeType::PreKeyBundle);
        assert_eq!(second.envelope_type, EnvelopeType::PreKeyBundle);

        let prekey_message = unpack_prekey_message(&first.body).unwrap();
        assert_eq!(prekey_message.one_time_prekey_id, Some(10));
        assert_eq!(prekey_message.base_key, alice_session.base_key());

        let mut bob_session = ActiveSession::<Suite>::accept(
            SessionAddress::new("alice", 1),
            &bob.public,
            &bob.identity_private,
            bob.spk_private.clone(),
            Some(&bob.otpk_private),
            &prekey_message,
            limits(),
        )
        .unwrap();
        assert_eq!(bob_session.decrypt(&prekey_message.message).unwrap(), b"one");
        assert_eq!(bob_session.state(), SessionState::Established);

        let reply = bob_session.encrypt(&bob.public, b"hi alice").unwrap();
        assert_eq!(reply.envelope_type, EnvelopeType::Ciphertext);
        let reply = unpack_signal_message(&reply.body).unwrap();
        assert_eq!(alice_session.decrypt(&reply).unwrap(), b"hi alice");
        assert_eq!(alice_session.state(), SessionState::Established);

        let third = alice_session.encrypt(&alice.public, b"three").unwrap();
        assert_eq!(third.envelope_type, EnvelopeType::Ciphertext);
    }

    #[test]
    fn test_stored_roundtrip_keeps_state() {
        let alice = party(1);
        let bob = party(2);
        let mut session = ActiveSession::<Suite>::initiate(
            SessionAddress::new("bob", 1),
            &alice.public,
            &alice.identity_private,
            &bob.bundle,
            limits(),
        )
        .unwrap();
        session.encrypt(&alice.public, b"x").unwrap();

        let stored = session.to_stored().unwrap();
        let restored = ActiveSession::<Suite>::from_stored(&stored, limits()).unwrap();
        assert_eq!(restored.state(), SessionState::Pending);
        assert_eq!(restored.base_key(), session.base_key());
        assert_eq!(restored.address(), session.address());
    }

    #[test]
    fn test_reset_pending_session_is_not_persisted() {
        let alice = party(1);
        let bob = party(2);
        let mut session = ActiveSession::<Suite>::initiate(
            SessionAddress::new("bob", 1),
            &alice.public,
            &alice.identity_private,
            &bob.bundle,
            limits(),
        )
        .unwrap();
        session.apply(SessionEvent::ResetRequested).unwrap();
        assert!(session.to_stored().is_err());
    }

    #[test]
    fn test_storage_key_parsing() {
        let address = SessionAddress::new("user.name", 3);
        assert_eq!(
            SessionAddress::from_storage_key(&address.storage_key()),
            Some(address)
        );
        assert_eq!(SessionAddress::from_storage_key("nodevice"), None);
    }
}
