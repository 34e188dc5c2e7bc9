// Message pipeline: encrypt / decrypt поверх хранилища сессий
//
// Вся работа с ratchet идёт под локом адреса в SessionStore. Pipeline сам
// не ходит в сеть: bundles приносит и envelope отправляет слой api.
//
// Порядок локов: слот сессии → (identity | dedup | trust). Обратного
// порядка нет нигде.

pub mod dedup;
pub mod outbox;

use crate::crypto::handshake::PreKeyBundle;
use crate::crypto::keys::{IdentityKeyStore, IdentityPublic};
use crate::crypto::CryptoProvider;
use crate::protocol::messages::{Content, Envelope, EnvelopeType, PreKeySignalMessage, SignalMessage};
use crate::protocol::validation::{
    validate_bundle, validate_envelope, validate_prekey_message, validate_signal_message,
};
use crate::protocol::wire::{pack_content, unpack_content, unpack_prekey_message, unpack_signal_message};
use crate::session::{ActiveSession, Ciphertext, SessionAddress, SessionEvent, SessionSlot, SessionStore};
use crate::trust::{IdentityChange, TrustState, TrustStore, UntrustedReason};
use crate::utils::error::{CoreError, DecryptionError, SessionError, StorageError};
use crate::utils::logging::key_prefix;
use dedup::{DedupCache, DedupKey};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

pub use outbox::Outbox;

/// Зашифрованное сообщение для одного устройства
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedMessage {
    pub address: SessionAddress,
    pub ciphertext: Ciphertext,
    /// Generation сессии на момент шифрования; смена означает сброс сессии
    pub generation: u64,
}

/// Расшифрованное входящее сообщение
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub address: SessionAddress,
    pub timestamp: u64,
    pub content: Content,
    /// Состояние доверия к отправителю после обработки
    pub trust: Option<TrustState>,
    /// Сообщение принесло новую identity отправителя
    pub identity_changed: bool,
}

impl ReceivedMessage {
    /// Identity отправителя сменилась и не подтверждена пользователем
    pub fn is_suspect(&self) -> bool {
        !self.trust.map(|t| t.allows_send()).unwrap_or(false)
    }
}

/// Результат расшифровки под локом слота
struct Opened {
    content: Content,
    /// Identity, на которой построена сессия отправителя
    remote_identity: Vec<u8>,
    identity_changed: bool,
}

fn invalid_message(e: CoreError) -> CoreError {
    DecryptionError::InvalidMessage(e.to_string()).into()
}

/// Ошибки сессии на пути расшифровки - это ошибки расшифровки
///
/// Ссылка на неизвестный или израсходованный pre-key - признак replay или
/// рассинхрона, о нём предупреждает trust.
fn as_decryption_error(address: &SessionAddress, e: CoreError) -> CoreError {
    let e = match e {
        CoreError::Session(e) => CoreError::from(DecryptionError::Session(e)),
        other => other,
    };
    if let CoreError::Decryption(DecryptionError::Session(
        SessionError::PreKeyNotFound(id) | SessionError::PreKeyAlreadyUsed(id),
    )) = &e
    {
        warn!(target: "trust", address = %address, prekey_id = id, error = %e, "Pre-key message references an unavailable pre-key");
    }
    e
}

pub struct MessagePipeline<P: CryptoProvider> {
    local_address: String,
    keys: Arc<IdentityKeyStore<P>>,
    sessions: Arc<SessionStore<P>>,
    trust: Arc<TrustStore>,
    dedup: Mutex<DedupCache>,
}

impl<P: CryptoProvider> MessagePipeline<P> {
    pub fn new(
        local_address: impl Into<String>,
        keys: Arc<IdentityKeyStore<P>>,
        sessions: Arc<SessionStore<P>>,
        trust: Arc<TrustStore>,
        dedup_capacity: usize,
    ) -> Self {
        Self {
            local_address: local_address.into(),
            keys,
            sessions,
            trust,
            dedup: Mutex::new(DedupCache::new(dedup_capacity)),
        }
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    pub fn sessions(&self) -> &Arc<SessionStore<P>> {
        &self.sessions
    }

    pub fn trust(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    pub fn keys(&self) -> &Arc<IdentityKeyStore<P>> {
        &self.keys
    }

    // ============================================
    // ИСХОДЯЩИЕ
    // ============================================

    /// Построить сессию по bundle собеседника
    ///
    /// Возвращает false, если сессия с той же identity уже есть (её построил
    /// параллельный вызов или входящее pre-key сообщение). Сессия со старой
    /// identity заменяется.
    pub fn establish(&self, address: &SessionAddress, bundle: &PreKeyBundle) -> Result<bool, CoreError> {
        validate_bundle(bundle)?;
        if bundle.device_id != address.device {
            return Err(CoreError::ValidationError(format!(
                "Bundle is for device {}, expected {}",
                bundle.device_id, address.device
            )));
        }

        let change =
            self.trust
                .observe_identity(&address.peer, &bundle.identity_key, &bundle.verifying_key)?;
        if change == IdentityChange::ReplacedExisting {
            warn!(target: "pipeline", address = %address, "Directory returned a different identity key");
        }
        if !self.trust.is_trusted_for_send(&address.peer)? {
            return Err(SessionError::UntrustedIdentity(address.peer.clone()).into());
        }

        let local = self.keys.local_identity()?;
        let identity_private = self.keys.identity_private()?;
        let limits = self.sessions.limits();

        self.sessions.with_session(address, |slot| {
            let same_identity = slot
                .session()
                .map(|s| s.remote_identity() == bundle.identity_key.as_slice())
                .unwrap_or(false);
            if same_identity && slot.state().can_encrypt() {
                return Ok(false);
            }
            let session =
                ActiveSession::<P>::initiate(address.clone(), &local, &identity_private, bundle, limits)?;
            slot.install(session);
            Ok::<_, CoreError>(true)
        })
    }

    /// Зашифровать plaintext для одного устройства собеседника
    ///
    /// Сессия должна существовать. Собеседник в `Untrusted(Changed)`
    /// получает отказ до подтверждения identity, как и сессия, построенная
    /// не на той identity, что записана в trust.
    pub fn encrypt(&self, address: &SessionAddress, plaintext: &[u8]) -> Result<SealedMessage, CoreError> {
        let record = self.trust.record(&address.peer)?;
        if !record.as_ref().map(|r| r.state.allows_send()).unwrap_or(true) {
            warn!(target: "pipeline", address = %address, "Refusing to encrypt for unconfirmed identity");
            return Err(SessionError::UntrustedIdentity(address.peer.clone()).into());
        }

        let local = self.keys.local_identity()?;
        let sealed = self.sessions.with_session(address, |slot| {
            let generation = slot.generation();
            if let (Some(session), Some(record)) = (slot.session(), record.as_ref()) {
                if session.remote_identity() != record.identity_key.as_slice() {
                    warn!(target: "pipeline", address = %address, "Session identity differs from the recorded one");
                    return Err(CoreError::from(SessionError::UntrustedIdentity(address.peer.clone())));
                }
            }
            let session = slot.session_mut().ok_or_else(|| SessionError::NoSession {
                peer: address.peer.clone(),
                device: address.device,
            })?;
            let ciphertext = session.encrypt(&local, plaintext)?;
            Ok::<_, CoreError>(SealedMessage {
                address: address.clone(),
                ciphertext,
                generation,
            })
        })?;

        self.note_exchange(&address.peer);
        debug!(
            target: "pipeline",
            address = %address,
            envelope_type = ?sealed.ciphertext.envelope_type,
            size = sealed.ciphertext.body.len(),
            "Encrypted message"
        );
        Ok(sealed)
    }

    pub fn encrypt_content(&self, address: &SessionAddress, content: &Content) -> Result<SealedMessage, CoreError> {
        self.encrypt(address, &pack_content(content)?)
    }

    /// Обернуть шифротекст в envelope
    pub fn envelope(&self, local: &IdentityPublic, sealed: &SealedMessage, timestamp: u64) -> Envelope {
        Envelope {
            envelope_type: sealed.ciphertext.envelope_type,
            source: self.local_address.clone(),
            source_device: local.device_id,
            destination: sealed.address.peer.clone(),
            destination_device: sealed.address.device,
            timestamp,
            content: sealed.ciphertext.body.clone(),
            urgent: true,
        }
    }

    /// Сбросить сессию с устройством
    ///
    /// Если сессия была активна, возвращает end-session уведомление,
    /// зашифрованное ещё старой сессией. Локальная сессия удаляется в
    /// любом случае; следующая отправка начнёт новый X3DH.
    pub fn reset_session(&self, address: &SessionAddress) -> Result<Option<SealedMessage>, CoreError> {
        let local = self.keys.local_identity()?;
        let notice = pack_content(&Content::EndSession)?;

        let sealed = self.sessions.with_session(address, |slot| {
            let generation = slot.generation();
            let ciphertext = match slot.session_mut() {
                Some(session) if session.state().can_encrypt() => {
                    match seal_end_session(session, &local, &notice) {
                        Ok(ciphertext) => Some(ciphertext),
                        Err(e) => {
                            warn!(target: "pipeline", address = %address, error = %e, "Could not encrypt end-session notice");
                            None
                        }
                    }
                }
                _ => None,
            };
            slot.clear();

            Ok::<_, CoreError>(ciphertext.map(|ciphertext| SealedMessage {
                address: address.clone(),
                ciphertext,
                generation,
            }))
        })?;

        info!(target: "pipeline", address = %address, notice = sealed.is_some(), "Session reset");
        Ok(sealed)
    }

    // ============================================
    // ВХОДЯЩИЕ
    // ============================================

    /// Расшифровать envelope
    ///
    /// Ошибки терминальны для сообщения: повтор того же envelope даёт
    /// `DuplicateMessage`, а не повторную расшифровку.
    pub fn decrypt(&self, envelope: &Envelope) -> Result<ReceivedMessage, CoreError> {
        validate_envelope(envelope).map_err(invalid_message)?;
        let address = SessionAddress::new(envelope.source.clone(), envelope.source_device);
        let key = DedupKey::new(envelope.source.clone(), envelope.source_device, envelope.timestamp);

        let opened = match envelope.envelope_type {
            EnvelopeType::PreKeyBundle => {
                let message = unpack_prekey_message(&envelope.content).map_err(invalid_message)?;
                validate_prekey_message(&message).map_err(invalid_message)?;

                self.sessions
                    .with_session(&address, |slot| {
                        self.check_duplicate(&key)?;
                        let opened = self.decrypt_prekey(slot, &address, &message)?;
                        self.remember(key.clone())?;
                        Ok::<_, CoreError>(opened)
                    })
                    .map_err(|e| as_decryption_error(&address, e))?
            }
            EnvelopeType::Ciphertext => {
                let message = unpack_signal_message(&envelope.content).map_err(invalid_message)?;
                validate_signal_message(&message).map_err(invalid_message)?;

                self.sessions
                    .with_session(&address, |slot| {
                        self.check_duplicate(&key)?;
                        let opened = decrypt_existing(slot, &address, &message)?;
                        self.remember(key.clone())?;
                        Ok::<_, CoreError>(opened)
                    })
                    .map_err(|e| as_decryption_error(&address, e))?
            }
            EnvelopeType::Receipt => {
                return Err(DecryptionError::InvalidMessage(
                    "Receipt envelopes carry no ciphertext".to_string(),
                )
                .into())
            }
        };

        let trust = self.sender_trust(&address, &opened.remote_identity);
        if matches!(opened.content, Content::EndSession) {
            info!(target: "pipeline", address = %address, "Peer ended the session");
        }
        debug!(target: "pipeline", address = %address, timestamp = envelope.timestamp, "Decrypted message");

        Ok(ReceivedMessage {
            address,
            timestamp: envelope.timestamp,
            content: opened.content,
            trust,
            identity_changed: opened.identity_changed,
        })
    }

    fn check_duplicate(&self, key: &DedupKey) -> Result<(), CoreError> {
        let dedup = self.dedup.lock().map_err(|_| StorageError::LockPoisoned)?;
        if dedup.contains(key) {
            debug!(target: "pipeline", sender = %key.sender, device = key.device, timestamp = key.timestamp, "Duplicate envelope");
            return Err(DecryptionError::DuplicateMessage {
                sender: key.sender.clone(),
                device: key.device,
                timestamp: key.timestamp,
            }
            .into());
        }
        Ok(())
    }

    fn remember(&self, key: DedupKey) -> Result<(), CoreError> {
        self.dedup
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?
            .insert(key);
        Ok(())
    }

    fn decrypt_prekey(
        &self,
        slot: &mut SessionSlot<P>,
        address: &SessionAddress,
        message: &PreKeySignalMessage,
    ) -> Result<Opened, CoreError> {
        // Инициатор повторяет pre-key сообщение до первого ответа
        let same_session = slot
            .session()
            .map(|s| s.base_key() == message.base_key.as_slice())
            .unwrap_or(false);
        if same_session {
            return decrypt_existing(slot, address, &message.message);
        }

        // Без one-time pre-key повтор старого сообщения отличает только base key
        let replayed = message.one_time_prekey_id.is_none()
            && self.keys.base_key_accepted(message.signed_prekey_id, &message.base_key)?;
        if replayed {
            warn!(target: "pipeline", address = %address, base_key = %key_prefix(&message.base_key), "Pre-key message was already accepted");
            return Err(DecryptionError::MessageKeyConsumed(message.message.counter).into());
        }

        let local = self.keys.local_identity()?;
        let identity_private = self.keys.identity_private()?;
        let signed_prekey = self.keys.signed_prekey(message.signed_prekey_id)?;
        let one_time_prekey = message
            .one_time_prekey_id
            .map(|id| self.keys.one_time_prekey(id))
            .transpose()?;

        let mut session = ActiveSession::<P>::accept(
            address.clone(),
            &local,
            &identity_private,
            signed_prekey,
            one_time_prekey.as_ref(),
            message,
            self.sessions.limits(),
        )?;
        let plaintext = session.decrypt(&message.message)?;
        let content = unpack_content(&plaintext).map_err(invalid_message)?;

        // Identity отправителя записывается до установки сессии: если trust
        // запись не удалась, сессии нет
        let change = self
            .trust
            .observe_identity(&address.peer, &message.identity_key, &message.verifying_key)?;
        let identity_changed = change == IdentityChange::ReplacedExisting;
        if identity_changed {
            warn!(target: "pipeline", address = %address, "Sender identity changed");
        }

        // Расход pre-key до установки сессии: если он не удался, сообщение
        // можно обработать повторно
        match message.one_time_prekey_id {
            Some(id) => self.keys.consume_one_time_prekey(id)?,
            None => {
                if !self.keys.accept_base_key(message.signed_prekey_id, &message.base_key)? {
                    return Err(DecryptionError::MessageKeyConsumed(message.message.counter).into());
                }
            }
        }

        let opened = Opened {
            content,
            remote_identity: message.identity_key.clone(),
            identity_changed,
        };
        if matches!(opened.content, Content::EndSession) {
            return Ok(opened);
        }

        let previous = slot.install(session);
        info!(
            target: "pipeline",
            address = %address,
            base_key = %key_prefix(&message.base_key),
            replaced = ?previous,
            "Accepted pre-key message"
        );
        Ok(opened)
    }

    /// Доверие к отправителю после расшифровки
    ///
    /// Сессия, построенная не на той identity, что записана в trust, даёт
    /// подозрительное сообщение. Ошибки хранилища здесь не теряют уже
    /// расшифрованное сообщение: оно тоже доставляется как подозрительное.
    fn sender_trust(&self, address: &SessionAddress, remote_identity: &[u8]) -> Option<TrustState> {
        let result = (|| -> Result<Option<TrustState>, CoreError> {
            let record = match self.trust.record(&address.peer)? {
                Some(record) => record,
                None => return Ok(None),
            };
            if record.identity_key != remote_identity {
                warn!(target: "pipeline", address = %address, "Session identity differs from the recorded one");
                return Ok(Some(TrustState::Untrusted(UntrustedReason::Changed)));
            }
            Ok(Some(self.trust.note_exchange(&address.peer)?))
        })();

        result.unwrap_or_else(|e| {
            warn!(target: "pipeline", address = %address, error = %e, "Could not update trust for sender");
            None
        })
    }

    fn note_exchange(&self, peer: &str) {
        match self.trust.trust_state(peer) {
            Ok(Some(_)) => {
                if let Err(e) = self.trust.note_exchange(peer) {
                    warn!(target: "pipeline", peer = %peer, error = %e, "Could not update trust state");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(target: "pipeline", peer = %peer, error = %e, "Could not read trust state"),
        }
    }
}

/// Расшифровка в существующей сессии; сессия меняется только при успехе
fn decrypt_existing<P: CryptoProvider>(
    slot: &mut SessionSlot<P>,
    address: &SessionAddress,
    message: &SignalMessage,
) -> Result<Opened, CoreError> {
    let session = slot.session_mut().ok_or_else(|| SessionError::NoSession {
        peer: address.peer.clone(),
        device: address.device,
    })?;

    let mut staged = session.clone();
    let plaintext = staged.decrypt(message)?;
    let content = unpack_content(&plaintext).map_err(invalid_message)?;
    let remote_identity = staged.remote_identity().to_vec();
    *session = staged;

    if matches!(content, Content::EndSession) {
        slot.clear();
    }
    Ok(Opened {
        content,
        remote_identity,
        identity_changed: false,
    })
}

fn seal_end_session<P: CryptoProvider>(
    session: &mut ActiveSession<P>,
    local: &IdentityPublic,
    notice: &[u8],
) -> Result<Ciphertext, CoreError> {
    session.apply(SessionEvent::ResetRequested)?;
    let ciphertext = session.encrypt(local, notice)?;
    session.apply(SessionEvent::ResetCompleted)?;
    Ok(ciphertext)
}
