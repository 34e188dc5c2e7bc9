//! Double Ratchet Protocol Implementation
//!
//! ## Архитектура
//!
//! 1. **DH Ratchet**: новая DH пара при каждой смене направления диалога
//! 2. **Symmetric Ratchet**: KDF_CK на каждое сообщение
//!
//! ## Состояние
//!
//! - одна sending chain (у Bob её нет до первого полученного сообщения)
//! - до `max_receiver_chains` receiving chains, по одной на ratchet key собеседника
//! - skipped message keys внутри каждой receiving chain, т.е. по ключу
//!   (ratchet key, counter), с временем сохранения для GC
//!
//! ## Staged decrypt
//!
//! `decrypt` работает на копии состояния и подменяет им сессию только после
//! успешной проверки AEAD тега. Подделанное сообщение или выход за окно
//! пропуска ничего не меняют в сессии.

use crate::config::Config;
use crate::crypto::messaging::SecureMessaging;
use crate::crypto::provider::CryptoProvider;
use crate::crypto::SuiteID;
use crate::error::CryptoError;
use crate::utils::error::{DecryptionError, SessionError};
use crate::utils::logging::key_prefix;
use crate::utils::time::current_timestamp;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, trace, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Лимиты ratchet, берутся из [`Config`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatchetLimits {
    /// Максимальный прыжок вперёд внутри одной цепочки
    pub max_skip: u32,
    /// Максимум хранимых skipped keys на цепочку; старейшие вытесняются
    pub max_message_keys: usize,
    pub max_receiver_chains: usize,
}

impl RatchetLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_skip: config.max_skipped_messages,
            max_message_keys: config.max_message_keys,
            max_receiver_chains: config.max_receiver_chains.max(1),
        }
    }
}

impl Default for RatchetLimits {
    fn default() -> Self {
        Self::from_config(Config::global())
    }
}

/// Encrypted message in wire format (SignalMessage)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedRatchetMessage {
    /// Текущий ratchet public key отправителя
    #[serde(with = "serde_bytes")]
    pub ratchet_key: Vec<u8>,
    /// Номер сообщения в текущей sending chain
    pub counter: u32,
    /// Длина предыдущей sending chain отправителя
    pub previous_counter: u32,
    #[serde(with = "serde_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
    pub suite_id: SuiteID,
}

struct SkippedKey<P: CryptoProvider> {
    key: P::AeadKey,
    stored_at: i64,
}

struct SendingChain<P: CryptoProvider> {
    chain_key: P::AeadKey,
    next_index: u32,
}

struct ReceiverChain<P: CryptoProvider> {
    ratchet_key: P::DhPublicKey,
    chain_key: P::AeadKey,
    next_index: u32,
    skipped: BTreeMap<u32, SkippedKey<P>>,
}

impl<P: CryptoProvider> Clone for SendingChain<P> {
    fn clone(&self) -> Self {
        Self {
            chain_key: self.chain_key.clone(),
            next_index: self.next_index,
        }
    }
}

impl<P: CryptoProvider> Clone for ReceiverChain<P> {
    fn clone(&self) -> Self {
        Self {
            ratchet_key: self.ratchet_key.clone(),
            chain_key: self.chain_key.clone(),
            next_index: self.next_index,
            skipped: self
                .skipped
                .iter()
                .map(|(counter, skipped)| {
                    (
                        *counter,
                        SkippedKey {
                            key: skipped.key.clone(),
                            stored_at: skipped.stored_at,
                        },
                    )
                })
                .collect(),
        }
    }
}

impl<P: CryptoProvider> ReceiverChain<P> {
    fn wipe(&mut self) {
        self.chain_key.zeroize();
        for skipped in self.skipped.values_mut() {
            skipped.key.zeroize();
        }
        self.skipped.clear();
    }

    /// Продвинуть цепочку до `until` (не включая), сохранив промежуточные ключи
    fn store_skipped_until(&mut self, until: u32, limits: &RatchetLimits) -> Result<(), DecryptionError> {
        if until <= self.next_index {
            return Ok(());
        }

        let jump = until - self.next_index;
        if jump > limits.max_skip {
            return Err(SessionError::TooManySkippedMessages {
                requested: jump,
                limit: limits.max_skip,
            }
            .into());
        }

        let now = current_timestamp();
        while self.next_index < until {
            let (message_key, next_chain) = P::kdf_ck(&self.chain_key).map_err(corrupted)?;
            let mut old = std::mem::replace(&mut self.chain_key, next_chain);
            old.zeroize();

            self.skipped.insert(
                self.next_index,
                SkippedKey {
                    key: message_key,
                    stored_at: now,
                },
            );
            self.next_index += 1;
        }

        while self.skipped.len() > limits.max_message_keys {
            if let Some((_, mut evicted)) = self.skipped.pop_first() {
                evicted.key.zeroize();
            }
        }

        trace!(
            target: "crypto::double_ratchet",
            skipped = jump,
            stored = self.skipped.len(),
            "Stored skipped message keys"
        );
        Ok(())
    }

    /// Получить message key для `counter`, израсходовав его
    fn take_message_key(&mut self, counter: u32, limits: &RatchetLimits) -> Result<P::AeadKey, DecryptionError> {
        if counter < self.next_index {
            return match self.skipped.get_mut(&counter) {
                Some(skipped) => {
                    let key = std::mem::take(&mut skipped.key);
                    self.skipped.remove(&counter);
                    Ok(key)
                }
                None => Err(DecryptionError::MessageKeyConsumed(counter)),
            };
        }

        self.store_skipped_until(counter, limits)?;

        let (message_key, next_chain) = P::kdf_ck(&self.chain_key).map_err(corrupted)?;
        let mut old = std::mem::replace(&mut self.chain_key, next_chain);
        old.zeroize();
        self.next_index = self
            .next_index
            .checked_add(1)
            .ok_or_else(|| DecryptionError::InvalidMessage("Counter overflow".to_string()))?;
        Ok(message_key)
    }
}

fn corrupted(err: CryptoError) -> DecryptionError {
    DecryptionError::Corrupted(err.to_string())
}

fn protocol(err: CryptoError) -> SessionError {
    SessionError::Protocol(err.to_string())
}

/// Double Ratchet Session
///
/// Состояние ratchet для одной пары (peer, device).
pub struct DoubleRatchetSession<P: CryptoProvider> {
    suite_id: SuiteID,
    session_id: String,

    /// AD = IK_initiator || IK_responder, входит в AAD каждого сообщения
    associated_data: Vec<u8>,

    root_key: P::AeadKey,

    /// Наш текущий ratchet key. У Bob до первого ответа это signed pre-key.
    ratchet_private: P::DhPrivateKey,
    ratchet_public: P::DhPublicKey,

    sending: Option<SendingChain<P>>,
    previous_counter: u32,

    /// Последняя цепочка в конце
    receivers: VecDeque<ReceiverChain<P>>,

    limits: RatchetLimits,
}

impl<P: CryptoProvider> Clone for DoubleRatchetSession<P> {
    fn clone(&self) -> Self {
        Self {
            suite_id: self.suite_id,
            session_id: self.session_id.clone(),
            associated_data: self.associated_data.clone(),
            root_key: self.root_key.clone(),
            ratchet_private: self.ratchet_private.clone(),
            ratchet_public: self.ratchet_public.clone(),
            sending: self.sending.clone(),
            previous_counter: self.previous_counter,
            receivers: self.receivers.clone(),
            limits: self.limits,
        }
    }
}

impl<P: CryptoProvider> Drop for DoubleRatchetSession<P> {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.ratchet_private.zeroize();
        if let Some(sending) = self.sending.as_mut() {
            sending.chain_key.zeroize();
        }
        for chain in self.receivers.iter_mut() {
            chain.wipe();
        }
    }
}

impl<P: CryptoProvider> DoubleRatchetSession<P> {
    /// Создать сессию как инициатор (Alice)
    ///
    /// `remote_ratchet` - signed pre-key получателя из bundle.
    pub fn new_initiator_session(
        root_key: &[u8],
        remote_ratchet: &P::DhPublicKey,
        associated_data: Vec<u8>,
        limits: RatchetLimits,
    ) -> Result<Self, CryptoError> {
        let (ratchet_private, ratchet_public) = P::generate_dh_keys()?;
        let mut initial_root = P::aead_key_from_bytes(root_key)?;

        let mut dh_output = P::dh(&ratchet_private, remote_ratchet)?;
        let derived = P::kdf_rk(&initial_root, &dh_output);
        dh_output.zeroize();
        initial_root.zeroize();
        let (root_key, chain_key) = derived?;

        let session = Self {
            suite_id: P::suite_id(),
            session_id: uuid::Uuid::new_v4().to_string(),
            associated_data,
            root_key,
            ratchet_private,
            ratchet_public,
            sending: Some(SendingChain {
                chain_key,
                next_index: 0,
            }),
            previous_counter: 0,
            receivers: VecDeque::new(),
            limits,
        };

        debug!(
            target: "crypto::double_ratchet",
            session_id = %session.session_id,
            ratchet_key = %key_prefix(session.ratchet_public.as_ref()),
            "Created initiator session"
        );
        Ok(session)
    }

    /// Создать сессию как получатель (Bob)
    ///
    /// `signed_prekey` служит первым ratchet key, sending chain появится после
    /// расшифровки первого сообщения.
    pub fn new_responder_session(
        root_key: &[u8],
        signed_prekey: P::DhPrivateKey,
        associated_data: Vec<u8>,
        limits: RatchetLimits,
    ) -> Result<Self, CryptoError> {
        let ratchet_public = P::dh_public_from_private(&signed_prekey)?;

        let session = Self {
            suite_id: P::suite_id(),
            session_id: uuid::Uuid::new_v4().to_string(),
            associated_data,
            root_key: P::aead_key_from_bytes(root_key)?,
            ratchet_private: signed_prekey,
            ratchet_public,
            sending: None,
            previous_counter: 0,
            receivers: VecDeque::new(),
            limits,
        };

        debug!(
            target: "crypto::double_ratchet",
            session_id = %session.session_id,
            "Created responder session"
        );
        Ok(session)
    }

    pub fn has_sending_chain(&self) -> bool {
        self.sending.is_some()
    }

    pub fn ratchet_public(&self) -> &P::DhPublicKey {
        &self.ratchet_public
    }

    pub fn receiver_chain_count(&self) -> usize {
        self.receivers.len()
    }

    pub fn skipped_key_count(&self) -> usize {
        self.receivers.iter().map(|chain| chain.skipped.len()).sum()
    }

    pub fn set_limits(&mut self, limits: RatchetLimits) {
        self.limits = limits;
    }

    fn associated_data_for(&self, message: &EncryptedRatchetMessage) -> Vec<u8> {
        let mut aad = Vec::with_capacity(self.associated_data.len() + message.ratchet_key.len() + 10);
        aad.extend_from_slice(&self.associated_data);
        aad.extend_from_slice(&message.ratchet_key);
        aad.extend_from_slice(&message.counter.to_be_bytes());
        aad.extend_from_slice(&message.previous_counter.to_be_bytes());
        aad.extend_from_slice(&message.suite_id.to_be_bytes());
        aad
    }

    fn find_receiver(&self, ratchet_key: &[u8]) -> Option<usize> {
        self.receivers
            .iter()
            .position(|chain| chain.ratchet_key.as_ref() == ratchet_key)
    }

    /// DH ratchet step на новый ratchet key собеседника
    ///
    /// Возвращает индекс новой receiving chain.
    fn ratchet_step(
        &mut self,
        their_ratchet: &P::DhPublicKey,
        previous_counter: u32,
    ) -> Result<usize, DecryptionError> {
        let limits = self.limits;

        // Ключи хвоста предыдущей цепочки, которые ещё в пути
        if let Some(current) = self.receivers.back_mut() {
            current.store_skipped_until(previous_counter, &limits)?;
        }

        let mut dh_receive = P::dh(&self.ratchet_private, their_ratchet).map_err(corrupted)?;
        let derived = P::kdf_rk(&self.root_key, &dh_receive);
        dh_receive.zeroize();
        let (mut intermediate_root, receiving_chain) = derived.map_err(corrupted)?;

        let (new_private, new_public) = P::generate_dh_keys().map_err(corrupted)?;
        let mut dh_send = P::dh(&new_private, their_ratchet).map_err(corrupted)?;
        let derived = P::kdf_rk(&intermediate_root, &dh_send);
        dh_send.zeroize();
        intermediate_root.zeroize();
        let (root_key, sending_chain) = derived.map_err(corrupted)?;

        self.previous_counter = self.sending.as_ref().map(|s| s.next_index).unwrap_or(0);
        if let Some(mut old) = self.sending.replace(SendingChain {
            chain_key: sending_chain,
            next_index: 0,
        }) {
            old.chain_key.zeroize();
        }

        let mut old_root = std::mem::replace(&mut self.root_key, root_key);
        old_root.zeroize();
        let mut old_private = std::mem::replace(&mut self.ratchet_private, new_private);
        old_private.zeroize();
        self.ratchet_public = new_public;

        self.receivers.push_back(ReceiverChain {
            ratchet_key: their_ratchet.clone(),
            chain_key: receiving_chain,
            next_index: 0,
            skipped: BTreeMap::new(),
        });
        while self.receivers.len() > limits.max_receiver_chains {
            if let Some(mut dropped) = self.receivers.pop_front() {
                dropped.wipe();
            }
        }

        debug!(
            target: "crypto::double_ratchet",
            session_id = %self.session_id,
            their_ratchet = %key_prefix(their_ratchet.as_ref()),
            receiver_chains = self.receivers.len(),
            "DH ratchet step completed"
        );

        Ok(self.receivers.len() - 1)
    }

    fn decrypt_staged(&mut self, message: &EncryptedRatchetMessage) -> Result<Vec<u8>, DecryptionError> {
        if message.suite_id != self.suite_id {
            return Err(DecryptionError::InvalidMessage(format!(
                "Unexpected suite {}",
                message.suite_id
            )));
        }

        let index = match self.find_receiver(&message.ratchet_key) {
            Some(index) => index,
            None => {
                let their_ratchet = P::dh_public_key_from_bytes(&message.ratchet_key)
                    .map_err(|e| DecryptionError::InvalidMessage(e.to_string()))?;
                self.ratchet_step(&their_ratchet, message.previous_counter)?
            }
        };

        let limits = self.limits;
        let mut message_key = self.receivers[index].take_message_key(message.counter, &limits)?;

        let aad = self.associated_data_for(message);
        let result = P::aead_decrypt(&message_key, &message.nonce, &message.ciphertext, &aad);
        message_key.zeroize();

        result.map_err(corrupted)
    }

    /// Сериализовать сессию для сохранения
    pub fn to_serializable(&self) -> SerializableSession {
        SerializableSession {
            suite_id: self.suite_id,
            session_id: self.session_id.clone(),
            associated_data: self.associated_data.clone(),
            root_key: self.root_key.as_ref().to_vec(),
            ratchet_private: self.ratchet_private.as_ref().to_vec(),
            sending: self.sending.as_ref().map(|chain| SerializableSendingChain {
                chain_key: chain.chain_key.as_ref().to_vec(),
                next_index: chain.next_index,
            }),
            previous_counter: self.previous_counter,
            receivers: self
                .receivers
                .iter()
                .map(|chain| SerializableReceiverChain {
                    ratchet_key: chain.ratchet_key.as_ref().to_vec(),
                    chain_key: chain.chain_key.as_ref().to_vec(),
                    next_index: chain.next_index,
                    skipped: chain
                        .skipped
                        .iter()
                        .map(|(counter, skipped)| SerializableSkippedKey {
                            counter: *counter,
                            key: skipped.key.as_ref().to_vec(),
                            stored_at: skipped.stored_at,
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    /// Десериализовать сессию
    pub fn from_serializable(data: &SerializableSession, limits: RatchetLimits) -> Result<Self, CryptoError> {
        let ratchet_private = P::dh_private_key_from_bytes(&data.ratchet_private)?;
        let ratchet_public = P::dh_public_from_private(&ratchet_private)?;

        let sending = data
            .sending
            .as_ref()
            .map(|chain| {
                Ok::<_, CryptoError>(SendingChain {
                    chain_key: P::aead_key_from_bytes(&chain.chain_key)?,
                    next_index: chain.next_index,
                })
            })
            .transpose()?;

        let mut receivers = VecDeque::with_capacity(data.receivers.len());
        for chain in &data.receivers {
            let mut skipped = BTreeMap::new();
            for entry in &chain.skipped {
                skipped.insert(
                    entry.counter,
                    SkippedKey {
                        key: P::aead_key_from_bytes(&entry.key)?,
                        stored_at: entry.stored_at,
                    },
                );
            }
            receivers.push_back(ReceiverChain {
                ratchet_key: P::dh_public_key_from_bytes(&chain.ratchet_key)?,
                chain_key: P::aead_key_from_bytes(&chain.chain_key)?,
                next_index: chain.next_index,
                skipped,
            });
        }

        Ok(Self {
            suite_id: data.suite_id,
            session_id: data.session_id.clone(),
            associated_data: data.associated_data.clone(),
            root_key: P::aead_key_from_bytes(&data.root_key)?,
            ratchet_private,
            ratchet_public,
            sending,
            previous_counter: data.previous_counter,
            receivers,
            limits,
        })
    }
}

impl<P: CryptoProvider> SecureMessaging<P> for DoubleRatchetSession<P> {
    type EncryptedMessage = EncryptedRatchetMessage;

    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Self::EncryptedMessage, SessionError> {
        let sending = self
            .sending
            .as_ref()
            .ok_or_else(|| SessionError::Protocol("Session has no sending chain yet".to_string()))?;

        let counter = sending.next_index;
        let next_index = counter
            .checked_add(1)
            .ok_or_else(|| SessionError::Protocol("Sending counter overflow".to_string()))?;
        let (mut message_key, next_chain) = P::kdf_ck(&sending.chain_key).map_err(protocol)?;

        let nonce = P::random_bytes(Config::global().chacha_nonce_length).map_err(protocol)?;

        let mut message = EncryptedRatchetMessage {
            ratchet_key: self.ratchet_public.as_ref().to_vec(),
            counter,
            previous_counter: self.previous_counter,
            nonce,
            ciphertext: Vec::new(),
            suite_id: self.suite_id,
        };

        let aad = self.associated_data_for(&message);
        let sealed = P::aead_encrypt(&message_key, &message.nonce, plaintext, &aad);
        message_key.zeroize();
        message.ciphertext = sealed.map_err(protocol)?;

        // Коммитим шаг цепочки только после успешного шифрования
        if let Some(sending) = self.sending.as_mut() {
            let mut old = std::mem::replace(&mut sending.chain_key, next_chain);
            old.zeroize();
            sending.next_index = next_index;
        }

        trace!(
            target: "crypto::double_ratchet",
            counter,
            ciphertext_len = message.ciphertext.len(),
            "Encrypted message"
        );
        Ok(message)
    }

    fn decrypt(&mut self, message: &Self::EncryptedMessage) -> Result<Vec<u8>, DecryptionError> {
        let mut staged = self.clone();
        match staged.decrypt_staged(message) {
            Ok(plaintext) => {
                *self = staged;
                trace!(
                    target: "crypto::double_ratchet",
                    counter = message.counter,
                    "Decrypted message"
                );
                Ok(plaintext)
            }
            Err(err) => {
                debug!(
                    target: "crypto::double_ratchet",
                    session_id = %self.session_id,
                    counter = message.counter,
                    error = %err,
                    "Decryption failed, session unchanged"
                );
                Err(err)
            }
        }
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn cleanup_old_skipped_keys(&mut self, max_age_seconds: i64) -> usize {
        let now = current_timestamp();
        let mut removed = 0;

        for chain in self.receivers.iter_mut() {
            chain.skipped.retain(|_, skipped| {
                if now - skipped.stored_at < max_age_seconds {
                    true
                } else {
                    skipped.key.zeroize();
                    removed += 1;
                    false
                }
            });
        }

        if removed > 0 {
            warn!(
                target: "crypto::double_ratchet",
                session_id = %self.session_id,
                removed,
                remaining = self.skipped_key_count(),
                "Expired skipped message keys"
            );
        }
        removed
    }
}

/// Serializable session format for storage
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SerializableSession {
    suite_id: u16,
    session_id: String,
    associated_data: Vec<u8>,
    root_key: Vec<u8>,
    ratchet_private: Vec<u8>,
    sending: Option<SerializableSendingChain>,
    previous_counter: u32,
    receivers: Vec<SerializableReceiverChain>,
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct SerializableSendingChain {
    chain_key: Vec<u8>,
    next_index: u32,
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct SerializableReceiverChain {
    ratchet_key: Vec<u8>,
    chain_key: Vec<u8>,
    next_index: u32,
    skipped: Vec<SerializableSkippedKey>,
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct SerializableSkippedKey {
    counter: u32,
    key: Vec<u8>,
    stored_at: i64,
}
