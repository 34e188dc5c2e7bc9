// Управление ключами
// Identity, signed pre-keys, one-time pre-keys: генерация, ротация, расход

use crate::config::Config;
use crate::crypto::handshake::{signed_prekey_message, OneTimePreKeyPublic};
use crate::crypto::CryptoProvider;
use crate::protocol::messages::{PreKeyUpload, SignedPreKeyPublic};
use crate::storage::models::{StoredIdentity, StoredOneTimePreKey, StoredSignedPreKey};
use crate::storage::{get_record, namespaces, put_record, BlobStore, EncryptedStore};
use crate::utils::error::{CoreError, KeyStoreError, SessionError, StorageError};
use crate::utils::logging::key_prefix;
use crate::utils::time::current_timestamp;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

const IDENTITY_KEY: &str = "local";

/// Максимальный registration id (14 бит, как у Signal)
const MAX_REGISTRATION_ID: u16 = 16380;

/// Публичная часть локальной identity
///
/// Приватные ключи никогда не покидают [`IdentityKeyStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityPublic {
    pub registration_id: u32,
    pub device_id: u32,
    pub identity_key: Vec<u8>,
    pub verifying_key: Vec<u8>,
}

impl IdentityPublic {
    fn from_stored(identity: &StoredIdentity) -> Self {
        Self {
            registration_id: identity.registration_id,
            device_id: identity.device_id,
            identity_key: identity.identity_public.clone(),
            verifying_key: identity.verifying_key.clone(),
        }
    }
}

fn keygen_error(e: impl std::fmt::Display) -> KeyStoreError {
    KeyStoreError::KeyGeneration(e.to_string())
}

/// Хранилище identity и pre-keys
///
/// Одна грубая блокировка на всё состояние: ротация и сброс редки, а расход
/// one-time pre-key должен быть атомарным относительно refill.
pub struct IdentityKeyStore<P: CryptoProvider> {
    store: Arc<EncryptedStore>,
    config: Config,
    state: Mutex<Option<StoredIdentity>>,
    _phantom: PhantomData<P>,
}

impl<P: CryptoProvider> IdentityKeyStore<P> {
    pub fn new(store: Arc<EncryptedStore>, config: Config) -> Self {
        Self {
            store,
            config,
            state: Mutex::new(None),
            _phantom: PhantomData,
        }
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, Option<StoredIdentity>>, StorageError> {
        self.state.lock().map_err(|_| StorageError::LockPoisoned)
    }

    fn persist(&self, identity: &StoredIdentity) -> Result<(), StorageError> {
        put_record(self.store.as_ref(), namespaces::IDENTITY, IDENTITY_KEY, identity)
    }

    /// Изменить identity транзакционно: копия → мутация → запись → замена
    ///
    /// Если запись в хранилище не удалась, состояние в памяти не меняется.
    fn update<T>(
        &self,
        f: impl FnOnce(&mut StoredIdentity) -> Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        let mut state = self.lock_state()?;
        let current = state.as_ref().ok_or(KeyStoreError::NoIdentity)?;

        let mut next = current.clone();
        let result = f(&mut next)?;
        self.persist(&next)?;
        *state = Some(next);
        Ok(result)
    }

    fn read<T>(&self, f: impl FnOnce(&StoredIdentity) -> Result<T, CoreError>) -> Result<T, CoreError> {
        let state = self.lock_state()?;
        let identity = state.as_ref().ok_or(KeyStoreError::NoIdentity)?;
        f(identity)
    }

    fn new_signed_prekey(
        identity: &StoredIdentity,
        id: u32,
    ) -> Result<StoredSignedPreKey, KeyStoreError> {
        let (private_key, public_key) = P::generate_dh_keys().map_err(keygen_error)?;
        let signing_key =
            P::signature_private_key_from_bytes(&identity.signing_private).map_err(keygen_error)?;
        let signature = P::sign(
            &signing_key,
            &signed_prekey_message(&identity.identity_public, id, public_key.as_ref()),
        )
        .map_err(keygen_error)?;

        Ok(StoredSignedPreKey {
            id,
            private_key: private_key.as_ref().to_vec(),
            public_key: public_key.as_ref().to_vec(),
            signature,
            created_at: current_timestamp(),
            accepted_base_keys: Vec::new(),
        })
    }

    fn new_one_time_prekeys(
        identity: &mut StoredIdentity,
        count: usize,
    ) -> Result<(), KeyStoreError> {
        for _ in 0..count {
            let (private_key, public_key) = P::generate_dh_keys().map_err(keygen_error)?;
            let id = identity.next_one_time_prekey_id;
            identity.next_one_time_prekey_id = id.wrapping_add(1).max(1);
            identity.one_time_prekeys.push(StoredOneTimePreKey {
                id,
                private_key: private_key.as_ref().to_vec(),
                public_key: public_key.as_ref().to_vec(),
            });
        }
        Ok(())
    }

    fn build_identity(device_id: u32, one_time_count: usize) -> Result<StoredIdentity, KeyStoreError> {
        let (identity_private, identity_public) = P::generate_dh_keys().map_err(keygen_error)?;
        let (signing_private, verifying_key) = P::generate_signature_keys().map_err(keygen_error)?;

        let random = P::random_bytes(2).map_err(keygen_error)?;
        let raw = u16::from_be_bytes([random[0], random[1]]) & 0x3FFF;
        let registration_id = u32::from(raw % MAX_REGISTRATION_ID) + 1;

        let now = current_timestamp();
        let mut identity = StoredIdentity {
            registration_id,
            device_id,
            identity_private: identity_private.as_ref().to_vec(),
            identity_public: identity_public.as_ref().to_vec(),
            signing_private: signing_private.as_ref().to_vec(),
            verifying_key: verifying_key.as_ref().to_vec(),
            current_signed_prekey: None,
            archived_signed_prekeys: Vec::new(),
            one_time_prekeys: Vec::new(),
            next_signed_prekey_id: 2,
            next_one_time_prekey_id: 1,
            last_rotation_at: now,
            created_at: now,
        };

        identity.current_signed_prekey = Some(Self::new_signed_prekey(&identity, 1)?);
        Self::new_one_time_prekeys(&mut identity, one_time_count)?;
        Ok(identity)
    }

    /// Сгенерировать новую identity (один раз, при регистрации)
    ///
    /// Вместе с identity создаются первый signed pre-key и пачка one-time pre-keys.
    pub fn generate_identity(&self, device_id: u32) -> Result<IdentityPublic, CoreError> {
        let mut state = self.lock_state()?;
        let stored: Option<StoredIdentity> =
            get_record(self.store.as_ref(), namespaces::IDENTITY, IDENTITY_KEY)?;
        if state.is_some() || stored.is_some() {
            return Err(CoreError::ValidationError(
                "Identity already exists, use reset_identity".to_string(),
            ));
        }

        let identity = Self::build_identity(device_id, self.config.one_time_prekey_batch_size)?;
        self.persist(&identity)?;

        let public = IdentityPublic::from_stored(&identity);
        info!(
            target: "keys",
            registration_id = public.registration_id,
            device_id,
            identity = %key_prefix(&public.identity_key),
            "Generated new identity"
        );
        *state = Some(identity);
        Ok(public)
    }

    /// Загрузить identity из хранилища
    ///
    /// В режиме Password хранилище разблокируется переданным паролем.
    pub fn load_identity(&self, password: Option<&str>) -> Result<IdentityPublic, CoreError> {
        if !self.store.is_unlocked() {
            match password {
                Some(password) => self.store.unlock(password)?,
                None => return Err(KeyStoreError::Auth.into()),
            }
        }

        let identity: StoredIdentity = get_record(self.store.as_ref(), namespaces::IDENTITY, IDENTITY_KEY)
            .map_err(|e| match e {
                StorageError::Corrupted { reason, .. } => KeyStoreError::Corrupted(reason).into(),
                other => CoreError::from(other),
            })?
            .ok_or(KeyStoreError::NoIdentity)?;

        // Приватный ключ должен соответствовать публичному
        let private = P::dh_private_key_from_bytes(&identity.identity_private)
            .map_err(|e| KeyStoreError::Corrupted(e.to_string()))?;
        let public = P::dh_public_from_private(&private)
            .map_err(|e| KeyStoreError::Corrupted(e.to_string()))?;
        if public.as_ref() != identity.identity_public.as_slice() {
            return Err(KeyStoreError::Corrupted("Identity key pair mismatch".to_string()).into());
        }

        let public = IdentityPublic::from_stored(&identity);
        debug!(
            target: "keys",
            registration_id = public.registration_id,
            one_time_prekeys = identity.one_time_prekeys.len(),
            "Loaded identity"
        );
        *self.lock_state()? = Some(identity);
        Ok(public)
    }

    pub fn is_loaded(&self) -> bool {
        self.state.lock().map(|state| state.is_some()).unwrap_or(false)
    }

    /// Забыть identity в памяти (хранилище заблокировано)
    pub fn unload(&self) -> Result<(), CoreError> {
        *self.lock_state()? = None;
        Ok(())
    }

    pub fn local_identity(&self) -> Result<IdentityPublic, CoreError> {
        self.read(|identity| Ok(IdentityPublic::from_stored(identity)))
    }

    /// Приватный identity key для X3DH
    pub(crate) fn identity_private(&self) -> Result<P::DhPrivateKey, CoreError> {
        self.read(|identity| {
            P::dh_private_key_from_bytes(&identity.identity_private)
                .map_err(|e| KeyStoreError::Corrupted(e.to_string()).into())
        })
    }

    /// Приватная часть signed pre-key (текущего или из архива)
    pub(crate) fn signed_prekey(&self, id: u32) -> Result<P::DhPrivateKey, CoreError> {
        self.read(|identity| {
            let prekey = identity
                .current_signed_prekey
                .iter()
                .chain(identity.archived_signed_prekeys.iter())
                .find(|prekey| prekey.id == id)
                .ok_or(SessionError::SignedPreKeyNotFound(id))?;
            P::dh_private_key_from_bytes(&prekey.private_key)
                .map_err(|e| KeyStoreError::Corrupted(e.to_string()).into())
        })
    }

    /// Приватная часть one-time pre-key без расхода
    ///
    /// Расход отдельно, через [`IdentityKeyStore::consume_one_time_prekey`],
    /// и только после успешной расшифровки pre-key сообщения.
    pub(crate) fn one_time_prekey(&self, id: u32) -> Result<P::DhPrivateKey, CoreError> {
        self.read(|identity| {
            match identity.one_time_prekeys.iter().find(|prekey| prekey.id == id) {
                Some(prekey) => P::dh_private_key_from_bytes(&prekey.private_key)
                    .map_err(|e| KeyStoreError::Corrupted(e.to_string()).into()),
                // Id выдаются по возрастанию: отсутствующий выданный id израсходован
                None if id != 0 && id < identity.next_one_time_prekey_id => {
                    Err(SessionError::PreKeyAlreadyUsed(id).into())
                }
                None => Err(SessionError::PreKeyNotFound(id).into()),
            }
        })
    }

    /// Израсходовать one-time pre-key: удалить из хранилища навсегда
    pub(crate) fn consume_one_time_prekey(&self, id: u32) -> Result<(), CoreError> {
        self.update(|identity| {
            let index = identity
                .one_time_prekeys
                .iter()
                .position(|prekey| prekey.id == id)
                .ok_or(SessionError::PreKeyAlreadyUsed(id))?;

            // StoredOneTimePreKey затирается при drop
            drop(identity.one_time_prekeys.remove(index));
            Ok(())
        })?;

        debug!(target: "keys", one_time_prekey_id = id, "Consumed one-time pre-key");
        Ok(())
    }

    /// Pre-key сообщение без one-time pre-key с этим base key уже принято
    pub(crate) fn base_key_accepted(&self, signed_prekey_id: u32, base_key: &[u8]) -> Result<bool, CoreError> {
        self.read(|identity| {
            Ok(identity
                .current_signed_prekey
                .iter()
                .chain(identity.archived_signed_prekeys.iter())
                .find(|prekey| prekey.id == signed_prekey_id)
                .map(|prekey| prekey.accepted_base_keys.iter().any(|k| k.as_slice() == base_key))
                .unwrap_or(false))
        })
    }

    /// Запомнить base key pre-key сообщения без one-time pre-key
    ///
    /// Запись живёт вместе с signed pre-key: после удаления ключа из архива
    /// такое сообщение уже не проходит X3DH. Возвращает false, если base key
    /// уже был принят.
    pub(crate) fn accept_base_key(&self, signed_prekey_id: u32, base_key: &[u8]) -> Result<bool, CoreError> {
        self.update(|identity| {
            let StoredIdentity {
                current_signed_prekey,
                archived_signed_prekeys,
                ..
            } = identity;
            let prekey = current_signed_prekey
                .iter_mut()
                .chain(archived_signed_prekeys.iter_mut())
                .find(|prekey| prekey.id == signed_prekey_id)
                .ok_or(SessionError::SignedPreKeyNotFound(signed_prekey_id))?;

            if prekey.accepted_base_keys.iter().any(|k| k.as_slice() == base_key) {
                return Ok(false);
            }
            prekey.accepted_base_keys.push(base_key.to_vec());
            Ok(true)
        })
    }

    pub fn one_time_prekey_count(&self) -> Result<usize, CoreError> {
        self.read(|identity| Ok(identity.one_time_prekeys.len()))
    }

    /// Пул one-time pre-keys опустился ниже low-water mark
    pub fn needs_refill(&self) -> Result<bool, CoreError> {
        Ok(self.one_time_prekey_count()? < self.config.one_time_prekey_low_water_mark)
    }

    /// Дополнить пул one-time pre-keys до размера пачки, возвращает число новых ключей
    pub fn refill_one_time_prekeys(&self) -> Result<usize, CoreError> {
        let batch = self.config.one_time_prekey_batch_size;
        let generated = self.update(|identity| {
            let missing = batch.saturating_sub(identity.one_time_prekeys.len());
            Self::new_one_time_prekeys(identity, missing)?;
            Ok(missing)
        })?;

        if generated > 0 {
            info!(target: "keys", generated, "Refilled one-time pre-keys");
        }
        Ok(generated)
    }

    /// Ротация signed pre-key
    ///
    /// Старый ключ уходит в архив и принимается ещё `prekey_cleanup_period_secs`.
    pub fn rotate_signed_prekey(&self) -> Result<u32, CoreError> {
        let cleanup_period = self.config.prekey_cleanup_period_secs;
        let (new_id, removed) = self.update(|identity| {
            let id = identity.next_signed_prekey_id;
            let prekey = Self::new_signed_prekey(identity, id)?;
            identity.next_signed_prekey_id = id.wrapping_add(1).max(1);

            if let Some(old) = identity.current_signed_prekey.replace(prekey) {
                identity.archived_signed_prekeys.push(old);
            }

            let now = current_timestamp();
            identity.last_rotation_at = now;
            let before = identity.archived_signed_prekeys.len();
            identity
                .archived_signed_prekeys
                .retain(|prekey| now - prekey.created_at < cleanup_period);
            Ok((id, before - identity.archived_signed_prekeys.len()))
        })?;

        info!(
            target: "keys",
            signed_prekey_id = new_id,
            archived_removed = removed,
            "Rotated signed pre-key"
        );
        Ok(new_id)
    }

    /// Периодическая ротация; ошибки логируются и не пробрасываются
    ///
    /// Возвращает true, если ротация была выполнена.
    pub fn rotate_signed_prekey_if_due(&self) -> bool {
        let due = self.read(|identity| {
            Ok(current_timestamp() - identity.last_rotation_at >= self.config.signed_prekey_rotation_secs)
        });

        match due {
            Ok(true) => match self.rotate_signed_prekey() {
                Ok(_) => true,
                Err(e) => {
                    warn!(target: "keys", error = %e, "Signed pre-key rotation failed, will retry");
                    false
                }
            },
            Ok(false) => false,
            Err(e) => {
                warn!(target: "keys", error = %e, "Cannot check signed pre-key age");
                false
            }
        }
    }

    pub fn current_signed_prekey_id(&self) -> Result<u32, CoreError> {
        self.read(|identity| {
            identity
                .current_signed_prekey
                .as_ref()
                .map(|prekey| prekey.id)
                .ok_or_else(|| KeyStoreError::Corrupted("No signed pre-key".to_string()).into())
        })
    }

    /// Публичный материал для публикации в директории
    pub fn upload_bundle(&self) -> Result<PreKeyUpload, CoreError> {
        self.read(|identity| {
            let signed = identity
                .current_signed_prekey
                .as_ref()
                .ok_or_else(|| KeyStoreError::Corrupted("No signed pre-key".to_string()))?;

            Ok(PreKeyUpload {
                registration_id: identity.registration_id,
                device_id: identity.device_id,
                identity_key: identity.identity_public.clone(),
                verifying_key: identity.verifying_key.clone(),
                signed_prekey: SignedPreKeyPublic {
                    id: signed.id,
                    public_key: signed.public_key.clone(),
                    signature: signed.signature.clone(),
                },
                one_time_prekeys: identity
                    .one_time_prekeys
                    .iter()
                    .map(|prekey| OneTimePreKeyPublic {
                        id: prekey.id,
                        public_key: prekey.public_key.clone(),
                    })
                    .collect(),
                suite_id: P::suite_id(),
            })
        })
    }

    /// Заменить identity новой (явный сброс пользователем)
    ///
    /// Старые ключи и все pre-keys уничтожаются; сессии и trust записи
    /// сбрасывает вызывающий код.
    pub fn reset_identity(&self) -> Result<IdentityPublic, CoreError> {
        let mut state = self.lock_state()?;
        let device_id = state.as_ref().map(|identity| identity.device_id).unwrap_or(1);

        let identity = Self::build_identity(device_id, self.config.one_time_prekey_batch_size)?;
        self.persist(&identity)?;

        let public = IdentityPublic::from_stored(&identity);
        warn!(
            target: "keys",
            identity = %key_prefix(&public.identity_key),
            "Identity was reset"
        );
        *state = Some(identity);
        Ok(public)
    }

    /// Забыть identity в памяти и удалить её из хранилища
    pub fn wipe(&self) -> Result<(), CoreError> {
        let mut state = self.lock_state()?;
        self.store.delete(namespaces::IDENTITY, IDENTITY_KEY)?;
        *state = None;
        Ok(())
    }
}
