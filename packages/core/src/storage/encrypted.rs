// Шифрующее хранилище
//
// Оборачивает BlobStore: значения шифруются AES-256-GCM ключом хранилища,
// AAD = "<namespace>/<key>". Метаданные (режим, соль, верификатор, счётчик
// неудачных unlock) лежат открыто в namespace `meta`.

use crate::config::Config;
use crate::crypto::master_key::{
    check_verifier, decrypt_data, derive_master_key, encrypt_data, generate_random_key,
    generate_salt, make_verifier, validate_password, MasterKey, KEY_LENGTH,
};
use crate::storage::models::{StorageEncryption, StoredEncryptionMeta};
use crate::storage::{get_record, namespaces, put_record, BlobStore};
use crate::utils::error::{CoreError, KeyStoreError, StorageError};
use crate::utils::time::current_timestamp;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, warn};
use zeroize::Zeroizing;

const META_KEY: &str = "encryption";

pub struct EncryptedStore {
    inner: Arc<dyn BlobStore>,
    config: Config,
    key: RwLock<Option<MasterKey>>,
    meta: Mutex<StoredEncryptionMeta>,
}

fn record_aad(namespace: &str, key: &str) -> Vec<u8> {
    format!("{}/{}", namespace, key).into_bytes()
}

fn key_from_bytes(bytes: &[u8]) -> Result<MasterKey, StorageError> {
    let raw: [u8; KEY_LENGTH] = bytes.try_into().map_err(|_| StorageError::Corrupted {
        key: format!("{}/{}", namespaces::META, META_KEY),
        reason: "Invalid auto-unlock key length".to_string(),
    })?;
    Ok(Zeroizing::new(raw))
}

impl EncryptedStore {
    /// Есть ли в хранилище инициализированное шифрование
    pub fn exists(inner: &dyn BlobStore) -> Result<bool, StorageError> {
        Ok(inner.get(namespaces::META, META_KEY)?.is_some())
    }

    /// Инициализировать новое хранилище
    ///
    /// Для `Password` пароль обязателен и проверяется на минимальную силу.
    pub fn create(
        inner: Arc<dyn BlobStore>,
        encryption: StorageEncryption,
        password: Option<&str>,
        config: Config,
    ) -> Result<Self, CoreError> {
        if Self::exists(inner.as_ref())? {
            return Err(CoreError::ValidationError(
                "Storage is already initialized".to_string(),
            ));
        }

        let (key, meta) = match encryption {
            StorageEncryption::Password => {
                let password = password.ok_or_else(|| {
                    CoreError::ValidationError("Password mode requires a password".to_string())
                })?;
                validate_password(password, &config).map_err(CoreError::ValidationError)?;

                let salt = generate_salt(config.salt_length);
                let key = derive_master_key(password, &salt, &config)?;
                let meta = StoredEncryptionMeta {
                    encryption,
                    salt,
                    verifier: make_verifier(&key)?,
                    auto_unlock_key: None,
                    failed_attempts: 0,
                    created_at: current_timestamp(),
                };
                (key, meta)
            }
            StorageEncryption::AutoUnlock => {
                let key = generate_random_key();
                let meta = StoredEncryptionMeta {
                    encryption,
                    salt: Vec::new(),
                    verifier: make_verifier(&key)?,
                    auto_unlock_key: Some(key.to_vec()),
                    failed_attempts: 0,
                    created_at: current_timestamp(),
                };
                (key, meta)
            }
        };

        put_record(inner.as_ref(), namespaces::META, META_KEY, &meta)?;
        info!(target: "storage", encryption = ?encryption, "Initialized encrypted storage");

        Ok(Self {
            inner,
            config,
            key: RwLock::new(Some(key)),
            meta: Mutex::new(meta),
        })
    }

    /// Открыть существующее хранилище
    ///
    /// В режиме `AutoUnlock` хранилище сразу разблокировано, в режиме
    /// `Password` нужен [`EncryptedStore::unlock`].
    pub fn open(inner: Arc<dyn BlobStore>, config: Config) -> Result<Self, CoreError> {
        let meta: StoredEncryptionMeta = get_record(inner.as_ref(), namespaces::META, META_KEY)?
            .ok_or_else(|| CoreError::NotFound("Storage is not initialized".to_string()))?;

        let key = match (&meta.encryption, &meta.auto_unlock_key) {
            (StorageEncryption::AutoUnlock, Some(raw)) => {
                let key = key_from_bytes(raw)?;
                if !check_verifier(&key, &meta.verifier) {
                    return Err(KeyStoreError::Corrupted(
                        "Auto-unlock key does not match verifier".to_string(),
                    )
                    .into());
                }
                Some(key)
            }
            (StorageEncryption::AutoUnlock, None) => {
                return Err(KeyStoreError::Corrupted("Auto-unlock key missing".to_string()).into())
            }
            (StorageEncryption::Password, _) => None,
        };

        Ok(Self {
            inner,
            config,
            key: RwLock::new(key),
            meta: Mutex::new(meta),
        })
    }

    /// Разблокировать хранилище паролем
    ///
    /// Неудачные попытки сохраняются; после `max_unlock_attempts` хранилище
    /// больше не принимает пароли (фатальная ошибка).
    pub fn unlock(&self, password: &str) -> Result<(), CoreError> {
        let mut meta = self.meta.lock().map_err(|_| StorageError::LockPoisoned)?;

        if meta.encryption == StorageEncryption::AutoUnlock {
            return Ok(());
        }

        let max_attempts = self.config.max_unlock_attempts;
        if meta.failed_attempts >= max_attempts {
            return Err(KeyStoreError::UnlockAttemptsExhausted(meta.failed_attempts).into());
        }

        let key = derive_master_key(password, &meta.salt, &self.config);
        let key = match key {
            Ok(key) if check_verifier(&key, &meta.verifier) => key,
            _ => {
                meta.failed_attempts += 1;
                put_record(self.inner.as_ref(), namespaces::META, META_KEY, &*meta)?;
                warn!(
                    target: "storage",
                    failed_attempts = meta.failed_attempts,
                    max_attempts,
                    "Storage unlock failed"
                );

                return Err(if meta.failed_attempts >= max_attempts {
                    KeyStoreError::UnlockAttemptsExhausted(meta.failed_attempts)
                } else {
                    KeyStoreError::Auth
                }
                .into());
            }
        };

        if meta.failed_attempts != 0 {
            meta.failed_attempts = 0;
            put_record(self.inner.as_ref(), namespaces::META, META_KEY, &*meta)?;
        }

        *self.key.write().map_err(|_| StorageError::LockPoisoned)? = Some(key);
        info!(target: "storage", "Storage unlocked");
        Ok(())
    }

    /// Забыть ключ (только для режима Password)
    pub fn lock(&self) -> Result<(), StorageError> {
        if self.encryption()? == StorageEncryption::Password {
            *self.key.write().map_err(|_| StorageError::LockPoisoned)? = None;
        }
        Ok(())
    }

    pub fn is_unlocked(&self) -> bool {
        self.key.read().map(|key| key.is_some()).unwrap_or(false)
    }

    pub fn encryption(&self) -> Result<StorageEncryption, StorageError> {
        Ok(self.meta.lock().map_err(|_| StorageError::LockPoisoned)?.encryption)
    }

    pub fn failed_attempts(&self) -> Result<u32, StorageError> {
        Ok(self.meta.lock().map_err(|_| StorageError::LockPoisoned)?.failed_attempts)
    }

    /// Удалить все данные ядра, включая метаданные шифрования
    ///
    /// После wipe хранилище заблокировано и должно быть создано заново.
    pub fn wipe(&self) -> Result<(), StorageError> {
        for namespace in namespaces::ALL {
            self.inner.clear(namespace)?;
        }
        *self.key.write().map_err(|_| StorageError::LockPoisoned)? = None;
        warn!(target: "storage", "Local data wiped");
        Ok(())
    }

    fn with_key<T>(
        &self,
        f: impl FnOnce(&[u8; KEY_LENGTH]) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let guard = self.key.read().map_err(|_| StorageError::LockPoisoned)?;
        match guard.as_ref() {
            Some(key) => f(&**key),
            None => Err(StorageError::Locked),
        }
    }
}

impl BlobStore for EncryptedStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let sealed = match self.inner.get(namespace, key)? {
            Some(sealed) => sealed,
            None => return Ok(None),
        };

        self.with_key(|master| {
            decrypt_data(master, &sealed, &record_aad(namespace, key))
                .map(|plain| Some(plain.to_vec()))
                .map_err(|e| StorageError::Corrupted {
                    key: format!("{}/{}", namespace, key),
                    reason: e.to_string(),
                })
        })
    }

    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let sealed = self.with_key(|master| encrypt_data(master, value, &record_aad(namespace, key)))?;
        self.inner.put(namespace, key, &sealed)
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<bool, StorageError> {
        self.inner.delete(namespace, key)
    }

    fn list(&self, namespace: &str) -> Result<Vec<String>, StorageError> {
        self.inner.list(namespace)
    }
}
