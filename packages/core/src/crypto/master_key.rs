// Ключ хранилища из пароля
// PBKDF2-SHA256 для деривации ключа + AES-256-GCM для шифрования записей

use crate::config::Config;
use crate::utils::error::{KeyStoreError, StorageError};
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Key, Nonce,
};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

pub const KEY_LENGTH: usize = 32;

/// Известный plaintext, по которому проверяется пароль при unlock
const VERIFIER_PLAINTEXT: &[u8] = b"signet-storage-verifier-v1";
const VERIFIER_AAD: &[u8] = b"meta/verifier";

pub type MasterKey = Zeroizing<[u8; KEY_LENGTH]>;

/// Деривировать мастер-ключ из пароля с использованием PBKDF2
///
/// # Arguments
/// * `password` - Пользовательский пароль
/// * `salt` - Соль (`Config::salt_length` байт)
pub fn derive_master_key(
    password: &str,
    salt: &[u8],
    config: &Config,
) -> Result<MasterKey, KeyStoreError> {
    if salt.len() != config.salt_length {
        return Err(KeyStoreError::Corrupted(format!(
            "Invalid salt length: expected {}, got {}",
            config.salt_length,
            salt.len()
        )));
    }

    if password.is_empty() {
        return Err(KeyStoreError::Auth);
    }

    let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, config.pbkdf2_iterations, &mut *key);
    Ok(key)
}

/// Случайный ключ для режима auto-unlock
pub fn generate_random_key() -> MasterKey {
    let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
    rand::rngs::OsRng.fill_bytes(&mut *key);
    key
}

/// Генерировать случайную соль
pub fn generate_salt(length: usize) -> Vec<u8> {
    let mut salt = vec![0u8; length];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Зашифровать данные AES-256-GCM, результат: nonce || ciphertext || tag
///
/// `aad` привязывает шифротекст к месту хранения (namespace/key), чтобы
/// записи нельзя было переставить местами.
pub fn encrypt_data(key: &[u8; KEY_LENGTH], data: &[u8], aad: &[u8]) -> Result<Vec<u8>, StorageError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce_length = Config::global().nonce_length;

    let mut nonce_bytes = vec![0u8; nonce_length];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), Payload { msg: data, aad })
        .map_err(|e| StorageError::Encryption(format!("Encryption failed: {}", e)))?;

    let mut result = Vec::with_capacity(nonce_length + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Расшифровать данные, зашифрованные [`encrypt_data`]
pub fn decrypt_data(
    key: &[u8; KEY_LENGTH],
    data: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, StorageError> {
    let nonce_length = Config::global().nonce_length;
    if data.len() < nonce_length {
        return Err(StorageError::Encryption(
            "Invalid ciphertext: too short".to_string(),
        ));
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let (nonce_bytes, ciphertext) = data.split_at(nonce_length);

    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), Payload { msg: ciphertext, aad })
        .map_err(|e| StorageError::Encryption(format!("Decryption failed: {}", e)))?;

    Ok(Zeroizing::new(plaintext))
}

/// Верификатор пароля, хранится рядом с солью
pub fn make_verifier(key: &[u8; KEY_LENGTH]) -> Result<Vec<u8>, StorageError> {
    encrypt_data(key, VERIFIER_PLAINTEXT, VERIFIER_AAD)
}

/// true, если ключ открывает верификатор
pub fn check_verifier(key: &[u8; KEY_LENGTH], verifier: &[u8]) -> bool {
    matches!(
        decrypt_data(key, verifier, VERIFIER_AAD),
        Ok(plaintext) if plaintext.as_slice() == VERIFIER_PLAINTEXT
    )
}

/// Валидация силы пароля
///
/// Минимальные требования:
/// - Длина >= `Config::password_min_length`
/// - Содержит буквы и цифры
pub fn validate_password(password: &str, config: &Config) -> Result<(), String> {
    if password.chars().count() < config.password_min_length {
        return Err(format!(
            "Password must be at least {} characters long",
            config.password_min_length
        ));
    }

    let has_letter = password.chars().any(|c| c.is_alphabetic());
    let has_digit = password.chars().any(|c| c.is_numeric());
    if !has_letter || !has_digit {
        return Err("Password must contain both letters and numbers".to_string());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> Config {
        Config {
            pbkdf2_iterations: 1_000,
            ..Config::default()
        }
    }

    #[test]
    fn test_derive_master_key() {
        let config = fast_config();
        let salt = generate_salt(config.salt_length);

        let key1 = derive_master_key("test_password_123", &salt, &config).unwrap();
        let key2 = derive_master_key("test_password_123", &salt, &config).unwrap();
        assert_eq!(&*key1, &*key2);

        let other_salt = generate_salt(config.salt_length);
        let key3 = derive_master_key("test_password_123", &other_salt, &config).unwrap();
        assert_ne!(&*key1, &*key3);
    }

    #[test]
    fn test_derive_rejects_bad_input() {
        let config = fast_config();
        assert!(derive_master_key("password1", &[0u8; 4], &config).is_err());
        assert_eq!(
            derive_master_key("", &generate_salt(config.salt_length), &config).unwrap_err(),
            KeyStoreError::Auth
        );
    }

    #[test]
    fn test_encrypt_decrypt_binds_aad() {
        let key = generate_random_key();
        let sealed = encrypt_data(&key, b"session blob", b"sessions/alice.1").unwrap();

        assert_eq!(
            decrypt_data(&key, &sealed, b"sessions/alice.1").unwrap().as_slice(),
            b"session blob"
        );
        assert!(decrypt_data(&key, &sealed, b"sessions/bob.1").is_err());
    }

    #[test]
    fn test_encrypted_data_includes_nonce() {
        let key = generate_random_key();
        let data = b"test data";
        let sealed = encrypt_data(&key, data, b"").unwrap();

        // nonce + ciphertext + 16 байт GCM tag
        assert_eq!(sealed.len(), Config::global().nonce_length + data.len() + 16);
    }

    #[test]
    fn test_verifier() {
        let config = fast_config();
        let salt = generate_salt(config.salt_length);
        let right = derive_master_key("correct_password_123", &salt, &config).unwrap();
        let wrong = derive_master_key("wrong_password_456", &salt, &config).unwrap();

        let verifier = make_verifier(&right).unwrap();
        assert!(check_verifier(&right, &verifier));
        assert!(!check_verifier(&wrong, &verifier));
    }

    #[test]
    fn test_validate_password() {
        let config = Config::default();
        assert!(validate_password("password123", &config).is_ok());
        assert!(validate_password("MyPass123", &config).is_ok());

        assert!(validate_password("short1", &config).is_err());
        assert!(validate_password("onlyletters", &config).is_err());
        assert!(validate_password("12345678", &config).is_err());
        assert!(validate_password("", &config).is_err());
    }
}
