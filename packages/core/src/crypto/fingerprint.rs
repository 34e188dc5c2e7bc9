//! Safety numbers
//!
//! Числовой fingerprint пары identity, который пользователи сравнивают
//! вслух или по QR. Для каждой стороны:
//!
//! ```text
//! h_0 = SHA-512(version || key || stable_id)
//! h_i = SHA-512(h_{i-1} || key)              i = 1..ITERATIONS-1
//! ```
//!
//! Первые 30 байт `h` режутся на шесть 5-байтовых чанков, каждый даёт
//! 5 десятичных цифр. Две половины по 30 цифр сортируются, чтобы обе
//! стороны видели одну и ту же строку.

use sha2::{Digest, Sha512};
use std::fmt;

const FINGERPRINT_VERSION: [u8; 2] = [0x00, 0x00];
const ITERATIONS: usize = 5200;
const KEY_TYPE_DJB: u8 = 0x05;
const DIGITS_PER_SIDE: usize = 30;

/// Публичный материал одной стороны: тип ключа, identity key, verifying key
pub fn fingerprint_key(identity_key: &[u8], verifying_key: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + identity_key.len() + verifying_key.len());
    key.push(KEY_TYPE_DJB);
    key.extend_from_slice(identity_key);
    key.extend_from_slice(verifying_key);
    key
}

fn side_digits(stable_id: &str, key: &[u8]) -> String {
    let mut hasher = Sha512::new();
    hasher.update(FINGERPRINT_VERSION);
    hasher.update(key);
    hasher.update(stable_id.as_bytes());
    let mut hash = hasher.finalize();

    for _ in 1..ITERATIONS {
        let mut hasher = Sha512::new();
        hasher.update(hash);
        hasher.update(key);
        hash = hasher.finalize();
    }

    let mut digits = String::with_capacity(DIGITS_PER_SIDE);
    for chunk in hash[..30].chunks(5) {
        let value = chunk.iter().fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
        digits.push_str(&format!("{:05}", value % 100_000));
    }
    digits
}

/// 60-значный safety number для пары (локальная, удалённая) identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyNumber {
    digits: String,
}

impl SafetyNumber {
    pub fn compute(local_id: &str, local_key: &[u8], remote_id: &str, remote_key: &[u8]) -> Self {
        let local = side_digits(local_id, local_key);
        let remote = side_digits(remote_id, remote_key);

        let digits = if local <= remote {
            local + &remote
        } else {
            remote + &local
        };
        Self { digits }
    }

    pub fn digits(&self) -> &str {
        &self.digits
    }

    /// Строка для показа: 12 групп по 5 цифр
    pub fn display(&self) -> String {
        self.digits
            .as_bytes()
            .chunks(5)
            .filter_map(|group| std::str::from_utf8(group).ok())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Сравнить с тем, что ввёл или отсканировал пользователь (пробелы игнорируются)
    pub fn matches(&self, candidate: &str) -> bool {
        let normalized: String = candidate.chars().filter(|c| !c.is_whitespace()).collect();
        normalized == self.digits
    }
}

impl fmt::Display for SafetyNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display())
    }
}
