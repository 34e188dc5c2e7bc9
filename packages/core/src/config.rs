//! Централизованная конфигурация для Signet Core
//!
//! Все константы и настройки ядра определены здесь, чтобы избежать
//! хардкода по всему проекту. Компоненты получают `Config` при создании,
//! `Config::global()` используется там, где экземпляра нет под рукой.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;

/// Глобальная конфигурация (синглтон)
static GLOBAL_CONFIG: OnceLock<Config> = OnceLock::new();

/// Основная структура конфигурации
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // ============================================
    // КРИПТОГРАФИЧЕСКИЕ ПАРАМЕТРЫ
    // ============================================

    /// PBKDF2: количество итераций для деривации ключа хранилища из пароля
    pub pbkdf2_iterations: u32,

    /// Длина соли для PBKDF2 (в байтах)
    pub salt_length: usize,

    /// Длина nonce для AES-GCM (в байтах)
    pub nonce_length: usize,

    /// Длина nonce для ChaCha20Poly1305 (в байтах)
    pub chacha_nonce_length: usize,

    /// ID классического криптографического набора
    pub classic_suite_id: u16,

    /// Минимальная длина пароля хранилища
    pub password_min_length: usize,

    // ============================================
    // DOUBLE RATCHET ПАРАМЕТРЫ
    // ============================================

    /// Окно пропуска: максимальный прыжок вперёд внутри одной цепочки
    pub max_skipped_messages: u32,

    /// Максимум хранимых skipped message keys на одну receiving chain
    pub max_message_keys: usize,

    /// Сколько предыдущих receiving chains хранится в сессии
    pub max_receiver_chains: usize,

    /// Максимальный возраст пропущенных ключей сообщений (в секундах)
    /// По умолчанию: 7 дней
    pub max_skipped_message_age_seconds: i64,

    // ============================================
    // PRE-KEYS
    // ============================================

    /// Размер пачки one-time pre-keys при пополнении
    pub one_time_prekey_batch_size: usize,

    /// Порог, ниже которого пул one-time pre-keys пополняется
    pub one_time_prekey_low_water_mark: usize,

    /// Период ротации signed pre-key (в секундах). По умолчанию: 2 дня
    pub signed_prekey_rotation_secs: i64,

    /// Сколько хранятся старые signed pre-keys (в секундах). По умолчанию: 30 дней
    pub prekey_cleanup_period_secs: i64,

    // ============================================
    // ХРАНИЛИЩЕ
    // ============================================

    /// Число неудачных попыток unlock, после которого хранилище блокируется
    pub max_unlock_attempts: u32,

    // ============================================
    // PIPELINE
    // ============================================

    /// Размер dedup-кеша (sender, device, timestamp)
    pub dedup_capacity: usize,

    /// Начальная задержка повторной отправки (мс)
    pub send_retry_initial_ms: u64,

    /// Максимальная задержка повторной отправки (мс)
    pub send_retry_max_ms: u64,

    /// Максимум попыток отправки одного сообщения (0 = бесконечно)
    pub send_max_attempts: u32,

    /// Период фонового обслуживания (ротация, пополнение, GC), в секундах
    pub maintenance_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Криптография
            pbkdf2_iterations: 100_000,
            salt_length: 32,
            nonce_length: 12,
            chacha_nonce_length: 12,
            classic_suite_id: 1,
            password_min_length: 8,

            // Double Ratchet
            max_skipped_messages: 2000,
            max_message_keys: 2000,
            max_receiver_chains: 5,
            max_skipped_message_age_seconds: 7 * 24 * 60 * 60, // 7 days

            // Pre-keys
            one_time_prekey_batch_size: 100,
            one_time_prekey_low_water_mark: 10,
            signed_prekey_rotation_secs: 2 * 24 * 60 * 60, // 2 days
            prekey_cleanup_period_secs: 30 * 24 * 60 * 60, // 30 days

            // Хранилище
            max_unlock_attempts: 5,

            // Pipeline
            dedup_capacity: 4096,
            send_retry_initial_ms: 1000,
            send_retry_max_ms: 30_000,
            send_max_attempts: 8,
            maintenance_interval_secs: 60 * 60,
        }
    }
}

impl Config {
    /// Создать конфигурацию из переменных окружения
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // Переопределяем значения из env, если они заданы
        if let Some(parsed) = env_parse("MAX_SKIPPED_MESSAGES") {
            config.max_skipped_messages = parsed;
        }

        if let Some(parsed) = env_parse("PBKDF2_ITERATIONS") {
            config.pbkdf2_iterations = parsed;
        }

        if let Some(parsed) = env_parse("PREKEY_LOW_WATER_MARK") {
            config.one_time_prekey_low_water_mark = parsed;
        }

        if let Some(parsed) = env_parse("SEND_RETRY_MAX_MS") {
            config.send_retry_max_ms = parsed;
        }

        config
    }

    /// Загрузить конфигурацию из JSON файла; отсутствующие поля берутся по умолчанию
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| format!("Failed to read config: {}", e))?;
        serde_json::from_str(&raw).map_err(|e| format!("Invalid config: {}", e))
    }

    /// Получить глобальный экземпляр конфигурации
    ///
    /// Автоматически инициализирует конфигурацию со значениями по умолчанию при первом вызове
    pub fn global() -> &'static Config {
        GLOBAL_CONFIG.get_or_init(Config::default)
    }

    /// Инициализировать глобальную конфигурацию из переменных окружения
    ///
    /// # Errors
    ///
    /// Возвращает ошибку, если конфигурация уже была инициализирована
    pub fn init_from_env() -> Result<(), &'static str> {
        GLOBAL_CONFIG
            .set(Self::from_env())
            .map_err(|_| "Config already initialized")
    }

    /// Инициализировать глобальную конфигурацию с кастомным экземпляром
    ///
    /// # Errors
    ///
    /// Возвращает ошибку, если конфигурация уже была инициализирована
    pub fn init_with(config: Config) -> Result<(), &'static str> {
        GLOBAL_CONFIG
            .set(config)
            .map_err(|_| "Config already initialized")
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|val| val.parse().ok())
}
