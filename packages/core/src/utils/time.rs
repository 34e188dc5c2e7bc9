// Время

use chrono::Utc;

/// Текущий Unix timestamp в секундах
pub fn current_timestamp() -> i64 {
    Utc::now().timestamp()
}

/// Текущий Unix timestamp в миллисекундах (timestamp envelope, как у Signal)
pub fn current_timestamp_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}
