// Логирование
//
// Все модули пишут через `tracing` с явным `target:`.
// Приложение (или тест) один раз вызывает `init_tracing`.

use tracing_subscriber::EnvFilter;

/// Установить fmt subscriber. `RUST_LOG` имеет приоритет над `default_filter`.
///
/// Повторный вызов ничего не делает.
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Короткий hex-префикс публичного ключа для логов
pub fn key_prefix(key: &[u8]) -> String {
    hex::encode(&key[..key.len().min(4)])
}
