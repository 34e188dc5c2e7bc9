// Состояние ядра, не относящееся к криптографии

pub mod connection;

pub use connection::{ConnectionCell, ConnectionState, RetryBackoff};
