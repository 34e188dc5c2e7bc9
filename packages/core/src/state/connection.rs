use crate::config::Config;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

/// Состояние подключения к серверу
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    /// Соединение есть, идёт выкачивание очереди сервера
    Synchronizing,
    Connected,
}

impl ConnectionState {
    fn to_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Synchronizing => 1,
            ConnectionState::Connected => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Synchronizing,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Состояние подключения, которое транспорт обновляет из своего потока
#[derive(Debug)]
pub struct ConnectionCell(AtomicU8);

impl ConnectionCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::Disconnected.to_u8()))
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Возвращает предыдущее состояние
    pub fn set(&self, state: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.0.swap(state.to_u8(), Ordering::AcqRel))
    }
}

impl Default for ConnectionCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential backoff для повторных отправок
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    attempts: u32,
    /// 0 = бесконечно
    max_attempts: u32,
    current_delay_ms: u64,
    initial_delay_ms: u64,
    max_delay_ms: u64,
}

impl RetryBackoff {
    pub fn new(config: &Config) -> Self {
        Self {
            attempts: 0,
            max_attempts: config.send_max_attempts,
            current_delay_ms: config.send_retry_initial_ms,
            initial_delay_ms: config.send_retry_initial_ms,
            max_delay_ms: config.send_retry_max_ms,
        }
    }

    /// Задержка перед следующей попыткой; удваивается до потолка
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay_ms;
        self.current_delay_ms = self.current_delay_ms.saturating_mul(2).min(self.max_delay_ms);
        self.attempts += 1;
        Duration::from_millis(delay)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current_delay_ms = self.initial_delay_ms;
    }

    pub fn can_retry(&self) -> bool {
        self.max_attempts == 0 || self.attempts < self.max_attempts
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
