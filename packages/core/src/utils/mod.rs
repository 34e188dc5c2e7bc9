// Вспомогательные модули

pub mod error;
pub mod logging;
pub mod time;
