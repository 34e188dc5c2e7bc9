// Signet Core
// Session, key management and message pipeline engine with end-to-end encryption

#![warn(clippy::all)]
#![allow(clippy::too_many_arguments)]

// Модули
pub mod api;
pub mod config;
pub mod crypto;
pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod session;
pub mod state;
pub mod storage;
pub mod trust;
pub mod utils;

// Re-exports для удобства
pub use api::{CoreEvent, MaintenanceReport, MessengerCore};
pub use config::Config;
pub use crypto::suites::classic::ClassicSuiteProvider;
pub use pipeline::ReceivedMessage;
pub use session::SessionAddress;
pub use trust::TrustState;
pub use utils::error::{CoreError, ErrorClass};
