//! Chat transports that deliver reminders and feed inbound updates back to
//! the engine.

pub mod telegram;

pub use telegram::{TelegramConfig, TelegramTransport};
