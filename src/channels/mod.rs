//! Service adapters: the Discord source feed and the Telegram destination.

pub mod discord;
pub mod telegram;

pub use discord::DiscordSource;
pub use telegram::{BotIdentity, TelegramDestination};
