//! Forward Monitor: relays Discord channel messages into Telegram chats.

pub mod channels;
pub mod config;
pub mod error;
pub mod net;
pub mod pipeline;
pub mod state;
