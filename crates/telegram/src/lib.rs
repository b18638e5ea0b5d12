//! Telegram transport for the bot-channel bridge.
//!
//! Long-polls `getUpdates`, turns `/start`, department buttons and text into
//! [`deskbridge_bridge::BridgeRouter`] calls, and implements
//! [`deskbridge_channels::BotOutbound`] for replies.

pub mod bot;
pub mod error;
pub mod handlers;
pub mod outbound;

pub use {
    bot::{build_bot, start_polling},
    error::{Error, Result},
    outbound::TelegramOutbound,
};
