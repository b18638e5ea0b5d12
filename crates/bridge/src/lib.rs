//! Bot-channel bridge: maps bot conversations to backing rooms and relays
//! messages both ways.
//!
//! Inbound, transports call [`BridgeRouter`] for `/start`, department
//! selection and plain text. Outbound, [`RelayService`] polls the bridge
//! account's sync feed on a fixed schedule and forwards agent replies,
//! dropping backlog, echoes, system notices and duplicates.

pub mod error;
pub mod filter;
pub mod registry;
pub mod relay;
pub mod router;

#[cfg(test)]
pub(crate) mod testing;

pub use {
    error::{Error, Result},
    filter::{DEFAULT_SYSTEM_NOTICE_PATTERNS, Skip, SystemNoticeFilter},
    registry::ProcessedMessageRegistry,
    relay::{RelayReport, RelayService},
    router::BridgeRouter,
};
