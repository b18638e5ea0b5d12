//! Customer-facing channel abstractions.
//!
//! The bridge router talks to a bot transport only through [`BotOutbound`];
//! transports call back into the router with [`BotUser`] and the text or
//! department selection they received.

pub mod error;
pub mod plugin;

pub use {
    deskbridge_common::ChannelType,
    error::{Error, Result},
    plugin::{BotOutbound, BotUser, DepartmentChoice, parse_department_callback},
};
