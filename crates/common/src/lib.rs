//! Shared error plumbing, identifiers and small utilities used across all
//! deskbridge crates.

pub mod error;
pub mod time;
pub mod types;

pub use {
    error::{Error, FromMessage, Result},
    time::now_ms,
    types::{ChannelType, DepartmentId, server_name_of},
};
