//! Space hierarchy: one root space, one space per channel under it, and one
//! space per department under each channel. Conversation rooms are filed
//! under their department space, never directly under the root.

pub mod error;
pub mod manager;

pub use {
    error::{Error, Result},
    manager::{RepairReport, SpaceManager},
};
