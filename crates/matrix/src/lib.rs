//! Client for the backing chat protocol (Matrix client-server API).
//!
//! [`MatrixApi`] is a session bound to one account. [`Homeserver`] hands out
//! sessions and provisions accounts. Both have an HTTP implementation
//! ([`HttpHomeserver`]) and an in-process one ([`memory::MemoryHomeserver`])
//! used by tests across the workspace.

pub mod admin;
pub mod api;
pub mod client;
pub mod error;
pub mod memory;
pub mod types;

pub use {
    api::{Homeserver, MatrixApi, ignore_membership_conflict},
    client::{HttpHomeserver, MatrixClient},
    error::{Error, ErrorKind, Result},
    types::{
        CreateRoomRequest, MessageContent, Registration, StateEvent, SyncBatch, TimelineEvent,
        Whoami,
    },
};

/// Event type of space child links, stored on the parent space.
pub const SPACE_CHILD: &str = "m.space.child";
/// Event type of space parent links, stored on the child room.
pub const SPACE_PARENT: &str = "m.space.parent";
/// Custom state event recording who a conversation room belongs to.
pub const CONVERSATION_STATE: &str = "io.deskbridge.conversation";
