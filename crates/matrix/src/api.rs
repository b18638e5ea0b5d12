use std::sync::Arc;

use {async_trait::async_trait, secrecy::Secret, serde_json::Value};

use crate::{
    error::Result,
    types::{CreateRoomRequest, MessageContent, Registration, SyncBatch, TimelineEvent, Whoami},
};

/// Operations performed on behalf of one account.
#[async_trait]
pub trait MatrixApi: Send + Sync {
    /// The account this session acts as.
    fn user_id(&self) -> &str;

    async fn whoami(&self) -> Result<Whoami>;

    /// Create a room and return its id.
    async fn create_room(&self, request: &CreateRoomRequest) -> Result<String>;

    async fn invite(&self, room_id: &str, user_id: &str) -> Result<()>;

    /// Join by room id or alias; returns the room id.
    async fn join(&self, room_id_or_alias: &str) -> Result<String>;

    async fn leave(&self, room_id: &str) -> Result<()>;

    async fn joined_rooms(&self) -> Result<Vec<String>>;

    async fn joined_members(&self, room_id: &str) -> Result<Vec<String>>;

    /// Send an `m.room.message` and return the event id.
    async fn send_message(&self, room_id: &str, content: &MessageContent) -> Result<String>;

    async fn put_state(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: &Value,
    ) -> Result<String>;

    /// Current content of one state event, or `None` if unset.
    async fn get_state(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<Value>>;

    /// Resolve `#alias:server` to a room id, or `None` if unknown.
    async fn resolve_alias(&self, alias: &str) -> Result<Option<String>>;

    /// Last `limit` timeline events of a room, oldest first.
    async fn messages(&self, room_id: &str, limit: u32) -> Result<Vec<TimelineEvent>>;

    /// Events since `since` (or a fresh initial batch when `None`).
    async fn sync(&self, since: Option<&str>, timeout_ms: u64) -> Result<SyncBatch>;
}

/// Factory for sessions and account provisioning.
#[async_trait]
pub trait Homeserver: Send + Sync {
    /// Server name used in user ids, aliases and `via` hints.
    fn server_name(&self) -> &str;

    fn session(&self, user_id: &str, access_token: &Secret<String>) -> Arc<dyn MatrixApi>;

    /// Create an account through the admin registration API.
    async fn register(&self, localpart: &str, password: &str, admin: bool)
    -> Result<Registration>;

    /// Whether [`Homeserver::register`] is usable.
    fn can_register(&self) -> bool;
}

/// Treat "already a member" as success.
pub fn ignore_membership_conflict(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_membership_conflict() => Ok(()),
        other => other,
    }
}
