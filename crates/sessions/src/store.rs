//! Store traits shared by the SQLite and in-memory backends.
//!
//! Room records are keyed by an owner string: a website customer id or a
//! [`bot_owner`](crate::bot_owner) key. Writes are last-writer-wins per
//! (owner, department). Malformed rows read back as "no record".

use std::collections::BTreeMap;

use {async_trait::async_trait, deskbridge_common::DepartmentId};

use crate::{
    Result,
    models::{ChatRoomMapping, CustomerSession, RoomPlacement, RoomRecord, SpaceNode},
};

#[async_trait]
pub trait RoomStore: Send + Sync {
    async fn get_room(&self, owner: &str, department: &DepartmentId) -> Result<Option<RoomRecord>>;

    /// Record `room_id` as the active room. Returns the stored record.
    async fn set_room_active(
        &self,
        owner: &str,
        department: &DepartmentId,
        room_id: &str,
        reason: &str,
    ) -> Result<RoomRecord>;

    /// `active -> left`, keeping the room id. `None` if there is no record.
    async fn mark_room_left(
        &self,
        owner: &str,
        department: &DepartmentId,
        reason: &str,
    ) -> Result<Option<RoomRecord>>;

    /// Any state `-> invalid`. `None` if there is no record.
    async fn mark_room_invalid(
        &self,
        owner: &str,
        department: &DepartmentId,
        reason: &str,
    ) -> Result<Option<RoomRecord>>;

    async fn list_all_rooms(&self, owner: &str) -> Result<BTreeMap<DepartmentId, RoomRecord>>;

    /// Bump `last_activity_at` of a record.
    async fn touch_room(&self, owner: &str, department: &DepartmentId) -> Result<()>;

    /// Delete `invalid` records whose last status change is before
    /// `older_than_ms`. Returns the number removed.
    async fn prune_invalid(&self, older_than_ms: u64) -> Result<u64>;
}

#[async_trait]
pub trait CustomerStore: Send + Sync {
    /// Session with its department rooms filled in.
    async fn get_customer(&self, customer_id: &str) -> Result<Option<CustomerSession>>;

    /// Insert or replace the session row. `department_rooms` is ignored;
    /// rooms are written through [`RoomStore`].
    async fn save_customer(&self, session: &CustomerSession) -> Result<()>;

    /// Bump `last_activity_at`, optionally counting a new conversation.
    async fn touch_customer(&self, customer_id: &str, new_conversation: bool) -> Result<()>;
}

#[async_trait]
pub trait ChatMappingStore: Send + Sync {
    async fn get_mapping(
        &self,
        conversation_id: &str,
        department: &DepartmentId,
    ) -> Result<Option<ChatRoomMapping>>;

    /// The most recently selected department's mapping.
    async fn current_mapping(&self, conversation_id: &str) -> Result<Option<ChatRoomMapping>>;

    async fn mapping_for_room(&self, room_id: &str) -> Result<Option<ChatRoomMapping>>;

    async fn save_mapping(&self, mapping: &ChatRoomMapping) -> Result<()>;

    async fn list_mappings(&self) -> Result<Vec<ChatRoomMapping>>;
}

#[async_trait]
pub trait SpaceStore: Send + Sync {
    async fn get_space(&self, key: &str) -> Result<Option<SpaceNode>>;
    async fn save_space(&self, node: &SpaceNode) -> Result<()>;
    async fn list_spaces(&self) -> Result<Vec<SpaceNode>>;
    async fn get_placement(&self, room_id: &str) -> Result<Option<RoomPlacement>>;
    async fn save_placement(&self, placement: &RoomPlacement) -> Result<()>;
    async fn list_placements(&self) -> Result<Vec<RoomPlacement>>;
}

/// Small key-value table for the relay's sync cursor.
#[async_trait]
pub trait RelayStateStore: Send + Sync {
    async fn load_relay_state(&self, key: &str) -> Result<Option<String>>;
    async fn save_relay_state(&self, key: &str, value: &str) -> Result<()>;
}
