//! Conversation state: which backing room each customer (or bot
//! conversation) uses per department, plus space hierarchy bookkeeping and
//! the relay cursor.
//!
//! Leaving a room and forgetting it are separate transitions: a `left`
//! record keeps its room id so the conversation can be resumed.

pub mod error;
pub mod locks;
pub mod models;
pub mod store;
pub mod store_memory;
pub mod store_sqlite;

pub use {
    error::{Error, Result},
    locks::KeyedLocks,
    models::{
        ChatRoomMapping, CustomerSession, MembershipAction, MembershipEvent, RoomPlacement,
        RoomRecord, RoomStatus, SpaceKind, SpaceNode, bot_owner,
    },
    store::{ChatMappingStore, CustomerStore, RelayStateStore, RoomStore, SpaceStore},
    store_memory::InMemoryStore,
    store_sqlite::SqliteStore,
};

/// Run database migrations for the state store.
///
/// Creates the session, room, mapping, space and relay tables. Call at
/// startup before [`SqliteStore::with_pool`].
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .set_ignore_missing(true)
        .run(pool)
        .await?;
    Ok(())
}
