//! SQLite-backed state store using sqlx.

use std::{collections::BTreeMap, path::Path};

use {
    async_trait::async_trait,
    deskbridge_common::{ChannelType, DepartmentId, now_ms},
    secrecy::{ExposeSecret, Secret},
    sqlx::{
        Sqlite, SqlitePool,
        sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    },
    tracing::warn,
};

use crate::{
    Result,
    models::{
        ChatRoomMapping, CustomerSession, RoomPlacement, RoomRecord, RoomStatus, SpaceKind,
        SpaceNode,
    },
    store::{ChatMappingStore, CustomerStore, RelayStateStore, RoomStore, SpaceStore},
};

/// SQLite-backed persistence for sessions, rooms, mappings and spaces.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) a database file and run migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                crate::Error::message(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        crate::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Create a store using an existing pool (migrations must already be run).
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[derive(sqlx::FromRow)]
struct RoomRow {
    department_id: String,
    room_id: String,
    status: String,
    membership_history: String,
    created_at: i64,
    updated_at: i64,
    last_activity_at: i64,
}

impl RoomRow {
    /// Malformed rows become `None` so callers fall back to "no record".
    fn into_record(self, owner: &str) -> Option<(DepartmentId, RoomRecord)> {
        let status = match self.status.parse::<RoomStatus>() {
            Ok(status) => status,
            Err(e) => {
                warn!(owner, department_id = %self.department_id, error = %e, "ignoring malformed room record");
                return None;
            },
        };
        let membership_history = match serde_json::from_str(&self.membership_history) {
            Ok(history) => history,
            Err(e) => {
                warn!(owner, department_id = %self.department_id, error = %e, "ignoring malformed room record");
                return None;
            },
        };
        Some((DepartmentId::new(self.department_id), RoomRecord {
            room_id: self.room_id,
            status,
            membership_history,
            created_at: self.created_at as u64,
            updated_at: self.updated_at as u64,
            last_activity_at: self.last_activity_at as u64,
        }))
    }
}

const ROOM_COLUMNS: &str =
    "department_id, room_id, status, membership_history, created_at, updated_at, last_activity_at";

async fn fetch_room<'e, E>(
    executor: E,
    owner: &str,
    department: &DepartmentId,
) -> Result<Option<RoomRecord>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, RoomRow>(&format!(
        "SELECT {ROOM_COLUMNS} FROM room_records WHERE owner = ? AND department_id = ?"
    ))
    .bind(owner)
    .bind(department.as_str())
    .fetch_optional(executor)
    .await?;
    Ok(row.and_then(|r| r.into_record(owner)).map(|(_, record)| record))
}

async fn upsert_room<'e, E>(
    executor: E,
    owner: &str,
    department: &DepartmentId,
    record: &RoomRecord,
) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let history = serde_json::to_string(&record.membership_history)?;
    sqlx::query(
        r#"INSERT INTO room_records
               (owner, department_id, room_id, status, membership_history, created_at, updated_at, last_activity_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT(owner, department_id) DO UPDATE SET
               room_id = excluded.room_id,
               status = excluded.status,
               membership_history = excluded.membership_history,
               created_at = excluded.created_at,
               updated_at = excluded.updated_at,
               last_activity_at = excluded.last_activity_at"#,
    )
    .bind(owner)
    .bind(department.as_str())
    .bind(&record.room_id)
    .bind(record.status.as_str())
    .bind(&history)
    .bind(record.created_at as i64)
    .bind(record.updated_at as i64)
    .bind(record.last_activity_at as i64)
    .execute(executor)
    .await?;
    Ok(())
}

impl SqliteStore {
    async fn transition(
        &self,
        owner: &str,
        department: &DepartmentId,
        apply: impl FnOnce(&mut RoomRecord) -> bool + Send,
    ) -> Result<Option<RoomRecord>> {
        let mut tx = self.pool.begin().await?;
        let Some(mut record) = fetch_room(&mut *tx, owner, department).await? else {
            return Ok(None);
        };
        if apply(&mut record) {
            upsert_room(&mut *tx, owner, department, &record).await?;
        }
        tx.commit().await?;
        Ok(Some(record))
    }
}

#[async_trait]
impl RoomStore for SqliteStore {
    async fn get_room(&self, owner: &str, department: &DepartmentId) -> Result<Option<RoomRecord>> {
        fetch_room(&self.pool, owner, department).await
    }

    async fn set_room_active(
        &self,
        owner: &str,
        department: &DepartmentId,
        room_id: &str,
        reason: &str,
    ) -> Result<RoomRecord> {
        let mut tx = self.pool.begin().await?;
        let existing = fetch_room(&mut *tx, owner, department).await?;
        let record = RoomRecord::activated(existing, room_id, reason, now_ms());
        upsert_room(&mut *tx, owner, department, &record).await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn mark_room_left(
        &self,
        owner: &str,
        department: &DepartmentId,
        reason: &str,
    ) -> Result<Option<RoomRecord>> {
        self.transition(owner, department, |r| r.mark_left(reason, now_ms()))
            .await
    }

    async fn mark_room_invalid(
        &self,
        owner: &str,
        department: &DepartmentId,
        reason: &str,
    ) -> Result<Option<RoomRecord>> {
        self.transition(owner, department, |r| r.mark_invalid(reason, now_ms()))
            .await
    }

    async fn list_all_rooms(&self, owner: &str) -> Result<BTreeMap<DepartmentId, RoomRecord>> {
        let rows = sqlx::query_as::<_, RoomRow>(&format!(
            "SELECT {ROOM_COLUMNS} FROM room_records WHERE owner = ?"
        ))
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .filter_map(|r| r.into_record(owner))
            .collect())
    }

    async fn touch_room(&self, owner: &str, department: &DepartmentId) -> Result<()> {
        sqlx::query(
            "UPDATE room_records SET last_activity_at = ? WHERE owner = ? AND department_id = ?",
        )
        .bind(now_ms() as i64)
        .bind(owner)
        .bind(department.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn prune_invalid(&self, older_than_ms: u64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM room_records WHERE status = ? AND updated_at < ?")
            .bind(RoomStatus::Invalid.as_str())
            .bind(older_than_ms.min(i64::MAX as u64) as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[derive(sqlx::FromRow)]
struct CustomerRow {
    customer_id: String,
    display_name: Option<String>,
    backing_account_id: String,
    access_token: String,
    conversation_count: i64,
    created_at: i64,
    last_activity_at: i64,
}

#[async_trait]
impl CustomerStore for SqliteStore {
    async fn get_customer(&self, customer_id: &str) -> Result<Option<CustomerSession>> {
        let row = sqlx::query_as::<_, CustomerRow>(
            "SELECT customer_id, display_name, backing_account_id, access_token, \
             conversation_count, created_at, last_activity_at \
             FROM customer_sessions WHERE customer_id = ?",
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        if row.backing_account_id.is_empty() || row.access_token.is_empty() {
            warn!(customer_id, "ignoring customer session without backing account");
            return Ok(None);
        }
        let department_rooms = self.list_all_rooms(customer_id).await?;
        Ok(Some(CustomerSession {
            customer_id: row.customer_id,
            display_name: row.display_name,
            backing_account_id: row.backing_account_id,
            access_token: Secret::new(row.access_token),
            department_rooms,
            conversation_count: u32::try_from(row.conversation_count).unwrap_or(0),
            created_at: row.created_at as u64,
            last_activity_at: row.last_activity_at as u64,
        }))
    }

    async fn save_customer(&self, session: &CustomerSession) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO customer_sessions
                   (customer_id, display_name, backing_account_id, access_token, conversation_count, created_at, last_activity_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(customer_id) DO UPDATE SET
                   display_name = excluded.display_name,
                   backing_account_id = excluded.backing_account_id,
                   access_token = excluded.access_token,
                   conversation_count = excluded.conversation_count,
                   last_activity_at = excluded.last_activity_at"#,
        )
        .bind(&session.customer_id)
        .bind(&session.display_name)
        .bind(&session.backing_account_id)
        .bind(session.access_token.expose_secret())
        .bind(i64::from(session.conversation_count))
        .bind(session.created_at as i64)
        .bind(session.last_activity_at as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_customer(&self, customer_id: &str, new_conversation: bool) -> Result<()> {
        sqlx::query(
            "UPDATE customer_sessions SET last_activity_at = ?, \
             conversation_count = conversation_count + ? WHERE customer_id = ?",
        )
        .bind(now_ms() as i64)
        .bind(i64::from(new_conversation))
        .bind(customer_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct MappingRow {
    external_conversation_id: String,
    department_id: String,
    room_id: String,
    external_user_id: String,
    channel: String,
    created_at: i64,
    selected_at: i64,
}

impl MappingRow {
    fn into_mapping(self) -> Option<ChatRoomMapping> {
        let channel = match self.channel.parse::<ChannelType>() {
            Ok(channel) => channel,
            Err(e) => {
                warn!(conversation_id = %self.external_conversation_id, error = %e, "ignoring malformed chat mapping");
                return None;
            },
        };
        Some(ChatRoomMapping {
            external_conversation_id: self.external_conversation_id,
            room_id: self.room_id,
            department_id: DepartmentId::new(self.department_id),
            external_user_id: self.external_user_id,
            channel,
            created_at: self.created_at as u64,
            selected_at: self.selected_at as u64,
        })
    }
}

const MAPPING_SELECT: &str = "SELECT external_conversation_id, department_id, room_id, \
                              external_user_id, channel, created_at, selected_at \
                              FROM chat_room_mappings";

#[async_trait]
impl ChatMappingStore for SqliteStore {
    async fn get_mapping(
        &self,
        conversation_id: &str,
        department: &DepartmentId,
    ) -> Result<Option<ChatRoomMapping>> {
        let row = sqlx::query_as::<_, MappingRow>(&format!(
            "{MAPPING_SELECT} WHERE external_conversation_id = ? AND department_id = ?"
        ))
        .bind(conversation_id)
        .bind(department.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(MappingRow::into_mapping))
    }

    async fn current_mapping(&self, conversation_id: &str) -> Result<Option<ChatRoomMapping>> {
        let row = sqlx::query_as::<_, MappingRow>(&format!(
            "{MAPPING_SELECT} WHERE external_conversation_id = ? ORDER BY selected_at DESC LIMIT 1"
        ))
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(MappingRow::into_mapping))
    }

    async fn mapping_for_room(&self, room_id: &str) -> Result<Option<ChatRoomMapping>> {
        let row = sqlx::query_as::<_, MappingRow>(&format!(
            "{MAPPING_SELECT} WHERE room_id = ? ORDER BY selected_at DESC LIMIT 1"
        ))
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(MappingRow::into_mapping))
    }

    async fn save_mapping(&self, mapping: &ChatRoomMapping) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO chat_room_mappings
                   (external_conversation_id, department_id, room_id, external_user_id, channel, created_at, selected_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(external_conversation_id, department_id) DO UPDATE SET
                   room_id = excluded.room_id,
                   external_user_id = excluded.external_user_id,
                   channel = excluded.channel,
                   selected_at = excluded.selected_at"#,
        )
        .bind(&mapping.external_conversation_id)
        .bind(mapping.department_id.as_str())
        .bind(&mapping.room_id)
        .bind(&mapping.external_user_id)
        .bind(mapping.channel.as_str())
        .bind(mapping.created_at as i64)
        .bind(mapping.selected_at as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_mappings(&self) -> Result<Vec<ChatRoomMapping>> {
        let rows = sqlx::query_as::<_, MappingRow>(MAPPING_SELECT)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().filter_map(MappingRow::into_mapping).collect())
    }
}

#[derive(sqlx::FromRow)]
struct SpaceRow {
    key: String,
    space_id: String,
    kind: String,
    parent_space_id: Option<String>,
    channel: Option<String>,
    department_id: Option<String>,
    created_at: i64,
}

impl SpaceRow {
    fn into_node(self) -> Option<SpaceNode> {
        let kind = self.kind.parse::<SpaceKind>().ok()?;
        let channel = match self.channel {
            Some(c) => Some(c.parse::<ChannelType>().ok()?),
            None => None,
        };
        Some(SpaceNode {
            key: self.key,
            space_id: self.space_id,
            kind,
            parent_space_id: self.parent_space_id,
            channel,
            department_id: self.department_id.map(DepartmentId::new),
            created_at: self.created_at as u64,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PlacementRow {
    room_id: String,
    channel: String,
    department_id: String,
    space_id: Option<String>,
    placed_at: i64,
}

impl PlacementRow {
    fn into_placement(self) -> Option<RoomPlacement> {
        Some(RoomPlacement {
            channel: self.channel.parse().ok()?,
            room_id: self.room_id,
            department_id: DepartmentId::new(self.department_id),
            space_id: self.space_id,
            placed_at: self.placed_at as u64,
        })
    }
}

const SPACE_SELECT: &str = "SELECT key, space_id, kind, parent_space_id, channel, department_id, \
                            created_at FROM space_nodes";
const PLACEMENT_SELECT: &str =
    "SELECT room_id, channel, department_id, space_id, placed_at FROM room_placements";

#[async_trait]
impl SpaceStore for SqliteStore {
    async fn get_space(&self, key: &str) -> Result<Option<SpaceNode>> {
        let row = sqlx::query_as::<_, SpaceRow>(&format!("{SPACE_SELECT} WHERE key = ?"))
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(SpaceRow::into_node))
    }

    async fn save_space(&self, node: &SpaceNode) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO space_nodes (key, space_id, kind, parent_space_id, channel, department_id, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(key) DO UPDATE SET
                   space_id = excluded.space_id,
                   kind = excluded.kind,
                   parent_space_id = excluded.parent_space_id,
                   channel = excluded.channel,
                   department_id = excluded.department_id"#,
        )
        .bind(&node.key)
        .bind(&node.space_id)
        .bind(node.kind.as_str())
        .bind(&node.parent_space_id)
        .bind(node.channel.as_ref().map(ChannelType::as_str))
        .bind(node.department_id.as_ref().map(DepartmentId::as_str))
        .bind(node.created_at as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_spaces(&self) -> Result<Vec<SpaceNode>> {
        let rows = sqlx::query_as::<_, SpaceRow>(&format!("{SPACE_SELECT} ORDER BY key"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().filter_map(SpaceRow::into_node).collect())
    }

    async fn get_placement(&self, room_id: &str) -> Result<Option<RoomPlacement>> {
        let row =
            sqlx::query_as::<_, PlacementRow>(&format!("{PLACEMENT_SELECT} WHERE room_id = ?"))
                .bind(room_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(PlacementRow::into_placement))
    }

    async fn save_placement(&self, placement: &RoomPlacement) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO room_placements (room_id, channel, department_id, space_id, placed_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(room_id) DO UPDATE SET
                   channel = excluded.channel,
                   department_id = excluded.department_id,
                   space_id = excluded.space_id,
                   placed_at = excluded.placed_at"#,
        )
        .bind(&placement.room_id)
        .bind(placement.channel.as_str())
        .bind(placement.department_id.as_str())
        .bind(&placement.space_id)
        .bind(placement.placed_at as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_placements(&self) -> Result<Vec<RoomPlacement>> {
        let rows = sqlx::query_as::<_, PlacementRow>(PLACEMENT_SELECT)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(PlacementRow::into_placement)
            .collect())
    }
}

#[async_trait]
impl RelayStateStore for SqliteStore {
    async fn load_relay_state(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM relay_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn save_relay_state(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO relay_state (key, value, updated_at) VALUES (?, ?, ?)
               ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at"#,
        )
        .bind(key)
        .bind(value)
        .bind(now_ms() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
