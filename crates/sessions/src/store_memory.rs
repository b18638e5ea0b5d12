//! In-memory store for testing.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Mutex,
};

use {
    async_trait::async_trait,
    deskbridge_common::{DepartmentId, now_ms},
};

use crate::{
    Result,
    models::{ChatRoomMapping, CustomerSession, RoomPlacement, RoomRecord, RoomStatus, SpaceNode},
    store::{ChatMappingStore, CustomerStore, RelayStateStore, RoomStore, SpaceStore},
};

type RoomKey = (String, DepartmentId);

/// In-memory store backed by maps. No persistence.
#[derive(Default)]
pub struct InMemoryStore {
    rooms: Mutex<HashMap<RoomKey, RoomRecord>>,
    customers: Mutex<HashMap<String, CustomerSession>>,
    mappings: Mutex<HashMap<RoomKey, ChatRoomMapping>>,
    spaces: Mutex<BTreeMap<String, SpaceNode>>,
    placements: Mutex<BTreeMap<String, RoomPlacement>>,
    relay: Mutex<HashMap<String, String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn update_room(
        &self,
        owner: &str,
        department: &DepartmentId,
        apply: impl FnOnce(&mut RoomRecord),
    ) -> Option<RoomRecord> {
        let mut rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        let record = rooms.get_mut(&(owner.to_string(), department.clone()))?;
        apply(record);
        Some(record.clone())
    }
}

#[async_trait]
impl RoomStore for InMemoryStore {
    async fn get_room(&self, owner: &str, department: &DepartmentId) -> Result<Option<RoomRecord>> {
        let rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        Ok(rooms.get(&(owner.to_string(), department.clone())).cloned())
    }

    async fn set_room_active(
        &self,
        owner: &str,
        department: &DepartmentId,
        room_id: &str,
        reason: &str,
    ) -> Result<RoomRecord> {
        let mut rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        let key = (owner.to_string(), department.clone());
        let record = RoomRecord::activated(rooms.remove(&key), room_id, reason, now_ms());
        rooms.insert(key, record.clone());
        Ok(record)
    }

    async fn mark_room_left(
        &self,
        owner: &str,
        department: &DepartmentId,
        reason: &str,
    ) -> Result<Option<RoomRecord>> {
        Ok(self.update_room(owner, department, |r| {
            r.mark_left(reason, now_ms());
        }))
    }

    async fn mark_room_invalid(
        &self,
        owner: &str,
        department: &DepartmentId,
        reason: &str,
    ) -> Result<Option<RoomRecord>> {
        Ok(self.update_room(owner, department, |r| {
            r.mark_invalid(reason, now_ms());
        }))
    }

    async fn list_all_rooms(&self, owner: &str) -> Result<BTreeMap<DepartmentId, RoomRecord>> {
        let rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        Ok(rooms
            .iter()
            .filter(|((o, _), _)| o == owner)
            .map(|((_, dept), record)| (dept.clone(), record.clone()))
            .collect())
    }

    async fn touch_room(&self, owner: &str, department: &DepartmentId) -> Result<()> {
        self.update_room(owner, department, |r| r.last_activity_at = now_ms());
        Ok(())
    }

    async fn prune_invalid(&self, older_than_ms: u64) -> Result<u64> {
        let mut rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        let before = rooms.len();
        rooms.retain(|_, r| !(r.status == RoomStatus::Invalid && r.updated_at < older_than_ms));
        Ok((before - rooms.len()) as u64)
    }
}

#[async_trait]
impl CustomerStore for InMemoryStore {
    async fn get_customer(&self, customer_id: &str) -> Result<Option<CustomerSession>> {
        let session = {
            let customers = self.customers.lock().unwrap_or_else(|e| e.into_inner());
            customers.get(customer_id).cloned()
        };
        let Some(mut session) = session else {
            return Ok(None);
        };
        session.department_rooms = self.list_all_rooms(customer_id).await?;
        Ok(Some(session))
    }

    async fn save_customer(&self, session: &CustomerSession) -> Result<()> {
        let mut stored = session.clone();
        stored.department_rooms.clear();
        let mut customers = self.customers.lock().unwrap_or_else(|e| e.into_inner());
        customers.insert(session.customer_id.clone(), stored);
        Ok(())
    }

    async fn touch_customer(&self, customer_id: &str, new_conversation: bool) -> Result<()> {
        let mut customers = self.customers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(session) = customers.get_mut(customer_id) {
            session.last_activity_at = now_ms();
            if new_conversation {
                session.conversation_count += 1;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ChatMappingStore for InMemoryStore {
    async fn get_mapping(
        &self,
        conversation_id: &str,
        department: &DepartmentId,
    ) -> Result<Option<ChatRoomMapping>> {
        let mappings = self.mappings.lock().unwrap_or_else(|e| e.into_inner());
        Ok(mappings
            .get(&(conversation_id.to_string(), department.clone()))
            .cloned())
    }

    async fn current_mapping(&self, conversation_id: &str) -> Result<Option<ChatRoomMapping>> {
        let mappings = self.mappings.lock().unwrap_or_else(|e| e.into_inner());
        Ok(mappings
            .values()
            .filter(|m| m.external_conversation_id == conversation_id)
            .max_by_key(|m| m.selected_at)
            .cloned())
    }

    async fn mapping_for_room(&self, room_id: &str) -> Result<Option<ChatRoomMapping>> {
        let mappings = self.mappings.lock().unwrap_or_else(|e| e.into_inner());
        Ok(mappings.values().find(|m| m.room_id == room_id).cloned())
    }

    async fn save_mapping(&self, mapping: &ChatRoomMapping) -> Result<()> {
        let mut mappings = self.mappings.lock().unwrap_or_else(|e| e.into_inner());
        mappings.insert(
            (
                mapping.external_conversation_id.clone(),
                mapping.department_id.clone(),
            ),
            mapping.clone(),
        );
        Ok(())
    }

    async fn list_mappings(&self) -> Result<Vec<ChatRoomMapping>> {
        let mappings = self.mappings.lock().unwrap_or_else(|e| e.into_inner());
        Ok(mappings.values().cloned().collect())
    }
}

#[async_trait]
impl SpaceStore for InMemoryStore {
    async fn get_space(&self, key: &str) -> Result<Option<SpaceNode>> {
        let spaces = self.spaces.lock().unwrap_or_else(|e| e.into_inner());
        Ok(spaces.get(key).cloned())
    }

    async fn save_space(&self, node: &SpaceNode) -> Result<()> {
        let mut spaces = self.spaces.lock().unwrap_or_else(|e| e.into_inner());
        spaces.insert(node.key.clone(), node.clone());
        Ok(())
    }

    async fn list_spaces(&self) -> Result<Vec<SpaceNode>> {
        let spaces = self.spaces.lock().unwrap_or_else(|e| e.into_inner());
        Ok(spaces.values().cloned().collect())
    }

    async fn get_placement(&self, room_id: &str) -> Result<Option<RoomPlacement>> {
        let placements = self.placements.lock().unwrap_or_else(|e| e.into_inner());
        Ok(placements.get(room_id).cloned())
    }

    async fn save_placement(&self, placement: &RoomPlacement) -> Result<()> {
        let mut placements = self.placements.lock().unwrap_or_else(|e| e.into_inner());
        placements.insert(placement.room_id.clone(), placement.clone());
        Ok(())
    }

    async fn list_placements(&self) -> Result<Vec<RoomPlacement>> {
        let placements = self.placements.lock().unwrap_or_else(|e| e.into_inner());
        Ok(placements.values().cloned().collect())
    }
}

#[async_trait]
impl RelayStateStore for InMemoryStore {
    async fn load_relay_state(&self, key: &str) -> Result<Option<String>> {
        let relay = self.relay.lock().unwrap_or_else(|e| e.into_inner());
        Ok(relay.get(key).cloned())
    }

    async fn save_relay_state(&self, key: &str, value: &str) -> Result<()> {
        let mut relay = self.relay.lock().unwrap_or_else(|e| e.into_inner());
        relay.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prune_only_removes_old_invalid_records() {
        let store = InMemoryStore::new();
        let sales = DepartmentId::new("sales");
        let support = DepartmentId::new("support");
        store.set_room_active("u1", &sales, "!a:hs", "room_created").await.unwrap();
        store.set_room_active("u1", &support, "!b:hs", "room_created").await.unwrap();
        store.mark_room_invalid("u1", &sales, "rejoin_failed").await.unwrap();

        assert_eq!(store.prune_invalid(0).await.unwrap(), 0);
        assert_eq!(store.prune_invalid(u64::MAX).await.unwrap(), 1);
        let rooms = store.list_all_rooms("u1").await.unwrap();
        assert_eq!(rooms.len(), 1);
        assert!(rooms.contains_key(&support));
    }

    #[tokio::test]
    async fn current_mapping_is_latest_selection() {
        let store = InMemoryStore::new();
        for (dept, at) in [("sales", 1), ("support", 5)] {
            store
                .save_mapping(&ChatRoomMapping {
                    external_conversation_id: "42".into(),
                    room_id: format!("!{dept}:hs"),
                    department_id: DepartmentId::new(dept),
                    external_user_id: "7".into(),
                    channel: deskbridge_common::ChannelType::Telegram,
                    created_at: at,
                    selected_at: at,
                })
                .await
                .unwrap();
        }
        let current = store.current_mapping("42").await.unwrap().unwrap();
        assert_eq!(current.department_id.as_str(), "support");
    }
}
