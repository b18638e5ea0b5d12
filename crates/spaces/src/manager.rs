use std::{collections::BTreeMap, sync::Arc};

use {
    dashmap::DashMap,
    deskbridge_common::{ChannelType, DepartmentId, now_ms},
    deskbridge_config::{DepartmentConfig, SpaceConfig, SpacesConfig},
    deskbridge_matrix::{
        CreateRoomRequest, ErrorKind, MatrixApi, SPACE_CHILD, SPACE_PARENT,
        ignore_membership_conflict,
    },
    deskbridge_sessions::{RoomPlacement, SpaceKind, SpaceNode, SpaceStore},
    serde::Serialize,
    serde_json::{Value, json},
    tokio::sync::Mutex,
    tracing::{debug, info, warn},
};

use crate::error::{Error, Result};

/// Default `state_default`; enough to send `m.space.parent`.
const PLACEMENT_POWER_LEVEL: i64 = 50;

/// Outcome of a [`SpaceManager::repair`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub spaces_checked: usize,
    pub spaces_relinked: usize,
    pub rooms_checked: usize,
    pub rooms_relinked: usize,
    /// Room ids that could not be placed.
    pub failed: Vec<String>,
}

/// Creates spaces on demand and files rooms under them.
///
/// Lookups go cache, then store, then server alias, then create. The whole
/// chain runs under one lock so concurrent callers never race to create the
/// same space.
pub struct SpaceManager {
    api: Arc<dyn MatrixApi>,
    store: Arc<dyn SpaceStore>,
    config: SpacesConfig,
    departments: Vec<DepartmentConfig>,
    server_name: String,
    cache: DashMap<String, String>,
    create_lock: Mutex<()>,
}

impl SpaceManager {
    pub fn new(
        api: Arc<dyn MatrixApi>,
        store: Arc<dyn SpaceStore>,
        config: SpacesConfig,
        departments: Vec<DepartmentConfig>,
        server_name: impl Into<String>,
    ) -> Self {
        Self {
            api,
            store,
            config,
            departments,
            server_name: server_name.into(),
            cache: DashMap::new(),
            create_lock: Mutex::new(()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Account that owns the hierarchy. Conversation rooms must invite it,
    /// with enough power to set `m.space.parent`, before they can be placed.
    pub fn admin_user_id(&self) -> &str {
        self.api.user_id()
    }

    /// Add the hierarchy account to a new room's invites and power levels.
    pub fn grant_placement_access(
        &self,
        invites: &mut Vec<String>,
        levels: &mut BTreeMap<String, i64>,
    ) {
        if !self.enabled() {
            return;
        }
        let admin = self.admin_user_id().to_string();
        let level = levels.entry(admin.clone()).or_insert(PLACEMENT_POWER_LEVEL);
        *level = (*level).max(PLACEMENT_POWER_LEVEL);
        if !invites.contains(&admin) {
            invites.push(admin);
        }
    }

    pub async fn ensure_root_space(&self) -> Result<String> {
        self.check_enabled()?;
        let _guard = self.create_lock.lock().await;
        self.root_locked().await
    }

    pub async fn ensure_channel_space(&self, channel: ChannelType) -> Result<String> {
        self.check_enabled()?;
        let _guard = self.create_lock.lock().await;
        self.channel_locked(channel).await
    }

    pub async fn ensure_department_space(
        &self,
        channel: ChannelType,
        department: &DepartmentId,
    ) -> Result<String> {
        self.check_enabled()?;
        let _guard = self.create_lock.lock().await;
        self.department_locked(channel, department).await
    }

    /// File `room_id` under its department space: a child link on the space
    /// and a parent link on the room. The hierarchy account joins the room
    /// first.
    ///
    /// The placement is recorded even when the hierarchy is unavailable, with
    /// no space, so [`SpaceManager::repair`] can organize the room later.
    pub async fn place_room_in_department(
        &self,
        room_id: &str,
        channel: ChannelType,
        department: &DepartmentId,
    ) -> Result<RoomPlacement> {
        let mut placement = RoomPlacement {
            room_id: room_id.to_string(),
            channel,
            department_id: department.clone(),
            space_id: None,
            placed_at: now_ms(),
        };
        let linked = match self.ensure_department_space(channel, department).await {
            Ok(space_id) => self
                .link_room(&space_id, room_id)
                .await
                .map(|()| space_id),
            Err(e) => Err(e),
        };
        match linked {
            Ok(space_id) => {
                debug!(room_id, space_id = %space_id, department_id = %department, "room placed");
                placement.space_id = Some(space_id);
                self.store.save_placement(&placement).await?;
                Ok(placement)
            },
            Err(e) => {
                self.store.save_placement(&placement).await?;
                Err(e)
            },
        }
    }

    /// Re-establish links for every known space and room whose stored
    /// placement disagrees with the server state.
    pub async fn repair(&self) -> Result<RepairReport> {
        self.check_enabled()?;
        let mut report = RepairReport::default();

        for node in self.store.list_spaces().await? {
            report.spaces_checked += 1;
            let Some(parent) = node.parent_space_id.as_deref() else {
                continue;
            };
            match self.has_child(parent, &node.space_id).await {
                Ok(true) => {},
                Ok(false) => {
                    self.link_space(parent, &node.space_id).await?;
                    report.spaces_relinked += 1;
                    info!(space_id = %node.space_id, parent, "relinked space");
                },
                Err(e) => warn!(space_id = %node.space_id, error = %e, "failed to check space link"),
            }
        }

        for placement in self.store.list_placements().await? {
            report.rooms_checked += 1;
            match self.repair_room(&placement).await {
                Ok(true) => report.rooms_relinked += 1,
                Ok(false) => {},
                Err(e) => {
                    warn!(room_id = %placement.room_id, error = %e, "failed to repair room placement");
                    report.failed.push(placement.room_id.clone());
                },
            }
        }

        info!(
            spaces_relinked = report.spaces_relinked,
            rooms_relinked = report.rooms_relinked,
            failed = report.failed.len(),
            "space repair finished"
        );
        Ok(report)
    }

    async fn repair_room(&self, placement: &RoomPlacement) -> Result<bool> {
        let expected = self
            .ensure_department_space(placement.channel, &placement.department_id)
            .await?;
        let stale = placement
            .space_id
            .as_deref()
            .filter(|current| *current != expected);
        let linked = placement.space_id.as_deref() == Some(expected.as_str())
            && self.has_child(&expected, &placement.room_id).await?
            && self.has_parent(&placement.room_id, &expected).await?;
        if linked {
            return Ok(false);
        }

        self.link_room(&expected, &placement.room_id).await?;
        if let Some(old) = stale {
            // Empty content removes a link.
            if let Err(e) = self
                .api
                .put_state(old, SPACE_CHILD, &placement.room_id, &json!({}))
                .await
            {
                warn!(room_id = %placement.room_id, space_id = old, error = %e, "failed to unlink room from old space");
            }
            if let Err(e) = self
                .api
                .put_state(&placement.room_id, SPACE_PARENT, old, &json!({}))
                .await
            {
                warn!(room_id = %placement.room_id, space_id = old, error = %e, "failed to drop old parent link");
            }
        }
        self.store
            .save_placement(&RoomPlacement {
                space_id: Some(expected),
                placed_at: now_ms(),
                ..placement.clone()
            })
            .await?;
        Ok(true)
    }

    fn check_enabled(&self) -> Result<()> {
        if self.config.enabled {
            Ok(())
        } else {
            Err(Error::Disabled)
        }
    }

    fn department(&self, id: &DepartmentId) -> Result<&DepartmentConfig> {
        self.departments
            .iter()
            .find(|d| d.id == *id)
            .ok_or_else(|| Error::UnknownDepartment(id.to_string()))
    }

    async fn root_locked(&self) -> Result<String> {
        let root = self.config.root.clone();
        let invites = self.all_identities(|_| true);
        self.ensure_space(
            SpaceNode::root_key(),
            SpaceKind::Root,
            None,
            None,
            None,
            &root,
            "deskbridge_support".into(),
            invites,
        )
        .await
    }

    async fn channel_locked(&self, channel: ChannelType) -> Result<String> {
        let root = self.root_locked().await?;
        let config = self.config.channel(channel);
        let invites = self.all_identities(|d| d.serves(channel));
        self.ensure_space(
            SpaceNode::channel_key(channel),
            SpaceKind::Channel,
            Some(root),
            Some(channel),
            None,
            &config,
            format!("deskbridge_{channel}"),
            invites,
        )
        .await
    }

    async fn department_locked(
        &self,
        channel: ChannelType,
        department: &DepartmentId,
    ) -> Result<String> {
        let dept = self.department(department)?;
        let parent = self.channel_locked(channel).await?;
        let config = SpaceConfig {
            name: format!("{} ({})", dept.label(), channel.display_name()),
            topic: format!(
                "{} conversations from {}",
                dept.name,
                channel.display_name()
            ),
            alias: None,
        };
        let invites = dept.identities();
        self.ensure_space(
            SpaceNode::department_key(channel, department),
            SpaceKind::Department,
            Some(parent),
            Some(channel),
            Some(department.clone()),
            &config,
            format!("deskbridge_{channel}_{department}"),
            invites,
        )
        .await
    }

    fn all_identities(&self, filter: impl Fn(&DepartmentConfig) -> bool) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for id in self
            .departments
            .iter()
            .filter(|d| filter(d))
            .flat_map(DepartmentConfig::identities)
        {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }

    #[allow(clippy::too_many_arguments)]
    async fn ensure_space(
        &self,
        key: String,
        kind: SpaceKind,
        parent: Option<String>,
        channel: Option<ChannelType>,
        department_id: Option<DepartmentId>,
        config: &SpaceConfig,
        default_alias: String,
        invites: Vec<String>,
    ) -> Result<String> {
        if let Some(space_id) = self.cache.get(&key) {
            return Ok(space_id.clone());
        }

        let space_id = if let Some(node) = self.store.get_space(&key).await? {
            node.space_id
        } else {
            let alias_local = config.alias.clone().unwrap_or(default_alias);
            let alias = format!("#{alias_local}:{}", self.server_name);
            let space_id = match self.api.resolve_alias(&alias).await? {
                Some(existing) => {
                    info!(key = %key, space_id = %existing, "adopting existing space");
                    existing
                },
                None => {
                    let request = CreateRoomRequest::space(config.name.clone())
                        .with_topic(config.topic.clone())
                        .with_alias(alias_local)
                        .with_invites(
                            invites
                                .into_iter()
                                .filter(|u| u != self.api.user_id()),
                        );
                    let space_id = self.api.create_room(&request).await?;
                    info!(key = %key, space_id = %space_id, name = %config.name, "created space");
                    space_id
                },
            };
            if let Some(parent) = parent.as_deref() {
                self.link_space(parent, &space_id).await?;
            }
            self.store
                .save_space(&SpaceNode {
                    key: key.clone(),
                    space_id: space_id.clone(),
                    kind,
                    parent_space_id: parent,
                    channel,
                    department_id,
                    created_at: now_ms(),
                })
                .await?;
            space_id
        };

        self.cache.insert(key, space_id.clone());
        Ok(space_id)
    }

    fn child_content(&self) -> Value {
        json!({
            "via": [self.server_name],
            "order": format!("{:020}", now_ms()),
        })
    }

    async fn link_child(&self, space_id: &str, child_id: &str) -> Result<()> {
        self.api
            .put_state(space_id, SPACE_CHILD, child_id, &self.child_content())
            .await?;
        Ok(())
    }

    fn parent_content(&self) -> Value {
        json!({ "via": [self.server_name], "canonical": true })
    }

    async fn link_room(&self, space_id: &str, room_id: &str) -> Result<()> {
        ignore_membership_conflict(self.api.join(room_id).await.map(|_| ()))?;
        self.link_child(space_id, room_id).await?;
        self.api
            .put_state(room_id, SPACE_PARENT, space_id, &self.parent_content())
            .await?;
        Ok(())
    }

    async fn link_space(&self, parent: &str, child: &str) -> Result<()> {
        self.link_child(parent, child).await?;
        if let Err(e) = self
            .api
            .put_state(child, SPACE_PARENT, parent, &self.parent_content())
            .await
        {
            // The child link is what clients render; the parent link is advisory.
            warn!(space_id = child, parent, error = %e, "failed to set space parent");
        }
        Ok(())
    }

    async fn has_child(&self, space_id: &str, child_id: &str) -> Result<bool> {
        self.has_link(space_id, SPACE_CHILD, child_id).await
    }

    async fn has_parent(&self, room_id: &str, space_id: &str) -> Result<bool> {
        self.has_link(room_id, SPACE_PARENT, space_id).await
    }

    /// A link exists when its state event carries `via`. Rooms the hierarchy
    /// account has not joined read as unlinked.
    async fn has_link(&self, room_id: &str, event_type: &str, target: &str) -> Result<bool> {
        match self.api.get_state(room_id, event_type, target).await {
            Ok(Some(content)) => Ok(content.get("via").is_some()),
            Ok(None) => Ok(false),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(deskbridge_matrix::Error::Api { errcode, .. }) if errcode == "M_FORBIDDEN" => {
                Ok(false)
            },
            Err(e) => Err(e.into()),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        deskbridge_config::AccountConfig,
        deskbridge_matrix::memory::{Fault, MemoryHomeserver, Op},
        deskbridge_sessions::InMemoryStore,
        secrecy::Secret,
    };

    fn departments() -> Vec<DepartmentConfig> {
        ["sales", "support"]
            .into_iter()
            .map(|id| DepartmentConfig {
                id: DepartmentId::new(id),
                name: id.to_uppercase(),
                icon: String::new(),
                description: String::new(),
                accounts: vec![AccountConfig {
                    user_id: format!("@{id}:localhost"),
                    access_token: Secret::new("t".into()),
                }],
                support_users: Vec::new(),
                channels: Vec::new(),
                power_levels: Default::default(),
            })
            .collect()
    }

    fn manager(hs: &MemoryHomeserver, store: Arc<InMemoryStore>) -> SpaceManager {
        SpaceManager::new(
            hs.login("@admin:localhost"),
            store,
            SpacesConfig::default(),
            departments(),
            "localhost",
        )
    }

    /// A conversation room created by a department account, inviting the
    /// hierarchy account the way the orchestrators do.
    async fn conversation_room(hs: &MemoryHomeserver) -> String {
        hs.login("@support:localhost")
            .create_room(
                &CreateRoomRequest::room("Bob (Telegram) - Support #42")
                    .with_invites(["@admin:localhost".to_string()]),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let hs = MemoryHomeserver::default();
        let spaces = manager(&hs, Arc::new(InMemoryStore::new()));
        let sales = DepartmentId::new("sales");

        let first = spaces
            .ensure_department_space(ChannelType::Web, &sales)
            .await
            .unwrap();
        let second = spaces
            .ensure_department_space(ChannelType::Web, &sales)
            .await
            .unwrap();
        let channel = spaces.ensure_channel_space(ChannelType::Web).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(
            channel,
            spaces.ensure_channel_space(ChannelType::Web).await.unwrap()
        );
        // root + web + web/sales
        assert_eq!(hs.space_ids().len(), 3);
        assert_eq!(hs.call_count(Op::CreateSpace), 3);
    }

    #[tokio::test]
    async fn hierarchy_links_parent_to_child() {
        let hs = MemoryHomeserver::default();
        let spaces = manager(&hs, Arc::new(InMemoryStore::new()));
        let sales = DepartmentId::new("sales");
        let dept = spaces
            .ensure_department_space(ChannelType::Telegram, &sales)
            .await
            .unwrap();
        let channel = spaces
            .ensure_channel_space(ChannelType::Telegram)
            .await
            .unwrap();
        let root = spaces.ensure_root_space().await.unwrap();

        assert!(hs.state(&channel, SPACE_CHILD, &dept).is_some());
        assert!(hs.state(&root, SPACE_CHILD, &channel).is_some());
        assert_eq!(
            hs.state(&root, SPACE_CHILD, &channel).unwrap()["via"][0],
            "localhost"
        );
        assert!(hs.is_invited(&dept, "@sales:localhost"));
        assert!(!hs.is_invited(&dept, "@support:localhost"));
    }

    #[tokio::test]
    async fn fresh_process_adopts_spaces_by_alias() {
        let hs = MemoryHomeserver::default();
        let sales = DepartmentId::new("sales");
        let first = manager(&hs, Arc::new(InMemoryStore::new()))
            .ensure_department_space(ChannelType::Web, &sales)
            .await
            .unwrap();

        // Empty store, same server: nothing new is created.
        let second = manager(&hs, Arc::new(InMemoryStore::new()))
            .ensure_department_space(ChannelType::Web, &sales)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(hs.space_ids().len(), 3);
    }

    #[tokio::test]
    async fn failed_space_creation_records_flat_placement() {
        let hs = MemoryHomeserver::default();
        let store = Arc::new(InMemoryStore::new());
        let spaces = manager(&hs, Arc::clone(&store));
        hs.fail(Op::CreateSpace, Fault::Forbidden, 1);

        let sales = DepartmentId::new("sales");
        let room = conversation_room(&hs).await;
        let result = spaces
            .place_room_in_department(&room, ChannelType::Web, &sales)
            .await;
        assert!(result.is_err());
        let placement = store.get_placement(&room).await.unwrap().unwrap();
        assert_eq!(placement.space_id, None);

        let report = spaces.repair().await.unwrap();
        assert_eq!(report.rooms_relinked, 1);
        let placement = store.get_placement(&room).await.unwrap().unwrap();
        let space_id = placement.space_id.unwrap();
        assert!(hs.state(&space_id, SPACE_CHILD, &room).is_some());
        assert!(hs.state(&room, SPACE_PARENT, &space_id).is_some());
    }

    #[tokio::test]
    async fn repair_restores_removed_links() {
        let hs = MemoryHomeserver::default();
        let store = Arc::new(InMemoryStore::new());
        let spaces = manager(&hs, Arc::clone(&store));
        let support = DepartmentId::new("support");
        let room = conversation_room(&hs).await;

        let placement = spaces
            .place_room_in_department(&room, ChannelType::Telegram, &support)
            .await
            .unwrap();
        let dept_space = placement.space_id.unwrap();
        let channel = spaces
            .ensure_channel_space(ChannelType::Telegram)
            .await
            .unwrap();
        hs.remove_state(&dept_space, SPACE_CHILD, &room);
        hs.remove_state(&channel, SPACE_CHILD, &dept_space);

        let report = spaces.repair().await.unwrap();
        assert_eq!(report.rooms_relinked, 1);
        assert_eq!(report.spaces_relinked, 1);
        assert!(hs.state(&dept_space, SPACE_CHILD, &room).is_some());
        assert!(hs.state(&channel, SPACE_CHILD, &dept_space).is_some());

        let again = spaces.repair().await.unwrap();
        assert_eq!(again.rooms_relinked + again.spaces_relinked, 0);
    }

    #[tokio::test]
    async fn placed_room_points_back_to_its_space() {
        let hs = MemoryHomeserver::default();
        let spaces = manager(&hs, Arc::new(InMemoryStore::new()));
        let room = conversation_room(&hs).await;

        let placement = spaces
            .place_room_in_department(&room, ChannelType::Telegram, &DepartmentId::new("support"))
            .await
            .unwrap();
        let space_id = placement.space_id.unwrap();
        assert!(hs.is_joined(&room, "@admin:localhost"));
        let parent = hs.state(&room, SPACE_PARENT, &space_id).unwrap();
        assert_eq!(parent["via"][0], "localhost");
        assert_eq!(parent["canonical"], true);
    }

    #[tokio::test]
    async fn repair_restores_a_missing_parent_link() {
        let hs = MemoryHomeserver::default();
        let store = Arc::new(InMemoryStore::new());
        let spaces = manager(&hs, Arc::clone(&store));
        let room = conversation_room(&hs).await;
        let space_id = spaces
            .place_room_in_department(&room, ChannelType::Web, &DepartmentId::new("sales"))
            .await
            .unwrap()
            .space_id
            .unwrap();

        hs.remove_state(&room, SPACE_PARENT, &space_id);
        let report = spaces.repair().await.unwrap();
        assert_eq!(report.rooms_relinked, 1);
        assert!(report.failed.is_empty());
        assert!(hs.state(&room, SPACE_PARENT, &space_id).is_some());
    }

    #[tokio::test]
    async fn rooms_without_the_hierarchy_account_fail_repair() {
        let hs = MemoryHomeserver::default();
        let store = Arc::new(InMemoryStore::new());
        let spaces = manager(&hs, Arc::clone(&store));
        let room = hs
            .login("@support:localhost")
            .create_room(&CreateRoomRequest::room("uninvited"))
            .await
            .unwrap();

        assert!(
            spaces
                .place_room_in_department(&room, ChannelType::Web, &DepartmentId::new("support"))
                .await
                .is_err()
        );
        let report = spaces.repair().await.unwrap();
        assert_eq!(report.failed, vec![room]);
    }

    #[test]
    fn placement_access_keeps_higher_levels() {
        let hs = MemoryHomeserver::default();
        let spaces = manager(&hs, Arc::new(InMemoryStore::new()));
        let mut invites = vec!["@sales:localhost".to_string()];
        let mut levels = BTreeMap::from([("@admin:localhost".to_string(), 100)]);
        spaces.grant_placement_access(&mut invites, &mut levels);
        assert_eq!(invites, ["@sales:localhost", "@admin:localhost"]);
        assert_eq!(levels["@admin:localhost"], 100);

        let mut levels = BTreeMap::new();
        spaces.grant_placement_access(&mut invites, &mut levels);
        assert_eq!(invites.len(), 2);
        assert_eq!(levels["@admin:localhost"], 50);
    }

    #[tokio::test]
    async fn disabled_hierarchy_refuses() {
        let hs = MemoryHomeserver::default();
        let spaces = SpaceManager::new(
            hs.login("@admin:localhost"),
            Arc::new(InMemoryStore::new()),
            SpacesConfig {
                enabled: false,
                ..Default::default()
            },
            departments(),
            "localhost",
        );
        assert!(matches!(
            spaces.ensure_root_space().await,
            Err(Error::Disabled)
        ));
    }

    #[tokio::test]
    async fn unknown_department_is_reported() {
        let hs = MemoryHomeserver::default();
        let spaces = manager(&hs, Arc::new(InMemoryStore::new()));
        let err = spaces
            .ensure_department_space(ChannelType::Web, &DepartmentId::new("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownDepartment(_)));
    }
}
