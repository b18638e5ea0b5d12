use std::sync::Arc;

use {
    deskbridge_channels::{BotOutbound, BotUser, ChannelType, DepartmentChoice},
    deskbridge_common::{DepartmentId, now_ms},
    deskbridge_config::DepartmentConfig,
    deskbridge_matrix::{
        CONVERSATION_STATE, CreateRoomRequest, Homeserver, MatrixApi, MessageContent,
        ignore_membership_conflict,
    },
    deskbridge_sessions::{
        ChatMappingStore, ChatRoomMapping, KeyedLocks, RoomRecord, RoomStatus, RoomStore, bot_owner,
    },
    deskbridge_spaces::SpaceManager,
    serde_json::json,
    tracing::{debug, info, warn},
};

use crate::error::{Error, Result};

enum Rejoin {
    Restored,
    /// The room can no longer be entered and should be replaced.
    Lost(deskbridge_matrix::Error),
}

/// Maps bot conversations to backing rooms, one per (conversation,
/// department), and forwards user text into them as the bridge account.
pub struct BridgeRouter {
    homeserver: Arc<dyn Homeserver>,
    bridge: Arc<dyn MatrixApi>,
    outbound: Arc<dyn BotOutbound>,
    rooms: Arc<dyn RoomStore>,
    mappings: Arc<dyn ChatMappingStore>,
    spaces: Option<Arc<SpaceManager>>,
    departments: Vec<DepartmentConfig>,
    locks: KeyedLocks,
}

impl BridgeRouter {
    pub fn new(
        homeserver: Arc<dyn Homeserver>,
        bridge: Arc<dyn MatrixApi>,
        outbound: Arc<dyn BotOutbound>,
        rooms: Arc<dyn RoomStore>,
        mappings: Arc<dyn ChatMappingStore>,
        departments: Vec<DepartmentConfig>,
    ) -> Self {
        let channel = outbound.channel_type();
        let departments = departments
            .into_iter()
            .filter(|d| d.serves(channel))
            .collect();
        Self {
            homeserver,
            bridge,
            outbound,
            rooms,
            mappings,
            spaces: None,
            departments,
            locks: KeyedLocks::new(),
        }
    }

    #[must_use]
    pub fn with_spaces(mut self, spaces: Arc<SpaceManager>) -> Self {
        self.spaces = Some(spaces);
        self
    }

    fn channel(&self) -> ChannelType {
        self.outbound.channel_type()
    }

    fn department(&self, id: &DepartmentId) -> Option<&DepartmentConfig> {
        self.departments.iter().find(|d| &d.id == id)
    }

    fn acting_api(&self, department: &DepartmentConfig) -> Result<Arc<dyn MatrixApi>> {
        let account = department
            .acting_account()
            .ok_or_else(|| Error::DepartmentUnavailable {
                department: department.id.clone(),
                name: department.name.clone(),
            })?;
        Ok(self
            .homeserver
            .session(&account.user_id, &account.access_token))
    }

    /// `/start [department]`. A known department is selected directly,
    /// anything else shows the menu.
    pub async fn handle_start(
        &self,
        conversation_id: &str,
        user: &BotUser,
        department: Option<&str>,
    ) -> Result<()> {
        if let Some(id) = department.map(str::trim).filter(|d| !d.is_empty()) {
            let id = DepartmentId::new(id);
            if self.department(&id).is_some() {
                self.handle_department_selected(conversation_id, user, &id)
                    .await?;
                return Ok(());
            }
            debug!(conversation_id, department_id = %id, "deep link to unknown department");
        }
        self.send_menu(conversation_id, user).await
    }

    async fn send_menu(&self, conversation_id: &str, user: &BotUser) -> Result<()> {
        let name = if user.display_name.trim().is_empty() {
            "there"
        } else {
            user.display_name.as_str()
        };
        let text = format!(
            "👋 Welcome {name}!\n\nI'm your support bot. Please select the department you'd like to contact:"
        );
        let choices: Vec<DepartmentChoice> =
            self.departments.iter().map(DepartmentChoice::from).collect();
        self.outbound
            .send_department_menu(conversation_id, &text, &choices)
            .await?;
        Ok(())
    }

    /// Connect the conversation to `department_id`, creating the room on
    /// first use. Returns the mapping now current for the conversation, or
    /// `None` when the department is unknown.
    pub async fn handle_department_selected(
        &self,
        conversation_id: &str,
        user: &BotUser,
        department_id: &DepartmentId,
    ) -> Result<Option<ChatRoomMapping>> {
        let Some(department) = self.department(department_id) else {
            self.outbound
                .send_text(conversation_id, &Error::UnknownDepartment(department_id.clone()).customer_message())
                .await?;
            return Ok(None);
        };

        let room_id = match self.resolve_room(conversation_id, user, department).await {
            Ok(room_id) => room_id,
            Err(e) => {
                warn!(conversation_id, department_id = %department_id, error = %e, "department connection failed");
                self.outbound
                    .send_text(conversation_id, &e.customer_message())
                    .await?;
                return Err(e);
            },
        };

        let mapping = self
            .record_selection(conversation_id, user, department_id, &room_id)
            .await?;
        self.leave_other_departments(conversation_id, department_id)
            .await;

        let mut text = format!("✅ Connected to {}", department.label());
        if !department.description.is_empty() {
            text.push_str("\n\n");
            text.push_str(&department.description);
        }
        text.push_str("\n\nYou can now send your message and our team will respond shortly!");
        self.outbound.send_text(conversation_id, &text).await?;
        Ok(Some(mapping))
    }

    /// Forward user text into the conversation's current room. Without a
    /// current department the conversation starts over with the menu.
    pub async fn handle_message(
        &self,
        conversation_id: &str,
        user: &BotUser,
        text: &str,
    ) -> Result<()> {
        if text.trim().is_empty() {
            return Ok(());
        }
        let current = self.mappings.current_mapping(conversation_id).await?;
        let Some((mapping, department)) =
            current.and_then(|m| self.department(&m.department_id).cloned().map(|d| (m, d)))
        else {
            return self.send_menu(conversation_id, user).await;
        };

        let owner = bot_owner(self.channel(), conversation_id);
        let record = self.rooms.get_room(&owner, &department.id).await?;
        let room_id = match record {
            Some(r) if r.is_active() => r.room_id,
            _ => self.reconnect(conversation_id, user, &department).await?,
        };

        let content = attributed(user, text);
        let room_id = match self.bridge.send_message(&room_id, &content).await {
            Ok(_) => room_id,
            Err(e) if e.is_transient() || e.is_unauthorized() => {
                return Err(self.report(conversation_id, Error::matrix("forward message", Some(&department.name), e)).await);
            },
            Err(e) => {
                debug!(conversation_id, room_id = %room_id, error = %e, "send failed, reconnecting");
                {
                    let _guard = self.locks.lock(&lock_key(&owner, &department.id)).await;
                    self.rooms
                        .mark_room_left(&owner, &department.id, "membership_lost")
                        .await?;
                }
                let room_id = self.reconnect(conversation_id, user, &department).await?;
                if let Err(e) = self.bridge.send_message(&room_id, &content).await {
                    return Err(self.report(conversation_id, Error::matrix("forward message", Some(&department.name), e)).await);
                }
                room_id
            },
        };

        if room_id != mapping.room_id {
            self.record_selection(conversation_id, user, &department.id, &room_id)
                .await?;
        }
        self.rooms.touch_room(&owner, &department.id).await?;
        debug!(conversation_id, room_id = %room_id, "message forwarded");
        Ok(())
    }

    async fn reconnect(
        &self,
        conversation_id: &str,
        user: &BotUser,
        department: &DepartmentConfig,
    ) -> Result<String> {
        match self.resolve_room(conversation_id, user, department).await {
            Ok(room_id) => Ok(room_id),
            Err(e) => Err(self.report(conversation_id, e).await),
        }
    }

    /// Tell the user something went wrong and hand the error back.
    async fn report(&self, conversation_id: &str, error: Error) -> Error {
        if let Err(e) = self
            .outbound
            .send_text(conversation_id, &error.customer_message())
            .await
        {
            warn!(conversation_id, error = %e, "failed to report error to user");
        }
        error
    }

    async fn record_selection(
        &self,
        conversation_id: &str,
        user: &BotUser,
        department_id: &DepartmentId,
        room_id: &str,
    ) -> Result<ChatRoomMapping> {
        let now = now_ms();
        let created_at = self
            .mappings
            .get_mapping(conversation_id, department_id)
            .await?
            .filter(|m| m.room_id == room_id)
            .map_or(now, |m| m.created_at);
        let mapping = ChatRoomMapping {
            external_conversation_id: conversation_id.to_string(),
            room_id: room_id.to_string(),
            department_id: department_id.clone(),
            external_user_id: user.id.clone(),
            channel: self.channel(),
            created_at,
            selected_at: now,
        };
        self.mappings.save_mapping(&mapping).await?;
        Ok(mapping)
    }

    /// Reuse, re-enter or create the room for (conversation, department).
    async fn resolve_room(
        &self,
        conversation_id: &str,
        user: &BotUser,
        department: &DepartmentConfig,
    ) -> Result<String> {
        let owner = bot_owner(self.channel(), conversation_id);
        let _guard = self.locks.lock(&lock_key(&owner, &department.id)).await;
        let mut record = self.rooms.get_room(&owner, &department.id).await?;

        if let Some(active) = record.as_ref().filter(|r| r.is_active()) {
            let joined = self
                .bridge
                .joined_rooms()
                .await
                .map_err(|e| Error::matrix("verify membership", Some(&department.name), e))?;
            if joined.contains(&active.room_id) {
                self.rooms.touch_room(&owner, &department.id).await?;
                return Ok(active.room_id.clone());
            }
            warn!(conversation_id, room_id = %active.room_id, "bridge no longer in active room");
            record = self
                .rooms
                .mark_room_left(&owner, &department.id, "membership_lost")
                .await?;
        }

        if let Some(left) = record.filter(|r| r.status == RoomStatus::Left) {
            match self.rejoin(department, &left).await? {
                Rejoin::Restored => {
                    self.rooms
                        .set_room_active(&owner, &department.id, &left.room_id, "department_switch_return")
                        .await?;
                    info!(conversation_id, department_id = %department.id, room_id = %left.room_id, "room rejoined");
                    return Ok(left.room_id);
                },
                Rejoin::Lost(e) => {
                    warn!(conversation_id, room_id = %left.room_id, error = %e, "room access lost, creating a replacement");
                    self.rooms
                        .mark_room_invalid(&owner, &department.id, "rejoin_failed")
                        .await?;
                },
            }
        }

        // A room the bridge cannot join would be replaced on every message.
        self.bridge
            .whoami()
            .await
            .map_err(|e| Error::matrix("verify bridge account", Some(&department.name), e))?;
        self.create_room(conversation_id, &owner, user, department)
            .await
    }

    /// Re-invite the bridge and join again. A refused invite or join means
    /// the room is lost; transient failures and a rejected bridge account
    /// are errors and leave the record alone.
    async fn rejoin(&self, department: &DepartmentConfig, record: &RoomRecord) -> Result<Rejoin> {
        let acting = self.acting_api(department)?;
        let room_id = record.room_id.as_str();
        let fail = |e: deskbridge_matrix::Error| -> Result<Rejoin> {
            if e.is_transient() || e.is_unauthorized() {
                Err(Error::matrix("rejoin room", Some(&department.name), e))
            } else {
                Ok(Rejoin::Lost(e))
            }
        };

        match ignore_membership_conflict(acting.invite(room_id, self.bridge.user_id()).await) {
            Err(e) if e.is_transient() => return fail(e),
            Err(e) => return Ok(Rejoin::Lost(e)),
            Ok(()) => {},
        }
        if let Err(e) = self.bridge.join(room_id).await {
            return fail(e);
        }
        match self.bridge.joined_rooms().await {
            Ok(joined) if joined.iter().any(|r| r == room_id) => Ok(Rejoin::Restored),
            Ok(_) => Ok(Rejoin::Lost(deskbridge_matrix::Error::message(format!(
                "membership in {room_id} not confirmed"
            )))),
            Err(e) => fail(e),
        }
    }

    async fn create_room(
        &self,
        conversation_id: &str,
        owner: &str,
        user: &BotUser,
        department: &DepartmentConfig,
    ) -> Result<String> {
        let channel = self.channel();
        let mut levels = department.room_power_levels();
        levels.insert(self.bridge.user_id().to_string(), 100);
        let mut invites = department.identities();
        if let Some(spaces) = &self.spaces {
            spaces.grant_placement_access(&mut invites, &mut levels);
        }
        invites.retain(|id| id != self.bridge.user_id());
        let request = CreateRoomRequest::room(format!(
            "{} ({}) - {} #{conversation_id}",
            user.display_name,
            channel.display_name(),
            department.name
        ))
        .with_topic(format!(
            "{} conversation with {} - {}",
            channel.display_name(),
            user.handle(),
            department.name
        ))
        .with_invites(invites)
        .with_power_levels(&levels)
        .with_state(
            CONVERSATION_STATE,
            "",
            json!({
                "department": department.id,
                "channel": channel,
                "owner": owner,
            }),
        );
        let room_id = self
            .bridge
            .create_room(&request)
            .await
            .map_err(|e| Error::matrix("create room", Some(&department.name), e))?;

        self.rooms
            .set_room_active(owner, &department.id, &room_id, "room_created")
            .await?;
        info!(conversation_id, department_id = %department.id, room_id = %room_id, "room created");

        if let Some(spaces) = &self.spaces
            && spaces.enabled()
            && let Err(e) = spaces
                .place_room_in_department(&room_id, channel, &department.id)
                .await
        {
            warn!(room_id = %room_id, department_id = %department.id, error = %e, "room left unorganized");
        }

        let notice = MessageContent::notice(format!(
            "New {} conversation started with {} ({})",
            channel.display_name(),
            user.display_name,
            user.handle()
        ));
        if let Err(e) = self.bridge.send_message(&room_id, &notice).await {
            warn!(room_id = %room_id, error = %e, "failed to post conversation notice");
        }
        Ok(room_id)
    }

    /// The bridge leaves rooms of departments the conversation moved away
    /// from. Records stay `left` so a return re-enters the same room.
    async fn leave_other_departments(&self, conversation_id: &str, current: &DepartmentId) {
        let owner = bot_owner(self.channel(), conversation_id);
        let rooms = match self.rooms.list_all_rooms(&owner).await {
            Ok(rooms) => rooms,
            Err(e) => {
                warn!(conversation_id, error = %e, "failed to list rooms");
                return;
            },
        };
        for (department, record) in rooms {
            if &department == current || !record.is_active() {
                continue;
            }
            let _guard = self.locks.lock(&lock_key(&owner, &department)).await;
            if let Err(e) = self.bridge.leave(&record.room_id).await {
                warn!(conversation_id, room_id = %record.room_id, error = %e, "failed to leave room");
                continue;
            }
            if let Err(e) = self
                .rooms
                .mark_room_left(&owner, &department, "department_switch")
                .await
            {
                warn!(conversation_id, department_id = %department, error = %e, "failed to record leave");
            }
        }
    }
}

fn lock_key(owner: &str, department: &DepartmentId) -> String {
    format!("{owner}/{department}")
}

/// User text tagged with who sent it.
fn attributed(user: &BotUser, text: &str) -> MessageContent {
    MessageContent::html(
        format!("**{}** ({}):\n{text}", user.display_name, user.handle()),
        format!(
            "<b>{}</b> ({}):<br/>{}",
            escape_html(&user.display_name),
            escape_html(&user.handle()),
            escape_html(text).replace('\n', "<br/>")
        ),
    )
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
