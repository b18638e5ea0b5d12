//! In-process homeserver with fault injection.
//!
//! Implements enough membership, state and timeline semantics for the
//! orchestrator, space manager and relay to run without a real server.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, MutexGuard},
};

use {
    async_trait::async_trait,
    deskbridge_common::now_ms,
    secrecy::Secret,
    serde_json::Value,
};

use crate::{
    api::{Homeserver, MatrixApi},
    error::{Error, Result},
    types::{CreateRoomRequest, MessageContent, Registration, SyncBatch, TimelineEvent, Whoami},
};

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Whoami,
    CreateRoom,
    CreateSpace,
    Invite,
    Join,
    Leave,
    JoinedRooms,
    JoinedMembers,
    Send,
    PutState,
    GetState,
    ResolveAlias,
    Messages,
    Sync,
    Register,
}

impl Op {
    fn endpoint(self) -> &'static str {
        match self {
            Self::Whoami => "whoami",
            Self::CreateRoom | Self::CreateSpace => "createRoom",
            Self::Invite => "invite",
            Self::Join => "join",
            Self::Leave => "leave",
            Self::JoinedRooms => "joined_rooms",
            Self::JoinedMembers => "joined_members",
            Self::Send => "send",
            Self::PutState => "put_state",
            Self::GetState => "get_state",
            Self::ResolveAlias => "resolve_alias",
            Self::Messages => "messages",
            Self::Sync => "sync",
            Self::Register => "register",
        }
    }
}

/// Error produced by an injected fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// 503, retryable.
    Unavailable,
    /// 403 `M_FORBIDDEN`.
    Forbidden,
    /// 401 `M_UNKNOWN_TOKEN`.
    UnknownToken,
}

impl Fault {
    fn error(self, op: Op) -> Error {
        match self {
            Self::Unavailable => Error::api(op.endpoint(), 503, "M_UNKNOWN", "service unavailable"),
            Self::Forbidden => Error::api(op.endpoint(), 403, "M_FORBIDDEN", "forbidden"),
            Self::UnknownToken => {
                Error::api(op.endpoint(), 401, "M_UNKNOWN_TOKEN", "Invalid access token")
            },
        }
    }
}

struct PendingFault {
    op: Op,
    user: Option<String>,
    fault: Fault,
    remaining: usize,
}

#[derive(Debug, Clone)]
struct Room {
    request: CreateRoomRequest,
    joined: BTreeSet<String>,
    invited: BTreeSet<String>,
    state: BTreeMap<(String, String), Value>,
}

#[derive(Default)]
struct State {
    clock: Option<u64>,
    next_room: u64,
    users: BTreeSet<String>,
    revoked: BTreeSet<String>,
    rooms: BTreeMap<String, Room>,
    aliases: BTreeMap<String, String>,
    /// Global timeline; the sync cursor is an index into it.
    events: Vec<(String, TimelineEvent)>,
    faults: Vec<PendingFault>,
    calls: Vec<(Op, String)>,
}

impl State {
    fn now(&self) -> u64 {
        self.clock.unwrap_or_else(now_ms)
    }

    fn check(&mut self, op: Op, user: &str) -> Result<()> {
        self.calls.push((op, user.to_string()));
        if self.revoked.contains(user) {
            return Err(Fault::UnknownToken.error(op));
        }
        let hit = self.faults.iter().position(|f| {
            f.op == op && f.user.as_deref().is_none_or(|u| u == user)
        });
        if let Some(i) = hit {
            let fault = self.faults[i].fault;
            self.faults[i].remaining = self.faults[i].remaining.saturating_sub(1);
            if self.faults[i].remaining == 0 {
                self.faults.remove(i);
            }
            return Err(fault.error(op));
        }
        Ok(())
    }

    fn room_mut(&mut self, op: Op, room_id: &str) -> Result<&mut Room> {
        self.rooms
            .get_mut(room_id)
            .ok_or_else(|| Error::api(op.endpoint(), 404, "M_NOT_FOUND", "Unknown room"))
    }

    fn joined_room(&mut self, op: Op, room_id: &str, user: &str) -> Result<&mut Room> {
        let room = self.room_mut(op, room_id)?;
        if !room.joined.contains(user) {
            return Err(Error::api(
                op.endpoint(),
                403,
                "M_FORBIDDEN",
                format!("User {user} not in room {room_id}"),
            ));
        }
        Ok(room)
    }

    fn append(
        &mut self,
        room_id: &str,
        sender: &str,
        event_type: &str,
        content: Value,
        state_key: Option<String>,
        ts: u64,
    ) -> String {
        let event_id = format!("$ev{}", self.events.len() + 1);
        self.events.push((room_id.to_string(), TimelineEvent {
            event_id: event_id.clone(),
            sender: sender.to_string(),
            event_type: event_type.to_string(),
            origin_server_ts: ts,
            content,
            state_key,
        }));
        event_id
    }
}

fn message_json(content: &MessageContent) -> Value {
    serde_json::to_value(content).unwrap_or_default()
}

/// Shared in-process homeserver. Cloning shares the same state.
#[derive(Clone)]
pub struct MemoryHomeserver {
    server_name: String,
    state: Arc<Mutex<State>>,
    registration: bool,
}

impl Default for MemoryHomeserver {
    fn default() -> Self {
        Self::new("localhost")
    }
}

impl MemoryHomeserver {
    pub fn new(server_name: &str) -> Self {
        Self {
            server_name: server_name.to_string(),
            state: Arc::new(Mutex::new(State::default())),
            registration: true,
        }
    }

    /// Disable shared-secret registration.
    #[must_use]
    pub fn without_registration(mut self) -> Self {
        self.registration = false;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A session for `user_id`, registering the user if needed.
    pub fn login(&self, user_id: &str) -> Arc<dyn MatrixApi> {
        self.lock().users.insert(user_id.to_string());
        Arc::new(MemorySession {
            user_id: user_id.to_string(),
            hs: self.clone(),
        })
    }

    /// Fix `origin_server_ts` of new events. `None` restores the wall clock.
    pub fn set_clock(&self, ms: Option<u64>) {
        self.lock().clock = ms;
    }

    /// Make the next `times` calls of `op` fail.
    pub fn fail(&self, op: Op, fault: Fault, times: usize) {
        self.lock().faults.push(PendingFault {
            op,
            user: None,
            fault,
            remaining: times,
        });
    }

    /// Make the next `times` calls of `op` by `user_id` fail.
    pub fn fail_for(&self, user_id: &str, op: Op, fault: Fault, times: usize) {
        self.lock().faults.push(PendingFault {
            op,
            user: Some(user_id.to_string()),
            fault,
            remaining: times,
        });
    }

    /// Every call by `user_id` fails with `M_UNKNOWN_TOKEN` from now on.
    pub fn revoke_token(&self, user_id: &str) {
        self.lock().revoked.insert(user_id.to_string());
    }

    /// Remove a user's membership and pending invite, as a server-side kick.
    pub fn kick(&self, room_id: &str, user_id: &str) {
        if let Some(room) = self.lock().rooms.get_mut(room_id) {
            room.joined.remove(user_id);
            room.invited.remove(user_id);
        }
    }

    /// Post a message as `sender` regardless of membership checks.
    pub fn inject_message(&self, room_id: &str, sender: &str, content: &MessageContent) -> String {
        let mut state = self.lock();
        let ts = state.now();
        state.append(room_id, sender, "m.room.message", message_json(content), None, ts)
    }

    /// Post a message with an explicit timestamp.
    pub fn inject_message_at(
        &self,
        room_id: &str,
        sender: &str,
        content: &MessageContent,
        origin_server_ts: u64,
    ) -> String {
        self.lock().append(
            room_id,
            sender,
            "m.room.message",
            message_json(content),
            None,
            origin_server_ts,
        )
    }

    /// Remove a child link from a space, as if an admin edited it by hand.
    pub fn remove_state(&self, room_id: &str, event_type: &str, state_key: &str) {
        if let Some(room) = self.lock().rooms.get_mut(room_id) {
            room.state
                .remove(&(event_type.to_string(), state_key.to_string()));
        }
    }

    pub fn room_ids(&self) -> Vec<String> {
        self.lock()
            .rooms
            .iter()
            .filter(|(_, r)| !r.request.is_space())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn space_ids(&self) -> Vec<String> {
        self.lock()
            .rooms
            .iter()
            .filter(|(_, r)| r.request.is_space())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// The request a room was created with.
    pub fn create_request(&self, room_id: &str) -> Option<CreateRoomRequest> {
        self.lock().rooms.get(room_id).map(|r| r.request.clone())
    }

    pub fn is_joined(&self, room_id: &str, user_id: &str) -> bool {
        self.lock()
            .rooms
            .get(room_id)
            .is_some_and(|r| r.joined.contains(user_id))
    }

    pub fn is_invited(&self, room_id: &str, user_id: &str) -> bool {
        self.lock()
            .rooms
            .get(room_id)
            .is_some_and(|r| r.invited.contains(user_id))
    }

    pub fn state(&self, room_id: &str, event_type: &str, state_key: &str) -> Option<Value> {
        self.lock()
            .rooms
            .get(room_id)
            .and_then(|r| {
                r.state
                    .get(&(event_type.to_string(), state_key.to_string()))
                    .cloned()
            })
    }

    /// State keys of all `event_type` events in a room.
    pub fn state_keys(&self, room_id: &str, event_type: &str) -> Vec<String> {
        self.lock()
            .rooms
            .get(room_id)
            .map(|r| {
                r.state
                    .keys()
                    .filter(|(t, _)| t == event_type)
                    .map(|(_, k)| k.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Messages in a room, oldest first.
    pub fn timeline(&self, room_id: &str) -> Vec<TimelineEvent> {
        self.lock()
            .events
            .iter()
            .filter(|(room, e)| room == room_id && e.is_message())
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn call_count(&self, op: Op) -> usize {
        self.lock().calls.iter().filter(|(o, _)| *o == op).count()
    }
}

#[async_trait]
impl Homeserver for MemoryHomeserver {
    fn server_name(&self) -> &str {
        &self.server_name
    }

    fn session(&self, user_id: &str, _access_token: &Secret<String>) -> Arc<dyn MatrixApi> {
        self.login(user_id)
    }

    async fn register(
        &self,
        localpart: &str,
        _password: &str,
        _admin: bool,
    ) -> Result<Registration> {
        let user_id = format!("@{localpart}:{}", self.server_name);
        let mut state = self.lock();
        state.check(Op::Register, &user_id)?;
        if !self.registration {
            return Err(Error::message("registration is disabled"));
        }
        if !state.users.insert(user_id.clone()) {
            return Err(Error::api("register", 400, "M_USER_IN_USE", "User ID already taken."));
        }
        Ok(Registration {
            access_token: Secret::new(format!("token_{localpart}")),
            user_id,
            device_id: Some("MEMORY".into()),
        })
    }

    fn can_register(&self) -> bool {
        self.registration
    }
}

struct MemorySession {
    user_id: String,
    hs: MemoryHomeserver,
}

#[async_trait]
impl MatrixApi for MemorySession {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn whoami(&self) -> Result<Whoami> {
        self.hs.lock().check(Op::Whoami, &self.user_id)?;
        Ok(Whoami {
            user_id: self.user_id.clone(),
            device_id: None,
        })
    }

    async fn create_room(&self, request: &CreateRoomRequest) -> Result<String> {
        let op = if request.is_space() {
            Op::CreateSpace
        } else {
            Op::CreateRoom
        };
        let mut state = self.hs.lock();
        state.check(op, &self.user_id)?;

        let alias = request
            .room_alias_name
            .as_ref()
            .map(|local| format!("#{local}:{}", self.hs.server_name));
        if let Some(alias) = &alias
            && state.aliases.contains_key(alias)
        {
            return Err(Error::api(
                op.endpoint(),
                400,
                "M_ROOM_IN_USE",
                "Room alias already taken",
            ));
        }

        state.next_room += 1;
        let room_id = format!("!room{}:{}", state.next_room, self.hs.server_name);
        let mut room = Room {
            request: request.clone(),
            joined: BTreeSet::from([self.user_id.clone()]),
            invited: request
                .invite
                .iter()
                .filter(|u| **u != self.user_id)
                .cloned()
                .collect(),
            state: BTreeMap::new(),
        };
        for event in &request.initial_state {
            room.state.insert(
                (event.event_type.clone(), event.state_key.clone()),
                event.content.clone(),
            );
        }
        if let Some(levels) = &request.power_level_content_override {
            room.state
                .insert(("m.room.power_levels".into(), String::new()), levels.clone());
        }
        state.rooms.insert(room_id.clone(), room);
        if let Some(alias) = alias {
            state.aliases.insert(alias, room_id.clone());
        }
        Ok(room_id)
    }

    async fn invite(&self, room_id: &str, user_id: &str) -> Result<()> {
        let mut state = self.hs.lock();
        state.check(Op::Invite, &self.user_id)?;
        let room = state.joined_room(Op::Invite, room_id, &self.user_id)?;
        if room.joined.contains(user_id) {
            return Err(Error::api(
                "invite",
                403,
                "M_FORBIDDEN",
                format!("{user_id} is already in the room."),
            ));
        }
        room.invited.insert(user_id.to_string());
        Ok(())
    }

    async fn join(&self, room_id_or_alias: &str) -> Result<String> {
        let mut state = self.hs.lock();
        state.check(Op::Join, &self.user_id)?;
        let room_id = if room_id_or_alias.starts_with('#') {
            state
                .aliases
                .get(room_id_or_alias)
                .cloned()
                .ok_or_else(|| Error::api("join", 404, "M_NOT_FOUND", "Unknown alias"))?
        } else {
            room_id_or_alias.to_string()
        };
        let room = state.room_mut(Op::Join, &room_id)?;
        if room.joined.contains(&self.user_id) {
            return Ok(room_id);
        }
        if !room.invited.remove(&self.user_id) {
            return Err(Error::api(
                "join",
                403,
                "M_FORBIDDEN",
                "You are not invited to this room.",
            ));
        }
        room.joined.insert(self.user_id.clone());
        Ok(room_id)
    }

    async fn leave(&self, room_id: &str) -> Result<()> {
        let mut state = self.hs.lock();
        state.check(Op::Leave, &self.user_id)?;
        let room = state.room_mut(Op::Leave, room_id)?;
        let was_member = room.joined.remove(&self.user_id) | room.invited.remove(&self.user_id);
        if !was_member {
            return Err(Error::api(
                "leave",
                403,
                "M_FORBIDDEN",
                format!("User {} not in room {room_id}", self.user_id),
            ));
        }
        Ok(())
    }

    async fn joined_rooms(&self) -> Result<Vec<String>> {
        let mut state = self.hs.lock();
        state.check(Op::JoinedRooms, &self.user_id)?;
        Ok(state
            .rooms
            .iter()
            .filter(|(_, r)| r.joined.contains(&self.user_id))
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn joined_members(&self, room_id: &str) -> Result<Vec<String>> {
        let mut state = self.hs.lock();
        state.check(Op::JoinedMembers, &self.user_id)?;
        let room = state.joined_room(Op::JoinedMembers, room_id, &self.user_id)?;
        Ok(room.joined.iter().cloned().collect())
    }

    async fn send_message(&self, room_id: &str, content: &MessageContent) -> Result<String> {
        let mut state = self.hs.lock();
        state.check(Op::Send, &self.user_id)?;
        state.joined_room(Op::Send, room_id, &self.user_id)?;
        let ts = state.now();
        Ok(state.append(room_id, &self.user_id, "m.room.message", message_json(content), None, ts))
    }

    async fn put_state(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: &Value,
    ) -> Result<String> {
        let mut state = self.hs.lock();
        state.check(Op::PutState, &self.user_id)?;
        let room = state.joined_room(Op::PutState, room_id, &self.user_id)?;
        room.state.insert(
            (event_type.to_string(), state_key.to_string()),
            content.clone(),
        );
        let ts = state.now();
        Ok(state.append(
            room_id,
            &self.user_id,
            event_type,
            content.clone(),
            Some(state_key.to_string()),
            ts,
        ))
    }

    async fn get_state(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<Value>> {
        let mut state = self.hs.lock();
        state.check(Op::GetState, &self.user_id)?;
        let room = state.joined_room(Op::GetState, room_id, &self.user_id)?;
        Ok(room
            .state
            .get(&(event_type.to_string(), state_key.to_string()))
            .cloned())
    }

    async fn resolve_alias(&self, alias: &str) -> Result<Option<String>> {
        let mut state = self.hs.lock();
        state.check(Op::ResolveAlias, &self.user_id)?;
        Ok(state.aliases.get(alias).cloned())
    }

    async fn messages(&self, room_id: &str, limit: u32) -> Result<Vec<TimelineEvent>> {
        let mut state = self.hs.lock();
        state.check(Op::Messages, &self.user_id)?;
        state.joined_room(Op::Messages, room_id, &self.user_id)?;
        let mut events: Vec<TimelineEvent> = state
            .events
            .iter()
            .rev()
            .filter(|(room, _)| room == room_id)
            .take(limit as usize)
            .map(|(_, e)| e.clone())
            .collect();
        events.reverse();
        Ok(events)
    }

    async fn sync(&self, since: Option<&str>, _timeout_ms: u64) -> Result<SyncBatch> {
        let mut state = self.hs.lock();
        state.check(Op::Sync, &self.user_id)?;
        let start = since.and_then(|s| s.parse::<usize>().ok()).unwrap_or(0);
        let mut batch = SyncBatch {
            next_batch: state.events.len().to_string(),
            ..Default::default()
        };
        for (room_id, event) in state.events.iter().skip(start) {
            let joined = state
                .rooms
                .get(room_id)
                .is_some_and(|r| r.joined.contains(&self.user_id));
            if joined {
                batch
                    .rooms
                    .entry(room_id.clone())
                    .or_default()
                    .push(event.clone());
            }
        }
        batch.invites = state
            .rooms
            .iter()
            .filter(|(_, r)| r.invited.contains(&self.user_id))
            .map(|(id, _)| id.clone())
            .collect();
        Ok(batch)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invite_then_join() {
        let hs = MemoryHomeserver::default();
        let agent = hs.login("@agent:localhost");
        let customer = hs.login("@c:localhost");

        let room = agent
            .create_room(&CreateRoomRequest::room("r").with_invites(["@c:localhost".into()]))
            .await
            .unwrap();
        assert!(hs.is_invited(&room, "@c:localhost"));
        customer.join(&room).await.unwrap();
        assert!(hs.is_joined(&room, "@c:localhost"));

        let err = agent.invite(&room, "@c:localhost").await.unwrap_err();
        assert!(err.is_membership_conflict());
    }

    #[tokio::test]
    async fn join_without_invite_is_forbidden() {
        let hs = MemoryHomeserver::default();
        let agent = hs.login("@agent:localhost");
        let stranger = hs.login("@x:localhost");
        let room = agent.create_room(&CreateRoomRequest::room("r")).await.unwrap();
        let err = stranger.join(&room).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Permanent);
    }

    #[tokio::test]
    async fn duplicate_alias_is_rejected() {
        let hs = MemoryHomeserver::default();
        let admin = hs.login("@admin:localhost");
        let req = CreateRoomRequest::space("root").with_alias("root");
        let id = admin.create_room(&req).await.unwrap();
        assert!(admin.create_room(&req).await.is_err());
        assert_eq!(
            admin.resolve_alias("#root:localhost").await.unwrap(),
            Some(id)
        );
    }

    #[tokio::test]
    async fn sync_cursor_only_returns_new_events() {
        let hs = MemoryHomeserver::default();
        let bridge = hs.login("@bridge:localhost");
        let room = bridge.create_room(&CreateRoomRequest::room("r")).await.unwrap();
        bridge
            .send_message(&room, &MessageContent::text("one"))
            .await
            .unwrap();

        let first = bridge.sync(None, 0).await.unwrap();
        assert_eq!(first.event_count(), 1);
        hs.inject_message(&room, "@agent:localhost", &MessageContent::text("two"));
        let second = bridge.sync(Some(&first.next_batch), 0).await.unwrap();
        assert_eq!(second.event_count(), 1);
        assert_eq!(second.rooms[&room][0].body(), Some("two"));
    }

    #[tokio::test]
    async fn faults_are_consumed() {
        let hs = MemoryHomeserver::default();
        let bridge = hs.login("@bridge:localhost");
        hs.fail(Op::Whoami, Fault::Unavailable, 1);
        assert!(bridge.whoami().await.unwrap_err().is_transient());
        assert!(bridge.whoami().await.is_ok());
        assert_eq!(hs.call_count(Op::Whoami), 2);
    }
}
