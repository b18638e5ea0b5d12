//! Wire types for the subset of the client-server API the service uses.

use std::collections::BTreeMap;

use {
    secrecy::Secret,
    serde::{Deserialize, Serialize},
    serde_json::{Value, json},
};

/// Response of `GET /account/whoami`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Whoami {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

/// A newly provisioned account.
#[derive(Debug, Clone)]
pub struct Registration {
    pub user_id: String,
    pub access_token: Secret<String>,
    pub device_id: Option<String>,
}

/// A state event included at room creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub state_key: String,
    pub content: Value,
}

/// Body of `POST /createRoom`.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct CreateRoomRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub invite: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_alias_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_content: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_level_content_override: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub initial_state: Vec<StateEvent>,
}

impl CreateRoomRequest {
    /// A private, non-federated conversation room.
    pub fn room(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            preset: Some("private_chat".into()),
            creation_content: Some(json!({ "m.federate": false })),
            ..Default::default()
        }
    }

    /// A private space (container room).
    pub fn space(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            preset: Some("private_chat".into()),
            creation_content: Some(json!({ "type": "m.space" })),
            ..Default::default()
        }
    }

    pub fn is_space(&self) -> bool {
        self.creation_content
            .as_ref()
            .and_then(|c| c.get("type"))
            .and_then(Value::as_str)
            == Some("m.space")
    }

    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        let topic = topic.into();
        if !topic.is_empty() {
            self.topic = Some(topic);
        }
        self
    }

    #[must_use]
    pub fn with_invites(mut self, invites: impl IntoIterator<Item = String>) -> Self {
        self.invite.extend(invites);
        self
    }

    #[must_use]
    pub fn with_alias(mut self, localpart: impl Into<String>) -> Self {
        self.room_alias_name = Some(localpart.into());
        self
    }

    #[must_use]
    pub fn with_power_levels(mut self, users: &BTreeMap<String, i64>) -> Self {
        if !users.is_empty() {
            self.power_level_content_override = Some(json!({ "users": users }));
        }
        self
    }

    #[must_use]
    pub fn with_state(
        mut self,
        event_type: impl Into<String>,
        state_key: impl Into<String>,
        content: Value,
    ) -> Self {
        self.initial_state.push(StateEvent {
            event_type: event_type.into(),
            state_key: state_key.into(),
            content,
        });
        self
    }
}

/// Content of an `m.room.message` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageContent {
    pub msgtype: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatted_body: Option<String>,
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            msgtype: "m.text".into(),
            body: body.into(),
            format: None,
            formatted_body: None,
        }
    }

    pub fn notice(body: impl Into<String>) -> Self {
        Self {
            msgtype: "m.notice".into(),
            ..Self::text(body)
        }
    }

    /// Text with an HTML rendering.
    pub fn html(body: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            format: Some("org.matrix.custom.html".into()),
            formatted_body: Some(html.into()),
            ..Self::text(body)
        }
    }
}

/// One timeline event as returned by `/sync` and `/messages`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimelineEvent {
    pub event_id: String,
    pub sender: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub origin_server_ts: u64,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
}

impl TimelineEvent {
    pub fn is_message(&self) -> bool {
        self.event_type == "m.room.message"
    }

    pub fn msgtype(&self) -> Option<&str> {
        self.content.get("msgtype").and_then(Value::as_str)
    }

    pub fn body(&self) -> Option<&str> {
        self.content.get("body").and_then(Value::as_str)
    }
}

/// Result of one `/sync` call, reduced to what the relay consumes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncBatch {
    /// Cursor for the next call.
    pub next_batch: String,
    /// New timeline events per joined room, in timeline order.
    pub rooms: BTreeMap<String, Vec<TimelineEvent>>,
    /// Rooms the account has pending invites for.
    pub invites: Vec<String>,
}

impl SyncBatch {
    pub fn event_count(&self) -> usize {
        self.rooms.values().map(Vec::len).sum()
    }
}

#[derive(Deserialize)]
pub(crate) struct SyncResponse {
    pub next_batch: String,
    #[serde(default)]
    pub rooms: SyncRooms,
}

#[derive(Default, Deserialize)]
pub(crate) struct SyncRooms {
    #[serde(default)]
    pub join: BTreeMap<String, JoinedRoom>,
    #[serde(default)]
    pub invite: BTreeMap<String, serde::de::IgnoredAny>,
}

#[derive(Default, Deserialize)]
pub(crate) struct JoinedRoom {
    #[serde(default)]
    pub timeline: Timeline,
}

#[derive(Default, Deserialize)]
pub(crate) struct Timeline {
    #[serde(default)]
    pub events: Vec<TimelineEvent>,
}

impl From<SyncResponse> for SyncBatch {
    fn from(resp: SyncResponse) -> Self {
        Self {
            next_batch: resp.next_batch,
            rooms: resp
                .rooms
                .join
                .into_iter()
                .filter(|(_, room)| !room.timeline.events.is_empty())
                .map(|(id, room)| (id, room.timeline.events))
                .collect(),
            invites: resp.rooms.invite.into_keys().collect(),
        }
    }
}
