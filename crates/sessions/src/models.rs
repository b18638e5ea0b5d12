use std::{collections::BTreeMap, fmt, str::FromStr};

use {
    deskbridge_common::{ChannelType, DepartmentId},
    secrecy::Secret,
    serde::{Deserialize, Serialize},
};

/// Room lifecycle state.
///
/// `active -> left -> active` on a successful reinvite, `left -> invalid`
/// when access cannot be restored. No state is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Active,
    Left,
    Invalid,
}

impl RoomStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Left => "left",
            Self::Invalid => "invalid",
        }
    }
}

impl fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoomStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "left" => Ok(Self::Left),
            "invalid" => Ok(Self::Invalid),
            other => Err(format!("unknown room status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipAction {
    Join,
    Leave,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEvent {
    pub action: MembershipAction,
    pub at: u64,
    pub reason: String,
}

/// Room reference for one (owner, department) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRecord {
    pub room_id: String,
    pub status: RoomStatus,
    pub membership_history: Vec<MembershipEvent>,
    pub created_at: u64,
    /// Time of the last status change. Retention pruning keys off this.
    pub updated_at: u64,
    pub last_activity_at: u64,
}

impl RoomRecord {
    pub fn new(room_id: impl Into<String>, reason: &str, now: u64) -> Self {
        Self {
            room_id: room_id.into(),
            status: RoomStatus::Active,
            membership_history: vec![MembershipEvent {
                action: MembershipAction::Join,
                at: now,
                reason: reason.to_string(),
            }],
            created_at: now,
            updated_at: now,
            last_activity_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == RoomStatus::Active
    }

    /// Mark `room_id` active. Reusing the same room extends its history;
    /// a different room starts a fresh record.
    pub fn activated(existing: Option<Self>, room_id: &str, reason: &str, now: u64) -> Self {
        match existing {
            Some(mut record) if record.room_id == room_id => {
                if record.status != RoomStatus::Active {
                    record.membership_history.push(MembershipEvent {
                        action: MembershipAction::Join,
                        at: now,
                        reason: reason.to_string(),
                    });
                    record.updated_at = now;
                }
                record.status = RoomStatus::Active;
                record.last_activity_at = now;
                record
            },
            _ => Self::new(room_id, reason, now),
        }
    }

    /// `active -> left`. The room id is kept. Returns whether anything changed.
    pub fn mark_left(&mut self, reason: &str, now: u64) -> bool {
        if self.status != RoomStatus::Active {
            return false;
        }
        self.status = RoomStatus::Left;
        self.membership_history.push(MembershipEvent {
            action: MembershipAction::Leave,
            at: now,
            reason: reason.to_string(),
        });
        self.updated_at = now;
        true
    }

    /// Any state `-> invalid`.
    pub fn mark_invalid(&mut self, reason: &str, now: u64) -> bool {
        if self.status == RoomStatus::Invalid {
            return false;
        }
        if self.status == RoomStatus::Active {
            self.membership_history.push(MembershipEvent {
                action: MembershipAction::Leave,
                at: now,
                reason: reason.to_string(),
            });
        }
        self.status = RoomStatus::Invalid;
        self.updated_at = now;
        true
    }
}

/// A website visitor and the ephemeral backing account speaking for them.
#[derive(Debug, Clone)]
pub struct CustomerSession {
    pub customer_id: String,
    pub display_name: Option<String>,
    pub backing_account_id: String,
    pub access_token: Secret<String>,
    pub department_rooms: BTreeMap<DepartmentId, RoomRecord>,
    pub conversation_count: u32,
    pub created_at: u64,
    pub last_activity_at: u64,
}

impl CustomerSession {
    /// Name shown in room titles.
    pub fn label(&self) -> String {
        self.display_name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| {
                let short: String = self.customer_id.chars().take(8).collect();
                format!("Visitor {short}")
            })
    }
}

/// Durable link between a bot-channel conversation and its backing room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRoomMapping {
    pub external_conversation_id: String,
    pub room_id: String,
    pub department_id: DepartmentId,
    pub external_user_id: String,
    pub channel: ChannelType,
    pub created_at: u64,
    /// Last time the user picked this department. The newest one is current.
    pub selected_at: u64,
}

/// Owner key for bot-channel conversations in the room store.
pub fn bot_owner(channel: ChannelType, conversation_id: &str) -> String {
    format!("{channel}:{conversation_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpaceKind {
    Root,
    Channel,
    Department,
}

impl SpaceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Channel => "channel",
            Self::Department => "department",
        }
    }
}

impl FromStr for SpaceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "root" => Ok(Self::Root),
            "channel" => Ok(Self::Channel),
            "department" => Ok(Self::Department),
            other => Err(format!("unknown space kind: {other}")),
        }
    }
}

/// A space in the hierarchy root > channel > department.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceNode {
    /// Stable lookup key, see [`SpaceNode::root_key`] and friends.
    pub key: String,
    pub space_id: String,
    pub kind: SpaceKind,
    pub parent_space_id: Option<String>,
    pub channel: Option<ChannelType>,
    pub department_id: Option<DepartmentId>,
    pub created_at: u64,
}

impl SpaceNode {
    pub fn root_key() -> String {
        "root".to_string()
    }

    pub fn channel_key(channel: ChannelType) -> String {
        format!("channel:{channel}")
    }

    pub fn department_key(channel: ChannelType, department: &DepartmentId) -> String {
        format!("department:{channel}:{department}")
    }
}

/// Where a conversation room should live. `space_id` is `None` while the
/// room is unorganized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomPlacement {
    pub room_id: String,
    pub channel: ChannelType,
    pub department_id: DepartmentId,
    pub space_id: Option<String>,
    pub placed_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn left_keeps_room_id() {
        let mut record = RoomRecord::new("!r1:hs", "room_created", 1);
        assert!(record.mark_left("department_switch", 2));
        assert_eq!(record.room_id, "!r1:hs");
        assert_eq!(record.status, RoomStatus::Left);
        assert!(!record.mark_left("again", 3));
        assert_eq!(record.membership_history.len(), 2);
    }

    #[test]
    fn reactivating_same_room_extends_history() {
        let mut record = RoomRecord::new("!r1:hs", "room_created", 1);
        record.mark_left("department_switch", 2);
        let record = RoomRecord::activated(Some(record), "!r1:hs", "department_switch_return", 3);
        assert!(record.is_active());
        assert_eq!(record.membership_history.len(), 3);
        assert_eq!(record.created_at, 1);
    }

    #[test]
    fn activating_new_room_replaces_record() {
        let mut old = RoomRecord::new("!r1:hs", "room_created", 1);
        old.mark_invalid("rejoin_failed", 2);
        let record = RoomRecord::activated(Some(old), "!r2:hs", "room_created", 3);
        assert_eq!(record.room_id, "!r2:hs");
        assert_eq!(record.membership_history.len(), 1);
    }

    #[test]
    fn invalid_from_left_does_not_add_leave() {
        let mut record = RoomRecord::new("!r1:hs", "room_created", 1);
        record.mark_left("department_switch", 2);
        assert!(record.mark_invalid("rejoin_failed", 3));
        assert_eq!(record.membership_history.len(), 2);
        assert_eq!(record.updated_at, 3);
    }

    #[test]
    fn bot_owner_is_namespaced() {
        assert_eq!(bot_owner(ChannelType::Telegram, "42"), "telegram:42");
    }

    #[test]
    fn anonymous_label_uses_id_prefix() {
        let session = CustomerSession {
            customer_id: "0123456789abcdef".into(),
            display_name: None,
            backing_account_id: "@webchat_0123:hs".into(),
            access_token: Secret::new("t".into()),
            department_rooms: BTreeMap::new(),
            conversation_count: 0,
            created_at: 0,
            last_activity_at: 0,
        };
        assert_eq!(session.label(), "Visitor 01234567");
    }
}
