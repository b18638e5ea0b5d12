/// Config schema types (server, backing homeserver, departments, spaces,
/// bot transport, relay, store, widget).
use std::{collections::BTreeMap, path::PathBuf};

use {
    deskbridge_common::{ChannelType, DepartmentId},
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeskbridgeConfig {
    pub server: ServerConfig,
    pub matrix: MatrixConfig,
    pub departments: Vec<DepartmentConfig>,
    pub spaces: SpacesConfig,
    pub telegram: TelegramConfig,
    pub relay: RelayConfig,
    pub store: StoreConfig,
    pub widget: WidgetConfig,
}

impl DeskbridgeConfig {
    /// Look up a department by id.
    pub fn department(&self, id: &DepartmentId) -> Option<&DepartmentConfig> {
        self.departments.iter().find(|d| d.id == *id)
    }

    /// Departments offered on the given channel, in configuration order.
    pub fn departments_for(&self, channel: ChannelType) -> Vec<&DepartmentConfig> {
        self.departments
            .iter()
            .filter(|d| d.serves(channel))
            .collect()
    }

    /// Account used to create and organize spaces.
    ///
    /// Falls back to the first department's acting account when no dedicated
    /// admin account is configured.
    pub fn space_admin(&self) -> Option<&AccountConfig> {
        self.matrix
            .admin
            .as_ref()
            .or_else(|| self.departments.iter().find_map(|d| d.acting_account()))
    }
}

/// HTTP server configuration for the widget API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to. Defaults to "127.0.0.1".
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 8790,
        }
    }
}

/// Credentials for one backing-protocol account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Fully qualified user id, e.g. `@support:example.org`.
    pub user_id: String,
    #[serde(serialize_with = "serialize_secret")]
    pub access_token: Secret<String>,
}

/// Backing homeserver connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatrixConfig {
    /// Base URL, e.g. `http://localhost:8008`.
    pub homeserver: String,
    /// Server name used in `via` hints. Derived from account ids when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    /// Shared secret for admin registration of ephemeral customer accounts.
    #[serde(
        serialize_with = "serialize_opt_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub registration_shared_secret: Option<Secret<String>>,
    /// The bridge's own account: creates bot-channel rooms and reads the
    /// timeline for the relay.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge: Option<AccountConfig>,
    /// Account that owns the space hierarchy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin: Option<AccountConfig>,
    /// Admin/system accounts whose messages are never relayed.
    pub ignored_senders: Vec<String>,
    pub request_timeout_secs: u64,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            homeserver: "http://localhost:8008".into(),
            server_name: None,
            registration_shared_secret: None,
            bridge: None,
            admin: None,
            ignored_senders: Vec::new(),
            request_timeout_secs: 30,
        }
    }
}

/// A support queue with its own backing identities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepartmentConfig {
    pub id: DepartmentId,
    pub name: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub description: String,
    /// Accounts authorized to act for this department. The first one is the
    /// acting identity that creates rooms and re-invites customers.
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    /// Additional identities invited into every room of this department.
    #[serde(default)]
    pub support_users: Vec<String>,
    /// Channels this department is offered on. Empty means all channels.
    #[serde(default)]
    pub channels: Vec<ChannelType>,
    /// Power-level overrides applied at room creation (user id -> level).
    #[serde(default)]
    pub power_levels: BTreeMap<String, i64>,
}

impl DepartmentConfig {
    pub fn acting_account(&self) -> Option<&AccountConfig> {
        self.accounts.first()
    }

    pub fn serves(&self, channel: ChannelType) -> bool {
        self.channels.is_empty() || self.channels.contains(&channel)
    }

    /// Button/label text, e.g. `"🛠️ Technical Support"`.
    pub fn label(&self) -> String {
        if self.icon.is_empty() {
            self.name.clone()
        } else {
            format!("{} {}", self.icon, self.name)
        }
    }

    /// Every configured identity of this department, acting account first,
    /// without duplicates.
    pub fn identities(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for id in self
            .accounts
            .iter()
            .map(|a| a.user_id.as_str())
            .chain(self.support_users.iter().map(String::as_str))
        {
            if !ids.iter().any(|existing| existing == id) {
                ids.push(id.to_string());
            }
        }
        ids
    }

    /// Power levels for a new room: acting identity 100, every other
    /// identity 50, then explicit overrides.
    pub fn room_power_levels(&self) -> BTreeMap<String, i64> {
        let mut levels = BTreeMap::new();
        for (i, id) in self.identities().into_iter().enumerate() {
            levels.insert(id, if i == 0 { 100 } else { 50 });
        }
        for (user, level) in &self.power_levels {
            levels.insert(user.clone(), *level);
        }
        levels
    }
}

/// Name/topic/alias of one space.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpaceConfig {
    pub name: String,
    pub topic: String,
    /// Local alias part (without `#` and server). Derived when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

/// Space hierarchy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpacesConfig {
    pub enabled: bool,
    pub root: SpaceConfig,
    /// Per-channel space settings keyed by channel type (`web`, `telegram`).
    pub channels: BTreeMap<String, SpaceConfig>,
    /// Re-link rooms whose stored placement disagrees with the server state.
    pub repair_on_startup: bool,
}

impl SpacesConfig {
    /// Settings for a channel space, with a generated fallback.
    pub fn channel(&self, channel: ChannelType) -> SpaceConfig {
        self.channels
            .get(channel.as_str())
            .cloned()
            .unwrap_or_else(|| SpaceConfig {
                name: format!("{} Support", channel.display_name()),
                topic: String::new(),
                alias: None,
            })
    }
}

impl Default for SpacesConfig {
    fn default() -> Self {
        let mut channels = BTreeMap::new();
        channels.insert(ChannelType::Web.to_string(), SpaceConfig {
            name: "Web Chat Support".into(),
            topic: "Conversations started from the website widget".into(),
            alias: None,
        });
        channels.insert(ChannelType::Telegram.to_string(), SpaceConfig {
            name: "Telegram Support".into(),
            topic: "Conversations started from Telegram".into(),
            alias: None,
        });
        Self {
            enabled: true,
            root: SpaceConfig {
                name: "Customer Support".into(),
                topic: "All customer support conversations".into(),
                alias: None,
            },
            channels,
            repair_on_startup: true,
        }
    }
}

/// Telegram bot transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub enabled: bool,
    /// Bot token from @BotFather.
    #[serde(serialize_with = "serialize_secret")]
    pub token: Secret<String>,
    /// Long-poll timeout for `getUpdates`.
    pub poll_timeout_secs: u32,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token: Secret::new(String::new()),
            poll_timeout_secs: 30,
        }
    }
}

/// Backing-protocol to bot relay schedule and dedup window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Pause between the end of one poll and the start of the next.
    pub poll_interval_secs: u64,
    /// Maximum remembered event ids.
    pub registry_capacity: usize,
    /// Event ids older than this are forgotten.
    pub registry_ttl_secs: u64,
    /// Message bodies matching any of these regexes are treated as system
    /// notices. Appended to the built-in patterns.
    pub system_notice_patterns: Vec<String>,
    /// Server-side long-poll timeout passed to sync.
    pub sync_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            registry_capacity: 10_000,
            registry_ttl_secs: 86_400,
            system_notice_patterns: Vec::new(),
            sync_timeout_ms: 0,
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite file. Defaults to `<data_dir>/deskbridge.db`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
    /// Invalid room records older than this are pruned.
    pub invalid_retention_days: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            invalid_retention_days: 7,
        }
    }
}

/// Website-channel orchestration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WidgetConfig {
    pub history_limit: u32,
    /// Join attempts after a re-invite before the room is declared lost.
    pub rejoin_attempts: u32,
    pub rejoin_backoff_ms: u64,
    /// Localpart prefix for ephemeral customer accounts.
    pub customer_localpart_prefix: String,
}

impl Default for WidgetConfig {
    fn default() -> Self {
        Self {
            history_limit: 50,
            rejoin_attempts: 3,
            rejoin_backoff_ms: 500,
            customer_localpart_prefix: "webchat_".into(),
        }
    }
}

fn serialize_secret<S: serde::Serializer>(
    secret: &Secret<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

fn serialize_opt_secret<S: serde::Serializer>(
    secret: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match secret {
        Some(s) => serializer.serialize_some(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}
