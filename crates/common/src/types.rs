use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a configured support department (e.g. `"sales"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DepartmentId(pub String);

impl DepartmentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DepartmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DepartmentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DepartmentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Customer-facing origin of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    /// Embeddable website widget.
    Web,
    /// Telegram bot transport.
    Telegram,
}

impl ChannelType {
    pub const ALL: [ChannelType; 2] = [ChannelType::Web, ChannelType::Telegram];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Telegram => "telegram",
        }
    }

    /// Label used in room names, e.g. `"Alice (Telegram) - Sales"`.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Web => "Web",
            Self::Telegram => "Telegram",
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChannelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "web" => Ok(Self::Web),
            "telegram" => Ok(Self::Telegram),
            other => Err(format!("unknown channel type: {other}")),
        }
    }
}

/// Extract the server name from a fully qualified id such as
/// `@support:example.org` or `!room:example.org`.
///
/// Returns `None` when the id has no `:` separator.
pub fn server_name_of(id: &str) -> Option<&str> {
    id.split_once(':')
        .map(|(_, server)| server)
        .filter(|s| !s.is_empty())
}
