use {
    async_trait::async_trait,
    deskbridge_common::{ChannelType, DepartmentId},
    deskbridge_config::DepartmentConfig,
    serde::{Deserialize, Serialize},
};

use crate::Result;

/// Prefix of inline-button callback data selecting a department.
const DEPARTMENT_CALLBACK_PREFIX: &str = "dept_";

/// The person on the other side of a bot conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotUser {
    /// Transport user id.
    pub id: String,
    /// First name or equivalent, used in room names and attribution.
    pub display_name: String,
    pub username: Option<String>,
}

impl BotUser {
    /// `@username` when known, else the numeric id.
    pub fn handle(&self) -> String {
        match &self.username {
            Some(username) => format!("@{username}"),
            None => self.id.clone(),
        }
    }
}

/// One button of the department menu.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DepartmentChoice {
    pub id: DepartmentId,
    pub label: String,
}

impl DepartmentChoice {
    pub fn callback_data(&self) -> String {
        format!("{DEPARTMENT_CALLBACK_PREFIX}{}", self.id)
    }
}

impl From<&DepartmentConfig> for DepartmentChoice {
    fn from(dept: &DepartmentConfig) -> Self {
        Self {
            id: dept.id.clone(),
            label: dept.label(),
        }
    }
}

/// Extract the department id from `dept_<id>` callback data.
pub fn parse_department_callback(data: &str) -> Option<DepartmentId> {
    data.strip_prefix(DEPARTMENT_CALLBACK_PREFIX)
        .filter(|id| !id.is_empty())
        .map(DepartmentId::new)
}

/// Send messages back to a bot conversation.
#[async_trait]
pub trait BotOutbound: Send + Sync {
    fn channel_type(&self) -> ChannelType;

    async fn send_text(&self, conversation_id: &str, text: &str) -> Result<()>;

    /// Send `text` with one button per department.
    async fn send_department_menu(
        &self,
        conversation_id: &str,
        text: &str,
        choices: &[DepartmentChoice],
    ) -> Result<()>;
}
