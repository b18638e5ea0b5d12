use {deskbridge_common::DepartmentId, deskbridge_matrix::ErrorKind};

const TRY_AGAIN: &str = "Something went wrong on our side. Please try again in a moment.";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown department: {0}")]
    UnknownDepartment(DepartmentId),

    #[error("unknown customer session: {0}")]
    UnknownCustomer(String),

    #[error("customer is not connected to {0}")]
    NotConnected(DepartmentId),

    #[error("department {department} has no acting account")]
    DepartmentUnavailable {
        department: DepartmentId,
        name: String,
    },

    #[error("message body is empty")]
    EmptyMessage,

    #[error("customer account provisioning is not configured")]
    ProvisioningUnavailable,

    #[error("{context}: {source}")]
    Matrix {
        context: &'static str,
        /// Display name of the department involved, for customer messages.
        department: Option<String>,
        #[source]
        source: deskbridge_matrix::Error,
    },

    #[error(transparent)]
    Store(#[from] deskbridge_sessions::Error),
}

impl Error {
    #[must_use]
    pub fn matrix(
        context: &'static str,
        department: Option<&str>,
        source: deskbridge_matrix::Error,
    ) -> Self {
        Self::Matrix {
            context,
            department: department.map(str::to_string),
            source,
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            Self::Matrix { source, .. } => source.is_transient(),
            Self::Store(_) => true,
            _ => false,
        }
    }

    /// Non-technical text safe to show in the widget. Backing-protocol
    /// error codes never appear here.
    pub fn customer_message(&self) -> String {
        match self {
            Self::UnknownDepartment(_) => "That department is not available.".into(),
            Self::UnknownCustomer(_) => {
                "Your chat session has expired. Please reload the page to start again.".into()
            },
            Self::NotConnected(_) => "Please choose a department to start chatting.".into(),
            Self::EmptyMessage => "Please enter a message.".into(),
            Self::DepartmentUnavailable { name, .. } => unreachable_team(name),
            Self::Matrix {
                department, source, ..
            } => match (source.kind(), department) {
                (ErrorKind::Transient, _) | (_, None) => TRY_AGAIN.into(),
                (_, Some(name)) => unreachable_team(name),
            },
            Self::ProvisioningUnavailable | Self::Store(_) => TRY_AGAIN.into(),
        }
    }
}

fn unreachable_team(name: &str) -> String {
    format!("We can't reach the {name} team right now. Please try again later.")
}

pub type Result<T> = std::result::Result<T, Error>;
