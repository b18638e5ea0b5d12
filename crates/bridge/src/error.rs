use deskbridge_common::DepartmentId;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown department: {0}")]
    UnknownDepartment(DepartmentId),

    #[error("department {department} has no acting account")]
    DepartmentUnavailable {
        department: DepartmentId,
        name: String,
    },

    #[error("invalid system notice pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("{context}: {source}")]
    Matrix {
        context: &'static str,
        department: Option<String>,
        #[source]
        source: deskbridge_matrix::Error,
    },

    #[error(transparent)]
    Channel(#[from] deskbridge_channels::Error),

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

    /// Text safe to send back to the bot user.
    pub fn customer_message(&self) -> String {
        match self {
            Self::UnknownDepartment(_) => "❌ Department not found. Please try again.".into(),
            Self::DepartmentUnavailable { name, .. } => unreachable_team(name),
            Self::Matrix {
                department: Some(name),
                source,
                ..
            } if !source.is_transient() => unreachable_team(name),
            _ => "Something went wrong on our side. Please try again in a moment.".into(),
        }
    }
}

fn unreachable_team(name: &str) -> String {
    format!("❌ We can't reach the {name} team right now. Please try again later.")
}

pub type Result<T> = std::result::Result<T, Error>;
