/// How a failed backing-protocol call should be treated by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network trouble, rate limiting or a server-side failure. Worth one retry.
    Transient,
    /// Invalid credentials, forbidden, or a malformed request. Never retried.
    Permanent,
    /// The target is already a member of the room. Callers treat this as success.
    MembershipConflict,
    /// Unknown room or alias.
    NotFound,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{endpoint}: transport error: {message}")]
    Transport {
        endpoint: String,
        message: String,
        /// The request never reached the server.
        connect: bool,
    },

    #[error("{endpoint}: {status} {errcode}: {message}")]
    Api {
        endpoint: String,
        status: u16,
        errcode: String,
        message: String,
    },

    #[error("{endpoint}: invalid response: {message}")]
    InvalidResponse { endpoint: String, message: String },

    #[error("{0}")]
    Message(String),
}

impl Error {
    #[must_use]
    pub fn message(message: impl std::fmt::Display) -> Self {
        Self::Message(message.to_string())
    }

    #[must_use]
    pub fn api(
        endpoint: impl Into<String>,
        status: u16,
        errcode: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Api {
            endpoint: endpoint.into(),
            status,
            errcode: errcode.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn transport(endpoint: impl Into<String>, source: &reqwest::Error) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            message: source.to_string(),
            connect: source.is_connect(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } => ErrorKind::Transient,
            Self::Api {
                status,
                errcode,
                message,
                ..
            } => classify(*status, errcode, message),
            Self::InvalidResponse { .. } | Self::Message(_) => ErrorKind::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn is_membership_conflict(&self) -> bool {
        self.kind() == ErrorKind::MembershipConflict
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// The calling account's own credentials were rejected.
    pub fn is_unauthorized(&self) -> bool {
        match self {
            Self::Api {
                status, errcode, ..
            } => {
                *status == 401
                    || matches!(
                        errcode.as_str(),
                        "M_UNKNOWN_TOKEN" | "M_MISSING_TOKEN" | "M_USER_DEACTIVATED"
                    )
            },
            _ => false,
        }
    }

    /// Whether the server may have applied the request before failing.
    /// Connection failures and rate limits never reach the handler.
    pub fn may_have_applied(&self) -> bool {
        match self {
            Self::Transport { connect, .. } => !connect,
            Self::Api { status, .. } => *status != 429,
            _ => true,
        }
    }
}

fn classify(status: u16, errcode: &str, message: &str) -> ErrorKind {
    if status == 429 || errcode == "M_LIMIT_EXCEEDED" || status >= 500 {
        return ErrorKind::Transient;
    }
    if status == 404 || errcode == "M_NOT_FOUND" {
        return ErrorKind::NotFound;
    }
    let lower = message.to_ascii_lowercase();
    if status == 403
        && (lower.contains("already in the room")
            || lower.contains("already joined")
            || lower.contains("already a member"))
    {
        return ErrorKind::MembershipConflict;
    }
    ErrorKind::Permanent
}

pub type Result<T> = std::result::Result<T, Error>;
