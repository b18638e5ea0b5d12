use {
    axum::{
        Json,
        http::StatusCode,
        response::{IntoResponse, Response},
    },
    deskbridge_matrix::ErrorKind,
    deskbridge_widget::Error as WidgetError,
    serde_json::json,
    tracing::{error, warn},
};

/// Error returned by widget API handlers.
///
/// The body only ever carries the customer-facing text; details go to the
/// log.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Widget(#[from] WidgetError),

    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Widget(e) => widget_status(e),
        }
    }

    fn public_message(&self) -> String {
        match self {
            Self::BadRequest(message) => message.clone(),
            Self::Widget(e) => e.customer_message(),
        }
    }
}

fn widget_status(e: &WidgetError) -> StatusCode {
    match e {
        WidgetError::UnknownDepartment(_) => StatusCode::NOT_FOUND,
        WidgetError::UnknownCustomer(_) => StatusCode::UNAUTHORIZED,
        WidgetError::NotConnected(_) => StatusCode::CONFLICT,
        WidgetError::EmptyMessage => StatusCode::BAD_REQUEST,
        WidgetError::DepartmentUnavailable { .. } | WidgetError::ProvisioningUnavailable => {
            StatusCode::SERVICE_UNAVAILABLE
        },
        WidgetError::Matrix { source, .. } => match source.kind() {
            ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_GATEWAY,
        },
        WidgetError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "widget request failed");
        } else {
            warn!(status = status.as_u16(), error = %self, "widget request rejected");
        }
        (status, Json(json!({ "error": self.public_message() }))).into_response()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, deskbridge_common::DepartmentId, rstest::rstest};

    #[rstest]
    #[case(WidgetError::UnknownDepartment(DepartmentId::new("x")), StatusCode::NOT_FOUND)]
    #[case(WidgetError::UnknownCustomer("c".into()), StatusCode::UNAUTHORIZED)]
    #[case(WidgetError::NotConnected(DepartmentId::new("x")), StatusCode::CONFLICT)]
    #[case(WidgetError::EmptyMessage, StatusCode::BAD_REQUEST)]
    #[case(
        WidgetError::matrix(
            "invite",
            Some("Sales"),
            deskbridge_matrix::Error::api("invite", 403, "M_FORBIDDEN", "nope"),
        ),
        StatusCode::BAD_GATEWAY
    )]
    #[case(
        WidgetError::matrix(
            "invite",
            Some("Sales"),
            deskbridge_matrix::Error::api("invite", 502, "M_UNKNOWN", "down"),
        ),
        StatusCode::SERVICE_UNAVAILABLE
    )]
    fn maps_status(#[case] error: WidgetError, #[case] expected: StatusCode) {
        assert_eq!(ApiError::from(error).status(), expected);
    }

    #[test]
    fn body_never_carries_backing_codes() {
        let err = ApiError::from(WidgetError::matrix(
            "invite",
            Some("Sales"),
            deskbridge_matrix::Error::api("invite", 403, "M_FORBIDDEN", "nope"),
        ));
        let message = err.public_message();
        assert!(!message.contains("M_FORBIDDEN"));
        assert!(message.contains("Sales"));
    }
}
