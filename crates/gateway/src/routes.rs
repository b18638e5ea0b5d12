use std::sync::Arc;

use {
    axum::{
        Json,
        extract::{Query, State},
    },
    deskbridge_common::DepartmentId,
    deskbridge_sessions::CustomerSession,
    deskbridge_widget::{Connection, DisconnectReport, HistoryEntry},
    serde::{Deserialize, Serialize},
    serde_json::{Value, json},
};

use crate::{error::ApiError, state::GatewayState};

type ApiResult<T> = Result<Json<T>, ApiError>;

fn require(value: &str, field: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::bad_request(format!("{field} is required")));
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct OpenSessionRequest {
    pub customer_id: Option<String>,
    pub display_name: Option<String>,
}

/// What the browser keeps about its session. Credentials stay server side.
#[derive(Debug, Serialize)]
pub struct SessionView {
    pub customer_id: String,
    pub display_name: Option<String>,
    /// Department whose room is currently active, if any.
    pub active_department: Option<DepartmentId>,
    pub created_at: u64,
}

impl From<CustomerSession> for SessionView {
    fn from(session: CustomerSession) -> Self {
        let active_department = session
            .department_rooms
            .iter()
            .find(|(_, record)| record.is_active())
            .map(|(dept, _)| dept.clone());
        Self {
            customer_id: session.customer_id,
            display_name: session.display_name,
            active_department,
            created_at: session.created_at,
        }
    }
}

pub async fn open_session(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<OpenSessionRequest>,
) -> ApiResult<SessionView> {
    let session = state
        .widget
        .open_session(req.customer_id.as_deref(), req.display_name.as_deref())
        .await?;
    Ok(Json(session.into()))
}

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub customer_id: String,
    pub department_id: DepartmentId,
}

#[derive(Debug, Serialize)]
pub struct ConnectResponse {
    #[serde(flatten)]
    pub connection: Connection,
    pub disconnected: DisconnectReport,
}

/// Select a department: connect to its room and leave every other one.
pub async fn connect(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<ConnectRequest>,
) -> ApiResult<ConnectResponse> {
    require(&req.customer_id, "customer_id")?;
    let (connection, disconnected) = state
        .widget
        .select_department(&req.customer_id, &req.department_id)
        .await?;
    Ok(Json(ConnectResponse {
        connection,
        disconnected,
    }))
}

#[derive(Debug, Deserialize)]
pub struct DisconnectRequest {
    pub customer_id: String,
    /// Department to stay connected to. Omit to leave every room.
    #[serde(default)]
    pub keep_department_id: Option<DepartmentId>,
}

pub async fn disconnect(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<DisconnectRequest>,
) -> ApiResult<DisconnectReport> {
    require(&req.customer_id, "customer_id")?;
    let report = state
        .widget
        .disconnect(&req.customer_id, req.keep_department_id.as_ref())
        .await?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub customer_id: String,
    pub department_id: DepartmentId,
    pub body: String,
}

pub async fn send_message(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<Value> {
    require(&req.customer_id, "customer_id")?;
    let sent = state
        .widget
        .send_message(&req.customer_id, &req.department_id, &req.body)
        .await?;
    Ok(Json(json!({
        "room_id": sent.room_id,
        "event_id": sent.event_id,
    })))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub customer_id: String,
    pub department_id: DepartmentId,
    #[serde(default)]
    pub limit: Option<u32>,
}

pub async fn history(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Vec<HistoryEntry>> {
    require(&query.customer_id, "customer_id")?;
    let entries = state
        .widget
        .history(&query.customer_id, &query.department_id, query.limit)
        .await?;
    Ok(Json(entries))
}

#[derive(Debug, Serialize)]
pub struct DepartmentView {
    pub id: DepartmentId,
    pub name: String,
    pub icon: String,
    pub description: String,
    pub label: String,
}

pub async fn departments(State(state): State<Arc<GatewayState>>) -> Json<Vec<DepartmentView>> {
    Json(
        state
            .widget
            .departments()
            .iter()
            .map(|d| DepartmentView {
                id: d.id.clone(),
                name: d.name.clone(),
                icon: d.icon.clone(),
                description: d.description.clone(),
                label: d.label(),
            })
            .collect(),
    )
}

pub async fn health(State(state): State<Arc<GatewayState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": state.version,
    }))
}
