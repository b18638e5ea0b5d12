//! reqwest implementation of [`MatrixApi`] and [`Homeserver`].

use std::{sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    reqwest::{Method, RequestBuilder, StatusCode},
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, de::DeserializeOwned},
    serde_json::{Value, json},
    tracing::{debug, warn},
};

use crate::{
    admin,
    api::{Homeserver, MatrixApi},
    error::{Error, Result},
    types::{
        CreateRoomRequest, MessageContent, Registration, SyncBatch, SyncResponse, TimelineEvent,
        Whoami,
    },
};

const CLIENT_PREFIX: &str = "/_matrix/client/v3";
const RETRY_DELAY: Duration = Duration::from_millis(250);
const MAX_RETRY_AFTER: Duration = Duration::from_secs(2);

/// Whether a failed request can safely be sent again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Replay {
    /// GETs and PUTs with a transaction id.
    Safe,
    /// Only retried when the first attempt provably never ran.
    Unsafe,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errcode: String,
    #[serde(default)]
    error: String,
    #[serde(default)]
    retry_after_ms: Option<u64>,
}

/// Send a request built by `build`, retrying once on a transient failure.
pub(crate) async fn execute<T: DeserializeOwned>(
    endpoint: &str,
    replay: Replay,
    build: impl Fn() -> RequestBuilder,
) -> Result<T> {
    match execute_once(endpoint, build()).await {
        Ok(value) => Ok(value),
        Err((e, retry_after)) => {
            let retryable =
                e.is_transient() && (replay == Replay::Safe || !e.may_have_applied());
            if !retryable {
                return Err(e);
            }
            let delay = retry_after.map_or(RETRY_DELAY, |d| d.min(MAX_RETRY_AFTER));
            warn!(endpoint, error = %e, delay_ms = delay.as_millis() as u64, "transient failure, retrying once");
            tokio::time::sleep(delay).await;
            execute_once(endpoint, build()).await.map_err(|(e, _)| e)
        },
    }
}

async fn execute_once<T: DeserializeOwned>(
    endpoint: &str,
    request: RequestBuilder,
) -> std::result::Result<T, (Error, Option<Duration>)> {
    let resp = request
        .send()
        .await
        .map_err(|e| (Error::transport(endpoint, &e), None))?;
    let status = resp.status();
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| (Error::transport(endpoint, &e), None))?;

    if !status.is_success() {
        let body: ErrorBody = serde_json::from_slice(&bytes).unwrap_or(ErrorBody {
            errcode: String::new(),
            error: String::from_utf8_lossy(&bytes).chars().take(200).collect(),
            retry_after_ms: None,
        });
        let retry_after = (status == StatusCode::TOO_MANY_REQUESTS)
            .then_some(body.retry_after_ms)
            .flatten()
            .map(Duration::from_millis);
        return Err((
            Error::api(endpoint, status.as_u16(), body.errcode, body.error),
            retry_after,
        ));
    }

    // Some endpoints answer with an empty body.
    let body: &[u8] = if bytes.is_empty() {
        b"{}"
    } else {
        &bytes
    };
    serde_json::from_slice(body).map_err(|e| {
        (
            Error::InvalidResponse {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            },
            None,
        )
    })
}

fn enc(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}

/// Homeserver reachable over HTTP.
#[derive(Clone)]
pub struct HttpHomeserver {
    http: reqwest::Client,
    base_url: String,
    server_name: String,
    shared_secret: Option<Secret<String>>,
}

impl HttpHomeserver {
    pub fn new(base_url: &str, server_name: &str, timeout: Duration) -> Result<Self> {
        let parsed = url::Url::parse(base_url)
            .map_err(|e| Error::message(format!("invalid homeserver URL {base_url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::message(format!(
                "homeserver URL must be http or https: {base_url}"
            )));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("deskbridge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::message(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            server_name: server_name.to_string(),
            shared_secret: None,
        })
    }

    #[must_use]
    pub fn with_shared_secret(mut self, secret: Option<Secret<String>>) -> Self {
        self.shared_secret = secret;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// A typed session, for callers that do not need the trait object.
    pub fn client(&self, user_id: &str, access_token: &Secret<String>) -> MatrixClient {
        MatrixClient {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            user_id: user_id.to_string(),
            access_token: Secret::new(access_token.expose_secret().clone()),
        }
    }
}

#[async_trait]
impl Homeserver for HttpHomeserver {
    fn server_name(&self) -> &str {
        &self.server_name
    }

    fn session(&self, user_id: &str, access_token: &Secret<String>) -> Arc<dyn MatrixApi> {
        Arc::new(self.client(user_id, access_token))
    }

    async fn register(
        &self,
        localpart: &str,
        password: &str,
        admin: bool,
    ) -> Result<Registration> {
        let secret = self
            .shared_secret
            .as_ref()
            .ok_or_else(|| Error::message("no registration shared secret configured"))?;
        admin::register(&self.http, &self.base_url, secret, localpart, password, admin).await
    }

    fn can_register(&self) -> bool {
        self.shared_secret.is_some()
    }
}

/// Session for one account, authenticated with its access token.
pub struct MatrixClient {
    http: reqwest::Client,
    base_url: String,
    user_id: String,
    access_token: Secret<String>,
}

impl MatrixClient {
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{CLIENT_PREFIX}{path}", self.base_url))
            .bearer_auth(self.access_token.expose_secret())
    }

    fn new_txn_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }
}

#[derive(Deserialize)]
struct RoomIdResponse {
    room_id: String,
}

#[derive(Deserialize)]
struct EventIdResponse {
    event_id: String,
}

#[derive(Deserialize)]
struct JoinedRoomsResponse {
    joined_rooms: Vec<String>,
}

#[derive(Deserialize)]
struct JoinedMembersResponse {
    joined: serde_json::Map<String, Value>,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    chunk: Vec<TimelineEvent>,
}

#[async_trait]
impl MatrixApi for MatrixClient {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn whoami(&self) -> Result<Whoami> {
        execute("whoami", Replay::Safe, || {
            self.request(Method::GET, "/account/whoami")
        })
        .await
    }

    async fn create_room(&self, request: &CreateRoomRequest) -> Result<String> {
        let resp: RoomIdResponse = execute("createRoom", Replay::Unsafe, || {
            self.request(Method::POST, "/createRoom").json(request)
        })
        .await?;
        debug!(room_id = %resp.room_id, space = request.is_space(), "room created");
        Ok(resp.room_id)
    }

    async fn invite(&self, room_id: &str, user_id: &str) -> Result<()> {
        let path = format!("/rooms/{}/invite", enc(room_id));
        let body = json!({ "user_id": user_id });
        let _: Value = execute("invite", Replay::Safe, || {
            self.request(Method::POST, &path).json(&body)
        })
        .await?;
        Ok(())
    }

    async fn join(&self, room_id_or_alias: &str) -> Result<String> {
        let path = format!("/join/{}", enc(room_id_or_alias));
        let resp: RoomIdResponse = execute("join", Replay::Safe, || {
            self.request(Method::POST, &path).json(&json!({}))
        })
        .await?;
        Ok(resp.room_id)
    }

    async fn leave(&self, room_id: &str) -> Result<()> {
        let path = format!("/rooms/{}/leave", enc(room_id));
        let _: Value = execute("leave", Replay::Safe, || {
            self.request(Method::POST, &path).json(&json!({}))
        })
        .await?;
        Ok(())
    }

    async fn joined_rooms(&self) -> Result<Vec<String>> {
        let resp: JoinedRoomsResponse = execute("joined_rooms", Replay::Safe, || {
            self.request(Method::GET, "/joined_rooms")
        })
        .await?;
        Ok(resp.joined_rooms)
    }

    async fn joined_members(&self, room_id: &str) -> Result<Vec<String>> {
        let path = format!("/rooms/{}/joined_members", enc(room_id));
        let resp: JoinedMembersResponse = execute("joined_members", Replay::Safe, || {
            self.request(Method::GET, &path)
        })
        .await?;
        Ok(resp.joined.into_iter().map(|(user, _)| user).collect())
    }

    async fn send_message(&self, room_id: &str, content: &MessageContent) -> Result<String> {
        // Same txn id on retry so the server deduplicates.
        let path = format!(
            "/rooms/{}/send/m.room.message/{}",
            enc(room_id),
            Self::new_txn_id()
        );
        let resp: EventIdResponse = execute("send", Replay::Safe, || {
            self.request(Method::PUT, &path).json(content)
        })
        .await?;
        Ok(resp.event_id)
    }

    async fn put_state(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: &Value,
    ) -> Result<String> {
        let path = format!(
            "/rooms/{}/state/{}/{}",
            enc(room_id),
            enc(event_type),
            enc(state_key)
        );
        let resp: EventIdResponse = execute("put_state", Replay::Safe, || {
            self.request(Method::PUT, &path).json(content)
        })
        .await?;
        Ok(resp.event_id)
    }

    async fn get_state(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<Value>> {
        let path = format!(
            "/rooms/{}/state/{}/{}",
            enc(room_id),
            enc(event_type),
            enc(state_key)
        );
        match execute::<Value>("get_state", Replay::Safe, || {
            self.request(Method::GET, &path)
        })
        .await
        {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn resolve_alias(&self, alias: &str) -> Result<Option<String>> {
        let path = format!("/directory/room/{}", enc(alias));
        match execute::<RoomIdResponse>("resolve_alias", Replay::Safe, || {
            self.request(Method::GET, &path)
        })
        .await
        {
            Ok(resp) => Ok(Some(resp.room_id)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn messages(&self, room_id: &str, limit: u32) -> Result<Vec<TimelineEvent>> {
        let path = format!("/rooms/{}/messages", enc(room_id));
        let limit = limit.to_string();
        let resp: MessagesResponse = execute("messages", Replay::Safe, || {
            self.request(Method::GET, &path)
                .query(&[("dir", "b"), ("limit", limit.as_str())])
        })
        .await?;
        // Backwards pagination returns newest first.
        let mut events = resp.chunk;
        events.reverse();
        Ok(events)
    }

    async fn sync(&self, since: Option<&str>, timeout_ms: u64) -> Result<SyncBatch> {
        let timeout = timeout_ms.to_string();
        let resp: SyncResponse = execute("sync", Replay::Safe, || {
            let mut req = self
                .request(Method::GET, "/sync")
                .query(&[("timeout", timeout.as_str())]);
            if let Some(since) = since {
                req = req.query(&[("since", since)]);
            }
            req
        })
        .await?;
        Ok(resp.into())
    }
}
