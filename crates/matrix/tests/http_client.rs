#![allow(clippy::unwrap_used, clippy::expect_used)]
//! HTTP client behavior against a mock homeserver.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    axum::{
        Json, Router,
        extract::{Path, Query, State},
        http::StatusCode,
        routing::{get, post, put},
    },
    deskbridge_matrix::{
        CreateRoomRequest, ErrorKind, Homeserver, HttpHomeserver, MessageContent,
        admin::registration_mac,
    },
    secrecy::{ExposeSecret, Secret},
    serde_json::{Value, json},
    tokio::sync::oneshot,
};

#[derive(Clone, Default)]
struct MockHomeserver {
    calls: Arc<Mutex<Vec<String>>>,
    txn_ids: Arc<Mutex<Vec<String>>>,
}

impl MockHomeserver {
    fn record(&self, name: &str) -> usize {
        let mut calls = self.calls.lock().expect("calls lock");
        calls.push(name.to_string());
        calls.iter().filter(|c| *c == name).count()
    }

    fn count(&self, name: &str) -> usize {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .filter(|c| *c == name)
            .count()
    }
}

type Reply = (StatusCode, Json<Value>);

async fn whoami(State(mock): State<MockHomeserver>) -> Reply {
    mock.record("whoami");
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "errcode": "M_UNKNOWN_TOKEN", "error": "Invalid access token" })),
    )
}

async fn send(
    State(mock): State<MockHomeserver>,
    Path((room, txn)): Path<(String, String)>,
) -> Reply {
    assert_eq!(room, "!a:hs");
    mock.txn_ids.lock().expect("txn lock").push(txn);
    if mock.record("send") == 1 {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "errcode": "M_UNKNOWN", "error": "try later" })),
        );
    }
    (StatusCode::OK, Json(json!({ "event_id": "$sent" })))
}

async fn create_room(State(mock): State<MockHomeserver>) -> Reply {
    mock.record("createRoom");
    (StatusCode::BAD_GATEWAY, Json(json!({})))
}

async fn directory(Path(alias): Path<String>) -> Reply {
    if alias == "#known:hs" {
        return (StatusCode::OK, Json(json!({ "room_id": "!known:hs" })));
    }
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "errcode": "M_NOT_FOUND", "error": "Room alias not found" })),
    )
}

async fn messages(Query(q): Query<std::collections::HashMap<String, String>>) -> Reply {
    assert_eq!(q.get("dir").map(String::as_str), Some("b"));
    assert_eq!(q.get("limit").map(String::as_str), Some("2"));
    (
        StatusCode::OK,
        Json(json!({ "chunk": [
            { "event_id": "$2", "sender": "@b:hs", "type": "m.room.message", "origin_server_ts": 2, "content": { "msgtype": "m.text", "body": "second" } },
            { "event_id": "$1", "sender": "@a:hs", "type": "m.room.message", "origin_server_ts": 1, "content": { "msgtype": "m.text", "body": "first" } }
        ]})),
    )
}

async fn register_nonce() -> Reply {
    (StatusCode::OK, Json(json!({ "nonce": "n0nce" })))
}

async fn register(Json(body): Json<Value>) -> Reply {
    let expected = registration_mac("shared", "n0nce", "webchat_1", "pw", false).unwrap();
    if body["mac"] != expected.as_str() {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "errcode": "M_FORBIDDEN", "error": "HMAC incorrect" })),
        );
    }
    (
        StatusCode::OK,
        Json(json!({ "user_id": "@webchat_1:hs", "access_token": "tok", "device_id": "D" })),
    )
}

async fn start_mock() -> (MockHomeserver, String, oneshot::Sender<()>) {
    let mock = MockHomeserver::default();
    let app = Router::new()
        .route("/_matrix/client/v3/account/whoami", get(whoami))
        .route(
            "/_matrix/client/v3/rooms/{room}/send/m.room.message/{txn}",
            put(send),
        )
        .route("/_matrix/client/v3/createRoom", post(create_room))
        .route("/_matrix/client/v3/directory/room/{alias}", get(directory))
        .route("/_matrix/client/v3/rooms/{room}/messages", get(messages))
        .route(
            "/_synapse/admin/v1/register",
            get(register_nonce).post(register),
        )
        .with_state(mock.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("serve mock homeserver");
    });
    (mock, format!("http://{addr}"), shutdown_tx)
}

fn homeserver(base: &str) -> HttpHomeserver {
    HttpHomeserver::new(base, "hs", Duration::from_secs(5))
        .unwrap()
        .with_shared_secret(Some(Secret::new("shared".into())))
}

fn token() -> Secret<String> {
    Secret::new("tok".into())
}

#[tokio::test]
async fn transient_send_is_retried_with_same_txn() {
    let (mock, base, _shutdown) = start_mock().await;
    let api = homeserver(&base).session("@bridge:hs", &token());

    let event_id = api
        .send_message("!a:hs", &MessageContent::text("hi"))
        .await
        .unwrap();
    assert_eq!(event_id, "$sent");
    assert_eq!(mock.count("send"), 2);
    let txns = mock.txn_ids.lock().unwrap().clone();
    assert_eq!(txns[0], txns[1]);
}

#[tokio::test]
async fn permanent_error_is_not_retried() {
    let (mock, base, _shutdown) = start_mock().await;
    let api = homeserver(&base).session("@bridge:hs", &token());

    let err = api.whoami().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permanent);
    assert_eq!(mock.count("whoami"), 1);
}

#[tokio::test]
async fn create_room_is_not_replayed_after_server_error() {
    let (mock, base, _shutdown) = start_mock().await;
    let api = homeserver(&base).session("@bridge:hs", &token());

    let err = api
        .create_room(&CreateRoomRequest::room("x"))
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert_eq!(mock.count("createRoom"), 1);
}

#[tokio::test]
async fn unknown_alias_resolves_to_none() {
    let (_mock, base, _shutdown) = start_mock().await;
    let api = homeserver(&base).session("@bridge:hs", &token());

    assert_eq!(api.resolve_alias("#missing:hs").await.unwrap(), None);
    assert_eq!(
        api.resolve_alias("#known:hs").await.unwrap().as_deref(),
        Some("!known:hs")
    );
}

#[tokio::test]
async fn messages_are_returned_oldest_first() {
    let (_mock, base, _shutdown) = start_mock().await;
    let api = homeserver(&base).session("@bridge:hs", &token());

    let events = api.messages("!a:hs", 2).await.unwrap();
    let bodies: Vec<_> = events.iter().filter_map(|e| e.body()).collect();
    assert_eq!(bodies, vec!["first", "second"]);
}

#[tokio::test]
async fn shared_secret_registration() {
    let (_mock, base, _shutdown) = start_mock().await;
    let hs = homeserver(&base);
    assert!(hs.can_register());

    let reg = hs.register("webchat_1", "pw", false).await.unwrap();
    assert_eq!(reg.user_id, "@webchat_1:hs");
    assert_eq!(reg.access_token.expose_secret(), "tok");
}

#[test]
fn homeserver_url_must_be_http() {
    assert!(HttpHomeserver::new("localhost:8008", "hs", Duration::from_secs(1)).is_err());
    assert!(HttpHomeserver::new("ftp://hs", "hs", Duration::from_secs(1)).is_err());
    let hs = HttpHomeserver::new("https://hs.example/", "hs", Duration::from_secs(1)).unwrap();
    assert_eq!(hs.base_url(), "https://hs.example");
}
