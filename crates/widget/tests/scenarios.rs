#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use {
    deskbridge_common::{ChannelType, DepartmentId},
    deskbridge_config::{AccountConfig, DepartmentConfig, SpacesConfig, WidgetConfig},
    deskbridge_matrix::{
        SPACE_CHILD, SPACE_PARENT,
        memory::{Fault, MemoryHomeserver, Op},
    },
    deskbridge_sessions::{InMemoryStore, MembershipAction, RoomStatus, RoomStore, SqliteStore},
    deskbridge_spaces::SpaceManager,
    deskbridge_widget::{ConnectOutcome, WidgetOrchestrator},
    secrecy::Secret,
};

fn department(id: &str, name: &str) -> DepartmentConfig {
    DepartmentConfig {
        id: DepartmentId::new(id),
        name: name.to_string(),
        icon: String::new(),
        description: String::new(),
        accounts: vec![AccountConfig {
            user_id: format!("@{id}:localhost"),
            access_token: Secret::new(format!("{id}_token")),
        }],
        support_users: vec![format!("@{id}_lead:localhost")],
        channels: vec![ChannelType::Web],
        power_levels: Default::default(),
    }
}

fn departments() -> Vec<DepartmentConfig> {
    vec![
        department("sales", "Sales"),
        department("support", "Support"),
        department("billing", "Billing"),
    ]
}

fn settings() -> WidgetConfig {
    WidgetConfig {
        rejoin_backoff_ms: 1,
        ..Default::default()
    }
}

fn orchestrator(hs: &MemoryHomeserver, store: Arc<InMemoryStore>) -> WidgetOrchestrator {
    WidgetOrchestrator::new(
        Arc::new(hs.clone()),
        store.clone(),
        store,
        departments(),
        settings(),
    )
}

#[tokio::test]
async fn returning_to_a_department_reuses_its_room() {
    let hs = MemoryHomeserver::default();
    let store = Arc::new(InMemoryStore::new());
    let widget = orchestrator(&hs, store.clone());
    let sales = DepartmentId::new("sales");
    let support = DepartmentId::new("support");

    let u1 = widget.open_session(None, Some("U1")).await.unwrap();
    let (r1, _) = widget.select_department(&u1.customer_id, &sales).await.unwrap();
    assert_eq!(r1.outcome, ConnectOutcome::Created);

    // Widget closed and reopened: same customer id from browser storage.
    let u1 = widget
        .open_session(Some(&u1.customer_id), None)
        .await
        .unwrap();

    let (r2, report) = widget
        .select_department(&u1.customer_id, &support)
        .await
        .unwrap();
    assert_eq!(r2.outcome, ConnectOutcome::Created);
    assert_ne!(r2.room_id, r1.room_id);
    assert_eq!(report.left, vec![sales.clone()]);
    assert!(!hs.is_joined(&r1.room_id, &u1.backing_account_id));

    let left = store.get_room(&u1.customer_id, &sales).await.unwrap().unwrap();
    assert_eq!(left.status, RoomStatus::Left);
    assert_eq!(left.room_id, r1.room_id);

    let (back, report) = widget.select_department(&u1.customer_id, &sales).await.unwrap();
    assert_eq!(back.outcome, ConnectOutcome::Rejoined);
    assert_eq!(back.room_id, r1.room_id);
    assert_eq!(report.left, vec![support.clone()]);
    assert_eq!(hs.room_ids().len(), 2, "no third room");

    let record = store.get_room(&u1.customer_id, &sales).await.unwrap().unwrap();
    assert!(record.is_active());
    let actions: Vec<_> = record
        .membership_history
        .iter()
        .map(|e| (e.action, e.reason.as_str()))
        .collect();
    assert_eq!(actions, vec![
        (MembershipAction::Join, "room_created"),
        (MembershipAction::Leave, "department_switch"),
        (MembershipAction::Join, "department_switch_return"),
    ]);
}

#[tokio::test]
async fn at_most_one_active_room_per_department() {
    let hs = MemoryHomeserver::default();
    let store = Arc::new(InMemoryStore::new());
    let widget = orchestrator(&hs, store.clone());
    let u1 = widget.open_session(None, None).await.unwrap();

    for dept in ["sales", "support", "billing", "sales", "billing", "support"] {
        widget
            .select_department(&u1.customer_id, &DepartmentId::new(dept))
            .await
            .unwrap();
        let rooms = store.list_all_rooms(&u1.customer_id).await.unwrap();
        let active: Vec<_> = rooms.iter().filter(|(_, r)| r.is_active()).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].0.as_str(), dept);
    }
    assert_eq!(hs.room_ids().len(), 3);
}

#[tokio::test]
async fn lost_access_falls_back_to_a_new_room() {
    let hs = MemoryHomeserver::default();
    let store = Arc::new(InMemoryStore::new());
    let widget = orchestrator(&hs, store.clone());
    let sales = DepartmentId::new("sales");
    let support = DepartmentId::new("support");

    let u1 = widget.open_session(None, None).await.unwrap();
    let (r1, _) = widget.select_department(&u1.customer_id, &sales).await.unwrap();
    widget.select_department(&u1.customer_id, &support).await.unwrap();

    // The department account was removed from the old room, so it can no
    // longer re-invite the customer.
    hs.kick(&r1.room_id, "@sales:localhost");

    let (fresh, _) = widget.select_department(&u1.customer_id, &sales).await.unwrap();
    assert_eq!(fresh.outcome, ConnectOutcome::Created);
    assert_ne!(fresh.room_id, r1.room_id);

    let record = store.get_room(&u1.customer_id, &sales).await.unwrap().unwrap();
    assert!(record.is_active());
    assert_eq!(record.room_id, fresh.room_id);
}

#[tokio::test]
async fn revoked_department_token_falls_back_then_reports_team_unreachable() {
    let hs = MemoryHomeserver::default();
    let store = Arc::new(InMemoryStore::new());
    let widget = orchestrator(&hs, store.clone());
    let sales = DepartmentId::new("sales");

    let u1 = widget.open_session(None, None).await.unwrap();
    widget.connect(&u1.customer_id, &sales).await.unwrap();
    widget.disconnect(&u1.customer_id, None).await.unwrap();

    hs.revoke_token("@sales:localhost");
    let err = widget.connect(&u1.customer_id, &sales).await.unwrap_err();
    assert_eq!(
        err.customer_message(),
        "We can't reach the Sales team right now. Please try again later."
    );
    let record = store.get_room(&u1.customer_id, &sales).await.unwrap().unwrap();
    assert_eq!(record.status, RoomStatus::Invalid);
}

#[tokio::test]
async fn revoked_customer_token_keeps_the_room() {
    let hs = MemoryHomeserver::default();
    let store = Arc::new(InMemoryStore::new());
    let widget = orchestrator(&hs, store.clone());
    let sales = DepartmentId::new("sales");

    let u1 = widget.open_session(None, None).await.unwrap();
    let first = widget.send_message(&u1.customer_id, &sales, "hi").await.unwrap();
    assert_eq!(hs.call_count(Op::CreateRoom), 1);

    hs.revoke_token(&u1.backing_account_id);
    for _ in 0..3 {
        widget
            .send_message(&u1.customer_id, &sales, "still there?")
            .await
            .unwrap_err();
    }
    widget.connect(&u1.customer_id, &sales).await.unwrap_err();

    assert_eq!(hs.call_count(Op::CreateRoom), 1);
    let record = store.get_room(&u1.customer_id, &sales).await.unwrap().unwrap();
    assert!(record.is_active());
    assert_eq!(record.room_id, first.room_id);
}

#[tokio::test]
async fn revoked_customer_token_on_a_left_room_keeps_the_record() {
    let hs = MemoryHomeserver::default();
    let store = Arc::new(InMemoryStore::new());
    let widget = orchestrator(&hs, store.clone());
    let sales = DepartmentId::new("sales");

    let u1 = widget.open_session(None, None).await.unwrap();
    let first = widget.connect(&u1.customer_id, &sales).await.unwrap();
    widget.disconnect(&u1.customer_id, None).await.unwrap();

    hs.revoke_token(&u1.backing_account_id);
    widget.connect(&u1.customer_id, &sales).await.unwrap_err();

    assert_eq!(hs.call_count(Op::CreateRoom), 1);
    let record = store.get_room(&u1.customer_id, &sales).await.unwrap().unwrap();
    assert_eq!(record.status, RoomStatus::Left);
    assert_eq!(record.room_id, first.room_id);
}

#[tokio::test]
async fn no_room_is_created_for_a_rejected_customer_account() {
    let hs = MemoryHomeserver::default();
    let store = Arc::new(InMemoryStore::new());
    let widget = orchestrator(&hs, store.clone());
    let sales = DepartmentId::new("sales");

    let u1 = widget.open_session(None, None).await.unwrap();
    hs.revoke_token(&u1.backing_account_id);
    widget.connect(&u1.customer_id, &sales).await.unwrap_err();

    assert_eq!(hs.call_count(Op::CreateRoom), 0);
    assert!(store.get_room(&u1.customer_id, &sales).await.unwrap().is_none());
}

#[tokio::test]
async fn one_failed_leave_does_not_block_the_others() {
    let hs = MemoryHomeserver::default();
    let store = Arc::new(InMemoryStore::new());
    let widget = orchestrator(&hs, store.clone());
    let sales = DepartmentId::new("sales");
    let support = DepartmentId::new("support");
    let billing = DepartmentId::new("billing");

    let u1 = widget.open_session(None, None).await.unwrap();
    widget.connect(&u1.customer_id, &sales).await.unwrap();
    widget.connect(&u1.customer_id, &support).await.unwrap();
    widget.connect(&u1.customer_id, &billing).await.unwrap();

    hs.fail_for(&u1.backing_account_id, Op::Leave, Fault::Unavailable, 1);
    let report = widget
        .disconnect(&u1.customer_id, Some(&billing))
        .await
        .unwrap();
    assert_eq!(report.left.len(), 1);
    assert_eq!(report.failed.len(), 1);

    let rooms = store.list_all_rooms(&u1.customer_id).await.unwrap();
    assert!(rooms[&billing].is_active());
    let statuses: Vec<_> = [&sales, &support].iter().map(|d| rooms[*d].status).collect();
    assert!(statuses.contains(&RoomStatus::Left));
    assert!(statuses.contains(&RoomStatus::Active));
}

#[tokio::test]
async fn new_rooms_are_filed_under_the_web_department_space() {
    let hs = MemoryHomeserver::default();
    let store = Arc::new(InMemoryStore::new());
    let spaces = Arc::new(SpaceManager::new(
        hs.login("@admin:localhost"),
        store.clone(),
        SpacesConfig::default(),
        departments(),
        "localhost",
    ));
    let widget = orchestrator(&hs, store.clone()).with_spaces(spaces.clone());

    let u1 = widget.open_session(None, None).await.unwrap();
    let conn = widget
        .connect(&u1.customer_id, &DepartmentId::new("sales"))
        .await
        .unwrap();

    let space = spaces
        .ensure_department_space(ChannelType::Web, &DepartmentId::new("sales"))
        .await
        .unwrap();
    assert_eq!(hs.state_keys(&space, SPACE_CHILD), vec![conn.room_id.clone()]);
    assert_eq!(hs.state_keys(&conn.room_id, SPACE_PARENT), vec![space]);
}

#[tokio::test]
async fn space_failure_still_yields_a_room() {
    let hs = MemoryHomeserver::default();
    let store = Arc::new(InMemoryStore::new());
    let spaces = Arc::new(SpaceManager::new(
        hs.login("@admin:localhost"),
        store.clone(),
        SpacesConfig::default(),
        departments(),
        "localhost",
    ));
    let widget = orchestrator(&hs, store.clone()).with_spaces(spaces);
    hs.fail(Op::CreateSpace, Fault::Forbidden, 1);

    let u1 = widget.open_session(None, None).await.unwrap();
    let conn = widget
        .connect(&u1.customer_id, &DepartmentId::new("sales"))
        .await
        .unwrap();
    assert_eq!(conn.outcome, ConnectOutcome::Created);
    assert!(hs.is_joined(&conn.room_id, &u1.backing_account_id));
}

#[tokio::test]
async fn left_rooms_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("deskbridge.db");
    let hs = MemoryHomeserver::default();
    let sales = DepartmentId::new("sales");
    let support = DepartmentId::new("support");

    let (customer_id, r1) = {
        let store = Arc::new(SqliteStore::open(&path).await.unwrap());
        let widget = WidgetOrchestrator::new(
            Arc::new(hs.clone()),
            store.clone(),
            store,
            departments(),
            settings(),
        );
        let u1 = widget.open_session(None, None).await.unwrap();
        let (r1, _) = widget.select_department(&u1.customer_id, &sales).await.unwrap();
        widget.select_department(&u1.customer_id, &support).await.unwrap();
        (u1.customer_id, r1.room_id)
    };

    let store = Arc::new(SqliteStore::open(&path).await.unwrap());
    let widget = WidgetOrchestrator::new(
        Arc::new(hs.clone()),
        store.clone(),
        store,
        departments(),
        settings(),
    );
    let (back, _) = widget.select_department(&customer_id, &sales).await.unwrap();
    assert_eq!(back.outcome, ConnectOutcome::Rejoined);
    assert_eq!(back.room_id, r1);
}
