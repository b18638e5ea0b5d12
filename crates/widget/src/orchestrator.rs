use std::{sync::Arc, time::Duration};

use {
    deskbridge_common::{ChannelType, DepartmentId, now_ms},
    deskbridge_config::{DepartmentConfig, WidgetConfig},
    deskbridge_matrix::{
        CONVERSATION_STATE, CreateRoomRequest, Homeserver, MatrixApi, MessageContent,
        ignore_membership_conflict,
    },
    deskbridge_sessions::{CustomerSession, CustomerStore, KeyedLocks, RoomRecord, RoomStore, RoomStatus},
    deskbridge_spaces::SpaceManager,
    futures::future::join_all,
    rand::{Rng, distr::Alphanumeric},
    serde::Serialize,
    serde_json::json,
    tracing::{debug, info, warn},
};

use crate::error::{Error, Result};

const MAX_CUSTOMER_ID_LEN: usize = 64;
const MAX_HISTORY: u32 = 200;
const REGISTER_ATTEMPTS: usize = 3;

/// How [`WidgetOrchestrator::connect`] resolved the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectOutcome {
    /// The active room was still reachable.
    Reused,
    /// A previously left room was re-entered.
    Rejoined,
    /// A new room was created.
    Created,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Connection {
    pub customer_id: String,
    pub department_id: DepartmentId,
    pub room_id: String,
    pub outcome: ConnectOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DisconnectReport {
    pub left: Vec<DepartmentId>,
    /// Departments whose room could not be left. Their records are unchanged.
    pub failed: Vec<DepartmentId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SentMessage {
    pub room_id: String,
    pub event_id: String,
}

/// One timeline message as shown in the widget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub event_id: String,
    pub sender: String,
    pub body: String,
    pub msgtype: String,
    pub timestamp: u64,
    pub from_customer: bool,
}

enum Rejoin {
    Restored,
    /// Access could not be restored; the room should be replaced.
    Lost(deskbridge_matrix::Error),
    /// Every attempt failed transiently. The record is left untouched.
    Unreachable(deskbridge_matrix::Error),
}

/// Keeps one conversation room per (customer, department) for website
/// visitors.
///
/// Leaving a department's room keeps its record as `left`, so returning to
/// the department re-enters the same room instead of creating a new one.
pub struct WidgetOrchestrator {
    homeserver: Arc<dyn Homeserver>,
    customers: Arc<dyn CustomerStore>,
    rooms: Arc<dyn RoomStore>,
    spaces: Option<Arc<SpaceManager>>,
    departments: Vec<DepartmentConfig>,
    settings: WidgetConfig,
    locks: KeyedLocks,
}

impl WidgetOrchestrator {
    pub fn new(
        homeserver: Arc<dyn Homeserver>,
        customers: Arc<dyn CustomerStore>,
        rooms: Arc<dyn RoomStore>,
        departments: Vec<DepartmentConfig>,
        settings: WidgetConfig,
    ) -> Self {
        let departments = departments
            .into_iter()
            .filter(|d| d.serves(ChannelType::Web))
            .collect();
        Self {
            homeserver,
            customers,
            rooms,
            spaces: None,
            departments,
            settings,
            locks: KeyedLocks::new(),
        }
    }

    /// File new rooms under the department's website space.
    #[must_use]
    pub fn with_spaces(mut self, spaces: Arc<SpaceManager>) -> Self {
        self.spaces = Some(spaces);
        self
    }

    /// Departments offered on the website.
    pub fn departments(&self) -> &[DepartmentConfig] {
        &self.departments
    }

    fn department(&self, id: &DepartmentId) -> Result<&DepartmentConfig> {
        self.departments
            .iter()
            .find(|d| &d.id == id)
            .ok_or_else(|| Error::UnknownDepartment(id.clone()))
    }

    async fn customer(&self, customer_id: &str) -> Result<CustomerSession> {
        self.customers
            .get_customer(customer_id)
            .await?
            .ok_or_else(|| Error::UnknownCustomer(customer_id.to_string()))
    }

    fn customer_api(&self, session: &CustomerSession) -> Arc<dyn MatrixApi> {
        self.homeserver
            .session(&session.backing_account_id, &session.access_token)
    }

    fn acting_api(&self, department: &DepartmentConfig) -> Result<Arc<dyn MatrixApi>> {
        let account = department
            .acting_account()
            .ok_or_else(|| Error::DepartmentUnavailable {
                department: department.id.clone(),
                name: department.name.clone(),
            })?;
        Ok(self
            .homeserver
            .session(&account.user_id, &account.access_token))
    }

    /// Return the stored session for `customer_id`, or start a new one with
    /// a freshly provisioned backing account.
    ///
    /// An unknown but well-formed id is adopted so a browser keeps its
    /// identifier after the server-side state was reset.
    pub async fn open_session(
        &self,
        customer_id: Option<&str>,
        display_name: Option<&str>,
    ) -> Result<CustomerSession> {
        let display_name = display_name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string);

        if let Some(id) = customer_id
            && let Some(mut session) = self.customers.get_customer(id).await?
        {
            if display_name.is_some() && display_name != session.display_name {
                session.display_name = display_name;
                self.customers.save_customer(&session).await?;
            }
            self.customers.touch_customer(id, false).await?;
            debug!(customer_id = id, "customer session resumed");
            return Ok(session);
        }

        let customer_id = customer_id
            .filter(|id| is_valid_customer_id(id))
            .map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_string);
        let (backing_account_id, access_token) = self.provision_account(&customer_id).await?;

        let now = now_ms();
        let session = CustomerSession {
            customer_id: customer_id.clone(),
            display_name,
            backing_account_id,
            access_token,
            department_rooms: Default::default(),
            conversation_count: 0,
            created_at: now,
            last_activity_at: now,
        };
        self.customers.save_customer(&session).await?;
        info!(
            customer_id = %customer_id,
            backing_account = %session.backing_account_id,
            "customer session created"
        );
        Ok(session)
    }

    async fn provision_account(
        &self,
        customer_id: &str,
    ) -> Result<(String, secrecy::Secret<String>)> {
        if !self.homeserver.can_register() {
            return Err(Error::ProvisioningUnavailable);
        }
        let base = format!(
            "{}{}",
            self.settings.customer_localpart_prefix,
            localpart_of(customer_id)
        );
        let mut localpart = base.clone();
        for _ in 0..REGISTER_ATTEMPTS {
            match self
                .homeserver
                .register(&localpart, &random_token(32), false)
                .await
            {
                Ok(registration) => return Ok((registration.user_id, registration.access_token)),
                Err(deskbridge_matrix::Error::Api { errcode, .. }) if errcode == "M_USER_IN_USE" => {
                    debug!(localpart = %localpart, "localpart taken, retrying with suffix");
                    localpart = format!("{base}_{}", random_token(6).to_lowercase());
                },
                Err(e) => return Err(Error::matrix("register customer account", None, e)),
            }
        }
        Err(Error::matrix(
            "register customer account",
            None,
            deskbridge_matrix::Error::message(format!(
                "no free localpart for {base} after {REGISTER_ATTEMPTS} attempts"
            )),
        ))
    }

    /// Resolve the customer's room for `department`: reuse it, re-enter it,
    /// or create a new one.
    pub async fn connect(&self, customer_id: &str, department_id: &DepartmentId) -> Result<Connection> {
        let department = self.department(department_id)?;
        let session = self.customer(customer_id).await?;
        let _guard = self.locks.lock(&lock_key(customer_id, department_id)).await;
        self.connect_locked(&session, department).await
    }

    async fn connect_locked(
        &self,
        session: &CustomerSession,
        department: &DepartmentConfig,
    ) -> Result<Connection> {
        let customer_id = session.customer_id.as_str();
        let department_id = &department.id;
        let customer_api = self.customer_api(session);
        let mut record = self.rooms.get_room(customer_id, department_id).await?;

        if let Some(active) = record.as_ref().filter(|r| r.is_active()) {
            let joined = customer_api
                .joined_rooms()
                .await
                .map_err(|e| Error::matrix("verify membership", Some(&department.name), e))?;
            if joined.contains(&active.room_id) {
                self.rooms.touch_room(customer_id, department_id).await?;
                self.customers.touch_customer(customer_id, false).await?;
                debug!(customer_id, department_id = %department_id, room_id = %active.room_id, "room reused");
                return Ok(self.connection(session, department, &active.room_id, ConnectOutcome::Reused));
            }
            warn!(
                customer_id,
                department_id = %department_id,
                room_id = %active.room_id,
                "customer no longer in active room"
            );
            record = self
                .rooms
                .mark_room_left(customer_id, department_id, "membership_lost")
                .await?;
        }

        if let Some(left) = record.filter(|r| r.status == RoomStatus::Left) {
            match self.rejoin(&customer_api, department, &left).await? {
                Rejoin::Restored => {
                    self.rooms
                        .set_room_active(customer_id, department_id, &left.room_id, "department_switch_return")
                        .await?;
                    self.customers.touch_customer(customer_id, false).await?;
                    info!(customer_id, department_id = %department_id, room_id = %left.room_id, "room rejoined");
                    return Ok(self.connection(session, department, &left.room_id, ConnectOutcome::Rejoined));
                },
                Rejoin::Unreachable(e) => {
                    return Err(Error::matrix("rejoin room", Some(&department.name), e));
                },
                Rejoin::Lost(e) => {
                    warn!(
                        customer_id,
                        department_id = %department_id,
                        room_id = %left.room_id,
                        error = %e,
                        "room access lost, creating a replacement"
                    );
                    self.rooms
                        .mark_room_invalid(customer_id, department_id, "rejoin_failed")
                        .await?;
                },
            }
        }

        // A room the customer cannot join would be replaced on every attempt.
        customer_api
            .whoami()
            .await
            .map_err(|e| Error::matrix("verify customer account", Some(&department.name), e))?;
        let room_id = self.create_room(session, department, &customer_api).await?;
        Ok(self.connection(session, department, &room_id, ConnectOutcome::Created))
    }

    /// Re-invite the customer and join again, then confirm membership.
    ///
    /// Only a refused invite or a refused join counts as lost access. When
    /// the customer's own account is rejected the error is returned as is,
    /// since a replacement room would be just as unreachable.
    async fn rejoin(
        &self,
        customer_api: &Arc<dyn MatrixApi>,
        department: &DepartmentConfig,
        record: &RoomRecord,
    ) -> Result<Rejoin> {
        let acting = self.acting_api(department)?;
        let room_id = record.room_id.as_str();
        let attempts = self.settings.rejoin_attempts.max(1);
        let mut last_transient = None;

        for attempt in 1..=attempts {
            let result = match ignore_membership_conflict(
                acting.invite(room_id, customer_api.user_id()).await,
            ) {
                Err(e) if e.is_transient() => Err(e),
                Err(e) => return Ok(Rejoin::Lost(e)),
                Ok(()) => match customer_api.join(room_id).await {
                    Ok(_) => customer_api.joined_rooms().await,
                    Err(e) => Err(e),
                },
            };
            match result {
                Ok(joined) if joined.iter().any(|r| r == room_id) => return Ok(Rejoin::Restored),
                Ok(_) => {
                    debug!(room_id, attempt, "join not visible yet");
                },
                Err(e) if e.is_transient() => {
                    debug!(room_id, attempt, error = %e, "rejoin attempt failed");
                    last_transient = Some(e);
                },
                Err(e) if e.is_unauthorized() => {
                    return Err(Error::matrix("rejoin room", Some(&department.name), e));
                },
                Err(e) => return Ok(Rejoin::Lost(e)),
            }
            if attempt < attempts {
                tokio::time::sleep(Duration::from_millis(
                    self.settings.rejoin_backoff_ms * u64::from(attempt),
                ))
                .await;
            }
        }

        Ok(match last_transient {
            Some(e) => Rejoin::Unreachable(e),
            None => Rejoin::Lost(deskbridge_matrix::Error::message(format!(
                "membership in {room_id} not confirmed after {attempts} attempts"
            ))),
        })
    }

    async fn create_room(
        &self,
        session: &CustomerSession,
        department: &DepartmentConfig,
        customer_api: &Arc<dyn MatrixApi>,
    ) -> Result<String> {
        let customer_id = session.customer_id.as_str();
        let acting = self.acting_api(department)?;
        let label = session.label();
        let mut invites: Vec<String> = department
            .identities()
            .into_iter()
            .chain([session.backing_account_id.clone()])
            .collect();
        let mut levels = department.room_power_levels();
        if let Some(spaces) = &self.spaces {
            spaces.grant_placement_access(&mut invites, &mut levels);
        }
        invites.retain(|id| id != acting.user_id());
        let request = CreateRoomRequest::room(format!("{label} (Web) - {}", department.name))
            .with_topic(format!("Website conversation with {label} - {}", department.name))
            .with_invites(invites)
            .with_power_levels(&levels)
            .with_state(
                CONVERSATION_STATE,
                "",
                json!({
                    "department": department.id,
                    "channel": ChannelType::Web,
                    "owner": customer_id,
                }),
            );
        let room_id = acting
            .create_room(&request)
            .await
            .map_err(|e| Error::matrix("create room", Some(&department.name), e))?;

        // Recorded before the join so a failed join is repaired by the next
        // connect instead of producing a second room.
        self.rooms
            .set_room_active(customer_id, &department.id, &room_id, "room_created")
            .await?;
        self.customers.touch_customer(customer_id, true).await?;
        info!(customer_id, department_id = %department.id, room_id = %room_id, "room created");

        customer_api
            .join(&room_id)
            .await
            .map_err(|e| Error::matrix("join new room", Some(&department.name), e))?;

        if let Some(spaces) = &self.spaces
            && spaces.enabled()
            && let Err(e) = spaces
                .place_room_in_department(&room_id, ChannelType::Web, &department.id)
                .await
        {
            warn!(room_id = %room_id, department_id = %department.id, error = %e, "room left unorganized");
        }

        let notice = MessageContent::notice(format!("New website conversation started with {label}"));
        if let Err(e) = acting.send_message(&room_id, &notice).await {
            warn!(room_id = %room_id, error = %e, "failed to post conversation notice");
        }
        Ok(room_id)
    }

    fn connection(
        &self,
        session: &CustomerSession,
        department: &DepartmentConfig,
        room_id: &str,
        outcome: ConnectOutcome,
    ) -> Connection {
        Connection {
            customer_id: session.customer_id.clone(),
            department_id: department.id.clone(),
            room_id: room_id.to_string(),
            outcome,
        }
    }

    /// Leave every active room except `current`'s. With `None`, leave all.
    ///
    /// Leaves run concurrently. A failed leave is logged and its record kept
    /// as is; it never aborts the others.
    pub async fn disconnect(
        &self,
        customer_id: &str,
        current: Option<&DepartmentId>,
    ) -> Result<DisconnectReport> {
        let session = self.customer(customer_id).await?;
        let customer_api = self.customer_api(&session);
        let rooms = self.rooms.list_all_rooms(customer_id).await?;

        let leaves = rooms
            .into_iter()
            .filter(|(dept, record)| record.is_active() && Some(dept) != current)
            .map(|(dept, _)| {
                let customer_api = Arc::clone(&customer_api);
                async move {
                    let _guard = self.locks.lock(&lock_key(customer_id, &dept)).await;
                    // The listing was taken unlocked; a concurrent connect may
                    // have replaced or left the room since.
                    let record = match self.rooms.get_room(customer_id, &dept).await {
                        Ok(Some(record)) if record.is_active() => record,
                        Ok(_) => return None,
                        Err(e) => {
                            warn!(customer_id, department_id = %dept, error = %e, "failed to load room record");
                            return Some((dept, false));
                        },
                    };
                    if let Err(e) = customer_api.leave(&record.room_id).await {
                        warn!(
                            customer_id,
                            department_id = %dept,
                            room_id = %record.room_id,
                            error = %e,
                            "failed to leave room"
                        );
                        return Some((dept, false));
                    }
                    match self.rooms.mark_room_left(customer_id, &dept, "department_switch").await {
                        Ok(_) => {
                            info!(customer_id, department_id = %dept, room_id = %record.room_id, "room left");
                            Some((dept, true))
                        },
                        Err(e) => {
                            warn!(customer_id, department_id = %dept, error = %e, "failed to record leave");
                            Some((dept, false))
                        },
                    }
                }
            });

        let mut report = DisconnectReport::default();
        for (dept, ok) in join_all(leaves).await.into_iter().flatten() {
            if ok {
                report.left.push(dept);
            } else {
                report.failed.push(dept);
            }
        }
        Ok(report)
    }

    /// Switch the customer to `department_id`: connect there, then leave
    /// every other department's room.
    pub async fn select_department(
        &self,
        customer_id: &str,
        department_id: &DepartmentId,
    ) -> Result<(Connection, DisconnectReport)> {
        let connection = self.connect(customer_id, department_id).await?;
        let report = self.disconnect(customer_id, Some(department_id)).await?;
        Ok((connection, report))
    }

    /// Send `body` as the customer, connecting first when needed.
    pub async fn send_message(
        &self,
        customer_id: &str,
        department_id: &DepartmentId,
        body: &str,
    ) -> Result<SentMessage> {
        if body.trim().is_empty() {
            return Err(Error::EmptyMessage);
        }
        let department = self.department(department_id)?;
        let session = self.customer(customer_id).await?;
        let customer_api = self.customer_api(&session);
        let content = MessageContent::text(body);

        let room_id = match self.rooms.get_room(customer_id, department_id).await? {
            Some(record) if record.is_active() => record.room_id,
            _ => self.connect(customer_id, department_id).await?.room_id,
        };

        let (room_id, event_id) = match customer_api.send_message(&room_id, &content).await {
            Ok(event_id) => (room_id, event_id),
            Err(e) if e.is_transient() || e.is_unauthorized() => {
                return Err(Error::matrix("send message", Some(&department.name), e));
            },
            Err(e) => {
                debug!(customer_id, room_id = %room_id, error = %e, "send failed, reconnecting");
                {
                    let _guard = self.locks.lock(&lock_key(customer_id, department_id)).await;
                    self.rooms
                        .mark_room_left(customer_id, department_id, "membership_lost")
                        .await?;
                }
                let room_id = self.connect(customer_id, department_id).await?.room_id;
                let event_id = customer_api
                    .send_message(&room_id, &content)
                    .await
                    .map_err(|e| Error::matrix("send message", Some(&department.name), e))?;
                (room_id, event_id)
            },
        };

        self.rooms.touch_room(customer_id, department_id).await?;
        self.customers.touch_customer(customer_id, false).await?;
        Ok(SentMessage { room_id, event_id })
    }

    /// The last messages of the customer's connected room, oldest first.
    pub async fn history(
        &self,
        customer_id: &str,
        department_id: &DepartmentId,
        limit: Option<u32>,
    ) -> Result<Vec<HistoryEntry>> {
        let department = self.department(department_id)?;
        let session = self.customer(customer_id).await?;
        let record = self
            .rooms
            .get_room(customer_id, department_id)
            .await?
            .filter(RoomRecord::is_active)
            .ok_or_else(|| Error::NotConnected(department_id.clone()))?;

        let limit = limit
            .unwrap_or(self.settings.history_limit)
            .clamp(1, MAX_HISTORY);
        let events = self
            .customer_api(&session)
            .messages(&record.room_id, limit)
            .await
            .map_err(|e| Error::matrix("load history", Some(&department.name), e))?;

        Ok(events
            .into_iter()
            .filter(|e| e.is_message())
            .filter_map(|e| {
                let body = e.body()?.to_string();
                let msgtype = e.msgtype().unwrap_or("m.text").to_string();
                Some(HistoryEntry {
                    from_customer: e.sender == session.backing_account_id,
                    event_id: e.event_id,
                    sender: e.sender,
                    body,
                    msgtype,
                    timestamp: e.origin_server_ts,
                })
            })
            .collect())
    }
}

fn lock_key(customer_id: &str, department: &DepartmentId) -> String {
    format!("web:{customer_id}/{department}")
}

fn is_valid_customer_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_CUSTOMER_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Lowercase, with anything outside the localpart alphabet replaced.
fn localpart_of(customer_id: &str) -> String {
    customer_id
        .chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9' | '-' | '_' | '.') => c,
            _ => '_',
        })
        .collect()
}

fn random_token(len: usize) -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        deskbridge_config::AccountConfig,
        deskbridge_matrix::memory::{Fault, MemoryHomeserver, Op},
        deskbridge_sessions::InMemoryStore,
        rstest::rstest,
        secrecy::Secret,
    };

    fn department(id: &str, agent: &str) -> DepartmentConfig {
        DepartmentConfig {
            id: DepartmentId::new(id),
            name: id.to_string(),
            icon: String::new(),
            description: String::new(),
            accounts: vec![AccountConfig {
                user_id: agent.to_string(),
                access_token: Secret::new("t".into()),
            }],
            support_users: vec!["@lead:localhost".into()],
            channels: Vec::new(),
            power_levels: Default::default(),
        }
    }

    fn setup(hs: &MemoryHomeserver) -> (WidgetOrchestrator, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let settings = WidgetConfig {
            rejoin_backoff_ms: 1,
            ..Default::default()
        };
        let orchestrator = WidgetOrchestrator::new(
            Arc::new(hs.clone()),
            store.clone(),
            store.clone(),
            vec![department("sales", "@sales:localhost")],
            settings,
        );
        (orchestrator, store)
    }

    #[rstest]
    #[case("3f2a9c1e-aaaa-bbbb-cccc-0123456789ab", true)]
    #[case("visitor_42", true)]
    #[case("", false)]
    #[case("../etc/passwd", false)]
    #[case("has space", false)]
    fn customer_id_validation(#[case] id: &str, #[case] valid: bool) {
        assert_eq!(is_valid_customer_id(id), valid);
    }

    #[test]
    fn localparts_are_lowercase() {
        assert_eq!(localpart_of("AbC-1"), "abc-1");
    }

    #[tokio::test]
    async fn open_session_provisions_once() {
        let hs = MemoryHomeserver::default();
        let (orchestrator, _) = setup(&hs);

        let first = orchestrator.open_session(None, Some("Ada")).await.unwrap();
        assert!(first.backing_account_id.starts_with("@webchat_"));
        assert_eq!(first.label(), "Ada");

        let again = orchestrator
            .open_session(Some(&first.customer_id), None)
            .await
            .unwrap();
        assert_eq!(again.backing_account_id, first.backing_account_id);
        assert_eq!(hs.call_count(Op::Register), 1);
    }

    #[tokio::test]
    async fn open_session_adopts_unknown_id() {
        let hs = MemoryHomeserver::default();
        let (orchestrator, _) = setup(&hs);
        let session = orchestrator.open_session(Some("visitor_42"), None).await.unwrap();
        assert_eq!(session.customer_id, "visitor_42");
        assert_eq!(session.backing_account_id, "@webchat_visitor_42:localhost");
    }

    #[tokio::test]
    async fn open_session_retries_taken_localpart() {
        let hs = MemoryHomeserver::default();
        hs.login("@webchat_visitor_42:localhost");
        let (orchestrator, _) = setup(&hs);
        let session = orchestrator.open_session(Some("visitor_42"), None).await.unwrap();
        assert!(session.backing_account_id.starts_with("@webchat_visitor_42_"));
    }

    #[tokio::test]
    async fn open_session_without_registration() {
        let hs = MemoryHomeserver::default().without_registration();
        let (orchestrator, _) = setup(&hs);
        let err = orchestrator.open_session(None, None).await.unwrap_err();
        assert!(matches!(err, Error::ProvisioningUnavailable));
    }

    #[tokio::test]
    async fn connect_creates_room_with_all_identities() {
        let hs = MemoryHomeserver::default();
        let (orchestrator, store) = setup(&hs);
        let session = orchestrator.open_session(None, Some("Ada")).await.unwrap();
        let sales = DepartmentId::new("sales");

        let conn = orchestrator.connect(&session.customer_id, &sales).await.unwrap();
        assert_eq!(conn.outcome, ConnectOutcome::Created);
        assert!(hs.is_joined(&conn.room_id, &session.backing_account_id));
        assert!(hs.is_joined(&conn.room_id, "@sales:localhost"));
        assert!(hs.is_invited(&conn.room_id, "@lead:localhost"));

        let request = hs.create_request(&conn.room_id).unwrap();
        assert_eq!(request.name.as_deref(), Some("Ada (Web) - sales"));
        let state = hs.state(&conn.room_id, CONVERSATION_STATE, "").unwrap();
        assert_eq!(state["channel"], "web");

        let record = store.get_room(&session.customer_id, &sales).await.unwrap().unwrap();
        assert!(record.is_active());
        let customer = store.get_customer(&session.customer_id).await.unwrap().unwrap();
        assert_eq!(customer.conversation_count, 1);

        let timeline = hs.timeline(&conn.room_id);
        assert_eq!(timeline[0].msgtype(), Some("m.notice"));
    }

    #[tokio::test]
    async fn connect_twice_reuses() {
        let hs = MemoryHomeserver::default();
        let (orchestrator, _) = setup(&hs);
        let session = orchestrator.open_session(None, None).await.unwrap();
        let sales = DepartmentId::new("sales");

        let first = orchestrator.connect(&session.customer_id, &sales).await.unwrap();
        let second = orchestrator.connect(&session.customer_id, &sales).await.unwrap();
        assert_eq!(second.outcome, ConnectOutcome::Reused);
        assert_eq!(first.room_id, second.room_id);
        assert_eq!(hs.room_ids().len(), 1);
    }

    #[tokio::test]
    async fn unknown_department_and_customer() {
        let hs = MemoryHomeserver::default();
        let (orchestrator, _) = setup(&hs);
        let session = orchestrator.open_session(None, None).await.unwrap();

        let err = orchestrator
            .connect(&session.customer_id, &DepartmentId::new("billing"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownDepartment(_)));

        let err = orchestrator
            .connect("nobody", &DepartmentId::new("sales"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownCustomer(_)));
    }

    #[tokio::test]
    async fn kicked_customer_is_reinvited_into_same_room() {
        let hs = MemoryHomeserver::default();
        let (orchestrator, _) = setup(&hs);
        let session = orchestrator.open_session(None, None).await.unwrap();
        let sales = DepartmentId::new("sales");

        let first = orchestrator.connect(&session.customer_id, &sales).await.unwrap();
        hs.kick(&first.room_id, &session.backing_account_id);

        let again = orchestrator.connect(&session.customer_id, &sales).await.unwrap();
        assert_eq!(again.outcome, ConnectOutcome::Rejoined);
        assert_eq!(again.room_id, first.room_id);
    }

    #[tokio::test]
    async fn transient_rejoin_failure_keeps_record() {
        let hs = MemoryHomeserver::default();
        let (orchestrator, store) = setup(&hs);
        let session = orchestrator.open_session(None, None).await.unwrap();
        let sales = DepartmentId::new("sales");

        let first = orchestrator.connect(&session.customer_id, &sales).await.unwrap();
        orchestrator.disconnect(&session.customer_id, None).await.unwrap();

        hs.fail(Op::Invite, Fault::Unavailable, 10);
        let err = orchestrator.connect(&session.customer_id, &sales).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(
            err.customer_message(),
            "Something went wrong on our side. Please try again in a moment."
        );

        let record = store.get_room(&session.customer_id, &sales).await.unwrap().unwrap();
        assert_eq!(record.status, RoomStatus::Left);
        assert_eq!(record.room_id, first.room_id);
    }

    #[tokio::test]
    async fn history_requires_connection() {
        let hs = MemoryHomeserver::default();
        let (orchestrator, _) = setup(&hs);
        let session = orchestrator.open_session(None, None).await.unwrap();
        let sales = DepartmentId::new("sales");

        let err = orchestrator
            .history(&session.customer_id, &sales, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected(_)));

        orchestrator
            .send_message(&session.customer_id, &sales, "hello")
            .await
            .unwrap();
        let conn = orchestrator.connect(&session.customer_id, &sales).await.unwrap();
        hs.inject_message(&conn.room_id, "@sales:localhost", &MessageContent::text("hi, how can we help?"));

        let history = orchestrator
            .history(&session.customer_id, &sales, Some(2))
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].body, "hello");
        assert!(history[0].from_customer);
        assert!(!history[1].from_customer);
    }

    #[tokio::test]
    async fn send_message_recovers_from_lost_membership() {
        let hs = MemoryHomeserver::default();
        let (orchestrator, _) = setup(&hs);
        let session = orchestrator.open_session(None, None).await.unwrap();
        let sales = DepartmentId::new("sales");

        let first = orchestrator
            .send_message(&session.customer_id, &sales, "one")
            .await
            .unwrap();
        hs.kick(&first.room_id, &session.backing_account_id);

        let second = orchestrator
            .send_message(&session.customer_id, &sales, "two")
            .await
            .unwrap();
        assert_eq!(second.room_id, first.room_id);
        let bodies: Vec<_> = hs
            .timeline(&first.room_id)
            .iter()
            .filter_map(|e| e.body().map(str::to_string))
            .collect();
        assert!(bodies.contains(&"two".to_string()));
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let hs = MemoryHomeserver::default();
        let (orchestrator, _) = setup(&hs);
        let session = orchestrator.open_session(None, None).await.unwrap();
        let err = orchestrator
            .send_message(&session.customer_id, &DepartmentId::new("sales"), "   ")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmptyMessage));
        assert_eq!(hs.room_ids().len(), 0);
    }

    #[tokio::test]
    async fn disconnect_rechecks_the_record_under_the_lock() {
        let hs = MemoryHomeserver::default();
        let (orchestrator, store) = setup(&hs);
        let sales = DepartmentId::new("sales");
        let session = orchestrator.open_session(None, None).await.unwrap();
        let first = orchestrator.connect(&session.customer_id, &sales).await.unwrap();

        let guard = orchestrator
            .locks
            .lock(&lock_key(&session.customer_id, &sales))
            .await;
        let concurrent_leave = async {
            for _ in 0..3 {
                tokio::task::yield_now().await;
            }
            store
                .mark_room_left(&session.customer_id, &sales, "department_switch")
                .await
                .unwrap();
            drop(guard);
        };
        let (report, ()) = tokio::join!(
            orchestrator.disconnect(&session.customer_id, None),
            concurrent_leave
        );

        let report = report.unwrap();
        assert!(report.left.is_empty());
        assert!(report.failed.is_empty());
        assert_eq!(hs.call_count(Op::Leave), 0);
        assert!(hs.is_joined(&first.room_id, &session.backing_account_id));
    }
}
