use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    deskbridge_channels::BotOutbound,
    deskbridge_common::{DepartmentId, now_ms},
    deskbridge_config::{DepartmentConfig, RelayConfig},
    deskbridge_matrix::{MatrixApi, TimelineEvent},
    deskbridge_sessions::{ChatMappingStore, RelayStateStore},
    serde::Serialize,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    error::{Error, Result},
    filter::{Skip, SystemNoticeFilter},
    registry::ProcessedMessageRegistry,
};

/// Counts from one [`RelayService::poll_once`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelayReport {
    pub events: usize,
    pub forwarded: usize,
    pub skipped: usize,
    /// Deliveries that will be retried on the next poll.
    pub deferred: usize,
}

/// Forwards agent replies from backing rooms to bot conversations.
///
/// Polls are strictly serialized: one sync, then every event of that batch,
/// then the configured pause. The sync cursor is persisted after a batch is
/// fully handled, so a restart resumes where the last poll ended.
pub struct RelayService {
    bridge: Arc<dyn MatrixApi>,
    outbound: Arc<dyn BotOutbound>,
    mappings: Arc<dyn ChatMappingStore>,
    state: Arc<dyn RelayStateStore>,
    filter: SystemNoticeFilter,
    registry: Mutex<ProcessedMessageRegistry>,
    department_labels: BTreeMap<DepartmentId, String>,
    settings: RelayConfig,
    started_at: u64,
    poll_lock: tokio::sync::Mutex<()>,
}

impl RelayService {
    pub fn new(
        bridge: Arc<dyn MatrixApi>,
        outbound: Arc<dyn BotOutbound>,
        mappings: Arc<dyn ChatMappingStore>,
        state: Arc<dyn RelayStateStore>,
        departments: &[DepartmentConfig],
        ignored_senders: Vec<String>,
        settings: RelayConfig,
    ) -> Result<Self> {
        let filter = SystemNoticeFilter::new(
            bridge.user_id(),
            ignored_senders,
            &settings.system_notice_patterns,
        )?;
        let registry = ProcessedMessageRegistry::new(
            settings.registry_capacity,
            settings.registry_ttl_secs.saturating_mul(1000),
        );
        Ok(Self {
            bridge,
            outbound,
            mappings,
            state,
            filter,
            registry: Mutex::new(registry),
            department_labels: departments
                .iter()
                .map(|d| (d.id.clone(), d.label()))
                .collect(),
            settings,
            started_at: now_ms(),
            poll_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Override the backlog cutoff.
    #[must_use]
    pub fn with_started_at(mut self, started_at: u64) -> Self {
        self.started_at = started_at;
        self
    }

    pub fn started_at(&self) -> u64 {
        self.started_at
    }

    fn cursor_key(&self) -> String {
        format!("sync_cursor:{}", self.bridge.user_id())
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, ProcessedMessageRegistry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Poll until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let interval = Duration::from_secs(self.settings.poll_interval_secs.max(1));
        info!(
            interval_secs = interval.as_secs(),
            bridge = self.bridge.user_id(),
            "relay started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.poll_once() => match result {
                    Ok(report) if report.forwarded > 0 || report.deferred > 0 => {
                        info!(
                            forwarded = report.forwarded,
                            deferred = report.deferred,
                            skipped = report.skipped,
                            "relay poll"
                        );
                    },
                    Ok(report) => debug!(events = report.events, "relay poll"),
                    Err(e) => warn!(error = %e, "relay poll failed"),
                },
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                () = tokio::time::sleep(interval) => {},
            }
        }
        info!("relay stopped");
    }

    /// One sync round: fetch new events and forward agent replies.
    pub async fn poll_once(&self) -> Result<RelayReport> {
        let _guard = self.poll_lock.lock().await;
        let key = self.cursor_key();
        let cursor = self.state.load_relay_state(&key).await?;
        let batch = self
            .bridge
            .sync(cursor.as_deref(), self.settings.sync_timeout_ms)
            .await
            .map_err(|e| Error::matrix("sync", None, e))?;

        let mut report = RelayReport::default();
        self.registry().evict_expired(now_ms());
        for (room_id, events) in &batch.rooms {
            for event in events {
                report.events += 1;
                match self.relay_event(room_id, event).await {
                    Ok(None) => report.forwarded += 1,
                    Ok(Some(_)) => report.skipped += 1,
                    Err(e) => {
                        warn!(room_id = %room_id, event_id = %event.event_id, error = %e, "delivery failed, will retry");
                        report.deferred += 1;
                    },
                }
            }
        }
        if !batch.invites.is_empty() {
            debug!(count = batch.invites.len(), "pending invites ignored by relay");
        }

        // Keep the old cursor when a delivery should be retried; events
        // already forwarded are then skipped through the registry.
        if report.deferred == 0 {
            self.state.save_relay_state(&key, &batch.next_batch).await?;
        }
        Ok(report)
    }

    /// `Ok(None)` when forwarded, `Ok(Some(reason))` when dropped.
    async fn relay_event(&self, room_id: &str, event: &TimelineEvent) -> Result<Option<Skip>> {
        if let Some(skip) = self.filter.check(event, self.started_at) {
            if skip != Skip::NotMessage {
                debug!(room_id, event_id = %event.event_id, reason = ?skip, "event not relayed");
            }
            return Ok(Some(skip));
        }
        if self.registry().contains(&event.event_id, now_ms()) {
            debug!(room_id, event_id = %event.event_id, "duplicate event dropped");
            return Ok(Some(Skip::Duplicate));
        }
        let Some(mapping) = self.mappings.mapping_for_room(room_id).await? else {
            debug!(room_id, event_id = %event.event_id, "no conversation for room");
            return Ok(Some(Skip::Unmapped));
        };
        let body = event.body().unwrap_or_default();
        let text = match self.department_labels.get(&mapping.department_id) {
            Some(label) => format!("{label}:\n{body}"),
            None => body.to_string(),
        };

        match self
            .outbound
            .send_text(&mapping.external_conversation_id, &text)
            .await
        {
            Ok(()) => {},
            Err(e @ deskbridge_channels::Error::Unavailable { .. }) => return Err(e.into()),
            Err(e) => {
                warn!(
                    conversation_id = %mapping.external_conversation_id,
                    event_id = %event.event_id,
                    error = %e,
                    "reply could not be delivered, dropping"
                );
                self.registry().insert(&event.event_id, now_ms());
                return Ok(Some(Skip::Undeliverable));
            },
        }
        self.registry().insert(&event.event_id, now_ms());
        debug!(
            conversation_id = %mapping.external_conversation_id,
            room_id,
            event_id = %event.event_id,
            "reply forwarded"
        );
        Ok(None)
    }
}
