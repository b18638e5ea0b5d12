use std::{path::PathBuf, sync::Arc, time::Duration};

use {
    anyhow::{Context, bail},
    deskbridge_bridge::{BridgeRouter, RelayService},
    deskbridge_channels::ChannelType,
    deskbridge_common::{now_ms, server_name_of},
    deskbridge_config::{DeskbridgeConfig, data_dir},
    deskbridge_matrix::{Homeserver, HttpHomeserver},
    deskbridge_sessions::{RoomStore, SqliteStore},
    deskbridge_spaces::SpaceManager,
    deskbridge_telegram::{TelegramOutbound, build_bot, start_polling},
    deskbridge_widget::WidgetOrchestrator,
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
};

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

/// Server name from config, else from the first configured account id.
pub fn resolve_server_name(config: &DeskbridgeConfig) -> anyhow::Result<String> {
    if let Some(name) = config.matrix.server_name.as_deref().filter(|n| !n.is_empty()) {
        return Ok(name.to_string());
    }
    config
        .matrix
        .bridge
        .iter()
        .chain(config.matrix.admin.iter())
        .chain(config.departments.iter().flat_map(|d| d.accounts.iter()))
        .find_map(|account| server_name_of(&account.user_id))
        .map(str::to_string)
        .context("cannot determine the server name: set matrix.server_name")
}

pub fn database_path(config: &DeskbridgeConfig) -> PathBuf {
    config
        .store
        .database_path
        .clone()
        .unwrap_or_else(|| data_dir().join("deskbridge.db"))
}

/// Invalid records last updated before this instant are pruned.
pub fn prune_cutoff(now: u64, retention_days: u64) -> u64 {
    now.saturating_sub(retention_days.saturating_mul(DAY_MS))
}

pub async fn open_store(config: &DeskbridgeConfig) -> anyhow::Result<Arc<SqliteStore>> {
    let path = database_path(config);
    let store = SqliteStore::open(&path)
        .await
        .with_context(|| format!("failed to open state store at {}", path.display()))?;
    info!(path = %path.display(), "state store opened");
    Ok(Arc::new(store))
}

pub fn homeserver(config: &DeskbridgeConfig) -> anyhow::Result<Arc<HttpHomeserver>> {
    let server_name = resolve_server_name(config)?;
    let homeserver = HttpHomeserver::new(
        &config.matrix.homeserver,
        &server_name,
        Duration::from_secs(config.matrix.request_timeout_secs.max(1)),
    )?
    .with_shared_secret(config.matrix.registration_shared_secret.clone());
    Ok(Arc::new(homeserver))
}

/// `None` when spaces are disabled or no account may own them.
pub fn space_manager(
    config: &DeskbridgeConfig,
    homeserver: &Arc<HttpHomeserver>,
    store: &Arc<SqliteStore>,
) -> Option<Arc<SpaceManager>> {
    if !config.spaces.enabled {
        return None;
    }
    let Some(admin) = config.space_admin() else {
        warn!("spaces enabled but no account can own them, rooms stay unorganized");
        return None;
    };
    Some(Arc::new(SpaceManager::new(
        homeserver.session(&admin.user_id, &admin.access_token),
        store.clone(),
        config.spaces.clone(),
        config.departments.clone(),
        homeserver.server_name(),
    )))
}

/// Everything the running process shares between the widget API, the
/// relay and the bot transport.
pub struct GatewayServices {
    pub store: Arc<SqliteStore>,
    pub homeserver: Arc<HttpHomeserver>,
    pub spaces: Option<Arc<SpaceManager>>,
    pub widget: Arc<WidgetOrchestrator>,
}

impl GatewayServices {
    pub async fn init(config: &DeskbridgeConfig) -> anyhow::Result<Self> {
        let store = open_store(config).await?;
        let homeserver = homeserver(config)?;
        let spaces = space_manager(config, &homeserver, &store);

        if !homeserver.can_register() {
            warn!("no registration shared secret, website visitors cannot start chats");
        }

        let mut widget = WidgetOrchestrator::new(
            homeserver.clone(),
            store.clone(),
            store.clone(),
            config.departments.clone(),
            config.widget.clone(),
        );
        if let Some(spaces) = &spaces {
            widget = widget.with_spaces(Arc::clone(spaces));
        }

        Ok(Self {
            store,
            homeserver,
            spaces,
            widget: Arc::new(widget),
        })
    }

    /// Prune stale invalid rooms and repair space links. Failures are
    /// logged; the process keeps starting.
    pub async fn startup_maintenance(&self, config: &DeskbridgeConfig) {
        let cutoff = prune_cutoff(now_ms(), config.store.invalid_retention_days);
        match self.store.prune_invalid(cutoff).await {
            Ok(0) => {},
            Ok(pruned) => info!(pruned, "pruned invalid room records"),
            Err(e) => warn!(error = %e, "failed to prune invalid room records"),
        }

        if let Some(spaces) = &self.spaces
            && config.spaces.repair_on_startup
        {
            match spaces.repair().await {
                Ok(report) => info!(
                    spaces_checked = report.spaces_checked,
                    spaces_relinked = report.spaces_relinked,
                    rooms_checked = report.rooms_checked,
                    rooms_relinked = report.rooms_relinked,
                    failed = report.failed.len(),
                    "space repair finished"
                ),
                Err(e) => warn!(error = %e, "space repair failed"),
            }
        }
    }

    /// Verify the bridge account, then start the relay and Telegram polling.
    /// Both stop when `cancel` fires.
    pub async fn start_bot_channel(
        &self,
        config: &DeskbridgeConfig,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        if !config.telegram.enabled {
            info!("telegram disabled");
            return Ok(());
        }
        let Some(account) = config.matrix.bridge.as_ref() else {
            bail!("telegram is enabled but matrix.bridge is not configured");
        };
        let bridge = self
            .homeserver
            .session(&account.user_id, &account.access_token);
        let me = bridge
            .whoami()
            .await
            .with_context(|| format!("bridge account {} failed verification", account.user_id))?;
        if me.user_id != account.user_id {
            bail!(
                "bridge token belongs to {} instead of {}",
                me.user_id,
                account.user_id
            );
        }

        let bot = build_bot(&config.telegram)?;
        let outbound = Arc::new(TelegramOutbound::new(bot.clone()));
        let departments: Vec<_> = config
            .departments_for(ChannelType::Telegram)
            .into_iter()
            .cloned()
            .collect();

        let mut router = BridgeRouter::new(
            self.homeserver.clone(),
            bridge.clone(),
            outbound.clone(),
            self.store.clone(),
            self.store.clone(),
            departments.clone(),
        );
        if let Some(spaces) = &self.spaces {
            router = router.with_spaces(Arc::clone(spaces));
        }
        let relay = Arc::new(RelayService::new(
            bridge,
            outbound,
            self.store.clone(),
            self.store.clone(),
            &departments,
            config.matrix.ignored_senders.clone(),
            config.relay.clone(),
        )?);

        let relay_cancel = cancel.child_token();
        tokio::spawn(async move { relay.run(relay_cancel).await });

        let polling = start_polling(bot, Arc::new(router), config.telegram.poll_timeout_secs).await?;
        let cancel = cancel.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            polling.cancel();
        });
        info!(bridge = %account.user_id, "bot channel started");
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        deskbridge_common::DepartmentId,
        deskbridge_config::{AccountConfig, DepartmentConfig},
        secrecy::Secret,
    };

    fn account(user_id: &str) -> AccountConfig {
        AccountConfig {
            user_id: user_id.into(),
            access_token: Secret::new("t".into()),
        }
    }

    #[test]
    fn explicit_server_name_wins() {
        let mut config = DeskbridgeConfig::default();
        config.matrix.server_name = Some("example.org".into());
        config.matrix.bridge = Some(account("@bridge:other.org"));
        assert_eq!(resolve_server_name(&config).unwrap(), "example.org");
    }

    #[test]
    fn server_name_falls_back_to_department_accounts() {
        let mut config = DeskbridgeConfig::default();
        config.departments.push(DepartmentConfig {
            id: DepartmentId::new("support"),
            name: "Support".into(),
            icon: String::new(),
            description: String::new(),
            accounts: vec![account("@support:desk.example")],
            support_users: Vec::new(),
            channels: Vec::new(),
            power_levels: Default::default(),
        });
        assert_eq!(resolve_server_name(&config).unwrap(), "desk.example");
    }

    #[test]
    fn missing_server_name_is_an_error() {
        assert!(resolve_server_name(&DeskbridgeConfig::default()).is_err());
    }

    #[test]
    fn prune_cutoff_subtracts_retention() {
        assert_eq!(prune_cutoff(10 * DAY_MS, 7), 3 * DAY_MS);
        assert_eq!(prune_cutoff(DAY_MS, 7), 0);
    }

    #[tokio::test]
    async fn init_opens_configured_database() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DeskbridgeConfig::default();
        config.matrix.server_name = Some("localhost".into());
        config.store.database_path = Some(dir.path().join("state/deskbridge.db"));

        let services = GatewayServices::init(&config).await.unwrap();
        assert!(dir.path().join("state/deskbridge.db").exists());
        assert!(services.spaces.is_none(), "no account can own spaces");
        services.startup_maintenance(&config).await;
    }
}
