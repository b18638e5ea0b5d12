use {
    anyhow::Result,
    clap::Subcommand,
    deskbridge_common::now_ms,
    deskbridge_config::DeskbridgeConfig,
    deskbridge_gateway::services,
    deskbridge_sessions::{ChatMappingStore, RoomStore},
};

#[derive(Subcommand)]
pub enum StoreAction {
    /// Delete invalid room records older than the retention period.
    Prune {
        /// Retention in days (overrides `store.invalid_retention_days`).
        #[arg(long)]
        days: Option<u64>,
    },
    /// List bot conversations and their current rooms.
    Mappings,
    /// Print the database location.
    Path,
}

pub async fn handle_store(action: StoreAction, config: &DeskbridgeConfig) -> Result<()> {
    match action {
        StoreAction::Prune { days } => {
            let store = services::open_store(config).await?;
            let days = days.unwrap_or(config.store.invalid_retention_days);
            let pruned = store
                .prune_invalid(services::prune_cutoff(now_ms(), days))
                .await?;
            println!("Pruned {pruned} invalid room record(s) older than {days} day(s).");
            Ok(())
        },
        StoreAction::Mappings => {
            let store = services::open_store(config).await?;
            let mappings = store.list_mappings().await?;
            if mappings.is_empty() {
                println!("No bot conversations yet.");
            }
            for m in mappings {
                println!(
                    "{:<10} {:<16} {:<12} {}",
                    m.channel.as_str(),
                    m.external_conversation_id,
                    m.department_id.as_str(),
                    m.room_id
                );
            }
            Ok(())
        },
        StoreAction::Path => {
            println!("{}", services::database_path(config).display());
            Ok(())
        },
    }
}
