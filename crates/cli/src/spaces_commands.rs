use {
    anyhow::{Result, bail},
    clap::Subcommand,
    deskbridge_config::DeskbridgeConfig,
    deskbridge_gateway::services,
    deskbridge_sessions::SpaceStore,
};

#[derive(Subcommand)]
pub enum SpacesAction {
    /// Re-link rooms and spaces whose stored placement disagrees with the
    /// homeserver.
    Repair,
    /// List known spaces.
    List,
}

pub async fn handle_spaces(action: SpacesAction, config: &DeskbridgeConfig) -> Result<()> {
    let store = services::open_store(config).await?;
    match action {
        SpacesAction::Repair => {
            let homeserver = services::homeserver(config)?;
            let Some(spaces) = services::space_manager(config, &homeserver, &store) else {
                bail!("spaces are disabled or no account can own them");
            };
            let report = spaces.repair().await?;
            println!(
                "Checked {} space(s), re-linked {}.",
                report.spaces_checked, report.spaces_relinked
            );
            println!(
                "Checked {} room(s), re-linked {}.",
                report.rooms_checked, report.rooms_relinked
            );
            for room_id in &report.failed {
                eprintln!("  could not place {room_id}");
            }
            if !report.failed.is_empty() {
                bail!("{} room(s) could not be placed", report.failed.len());
            }
            Ok(())
        },
        SpacesAction::List => {
            let nodes = store.list_spaces().await?;
            if nodes.is_empty() {
                println!("No spaces yet.");
            }
            for node in nodes {
                println!("{:<12} {:<40} {}", node.kind.as_str(), node.key, node.space_id);
            }
            Ok(())
        },
    }
}
