mod accounts_commands;
mod config_commands;
mod spaces_commands;
mod store_commands;

use std::path::{Path, PathBuf};

use {
    anyhow::Context,
    clap::{Parser, Subcommand},
    deskbridge_config::DeskbridgeConfig,
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(
    name = "deskbridge",
    version,
    about = "Deskbridge: customer support rooms for website and Telegram visitors"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (defaults to ./deskbridge.toml, then the user config dir).
    #[arg(long, global = true, env = "DESKBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Address to bind to (overrides config value).
    #[arg(long, global = true)]
    bind: Option<String>,

    /// Port to listen on (overrides config value).
    #[arg(long, global = true)]
    port: Option<u16>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the widget API, relay and bot transport (default).
    Serve,
    /// Space hierarchy maintenance.
    Spaces {
        #[command(subcommand)]
        action: spaces_commands::SpacesAction,
    },
    /// State store maintenance.
    Store {
        #[command(subcommand)]
        action: store_commands::StoreAction,
    },
    /// Backing account provisioning.
    Accounts {
        #[command(subcommand)]
        action: accounts_commands::AccountsAction,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

/// Load from `path`, or discover the config in the standard locations.
pub(crate) fn load_config(path: Option<&Path>) -> anyhow::Result<DeskbridgeConfig> {
    match path {
        Some(path) => deskbridge_config::load_config(path)
            .with_context(|| format!("failed to load {}", path.display())),
        None => Ok(deskbridge_config::discover_and_load()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    let config_path = cli.config.as_deref();
    match cli.command {
        None | Some(Commands::Serve) => {
            info!(version = env!("CARGO_PKG_VERSION"), "deskbridge starting");
            let mut config = load_config(config_path)?;
            if let Some(bind) = cli.bind {
                config.server.bind = bind;
            }
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            deskbridge_gateway::start_gateway(config).await
        },
        Some(Commands::Spaces { action }) => {
            spaces_commands::handle_spaces(action, &load_config(config_path)?).await
        },
        Some(Commands::Store { action }) => {
            store_commands::handle_store(action, &load_config(config_path)?).await
        },
        Some(Commands::Accounts { action }) => {
            accounts_commands::handle_accounts(action, &load_config(config_path)?).await
        },
        Some(Commands::Config { action }) => config_commands::handle_config(action, config_path),
    }
}
