//! Configuration loading, validation and env substitution.
//!
//! Config files: `deskbridge.toml`, `deskbridge.yaml`, or `deskbridge.json`
//! Searched in `./` then `~/.config/deskbridge/`.
//!
//! Supports `${ENV_VAR}` and `${ENV_VAR:-fallback}` substitution in all
//! string values.

pub mod env_subst;
pub mod error;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    error::{Error, Result},
    loader::{config_dir, data_dir, discover_and_load, find_config_file, load_config},
    schema::{
        AccountConfig, DepartmentConfig, DeskbridgeConfig, MatrixConfig, RelayConfig,
        ServerConfig, SpaceConfig, SpacesConfig, StoreConfig, TelegramConfig, WidgetConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult, validate},
};
