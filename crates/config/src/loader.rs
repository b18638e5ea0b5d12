use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{
    env_subst::substitute_env,
    error::{Error, Result},
    schema::DeskbridgeConfig,
};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "deskbridge.toml",
    "deskbridge.yaml",
    "deskbridge.yml",
    "deskbridge.json",
];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> Result<DeskbridgeConfig> {
    let raw = std::fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.display().to_string(),
        source,
    })?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./deskbridge.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/deskbridge/deskbridge.{toml,yaml,yml,json}` (user-global)
///
/// Returns `DeskbridgeConfig::default()` if no config file is found or the
/// file fails to parse.
pub fn discover_and_load() -> DeskbridgeConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    DeskbridgeConfig::default()
}

/// Find the first config file in standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
        .or_else(|| {
            let dir = config_dir()?;
            CONFIG_FILENAMES
                .iter()
                .map(|name| dir.join(name))
                .find(|p| p.exists())
        })
}

/// Returns the user-global config directory (`~/.config/deskbridge/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "deskbridge").map(|d| d.config_dir().to_path_buf())
}

/// Returns the data directory holding the SQLite database.
pub fn data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "deskbridge")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

fn parse_config(raw: &str, path: &Path) -> Result<DeskbridgeConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        other => Err(Error::UnsupportedFormat {
            extension: other.to_string(),
        }),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, std::io::Write};

    #[test]
    fn loads_yaml_departments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deskbridge.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
departments:
  - id: sales
    name: Sales
    icon: "💰"
    accounts:
      - user_id: "@sales:localhost"
        access_token: "abc"
    support_users: ["@support:localhost"]
relay:
  poll_interval_secs: 2
"#
        )
        .unwrap();

        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.departments.len(), 1);
        assert_eq!(cfg.departments[0].identities().len(), 2);
        assert_eq!(cfg.relay.poll_interval_secs, 2);
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deskbridge.ini");
        std::fs::write(&path, "x=1").unwrap();
        assert!(matches!(
            load_config(&path),
            Err(Error::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_config(Path::new("/nonexistent/deskbridge.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/deskbridge.toml"));
    }
}
