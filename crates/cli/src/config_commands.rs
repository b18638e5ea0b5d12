use std::path::Path;

use {anyhow::Result, clap::Subcommand};

use deskbridge_config::{Diagnostic, Severity, validate};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Validate the configuration file and report errors/warnings.
    Check {
        /// Show informational diagnostics in addition to errors and warnings.
        #[arg(long)]
        verbose: bool,
    },
    /// Print the effective configuration with secrets redacted.
    Show,
}

pub fn handle_config(action: ConfigAction, path: Option<&Path>) -> Result<()> {
    match action {
        ConfigAction::Check { verbose } => check(path, verbose),
        ConfigAction::Show => show(path),
    }
}

const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

fn render(d: &Diagnostic) -> String {
    let (color, label) = match d.severity {
        Severity::Error => (RED, "error"),
        Severity::Warning => (YELLOW, "warning"),
        Severity::Info => (CYAN, "info"),
    };
    if d.path.is_empty() {
        format!("  {BOLD}{color}{label}{RESET} {}", d.message)
    } else {
        format!("  {BOLD}{color}{label}{RESET} {}: {}", d.path, d.message)
    }
}

fn check(path: Option<&Path>, verbose: bool) -> Result<()> {
    let result = validate(path);

    if let Some(ref path) = result.config_path {
        eprintln!("Checking {}\n", path.display());
    } else {
        eprintln!("No config file found; checking defaults.\n");
    }

    let mut shown = 0;
    for d in &result.diagnostics {
        if d.severity == Severity::Info && !verbose {
            continue;
        }
        eprintln!("{}", render(d));
        shown += 1;
    }

    let errors = result.count(Severity::Error);
    let warnings = result.count(Severity::Warning);
    if shown > 0 {
        eprintln!();
    }
    if errors == 0 && warnings == 0 {
        eprintln!("No issues found.");
    } else {
        eprintln!("{errors} error(s), {warnings} warning(s)");
    }

    if errors > 0 {
        std::process::exit(1);
    }
    Ok(())
}

const SECRET_KEYS: &[&str] = &["access_token", "token", "registration_shared_secret"];

fn show(path: Option<&Path>) -> Result<()> {
    let config = crate::load_config(path)?;
    let mut value = serde_json::to_value(&config)?;
    redact(&mut value);
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn redact(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                if SECRET_KEYS.contains(&key.as_str()) && v.is_string() {
                    *v = serde_json::Value::String("[REDACTED]".into());
                } else {
                    redact(v);
                }
            }
        },
        serde_json::Value::Array(items) => items.iter_mut().for_each(redact),
        _ => {},
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_path_when_present() {
        let d = Diagnostic {
            severity: Severity::Error,
            category: "departments",
            path: "departments[0].accounts".into(),
            message: "no accounts".into(),
        };
        let line = render(&d);
        assert!(line.contains("error"));
        assert!(line.contains("departments[0].accounts: no accounts"));
    }

    #[test]
    fn show_redacts_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deskbridge.toml");
        std::fs::write(
            &path,
            "[telegram]\nenabled = true\ntoken = \"123:secret-token\"\n",
        )
        .unwrap();
        let config = crate::load_config(Some(&path)).unwrap();
        let mut value = serde_json::to_value(&config).unwrap();
        redact(&mut value);
        assert_eq!(value["telegram"]["token"], "[REDACTED]");
        assert!(!value.to_string().contains("secret-token"));
    }
}
