//! Configuration validation engine.
//!
//! Checks TOML configuration files against the known schema, flags
//! misspelled fields, and reports semantic problems in the department and
//! relay setup before the service starts.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
};

use {
    regex::Regex,
    secrecy::ExposeSecret,
};

use crate::{env_subst::substitute_env, schema::DeskbridgeConfig};

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Category: "syntax", "unknown-field", "type-error", "departments",
    /// "matrix", "relay", "telegram"
    pub category: &'static str,
    /// Dotted path, e.g. "departments[0].accounts"
    pub path: String,
    pub message: String,
}

/// Result of validating a configuration file.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
    pub config_path: Option<PathBuf>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }
}

// ── Schema tree for unknown-field detection ─────────────────────────────────

enum KnownKeys {
    Struct(HashMap<&'static str, KnownKeys>),
    Map(Box<KnownKeys>),
    Array(Box<KnownKeys>),
    Leaf,
}

fn build_schema_map() -> KnownKeys {
    use KnownKeys::{Array, Leaf, Map, Struct};

    let account = || Struct(HashMap::from([("user_id", Leaf), ("access_token", Leaf)]));
    let space = || {
        Struct(HashMap::from([
            ("name", Leaf),
            ("topic", Leaf),
            ("alias", Leaf),
        ]))
    };

    Struct(HashMap::from([
        (
            "server",
            Struct(HashMap::from([("bind", Leaf), ("port", Leaf)])),
        ),
        (
            "matrix",
            Struct(HashMap::from([
                ("homeserver", Leaf),
                ("server_name", Leaf),
                ("registration_shared_secret", Leaf),
                ("bridge", account()),
                ("admin", account()),
                ("ignored_senders", Leaf),
                ("request_timeout_secs", Leaf),
            ])),
        ),
        (
            "departments",
            Array(Box::new(Struct(HashMap::from([
                ("id", Leaf),
                ("name", Leaf),
                ("icon", Leaf),
                ("description", Leaf),
                ("accounts", Array(Box::new(account()))),
                ("support_users", Leaf),
                ("channels", Leaf),
                ("power_levels", Map(Box::new(Leaf))),
            ])))),
        ),
        (
            "spaces",
            Struct(HashMap::from([
                ("enabled", Leaf),
                ("root", space()),
                ("channels", Map(Box::new(space()))),
                ("repair_on_startup", Leaf),
            ])),
        ),
        (
            "telegram",
            Struct(HashMap::from([
                ("enabled", Leaf),
                ("token", Leaf),
                ("poll_timeout_secs", Leaf),
            ])),
        ),
        (
            "relay",
            Struct(HashMap::from([
                ("poll_interval_secs", Leaf),
                ("registry_capacity", Leaf),
                ("registry_ttl_secs", Leaf),
                ("system_notice_patterns", Leaf),
                ("sync_timeout_ms", Leaf),
            ])),
        ),
        (
            "store",
            Struct(HashMap::from([
                ("database_path", Leaf),
                ("invalid_retention_days", Leaf),
            ])),
        ),
        (
            "widget",
            Struct(HashMap::from([
                ("history_limit", Leaf),
                ("rejoin_attempts", Leaf),
                ("rejoin_backoff_ms", Leaf),
                ("customer_localpart_prefix", Leaf),
            ])),
        ),
    ]))
}

// ── Levenshtein distance ────────────────────────────────────────────────────

fn levenshtein(a: &str, b: &str) -> usize {
    let b_len = b.chars().count();
    if a.is_empty() {
        return b_len;
    }
    if b.is_empty() {
        return a.chars().count();
    }

    let mut prev: Vec<usize> = (0..=b_len).collect();
    let mut curr = vec![0; b_len + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.chars().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b_len]
}

fn suggest<'a>(needle: &str, candidates: &[&'a str], max_distance: usize) -> Option<&'a str> {
    candidates
        .iter()
        .map(|c| (*c, levenshtein(needle, c)))
        .filter(|(_, d)| *d > 0 && *d <= max_distance)
        .min_by_key(|(_, d)| *d)
        .map(|(c, _)| c)
}

// ── Core validation ─────────────────────────────────────────────────────────

/// Validate a config file at the given path, or discover the default config
/// file location if `path` is `None`.
#[must_use]
pub fn validate(path: Option<&Path>) -> ValidationResult {
    let config_path = path
        .map(Path::to_path_buf)
        .or_else(crate::loader::find_config_file);

    let Some(actual_path) = config_path else {
        return ValidationResult {
            diagnostics: vec![Diagnostic {
                severity: Severity::Info,
                category: "syntax",
                path: String::new(),
                message: "no config file found; using defaults".into(),
            }],
            config_path: None,
        };
    };

    let is_toml = actual_path
        .extension()
        .and_then(|e| e.to_str())
        .is_none_or(|e| e == "toml");

    let mut result = if !is_toml {
        // Non-TOML formats only get the semantic pass.
        match crate::loader::load_config(&actual_path) {
            Ok(config) => {
                let mut diagnostics = Vec::new();
                check_semantics(&config, &mut diagnostics);
                ValidationResult {
                    diagnostics,
                    config_path: None,
                }
            },
            Err(e) => single_error("type-error", format!("failed to load config: {e}")),
        }
    } else {
        match std::fs::read_to_string(&actual_path) {
            Ok(content) => validate_toml_str(&substitute_env(&content)),
            Err(e) => single_error("syntax", format!("failed to read config file: {e}")),
        }
    };
    result.config_path = Some(actual_path);
    result
}

/// Validate a TOML string: syntax, unknown fields, types, then semantics.
#[must_use]
pub fn validate_toml_str(toml_str: &str) -> ValidationResult {
    let mut diagnostics = Vec::new();

    let toml_value: toml::Value = match toml::from_str(toml_str) {
        Ok(v) => v,
        Err(e) => return single_error("syntax", format!("TOML syntax error: {e}")),
    };

    check_unknown_fields(&toml_value, &build_schema_map(), "", &mut diagnostics);

    match toml::from_str::<DeskbridgeConfig>(toml_str) {
        Ok(config) => check_semantics(&config, &mut diagnostics),
        Err(e) => diagnostics.push(Diagnostic {
            severity: Severity::Error,
            category: "type-error",
            path: String::new(),
            message: format!("type error: {e}"),
        }),
    }

    ValidationResult {
        diagnostics,
        config_path: None,
    }
}

fn single_error(category: &'static str, message: String) -> ValidationResult {
    ValidationResult {
        diagnostics: vec![Diagnostic {
            severity: Severity::Error,
            category,
            path: String::new(),
            message,
        }],
        config_path: None,
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn check_unknown_fields(
    value: &toml::Value,
    schema: &KnownKeys,
    prefix: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match (value, schema) {
        (toml::Value::Table(table), KnownKeys::Struct(fields)) => {
            let known_keys: Vec<&str> = fields.keys().copied().collect();
            for (key, child_value) in table {
                let path = join_path(prefix, key);
                if let Some(child_schema) = fields.get(key.as_str()) {
                    check_unknown_fields(child_value, child_schema, &path, diagnostics);
                } else {
                    let message = match suggest(key, &known_keys, 3) {
                        Some(s) => format!("unknown field (did you mean \"{s}\"?)"),
                        None => "unknown field".to_string(),
                    };
                    diagnostics.push(Diagnostic {
                        severity: Severity::Error,
                        category: "unknown-field",
                        path,
                        message,
                    });
                }
            }
        },
        (toml::Value::Table(table), KnownKeys::Map(value_schema)) => {
            for (key, child_value) in table {
                check_unknown_fields(
                    child_value,
                    value_schema,
                    &join_path(prefix, key),
                    diagnostics,
                );
            }
        },
        (toml::Value::Array(arr), KnownKeys::Array(item_schema)) => {
            for (i, item) in arr.iter().enumerate() {
                check_unknown_fields(item, item_schema, &format!("{prefix}[{i}]"), diagnostics);
            }
        },
        _ => {},
    }
}

fn push(
    diagnostics: &mut Vec<Diagnostic>,
    severity: Severity,
    category: &'static str,
    path: impl Into<String>,
    message: impl Into<String>,
) {
    diagnostics.push(Diagnostic {
        severity,
        category,
        path: path.into(),
        message: message.into(),
    });
}

fn check_semantics(config: &DeskbridgeConfig, diagnostics: &mut Vec<Diagnostic>) {
    if config.matrix.homeserver.trim().is_empty() {
        push(
            diagnostics,
            Severity::Error,
            "matrix",
            "matrix.homeserver",
            "homeserver URL must not be empty",
        );
    }
    if config.matrix.bridge.is_none() {
        push(
            diagnostics,
            Severity::Warning,
            "matrix",
            "matrix.bridge",
            "no bridge account configured; the bot channel and relay are disabled",
        );
    }
    if config.matrix.registration_shared_secret.is_none() {
        push(
            diagnostics,
            Severity::Info,
            "matrix",
            "matrix.registration_shared_secret",
            "no shared secret; website customers must be provisioned externally",
        );
    }

    if config.departments.is_empty() {
        push(
            diagnostics,
            Severity::Error,
            "departments",
            "departments",
            "at least one department is required",
        );
    }

    let mut seen = HashSet::new();
    for (i, dept) in config.departments.iter().enumerate() {
        let path = format!("departments[{i}]");
        if dept.id.as_str().is_empty() {
            push(
                diagnostics,
                Severity::Error,
                "departments",
                format!("{path}.id"),
                "department id must not be empty",
            );
        } else if !dept
            .id
            .as_str()
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            push(
                diagnostics,
                Severity::Error,
                "departments",
                format!("{path}.id"),
                format!(
                    "department id \"{}\" may only contain ASCII letters, digits, '_' and '-'",
                    dept.id
                ),
            );
        }
        if !seen.insert(dept.id.as_str()) {
            push(
                diagnostics,
                Severity::Error,
                "departments",
                format!("{path}.id"),
                format!("duplicate department id \"{}\"", dept.id),
            );
        }
        if dept.accounts.is_empty() {
            push(
                diagnostics,
                Severity::Error,
                "departments",
                format!("{path}.accounts"),
                format!("department \"{}\" has no acting account", dept.id),
            );
        }
        for (j, account) in dept.accounts.iter().enumerate() {
            if account.access_token.expose_secret().is_empty() {
                push(
                    diagnostics,
                    Severity::Error,
                    "departments",
                    format!("{path}.accounts[{j}].access_token"),
                    "access token must not be empty",
                );
            }
            if !account.user_id.starts_with('@') || !account.user_id.contains(':') {
                push(
                    diagnostics,
                    Severity::Warning,
                    "departments",
                    format!("{path}.accounts[{j}].user_id"),
                    format!("\"{}\" does not look like a user id", account.user_id),
                );
            }
        }
    }

    if config.relay.poll_interval_secs == 0 {
        push(
            diagnostics,
            Severity::Error,
            "relay",
            "relay.poll_interval_secs",
            "poll interval must be at least one second",
        );
    }
    if config.relay.registry_capacity == 0 {
        push(
            diagnostics,
            Severity::Error,
            "relay",
            "relay.registry_capacity",
            "registry capacity must be positive",
        );
    }
    for (i, pattern) in config.relay.system_notice_patterns.iter().enumerate() {
        if let Err(e) = Regex::new(pattern) {
            push(
                diagnostics,
                Severity::Error,
                "relay",
                format!("relay.system_notice_patterns[{i}]"),
                format!("invalid regex: {e}"),
            );
        }
    }

    if config.telegram.enabled && config.telegram.token.expose_secret().is_empty() {
        push(
            diagnostics,
            Severity::Error,
            "telegram",
            "telegram.token",
            "telegram is enabled but no bot token is set",
        );
    }
    if config.telegram.enabled && config.matrix.bridge.is_none() {
        push(
            diagnostics,
            Severity::Error,
            "telegram",
            "matrix.bridge",
            "telegram requires a bridge account",
        );
    }
}
