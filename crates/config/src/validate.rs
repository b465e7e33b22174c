//! Configuration validation.
//!
//! Flags unknown (likely misspelled) keys, type errors, and values the
//! scheduler cannot run with.

use std::{collections::HashSet, path::Path};

use crate::schema::{StorageBackend, SynchroConfig};

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
    /// "syntax", "unknown-field", "type-error", "value", "handler"
    pub category: &'static str,
    /// Dotted path, e.g. "scheduler.poll_interval_secs"
    pub path: String,
    pub message: String,
}

impl Diagnostic {
    fn new(
        severity: Severity,
        category: &'static str,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category,
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result of validating a configuration.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
    pub config_path: Option<std::path::PathBuf>,
}

impl ValidationResult {
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }
}

const TOP_LEVEL_KEYS: &[&str] = &["server", "scheduler", "storage", "handlers"];
const SERVER_KEYS: &[&str] = &["bind", "port"];
const SCHEDULER_KEYS: &[&str] = &[
    "poll_interval_secs",
    "reaper_interval_secs",
    "stale_threshold_secs",
    "default_timeout_secs",
    "retry_base_delay_ms",
    "retry_max_delay_ms",
    "history_limit",
    "default_timezone",
];
const STORAGE_KEYS: &[&str] = &["backend", "path", "database_url"];
const HANDLER_KEYS: &[&str] = &[
    "name",
    "description",
    "command",
    "args",
    "env",
    "working_dir",
];

/// Validate the config file at `path`, or the discovered one when `None`.
#[must_use]
pub fn validate(path: Option<&Path>) -> ValidationResult {
    let config_path = match path {
        Some(p) => Some(p.to_path_buf()),
        None => crate::loader::find_config_file(),
    };

    let Some(actual_path) = config_path else {
        return ValidationResult {
            diagnostics: vec![Diagnostic::new(
                Severity::Info,
                "file-ref",
                "",
                "no config file found; using defaults",
            )],
            config_path: None,
        };
    };

    let is_toml = actual_path
        .extension()
        .and_then(|e| e.to_str())
        .is_none_or(|e| e == "toml");

    let mut result = if is_toml {
        match std::fs::read_to_string(&actual_path) {
            Ok(content) => validate_toml_str(&crate::env_subst::substitute_env(&content)),
            Err(e) => ValidationResult {
                diagnostics: vec![Diagnostic::new(
                    Severity::Error,
                    "syntax",
                    "",
                    format!("failed to read config file: {e}"),
                )],
                config_path: None,
            },
        }
    } else {
        match crate::loader::load_config(&actual_path) {
            Ok(config) => validate_config(&config),
            Err(e) => ValidationResult {
                diagnostics: vec![Diagnostic::new(Severity::Error, "type-error", "", e.to_string())],
                config_path: None,
            },
        }
    };
    result.config_path = Some(actual_path);
    result
}

/// Validate a TOML document without touching the file system.
#[must_use]
pub fn validate_toml_str(toml_str: &str) -> ValidationResult {
    let mut diagnostics = Vec::new();

    let value: toml::Value = match toml::from_str(toml_str) {
        Ok(v) => v,
        Err(e) => {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "syntax",
                "",
                format!("TOML syntax error: {e}"),
            ));
            return ValidationResult {
                diagnostics,
                config_path: None,
            };
        },
    };

    check_unknown_fields(&value, &mut diagnostics);

    match toml::from_str::<SynchroConfig>(toml_str) {
        Ok(config) => check_values(&config, &mut diagnostics),
        Err(e) => diagnostics.push(Diagnostic::new(
            Severity::Error,
            "type-error",
            "",
            format!("type error: {e}"),
        )),
    }

    ValidationResult {
        diagnostics,
        config_path: None,
    }
}

/// Validate an already parsed configuration.
#[must_use]
pub fn validate_config(config: &SynchroConfig) -> ValidationResult {
    let mut diagnostics = Vec::new();
    check_values(config, &mut diagnostics);
    ValidationResult {
        diagnostics,
        config_path: None,
    }
}

fn check_unknown_fields(value: &toml::Value, diagnostics: &mut Vec<Diagnostic>) {
    let Some(root) = value.as_table() else {
        return;
    };
    check_table_keys(root, TOP_LEVEL_KEYS, "", diagnostics);

    for (section, known) in [
        ("server", SERVER_KEYS),
        ("scheduler", SCHEDULER_KEYS),
        ("storage", STORAGE_KEYS),
    ] {
        if let Some(table) = root.get(section).and_then(|v| v.as_table()) {
            check_table_keys(table, known, section, diagnostics);
        }
    }

    if let Some(handlers) = root.get("handlers").and_then(|v| v.as_array()) {
        for (i, handler) in handlers.iter().enumerate() {
            if let Some(table) = handler.as_table() {
                check_table_keys(table, HANDLER_KEYS, &format!("handlers[{i}]"), diagnostics);
            }
        }
    }
}

fn check_table_keys(
    table: &toml::map::Map<String, toml::Value>,
    known: &[&str],
    prefix: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    for key in table.keys() {
        if known.contains(&key.as_str()) {
            continue;
        }
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        let message = match suggest(key, known, 3) {
            Some(hint) => format!("unknown field \"{key}\" (did you mean \"{hint}\"?)"),
            None => format!("unknown field \"{key}\""),
        };
        diagnostics.push(Diagnostic::new(
            Severity::Warning,
            "unknown-field",
            path,
            message,
        ));
    }
}

fn check_values(config: &SynchroConfig, diagnostics: &mut Vec<Diagnostic>) {
    if config.server.port == 0 {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "value",
            "server.port",
            "port must be > 0",
        ));
    }

    let sched = &config.scheduler;
    for (path, value) in [
        ("scheduler.poll_interval_secs", sched.poll_interval_secs),
        ("scheduler.reaper_interval_secs", sched.reaper_interval_secs),
        ("scheduler.stale_threshold_secs", sched.stale_threshold_secs),
        ("scheduler.default_timeout_secs", sched.default_timeout_secs),
    ] {
        if value == 0 {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "value",
                path,
                "must be > 0",
            ));
        }
    }
    if sched.history_limit == 0 {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "value",
            "scheduler.history_limit",
            "must keep at least one run record",
        ));
    }
    if sched.retry_base_delay_ms > sched.retry_max_delay_ms {
        diagnostics.push(Diagnostic::new(
            Severity::Warning,
            "value",
            "scheduler.retry_base_delay_ms",
            "base retry delay exceeds retry_max_delay_ms; every retry waits the maximum",
        ));
    }
    if sched.stale_threshold_secs < sched.default_timeout_secs {
        diagnostics.push(Diagnostic::new(
            Severity::Warning,
            "value",
            "scheduler.stale_threshold_secs",
            "stale threshold is shorter than the default run timeout; live runs may be reaped",
        ));
    }
    if sched.default_timezone.parse::<chrono_tz::Tz>().is_err() {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "value",
            "scheduler.default_timezone",
            format!("unknown timezone: {}", sched.default_timezone),
        ));
    }

    if config.storage.backend == StorageBackend::File && config.storage.path.is_none() {
        diagnostics.push(Diagnostic::new(
            Severity::Info,
            "value",
            "storage.path",
            "no path set; the file store will use the user data directory",
        ));
    }

    let mut seen = HashSet::new();
    for (i, handler) in config.handlers.iter().enumerate() {
        let path = format!("handlers[{i}]");
        if handler.name.trim().is_empty() {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "handler",
                format!("{path}.name"),
                "handler name is empty",
            ));
        } else if !seen.insert(handler.name.as_str()) {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "handler",
                format!("{path}.name"),
                format!("duplicate handler name \"{}\"", handler.name),
            ));
        }
        if handler.command.trim().is_empty() {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "handler",
                format!("{path}.command"),
                "handler command is empty",
            ));
        }
    }
}

// ── Levenshtein distance ────────────────────────────────────────────────────

fn levenshtein(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0; b_chars.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b_chars.len()]
}

fn suggest<'a>(needle: &str, candidates: &[&'a str], max_distance: usize) -> Option<&'a str> {
    candidates
        .iter()
        .map(|c| (*c, levenshtein(needle, c)))
        .filter(|(_, d)| *d > 0 && *d <= max_distance)
        .min_by_key(|(_, d)| *d)
        .map(|(c, _)| c)
}
