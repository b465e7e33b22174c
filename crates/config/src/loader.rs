use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::SynchroConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "synchro.toml",
    "synchro.yaml",
    "synchro.yml",
    "synchro.json",
];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<SynchroConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./synchro.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/synchro/synchro.{toml,yaml,yml,json}` (user-global)
///
/// Returns `SynchroConfig::default()` if no config file is found or the file
/// does not parse.
pub fn discover_and_load() -> SynchroConfig {
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
    SynchroConfig::default()
}

/// Find the first config file in standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    let config_dir = config_dir()?;
    CONFIG_FILENAMES
        .iter()
        .map(|name| config_dir.join(name))
        .find(|p| p.exists())
}

/// Returns the user-global config directory (`~/.config/synchro/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "synchro").map(|d| d.config_dir().to_path_buf())
}

/// Returns the user data directory, falling back to `./.synchro`.
pub fn data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "synchro")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".synchro"))
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<SynchroConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::schema::StorageBackend};

    #[test]
    fn loads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("synchro.toml");
        std::fs::write(&path, "[server]\nport = 9000\n").unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.server.port, 9000);
    }

    #[test]
    fn loads_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("synchro.yaml");
        std::fs::write(&path, "storage:\n  backend: memory\n").unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.storage.backend, StorageBackend::Memory);
    }

    #[test]
    fn loads_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("synchro.json");
        std::fs::write(&path, r#"{"scheduler":{"history_limit":5}}"#).unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.scheduler.history_limit, 5);
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("synchro.ini");
        std::fs::write(&path, "port=1").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_config(Path::new("/nonexistent/synchro.toml")).is_err());
    }
}
