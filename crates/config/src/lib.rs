//! Configuration loading, validation and env substitution.
//!
//! Config files: `synchro.toml`, `synchro.yaml`, or `synchro.json`
//! Searched in `./` then `~/.config/synchro/`.
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    loader::{config_dir, data_dir, discover_and_load, load_config},
    schema::{
        HandlerConfig, SchedulerConfig, ServerConfig, StorageBackend, StorageConfig, SynchroConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult},
};
