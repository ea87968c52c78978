use std::env;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatehouseError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    ConfigError(String),
    #[error("Path error: {0}")]
    PathError(String),
    #[error("Environment variable error: {0}")]
    EnvVarError(#[from] env::VarError),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid transition for {kind} '{entity_id}': '{from}' -> '{to}' is not declared")]
    InvalidTransition {
        kind: String,
        entity_id: String,
        from: String,
        to: String,
    },
    #[error("Guard denied {kind} transition to '{to}': {reason}")]
    GuardDenied {
        kind: String,
        to: String,
        reason: String,
    },
    #[error("Lock timeout for task '{task_id}' (purpose '{purpose}') after {elapsed_secs}s")]
    LockTimeout {
        task_id: String,
        purpose: String,
        elapsed_secs: u64,
    },
    #[error("Evidence integrity failure: {0}")]
    IntegrityError(String),
    #[error("Unknown preset '{0}'; declare it under [preset.{0}] in .gatehouse/config.toml")]
    UnknownPreset(String),
    #[error("Git error: {0}")]
    GitError(String),
}
