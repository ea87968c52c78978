//! Canonical layout of the `.gatehouse/` coordination tree.
//!
//! Every component resolves its files through this module so the on-disk shape
//! stays in one place. The tree is the database; these are its table names.

use std::path::{Path, PathBuf};

use crate::core::error::GatehouseError;

pub const GATEHOUSE_DIR: &str = ".gatehouse";

pub fn gatehouse_root(project_root: &Path) -> PathBuf {
    project_root.join(GATEHOUSE_DIR)
}

pub fn config_path(project_root: &Path) -> PathBuf {
    gatehouse_root(project_root).join("config.toml")
}

pub fn tasks_dir(project_root: &Path) -> PathBuf {
    gatehouse_root(project_root).join("tasks")
}

pub fn qa_dir(project_root: &Path) -> PathBuf {
    gatehouse_root(project_root).join("qa")
}

pub fn sessions_dir(project_root: &Path) -> PathBuf {
    gatehouse_root(project_root).join("sessions")
}

pub fn evidence_dir(project_root: &Path) -> PathBuf {
    qa_dir(project_root).join("validation-evidence")
}

pub fn task_evidence_dir(project_root: &Path, task_id: &str) -> Result<PathBuf, GatehouseError> {
    validate_entity_id(task_id)?;
    Ok(evidence_dir(project_root).join(task_id))
}

pub fn snapshots_dir(project_root: &Path) -> PathBuf {
    qa_dir(project_root).join("evidence-snapshots")
}

pub fn locks_dir(project_root: &Path) -> PathBuf {
    gatehouse_root(project_root).join("locks")
}

pub fn logs_dir(project_root: &Path) -> PathBuf {
    gatehouse_root(project_root).join("logs")
}

pub fn transitions_log_path(project_root: &Path) -> PathBuf {
    logs_dir(project_root).join("state-transitions.jsonl")
}

pub fn audit_log_path(project_root: &Path) -> PathBuf {
    logs_dir(project_root).join("audit.events.jsonl")
}

/// Entity ids become file and directory names, so the character set is
/// restricted to `[A-Za-z0-9_-]`.
pub fn validate_entity_id(id: &str) -> Result<(), GatehouseError> {
    if id.is_empty() {
        return Err(GatehouseError::ValidationError(
            "entity id cannot be empty".to_string(),
        ));
    }
    if id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        Ok(())
    } else {
        Err(GatehouseError::ValidationError(format!(
            "invalid entity id '{}': allowed characters are [A-Za-z0-9_-]",
            id
        )))
    }
}

/// Walk upward from `start_dir` looking for a `.gatehouse` directory.
pub fn find_project_root(start_dir: &Path) -> Result<PathBuf, GatehouseError> {
    let mut current_dir = PathBuf::from(start_dir);
    loop {
        if current_dir.join(GATEHOUSE_DIR).exists() {
            return Ok(current_dir);
        }
        if !current_dir.pop() {
            return Err(GatehouseError::NotFound(
                "'.gatehouse' directory not found in current or parent directories. Run `gatehouse init` first.".to_string(),
            ));
        }
    }
}
