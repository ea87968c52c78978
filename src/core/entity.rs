//! File-backed entities (tasks, QA records, sessions) with append-only state
//! history.
//!
//! One JSON file per entity. Writes go through temp-then-rename so a
//! concurrent reader never observes a half-written file; every state mutation
//! appends exactly one history record and one line to
//! `logs/state-transitions.jsonl`.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use ulid::Ulid;

use crate::core::error::GatehouseError;
use crate::core::paths;
use crate::core::time;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Task,
    Qa,
    Session,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Task => "task",
            EntityKind::Qa => "qa",
            EntityKind::Session => "session",
        }
    }

    pub fn dir(&self, project_root: &Path) -> PathBuf {
        match self {
            EntityKind::Task => paths::tasks_dir(project_root),
            EntityKind::Qa => paths::qa_dir(project_root).join("records"),
            EntityKind::Session => paths::sessions_dir(project_root),
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One appended record per state mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateRecord {
    pub from: String,
    pub to: String,
    pub ts: String,
    pub reason: String,
    pub actor: String,
    #[serde(default)]
    pub auto: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entity {
    pub id: String,
    pub kind: EntityKind,
    pub state: String,
    #[serde(default)]
    pub state_history: Vec<StateRecord>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl Entity {
    pub fn new(id: &str, kind: EntityKind, initial_state: &str) -> Self {
        Self {
            id: id.to_string(),
            kind,
            state: initial_state.to_string(),
            state_history: Vec::new(),
            metadata: serde_json::Map::new(),
            session_id: None,
        }
    }

    /// String-valued metadata accessor; non-string values read as absent.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    /// Epoch seconds of the most recent state mutation, if any.
    pub fn last_transition_epoch(&self) -> Option<i64> {
        self.state_history
            .last()
            .and_then(|r| time::parse_ts_epoch(&r.ts))
    }
}

/// Line appended to `logs/state-transitions.jsonl` for every mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionLogRecord {
    pub ts: String,
    pub event_id: String,
    pub kind: EntityKind,
    pub entity_id: String,
    pub from: String,
    pub to: String,
    pub reason: String,
    pub actor: String,
    #[serde(default)]
    pub auto: bool,
}

/// Atomic file write: temp file in the target directory, then rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), GatehouseError> {
    let dir = path.parent().ok_or_else(|| {
        GatehouseError::PathError(format!("no parent directory for {}", path.display()))
    })?;
    fs::create_dir_all(dir)?;
    let tmp = dir.join(format!(".tmp-{}", Ulid::new()));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Repository over the per-kind entity directories. Task, QA, and session
/// repositories are this store scoped to a kind.
#[derive(Debug, Clone)]
pub struct EntityStore {
    pub project_root: PathBuf,
}

impl EntityStore {
    pub fn new(project_root: &Path) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
        }
    }

    pub fn entity_path(&self, kind: EntityKind, id: &str) -> Result<PathBuf, GatehouseError> {
        paths::validate_entity_id(id)?;
        Ok(kind.dir(&self.project_root).join(format!("{}.json", id)))
    }

    pub fn exists(&self, kind: EntityKind, id: &str) -> Result<bool, GatehouseError> {
        Ok(self.entity_path(kind, id)?.exists())
    }

    pub fn get(&self, kind: EntityKind, id: &str) -> Result<Entity, GatehouseError> {
        let path = self.entity_path(kind, id)?;
        let content = fs::read_to_string(&path).map_err(|_| {
            GatehouseError::NotFound(format!("{} '{}' has no record at {}", kind, id, path.display()))
        })?;
        let entity: Entity = serde_json::from_str(&content)?;
        if entity.id != id {
            return Err(GatehouseError::ValidationError(format!(
                "entity file {} declares id '{}', expected '{}'",
                path.display(),
                entity.id,
                id
            )));
        }
        Ok(entity)
    }

    pub fn save(&self, entity: &Entity) -> Result<(), GatehouseError> {
        let path = self.entity_path(entity.kind, &entity.id)?;
        let bytes = serde_json::to_vec_pretty(entity)?;
        write_atomic(&path, &bytes)
    }

    pub fn list(&self, kind: EntityKind) -> Result<Vec<String>, GatehouseError> {
        let dir = kind.dir(&self.project_root);
        let mut ids = Vec::new();
        if !dir.exists() {
            return Ok(ids);
        }
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Append one record to the entity's history, persist it, and log the
    /// transition. The caller is responsible for having validated the
    /// transition first (see `state_machine::validate_transition`).
    pub fn record_transition(
        &self,
        entity: &mut Entity,
        to: &str,
        reason: &str,
        actor: &str,
        auto: bool,
    ) -> Result<(), GatehouseError> {
        let from = entity.state.clone();
        let ts = time::now_iso();
        entity.state_history.push(StateRecord {
            from: from.clone(),
            to: to.to_string(),
            ts: ts.clone(),
            reason: reason.to_string(),
            actor: actor.to_string(),
            auto,
        });
        entity.state = to.to_string();
        self.save(entity)?;

        let record = TransitionLogRecord {
            ts,
            event_id: time::new_event_id(),
            kind: entity.kind,
            entity_id: entity.id.clone(),
            from,
            to: to.to_string(),
            reason: reason.to_string(),
            actor: actor.to_string(),
            auto,
        };
        self.append_transition_log(&record)
    }

    fn append_transition_log(&self, record: &TransitionLogRecord) -> Result<(), GatehouseError> {
        let path = paths::transitions_log_path(&self.project_root);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut f = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(f, "{}", serde_json::to_string(record)?)?;
        Ok(())
    }
}
