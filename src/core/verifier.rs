//! Tamper-evidence reconciliation between tracked state files and the audit
//! log.
//!
//! The audit log is append-only and fail-open, so it cannot *prevent* an
//! out-of-band edit to a task record or an evidence file. What it can do is
//! make such an edit visible afterwards: any tracked file whose mtime is
//! newer than the last audit event attributable to its entity was modified
//! by something that did not log. Detection is a pure read; running it twice
//! yields the same report and writes nothing.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::core::audit;
use crate::core::entity::{EntityKind, EntityStore};
use crate::core::error::GatehouseError;
use crate::core::paths;
use crate::core::time;

/// Clock skew allowance between an audit `ts` and the filesystem mtime of
/// the write it describes.
pub const MTIME_TOLERANCE_SECS: i64 = 1;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UnloggedChange {
    pub entity_type: String,
    pub entity_id: String,
    pub file_path: String,
    pub reason: String,
    /// File mtime, RFC-3339 UTC.
    pub last_modified: String,
    /// Latest attributable audit event, RFC-3339 UTC. Absent when the audit
    /// log has no event for this entity at all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_audit_event: Option<String>,
    /// SHA-256 of the file content as found, for later comparison.
    pub current_hash: String,
}

/// Scan tracked files for the given tasks (all tasks when `task_ids` is
/// empty) and report every file modified after its entity's last audit
/// event. When `session_id` is given, events from that session's sink are
/// merged in so session-scoped logging still counts as logged.
pub fn detect_unlogged(
    project_root: &Path,
    session_id: Option<&str>,
    task_ids: &[String],
) -> Result<Vec<UnloggedChange>, GatehouseError> {
    let last_event = last_event_per_entity(project_root, session_id)?;

    let store = EntityStore::new(project_root);
    let tasks: Vec<String> = if task_ids.is_empty() {
        store.list(EntityKind::Task)?
    } else {
        task_ids.to_vec()
    };

    let mut findings = Vec::new();
    for task_id in &tasks {
        let mut tracked: Vec<(String, PathBuf)> = vec![
            ("task".to_string(), store.entity_path(EntityKind::Task, task_id)?),
            ("qa".to_string(), store.entity_path(EntityKind::Qa, task_id)?),
        ];
        let evidence_root = paths::task_evidence_dir(project_root, task_id)?;
        collect_evidence_files(&evidence_root, &mut tracked)?;

        for (entity_type, path) in tracked {
            if let Some(finding) =
                check_file(task_id, &entity_type, &path, last_event.get(task_id).copied())?
            {
                findings.push(finding);
            }
        }
    }

    findings.sort_by(|a, b| a.file_path.cmp(&b.file_path));
    Ok(findings)
}

/// Latest audit event timestamp per entity id, across the project sink and
/// optionally a session sink. An event is attributed to an entity through
/// its `taskId`, `entityId`, or `qaId` field.
fn last_event_per_entity(
    project_root: &Path,
    session_id: Option<&str>,
) -> Result<BTreeMap<String, i64>, GatehouseError> {
    let mut sinks = vec![paths::audit_log_path(project_root)];
    if let Some(sid) = session_id {
        sinks.push(
            paths::logs_dir(project_root)
                .join("sessions")
                .join(format!("{}.audit.jsonl", sid)),
        );
    }

    let mut latest: BTreeMap<String, i64> = BTreeMap::new();
    for sink in sinks {
        for record in audit::read_events(&sink) {
            let Some(ts) = record
                .get("ts")
                .and_then(|v| v.as_str())
                .and_then(time::parse_ts_epoch)
            else {
                continue;
            };
            for key in ["taskId", "entityId", "qaId"] {
                if let Some(id) = record.get(key).and_then(|v| v.as_str()) {
                    let entry = latest.entry(id.to_string()).or_insert(ts);
                    if ts > *entry {
                        *entry = ts;
                    }
                }
            }
        }
    }
    Ok(latest)
}

fn collect_evidence_files(
    dir: &Path,
    out: &mut Vec<(String, PathBuf)>,
) -> Result<(), GatehouseError> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_evidence_files(&path, out)?;
        } else {
            out.push(("evidence".to_string(), path));
        }
    }
    Ok(())
}

fn check_file(
    entity_id: &str,
    entity_type: &str,
    path: &Path,
    last_event_epoch: Option<i64>,
) -> Result<Option<UnloggedChange>, GatehouseError> {
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(GatehouseError::IoError(e)),
    };
    let mtime = metadata
        .modified()?
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    let flagged = match last_event_epoch {
        Some(last) => mtime > last + MTIME_TOLERANCE_SECS,
        None => true,
    };
    if !flagged {
        return Ok(None);
    }

    let content = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&content);
    let current_hash = format!("{:x}", hasher.finalize());

    let reason = match last_event_epoch {
        Some(_) => "File modified after last audit event".to_string(),
        None => "No audit events recorded for entity".to_string(),
    };

    Ok(Some(UnloggedChange {
        entity_type: entity_type.to_string(),
        entity_id: entity_id.to_string(),
        file_path: path.to_string_lossy().to_string(),
        reason,
        last_modified: time::epoch_to_iso(mtime),
        last_audit_event: last_event_epoch.map(time::epoch_to_iso),
        current_hash,
    }))
}
