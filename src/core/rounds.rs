//! Evidence round store.
//!
//! Each task owns a sequence of `round-N` directories under
//! `qa/validation-evidence/<taskId>/`. The `metadata.json` pointer record is
//! the single source of truth for the current round and the highest number
//! ever allocated; directory scanning happens once, to bootstrap trees that
//! predate the pointer, and never again afterward. Round numbers are
//! monotonic — deleting a directory does not free its number.
//!
//! Callers must hold the task's advisory lock (`core::lock`) around
//! `ensure_round` and any approval writes; reads are lock-free.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::entity::write_atomic;
use crate::core::error::GatehouseError;
use crate::core::paths;

pub const REPORT_FILE: &str = "implementation-report.md";
pub const BUNDLE_FILE: &str = "bundle-approved.json";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RoundMetadata {
    /// Explicit current-round override; wins over any directory scan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_round: Option<u32>,
    /// Highest round number ever allocated for this task.
    #[serde(default)]
    pub highest_allocated: u32,
}

#[derive(Debug, Clone)]
pub struct RoundStore {
    pub project_root: PathBuf,
}

impl RoundStore {
    pub fn new(project_root: &Path) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
        }
    }

    pub fn task_dir(&self, task_id: &str) -> Result<PathBuf, GatehouseError> {
        paths::task_evidence_dir(&self.project_root, task_id)
    }

    pub fn round_dir(&self, task_id: &str, round: u32) -> Result<PathBuf, GatehouseError> {
        Ok(self.task_dir(task_id)?.join(format!("round-{}", round)))
    }

    fn metadata_path(&self, task_id: &str) -> Result<PathBuf, GatehouseError> {
        Ok(self.task_dir(task_id)?.join("metadata.json"))
    }

    fn load_metadata(&self, task_id: &str) -> Result<RoundMetadata, GatehouseError> {
        let path = self.metadata_path(task_id)?;
        if !path.exists() {
            return Ok(RoundMetadata::default());
        }
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn save_metadata(&self, task_id: &str, meta: &RoundMetadata) -> Result<(), GatehouseError> {
        let path = self.metadata_path(task_id)?;
        write_atomic(&path, &serde_json::to_vec_pretty(meta)?)
    }

    /// Numerically highest `round-N` directory on disk, if any.
    fn scan_highest(&self, task_id: &str) -> Result<Option<u32>, GatehouseError> {
        let dir = self.task_dir(task_id)?;
        if !dir.exists() {
            return Ok(None);
        }
        let mut highest = None;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(num) = name.strip_prefix("round-") {
                if let Ok(n) = num.parse::<u32>() {
                    highest = Some(highest.map_or(n, |h: u32| h.max(n)));
                }
            }
        }
        Ok(highest)
    }

    /// Allocate the next round number and create its directory. Numbers are
    /// never reused, even when earlier directories have been deleted. Must be
    /// called inside the task lock.
    pub fn ensure_round(&self, task_id: &str) -> Result<(u32, PathBuf), GatehouseError> {
        let mut meta = self.load_metadata(task_id)?;
        // Bootstrap for trees that predate metadata.json.
        if meta.highest_allocated == 0 {
            if let Some(scanned) = self.scan_highest(task_id)? {
                meta.highest_allocated = scanned;
            }
        }

        let next = meta.highest_allocated + 1;
        let dir = self.round_dir(task_id, next)?;
        fs::create_dir_all(&dir)?;
        meta.highest_allocated = next;
        meta.current_round = Some(next);
        self.save_metadata(task_id, &meta)?;
        Ok((next, dir))
    }

    /// The current round: the `metadata.json` pointer when present, otherwise
    /// the highest existing directory. `None` when the task has no rounds.
    pub fn current_round(&self, task_id: &str) -> Result<Option<u32>, GatehouseError> {
        let meta = self.load_metadata(task_id)?;
        if let Some(current) = meta.current_round {
            return Ok(Some(current));
        }
        self.scan_highest(task_id)
    }

    /// Point `currentRound` at an existing round.
    pub fn set_current_round(&self, task_id: &str, round: u32) -> Result<(), GatehouseError> {
        if !self.round_dir(task_id, round)?.exists() {
            return Err(GatehouseError::NotFound(format!(
                "task '{}' has no round-{} directory",
                task_id, round
            )));
        }
        let mut meta = self.load_metadata(task_id)?;
        if round > meta.highest_allocated {
            meta.highest_allocated = round;
        }
        meta.current_round = Some(round);
        self.save_metadata(task_id, &meta)
    }

    pub fn write_report(
        &self,
        task_id: &str,
        round: u32,
        content: &str,
    ) -> Result<(), GatehouseError> {
        let dir = self.round_dir(task_id, round)?;
        if !dir.exists() {
            return Err(GatehouseError::NotFound(format!(
                "task '{}' has no round-{} directory",
                task_id, round
            )));
        }
        write_atomic(&dir.join(REPORT_FILE), content.as_bytes())
    }

    /// The implementation report, `None` when absent or effectively empty.
    pub fn read_report(&self, task_id: &str, round: u32) -> Result<Option<String>, GatehouseError> {
        let path = self.round_dir(task_id, round)?.join(REPORT_FILE);
        match fs::read_to_string(&path) {
            Ok(content) if !content.trim().is_empty() => Ok(Some(content)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(GatehouseError::IoError(e)),
        }
    }

    pub fn context7_marker_path(
        &self,
        task_id: &str,
        round: u32,
        package: &str,
    ) -> Result<PathBuf, GatehouseError> {
        Ok(self
            .round_dir(task_id, round)?
            .join(format!("context7-{}.txt", package)))
    }

    /// A marker is valid when it exists and is non-empty.
    pub fn context7_marker_valid(
        &self,
        task_id: &str,
        round: u32,
        package: &str,
    ) -> Result<bool, GatehouseError> {
        let path = self.context7_marker_path(task_id, round, package)?;
        match fs::read_to_string(&path) {
            Ok(content) => Ok(!content.trim().is_empty()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(GatehouseError::IoError(e)),
        }
    }

    /// File names present in a round directory (empty when the directory is
    /// gone — a defined outcome, not an error).
    pub fn round_files(&self, task_id: &str, round: u32) -> Result<Vec<String>, GatehouseError> {
        let dir = self.round_dir(task_id, round)?;
        let mut names = Vec::new();
        if !dir.exists() {
            return Ok(names);
        }
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}
