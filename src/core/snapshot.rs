//! Fingerprint-keyed command evidence snapshots.
//!
//! Command evidence is a property of repository state, not of a round: the
//! snapshot store maps a fingerprint's key to a directory under
//! `qa/evidence-snapshots/` and persists `command-<name>.txt` files there. A
//! round's evidence check reads from the snapshot matching the *current*
//! fingerprint, which is how evidence captured against an earlier code state
//! becomes detectable as stale.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::error::GatehouseError;
use crate::core::evidence::CommandEvidence;
use crate::core::fingerprint::Fingerprint;
use crate::core::paths;
use crate::core::policy::{glob_match, StalePolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileState {
    /// No file at the expected snapshot path.
    Missing,
    /// Present but unparseable.
    Invalid,
    /// Parses, but the recorded exit code is non-zero.
    Failed,
    Passed,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileCheck {
    pub name: String,
    pub state: FileState,
    /// Staleness is an independent axis: a passed file can still be stale.
    pub stale: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotStatus {
    pub present: Vec<String>,
    pub missing: Vec<String>,
    pub invalid: Vec<String>,
    pub failed: Vec<String>,
    pub stale: Vec<String>,
    /// Every required file is present.
    pub complete: bool,
    /// Every required file parses with exit code 0.
    pub passed: bool,
    /// No required file is unparseable.
    pub valid: bool,
    /// The overall verdict under the supplied stale policy.
    pub success: bool,
    pub checks: Vec<FileCheck>,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    pub project_root: PathBuf,
}

impl SnapshotStore {
    pub fn new(project_root: &Path) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
        }
    }

    pub fn dir_for(&self, fingerprint: &Fingerprint) -> PathBuf {
        paths::snapshots_dir(&self.project_root).join(fingerprint.snapshot_key())
    }

    pub fn evidence_path(&self, fingerprint: &Fingerprint, name: &str) -> PathBuf {
        self.dir_for(fingerprint).join(format!("command-{}.txt", name))
    }

    /// Persist evidence under the fingerprint it was captured against,
    /// signing when a key is supplied. Overwriting is an explicit re-capture.
    pub fn store(
        &self,
        fingerprint: &Fingerprint,
        name: &str,
        ev: &CommandEvidence,
        key: Option<&[u8]>,
    ) -> Result<PathBuf, GatehouseError> {
        let path = self.evidence_path(fingerprint, name);
        ev.write(&path, key)?;
        Ok(path)
    }

    /// Classify each required evidence file against the current fingerprint.
    ///
    /// `required` entries are the bare command names, full file names, or
    /// glob patterns; the `command-` prefix and `.txt` suffix are normalized
    /// either way. A pattern is resolved against the snapshot directory
    /// listing, so `command-*.txt` is satisfied by any captured command
    /// evidence for this fingerprint. A pattern with no match is Missing
    /// under the pattern's own name.
    pub fn status(
        &self,
        required: &[String],
        current: &Fingerprint,
        stale_policy: StalePolicy,
    ) -> Result<SnapshotStatus, GatehouseError> {
        let dir = self.dir_for(current);
        let listing = snapshot_listing(&dir);
        let mut checks = Vec::new();

        for requirement in required {
            let pattern = normalize_evidence_name(requirement);
            let matched: Vec<&String> =
                listing.iter().filter(|f| glob_match(&pattern, f)).collect();

            if matched.is_empty() {
                checks.push(FileCheck {
                    name: pattern.clone(),
                    state: FileState::Missing,
                    stale: false,
                    reason: Some(format!(
                        "no evidence matching '{}' under {}; run the command and re-capture",
                        pattern,
                        dir.display()
                    )),
                    exit_code: None,
                });
                continue;
            }

            for file_name in matched {
                let path = dir.join(file_name);
                let check = match CommandEvidence::load(&path) {
                    Err(e) => FileCheck {
                        name: file_name.clone(),
                        state: FileState::Invalid,
                        stale: false,
                        reason: Some(e.to_string()),
                        exit_code: None,
                    },
                    Ok(ev) => {
                        let stale = ev.fingerprint() != *current;
                        FileCheck {
                            name: file_name.clone(),
                            state: if ev.passed() {
                                FileState::Passed
                            } else {
                                FileState::Failed
                            },
                            stale,
                            reason: stale.then(|| "mismatch".to_string()),
                            exit_code: Some(ev.exit_code),
                        }
                    }
                };
                checks.push(check);
            }
        }

        let bucket = |state: FileState| {
            checks
                .iter()
                .filter(|c| c.state == state)
                .map(|c| c.name.clone())
                .collect::<Vec<_>>()
        };
        let missing = bucket(FileState::Missing);
        let invalid = bucket(FileState::Invalid);
        let failed = bucket(FileState::Failed);
        let present: Vec<String> = checks
            .iter()
            .filter(|c| c.state != FileState::Missing)
            .map(|c| c.name.clone())
            .collect();
        let stale: Vec<String> = checks
            .iter()
            .filter(|c| c.stale)
            .map(|c| c.name.clone())
            .collect();

        let complete = missing.is_empty();
        let valid = invalid.is_empty();
        let passed = complete && valid && failed.is_empty();
        let stale_blocks = stale_policy == StalePolicy::Block && !stale.is_empty();
        let success = passed && !stale_blocks;

        Ok(SnapshotStatus {
            present,
            missing,
            invalid,
            failed,
            stale,
            complete,
            passed,
            valid,
            success,
            checks,
        })
    }
}

fn snapshot_listing(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    names.sort();
    names
}

fn normalize_evidence_name(requirement: &str) -> String {
    let mut name = requirement.to_string();
    if !name.starts_with("command-") {
        name = format!("command-{}", name);
    }
    if !name.ends_with(".txt") {
        name.push_str(".txt");
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(fp: &Fingerprint, exit_code: i32) -> CommandEvidence {
        CommandEvidence {
            runner: "cargo".to_string(),
            command: "cargo test".to_string(),
            cwd: "/repo".to_string(),
            exit_code,
            started_at: "1735689600Z".to_string(),
            completed_at: "1735689610Z".to_string(),
            pipefail: false,
            git_head: fp.git_head.clone(),
            diff_hash: fp.diff_hash.clone(),
            dirty: fp.dirty,
            hmac: None,
        }
    }

    fn fp(head: &str) -> Fingerprint {
        Fingerprint {
            git_head: head.to_string(),
            diff_hash: "d0".to_string(),
            dirty: false,
        }
    }

    #[test]
    fn test_missing_classification() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(tmp.path());
        let current = fp("abc123");
        let status = store
            .status(&["test".to_string()], &current, StalePolicy::Warn)
            .unwrap();
        assert_eq!(status.missing, vec!["command-test.txt"]);
        assert!(!status.complete);
        assert!(!status.success);
    }

    #[test]
    fn test_passed_and_failed_classification() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(tmp.path());
        let current = fp("abc123");
        store.store(&current, "test", &sample(&current, 0), None).unwrap();
        store.store(&current, "lint", &sample(&current, 1), None).unwrap();

        let status = store
            .status(
                &["test".to_string(), "lint".to_string()],
                &current,
                StalePolicy::Warn,
            )
            .unwrap();
        assert_eq!(status.failed, vec!["command-lint.txt"]);
        assert!(status.complete);
        assert!(!status.passed);
        assert!(!status.success);
    }

    #[test]
    fn test_glob_requirement_resolves_against_captured_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(tmp.path());
        let current = fp("abc123");
        store.store(&current, "test", &sample(&current, 0), None).unwrap();

        let status = store
            .status(&["command-*.txt".to_string()], &current, StalePolicy::Warn)
            .unwrap();
        assert_eq!(status.present, vec!["command-test.txt"]);
        assert!(status.success);

        // A second capture folds into the same pattern; one failure fails it.
        store.store(&current, "lint", &sample(&current, 1), None).unwrap();
        let status = store
            .status(&["command-*.txt".to_string()], &current, StalePolicy::Warn)
            .unwrap();
        assert_eq!(status.failed, vec!["command-lint.txt"]);
        assert!(!status.success);

        // An unmatched pattern is Missing under its own name.
        let status = store
            .status(&["command-build*.txt".to_string()], &current, StalePolicy::Warn)
            .unwrap();
        assert_eq!(status.missing, vec!["command-build*.txt"]);
    }

    #[test]
    fn test_invalid_classification() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(tmp.path());
        let current = fp("abc123");
        let path = store.evidence_path(&current, "test");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "garbage with no exit code\n").unwrap();

        let status = store
            .status(&["test".to_string()], &current, StalePolicy::Warn)
            .unwrap();
        assert_eq!(status.invalid, vec!["command-test.txt"]);
        assert!(!status.valid);
    }

    #[test]
    fn test_stale_is_independent_axis() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(tmp.path());
        let current = fp("def456");
        // Evidence embeds a different head but lives at the current key
        // (e.g. copied forward out-of-band).
        let old = fp("abc123");
        let path = store.evidence_path(&current, "test");
        sample(&old, 0).write(&path, None).unwrap();

        let status = store
            .status(&["test".to_string()], &current, StalePolicy::Warn)
            .unwrap();
        assert_eq!(status.checks[0].state, FileState::Passed);
        assert!(status.checks[0].stale);
        assert_eq!(status.checks[0].reason.as_deref(), Some("mismatch"));
        // Warn: stale alone does not fail the check.
        assert!(status.success);

        let status = store
            .status(&["test".to_string()], &current, StalePolicy::Block)
            .unwrap();
        assert!(!status.success);
    }
}
