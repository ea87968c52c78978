//! Repository-state fingerprinting.
//!
//! A fingerprint is the identity of "the code right now": the git HEAD hash,
//! a hash of the uncommitted diff, and a dirty flag. Command evidence is keyed
//! by fingerprint, not by round, so evidence produced against a previous code
//! state is detectable. Fingerprints are computed fresh on every call and
//! never cached across invocations.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::core::error::GatehouseError;

pub const UNKNOWN_HEAD: &str = "unknown-head";
pub const UNKNOWN_DIFF: &str = "unknown-diff";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Fingerprint {
    pub git_head: String,
    pub diff_hash: String,
    pub dirty: bool,
}

impl Fingerprint {
    pub fn unknown() -> Self {
        Self {
            git_head: UNKNOWN_HEAD.to_string(),
            diff_hash: UNKNOWN_DIFF.to_string(),
            dirty: false,
        }
    }

    /// Snapshot directory path segments: `gitHead/diffHash/{clean|dirty}`.
    /// Missing fields fall back to the `unknown-*` placeholders rather than
    /// failing.
    pub fn snapshot_key(&self) -> PathBuf {
        let head = if self.git_head.is_empty() {
            UNKNOWN_HEAD
        } else {
            &self.git_head
        };
        let diff = if self.diff_hash.is_empty() {
            UNKNOWN_DIFF
        } else {
            &self.diff_hash
        };
        PathBuf::from(head)
            .join(diff)
            .join(if self.dirty { "dirty" } else { "clean" })
    }
}

pub fn run_git(repo_root: &Path, args: &[&str]) -> Result<String, GatehouseError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_root)
        .output()
        .map_err(|e| GatehouseError::GitError(format!("git failed to spawn: {}", e)))?;

    if !output.status.success() {
        return Err(GatehouseError::GitError(format!(
            "git {} failed: {}",
            args.first().unwrap_or(&""),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Compute the fingerprint of a single git root.
///
/// A repo without commits (no HEAD) yields the `unknown-head` placeholder and
/// a diff hash over whatever `git diff` reports against the empty tree; a
/// directory that is not a repository at all yields the fully-unknown
/// fingerprint.
pub fn compute(repo_root: &Path) -> Fingerprint {
    let git_head = run_git(repo_root, &["rev-parse", "HEAD"])
        .unwrap_or_else(|_| UNKNOWN_HEAD.to_string());

    // Staged and unstaged changes relative to HEAD. When HEAD is absent the
    // plain diff still captures unstaged edits.
    let diff_text = if git_head == UNKNOWN_HEAD {
        run_git(repo_root, &["diff"])
    } else {
        run_git(repo_root, &["diff", "HEAD"])
    };

    let diff_hash = match &diff_text {
        Ok(text) => sha256_hex(text.as_bytes()),
        Err(_) => UNKNOWN_DIFF.to_string(),
    };

    let dirty = run_git(repo_root, &["status", "--porcelain"])
        .map(|out| !out.trim().is_empty())
        .unwrap_or(false);

    Fingerprint {
        git_head,
        diff_hash,
        dirty,
    }
}

/// Compute a composite fingerprint across several git roots plus an optional
/// list of extra files whose content participates in the identity.
///
/// The combination is order-insensitive: roots and extra files are sorted
/// before hashing, so two processes observing the same state agree on the key.
pub fn compute_multi(
    roots: &[PathBuf],
    extra_files: &[PathBuf],
) -> Result<Fingerprint, GatehouseError> {
    if roots.is_empty() && extra_files.is_empty() {
        return Ok(Fingerprint::unknown());
    }
    if roots.len() == 1 && extra_files.is_empty() {
        return Ok(compute(&roots[0]));
    }

    let mut sorted_roots: Vec<&PathBuf> = roots.iter().collect();
    sorted_roots.sort();

    let mut head_lines = Vec::new();
    let mut diff_lines = Vec::new();
    let mut dirty = false;
    for root in sorted_roots {
        let fp = compute(root);
        head_lines.push(format!("{}={}", root.display(), fp.git_head));
        diff_lines.push(format!("{}={}", root.display(), fp.diff_hash));
        dirty = dirty || fp.dirty;
    }

    let mut sorted_extra: Vec<&PathBuf> = extra_files.iter().collect();
    sorted_extra.sort();
    for file in sorted_extra {
        let content = std::fs::read(file).map_err(|e| {
            GatehouseError::PathError(format!(
                "cannot read extra fingerprint file {}: {}",
                file.display(),
                e
            ))
        })?;
        diff_lines.push(format!("{}={}", file.display(), sha256_hex(&content)));
    }

    Ok(Fingerprint {
        git_head: sha256_hex(head_lines.join("\n").as_bytes()),
        diff_hash: sha256_hex(diff_lines.join("\n").as_bytes()),
        dirty,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_key_shape() {
        let fp = Fingerprint {
            git_head: "abc123".to_string(),
            diff_hash: "def456".to_string(),
            dirty: true,
        };
        assert_eq!(fp.snapshot_key(), PathBuf::from("abc123/def456/dirty"));

        let clean = Fingerprint {
            dirty: false,
            ..fp
        };
        assert_eq!(clean.snapshot_key(), PathBuf::from("abc123/def456/clean"));
    }

    #[test]
    fn test_snapshot_key_placeholders() {
        let fp = Fingerprint {
            git_head: String::new(),
            diff_hash: String::new(),
            dirty: false,
        };
        assert_eq!(
            fp.snapshot_key(),
            PathBuf::from("unknown-head/unknown-diff/clean")
        );
    }

    #[test]
    fn test_equality_is_field_wise() {
        let a = Fingerprint {
            git_head: "h".into(),
            diff_hash: "d".into(),
            dirty: false,
        };
        let mut b = a.clone();
        assert_eq!(a, b);
        b.dirty = true;
        assert_ne!(a, b);
    }

    #[test]
    fn test_non_repo_directory_is_unknown() {
        let tmp = tempfile::tempdir().unwrap();
        let fp = compute(tmp.path());
        assert_eq!(fp.git_head, UNKNOWN_HEAD);
    }

    #[test]
    fn test_compute_multi_is_order_insensitive() {
        let tmp = tempfile::tempdir().unwrap();
        let f1 = tmp.path().join("a.txt");
        let f2 = tmp.path().join("b.txt");
        std::fs::write(&f1, "one").unwrap();
        std::fs::write(&f2, "two").unwrap();

        let fp_ab = compute_multi(&[], &[f1.clone(), f2.clone()]).unwrap();
        let fp_ba = compute_multi(&[], &[f2, f1]).unwrap();
        assert_eq!(fp_ab, fp_ba);
    }
}
