//! Command evidence codec and HMAC integrity.
//!
//! Evidence of a CI-equivalent command run (lint, test, build, type-check) is
//! a small line-oriented text file, deliberately not JSON so a human can read
//! it in a diff. The optional trailing `HMAC:` line signs the canonicalized
//! remainder of the file with HMAC-SHA256, proving the record was produced by
//! a holder of the signing key and has not been edited since.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fs;
use std::path::Path;
use std::process::Command;

use crate::core::entity::write_atomic;
use crate::core::error::GatehouseError;
use crate::core::fingerprint::Fingerprint;
use crate::core::time::now_epoch_z;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEvidence {
    pub runner: String,
    pub command: String,
    pub cwd: String,
    pub exit_code: i32,
    pub started_at: String,
    pub completed_at: String,
    pub pipefail: bool,
    pub git_head: String,
    pub diff_hash: String,
    pub dirty: bool,
    pub hmac: Option<String>,
}

impl CommandEvidence {
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            git_head: self.git_head.clone(),
            diff_hash: self.diff_hash.clone(),
            dirty: self.dirty,
        }
    }

    /// Serialize without the `HMAC:` line.
    pub fn encode(&self) -> String {
        format!(
            "RUNNER: {}\nSTART: {}\nCMD: {}\nCWD: {}\nEXIT_CODE: {}\nCOMPLETED: {}\nPIPEFAIL: {}\nGIT_HEAD: {}\nDIFF_HASH: {}\nDIRTY: {}\nEND\n",
            self.runner,
            self.started_at,
            self.command,
            self.cwd,
            self.exit_code,
            self.completed_at,
            self.pipefail,
            self.git_head,
            self.diff_hash,
            self.dirty,
        )
    }

    /// Parse the text form. Fails when the exit code is absent or malformed;
    /// other missing fields default to empty so older evidence still parses.
    pub fn parse(text: &str) -> Result<Self, GatehouseError> {
        let mut ev = CommandEvidence {
            runner: String::new(),
            command: String::new(),
            cwd: String::new(),
            exit_code: 0,
            started_at: String::new(),
            completed_at: String::new(),
            pipefail: false,
            git_head: String::new(),
            diff_hash: String::new(),
            dirty: false,
            hmac: None,
        };
        let mut saw_exit_code = false;

        for line in text.lines() {
            if line.trim() == "END" {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "RUNNER" => ev.runner = value.to_string(),
                "START" => ev.started_at = value.to_string(),
                "CMD" => ev.command = value.to_string(),
                "CWD" => ev.cwd = value.to_string(),
                // Current form plus the legacy lowercase spelling.
                "EXIT_CODE" | "exit code" => {
                    ev.exit_code = value.parse().map_err(|_| {
                        GatehouseError::ValidationError(format!(
                            "unparseable exit code '{}' in command evidence",
                            value
                        ))
                    })?;
                    saw_exit_code = true;
                }
                "COMPLETED" => ev.completed_at = value.to_string(),
                "PIPEFAIL" => ev.pipefail = value == "true",
                "GIT_HEAD" => ev.git_head = value.to_string(),
                "DIFF_HASH" => ev.diff_hash = value.to_string(),
                "DIRTY" => ev.dirty = value == "true",
                "HMAC" => ev.hmac = Some(value.to_string()),
                _ => {}
            }
        }

        if !saw_exit_code {
            return Err(GatehouseError::ValidationError(
                "command evidence has no EXIT_CODE line".to_string(),
            ));
        }
        Ok(ev)
    }

    pub fn load(path: &Path) -> Result<Self, GatehouseError> {
        let content = fs::read_to_string(path).map_err(|e| {
            GatehouseError::NotFound(format!("cannot read evidence {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    /// Write the evidence file, signing it when a key is supplied.
    pub fn write(&self, path: &Path, key: Option<&[u8]>) -> Result<(), GatehouseError> {
        let mut text = self.encode();
        if let Some(key) = key {
            let mac = compute_hmac(key, text.as_bytes())?;
            text.push_str(&format!("HMAC: {}\n", mac));
        }
        write_atomic(path, text.as_bytes())
    }
}

/// Canonical byte sequence for signing: every `HMAC:`-prefixed line dropped,
/// remaining lines re-joined, exactly one trailing newline.
pub fn canonicalize(content: &str) -> Vec<u8> {
    let mut joined = content
        .lines()
        .filter(|line| !line.starts_with("HMAC:"))
        .collect::<Vec<_>>()
        .join("\n");
    while joined.ends_with('\n') {
        joined.pop();
    }
    joined.push('\n');
    joined.into_bytes()
}

/// HMAC-SHA256 over the canonicalized content, hex-encoded.
pub fn compute_hmac(key: &[u8], content: &[u8]) -> Result<String, GatehouseError> {
    let canonical = canonicalize(&String::from_utf8_lossy(content));
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| GatehouseError::IntegrityError(format!("invalid HMAC key: {}", e)))?;
    mac.update(&canonical);
    let digest = mac.finalize().into_bytes();
    Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
}

/// Verify the `HMAC:` line of an evidence file. Fails closed: an unreadable
/// file, a missing signature line, undecodable hex, or a digest mismatch are
/// all errors with a message naming the file.
pub fn verify(path: &Path, key: &[u8]) -> Result<(), GatehouseError> {
    let content = fs::read_to_string(path).map_err(|e| {
        GatehouseError::IntegrityError(format!("cannot read {}: {}", path.display(), e))
    })?;

    let signature = content
        .lines()
        .find_map(|line| line.strip_prefix("HMAC:"))
        .map(str::trim)
        .ok_or_else(|| {
            GatehouseError::IntegrityError(format!(
                "{} has no HMAC line; re-capture the evidence with signing enabled",
                path.display()
            ))
        })?;

    let expected = decode_hex(signature).ok_or_else(|| {
        GatehouseError::IntegrityError(format!(
            "{} has a malformed HMAC line",
            path.display()
        ))
    })?;

    let canonical = canonicalize(&content);
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| GatehouseError::IntegrityError(format!("invalid HMAC key: {}", e)))?;
    mac.update(&canonical);
    // Constant-time comparison.
    mac.verify_slice(&expected).map_err(|_| {
        GatehouseError::IntegrityError(format!(
            "HMAC mismatch for {}: evidence was modified after signing",
            path.display()
        ))
    })
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

/// Execute a command and capture its evidence against the given fingerprint.
/// The caller decides where the record is persisted (usually the snapshot
/// store for the same fingerprint).
pub fn capture(
    runner: &str,
    program: &str,
    args: &[String],
    cwd: &Path,
    fingerprint: &Fingerprint,
) -> Result<CommandEvidence, GatehouseError> {
    let started_at = now_epoch_z();
    let output = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .output()
        .map_err(|e| {
            GatehouseError::ValidationError(format!("command '{}' failed to spawn: {}", program, e))
        })?;
    let completed_at = now_epoch_z();

    Ok(CommandEvidence {
        runner: runner.to_string(),
        command: format!("{} {}", program, args.join(" ")).trim_end().to_string(),
        cwd: cwd.to_string_lossy().to_string(),
        exit_code: output.status.code().unwrap_or(-1),
        started_at,
        completed_at,
        pipefail: false,
        git_head: fingerprint.git_head.clone(),
        diff_hash: fingerprint.diff_hash.clone(),
        dirty: fingerprint.dirty,
        hmac: None,
    })
}
