//! Fail-closed transition guards.
//!
//! Each guard answers one question about one target state, given only the
//! explicit `GuardContext`. A missing required context field is a denial, not
//! a pass; every denial names the artifact that is missing and, where there
//! is one, the remediation.

use regex::Regex;
use std::path::{Path, PathBuf};

use crate::core::cluster;
use crate::core::entity::{Entity, EntityKind, EntityStore};
use crate::core::error::GatehouseError;
use crate::core::evidence;
use crate::core::policy::{glob_match, StalePolicy};
use crate::core::rounds::{RoundStore, REPORT_FILE};
use crate::core::snapshot::SnapshotStore;
use crate::core::state_machine::{GuardContext, GuardOutcome, StateMachine, TransitionRef};
use crate::core::time;

/// Idle window after which a session stuck in `recovery` becomes eligible for
/// the advisory auto-transition to `closing`.
pub const AUTO_RECOVERY_WINDOW_SECS: i64 = 30 * 60;

/// TDD phase evidence file names, in required chronological order.
const TDD_PHASES: [(&str, &str); 3] = [
    ("RED", "tdd-red.txt"),
    ("GREEN", "tdd-green.txt"),
    ("REFACTOR", "tdd-refactor.txt"),
];

/// Task start: only the session the task is assigned to may start it.
pub fn can_start_task(ctx: &GuardContext) -> Result<GuardOutcome, GatehouseError> {
    let Some(task) = ctx.entity else {
        return Ok(GuardOutcome::denied("no task in guard context"));
    };
    let Some(session) = ctx.session else {
        return Ok(GuardOutcome::denied(format!(
            "starting task '{}' requires an acting session context",
            task.id
        )));
    };
    match &task.session_id {
        Some(owner) if *owner == session.id => Ok(GuardOutcome::Allowed),
        Some(owner) => Ok(GuardOutcome::denied(format!(
            "task '{}' belongs to session '{}', not '{}'",
            task.id, owner, session.id
        ))),
        None => Ok(GuardOutcome::denied(format!(
            "task '{}' has no owning session; assign it before starting",
            task.id
        ))),
    }
}

/// Rollback (done -> wip): requires a recorded non-empty reason.
pub fn can_rollback_task(ctx: &GuardContext) -> Result<GuardOutcome, GatehouseError> {
    let Some(task) = ctx.entity else {
        return Ok(GuardOutcome::denied("no task in guard context"));
    };
    match task.meta_str("rollbackReason") {
        Some(reason) if !reason.trim().is_empty() => Ok(GuardOutcome::Allowed),
        _ => Ok(GuardOutcome::denied(format!(
            "rolling back task '{}' requires a non-empty metadata.rollbackReason",
            task.id
        ))),
    }
}

/// Task finish: context7 markers, implementation report, required evidence
/// globs, and the TDD gate, each applied per the enforcement policy.
pub fn can_finish_task(ctx: &GuardContext) -> Result<GuardOutcome, GatehouseError> {
    let Some(task) = ctx.entity else {
        return Ok(GuardOutcome::denied("no task in guard context"));
    };
    let rounds = RoundStore::new(ctx.project_root);
    let Some(round) = rounds.current_round(&task.id)? else {
        return Ok(GuardOutcome::denied(format!(
            "task '{}' has no evidence round; run `gatehouse round ensure --task {}`",
            task.id, task.id
        )));
    };

    // (a) every detected post-training package needs a valid context7 marker.
    let mut packages: Vec<String> = ctx.enforcement.context7_packages.clone();
    if let Some(extra) = task.metadata.get("context7Packages").and_then(|v| v.as_array()) {
        packages.extend(extra.iter().filter_map(|v| v.as_str().map(String::from)));
    }
    let mut missing_packages = Vec::new();
    for package in &packages {
        if !rounds.context7_marker_valid(&task.id, round, package)? {
            missing_packages.push(package.clone());
        }
    }
    if !missing_packages.is_empty() {
        return Ok(GuardOutcome::denied(format!(
            "round-{} is missing context7 markers for: {}; write context7-<package>.txt for each",
            round,
            missing_packages.join(", ")
        )));
    }

    // (b) non-empty implementation report.
    if rounds.read_report(&task.id, round)?.is_none() {
        return Ok(GuardOutcome::denied(format!(
            "round-{} of task '{}' has no non-empty {}",
            round, task.id, REPORT_FILE
        )));
    }

    // (c) required-evidence globs over the round directory.
    if ctx.enforcement.evidence {
        let Some(policy) = ctx.policy else {
            return Ok(GuardOutcome::denied(
                "evidence enforcement is active but no policy was resolved for this task",
            ));
        };
        let files = rounds.round_files(&task.id, round)?;
        for pattern in &policy.required_evidence {
            if !files.iter().any(|f| glob_match(pattern, f)) {
                return Ok(GuardOutcome::denied(format!(
                    "round-{} has no file matching required evidence pattern '{}'",
                    round, pattern
                )));
            }
        }
    }

    // (d) the TDD gate.
    if ctx.enforcement.tdd {
        if let GuardOutcome::Denied(reason) = tdd_gate(ctx, task, round)? {
            return Ok(GuardOutcome::Denied(reason));
        }
    }

    Ok(GuardOutcome::Allowed)
}

fn tdd_gate(
    ctx: &GuardContext,
    task: &Entity,
    round: u32,
) -> Result<GuardOutcome, GatehouseError> {
    // Command evidence must pass against the *current* fingerprint.
    let Some(fingerprint) = ctx.fingerprint else {
        return Ok(GuardOutcome::denied(
            "TDD enforcement is active but no fingerprint was computed",
        ));
    };
    if let Some(policy) = ctx.policy {
        let snapshots = SnapshotStore::new(ctx.project_root);
        let commands: Vec<String> = policy
            .required_evidence
            .iter()
            .filter(|p| p.starts_with("command-"))
            .cloned()
            .collect();
        let status = snapshots.status(&commands, fingerprint, ctx.enforcement.stale_policy)?;

        // A configured signing key supersedes raw exit codes: a present file
        // passes on a verified signature alone, and a mismatch is fatal.
        let signed = if let Some(key) = &ctx.enforcement.signing_key {
            let dir = snapshots.dir_for(fingerprint);
            for name in &status.present {
                evidence::verify(&dir.join(name), key)?;
            }
            true
        } else {
            false
        };

        let stale_blocks =
            ctx.enforcement.stale_policy == StalePolicy::Block && !status.stale.is_empty();
        let passes = if signed {
            status.complete && status.valid && !stale_blocks
        } else {
            status.success
        };
        if !passes {
            let mut parts = Vec::new();
            if !status.missing.is_empty() {
                parts.push(format!("missing: {}", status.missing.join(", ")));
            }
            if !status.invalid.is_empty() {
                parts.push(format!("invalid: {}", status.invalid.join(", ")));
            }
            if !signed && !status.failed.is_empty() {
                parts.push(format!("failed (non-zero exit): {}", status.failed.join(", ")));
            }
            if stale_blocks {
                parts.push(format!("stale: {}", status.stale.join(", ")));
            }
            return Ok(GuardOutcome::denied(format!(
                "command evidence does not pass for the current code state ({}); re-run the commands and re-capture",
                parts.join("; ")
            )));
        }
    }

    // No focus markers in test files.
    if let Some((file, token)) = scan_blocked_tokens(
        ctx.project_root,
        &ctx.enforcement.test_globs,
        &ctx.enforcement.blocked_patterns,
    )? {
        return Ok(GuardOutcome::denied(format!(
            "blocked token '{}' found in {}; remove the focus marker before finishing",
            token,
            file.display()
        )));
    }

    // RED < GREEN < REFACTOR commit evidence, when supplied.
    let rounds = RoundStore::new(ctx.project_root);
    let round_dir = rounds.round_dir(&task.id, round)?;
    let mut phases: Vec<(&str, Option<i64>)> = Vec::new();
    for (phase, file) in TDD_PHASES {
        let ts = match std::fs::read_to_string(round_dir.join(file)) {
            Ok(content) => {
                let first = content.lines().next().unwrap_or("").trim().to_string();
                match time::parse_ts_epoch(&first) {
                    Some(epoch) => Some(epoch),
                    None => {
                        return Ok(GuardOutcome::denied(format!(
                            "{} phase evidence {} has an unparseable timestamp '{}'",
                            phase, file, first
                        )));
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(GatehouseError::IoError(e)),
        };
        phases.push((phase, ts));
    }

    let supplied = phases.iter().any(|(_, ts)| ts.is_some());
    if supplied {
        let red = phases[0].1;
        let green = phases[1].1;
        let refactor = phases[2].1;
        let (Some(red), Some(green)) = (red, green) else {
            let missing = if red.is_none() { "RED" } else { "GREEN" };
            return Ok(GuardOutcome::denied(format!(
                "TDD commit evidence is incomplete: the {} phase is missing",
                missing
            )));
        };
        if refactor.is_none() && !ctx.enforcement.refactor_waived {
            return Ok(GuardOutcome::denied(
                "TDD commit evidence is missing the REFACTOR phase and no waiver is recorded",
            ));
        }
        if green <= red {
            return Ok(GuardOutcome::denied(
                "TDD commit evidence out of order: GREEN must come after RED",
            ));
        }
        if let Some(refactor) = refactor {
            if refactor <= green {
                return Ok(GuardOutcome::denied(
                    "TDD commit evidence out of order: REFACTOR must come after GREEN",
                ));
            }
        }
    }

    Ok(GuardOutcome::Allowed)
}

/// First blocked token across the test files selected by the globs, as
/// `(file, token)`. `Ok(None)` when everything is clean.
pub fn scan_blocked_tokens(
    project_root: &Path,
    test_globs: &[String],
    blocked_patterns: &[String],
) -> Result<Option<(PathBuf, String)>, GatehouseError> {
    if test_globs.is_empty() || blocked_patterns.is_empty() {
        return Ok(None);
    }
    let patterns: Vec<Regex> = blocked_patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|e| {
                GatehouseError::ConfigError(format!("bad blocked pattern '{}': {}", p, e))
            })
        })
        .collect::<Result<_, _>>()?;

    let mut files = Vec::new();
    collect_files(project_root, project_root, test_globs, &mut files)?;
    files.sort();

    for file in files {
        let Ok(content) = std::fs::read_to_string(project_root.join(&file)) else {
            continue;
        };
        for pattern in &patterns {
            if let Some(found) = pattern.find(&content) {
                return Ok(Some((file, found.as_str().to_string())));
            }
        }
    }
    Ok(None)
}

fn collect_files(
    root: &Path,
    dir: &Path,
    globs: &[String],
    out: &mut Vec<PathBuf>,
) -> Result<(), GatehouseError> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Ok(());
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if name == ".git" || name == ".gatehouse" || name == "target" {
            continue;
        }
        if path.is_dir() {
            collect_files(root, &path, globs, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            let rel_str = rel.to_string_lossy();
            if globs.iter().any(|g| glob_match(g, &rel_str)) {
                out.push(rel.to_path_buf());
            }
        }
    }
    Ok(())
}

/// QA promotion to `done`: requires an acting session, the child's own
/// evidence checks, and the root bundle's explicit approval of this child.
pub fn can_promote_qa(ctx: &GuardContext) -> Result<GuardOutcome, GatehouseError> {
    let Some(qa) = ctx.entity else {
        return Ok(GuardOutcome::denied("no QA record in guard context"));
    };
    // No implicit "no session means no gate": absence of a session is itself
    // a hard failure.
    if ctx.session.is_none() {
        return Ok(GuardOutcome::denied(format!(
            "promoting QA for task '{}' requires an acting session context",
            qa.id
        )));
    }

    let task_id = qa.meta_str("taskId").unwrap_or(&qa.id).to_string();

    // Own required evidence, when enforcement is active.
    if ctx.enforcement.evidence {
        let Some(policy) = ctx.policy else {
            return Ok(GuardOutcome::denied(
                "evidence enforcement is active but no policy was resolved for this task",
            ));
        };
        let rounds = RoundStore::new(ctx.project_root);
        let Some(round) = rounds.current_round(&task_id)? else {
            return Ok(GuardOutcome::denied(format!(
                "task '{}' has no evidence round to review",
                task_id
            )));
        };
        let files = rounds.round_files(&task_id, round)?;
        for pattern in &policy.required_evidence {
            if !files.iter().any(|f| glob_match(pattern, f)) {
                return Ok(GuardOutcome::denied(format!(
                    "round-{} has no file matching required evidence pattern '{}'",
                    round, pattern
                )));
            }
        }
    }

    let store = EntityStore::new(ctx.project_root);
    let (root, approval) = cluster::child_approval(&store, ctx.project_root, &task_id)?;
    match approval {
        Some(true) => Ok(GuardOutcome::Allowed),
        Some(false) => Ok(GuardOutcome::denied(format!(
            "root task '{}' has not approved '{}' in its current bundle",
            root, task_id
        ))),
        None => Ok(GuardOutcome::denied(format!(
            "root task '{}' has no bundle approval entry for '{}'; approve it via `gatehouse bundle approve`",
            root, task_id
        ))),
    }
}

/// An advisory automatic transition a caller may apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoTransition {
    pub to: String,
    pub reason: String,
    pub auto: bool,
}

/// A session idle in `recovery` longer than the window is eligible for an
/// automatic move to `closing`. This is a check the caller invokes, not a
/// background timer.
pub fn check_auto_recovery(
    session: &Entity,
    now_epoch: i64,
    window_secs: i64,
) -> Option<AutoTransition> {
    if session.state != "recovery" {
        return None;
    }
    let last = session.last_transition_epoch()?;
    if now_epoch - last <= window_secs {
        return None;
    }
    Some(AutoTransition {
        to: "closing".to_string(),
        reason: format!(
            "auto-recovery: session idle in recovery for more than {}s",
            window_secs
        ),
        auto: true,
    })
}

/// Wire the stock guards into a state machine.
pub fn register_default_guards(machine: &mut StateMachine) {
    machine.register_guard(
        EntityKind::Task,
        "wip",
        Box::new(|ctx: &GuardContext, t: &TransitionRef| {
            if t.from == "done" {
                can_rollback_task(ctx)
            } else {
                can_start_task(ctx)
            }
        }),
    );
    machine.register_guard(
        EntityKind::Task,
        "done",
        Box::new(|ctx: &GuardContext, _t: &TransitionRef| can_finish_task(ctx)),
    );
    machine.register_guard(
        EntityKind::Qa,
        "done",
        Box::new(|ctx: &GuardContext, _t: &TransitionRef| can_promote_qa(ctx)),
    );
}
