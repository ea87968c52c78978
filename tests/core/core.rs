use gatehouse::core::audit::{self, AuditContext};
use gatehouse::core::cluster;
use gatehouse::core::entity::{Entity, EntityKind, EntityStore};
use gatehouse::core::error::GatehouseError;
use gatehouse::core::evidence::{self, CommandEvidence};
use gatehouse::core::fingerprint::{self, Fingerprint};
use gatehouse::core::guards;
use gatehouse::core::lock::TaskLockManager;
use gatehouse::core::policy::{EnforcementPolicy, Policy, StalePolicy};
use gatehouse::core::rounds::RoundStore;
use gatehouse::core::snapshot::SnapshotStore;
use gatehouse::core::state_machine::{GuardContext, StateMachine};
use gatehouse::core::verifier;
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn plain_ctx<'a>(root: &'a Path, enforcement: &'a EnforcementPolicy) -> GuardContext<'a> {
    GuardContext {
        project_root: root,
        entity: None,
        session: None,
        fingerprint: None,
        policy: None,
        enforcement,
        now_epoch: 0,
    }
}

#[test]
fn undeclared_transitions_are_rejected_for_every_kind() {
    let tmp = tempdir().expect("tempdir");
    let enforcement = EnforcementPolicy::default();
    let machine = StateMachine::new(StateMachine::default_tables());
    let ctx = plain_ctx(tmp.path(), &enforcement);

    for kind in [EntityKind::Task, EntityKind::Qa, EntityKind::Session] {
        let table = machine.table(kind).expect("table");
        let states: Vec<String> = table.states().map(String::from).collect();
        for from in &states {
            for to in &states {
                let result = machine.validate_transition(kind, from, to, &ctx);
                if table.allows(from, to) {
                    assert!(result.is_ok(), "{kind:?} {from} -> {to} should pass");
                } else {
                    assert!(
                        matches!(result, Err(GatehouseError::InvalidTransition { .. })),
                        "{kind:?} {from} -> {to} should be rejected"
                    );
                }
            }
        }
        // States outside the table are an error, not a denial.
        assert!(machine
            .validate_transition(kind, "no-such-state", &states[0], &ctx)
            .is_err());
    }
}

#[test]
fn lock_admits_exactly_one_winner_under_contention() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path().to_path_buf();
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let mut handles = Vec::new();

    for i in 0..threads {
        let barrier = Arc::clone(&barrier);
        let root = root.clone();
        handles.push(std::thread::spawn(move || {
            let locks = TaskLockManager::new(&root);
            barrier.wait();
            let guard = locks
                .try_acquire("T1", "transition", &format!("agent-{i}"), Duration::from_secs(5))
                .expect("acquisition attempt should not error");
            let won = guard.is_some();
            // Hold the lock until every contender has finished its attempt,
            // so a released lock cannot hand a second thread a win.
            barrier.wait();
            won
        }));
    }

    let winners = handles
        .into_iter()
        .map(|h| h.join().expect("thread"))
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1, "exactly one contender may hold the lock");
}

#[test]
fn lock_release_lets_the_next_acquirer_in() {
    let tmp = tempdir().expect("tempdir");
    let locks = TaskLockManager::new(tmp.path());

    let guard = locks
        .acquire("T1", "transition", "a", Duration::from_secs(1))
        .expect("first acquire");

    let start = Instant::now();
    let err = locks
        .acquire("T1", "transition", "b", Duration::from_millis(300))
        .expect_err("held lock must time out");
    assert!(matches!(err, GatehouseError::LockTimeout { .. }));
    assert!(start.elapsed() >= Duration::from_millis(300));

    drop(guard);
    locks
        .acquire("T1", "transition", "b", Duration::from_secs(1))
        .expect("acquire after release");
}

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_NAME", "t")
        .env("GIT_AUTHOR_EMAIL", "t@t")
        .env("GIT_COMMITTER_NAME", "t")
        .env("GIT_COMMITTER_EMAIL", "t@t")
        .status()
        .expect("git spawn");
    assert!(status.success(), "git {args:?} failed");
}

#[test]
fn fingerprint_is_deterministic_and_tracks_edits() {
    if !git_available() {
        return;
    }
    let tmp = tempdir().expect("tempdir");
    let repo = tmp.path();
    git(repo, &["init", "-q"]);
    std::fs::write(repo.join("a.txt"), "one\n").unwrap();
    git(repo, &["add", "."]);
    git(repo, &["commit", "-q", "-m", "init"]);

    let clean_a = fingerprint::compute(repo);
    let clean_b = fingerprint::compute(repo);
    assert_eq!(clean_a, clean_b, "same state must yield the same fingerprint");
    assert_ne!(clean_a.git_head, fingerprint::UNKNOWN_HEAD);
    assert!(!clean_a.dirty);

    std::fs::write(repo.join("a.txt"), "two\n").unwrap();
    let dirty = fingerprint::compute(repo);
    assert!(dirty.dirty);
    assert_ne!(dirty.diff_hash, clean_a.diff_hash);
    assert_ne!(dirty.snapshot_key(), clean_a.snapshot_key());
}

#[test]
fn fingerprint_outside_a_repository_uses_placeholders() {
    let tmp = tempdir().expect("tempdir");
    let fp = fingerprint::compute(tmp.path());
    assert_eq!(fp.git_head, fingerprint::UNKNOWN_HEAD);
    let key = fp.snapshot_key();
    assert!(key.to_string_lossy().contains(fingerprint::UNKNOWN_HEAD));
}

fn sample_evidence(fp: &Fingerprint, exit_code: i32) -> CommandEvidence {
    CommandEvidence {
        runner: "gatehouse".into(),
        command: "npm test".into(),
        cwd: "/work".into(),
        exit_code,
        started_at: "100Z".into(),
        completed_at: "200Z".into(),
        pipefail: true,
        git_head: fp.git_head.clone(),
        diff_hash: fp.diff_hash.clone(),
        dirty: fp.dirty,
        hmac: None,
    }
}

#[test]
fn signed_evidence_detects_single_byte_tampering() {
    let tmp = tempdir().expect("tempdir");
    let key = b"integration-key".to_vec();
    let fp = Fingerprint::unknown();
    let path = tmp.path().join("command-test.txt");

    let ev = sample_evidence(&fp, 0);
    ev.write(&path, Some(key.as_slice())).expect("write signed");
    evidence::verify(&path, &key).expect("fresh signature verifies");

    let mut bytes = std::fs::read(&path).expect("read");
    let pos = bytes
        .windows(12)
        .position(|w| w == b"EXIT_CODE: 0")
        .expect("exit code line");
    bytes[pos + 11] = b'1';
    std::fs::write(&path, &bytes).unwrap();

    let err = evidence::verify(&path, &key).expect_err("tampered evidence must fail");
    assert!(matches!(err, GatehouseError::IntegrityError(_)));
}

#[test]
fn round_numbers_never_regress_after_directory_loss() {
    let tmp = tempdir().expect("tempdir");
    let rounds = RoundStore::new(tmp.path());

    let (r1, dir1) = rounds.ensure_round("T1").expect("round 1");
    let (r2, dir2) = rounds.ensure_round("T1").expect("round 2");
    assert_eq!((r1, r2), (1, 2));

    // An external cleanup removes everything on disk; the counter survives
    // in metadata so the next round is still fresh.
    std::fs::remove_dir_all(&dir2).unwrap();
    std::fs::remove_dir_all(&dir1).unwrap();
    let (r3, _) = rounds.ensure_round("T1").expect("round 3");
    assert_eq!(r3, 3);
}

#[test]
fn stale_evidence_warns_or_blocks_per_policy() {
    let tmp = tempdir().expect("tempdir");
    let snapshots = SnapshotStore::new(tmp.path());

    let current = Fingerprint {
        git_head: "head-b".into(),
        diff_hash: "diff-b".into(),
        dirty: false,
    };
    let earlier = Fingerprint {
        git_head: "head-a".into(),
        diff_hash: "diff-a".into(),
        dirty: false,
    };

    // Evidence captured against an earlier code state, sitting where the
    // current state's evidence is expected.
    let ev = sample_evidence(&earlier, 0);
    snapshots.store(&current, "test", &ev, None).expect("store");

    let required = vec!["command-test.txt".to_string()];
    let warn = snapshots
        .status(&required, &current, StalePolicy::Warn)
        .expect("warn status");
    assert!(warn.passed);
    assert_eq!(warn.stale, vec!["command-test.txt".to_string()]);
    assert!(warn.success, "warn policy reports but does not fail");

    let block = snapshots
        .status(&required, &current, StalePolicy::Block)
        .expect("block status");
    assert!(!block.success, "block policy fails on stale evidence");
}

#[test]
fn task_lifecycle_is_guarded_end_to_end() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path();
    let store = EntityStore::new(root);
    let enforcement = EnforcementPolicy::default();
    let mut machine = StateMachine::new(StateMachine::default_tables());
    guards::register_default_guards(&mut machine);

    let session = Entity::new("S1", EntityKind::Session, "active");
    store.save(&session).unwrap();
    let intruder = Entity::new("S2", EntityKind::Session, "active");
    store.save(&intruder).unwrap();

    let mut task = Entity::new("T1", EntityKind::Task, "pending");
    task.session_id = Some("S1".into());
    store.save(&task).unwrap();

    let fp = Fingerprint::unknown();
    let mut ctx = GuardContext {
        project_root: root,
        entity: Some(&task),
        session: Some(&intruder),
        fingerprint: Some(&fp),
        policy: None,
        enforcement: &enforcement,
        now_epoch: 0,
    };

    // The wrong session may not start the task.
    let err = machine
        .validate_transition(EntityKind::Task, "pending", "wip", &ctx)
        .expect_err("foreign session must be denied");
    assert!(matches!(err, GatehouseError::GuardDenied { .. }));

    // The owner may.
    ctx.session = Some(&session);
    machine
        .validate_transition(EntityKind::Task, "pending", "wip", &ctx)
        .expect("owner starts the task");
    let mut task = task.clone();
    store
        .record_transition(&mut task, "wip", "starting", "agent", false)
        .unwrap();

    // Finishing without a round is denied, with the remedy named.
    let ctx = GuardContext {
        project_root: root,
        entity: Some(&task),
        session: Some(&session),
        fingerprint: Some(&fp),
        policy: None,
        enforcement: &enforcement,
        now_epoch: 0,
    };
    let err = machine
        .validate_transition(EntityKind::Task, "wip", "done", &ctx)
        .expect_err("no evidence round");
    assert!(err.to_string().contains("round"));

    // A round with a report satisfies the unenforced profile.
    let rounds = RoundStore::new(root);
    let (n, _) = rounds.ensure_round("T1").unwrap();
    rounds.write_report("T1", n, "done the work").unwrap();
    machine
        .validate_transition(EntityKind::Task, "wip", "done", &ctx)
        .expect("finish with report");
}

#[test]
fn qa_promotion_waits_for_bundle_approval() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path();
    let store = EntityStore::new(root);
    let enforcement = EnforcementPolicy::default();
    let mut machine = StateMachine::new(StateMachine::default_tables());
    guards::register_default_guards(&mut machine);

    let session = Entity::new("S1", EntityKind::Session, "active");
    store.save(&session).unwrap();

    let parent = Entity::new("P1", EntityKind::Task, "wip");
    store.save(&parent).unwrap();
    for child in ["C1", "C2"] {
        let mut task = Entity::new(child, EntityKind::Task, "wip");
        task.metadata
            .insert("parent".into(), serde_json::json!("P1"));
        store.save(&task).unwrap();
    }

    let rounds = RoundStore::new(root);
    rounds.ensure_round("P1").unwrap();
    let policy = Policy {
        preset: "default".into(),
        required_evidence: Vec::new(),
        blocking_validators: Vec::new(),
    };
    let bundle =
        cluster::build_bundle(&store, root, "P1", &policy.preset, &policy.blocking_validators)
            .expect("build bundle");
    assert!(!bundle.approved);
    assert_eq!(bundle.tasks.len(), 3);
    cluster::write_bundle(root, "P1", &bundle).unwrap();

    let mut qa = Entity::new("C1", EntityKind::Qa, "in-review");
    qa.metadata.insert("taskId".into(), serde_json::json!("C1"));
    store.save(&qa).unwrap();

    let fp = Fingerprint::unknown();
    let ctx = GuardContext {
        project_root: root,
        entity: Some(&qa),
        session: Some(&session),
        fingerprint: Some(&fp),
        policy: Some(&policy),
        enforcement: &enforcement,
        now_epoch: 0,
    };

    // Not yet approved in the root's bundle.
    let err = machine
        .validate_transition(EntityKind::Qa, "in-review", "done", &ctx)
        .expect_err("unapproved child stays in review");
    assert!(err.to_string().contains("P1"), "denial names the root: {err}");

    cluster::approve_child(root, "P1", "C1").expect("approve child");
    machine
        .validate_transition(EntityKind::Qa, "in-review", "done", &ctx)
        .expect("approved child promotes");

    // The aggregate stays incomplete until every member is approved.
    let bundle = cluster::read_bundle(root, "P1").unwrap().unwrap();
    assert!(!bundle.approved);
    assert_eq!(bundle.missing.len(), 2);
}

#[test]
fn unlogged_edits_are_reported_and_reports_are_stable() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path();
    let store = EntityStore::new(root);

    let logged = Entity::new("LOGGED", EntityKind::Task, "pending");
    store.save(&logged).unwrap();
    let ctx = AuditContext::new(root);
    audit::audit_event(&ctx, "entity.save", serde_json::json!({ "taskId": "LOGGED" }));

    let silent = Entity::new("SILENT", EntityKind::Task, "pending");
    store.save(&silent).unwrap();

    let first = verifier::detect_unlogged(root, None, &[]).expect("detect");
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].entity_id, "SILENT");
    assert!(!first[0].current_hash.is_empty());

    // Detection is a pure read.
    let second = verifier::detect_unlogged(root, None, &[]).expect("detect again");
    assert_eq!(first, second);

    // Once the write is logged the report clears.
    audit::audit_event(&ctx, "entity.save", serde_json::json!({ "taskId": "SILENT" }));
    let third = verifier::detect_unlogged(root, None, &[]).expect("detect after logging");
    assert!(third.is_empty(), "got: {third:?}");
}

#[test]
fn transition_history_and_log_stay_in_step() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path();
    let store = EntityStore::new(root);

    let mut task = Entity::new("T1", EntityKind::Task, "pending");
    store.save(&task).unwrap();
    store
        .record_transition(&mut task, "wip", "starting", "agent", false)
        .unwrap();
    store
        .record_transition(&mut task, "blocked", "waiting on review", "agent", false)
        .unwrap();

    let reloaded = store.get(EntityKind::Task, "T1").unwrap();
    assert_eq!(reloaded.state, "blocked");
    assert_eq!(reloaded.state_history.len(), 2);

    let log = gatehouse::core::paths::transitions_log_path(root);
    let lines = std::fs::read_to_string(&log).unwrap();
    assert_eq!(lines.lines().count(), 2, "one log line per transition");
    let last: serde_json::Value = serde_json::from_str(lines.lines().last().unwrap()).unwrap();
    assert_eq!(last["to"], "blocked");
    assert_eq!(last["entity_id"], "T1");
}
