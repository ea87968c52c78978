//! Gatehouse: a filesystem control plane for multi-agent delivery work.
//!
//! **Gatehouse coordinates autonomous coding agents through plain files.**
//!
//! There is no daemon and no database. Tasks, QA records, and sessions are
//! JSON documents under `.gatehouse/`; every state change flows through a
//! guarded state machine; every command run as validation evidence is
//! captured, fingerprinted against the code state it ran in, and optionally
//! HMAC-signed so it cannot be fabricated after the fact.
//!
//! # Core Principles
//!
//! - **Local-first**: all state lives in the repository, versioned alongside it
//! - **Fail-closed**: a guard that cannot prove a transition is safe denies it
//! - **Evidence-gated**: completion requires artifacts, not assertions
//! - **Tamper-evident**: out-of-band edits are detectable after the fact
//!
//! # For AI Agents
//!
//! **You MUST:**
//! 1. Initialize once: `gatehouse init`
//! 2. Drive all state changes through the CLI: never edit `.gatehouse/` by hand
//! 3. Capture evidence with `gatehouse evidence capture` before finishing a task
//! 4. Expect denials: a denied transition names exactly what is missing
//!
//! # Crate Structure
//!
//! - [`core`]: entities, state machine, guards, evidence, locks, audit

pub mod core;

use core::audit::{self, AuditContext};
use core::cluster;
use core::entity::{Entity, EntityKind, EntityStore};
use core::error::GatehouseError;
use core::evidence;
use core::fingerprint;
use core::guards;
use core::lock::TaskLockManager;
use core::paths;
use core::policy::{self, GatehouseConfig};
use core::rounds::RoundStore;
use core::snapshot::SnapshotStore;
use core::state_machine::{GuardContext, StateMachine};
use core::time;
use core::verifier;

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const LOCK_WAIT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[clap(
    name = "gatehouse",
    version = env!("CARGO_PKG_VERSION"),
    about = "Evidence-gated coordination for autonomous delivery agents"
)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

// ===== Grouped Command Structures =====

#[derive(clap::Args, Debug)]
struct EntityCli {
    #[clap(subcommand)]
    command: EntityCommand,
}

#[derive(Subcommand, Debug)]
enum EntityCommand {
    /// Create a new record in its initial state
    Create {
        id: String,
        /// Owning session (tasks only)
        #[clap(long)]
        session: Option<String>,
        /// Parent task id, making this task part of a cluster
        #[clap(long)]
        parent: Option<String>,
        /// Validation preset name recorded in metadata
        #[clap(long)]
        preset: Option<String>,
    },
    /// Print one record as JSON
    Show { id: String },
    /// List ids, sorted
    List,
    /// Request a guarded state transition
    Transition(TransitionCli),
}

#[derive(clap::Args, Debug)]
struct TransitionCli {
    id: String,
    /// Target state
    #[clap(long)]
    to: String,
    #[clap(long, default_value = "")]
    reason: String,
    #[clap(long, default_value = "agent")]
    actor: String,
    /// Acting session id (required by ownership guards)
    #[clap(long)]
    session: Option<String>,
    /// Validation preset override
    #[clap(long)]
    preset: Option<String>,
    /// Output format: 'text' or 'json'
    #[clap(long, default_value = "text")]
    format: String,
}

#[derive(clap::Args, Debug)]
struct RoundCli {
    #[clap(subcommand)]
    command: RoundCommand,
}

#[derive(Subcommand, Debug)]
enum RoundCommand {
    /// Allocate the next validation round for a task
    Ensure {
        #[clap(long)]
        task: String,
    },
    /// Show the current round number and its files
    Show {
        #[clap(long)]
        task: String,
    },
    /// Write the implementation report into the current round
    Report {
        #[clap(long)]
        task: String,
        /// Report body; '-' reads stdin
        content: String,
    },
}

#[derive(clap::Args, Debug)]
struct EvidenceCli {
    #[clap(subcommand)]
    command: EvidenceCommand,
}

#[derive(Subcommand, Debug)]
enum EvidenceCommand {
    /// Run a command and store its evidence under the current fingerprint
    Capture {
        /// Evidence name (e.g. 'test', 'lint')
        #[clap(long)]
        name: String,
        /// Program to run
        program: String,
        /// Arguments to the program
        #[clap(last = true)]
        args: Vec<String>,
    },
    /// Verify the HMAC signature of one evidence file
    Verify { path: PathBuf },
    /// Classify required evidence for a task against the current fingerprint
    Status {
        #[clap(long)]
        task: String,
        #[clap(long)]
        preset: Option<String>,
        #[clap(long, default_value = "text")]
        format: String,
    },
}

#[derive(clap::Args, Debug)]
struct BundleCli {
    #[clap(subcommand)]
    command: BundleCommand,
}

#[derive(Subcommand, Debug)]
enum BundleCommand {
    /// Build (or rebuild) the root task's approval bundle
    Build {
        #[clap(long)]
        task: String,
        #[clap(long)]
        preset: Option<String>,
    },
    /// Show the bundle covering a task's cluster
    Show {
        #[clap(long)]
        task: String,
    },
    /// Record approval for one child in the root's bundle
    Approve {
        #[clap(long)]
        task: String,
        #[clap(long)]
        child: String,
    },
}

#[derive(clap::Args, Debug)]
struct LockCli {
    #[clap(subcommand)]
    command: LockCommand,
}

#[derive(Subcommand, Debug)]
enum LockCommand {
    /// Probe a task lock without acquiring it
    Status {
        #[clap(long)]
        task: String,
        #[clap(long, default_value = "transition")]
        purpose: String,
    },
}

#[derive(clap::Args, Debug)]
struct AuditCli {
    #[clap(subcommand)]
    command: AuditCommand,
}

#[derive(Subcommand, Debug)]
enum AuditCommand {
    /// Print the most recent audit events
    Tail {
        #[clap(long, default_value = "20")]
        limit: usize,
    },
    /// Reconcile tracked files against the audit log
    Verify {
        #[clap(long)]
        session: Option<String>,
        /// Restrict to specific tasks; default is all
        #[clap(long)]
        task: Vec<String>,
        #[clap(long, default_value = "text")]
        format: String,
    },
}

// ===== Main Command Enum =====

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize the .gatehouse state tree
    #[clap(name = "init", visible_alias = "i")]
    Init {
        /// Directory to initialize (defaults to current working directory)
        #[clap(short, long)]
        dir: Option<PathBuf>,
    },

    /// Tasks: units of delivery work
    #[clap(name = "task", visible_alias = "t")]
    Task(EntityCli),

    /// QA records: review state per task
    #[clap(name = "qa", visible_alias = "q")]
    Qa(EntityCli),

    /// Sessions: agent working contexts
    #[clap(name = "session", visible_alias = "s")]
    Session(EntityCli),

    /// Validation rounds and implementation reports
    #[clap(name = "round", visible_alias = "r")]
    Round(RoundCli),

    /// Command evidence capture and verification
    #[clap(name = "evidence", visible_alias = "e")]
    Evidence(EvidenceCli),

    /// Cluster approval bundles
    #[clap(name = "bundle", visible_alias = "b")]
    Bundle(BundleCli),

    /// Advisory per-task locks
    #[clap(name = "lock", visible_alias = "l")]
    Lock(LockCli),

    /// Audit log access and tamper reconciliation
    #[clap(name = "audit", visible_alias = "a")]
    Audit(AuditCli),

    /// Apply eligible automatic session transitions
    #[clap(name = "sweep")]
    Sweep,

    /// Summarize entity states across the project
    #[clap(name = "status")]
    Status,

    /// Show version information
    #[clap(name = "version")]
    Version,
}

fn project_root() -> Result<PathBuf, GatehouseError> {
    let cwd = std::env::current_dir()?;
    paths::find_project_root(&cwd)
}

fn print_envelope(format: &str, cmd: &str, status: &str, extra: serde_json::Value) {
    if format == "json" {
        let envelope = time::command_envelope(cmd, status, extra);
        println!("{}", serde_json::to_string_pretty(&envelope).unwrap_or_default());
    }
}

fn init_project(dir: Option<PathBuf>) -> Result<(), GatehouseError> {
    let target = match dir {
        Some(d) => d,
        None => std::env::current_dir()?,
    };
    let root = paths::gatehouse_root(&target);
    if root.exists() {
        println!(
            "{} {} already initialized",
            "▸".bright_yellow(),
            root.display()
        );
        return Ok(());
    }
    for dir in [
        paths::tasks_dir(&target),
        paths::qa_dir(&target),
        paths::sessions_dir(&target),
        paths::evidence_dir(&target),
        paths::snapshots_dir(&target),
        paths::locks_dir(&target),
        paths::logs_dir(&target),
    ] {
        std::fs::create_dir_all(&dir)?;
    }
    let config = paths::config_path(&target);
    if !config.exists() {
        std::fs::write(&config, policy::default_config_toml())?;
    }
    println!(
        "{} initialized {}",
        "✓".bright_green().bold(),
        root.display()
    );
    Ok(())
}

/// All the context a guarded transition needs, assembled once per command.
fn perform_transition(
    root: &Path,
    kind: EntityKind,
    cli: &TransitionCli,
) -> Result<(), GatehouseError> {
    let store = EntityStore::new(root);
    let mut entity = store.get(kind, &cli.id)?;
    let session = match &cli.session {
        Some(sid) => Some(store.get(EntityKind::Session, sid)?),
        None => None,
    };

    let config = GatehouseConfig::load(root)?;
    let enforcement = config.enforcement()?;
    let current_fp = fingerprint::compute(root);
    let resolved_policy = match kind {
        EntityKind::Task | EntityKind::Qa => {
            let task = if kind == EntityKind::Task {
                entity.clone()
            } else {
                store.get(EntityKind::Task, entity.meta_str("taskId").unwrap_or(&entity.id))?
            };
            Some(policy::resolve_for_task(&config, Some(&task), cli.preset.as_deref())?)
        }
        EntityKind::Session => None,
    };

    let mut machine = StateMachine::new(StateMachine::default_tables());
    guards::register_default_guards(&mut machine);

    let mut audit_ctx = AuditContext::new(root);
    if let Some(s) = &session {
        audit_ctx = audit_ctx.with_session(&s.id);
    }

    // Per-task exclusion: the check-then-write of a transition is one
    // critical section.
    let locks = TaskLockManager::new(root);
    let _guard = match kind {
        EntityKind::Session => None,
        _ => Some(locks.acquire(&entity.id, "transition", &cli.actor, LOCK_WAIT)?),
    };

    let ctx = GuardContext {
        project_root: root,
        entity: Some(&entity),
        session: session.as_ref(),
        fingerprint: Some(&current_fp),
        policy: resolved_policy.as_ref(),
        enforcement: &enforcement,
        now_epoch: chrono::Utc::now().timestamp(),
    };

    let from = entity.state.clone();
    match machine.validate_transition(kind, &from, &cli.to, &ctx) {
        Ok(()) => {
            audit::audit_event(
                &audit_ctx,
                "guard.allowed",
                serde_json::json!({
                    "taskId": entity.id,
                    "kind": kind.as_str(),
                    "from": from,
                    "to": cli.to,
                }),
            );
        }
        Err(e) => {
            audit::audit_event(
                &audit_ctx,
                "guard.denied",
                serde_json::json!({
                    "taskId": entity.id,
                    "kind": kind.as_str(),
                    "from": from,
                    "to": cli.to,
                    "reason": e.to_string(),
                }),
            );
            print_envelope(
                &cli.format,
                "transition",
                "denied",
                serde_json::json!({ "reason": e.to_string() }),
            );
            return Err(e);
        }
    }

    store.record_transition(&mut entity, &cli.to, &cli.reason, &cli.actor, false)?;
    audit::audit_event(
        &audit_ctx,
        "entity.transition",
        serde_json::json!({
            "taskId": entity.id,
            "kind": kind.as_str(),
            "from": from,
            "to": cli.to,
            "reason": cli.reason,
            "actor": cli.actor,
        }),
    );

    if cli.format == "json" {
        print_envelope(
            &cli.format,
            "transition",
            "ok",
            serde_json::json!({ "id": entity.id, "from": from, "to": cli.to }),
        );
    } else {
        println!(
            "{} {} {} {} {} {}",
            "✓".bright_green().bold(),
            kind.as_str().bright_white(),
            entity.id.bright_cyan().bold(),
            from.bright_black(),
            "→".bright_black(),
            cli.to.bright_green()
        );
    }
    Ok(())
}

fn run_entity_command(kind: EntityKind, cli: EntityCli) -> Result<(), GatehouseError> {
    let root = project_root()?;
    let store = EntityStore::new(&root);
    let audit_ctx = AuditContext::new(&root);
    match cli.command {
        EntityCommand::Create {
            id,
            session,
            parent,
            preset,
        } => {
            if store.exists(kind, &id)? {
                return Err(GatehouseError::ValidationError(format!(
                    "{} '{}' already exists",
                    kind.as_str(),
                    id
                )));
            }
            let initial = match kind {
                EntityKind::Task => "pending",
                EntityKind::Qa => "pending",
                EntityKind::Session => "active",
            };
            let mut entity = Entity::new(&id, kind, initial);
            entity.session_id = session;
            if let Some(parent) = parent {
                if !store.exists(EntityKind::Task, &parent)? {
                    return Err(GatehouseError::NotFound(format!(
                        "parent task '{}' does not exist",
                        parent
                    )));
                }
                entity
                    .metadata
                    .insert("parent".into(), serde_json::json!(parent));
            }
            if let Some(preset) = preset {
                entity
                    .metadata
                    .insert("preset".into(), serde_json::json!(preset));
            }
            store.save(&entity)?;
            audit::audit_event(
                &audit_ctx,
                "entity.create",
                serde_json::json!({ "taskId": id, "kind": kind.as_str(), "state": initial }),
            );
            println!(
                "{} created {} {}",
                "✓".bright_green().bold(),
                kind.as_str(),
                id.bright_cyan().bold()
            );
            Ok(())
        }
        EntityCommand::Show { id } => {
            let entity = store.get(kind, &id)?;
            println!("{}", serde_json::to_string_pretty(&entity)?);
            Ok(())
        }
        EntityCommand::List => {
            for id in store.list(kind)? {
                let entity = store.get(kind, &id)?;
                println!("{}  {}", id.bright_cyan(), entity.state.bright_black());
            }
            Ok(())
        }
        EntityCommand::Transition(t) => perform_transition(&root, kind, &t),
    }
}

fn run_round_command(cli: RoundCli) -> Result<(), GatehouseError> {
    let root = project_root()?;
    let rounds = RoundStore::new(&root);
    let locks = TaskLockManager::new(&root);
    let audit_ctx = AuditContext::new(&root);
    match cli.command {
        RoundCommand::Ensure { task } => {
            let _guard = locks.acquire(&task, "round", "agent", LOCK_WAIT)?;
            let (n, dir) = rounds.ensure_round(&task)?;
            audit::audit_event(
                &audit_ctx,
                "round.ensure",
                serde_json::json!({ "taskId": task, "round": n }),
            );
            println!("round-{} at {}", n, dir.display());
            Ok(())
        }
        RoundCommand::Show { task } => {
            match rounds.current_round(&task)? {
                Some(n) => {
                    println!("current: round-{}", n);
                    for f in rounds.round_files(&task, n)? {
                        println!("  {}", f);
                    }
                }
                None => println!("no rounds for task '{}'", task),
            }
            Ok(())
        }
        RoundCommand::Report { task, content } => {
            let body = if content == "-" {
                use std::io::Read;
                let mut buf = String::new();
                std::io::stdin().read_to_string(&mut buf)?;
                buf
            } else {
                content
            };
            let Some(n) = rounds.current_round(&task)? else {
                return Err(GatehouseError::NotFound(format!(
                    "task '{}' has no round; run `gatehouse round ensure` first",
                    task
                )));
            };
            rounds.write_report(&task, n, &body)?;
            audit::audit_event(
                &audit_ctx,
                "round.report",
                serde_json::json!({ "taskId": task, "round": n }),
            );
            println!("report written to round-{}", n);
            Ok(())
        }
    }
}

fn run_evidence_command(cli: EvidenceCli) -> Result<(), GatehouseError> {
    let root = project_root()?;
    let config = GatehouseConfig::load(&root)?;
    let enforcement = config.enforcement()?;
    let audit_ctx = AuditContext::new(&root);
    match cli.command {
        EvidenceCommand::Capture {
            name,
            program,
            args,
        } => {
            let current_fp = fingerprint::compute(&root);
            let ev = evidence::capture("gatehouse", &program, &args, &root, &current_fp)?;
            let snapshots = SnapshotStore::new(&root);
            let path = snapshots.store(
                &current_fp,
                &name,
                &ev,
                enforcement.signing_key.as_deref(),
            )?;
            audit::audit_event(
                &audit_ctx,
                "subprocess.capture",
                serde_json::json!({
                    "name": name,
                    "command": ev.command,
                    "exitCode": ev.exit_code,
                    "path": path.to_string_lossy(),
                }),
            );
            let verdict = if ev.passed() {
                "passed".bright_green().bold()
            } else {
                "failed".bright_red().bold()
            };
            println!("{} exit {} → {}", verdict, ev.exit_code, path.display());
            Ok(())
        }
        EvidenceCommand::Verify { path } => {
            let key = enforcement.signing_key.as_deref().ok_or_else(|| {
                GatehouseError::ConfigError(
                    "no signing key configured; set evidence.signing_key_hex in .gatehouse/config.toml"
                        .to_string(),
                )
            })?;
            evidence::verify(&path, key)?;
            println!("{} signature verified", "✓".bright_green().bold());
            Ok(())
        }
        EvidenceCommand::Status {
            task,
            preset,
            format,
        } => {
            let store = EntityStore::new(&root);
            let task_entity = store.get(EntityKind::Task, &task)?;
            let resolved = policy::resolve_for_task(&config, Some(&task_entity), preset.as_deref())?;
            let current_fp = fingerprint::compute(&root);
            let snapshots = SnapshotStore::new(&root);
            let status = snapshots.status(
                &resolved.required_evidence,
                &current_fp,
                enforcement.stale_policy,
            )?;
            if format == "json" {
                print_envelope(
                    &format,
                    "evidence-status",
                    if status.success { "ok" } else { "failing" },
                    serde_json::to_value(&status)?,
                );
            } else {
                for check in &status.checks {
                    let mark = if check.stale {
                        "stale".bright_yellow().bold()
                    } else {
                        match check.state {
                            core::snapshot::FileState::Passed => "pass".bright_green().bold(),
                            core::snapshot::FileState::Failed => "fail".bright_red().bold(),
                            core::snapshot::FileState::Invalid => "invalid".bright_red().bold(),
                            core::snapshot::FileState::Missing => "missing".bright_black().bold(),
                        }
                    };
                    println!("  {}  {}", mark, check.name);
                }
                println!(
                    "overall: {}",
                    if status.success {
                        "success".bright_green().bold()
                    } else {
                        "failing".bright_red().bold()
                    }
                );
            }
            Ok(())
        }
    }
}

fn run_bundle_command(cli: BundleCli) -> Result<(), GatehouseError> {
    let root = project_root()?;
    let store = EntityStore::new(&root);
    let config = GatehouseConfig::load(&root)?;
    let locks = TaskLockManager::new(&root);
    let audit_ctx = AuditContext::new(&root);
    match cli.command {
        BundleCommand::Build { task, preset } => {
            let root_id = cluster::find_root(&store, &task)?;
            let root_task = store.get(EntityKind::Task, &root_id)?;
            let resolved = policy::resolve_for_task(&config, Some(&root_task), preset.as_deref())?;
            let _guard = locks.acquire(&root_id, "bundle", "agent", LOCK_WAIT)?;
            let bundle = cluster::build_bundle(
                &store,
                &root,
                &root_id,
                &resolved.preset,
                &resolved.blocking_validators,
            )?;
            cluster::write_bundle(&root, &root_id, &bundle)?;
            audit::audit_event(
                &audit_ctx,
                "bundle.build",
                serde_json::json!({ "taskId": root_id, "tasks": bundle.tasks.len() }),
            );
            println!("{}", serde_json::to_string_pretty(&bundle)?);
            Ok(())
        }
        BundleCommand::Show { task } => {
            let root_id = cluster::find_root(&store, &task)?;
            match cluster::read_bundle(&root, &root_id)? {
                Some(bundle) => println!("{}", serde_json::to_string_pretty(&bundle)?),
                None => println!("no bundle for root task '{}'", root_id),
            }
            Ok(())
        }
        BundleCommand::Approve { task, child } => {
            let root_id = cluster::find_root(&store, &task)?;
            let _guard = locks.acquire(&root_id, "bundle", "agent", LOCK_WAIT)?;
            let bundle = cluster::approve_child(&root, &root_id, &child)?;
            audit::audit_event(
                &audit_ctx,
                "bundle.approve",
                serde_json::json!({ "taskId": root_id, "child": child, "approved": bundle.approved }),
            );
            println!(
                "{} approved {} ({} aggregate)",
                "✓".bright_green().bold(),
                child.bright_cyan().bold(),
                if bundle.approved { "complete" } else { "incomplete" }
            );
            Ok(())
        }
    }
}

fn run_audit_command(cli: AuditCli) -> Result<(), GatehouseError> {
    let root = project_root()?;
    match cli.command {
        AuditCommand::Tail { limit } => {
            let events = audit::read_events(&paths::audit_log_path(&root));
            let start = events.len().saturating_sub(limit);
            for event in &events[start..] {
                println!("{}", serde_json::to_string(event)?);
            }
            Ok(())
        }
        AuditCommand::Verify {
            session,
            task,
            format,
        } => {
            let findings = verifier::detect_unlogged(&root, session.as_deref(), &task)?;
            if format == "json" {
                print_envelope(
                    &format,
                    "audit-verify",
                    if findings.is_empty() { "ok" } else { "tampered" },
                    serde_json::json!({ "findings": findings }),
                );
            } else if findings.is_empty() {
                println!("{} no unlogged changes", "✓".bright_green().bold());
            } else {
                for f in &findings {
                    println!(
                        "{} {} {} ({})",
                        "✗".bright_red().bold(),
                        f.entity_id.bright_cyan(),
                        f.file_path,
                        f.reason
                    );
                }
            }
            Ok(())
        }
    }
}

/// Move sessions stuck in `recovery` past the idle window on to `closing`.
/// Nothing here runs in the background; an agent (or cron) invokes it.
fn run_sweep() -> Result<(), GatehouseError> {
    let root = project_root()?;
    let store = EntityStore::new(&root);
    let audit_ctx = AuditContext::new(&root);
    let now = chrono::Utc::now().timestamp();
    let mut moved = 0usize;
    for id in store.list(EntityKind::Session)? {
        let mut session = store.get(EntityKind::Session, &id)?;
        let Some(auto) =
            guards::check_auto_recovery(&session, now, guards::AUTO_RECOVERY_WINDOW_SECS)
        else {
            continue;
        };
        store.record_transition(&mut session, &auto.to, &auto.reason, "gatehouse", auto.auto)?;
        audit::audit_event(
            &audit_ctx,
            "session.auto",
            serde_json::json!({ "sessionId": id, "to": auto.to, "reason": auto.reason }),
        );
        println!(
            "{} session {} {} closing ({})",
            "✓".bright_green().bold(),
            id.bright_cyan().bold(),
            "→".bright_black(),
            auto.reason
        );
        moved += 1;
    }
    if moved == 0 {
        println!("no sessions eligible");
    }
    Ok(())
}

fn run_status() -> Result<(), GatehouseError> {
    let root = project_root()?;
    let store = EntityStore::new(&root);
    for kind in [EntityKind::Task, EntityKind::Qa, EntityKind::Session] {
        let ids = store.list(kind)?;
        println!("{} ({})", kind.as_str().bright_white().bold(), ids.len());
        for id in ids {
            let entity = store.get(kind, &id)?;
            println!("  {}  {}", id.bright_cyan(), entity.state.bright_black());
        }
    }
    Ok(())
}

pub fn run() -> Result<(), GatehouseError> {
    let cli = Cli::parse();
    match cli.command {
        Command::Version => {
            println!("v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Init { dir } => init_project(dir),
        Command::Task(c) => run_entity_command(EntityKind::Task, c),
        Command::Qa(c) => run_entity_command(EntityKind::Qa, c),
        Command::Session(c) => run_entity_command(EntityKind::Session, c),
        Command::Round(c) => run_round_command(c),
        Command::Evidence(c) => run_evidence_command(c),
        Command::Bundle(c) => run_bundle_command(c),
        Command::Lock(c) => {
            let root = project_root()?;
            let locks = TaskLockManager::new(&root);
            match c.command {
                LockCommand::Status { task, purpose } => {
                    let status = locks.status(&task, &purpose)?;
                    println!("{}", serde_json::to_string_pretty(&status)?);
                    Ok(())
                }
            }
        }
        Command::Audit(c) => run_audit_command(c),
        Command::Sweep => run_sweep(),
        Command::Status => run_status(),
    }
}
