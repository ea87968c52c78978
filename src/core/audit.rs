//! Append-only structured audit log.
//!
//! One JSON record per line, written to up to three sinks (project-wide,
//! session-scoped, invocation-scoped), de-duplicated when sinks resolve to
//! the same path. Logging is fail-open: a sink failure never blocks the
//! operation being audited. All context is carried in an explicit
//! `AuditContext` value — there is no ambient global to consult.

use serde_json::Value as JsonValue;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::core::paths;
use crate::core::time;

#[derive(Debug, Clone)]
pub struct AuditContext {
    pub project_root: PathBuf,
    pub invocation_id: String,
    pub session_id: Option<String>,
    /// Category globs (`guard.*`, `subprocess.*`, ...); an event whose dotted
    /// name matches none of them is dropped before any sink write.
    pub categories: Vec<String>,
    /// Extra sinks beyond the project log.
    pub session_sink: Option<PathBuf>,
    pub invocation_sink: Option<PathBuf>,
}

impl AuditContext {
    pub fn new(project_root: &Path) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            invocation_id: time::new_event_id(),
            session_id: None,
            categories: vec!["*".to_string()],
            session_sink: None,
            invocation_sink: None,
        }
    }

    pub fn with_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self.session_sink = Some(
            paths::logs_dir(&self.project_root)
                .join("sessions")
                .join(format!("{}.audit.jsonl", session_id)),
        );
        self
    }

    pub fn with_categories(mut self, categories: Vec<String>) -> Self {
        self.categories = categories;
        self
    }

    fn category_enabled(&self, event: &str) -> bool {
        self.categories.iter().any(|pat| {
            pat == "*"
                || pat
                    .strip_suffix(".*")
                    .map(|prefix| {
                        event == prefix || event.starts_with(&format!("{}.", prefix))
                    })
                    .unwrap_or(pat == event)
        })
    }

    fn sinks(&self) -> Vec<PathBuf> {
        let mut sinks = vec![paths::audit_log_path(&self.project_root)];
        if let Some(s) = &self.session_sink {
            sinks.push(s.clone());
        }
        if let Some(s) = &self.invocation_sink {
            sinks.push(s.clone());
        }
        sinks.sort();
        sinks.dedup();
        sinks
    }
}

/// Append one audit event. Never fails: sink errors are swallowed so
/// observability can never become a reliability hazard.
pub fn audit_event(ctx: &AuditContext, event: &str, fields: JsonValue) {
    if !ctx.category_enabled(event) {
        return;
    }

    let mut record = serde_json::json!({
        "ts": time::now_iso(),
        "event": event,
        "pid": std::process::id(),
        "invocationId": ctx.invocation_id,
        "sessionId": ctx.session_id,
        "projectRoot": ctx.project_root.to_string_lossy(),
    });
    if let (Some(obj), Some(extra)) = (record.as_object_mut(), fields.as_object()) {
        for (k, v) in extra {
            obj.insert(k.clone(), v.clone());
        }
    }

    let Ok(line) = serde_json::to_string(&record) else {
        return;
    };
    for sink in ctx.sinks() {
        let _ = append_line(&sink, &line);
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(f, "{}", line)
}

/// Read every parseable record from a JSONL sink. Unparseable lines are
/// skipped — a reader racing an appender sees at worst one torn tail line.
pub fn read_events(path: &Path) -> Vec<JsonValue> {
    let Ok(file) = std::fs::File::open(path) else {
        return Vec::new();
    };
    BufReader::new(file)
        .lines()
        .map_while(Result::ok)
        .filter_map(|line| serde_json::from_str(&line).ok())
        .collect()
}
