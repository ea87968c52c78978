//! Generic entity transition validator.
//!
//! Transition tables are configuration, not code: each entity kind declares
//! its states and legal successors, and a guard predicate may be registered
//! per `(kind, target-state)` pair. Guards are fail-closed — an error from a
//! guard blocks the transition just like an explicit denial. Guard outcomes
//! are an explicit value (`Allowed` / `Denied`), never an exception channel.

use std::collections::BTreeMap;
use std::path::Path;

use crate::core::entity::{Entity, EntityKind};
use crate::core::error::GatehouseError;
use crate::core::fingerprint::Fingerprint;
use crate::core::policy::{EnforcementPolicy, Policy};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardOutcome {
    Allowed,
    Denied(String),
}

impl GuardOutcome {
    pub fn denied(reason: impl Into<String>) -> Self {
        GuardOutcome::Denied(reason.into())
    }
}

/// The transition a guard is being asked about.
#[derive(Debug, Clone, Copy)]
pub struct TransitionRef<'a> {
    pub kind: EntityKind,
    pub from: &'a str,
    pub to: &'a str,
}

/// Everything a guard may consult. All context is explicit — guards never
/// reach for ambient global state.
pub struct GuardContext<'a> {
    pub project_root: &'a Path,
    pub entity: Option<&'a Entity>,
    pub session: Option<&'a Entity>,
    pub fingerprint: Option<&'a Fingerprint>,
    pub policy: Option<&'a Policy>,
    pub enforcement: &'a EnforcementPolicy,
    pub now_epoch: i64,
}

pub type GuardFn =
    Box<dyn Fn(&GuardContext, &TransitionRef) -> Result<GuardOutcome, GatehouseError> + Send + Sync>;

/// Declared successors per state for one entity kind.
#[derive(Debug, Clone, Default)]
pub struct TransitionTable {
    successors: BTreeMap<String, Vec<String>>,
}

impl TransitionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(mut self, from: &str, to: &str) -> Self {
        self.successors
            .entry(from.to_string())
            .or_default()
            .push(to.to_string());
        // Terminal states still belong to the state set.
        self.successors.entry(to.to_string()).or_default();
        self
    }

    pub fn is_state(&self, state: &str) -> bool {
        self.successors.contains_key(state)
    }

    pub fn allows(&self, from: &str, to: &str) -> bool {
        self.successors
            .get(from)
            .map(|succ| succ.iter().any(|s| s == to))
            .unwrap_or(false)
    }

    pub fn states(&self) -> impl Iterator<Item = &str> {
        self.successors.keys().map(|s| s.as_str())
    }

    pub fn successors_of(&self, from: &str) -> &[String] {
        self.successors
            .get(from)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

pub struct StateMachine {
    tables: BTreeMap<EntityKind, TransitionTable>,
    guards: BTreeMap<(EntityKind, String), GuardFn>,
}

impl StateMachine {
    pub fn new(tables: BTreeMap<EntityKind, TransitionTable>) -> Self {
        Self {
            tables,
            guards: BTreeMap::new(),
        }
    }

    /// The stock transition tables for task / QA / session entities.
    pub fn default_tables() -> BTreeMap<EntityKind, TransitionTable> {
        let mut tables = BTreeMap::new();
        tables.insert(
            EntityKind::Task,
            TransitionTable::new()
                .declare("pending", "wip")
                .declare("wip", "blocked")
                .declare("blocked", "wip")
                .declare("wip", "done")
                .declare("done", "wip")
                .declare("done", "archived"),
        );
        tables.insert(
            EntityKind::Qa,
            TransitionTable::new()
                .declare("pending", "in-review")
                .declare("in-review", "rejected")
                .declare("rejected", "in-review")
                .declare("in-review", "done"),
        );
        tables.insert(
            EntityKind::Session,
            TransitionTable::new()
                .declare("active", "closing")
                .declare("active", "recovery")
                .declare("closing", "validated")
                .declare("closing", "recovery")
                .declare("validated", "archived")
                .declare("recovery", "closing")
                .declare("recovery", "active"),
        );
        tables
    }

    pub fn register_guard(&mut self, kind: EntityKind, target: &str, guard: GuardFn) {
        self.guards.insert((kind, target.to_string()), guard);
    }

    pub fn table(&self, kind: EntityKind) -> Result<&TransitionTable, GatehouseError> {
        self.tables.get(&kind).ok_or_else(|| {
            GatehouseError::ConfigError(format!("no transition table configured for kind '{}'", kind))
        })
    }

    /// Validate a transition: the target must be a declared successor of the
    /// current state, and the registered guard (if any) must allow it.
    pub fn validate_transition(
        &self,
        kind: EntityKind,
        current: &str,
        target: &str,
        ctx: &GuardContext,
    ) -> Result<(), GatehouseError> {
        let table = self.table(kind)?;
        let entity_id = ctx.entity.map(|e| e.id.as_str()).unwrap_or("?");

        if !table.is_state(current) {
            return Err(GatehouseError::ValidationError(format!(
                "{} '{}' is in unconfigured state '{}'",
                kind, entity_id, current
            )));
        }
        if !table.allows(current, target) {
            return Err(GatehouseError::InvalidTransition {
                kind: kind.to_string(),
                entity_id: entity_id.to_string(),
                from: current.to_string(),
                to: target.to_string(),
            });
        }

        if let Some(guard) = self.guards.get(&(kind, target.to_string())) {
            let transition = TransitionRef {
                kind,
                from: current,
                to: target,
            };
            match guard(ctx, &transition)? {
                GuardOutcome::Allowed => {}
                GuardOutcome::Denied(reason) => {
                    return Err(GatehouseError::GuardDenied {
                        kind: kind.to_string(),
                        to: target.to_string(),
                        reason,
                    });
                }
            }
        }
        Ok(())
    }
}
