//! Cluster selection and bundle approvals for parent/child task groups.
//!
//! Tasks declare a parent via `metadata.parent`. The root of that ancestry is
//! the bundle root; its current round carries `bundle-approved.json`, the
//! aggregate approval record covering the root and every child. A child's
//! "approved" flag is only meaningful inside the root's bundle — it is never
//! stored redundantly on the child.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use crate::core::entity::{write_atomic, Entity, EntityKind, EntityStore};
use crate::core::error::GatehouseError;
use crate::core::rounds::{RoundStore, BUNDLE_FILE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// All tasks sharing this task's root.
    Bundle,
    /// Direct ancestry only: this task up to its root.
    Hierarchy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    pub root_task_id: String,
    pub member_task_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BundleTask {
    pub task_id: String,
    pub approved: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BundleSummary {
    pub approved: bool,
    pub preset: String,
    pub tasks: Vec<BundleTask>,
    #[serde(default)]
    pub validators: Vec<String>,
    #[serde(default)]
    pub missing: Vec<String>,
}

impl BundleSummary {
    pub fn approval_for(&self, task_id: &str) -> Option<bool> {
        self.tasks
            .iter()
            .find(|t| t.task_id == task_id)
            .map(|t| t.approved)
    }
}

/// Walk `metadata.parent` links to the root of a task's ancestry. A cycle or
/// a dangling parent reference is a validation error, not an infinite loop.
pub fn find_root(store: &EntityStore, task_id: &str) -> Result<String, GatehouseError> {
    let mut current = task_id.to_string();
    let mut seen = BTreeSet::new();
    loop {
        if !seen.insert(current.clone()) {
            return Err(GatehouseError::ValidationError(format!(
                "parent cycle detected at task '{}'",
                current
            )));
        }
        let entity = store.get(EntityKind::Task, &current)?;
        match entity.meta_str("parent") {
            Some(parent) => current = parent.to_string(),
            None => return Ok(current),
        }
    }
}

/// Resolve the cluster a task belongs to.
pub fn select_cluster(
    store: &EntityStore,
    task_id: &str,
    scope: Scope,
) -> Result<Cluster, GatehouseError> {
    let root = find_root(store, task_id)?;

    let member_task_ids = match scope {
        Scope::Hierarchy => {
            let mut chain = vec![task_id.to_string()];
            let mut current = task_id.to_string();
            while let Some(parent) = store
                .get(EntityKind::Task, &current)?
                .meta_str("parent")
                .map(|s| s.to_string())
            {
                chain.push(parent.clone());
                current = parent;
            }
            chain
        }
        Scope::Bundle => {
            let mut members = Vec::new();
            for id in store.list(EntityKind::Task)? {
                if find_root(store, &id)? == root {
                    members.push(id);
                }
            }
            members
        }
    };

    Ok(Cluster {
        root_task_id: root,
        member_task_ids,
    })
}

/// Read the bundle record from the root task's current round. `Ok(None)` when
/// the root has no rounds or no bundle file yet.
pub fn read_bundle(
    project_root: &Path,
    root_task_id: &str,
) -> Result<Option<BundleSummary>, GatehouseError> {
    let rounds = RoundStore::new(project_root);
    let Some(round) = rounds.current_round(root_task_id)? else {
        return Ok(None);
    };
    let path = rounds.round_dir(root_task_id, round)?.join(BUNDLE_FILE);
    match fs::read_to_string(&path) {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(GatehouseError::IoError(e)),
    }
}

/// Write the bundle record into the root task's current round. Must be
/// called inside the root's task lock.
pub fn write_bundle(
    project_root: &Path,
    root_task_id: &str,
    bundle: &BundleSummary,
) -> Result<(), GatehouseError> {
    let rounds = RoundStore::new(project_root);
    let round = rounds.current_round(root_task_id)?.ok_or_else(|| {
        GatehouseError::NotFound(format!(
            "root task '{}' has no evidence round to carry a bundle; run `gatehouse round ensure` first",
            root_task_id
        ))
    })?;
    let path = rounds.round_dir(root_task_id, round)?.join(BUNDLE_FILE);
    write_atomic(&path, &serde_json::to_vec_pretty(bundle)?)
}

/// Build (or rebuild) a bundle covering every member of the root's cluster,
/// carrying forward approvals already granted in the existing record.
pub fn build_bundle(
    store: &EntityStore,
    project_root: &Path,
    root_task_id: &str,
    preset: &str,
    validators: &[String],
) -> Result<BundleSummary, GatehouseError> {
    let cluster = select_cluster(store, root_task_id, Scope::Bundle)?;
    let existing = read_bundle(project_root, root_task_id)?;
    let tasks: Vec<BundleTask> = cluster
        .member_task_ids
        .iter()
        .map(|id| BundleTask {
            task_id: id.clone(),
            approved: existing
                .as_ref()
                .and_then(|b| b.approval_for(id))
                .unwrap_or(false),
        })
        .collect();
    let missing: Vec<String> = tasks
        .iter()
        .filter(|t| !t.approved)
        .map(|t| t.task_id.clone())
        .collect();
    Ok(BundleSummary {
        approved: missing.is_empty(),
        preset: preset.to_string(),
        tasks,
        validators: validators.to_vec(),
        missing,
    })
}

/// Mark one child approved in the root's bundle and recompute the aggregate.
pub fn approve_child(
    project_root: &Path,
    root_task_id: &str,
    child_task_id: &str,
) -> Result<BundleSummary, GatehouseError> {
    let mut bundle = read_bundle(project_root, root_task_id)?.ok_or_else(|| {
        GatehouseError::NotFound(format!(
            "root task '{}' has no bundle record; build one before approving children",
            root_task_id
        ))
    })?;
    let entry = bundle
        .tasks
        .iter_mut()
        .find(|t| t.task_id == child_task_id)
        .ok_or_else(|| {
            GatehouseError::ValidationError(format!(
                "task '{}' is not a member of root '{}''s bundle",
                child_task_id, root_task_id
            ))
        })?;
    entry.approved = true;
    bundle.missing = bundle
        .tasks
        .iter()
        .filter(|t| !t.approved)
        .map(|t| t.task_id.clone())
        .collect();
    bundle.approved = bundle.missing.is_empty();
    write_bundle(project_root, root_task_id, &bundle)?;
    Ok(bundle)
}

/// The gating question for a child's QA promotion: does the root's current
/// bundle list this child as approved? `None` means no bundle or no entry.
pub fn child_approval(
    store: &EntityStore,
    project_root: &Path,
    child_task_id: &str,
) -> Result<(String, Option<bool>), GatehouseError> {
    let root = find_root(store, child_task_id)?;
    let approval = read_bundle(project_root, &root)?.and_then(|b| b.approval_for(child_task_id));
    Ok((root, approval))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, EntityStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = EntityStore::new(tmp.path());
        (tmp, store)
    }

    fn task(store: &EntityStore, id: &str, parent: Option<&str>) {
        let mut t = Entity::new(id, EntityKind::Task, "wip");
        if let Some(p) = parent {
            t.metadata.insert("parent".into(), serde_json::json!(p));
        }
        store.save(&t).unwrap();
    }

    #[test]
    fn test_find_root_walks_chain() {
        let (_tmp, store) = setup();
        task(&store, "root", None);
        task(&store, "mid", Some("root"));
        task(&store, "leaf", Some("mid"));
        assert_eq!(find_root(&store, "leaf").unwrap(), "root");
        assert_eq!(find_root(&store, "root").unwrap(), "root");
    }

    #[test]
    fn test_find_root_rejects_cycles() {
        let (_tmp, store) = setup();
        task(&store, "a", Some("b"));
        task(&store, "b", Some("a"));
        assert!(find_root(&store, "a").is_err());
    }

    #[test]
    fn test_select_cluster_scopes() {
        let (_tmp, store) = setup();
        task(&store, "root", None);
        task(&store, "child-1", Some("root"));
        task(&store, "child-2", Some("root"));
        task(&store, "other", None);

        let bundle = select_cluster(&store, "child-1", Scope::Bundle).unwrap();
        assert_eq!(bundle.root_task_id, "root");
        assert_eq!(bundle.member_task_ids, vec!["child-1", "child-2", "root"]);

        let hierarchy = select_cluster(&store, "child-1", Scope::Hierarchy).unwrap();
        assert_eq!(hierarchy.member_task_ids, vec!["child-1", "root"]);
    }

    #[test]
    fn test_bundle_build_approve_cycle() {
        let (tmp, store) = setup();
        task(&store, "root", None);
        task(&store, "child-1", Some("root"));

        let rounds = RoundStore::new(tmp.path());
        rounds.ensure_round("root").unwrap();

        let bundle = build_bundle(&store, tmp.path(), "root", "default", &[]).unwrap();
        assert!(!bundle.approved);
        assert_eq!(bundle.missing.len(), 2);
        write_bundle(tmp.path(), "root", &bundle).unwrap();

        let bundle = approve_child(tmp.path(), "root", "child-1").unwrap();
        assert!(!bundle.approved);
        let bundle = approve_child(tmp.path(), "root", "root").unwrap();
        assert!(bundle.approved);
        assert!(bundle.missing.is_empty());

        let (root, approval) = child_approval(&store, tmp.path(), "child-1").unwrap();
        assert_eq!(root, "root");
        assert_eq!(approval, Some(true));
    }

    #[test]
    fn test_approving_non_member_fails() {
        let (tmp, store) = setup();
        task(&store, "root", None);
        RoundStore::new(tmp.path()).ensure_round("root").unwrap();
        let bundle = build_bundle(&store, tmp.path(), "root", "default", &[]).unwrap();
        write_bundle(tmp.path(), "root", &bundle).unwrap();
        assert!(approve_child(tmp.path(), "root", "stranger").is_err());
    }

    #[test]
    fn test_child_approval_absent_bundle() {
        let (tmp, store) = setup();
        task(&store, "root", None);
        task(&store, "child-1", Some("root"));
        let (_, approval) = child_approval(&store, tmp.path(), "child-1").unwrap();
        assert_eq!(approval, None);
    }
}
