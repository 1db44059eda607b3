//! In-memory entity stores.
//!
//! A store is an arena keyed by entity ID. Entities pending creation are keyed
//! by their temporary ID until reconciliation rewrites them to the real ID.

use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::models::{Project, Task};

/// Behaviour a store needs from the entities it holds.
pub trait Entity: Clone + std::fmt::Debug {
    const KIND: &'static str;

    fn id(&self) -> &str;
    fn set_id(&mut self, id: String);
    fn temp_id(&self) -> Option<&str>;
    fn set_temp_id(&mut self, temp_id: Option<String>);
    /// Human name used by `get_by_name` (task content, project name)
    fn name(&self) -> &str;
    fn parent_id(&self) -> Option<&str>;
    fn is_deleted(&self) -> bool;

    /// Key the entity is stored under: real ID if assigned, else temporary ID.
    fn key(&self) -> &str {
        if self.id().is_empty() {
            self.temp_id().unwrap_or("")
        } else {
            self.id()
        }
    }
}

impl Entity for Task {
    const KIND: &'static str = "task";

    fn id(&self) -> &str {
        &self.id
    }
    fn set_id(&mut self, id: String) {
        self.id = id;
    }
    fn temp_id(&self) -> Option<&str> {
        self.temp_id.as_deref()
    }
    fn set_temp_id(&mut self, temp_id: Option<String>) {
        self.temp_id = temp_id;
    }
    fn name(&self) -> &str {
        &self.content
    }
    fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }
    fn is_deleted(&self) -> bool {
        self.is_deleted
    }
}

impl Entity for Project {
    const KIND: &'static str = "project";

    fn id(&self) -> &str {
        &self.id
    }
    fn set_id(&mut self, id: String) {
        self.id = id;
    }
    fn temp_id(&self) -> Option<&str> {
        self.temp_id.as_deref()
    }
    fn set_temp_id(&mut self, temp_id: Option<String>) {
        self.temp_id = temp_id;
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }
    fn is_deleted(&self) -> bool {
        self.is_deleted
    }
}

/// A creation the server has not (yet) acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct UnresolvedCreate {
    pub temp_id: String,
    /// `None` while still waiting for a commit, `Some(error)` once rejected
    pub rejection: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EntityStore<T: Entity> {
    entries: HashMap<String, T>,
    superseded: HashMap<String, String>,
    rejected: HashMap<String, String>,
}

pub type TaskStore = EntityStore<Task>;
pub type ProjectStore = EntityStore<Project>;

impl<T: Entity> Default for EntityStore<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            superseded: HashMap::new(),
            rejected: HashMap::new(),
        }
    }
}

impl<T: Entity> EntityStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up by real ID, or by temporary ID while the entity is pending.
    pub fn get(&self, key: &str) -> Option<&T> {
        self.entries.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: &str) -> Option<&mut T> {
        self.entries.get_mut(key)
    }

    /// Linear scan; order is unspecified.
    pub fn get_by_name(&self, name: &str) -> Vec<&T> {
        self.entries.values().filter(|e| e.name() == name).collect()
    }

    /// Snapshot of every entity at call time.
    pub fn all(&self) -> Vec<T> {
        self.entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Real ID a superseded temporary ID was rewritten to.
    pub fn resolve_temp_id(&self, temp_id: &str) -> Option<&str> {
        self.superseded.get(temp_id).map(String::as_str)
    }

    /// Rejects an entity whose non-empty ID is already present; the existing entry is untouched.
    pub fn check_conflict(&self, entity: &T) -> Result<()> {
        if !entity.id().is_empty() && self.entries.contains_key(entity.id()) {
            return Err(SyncError::Conflict {
                entity: T::KIND,
                id: entity.id().to_string(),
            });
        }
        Ok(())
    }

    pub fn insert(&mut self, entity: T) -> Result<()> {
        self.check_conflict(&entity)?;
        self.put(entity);
        Ok(())
    }

    /// Whole-entity replace or add under the entity's key.
    pub(crate) fn put(&mut self, entity: T) {
        let key = entity.key().to_string();
        self.entries.insert(key, entity);
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<T> {
        self.entries.remove(key)
    }

    pub(crate) fn values_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.entries.values_mut()
    }

    /// Merge a complete listing: same-ID entries are replaced, unseen IDs added.
    /// Returns the number of entities merged.
    pub fn merge(&mut self, entities: Vec<T>) -> usize {
        let count = entities.len();
        for entity in entities {
            self.put(entity);
        }
        count
    }

    /// Drop persisted entries whose IDs are not in `keep`. Pending creations survive.
    pub(crate) fn prune_except(&mut self, keep: &HashSet<String>) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|key, e| e.id().is_empty() || keep.contains(key));
        before - self.entries.len()
    }

    /// Rewrite a pending entity from `temp_id` to `real_id` and re-index it.
    pub(crate) fn promote(&mut self, temp_id: &str, real_id: &str) -> bool {
        let Some(mut entity) = self.entries.remove(temp_id) else {
            return false;
        };
        debug!(
            "[{}Store] Promoting {} -> {}",
            T::KIND,
            temp_id,
            real_id
        );
        entity.set_id(real_id.to_string());
        entity.set_temp_id(None);
        self.rejected.remove(temp_id);
        self.superseded
            .insert(temp_id.to_string(), real_id.to_string());
        self.entries.insert(real_id.to_string(), entity);
        true
    }

    pub(crate) fn mark_rejected(&mut self, temp_id: &str, reason: String) {
        if self.entries.contains_key(temp_id) {
            self.rejected.insert(temp_id.to_string(), reason);
        }
    }

    pub fn rejection(&self, temp_id: &str) -> Option<&str> {
        self.rejected.get(temp_id).map(String::as_str)
    }

    /// Every entity still addressable only by a temporary ID.
    pub fn unresolved(&self) -> Vec<UnresolvedCreate> {
        let mut out: Vec<UnresolvedCreate> = self
            .entries
            .values()
            .filter_map(|e| {
                let temp_id = e.temp_id().filter(|_| e.id().is_empty())?;
                Some(UnresolvedCreate {
                    temp_id: temp_id.to_string(),
                    rejection: self.rejected.get(temp_id).cloned(),
                })
            })
            .collect();
        out.sort_by(|a, b| a.temp_id.cmp(&b.temp_id));
        out
    }

    /// Direct children. An entity is never its own child.
    pub fn children(&self, id: &str) -> Vec<&T> {
        self.entries
            .values()
            .filter(|e| e.parent_id() == Some(id) && e.key() != id)
            .collect()
    }

    /// Depth-first subtree below `id`, excluding `id` itself. Each entity is
    /// visited once, so circular parent chains terminate.
    pub fn descendants(&self, id: &str) -> Vec<&T> {
        let mut visited: HashSet<&str> = HashSet::new();
        visited.insert(id);
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            for child in self.children(current) {
                if visited.insert(child.key()) {
                    stack.push(child.key());
                    out.push(child);
                }
            }
        }
        out
    }
}

impl TaskStore {
    pub fn by_project(&self, project_id: &str) -> Vec<&Task> {
        self.entries
            .values()
            .filter(|t| t.project_id == project_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, content: &str) -> Task {
        let mut t = Task::new(content);
        t.id = id.to_string();
        t
    }

    #[test]
    fn test_merge_overwrites_and_adds() {
        let mut store = TaskStore::new();
        store.merge(vec![task("1", "a"), task("2", "b")]);
        let merged = store.merge(vec![task("2", "b2"), task("3", "c")]);

        assert_eq!(merged, 2);
        assert_eq!(store.len(), 3);
        assert_eq!(store.get("2").unwrap().content, "b2");
        assert_eq!(store.get("1").unwrap().content, "a");
    }

    #[test]
    fn test_conflict_leaves_existing_entry_unchanged() {
        let mut store = TaskStore::new();
        store.merge(vec![task("42", "original")]);
        let before = store.get("42").cloned();

        let err = store.insert(task("42", "imposter")).unwrap_err();

        assert!(err.is_conflict());
        assert_eq!(store.get("42").cloned(), before);
    }

    #[test]
    fn test_get_by_name_returns_all_matches() {
        let mut store = TaskStore::new();
        store.merge(vec![task("1", "dup"), task("2", "dup"), task("3", "other")]);
        let mut ids: Vec<_> = store.get_by_name("dup").iter().map(|t| t.id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[test]
    fn test_all_is_a_snapshot() {
        let mut store = TaskStore::new();
        store.merge(vec![task("1", "a")]);
        let snapshot = store.all();
        store.merge(vec![task("2", "b")]);
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn test_promote_reindexes_under_real_id() {
        let mut store = TaskStore::new();
        let mut pending = Task::new("new");
        pending.temp_id = Some("tmp-1".into());
        store.insert(pending).unwrap();
        assert!(store.get("tmp-1").unwrap().is_pending());

        assert!(store.promote("tmp-1", "99"));

        assert!(store.get("tmp-1").is_none());
        let promoted = store.get("99").unwrap();
        assert_eq!(promoted.id, "99");
        assert!(promoted.temp_id.is_none());
        assert_eq!(store.resolve_temp_id("tmp-1"), Some("99"));
        assert!(store.unresolved().is_empty());
    }

    #[test]
    fn test_rejected_create_stays_unresolved() {
        let mut store = TaskStore::new();
        let mut pending = Task::new("new");
        pending.temp_id = Some("tmp-1".into());
        store.insert(pending).unwrap();

        store.mark_rejected("tmp-1", "INVALID_ARGUMENT".into());

        assert!(store.get("tmp-1").is_some());
        assert_eq!(
            store.unresolved(),
            vec![UnresolvedCreate {
                temp_id: "tmp-1".into(),
                rejection: Some("INVALID_ARGUMENT".into()),
            }]
        );
    }

    #[test]
    fn test_children_skip_self_reference() {
        let mut store = TaskStore::new();
        store.merge(vec![
            task("1", "root"),
            task("2", "child").with_parent("1"),
            task("3", "loop").with_parent("3"),
        ]);
        let children: Vec<_> = store.children("1").iter().map(|t| t.id.clone()).collect();
        assert_eq!(children, vec!["2"]);
        assert!(store.children("3").is_empty());
    }

    #[test]
    fn test_descendants_terminate_on_cycles() {
        let mut store = TaskStore::new();
        store.merge(vec![
            task("a", "a").with_parent("c"),
            task("b", "b").with_parent("a"),
            task("c", "c").with_parent("b"),
        ]);
        let mut ids: Vec<_> = store.descendants("a").iter().map(|t| t.id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn test_prune_keeps_pending() {
        let mut store = TaskStore::new();
        store.merge(vec![task("1", "a"), task("2", "b")]);
        let mut pending = Task::new("p");
        pending.temp_id = Some("tmp".into());
        store.put(pending);

        let keep: HashSet<String> = ["1".to_string()].into_iter().collect();
        assert_eq!(store.prune_except(&keep), 1);
        assert!(store.contains("1"));
        assert!(store.contains("tmp"));
        assert!(!store.contains("2"));
    }
}
