//! Reconciliation engine: page aggregation, snapshot merging and temp-ID
//! promotion after a batch commit.
//!
//! Everything that can fail (network, decoding) happens before a store is
//! touched, so a failed pull leaves the stores exactly as they were.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::backlog::{BatchResult, CommandKind, CommandStatus};
use crate::error::{Result, SyncError};
use crate::store::{Entity, EntityStore, ProjectStore, TaskStore};
use crate::transport::Transport;

/// Rejection reason for a create the commit response neither acknowledged nor mapped.
pub const MISSING_MAPPING_REASON: &str = "no status or temp_id mapping in commit response";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub merged: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitStats {
    pub promoted: usize,
    pub rejected: usize,
    pub tasks: MergeStats,
    pub projects: MergeStats,
}

/// Follow `next_cursor` until the listing is exhausted and return every item
/// in server order.
///
/// A bare JSON array is accepted as a complete, unpaginated listing. Any failing
/// page aborts the whole collection; nothing fetched so far is returned.
pub async fn collect_pages(
    transport: &dyn Transport,
    path: &str,
    query: &[(&str, &str)],
    page_size: u32,
) -> Result<Vec<Value>> {
    let limit = page_size.to_string();
    let mut items = Vec::new();
    let mut cursor: Option<String> = None;
    let mut seen_cursors = HashSet::new();
    let mut pages = 0usize;

    loop {
        let mut params: Vec<(&str, &str)> = query.to_vec();
        params.push(("limit", &limit));
        if let Some(cursor) = cursor.as_deref() {
            params.push(("cursor", cursor));
        }

        let page = transport.get(path, &params).await?;
        pages += 1;

        let (results, next_cursor) = match page {
            Value::Array(results) if pages == 1 => {
                debug!("[Reconcile] {} returned a direct listing of {}", path, results.len());
                return Ok(results);
            }
            Value::Object(mut body) => {
                let results = match body.remove("results").or_else(|| body.remove("items")) {
                    Some(Value::Array(results)) => results,
                    Some(Value::Null) | None => Vec::new(),
                    Some(other) => {
                        return Err(SyncError::Decode(format!(
                            "{}: page results is not an array: {}",
                            path, other
                        )));
                    }
                };
                let next_cursor = match body.remove("next_cursor") {
                    Some(Value::String(c)) if !c.is_empty() => Some(c),
                    _ => None,
                };
                (results, next_cursor)
            }
            other => {
                return Err(SyncError::Decode(format!(
                    "{}: unexpected page shape: {}",
                    path, other
                )));
            }
        };

        items.extend(results);

        match next_cursor {
            None => break,
            Some(next) => {
                if !seen_cursors.insert(next.clone()) {
                    return Err(SyncError::Decode(format!(
                        "{}: server repeated cursor {}",
                        path, next
                    )));
                }
                cursor = Some(next);
            }
        }
    }

    debug!(
        "[Reconcile] Collected {} items from {} in {} pages",
        items.len(),
        path,
        pages
    );
    Ok(items)
}

/// Decode raw items as one logical collection.
pub fn decode_listing<T: DeserializeOwned>(items: Vec<Value>) -> Result<Vec<T>> {
    Ok(serde_json::from_value(Value::Array(items))?)
}

pub async fn fetch_listing<T: DeserializeOwned>(
    transport: &dyn Transport,
    path: &str,
    query: &[(&str, &str)],
    page_size: u32,
) -> Result<Vec<T>> {
    let items = collect_pages(transport, path, query, page_size).await?;
    decode_listing(items)
}

/// Merge a complete listing: whole-entity replace for known IDs, add for the rest.
/// With `prune`, persisted entries absent from the listing are dropped.
pub fn merge_listing<T: Entity>(store: &mut EntityStore<T>, entities: Vec<T>, prune: bool) -> MergeStats {
    let keep: Option<HashSet<String>> =
        prune.then(|| entities.iter().map(|e| e.id().to_string()).collect());
    let merged = store.merge(entities);
    let removed = keep.map(|keep| store.prune_except(&keep)).unwrap_or(0);
    MergeStats { merged, removed }
}

/// Merge a batch snapshot. Entries flagged deleted are removed instead of stored.
pub fn merge_batch<T: Entity>(store: &mut EntityStore<T>, entities: Vec<T>, prune: bool) -> MergeStats {
    let mut stats = MergeStats::default();
    let keep: Option<HashSet<String>> = prune.then(|| {
        entities
            .iter()
            .filter(|e| !e.is_deleted())
            .map(|e| e.id().to_string())
            .collect()
    });

    for entity in entities {
        if entity.is_deleted() {
            if store.remove(entity.id()).is_some() {
                stats.removed += 1;
            }
        } else {
            store.put(entity);
            stats.merged += 1;
        }
    }
    if let Some(keep) = keep {
        stats.removed += store.prune_except(&keep);
    }
    stats
}

/// Fold a commit response into the stores.
///
/// Acknowledged creations are promoted from their temporary key to the real ID
/// and references to the temporary ID are rewritten. Rejected creations stay
/// under their temporary key and are marked with the server's reason; a create
/// the response neither acknowledged nor mapped is marked the same way. The
/// returned snapshots are merged last, so server state wins over local copies.
pub fn apply_batch(tasks: &mut TaskStore, projects: &mut ProjectStore, batch: &BatchResult) -> CommitStats {
    let mut stats = CommitStats::default();
    let mut promoted: HashMap<&str, &str> = HashMap::new();

    for outcome in &batch.outcomes {
        let Some(temp_id) = outcome.temp_id.as_deref() else {
            if let CommandStatus::Failed { message, .. } = &outcome.status {
                warn!(
                    "[Reconcile] {} {} rejected, local copy may be stale: {}",
                    outcome.kind.as_str(),
                    outcome.uuid,
                    message
                );
            }
            continue;
        };

        match (&outcome.status, batch.temp_id_mapping.get(temp_id)) {
            (CommandStatus::Failed { message, .. }, _) => {
                match outcome.kind {
                    CommandKind::ProjectAdd => projects.mark_rejected(temp_id, message.clone()),
                    _ => tasks.mark_rejected(temp_id, message.clone()),
                }
                stats.rejected += 1;
            }
            (_, Some(real_id)) => {
                let done = match outcome.kind {
                    CommandKind::ProjectAdd => projects.promote(temp_id, real_id),
                    _ => tasks.promote(temp_id, real_id),
                };
                if done {
                    promoted.insert(temp_id, real_id.as_str());
                    stats.promoted += 1;
                }
            }
            (_, None) => {
                // The backlog is already cleared, so nothing will resend this create
                warn!(
                    "[Reconcile] No status or ID mapping for {} (temp_id {}), marking it rejected",
                    outcome.kind.as_str(),
                    temp_id
                );
                let reason = MISSING_MAPPING_REASON.to_string();
                match outcome.kind {
                    CommandKind::ProjectAdd => projects.mark_rejected(temp_id, reason),
                    _ => tasks.mark_rejected(temp_id, reason),
                }
                stats.rejected += 1;
            }
        }
    }

    if !promoted.is_empty() {
        rewrite_references(tasks, projects, &promoted);
    }

    stats.tasks = merge_batch(tasks, batch.tasks.clone(), false);
    stats.projects = merge_batch(projects, batch.projects.clone(), false);
    stats
}

fn rewrite_references(tasks: &mut TaskStore, projects: &mut ProjectStore, promoted: &HashMap<&str, &str>) {
    let rewrite = |id: &mut String| {
        if let Some(real) = promoted.get(id.as_str()) {
            *id = real.to_string();
        }
    };

    for task in tasks.values_mut() {
        rewrite(&mut task.project_id);
        if let Some(parent) = task.parent_id.as_mut() {
            rewrite(parent);
        }
    }
    for project in projects.values_mut() {
        if let Some(parent) = project.parent_id.as_mut() {
            rewrite(parent);
        }
    }
}

/// Store a locally created entity under its temporary ID.
pub(crate) fn insert_pending<T: Entity>(store: &mut EntityStore<T>, mut entity: T, temp_id: String) -> Result<()> {
    store.check_conflict(&entity)?;
    entity.set_temp_id(Some(temp_id));
    store.put(entity);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backlog::CommandOutcome;
    use crate::models::{Project, Task};
    use async_trait::async_trait;
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned pages in order and records the query of every request.
    struct ScriptedPages {
        pages: Mutex<VecDeque<std::result::Result<Value, u16>>>,
        queries: Mutex<Vec<Vec<(String, String)>>>,
    }

    impl ScriptedPages {
        fn new(pages: Vec<std::result::Result<Value, u16>>) -> Self {
            Self {
                pages: Mutex::new(pages.into()),
                queries: Mutex::new(Vec::new()),
            }
        }

        fn queries(&self) -> Vec<Vec<(String, String)>> {
            self.queries.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedPages {
        async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Value> {
            self.queries.lock().unwrap().push(
                query
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            );
            match self.pages.lock().unwrap().pop_front() {
                Some(Ok(page)) => Ok(page),
                Some(Err(status)) => Err(SyncError::Http {
                    status,
                    url: path.to_string(),
                    body: String::new(),
                }),
                None => panic!("no more pages scripted"),
            }
        }

        async fn post(&self, _: &str, _: Option<&Value>) -> Result<Value> {
            unreachable!()
        }

        async fn post_form(&self, _: &str, _: &[(&str, &str)]) -> Result<Value> {
            unreachable!()
        }

        async fn delete(&self, _: &str) -> Result<()> {
            unreachable!()
        }
    }

    fn cursor_of(query: &[(String, String)]) -> Option<&str> {
        query
            .iter()
            .find(|(k, _)| k == "cursor")
            .map(|(_, v)| v.as_str())
    }

    fn paged(items: &[Value], page_size: usize) -> Vec<std::result::Result<Value, u16>> {
        if items.is_empty() {
            return vec![Ok(json!({"results": [], "next_cursor": null}))];
        }
        let chunks: Vec<_> = items.chunks(page_size).collect();
        chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                let next = if i + 1 < chunks.len() {
                    json!(format!("cursor-{}", i + 1))
                } else {
                    Value::Null
                };
                Ok(json!({"results": chunk, "next_cursor": next}))
            })
            .collect()
    }

    proptest! {
        #[test]
        fn pagination_is_complete_and_ordered(n in 0usize..40, page_size in 1usize..12) {
            let items: Vec<Value> = (0..n).map(|i| json!({"id": i.to_string(), "content": format!("t{}", i)})).collect();
            let pages = paged(&items, page_size);
            let expected_requests = pages.len();
            let transport = ScriptedPages::new(pages);

            let runtime = tokio::runtime::Runtime::new().unwrap();
            let collected = runtime
                .block_on(collect_pages(&transport, "/tasks", &[], page_size as u32))
                .unwrap();

            prop_assert_eq!(&collected, &items);
            let queries = transport.queries();
            prop_assert_eq!(queries.len(), expected_requests);
            prop_assert_eq!(cursor_of(&queries[0]), None);
            for (i, query) in queries.iter().enumerate().skip(1) {
                let expected = format!("cursor-{}", i);
                prop_assert_eq!(cursor_of(query), Some(expected.as_str()));
            }
        }
    }

    #[tokio::test]
    async fn test_empty_first_page_makes_one_request() {
        let transport = ScriptedPages::new(vec![Ok(json!({"results": [], "next_cursor": null}))]);
        let items = collect_pages(&transport, "/tasks", &[], 200).await.unwrap();
        assert!(items.is_empty());
        let queries = transport.queries();
        assert_eq!(queries.len(), 1);
        assert!(queries[0].contains(&("limit".to_string(), "200".to_string())));
    }

    #[tokio::test]
    async fn test_empty_string_cursor_terminates() {
        let transport = ScriptedPages::new(vec![Ok(json!({"results": [{"id": "1"}], "next_cursor": ""}))]);
        let items = collect_pages(&transport, "/tasks", &[], 10).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(transport.queries().len(), 1);
    }

    #[tokio::test]
    async fn test_direct_array_listing() {
        let transport = ScriptedPages::new(vec![Ok(json!([{"id": "1"}, {"id": "2"}]))]);
        let items = collect_pages(&transport, "/projects", &[], 10).await.unwrap();
        assert_eq!(items.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_page_aborts_collection() {
        let transport = ScriptedPages::new(vec![
            Ok(json!({"results": [{"id": "1"}], "next_cursor": "c1"})),
            Err(500),
        ]);
        let err = collect_pages(&transport, "/tasks", &[], 1).await.unwrap_err();
        assert!(matches!(err, SyncError::Http { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_repeated_cursor_is_an_error() {
        let transport = ScriptedPages::new(vec![
            Ok(json!({"results": [], "next_cursor": "same"})),
            Ok(json!({"results": [], "next_cursor": "same"})),
        ]);
        let err = collect_pages(&transport, "/tasks", &[], 1).await.unwrap_err();
        assert!(matches!(err, SyncError::Decode(_)));
    }

    #[tokio::test]
    async fn test_extra_query_is_forwarded() {
        let transport = ScriptedPages::new(vec![Ok(json!({"results": []}))]);
        collect_pages(&transport, "/comments", &[("task_id", "7")], 50)
            .await
            .unwrap();
        assert!(transport.queries()[0].contains(&("task_id".to_string(), "7".to_string())));
    }

    #[test]
    fn test_decode_failure_is_reported() {
        let err = decode_listing::<Task>(vec![json!({"id": "1"})]).unwrap_err();
        assert!(matches!(err, SyncError::Decode(_)));
    }

    fn task(id: &str) -> Task {
        let mut t = Task::new(format!("task {}", id));
        t.id = id.to_string();
        t
    }

    #[test]
    fn test_merge_listing_without_prune_accumulates() {
        let mut store = TaskStore::new();
        merge_listing(&mut store, vec![task("1"), task("2")], false);
        let stats = merge_listing(&mut store, vec![task("2")], false);
        assert_eq!(stats, MergeStats { merged: 1, removed: 0 });
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_merge_listing_with_prune_drops_stale() {
        let mut store = TaskStore::new();
        merge_listing(&mut store, vec![task("1"), task("2")], false);
        let stats = merge_listing(&mut store, vec![task("2")], true);
        assert_eq!(stats, MergeStats { merged: 1, removed: 1 });
        assert!(!store.contains("1"));
    }

    #[test]
    fn test_merge_batch_removes_deleted() {
        let mut store = TaskStore::new();
        merge_listing(&mut store, vec![task("1"), task("2")], false);
        let mut gone = task("1");
        gone.is_deleted = true;
        let stats = merge_batch(&mut store, vec![gone, task("3")], false);
        assert_eq!(stats, MergeStats { merged: 1, removed: 1 });
        assert!(!store.contains("1"));
        assert!(store.contains("3"));
    }

    fn outcome(kind: CommandKind, temp_id: &str, status: CommandStatus) -> CommandOutcome {
        CommandOutcome {
            uuid: format!("uuid-{}", temp_id),
            kind,
            temp_id: Some(temp_id.to_string()),
            status,
        }
    }

    #[test]
    fn test_apply_batch_promotes_and_rewrites_references() {
        let mut tasks = TaskStore::new();
        let mut projects = ProjectStore::new();
        insert_pending(&mut projects, Project::new("Home"), "tmp-p".into()).unwrap();
        insert_pending(&mut tasks, Task::new("Sweep").with_project("tmp-p"), "tmp-t".into()).unwrap();

        let batch = BatchResult {
            outcomes: vec![
                outcome(CommandKind::ProjectAdd, "tmp-p", CommandStatus::Ok),
                outcome(CommandKind::ItemAdd, "tmp-t", CommandStatus::Ok),
            ],
            temp_id_mapping: [("tmp-p".to_string(), "100".to_string()), ("tmp-t".to_string(), "200".to_string())]
                .into_iter()
                .collect(),
            ..BatchResult::default()
        };

        let stats = apply_batch(&mut tasks, &mut projects, &batch);

        assert_eq!(stats.promoted, 2);
        assert!(tasks.get("tmp-t").is_none());
        let promoted = tasks.get("200").unwrap();
        assert_eq!(promoted.project_id, "100");
        assert!(promoted.is_persisted());
        assert_eq!(projects.get("100").unwrap().name, "Home");
        assert_eq!(tasks.resolve_temp_id("tmp-t"), Some("200"));
    }

    #[test]
    fn test_apply_batch_marks_rejected_creations() {
        let mut tasks = TaskStore::new();
        let mut projects = ProjectStore::new();
        insert_pending(&mut tasks, Task::new("Bad"), "tmp-t".into()).unwrap();

        let batch = BatchResult {
            outcomes: vec![outcome(
                CommandKind::ItemAdd,
                "tmp-t",
                CommandStatus::Failed {
                    code: Some(20),
                    message: "Invalid project".into(),
                },
            )],
            ..BatchResult::default()
        };

        let stats = apply_batch(&mut tasks, &mut projects, &batch);

        assert_eq!(stats.rejected, 1);
        assert!(tasks.get("tmp-t").unwrap().is_pending());
        assert_eq!(tasks.rejection("tmp-t"), Some("Invalid project"));
    }

    #[test]
    fn test_unacknowledged_creations_are_marked_rejected() {
        let mut tasks = TaskStore::new();
        let mut projects = ProjectStore::new();
        insert_pending(&mut tasks, Task::new("lost"), "tmp-x".into()).unwrap();
        insert_pending(&mut projects, Project::new("unmapped"), "tmp-p".into()).unwrap();

        let batch = BatchResult {
            outcomes: vec![
                outcome(CommandKind::ItemAdd, "tmp-x", CommandStatus::Missing),
                outcome(CommandKind::ProjectAdd, "tmp-p", CommandStatus::Ok),
            ],
            ..BatchResult::default()
        };

        let stats = apply_batch(&mut tasks, &mut projects, &batch);

        assert_eq!(stats.rejected, 2);
        assert_eq!(stats.promoted, 0);
        assert_eq!(tasks.rejection("tmp-x"), Some(MISSING_MAPPING_REASON));
        assert_eq!(projects.rejection("tmp-p"), Some(MISSING_MAPPING_REASON));
        let unresolved = tasks.unresolved();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].rejection.as_deref(), Some(MISSING_MAPPING_REASON));
    }

    #[test]
    fn test_apply_batch_snapshot_wins_over_local_copy() {
        let mut tasks = TaskStore::new();
        let mut projects = ProjectStore::new();
        insert_pending(&mut tasks, Task::new("local"), "tmp-t".into()).unwrap();

        let mut server = task("9");
        server.content = "server".into();
        let batch = BatchResult {
            outcomes: vec![outcome(CommandKind::ItemAdd, "tmp-t", CommandStatus::Ok)],
            temp_id_mapping: [("tmp-t".to_string(), "9".to_string())].into_iter().collect(),
            tasks: vec![server],
            ..BatchResult::default()
        };

        apply_batch(&mut tasks, &mut projects, &batch);

        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks.get("9").unwrap().content, "server");
    }

    #[test]
    fn test_insert_pending_conflict() {
        let mut tasks = TaskStore::new();
        tasks.merge(vec![task("42")]);
        let err = insert_pending(&mut tasks, task("42"), "tmp".into()).unwrap_err();
        assert!(err.is_conflict());
    }
}
