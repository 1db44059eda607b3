//! Task context: a small JSON document stored in a tagged comment.
//!
//! The comment body is `"[CONTEXT] {json}"`. A task has at most one
//! authoritative context comment; see [`select_context_comment`] for how
//! duplicates are resolved.

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::client::Client;
use crate::error::{Result, SyncError};
use crate::models::Comment;

pub const CONTEXT_PREFIX: &str = "[CONTEXT]";

pub type ContextDocument = Map<String, Value>;

pub fn is_context_comment(content: &str) -> bool {
    content.starts_with(CONTEXT_PREFIX)
}

pub fn encode(document: &ContextDocument) -> Result<String> {
    Ok(format!("{} {}", CONTEXT_PREFIX, serde_json::to_string(document)?))
}

/// Decode a comment body. Returns `Ok(None)` when the body is not a context comment.
pub fn decode(content: &str) -> Result<Option<ContextDocument>> {
    let Some(rest) = content.strip_prefix(CONTEXT_PREFIX) else {
        return Ok(None);
    };
    let rest = rest.trim_start();
    if rest.is_empty() {
        return Ok(Some(ContextDocument::new()));
    }
    match serde_json::from_str::<Value>(rest)? {
        Value::Object(document) => Ok(Some(document)),
        Value::Null => Ok(Some(ContextDocument::new())),
        other => Err(SyncError::Decode(format!(
            "context is not a JSON object: {}",
            other
        ))),
    }
}

/// The authoritative context comment among `comments`.
///
/// The earliest `posted_at` wins. Comments with a missing or unparseable
/// timestamp rank after every dated one; remaining ties go to listing order.
pub fn select_context_comment(comments: &[Comment]) -> Option<&Comment> {
    let tagged: Vec<(usize, &Comment)> = comments
        .iter()
        .enumerate()
        .filter(|(_, c)| is_context_comment(&c.content))
        .collect();
    if tagged.len() > 1 {
        warn!(
            "[Context] {} context comments on task {}, using the earliest",
            tagged.len(),
            tagged[0].1.task_id
        );
    }
    tagged
        .into_iter()
        .min_by_key(|(index, c)| {
            let posted = c.posted_at_utc();
            (posted.is_none(), posted, *index)
        })
        .map(|(_, c)| c)
}

impl Client {
    async fn context_comment(&self, task_key: &str) -> Result<Option<Comment>> {
        let comments = self.task_comments(task_key).await?;
        Ok(select_context_comment(&comments).cloned())
    }

    /// The task's context document; empty when the task has none.
    pub async fn get_context(&self, task_key: &str) -> Result<ContextDocument> {
        match self.context_comment(task_key).await? {
            Some(comment) => Ok(decode(&comment.content)?.unwrap_or_default()),
            None => Ok(ContextDocument::new()),
        }
    }

    /// Replace the whole document, updating the context comment in place or
    /// creating it.
    pub async fn set_context(&self, task_key: &str, document: &ContextDocument) -> Result<()> {
        let content = encode(document)?;
        match self.context_comment(task_key).await? {
            Some(existing) => {
                debug!("[Context] Updating context comment {}", existing.id);
                self.update_comment(&existing.id, &content).await?;
            }
            None => {
                let created = self.add_comment(task_key, &content).await?;
                debug!("[Context] Created context comment {}", created.id);
            }
        }
        Ok(())
    }

    /// Shallow merge: keys in `partial` overwrite, everything else is kept.
    pub async fn update_context(&self, task_key: &str, partial: ContextDocument) -> Result<ContextDocument> {
        let mut document = self.get_context(task_key).await?;
        document.extend(partial);
        self.set_context(task_key, &document).await?;
        Ok(document)
    }

    /// Remove the context comment. A task without one is left as is.
    pub async fn delete_context(&self, task_key: &str) -> Result<()> {
        if let Some(comment) = self.context_comment(task_key).await? {
            self.delete_comment(&comment.id).await?;
        }
        Ok(())
    }

    /// Remove one key. When that empties the document the comment itself is deleted.
    pub async fn delete_context_field(&self, task_key: &str, key: &str) -> Result<ContextDocument> {
        let mut document = self.get_context(task_key).await?;
        document.remove(key);
        if document.is_empty() {
            self.delete_context(task_key).await?;
        } else {
            self.set_context(task_key, &document).await?;
        }
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::fake::FakeTransport;
    use serde_json::json;
    use std::sync::Arc;

    fn doc(value: Value) -> ContextDocument {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    async fn synced_client(fake: &Arc<FakeTransport>) -> Client {
        let mut client = Client::with_transport(Config::new("token"), fake.clone());
        client.sync().await.unwrap();
        client
    }

    fn backend() -> Arc<FakeTransport> {
        Arc::new(FakeTransport::new().with_tasks(vec![json!({"id": "1", "content": "Plan trip"})]))
    }

    fn tagged(comments: &[Value]) -> usize {
        comments
            .iter()
            .filter(|c| c["content"].as_str().is_some_and(is_context_comment))
            .count()
    }

    #[test]
    fn test_decode() {
        assert_eq!(decode("just a note").unwrap(), None);
        assert_eq!(decode("[CONTEXT]").unwrap(), Some(ContextDocument::new()));
        assert_eq!(
            decode("[CONTEXT] {\"a\":1}").unwrap(),
            Some(doc(json!({"a": 1})))
        );
        assert!(matches!(decode("[CONTEXT] [1,2]"), Err(SyncError::Decode(_))));
        assert!(matches!(decode("[CONTEXT] {oops"), Err(SyncError::Decode(_))));
    }

    #[test]
    fn test_encode_format() {
        let encoded = encode(&doc(json!({"k": "v"}))).unwrap();
        assert_eq!(encoded, "[CONTEXT] {\"k\":\"v\"}");
    }

    #[test]
    fn test_earliest_context_comment_wins() {
        let comment = |id: &str, posted_at: Option<&str>, content: &str| Comment {
            id: id.into(),
            task_id: "1".into(),
            content: content.into(),
            posted_at: posted_at.map(String::from),
            project_id: None,
        };
        let comments = vec![
            comment("a", Some("2025-03-01T00:00:00Z"), "[CONTEXT] {\"v\":1}"),
            comment("b", None, "[CONTEXT] {\"v\":2}"),
            comment("c", Some("2025-01-01T00:00:00Z"), "[CONTEXT] {\"v\":3}"),
            comment("d", Some("2024-01-01T00:00:00Z"), "plain comment"),
        ];
        assert_eq!(select_context_comment(&comments).unwrap().id, "c");

        let undated = vec![
            comment("x", None, "[CONTEXT] {}"),
            comment("y", Some("garbage"), "[CONTEXT] {}"),
        ];
        assert_eq!(select_context_comment(&undated).unwrap().id, "x");
        assert!(select_context_comment(&[]).is_none());
    }

    #[tokio::test]
    async fn test_missing_context_is_empty() {
        let fake = backend();
        let client = synced_client(&fake).await;
        assert!(client.get_context("1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_context_twice_keeps_one_comment() {
        let fake = backend();
        let client = synced_client(&fake).await;
        let document = doc(json!({"owner": "sam", "nested": {"depth": 2}}));

        client.set_context("1", &document).await.unwrap();
        client.set_context("1", &document).await.unwrap();

        assert_eq!(client.get_context("1").await.unwrap(), document);
        assert_eq!(tagged(&fake.comments_for("1")), 1);
    }

    #[tokio::test]
    async fn test_update_context_is_shallow_merge() {
        let fake = backend();
        let client = synced_client(&fake).await;
        client
            .set_context("1", &doc(json!({"a": 0, "b": 2})))
            .await
            .unwrap();

        let merged = client.update_context("1", doc(json!({"a": 1}))).await.unwrap();

        assert_eq!(merged, doc(json!({"a": 1, "b": 2})));
        assert_eq!(client.get_context("1").await.unwrap(), merged);
    }

    #[tokio::test]
    async fn test_deleting_last_field_removes_comment() {
        let fake = backend();
        let client = synced_client(&fake).await;
        client.add_comment("1", "unrelated").await.unwrap();
        client
            .set_context("1", &doc(json!({"a": 1, "b": 2})))
            .await
            .unwrap();

        client.delete_context_field("1", "a").await.unwrap();
        assert_eq!(tagged(&fake.comments_for("1")), 1);

        client.delete_context_field("1", "b").await.unwrap();

        assert!(client.get_context("1").await.unwrap().is_empty());
        let remaining = fake.comments_for("1");
        assert_eq!(tagged(&remaining), 0);
        assert_eq!(remaining.len(), 1);
    }

    #[tokio::test]
    async fn test_writes_target_the_earliest_comment() {
        let fake = Arc::new(
            FakeTransport::new()
                .with_tasks(vec![json!({"id": "1", "content": "t"})])
                .with_comments(vec![
                    json!({"id": "late", "task_id": "1", "content": "[CONTEXT] {\"v\":\"late\"}", "posted_at": "2025-06-01T00:00:00Z"}),
                    json!({"id": "early", "task_id": "1", "content": "[CONTEXT] {\"v\":\"early\"}", "posted_at": "2025-01-01T00:00:00Z"}),
                ]),
        );
        let client = synced_client(&fake).await;

        assert_eq!(client.get_context("1").await.unwrap(), doc(json!({"v": "early"})));
        client.update_context("1", doc(json!({"w": 1}))).await.unwrap();

        let comments = fake.comments_for("1");
        let late = comments.iter().find(|c| c["id"] == "late").unwrap();
        assert_eq!(late["content"], "[CONTEXT] {\"v\":\"late\"}");
    }

    #[tokio::test]
    async fn test_context_on_pending_task_is_unresolved() {
        let fake = backend();
        let mut client = Client::with_transport(Config::new("token").with_sync_api(true), fake.clone());
        let task = client.create_task("new", None).await.unwrap();
        let err = client
            .get_context(task.temp_id.as_deref().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Unresolved { .. }));
    }
}
