//! In-memory Todoist backend for tests.
//!
//! [`FakeTransport`] answers the REST routes and the batch `/sync` endpoint the
//! way the real service does, closely enough to drive the client end to end.
//! Failures, delays and per-command rejections can be injected per path.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::backlog::{CommandKind, SYNC_PATH};
use crate::error::{Result, SyncError};
use crate::transport::Transport;

const DEFAULT_LIMIT: usize = 50;

/// One request as the fake saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub method: &'static str,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

#[derive(Debug, Clone, Copy)]
struct Failure {
    status: u16,
    /// Fail only the n-th request to the path (1-based); `None` fails all of them
    nth: Option<usize>,
}

#[derive(Default)]
struct FakeState {
    tasks: Vec<Value>,
    projects: Vec<Value>,
    comments: Vec<Value>,
    remote_deletions: Vec<Value>,
    next_id: u64,
    comment_seq: i64,
    sync_seq: u64,
    direct_listing: bool,
    failures: HashMap<String, Failure>,
    delays: HashMap<String, Duration>,
    rejected_kinds: HashMap<CommandKind, String>,
    requests: Vec<RecordedRequest>,
}

#[derive(Default)]
pub struct FakeTransport {
    state: Mutex<FakeState>,
}

impl FakeTransport {
    pub fn new() -> Self {
        let fake = Self::default();
        fake.state().next_id = 1000;
        fake
    }

    pub fn with_tasks(self, tasks: Vec<Value>) -> Self {
        self.state().tasks.extend(tasks);
        self
    }

    pub fn with_projects(self, projects: Vec<Value>) -> Self {
        self.state().projects.extend(projects);
        self
    }

    pub fn with_comments(self, comments: Vec<Value>) -> Self {
        self.state().comments.extend(comments);
        self
    }

    /// Serve listings as bare arrays instead of cursor pages.
    pub fn with_direct_listing(self) -> Self {
        self.state().direct_listing = true;
        self
    }

    pub fn fail_path(&self, path: &str, status: u16) {
        self.state()
            .failures
            .insert(path.to_string(), Failure { status, nth: None });
    }

    pub fn fail_nth(&self, path: &str, nth: usize, status: u16) {
        self.state().failures.insert(
            path.to_string(),
            Failure {
                status,
                nth: Some(nth),
            },
        );
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    pub fn delay_path(&self, path: &str, delay: Duration) {
        self.state().delays.insert(path.to_string(), delay);
    }

    /// Answer every command of `kind` with an error status.
    pub fn reject_command(&self, kind: CommandKind, message: &str) {
        self.state()
            .rejected_kinds
            .insert(kind, message.to_string());
    }

    /// Delete a task server-side; the next incremental sync reports it as deleted.
    pub fn delete_task_remotely(&self, id: &str) {
        let mut state = self.state();
        if let Some(pos) = state.tasks.iter().position(|t| t["id"] == id) {
            let mut task = state.tasks.remove(pos);
            task["is_deleted"] = json!(true);
            state.remote_deletions.push(task);
        }
    }

    pub fn tasks(&self) -> Vec<Value> {
        self.state().tasks.clone()
    }

    pub fn projects(&self) -> Vec<Value> {
        self.state().projects.clone()
    }

    pub fn comments_for(&self, task_id: &str) -> Vec<Value> {
        self.state()
            .comments
            .iter()
            .filter(|c| c["task_id"] == task_id)
            .cloned()
            .collect()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state().requests.clone()
    }

    pub fn request_count(&self, path: &str) -> usize {
        self.state()
            .requests
            .iter()
            .filter(|r| r.path == path)
            .count()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record the request and apply injected failures. Returns the delay to
    /// wait before answering. The lock is released before any await.
    fn admit(
        &self,
        method: &'static str,
        path: &str,
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<Option<Duration>> {
        let mut state = self.state();
        state.requests.push(RecordedRequest {
            method,
            path: path.to_string(),
            query: query
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body,
        });
        let seen = state.requests.iter().filter(|r| r.path == path).count();
        if let Some(failure) = state.failures.get(path) {
            if failure.nth.is_none_or(|n| n == seen) {
                return Err(SyncError::Http {
                    status: failure.status,
                    url: path.to_string(),
                    body: "injected failure".to_string(),
                });
            }
        }
        Ok(state.delays.get(path).copied())
    }

    async fn wait(delay: Option<Duration>) {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

fn not_found(path: &str) -> SyncError {
    SyncError::Http {
        status: 404,
        url: path.to_string(),
        body: "not found".to_string(),
    }
}

fn param<'a>(query: &[(&'a str, &'a str)], key: &str) -> Option<&'a str> {
    query.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

fn overlay(mut base: Value, args: &Map<String, Value>) -> Value {
    if let Value::Object(fields) = &mut base {
        for (key, value) in args {
            if key != "id" {
                fields.insert(key.clone(), value.clone());
            }
        }
    }
    base
}

fn as_map(body: Option<&Value>) -> Map<String, Value> {
    body.and_then(Value::as_object).cloned().unwrap_or_default()
}

impl FakeState {
    fn allocate_id(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }

    fn new_task(&mut self, args: &Map<String, Value>) -> Value {
        let id = self.allocate_id();
        let task = overlay(
            json!({
                "id": id,
                "content": "",
                "description": "",
                "project_id": "inbox",
                "parent_id": null,
                "child_order": 0,
                "priority": 1,
                "labels": [],
                "checked": false,
                "due": null,
            }),
            args,
        );
        self.tasks.push(task.clone());
        task
    }

    fn new_project(&mut self, args: &Map<String, Value>) -> Value {
        let id = self.allocate_id();
        let project = overlay(
            json!({
                "id": id,
                "name": "",
                "color": "charcoal",
                "parent_id": null,
                "child_order": 0,
                "is_favorite": false,
                "view_style": "list",
            }),
            args,
        );
        self.projects.push(project.clone());
        project
    }

    fn new_comment(&mut self, args: &Map<String, Value>) -> Value {
        let id = self.allocate_id();
        self.comment_seq += 1;
        let posted_at = DateTime::from_timestamp(1_735_689_600 + self.comment_seq, 0)
            .unwrap_or_default()
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        let comment = overlay(json!({"id": id, "posted_at": posted_at}), args);
        self.comments.push(comment.clone());
        comment
    }

    fn find<'a>(items: &'a mut [Value], id: &str) -> Option<&'a mut Value> {
        items.iter_mut().find(|v| v["id"] == id)
    }

    fn listing(&self, path: &str, query: &[(&str, &str)]) -> Result<Value> {
        let items: Vec<&Value> = match path {
            "/tasks" => self
                .tasks
                .iter()
                .filter(|t| param(query, "project_id").is_none_or(|p| t["project_id"] == p))
                .collect(),
            "/projects" => self.projects.iter().collect(),
            "/comments" => self
                .comments
                .iter()
                .filter(|c| param(query, "task_id").is_none_or(|id| c["task_id"] == id))
                .collect(),
            _ => return Err(not_found(path)),
        };

        if self.direct_listing {
            return Ok(json!(items));
        }

        let limit = param(query, "limit")
            .and_then(|l| l.parse::<usize>().ok())
            .filter(|l| *l > 0)
            .unwrap_or(DEFAULT_LIMIT);
        let start = param(query, "cursor")
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0)
            .min(items.len());
        let end = (start + limit).min(items.len());
        let next_cursor = (end < items.len()).then(|| end.to_string());
        Ok(json!({"results": &items[start..end], "next_cursor": next_cursor}))
    }

    fn post(&mut self, path: &str, body: Option<&Value>) -> Result<Value> {
        let args = as_map(body);
        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        match segments.as_slice() {
            ["tasks"] => Ok(self.new_task(&args)),
            ["projects"] => Ok(self.new_project(&args)),
            ["comments"] => Ok(self.new_comment(&args)),
            ["tasks", id] => {
                let task = Self::find(&mut self.tasks, id).ok_or_else(|| not_found(path))?;
                *task = overlay(task.take(), &args);
                Ok(task.clone())
            }
            ["projects", id] => {
                let project = Self::find(&mut self.projects, id).ok_or_else(|| not_found(path))?;
                *project = overlay(project.take(), &args);
                Ok(project.clone())
            }
            ["comments", id] => {
                let comment = Self::find(&mut self.comments, id).ok_or_else(|| not_found(path))?;
                *comment = overlay(comment.take(), &args);
                Ok(comment.clone())
            }
            ["tasks", id, action @ ("close" | "reopen")] => {
                let task = Self::find(&mut self.tasks, id).ok_or_else(|| not_found(path))?;
                task["checked"] = json!(*action == "close");
                Ok(Value::Null)
            }
            _ => Err(not_found(path)),
        }
    }

    fn delete(&mut self, path: &str) -> Result<()> {
        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        let (items, id) = match segments.as_slice() {
            ["comments", id] => (&mut self.comments, *id),
            ["tasks", id] => (&mut self.tasks, *id),
            ["projects", id] => (&mut self.projects, *id),
            _ => return Err(not_found(path)),
        };
        let before = items.len();
        items.retain(|v| v["id"] != id);
        if items.len() == before {
            return Err(not_found(path));
        }
        Ok(())
    }

    fn sync(&mut self, form: &[(&str, &str)]) -> Result<Value> {
        let token = param(form, "sync_token").unwrap_or("*");
        let commands: Vec<Value> = match param(form, "commands") {
            Some(raw) => serde_json::from_str(raw)?,
            None => Vec::new(),
        };

        let mut statuses = Map::new();
        let mut mapping: HashMap<String, String> = HashMap::new();
        let mut touched_tasks: Vec<String> = Vec::new();
        let mut touched_projects: Vec<String> = Vec::new();

        for command in &commands {
            let uuid = command["uuid"].as_str().unwrap_or_default().to_string();
            let kind: Option<CommandKind> = serde_json::from_value(command["type"].clone()).ok();
            let mut args = as_map(command.get("args"));
            for key in ["id", "project_id", "parent_id", "item_id"] {
                if let Some(Value::String(reference)) = args.get(key) {
                    if let Some(real) = mapping.get(reference) {
                        args.insert(key.to_string(), json!(real));
                    }
                }
            }

            let status = match kind {
                None => json!({"error_code": 21, "error": "Unknown command"}),
                Some(kind) if self.rejected_kinds.contains_key(&kind) => {
                    json!({"error_code": 20, "error": self.rejected_kinds[&kind]})
                }
                Some(kind) => match self.apply_command(kind, &args) {
                    Some(id) => {
                        if let Some(temp_id) = command["temp_id"].as_str() {
                            mapping.insert(temp_id.to_string(), id.clone());
                        }
                        match kind {
                            CommandKind::ProjectAdd | CommandKind::ProjectUpdate => touched_projects.push(id),
                            _ => touched_tasks.push(id),
                        }
                        json!("ok")
                    }
                    None => json!({"error_code": 22, "error": "Item not found"}),
                },
            };
            statuses.insert(uuid, status);
        }

        let full_sync = token == "*";
        let (items, projects) = if full_sync {
            self.remote_deletions.clear();
            (self.tasks.clone(), self.projects.clone())
        } else {
            let mut items: Vec<Value> = self
                .tasks
                .iter()
                .filter(|t| touched_tasks.iter().any(|id| t["id"] == id.as_str()))
                .cloned()
                .collect();
            items.append(&mut self.remote_deletions);
            let projects = self
                .projects
                .iter()
                .filter(|p| touched_projects.iter().any(|id| p["id"] == id.as_str()))
                .cloned()
                .collect();
            (items, projects)
        };

        self.sync_seq += 1;
        Ok(json!({
            "sync_token": format!("token-{}", self.sync_seq),
            "full_sync": full_sync,
            "items": items,
            "projects": projects,
            "sync_status": statuses,
            "temp_id_mapping": mapping,
        }))
    }

    /// Returns the ID of the affected entity, or `None` if it does not exist.
    fn apply_command(&mut self, kind: CommandKind, args: &Map<String, Value>) -> Option<String> {
        let target = args.get("id").and_then(Value::as_str).map(String::from);
        match kind {
            CommandKind::ItemAdd => Some(self.new_task(args)["id"].as_str()?.to_string()),
            CommandKind::ProjectAdd => Some(self.new_project(args)["id"].as_str()?.to_string()),
            CommandKind::ItemUpdate => {
                let id = target?;
                let task = Self::find(&mut self.tasks, &id)?;
                *task = overlay(task.take(), args);
                Some(id)
            }
            CommandKind::ProjectUpdate => {
                let id = target?;
                let project = Self::find(&mut self.projects, &id)?;
                *project = overlay(project.take(), args);
                Some(id)
            }
            CommandKind::ItemClose | CommandKind::ItemUncomplete => {
                let id = target?;
                let task = Self::find(&mut self.tasks, &id)?;
                task["checked"] = json!(kind == CommandKind::ItemClose);
                Some(id)
            }
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Value> {
        let delay = self.admit("GET", path, query, None)?;
        Self::wait(delay).await;
        self.state().listing(path, query)
    }

    async fn post(&self, path: &str, body: Option<&Value>) -> Result<Value> {
        let delay = self.admit("POST", path, &[], body.cloned())?;
        Self::wait(delay).await;
        self.state().post(path, body)
    }

    async fn post_form(&self, path: &str, form: &[(&str, &str)]) -> Result<Value> {
        let delay = self.admit("POST", path, form, None)?;
        Self::wait(delay).await;
        if path != SYNC_PATH {
            return Err(not_found(path));
        }
        self.state().sync(form)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let delay = self.admit("DELETE", path, &[], None)?;
        Self::wait(delay).await;
        self.state().delete(path)
    }
}
