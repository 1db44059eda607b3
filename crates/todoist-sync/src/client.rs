//! The client facade: owns the stores, the command backlog and the transport.
//!
//! Writes go straight to the REST endpoints by default. With
//! [`Config::use_sync_api`] they are staged in the backlog, applied to the
//! local copy immediately, and sent on [`Client::commit`].

use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

use crate::backlog::{BatchResult, CommandBacklog, CommandKind, SYNC_PATH, SYNC_RESOURCE_TYPES};
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::models::{Comment, Project, SyncResponse, Task};
use crate::reconcile::{self, MergeStats};
use crate::store::{Entity, EntityStore, ProjectStore, TaskStore, UnresolvedCreate};
use crate::transport::{HttpTransport, Transport};
use crate::update::{ProjectUpdate, TaskField, TaskUpdate};

pub const TASKS_PATH: &str = "/tasks";
pub const PROJECTS_PATH: &str = "/projects";
pub const COMMENTS_PATH: &str = "/comments";

/// Token that asks the sync endpoint for a full snapshot.
pub const FULL_SYNC_TOKEN: &str = "*";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub tasks: usize,
    pub projects: usize,
    /// Entries dropped by pruning or reported deleted by the server
    pub removed: usize,
}

impl SyncSummary {
    fn from_stats(tasks: MergeStats, projects: MergeStats) -> Self {
        Self {
            tasks: tasks.merged,
            projects: projects.merged,
            removed: tasks.removed + projects.removed,
        }
    }
}

pub struct Client {
    pub(crate) transport: Arc<dyn Transport>,
    config: Config,
    tasks: TaskStore,
    projects: ProjectStore,
    backlog: CommandBacklog,
    sync_token: String,
}

impl Client {
    pub fn new(config: Config) -> Result<Self> {
        let transport = HttpTransport::new(&config)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            config,
            tasks: TaskStore::new(),
            projects: ProjectStore::new(),
            backlog: CommandBacklog::new(),
            sync_token: FULL_SYNC_TOKEN.to_string(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    pub fn projects(&self) -> &ProjectStore {
        &self.projects
    }

    pub fn backlog(&self) -> &CommandBacklog {
        &self.backlog
    }

    pub fn sync_token(&self) -> &str {
        &self.sync_token
    }

    fn batch_mode(&self) -> bool {
        self.config.use_sync_api
    }

    /// Pull tasks and projects into the stores.
    ///
    /// Either both stores are updated or neither is: both listings are fetched
    /// and decoded before anything is merged.
    #[instrument(skip(self), fields(batch = self.config.use_sync_api))]
    pub async fn sync(&mut self) -> Result<SyncSummary> {
        let summary = if self.batch_mode() {
            self.pull_batch().await?
        } else {
            self.pull_rest().await?
        };
        info!(
            "[Client] Synced {} tasks, {} projects ({} removed)",
            summary.tasks, summary.projects, summary.removed
        );
        Ok(summary)
    }

    async fn pull_rest(&mut self) -> Result<SyncSummary> {
        let transport = self.transport.as_ref();
        let page_size = self.config.page_size;
        let (tasks, projects) = futures::future::try_join(
            reconcile::fetch_listing::<Task>(transport, TASKS_PATH, &[], page_size),
            reconcile::fetch_listing::<Project>(transport, PROJECTS_PATH, &[], page_size),
        )
        .await?;

        let prune = self.config.prune_on_full_sync;
        let task_stats = reconcile::merge_listing(&mut self.tasks, tasks, prune);
        let project_stats = reconcile::merge_listing(&mut self.projects, projects, prune);
        Ok(SyncSummary::from_stats(task_stats, project_stats))
    }

    async fn pull_batch(&mut self) -> Result<SyncSummary> {
        let form = [
            ("sync_token", self.sync_token.as_str()),
            ("resource_types", SYNC_RESOURCE_TYPES),
        ];
        let value = self.transport.post_form(SYNC_PATH, &form).await?;
        let response: SyncResponse = serde_json::from_value(value)?;

        let prune = self.config.prune_on_full_sync && response.full_sync;
        let task_stats = reconcile::merge_batch(&mut self.tasks, response.items, prune);
        let project_stats = reconcile::merge_batch(&mut self.projects, response.projects, prune);
        if let Some(token) = response.sync_token {
            self.sync_token = token;
        }
        Ok(SyncSummary::from_stats(task_stats, project_stats))
    }

    /// Send the backlog in one request and reconcile the response.
    ///
    /// Rejected commands do not fail the call; they are listed in
    /// [`BatchResult::rejected`] and rejected creations stay visible through
    /// [`Client::unresolved_tasks`] / [`Client::unresolved_projects`].
    #[instrument(skip(self), fields(commands = self.backlog.len()))]
    pub async fn commit(&mut self) -> Result<BatchResult> {
        let result = self
            .backlog
            .flush(self.transport.as_ref(), &self.sync_token)
            .await?;
        if let Some(token) = &result.sync_token {
            self.sync_token = token.clone();
        }
        let stats = reconcile::apply_batch(&mut self.tasks, &mut self.projects, &result);
        info!(
            "[Client] Commit applied: {} promoted, {} rejected",
            stats.promoted, stats.rejected
        );
        Ok(result)
    }

    // Tasks

    /// Add a task to the store.
    ///
    /// A task whose non-empty ID is already stored is a conflict and changes
    /// nothing. A task with an empty ID is created remotely: immediately over
    /// REST, or staged under a temporary ID in batch mode. A task carrying an
    /// unknown ID is adopted as-is.
    pub async fn add_task(&mut self, mut task: Task) -> Result<Task> {
        self.tasks.check_conflict(&task)?;
        self.resolve_task_references(&mut task);
        if task.is_persisted() {
            self.tasks.put(task.clone());
            return Ok(task);
        }

        let args = creation_args(&task)?;
        if self.batch_mode() {
            let temp_id = self.backlog.stage_create(CommandKind::ItemAdd, args);
            reconcile::insert_pending(&mut self.tasks, task, temp_id.clone())?;
            return self.tasks.get(&temp_id).cloned().ok_or_else(|| SyncError::NotFound {
                entity: Task::KIND,
                key: temp_id,
            });
        }

        let body = Value::Object(crate::backlog::strip_empty_fields(args));
        let created: Task = serde_json::from_value(self.transport.post(TASKS_PATH, Some(&body)).await?)?;
        debug!("[Client] Created task {}", created.id);
        // Conflicts were checked before the POST; the task now exists remotely either way
        self.tasks.put(created.clone());
        Ok(created)
    }

    pub async fn create_task(&mut self, content: &str, project_id: Option<&str>) -> Result<Task> {
        let mut task = Task::new(content);
        if let Some(project_id) = project_id {
            task.project_id = project_id.to_string();
        }
        self.add_task(task).await
    }

    pub async fn update_task(&mut self, key: &str, update: TaskUpdate) -> Result<()> {
        let key = resolve_key(&self.tasks, key)?;
        let update = self.resolve_update_references(update);

        if self.batch_mode() {
            ensure_not_rejected(&self.tasks, &key)?;
            let mut args = update.patch();
            args.insert("id".to_string(), json!(key));
            self.backlog.stage(CommandKind::ItemUpdate, args);
            if let Some(task) = self.tasks.get_mut(&key) {
                update.apply(task);
            }
            return Ok(());
        }

        let id = remote_id(&self.tasks, &key)?;
        let body = Value::Object(update.patch());
        let response = self
            .transport
            .post(&format!("{}/{}", TASKS_PATH, id), Some(&body))
            .await?;
        if response.is_object() {
            let updated: Task = serde_json::from_value(response)?;
            self.tasks.put(updated);
        } else if let Some(task) = self.tasks.get_mut(&key) {
            update.apply(task);
        }
        Ok(())
    }

    /// Update a task field named at runtime, e.g. from the command line.
    pub async fn update_task_field(&mut self, key: &str, field: &str, value: &str) -> Result<()> {
        let parsed = field
            .parse::<TaskField>()
            .and_then(|field| field.parse_value(value));
        match parsed {
            Ok(update) => self.update_task(key, update).await,
            Err(e) => {
                error!(
                    "[Client] Rejected update of {:?} on task {:?}: {}",
                    field,
                    self.tasks.get(key),
                    e
                );
                Err(e)
            }
        }
    }

    /// Append a label unless the task already has it.
    pub async fn add_label(&mut self, key: &str, label: &str) -> Result<()> {
        let task = self.task(key)?;
        if task.labels.iter().any(|l| l == label) {
            return Ok(());
        }
        let mut labels = task.labels.clone();
        labels.push(label.to_string());
        self.update_task(key, TaskUpdate::Labels(labels)).await
    }

    pub async fn remove_label(&mut self, key: &str, label: &str) -> Result<()> {
        let task = self.task(key)?;
        let Some(pos) = task.labels.iter().position(|l| l == label) else {
            return Err(SyncError::LabelNotFound {
                label: label.to_string(),
            });
        };
        let mut labels = task.labels.clone();
        labels.remove(pos);
        self.update_task(key, TaskUpdate::Labels(labels)).await
    }

    pub async fn close_task(&mut self, key: &str) -> Result<()> {
        self.set_checked(key, true).await
    }

    pub async fn reopen_task(&mut self, key: &str) -> Result<()> {
        self.set_checked(key, false).await
    }

    async fn set_checked(&mut self, key: &str, checked: bool) -> Result<()> {
        let key = resolve_key(&self.tasks, key)?;
        if self.batch_mode() {
            ensure_not_rejected(&self.tasks, &key)?;
            let kind = if checked {
                CommandKind::ItemClose
            } else {
                CommandKind::ItemUncomplete
            };
            let mut args = Map::new();
            args.insert("id".to_string(), json!(key));
            self.backlog.stage(kind, args);
        } else {
            let id = remote_id(&self.tasks, &key)?;
            let action = if checked { "close" } else { "reopen" };
            self.transport
                .post(&format!("{}/{}/{}", TASKS_PATH, id, action), None)
                .await?;
        }
        if let Some(task) = self.tasks.get_mut(&key) {
            task.checked = checked;
        }
        Ok(())
    }

    /// Point `project_id` and `parent_id` at real IDs where a temporary one was superseded.
    fn resolve_task_references(&self, task: &mut Task) {
        if !task.project_id.is_empty() {
            task.project_id = resolve_reference(&self.projects, &task.project_id);
        }
        if let Some(parent_id) = task.parent_id.take() {
            task.parent_id = Some(resolve_reference(&self.tasks, &parent_id));
        }
    }

    fn resolve_update_references(&self, update: TaskUpdate) -> TaskUpdate {
        match update {
            TaskUpdate::ProjectId(id) => TaskUpdate::ProjectId(resolve_reference(&self.projects, &id)),
            TaskUpdate::ParentId(Some(id)) => TaskUpdate::ParentId(Some(resolve_reference(&self.tasks, &id))),
            other => other,
        }
    }

    fn task(&self, key: &str) -> Result<&Task> {
        let key = resolve_key(&self.tasks, key)?;
        self.tasks.get(&key).ok_or(SyncError::NotFound {
            entity: Task::KIND,
            key,
        })
    }

    /// Server ID of a stored task. Fails while the task is only known by a temporary ID.
    pub fn task_id(&self, key: &str) -> Result<String> {
        let key = resolve_key(&self.tasks, key)?;
        remote_id(&self.tasks, &key)
    }

    pub fn unresolved_tasks(&self) -> Vec<UnresolvedCreate> {
        self.tasks.unresolved()
    }

    // Projects

    /// Same rules as [`Client::add_task`].
    pub async fn add_project(&mut self, mut project: Project) -> Result<Project> {
        self.projects.check_conflict(&project)?;
        if let Some(parent_id) = project.parent_id.take() {
            project.parent_id = Some(resolve_reference(&self.projects, &parent_id));
        }
        if !project.id.is_empty() {
            self.projects.put(project.clone());
            return Ok(project);
        }

        let args = creation_args(&project)?;
        if self.batch_mode() {
            let temp_id = self.backlog.stage_create(CommandKind::ProjectAdd, args);
            reconcile::insert_pending(&mut self.projects, project, temp_id.clone())?;
            return self
                .projects
                .get(&temp_id)
                .cloned()
                .ok_or_else(|| SyncError::NotFound {
                    entity: Project::KIND,
                    key: temp_id,
                });
        }

        let body = Value::Object(crate::backlog::strip_empty_fields(args));
        let created: Project =
            serde_json::from_value(self.transport.post(PROJECTS_PATH, Some(&body)).await?)?;
        debug!("[Client] Created project {}", created.id);
        self.projects.put(created.clone());
        Ok(created)
    }

    pub async fn create_project(&mut self, name: &str, parent_id: Option<&str>) -> Result<Project> {
        let mut project = Project::new(name);
        if let Some(parent_id) = parent_id {
            project.parent_id = Some(parent_id.to_string());
        }
        self.add_project(project).await
    }

    pub async fn update_project(&mut self, key: &str, update: ProjectUpdate) -> Result<()> {
        let key = resolve_key(&self.projects, key)?;

        if self.batch_mode() {
            ensure_not_rejected(&self.projects, &key)?;
            let mut args = update.patch();
            args.insert("id".to_string(), json!(key));
            self.backlog.stage(CommandKind::ProjectUpdate, args);
            if let Some(project) = self.projects.get_mut(&key) {
                update.apply(project);
            }
            return Ok(());
        }

        let id = remote_id(&self.projects, &key)?;
        let body = Value::Object(update.patch());
        let response = self
            .transport
            .post(&format!("{}/{}", PROJECTS_PATH, id), Some(&body))
            .await?;
        if response.is_object() {
            let updated: Project = serde_json::from_value(response)?;
            self.projects.put(updated);
        } else if let Some(project) = self.projects.get_mut(&key) {
            update.apply(project);
        }
        Ok(())
    }

    pub fn unresolved_projects(&self) -> Vec<UnresolvedCreate> {
        self.projects.unresolved()
    }

    pub fn project_tasks(&self, project_id: &str) -> Vec<&Task> {
        self.tasks.by_project(project_id)
    }

    pub fn project_children(&self, project_id: &str) -> Vec<&Project> {
        self.projects.children(project_id)
    }

    // Comments

    pub async fn task_comments(&self, task_key: &str) -> Result<Vec<Comment>> {
        let task_id = self.task_id(task_key)?;
        reconcile::fetch_listing(
            self.transport.as_ref(),
            COMMENTS_PATH,
            &[("task_id", task_id.as_str())],
            self.config.page_size,
        )
        .await
    }

    pub async fn add_comment(&self, task_key: &str, content: &str) -> Result<Comment> {
        let task_id = self.task_id(task_key)?;
        let body = json!({"task_id": task_id, "content": content});
        let value = self.transport.post(COMMENTS_PATH, Some(&body)).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn update_comment(&self, comment_id: &str, content: &str) -> Result<Comment> {
        let body = json!({"content": content});
        let value = self
            .transport
            .post(&format!("{}/{}", COMMENTS_PATH, comment_id), Some(&body))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn delete_comment(&self, comment_id: &str) -> Result<()> {
        self.transport
            .delete(&format!("{}/{}", COMMENTS_PATH, comment_id))
            .await
    }
}

/// Store key for `key`, following a superseded temporary ID to its real ID.
fn resolve_key<T: Entity>(store: &EntityStore<T>, key: &str) -> Result<String> {
    if store.contains(key) {
        return Ok(key.to_string());
    }
    match store.resolve_temp_id(key) {
        Some(real) if store.contains(real) => Ok(real.to_string()),
        _ => Err(SyncError::NotFound {
            entity: T::KIND,
            key: key.to_string(),
        }),
    }
}

/// Map a superseded temporary ID to its real ID; anything else passes through.
fn resolve_reference<T: Entity>(store: &EntityStore<T>, id: &str) -> String {
    store.resolve_temp_id(id).unwrap_or(id).to_string()
}

fn remote_id<T: Entity>(store: &EntityStore<T>, key: &str) -> Result<String> {
    match store.get(key) {
        Some(entity) if !entity.id().is_empty() => Ok(entity.id().to_string()),
        Some(_) => Err(SyncError::Unresolved {
            temp_id: key.to_string(),
            reason: store
                .rejection(key)
                .unwrap_or("creation not committed yet")
                .to_string(),
        }),
        None => Err(SyncError::NotFound {
            entity: T::KIND,
            key: key.to_string(),
        }),
    }
}

fn ensure_not_rejected<T: Entity>(store: &EntityStore<T>, key: &str) -> Result<()> {
    match store.rejection(key) {
        Some(reason) => Err(SyncError::Unresolved {
            temp_id: key.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

fn creation_args<T: serde::Serialize>(entity: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(entity)? {
        Value::Object(mut args) => {
            args.remove("id");
            Ok(args)
        }
        other => Err(SyncError::Decode(format!(
            "entity did not serialize to an object: {}",
            other
        ))),
    }
}
