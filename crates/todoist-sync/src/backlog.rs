//! Command backlog for the batch sync endpoint.
//!
//! Mutations are staged locally as [`Command`]s and sent together by
//! [`CommandBacklog::flush`]. Submission order is preserved: a create must be
//! staged before any command that refers to its temporary ID.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::models::{Project, SyncResponse, Task};
use crate::transport::Transport;

pub const SYNC_PATH: &str = "/sync";
pub const SYNC_RESOURCE_TYPES: &str = r#"["items","projects"]"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    ItemAdd,
    ItemUpdate,
    ItemClose,
    ItemUncomplete,
    ProjectAdd,
    ProjectUpdate,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::ItemAdd => "item_add",
            CommandKind::ItemUpdate => "item_update",
            CommandKind::ItemClose => "item_close",
            CommandKind::ItemUncomplete => "item_uncomplete",
            CommandKind::ProjectAdd => "project_add",
            CommandKind::ProjectUpdate => "project_update",
        }
    }

    pub fn is_create(&self) -> bool {
        matches!(self, CommandKind::ItemAdd | CommandKind::ProjectAdd)
    }
}

/// A single staged mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    #[serde(rename = "type")]
    pub kind: CommandKind,
    /// Correlation ID; lets the server drop replays of the same command
    pub uuid: String,
    /// Present only on creations; echoed back in `temp_id_mapping`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandStatus {
    Ok,
    Failed { code: Option<i64>, message: String },
    /// The response did not mention this command
    Missing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    pub uuid: String,
    pub kind: CommandKind,
    pub temp_id: Option<String>,
    pub status: CommandStatus,
}

impl CommandOutcome {
    pub fn is_ok(&self) -> bool {
        self.status == CommandStatus::Ok
    }
}

/// Result of one flush: per-command outcomes in submission order plus the
/// snapshots the server sent back.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub sync_token: Option<String>,
    pub outcomes: Vec<CommandOutcome>,
    pub temp_id_mapping: HashMap<String, String>,
    pub tasks: Vec<Task>,
    pub projects: Vec<Project>,
}

impl BatchResult {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(CommandOutcome::is_ok)
    }

    pub fn rejected(&self) -> impl Iterator<Item = &CommandOutcome> {
        self.outcomes.iter().filter(|o| !o.is_ok())
    }
}

#[derive(Debug, Default)]
pub struct CommandBacklog {
    commands: Vec<Command>,
}

impl CommandBacklog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Stage a non-creating command. Returns its correlation ID.
    pub fn stage(&mut self, kind: CommandKind, args: Map<String, Value>) -> String {
        let uuid = Uuid::new_v4().to_string();
        debug!("[CommandBacklog] Staging {} uuid={}", kind.as_str(), uuid);
        self.commands.push(Command {
            kind,
            uuid: uuid.clone(),
            temp_id: None,
            args: Value::Object(args),
        });
        uuid
    }

    /// Stage a creation. Zero-valued fields are stripped from `args`.
    /// Returns the temporary ID the new entity is known by until commit.
    pub fn stage_create(&mut self, kind: CommandKind, args: Map<String, Value>) -> String {
        let temp_id = Uuid::new_v4().to_string();
        let uuid = Uuid::new_v4().to_string();
        debug!(
            "[CommandBacklog] Staging {} uuid={} temp_id={}",
            kind.as_str(),
            uuid,
            temp_id
        );
        self.commands.push(Command {
            kind,
            uuid,
            temp_id: Some(temp_id.clone()),
            args: Value::Object(strip_empty_fields(args)),
        });
        temp_id
    }

    /// Send every staged command in one request.
    ///
    /// On any error the backlog is kept so the same batch can be resent; the
    /// correlation IDs make that safe. On success it is cleared, even when
    /// individual commands were rejected (see [`BatchResult::rejected`]).
    pub async fn flush(&mut self, transport: &dyn Transport, sync_token: &str) -> Result<BatchResult> {
        if self.commands.is_empty() {
            return Ok(BatchResult::default());
        }

        let commands_json = serde_json::to_string(&self.commands)?;
        info!(
            "[CommandBacklog] Flushing {} commands",
            self.commands.len()
        );

        let form = [
            ("sync_token", sync_token),
            ("resource_types", SYNC_RESOURCE_TYPES),
            ("commands", commands_json.as_str()),
        ];
        let value = transport.post_form(SYNC_PATH, &form).await.map_err(|e| {
            error!("[CommandBacklog] Flush failed, keeping {} commands: {}", self.commands.len(), e);
            e
        })?;

        let response: SyncResponse = serde_json::from_value(value)?;
        let statuses = parse_sync_status(response.sync_status.as_ref())?;

        let outcomes: Vec<CommandOutcome> = self
            .commands
            .iter()
            .map(|command| CommandOutcome {
                uuid: command.uuid.clone(),
                kind: command.kind,
                temp_id: command.temp_id.clone(),
                status: statuses
                    .get(&command.uuid)
                    .cloned()
                    .unwrap_or(CommandStatus::Missing),
            })
            .collect();

        for outcome in outcomes.iter().filter(|o| !o.is_ok()) {
            warn!(
                "[CommandBacklog] Command {} ({}) not applied: {:?}",
                outcome.uuid,
                outcome.kind.as_str(),
                outcome.status
            );
        }

        self.commands.clear();

        Ok(BatchResult {
            sync_token: response.sync_token,
            outcomes,
            temp_id_mapping: response.temp_id_mapping,
            tasks: response.items,
            projects: response.projects,
        })
    }
}

/// Remove fields whose value is the zero value of its type (null, empty
/// string, 0, false, empty array/object). The server treats "present but
/// empty" differently from "absent", and only absent keeps its defaults.
pub fn strip_empty_fields(mut fields: Map<String, Value>) -> Map<String, Value> {
    fields.retain(|_, value| !is_zero_value(value));
    fields
}

fn is_zero_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

/// Per-command statuses keyed by UUID.
///
/// Accepts the map form (`{"<uuid>": "ok" | {"error": ..}}`) and the array
/// form (`[{"uuid": .., "status": .., "error": ..}]`).
fn parse_sync_status(sync_status: Option<&Value>) -> Result<HashMap<String, CommandStatus>> {
    let mut statuses = HashMap::new();
    match sync_status {
        None | Some(Value::Null) => {}
        Some(Value::Object(map)) => {
            for (uuid, value) in map {
                statuses.insert(uuid.clone(), parse_status_value(value));
            }
        }
        Some(Value::Array(entries)) => {
            for entry in entries {
                let uuid = entry
                    .get("uuid")
                    .and_then(Value::as_str)
                    .ok_or_else(|| SyncError::Decode(format!("sync_status entry without uuid: {}", entry)))?;
                let status = match entry.get("status") {
                    Some(Value::String(s)) if s == "ok" => CommandStatus::Ok,
                    _ => parse_status_value(entry),
                };
                statuses.insert(uuid.to_string(), status);
            }
        }
        Some(other) => {
            return Err(SyncError::Decode(format!(
                "sync_status is not an array or object: {}",
                other
            )));
        }
    }
    Ok(statuses)
}

fn parse_status_value(value: &Value) -> CommandStatus {
    match value {
        Value::String(s) if s == "ok" => CommandStatus::Ok,
        Value::String(s) => CommandStatus::Failed {
            code: None,
            message: s.clone(),
        },
        Value::Object(obj) => CommandStatus::Failed {
            code: obj.get("error_code").and_then(Value::as_i64),
            message: obj
                .get("error")
                .and_then(Value::as_str)
                .or_else(|| obj.get("error_tag").and_then(Value::as_str))
                .unwrap_or("Unknown error")
                .to_string(),
        },
        other => CommandStatus::Failed {
            code: None,
            message: other.to_string(),
        },
    }
}
