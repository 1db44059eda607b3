use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Task priority, 1 (lowest) to 4 (most urgent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub u8);

impl Priority {
    pub const VERY_LOW: Priority = Priority(1);
    pub const LOW: Priority = Priority(2);
    pub const MEDIUM: Priority = Priority(3);
    pub const HIGH: Priority = Priority(4);

    pub fn label(&self) -> &'static str {
        match self.0 {
            4 => "High",
            3 => "Medium",
            2 => "Low",
            1 => "Very Low",
            _ => "Unknown",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::VERY_LOW
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Deserialize)]
struct DueFields {
    #[serde(default)]
    date: String,
    #[serde(default)]
    string: String,
    #[serde(default)]
    lang: Option<String>,
    #[serde(default)]
    timezone: Option<String>,
    #[serde(default)]
    is_recurring: bool,
}

/// Due date as sent by the server, plus the instant parsed from `date`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DueFields")]
pub struct Due {
    pub date: String,
    pub string: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    pub is_recurring: bool,
    #[serde(skip)]
    pub parsed: Option<NaiveDateTime>,
}

impl Due {
    pub fn new(date: impl Into<String>) -> Result<Self, String> {
        let date = date.into();
        let parsed = parse_due_date(&date)?;
        Ok(Self {
            string: date.clone(),
            date,
            lang: None,
            timezone: None,
            is_recurring: false,
            parsed,
        })
    }
}

impl TryFrom<DueFields> for Due {
    type Error = String;

    fn try_from(raw: DueFields) -> Result<Self, Self::Error> {
        let parsed = parse_due_date(&raw.date)?;
        Ok(Self {
            date: raw.date,
            string: raw.string,
            lang: raw.lang,
            timezone: raw.timezone,
            is_recurring: raw.is_recurring,
            parsed,
        })
    }
}

/// Accepts floating datetimes, plain dates, and RFC 3339 timestamps (normalized to UTC).
fn parse_due_date(date: &str) -> Result<Option<NaiveDateTime>, String> {
    if date.is_empty() {
        return Ok(None);
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(date, "%Y-%m-%dT%H:%M:%S") {
        return Ok(Some(dt));
    }
    if let Ok(d) = NaiveDate::parse_from_str(date, "%Y-%m-%d") {
        return Ok(d.and_hms_opt(0, 0, 0));
    }
    DateTime::parse_from_rfc3339(date)
        .map(|dt| Some(dt.with_timezone(&Utc).naive_utc()))
        .map_err(|e| format!("invalid due date {:?}: {}", date, e))
}

#[derive(Debug, Deserialize)]
struct DeadlineFields {
    #[serde(default)]
    date: String,
    #[serde(default)]
    lang: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DeadlineFields")]
pub struct Deadline {
    pub date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    #[serde(skip)]
    pub parsed: Option<NaiveDate>,
}

impl TryFrom<DeadlineFields> for Deadline {
    type Error = String;

    fn try_from(raw: DeadlineFields) -> Result<Self, Self::Error> {
        let parsed = if raw.date.is_empty() {
            None
        } else {
            Some(
                NaiveDate::parse_from_str(&raw.date, "%Y-%m-%d")
                    .map_err(|e| format!("invalid deadline {:?}: {}", raw.date, e))?,
            )
        };
        Ok(Self {
            date: raw.date,
            lang: raw.lang,
            parsed,
        })
    }
}

/// A task as mirrored locally.
///
/// `id` is empty until the server assigns one. A task with an empty `id` and a
/// `temp_id` is pending creation; its store key is the temporary ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub id: String,

    pub content: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub project_id: String,

    #[serde(default)]
    pub section_id: Option<String>,

    #[serde(default)]
    pub parent_id: Option<String>,

    #[serde(default, alias = "child_order")]
    pub order: i64,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default)]
    pub due: Option<Due>,

    #[serde(default)]
    pub deadline: Option<Deadline>,

    #[serde(default, deserialize_with = "null_as_empty")]
    pub labels: Vec<String>,

    #[serde(default, alias = "is_completed")]
    pub checked: bool,

    /// Only present in incremental batch snapshots
    #[serde(default, skip_serializing)]
    pub is_deleted: bool,

    #[serde(skip)]
    pub temp_id: Option<String>,
}

impl Task {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            content: content.into(),
            description: String::new(),
            project_id: String::new(),
            section_id: None,
            parent_id: None,
            order: 0,
            priority: Priority::default(),
            due: None,
            deadline: None,
            labels: Vec::new(),
            checked: false,
            is_deleted: false,
            temp_id: None,
        }
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = project_id.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_persisted(&self) -> bool {
        !self.id.is_empty()
    }

    pub fn is_pending(&self) -> bool {
        self.id.is_empty() && self.temp_id.is_some()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.content)
    }
}

/// Todoist project as mirrored locally. Same identity rules as [`Task`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    #[serde(default)]
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub color: String,

    #[serde(default)]
    pub parent_id: Option<String>,

    #[serde(default, alias = "child_order")]
    pub order: i64,

    #[serde(default, alias = "shared")]
    pub is_shared: bool,

    #[serde(default, alias = "inbox_project")]
    pub is_inbox_project: bool,

    #[serde(default)]
    pub is_favorite: bool,

    #[serde(default)]
    pub is_archived: bool,

    #[serde(default)]
    pub view_style: String,

    #[serde(default, skip_serializing)]
    pub is_deleted: bool,

    #[serde(skip)]
    pub temp_id: Option<String>,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            description: String::new(),
            color: String::new(),
            parent_id: None,
            order: 0,
            is_shared: false,
            is_inbox_project: false,
            is_favorite: false,
            is_archived: false,
            view_style: String::new(),
            is_deleted: false,
            temp_id: None,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn is_pending(&self) -> bool {
        self.id.is_empty() && self.temp_id.is_some()
    }
}

/// Comment attached to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,

    #[serde(default, alias = "item_id")]
    pub task_id: String,

    pub content: String,

    #[serde(default)]
    pub posted_at: Option<String>,

    #[serde(default)]
    pub project_id: Option<String>,
}

impl Comment {
    pub fn posted_at_utc(&self) -> Option<DateTime<Utc>> {
        self.posted_at.as_deref().and_then(|s| {
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        })
    }
}

/// Envelope returned by the batch sync endpoint, for pulls and command commits alike.
#[derive(Debug, Default, Deserialize)]
pub struct SyncResponse {
    /// Opaque cursor for the next incremental pull
    #[serde(default)]
    pub sync_token: Option<String>,
    #[serde(default)]
    pub full_sync: bool,
    #[serde(default)]
    pub items: Vec<Task>,
    #[serde(default)]
    pub projects: Vec<Project>,
    /// Per-command status keyed by command UUID (or an array of statuses)
    #[serde(default)]
    pub sync_status: Option<serde_json::Value>,
    #[serde(default)]
    pub temp_id_mapping: std::collections::HashMap<String, String>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}
