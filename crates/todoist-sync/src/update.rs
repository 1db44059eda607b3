//! Typed field updates for tasks and projects.
//!
//! Each variant knows its wire field name, the JSON it contributes to a
//! sparse patch body, and how to apply itself to the local copy.

use serde_json::{Map, Value, json};
use std::str::FromStr;

use crate::error::{Result, SyncError};
use crate::models::{Deadline, Due, Priority, Project, Task};

#[derive(Debug, Clone, PartialEq)]
pub enum TaskUpdate {
    Content(String),
    Description(String),
    ProjectId(String),
    SectionId(Option<String>),
    ParentId(Option<String>),
    Order(i64),
    Priority(Priority),
    Due(Option<Due>),
    Deadline(Option<Deadline>),
    Labels(Vec<String>),
}

/// Field names accepted from untyped input (CLI, config), mapped onto [`TaskUpdate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskField {
    Content,
    Description,
    ProjectId,
    SectionId,
    ParentId,
    Order,
    Priority,
    Due,
    Deadline,
    Labels,
}

impl FromStr for TaskField {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "content" | "Content" => TaskField::Content,
            "description" | "Description" => TaskField::Description,
            "project_id" | "ProjectID" => TaskField::ProjectId,
            "section_id" | "SectionID" => TaskField::SectionId,
            "parent_id" | "ParentID" => TaskField::ParentId,
            "order" | "Order" => TaskField::Order,
            "priority" | "Priority" => TaskField::Priority,
            "due" | "Due" => TaskField::Due,
            "deadline" | "Deadline" => TaskField::Deadline,
            "labels" | "Labels" => TaskField::Labels,
            other => {
                return Err(SyncError::UnknownField {
                    entity: "task",
                    field: other.to_string(),
                });
            }
        })
    }
}

impl TaskField {
    /// Build an update from a raw string value. Empty values clear optional fields;
    /// labels are comma separated.
    pub fn parse_value(self, raw: &str) -> Result<TaskUpdate> {
        let optional = || (!raw.is_empty()).then(|| raw.to_string());
        Ok(match self {
            TaskField::Content => TaskUpdate::Content(raw.to_string()),
            TaskField::Description => TaskUpdate::Description(raw.to_string()),
            TaskField::ProjectId => TaskUpdate::ProjectId(raw.to_string()),
            TaskField::SectionId => TaskUpdate::SectionId(optional()),
            TaskField::ParentId => TaskUpdate::ParentId(optional()),
            TaskField::Order => TaskUpdate::Order(
                raw.parse()
                    .map_err(|e| SyncError::Decode(format!("invalid order {:?}: {}", raw, e)))?,
            ),
            TaskField::Priority => {
                let level: u8 = raw
                    .parse()
                    .map_err(|e| SyncError::Decode(format!("invalid priority {:?}: {}", raw, e)))?;
                if !(1..=4).contains(&level) {
                    return Err(SyncError::Decode(format!(
                        "priority must be between 1 and 4, got {}",
                        level
                    )));
                }
                TaskUpdate::Priority(Priority(level))
            }
            TaskField::Due => TaskUpdate::Due(match optional() {
                Some(date) => Some(Due::new(date).map_err(SyncError::Decode)?),
                None => None,
            }),
            TaskField::Deadline => TaskUpdate::Deadline(match optional() {
                Some(date) => Some(serde_json::from_value(json!({ "date": date }))?),
                None => None,
            }),
            TaskField::Labels => TaskUpdate::Labels(
                raw.split(',')
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(String::from)
                    .collect(),
            ),
        })
    }
}

impl TaskUpdate {
    pub fn field_name(&self) -> &'static str {
        match self {
            TaskUpdate::Content(_) => "content",
            TaskUpdate::Description(_) => "description",
            TaskUpdate::ProjectId(_) => "project_id",
            TaskUpdate::SectionId(_) => "section_id",
            TaskUpdate::ParentId(_) => "parent_id",
            TaskUpdate::Order(_) => "order",
            TaskUpdate::Priority(_) => "priority",
            TaskUpdate::Due(_) => "due",
            TaskUpdate::Deadline(_) => "deadline",
            TaskUpdate::Labels(_) => "labels",
        }
    }

    pub fn value(&self) -> Value {
        match self {
            TaskUpdate::Content(s) | TaskUpdate::Description(s) | TaskUpdate::ProjectId(s) => {
                json!(s)
            }
            TaskUpdate::SectionId(s) | TaskUpdate::ParentId(s) => json!(s),
            TaskUpdate::Order(o) => json!(o),
            TaskUpdate::Priority(p) => json!(p),
            TaskUpdate::Due(d) => json!(d),
            TaskUpdate::Deadline(d) => json!(d),
            TaskUpdate::Labels(l) => json!(l),
        }
    }

    /// Sparse body for the direct endpoint: only this field.
    pub fn patch(&self) -> Map<String, Value> {
        let mut body = Map::new();
        body.insert(self.field_name().to_string(), self.value());
        body
    }

    pub fn apply(&self, task: &mut Task) {
        match self {
            TaskUpdate::Content(s) => task.content = s.clone(),
            TaskUpdate::Description(s) => task.description = s.clone(),
            TaskUpdate::ProjectId(s) => task.project_id = s.clone(),
            TaskUpdate::SectionId(s) => task.section_id = s.clone(),
            TaskUpdate::ParentId(s) => task.parent_id = s.clone(),
            TaskUpdate::Order(o) => task.order = *o,
            TaskUpdate::Priority(p) => task.priority = *p,
            TaskUpdate::Due(d) => task.due = d.clone(),
            TaskUpdate::Deadline(d) => task.deadline = d.clone(),
            TaskUpdate::Labels(l) => task.labels = l.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProjectUpdate {
    Name(String),
    Description(String),
    Color(String),
    IsFavorite(bool),
    ViewStyle(String),
}

impl ProjectUpdate {
    pub fn field_name(&self) -> &'static str {
        match self {
            ProjectUpdate::Name(_) => "name",
            ProjectUpdate::Description(_) => "description",
            ProjectUpdate::Color(_) => "color",
            ProjectUpdate::IsFavorite(_) => "is_favorite",
            ProjectUpdate::ViewStyle(_) => "view_style",
        }
    }

    pub fn value(&self) -> Value {
        match self {
            ProjectUpdate::Name(s)
            | ProjectUpdate::Description(s)
            | ProjectUpdate::Color(s)
            | ProjectUpdate::ViewStyle(s) => json!(s),
            ProjectUpdate::IsFavorite(b) => json!(b),
        }
    }

    pub fn patch(&self) -> Map<String, Value> {
        let mut body = Map::new();
        body.insert(self.field_name().to_string(), self.value());
        body
    }

    pub fn apply(&self, project: &mut Project) {
        match self {
            ProjectUpdate::Name(s) => project.name = s.clone(),
            ProjectUpdate::Description(s) => project.description = s.clone(),
            ProjectUpdate::Color(s) => project.color = s.clone(),
            ProjectUpdate::IsFavorite(b) => project.is_favorite = *b,
            ProjectUpdate::ViewStyle(s) => project.view_style = s.clone(),
        }
    }
}
