use thiserror::Error;

/// Errors surfaced by the sync layer.
///
/// Every variant reaches the direct caller; nothing here is retried internally.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Failed to {operation} for {url}: {message}")]
    Transport {
        operation: String,
        url: String,
        message: String,
    },

    #[error("HTTP {status} error from {url}: {body}")]
    Http { status: u16, url: String, body: String },

    #[error("Todoist API error: {tag} - {message}")]
    Api { tag: String, message: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("{entity} with ID {id} already exists")]
    Conflict { entity: &'static str, id: String },

    #[error("Unknown/unsupported {entity} field: {field}")]
    UnknownField { entity: &'static str, field: String },

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("label not found: {label}")]
    LabelNotFound { label: String },

    #[error("Entity {temp_id} has no server ID: {reason}")]
    Unresolved { temp_id: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// True for the local-create conflict, so callers can branch on it.
    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncError::Conflict { .. })
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Decode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
