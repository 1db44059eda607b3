//! Client-side sync layer for Todoist
//!
//! Keeps an in-memory mirror of tasks and projects in step with the remote
//! service:
//!
//! - `reconcile` - cursor pagination, snapshot merging, temp-ID promotion
//! - `backlog` - staged commands for the batch sync endpoint
//! - `store` - ID-keyed task and project stores
//! - `context` - key-value documents kept in a tagged task comment
//! - `client` - the `Client` facade tying these to a `Transport`
//! - `transport` - reqwest-based HTTP transport
//! - `config` - layered configuration (files, environment, overrides)
//! - `fake` - in-memory backend for tests (`test-helpers` feature)

pub mod backlog;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod models;
pub mod reconcile;
pub mod store;
pub mod transport;
pub mod update;

#[cfg(any(test, feature = "test-helpers"))]
pub mod fake;

pub use backlog::{BatchResult, Command, CommandBacklog, CommandKind, CommandOutcome, CommandStatus};
pub use client::{Client, SyncSummary};
pub use config::{Config, ConfigBuilder, ConfigLayer};
pub use context::{CONTEXT_PREFIX, ContextDocument};
pub use error::{Result, SyncError};
pub use models::*;
pub use store::{Entity, EntityStore, ProjectStore, TaskStore, UnresolvedCreate};
pub use transport::{HttpTransport, Transport};
pub use update::{ProjectUpdate, TaskField, TaskUpdate};
