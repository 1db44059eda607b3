use clap::{Parser, Subcommand};
use std::path::PathBuf;

const DEFAULT_CONFIG_FILES: [&str; 2] = ["todoist.toml", "todoist.yaml"];

#[derive(Parser, Debug)]
#[command(name = "todoist-sync")]
#[command(about = "Mirror and edit Todoist tasks and projects from the command line")]
pub struct Cli {
    /// Config file (TOML or YAML). May be given several times; later files win
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Vec<PathBuf>,

    /// API token (overrides config files and TODOIST_TOKEN)
    #[arg(short = 't', long)]
    pub token: Option<String>,

    /// Base URL of the API
    #[arg(long, value_name = "URL")]
    pub api_url: Option<String>,

    /// Stage writes and send them through the batch sync endpoint
    #[arg(long)]
    pub sync_api: bool,

    /// Debug logging
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn config_files(&self) -> Vec<PathBuf> {
        if self.config.is_empty() {
            DEFAULT_CONFIG_FILES.iter().map(PathBuf::from).collect()
        } else {
            self.config.clone()
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Pull tasks and projects and print a summary
    Sync,

    /// List tasks
    Tasks {
        /// Only tasks in this project
        #[arg(long)]
        project: Option<String>,

        /// Include completed tasks
        #[arg(short, long)]
        all: bool,
    },

    /// List projects
    Projects,

    /// Create a task
    Add {
        content: String,

        #[arg(long)]
        project: Option<String>,

        /// 1 (lowest) to 4 (most urgent)
        #[arg(long, value_parser = clap::value_parser!(u8).range(1..=4))]
        priority: Option<u8>,

        #[arg(short, long = "label")]
        labels: Vec<String>,
    },

    /// Complete a task
    Close { id: String },

    /// Reopen a completed task
    Reopen { id: String },

    /// Set one task field, e.g. `set 42 priority 4`
    Set {
        id: String,
        field: String,
        /// New value; empty clears optional fields, labels are comma separated
        value: String,
    },

    /// Add a label to a task
    Label { id: String, label: String },

    /// Remove a label from a task
    Unlabel { id: String, label: String },

    /// Show a task's subtasks
    Tree { id: String },

    /// List a task's comments
    Comments { id: String },

    /// Read or edit the context document attached to a task
    Context {
        #[command(subcommand)]
        action: ContextAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ContextAction {
    /// Print the document, or a single key
    Get { id: String, key: Option<String> },

    /// Set one key. The value is parsed as JSON, falling back to a plain string
    Set { id: String, key: String, value: String },

    /// Remove one key
    Unset { id: String, key: String },

    /// Remove the whole document
    Clear { id: String },
}

impl Command {
    /// Commands that stage commands in batch mode and need a commit afterwards.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Command::Add { .. }
                | Command::Close { .. }
                | Command::Reopen { .. }
                | Command::Set { .. }
                | Command::Label { .. }
                | Command::Unlabel { .. }
        )
    }
}
