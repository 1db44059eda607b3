//! Layered client configuration.
//!
//! Precedence, lowest first: defaults, config files (TOML or YAML) in the order
//! given, `TODOIST_*` environment variables, explicit overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Result, SyncError};

pub const DEFAULT_API_URL: &str = "https://api.todoist.com/api/v1";
pub const DEFAULT_ENV_PREFIX: &str = "TODOIST_";

#[derive(Clone, PartialEq)]
pub struct Config {
    pub token: String,
    pub api_url: String,
    pub timeout_secs: u64,
    pub debug: bool,
    /// Route writes through the batch sync endpoint instead of the REST endpoints
    pub use_sync_api: bool,
    pub page_size: u32,
    /// Drop persisted entries missing from a full listing
    pub prune_on_full_sync: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            token: String::new(),
            api_url: DEFAULT_API_URL.to_string(),
            timeout_secs: 30,
            debug: false,
            use_sync_api: false,
            page_size: 200,
            prune_on_full_sync: false,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("token", &if self.token.is_empty() { "" } else { "***" })
            .field("api_url", &self.api_url)
            .field("timeout_secs", &self.timeout_secs)
            .field("debug", &self.debug)
            .field("use_sync_api", &self.use_sync_api)
            .field("page_size", &self.page_size)
            .field("prune_on_full_sync", &self.prune_on_full_sync)
            .finish()
    }
}

impl Config {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            ..Self::default()
        }
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    pub fn with_sync_api(mut self, use_sync_api: bool) -> Self {
        self.use_sync_api = use_sync_api;
        self
    }
}

/// One configuration source. Unset fields leave lower layers untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigLayer {
    pub token: Option<String>,
    pub api_url: Option<String>,
    #[serde(alias = "timeout")]
    pub timeout_secs: Option<u64>,
    pub debug: Option<bool>,
    pub use_sync_api: Option<bool>,
    pub page_size: Option<u32>,
    pub prune_on_full_sync: Option<bool>,
}

impl ConfigLayer {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("toml") => toml::from_str(&content).map_err(|e| {
                SyncError::Config(format!("Failed to parse TOML {}: {}", path.display(), e))
            }),
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content).map_err(|e| {
                SyncError::Config(format!("Failed to parse YAML {}: {}", path.display(), e))
            }),
            _ => Err(SyncError::Config(format!(
                "unsupported config format for {}",
                path.display()
            ))),
        }
    }

    /// Reads `<prefix>TOKEN`, `<prefix>API_URL`, ... from the given variables.
    pub fn from_env_vars<I>(prefix: &str, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut layer = ConfigLayer::default();
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(prefix) else {
                continue;
            };
            match name.to_ascii_lowercase().as_str() {
                "token" => layer.token = Some(value),
                "api_url" => layer.api_url = Some(value),
                "timeout" | "timeout_secs" => layer.timeout_secs = Some(parse_env(&key, &value)?),
                "debug" => layer.debug = Some(parse_bool(&key, &value)?),
                "use_sync_api" => layer.use_sync_api = Some(parse_bool(&key, &value)?),
                "page_size" => layer.page_size = Some(parse_env(&key, &value)?),
                "prune_on_full_sync" => {
                    layer.prune_on_full_sync = Some(parse_bool(&key, &value)?)
                }
                _ => debug!("[Config] Ignoring unknown variable {}", key),
            }
        }
        Ok(layer)
    }

    pub fn from_env(prefix: &str) -> Result<Self> {
        Self::from_env_vars(prefix, std::env::vars())
    }

    fn apply(self, config: &mut Config) {
        if let Some(token) = self.token.filter(|s| !s.is_empty()) {
            config.token = token;
        }
        if let Some(api_url) = self.api_url.filter(|s| !s.is_empty()) {
            config.api_url = api_url;
        }
        if let Some(timeout) = self.timeout_secs {
            config.timeout_secs = timeout;
        }
        if let Some(debug) = self.debug {
            config.debug = debug;
        }
        if let Some(use_sync_api) = self.use_sync_api {
            config.use_sync_api = use_sync_api;
        }
        if let Some(page_size) = self.page_size {
            config.page_size = page_size;
        }
        if let Some(prune) = self.prune_on_full_sync {
            config.prune_on_full_sync = prune;
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| SyncError::Config(format!("invalid value for {}: {}", key, e)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(SyncError::Config(format!(
            "invalid boolean for {}: {}",
            key, value
        ))),
    }
}

#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    files: Vec<PathBuf>,
    env_prefix: Option<String>,
    env_vars: Option<Vec<(String, String)>>,
    overrides: ConfigLayer,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            env_prefix: Some(DEFAULT_ENV_PREFIX.to_string()),
            env_vars: None,
            overrides: ConfigLayer::default(),
        }
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.files.push(path.into());
        self
    }

    pub fn files<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.files.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn env_prefix(mut self, prefix: Option<&str>) -> Self {
        self.env_prefix = prefix.map(String::from);
        self
    }

    /// Use these variables instead of the process environment.
    pub fn env_vars(mut self, vars: Vec<(String, String)>) -> Self {
        self.env_vars = Some(vars);
        self
    }

    pub fn overrides(mut self, layer: ConfigLayer) -> Self {
        self.overrides = layer;
        self
    }

    pub fn build(self) -> Result<Config> {
        let mut config = Config::default();

        for path in &self.files {
            if path.as_os_str().is_empty() || !path.exists() {
                debug!("[Config] Skipping missing config file {}", path.display());
                continue;
            }
            ConfigLayer::from_file(path)?.apply(&mut config);
        }

        if let Some(prefix) = &self.env_prefix {
            let layer = match self.env_vars {
                Some(vars) => ConfigLayer::from_env_vars(prefix, vars)?,
                None => ConfigLayer::from_env(prefix)?,
            };
            layer.apply(&mut config);
        }

        self.overrides.apply(&mut config);
        debug!("[Config] Resolved {:?}", config);
        Ok(config)
    }
}
