//! Settings file for the Kiln host.
//!
//! Loaded from TOML (`kiln.toml` by default) and validated before anything
//! binds a socket or touches the instance root.

use std::net::{SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use kiln_instance::{BindingPool, ConsoleFilter, InstanceError, Package, StaticCatalog};
use kiln_protocol::InstanceConfiguration;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::auth::User;

/// Environment variable consulted when `instances.root` is not set.
pub const ROOT_ENV: &str = "KILN_ROOT";

static LISTENER_BINDING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9.]+):(\d+)$").expect("static regex is valid"));

fn default_idle_timeout() -> u64 {
    300
}

fn default_poll_interval() -> u64 {
    50
}

fn default_max_concurrent() -> usize {
    1
}

fn default_java() -> String {
    "java".to_string()
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_level() -> String {
    "info".to_string()
}

/// Errors raised while loading or validating [`Settings`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse settings: {0}")]
    Parse(#[from] toml::de::Error),

    /// A listener binding is not `ip:port`.
    #[error("{field} '{value}' is invalid, the format is ip:port")]
    InvalidBinding { field: &'static str, value: String },

    #[error("invalid instance bindings: {0}")]
    InstanceBindings(#[source] InstanceError),

    #[error("invalid console pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: String,
    },

    /// Neither `instances.root` nor `KILN_ROOT` is set.
    #[error("no instance root configured (set instances.root or {ROOT_ENV})")]
    RootNotSet,

    #[error("instance root {0} is not a directory")]
    RootMissing(PathBuf),
}

/// Top-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub service: ServiceSettings,
    /// The browser listener is optional.
    #[serde(default)]
    pub websocket: Option<WebSocketSettings>,
    #[serde(default)]
    pub instances: InstanceSettings,
    #[serde(default)]
    pub packages: Vec<PackageEntry>,
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// The binary protocol listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    pub binding: String,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_instances: usize,
    /// Seconds of silence before a peer is dropped.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Sleep between multiplexer passes.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketSettings {
    pub binding: String,
    #[serde(default)]
    pub trust_forwarded_for: bool,
    /// Host name players connect to; shown as `<host>:<port>`.
    #[serde(default = "default_hostname")]
    pub public_hostname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSettings {
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_java")]
    pub default_java: String,
    #[serde(default)]
    pub bindings: Vec<String>,
    #[serde(default)]
    pub ignore_console: Vec<String>,
    #[serde(default)]
    pub ignore_console_patterns: Vec<String>,
}

impl Default for InstanceSettings {
    fn default() -> Self {
        Self {
            root: None,
            default_java: default_java(),
            bindings: Vec::new(),
            ignore_console: Vec::new(),
            ignore_console_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageEntry {
    pub name: String,
    pub archive: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

impl Settings {
    /// Reads and validates a settings file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = Self::from_toml(&content)?;
        tracing::info!(path = %path.display(), "settings loaded");
        Ok(settings)
    }

    /// Parses and validates settings text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let settings: Self = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks every value that does not need the filesystem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.service_addr()?;
        self.websocket_addr()?;
        if self.service.max_concurrent_instances == 0 {
            return Err(ConfigError::InvalidValue {
                field: "service.max_concurrent_instances",
                reason: "must be at least 1".into(),
            });
        }
        if self.service.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "service.poll_interval_ms",
                reason: "must be at least 1".into(),
            });
        }
        if self.instances.default_java.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "instances.default_java",
                reason: "must not be empty".into(),
            });
        }
        BindingPool::from_entries(&self.instances.bindings)
            .map_err(ConfigError::InstanceBindings)?;
        self.console_filter()?;
        Ok(())
    }

    pub fn service_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_listener("service.binding", &self.service.binding)
    }

    pub fn websocket_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        self.websocket
            .as_ref()
            .map(|ws| parse_listener("websocket.binding", &ws.binding))
            .transpose()
    }

    /// The instance root from the file, else from `KILN_ROOT`. It must be
    /// an existing directory.
    pub fn resolve_root(&self) -> Result<PathBuf, ConfigError> {
        let root = match &self.instances.root {
            Some(root) => root.clone(),
            None => std::env::var_os(ROOT_ENV)
                .map(PathBuf::from)
                .ok_or(ConfigError::RootNotSet)?,
        };
        if !root.is_dir() {
            return Err(ConfigError::RootMissing(root));
        }
        Ok(root)
    }

    pub fn binding_pool(&self) -> Result<BindingPool, ConfigError> {
        BindingPool::from_entries(&self.instances.bindings).map_err(ConfigError::InstanceBindings)
    }

    pub fn console_filter(&self) -> Result<ConsoleFilter, ConfigError> {
        let patterns = self
            .instances
            .ignore_console_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ConsoleFilter::new(
            self.instances.ignore_console.iter().cloned(),
            patterns,
        ))
    }

    /// Package archives given relative to the root are resolved against it.
    pub fn catalog(&self, root: &Path) -> StaticCatalog {
        StaticCatalog::new(
            self.packages
                .iter()
                .map(|entry| Package::new(entry.name.clone(), root.join(&entry.archive))),
        )
    }

    /// Configuration used for instances created from the browser, which
    /// does not send one.
    pub fn default_configuration(&self) -> InstanceConfiguration {
        InstanceConfiguration::with_java(self.instances.default_java.clone())
    }
}

fn parse_listener(field: &'static str, value: &str) -> Result<SocketAddr, ConfigError> {
    let invalid = || ConfigError::InvalidBinding {
        field,
        value: value.to_string(),
    };
    let captures = LISTENER_BINDING.captures(value).ok_or_else(invalid)?;
    let ip = captures[1].parse().map_err(|_| invalid())?;
    let port = captures[2].parse().map_err(|_| invalid())?;
    Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}
