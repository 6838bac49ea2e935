//! Tool server launch configuration
//!
//! Parses a TOML file describing how to spawn the tool server. The `env`
//! table is passed to the child as-is; this crate never interprets it.
//!
//! ```toml
//! name = "arangodb"
//! command = "node"
//! args = ["mcp-server-arangodb/build/index.js"]
//! ready_marker = "running on stdio"
//!
//! [env]
//! ARANGO_URL = "http://localhost:8529"
//! ARANGO_DB = "newsDB"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rpc::Framing;
use crate::utils::validate_and_canonicalize_path;
use crate::{Error, Result};

/// Environment variable pointing at an alternative config file
pub const CONFIG_ENV_VAR: &str = "MCP_STDIO_CONFIG";

/// How to launch and talk to one tool server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolServerConfig {
    /// Label used in logs
    pub name: String,

    /// Executable, looked up in PATH unless it contains a path separator
    pub command: String,

    pub args: Vec<String>,

    /// Working directory for the child
    pub cwd: Option<PathBuf>,

    /// Extra environment variables for the child (connection settings, secrets)
    pub env: BTreeMap<String, String>,

    /// Substring of a stderr line that signals the server is ready
    pub ready_marker: Option<String>,

    pub startup_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub shutdown_grace_ms: u64,

    pub framing: Framing,

    /// Run the MCP `initialize` handshake after startup
    pub initialize: bool,

    /// Client name reported in the handshake
    pub client_name: String,
}

impl Default for ToolServerConfig {
    fn default() -> Self {
        Self {
            name: "tool-server".to_string(),
            command: String::new(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            ready_marker: None,
            startup_timeout_ms: 5_000,
            request_timeout_ms: 30_000,
            shutdown_grace_ms: 2_000,
            framing: Framing::default(),
            initialize: false,
            client_name: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

impl ToolServerConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Check the config can be used to spawn a server
    pub fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(Error::Config(format!(
                "server '{}' has no command configured",
                self.name
            )));
        }
        if self.request_timeout_ms == 0 {
            return Err(Error::Config("request_timeout_ms must be > 0".to_string()));
        }
        if let Some(cwd) = &self.cwd {
            validate_and_canonicalize_path(cwd)?;
        }
        Ok(())
    }

    /// Find the executable to spawn
    pub fn resolve_command(&self) -> Result<PathBuf> {
        let command = Path::new(&self.command);
        if command.components().count() > 1 {
            // Relative paths resolve against the child's working directory
            return Ok(match (&self.cwd, command.is_relative()) {
                (Some(cwd), true) => cwd.join(command),
                _ => command.to_path_buf(),
            });
        }

        which::which(&self.command).map_err(|e| {
            Error::Spawn(format!("'{}' not found in PATH: {}", self.command, e))
        })
    }
}

/// Default config location: `<config dir>/mcp-stdio-client/config.toml`
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("mcp-stdio-client"))
        .unwrap_or_else(|| PathBuf::from(".mcp-stdio-client"))
        .join("config.toml")
}

/// Read the config named by `MCP_STDIO_CONFIG`, or the default file.
///
/// A missing default file yields the defaults.
pub fn read_config() -> Result<ToolServerConfig> {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        return read_config_from_path(Path::new(&path));
    }

    let config_path = default_config_path();
    if !config_path.exists() {
        tracing::warn!("Tool server config not found at {:?}", config_path);
        return Ok(ToolServerConfig::default());
    }

    read_config_from_path(&config_path)
}

/// Read configuration from a specific path
pub fn read_config_from_path(path: &Path) -> Result<ToolServerConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read {}: {}", path.display(), e))
    })?;

    let config: ToolServerConfig = toml::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse {}: {}", path.display(), e))
    })?;

    tracing::debug!(
        "Loaded config for '{}' with {} env var(s)",
        config.name,
        config.env.len()
    );

    Ok(config)
}
