use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;

/// Default worker command, overridable via the `DENO_EXECUTABLE`
/// environment variable.
const DENO_EXECUTABLE: &str = "deno";

/// How long `close()` waits for the worker to exit after its stdin is
/// closed before killing it.
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Configuration for spawning a VM server process.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Command used to start the worker runtime.
    #[serde(default = "default_command")]
    pub command: String,
    /// Grace period for clean worker shutdown, in milliseconds.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_command() -> String {
    std::env::var("DENO_EXECUTABLE").unwrap_or_else(|_| DENO_EXECUTABLE.to_string())
}

fn default_shutdown_grace_ms() -> u64 {
    DEFAULT_SHUTDOWN_GRACE.as_millis() as u64
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl ServerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Loads a TOML config file. Values like `${DENO_EXECUTABLE}` are
    /// expanded from the environment before parsing.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::error::VmError::Validation(format!("config {path}: {e}")))?;
        let expanded = shellexpand::env(&content)
            .map_err(|e| crate::error::VmError::Validation(format!("config {path}: {e}")))?;
        let config: ServerConfig = toml::from_str(&expanded)
            .map_err(|e| crate::error::VmError::Validation(format!("config {path}: {e}")))?;
        Ok(config)
    }
}
