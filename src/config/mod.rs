use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};

/// Launch specification for a managed tool server process.
///
/// The core treats the command, arguments and environment as opaque: it only
/// spawns what it is told. Parsing these out of a config file or CLI is the
/// caller's concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchSpec {
    /// Path to the executable to run
    pub command: PathBuf,

    /// Command-line arguments
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the process
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Signal to send on stop (default: SIGTERM)
    #[serde(default = "default_stop_signal")]
    pub stop_signal: String,

    /// Grace period before escalating to SIGKILL (in seconds)
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

// Default value functions for serde
fn default_stop_signal() -> String {
    "SIGTERM".to_string()
}

fn default_stop_timeout() -> u64 {
    10
}

impl LaunchSpec {
    /// Create a spec for the given executable with defaults for everything else
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            stop_signal: default_stop_signal(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }

    /// Replace the argument list
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Add an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Validate the spec before it is accepted into the registry
    pub fn validate(&self) -> Result<()> {
        if self.command.as_os_str().is_empty() {
            return Err(FleetError::InvalidSpec("command must not be empty".to_string()));
        }

        if self.stop_timeout_secs == 0 {
            return Err(FleetError::InvalidSpec(
                "stop_timeout_secs must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Grace period to wait for a signaled process to exit
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

/// Health checking configuration shared by all managed processes
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// How often to probe a running process
    pub check_interval: Duration,

    /// Deadline for a single probe
    pub probe_timeout: Duration,

    /// Consecutive failures before the process is treated as exited
    pub failure_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
            failure_threshold: 3,
        }
    }
}

/// Supervisor configuration
#[derive(Debug, Clone, Default)]
pub struct SupervisorConfig {
    /// Health checking settings
    pub health: HealthConfig,
}
