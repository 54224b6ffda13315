use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::config::LaunchSpec;
use crate::error::{FleetError, Result};
use crate::process::health::HealthRecord;
use crate::process::restart::{RestartHistory, RestartPolicy};
use crate::registry::ProcessId;

/// Lifecycle state of a managed process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Restarting,
    Failed,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Stopped => write!(f, "stopped"),
            ProcessState::Starting => write!(f, "starting"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Restarting => write!(f, "restarting"),
            ProcessState::Failed => write!(f, "failed"),
        }
    }
}

impl ProcessState {
    /// Whether `next` is reachable from this state.
    ///
    /// `stopped` and `failed` are terminal for automatic action; both accept
    /// an explicit start. A stop request cancels a pending relaunch, so
    /// `restarting -> stopped` is reachable too.
    pub fn can_transition_to(self, next: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Starting, Stopped)
                | (Running, Stopped)
                | (Running, Restarting)
                | (Running, Failed)
                | (Restarting, Starting)
                | (Restarting, Failed)
                | (Restarting, Stopped)
                | (Failed, Starting)
        )
    }

    /// States in which the supervisor considers the process in-flight
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ProcessState::Starting | ProcessState::Running | ProcessState::Restarting
        )
    }
}

/// Registry record for a single managed process.
///
/// Owned exclusively by the [`ProcessRegistry`](crate::registry::ProcessRegistry);
/// mutated only under the per-id record lock.
#[derive(Debug)]
pub struct ManagedProcess {
    pub id: ProcessId,
    pub spec: LaunchSpec,
    pub policy: RestartPolicy,
    pub state: ProcessState,
    /// OS pid of the current spawn, if any
    pub pid: Option<u32>,
    /// Monotone counter, bumped on every spawn. Exit notifications carry the
    /// epoch they belong to so stale watchers are ignored.
    pub epoch: u64,
    /// Set by an operator stop for the current epoch; distinguishes an
    /// expected exit from a crash.
    pub stop_requested: bool,
    pub restart_count: usize,
    pub started_at: Option<SystemTime>,
    pub last_restart: Option<SystemTime>,
    pub last_exit_code: Option<i32>,
    pub history: RestartHistory,
    pub health: HealthRecord,
    /// Broadcasts the epoch of the most recently confirmed exit
    pub exited: watch::Sender<u64>,
}

impl ManagedProcess {
    pub fn new(id: ProcessId, spec: LaunchSpec, policy: RestartPolicy) -> Self {
        let (exited, _) = watch::channel(0);
        Self {
            id,
            spec,
            policy,
            state: ProcessState::Stopped,
            pid: None,
            epoch: 0,
            stop_requested: false,
            restart_count: 0,
            started_at: None,
            last_restart: None,
            last_exit_code: None,
            history: RestartHistory::new(),
            health: HealthRecord::new(),
            exited,
        }
    }

    /// Apply a validated state transition
    pub fn set_state(&mut self, next: ProcessState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(FleetError::InvalidTransition {
                id: self.id.to_string(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Time since the current spawn, while the process is in-flight
    pub fn uptime(&self) -> Option<Duration> {
        if !self.state.is_active() {
            return None;
        }
        self.started_at
            .and_then(|at| SystemTime::now().duration_since(at).ok())
    }

    /// Consistent point-in-time status snapshot
    pub fn status(&self) -> ProcessStatus {
        ProcessStatus {
            id: self.id.clone(),
            state: self.state,
            pid: self.pid,
            uptime: self.uptime(),
            restart_count: self.restart_count,
            exit_code: self.last_exit_code,
        }
    }
}

/// Read-surface status snapshot for dashboards, CLIs and pollers
#[derive(Debug, Clone, Serialize)]
pub struct ProcessStatus {
    pub id: ProcessId,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub uptime: Option<Duration>,
    pub restart_count: usize,
    pub exit_code: Option<i32>,
}
