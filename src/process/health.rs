use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, System};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::HealthConfig;
use crate::error::FleetError;
use crate::process::supervisor::SupervisorEvent;
use crate::process::types::ProcessState;
use crate::registry::{ProcessId, ProcessRegistry};

/// Health record for a managed process.
///
/// Mutated only by the health checker; read by the supervisor and external
/// status queries. A fresh record reports unhealthy with no message until
/// the first probe lands.
#[derive(Debug, Clone)]
pub struct HealthRecord {
    pub is_healthy: bool,
    pub message: Option<String>,
    pub consecutive_failures: u32,
    pub last_check: Option<SystemTime>,
}

impl HealthRecord {
    pub fn new() -> Self {
        Self {
            is_healthy: false,
            message: None,
            consecutive_failures: 0,
            last_check: None,
        }
    }

    /// Successful probe: counter back to zero, message cleared
    pub fn record_success(&mut self, at: SystemTime) {
        self.is_healthy = true;
        self.message = None;
        self.consecutive_failures = 0;
        self.last_check = Some(at);
    }

    /// Failed probe: counter up by exactly one
    pub fn record_failure(&mut self, at: SystemTime, message: String) {
        self.is_healthy = false;
        self.message = Some(message);
        self.consecutive_failures += 1;
        self.last_check = Some(at);
    }

    /// Fresh record for a new spawn
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn snapshot(&self) -> HealthStatus {
        HealthStatus {
            is_healthy: self.is_healthy,
            message: self.message.clone(),
            consecutive_failures: self.consecutive_failures,
            last_check: self.last_check,
        }
    }
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-surface health snapshot
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub is_healthy: bool,
    pub message: Option<String>,
    pub consecutive_failures: u32,
    pub last_check: Option<SystemTime>,
}

/// Liveness/readiness probe contract.
///
/// The supervisor core only needs success or failure plus an optional
/// diagnostic; what a probe actually checks (an HTTP ping, a pid lookup, a
/// handshake) is the collaborator's business.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, id: &ProcessId, pid: u32) -> std::result::Result<(), String>;
}

/// Built-in probe that checks whether the pid is still alive
pub struct PidProbe {
    system: std::sync::Mutex<System>,
}

impl PidProbe {
    pub fn new() -> Self {
        Self {
            system: std::sync::Mutex::new(System::new()),
        }
    }
}

impl Default for PidProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthProbe for PidProbe {
    async fn probe(&self, _id: &ProcessId, pid: u32) -> std::result::Result<(), String> {
        let sys_pid = Pid::from_u32(pid);
        let mut system = self.system.lock().expect("pid probe lock poisoned");
        system.refresh_processes_specifics(
            sysinfo::ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::everything(),
        );

        if system.process(sys_pid).is_some() {
            Ok(())
        } else {
            Err(format!("pid {} is not alive", pid))
        }
    }
}

/// Periodic probe driver: one loop task per managed process.
///
/// A loop only probes while its process is `running`; in every other state
/// the cycle is skipped, so a `failed` process receives no probes until it
/// is started again. Probes for one id are strictly sequential because the
/// loop awaits each probe before scheduling the next.
pub struct HealthChecker {
    registry: Arc<ProcessRegistry>,
    probe: Arc<dyn HealthProbe>,
    config: HealthConfig,
    events: mpsc::UnboundedSender<SupervisorEvent>,
}

impl HealthChecker {
    pub fn new(
        registry: Arc<ProcessRegistry>,
        probe: Arc<dyn HealthProbe>,
        config: HealthConfig,
        events: mpsc::UnboundedSender<SupervisorEvent>,
    ) -> Self {
        Self {
            registry,
            probe,
            config,
            events,
        }
    }

    /// Spawn the probe loop for `id`. The loop exits when the record is
    /// deregistered or `shutdown` fires.
    pub fn spawn_loop(&self, id: ProcessId, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let probe = Arc::clone(&self.probe);
        let config = self.config.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            debug!("Health loop started for '{}'", id);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(config.check_interval) => {}
                }

                let record = match registry.record(&id) {
                    Ok(record) => record,
                    Err(_) => break,
                };

                let (pid, epoch) = {
                    let proc = record.lock().await;
                    if proc.state != ProcessState::Running {
                        continue;
                    }
                    match proc.pid {
                        Some(pid) => (pid, proc.epoch),
                        None => continue,
                    }
                };

                let checked_at = SystemTime::now();
                let outcome =
                    tokio::time::timeout(config.probe_timeout, probe.probe(&id, pid)).await;

                let mut proc = record.lock().await;
                // The process may have been restarted or stopped while the
                // probe was in flight; its result no longer applies.
                if proc.epoch != epoch || proc.state != ProcessState::Running {
                    continue;
                }

                match outcome {
                    Ok(Ok(())) => proc.health.record_success(checked_at),
                    Ok(Err(message)) => {
                        debug!("Probe failed for '{}': {}", id, message);
                        proc.health.record_failure(checked_at, message);
                    }
                    Err(_) => {
                        let err =
                            FleetError::HealthCheckTimeout(id.to_string(), config.probe_timeout);
                        debug!("{}", err);
                        proc.health.record_failure(checked_at, err.to_string());
                    }
                }

                let failures = proc.health.consecutive_failures;
                drop(proc);

                if failures == config.failure_threshold {
                    warn!(
                        "Process '{}' failed {} consecutive probes, signaling supervisor",
                        id, failures
                    );
                    let _ = events.send(SupervisorEvent::Unhealthy {
                        id: id.clone(),
                        epoch,
                        failures,
                    });
                }
            }
            debug!("Health loop stopped for '{}'", id);
        })
    }
}
