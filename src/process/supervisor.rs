use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SupervisorConfig;
use crate::error::{FleetError, Result};
use crate::process::health::{HealthChecker, HealthProbe, HealthStatus, PidProbe};
use crate::process::restart::{self, DenyReason, RestartDecision};
use crate::process::spawner::spawn_process;
use crate::process::types::{ManagedProcess, ProcessState, ProcessStatus};
use crate::registry::{ProcessId, ProcessRegistry};

/// Internal notifications routed to the supervisor event loop
#[derive(Debug, Clone)]
pub(crate) enum SupervisorEvent {
    /// A spawned child exited; `epoch` identifies which spawn it was
    Exited {
        id: ProcessId,
        epoch: u64,
        code: Option<i32>,
    },
    /// Health checker reports the failure threshold was crossed
    Unhealthy {
        id: ProcessId,
        epoch: u64,
        failures: u32,
    },
}

/// Orchestrates start/stop/restart transitions for every registered process.
///
/// Cheap to clone; all clones share the same registry, event channel and
/// shutdown token. Exit watchers and health loops feed a single event loop
/// task that consults the restart policy engine and relaunches or fails the
/// process accordingly.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    registry: Arc<ProcessRegistry>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    shutdown: CancellationToken,
    health: HealthChecker,
    health_loops: std::sync::Mutex<HashMap<ProcessId, JoinHandle<()>>>,
}

impl Supervisor {
    /// Create a supervisor with the built-in pid-liveness probe
    pub fn new(registry: Arc<ProcessRegistry>, config: SupervisorConfig) -> Self {
        Self::with_probe(registry, config, Arc::new(PidProbe::new()))
    }

    /// Create a supervisor with a caller-supplied health probe
    pub fn with_probe(
        registry: Arc<ProcessRegistry>,
        config: SupervisorConfig,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let health = HealthChecker::new(
            Arc::clone(&registry),
            probe,
            config.health.clone(),
            events.clone(),
        );

        let supervisor = Self {
            inner: Arc::new(SupervisorInner {
                registry,
                events,
                shutdown: CancellationToken::new(),
                health,
                health_loops: std::sync::Mutex::new(HashMap::new()),
            }),
        };
        supervisor.spawn_event_loop(rx);
        supervisor
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.inner.registry
    }

    /// Status snapshot for one process
    pub async fn status(&self, id: &ProcessId) -> Result<ProcessStatus> {
        self.inner.registry.get(id).await
    }

    /// Health snapshot for one process
    pub async fn health(&self, id: &ProcessId) -> Result<HealthStatus> {
        self.inner.registry.health(id).await
    }

    /// Status snapshots for all processes, in registration order
    pub async fn list(&self) -> Vec<ProcessStatus> {
        self.inner.registry.list().await
    }

    /// Start a registered process.
    ///
    /// # Errors
    /// * `NotFound` - unknown id
    /// * `AlreadyRunning` - the process is starting, running or restarting
    /// * `SpawnFailure` - the executable could not be started; the process
    ///   is marked `failed` and not retried
    pub async fn start(&self, id: &ProcessId) -> Result<()> {
        let record = self.inner.registry.record(id)?;
        let mut proc = record.lock().await;

        if proc.state.is_active() {
            return Err(FleetError::AlreadyRunning(id.to_string()));
        }

        proc.set_state(ProcessState::Starting)?;
        proc.stop_requested = false;
        info!("Starting process '{}'", id);
        self.launch_locked(&mut proc).await?;
        drop(proc);

        self.ensure_health_loop(id);
        Ok(())
    }

    /// Stop a process gracefully.
    ///
    /// Sends the configured stop signal and waits for the exit to be
    /// confirmed, escalating to SIGKILL after the grace period. A no-op for
    /// `stopped` and `failed` processes; cancels the pending relaunch of a
    /// `restarting` one.
    pub async fn stop(&self, id: &ProcessId) -> Result<()> {
        let record = self.inner.registry.record(id)?;

        let (pid, epoch, grace, signal_name, mut exited) = {
            let mut proc = record.lock().await;
            match proc.state {
                ProcessState::Stopped | ProcessState::Failed => {
                    debug!("Stop of '{}' is a no-op in state {}", id, proc.state);
                    return Ok(());
                }
                ProcessState::Restarting => {
                    proc.set_state(ProcessState::Stopped)?;
                    info!("Cancelled pending restart of '{}'", id);
                    return Ok(());
                }
                ProcessState::Starting | ProcessState::Running => {}
            }

            let pid = match proc.pid {
                Some(pid) => pid,
                None => {
                    proc.set_state(ProcessState::Stopped)?;
                    return Ok(());
                }
            };
            proc.stop_requested = true;
            (
                pid,
                proc.epoch,
                proc.spec.stop_timeout(),
                proc.spec.stop_signal.clone(),
                proc.exited.subscribe(),
            )
        };

        info!("Stopping process '{}' (pid {}) with {}", id, pid, signal_name);
        send_signal(pid, parse_signal(&signal_name)?)?;

        if timeout(grace, wait_for_exit(&mut exited, epoch)).await.is_err() {
            warn!(
                "Process '{}' did not exit within {:?}, sending SIGKILL",
                id, grace
            );
            send_signal(pid, Signal::SIGKILL)?;
            timeout(grace, wait_for_exit(&mut exited, epoch))
                .await
                .map_err(|_| {
                    FleetError::StopError(
                        id.to_string(),
                        "process did not exit after SIGKILL".to_string(),
                    )
                })?;
        }

        info!("Process '{}' stopped", id);
        Ok(())
    }

    /// Stop and start again.
    ///
    /// The restart is recorded against the policy window even though an
    /// operator asked for it, so restart requests cannot be used to sidestep
    /// the windowed limit. A `never` policy only rules out automatic
    /// restarts; explicit ones go through.
    pub async fn restart(&self, id: &ProcessId) -> Result<()> {
        let record = self.inner.registry.record(id)?;
        {
            let proc = record.lock().await;
            let decision = restart::evaluate(&proc.policy, &proc.history, SystemTime::now());
            if let RestartDecision::Deny {
                reason: DenyReason::RestartLimitExceeded,
            } = decision
            {
                return Err(FleetError::RestartLimitExceeded(id.to_string()));
            }
        }

        info!("Restarting process '{}'", id);
        self.stop(id).await?;
        self.inner.registry.append_restart(id, SystemTime::now()).await?;
        self.start(id).await
    }

    /// Stop the process (if needed), tear down its health loop and remove
    /// the record.
    pub async fn deregister(&self, id: &ProcessId) -> Result<()> {
        self.stop(id).await?;
        if let Some(handle) = self
            .inner
            .health_loops
            .lock()
            .expect("health loop table poisoned")
            .remove(id)
        {
            handle.abort();
        }
        self.inner.registry.deregister(id)
    }

    /// Gracefully stop every active process, then cancel all supervisor
    /// tasks.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Supervisor shutting down");
        for id in self.inner.registry.ids() {
            if let Err(e) = self.stop(&id).await {
                error!("Failed to stop process '{}': {}", id, e);
            }
        }
        self.inner.shutdown.cancel();
        Ok(())
    }

    fn spawn_event_loop(&self, mut rx: mpsc::UnboundedReceiver<SupervisorEvent>) {
        let sup = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = sup.inner.shutdown.cancelled() => break,
                    ev = rx.recv() => match ev {
                        Some(ev) => ev,
                        None => break,
                    },
                };

                match event {
                    SupervisorEvent::Exited { id, epoch, code } => {
                        if let Err(e) = sup.handle_exit(&id, epoch, code).await {
                            error!("Failed to handle exit of '{}': {}", id, e);
                        }
                    }
                    SupervisorEvent::Unhealthy { id, epoch, failures } => {
                        sup.handle_unhealthy(&id, epoch, failures).await;
                    }
                }
            }
        });
    }

    /// Spawn under the record lock; transitions `starting -> running`, or
    /// `starting -> failed` on spawn failure.
    async fn launch_locked(&self, proc: &mut ManagedProcess) -> Result<()> {
        match spawn_process(&proc.id, &proc.spec).await {
            Ok(spawned) => {
                proc.epoch += 1;
                proc.pid = Some(spawned.pid);
                proc.started_at = Some(SystemTime::now());
                proc.last_exit_code = None;
                proc.health.reset();
                proc.set_state(ProcessState::Running)?;
                info!("Process '{}' is running (pid {})", proc.id, spawned.pid);
                self.spawn_exit_watcher(proc.id.clone(), proc.epoch, spawned.child);
                Ok(())
            }
            Err(e) => {
                warn!("Spawn failed for '{}': {}", proc.id, e);
                proc.set_state(ProcessState::Failed)?;
                Err(e)
            }
        }
    }

    /// The watcher owns the child handle; the supervisor only keeps the pid.
    fn spawn_exit_watcher(&self, id: ProcessId, epoch: u64, mut child: Child) {
        let events = self.inner.events.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("Wait failed for '{}': {}", id, e);
                    None
                }
            };
            let _ = events.send(SupervisorEvent::Exited { id, epoch, code });
        });
    }

    async fn handle_exit(&self, id: &ProcessId, epoch: u64, code: Option<i32>) -> Result<()> {
        let record = match self.inner.registry.record(id) {
            Ok(record) => record,
            // Deregistered while the watcher was waiting
            Err(_) => return Ok(()),
        };
        let mut proc = record.lock().await;
        if proc.epoch != epoch {
            // Watcher from an earlier spawn
            return Ok(());
        }

        proc.pid = None;
        proc.last_exit_code = code;

        if proc.stop_requested {
            proc.stop_requested = false;
            proc.set_state(ProcessState::Stopped)?;
            let _ = proc.exited.send(epoch);
            info!("Process '{}' exited after stop request (code: {:?})", id, code);
            return Ok(());
        }
        let _ = proc.exited.send(epoch);

        warn!("Process '{}' exited unexpectedly (code: {:?})", id, code);

        let now = SystemTime::now();
        match restart::evaluate(&proc.policy, &proc.history, now) {
            RestartDecision::Deny { reason } => {
                warn!("Not restarting '{}': {:?}", id, reason);
                proc.set_state(ProcessState::Failed)?;
                Ok(())
            }
            RestartDecision::Allow { backoff } => {
                proc.set_state(ProcessState::Restarting)?;
                let window = proc.policy.window();
                proc.history.record(now);
                proc.history.prune(window, now);
                proc.restart_count += 1;
                proc.last_restart = Some(now);
                info!(
                    "Restarting '{}' in {:?} (windowed restarts: {})",
                    id,
                    backoff,
                    proc.history.len()
                );
                let expected_epoch = proc.epoch;
                drop(proc);
                self.schedule_relaunch(id.clone(), expected_epoch, backoff);
                Ok(())
            }
        }
    }

    async fn handle_unhealthy(&self, id: &ProcessId, epoch: u64, failures: u32) {
        let record = match self.inner.registry.record(id) {
            Ok(record) => record,
            Err(_) => return,
        };
        let pid = {
            let proc = record.lock().await;
            if proc.epoch != epoch || proc.state != ProcessState::Running {
                return;
            }
            match proc.pid {
                Some(pid) => pid,
                None => return,
            }
        };

        warn!(
            "Process '{}' unhealthy after {} consecutive probe failures, terminating pid {}",
            id, failures, pid
        );
        // The exit watcher picks this up and routes it through the same
        // policy evaluation as a real crash.
        if let Err(e) = send_signal(pid, Signal::SIGKILL) {
            error!("Failed to terminate unhealthy process '{}': {}", id, e);
        }
    }

    fn schedule_relaunch(&self, id: ProcessId, epoch: u64, delay: Duration) {
        let sup = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sup.inner.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if let Err(e) = sup.relaunch(&id, epoch).await {
                error!("Relaunch of '{}' failed: {}", id, e);
            }
        });
    }

    /// `restarting -> starting -> running` after the backoff has elapsed
    async fn relaunch(&self, id: &ProcessId, epoch: u64) -> Result<()> {
        let record = match self.inner.registry.record(id) {
            Ok(record) => record,
            Err(_) => return Ok(()),
        };
        let mut proc = record.lock().await;
        if proc.state != ProcessState::Restarting || proc.epoch != epoch {
            // Stopped or superseded while backing off
            debug!("Skipping stale relaunch of '{}'", id);
            return Ok(());
        }
        proc.set_state(ProcessState::Starting)?;
        self.launch_locked(&mut proc).await
    }

    fn ensure_health_loop(&self, id: &ProcessId) {
        let mut loops = self
            .inner
            .health_loops
            .lock()
            .expect("health loop table poisoned");
        if let Some(handle) = loops.get(id) {
            if !handle.is_finished() {
                return;
            }
        }
        let handle = self
            .inner
            .health
            .spawn_loop(id.clone(), self.inner.shutdown.clone());
        loops.insert(id.clone(), handle);
    }
}

/// Wait until an exit for `epoch` (or a later spawn) has been confirmed
async fn wait_for_exit(rx: &mut watch::Receiver<u64>, epoch: u64) {
    loop {
        if *rx.borrow() >= epoch {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

fn send_signal(pid: u32, signal: Signal) -> Result<()> {
    match signal::kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) => Ok(()),
        // Already gone; the exit watcher will confirm
        Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(FleetError::SignalError(format!(
            "failed to send {} to pid {}: {}",
            signal, pid, e
        ))),
    }
}

fn parse_signal(signal_name: &str) -> Result<Signal> {
    match signal_name {
        "SIGTERM" => Ok(Signal::SIGTERM),
        "SIGINT" => Ok(Signal::SIGINT),
        "SIGQUIT" => Ok(Signal::SIGQUIT),
        "SIGKILL" => Ok(Signal::SIGKILL),
        "SIGHUP" => Ok(Signal::SIGHUP),
        "SIGUSR1" => Ok(Signal::SIGUSR1),
        "SIGUSR2" => Ok(Signal::SIGUSR2),
        _ => Err(FleetError::SignalError(format!(
            "Invalid signal name: {}",
            signal_name
        ))),
    }
}
