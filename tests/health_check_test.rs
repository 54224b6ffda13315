use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use toolfleet::config::{HealthConfig, LaunchSpec, SupervisorConfig};
use toolfleet::process::{HealthProbe, ProcessState, RestartPolicy, Supervisor};
use toolfleet::registry::{ProcessId, ProcessRegistry};

/// Probe that fails for the first `fail_first` calls, then succeeds forever
struct FlakyProbe {
    calls: AtomicU32,
    fail_first: u32,
}

impl FlakyProbe {
    fn new(fail_first: u32) -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail_first,
        }
    }
}

#[async_trait]
impl HealthProbe for FlakyProbe {
    async fn probe(&self, _id: &ProcessId, _pid: u32) -> Result<(), String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.fail_first {
            Err("tool endpoint not responding".to_string())
        } else {
            Ok(())
        }
    }
}

fn fast_health() -> SupervisorConfig {
    SupervisorConfig {
        health: HealthConfig {
            check_interval: Duration::from_millis(100),
            probe_timeout: Duration::from_secs(1),
            failure_threshold: 3,
        },
    }
}

fn sleeper() -> LaunchSpec {
    LaunchSpec::new("/bin/sleep").with_args(["30"])
}

// Three consecutive probe failures cross the threshold: the supervisor
// terminates the process and the restart policy brings it back. Once the
// probe succeeds again the counter is back at zero.
#[tokio::test]
async fn test_threshold_crossing_triggers_restart_and_recovery() {
    let registry = Arc::new(ProcessRegistry::new());
    let supervisor = Supervisor::with_probe(
        Arc::clone(&registry),
        fast_health(),
        Arc::new(FlakyProbe::new(3)),
    );

    let id = ProcessId::from("wobbly");
    registry
        .register(id.clone(), sleeper(), RestartPolicy::on_failure(5, 60))
        .unwrap();
    supervisor.start(&id).await.unwrap();

    // Wait for the kill, the restart and the first successful probe
    let started = tokio::time::Instant::now();
    let mut recovered = false;
    while started.elapsed() < Duration::from_secs(15) {
        let status = supervisor.status(&id).await.unwrap();
        let health = supervisor.health(&id).await.unwrap();
        if status.state == ProcessState::Running && status.restart_count >= 1 && health.is_healthy
        {
            recovered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(recovered, "process should be restarted and healthy again");

    let health = supervisor.health(&id).await.unwrap();
    assert_eq!(health.consecutive_failures, 0);
    assert!(health.message.is_none());
    assert!(health.last_check.is_some());

    supervisor.stop(&id).await.unwrap();
}

// Failures below the threshold update the record but never trigger a
// policy-driven restart on their own.
#[tokio::test]
async fn test_below_threshold_never_restarts() {
    let registry = Arc::new(ProcessRegistry::new());
    let supervisor = Supervisor::with_probe(
        Arc::clone(&registry),
        fast_health(),
        Arc::new(FlakyProbe::new(2)),
    );

    let id = ProcessId::from("steady");
    registry
        .register(id.clone(), sleeper(), RestartPolicy::on_failure(5, 60))
        .unwrap();
    supervisor.start(&id).await.unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;

    let status = supervisor.status(&id).await.unwrap();
    assert_eq!(status.state, ProcessState::Running);
    assert_eq!(status.restart_count, 0, "two failures must not restart");

    let health = supervisor.health(&id).await.unwrap();
    assert!(health.is_healthy);
    assert_eq!(health.consecutive_failures, 0);

    supervisor.stop(&id).await.unwrap();
}

// A stopped process receives no probes: the failure counter stays frozen.
#[tokio::test]
async fn test_no_probes_while_stopped() {
    let registry = Arc::new(ProcessRegistry::new());
    let probe = Arc::new(FlakyProbe::new(0));
    let supervisor = Supervisor::with_probe(Arc::clone(&registry), fast_health(), probe.clone());

    let id = ProcessId::from("parked");
    registry
        .register(id.clone(), sleeper(), RestartPolicy::default())
        .unwrap();
    supervisor.start(&id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    supervisor.stop(&id).await.unwrap();

    let probes_at_stop = probe.calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(1)).await;
    let probes_later = probe.calls.load(Ordering::SeqCst);

    // At most one probe was already in flight when the stop landed
    assert!(probes_later <= probes_at_stop + 1);
}
