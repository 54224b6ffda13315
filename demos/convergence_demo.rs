use std::sync::Arc;
use std::time::Duration;

use toolfleet::config::{LaunchSpec, SupervisorConfig};
use toolfleet::poll::{wait_for_state, FetchError, PollOutcome, PollRequest, ReadinessCheck, ToolReadiness};
use toolfleet::process::{ProcessState, RestartPolicy, Supervisor};
use toolfleet::registry::{ProcessId, ProcessRegistry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("=== Convergence Polling Demo ===\n");

    let registry = Arc::new(ProcessRegistry::new());
    let supervisor = Supervisor::new(Arc::clone(&registry), SupervisorConfig::default());

    let id = ProcessId::from("weather");
    registry.register(
        id.clone(),
        LaunchSpec::new("/bin/sleep").with_args(["30"]),
        RestartPolicy::default(),
    )?;

    // Start the tool server after a delay, as if it were slow to come up
    let starter = supervisor.clone();
    let start_id = id.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        println!("(starting '{}' now)", start_id);
        starter.start(&start_id).await.expect("start failed");
    });

    // Meanwhile, wait for it to converge on `running`
    let req = PollRequest::new(Duration::from_millis(500), Duration::from_secs(30));
    let check = ReadinessCheck::state(ProcessState::Running);

    let poll_supervisor = supervisor.clone();
    let poll_id = id.clone();
    println!("Polling for '{}' to reach running (interval 500ms, timeout 30s)...", id);
    let outcome = wait_for_state(&req, &check, move || {
        let supervisor = poll_supervisor.clone();
        let id = poll_id.clone();
        async move {
            let status = supervisor.status(&id).await.map_err(FetchError::from)?;
            Ok(ToolReadiness {
                status,
                capabilities: vec!["get_forecast".to_string()],
            })
        }
    })
    .await;

    match outcome {
        PollOutcome::Succeeded(snapshot) => {
            println!(
                "Converged: state={} pid={:?} capabilities={:?}",
                snapshot.status.state, snapshot.status.pid, snapshot.capabilities
            );
        }
        PollOutcome::TimedOut { waited } => println!("Timed out after {:?}", waited),
        PollOutcome::Aborted(e) => println!("Aborted: {}", e),
        PollOutcome::Cancelled => println!("Cancelled"),
    }

    supervisor.shutdown().await?;
    Ok(())
}
