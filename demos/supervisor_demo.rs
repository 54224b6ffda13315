use std::sync::Arc;
use std::time::Duration;

use toolfleet::config::{LaunchSpec, SupervisorConfig};
use toolfleet::process::{RestartPolicy, Supervisor};
use toolfleet::registry::{ProcessId, ProcessRegistry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    println!("=== Toolfleet Supervisor Demo ===\n");

    let registry = Arc::new(ProcessRegistry::new());
    let supervisor = Supervisor::new(Arc::clone(&registry), SupervisorConfig::default());

    // A tool server that keeps crashing; three restarts per minute allowed
    registry.register(
        ProcessId::from("crasher"),
        LaunchSpec::new("/bin/sh").with_args(["-c", "echo 'I will crash!'; sleep 1; exit 1"]),
        RestartPolicy::on_failure(3, 60),
    )?;

    // A stable tool server
    registry.register(
        ProcessId::from("stable"),
        LaunchSpec::new("/bin/sleep").with_args(["30"]),
        RestartPolicy::always(),
    )?;

    println!("Starting processes...");
    supervisor.start(&ProcessId::from("crasher")).await?;
    supervisor.start(&ProcessId::from("stable")).await?;

    // Watch the fleet for a while
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_secs(2)).await;
        println!("--- fleet status ---");
        for status in supervisor.list().await {
            println!(
                "  {:<10} state={:<10} pid={:<8} restarts={} exit_code={:?}",
                status.id.to_string(),
                status.state.to_string(),
                status.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
                status.restart_count,
                status.exit_code,
            );
        }
    }

    println!("\nShutting down...");
    supervisor.shutdown().await?;
    println!("Done.");
    Ok(())
}
