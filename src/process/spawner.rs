use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::debug;

use crate::config::LaunchSpec;
use crate::error::{FleetError, Result};
use crate::registry::ProcessId;

/// Metadata returned when spawning a process
#[derive(Debug)]
pub struct SpawnedProcess {
    /// The child process handle
    pub child: Child,

    /// Process ID assigned by the OS
    pub pid: u32,
}

/// Spawn a child process from its launch specification.
///
/// Applies the working directory, environment and arguments from the spec.
/// Stdout/stderr are discarded; log collection belongs to the tool transport
/// layer, not the supervisor core.
///
/// # Returns
/// * `Ok(SpawnedProcess)` - Successfully spawned process with metadata
/// * `Err(FleetError::SpawnFailure)` - Executable missing, permission denied, etc.
pub async fn spawn_process(id: &ProcessId, spec: &LaunchSpec) -> Result<SpawnedProcess> {
    if !spec.command.exists() {
        return Err(FleetError::SpawnFailure(
            id.to_string(),
            format!("executable does not exist: {}", spec.command.display()),
        ));
    }

    let mut command = Command::new(&spec.command);

    if !spec.args.is_empty() {
        command.args(&spec.args);
    }

    if let Some(ref cwd) = spec.cwd {
        command.current_dir(cwd);
    }

    for (key, value) in &spec.env {
        command.env(key, value);
    }

    command.stdin(Stdio::null());
    command.stdout(Stdio::null());
    command.stderr(Stdio::null());

    let child = command
        .spawn()
        .map_err(|e| FleetError::SpawnFailure(id.to_string(), e.to_string()))?;

    let pid = child.id().ok_or_else(|| {
        FleetError::SpawnFailure(id.to_string(), "failed to obtain pid".to_string())
    })?;

    debug!("Spawned process '{}' with pid {}", id, pid);

    Ok(SpawnedProcess { child, pid })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_spawn_simple_process() {
        let spec = LaunchSpec::new("/bin/echo");
        let spawned = spawn_process(&ProcessId::from("echo"), &spec).await.unwrap();
        assert!(spawned.pid > 0);
    }

    #[tokio::test]
    async fn test_spawn_with_args_and_env() {
        let spec = LaunchSpec::new("/bin/sh")
            .with_args(["-c", "test \"$TOOL_PORT\" = 9000"])
            .with_env("TOOL_PORT", "9000");

        let mut spawned = spawn_process(&ProcessId::from("env-check"), &spec)
            .await
            .unwrap();
        let status = spawned.child.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_spawn_with_working_directory() {
        let temp_dir = TempDir::new().unwrap();
        let mut spec = LaunchSpec::new("/bin/pwd");
        spec.cwd = Some(temp_dir.path().to_path_buf());

        let result = spawn_process(&ProcessId::from("pwd"), &spec).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_spawn_nonexistent_executable() {
        let spec = LaunchSpec::new("/nonexistent/tool-server");
        let result = spawn_process(&ProcessId::from("missing"), &spec).await;

        match result {
            Err(FleetError::SpawnFailure(id, msg)) => {
                assert_eq!(id, "missing");
                assert!(msg.contains("does not exist"));
            }
            other => panic!("expected SpawnFailure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_spawn_invalid_working_directory() {
        let mut spec = LaunchSpec::new("/bin/echo");
        spec.cwd = Some("/nonexistent/directory".into());

        let result = spawn_process(&ProcessId::from("bad-cwd"), &spec).await;
        assert!(matches!(result, Err(FleetError::SpawnFailure(_, _))));
    }
}
