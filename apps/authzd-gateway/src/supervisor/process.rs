//! Spawning and stopping backend child processes.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use crate::config::SupervisorConfig;

/// Send graceful termination to a child process.
///
/// Returns `false` when the process has no PID (already exited), the PID
/// does not fit an i32, or signal delivery fails. On Windows there is no
/// reliable graceful termination for console processes, so the caller
/// proceeds straight to force kill.
#[cfg(unix)]
fn send_terminate_signal(child: &Child) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return false;
    };
    let Ok(pid_i32) = i32::try_from(pid) else {
        tracing::warn!(pid, "PID does not fit i32, cannot send SIGTERM");
        return false;
    };
    kill(Pid::from_raw(pid_i32), Signal::SIGTERM).is_ok()
}

#[cfg(windows)]
fn send_terminate_signal(_child: &Child) -> bool {
    false
}

/// Spawn a backend for `tenant` listening on `port`.
///
/// The invocation contract: `--tenant <id> --port <port>` plus the
/// `TENANT_ID`, `GRPC_PORT` and `BASE_CONNECTION_STRING` environment. The
/// backend substitutes `{TenantId}` itself.
///
/// # Errors
/// Returns an error when the executable cannot be started.
pub fn spawn_backend(cfg: &SupervisorConfig, tenant: &str, port: u16) -> Result<Child> {
    let mut cmd = Command::new(&cfg.backend_binary);
    cmd.arg("--tenant")
        .arg(tenant)
        .arg("--port")
        .arg(port.to_string());
    if cfg.mock_backends {
        cmd.arg("--mock");
    }
    cmd.args(&cfg.backend_args);
    cmd.env("TENANT_ID", tenant)
        .env("GRPC_PORT", port.to_string())
        .env("BASE_CONNECTION_STRING", &cfg.base_connection_string);
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().with_context(|| {
        format!(
            "failed to spawn backend {} for tenant {tenant}",
            cfg.backend_binary.display()
        )
    })?;

    // Forward child output into our log stream, tagged with the tenant.
    if let Some(stdout) = child.stdout.take() {
        spawn_log_forwarder(stdout, tenant.to_owned(), "stdout");
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_log_forwarder(stderr, tenant.to_owned(), "stderr");
    }

    tracing::info!(
        tenant = %tenant,
        port,
        pid = ?child.id(),
        "spawned tenant backend"
    );
    Ok(child)
}

fn spawn_log_forwarder<R>(stream: R, tenant: String, kind: &'static str)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::info!(tenant = %tenant, stream = kind, "{line}");
        }
    });
}

/// Stop a child: graceful signal, wait out the grace period, then force
/// kill.
pub async fn stop_child(child: &mut Child, tenant: &str, grace: Duration) {
    let pid = child.id();
    let graceful = send_terminate_signal(child);
    tracing::debug!(tenant = %tenant, pid = ?pid, graceful, "stopping tenant backend");

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::info!(tenant = %tenant, status = ?status, "backend exited");
        }
        Ok(Err(e)) => {
            tracing::warn!(tenant = %tenant, error = %e, "failed to wait for backend");
        }
        Err(_) => {
            tracing::warn!(tenant = %tenant, "grace period expired, force killing backend");
            if let Err(e) = child.kill().await {
                tracing::warn!(tenant = %tenant, error = %e, "failed to force kill backend");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    /// Write an executable shell script that ignores the backend CLI
    /// contract and just runs `body`.
    #[cfg(unix)]
    fn fake_backend(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.path().join("fake-backend.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_and_graceful_stop() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SupervisorConfig {
            backend_binary: fake_backend(&dir, "sleep 30"),
            ..SupervisorConfig::default()
        };
        let mut child = spawn_backend(&cfg, "t1", 50_150).unwrap();
        assert!(child.id().is_some());

        stop_child(&mut child, "t1", Duration::from_secs(2)).await;
        // Process is gone.
        assert!(child.id().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_force_kills_ignoring_sigterm() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SupervisorConfig {
            backend_binary: fake_backend(&dir, "trap '' TERM\nsleep 30"),
            ..SupervisorConfig::default()
        };
        let mut child = spawn_backend(&cfg, "t1", 50_151).unwrap();
        stop_child(&mut child, "t1", Duration::from_millis(200)).await;
        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn spawn_missing_binary_errors() {
        let cfg = SupervisorConfig {
            backend_binary: PathBuf::from("/definitely/not/here"),
            ..SupervisorConfig::default()
        };
        assert!(spawn_backend(&cfg, "t1", 50_152).is_err());
    }
}
