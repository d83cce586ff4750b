//! Supervised `kubectl port-forward` to the in-cluster log store.
//!
//! The child runs in its own process group so shutdown reaches any
//! descendants kubectl spawns.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};

use crate::error::AppError;

pub const LOG_STORE_SERVICE: &str = "svc/elasticsearch";
/// Time given to the child after SIGTERM before it is killed.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);
/// How long the forward must stay up after spawning to count as started.
pub const STARTUP_WAIT: Duration = Duration::from_secs(2);

pub fn kubectl_args(namespace: &str, port: u16) -> Vec<String> {
    vec![
        "port-forward".into(),
        "-n".into(),
        namespace.into(),
        LOG_STORE_SERVICE.into(),
        format!("{port}:{port}"),
    ]
}

#[derive(Debug)]
pub struct PortForward {
    child: Child,
    label: String,
}

impl PortForward {
    /// Start forwarding `port` from the log-store service in `namespace`.
    pub async fn start(namespace: &str, port: u16) -> Result<Self, AppError> {
        let forward = Self::spawn("kubectl", &kubectl_args(namespace, port))?;
        forward.await_startup(STARTUP_WAIT).await
    }

    fn spawn(program: &str, args: &[String]) -> Result<Self, AppError> {
        let label = format!("{program} {}", args.join(" "));
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd
            .spawn()
            .map_err(|e| AppError::Connectivity(format!("failed to start {label}: {e}")))?;
        tracing::info!(command = %label, pid = child.id(), "Port-forward started");
        Ok(Self { child, label })
    }

    async fn await_startup(mut self, wait: Duration) -> Result<Self, AppError> {
        tokio::time::sleep(wait).await;
        match self.child.try_wait() {
            Ok(None) => Ok(self),
            Ok(Some(status)) => Err(AppError::Connectivity(format!(
                "{} exited during startup ({status})",
                self.label
            ))),
            Err(e) => Err(AppError::Internal(format!("cannot poll {}: {e}", self.label))),
        }
    }

    /// Terminate the forward and its process group: SIGTERM, then SIGKILL once
    /// the grace period runs out. Always reaps the child.
    pub async fn stop(mut self, grace: Duration) {
        let Some(pid) = self.child.id() else {
            tracing::debug!(command = %self.label, "Port-forward already exited");
            return;
        };

        #[cfg(not(unix))]
        {
            let _ = pid;
            if let Err(e) = self.child.kill().await {
                tracing::warn!(command = %self.label, "Port-forward kill failed: {}", e);
            }
            return;
        }

        signal_group(pid, Signal::Term);
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(command = %self.label, %status, "Port-forward stopped");
            }
            Ok(Err(e)) => tracing::warn!(command = %self.label, "Port-forward wait failed: {}", e),
            Err(_) => {
                tracing::warn!(command = %self.label, grace_secs = grace.as_secs(), "Port-forward ignored SIGTERM, killing");
                signal_group(pid, Signal::Kill);
                if let Err(e) = self.child.kill().await {
                    tracing::warn!(command = %self.label, "Port-forward kill failed: {}", e);
                }
            }
        }
    }
}

#[cfg(unix)]
#[derive(Clone, Copy)]
pub(crate) enum Signal {
    Term,
    Kill,
}

/// Signal the process group led by `pid`.
#[cfg(unix)]
pub(crate) fn signal_group(pid: u32, signal: Signal) {
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // The child leads its own group, so -pid addresses the whole group.
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), sig) };
    if rc != 0 {
        tracing::debug!(pid, "Process group signal failed: {}", std::io::Error::last_os_error());
    }
}
