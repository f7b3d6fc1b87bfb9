//! Helpers shared by stages that manage child processes directly

use std::time::Duration;

use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use tokio::process::Child;

/// How long a cancelled command gets to exit after SIGTERM before SIGKILL
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Who receives the termination request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KillScope {
    /// The child leads its own session or process group; signal all of it
    ProcessGroup,
    /// The child shares our process group; signal only the child
    Process,
}

/// Ask the child to exit, escalating to SIGKILL, and reap it
pub(crate) async fn terminate(child: &mut Child, scope: KillScope) {
    if let Some(pid) = child.id() {
        let pid = Pid::from_raw(pid as i32);
        let sent = match scope {
            KillScope::ProcessGroup => killpg(pid, Signal::SIGTERM),
            KillScope::Process => kill(pid, Signal::SIGTERM),
        };
        if let Err(e) = sent {
            tracing::debug!("SIGTERM to {} ({:?}) failed: {}", pid, scope, e);
        }
    }

    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(Ok(status)) => tracing::debug!("Terminated child exited with {}", status),
        Ok(Err(e)) => tracing::warn!("Failed to reap terminated child: {}", e),
        Err(_) => {
            tracing::warn!("Child ignored SIGTERM, killing");
            if let Err(e) = child.kill().await {
                tracing::warn!("Failed to kill child: {}", e);
            }
        }
    }
}
