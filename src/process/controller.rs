use super::{liveness, Liveness, Target};
use async_trait::async_trait;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// The target was gone before anything was sent.
    AlreadyGone,
    /// The target exited within the grace period.
    Exited,
    /// The grace period expired and SIGKILL was sent.
    Killed,
}

#[async_trait]
pub trait ProcessController: Send + Sync + 'static {
    /// SIGTERM, then SIGKILL if `target` is still alive after `grace_period`.
    ///
    /// Returns once the target is gone or SIGKILL has been sent. When the
    /// target is the calling process this usually never returns.
    async fn terminate_gracefully(
        &self,
        target: &Target,
        grace_period: Duration,
    ) -> Result<TerminationOutcome>;
}

#[derive(Debug)]
pub struct SignalController {
    poll_interval: Duration,
}

impl SignalController {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }
}

impl Default for SignalController {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

#[async_trait]
impl ProcessController for SignalController {
    #[instrument(skip(self), fields(pid = target.pid))]
    async fn terminate_gracefully(
        &self,
        target: &Target,
        grace_period: Duration,
    ) -> Result<TerminationOutcome> {
        if liveness(target) != Liveness::Alive {
            info!("Target already gone, nothing to terminate");
            return Ok(TerminationOutcome::AlreadyGone);
        }

        let pid = Pid::from_raw(target.pid);
        match kill(pid, Signal::SIGTERM) {
            Ok(()) => info!("Sent SIGTERM"),
            Err(Errno::ESRCH) => {
                info!("Target exited before SIGTERM landed");
                return Ok(TerminationOutcome::AlreadyGone);
            }
            Err(err) => return Err(err).wrap_err("Failed to send SIGTERM"),
        }

        let deadline = Instant::now() + grace_period;
        loop {
            if liveness(target) != Liveness::Alive {
                info!("Target exited");
                return Ok(TerminationOutcome::Exited);
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }

        // The last poll confirmed identity.
        warn!(
            "Target still alive after {}, sending SIGKILL",
            humantime::format_duration(grace_period)
        );
        match kill(pid, Signal::SIGKILL) {
            Ok(()) => Ok(TerminationOutcome::Killed),
            Err(Errno::ESRCH) => Ok(TerminationOutcome::Exited),
            Err(err) => Err(err).wrap_err("Failed to send SIGKILL"),
        }
    }
}
