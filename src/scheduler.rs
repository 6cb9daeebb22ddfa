use crate::supervisor::{Armed, Supervisor, Trigger, TriggerOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::task::JoinHandle;
use tracing::{debug, error, info_span, Instrument};

const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_CAP: Duration = Duration::from_secs(5 * 60);

pub fn spawn(supervisor: Arc<Supervisor>) -> JoinHandle<()> {
    tokio::spawn(run(supervisor).instrument(info_span!("restart_scheduler")))
}

/// Waits for the armed fire time and fires it. Any change to the armed
/// state (reconfiguration, a manual restart, an episode finishing) wakes the
/// loop, which then re-reads what to wait for.
async fn run(supervisor: Arc<Supervisor>) {
    let mut rearm = supervisor.subscribe();
    let mut backoff = Backoff::new(RETRY_BASE, RETRY_CAP);

    loop {
        // Seen before reading, so a change made after the read still wakes us.
        rearm.borrow_and_update();

        match supervisor.armed() {
            Armed::Unarmed => match supervisor.arm() {
                Ok(_) => backoff.reset(),
                Err(err) => {
                    let delay = backoff.next_delay();
                    error!(
                        %err,
                        "Restart timer could not be armed, retrying in {}",
                        humantime::format_duration(delay)
                    );
                    // The failed arm notified as well; only later changes should cut
                    // the backoff short.
                    rearm.borrow_and_update();
                    select! {
                        _ = tokio::time::sleep(delay) => {},
                        changed = rearm.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                    }
                }
            },
            Armed::Waiting {
                fire_at,
                generation,
            } => {
                select! {
                    _ = supervisor.clock().sleep_until(fire_at) => {
                        let outcome = supervisor.trigger(Trigger::Scheduled { generation });
                        if outcome != TriggerOutcome::Started {
                            debug!(?outcome, "Scheduled restart not started");
                        }
                    },
                    changed = rearm.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
            Armed::Busy => {
                if rearm.changed().await.is_err() {
                    return;
                }
            }
        }
    }
}

/// `base * 2^attempt`, capped.
#[derive(Debug, Clone)]
struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let multiplier = 2u32.saturating_pow(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.base.saturating_mul(multiplier).min(self.cap)
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}
