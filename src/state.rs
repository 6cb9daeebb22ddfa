use chrono::{DateTime, Utc};

/// Where the supervisor is in its restart cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No timer armed yet, or arming failed and is being retried.
    Idle,
    Scheduled,
    RestartInProgress,
    /// The termination sequence for this process has been sent; nothing
    /// left to do but exit.
    Terminated,
}

/// Shared status record. Lives inside the supervisor's lock.
#[derive(Debug, Clone, PartialEq)]
pub struct RestartState {
    pub started_at: DateTime<Utc>,
    pub last_restart_at: DateTime<Utc>,
    pub next_restart_at: Option<DateTime<Utc>>,
    pub phase: Phase,
    pub restart_count: u64,
}

impl RestartState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            started_at: now,
            last_restart_at: now,
            next_restart_at: None,
            phase: Phase::Idle,
            restart_count: 0,
        }
    }

    pub fn in_progress(&self) -> bool {
        matches!(self.phase, Phase::RestartInProgress | Phase::Terminated)
    }

    pub fn arm(&mut self, fire_at: DateTime<Utc>) {
        self.next_restart_at = Some(fire_at);
        self.phase = Phase::Scheduled;
    }

    pub fn disarm(&mut self) {
        self.next_restart_at = None;
        self.phase = Phase::Idle;
    }

    /// Opens a restart episode. Returns `false` if one is already open.
    ///
    /// `target` is the time the restart is expected to land, if it is not
    /// `now` (manual triggers delay termination so the caller gets a reply).
    pub fn begin(&mut self, now: DateTime<Utc>, target: Option<DateTime<Utc>>) -> bool {
        if self.in_progress() {
            return false;
        }
        self.last_restart_at = now;
        self.next_restart_at = target;
        self.phase = Phase::RestartInProgress;
        self.restart_count += 1;
        true
    }

    pub fn uptime(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_restart_at
    }
}
