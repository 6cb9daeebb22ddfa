use thiserror::Error;

/// Failures the supervisor distinguishes between.
///
/// A target that is already gone when it is signalled is not an error; the
/// controller reports it as [`TerminationOutcome::AlreadyGone`].
///
/// [`TerminationOutcome::AlreadyGone`]: crate::process::TerminationOutcome::AlreadyGone
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Rejected synchronously, nothing was changed.
    #[error("Invalid restart policy: {0}")]
    InvalidPolicy(String),

    /// No running process matches. Absorbed: a fresh target is spawned.
    #[error("No process matches {0}")]
    TargetNotFound(String),

    /// Absorbed for the episode: nothing is signalled or spawned.
    #[error("{count} processes match {matcher}, refusing to pick one")]
    AmbiguousTarget { matcher: String, count: usize },

    /// No fire time could be computed. Never absorbed: the scheduler retries
    /// with backoff.
    #[error("Unable to arm restart timer: {0}")]
    SchedulerStall(String),
}
