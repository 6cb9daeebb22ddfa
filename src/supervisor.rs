use crate::clock::Clock;
use crate::error::SupervisorError;
use crate::policy::RestartPolicy;
use crate::process::{CommandSpec, ProcessController, ProcessLocator, Target, TargetMatch};
use crate::scheduler;
use crate::state::{Phase, RestartState};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy)]
pub struct StopSettings {
    /// Time between SIGTERM and SIGKILL.
    pub grace_period: Duration,
    /// Delay before a manually triggered termination starts, so the trigger
    /// can still be answered.
    pub ack_delay: Duration,
}

/// Where the restarted process comes from.
pub enum Variant {
    /// The supervisor restarts the process it lives in and relies on an
    /// external relauncher.
    InProcess,
    /// The supervisor is a separate process that finds, terminates and
    /// respawns its target.
    Watchdog(WatchdogTarget),
}

pub struct WatchdogTarget {
    pub locator: Arc<dyn ProcessLocator>,
    pub matcher: TargetMatch,
    pub command: CommandSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// A timer armed under `generation` expired.
    Scheduled { generation: u64 },
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Started,
    AlreadyRestarting,
    /// The timer was re-armed since this fire was scheduled.
    Stale,
}

/// What the scheduler task should wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Armed {
    Unarmed,
    Waiting {
        fire_at: DateTime<Utc>,
        generation: u64,
    },
    Busy,
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub now: DateTime<Utc>,
    pub state: RestartState,
    pub policy: RestartPolicy,
    pub target: Option<Target>,
}

struct Inner {
    policy: RestartPolicy,
    state: RestartState,
    /// Identifies the armed fire time; bumped whenever it changes.
    generation: u64,
    target: Option<Target>,
}

/// Owns the restart policy and state and runs restart episodes.
///
/// Policy and state share one lock, so deciding to restart (check and set
/// `in_progress`) is atomic with respect to every other trigger.
pub struct Supervisor {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    controller: Arc<dyn ProcessController>,
    variant: Variant,
    settings: StopSettings,
    rearm: watch::Sender<u64>,
}

impl Supervisor {
    pub fn new(
        policy: RestartPolicy,
        clock: Arc<dyn Clock>,
        controller: Arc<dyn ProcessController>,
        variant: Variant,
        settings: StopSettings,
    ) -> Result<Arc<Self>, SupervisorError> {
        policy.validate()?;
        let target = match variant {
            Variant::InProcess => Some(Target::current()),
            Variant::Watchdog(_) => None,
        };
        let (rearm, _) = watch::channel(0);
        Ok(Arc::new(Self {
            inner: Mutex::new(Inner {
                policy,
                state: RestartState::new(clock.now()),
                generation: 0,
                target,
            }),
            clock,
            controller,
            variant,
            settings,
            rearm,
        }))
    }

    /// Arms the first fire time and starts the scheduler task.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        if let Err(err) = self.arm() {
            error!(%err, "Failed to arm initial restart timer");
        }
        scheduler::spawn(self.clone())
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn in_progress(&self) -> bool {
        self.inner.lock().state.in_progress()
    }

    pub fn phase(&self) -> Phase {
        self.inner.lock().state.phase
    }

    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner.lock();
        Snapshot {
            now: self.clock.now(),
            state: inner.state.clone(),
            policy: inner.policy.clone(),
            target: inner.target,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.rearm.subscribe()
    }

    pub fn armed(&self) -> Armed {
        let inner = self.inner.lock();
        if inner.state.in_progress() {
            return Armed::Busy;
        }
        match (inner.state.phase, inner.state.next_restart_at) {
            (Phase::Scheduled, Some(fire_at)) => Armed::Waiting {
                fire_at,
                generation: inner.generation,
            },
            _ => Armed::Unarmed,
        }
    }

    /// Computes the next fire time from the live policy and arms it. Leaves
    /// the supervisor unarmed on failure, and does nothing while a restart
    /// is in progress.
    pub fn arm(&self) -> Result<Option<DateTime<Utc>>, SupervisorError> {
        let result = self.arm_locked(&mut self.inner.lock());
        self.notify();
        result
    }

    fn arm_locked(&self, inner: &mut Inner) -> Result<Option<DateTime<Utc>>, SupervisorError> {
        if inner.state.in_progress() {
            return Ok(None);
        }
        let now = self.clock.now();
        inner.generation += 1;
        match inner.policy.schedule_next(now) {
            Ok(fire_at) => {
                inner.state.arm(fire_at);
                info!(
                    policy = %inner.policy,
                    "Next restart at {fire_at} (in {})",
                    humanize(fire_at - now)
                );
                Ok(Some(fire_at))
            }
            Err(err) => {
                inner.state.disarm();
                Err(err)
            }
        }
    }

    /// Replaces the active policy and re-arms the timer from now.
    ///
    /// An in-flight restart is left alone; the new policy takes effect when
    /// it completes. Returns the fire time the new policy yields from now.
    pub fn reconfigure(&self, policy: RestartPolicy) -> Result<DateTime<Utc>, SupervisorError> {
        policy.validate()?;
        let now = self.clock.now();
        // Unschedulable from now counts as invalid.
        let fire_at = policy.schedule_next(now).map_err(|err| match err {
            SupervisorError::SchedulerStall(reason) => SupervisorError::InvalidPolicy(reason),
            err => err,
        })?;
        {
            let mut inner = self.inner.lock();
            info!(from = %inner.policy, to = %policy, "Restart policy reconfigured");
            inner.policy = policy;
            if !inner.state.in_progress() {
                inner.generation += 1;
                inner.state.arm(fire_at);
            }
        }
        self.notify();
        Ok(fire_at)
    }

    pub fn trigger_manual(self: &Arc<Self>) -> TriggerOutcome {
        self.trigger(Trigger::Manual)
    }

    /// Decides a restart. At most one episode runs at a time; later triggers
    /// observe it and do nothing.
    pub fn trigger(self: &Arc<Self>, trigger: Trigger) -> TriggerOutcome {
        let (delay, prior, restart_count) = {
            let mut inner = self.inner.lock();
            if inner.state.in_progress() {
                info!(?trigger, "Restart already in progress");
                return TriggerOutcome::AlreadyRestarting;
            }
            if let Trigger::Scheduled { generation } = trigger {
                if generation != inner.generation {
                    return TriggerOutcome::Stale;
                }
            }
            let now = self.clock.now();
            let (delay, target) = match trigger {
                Trigger::Scheduled { .. } => (Duration::ZERO, None),
                Trigger::Manual => {
                    let delay = self.settings.ack_delay;
                    let target = chrono::Duration::from_std(delay)
                        .ok()
                        .and_then(|delay| now.checked_add_signed(delay));
                    (delay, target)
                }
            };
            let prior = inner.state.clone();
            inner.state.begin(now, target);
            inner.generation += 1;
            info!(?trigger, pid = ?inner.target.map(|t| t.pid), "Restart decided");
            (delay, prior, inner.state.restart_count)
        };
        self.notify();

        tokio::spawn(
            self.clone()
                .run_episode(delay, prior)
                .instrument(info_span!("restart_episode", restart_count)),
        );
        TriggerOutcome::Started
    }

    /// Makes sure a watchdog target is running, spawning one if needed.
    pub async fn ensure_target(&self) {
        let Variant::Watchdog(watchdog) = &self.variant else {
            return;
        };
        match watchdog.locator.find_target(&watchdog.matcher).await {
            Ok(target) => self.set_target(Some(target)),
            Err(SupervisorError::TargetNotFound(matcher)) => {
                info!("No process matches {matcher}, starting one");
                self.respawn(watchdog).await;
            }
            Err(err) => warn!(%err, "Unable to resolve target"),
        }
    }

    /// `prior` is the state before the episode opened, restored in part if
    /// the episode turns out to restart nothing.
    async fn run_episode(self: Arc<Self>, delay: Duration, prior: RestartState) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match &self.variant {
            Variant::InProcess => {
                let target = Target::current();
                self.terminate(&target).await;
                self.mark_terminated();
            }
            Variant::Watchdog(watchdog) => {
                let restarted = self.cycle_target(watchdog).await;
                self.complete(if restarted { None } else { Some(prior) });
            }
        }
    }

    /// Returns `false` if the episode was skipped.
    async fn cycle_target(&self, watchdog: &WatchdogTarget) -> bool {
        match watchdog.locator.find_target(&watchdog.matcher).await {
            Ok(target) => {
                self.set_target(Some(target));
                self.terminate(&target).await;
            }
            Err(err @ SupervisorError::TargetNotFound(_)) => {
                warn!(%err, "Starting a fresh target");
            }
            Err(err) => {
                error!(%err, "Skipping this restart");
                return false;
            }
        }
        self.respawn(watchdog).await;
        true
    }

    async fn respawn(&self, watchdog: &WatchdogTarget) {
        match watchdog.locator.respawn(&watchdog.command).await {
            Ok(target) => self.set_target(Some(target)),
            Err(err) => {
                error!(?err, "Failed to start target");
                self.set_target(None);
            }
        }
    }

    async fn terminate(&self, target: &Target) {
        match self
            .controller
            .terminate_gracefully(target, self.settings.grace_period)
            .await
        {
            Ok(outcome) => info!(pid = target.pid, ?outcome, "Termination finished"),
            Err(err) => error!(pid = target.pid, ?err, "Termination failed"),
        }
    }

    /// In-process episodes end here: this process is on its way out.
    fn mark_terminated(&self) {
        let mut inner = self.inner.lock();
        inner.state.phase = Phase::Terminated;
        inner.state.next_restart_at = inner.policy.schedule_next(self.clock.now()).ok();
    }

    /// Watchdog episodes end here: resume scheduling with the live policy.
    /// A skipped episode takes back its restart time and count.
    fn complete(&self, skipped: Option<RestartState>) {
        let result = {
            let mut inner = self.inner.lock();
            if let Some(prior) = skipped {
                inner.state.last_restart_at = prior.last_restart_at;
                inner.state.restart_count = prior.restart_count;
            }
            inner.state.disarm();
            self.arm_locked(&mut inner)
        };
        if let Err(err) = result {
            error!(%err, "Failed to arm restart timer after restart");
        }
        self.notify();
    }

    fn set_target(&self, target: Option<Target>) {
        self.inner.lock().target = target;
    }

    fn notify(&self) {
        self.rearm.send_modify(|tick| *tick = tick.wrapping_add(1));
    }
}

fn humanize(delta: chrono::Duration) -> humantime::FormattedDuration {
    humantime::format_duration(Duration::from_secs(delta.num_seconds().max(0) as u64))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::process::TerminationOutcome;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Records termination calls instead of signalling anything. Optionally
    /// holds each call until released.
    #[derive(Default)]
    pub struct FakeController {
        pub targets: Mutex<Vec<Target>>,
        hold: Option<Notify>,
    }

    impl FakeController {
        pub fn holding() -> Self {
            Self {
                targets: Mutex::default(),
                hold: Some(Notify::new()),
            }
        }

        pub fn calls(&self) -> usize {
            self.targets.lock().len()
        }

        pub fn release(&self) {
            if let Some(hold) = &self.hold {
                hold.notify_one();
            }
        }
    }

    #[async_trait]
    impl ProcessController for FakeController {
        async fn terminate_gracefully(
            &self,
            target: &Target,
            _grace_period: Duration,
        ) -> color_eyre::Result<TerminationOutcome> {
            self.targets.lock().push(*target);
            if let Some(hold) = &self.hold {
                hold.notified().await;
            }
            Ok(TerminationOutcome::Exited)
        }
    }

    pub struct FakeLocator {
        running: Mutex<Vec<Target>>,
        spawned: AtomicUsize,
    }

    impl FakeLocator {
        pub fn with(running: Vec<Target>) -> Arc<Self> {
            Arc::new(Self {
                running: Mutex::new(running),
                spawned: AtomicUsize::new(0),
            })
        }

        pub fn spawned(&self) -> usize {
            self.spawned.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProcessLocator for FakeLocator {
        async fn find_target(&self, matcher: &TargetMatch) -> Result<Target, SupervisorError> {
            let running = self.running.lock();
            match running.as_slice() {
                [] => Err(SupervisorError::TargetNotFound(matcher.to_string())),
                [target] => Ok(*target),
                many => Err(SupervisorError::AmbiguousTarget {
                    matcher: matcher.to_string(),
                    count: many.len(),
                }),
            }
        }

        async fn respawn(&self, _command: &CommandSpec) -> color_eyre::Result<Target> {
            let n = self.spawned.fetch_add(1, Ordering::SeqCst) as i32;
            let target = Target {
                pid: 5000 + n,
                start_time: None,
            };
            *self.running.lock() = vec![target];
            Ok(target)
        }
    }

    pub fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()
    }

    pub fn hours(n: i64) -> chrono::Duration {
        chrono::Duration::hours(n)
    }

    pub fn settings() -> StopSettings {
        StopSettings {
            grace_period: Duration::from_secs(30),
            ack_delay: Duration::ZERO,
        }
    }

    pub fn in_process(
        clock: &Arc<ManualClock>,
        controller: &Arc<FakeController>,
        policy: RestartPolicy,
    ) -> Arc<Supervisor> {
        Supervisor::new(policy, clock.clone(), controller.clone(), Variant::InProcess, settings())
            .unwrap()
    }

    fn watchdog(
        clock: &Arc<ManualClock>,
        controller: &Arc<FakeController>,
        locator: &Arc<FakeLocator>,
        policy: RestartPolicy,
    ) -> Arc<Supervisor> {
        let variant = Variant::Watchdog(WatchdogTarget {
            locator: locator.clone(),
            matcher: TargetMatch::EnvMarker {
                value: "api".into(),
            },
            command: CommandSpec {
                command: "uvicorn main:app".into(),
                working_directory: None,
                marker: Some("api".into()),
            },
        });
        Supervisor::new(policy, clock.clone(), controller.clone(), variant, settings()).unwrap()
    }

    pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for {what}");
    }

    fn six_hours() -> RestartPolicy {
        RestartPolicy::interval_hours(6).unwrap()
    }

    #[tokio::test]
    async fn start_arms_from_start_time() {
        let clock = ManualClock::new(t0());
        let controller = Arc::new(FakeController::default());
        let supervisor = in_process(&clock, &controller, six_hours());
        assert_eq!(supervisor.phase(), Phase::Idle);

        let _scheduler = supervisor.start();
        let snapshot = supervisor.snapshot();
        assert_eq!(snapshot.state.phase, Phase::Scheduled);
        assert_eq!(snapshot.state.last_restart_at, t0());
        assert_eq!(snapshot.state.next_restart_at, Some(t0() + hours(6)));
        assert_eq!(snapshot.target.map(|t| t.pid), Some(std::process::id() as i32));
    }

    #[tokio::test]
    async fn watchdog_end_to_end() {
        let clock = ManualClock::new(t0());
        let controller = Arc::new(FakeController::holding());
        let old = Target {
            pid: 4000,
            start_time: Some(7),
        };
        let locator = FakeLocator::with(vec![old]);
        let supervisor = watchdog(&clock, &controller, &locator, six_hours());
        let _scheduler = supervisor.start();
        assert_eq!(supervisor.snapshot().state.next_restart_at, Some(t0() + hours(6)));

        clock.set(t0() + hours(1));
        let fire_at = supervisor
            .reconfigure(RestartPolicy::interval_hours(2).unwrap())
            .unwrap();
        assert_eq!(fire_at, t0() + hours(3));
        assert_eq!(supervisor.snapshot().state.next_restart_at, Some(t0() + hours(3)));

        clock.set(t0() + hours(3));
        wait_until("termination call", || controller.calls() == 1).await;
        let during = supervisor.snapshot();
        assert!(during.state.in_progress());
        assert_eq!(during.state.last_restart_at, t0() + hours(3));
        assert_eq!(controller.targets.lock()[0], old);

        controller.release();
        wait_until("episode completion", || !supervisor.in_progress()).await;
        let after = supervisor.snapshot();
        assert_eq!(after.state.phase, Phase::Scheduled);
        assert_eq!(after.state.next_restart_at, Some(t0() + hours(5)));
        assert_eq!(after.target.map(|t| t.pid), Some(5000));
        assert_eq!(after.state.restart_count, 1);
        assert_eq!(controller.calls(), 1);
        assert_eq!(locator.spawned(), 1);
    }

    #[tokio::test]
    async fn in_process_end_to_end() {
        let clock = ManualClock::new(t0());
        let controller = Arc::new(FakeController::default());
        let supervisor = in_process(&clock, &controller, six_hours());
        let _scheduler = supervisor.start();

        clock.set(t0() + hours(1));
        supervisor
            .reconfigure(RestartPolicy::interval_hours(2).unwrap())
            .unwrap();
        clock.set(t0() + hours(3));

        wait_until("termination", || supervisor.phase() == Phase::Terminated).await;
        let snapshot = supervisor.snapshot();
        assert!(snapshot.state.in_progress());
        assert_eq!(snapshot.state.last_restart_at, t0() + hours(3));
        assert_eq!(controller.calls(), 1);
        assert_eq!(controller.targets.lock()[0].pid, std::process::id() as i32);

        // The process would be gone by now; nothing fires again.
        clock.set(t0() + hours(12));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(controller.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_manual_triggers_terminate_once() {
        let clock = ManualClock::new(t0());
        let controller = Arc::new(FakeController::holding());
        let supervisor = in_process(&clock, &controller, six_hours());
        let _scheduler = supervisor.start();

        let triggers = (0..16)
            .map(|_| {
                let supervisor = supervisor.clone();
                tokio::spawn(async move { supervisor.trigger_manual() })
            })
            .collect::<Vec<_>>();
        let mut started = 0;
        for trigger in triggers {
            if trigger.await.unwrap() == TriggerOutcome::Started {
                started += 1;
            }
        }
        assert_eq!(started, 1);

        // A scheduled fire landing mid-episode is refused as well.
        clock.set(t0() + hours(6));
        wait_until("termination call", || controller.calls() == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(controller.calls(), 1);
        assert_eq!(supervisor.trigger_manual(), TriggerOutcome::AlreadyRestarting);
        controller.release();
    }

    #[tokio::test]
    async fn manual_trigger_reports_target_time() {
        let clock = ManualClock::new(t0());
        let controller = Arc::new(FakeController::holding());
        let supervisor = Supervisor::new(
            six_hours(),
            clock.clone(),
            controller.clone(),
            Variant::InProcess,
            StopSettings {
                ack_delay: Duration::from_millis(10),
                ..settings()
            },
        )
        .unwrap();
        let _scheduler = supervisor.start();

        assert_eq!(supervisor.trigger_manual(), TriggerOutcome::Started);
        let snapshot = supervisor.snapshot();
        assert_eq!(snapshot.state.phase, Phase::RestartInProgress);
        assert_eq!(
            snapshot.state.next_restart_at,
            Some(t0() + chrono::Duration::milliseconds(10))
        );
        wait_until("termination call", || controller.calls() == 1).await;
        controller.release();
    }

    #[tokio::test]
    async fn stale_scheduled_fire_is_discarded() {
        let clock = ManualClock::new(t0());
        let controller = Arc::new(FakeController::default());
        let supervisor = in_process(&clock, &controller, six_hours());
        supervisor.arm().unwrap();
        let Armed::Waiting { generation, .. } = supervisor.armed() else {
            panic!("expected an armed timer");
        };

        supervisor
            .reconfigure(RestartPolicy::interval_hours(2).unwrap())
            .unwrap();
        assert_eq!(
            supervisor.trigger(Trigger::Scheduled { generation }),
            TriggerOutcome::Stale
        );
        assert!(!supervisor.in_progress());
        assert_eq!(controller.calls(), 0);
    }

    #[tokio::test]
    async fn invalid_reconfiguration_changes_nothing() {
        let clock = ManualClock::new(t0());
        let controller = Arc::new(FakeController::default());
        let supervisor = in_process(&clock, &controller, six_hours());
        let _scheduler = supervisor.start();
        clock.set(t0() + hours(1));
        let before = supervisor.snapshot();

        let err = supervisor
            .reconfigure(RestartPolicy::FixedInterval {
                duration: Duration::ZERO,
            })
            .unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidPolicy(_)));

        let after = supervisor.snapshot();
        assert_eq!(after.state, before.state);
        assert_eq!(after.policy, before.policy);
    }

    #[tokio::test]
    async fn unschedulable_reconfiguration_is_invalid() {
        let clock = ManualClock::new(t0());
        let controller = Arc::new(FakeController::default());
        let supervisor = in_process(&clock, &controller, six_hours());
        let _scheduler = supervisor.start();
        let before = supervisor.snapshot();

        // Passes validation, but lands past the last representable instant.
        let policy = RestartPolicy::interval_hours(100_000_000_000).unwrap();
        let err = supervisor.reconfigure(policy).unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidPolicy(_)));

        let after = supervisor.snapshot();
        assert_eq!(after.state, before.state);
        assert_eq!(after.policy, before.policy);
        assert_eq!(supervisor.phase(), Phase::Scheduled);
    }

    #[tokio::test]
    async fn reconfigure_during_restart_only_affects_the_next_one() {
        let clock = ManualClock::new(t0());
        let controller = Arc::new(FakeController::holding());
        let locator = FakeLocator::with(vec![Target {
            pid: 4000,
            start_time: None,
        }]);
        let supervisor = watchdog(&clock, &controller, &locator, six_hours());
        let _scheduler = supervisor.start();

        assert_eq!(supervisor.trigger_manual(), TriggerOutcome::Started);
        wait_until("termination call", || controller.calls() == 1).await;

        clock.set(t0() + hours(1));
        supervisor
            .reconfigure(RestartPolicy::interval_hours(3).unwrap())
            .unwrap();
        assert!(supervisor.in_progress());
        assert_eq!(supervisor.snapshot().state.next_restart_at, Some(t0()));

        clock.set(t0() + hours(2));
        controller.release();
        wait_until("episode completion", || !supervisor.in_progress()).await;
        assert_eq!(
            supervisor.snapshot().state.next_restart_at,
            Some(t0() + hours(5))
        );
        assert_eq!(controller.calls(), 1);
    }

    #[tokio::test]
    async fn ambiguous_target_is_left_alone() {
        let clock = ManualClock::new(t0());
        let controller = Arc::new(FakeController::default());
        let locator = FakeLocator::with(vec![
            Target {
                pid: 4000,
                start_time: None,
            },
            Target {
                pid: 4001,
                start_time: None,
            },
        ]);
        let supervisor = watchdog(&clock, &controller, &locator, six_hours());
        let _scheduler = supervisor.start();

        let before = supervisor.snapshot().state;
        clock.set(t0() + hours(1));
        supervisor.trigger_manual();
        wait_until("episode completion", || !supervisor.in_progress()).await;
        assert_eq!(controller.calls(), 0);
        assert_eq!(locator.spawned(), 0);

        let after = supervisor.snapshot().state;
        assert_eq!(after.phase, Phase::Scheduled);
        assert_eq!(after.restart_count, before.restart_count);
        assert_eq!(after.last_restart_at, before.last_restart_at);
        assert_eq!(after.next_restart_at, Some(t0() + hours(7)));
    }

    #[tokio::test]
    async fn missing_target_is_spawned() {
        let clock = ManualClock::new(t0());
        let controller = Arc::new(FakeController::default());
        let locator = FakeLocator::with(Vec::new());
        let supervisor = watchdog(&clock, &controller, &locator, six_hours());

        supervisor.ensure_target().await;
        assert_eq!(locator.spawned(), 1);
        assert_eq!(supervisor.snapshot().target.map(|t| t.pid), Some(5000));

        supervisor.ensure_target().await;
        assert_eq!(locator.spawned(), 1);

        *locator.running.lock() = Vec::new();
        let _scheduler = supervisor.start();
        supervisor.trigger_manual();
        wait_until("episode completion", || !supervisor.in_progress()).await;
        assert_eq!(controller.calls(), 0);
        assert_eq!(locator.spawned(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_timer_is_retried() {
        let clock = ManualClock::new(DateTime::<Utc>::MAX_UTC - hours(1));
        let controller = Arc::new(FakeController::default());
        let supervisor = in_process(&clock, &controller, six_hours());

        let _scheduler = supervisor.start();
        assert_eq!(supervisor.phase(), Phase::Idle);
        assert_eq!(supervisor.snapshot().state.next_restart_at, None);

        clock.set(t0());
        wait_until("re-armed timer", || supervisor.phase() == Phase::Scheduled).await;
        assert_eq!(
            supervisor.snapshot().state.next_restart_at,
            Some(t0() + hours(6))
        );
    }
}
