//! The runner state machine.
//!
//! Every process runs exactly one runner, which owns the process's [`RunState`] and
//! target user count. A Local runner drives its own
//! [`UserEngine`](../engine/index.html), a Master drives its Workers, and a Worker drives
//! its engine on behalf of a Master.
//!
//! ```text
//!  idle -> spawning <-> running
//!             |            |
//!             +--> stopping <+
//!                     |
//!                  stopped -> spawning
//!
//!  any state -> quitting -> cleanup
//! ```

use async_trait::async_trait;
use chrono::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::FlockConfiguration;
use crate::controller::{self, ControllerRequest, RunnerEvent, RunnerSnapshot};
use crate::engine::{EngineSettings, UserEngine};
use crate::executor::RequestExecutor;
use crate::metrics::{FlockMetric, FlockMetrics, StatsAggregator};
use crate::scenario::{FlockUser, Task};
use crate::shape::LoadShape;
use crate::user;
use crate::util;
use crate::{Flock, RunnerMode};

/// How often every runner loop wakes up.
pub(crate) const CONTROL_LOOP_INTERVAL: Duration = Duration::from_millis(100);

/// How often the engine moves toward its target.
pub(crate) const RAMP_INTERVAL: Duration = Duration::from_secs(1);

/// How often snapshots are published to subscribers.
pub(crate) const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(1);

/// The lifecycle of a runner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Waiting for a start command.
    Idle,
    /// Moving the user count toward the target.
    Spawning,
    /// At the target user count.
    Running,
    /// Quitting: users are cancelled, final messages are flushed.
    Cleanup,
    /// Waiting for users to finish their current task and exit.
    Stopping,
    /// No users running, waiting for a new start command.
    Stopped,
    /// Shutting down.
    Quitting,
}

/// State shared by all runner roles, owned by the runner's control loop.
pub(crate) struct RunnerState {
    pub(crate) mode: RunnerMode,
    pub(crate) run_state: RunState,
    pub(crate) target_user_count: usize,
    pub(crate) ramp_rate: f32,
    /// Set while the runner can't reach its target.
    pub(crate) warning: Option<String>,
    pub(crate) stats: StatsAggregator,
    pub(crate) configuration: FlockConfiguration,
    /// When the current run started.
    pub(crate) started: Option<DateTime<Local>>,
    started_at: Option<Instant>,
    /// The most users running at one time in the current run.
    pub(crate) max_users: usize,
    /// Quit once stopped.
    pub(crate) shutdown_after_stop: bool,
    /// Quit `--autoquit` seconds after stopping.
    autoquit_after_stop: bool,
    autoquit_at: Option<Instant>,
    /// Decides the user count instead of `--users` when set.
    pub(crate) shape: Option<Box<dyn LoadShape>>,
    shape_started: Option<Instant>,
    next_shape_tick: Instant,
    pub(crate) stats_reset_done: bool,
    canceled: bool,
    pub(crate) controller_rx: flume::Receiver<ControllerRequest>,
    pub(crate) subscribers: Vec<flume::Sender<RunnerEvent>>,
    /// Accounts for time spent working, subtracted from time sleeping.
    pub(crate) drift_timer: tokio::time::Instant,
    pub(crate) next_ramp: Instant,
    window_timer: Instant,
    snapshot_timer: Instant,
    running_metrics_timer: Instant,
    pub(crate) log_prefix: String,
}
impl RunnerState {
    pub(crate) fn new(
        mode: RunnerMode,
        configuration: FlockConfiguration,
        controller_rx: flume::Receiver<ControllerRequest>,
        log_prefix: &str,
    ) -> Self {
        let now = Instant::now();
        RunnerState {
            mode,
            run_state: RunState::Idle,
            target_user_count: 0,
            ramp_rate: 1.0,
            warning: None,
            stats: StatsAggregator::new(),
            configuration,
            started: None,
            started_at: None,
            max_users: 0,
            shutdown_after_stop: false,
            autoquit_after_stop: false,
            autoquit_at: None,
            shape: None,
            shape_started: None,
            next_shape_tick: now,
            stats_reset_done: false,
            canceled: false,
            controller_rx,
            subscribers: Vec::new(),
            drift_timer: tokio::time::Instant::now(),
            next_ramp: now,
            window_timer: now,
            snapshot_timer: now,
            running_metrics_timer: now,
            log_prefix: log_prefix.to_string(),
        }
    }

    /// Change from one run state to another, telling subscribers.
    pub(crate) fn set_run_state(&mut self, run_state: RunState) {
        // There's nothing to do if already in the specified state.
        if self.run_state == run_state {
            return;
        }
        info!("{}entering runner state: {:?}", self.log_prefix, run_state);
        let from = self.run_state;
        self.run_state = run_state;
        self.publish(RunnerEvent::StateChanged {
            from,
            to: run_state,
        });
    }

    /// Send an event to every subscriber, forgetting those that went away.
    pub(crate) fn publish(&mut self, event: RunnerEvent) {
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    /// Record a new warning, publishing it if it changed.
    pub(crate) fn set_warning(&mut self, warning: Option<String>) {
        if warning != self.warning {
            if let Some(w) = warning.as_ref() {
                self.publish(RunnerEvent::Warning(w.to_string()));
            }
            self.warning = warning;
        }
    }

    /// Start a fresh run: stats and timers begin again.
    pub(crate) fn begin_run(&mut self) {
        self.stats.reset();
        self.started = Some(Local::now());
        self.started_at = Some(Instant::now());
        self.max_users = 0;
        self.stats_reset_done = false;
        self.autoquit_after_stop = false;
        self.autoquit_at = None;
    }

    /// Seconds since the current run started.
    pub(crate) fn duration(&self) -> usize {
        self.started_at
            .map(|s| s.elapsed().as_secs() as usize)
            .unwrap_or(0)
    }

    pub(crate) fn update_max_users(&mut self, user_count: usize) {
        if user_count > self.max_users {
            self.max_users = user_count;
        }
    }

    pub(crate) fn metrics(&self, final_metrics: bool) -> FlockMetrics {
        FlockMetrics {
            started: self.started,
            duration: self.duration(),
            users: self.max_users,
            stats: self.stats.clone(),
            final_metrics,
            display_metrics: !self.configuration.no_print_stats,
            display_errors: !self.configuration.no_error_summary,
            exit_code_on_error: self
                .configuration
                .exit_code_on_error
                .unwrap_or(crate::config::DEFAULT_EXIT_CODE_ON_ERROR),
        }
    }

    /// Close the one second rate window when it's due.
    pub(crate) fn window_expired(&mut self) -> bool {
        if self.window_timer.elapsed() >= Duration::from_secs(1) {
            self.window_timer += Duration::from_secs(1);
            // Don't try to catch up after a long stall.
            if self.window_timer.elapsed() >= Duration::from_secs(1) {
                self.window_timer = Instant::now();
            }
            true
        } else {
            false
        }
    }

    /// Whether it's time to publish a snapshot to subscribers.
    pub(crate) fn snapshot_due(&mut self) -> bool {
        if self.subscribers.is_empty() || self.snapshot_timer.elapsed() < SNAPSHOT_INTERVAL {
            return false;
        }
        self.snapshot_timer = Instant::now();
        true
    }

    /// Whether it's time to ramp again. The first ramp after a start is immediate.
    pub(crate) fn ramp_due(&mut self) -> bool {
        let now = Instant::now();
        if now < self.next_ramp {
            return false;
        }
        self.next_ramp += RAMP_INTERVAL;
        if self.next_ramp <= now {
            self.next_ramp = now + RAMP_INTERVAL;
        }
        true
    }

    /// Print running metrics if enabled and due.
    pub(crate) fn print_running_metrics(&mut self) {
        if let Some(seconds) = self.configuration.running_metrics {
            if seconds > 0
                && matches!(self.run_state, RunState::Spawning | RunState::Running)
                && util::timer_expired(self.running_metrics_timer, seconds)
            {
                self.running_metrics_timer = Instant::now();
                self.metrics(false).print_running();
            }
        }
    }

    /// Whether the configured run time has elapsed. A load shape decides on its own
    /// when to end.
    pub(crate) fn run_time_expired(&self) -> bool {
        let run_time = self.configuration.run_time();
        match self.started_at {
            Some(started_at) if run_time > 0 && self.shape.is_none() => {
                matches!(self.run_state, RunState::Spawning | RunState::Running)
                    && util::timer_expired(started_at, run_time)
            }
            _ => false,
        }
    }

    /// The run ended on its own: quit once stopped, or `--autoquit` seconds later.
    pub(crate) fn stop_then_quit(&mut self) {
        if self.configuration.autoquit.is_some() {
            self.autoquit_after_stop = true;
        } else {
            self.shutdown_after_stop = true;
        }
    }

    /// Called on reaching stopped. Returns true if it's time to quit.
    pub(crate) fn reached_stopped(&mut self) -> bool {
        if self.shutdown_after_stop {
            return true;
        }
        if self.autoquit_after_stop {
            self.autoquit_after_stop = false;
            let seconds = self.configuration.autoquit.unwrap_or(0);
            info!(
                "{}quitting in {} seconds unless started again",
                self.log_prefix, seconds
            );
            self.autoquit_at = Some(Instant::now() + Duration::from_secs(seconds as u64));
        }
        false
    }

    /// Whether `--autoquit` seconds passed since stopping, without a new start.
    pub(crate) fn autoquit_expired(&mut self) -> bool {
        match self.autoquit_at {
            Some(deadline)
                if matches!(self.run_state, RunState::Idle | RunState::Stopped)
                    && Instant::now() >= deadline =>
            {
                self.autoquit_at = None;
                true
            }
            _ => false,
        }
    }

    /// Returns true the first time ctrl-c is seen.
    pub(crate) fn newly_canceled(&mut self) -> bool {
        if !self.canceled && util::canceled() {
            self.canceled = true;
            true
        } else {
            false
        }
    }
}

/// Optional tasks run when a load test starts and stops.
pub(crate) struct Hooks {
    test_start: Option<Task>,
    test_stop: Option<Task>,
    test_started: bool,
    executor: Arc<dyn RequestExecutor>,
    metrics_tx: flume::Sender<FlockMetric>,
}
impl Hooks {
    pub(crate) fn new(
        test_start: Option<Task>,
        test_stop: Option<Task>,
        executor: Arc<dyn RequestExecutor>,
        metrics_tx: flume::Sender<FlockMetric>,
    ) -> Self {
        Hooks {
            test_start,
            test_stop,
            test_started: false,
            executor,
            metrics_tx,
        }
    }

    /// Runs on the first transition to spawning only.
    pub(crate) async fn test_start(&mut self) {
        if self.test_started {
            return;
        }
        self.test_started = true;
        if let Some(task) = self.test_start.as_ref() {
            let mut user = self.hook_user("test_start");
            user::invoke_hook("test_start", task, &mut user).await;
        }
    }

    /// Runs every time the runner reaches stopped.
    pub(crate) async fn test_stop(&mut self) {
        if let Some(task) = self.test_stop.as_ref() {
            let mut user = self.hook_user("test_stop");
            user::invoke_hook("test_stop", task, &mut user).await;
        }
    }

    fn hook_user(&self, name: &str) -> FlockUser {
        FlockUser::new(
            0,
            name,
            Arc::clone(&self.executor),
            self.metrics_tx.clone(),
        )
    }
}

/// Operations every runner role supports. Controllers reach them through
/// [`handle_controller_requests`](../controller/index.html).
#[async_trait]
pub(crate) trait Runner: Send {
    fn runner_state(&self) -> &RunnerState;
    fn runner_state_mut(&mut self) -> &mut RunnerState;
    /// Converge toward `target_user_count` users, spawning `ramp_rate` per second.
    async fn start(&mut self, target_user_count: usize, ramp_rate: f32);
    /// Gracefully stop all users.
    async fn stop(&mut self);
    /// Cancel all users and shut down.
    async fn quit(&mut self);
    fn reset_stats(&mut self);
    fn snapshot(&self) -> RunnerSnapshot;
}

/// Publish a snapshot to subscribers when one is due.
pub(crate) fn publish_snapshot<R: Runner>(runner: &mut R) {
    if runner.runner_state_mut().snapshot_due() {
        let snapshot = runner.snapshot();
        runner
            .runner_state_mut()
            .publish(RunnerEvent::Snapshot(Box::new(snapshot)));
    }
}

/// Start following the load shape from time zero.
pub(crate) async fn start_shape<R: Runner>(runner: &mut R) {
    info!("following the load shape");
    runner.runner_state_mut().shape_started = Some(Instant::now());
    apply_shape(runner).await;
}

/// Ask the load shape what to run once a second while the run follows it.
pub(crate) async fn follow_shape<R: Runner>(runner: &mut R) {
    let due = {
        let state = runner.runner_state();
        state.shape_started.is_some()
            && matches!(state.run_state, RunState::Spawning | RunState::Running)
            && Instant::now() >= state.next_shape_tick
    };
    if due {
        apply_shape(runner).await;
    }
}

async fn apply_shape<R: Runner>(runner: &mut R) {
    let (next, run_state, target_user_count, ramp_rate) = {
        let state = runner.runner_state_mut();
        state.next_shape_tick = Instant::now() + RAMP_INTERVAL;
        let run_time = state
            .shape_started
            .map(|started| started.elapsed())
            .unwrap_or_default();
        let next = match state.shape.as_mut() {
            Some(shape) => shape.tick(run_time),
            None => return,
        };
        (next, state.run_state, state.target_user_count, state.ramp_rate)
    };
    let running = matches!(run_state, RunState::Spawning | RunState::Running);
    match next {
        Some((users, hatch_rate)) => {
            let unchanged = running
                && target_user_count == users
                && (ramp_rate - hatch_rate).abs() < f32::EPSILON;
            if !unchanged {
                runner.start(users, hatch_rate).await;
            }
        }
        None => {
            info!("load shape finished, stopping load test");
            let quit_now = {
                let state = runner.runner_state_mut();
                state.shape_started = None;
                state.stop_then_quit();
                matches!(run_state, RunState::Idle | RunState::Stopped) && state.reached_stopped()
            };
            if running {
                runner.stop().await;
            } else if quit_now {
                runner.quit().await;
            }
        }
    }
}

/// A single process running users itself.
pub(crate) struct LocalRunner {
    state: RunnerState,
    engine: UserEngine,
    metrics_rx: flume::Receiver<FlockMetric>,
    hooks: Hooks,
    node_id: String,
}
impl LocalRunner {
    pub(crate) fn new(flock: Flock) -> Self {
        let (metrics_tx, metrics_rx) = flume::unbounded();
        let configuration = flock.configuration;
        let settings = EngineSettings {
            scheduler: flock.scheduler,
            max_users: configuration.max_users,
            stop_timeout: configuration.stop_timeout(),
            equal_weights: configuration.equal_weights,
        };
        let engine = UserEngine::new(
            flock.user_specs,
            Arc::clone(&flock.executor),
            metrics_tx.clone(),
            settings,
            "",
        );
        let mut state = RunnerState::new(RunnerMode::Local, configuration, flock.controller_rx, "");
        state.shape = flock.load_shape;
        LocalRunner {
            state,
            engine,
            metrics_rx,
            hooks: Hooks::new(
                flock.test_start_task,
                flock.test_stop_task,
                flock.executor,
                metrics_tx,
            ),
            node_id: util::node_id("local"),
        }
    }

    /// The control loop. Returns the final metrics once the runner quits.
    pub(crate) async fn run(mut self) -> Result<FlockMetrics, crate::FlockError> {
        if self.state.configuration.no_autostart {
            info!("waiting for a start command from a controller...");
        } else if self.state.shape.is_some() {
            start_shape(&mut self).await;
        } else {
            let users = self.state.configuration.users.unwrap_or(1);
            let hatch_rate = self.state.configuration.hatch_rate();
            self.start(users, hatch_rate).await;
        }

        loop {
            match self.state.run_state {
                // Nothing happens but checking for controller requests.
                RunState::Idle | RunState::Stopped => {}
                RunState::Spawning => {
                    if self.state.ramp_due() {
                        self.engine.tick();
                    }
                    if self.engine.converged() {
                        self.state.set_run_state(RunState::Running);
                        if self.state.configuration.reset_stats && !self.state.stats_reset_done {
                            self.state.stats_reset_done = true;
                            self.drain_metrics();
                            self.reset_stats();
                        }
                    }
                }
                RunState::Running => {
                    self.engine.reap();
                    if !self.engine.converged() {
                        // Users exited on their own, bring them back.
                        self.state.set_run_state(RunState::Spawning);
                    }
                }
                RunState::Stopping => {
                    self.engine.reap();
                    if self.engine.user_count() == 0 && self.engine.stopping_count() == 0 {
                        self.drain_metrics();
                        self.state.set_run_state(RunState::Stopped);
                        self.hooks.test_stop().await;
                        if self.state.reached_stopped() {
                            self.quit().await;
                        }
                    }
                }
                RunState::Quitting => {
                    self.engine.abort_all();
                    self.state.set_run_state(RunState::Cleanup);
                }
                RunState::Cleanup => {
                    self.drain_metrics();
                    break;
                }
            }

            self.drain_metrics();
            let user_count = self.engine.user_count();
            self.state.update_max_users(user_count);
            if self.state.window_expired() {
                self.state.stats.reset_window();
            }
            self.state.print_running_metrics();
            publish_snapshot(&mut self);
            follow_shape(&mut self).await;

            if self.state.run_time_expired() {
                info!("run time expired, stopping load test");
                self.state.stop_then_quit();
                self.stop().await;
            }

            if self.state.autoquit_expired() {
                info!("autoquit time reached, shutting down");
                self.quit().await;
            }

            // The first ctrl-c stops then quits.
            if self.state.newly_canceled() {
                self.state.shutdown_after_stop = true;
                match self.state.run_state {
                    RunState::Spawning | RunState::Running => self.stop().await,
                    RunState::Stopping => (),
                    _ => self.quit().await,
                }
            }

            controller::handle_controller_requests(&mut self).await;

            self.state.drift_timer =
                util::sleep_minus_drift(CONTROL_LOOP_INTERVAL, self.state.drift_timer).await;
        }

        Ok(self.state.metrics(true))
    }

    fn drain_metrics(&mut self) {
        for metric in self.metrics_rx.drain() {
            match metric {
                FlockMetric::Request(request) => {
                    if let Err(e) = self.state.stats.record(
                        &request.method,
                        &request.name,
                        request.response_time,
                        request.response_length,
                        request.error.as_deref(),
                    ) {
                        warn!("{}", e);
                    }
                }
                FlockMetric::Exception(exception) => {
                    self.state
                        .stats
                        .record_exception(&exception.task, &exception.error, &self.node_id);
                }
            }
        }
    }
}

#[async_trait]
impl Runner for LocalRunner {
    fn runner_state(&self) -> &RunnerState {
        &self.state
    }

    fn runner_state_mut(&mut self) -> &mut RunnerState {
        &mut self.state
    }

    async fn start(&mut self, target_user_count: usize, ramp_rate: f32) {
        match self.state.run_state {
            RunState::Quitting | RunState::Cleanup => {
                warn!("load test is shutting down, ignoring start");
                return;
            }
            RunState::Idle | RunState::Stopped => {
                self.drain_metrics();
                self.state.begin_run();
                self.hooks.test_start().await;
            }
            _ => (),
        }
        info!(
            "starting {} users at {} per second",
            target_user_count, ramp_rate
        );
        self.state.target_user_count = target_user_count;
        self.state.ramp_rate = ramp_rate;
        self.engine.set_target(target_user_count, ramp_rate);
        let warning = self.engine.warning.clone();
        self.state.set_warning(warning);
        self.state.next_ramp = Instant::now();
        self.state.set_run_state(RunState::Spawning);
    }

    async fn stop(&mut self) {
        match self.state.run_state {
            RunState::Spawning | RunState::Running => {
                info!("stopping {} users", self.engine.user_count());
                self.engine.stop_all();
                self.state.target_user_count = 0;
                self.state.set_warning(None);
                self.state.set_run_state(RunState::Stopping);
            }
            RunState::Idle | RunState::Stopped if self.state.shutdown_after_stop => {
                self.quit().await;
            }
            _ => debug!("not running, ignoring stop"),
        }
    }

    async fn quit(&mut self) {
        if !matches!(
            self.state.run_state,
            RunState::Quitting | RunState::Cleanup
        ) {
            self.state.set_run_state(RunState::Quitting);
        }
    }

    fn reset_stats(&mut self) {
        info!("resetting stats");
        self.state.stats.reset();
    }

    fn snapshot(&self) -> RunnerSnapshot {
        RunnerSnapshot {
            mode: RunnerMode::Local,
            state: self.state.run_state,
            target_user_count: self.state.target_user_count,
            current_user_count: self.engine.user_count(),
            warning: self.state.warning.clone(),
            workers: Vec::new(),
            user_counts: self.engine.user_counts(),
            metrics: self.state.metrics(false),
        }
    }
}

/// Sum per-UserSpec counts from several sources.
pub(crate) fn add_user_counts(
    total: &mut BTreeMap<String, usize>,
    counts: &BTreeMap<String, usize>,
) {
    for (name, count) in counts {
        *total.entry(name.to_string()).or_insert(0) += count;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::FlockConfiguration;
    use crate::scenario::TaskResult;
    use gumdrop::Options;

    async fn request(user: &mut FlockUser) -> TaskResult {
        user.request("GET", "/", None).await;
        Ok(())
    }

    async fn failing_hook(_user: &mut FlockUser) -> TaskResult {
        Err("hook failed".into())
    }

    fn local_flock(args: &[&str]) -> Flock {
        let mut configuration = FlockConfiguration::parse_args_default(args).unwrap();
        configuration.configure(&crate::config::FlockDefaults::default());
        Flock::initialize_with_config(configuration)
            .unwrap()
            .register_user(
                crate::user!("Visitor")
                    .register_task(crate::task!(request))
                    .set_wait_time(Duration::from_millis(50), Duration::from_millis(50))
                    .unwrap(),
            )
            .test_stop(crate::task!(failing_hook))
    }

    fn local_runner(args: &[&str]) -> LocalRunner {
        LocalRunner::new(local_flock(args))
    }

    // Two users for the first second, then three until the load test ends at two seconds.
    fn two_step_shape(run_time: Duration) -> Option<(usize, f32)> {
        if run_time < Duration::from_secs(1) {
            Some((2, 10.0))
        } else if run_time < Duration::from_secs(2) {
            Some((3, 10.0))
        } else {
            None
        }
    }

    #[test]
    fn state_changes_are_published() {
        let (_tx, rx) = flume::unbounded();
        let mut state = RunnerState::new(RunnerMode::Local, FlockConfiguration::default(), rx, "");
        let (events_tx, events_rx) = flume::unbounded();
        state.subscribers.push(events_tx);

        state.set_run_state(RunState::Spawning);
        // Setting the same state again is a no-op.
        state.set_run_state(RunState::Spawning);
        state.set_run_state(RunState::Running);
        let events: Vec<RunnerEvent> = events_rx.drain().collect();
        assert_eq!(events.len(), 2);
        match &events[1] {
            RunnerEvent::StateChanged { from, to } => {
                assert_eq!(*from, RunState::Spawning);
                assert_eq!(*to, RunState::Running);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // Subscribers that went away are dropped.
        drop(events_rx);
        state.set_run_state(RunState::Stopping);
        assert!(state.subscribers.is_empty());
    }

    #[test]
    fn ramp_timer() {
        let (_tx, rx) = flume::unbounded();
        let mut state = RunnerState::new(RunnerMode::Local, FlockConfiguration::default(), rx, "");
        state.next_ramp = Instant::now();
        // The first ramp is immediate, the next one waits a full interval.
        assert!(state.ramp_due());
        assert!(!state.ramp_due());
    }

    #[tokio::test]
    async fn start_stop_restart() {
        let mut runner = local_runner(&["--no-autostart"]);
        assert_eq!(runner.state.run_state, RunState::Idle);

        runner.start(4, 4.0).await;
        assert_eq!(runner.state.run_state, RunState::Spawning);
        assert!(runner.state.ramp_due());
        runner.engine.tick();
        assert_eq!(runner.engine.user_count(), 4);
        assert_eq!(runner.snapshot().current_user_count, 4);

        runner.stop().await;
        assert_eq!(runner.state.run_state, RunState::Stopping);
        assert_eq!(runner.snapshot().target_user_count, 0);

        // Stopping again changes nothing.
        runner.stop().await;
        assert_eq!(runner.state.run_state, RunState::Stopping);

        // A new start goes straight back to spawning.
        runner.start(2, 1.0).await;
        assert_eq!(runner.state.run_state, RunState::Spawning);

        runner.quit().await;
        assert_eq!(runner.state.run_state, RunState::Quitting);
        // Nothing starts once quitting.
        runner.start(2, 1.0).await;
        assert_eq!(runner.state.run_state, RunState::Quitting);
    }

    #[tokio::test]
    async fn run_time_stops_then_quits() {
        let runner = local_runner(&["--users", "3", "--hatch-rate", "3", "--run-time", "2s"]);
        let started = Instant::now();
        let metrics = tokio::time::timeout(Duration::from_secs(10), runner.run())
            .await
            .unwrap()
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(metrics.users, 3);
        assert!(metrics.stats.num_requests() > 0);
        // The failing test_stop hook is recorded as an exception.
        assert_eq!(metrics.stats.num_exceptions(), 1);
        assert!(metrics
            .stats
            .exceptions
            .contains_key("test_stop: hook failed"));
    }

    #[test]
    fn autoquit_after_stopping() {
        let (_tx, rx) = flume::unbounded();
        let mut configuration = FlockConfiguration::default();
        configuration.autoquit = Some(0);
        let mut state = RunnerState::new(RunnerMode::Local, configuration, rx, "");
        state.stop_then_quit();
        assert!(!state.shutdown_after_stop);
        // Not stopped yet.
        assert!(!state.autoquit_expired());

        // Reaching stopped starts the countdown instead of quitting.
        state.run_state = RunState::Stopped;
        assert!(!state.reached_stopped());
        assert!(state.autoquit_expired());
        assert!(!state.autoquit_expired());

        // A new run cancels the countdown.
        state.stop_then_quit();
        assert!(!state.reached_stopped());
        state.begin_run();
        assert!(!state.autoquit_expired());

        // Without autoquit, stopping quits right away.
        let (_tx, rx) = flume::unbounded();
        let mut state = RunnerState::new(RunnerMode::Local, FlockConfiguration::default(), rx, "");
        state.stop_then_quit();
        assert!(state.shutdown_after_stop);
        assert!(state.reached_stopped());
    }

    #[tokio::test]
    async fn load_shape_sets_users() {
        let mut runner =
            LocalRunner::new(local_flock(&["--no-autostart"]).set_load_shape(two_step_shape));
        start_shape(&mut runner).await;
        assert_eq!(runner.state.run_state, RunState::Spawning);
        assert_eq!(runner.state.target_user_count, 2);
        assert_eq!(runner.state.ramp_rate, 10.0);

        // Not asked again until a second has passed.
        runner.state.run_state = RunState::Running;
        follow_shape(&mut runner).await;
        assert_eq!(runner.state.target_user_count, 2);

        runner.state.next_shape_tick = Instant::now();
        runner.state.shape_started = Some(Instant::now() - Duration::from_millis(1500));
        follow_shape(&mut runner).await;
        assert_eq!(runner.state.target_user_count, 3);

        // Past the last step the load test stops, and then quits.
        runner.state.next_shape_tick = Instant::now();
        runner.state.shape_started = Some(Instant::now() - Duration::from_secs(3));
        follow_shape(&mut runner).await;
        assert_eq!(runner.state.run_state, RunState::Stopping);
        assert!(runner.state.shutdown_after_stop);
        // The shape isn't followed any more.
        assert_eq!(runner.state.shape_started, None);
        runner.engine.abort_all();
    }

    #[tokio::test]
    async fn load_shape_runs_then_quits() {
        let flock = local_flock(&[]).set_load_shape(two_step_shape);
        let started = Instant::now();
        let metrics = tokio::time::timeout(Duration::from_secs(10), LocalRunner::new(flock).run())
            .await
            .unwrap()
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(metrics.users, 3);
        assert!(metrics.stats.num_requests() > 0);
    }

    #[tokio::test]
    async fn autoquit_waits_after_run_time() {
        let runner = local_runner(&[
            "--users",
            "2",
            "--hatch-rate",
            "2",
            "--run-time",
            "1",
            "--autoquit",
            "2",
        ]);
        let started = Instant::now();
        let metrics = tokio::time::timeout(Duration::from_secs(10), runner.run())
            .await
            .unwrap()
            .unwrap();
        // One second running, then two more stopped before quitting.
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(metrics.users, 2);
    }
}
