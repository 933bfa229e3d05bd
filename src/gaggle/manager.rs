//! The Master runner: coordinates Workers and merges their stats, runs no users itself.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::config::{FlockConfiguration, FlockConfigure, FlockDefaults, FlockValue};
use crate::controller::{self, RunnerEvent, RunnerSnapshot, WorkerSummary};
use crate::engine::{apportion_workers, EngineSettings, RunSpec};
use crate::gaggle::common::{
    Envelope, ExceptionPayload, HeartbeatPayload, MessageKind, SequenceTracker, Sequencer, SpawnPayload,
    StatsPayload, WorkerStatus, DEFAULT_GAGGLE_PORT, DEFAULT_HEARTBEAT_INTERVAL,
    DEFAULT_HEARTBEAT_LIVENESS, DEFAULT_MASTER_BIND_HOST, DEFAULT_REPORT_INTERVAL,
};
use crate::gaggle::transport::ManagerTransport;
use crate::gaggle::websocket::WebSocketManagerTransport;
use crate::metrics::{FlockMetric, FlockMetrics, WindowRates};
use crate::runner::{self, Hooks, RunState, Runner, RunnerState, CONTROL_LOOP_INTERVAL};
use crate::{util, Flock, FlockError, RunnerMode};

/// How long a quitting Master waits for its Workers to confirm.
const QUIT_TIMEOUT: Duration = Duration::from_secs(3);

impl FlockConfiguration {
    pub(crate) fn configure_master(&mut self, defaults: &FlockDefaults) {
        // Set `expect_workers` on Master.
        self.expect_workers = self.get_value(vec![
            FlockValue {
                value: self.expect_workers,
                filter: self.expect_workers.is_none(),
                message: "expect_workers",
            },
            FlockValue {
                value: defaults.expect_workers,
                filter: defaults.expect_workers.is_none() || !self.master,
                message: "expect_workers",
            },
            FlockValue {
                value: Some(1),
                filter: !self.master,
                message: "",
            },
        ]);

        self.expect_workers_max_wait = self.get_value(vec![
            FlockValue {
                value: self.expect_workers_max_wait,
                filter: self.expect_workers_max_wait.is_none(),
                message: "expect_workers_max_wait",
            },
            FlockValue {
                value: defaults.expect_workers_max_wait,
                filter: defaults.expect_workers_max_wait.is_none() || !self.master,
                message: "expect_workers_max_wait",
            },
        ]);

        self.master_bind_host = self
            .get_value(vec![
                FlockValue {
                    value: Some(self.master_bind_host.to_string()),
                    filter: self.master_bind_host.is_empty(),
                    message: "master_bind_host",
                },
                FlockValue {
                    value: defaults.master_bind_host.clone(),
                    filter: defaults.master_bind_host.is_none() || !self.master,
                    message: "master_bind_host",
                },
                FlockValue {
                    value: Some(DEFAULT_MASTER_BIND_HOST.to_string()),
                    filter: !self.master,
                    message: "",
                },
            ])
            .unwrap_or_default();

        self.master_bind_port = self
            .get_value(vec![
                FlockValue {
                    value: Some(self.master_bind_port),
                    filter: self.master_bind_port == 0,
                    message: "master_bind_port",
                },
                FlockValue {
                    value: defaults.master_bind_port,
                    filter: defaults.master_bind_port.is_none() || !self.master,
                    message: "master_bind_port",
                },
                FlockValue {
                    value: Some(DEFAULT_GAGGLE_PORT),
                    filter: !self.master,
                    message: "",
                },
            ])
            .unwrap_or(0);

        // Heartbeat and report timing is shared by the Master and its Workers.
        let gaggle = self.master || self.worker;
        self.heartbeat_interval = self.get_value(vec![
            FlockValue {
                value: self.heartbeat_interval,
                filter: self.heartbeat_interval.is_none(),
                message: "heartbeat_interval",
            },
            FlockValue {
                value: defaults.heartbeat_interval,
                filter: defaults.heartbeat_interval.is_none() || !gaggle,
                message: "heartbeat_interval",
            },
            FlockValue {
                value: Some(DEFAULT_HEARTBEAT_INTERVAL),
                filter: !gaggle,
                message: "",
            },
        ]);
        self.heartbeat_liveness = self.get_value(vec![
            FlockValue {
                value: self.heartbeat_liveness,
                filter: self.heartbeat_liveness.is_none(),
                message: "heartbeat_liveness",
            },
            FlockValue {
                value: defaults.heartbeat_liveness,
                filter: defaults.heartbeat_liveness.is_none() || !gaggle,
                message: "heartbeat_liveness",
            },
            FlockValue {
                value: Some(DEFAULT_HEARTBEAT_LIVENESS),
                filter: !gaggle,
                message: "",
            },
        ]);
        self.report_interval = self.get_value(vec![
            FlockValue {
                value: self.report_interval,
                filter: self.report_interval.is_none(),
                message: "report_interval",
            },
            FlockValue {
                value: defaults.report_interval,
                filter: defaults.report_interval.is_none() || !gaggle,
                message: "report_interval",
            },
            FlockValue {
                value: Some(DEFAULT_REPORT_INTERVAL),
                filter: !gaggle,
                message: "",
            },
        ]);
    }

    /// Validate options that only make sense on a Master.
    pub(crate) fn validate_master(&self) -> Result<(), FlockError> {
        if self.master {
            if let Some(0) = self.expect_workers {
                return Err(FlockError::InvalidOption {
                    option: "`configuration.expect_workers`".to_string(),
                    value: "0".to_string(),
                    detail: "`configuration.expect_workers` must be at least 1.".to_string(),
                });
            }
            return Ok(());
        }

        if let Some(expect_workers) = self.expect_workers {
            return Err(FlockError::InvalidOption {
                option: "`configuration.expect_workers`".to_string(),
                value: expect_workers.to_string(),
                detail: "`configuration.expect_workers` can only be set on a Master.".to_string(),
            });
        }
        if let Some(max_wait) = self.expect_workers_max_wait {
            return Err(FlockError::InvalidOption {
                option: "`configuration.expect_workers_max_wait`".to_string(),
                value: max_wait.to_string(),
                detail: "`configuration.expect_workers_max_wait` can only be set on a Master."
                    .to_string(),
            });
        }
        if !self.master_bind_host.is_empty() {
            return Err(FlockError::InvalidOption {
                option: "`configuration.master_bind_host`".to_string(),
                value: self.master_bind_host.to_string(),
                detail: "`configuration.master_bind_host` can only be set on a Master."
                    .to_string(),
            });
        }
        if self.master_bind_port > 0 {
            return Err(FlockError::InvalidOption {
                option: "`configuration.master_bind_port`".to_string(),
                value: self.master_bind_port.to_string(),
                detail: "`configuration.master_bind_port` can only be set on a Master."
                    .to_string(),
            });
        }
        Ok(())
    }
}

/// What the Master knows about one Worker.
#[derive(Debug)]
struct WorkerState {
    status: WorkerStatus,
    /// The Worker's own run state, as last reported.
    state: RunState,
    user_count: usize,
    user_counts: BTreeMap<String, usize>,
    /// The target the Worker last reported working toward.
    target_count: usize,
    /// Users the Master last asked this Worker to run.
    dispatched: Option<usize>,
    last_heartbeat_at: Instant,
    window_rates: WindowRates,
}
impl WorkerState {
    fn new() -> Self {
        WorkerState {
            status: WorkerStatus::Ready,
            state: RunState::Idle,
            user_count: 0,
            user_counts: BTreeMap::new(),
            target_count: 0,
            dispatched: None,
            last_heartbeat_at: Instant::now(),
            window_rates: WindowRates::default(),
        }
    }

    fn connected(&self) -> bool {
        self.status != WorkerStatus::Missing
    }

    // Reached what it was last asked to do.
    fn converged(&self) -> bool {
        self.state == RunState::Running && self.dispatched == Some(self.target_count)
    }
}

pub(crate) struct MasterRunner {
    state: RunnerState,
    transport: Box<dyn ManagerTransport>,
    workers: BTreeMap<String, WorkerState>,
    sequencer: Sequencer,
    tracker: SequenceTracker,
    run_spec: RunSpec,
    hooks: Hooks,
    metrics_rx: flume::Receiver<FlockMetric>,
    /// A Worker not heard from this long is missing.
    heartbeat_timeout: Duration,
    /// Autostart waits for enough Workers.
    waiting_for_workers: bool,
    waiting_since: Instant,
    quit_deadline: Option<Instant>,
}
impl MasterRunner {
    /// Binds the transport; failing to bind is fatal.
    pub(crate) async fn new(flock: Flock) -> Result<Self, FlockError> {
        let configuration = flock.configuration;
        let settings = EngineSettings {
            scheduler: flock.scheduler,
            max_users: configuration.max_users,
            stop_timeout: configuration.stop_timeout(),
            equal_weights: configuration.equal_weights,
        };
        let transport: Box<dyn ManagerTransport> = match flock.master_transport {
            Some(transport) => transport,
            None => {
                let address = format!(
                    "{}:{}",
                    configuration.master_bind_host, configuration.master_bind_port
                );
                Box::new(WebSocketManagerTransport::bind(&address).await?)
            }
        };
        let heartbeat_interval = configuration
            .heartbeat_interval
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
        let heartbeat_liveness = configuration
            .heartbeat_liveness
            .unwrap_or(DEFAULT_HEARTBEAT_LIVENESS);
        let (metrics_tx, metrics_rx) = flume::unbounded();
        let mut state = RunnerState::new(RunnerMode::Master, configuration, flock.controller_rx, "");
        state.shape = flock.load_shape;
        Ok(MasterRunner {
            run_spec: RunSpec::new(&flock.user_specs, &settings),
            state,
            transport,
            workers: BTreeMap::new(),
            sequencer: Sequencer::new("master"),
            tracker: SequenceTracker::default(),
            hooks: Hooks::new(
                flock.test_start_task,
                flock.test_stop_task,
                flock.executor,
                metrics_tx,
            ),
            metrics_rx,
            heartbeat_timeout: Duration::from_millis((heartbeat_interval * heartbeat_liveness) as u64),
            waiting_for_workers: false,
            waiting_since: Instant::now(),
            quit_deadline: None,
        })
    }

    /// The control loop. Returns the merged metrics of every Worker once the Master quits.
    pub(crate) async fn run(mut self) -> Result<FlockMetrics, FlockError> {
        let expect_workers = self.state.configuration.expect_workers.unwrap_or(1);
        if self.state.configuration.no_autostart {
            info!("waiting for a start command from a controller...");
        } else {
            info!("waiting for {} workers...", expect_workers);
            self.waiting_for_workers = true;
            self.waiting_since = Instant::now();
        }

        loop {
            self.receive_messages();
            self.check_liveness();

            if self.waiting_for_workers {
                let ready = self.connected_worker_ids().len();
                if ready >= expect_workers {
                    self.waiting_for_workers = false;
                    if self.state.shape.is_some() {
                        runner::start_shape(&mut self).await;
                    } else {
                        let users = self.state.configuration.users.unwrap_or(1);
                        let hatch_rate = self.state.configuration.hatch_rate();
                        self.start(users, hatch_rate).await;
                    }
                } else if let Some(max_wait) = self.state.configuration.expect_workers_max_wait {
                    if util::timer_expired(self.waiting_since, max_wait) {
                        return Err(FlockError::Transport {
                            detail: format!(
                                "only {} of {} expected workers connected within {} seconds",
                                ready, expect_workers, max_wait
                            ),
                        });
                    }
                }
            }

            match self.state.run_state {
                RunState::Idle | RunState::Stopped | RunState::Running => {}
                RunState::Spawning => {
                    let mut connected = self.workers.values().filter(|w| w.connected()).peekable();
                    if connected.peek().is_some() && connected.all(|w| w.converged()) {
                        self.state.set_run_state(RunState::Running);
                        if self.state.configuration.reset_stats && !self.state.stats_reset_done {
                            self.state.stats_reset_done = true;
                            self.reset_stats();
                        }
                    }
                }
                RunState::Stopping => {
                    if self.workers.values().filter(|w| w.connected()).all(|w| {
                        w.user_count == 0 && matches!(w.state, RunState::Idle | RunState::Stopped)
                    }) {
                        self.drain_metrics();
                        self.state.set_run_state(RunState::Stopped);
                        self.hooks.test_stop().await;
                        if self.state.reached_stopped() {
                            self.quit().await;
                        }
                    }
                }
                RunState::Quitting => {
                    self.quit_deadline = Some(Instant::now() + QUIT_TIMEOUT);
                    self.state.set_run_state(RunState::Cleanup);
                }
                RunState::Cleanup => {
                    let deadline_passed = self
                        .quit_deadline
                        .map(|deadline| Instant::now() >= deadline)
                        .unwrap_or(true);
                    if !self.workers.values().any(|w| w.connected()) || deadline_passed {
                        if deadline_passed {
                            warn!("not every worker confirmed quitting");
                        }
                        self.drain_metrics();
                        self.apply_window_rates();
                        break;
                    }
                }
            }

            self.drain_metrics();
            let user_count = self.current_user_count();
            self.state.update_max_users(user_count);
            self.apply_window_rates();
            self.state.print_running_metrics();
            runner::publish_snapshot(&mut self);
            runner::follow_shape(&mut self).await;

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
                self.waiting_for_workers = false;
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

    fn connected_worker_ids(&self) -> Vec<String> {
        self.workers
            .iter()
            .filter(|(_, w)| w.connected())
            .map(|(id, _)| id.to_string())
            .collect()
    }

    /// The sum of user counts last reported by connected Workers.
    fn current_user_count(&self) -> usize {
        self.workers
            .values()
            .filter(|w| w.connected())
            .map(|w| w.user_count)
            .sum()
    }

    // The current rates are the sum of what connected Workers last reported.
    fn apply_window_rates(&mut self) {
        let mut rates = WindowRates::default();
        for worker in self.workers.values().filter(|w| w.connected()) {
            rates.add(&worker.window_rates);
        }
        self.state.stats.set_window_rates(&rates);
    }

    // Stats from hooks run on the Master.
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
                    let node = self.sequencer.sender_id().to_string();
                    self.state
                        .stats
                        .record_exception(&exception.task, &exception.error, &node);
                }
            }
        }
    }

    fn send<P: Serialize>(&mut self, worker_id: &str, kind: MessageKind, payload: &P) -> bool {
        let envelope = match self.sequencer.envelope(kind, payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("failed to build {:?} message: {}", kind, e);
                return false;
            }
        };
        match self.transport.send_to(worker_id, &envelope) {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to send {:?} to worker {}: {}", kind, worker_id, e);
                false
            }
        }
    }

    fn receive_messages(&mut self) {
        while let Some(envelope) = self.transport.try_recv() {
            if !self.tracker.accept(&envelope) {
                warn!(
                    "dropping out of sequence message {} from {}",
                    envelope.sequence_number, envelope.sender_id
                );
                continue;
            }
            self.handle_message(envelope);
        }
    }

    fn handle_message(&mut self, envelope: Envelope) {
        let worker_id = envelope.sender_id.clone();
        match envelope.kind {
            MessageKind::ClientReady => self.register_worker(&worker_id),
            MessageKind::Quit => {
                if self.workers.remove(&worker_id).is_some() {
                    info!("worker {} quit", worker_id);
                    if matches!(self.state.run_state, RunState::Spawning | RunState::Running) {
                        self.dispatch();
                    }
                }
            }
            MessageKind::Heartbeat | MessageKind::Stats | MessageKind::Exception => {
                let connected = match self.workers.get(&worker_id) {
                    Some(worker) => worker.connected(),
                    None => {
                        info!("message from unknown worker {}, asking it to reconnect", worker_id);
                        self.send(&worker_id, MessageKind::Reconnect, &());
                        return;
                    }
                };
                if !connected {
                    info!("message from missing worker {}, asking it to reconnect", worker_id);
                    self.send(&worker_id, MessageKind::Reconnect, &());
                }
                if let Err(e) = self.handle_report(&worker_id, &envelope, connected) {
                    warn!("dropping malformed {:?} from {}: {}", envelope.kind, worker_id, e);
                }
            }
            MessageKind::Spawn | MessageKind::Stop | MessageKind::Reconnect => {
                warn!("unexpected {:?} message from {}", envelope.kind, worker_id);
            }
        }
    }

    // Heartbeats, stats and exceptions. Data from a missing Worker is kept, its state isn't.
    fn handle_report(
        &mut self,
        worker_id: &str,
        envelope: &Envelope,
        connected: bool,
    ) -> Result<(), FlockError> {
        match envelope.kind {
            MessageKind::Heartbeat => {
                let heartbeat: HeartbeatPayload = envelope.payload()?;
                let prefix = format!("{}: ", worker_id);
                match heartbeat.health.warning.as_ref() {
                    Some(warning) => self
                        .state
                        .set_warning(Some(format!("{}{}", prefix, warning))),
                    None => {
                        // The Worker reached its target again.
                        if let Some(true) = self.state.warning.as_ref().map(|w| w.starts_with(&prefix)) {
                            self.state.set_warning(None);
                        }
                    }
                }
                if let Some(worker) = self.workers.get_mut(worker_id).filter(|_| connected) {
                    worker.last_heartbeat_at = Instant::now();
                    worker.state = heartbeat.state;
                    worker.user_count = heartbeat.user_count;
                    worker.target_count = heartbeat.target_count;
                }
            }
            MessageKind::Stats => {
                let report: StatsPayload = envelope.payload()?;
                self.state.stats.merge(&report.stats.without_windows());
                if let Some(worker) = self.workers.get_mut(worker_id).filter(|_| connected) {
                    worker.last_heartbeat_at = Instant::now();
                    worker.state = report.state;
                    worker.user_count = report.user_count;
                    worker.user_counts = report.user_counts;
                    worker.target_count = report.target_count;
                    worker.window_rates = report.stats.window_rates();
                }
            }
            MessageKind::Exception => {
                let exception: ExceptionPayload = envelope.payload()?;
                self.state
                    .stats
                    .record_exception(&exception.task, &exception.error, worker_id);
            }
            _ => (),
        }
        Ok(())
    }

    // A Worker registers, or registers again after a reconnect. Nothing it did before
    // is assumed to have survived.
    fn register_worker(&mut self, worker_id: &str) {
        self.workers
            .insert(worker_id.to_string(), WorkerState::new());
        info!(
            "worker {} is ready ({} connected)",
            worker_id,
            self.connected_worker_ids().len()
        );
        if matches!(self.state.run_state, RunState::Spawning | RunState::Running) {
            self.dispatch();
        }
    }

    /// Mark Workers not heard from within the timeout as missing, handing their users
    /// to the rest.
    fn check_liveness(&mut self) {
        let timeout = self.heartbeat_timeout;
        let mut lost = Vec::new();
        for (id, worker) in self.workers.iter_mut() {
            if worker.connected() && worker.last_heartbeat_at.elapsed() > timeout {
                worker.status = WorkerStatus::Missing;
                worker.dispatched = None;
                lost.push(id.to_string());
            }
        }
        if lost.is_empty() {
            return;
        }
        for id in &lost {
            let warning = format!("worker {} missed its heartbeats and is missing", id);
            warn!("{}", warning);
            self.state.publish(RunnerEvent::Warning(warning));
        }
        if matches!(self.state.run_state, RunState::Spawning | RunState::Running) {
            self.dispatch();
        }
    }

    /// Split the target across connected Workers and tell each its share.
    fn dispatch(&mut self) {
        let worker_ids = self.connected_worker_ids();
        if worker_ids.is_empty() {
            warn!("no workers connected, waiting for workers");
            self.state.set_run_state(RunState::Spawning);
            return;
        }
        let counts = apportion_workers(self.state.target_user_count, worker_ids.len());
        let ramp_rate = self.state.ramp_rate / worker_ids.len() as f32;
        for (worker_id, target_count) in worker_ids.iter().zip(counts) {
            debug!("assigning {} users to worker {}", target_count, worker_id);
            let spawn = SpawnPayload {
                target_count,
                ramp_rate,
                run_spec: self.run_spec.clone(),
            };
            let sent = self.send(worker_id, MessageKind::Spawn, &spawn);
            if let Some(worker) = self.workers.get_mut(worker_id) {
                if sent {
                    worker.status = WorkerStatus::Running;
                    worker.state = RunState::Spawning;
                    worker.dispatched = Some(target_count);
                } else {
                    // Its share is unassigned until the next dispatch.
                    worker.dispatched = None;
                }
            }
            if !sent {
                let warning = format!(
                    "failed to assign {} users to worker {}",
                    target_count, worker_id
                );
                warn!("{}", warning);
                self.state.publish(RunnerEvent::Warning(warning));
            }
        }
        self.state.set_run_state(RunState::Spawning);
    }
}

#[async_trait]
impl Runner for MasterRunner {
    fn runner_state(&self) -> &RunnerState {
        &self.state
    }

    fn runner_state_mut(&mut self) -> &mut RunnerState {
        &mut self.state
    }

    async fn start(&mut self, target_user_count: usize, ramp_rate: f32) {
        if matches!(self.state.run_state, RunState::Quitting | RunState::Cleanup) {
            warn!("load test is shutting down, ignoring start");
            return;
        }
        if self.connected_worker_ids().is_empty() {
            let warning = "no workers connected, ignoring start".to_string();
            warn!("{}", warning);
            self.state.publish(RunnerEvent::Warning(warning));
            return;
        }
        // Autostart is overridden by an explicit start.
        self.waiting_for_workers = false;
        if matches!(self.state.run_state, RunState::Idle | RunState::Stopped) {
            self.drain_metrics();
            self.state.begin_run();
            self.hooks.test_start().await;
        }
        info!(
            "starting {} users at {} per second across {} workers",
            target_user_count,
            ramp_rate,
            self.connected_worker_ids().len()
        );
        self.state.target_user_count = target_user_count;
        self.state.ramp_rate = ramp_rate;
        self.state.set_warning(None);
        self.dispatch();
    }

    async fn stop(&mut self) {
        match self.state.run_state {
            RunState::Spawning | RunState::Running => {
                info!("stopping {} users", self.current_user_count());
                for worker_id in self.connected_worker_ids() {
                    self.send(&worker_id, MessageKind::Stop, &());
                    if let Some(worker) = self.workers.get_mut(&worker_id) {
                        worker.status = WorkerStatus::Ready;
                        worker.state = RunState::Stopping;
                        worker.dispatched = None;
                    }
                }
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
        if matches!(self.state.run_state, RunState::Quitting | RunState::Cleanup) {
            return;
        }
        self.waiting_for_workers = false;
        for worker_id in self.connected_worker_ids() {
            self.send(&worker_id, MessageKind::Quit, &());
        }
        self.state.set_run_state(RunState::Quitting);
    }

    fn reset_stats(&mut self) {
        info!("resetting stats");
        self.state.stats.reset();
    }

    fn snapshot(&self) -> RunnerSnapshot {
        let mut user_counts = BTreeMap::new();
        for worker in self.workers.values().filter(|w| w.connected()) {
            runner::add_user_counts(&mut user_counts, &worker.user_counts);
        }
        RunnerSnapshot {
            mode: RunnerMode::Master,
            state: self.state.run_state,
            target_user_count: self.state.target_user_count,
            current_user_count: self.current_user_count(),
            warning: self.state.warning.clone(),
            workers: self
                .workers
                .iter()
                .map(|(id, worker)| WorkerSummary {
                    id: id.to_string(),
                    status: worker.status,
                    state: worker.state,
                    user_count: worker.user_count,
                })
                .collect(),
            user_counts,
            metrics: self.state.metrics(false),
        }
    }
}
