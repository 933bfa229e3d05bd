//! The Worker runner: runs users on behalf of a Master.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use url::Url;

use crate::config::{FlockConfiguration, FlockConfigure, FlockDefaults, FlockValue};
use crate::controller::{self, RunnerSnapshot};
use crate::engine::{EngineSettings, UserEngine};
use crate::gaggle::common::{
    Envelope, ExceptionPayload, HeartbeatPayload, MessageKind, ProcessHealth, SequenceTracker,
    Sequencer, SpawnPayload, StatsPayload, DEFAULT_GAGGLE_HOST, DEFAULT_GAGGLE_PORT,
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_REPORT_INTERVAL,
};
use crate::gaggle::transport::{TransportEvent, WorkerTransport};
use crate::gaggle::websocket::WebSocketWorkerTransport;
use crate::metrics::{FlockMetric, FlockMetrics, StatsAggregator};
use crate::runner::{self, RunState, Runner, RunnerState, CONTROL_LOOP_INTERVAL};
use crate::{util, Flock, FlockError, RunnerMode};

impl FlockConfiguration {
    pub(crate) fn configure_worker(&mut self, defaults: &FlockDefaults) {
        // Set `master_host` on Worker.
        self.master_host = self
            .get_value(vec![
                // Use --master-host if configured.
                FlockValue {
                    value: Some(self.master_host.to_string()),
                    filter: self.master_host.is_empty(),
                    message: "master_host",
                },
                // Otherwise use default if set and on Worker.
                FlockValue {
                    value: defaults.master_host.clone(),
                    filter: defaults.master_host.is_none() || !self.worker,
                    message: "master_host",
                },
                // Otherwise default to 127.0.0.1 if on Worker.
                FlockValue {
                    value: Some(DEFAULT_GAGGLE_HOST.to_string()),
                    filter: !self.worker,
                    message: "",
                },
            ])
            .unwrap_or_default();

        // Set `master_port` on Worker.
        self.master_port = self
            .get_value(vec![
                FlockValue {
                    value: Some(self.master_port),
                    filter: self.master_port == 0,
                    message: "master_port",
                },
                FlockValue {
                    value: defaults.master_port,
                    filter: defaults.master_port.is_none() || !self.worker,
                    message: "master_port",
                },
                FlockValue {
                    value: Some(DEFAULT_GAGGLE_PORT),
                    filter: !self.worker,
                    message: "",
                },
            ])
            .unwrap_or(0);
    }

    /// Where a Worker finds its Master.
    pub(crate) fn master_url(&self) -> Result<Url, FlockError> {
        let url = format!("ws://{}:{}", self.master_host, self.master_port);
        Url::parse(&url).map_err(|e| FlockError::InvalidOption {
            option: "`configuration.master_host`".to_string(),
            value: self.master_host.to_string(),
            detail: format!("`{}` is not a valid Master address: {}", url, e),
        })
    }

    /// Validate configured [`FlockConfiguration`] values on a Worker.
    pub(crate) fn validate_worker(&self) -> Result<(), FlockError> {
        if !self.worker {
            if !self.master_host.is_empty() {
                return Err(FlockError::InvalidOption {
                    option: "`configuration.master_host`".to_string(),
                    value: self.master_host.to_string(),
                    detail: "`configuration.master_host` can only be set on a Worker.".to_string(),
                });
            }
            if self.master_port > 0 {
                return Err(FlockError::InvalidOption {
                    option: "`configuration.master_port`".to_string(),
                    value: self.master_port.to_string(),
                    detail: "`configuration.master_port` can only be set on a Worker.".to_string(),
                });
            }
            return Ok(());
        }

        // Workers receive these from their Master.
        let received = [
            ("users", self.users.map(|u| u.to_string())),
            ("hatch_rate", self.hatch_rate.clone()),
            (
                "run_time",
                Some(self.run_time.to_string()).filter(|r| !r.is_empty() && r != "0"),
            ),
            ("expect_workers", self.expect_workers.map(|e| e.to_string())),
            ("autoquit", self.autoquit.map(|a| a.to_string())),
            ("reset_stats", Some(true.to_string()).filter(|_| self.reset_stats)),
            (
                "master_bind_host",
                Some(self.master_bind_host.to_string()).filter(|h| !h.is_empty()),
            ),
            (
                "master_bind_port",
                Some(self.master_bind_port.to_string()).filter(|_| self.master_bind_port > 0),
            ),
        ];
        for (option, value) in received.iter() {
            if let Some(value) = value {
                return Err(FlockError::InvalidOption {
                    option: format!("`configuration.{}`", option),
                    value: value.to_string(),
                    detail: format!(
                        "`configuration.{}` can not be set in Worker mode, it comes from the Master.",
                        option
                    ),
                });
            }
        }

        if self.master_host.is_empty() || self.master_port == 0 {
            return Err(FlockError::InvalidOption {
                option: "`configuration.master_host`".to_string(),
                value: format!("{}:{}", self.master_host, self.master_port),
                detail: "`configuration.master_host` and `configuration.master_port` must be set in Worker mode."
                    .to_string(),
            });
        }
        self.master_url()?;

        Ok(())
    }
}

pub(crate) struct WorkerRunner {
    state: RunnerState,
    engine: UserEngine,
    metrics_rx: flume::Receiver<FlockMetric>,
    transport: Box<dyn WorkerTransport>,
    sequencer: Sequencer,
    tracker: SequenceTracker,
    connected: bool,
    /// Everything reported to the Master so far.
    totals: StatsAggregator,
    heartbeat_interval: usize,
    report_interval: usize,
    heartbeat_timer: Instant,
    report_timer: Instant,
    launched: Instant,
}
impl WorkerRunner {
    pub(crate) fn new(flock: Flock) -> Result<Self, FlockError> {
        let node_id = util::node_id("worker");
        let log_prefix = format!("[{}] ", node_id);
        let configuration = flock.configuration;
        let transport: Box<dyn WorkerTransport> = match flock.worker_transport {
            Some(transport) => transport,
            None => Box::new(WebSocketWorkerTransport::connect(
                configuration.master_url()?,
            )),
        };
        let (metrics_tx, metrics_rx) = flume::unbounded();
        let settings = EngineSettings {
            scheduler: flock.scheduler,
            max_users: configuration.max_users,
            stop_timeout: configuration.stop_timeout(),
            equal_weights: configuration.equal_weights,
        };
        let engine = UserEngine::new(
            flock.user_specs,
            Arc::clone(&flock.executor),
            metrics_tx,
            settings,
            &log_prefix,
        );
        let heartbeat_interval = configuration
            .heartbeat_interval
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
        let report_interval = configuration
            .report_interval
            .unwrap_or(DEFAULT_REPORT_INTERVAL);
        let now = Instant::now();
        Ok(WorkerRunner {
            state: RunnerState::new(
                RunnerMode::Worker,
                configuration,
                flock.controller_rx,
                &log_prefix,
            ),
            engine,
            metrics_rx,
            transport,
            sequencer: Sequencer::new(&node_id),
            tracker: SequenceTracker::default(),
            connected: false,
            totals: StatsAggregator::new(),
            heartbeat_interval,
            report_interval,
            heartbeat_timer: now,
            report_timer: now,
            launched: now,
        })
    }

    fn log_prefix(&self) -> &str {
        &self.state.log_prefix
    }

    /// The control loop. Returns everything this Worker reported once it quits.
    pub(crate) async fn run(mut self) -> Result<FlockMetrics, FlockError> {
        info!("{}connecting to master...", self.log_prefix());

        loop {
            self.receive_events();

            match self.state.run_state {
                RunState::Idle | RunState::Stopped => self.engine.reap(),
                RunState::Spawning => {
                    if self.state.ramp_due() {
                        self.engine.tick();
                    }
                    if self.engine.converged() {
                        self.transition(RunState::Running);
                    }
                }
                RunState::Running => {
                    self.engine.reap();
                    if !self.engine.converged() {
                        self.transition(RunState::Spawning);
                    }
                }
                RunState::Stopping => {
                    self.engine.reap();
                    if self.engine.user_count() == 0 && self.engine.stopping_count() == 0 {
                        self.transition(RunState::Stopped);
                    }
                }
                RunState::Quitting => self.quit_now(),
                RunState::Cleanup => break,
            }

            self.drain_metrics();
            let user_count = self.engine.user_count();
            self.state.update_max_users(user_count);
            if self.state.window_expired() {
                self.state.stats.reset_window();
            }
            if util::ms_timer_expired(self.heartbeat_timer, self.heartbeat_interval) {
                self.send_heartbeat();
            }
            if util::ms_timer_expired(self.report_timer, self.report_interval) {
                self.send_stats();
            }
            runner::publish_snapshot(&mut self);

            if self.state.newly_canceled() {
                self.quit_now();
            }

            controller::handle_controller_requests(&mut self).await;

            self.state.drift_timer =
                util::sleep_minus_drift(CONTROL_LOOP_INTERVAL, self.state.drift_timer).await;
        }

        let mut metrics = self.state.metrics(true);
        metrics.stats = self.totals.clone();
        metrics.display_metrics = false;
        Ok(metrics)
    }

    fn receive_events(&mut self) {
        while let Some(event) = self.transport.try_recv() {
            match event {
                TransportEvent::Connected => {
                    info!("{}connected to master", self.log_prefix());
                    self.connected = true;
                    // A new connection may lead to a restarted Master.
                    self.tracker = SequenceTracker::default();
                    self.register();
                }
                TransportEvent::Disconnected => {
                    warn!(
                        "{}lost connection to master, stopping users",
                        self.log_prefix()
                    );
                    self.connected = false;
                    self.stop_users();
                }
                TransportEvent::Message(envelope) => {
                    if !self.tracker.accept(&envelope) {
                        warn!(
                            "{}dropping out of sequence message {} from {}",
                            self.log_prefix(),
                            envelope.sequence_number,
                            envelope.sender_id
                        );
                        continue;
                    }
                    self.handle_message(envelope);
                }
            }
            if matches!(self.state.run_state, RunState::Cleanup) {
                return;
            }
        }
    }

    fn handle_message(&mut self, envelope: Envelope) {
        match envelope.kind {
            MessageKind::Spawn => match envelope.payload::<SpawnPayload>() {
                Ok(spawn) => self.spawn(spawn),
                Err(e) => warn!("{}dropping malformed spawn: {}", self.log_prefix(), e),
            },
            MessageKind::Stop => self.stop_users(),
            MessageKind::Quit => {
                info!("{}master asked us to quit", self.log_prefix());
                self.quit_now();
            }
            MessageKind::Reconnect => {
                info!("{}master asked us to register again", self.log_prefix());
                self.register();
            }
            kind => warn!(
                "{}unexpected {:?} message from {}",
                self.log_prefix(),
                kind,
                envelope.sender_id
            ),
        }
    }

    // Whatever ran before doesn't survive registering.
    fn register(&mut self) {
        if matches!(self.state.run_state, RunState::Quitting | RunState::Cleanup) {
            return;
        }
        self.engine.stop_all();
        self.state.target_user_count = 0;
        self.state.set_warning(None);
        self.state.set_run_state(RunState::Idle);
        self.send(MessageKind::ClientReady, &());
        self.send_heartbeat();
    }

    fn spawn(&mut self, spawn: SpawnPayload) {
        if matches!(self.state.run_state, RunState::Quitting | RunState::Cleanup) {
            return;
        }
        if matches!(self.state.run_state, RunState::Idle | RunState::Stopped) {
            // Report what's left of the last run before starting over.
            self.send_stats();
            self.state.begin_run();
        }
        info!(
            "{}running {} users at {} per second",
            self.log_prefix(),
            spawn.target_count,
            spawn.ramp_rate
        );
        self.engine.apply_run_spec(&spawn.run_spec);
        self.engine.set_target(spawn.target_count, spawn.ramp_rate);
        self.state.target_user_count = spawn.target_count;
        self.state.ramp_rate = spawn.ramp_rate;
        let warning = self.engine.warning.clone();
        self.state.set_warning(warning);
        self.state.next_ramp = Instant::now();
        self.transition(RunState::Spawning);
    }

    fn stop_users(&mut self) {
        match self.state.run_state {
            RunState::Spawning | RunState::Running => {
                info!(
                    "{}stopping {} users",
                    self.log_prefix(),
                    self.engine.user_count()
                );
                self.engine.stop_all();
                self.state.target_user_count = 0;
                self.state.set_warning(None);
                self.transition(RunState::Stopping);
            }
            // Let the Master know there's nothing to stop.
            _ => self.send_stats(),
        }
    }

    // Cancel every user, send what's left, and tell the Master we're gone.
    fn quit_now(&mut self) {
        if matches!(self.state.run_state, RunState::Cleanup) {
            return;
        }
        self.state.set_run_state(RunState::Quitting);
        self.engine.abort_all();
        self.state.target_user_count = 0;
        self.send_stats();
        self.send(MessageKind::Quit, &());
        self.state.set_run_state(RunState::Cleanup);
    }

    /// Change state and tell the Master right away.
    fn transition(&mut self, run_state: RunState) {
        self.state.set_run_state(run_state);
        self.send_stats();
    }

    fn send<P: Serialize>(&mut self, kind: MessageKind, payload: &P) -> bool {
        if !self.connected {
            return false;
        }
        let result = self
            .sequencer
            .envelope(kind, payload)
            .and_then(|envelope| self.transport.send(&envelope));
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("{}failed to send {:?}: {}", self.log_prefix(), kind, e);
                false
            }
        }
    }

    fn send_heartbeat(&mut self) {
        self.heartbeat_timer = Instant::now();
        let heartbeat = HeartbeatPayload {
            state: self.state.run_state,
            target_count: self.engine.target_user_count(),
            user_count: self.engine.user_count(),
            health: ProcessHealth {
                uptime: self.launched.elapsed().as_secs(),
                stopping_users: self.engine.stopping_count(),
                warning: self.engine.warning.clone(),
            },
        };
        self.send(MessageKind::Heartbeat, &heartbeat);
    }

    /// Send everything recorded since the last report. Nothing is lost while
    /// disconnected, it goes out with the first report after reconnecting.
    fn send_stats(&mut self) {
        self.report_timer = Instant::now();
        if !self.connected {
            return;
        }
        self.drain_metrics();
        let delta = self.state.stats.take_delta();
        let report = StatsPayload {
            stats: delta,
            user_count: self.engine.user_count(),
            user_counts: self.engine.user_counts(),
            state: self.state.run_state,
            target_count: self.engine.target_user_count(),
        };
        if self.send(MessageKind::Stats, &report) {
            self.totals.merge(&report.stats.without_windows());
        } else {
            // Try again with the next report.
            self.state.stats.merge(&report.stats.without_windows());
        }
    }

    // Requests are aggregated locally, exceptions are forwarded as they happen.
    fn drain_metrics(&mut self) {
        for metric in self.metrics_rx.drain().collect::<Vec<_>>() {
            match metric {
                FlockMetric::Request(request) => {
                    if let Err(e) = self.state.stats.record(
                        &request.method,
                        &request.name,
                        request.response_time,
                        request.response_length,
                        request.error.as_deref(),
                    ) {
                        warn!("{}{}", self.log_prefix(), e);
                    }
                }
                FlockMetric::Exception(exception) => {
                    let payload = ExceptionPayload {
                        user_spec: exception.user_spec.clone(),
                        task: exception.task.clone(),
                        error: exception.error.clone(),
                    };
                    let node_id = self.sequencer.sender_id().to_string();
                    if self.send(MessageKind::Exception, &payload) {
                        self.totals
                            .record_exception(&exception.task, &exception.error, &node_id);
                    } else {
                        // Goes out with the next stats report instead.
                        self.state.stats.record_exception(
                            &exception.task,
                            &exception.error,
                            &node_id,
                        );
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Runner for WorkerRunner {
    fn runner_state(&self) -> &RunnerState {
        &self.state
    }

    fn runner_state_mut(&mut self) -> &mut RunnerState {
        &mut self.state
    }

    async fn start(&mut self, _target_user_count: usize, _ramp_rate: f32) {
        warn!("{}workers are started by their master", self.log_prefix());
    }

    async fn stop(&mut self) {
        warn!("{}workers are stopped by their master", self.log_prefix());
    }

    async fn quit(&mut self) {
        self.quit_now();
    }

    fn reset_stats(&mut self) {
        info!("{}resetting stats", self.log_prefix());
        self.state.stats.reset();
    }

    fn snapshot(&self) -> RunnerSnapshot {
        RunnerSnapshot {
            mode: RunnerMode::Worker,
            state: self.state.run_state,
            target_user_count: self.engine.target_user_count(),
            current_user_count: self.engine.user_count(),
            warning: self.state.warning.clone(),
            workers: Vec::new(),
            user_counts: self.engine.user_counts(),
            metrics: self.state.metrics(false),
        }
    }
}
