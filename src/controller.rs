//! Control surface: commands in, snapshots and events out.
//!
//! A running load test is controlled through a [`ControlHandle`], obtained from
//! [`Flock::controller`](../struct.Flock.html#method.controller) before the load test
//! starts. By default Flock also launches a telnet Controller, which translates line
//! commands into the same requests.
//!
//! Commands return immediately; their effects are observed through later snapshots and
//! events.

use regex::{Regex, RegexSet};
use std::collections::BTreeMap;
use std::io;
use std::str::FromStr;
use strum::IntoEnumIterator;
use strum_macros::EnumIter;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use crate::config::FlockConfiguration;
use crate::gaggle::common::WorkerStatus;
use crate::metrics::FlockMetrics;
use crate::runner::{self, RunState, Runner};
use crate::{FlockError, RunnerMode};

/// Constant defining Flock's default telnet Controller host.
pub(crate) const DEFAULT_TELNET_HOST: &str = "0.0.0.0";

/// Constant defining Flock's default telnet Controller port.
pub(crate) const DEFAULT_TELNET_PORT: u16 = 5116;

/// What one Worker is doing, as seen by its Master.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkerSummary {
    pub id: String,
    pub status: WorkerStatus,
    pub state: RunState,
    pub user_count: usize,
}

/// A copy of a runner's state, never a live reference.
#[derive(Clone, Debug)]
pub struct RunnerSnapshot {
    pub mode: RunnerMode,
    pub state: RunState,
    pub target_user_count: usize,
    /// On a Master, the sum of the user counts last reported by connected Workers.
    pub current_user_count: usize,
    /// Set when the runner can't reach its target.
    pub warning: Option<String>,
    /// Only populated on a Master.
    pub workers: Vec<WorkerSummary>,
    /// Running users per UserSpec.
    pub user_counts: BTreeMap<String, usize>,
    pub metrics: FlockMetrics,
}

/// Events published to subscribers.
#[derive(Clone, Debug)]
pub enum RunnerEvent {
    StateChanged { from: RunState, to: RunState },
    /// Published every second while anybody is subscribed.
    Snapshot(Box<RunnerSnapshot>),
    Warning(String),
}

/// Requests passed from controllers to the runner.
#[derive(Debug)]
pub(crate) enum ControllerRequestMessage {
    Start { users: usize, rate: f32 },
    Stop,
    ResetStats,
    Quit,
    Snapshot,
    Subscribe(flume::Sender<RunnerEvent>),
}

/// The request that's passed from the controller to the runner.
#[derive(Debug)]
pub(crate) struct ControllerRequest {
    /// Optional one-shot channel if a reply is required.
    pub response_channel: Option<tokio::sync::oneshot::Sender<Box<RunnerSnapshot>>>,
    /// An integer identifying which controller client is making the request.
    pub client_id: u32,
    /// The actual request message.
    pub request: ControllerRequestMessage,
}

/// Issues commands to a load test and queries its state.
///
/// # Example
/// ```rust,no_run
/// use flock::prelude::*;
///
/// async fn noop(_user: &mut FlockUser) -> TaskResult {
///     Ok(())
/// }
///
/// #[tokio::main(flavor = "current_thread")]
/// async fn main() -> Result<(), FlockError> {
///     let flock = Flock::initialize()?
///         .register_user(user!("Idle").register_task(task!(noop)))
///         .set_default(FlockDefault::NoAutoStart, true)?;
///     let controller = flock.controller();
///     let load_test = tokio::spawn(flock.run());
///
///     controller.start(10, 2.0)?;
///     let snapshot = controller.snapshot().await?;
///     println!("{:?}: {} users", snapshot.state, snapshot.current_user_count);
///     controller.quit()?;
///
///     let _metrics = load_test.await??;
///     Ok(())
/// }
/// ```
#[derive(Clone, Debug)]
pub struct ControlHandle {
    channel_tx: flume::Sender<ControllerRequest>,
    client_id: u32,
}
impl ControlHandle {
    pub(crate) fn new(channel_tx: flume::Sender<ControllerRequest>) -> Self {
        ControlHandle {
            channel_tx,
            client_id: 0,
        }
    }

    fn with_client_id(mut self, client_id: u32) -> Self {
        self.client_id = client_id;
        self
    }

    fn send(
        &self,
        request: ControllerRequestMessage,
        response_channel: Option<tokio::sync::oneshot::Sender<Box<RunnerSnapshot>>>,
    ) -> Result<(), FlockError> {
        self.channel_tx
            .send(ControllerRequest {
                response_channel,
                client_id: self.client_id,
                request,
            })
            .map_err(|_| FlockError::ControllerGone {
                detail: "the load test is no longer running".to_string(),
            })
    }

    /// Converge toward `users` users, launching `rate` users per second.
    pub fn start(&self, users: usize, rate: f32) -> Result<(), FlockError> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(FlockError::InvalidOption {
                option: "rate".to_string(),
                value: rate.to_string(),
                detail: "rate must be a number greater than 0".to_string(),
            });
        }
        self.send(ControllerRequestMessage::Start { users, rate }, None)
    }

    /// Gracefully stop all users.
    pub fn stop(&self) -> Result<(), FlockError> {
        self.send(ControllerRequestMessage::Stop, None)
    }

    pub fn reset_stats(&self) -> Result<(), FlockError> {
        self.send(ControllerRequestMessage::ResetStats, None)
    }

    /// Cancel all users and end the load test.
    pub fn quit(&self) -> Result<(), FlockError> {
        self.send(ControllerRequestMessage::Quit, None)
    }

    /// The runner's current state.
    pub async fn snapshot(&self) -> Result<RunnerSnapshot, FlockError> {
        let (response_tx, response_rx) = tokio::sync::oneshot::channel();
        self.send(ControllerRequestMessage::Snapshot, Some(response_tx))?;
        match response_rx.await {
            Ok(snapshot) => Ok(*snapshot),
            Err(_) => Err(FlockError::ControllerGone {
                detail: "the load test exited before replying".to_string(),
            }),
        }
    }

    /// A stream of state changes, periodic snapshots and warnings.
    pub fn subscribe(&self) -> Result<flume::Receiver<RunnerEvent>, FlockError> {
        let (events_tx, events_rx) = flume::unbounded();
        self.send(ControllerRequestMessage::Subscribe(events_tx), None)?;
        Ok(events_rx)
    }
}

/// Process every pending controller request.
pub(crate) async fn handle_controller_requests<R: Runner>(runner: &mut R) {
    loop {
        let message = match runner.runner_state().controller_rx.try_recv() {
            Ok(message) => message,
            Err(_) => break,
        };
        debug!(
            "request from controller client {}: {:?}",
            message.client_id, message.request
        );
        match message.request {
            ControllerRequestMessage::Start { users, rate } => {
                if runner.runner_state().shape.is_some() {
                    info!(
                        "a load shape decides the user count, ignoring {} users at {} per second",
                        users, rate
                    );
                    runner::start_shape(runner).await;
                } else {
                    runner.start(users, rate).await;
                }
            }
            ControllerRequestMessage::Stop => runner.stop().await,
            ControllerRequestMessage::ResetStats => runner.reset_stats(),
            ControllerRequestMessage::Quit => runner.quit().await,
            ControllerRequestMessage::Snapshot => {
                if let Some(oneshot_tx) = message.response_channel {
                    if oneshot_tx.send(Box::new(runner.snapshot())).is_err() {
                        warn!("failed to send response to controller via one-shot channel")
                    }
                }
            }
            ControllerRequestMessage::Subscribe(events_tx) => {
                runner.runner_state_mut().subscribers.push(events_tx)
            }
        }
    }
}

/// All commands recognized by the telnet Controller.
///
/// Commands are not case sensitive, and are shown by `help` in the order defined here.
#[derive(Clone, Debug, EnumIter, PartialEq, Eq)]
pub enum ControllerCommand {
    /// Displays a list of all commands supported by the Controller.
    Help,
    /// Disconnect from the Controller.
    Exit,
    /// Start or re-target the load test: `start USERS RATE`.
    Start,
    /// Gracefully stop all users.
    Stop,
    /// Clear all stats.
    Reset,
    /// Display the current stats.
    Stats,
    /// Display the runner state and user counts.
    State,
    /// Shut the load test down, which also disconnects the Controller.
    Quit,
}

/// How a command is shown in the help text and recognized.
struct ControllerCommandDetails {
    name: &'static str,
    description: &'static str,
    regex: &'static str,
}

impl ControllerCommand {
    fn details(&self) -> ControllerCommandDetails {
        match self {
            ControllerCommand::Exit => ControllerCommandDetails {
                name: "exit",
                description: "exit controller\n\n",
                regex: r"(?i)^(exit|bye|q)$",
            },
            ControllerCommand::Help => ControllerCommandDetails {
                name: "help",
                description: "this help\n",
                regex: r"(?i)^(help|\?)$",
            },
            ControllerCommand::Quit => ControllerCommandDetails {
                name: "quit",
                description: "stop users and exit the load test\n",
                regex: r"(?i)^(quit|shutdown)$",
            },
            ControllerCommand::Reset => ControllerCommandDetails {
                name: "reset",
                description: "reset stats\n",
                regex: r"(?i)^(reset|reset-stats)$",
            },
            ControllerCommand::Start => ControllerCommandDetails {
                name: "start USERS RATE",
                description: "run USERS users, launching RATE per second\n",
                regex: r"(?i)^start\s+(\d+)\s+(\d+(\.\d+)?)$",
            },
            ControllerCommand::State => ControllerCommandDetails {
                name: "state",
                description: "display runner state\n",
                regex: r"(?i)^(state|status)$",
            },
            ControllerCommand::Stats => ControllerCommandDetails {
                name: "stats",
                description: "display current stats\n",
                regex: r"(?i)^(stats|metrics)$",
            },
            ControllerCommand::Stop => ControllerCommandDetails {
                name: "stop",
                description: "stop all users\n",
                regex: r"(?i)^stop$",
            },
        }
    }

    // Extract `USERS RATE` from a start command.
    fn start_values(command_string: &str) -> Option<(usize, f32)> {
        let regex = Regex::new(ControllerCommand::Start.details().regex).ok()?;
        let caps = regex.captures(command_string)?;
        let users = caps.get(1)?.as_str().parse().ok()?;
        let rate = caps.get(2)?.as_str().parse().ok()?;
        Some((users, rate))
    }

    // Builds a help screen displayed when a controller receives the `help` command.
    fn display_help() -> String {
        let mut help_text = format!(
            "{} {} controller commands:\n",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        );
        for command in ControllerCommand::iter() {
            let details = command.details();
            help_text.push_str(&format!("{:<18} {}", details.name, details.description));
        }
        help_text
    }
}

/// Use regular expressions to convert controller input to ControllerCommands.
impl FromStr for ControllerCommand {
    type Err = FlockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let keys: Vec<ControllerCommand> = ControllerCommand::iter().collect();
        let commands = RegexSet::new(keys.iter().map(|k| k.details().regex)).map_err(|e| {
            FlockError::InvalidOption {
                option: "controller command".to_string(),
                value: s.to_string(),
                detail: e.to_string(),
            }
        })?;
        let matches: Vec<usize> = commands.matches(s.trim()).into_iter().collect();
        match matches.as_slice() {
            [index] => Ok(keys[*index].clone()),
            [] => Err(FlockError::InvalidOption {
                option: "controller command".to_string(),
                value: s.to_string(),
                detail: format!("unrecognized controller command: '{}'.", s),
            }),
            _ => Err(FlockError::InvalidOption {
                option: "controller command".to_string(),
                value: s.to_string(),
                detail: format!("matched multiple controller commands: '{}'.", s),
            }),
        }
    }
}

/// The telnet Controller listens on the configured host and port. Each connection is
/// handled by its own task so several clients can connect.
pub(crate) async fn controller_main(
    configuration: FlockConfiguration,
    channel_tx: flume::Sender<ControllerRequest>,
) {
    let address = format!(
        "{}:{}",
        configuration.telnet_host, configuration.telnet_port
    );
    let listener = match TcpListener::bind(&address).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind telnet controller to {}: {}", address, e);
            return;
        }
    };
    info!("telnet controller listening on: {}", address);

    // Counter increments each time a controller client connects.
    let mut client_id: u32 = 0;
    while let Ok((stream, peer)) = listener.accept().await {
        client_id += 1;
        let handle = ControlHandle::new(channel_tx.clone()).with_client_id(client_id);
        tokio::spawn(async move {
            info!("telnet client [{}] connected from {}", client_id, peer);
            if let Err(e) = telnet_client(stream, handle).await {
                debug!("telnet client [{}] error: {}", client_id, e);
            }
            info!("telnet client [{}] disconnected from {}", client_id, peer);
        });
    }
}

const PROMPT: &str = "flock> ";

async fn telnet_client(stream: tokio::net::TcpStream, handle: ControlHandle) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    writer.write_all(PROMPT.as_bytes()).await?;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            writer.write_all(PROMPT.as_bytes()).await?;
            continue;
        }
        let (reply, disconnect) = execute_command(&handle, line).await;
        writer.write_all(reply.as_bytes()).await?;
        if disconnect {
            break;
        }
        writer.write_all(PROMPT.as_bytes()).await?;
    }
    Ok(())
}

// Returns the reply, and whether the client should be disconnected.
async fn execute_command(handle: &ControlHandle, line: &str) -> (String, bool) {
    let command = match ControllerCommand::from_str(line) {
        Ok(command) => command,
        Err(_) => return ("unrecognized command, try `help`\n".to_string(), false),
    };
    let result = match command {
        ControllerCommand::Help => Ok(ControllerCommand::display_help()),
        ControllerCommand::Exit => return ("goodbye!\n".to_string(), true),
        ControllerCommand::Start => match ControllerCommand::start_values(line) {
            Some((users, rate)) => handle
                .start(users, rate)
                .map(|_| format!("starting {} users at {} per second\n", users, rate)),
            None => Ok("usage: start USERS RATE\n".to_string()),
        },
        ControllerCommand::Stop => handle.stop().map(|_| "stopping load test\n".to_string()),
        ControllerCommand::Reset => handle.reset_stats().map(|_| "stats reset\n".to_string()),
        ControllerCommand::Stats => handle
            .snapshot()
            .await
            .map(|snapshot| format!("{}\n", snapshot.metrics)),
        ControllerCommand::State => handle.snapshot().await.map(|snapshot| {
            let mut state = format!(
                "state: {:?}, users: {}/{}\n",
                snapshot.state, snapshot.current_user_count, snapshot.target_user_count
            );
            for worker in &snapshot.workers {
                state.push_str(&format!(
                    "  worker {}: {:?} ({:?}), {} users\n",
                    worker.id, worker.status, worker.state, worker.user_count
                ));
            }
            if let Some(warning) = snapshot.warning {
                state.push_str(&format!("warning: {}\n", warning));
            }
            state
        }),
        ControllerCommand::Quit => {
            return match handle.quit() {
                Ok(_) => ("quitting load test\n".to_string(), true),
                Err(e) => (format!("{}\n", e), true),
            }
        }
    };
    match result {
        Ok(reply) => (reply, false),
        Err(e) => (format!("{}\n", e), false),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_commands() {
        assert_eq!(
            ControllerCommand::from_str("help").unwrap(),
            ControllerCommand::Help
        );
        assert_eq!(
            ControllerCommand::from_str("STOP").unwrap(),
            ControllerCommand::Stop
        );
        assert_eq!(
            ControllerCommand::from_str("start 10 2.5").unwrap(),
            ControllerCommand::Start
        );
        assert_eq!(
            ControllerCommand::start_values("start 10 2.5"),
            Some((10, 2.5))
        );
        assert_eq!(
            ControllerCommand::from_str(" quit ").unwrap(),
            ControllerCommand::Quit
        );
        // A start without a rate isn't a start.
        assert!(ControllerCommand::from_str("start 10").is_err());
        assert!(ControllerCommand::from_str("fly").is_err());
    }

    #[test]
    fn help_lists_every_command() {
        let help = ControllerCommand::display_help();
        for command in ControllerCommand::iter() {
            assert!(help.contains(command.details().name));
        }
    }

    #[tokio::test]
    async fn handle_requests() {
        let (channel_tx, channel_rx) = flume::unbounded();
        let handle = ControlHandle::new(channel_tx);

        // Invalid rates are refused without reaching the runner.
        assert!(handle.start(10, 0.0).is_err());
        assert!(handle.start(10, f32::NAN).is_err());
        assert!(channel_rx.is_empty());

        handle.start(10, 2.0).unwrap();
        handle.stop().unwrap();
        let requests: Vec<ControllerRequest> = channel_rx.drain().collect();
        assert!(matches!(
            requests[0].request,
            ControllerRequestMessage::Start { users: 10, .. }
        ));
        assert!(matches!(requests[1].request, ControllerRequestMessage::Stop));

        // Once the runner is gone, commands fail.
        drop(channel_rx);
        match handle.quit() {
            Err(FlockError::ControllerGone { .. }) => (),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(handle.snapshot().await.is_err());
    }

    #[tokio::test]
    async fn telnet_replies() {
        let (channel_tx, _channel_rx) = flume::unbounded();
        let handle = ControlHandle::new(channel_tx);
        let (reply, disconnect) = execute_command(&handle, "start 5 1").await;
        assert_eq!(reply, "starting 5 users at 1 per second\n");
        assert!(!disconnect);
        let (reply, _) = execute_command(&handle, "dance").await;
        assert!(reply.starts_with("unrecognized command"));
        let (_, disconnect) = execute_command(&handle, "exit").await;
        assert!(disconnect);
        let (_, disconnect) = execute_command(&handle, "quit").await;
        assert!(disconnect);
    }
}
