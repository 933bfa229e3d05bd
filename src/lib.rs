//! # Flock
//!
//! Flock is a distributed load testing engine inspired by [Locust](https://locust.io/).
//! Simulated users are defined with standard Rust code and run as lightweight tasks,
//! thousands to a process. A load test can run in a single process, or be spread over
//! many Worker processes coordinated by one Master.
//!
//! Flock doesn't know how to talk to the system under test. A load test plugs in a
//! [`RequestExecutor`](./executor/trait.RequestExecutor.html) that performs one unit of
//! work, and Flock times it, aggregates the results, and reports them.
//!
//! ## Creating a load test
//!
//! Add Flock as a dependency in `Cargo.toml`, then add the following boilerplate `use`
//! declaration at the top of your `src/main.rs`:
//!
//! ```rust
//! use flock::prelude::*;
//! ```
//!
//! A load test registers one or more user specs, each with one or more tasks:
//!
//! ```rust,no_run
//! use flock::prelude::*;
//! use std::time::Duration;
//!
//! struct Sleeper;
//!
//! #[async_trait]
//! impl RequestExecutor for Sleeper {
//!     async fn execute(&self, _request: &FlockRequest) -> RequestOutcome {
//!         timed(async {
//!             tokio::time::sleep(Duration::from_millis(10)).await;
//!             Ok::<usize, String>(512)
//!         })
//!         .await
//!     }
//! }
//!
//! fn main() -> Result<(), FlockError> {
//!     let metrics = Flock::initialize()?
//!         .register_user(
//!             user!("WebsiteUser")
//!                 .register_task(task!(front_page).set_weight(3))
//!                 .register_task(task!(about_page))
//!                 .set_wait_time(Duration::from_millis(500), Duration::from_secs(2))?,
//!         )
//!         .set_executor(Sleeper)
//!         .execute()?;
//!
//!     std::process::exit(metrics.exit_code());
//! }
//!
//! async fn front_page(user: &mut FlockUser) -> TaskResult {
//!     user.request("GET", "/", None).await;
//!     Ok(())
//! }
//!
//! async fn about_page(user: &mut FlockUser) -> TaskResult {
//!     user.request("GET", "/about/", None).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Running a load test
//!
//! Run options are listed with `--help`. For example, to launch 100 users at 10 users per
//! second and stop after five minutes:
//!
//! ```bash
//! $ cargo run --release -- -u 100 -r 10 -t 5m
//! ```
//!
//! To spread the same load over two Workers, start a Master and then the Workers. The
//! Master waits for the expected number of Workers before starting:
//!
//! ```bash
//! $ cargo run --release -- --master --expect-workers 2 -u 100 -r 10 -t 5m
//! $ cargo run --release -- --worker --master-host 10.0.0.5
//! $ cargo run --release -- --worker --master-host 10.0.0.5
//! ```
//!
//! While running, the load test can be controlled through a telnet controller listening
//! on port 5116, or programmatically through a [`ControlHandle`](./controller/struct.ControlHandle.html).

#[macro_use]
extern crate log;

pub mod config;
pub mod controller;
pub mod engine;
pub mod executor;
pub mod gaggle;
pub mod metrics;
pub mod prelude;
pub mod runner;
pub mod scenario;
pub mod shape;
mod user;
pub mod util;

use gumdrop::Options;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::{fmt, io, time};

use crate::config::{FlockConfiguration, FlockDefaults};
use crate::controller::{ControlHandle, ControllerRequest};
use crate::executor::{NoopExecutor, RequestExecutor};
use crate::gaggle::transport::{ManagerTransport, WorkerTransport};
use crate::metrics::FlockMetrics;
use crate::scenario::{FlockScheduler, Task, UserSpec};
use crate::shape::LoadShape;

lazy_static! {
    /// Set by the ctrl-c handler.
    static ref CANCELED: RwLock<bool> = RwLock::new(false);
}

/// An enumeration of all errors Flock can return.
#[derive(Debug)]
pub enum FlockError {
    /// Wraps a [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    Io(io::Error),
    /// Wraps a ['tokio::task::JoinError'](https://tokio-rs.github.io/tokio/doc/tokio/task/struct.JoinError.html).
    TokioJoin(tokio::task::JoinError),
    /// Wraps a [`tungstenite::Error`](https://docs.rs/tungstenite/*/tungstenite/error/enum.Error.html).
    WebSocket(tungstenite::Error),
    /// Wraps a [`serde_json::Error`](https://docs.rs/serde_json/*/serde_json/struct.Error.html).
    Serialize(serde_json::Error),
    /// Invalid option or value specified, may only be invalid in context.
    InvalidOption {
        /// The invalid option that caused this error, may be only invalid in context.
        option: String,
        /// The invalid value that caused this error, may be only invalid in context.
        value: String,
        /// An optional explanation of the error.
        detail: String,
    },
    /// Invalid wait time specified.
    InvalidWaitTime {
        // The specified minimum wait time.
        min_wait: time::Duration,
        // The specified maximum wait time.
        max_wait: time::Duration,
        /// An optional explanation of the error.
        detail: String,
    },
    /// Invalid weight specified.
    InvalidWeight {
        // The specified weight.
        weight: usize,
        /// An optional explanation of the error.
        detail: String,
    },
    /// A response time that is negative or not a number.
    InvalidResponseTime {
        value: f64,
        /// An optional explanation of the error.
        detail: String,
    },
    /// [`Flock`](./struct.Flock.html) has no [`UserSpec`](./scenario/struct.UserSpec.html)
    /// defined.
    NoUserSpecs {
        /// An optional explanation of the error.
        detail: String,
    },
    /// The coordination transport between Master and Workers failed.
    Transport {
        /// An optional explanation of the error.
        detail: String,
    },
    /// The runner a [`ControlHandle`](./controller/struct.ControlHandle.html) talks to
    /// has exited.
    ControllerGone {
        /// An optional explanation of the error.
        detail: String,
    },
}
/// Implement a helper to provide a text description of all possible types of errors.
impl FlockError {
    pub fn describe(&self) -> &str {
        match *self {
            FlockError::Io(_) => "io::Error",
            FlockError::TokioJoin(_) => "tokio::task::JoinError",
            FlockError::WebSocket(_) => "tungstenite::Error",
            FlockError::Serialize(_) => "serde_json::Error",
            FlockError::InvalidOption { .. } => "invalid option or value specified",
            FlockError::InvalidWaitTime { .. } => "invalid wait_time specified",
            FlockError::InvalidWeight { .. } => "invalid weight specified",
            FlockError::InvalidResponseTime { .. } => "invalid response time recorded",
            FlockError::NoUserSpecs { .. } => "no user specs defined",
            FlockError::Transport { .. } => "coordination transport failed",
            FlockError::ControllerGone { .. } => "runner is no longer accepting commands",
        }
    }
}

/// Implement format trait to allow displaying errors.
impl fmt::Display for FlockError {
    // Implement display of error with `{}` marker.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            FlockError::Io(ref source) => write!(f, "FlockError: {} ({})", self.describe(), source),
            FlockError::TokioJoin(ref source) => {
                write!(f, "FlockError: {} ({})", self.describe(), source)
            }
            FlockError::WebSocket(ref source) => {
                write!(f, "FlockError: {} ({})", self.describe(), source)
            }
            FlockError::Serialize(ref source) => {
                write!(f, "FlockError: {} ({})", self.describe(), source)
            }
            FlockError::InvalidOption { ref detail, .. }
            | FlockError::InvalidWaitTime { ref detail, .. }
            | FlockError::InvalidWeight { ref detail, .. }
            | FlockError::InvalidResponseTime { ref detail, .. }
            | FlockError::NoUserSpecs { ref detail }
            | FlockError::Transport { ref detail }
            | FlockError::ControllerGone { ref detail } => {
                write!(f, "FlockError: {} ({})", self.describe(), detail)
            }
        }
    }
}

// Define the lower level source of this error, if any.
impl std::error::Error for FlockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            FlockError::Io(ref source) => Some(source),
            FlockError::TokioJoin(ref source) => Some(source),
            FlockError::WebSocket(ref source) => Some(source),
            FlockError::Serialize(ref source) => Some(source),
            _ => None,
        }
    }
}

/// Auto-convert IO errors.
impl From<io::Error> for FlockError {
    fn from(err: io::Error) -> FlockError {
        FlockError::Io(err)
    }
}

/// Auto-convert TokioJoin errors.
impl From<tokio::task::JoinError> for FlockError {
    fn from(err: tokio::task::JoinError) -> FlockError {
        FlockError::TokioJoin(err)
    }
}

/// Auto-convert WebSocket errors.
impl From<tungstenite::Error> for FlockError {
    fn from(err: tungstenite::Error) -> FlockError {
        FlockError::WebSocket(err)
    }
}

/// Auto-convert serde_json errors.
impl From<serde_json::Error> for FlockError {
    fn from(err: serde_json::Error) -> FlockError {
        FlockError::Serialize(err)
    }
}

/// A load test runs in only one of the following modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunnerMode {
    /// A single process that runs users itself.
    Local,
    /// Coordinates Workers and merges their stats, runs no users itself.
    Master,
    /// Runs users on behalf of a Master.
    Worker,
}

/// A load test: user specs, the executor they call, and how to run them.
pub struct Flock {
    /// An optional task that is run one time when the load test first starts spawning.
    test_start_task: Option<Task>,
    /// An optional task that is run each time the load test stops.
    test_stop_task: Option<Task>,
    /// One copy of each UserSpec defined by this load test.
    user_specs: Vec<UserSpec>,
    /// Optional default values for Flock run-time options.
    pub(crate) defaults: FlockDefaults,
    /// Configuration object holding options set when launching the load test.
    configuration: FlockConfiguration,
    /// Defines the order tasks are run in.
    scheduler: FlockScheduler,
    executor: Arc<dyn RequestExecutor>,
    /// Decides the user count instead of `--users` and `--hatch-rate`.
    load_shape: Option<Box<dyn LoadShape>>,
    /// Requests from controllers to the runner.
    controller_tx: flume::Sender<ControllerRequest>,
    controller_rx: flume::Receiver<ControllerRequest>,
    /// Replaces the WebSocket transport on a Master.
    master_transport: Option<Box<dyn ManagerTransport>>,
    /// Replaces the WebSocket transport on a Worker.
    worker_transport: Option<Box<dyn WorkerTransport>>,
}
impl Flock {
    /// Load configuration from the command line and initialize a [`Flock`].
    ///
    /// # Example
    /// ```rust
    /// use flock::prelude::*;
    ///
    /// let mut flock = Flock::initialize();
    /// ```
    pub fn initialize() -> Result<Flock, FlockError> {
        Flock::initialize_with_config(FlockConfiguration::parse_args_default_or_exit())
    }

    /// Initialize a [`Flock`] with an already loaded configuration.
    ///
    /// This is generally used by tests and by programs that embed Flock.
    ///
    /// # Example
    /// ```rust
    /// use flock::Flock;
    /// use flock::config::FlockConfiguration;
    /// use gumdrop::Options;
    ///
    /// let configuration = FlockConfiguration::parse_args_default(&["--users", "10"]).unwrap();
    /// let mut flock = Flock::initialize_with_config(configuration);
    /// ```
    pub fn initialize_with_config(
        configuration: FlockConfiguration,
    ) -> Result<Flock, FlockError> {
        let (controller_tx, controller_rx) = flume::unbounded();
        Ok(Flock {
            test_start_task: None,
            test_stop_task: None,
            user_specs: Vec::new(),
            defaults: FlockDefaults::default(),
            configuration,
            scheduler: FlockScheduler::Random,
            executor: Arc::new(NoopExecutor),
            load_shape: None,
            controller_tx,
            controller_rx,
            master_transport: None,
            worker_transport: None,
        })
    }

    /// Define how tasks are picked by each running user.
    ///
    /// By default tasks are picked at random, weighted by their weight. When scheduled
    /// serially each user runs every task in the order they were registered, repeating
    /// each according to its weight. When scheduled round robin each user cycles
    /// through the tasks, interleaving them according to their weights.
    ///
    /// # Example
    /// ```rust
    /// use flock::prelude::*;
    ///
    /// fn main() -> Result<(), FlockError> {
    ///     Flock::initialize()?
    ///         .set_scheduler(FlockScheduler::Serial)
    ///         .register_user(user!("A")
    ///             .register_task(task!(a_task_1).set_weight(2))
    ///             .register_task(task!(a_task_2))
    ///         );
    ///
    ///     Ok(())
    /// }
    ///
    /// async fn a_task_1(user: &mut FlockUser) -> TaskResult {
    ///     user.request("GET", "/foo", None).await;
    ///     Ok(())
    /// }
    ///
    /// async fn a_task_2(user: &mut FlockUser) -> TaskResult {
    ///     user.request("GET", "/bar", None).await;
    ///     Ok(())
    /// }
    /// ```
    pub fn set_scheduler(mut self, scheduler: FlockScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// A load test must contain one or more [`UserSpec`](./scenario/struct.UserSpec.html)s.
    pub fn register_user(mut self, mut user_spec: UserSpec) -> Self {
        user_spec.user_specs_index = self.user_specs.len();
        self.user_specs.push(user_spec);
        self
    }

    /// Set the executor every user sends its requests through. Without one, every
    /// request succeeds immediately.
    pub fn set_executor<E: RequestExecutor + 'static>(mut self, executor: E) -> Self {
        self.executor = Arc::new(executor);
        self
    }

    /// Let a [`LoadShape`](./shape/trait.LoadShape.html) decide how many users run over
    /// time, in place of `--users`, `--hatch-rate` and `--run-time`.
    ///
    /// The shape is followed from the start of the load test, or from each controller
    /// `start` command, which then ignores the requested user count. Only Local and
    /// Master runners follow a shape.
    ///
    /// # Example
    /// ```rust
    /// use flock::prelude::*;
    /// use std::time::Duration;
    ///
    /// fn main() -> Result<(), FlockError> {
    ///     Flock::initialize()?
    ///         .set_load_shape(StagesShape::new(vec![
    ///             LoadStage::new(Duration::from_secs(30), 10, 5.0),
    ///             LoadStage::new(Duration::from_secs(60), 20, 5.0),
    ///         ]));
    ///
    ///     Ok(())
    /// }
    /// ```
    pub fn set_load_shape<S: LoadShape + 'static>(mut self, shape: S) -> Self {
        self.load_shape = Some(Box::new(shape));
        self
    }

    /// Define a task to run one time when the load test first starts spawning users.
    ///
    /// Runs on a Local or Master runner, never on a Worker.
    pub fn test_start(mut self, task: Task) -> Self {
        self.test_start_task = Some(task);
        self
    }

    /// Define a task to run each time the load test reaches the stopped state.
    ///
    /// Runs on a Local or Master runner, never on a Worker.
    pub fn test_stop(mut self, task: Task) -> Self {
        self.test_stop_task = Some(task);
        self
    }

    /// Use the provided transport instead of listening for WebSocket Workers.
    pub fn set_master_transport<T: ManagerTransport + 'static>(mut self, transport: T) -> Self {
        self.master_transport = Some(Box::new(transport));
        self
    }

    /// Use the provided transport instead of connecting to the Master over a WebSocket.
    pub fn set_worker_transport<T: WorkerTransport + 'static>(mut self, transport: T) -> Self {
        self.worker_transport = Some(Box::new(transport));
        self
    }

    /// A handle for controlling the load test once it's running.
    ///
    /// Commands sent before the load test runs are processed as soon as it starts.
    pub fn controller(&self) -> ControlHandle {
        ControlHandle::new(self.controller_tx.clone())
    }

    /// Every UserSpec and task with their weights, as shown by `--list`.
    pub fn list_user_specs(&self) -> String {
        let mut list = "Available user specs:\n".to_string();
        for user_spec in &self.user_specs {
            list.push_str(&format!(
                " - {} (weight: {})\n",
                user_spec.name, user_spec.weight
            ));
            for task in &user_spec.tasks {
                list.push_str(&format!(
                    "    o {} (weight: {})\n",
                    task.display_name(),
                    task.weight
                ));
            }
        }
        list
    }

    /// Execute the load test on a single-threaded runtime, returning the final metrics.
    ///
    /// # Example
    /// ```rust,no_run
    /// use flock::prelude::*;
    ///
    /// fn main() -> Result<(), FlockError> {
    ///     let _flock_metrics = Flock::initialize()?
    ///         .register_user(user!("ExampleUser")
    ///             .register_task(task!(example_task).set_weight(2))
    ///             .register_task(task!(another_example_task).set_weight(3))
    ///         )
    ///         // Exit after one second so the load test doesn't run forever.
    ///         .set_default(FlockDefault::RunTime, 1)?
    ///         .execute()?;
    ///
    ///     Ok(())
    /// }
    ///
    /// async fn example_task(user: &mut FlockUser) -> TaskResult {
    ///     user.request("GET", "/foo", None).await;
    ///     Ok(())
    /// }
    ///
    /// async fn another_example_task(user: &mut FlockUser) -> TaskResult {
    ///     user.request("GET", "/bar", None).await;
    ///     Ok(())
    /// }
    /// ```
    pub fn execute(self) -> Result<FlockMetrics, FlockError> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        rt.block_on(self.run())
    }

    /// Run the load test on the current runtime, returning the final metrics.
    pub async fn run(mut self) -> Result<FlockMetrics, FlockError> {
        // If version flag is set, display package name and version and exit.
        if self.configuration.version {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }

        // At least one user spec is required.
        if self.user_specs.is_empty() {
            return Err(FlockError::NoUserSpecs {
                detail: "No user specs are defined.".to_string(),
            });
        }

        // Display user specs and tasks, then exit.
        if self.configuration.list {
            print!("{}", self.list_user_specs());
            std::process::exit(0);
        }

        // A load shape replaces these options.
        let shaped_options = self.configuration.users.is_some()
            || self.configuration.hatch_rate.is_some()
            || !self.configuration.run_time.is_empty();

        // Configure and validate FlockConfiguration.
        self.configuration.configure(&self.defaults);
        self.configuration.validate()?;
        self.validate_user_specs()?;

        let mode = if self.configuration.master {
            RunnerMode::Master
        } else if self.configuration.worker {
            RunnerMode::Worker
        } else {
            RunnerMode::Local
        };
        info!("running in {:?} mode", mode);
        if self.load_shape.is_some() {
            if mode == RunnerMode::Worker {
                info!("the Master follows the load shape, ignoring it on this Worker");
                self.load_shape = None;
            } else if shaped_options {
                warn!("users, hatch_rate and run_time are ignored while following a load shape");
            }
        }
        let json = self.configuration.json;

        util::setup_ctrlc_handler();

        // Workers are controlled by their Master.
        let telnet = if !self.configuration.no_telnet && mode != RunnerMode::Worker {
            Some(tokio::spawn(controller::controller_main(
                self.configuration.clone(),
                self.controller_tx.clone(),
            )))
        } else {
            None
        };

        let result = match mode {
            RunnerMode::Local => runner::LocalRunner::new(self).run().await,
            RunnerMode::Master => gaggle::manager::MasterRunner::new(self).await?.run().await,
            RunnerMode::Worker => gaggle::worker::WorkerRunner::new(self)?.run().await,
        };

        if let Some(telnet) = telnet {
            telnet.abort();
        }

        let metrics = result?;
        if mode != RunnerMode::Worker {
            metrics.print();
        }
        if json {
            println!("{}", metrics.to_json()?);
        }
        Ok(metrics)
    }

    // Users must be able to run: at least one spec must get users.
    fn validate_user_specs(&self) -> Result<(), FlockError> {
        for user_spec in &self.user_specs {
            if user_spec.tasks.is_empty() {
                warn!("user spec {} has no tasks", user_spec.name);
            }
        }
        if self
            .user_specs
            .iter()
            .all(|u| u.weight == 0 && u.fixed_count.unwrap_or(0) == 0)
        {
            return Err(FlockError::InvalidWeight {
                weight: 0,
                detail: "At least one user spec needs a weight or a fixed count greater than 0."
                    .to_string(),
            });
        }
        Ok(())
    }
}
