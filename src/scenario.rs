//! Helpers and objects for building Flock load tests.
//!
//! A load test is made of one or more [`UserSpec`](./struct.UserSpec.html)s, each
//! describing an archetype of simulated user: a weight controlling how many users of
//! this kind are launched, a list of [`Task`](./struct.Task.html)s, and how long to
//! wait between tasks. Once a load test starts every UserSpec is resolved into a fixed
//! descriptor; the engine only ever asks it which task to run next and how long to wait.
//!
//! ## Creating a UserSpec
//! ```rust
//! use flock::prelude::*;
//!
//! let mut browse = user!("BrowseUser")
//!     .set_weight(3)
//!     .set_wait_time(std::time::Duration::from_secs(1), std::time::Duration::from_secs(3))
//!     .unwrap()
//!     .register_task(task!(log_in).set_on_start())
//!     .register_task(task!(front_page).set_weight(9))
//!     .register_task(task!(about_page));
//!
//! async fn log_in(user: &mut FlockUser) -> TaskResult {
//!     let _outcome = user.request("POST", "/login", None).await;
//!     Ok(())
//! }
//!
//! async fn front_page(user: &mut FlockUser) -> TaskResult {
//!     let _outcome = user.request("GET", "/", None).await;
//!     Ok(())
//! }
//!
//! async fn about_page(user: &mut FlockUser) -> TaskResult {
//!     let _outcome = user.request("GET", "/about/", None).await;
//!     Ok(())
//! }
//! ```

use rand::distr::{weighted::WeightedIndex, Distribution};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::executor::{FlockRequest, RequestExecutor, RequestOutcome};
use crate::metrics::{FlockMetric, RequestMetric};
use crate::util;
use crate::FlockError;

/// task!(foo) expands to Task::new(foo), but also does some boxing to work around a limitation in the compiler.
#[macro_export]
macro_rules! task {
    ($task_func:ident) => {
        $crate::scenario::Task::new(move |s| std::boxed::Box::pin($task_func(s)))
    };
}

/// user!("foo") expands to UserSpec::new("foo").
#[macro_export]
macro_rules! user {
    ($name:expr) => {
        $crate::scenario::UserSpec::new($name)
    };
}

/// The result of running a task function.
pub type TaskResult = Result<(), TaskError>;

/// The signature of every task function.
pub type TaskFunction =
    for<'r> fn(&'r mut FlockUser) -> Pin<Box<dyn Future<Output = TaskResult> + Send + 'r>>;

/// An error raised by scenario logic. Recorded as an exception, never as a request
/// failure; the user moves on to its next task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskError {
    pub message: String,
}
impl TaskError {
    pub fn new(message: &str) -> Self {
        TaskError {
            message: message.to_string(),
        }
    }
}
impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}
impl std::error::Error for TaskError {}
impl From<&str> for TaskError {
    fn from(message: &str) -> TaskError {
        TaskError::new(message)
    }
}
impl From<String> for TaskError {
    fn from(message: String) -> TaskError {
        TaskError { message }
    }
}
impl From<FlockError> for TaskError {
    fn from(err: FlockError) -> TaskError {
        TaskError::new(&err.to_string())
    }
}
impl From<std::io::Error> for TaskError {
    fn from(err: std::io::Error) -> TaskError {
        TaskError::new(&err.to_string())
    }
}
impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> TaskError {
        TaskError::new(&err.to_string())
    }
}

/// How tasks are picked while a user runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlockScheduler {
    /// Weighted random choice among runnable tasks.
    Random,
    /// Each task runs as many times as its weight, in declaration order, then repeat.
    Serial,
    /// One run of each task with remaining weight at a time, then repeat.
    RoundRobin,
}
impl Default for FlockScheduler {
    fn default() -> Self {
        FlockScheduler::Random
    }
}

/// The wait between tasks.
#[derive(Clone)]
pub enum WaitTime {
    Constant(Duration),
    /// Uniformly random between the two, inclusive.
    Between(Duration, Duration),
    /// A custom sampler.
    Custom(Arc<dyn Fn() -> Duration + Send + Sync>),
}
impl WaitTime {
    pub fn sample(&self) -> Duration {
        match self {
            WaitTime::Constant(wait) => *wait,
            WaitTime::Between(min, max) => util::random_duration(*min, *max),
            WaitTime::Custom(sampler) => sampler(),
        }
    }
}
impl Default for WaitTime {
    fn default() -> Self {
        WaitTime::Constant(Duration::from_millis(0))
    }
}
impl fmt::Debug for WaitTime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WaitTime::Constant(wait) => write!(f, "Constant({:?})", wait),
            WaitTime::Between(min, max) => write!(f, "Between({:?}, {:?})", min, max),
            WaitTime::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// What the engine needs from a user archetype.
pub trait UserBehavior: Send + Sync {
    /// Index into the task list of the next task to run, `None` if nothing is runnable.
    /// `cursor` is private per-user state carried between calls.
    fn select_next_task(&self, cursor: &mut usize) -> Option<usize>;

    /// How long to wait after a task.
    fn get_wait_time(&self) -> Duration;
}

/// An individual task within a [`UserSpec`](./struct.UserSpec.html).
#[derive(Clone)]
pub struct Task {
    /// Where this task lives in `UserSpec.tasks`.
    pub tasks_index: usize,
    /// Used when reporting exceptions raised by this task.
    pub name: String,
    /// Relative frequency; a weight of 0 never runs in the main loop.
    pub weight: usize,
    pub on_start: bool,
    pub on_stop: bool,
    pub function: TaskFunction,
}
impl Task {
    pub fn new(function: TaskFunction) -> Self {
        trace!("new task");
        Task {
            tasks_index: usize::MAX,
            name: "".to_string(),
            weight: 1,
            on_start: false,
            on_stop: false,
            function,
        }
    }

    pub fn set_name(mut self, name: &str) -> Self {
        trace!("[{}] set_name: {}", self.tasks_index, name);
        self.name = name.to_string();
        self
    }

    /// Run this task once when a user starts, instead of in the main loop.
    pub fn set_on_start(mut self) -> Self {
        trace!("{} [{}] set_on_start task", self.name, self.tasks_index);
        self.on_start = true;
        self
    }

    /// Run this task once when a user is stopped gracefully.
    pub fn set_on_stop(mut self) -> Self {
        trace!("{} [{}] set_on_stop task", self.name, self.tasks_index);
        self.on_stop = true;
        self
    }

    pub fn set_weight(mut self, weight: usize) -> Self {
        trace!(
            "{} [{}] set_weight: {}",
            self.name,
            self.tasks_index,
            weight
        );
        self.weight = weight;
        self
    }

    /// Name used to locate exceptions.
    pub(crate) fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("task {}", self.tasks_index)
        } else {
            self.name.clone()
        }
    }

    fn runnable(&self) -> bool {
        !self.on_start && !self.on_stop && self.weight > 0
    }
}
impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Task")
            .field("tasks_index", &self.tasks_index)
            .field("name", &self.name)
            .field("weight", &self.weight)
            .field("on_start", &self.on_start)
            .field("on_stop", &self.on_stop)
            .finish()
    }
}

/// A simulated user archetype.
#[derive(Clone, Debug)]
pub struct UserSpec {
    pub name: String,
    /// Where this spec lives in the registered list.
    pub user_specs_index: usize,
    /// Relative share of the users; a weight of 0 is never spawned.
    pub weight: usize,
    /// Exactly this many users are reserved before weights are considered.
    pub fixed_count: Option<usize>,
    pub wait_time: WaitTime,
    pub tasks: Vec<Task>,
    /// Main loop order used by the `Serial` and `RoundRobin` schedulers.
    pub weighted_tasks: Vec<usize>,
    pub weighted_on_start_tasks: Vec<usize>,
    pub weighted_on_stop_tasks: Vec<usize>,
    pub(crate) scheduler: FlockScheduler,
    runnable: Vec<usize>,
    distribution: Option<WeightedIndex<usize>>,
}
impl UserSpec {
    pub fn new(name: &str) -> Self {
        trace!("new user spec: name: {}", name);
        UserSpec {
            name: name.to_string(),
            user_specs_index: usize::MAX,
            weight: 1,
            fixed_count: None,
            wait_time: WaitTime::default(),
            tasks: Vec::new(),
            weighted_tasks: Vec::new(),
            weighted_on_start_tasks: Vec::new(),
            weighted_on_stop_tasks: Vec::new(),
            scheduler: FlockScheduler::default(),
            runnable: Vec::new(),
            distribution: None,
        }
    }

    pub fn register_task(mut self, mut task: Task) -> Self {
        trace!("{} register_task: {}", self.name, task.name);
        task.tasks_index = self.tasks.len();
        self.tasks.push(task);
        self
    }

    pub fn set_weight(mut self, weight: usize) -> Self {
        trace!("{} set_weight: {}", self.name, weight);
        self.weight = weight;
        self
    }

    pub fn set_fixed_count(mut self, fixed_count: usize) -> Self {
        trace!("{} set_fixed_count: {}", self.name, fixed_count);
        self.fixed_count = Some(fixed_count);
        self
    }

    /// Pause between `min_wait` and `max_wait` after each task; constant when equal.
    pub fn set_wait_time(mut self, min_wait: Duration, max_wait: Duration) -> Result<Self, FlockError> {
        trace!(
            "{} set_wait time: min: {:?} max: {:?}",
            self.name,
            min_wait,
            max_wait
        );
        if min_wait > max_wait {
            return Err(FlockError::InvalidWaitTime {
                min_wait,
                max_wait,
                detail:
                    "The min_wait option can not be set to a larger value than the max_wait option."
                        .to_string(),
            });
        }
        self.wait_time = if min_wait == max_wait {
            WaitTime::Constant(min_wait)
        } else {
            WaitTime::Between(min_wait, max_wait)
        };
        Ok(self)
    }

    /// Sample the pause after each task from a custom function.
    pub fn set_wait_function<F>(mut self, sampler: F) -> Self
    where
        F: Fn() -> Duration + Send + Sync + 'static,
    {
        trace!("{} set_wait_function", self.name);
        self.wait_time = WaitTime::Custom(Arc::new(sampler));
        self
    }

    /// Resolve the task order for `scheduler`. Called once before a run starts.
    pub(crate) fn prepare(&mut self, scheduler: FlockScheduler) {
        self.scheduler = scheduler;
        self.weighted_on_start_tasks = self
            .tasks
            .iter()
            .filter(|t| t.on_start)
            .flat_map(|t| std::iter::repeat(t.tasks_index).take(t.weight.max(1)))
            .collect();
        self.weighted_on_stop_tasks = self
            .tasks
            .iter()
            .filter(|t| t.on_stop)
            .flat_map(|t| std::iter::repeat(t.tasks_index).take(t.weight.max(1)))
            .collect();

        self.runnable = self
            .tasks
            .iter()
            .filter(|t| t.runnable())
            .map(|t| t.tasks_index)
            .collect();
        let weights = reduce_weights(
            &self
                .runnable
                .iter()
                .map(|i| self.tasks[*i].weight)
                .collect::<Vec<usize>>(),
        );
        self.weighted_tasks = schedule_tasks(&self.runnable, &weights, scheduler);
        self.distribution = if self.runnable.is_empty() {
            None
        } else {
            WeightedIndex::new(&weights).ok()
        };
        debug!(
            "{} prepared with {:?}: {} runnable tasks, order {:?}",
            self.name,
            scheduler,
            self.runnable.len(),
            self.weighted_tasks
        );
    }
}
impl UserBehavior for UserSpec {
    fn select_next_task(&self, cursor: &mut usize) -> Option<usize> {
        match self.scheduler {
            FlockScheduler::Random => {
                let distribution = self.distribution.as_ref()?;
                let choice = distribution.sample(&mut rand::rng());
                self.runnable.get(choice).copied()
            }
            FlockScheduler::Serial | FlockScheduler::RoundRobin => {
                if self.weighted_tasks.is_empty() {
                    return None;
                }
                let position = *cursor % self.weighted_tasks.len();
                *cursor = (position + 1) % self.weighted_tasks.len();
                Some(self.weighted_tasks[position])
            }
        }
    }

    fn get_wait_time(&self) -> Duration {
        self.wait_time.sample()
    }
}

/// Divide all weights by their greatest common divisor.
pub(crate) fn reduce_weights(weights: &[usize]) -> Vec<usize> {
    let divisor = weights.iter().fold(0, |acc, w| util::gcd(acc, *w));
    if divisor <= 1 {
        return weights.to_vec();
    }
    weights.iter().map(|w| w / divisor).collect()
}

// Build the main loop order for the sequential schedulers.
fn schedule_tasks(tasks: &[usize], weights: &[usize], scheduler: FlockScheduler) -> Vec<usize> {
    match scheduler {
        FlockScheduler::Random => Vec::new(),
        FlockScheduler::Serial => tasks
            .iter()
            .zip(weights)
            .flat_map(|(task, weight)| std::iter::repeat(*task).take(*weight))
            .collect(),
        FlockScheduler::RoundRobin => {
            let mut remaining = weights.to_vec();
            let mut order = Vec::with_capacity(remaining.iter().sum());
            while remaining.iter().any(|w| *w > 0) {
                for (task, weight) in tasks.iter().zip(remaining.iter_mut()) {
                    if *weight > 0 {
                        order.push(*task);
                        *weight -= 1;
                    }
                }
            }
            order
        }
    }
}

/// The context handed to every task function: one per running user.
pub struct FlockUser {
    /// Unique within the process.
    pub user_id: usize,
    /// Name of the UserSpec this user runs.
    pub user_spec_name: String,
    pub started: Instant,
    executor: Arc<dyn RequestExecutor>,
    metrics_tx: flume::Sender<FlockMetric>,
}
impl FlockUser {
    pub(crate) fn new(
        user_id: usize,
        user_spec_name: &str,
        executor: Arc<dyn RequestExecutor>,
        metrics_tx: flume::Sender<FlockMetric>,
    ) -> Self {
        FlockUser {
            user_id,
            user_spec_name: user_spec_name.to_string(),
            started: Instant::now(),
            executor,
            metrics_tx,
        }
    }

    /// Perform a request through the configured executor and record how it went.
    pub async fn request(
        &mut self,
        method: &str,
        name: &str,
        payload: Option<serde_json::Value>,
    ) -> RequestOutcome {
        let request = FlockRequest {
            method: method.to_string(),
            name: name.to_string(),
            payload,
        };
        self.send_request(request).await
    }

    /// Like [`request`](#method.request), for a prepared [`FlockRequest`].
    pub async fn send_request(&mut self, request: FlockRequest) -> RequestOutcome {
        let started = Instant::now();
        let outcome = self.executor.execute(&request).await;
        let elapsed = outcome.elapsed.unwrap_or_else(|| started.elapsed());
        let error = if outcome.success {
            None
        } else {
            Some(
                outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| "request failed".to_string()),
            )
        };
        let metric = RequestMetric {
            method: request.method,
            name: request.name,
            response_time: elapsed.as_secs_f64() * 1_000.0,
            response_length: outcome.response_length,
            error,
        };
        if self.metrics_tx.send(FlockMetric::Request(metric)).is_err() {
            debug!("user {}: runner is gone, request not recorded", self.user_id);
        }
        outcome
    }

    pub(crate) fn report_exception(&self, task: &str, error: &str) {
        let metric = crate::metrics::ExceptionMetric {
            user_spec: self.user_spec_name.clone(),
            task: task.to_string(),
            error: error.to_string(),
        };
        if self.metrics_tx.send(FlockMetric::Exception(metric)).is_err() {
            debug!("user {}: runner is gone, exception not recorded", self.user_id);
        }
    }
}
