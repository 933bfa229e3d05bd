//! The user scheduling engine.
//!
//! A [`UserEngine`] owns every running user in a process and converges the number of
//! running users toward a target, one tick per second, spawning or retiring at most the
//! configured ramp rate per tick. Users are split across UserSpecs with
//! [`apportion`], a largest remainder apportionment, and across workers with
//! [`apportion_workers`].

use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::executor::RequestExecutor;
use crate::metrics::FlockMetric;
use crate::scenario::{FlockScheduler, FlockUser, UserSpec};
use crate::user::{self, UserCommand};

/// Split `total` across `weights` so the counts sum exactly to `total`.
///
/// Each share gets the integer part of its quota, and the leftover goes to the largest
/// fractional remainders, lower index first on ties. A weight of 0 always gets 0. When
/// there are at least as many users as positive weights, every positive weight gets at
/// least one user.
///
/// # Example
/// ```rust
/// use flock::engine::apportion;
///
/// assert_eq!(apportion(10, &[3, 1]), vec![8, 2]);
/// assert_eq!(apportion(3, &[100, 1, 1]), vec![1, 1, 1]);
/// assert_eq!(apportion(5, &[1, 0]), vec![5, 0]);
/// ```
pub fn apportion(total: usize, weights: &[usize]) -> Vec<usize> {
    let mut counts = vec![0; weights.len()];
    let weight_sum: u128 = weights.iter().map(|w| *w as u128).sum();
    if weight_sum == 0 || total == 0 {
        return counts;
    }

    let mut assigned = 0;
    let mut remainders = Vec::with_capacity(weights.len());
    for (index, weight) in weights.iter().enumerate() {
        let exact = total as u128 * *weight as u128;
        counts[index] = (exact / weight_sum) as usize;
        assigned += counts[index];
        remainders.push((exact % weight_sum, index));
    }
    remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    for (_, index) in remainders.iter().take(total - assigned) {
        counts[*index] += 1;
    }

    let positive = weights.iter().filter(|w| **w > 0).count();
    if total >= positive {
        for index in 0..weights.len() {
            if weights[index] > 0 && counts[index] == 0 {
                let donor = (0..counts.len())
                    .filter(|j| counts[*j] > 1)
                    .max_by_key(|j| (counts[*j], Reverse(*j)));
                if let Some(donor) = donor {
                    counts[donor] -= 1;
                    counts[index] += 1;
                }
            }
        }
    }
    counts
}

/// Split `total` evenly across `workers`; the first `total % workers` get one extra.
///
/// # Example
/// ```rust
/// use flock::engine::apportion_workers;
///
/// assert_eq!(apportion_workers(10, 3), vec![4, 3, 3]);
/// ```
pub fn apportion_workers(total: usize, workers: usize) -> Vec<usize> {
    if workers == 0 {
        return Vec::new();
    }
    let base = total / workers;
    let extra = total % workers;
    (0..workers)
        .map(|index| if index < extra { base + 1 } else { base })
        .collect()
}

/// Per-UserSpec plan: fixed counts are reserved first, then the remainder is
/// apportioned by weight. With `equal_weights` every positive weight counts as 1.
pub(crate) fn apportion_user_specs(
    total: usize,
    plans: &[UserSpecPlan],
    equal_weights: bool,
) -> Vec<usize> {
    let mut counts = vec![0; plans.len()];
    let mut remaining = total;
    for (index, plan) in plans.iter().enumerate() {
        if let Some(fixed) = plan.fixed_count {
            counts[index] = fixed.min(remaining);
            remaining -= counts[index];
        }
    }
    let weights: Vec<usize> = plans
        .iter()
        .map(|plan| match plan.fixed_count {
            Some(_) => 0,
            None if equal_weights && plan.weight > 0 => 1,
            None => plan.weight,
        })
        .collect();
    for (index, count) in apportion(remaining, &weights).into_iter().enumerate() {
        counts[index] += count;
    }
    counts
}

/// How one UserSpec takes part in a run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSpecPlan {
    pub name: String,
    pub weight: usize,
    pub fixed_count: Option<usize>,
}

impl From<&UserSpec> for UserSpecPlan {
    fn from(user_spec: &UserSpec) -> Self {
        UserSpecPlan {
            name: user_spec.name.clone(),
            weight: user_spec.weight,
            fixed_count: user_spec.fixed_count,
        }
    }
}

/// Everything a process needs to run users the same way as every other process.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    pub user_specs: Vec<UserSpecPlan>,
    pub scheduler: FlockScheduler,
    /// Graceful stop cap, in milliseconds.
    pub stop_timeout: u64,
    pub equal_weights: bool,
}
impl RunSpec {
    pub(crate) fn new(user_specs: &[UserSpec], settings: &EngineSettings) -> Self {
        RunSpec {
            user_specs: user_specs.iter().map(UserSpecPlan::from).collect(),
            scheduler: settings.scheduler,
            stop_timeout: settings.stop_timeout.as_millis() as u64,
            equal_weights: settings.equal_weights,
        }
    }
}

/// Engine limits and policies.
#[derive(Clone, Debug)]
pub(crate) struct EngineSettings {
    pub(crate) scheduler: FlockScheduler,
    pub(crate) max_users: Option<usize>,
    pub(crate) stop_timeout: Duration,
    pub(crate) equal_weights: bool,
}

/// One live simulated user.
pub(crate) struct RunningUser {
    pub(crate) id: usize,
    pub(crate) user_specs_index: usize,
    pub(crate) started: Instant,
    /// Index of the task most recently started.
    pub(crate) cursor: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
    sender: flume::Sender<UserCommand>,
}

// A user told to exit, with the moment it gets cancelled if still running.
struct StoppingUser {
    id: usize,
    deadline: Instant,
    handle: JoinHandle<()>,
}

pub(crate) struct UserEngine {
    user_specs: Vec<Arc<UserSpec>>,
    plans: Vec<UserSpecPlan>,
    executor: Arc<dyn RequestExecutor>,
    metrics_tx: flume::Sender<FlockMetric>,
    settings: EngineSettings,
    running: Vec<RunningUser>,
    stopping: Vec<StoppingUser>,
    target_user_count: usize,
    ramp_rate: f32,
    spawn_credit: f32,
    next_user_id: usize,
    /// Set while the user limit keeps the engine below its target.
    pub(crate) warning: Option<String>,
    log_prefix: String,
}
impl UserEngine {
    pub(crate) fn new(
        mut user_specs: Vec<UserSpec>,
        executor: Arc<dyn RequestExecutor>,
        metrics_tx: flume::Sender<FlockMetric>,
        settings: EngineSettings,
        log_prefix: &str,
    ) -> Self {
        for (index, user_spec) in user_specs.iter_mut().enumerate() {
            user_spec.user_specs_index = index;
            user_spec.prepare(settings.scheduler);
        }
        let plans = user_specs.iter().map(UserSpecPlan::from).collect();
        UserEngine {
            user_specs: user_specs.into_iter().map(Arc::new).collect(),
            plans,
            executor,
            metrics_tx,
            settings,
            running: Vec::new(),
            stopping: Vec::new(),
            target_user_count: 0,
            ramp_rate: 1.0,
            spawn_credit: 0.0,
            next_user_id: 0,
            warning: None,
            log_prefix: log_prefix.to_string(),
        }
    }

    /// Adopt a plan received from elsewhere. Users already running keep going; the
    /// next ticks converge toward the new mix.
    pub(crate) fn apply_run_spec(&mut self, run_spec: &RunSpec) {
        for plan in &run_spec.user_specs {
            if !self.plans.iter().any(|p| p.name == plan.name) {
                warn!(
                    "{}no user spec named {} is registered, ignoring it",
                    self.log_prefix, plan.name
                );
            }
        }
        self.plans = self
            .plans
            .iter()
            .map(|local| {
                run_spec
                    .user_specs
                    .iter()
                    .find(|p| p.name == local.name)
                    .cloned()
                    .unwrap_or(UserSpecPlan {
                        name: local.name.clone(),
                        weight: 0,
                        fixed_count: None,
                    })
            })
            .collect();
        self.settings.stop_timeout = Duration::from_millis(run_spec.stop_timeout);
        self.settings.equal_weights = run_spec.equal_weights;
        if self.settings.scheduler != run_spec.scheduler {
            self.settings.scheduler = run_spec.scheduler;
            self.user_specs = self
                .user_specs
                .iter()
                .map(|user_spec| {
                    let mut user_spec = UserSpec::clone(user_spec);
                    user_spec.prepare(run_spec.scheduler);
                    Arc::new(user_spec)
                })
                .collect();
        }
    }

    /// Change the target; the next tick starts converging toward it right away.
    pub(crate) fn set_target(&mut self, target_user_count: usize, ramp_rate: f32) {
        debug!(
            "{}engine target: {} users at {} per second",
            self.log_prefix, target_user_count, ramp_rate
        );
        self.target_user_count = target_user_count;
        self.ramp_rate = ramp_rate;
        self.spawn_credit = 0.0;
        self.update_warning();
    }

    pub(crate) fn target_user_count(&self) -> usize {
        self.target_user_count
    }

    /// Users that have not been told to stop.
    pub(crate) fn user_count(&self) -> usize {
        self.running.len()
    }

    /// Users told to stop that have not exited yet.
    pub(crate) fn stopping_count(&self) -> usize {
        self.stopping.len()
    }

    pub(crate) fn user_counts(&self) -> BTreeMap<String, usize> {
        let mut counts: BTreeMap<String, usize> = self
            .user_specs
            .iter()
            .map(|user_spec| (user_spec.name.clone(), 0))
            .collect();
        for user in &self.running {
            if let Some(count) = counts.get_mut(&self.user_specs[user.user_specs_index].name) {
                *count += 1;
            }
        }
        counts
    }

    /// Per-UserSpec counts the engine is converging toward.
    pub(crate) fn desired_counts(&self) -> Vec<usize> {
        let total = match self.settings.max_users {
            Some(max_users) => self.target_user_count.min(max_users),
            None => self.target_user_count,
        };
        apportion_user_specs(total, &self.plans, self.settings.equal_weights)
    }

    /// Whether the running users match the desired counts.
    pub(crate) fn converged(&self) -> bool {
        self.current_counts() == self.desired_counts()
    }

    fn current_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.user_specs.len()];
        for user in &self.running {
            counts[user.user_specs_index] += 1;
        }
        counts
    }

    fn update_warning(&mut self) {
        self.warning = match self.settings.max_users {
            Some(max_users) if self.target_user_count > max_users => {
                let warning = format!(
                    "target of {} users exceeds the limit of {} users per process",
                    self.target_user_count, max_users
                );
                warn!("{}{}", self.log_prefix, warning);
                Some(warning)
            }
            _ => None,
        };
    }

    /// One ramp step: spawn or retire up to the ramp rate's worth of users, never more
    /// than the distance to the target. Returns how many users changed.
    pub(crate) fn tick(&mut self) -> usize {
        self.reap();
        let desired = self.desired_counts();
        let mut current = self.current_counts();
        if current == desired {
            self.spawn_credit = 0.0;
            return 0;
        }

        self.spawn_credit += self.ramp_rate;
        let budget = self.spawn_credit.floor() as usize;
        let desired_total: usize = desired.iter().sum();
        let mut work = 0;
        while work < budget && current != desired {
            let current_total: usize = current.iter().sum();
            let deficit = largest_gap(&desired, &current);
            let surplus = largest_gap(&current, &desired);
            if current_total < desired_total {
                if let Some(index) = deficit {
                    self.spawn_user(index);
                    current[index] += 1;
                }
            } else if current_total > desired_total {
                if let Some(index) = surplus {
                    self.retire_user(index);
                    current[index] -= 1;
                }
            } else if let (Some(from), Some(to)) = (surplus, deficit) {
                // Same total, wrong mix: move one user across.
                self.retire_user(from);
                self.spawn_user(to);
                current[from] -= 1;
                current[to] += 1;
            } else {
                break;
            }
            work += 1;
        }
        self.spawn_credit -= work as f32;
        if current == desired {
            self.spawn_credit = 0.0;
            info!(
                "{}{} users running: {:?}",
                self.log_prefix,
                self.running.len(),
                self.user_counts()
            );
        }
        work
    }

    fn spawn_user(&mut self, user_specs_index: usize) {
        let user_spec = Arc::clone(&self.user_specs[user_specs_index]);
        let id = self.next_user_id;
        self.next_user_id += 1;
        let (sender, receiver) = flume::unbounded();
        let cursor = Arc::new(AtomicUsize::new(0));
        let user = FlockUser::new(
            id,
            &user_spec.name,
            Arc::clone(&self.executor),
            self.metrics_tx.clone(),
        );
        let handle = tokio::spawn(user::user_main(
            user_spec,
            user,
            receiver,
            Arc::clone(&cursor),
            self.log_prefix.clone(),
        ));
        self.running.push(RunningUser {
            id,
            user_specs_index,
            started: Instant::now(),
            cursor,
            handle,
            sender,
        });
    }

    // Ask the most recently launched user of a spec to exit.
    fn retire_user(&mut self, user_specs_index: usize) {
        if let Some(position) = self
            .running
            .iter()
            .rposition(|u| u.user_specs_index == user_specs_index)
        {
            let user = self.running.remove(position);
            self.signal_exit(user);
        }
    }

    fn signal_exit(&mut self, user: RunningUser) {
        trace!(
            "{}stopping user {} in task {} after {:?}",
            self.log_prefix,
            user.id,
            user.cursor.load(std::sync::atomic::Ordering::Relaxed),
            user.started.elapsed()
        );
        // The user may already be gone, in which case there's nothing to tell.
        let _ = user.sender.send(UserCommand::Exit);
        self.stopping.push(StoppingUser {
            id: user.id,
            deadline: Instant::now() + self.settings.stop_timeout,
            handle: user.handle,
        });
    }

    /// Ask every user to exit; they finish their current task first.
    pub(crate) fn stop_all(&mut self) {
        self.target_user_count = 0;
        self.spawn_credit = 0.0;
        self.warning = None;
        for user in std::mem::take(&mut self.running) {
            self.signal_exit(user);
        }
    }

    /// Forget users that exited, and cancel stopping users past the stop timeout.
    pub(crate) fn reap(&mut self) {
        let log_prefix = &self.log_prefix;
        self.running.retain(|user| {
            if user.handle.is_finished() {
                warn!("{}user {} exited unexpectedly", log_prefix, user.id);
                false
            } else {
                true
            }
        });
        let now = Instant::now();
        self.stopping.retain(|user| {
            if user.handle.is_finished() {
                false
            } else if now >= user.deadline {
                info!(
                    "{}cancelling user {} after the stop timeout",
                    log_prefix, user.id
                );
                user.handle.abort();
                false
            } else {
                true
            }
        });
    }

    /// Cancel every user immediately, abandoning in-flight requests.
    pub(crate) fn abort_all(&mut self) {
        self.target_user_count = 0;
        self.spawn_credit = 0.0;
        for user in self.running.drain(..) {
            user.handle.abort();
        }
        for user in self.stopping.drain(..) {
            user.handle.abort();
        }
    }
}
impl Drop for UserEngine {
    fn drop(&mut self) {
        self.abort_all();
    }
}

// Index with the largest positive `a[i] - b[i]`, lower index first on ties.
fn largest_gap(a: &[usize], b: &[usize]) -> Option<usize> {
    a.iter()
        .zip(b)
        .enumerate()
        .filter(|(_, (x, y))| x > y)
        .max_by_key(|(index, (x, y))| (**x - **y, Reverse(*index)))
        .map(|(index, _)| index)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::executor::NoopExecutor;
    use crate::scenario::TaskResult;

    async fn wait(user: &mut FlockUser) -> TaskResult {
        user.request("GET", "/", None).await;
        Ok(())
    }

    fn engine(user_specs: Vec<UserSpec>, max_users: Option<usize>) -> UserEngine {
        let (metrics_tx, _metrics_rx) = flume::unbounded();
        UserEngine::new(
            user_specs,
            Arc::new(NoopExecutor),
            metrics_tx,
            EngineSettings {
                scheduler: FlockScheduler::Random,
                max_users,
                stop_timeout: Duration::from_secs(30),
                equal_weights: false,
            },
            "",
        )
    }

    fn spec(name: &str, weight: usize) -> UserSpec {
        crate::user!(name)
            .set_weight(weight)
            .register_task(crate::task!(wait))
            .set_wait_time(Duration::from_secs(1), Duration::from_secs(1))
            .unwrap()
    }

    fn plan(weight: usize, fixed_count: Option<usize>) -> UserSpecPlan {
        UserSpecPlan {
            name: "p".to_string(),
            weight,
            fixed_count,
        }
    }

    #[test]
    fn apportionment_is_exact() {
        for total in 0..60 {
            for weights in &[vec![1], vec![1, 1], vec![3, 1], vec![5, 3, 2], vec![7, 0, 1, 13]] {
                let counts = apportion(total, weights);
                assert_eq!(counts.iter().sum::<usize>(), total);
                // Zero weights never get users.
                for (count, weight) in counts.iter().zip(weights.iter()) {
                    if *weight == 0 {
                        assert_eq!(*count, 0);
                    }
                }
            }
        }
        assert_eq!(apportion(10, &[3, 1]), vec![8, 2]);
        assert_eq!(apportion(7, &[1, 1, 1]), vec![3, 2, 2]);
        assert_eq!(apportion(10, &[0, 0]), vec![0, 0]);
    }

    #[test]
    fn positive_weights_are_not_starved() {
        // The small weight's quota is far below one, but there are enough users.
        assert_eq!(apportion(3, &[1000, 1, 1]), vec![1, 1, 1]);
        assert_eq!(apportion(4, &[1000, 1]), vec![3, 1]);
        // Not enough users to go round: the largest remainders win.
        assert_eq!(apportion(1, &[10, 1]), vec![1, 0]);
    }

    #[test]
    fn worker_apportionment() {
        for total in 0..50 {
            for workers in 1..7 {
                let counts = apportion_workers(total, workers);
                assert_eq!(counts.len(), workers);
                assert_eq!(counts.iter().sum::<usize>(), total);
                let max = counts.iter().max().unwrap();
                let min = counts.iter().min().unwrap();
                assert!(max - min <= 1);
            }
        }
        assert_eq!(apportion_workers(10, 2), vec![5, 5]);
        assert_eq!(apportion_workers(5, 3), vec![2, 2, 1]);
        assert!(apportion_workers(5, 0).is_empty());
    }

    #[test]
    fn fixed_counts_reserved_first() {
        let plans = vec![plan(1, Some(2)), plan(3, None), plan(1, None)];
        assert_eq!(apportion_user_specs(10, &plans, false), vec![2, 6, 2]);
        // The fixed count is capped by the target.
        assert_eq!(apportion_user_specs(1, &plans, false), vec![1, 0, 0]);
        // Equal weights ignore the 3.
        assert_eq!(apportion_user_specs(10, &plans, true), vec![2, 4, 4]);
    }

    #[tokio::test]
    async fn ramp_converges_monotonically() {
        let mut engine = engine(vec![spec("a", 3), spec("b", 1)], None);
        engine.set_target(100, 10.0);
        for tick in 1..=10 {
            assert_eq!(engine.tick(), 10);
            assert_eq!(engine.user_count(), tick * 10);
            assert!(engine.user_count() <= 100);
        }
        assert!(engine.converged());
        assert_eq!(engine.tick(), 0);
        let counts = engine.user_counts();
        assert_eq!(counts["a"], 75);
        assert_eq!(counts["b"], 25);

        // A new target mid-ramp is chased directly.
        engine.set_target(130, 20.0);
        assert_eq!(engine.tick(), 20);
        engine.set_target(110, 20.0);
        assert_eq!(engine.tick(), 10);
        assert_eq!(engine.user_count(), 110);
        assert_eq!(engine.stopping_count(), 10);

        engine.abort_all();
        assert_eq!(engine.user_count(), 0);
        assert_eq!(engine.stopping_count(), 0);
    }

    #[tokio::test]
    async fn fractional_ramp_rate() {
        let mut engine = engine(vec![spec("a", 1)], None);
        engine.set_target(2, 0.5);
        assert_eq!(engine.tick(), 0);
        assert_eq!(engine.tick(), 1);
        assert_eq!(engine.tick(), 0);
        assert_eq!(engine.tick(), 1);
        assert!(engine.converged());
    }

    #[tokio::test]
    async fn max_users_caps_and_warns() {
        let mut engine = engine(vec![spec("a", 1)], Some(5));
        engine.set_target(8, 100.0);
        engine.tick();
        assert_eq!(engine.user_count(), 5);
        assert!(engine.converged());
        assert!(engine.warning.is_some());
        engine.set_target(3, 100.0);
        assert!(engine.warning.is_none());
    }

    #[tokio::test]
    async fn graceful_stop() {
        let mut engine = engine(vec![spec("a", 1)], None);
        engine.set_target(4, 4.0);
        engine.tick();
        assert_eq!(engine.user_count(), 4);

        engine.stop_all();
        assert_eq!(engine.user_count(), 0);
        assert_eq!(engine.stopping_count(), 4);
        // Users were sleeping, the exit command wakes them up.
        let started = Instant::now();
        while engine.stopping_count() > 0 && started.elapsed() < Duration::from_secs(5) {
            tokio::time::sleep(Duration::from_millis(10)).await;
            engine.reap();
        }
        assert_eq!(engine.stopping_count(), 0);
    }

    #[tokio::test]
    async fn run_spec_changes_mix() {
        let user_specs = vec![spec("a", 1), spec("b", 1)];
        let mut engine = engine(user_specs.clone(), None);
        let mut run_spec = RunSpec::new(&user_specs, &engine.settings);
        assert_eq!(run_spec.user_specs.len(), 2);
        run_spec.user_specs[1].weight = 0;
        run_spec.scheduler = FlockScheduler::Serial;
        engine.apply_run_spec(&run_spec);
        engine.set_target(4, 10.0);
        engine.tick();
        assert_eq!(engine.user_counts()["a"], 4);
        assert_eq!(engine.user_counts()["b"], 0);
        engine.abort_all();
    }
}
