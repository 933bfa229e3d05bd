use gumdrop::Options;
use std::time::Duration;

use flock::config::FlockConfiguration;
use flock::metrics::FlockMetrics;
use flock::prelude::*;

/// Not all functions are used by all tests, so we enable allow(dead_code) to avoid
/// compiler warnings during testing.

/// The following options are configured by default, if not set to a custom value:
///  --no-telnet
///
/// And if not building a Worker configuration:
///  --users 1
///  --hatch-rate 1
///  --run-time 1
pub fn build_configuration(custom: Vec<&str>) -> FlockConfiguration {
    // Start with an empty configuration.
    let mut configuration: Vec<&str> = vec![];

    // Merge in all custom options first.
    configuration.extend_from_slice(&custom);

    // Tests run in parallel, so they can't share the telnet port.
    if !configuration.contains(&"--no-telnet") && !configuration.contains(&"--telnet-port") {
        configuration.push("--no-telnet");
    }

    // If not building a Worker configuration, set some defaults.
    if !configuration.contains(&"--worker") {
        // Default to testing with 1 user if not otherwise configured.
        if !configuration.contains(&"--users") {
            configuration.extend_from_slice(&["--users", "1"]);
        }

        // Default to launching 1 user per second if not otherwise configured.
        if !configuration.contains(&"--hatch-rate") {
            configuration.extend_from_slice(&["--hatch-rate", "1"]);
        }

        // Default to running for 1 second if not otherwise configured.
        if !configuration.contains(&"--run-time") {
            configuration.extend_from_slice(&["--run-time", "1"]);
        }
    }

    // Parse these options to generate a FlockConfiguration.
    FlockConfiguration::parse_args_default(&configuration)
        .expect("failed to parse options and generate a configuration")
}

/// Every request succeeds after sleeping a fixed time.
#[derive(Clone, Debug)]
pub struct SleepExecutor {
    pub delay: Duration,
}

#[async_trait]
impl RequestExecutor for SleepExecutor {
    async fn execute(&self, _request: &FlockRequest) -> RequestOutcome {
        let delay = self.delay;
        timed(async move {
            tokio::time::sleep(delay).await;
            Ok::<usize, FlockError>(0)
        })
        .await
    }
}

/// Requests to a name starting with `/fail` fail, everything else succeeds.
#[allow(dead_code)]
#[derive(Clone, Debug, Default)]
pub struct PickyExecutor;

#[async_trait]
impl RequestExecutor for PickyExecutor {
    async fn execute(&self, request: &FlockRequest) -> RequestOutcome {
        if request.name.starts_with("/fail") {
            RequestOutcome::failure(Duration::from_millis(1), "refused")
        } else {
            RequestOutcome::success(Duration::from_millis(1), 10)
        }
    }
}

/// Create a Flock from the configuration, the user spec, and optional start and
/// stop tasks.
#[allow(dead_code)]
pub fn build_load_test(
    configuration: FlockConfiguration,
    user_spec: UserSpec,
    start_task: Option<Task>,
    stop_task: Option<Task>,
) -> Flock {
    // First set up the common base configuration.
    let mut flock = Flock::initialize_with_config(configuration)
        .expect("failed to initialize flock")
        .register_user(user_spec);

    if let Some(task) = start_task {
        flock = flock.test_start(task);
    }

    if let Some(task) = stop_task {
        flock = flock.test_stop(task);
    }

    flock
}

/// Run the load test to completion, returning its final metrics.
#[allow(dead_code)]
pub fn run_load_test(flock: Flock) -> FlockMetrics {
    flock.execute().expect("failed to run load test")
}

/// Poll snapshots until `check` is satisfied, panicking after `timeout`.
#[allow(dead_code)]
pub async fn wait_for<F>(controller: &ControlHandle, timeout: Duration, check: F) -> RunnerSnapshot
where
    F: Fn(&RunnerSnapshot) -> bool,
{
    let started = std::time::Instant::now();
    loop {
        let snapshot = controller
            .snapshot()
            .await
            .expect("load test exited while waiting");
        if check(&snapshot) {
            return snapshot;
        }
        if started.elapsed() > timeout {
            panic!("timed out waiting, last snapshot: {:?}", snapshot);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
