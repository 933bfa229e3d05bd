//! Pluggable request execution.
//!
//! Flock does not know how to talk to the system under test. Each load test provides a
//! [`RequestExecutor`](./trait.RequestExecutor.html) that performs one unit of work and
//! reports how it went; running users invoke it through
//! [`FlockUser::request`](../scenario/struct.FlockUser.html#method.request), which times
//! the call and forwards the outcome to the stats aggregator.
//!
//! # Example
//! ```rust
//! use flock::prelude::*;
//!
//! struct Sleeper;
//!
//! #[async_trait]
//! impl RequestExecutor for Sleeper {
//!     async fn execute(&self, _request: &FlockRequest) -> RequestOutcome {
//!         timed(async {
//!             tokio::time::sleep(std::time::Duration::from_millis(5)).await;
//!             Ok::<usize, String>(0)
//!         })
//!         .await
//!     }
//! }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};

/// One unit of work for a [`RequestExecutor`](./trait.RequestExecutor.html).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlockRequest {
    /// Groups requests in the stats, such as `GET` or `query`.
    pub method: String,
    /// Names the request in the stats, such as `/` or `login`.
    pub name: String,
    /// Executor-defined detail.
    pub payload: Option<serde_json::Value>,
}
impl FlockRequest {
    pub fn new(method: &str, name: &str) -> Self {
        FlockRequest {
            method: method.to_string(),
            name: name.to_string(),
            payload: None,
        }
    }

    pub fn set_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// How a request went.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOutcome {
    pub success: bool,
    /// Time the executor measured. When `None` the time the engine measured around the
    /// call is used.
    pub elapsed: Option<Duration>,
    pub response_length: usize,
    pub error: Option<String>,
}
impl RequestOutcome {
    pub fn success(elapsed: Duration, response_length: usize) -> Self {
        RequestOutcome {
            success: true,
            elapsed: Some(elapsed),
            response_length,
            error: None,
        }
    }

    pub fn failure(elapsed: Duration, error: &str) -> Self {
        RequestOutcome {
            success: false,
            elapsed: Some(elapsed),
            response_length: 0,
            error: Some(error.to_string()),
        }
    }
}

/// Performs requests against the system under test.
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    async fn execute(&self, request: &FlockRequest) -> RequestOutcome;
}

/// Run a fallible future and time it. `Ok` carries the response length.
pub async fn timed<F, E>(future: F) -> RequestOutcome
where
    F: Future<Output = Result<usize, E>>,
    E: std::fmt::Display,
{
    let started = Instant::now();
    let result = future.await;
    let elapsed = started.elapsed();
    match result {
        Ok(response_length) => RequestOutcome::success(elapsed, response_length),
        Err(e) => RequestOutcome::failure(elapsed, &e.to_string()),
    }
}

/// Executor used when none is configured: every request succeeds immediately.
#[derive(Debug, Default, Clone)]
pub struct NoopExecutor;

#[async_trait]
impl RequestExecutor for NoopExecutor {
    async fn execute(&self, _request: &FlockRequest) -> RequestOutcome {
        RequestOutcome {
            success: true,
            elapsed: None,
            response_length: 0,
            error: None,
        }
    }
}
