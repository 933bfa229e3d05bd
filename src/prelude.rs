pub use async_trait::async_trait;

pub use crate::config::{FlockConfiguration, FlockDefault, FlockDefaultType};
pub use crate::controller::{ControlHandle, RunnerEvent, RunnerSnapshot};
pub use crate::executor::{timed, FlockRequest, NoopExecutor, RequestExecutor, RequestOutcome};
pub use crate::gaggle::transport::memory_transport;
pub use crate::metrics::FlockMetrics;
pub use crate::runner::RunState;
pub use crate::scenario::{
    FlockScheduler, FlockUser, Task, TaskError, TaskFunction, TaskResult, UserSpec,
};
pub use crate::shape::{LoadShape, LoadStage, StagesShape};
pub use crate::{task, user, Flock, FlockError, RunnerMode};
