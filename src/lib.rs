pub mod cache;
pub mod event;
pub mod executor;
pub mod hash;
pub mod retry;
pub mod step;
pub mod validate;

pub use cache::{CacheStore, InMemoryCache};
pub use event::{EventSink, JobEvent, JobMode, JobStatus};
pub use executor::{DagRunner, JobResult, RunOptions, run_step};
pub use hash::{canonical_string, sha256_hex, step_cache_key};
pub use retry::{ResolvedRetryPolicy, RetryPolicy, compute_delay_ms};
pub use step::{BoxStep, CacheConfig, FnStep, Step, StepContext, StepRunResult};
pub use validate::validate;

use std::collections::HashMap;
use thiserror::Error;

pub type StepInputs = HashMap<String, serde_json::Value>;
pub type StepOutputs = HashMap<String, serde_json::Value>;

/// Structural problems in a submitted step list. Raised synchronously,
/// before any job identity exists or any step body runs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DagError {
    #[error("step id must not be empty")]
    EmptyStepId,
    #[error("duplicate step id: {0}")]
    DuplicateStepId(String),
    #[error("step {step} depends on unknown step: {dep}")]
    UnknownDependency { step: String, dep: String },
    #[error("cycle detected at step: {0}")]
    CycleDetected(String),
}

/// Step-level failures. `Retryable` is eligible for another attempt under
/// the step's retry policy; anything else terminates the step.
#[derive(Error, Debug, Clone)]
pub enum StepError {
    #[error("{0}")]
    Retryable(String),
    #[error("{0}")]
    Terminal(String),
    #[error("step aborted by cancellation")]
    Aborted,
}

impl StepError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        StepError::Retryable(msg.into())
    }

    pub fn terminal(msg: impl Into<String>) -> Self {
        StepError::Terminal(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::Retryable(_))
    }
}
