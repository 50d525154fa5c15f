use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::event::{EventSink, JobEvent, JobMode};
use crate::retry::RetryPolicy;
use crate::{StepError, StepInputs, StepOutputs};

/// One unit of work in a job. Implementations come from the surrounding
/// application; the runner only depends on this contract.
#[async_trait]
pub trait Step: Send + Sync {
    /// Unique id within the job.
    fn id(&self) -> &str;

    /// Ids of the steps that must complete before this one starts.
    fn deps(&self) -> Vec<String> {
        Vec::new()
    }

    /// Opaque parameters passed through to `run` (and into the cache key).
    fn params(&self) -> Value {
        Value::Null
    }

    /// Per-step retry override; `None` uses the job-level defaults.
    fn retry(&self) -> Option<RetryPolicy> {
        None
    }

    /// Result caching configuration; `None` disables caching for this step.
    fn cache(&self) -> Option<CacheConfig> {
        None
    }

    async fn run(&self, ctx: StepContext) -> Result<StepRunResult, StepError>;
}

pub type BoxStep = Arc<dyn Step>;

/// Step-result caching configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Tag mixed into the cache key so callers can invalidate whole
    /// generations of entries at once.
    pub snapshot: Option<String>,
    /// Explicit key overriding the computed hash.
    pub key: Option<String>,
}

impl CacheConfig {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    pub fn with_snapshot(mut self, snapshot: impl Into<String>) -> Self {
        self.snapshot = Some(snapshot.into());
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Everything a step body sees about the run it is part of.
#[derive(Clone)]
pub struct StepContext {
    pub job_id: String,
    pub mode: JobMode,
    pub step_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Outputs of each direct dependency keyed by dependency id, overlaid
    /// with job-level inputs that no dependency shadows.
    pub inputs: StepInputs,
    pub params: Value,
    pub cancel: CancellationToken,
    pub emit: Option<EventSink>,
}

impl StepContext {
    pub fn emit(&self, event: JobEvent) {
        if let Some(sink) = &self.emit {
            sink(&event);
        }
    }

    pub(crate) fn with_attempt(&self, attempt: u32) -> Self {
        let mut ctx = self.clone();
        ctx.attempt = attempt;
        ctx
    }
}

/// What a step hands back on success. Missing outputs mean an empty map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepRunResult {
    #[serde(default)]
    pub outputs: StepOutputs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<HashMap<String, Value>>,
}

impl StepRunResult {
    pub fn with_outputs(outputs: StepOutputs) -> Self {
        Self {
            outputs,
            metrics: None,
        }
    }
}

type StepBody =
    dyn Fn(StepContext) -> BoxFuture<'static, Result<StepRunResult, StepError>> + Send + Sync;

/// Closure-backed [`Step`] so callers can submit ad-hoc steps without
/// defining a struct per step.
pub struct FnStep {
    id: String,
    deps: Vec<String>,
    params: Value,
    retry: Option<RetryPolicy>,
    cache: Option<CacheConfig>,
    body: Box<StepBody>,
}

impl FnStep {
    pub fn new<F>(id: impl Into<String>, body: F) -> Self
    where
        F: Fn(StepContext) -> BoxFuture<'static, Result<StepRunResult, StepError>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            id: id.into(),
            deps: Vec::new(),
            params: Value::Null,
            retry: None,
            cache: None,
            body: Box::new(body),
        }
    }

    pub fn with_deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deps = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn boxed(self) -> BoxStep {
        Arc::new(self)
    }
}

#[async_trait]
impl Step for FnStep {
    fn id(&self) -> &str {
        &self.id
    }

    fn deps(&self) -> Vec<String> {
        self.deps.clone()
    }

    fn params(&self) -> Value {
        self.params.clone()
    }

    fn retry(&self) -> Option<RetryPolicy> {
        self.retry
    }

    fn cache(&self) -> Option<CacheConfig> {
        self.cache.clone()
    }

    async fn run(&self, ctx: StepContext) -> Result<StepRunResult, StepError> {
        (self.body)(ctx).await
    }
}
