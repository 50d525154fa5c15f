use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::CacheStore;
use crate::event::{EventSink, JobEvent, JobMode, JobStatus};
use crate::hash::step_cache_key;
use crate::retry::compute_delay_ms;
use crate::step::{StepContext, StepRunResult};
use crate::validate::validate;
use crate::{BoxStep, DagError, StepError, StepInputs};

/// Per-run options for [`DagRunner::run`].
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Job identity; generated when absent.
    pub job_id: Option<String>,
    pub mode: JobMode,
    /// Bound on concurrently running steps. Defaults to 1 in streaming mode
    /// and 4 in batch mode; floored at 1.
    pub concurrency: Option<usize>,
    pub cancel: CancellationToken,
    pub emit: Option<EventSink>,
    pub cache: Option<Arc<dyn CacheStore>>,
}

/// Terminal outcome of a job run. Step-level failures land here as a
/// status, never as a panic or an `Err` from [`DagRunner::run`].
#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub status: JobStatus,
    pub job_id: String,
    pub mode: JobMode,
    /// Populated only for steps that completed successfully, from cache or
    /// execution.
    pub results_by_step: HashMap<String, StepRunResult>,
    pub error: Option<String>,
}

/// Runs one step through cache lookup, the retry loop and event emission.
///
/// Fails only after exhausting the policy's attempts, on a non-retryable
/// error, or when cancellation is observed at a checkpoint. Side effects
/// are confined to event emission, cache reads/writes and backoff sleeps.
pub async fn run_step(
    step: BoxStep,
    ctx: StepContext,
    cache: Option<Arc<dyn CacheStore>>,
) -> Result<StepRunResult, StepError> {
    let policy = step.retry().unwrap_or_default().resolve();

    let cache_key = match (step.cache(), &cache) {
        (Some(cfg), Some(_)) if cfg.enabled => Some(cfg.key.clone().unwrap_or_else(|| {
            step_cache_key(&ctx.step_id, &ctx.inputs, &ctx.params, cfg.snapshot.as_deref())
        })),
        _ => None,
    };

    if let (Some(key), Some(store)) = (&cache_key, &cache) {
        if let Some(hit) = store.get(key) {
            debug!(step_id = %ctx.step_id, cache_key = %key, "cache hit");
            ctx.emit(JobEvent::StepCached {
                job_id: ctx.job_id.clone(),
                step_id: ctx.step_id.clone(),
                cache_key: key.clone(),
            });
            return Ok(hit);
        }
    }

    for attempt in 1..=policy.max_attempts {
        if ctx.cancel.is_cancelled() {
            return Err(StepError::Aborted);
        }

        let delay_ms = compute_delay_ms(attempt, &policy);
        if delay_ms > 0 {
            ctx.emit(JobEvent::StepRetryDelay {
                job_id: ctx.job_id.clone(),
                step_id: ctx.step_id.clone(),
                attempt,
                delay_ms,
            });
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(StepError::Aborted),
                _ = sleep(Duration::from_millis(delay_ms)) => {}
            }
        }

        ctx.emit(JobEvent::StepStarted {
            job_id: ctx.job_id.clone(),
            step_id: ctx.step_id.clone(),
            attempt,
            mode: ctx.mode,
        });
        let started = Instant::now();

        match step.run(ctx.with_attempt(attempt)).await {
            Ok(result) => {
                ctx.emit(JobEvent::StepSucceeded {
                    job_id: ctx.job_id.clone(),
                    step_id: ctx.step_id.clone(),
                    attempt,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                if let (Some(key), Some(store)) = (&cache_key, &cache) {
                    store.put(key, result.clone());
                }
                return Ok(result);
            }
            Err(StepError::Aborted) => {
                ctx.emit(JobEvent::StepCancelled {
                    job_id: ctx.job_id.clone(),
                    step_id: ctx.step_id.clone(),
                    attempt,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                return Err(StepError::Aborted);
            }
            Err(err) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                // Cancellation takes priority over retry classification.
                if ctx.cancel.is_cancelled() {
                    ctx.emit(JobEvent::StepCancelled {
                        job_id: ctx.job_id.clone(),
                        step_id: ctx.step_id.clone(),
                        attempt,
                        duration_ms,
                    });
                    return Err(StepError::Aborted);
                }

                let retryable = err.is_retryable();
                ctx.emit(JobEvent::StepFailed {
                    job_id: ctx.job_id.clone(),
                    step_id: ctx.step_id.clone(),
                    attempt,
                    duration_ms,
                    retryable,
                    error: err.to_string(),
                });
                if !retryable || attempt == policy.max_attempts {
                    return Err(err);
                }
            }
        }
    }

    Err(StepError::Terminal(format!(
        "step {} exhausted its retry budget",
        ctx.step_id
    )))
}

/// Executes a validated DAG of steps with bounded concurrency.
///
/// Validation happens once in [`DagRunner::new`]; a run then drives a ready
/// queue and in-degree counters (Kahn's algorithm). All scheduler state is
/// owned by the run loop; spawned steps report back over a channel and
/// never touch the bookkeeping directly.
pub struct DagRunner {
    steps: IndexMap<String, BoxStep>,
    in_degrees: HashMap<String, usize>,
    dependents: HashMap<String, Vec<String>>,
}

impl DagRunner {
    /// Validates the step list and precomputes the dependency bookkeeping.
    /// Fails synchronously on duplicate ids, unknown dependencies or cycles,
    /// before any job identity exists.
    pub fn new(steps: Vec<BoxStep>) -> Result<Self, DagError> {
        validate(&steps)?;

        let mut in_degrees = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for step in &steps {
            in_degrees.insert(step.id().to_string(), step.deps().len());
            for dep in step.deps() {
                dependents
                    .entry(dep)
                    .or_default()
                    .push(step.id().to_string());
            }
        }

        // Submission order is kept so ready-queue tie-breaks are stable.
        let steps = steps
            .into_iter()
            .map(|s| (s.id().to_string(), s))
            .collect::<IndexMap<_, _>>();

        Ok(Self {
            steps,
            in_degrees,
            dependents,
        })
    }

    /// Runs the whole DAG to a terminal status.
    ///
    /// `inputs` are job-level inputs made visible to every step under keys
    /// no dependency shadows. Step failures and cancellation come back as
    /// the result's status, not as an error.
    pub async fn run(&self, inputs: StepInputs, opts: RunOptions) -> JobResult {
        let job_id = opts
            .job_id
            .clone()
            .unwrap_or_else(|| format!("job_{}", Uuid::new_v4().simple()));
        let mode = opts.mode;
        let concurrency = opts
            .concurrency
            .unwrap_or(match mode {
                JobMode::Streaming => 1,
                JobMode::Batch => 4,
            })
            .max(1);
        let emit = |event: JobEvent| {
            if let Some(sink) = &opts.emit {
                sink(&event);
            }
        };

        emit(JobEvent::JobStarted {
            job_id: job_id.clone(),
            mode,
            step_count: self.steps.len(),
        });
        info!(job_id = %job_id, steps = self.steps.len(), concurrency, "job started");

        let mut in_degrees = self.in_degrees.clone();
        let mut ready: VecDeque<String> = self
            .steps
            .keys()
            .filter(|id| in_degrees.get(*id).copied() == Some(0))
            .cloned()
            .collect();

        let mut results: HashMap<String, StepRunResult> = HashMap::new();
        let (done_tx, mut done_rx) =
            mpsc::unbounded_channel::<(String, Result<StepRunResult, StepError>)>();
        let mut in_flight = 0usize;
        let mut cancelled = false;
        let mut failure: Option<(String, StepError)> = None;

        loop {
            while failure.is_none()
                && !cancelled
                && !opts.cancel.is_cancelled()
                && in_flight < concurrency
            {
                let Some(step_id) = ready.pop_front() else {
                    break;
                };
                let Some(step) = self.steps.get(&step_id).map(Arc::clone) else {
                    continue;
                };

                let step_inputs = self.assemble_inputs(&step, &results, &inputs);
                debug!(job_id = %job_id, step_id = %step_id, "dispatching step");

                let ctx = StepContext {
                    job_id: job_id.clone(),
                    mode,
                    step_id: step_id.clone(),
                    attempt: 1,
                    inputs: step_inputs,
                    params: step.params(),
                    cancel: opts.cancel.clone(),
                    emit: opts.emit.clone(),
                };
                let cache = opts.cache.clone();
                let tx = done_tx.clone();
                in_flight += 1;
                tokio::spawn(async move {
                    let outcome = run_step(step, ctx, cache).await;
                    let _ = tx.send((step_id, outcome));
                });
            }

            if in_flight == 0 {
                break;
            }

            tokio::select! {
                Some((step_id, outcome)) = done_rx.recv() => {
                    in_flight -= 1;
                    match outcome {
                        Ok(result) => {
                            results.insert(step_id.clone(), result);
                            emit(JobEvent::Progress {
                                job_id: job_id.clone(),
                                completed_steps: results.len(),
                                total_steps: self.steps.len(),
                            });
                            if let Some(children) = self.dependents.get(&step_id) {
                                for child in children {
                                    if let Some(degree) = in_degrees.get_mut(child) {
                                        *degree -= 1;
                                        if *degree == 0 {
                                            ready.push_back(child.clone());
                                        }
                                    }
                                }
                            }
                        }
                        Err(StepError::Aborted) => {
                            cancelled = true;
                        }
                        Err(err) => {
                            warn!(job_id = %job_id, step_id = %step_id, error = %err, "step failed terminally");
                            if failure.is_none() {
                                failure = Some((step_id, err));
                            }
                        }
                    }
                }
                _ = opts.cancel.cancelled(), if !cancelled => {
                    // Stop dispatching; keep draining in-flight steps.
                    cancelled = true;
                }
            }
        }

        if opts.cancel.is_cancelled() {
            cancelled = true;
        }

        if cancelled {
            info!(job_id = %job_id, "job cancelled");
            emit(JobEvent::JobCancelled {
                job_id: job_id.clone(),
                mode,
            });
            return JobResult {
                status: JobStatus::Cancelled,
                job_id,
                mode,
                results_by_step: results,
                error: None,
            };
        }

        if let Some((step_id, err)) = failure {
            let message = format!("step {step_id}: {err}");
            warn!(job_id = %job_id, error = %message, "job failed");
            emit(JobEvent::JobFailed {
                job_id: job_id.clone(),
                mode,
                error: message.clone(),
            });
            return JobResult {
                status: JobStatus::Failed,
                job_id,
                mode,
                results_by_step: results,
                error: Some(message),
            };
        }

        info!(job_id = %job_id, completed = results.len(), "job succeeded");
        emit(JobEvent::JobSucceeded {
            job_id: job_id.clone(),
            mode,
            completed_steps: results.len(),
        });
        JobResult {
            status: JobStatus::Succeeded,
            job_id,
            mode,
            results_by_step: results,
            error: None,
        }
    }

    /// Dependency outputs keyed by dependency id, overlaid with job-level
    /// inputs that no dependency shadows.
    fn assemble_inputs(
        &self,
        step: &BoxStep,
        results: &HashMap<String, StepRunResult>,
        job_inputs: &StepInputs,
    ) -> StepInputs {
        let mut merged = StepInputs::new();
        for dep in step.deps() {
            let mut outputs = serde_json::Map::new();
            if let Some(result) = results.get(&dep) {
                for (k, v) in &result.outputs {
                    outputs.insert(k.clone(), v.clone());
                }
            }
            merged.insert(dep, Value::Object(outputs));
        }
        for (key, value) in job_inputs {
            if !merged.contains_key(key) {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }

    /// Textual rendering of the dependency graph, one tree per root.
    pub fn render_graph(&self) -> String {
        let mut out = String::new();
        for (id, _) in &self.steps {
            if self.in_degrees.get(id).copied() == Some(0) {
                out.push_str(id);
                out.push('\n');
                self.render_chain(id, "  ", &mut out);
            }
        }
        out
    }

    fn render_chain(&self, id: &str, prefix: &str, out: &mut String) {
        if let Some(children) = self.dependents.get(id) {
            for child in children {
                out.push_str(&format!("{prefix}└─> {child}\n"));
                self.render_chain(child, &format!("{prefix}    "), out);
            }
        }
    }
}
