use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Execution mode of a job. Streaming defaults to concurrency 1 so step
/// ordering stays strictly sequential for low-latency sessions; batch
/// defaults to concurrency 4.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobMode {
    Streaming,
    #[default]
    Batch,
}

/// Terminal status of a job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Succeeded,
    Failed,
    Cancelled,
}

/// Structured observability events. The sink is invoked synchronously and
/// must treat every event as fire-and-forget; nothing in the runner waits
/// on a consumer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobEvent {
    JobStarted {
        job_id: String,
        mode: JobMode,
        step_count: usize,
    },
    StepStarted {
        job_id: String,
        step_id: String,
        attempt: u32,
        mode: JobMode,
    },
    StepRetryDelay {
        job_id: String,
        step_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    StepSucceeded {
        job_id: String,
        step_id: String,
        attempt: u32,
        duration_ms: u64,
    },
    StepFailed {
        job_id: String,
        step_id: String,
        attempt: u32,
        duration_ms: u64,
        retryable: bool,
        error: String,
    },
    StepCached {
        job_id: String,
        step_id: String,
        cache_key: String,
    },
    StepCancelled {
        job_id: String,
        step_id: String,
        attempt: u32,
        duration_ms: u64,
    },
    Progress {
        job_id: String,
        completed_steps: usize,
        total_steps: usize,
    },
    JobSucceeded {
        job_id: String,
        mode: JobMode,
        completed_steps: usize,
    },
    JobFailed {
        job_id: String,
        mode: JobMode,
        error: String,
    },
    JobCancelled {
        job_id: String,
        mode: JobMode,
    },
}

impl JobEvent {
    /// Step id the event refers to, if any.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            JobEvent::StepStarted { step_id, .. }
            | JobEvent::StepRetryDelay { step_id, .. }
            | JobEvent::StepSucceeded { step_id, .. }
            | JobEvent::StepFailed { step_id, .. }
            | JobEvent::StepCached { step_id, .. }
            | JobEvent::StepCancelled { step_id, .. } => Some(step_id),
            _ => None,
        }
    }
}

pub type EventSink = Arc<dyn Fn(&JobEvent) + Send + Sync>;
