use async_trait::async_trait;
use dagrun::{
    CacheConfig, DagRunner, InMemoryCache, JobMode, RetryPolicy, RunOptions, Step, StepContext,
    StepError, StepRunResult,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

// A media-style render job: ingest fans out to audio and video work,
// which converge into compositing and delivery.
struct PipelineStep {
    id: String,
    deps: Vec<String>,
    work_ms: u64,
}

impl PipelineStep {
    fn new(id: &str, deps: &[&str], work_ms: u64) -> dagrun::BoxStep {
        Arc::new(Self {
            id: id.to_string(),
            deps: deps.iter().map(|d| d.to_string()).collect(),
            work_ms,
        })
    }
}

#[async_trait]
impl Step for PipelineStep {
    fn id(&self) -> &str {
        &self.id
    }

    fn deps(&self) -> Vec<String> {
        self.deps.clone()
    }

    fn retry(&self) -> Option<RetryPolicy> {
        Some(RetryPolicy {
            max_attempts: Some(3),
            ..Default::default()
        })
    }

    fn cache(&self) -> Option<CacheConfig> {
        Some(CacheConfig::enabled().with_snapshot("demo-v1"))
    }

    async fn run(&self, ctx: StepContext) -> Result<StepRunResult, StepError> {
        println!("running {} (attempt {})", self.id, ctx.attempt);
        tokio::time::sleep(std::time::Duration::from_millis(self.work_ms)).await;

        // Sorted so outputs (and the cache keys derived from them) stay
        // identical across runs.
        let mut consumed: Vec<String> = ctx.inputs.keys().cloned().collect();
        consumed.sort();

        let mut outputs = HashMap::new();
        outputs.insert("step".to_string(), json!(self.id));
        outputs.insert("consumed".to_string(), json!(consumed));
        Ok(StepRunResult::with_outputs(outputs))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let steps: Vec<dagrun::BoxStep> = vec![
        PipelineStep::new("ingest", &[], 50),
        PipelineStep::new("audio", &["ingest"], 120),
        PipelineStep::new("video", &["ingest"], 150),
        PipelineStep::new("composite", &["audio", "video"], 80),
        PipelineStep::new("deliver", &["composite"], 30),
    ];

    let runner = DagRunner::new(steps)?;
    println!("=== dependency graph ===\n{}", runner.render_graph());

    let emit = Arc::new(|event: &dagrun::JobEvent| {
        if let Ok(line) = serde_json::to_string(event) {
            println!("event: {line}");
        }
    });

    let cache = Arc::new(InMemoryCache::new());
    let mut inputs = HashMap::new();
    inputs.insert("session".to_string(), json!({"locale": "en-US"}));

    let result = runner
        .run(
            inputs.clone(),
            RunOptions {
                mode: JobMode::Batch,
                concurrency: Some(2),
                emit: Some(emit.clone()),
                cache: Some(cache.clone()),
                ..Default::default()
            },
        )
        .await;
    println!("first run: {:?} ({} steps)", result.status, result.results_by_step.len());

    // Same inputs and snapshot: every step is served from the cache.
    let result = runner
        .run(
            inputs,
            RunOptions {
                mode: JobMode::Batch,
                concurrency: Some(2),
                emit: Some(emit),
                cache: Some(cache),
                ..Default::default()
            },
        )
        .await;
    println!("second run: {:?} ({} steps)", result.status, result.results_by_step.len());

    Ok(())
}
