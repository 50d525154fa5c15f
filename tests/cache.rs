mod common;

use common::capture_events;
use dagrun::{
    CacheConfig, CacheStore, DagRunner, FnStep, InMemoryCache, JobEvent, JobStatus, RunOptions,
    StepRunResult,
};
use futures::FutureExt;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn counting_step(
    id: &str,
    cache: CacheConfig,
    calls: &Arc<AtomicUsize>,
) -> dagrun::BoxStep {
    let counter = Arc::clone(calls);
    FnStep::new(id, move |_ctx| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(StepRunResult::with_outputs(
                [("rendered".to_string(), json!(true))].into(),
            ))
        }
        .boxed()
    })
    .with_params(json!({"quality": "high"}))
    .with_cache(cache)
    .boxed()
}

#[tokio::test]
async fn cache_hit_skips_the_step_body_and_emits_step_cached() {
    let calls = Arc::new(AtomicUsize::new(0));
    let store = Arc::new(InMemoryCache::new());

    let make_runner = || {
        DagRunner::new(vec![counting_step(
            "render",
            CacheConfig::enabled().with_snapshot("v1"),
            &calls,
        )])
        .unwrap()
    };

    let first = make_runner()
        .run(
            HashMap::new(),
            RunOptions {
                cache: Some(store.clone()),
                ..Default::default()
            },
        )
        .await;
    assert_eq!(first.status, JobStatus::Succeeded);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.len(), 1);

    let (sink, events) = capture_events();
    let second = make_runner()
        .run(
            HashMap::new(),
            RunOptions {
                cache: Some(store.clone()),
                emit: Some(sink),
                ..Default::default()
            },
        )
        .await;

    assert_eq!(second.status, JobStatus::Succeeded);
    assert_eq!(calls.load(Ordering::SeqCst), 1, "body must not run again");
    assert_eq!(
        second.results_by_step["render"].outputs["rendered"],
        json!(true)
    );

    let events = events.lock().unwrap();
    assert!(
        events
            .iter()
            .any(|e| matches!(e, JobEvent::StepCached { step_id, .. } if step_id == "render"))
    );
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, JobEvent::StepStarted { .. })),
        "a cache hit must not start the step"
    );
}

#[tokio::test]
async fn snapshot_tag_partitions_the_cache() {
    let calls = Arc::new(AtomicUsize::new(0));
    let store = Arc::new(InMemoryCache::new());

    for snapshot in ["v1", "v2"] {
        let runner = DagRunner::new(vec![counting_step(
            "render",
            CacheConfig::enabled().with_snapshot(snapshot),
            &calls,
        )])
        .unwrap();
        runner
            .run(
                HashMap::new(),
                RunOptions {
                    cache: Some(store.clone()),
                    ..Default::default()
                },
            )
            .await;
    }

    assert_eq!(calls.load(Ordering::SeqCst), 2, "each snapshot is a miss");
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn explicit_key_override_bypasses_the_hash() {
    let calls = Arc::new(AtomicUsize::new(0));
    let store = Arc::new(InMemoryCache::new());
    store.put(
        "warm",
        StepRunResult::with_outputs([("precomputed".to_string(), json!(42))].into()),
    );

    let runner = DagRunner::new(vec![counting_step(
        "render",
        CacheConfig::enabled().with_key("warm"),
        &calls,
    )])
    .unwrap();
    let result = runner
        .run(
            HashMap::new(),
            RunOptions {
                cache: Some(store.clone()),
                ..Default::default()
            },
        )
        .await;

    assert_eq!(result.status, JobStatus::Succeeded);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        result.results_by_step["render"].outputs["precomputed"],
        json!(42)
    );
}

#[tokio::test]
async fn no_store_means_no_caching() {
    let calls = Arc::new(AtomicUsize::new(0));
    let runner = DagRunner::new(vec![counting_step(
        "render",
        CacheConfig::enabled(),
        &calls,
    )])
    .unwrap();

    runner.run(HashMap::new(), RunOptions::default()).await;
    runner.run(HashMap::new(), RunOptions::default()).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

/// The runner deliberately does not guarantee at-most-once execution per
/// cache key: two concurrent misses on the same key may both run and both
/// write, with the last writer winning.
#[tokio::test(start_paused = true)]
async fn concurrent_misses_on_one_key_may_both_execute() {
    let calls = Arc::new(AtomicUsize::new(0));
    let store = Arc::new(InMemoryCache::new());

    let mut steps = Vec::new();
    for id in ["left", "right"] {
        let counter = Arc::clone(&calls);
        steps.push(
            FnStep::new(id, move |ctx| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(StepRunResult::with_outputs(
                        [("from".to_string(), json!(ctx.step_id))].into(),
                    ))
                }
                .boxed()
            })
            .with_cache(CacheConfig::enabled().with_key("shared"))
            .boxed(),
        );
    }

    let runner = DagRunner::new(steps).unwrap();
    let result = runner
        .run(
            HashMap::new(),
            RunOptions {
                concurrency: Some(2),
                cache: Some(store.clone()),
                ..Default::default()
            },
        )
        .await;

    assert_eq!(result.status, JobStatus::Succeeded);
    assert_eq!(calls.load(Ordering::SeqCst), 2, "both misses execute");

    let winner = store.get("shared").expect("one write must survive");
    let from = winner.outputs["from"].as_str().unwrap();
    assert!(from == "left" || from == "right");
}
