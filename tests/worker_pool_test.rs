//! Integration tests for WorkerPool
//!
//! These tests validate:
//! - Batch isolation across concurrent submitters
//! - Blocking and async APIs
//! - Observable parallel speedup
//! - Error slots, panics, and the shutdown policy

use async_trait::async_trait;
use durable_relay::config::WorkerPoolConfig;
use durable_relay::core::{
    AppResult, FnExecutor, Job, JobError, JobResult, PoolError, WorkerContext, WorkerExecutor,
    WorkerPool,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

// ============================================================================
// HELPERS
// ============================================================================

fn config(workers: usize) -> WorkerPoolConfig {
    WorkerPoolConfig::new().with_worker_count(workers)
}

fn sorted<R>(mut results: Vec<JobResult<R>>) -> Vec<JobResult<R>> {
    results.sort_by_key(|r| r.job_id);
    results
}

/// Records every handle it sees into a shared counter map.
#[derive(Clone)]
struct CountingExecutor {
    seen: Arc<Mutex<HashMap<u64, u32>>>,
}

#[async_trait]
impl WorkerExecutor<u64, u64> for CountingExecutor {
    async fn execute(&self, payload: u64, ctx: WorkerContext) -> AppResult<u64> {
        *self.seen.lock().entry(ctx.job_id).or_insert(0) += 1;
        Ok(payload)
    }
}

/// Sleeps for the given duration on the worker's own runtime.
#[derive(Clone)]
struct SleepExecutor {
    started: Arc<AtomicUsize>,
}

#[async_trait]
impl WorkerExecutor<Duration, usize> for SleepExecutor {
    async fn execute(&self, payload: Duration, ctx: WorkerContext) -> AppResult<usize> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(payload).await;
        Ok(ctx.worker_id)
    }
}

// ============================================================================
// CORRECTNESS
// ============================================================================

#[test]
fn test_pool_smoke_adds_ten() {
    let pool = WorkerPool::new(
        config(4),
        FnExecutor::new(|n: i64, _ctx: WorkerContext| Ok(n + 10)),
    )
    .unwrap();
    pool.start().unwrap();

    let jobs = (1..=5).map(|i| Job::new(i, i as i64)).collect();
    let results = sorted(pool.submit_batch(jobs).unwrap());

    assert_eq!(results.len(), 5);
    for (i, result) in results.iter().enumerate() {
        assert_eq!(result.job_id, i as u64 + 1);
        assert_eq!(result.output, Ok(i as i64 + 11));
    }
    pool.stop().unwrap();
}

#[test]
fn test_concurrent_batches_are_isolated() {
    let seen = Arc::new(Mutex::new(HashMap::new()));
    let pool = Arc::new(
        WorkerPool::new(
            config(50),
            CountingExecutor {
                seen: Arc::clone(&seen),
            },
        )
        .unwrap(),
    );
    pool.start().unwrap();

    let submit = |range: std::ops::Range<u64>| {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            let jobs: Vec<_> = range.map(|h| Job::new(h, h)).collect();
            pool.submit_batch(jobs).unwrap()
        })
    };
    let batch_a = submit(0..5_000);
    let batch_b = submit(5_000..13_000);

    let results_a = batch_a.join().unwrap();
    let results_b = batch_b.join().unwrap();

    assert_eq!(results_a.len(), 5_000);
    assert_eq!(results_b.len(), 8_000);
    assert!(results_a.iter().all(|r| r.job_id < 5_000 && r.output == Ok(r.job_id)));
    assert!(results_b.iter().all(|r| r.job_id >= 5_000 && r.output == Ok(r.job_id)));

    let seen = seen.lock();
    assert_eq!(seen.len(), 13_000);
    assert!(seen.values().all(|&count| count == 1));
    drop(seen);

    let stats = pool.stats();
    assert_eq!(stats.submitted_batches, 2);
    assert_eq!(stats.in_flight_batches, 0);
    assert_eq!(stats.completed_jobs, 13_000);
    pool.stop().unwrap();
}

#[test]
fn test_parallel_speedup_is_observable() {
    let pool = WorkerPool::new(
        config(4),
        SleepExecutor {
            started: Arc::new(AtomicUsize::new(0)),
        },
    )
    .unwrap();
    pool.start().unwrap();

    let per_job = Duration::from_millis(100);
    let jobs = (0..8).map(|i| Job::new(i, per_job)).collect();

    let start = Instant::now();
    let results = pool.submit_batch(jobs).unwrap();
    let elapsed = start.elapsed();

    assert_eq!(results.len(), 8);
    assert!(results.iter().all(JobResult::is_ok));
    assert!(
        elapsed < per_job * 8,
        "8 jobs on 4 workers took {elapsed:?}"
    );
    pool.stop().unwrap();
}

#[test]
fn test_failed_jobs_fill_error_slot() {
    let pool = WorkerPool::new(
        config(2),
        FnExecutor::new(|n: u32, _ctx: WorkerContext| {
            if n % 2 == 0 {
                anyhow::bail!("even input {n}")
            }
            Ok(n)
        }),
    )
    .unwrap();
    pool.start().unwrap();

    let results = sorted(pool.submit_batch((1..=4).map(|i| Job::new(u64::from(i), i)).collect()).unwrap());
    assert_eq!(results[0].output, Ok(1));
    assert!(matches!(&results[1].output, Err(JobError::Failed(msg)) if msg.contains("even input 2")));
    assert_eq!(results[2].output, Ok(3));
    assert!(results[3].output.is_err());

    let stats = pool.stats();
    assert_eq!(stats.completed_jobs, 2);
    assert_eq!(stats.failed_jobs, 2);
    pool.stop().unwrap();
}

// ============================================================================
// API SURFACE
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_submission() {
    let pool = WorkerPool::new(
        config(2),
        FnExecutor::new(|s: String, ctx: WorkerContext| Ok(format!("{s}-{}", ctx.job_id))),
    )
    .unwrap();
    pool.start().unwrap();

    let jobs = vec![Job::new(1, "a".to_string()), Job::new(2, "b".to_string())];
    let results = sorted(pool.submit_batch_async(jobs).await.unwrap());
    assert_eq!(results[0].output, Ok("a-1".to_string()));
    assert_eq!(results[1].output, Ok("b-2".to_string()));

    assert!(pool.submit_batch_async(Vec::new()).await.unwrap().is_empty());
    pool.stop().unwrap();
}

#[test]
fn test_lifecycle_errors() {
    let pool = WorkerPool::new(config(1), FnExecutor::new(|n: u8, _ctx: WorkerContext| Ok(n))).unwrap();
    assert_eq!(
        pool.submit_batch(vec![Job::new(1, 1)]).unwrap_err(),
        PoolError::NotStarted
    );

    pool.start().unwrap();
    assert_eq!(pool.start().unwrap_err(), PoolError::AlreadyStarted);
    assert_eq!(
        pool.submit_batch(vec![Job::new(1, 1), Job::new(1, 2)]).unwrap_err(),
        PoolError::DuplicateJobId(1)
    );

    pool.stop().unwrap();
    pool.stop().unwrap();
    assert_eq!(
        pool.submit_batch(vec![Job::new(1, 1)]).unwrap_err(),
        PoolError::PoolShutdown
    );
}

#[test]
fn test_invalid_config_is_rejected() {
    let result = WorkerPool::new(config(0), FnExecutor::new(|n: u8, _ctx: WorkerContext| Ok(n)));
    assert!(matches!(result, Err(PoolError::InvalidConfig(_))));
}

// ============================================================================
// FAILURE AND SHUTDOWN
// ============================================================================

#[test]
fn test_panic_is_surfaced() {
    let pool = WorkerPool::new(
        config(2),
        FnExecutor::new(|n: u32, _ctx: WorkerContext| {
            assert!(n != 3, "job three exploded");
            Ok(n)
        }),
    )
    .unwrap();
    pool.start().unwrap();

    let results = sorted(pool.submit_batch((1..=4).map(|i| Job::new(u64::from(i), i)).collect()).unwrap());
    assert_eq!(results.len(), 4);
    assert!(matches!(
        &results[2].output,
        Err(JobError::Panicked { message, .. }) if message.contains("job three exploded")
    ));
    assert_eq!(results[3].output, Ok(4));
    assert_eq!(pool.stats().panicked_jobs, 1);

    assert_eq!(pool.stop().unwrap_err(), PoolError::WorkerPanicked { count: 1 });
}

#[test]
fn test_shutdown_finishes_running_job_and_drains_queue() {
    let started = Arc::new(AtomicUsize::new(0));
    let pool = Arc::new(
        WorkerPool::new(
            config(1),
            SleepExecutor {
                started: Arc::clone(&started),
            },
        )
        .unwrap(),
    );
    pool.start().unwrap();

    let submitter = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            let jobs = (0..3).map(|i| Job::new(i, Duration::from_millis(300))).collect();
            pool.submit_batch(jobs).unwrap()
        })
    };

    while started.load(Ordering::SeqCst) == 0 {
        thread::sleep(Duration::from_millis(5));
    }
    pool.stop().unwrap();

    let results = sorted(submitter.join().unwrap());
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].output, Ok(0));
    assert_eq!(results[1].output, Err(JobError::Shutdown));
    assert_eq!(results[2].output, Err(JobError::Shutdown));
    assert_eq!(started.load(Ordering::SeqCst), 1);

    let stats = pool.stats();
    assert_eq!(stats.abandoned_batches, 1);
    assert_eq!(stats.in_flight_batches, 0);
}
