//! Native implementation of `WorkerPool` using OS threads.
//!
//! Workers are dedicated OS threads that each own a single-threaded tokio runtime,
//! so executor work never blocks the caller's async runtime.
//!
//! # Design Principles
//!
//! - **No polling**: workers block on the job queue and the shutdown channel
//! - **One scheduler**: a single thread serializes batch intake
//! - **One collector per batch**: results flow through a private channel that is
//!   dropped once the batch's result vector is assembled

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::config::WorkerPoolConfig;
use crate::core::executor::{WorkerContext, WorkerExecutor};
use crate::core::JobError;

use super::{BatchState, Job, JobResult, PoolCounters, PoolError, PoolStats};

/// A batch on its way to the scheduler.
struct BatchRequest<P, R> {
    batch_id: u64,
    jobs: Vec<Job<P>>,
    reply: oneshot::Sender<Vec<JobResult<R>>>,
}

/// A job on the shared queue, carrying its batch's completion channel.
struct QueuedJob<P, R> {
    job: Job<P>,
    done: Sender<JobResult<R>>,
}

impl<P, R> QueuedJob<P, R> {
    /// Complete the job without running it.
    fn abandon(self, counters: &PoolCounters) {
        let result = JobResult {
            job_id: self.job.id,
            output: Err(JobError::Shutdown),
        };
        counters.record_outcome(&result);
        // The collector only disappears if its caller gave up; nothing to report then.
        let _ = self.done.send(result);
    }
}

/// Handles owned while the pool is running.
struct Running<P, R> {
    batch_tx: Sender<BatchRequest<P, R>>,
    shutdown_tx: Sender<()>,
    job_rx: Receiver<QueuedJob<P, R>>,
    scheduler: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

enum Lifecycle<P, R> {
    Idle,
    Running(Running<P, R>),
    Stopped,
}

/// Worker pool with dedicated OS threads and per-batch result collation.
///
/// # Design
///
/// - **Batch isolation**: each batch owns a private completion channel
/// - **Clean shutdown**: in-flight jobs finish, queued jobs drain to errors
/// - **Lock-free fast path**: atomic counters; the lifecycle lock is held only to
///   clone the intake sender
pub struct WorkerPool<P, R, E>
where
    P: Send + 'static,
    R: Send + 'static,
    E: WorkerExecutor<P, R>,
{
    /// Pool configuration.
    config: WorkerPoolConfig,

    /// Executor cloned into every worker.
    executor: E,

    /// Lifecycle state and thread handles.
    lifecycle: Mutex<Lifecycle<P, R>>,

    /// Pool statistics counters (lock-free atomics).
    counters: Arc<PoolCounters>,

    /// Shutdown flag observed by workers between jobs.
    shutdown: Arc<AtomicBool>,

    /// Batch ID counter, used for log correlation.
    batch_id_counter: AtomicU64,
}

impl<P, R, E> WorkerPool<P, R, E>
where
    P: Send + 'static,
    R: Send + 'static,
    E: WorkerExecutor<P, R>,
{
    /// Create a new worker pool with the given configuration and executor.
    ///
    /// No threads are spawned until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidConfig` if the configuration is invalid.
    pub fn new(config: WorkerPoolConfig, executor: E) -> Result<Self, PoolError> {
        config.validate().map_err(PoolError::InvalidConfig)?;

        Ok(Self {
            config,
            executor,
            lifecycle: Mutex::new(Lifecycle::Idle),
            counters: Arc::new(PoolCounters::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
            batch_id_counter: AtomicU64::new(0),
        })
    }

    /// Spawn the worker threads and the scheduler.
    ///
    /// # Errors
    ///
    /// - `PoolError::AlreadyStarted` if called more than once
    /// - `PoolError::Internal` if a runtime or thread cannot be created
    pub fn start(&self) -> Result<(), PoolError> {
        let mut lifecycle = self.lifecycle.lock();
        if !matches!(*lifecycle, Lifecycle::Idle) {
            return Err(PoolError::AlreadyStarted);
        }

        let (batch_tx, batch_rx) = unbounded::<BatchRequest<P, R>>();
        let (job_tx, job_rx) = unbounded::<QueuedJob<P, R>>();
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        let mut workers = Vec::with_capacity(self.config.worker_count);
        for worker_id in 0..self.config.worker_count {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| PoolError::Internal(format!("worker runtime: {e}")))?;

            let worker = Worker {
                id: worker_id,
                job_rx: job_rx.clone(),
                shutdown_rx: shutdown_rx.clone(),
                shutdown: Arc::clone(&self.shutdown),
                counters: Arc::clone(&self.counters),
                executor: self.executor.clone(),
                runtime,
            };

            let handle = thread::Builder::new()
                .name(format!("relay-worker-{worker_id}"))
                .stack_size(self.config.thread_stack_size)
                .spawn(move || worker.run())
                .map_err(|e| PoolError::Internal(format!("spawn worker {worker_id}: {e}")))?;
            workers.push(handle);
        }

        let scheduler = Scheduler {
            batch_rx,
            job_tx,
            counters: Arc::clone(&self.counters),
        };
        let scheduler = thread::Builder::new()
            .name("relay-scheduler".into())
            .spawn(move || scheduler.run())
            .map_err(|e| PoolError::Internal(format!("spawn scheduler: {e}")))?;

        *lifecycle = Lifecycle::Running(Running {
            batch_tx,
            shutdown_tx,
            job_rx,
            scheduler,
            workers,
        });

        info!(
            worker_count = self.config.worker_count,
            "WorkerPool started with dedicated OS threads"
        );
        Ok(())
    }

    /// Submit a batch and block until every job has produced a result.
    ///
    /// The returned vector has one entry per job; its order is unspecified, so
    /// callers that need job order must sort by `job_id`. An empty batch returns an
    /// empty vector without touching the workers.
    ///
    /// # Panics
    ///
    /// Panics if called from within an async execution context; use
    /// [`submit_batch_async`](Self::submit_batch_async) there.
    ///
    /// # Errors
    ///
    /// - `PoolError::NotStarted` before `start()`
    /// - `PoolError::PoolShutdown` after `stop()`
    /// - `PoolError::DuplicateJobId` if two jobs share a handle
    pub fn submit_batch(&self, jobs: Vec<Job<P>>) -> Result<Vec<JobResult<R>>, PoolError> {
        match self.dispatch(jobs)? {
            Some(reply) => reply
                .blocking_recv()
                .map_err(|_| PoolError::Internal("batch collector dropped its reply".into())),
            None => Ok(Vec::new()),
        }
    }

    /// Submit a batch and wait asynchronously for its results.
    ///
    /// # Errors
    ///
    /// Same as [`submit_batch`](Self::submit_batch).
    pub async fn submit_batch_async(
        &self,
        jobs: Vec<Job<P>>,
    ) -> Result<Vec<JobResult<R>>, PoolError> {
        match self.dispatch(jobs)? {
            Some(reply) => reply
                .await
                .map_err(|_| PoolError::Internal("batch collector dropped its reply".into())),
            None => Ok(Vec::new()),
        }
    }

    /// Hand a batch to the scheduler; `None` means the batch was empty.
    fn dispatch(
        &self,
        jobs: Vec<Job<P>>,
    ) -> Result<Option<oneshot::Receiver<Vec<JobResult<R>>>>, PoolError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(PoolError::PoolShutdown);
        }

        let batch_tx = match &*self.lifecycle.lock() {
            Lifecycle::Idle => return Err(PoolError::NotStarted),
            Lifecycle::Stopped => return Err(PoolError::PoolShutdown),
            Lifecycle::Running(running) => running.batch_tx.clone(),
        };

        if jobs.is_empty() {
            return Ok(None);
        }

        let mut seen = HashSet::with_capacity(jobs.len());
        if let Some(dup) = jobs.iter().find(|job| !seen.insert(job.id)) {
            return Err(PoolError::DuplicateJobId(dup.id));
        }

        let batch_id = self.batch_id_counter.fetch_add(1, Ordering::Relaxed);
        let (reply, reply_rx) = oneshot::channel();
        let size = jobs.len();

        // Counted before the send so the collector's decrement can never run first.
        self.counters.in_flight_batches.fetch_add(1, Ordering::Relaxed);
        if batch_tx
            .send(BatchRequest {
                batch_id,
                jobs,
                reply,
            })
            .is_err()
        {
            self.counters.in_flight_batches.fetch_sub(1, Ordering::Relaxed);
            return Err(PoolError::PoolShutdown);
        }

        self.counters.submitted_batches.fetch_add(1, Ordering::Relaxed);
        debug!(batch_id, size, "Batch submitted to worker pool");
        Ok(Some(reply_rx))
    }

    /// Get current pool statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot(self.config.worker_count)
    }

    /// Shut the pool down and wait for every worker to exit.
    ///
    /// Intake closes first, then the scheduler finishes enqueuing what it already
    /// accepted, then workers exit after their current job. Anything left in the
    /// queue completes with `JobError::Shutdown`. Calling `stop` again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::WorkerPanicked` if any job panicked during the pool's
    /// lifetime, and `PoolError::Internal` if a pool thread itself panicked.
    pub fn stop(&self) -> Result<(), PoolError> {
        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Stopped);
        self.shutdown.store(true, Ordering::Release);

        let Lifecycle::Running(running) = previous else {
            return Ok(());
        };

        info!("Shutting down worker pool");

        let Running {
            batch_tx,
            shutdown_tx,
            job_rx,
            scheduler,
            workers,
        } = running;

        // Closing intake lets the scheduler drain accepted batches and exit.
        drop(batch_tx);
        let mut thread_failures = 0usize;
        if scheduler.join().is_err() {
            error!("Scheduler thread panicked");
            thread_failures += 1;
        }

        // Wakes idle workers blocked in select.
        drop(shutdown_tx);
        let worker_count = workers.len();
        for (idx, worker) in workers.into_iter().enumerate() {
            if worker.join().is_err() {
                error!(worker_id = idx, "Worker thread panicked");
                thread_failures += 1;
            } else {
                debug!(worker_id = idx, "Worker joined successfully");
            }
        }

        let mut drained = 0u64;
        while let Ok(queued) = job_rx.try_recv() {
            self.counters.queued_jobs.fetch_sub(1, Ordering::Relaxed);
            queued.abandon(&self.counters);
            drained += 1;
        }
        if drained > 0 {
            warn!(drained, "Queued jobs abandoned on shutdown");
        }

        info!(worker_count, "Worker pool shut down complete");

        if thread_failures > 0 {
            return Err(PoolError::Internal(format!(
                "{thread_failures} pool thread(s) panicked"
            )));
        }
        let panicked = self.counters.panicked_jobs.load(Ordering::Relaxed);
        if panicked > 0 {
            return Err(PoolError::WorkerPanicked { count: panicked });
        }
        Ok(())
    }
}

impl<P, R, E> Drop for WorkerPool<P, R, E>
where
    P: Send + 'static,
    R: Send + 'static,
    E: WorkerExecutor<P, R>,
{
    fn drop(&mut self) {
        // Signal shutdown but DON'T join threads in Drop; explicit stop() is
        // required for graceful cleanup.
        self.shutdown.store(true, Ordering::Release);
        let previous = std::mem::replace(self.lifecycle.get_mut(), Lifecycle::Stopped);
        if matches!(previous, Lifecycle::Running(_)) {
            debug!("WorkerPool dropped without explicit stop - threads will be detached");
        }
    }
}

/// Serializes batch intake and fans jobs out to the shared queue.
struct Scheduler<P, R> {
    batch_rx: Receiver<BatchRequest<P, R>>,
    job_tx: Sender<QueuedJob<P, R>>,
    counters: Arc<PoolCounters>,
}

impl<P, R> Scheduler<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    fn run(self) {
        debug!("Scheduler thread started");

        // Returns Err once every intake sender is gone and the channel is empty.
        while let Ok(request) = self.batch_rx.recv() {
            self.schedule(request);
        }

        debug!("Scheduler thread exiting");
    }

    fn schedule(&self, request: BatchRequest<P, R>) {
        let BatchRequest {
            batch_id,
            jobs,
            reply,
        } = request;
        let size = jobs.len();
        debug!(batch_id, size, state = %BatchState::Accepted, "Scheduling batch");

        let (done_tx, done_rx) = bounded::<JobResult<R>>(size);
        let counters = Arc::clone(&self.counters);
        let collector = thread::Builder::new()
            .name(format!("relay-collector-{batch_id}"))
            .spawn(move || collect(batch_id, size, &done_rx, reply, &counters));

        if let Err(e) = collector {
            // The reply sender went down with the closure; the caller sees Internal.
            error!(batch_id, error = %e, "Failed to spawn batch collector");
            self.counters.in_flight_batches.fetch_sub(1, Ordering::Relaxed);
            return;
        }

        for job in jobs {
            let queued = QueuedJob {
                job,
                done: done_tx.clone(),
            };
            self.counters.queued_jobs.fetch_add(1, Ordering::Relaxed);
            if let Err(returned) = self.job_tx.send(queued) {
                // Every worker receiver is gone only if the pool was torn down.
                self.counters.queued_jobs.fetch_sub(1, Ordering::Relaxed);
                returned.into_inner().abandon(&self.counters);
            }
        }

        debug!(batch_id, state = %BatchState::JobsEnqueued, "Batch enqueued");
    }
}

/// Gather `size` results for one batch and hand them to the caller.
fn collect<R>(
    batch_id: u64,
    size: usize,
    done_rx: &Receiver<JobResult<R>>,
    reply: oneshot::Sender<Vec<JobResult<R>>>,
    counters: &PoolCounters,
) {
    debug!(batch_id, state = %BatchState::Collecting, "Collecting batch results");

    let mut results = Vec::with_capacity(size);
    while results.len() < size {
        match done_rx.recv() {
            Ok(result) => results.push(result),
            Err(_) => {
                error!(
                    batch_id,
                    expected = size,
                    received = results.len(),
                    "Batch completion channel closed early"
                );
                break;
            }
        }
    }

    let state = if results
        .iter()
        .any(|r| matches!(r.output, Err(JobError::Shutdown)))
    {
        counters.abandoned_batches.fetch_add(1, Ordering::Relaxed);
        BatchState::AbandonedOnShutdown
    } else {
        BatchState::Delivered
    };
    counters.in_flight_batches.fetch_sub(1, Ordering::Relaxed);

    if reply.send(results).is_err() {
        warn!(batch_id, "Batch caller went away before results were delivered");
    }
    debug!(batch_id, state = %state, "Batch finished");
}

/// One worker thread's state.
struct Worker<P, R, E> {
    id: usize,
    job_rx: Receiver<QueuedJob<P, R>>,
    shutdown_rx: Receiver<()>,
    shutdown: Arc<AtomicBool>,
    counters: Arc<PoolCounters>,
    executor: E,
    runtime: tokio::runtime::Runtime,
}

impl<P, R, E> Worker<P, R, E>
where
    P: Send + 'static,
    R: Send + 'static,
    E: WorkerExecutor<P, R>,
{
    fn run(self) {
        let worker_id = self.id;
        debug!(worker_id, "Worker thread started");

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                debug!(worker_id, "Worker observed shutdown, exiting");
                break;
            }

            let queued = select! {
                recv(self.job_rx) -> msg => match msg {
                    Ok(queued) => queued,
                    Err(_) => break,
                },
                recv(self.shutdown_rx) -> _ => {
                    debug!(worker_id, "Worker shutdown channel closed, exiting");
                    break;
                }
            };
            self.counters.queued_jobs.fetch_sub(1, Ordering::Relaxed);

            if self.shutdown.load(Ordering::Acquire) {
                queued.abandon(&self.counters);
                break;
            }

            self.execute(queued);
        }

        debug!(worker_id, "Worker thread exiting");
    }

    fn execute(&self, queued: QueuedJob<P, R>) {
        let QueuedJob { job, done } = queued;
        let ctx = WorkerContext {
            worker_id: self.id,
            job_id: job.id,
        };

        self.counters.active_jobs.fetch_add(1, Ordering::Relaxed);
        debug!(worker_id = self.id, job_id = job.id, "Worker executing job");

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.runtime
                .block_on(self.executor.execute(job.payload, ctx))
        }));

        let output = match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(JobError::Failed(format!("{e:#}"))),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(
                    worker_id = self.id,
                    job_id = job.id,
                    panic = %message,
                    "Executor panicked; this is a fatal fault"
                );
                Err(JobError::Panicked {
                    worker_id: self.id,
                    message,
                })
            }
        };

        self.counters.active_jobs.fetch_sub(1, Ordering::Relaxed);
        let result = JobResult {
            job_id: job.id,
            output,
        };
        self.counters.record_outcome(&result);
        if done.send(result).is_err() {
            warn!(worker_id = self.id, job_id = job.id, "Batch collector is gone");
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
