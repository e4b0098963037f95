//! Job execution traits.

use std::marker::PhantomData;

use async_trait::async_trait;

use super::AppResult;

/// Context handed to an executor alongside each job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerContext {
    /// Index of the worker thread running the job.
    pub worker_id: usize,
    /// Handle of the job, unique within its batch.
    pub job_id: u64,
}

/// Executor trait for worker pools.
///
/// Outputs carry no serialization requirement, so results may hold channels,
/// handles, or other non-serializable values. Returning `Err` fills the job's
/// error slot; the rest of the batch is unaffected.
///
/// # Example
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use durable_relay::core::{AppResult, WorkerContext, WorkerExecutor};
///
/// #[derive(Clone)]
/// struct AddTen;
///
/// #[async_trait]
/// impl WorkerExecutor<i64, i64> for AddTen {
///     async fn execute(&self, payload: i64, _ctx: WorkerContext) -> AppResult<i64> {
///         Ok(payload + 10)
///     }
/// }
/// ```
#[async_trait]
pub trait WorkerExecutor<P, R>: Send + Sync + Clone + 'static
where
    P: Send + 'static,
    R: Send + 'static,
{
    /// Execute a job payload and return its output.
    ///
    /// # Threading
    ///
    /// Called from a dedicated worker thread with its own single-threaded tokio
    /// runtime, so blocking or CPU-heavy work does not stall the caller's runtime.
    /// Implementations must not panic; a panic is treated as a fatal fault.
    async fn execute(&self, payload: P, ctx: WorkerContext) -> AppResult<R>;
}

/// Adapter turning a plain closure into a [`WorkerExecutor`].
pub struct FnExecutor<F, P, R> {
    func: F,
    _marker: PhantomData<fn(P) -> R>,
}

impl<F, P, R> FnExecutor<F, P, R>
where
    F: Fn(P, WorkerContext) -> AppResult<R> + Send + Sync + Clone + 'static,
{
    /// Wrap `func`.
    pub const fn new(func: F) -> Self {
        Self {
            func,
            _marker: PhantomData,
        }
    }
}

impl<F: Clone, P, R> Clone for FnExecutor<F, P, R> {
    fn clone(&self) -> Self {
        Self {
            func: self.func.clone(),
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, P, R> WorkerExecutor<P, R> for FnExecutor<F, P, R>
where
    F: Fn(P, WorkerContext) -> AppResult<R> + Send + Sync + Clone + 'static,
    P: Send + 'static,
    R: Send + 'static,
{
    async fn execute(&self, payload: P, ctx: WorkerContext) -> AppResult<R> {
        (self.func)(payload, ctx)
    }
}
