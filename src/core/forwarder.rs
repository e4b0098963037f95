//! Batch forwarder with watermark commits.
//!
//! [`BatchForwarder`] turns a stream of [`Changeset`]s into size- or time-bounded
//! batches of [`Event`]s, sends each batch to an [`EventSink`], and commits the
//! watermark of the batch's last record only after the sink accepted the batch.
//! This gives at-least-once delivery: after a crash between the sink ack and the
//! commit, the source re-delivers from the last committed watermark.
//!
//! # Flush triggers
//!
//! A buffered batch is flushed when it reaches `batch_size`, when `batch_timeout`
//! elapses after the most recently received record, or when the cancellation token
//! fires. On cancellation the input channel is closed and drained before the final
//! flush. Sink calls are bounded by `send_timeout` and are never cut short by
//! cancellation.
//!
//! # Failed flushes
//!
//! A failed flush is recorded in [`ForwarderStats`] and logged; its watermark is not
//! committed. Later flushes keep forwarding, but no further watermark is committed
//! for the rest of the run, since committing a later watermark would claim the
//! failed records as delivered.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ForwarderConfig;
use crate::core::capacity::{CapacityLeaseRequest, CapacityManager, CapacityResource, LeaseId};
use crate::core::changeset::{Changeset, Watermark};
use crate::core::error::{ForwarderError, SinkError};
use crate::core::event::Event;
use crate::core::txn::TxnUnwrapper;

/// Downstream destination for events.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    /// Deliver a batch of events. The batch is accepted as a whole or not at all.
    async fn send_many(&self, events: Vec<Event>) -> Result<(), SinkError>;
}

/// Persists the position up to which records have been delivered.
///
/// Implementations must be idempotent and must never move backwards.
pub trait WatermarkCommitter: Send + Sync + 'static {
    /// Record that every change with a watermark `<= watermark` was delivered.
    fn commit(&self, watermark: Watermark);
}

/// Snapshot of forwarder activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwarderStats {
    /// Sink calls that succeeded.
    pub flushes: u64,
    /// Sink calls that failed or timed out.
    pub failed_flushes: u64,
    /// Events accepted by the sink.
    pub events_sent: u64,
    /// Last watermark handed to the committer.
    pub last_committed: Option<Watermark>,
    /// Rendered error of the most recent failed flush.
    pub last_error: Option<String>,
}

/// Leases one unit of capacity around every sink call.
#[derive(Clone)]
struct Admission {
    manager: Arc<dyn CapacityManager>,
    resource: CapacityResource,
}

impl Admission {
    const MIN_RETRY: Duration = Duration::from_millis(10);

    async fn acquire(&self, deadline: Instant) -> Result<LeaseId, SinkError> {
        let mut resource = self.resource.clone();
        resource.amount = 1;
        let request = CapacityLeaseRequest::new(vec![resource]);

        loop {
            let response = self
                .manager
                .lease_capacity(request.clone())
                .await
                .map_err(|e| SinkError::Other(e.into()))?;
            if let Some(lease_id) = response.lease_id {
                return Ok(lease_id);
            }

            let wait = response.retry_after.unwrap_or(Self::MIN_RETRY).max(Self::MIN_RETRY);
            if Instant::now() + wait >= deadline {
                return Err(SinkError::CapacityDenied);
            }
            debug!(wait_ms = wait.as_millis(), "flush capacity denied, retrying");
            tokio::time::sleep(wait).await;
        }
    }

    async fn release(&self, lease_id: &LeaseId) {
        if let Err(e) = self.manager.release_capacity(lease_id).await {
            warn!(lease_id = %lease_id, error = %e, "failed to release flush lease");
        }
    }
}

/// Size- and time-bounded batcher forwarding change records to an [`EventSink`].
pub struct BatchForwarder<S: EventSink> {
    config: ForwarderConfig,
    sink: Arc<S>,
    admission: Option<Admission>,
    stats: Arc<Mutex<ForwarderStats>>,
    task: Mutex<Option<JoinHandle<Result<(), ForwarderError>>>>,
}

impl<S: EventSink> BatchForwarder<S> {
    /// Create a forwarder for `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`ForwarderError::InvalidConfig`] when `config` does not validate.
    pub fn new(config: ForwarderConfig, sink: Arc<S>) -> Result<Self, ForwarderError> {
        config.validate().map_err(ForwarderError::InvalidConfig)?;
        Ok(Self {
            config,
            sink,
            admission: None,
            stats: Arc::new(Mutex::new(ForwarderStats::default())),
            task: Mutex::new(None),
        })
    }

    /// Lease one unit of `resource` from `manager` around every sink call.
    #[must_use]
    pub fn with_admission(
        mut self,
        manager: Arc<dyn CapacityManager>,
        resource: CapacityResource,
    ) -> Self {
        self.admission = Some(Admission { manager, resource });
        self
    }

    /// Configuration in use.
    pub const fn config(&self) -> &ForwarderConfig {
        &self.config
    }

    /// Start the background task and return the input channel.
    ///
    /// The channel holds at most `batch_size` records; senders wait when it is full.
    /// The task runs until `cancel` fires or every sender is dropped. Must be called
    /// from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ForwarderError::AlreadyListening`] while a previous task is running.
    pub fn listen(
        &self,
        cancel: CancellationToken,
        committer: Arc<dyn WatermarkCommitter>,
    ) -> Result<mpsc::Sender<Changeset>, ForwarderError> {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(ForwarderError::AlreadyListening);
        }

        let (tx, rx) = mpsc::channel(self.config.batch_size);
        let run = ForwarderTask {
            unwrapper: self.config.unwrap_transactions.then(TxnUnwrapper::new),
            buffer: Vec::with_capacity(self.config.batch_size),
            config: self.config.clone(),
            sink: Arc::clone(&self.sink),
            admission: self.admission.clone(),
            committer,
            stats: Arc::clone(&self.stats),
            last_seen: None,
            commits_stalled: false,
        };

        info!(
            batch_size = self.config.batch_size,
            batch_timeout_ms = self.config.batch_timeout_ms,
            prefix = %self.config.event_prefix,
            "forwarder listening"
        );
        *task = Some(tokio::spawn(run.run(rx, cancel)));
        Ok(tx)
    }

    /// Wait for the background task to finish its final drain.
    ///
    /// Returns immediately when the forwarder is not listening.
    ///
    /// # Errors
    ///
    /// Returns the fatal error that stopped the task, or [`ForwarderError::Task`] if
    /// the task panicked.
    pub async fn wait(&self) -> Result<(), ForwarderError> {
        let handle = self.task.lock().take();
        match handle {
            Some(handle) => handle
                .await
                .map_err(|e| ForwarderError::Task(e.to_string()))?,
            None => Ok(()),
        }
    }

    /// Snapshot of flush statistics.
    pub fn stats(&self) -> ForwarderStats {
        self.stats.lock().clone()
    }
}

/// State owned by the background task.
struct ForwarderTask<S: EventSink> {
    config: ForwarderConfig,
    sink: Arc<S>,
    admission: Option<Admission>,
    committer: Arc<dyn WatermarkCommitter>,
    stats: Arc<Mutex<ForwarderStats>>,
    unwrapper: Option<TxnUnwrapper>,
    buffer: Vec<Changeset>,
    last_seen: Option<Watermark>,
    commits_stalled: bool,
}

impl<S: EventSink> ForwarderTask<S> {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<Changeset>,
        cancel: CancellationToken,
    ) -> Result<(), ForwarderError> {
        let batch_timeout = self.config.batch_timeout();
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    debug!("forwarder cancelled, draining input");
                    rx.close();
                    while let Ok(changeset) = rx.try_recv() {
                        self.ingest(changeset).await?;
                    }
                    break;
                }

                () = async {
                    match deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    deadline = None;
                    self.flush().await;
                }

                received = rx.recv() => {
                    let Some(changeset) = received else {
                        debug!("all forwarder senders dropped");
                        break;
                    };
                    self.ingest(changeset).await?;
                    deadline = Some(Instant::now() + batch_timeout);
                }
            }
        }

        if let Some(unwrapper) = self.unwrapper.as_mut() {
            let held = unwrapper.flush();
            for changeset in held {
                self.push(changeset).await;
            }
        }
        self.flush().await;
        info!(
            last_committed = ?self.stats.lock().last_committed,
            "forwarder stopped"
        );
        Ok(())
    }

    /// Validate ordering, unwrap transactions, and buffer one incoming record.
    async fn ingest(&mut self, changeset: Changeset) -> Result<(), ForwarderError> {
        let received = changeset.watermark;
        if let Some(previous) = self.last_seen {
            if received < previous {
                error!(%previous, %received, "watermark regression on forwarder input");
                return Err(ForwarderError::WatermarkRegression { previous, received });
            }
        }
        self.last_seen = Some(received);

        match self.unwrapper.as_mut() {
            Some(unwrapper) => {
                for ready in unwrapper.process(changeset) {
                    self.push(ready).await;
                }
            }
            None => self.push(changeset).await,
        }
        Ok(())
    }

    async fn push(&mut self, changeset: Changeset) {
        self.buffer.push(changeset);
        if self.buffer.len() >= self.config.batch_size {
            self.flush().await;
        }
    }

    async fn flush(&mut self) {
        let Some(last) = self.buffer.last().map(|changeset| changeset.watermark) else {
            return;
        };
        let batch = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.config.batch_size));
        let count = batch.len();

        let outcome = match batch
            .iter()
            .map(|changeset| Event::from_changeset(&self.config.event_prefix, changeset))
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(events) => self.send(events).await,
            Err(e) => Err(SinkError::Other(e.into())),
        };

        match outcome {
            Ok(()) => {
                let mut stats = self.stats.lock();
                stats.flushes += 1;
                stats.events_sent += count as u64;
                if self.commits_stalled {
                    warn!(lsn = %last, "batch delivered but commits are stalled by an earlier failure");
                } else {
                    self.committer.commit(last);
                    stats.last_committed = Some(last);
                    debug!(batch_size = count, lsn = %last, "batch flushed and committed");
                }
            }
            Err(e) => {
                self.commits_stalled = true;
                let mut stats = self.stats.lock();
                stats.failed_flushes += 1;
                stats.last_error = Some(e.to_string());
                error!(batch_size = count, lsn = %last, error = %e, "batch flush failed");
            }
        }
    }

    /// Send one batch, bounded by the send timeout and detached from cancellation.
    async fn send(&self, events: Vec<Event>) -> Result<(), SinkError> {
        let send_timeout = self.config.send_timeout();
        let deadline = Instant::now() + send_timeout;

        let lease = match &self.admission {
            Some(admission) => Some(admission.acquire(deadline).await?),
            None => None,
        };

        let result = tokio::time::timeout_at(deadline, self.sink.send_many(events))
            .await
            .unwrap_or(Err(SinkError::Timeout(send_timeout)));

        if let (Some(admission), Some(lease_id)) = (&self.admission, lease) {
            admission.release(&lease_id).await;
        }
        result
    }
}
