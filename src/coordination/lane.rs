use super::{EntityGate, OperationQueue, QueuedOperation, RetryController};
use crate::core::{CoordError, Entity, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info_span, warn};

/// Counters for one drain cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Operations routed through the retry controller.
    pub processed: usize,
    pub applied: usize,
    /// Operations completed with an error.
    pub failed: usize,
    /// Transient failures put back at the tail for one more try.
    pub requeued: usize,
    /// Operations skipped because nobody awaited them anymore.
    pub abandoned: usize,
}

/// Everything the coordination layer keeps per entity kind: the queue, the
/// gate shared with every repository of the kind, and the retry controller
/// that owns the kind's conflict resolver.
pub struct EntityLane<E: Entity> {
    queue: OperationQueue<E>,
    gate: Arc<EntityGate>,
    retry: RetryController<E>,
    lock_timeout: Duration,
    auto_drain: bool,
    scheduled: AtomicBool,
}

impl<E: Entity> EntityLane<E> {
    pub fn new(
        gate: Arc<EntityGate>,
        retry: RetryController<E>,
        lock_timeout: Duration,
        auto_drain: bool,
    ) -> Self {
        Self {
            queue: OperationQueue::new(),
            gate,
            retry,
            lock_timeout,
            auto_drain,
            scheduled: AtomicBool::new(false),
        }
    }

    pub fn gate(&self) -> &Arc<EntityGate> {
        &self.gate
    }

    pub fn retry(&self) -> &RetryController<E> {
        &self.retry
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Appends to the tail; with `schedule` set, also kicks a background drain.
    pub fn push(self: &Arc<Self>, op: QueuedOperation<E>, schedule: bool) {
        self.queue.enqueue(op);
        if schedule {
            self.schedule();
        }
    }

    /// Spawns a background drain unless one is already pending.
    pub fn schedule(self: &Arc<Self>) {
        if !self.auto_drain || self.scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.scheduled.store(false, Ordering::SeqCst);
            debug!(kind = E::KIND, "no runtime, background drain skipped");
            return;
        };
        let lane = Arc::clone(self);
        runtime.spawn(async move {
            if let Err(err) = lane.drain(&CancellationToken::new()).await {
                lane.scheduled.store(false, Ordering::SeqCst);
                let failed = lane.fail_queued(&err);
                error!(kind = E::KIND, error = %err, failed, "background drain failed");
            }
        });
    }

    /// Completes every waiting operation with `err` and empties the queue.
    ///
    /// Returns how many tickets were resolved.
    pub(crate) fn fail_queued(&self, err: &CoordError) -> usize {
        let mut failed = 0;
        while let Some(op) = self.queue.try_dequeue() {
            if op.is_abandoned() {
                debug!(kind = E::KIND, key = %op.store_key(), "skipping abandoned operation");
                continue;
            }
            op.complete(Err(replay(err)));
            failed += 1;
        }
        failed
    }

    /// Runs one drain cycle under the kind's gate.
    ///
    /// Every operation dequeued here is completed before the gate is released,
    /// except transient failures seen for the first time, which go back to the
    /// tail of the queue.
    pub async fn drain(self: &Arc<Self>, cancel: &CancellationToken) -> Result<DrainReport> {
        let permit = self.gate.acquire(self.lock_timeout, cancel).await?;
        self.scheduled.store(false, Ordering::SeqCst);

        let report = self
            .drain_queued()
            .instrument(info_span!("drain", kind = E::KIND))
            .await;

        debug!(
            kind = E::KIND,
            held_ms = u64::try_from(permit.held_for().as_millis()).unwrap_or(u64::MAX),
            processed = report.processed,
            requeued = report.requeued,
            "drain cycle finished"
        );
        drop(permit);

        if report.requeued > 0 {
            self.schedule();
        }
        Ok(report)
    }

    async fn drain_queued(&self) -> DrainReport {
        let mut report = DrainReport::default();
        let mut failed = Vec::new();

        while let Some(op) = self.queue.try_dequeue() {
            if op.is_abandoned() {
                debug!(kind = E::KIND, key = %op.store_key(), "skipping abandoned operation");
                report.abandoned += 1;
                continue;
            }
            report.processed += 1;

            match self.retry.execute(&op).await {
                Ok(outcome) => {
                    report.applied += 1;
                    op.complete(Ok(outcome));
                }
                Err(err) if err.is_transient() && !op.is_requeued() => {
                    warn!(
                        kind = E::KIND,
                        key = %op.store_key(),
                        error = %err,
                        "transient failure, requeueing once"
                    );
                    failed.push(op.into_requeued());
                }
                Err(err) => {
                    if err.is_transient() {
                        error!(
                            kind = E::KIND,
                            key = %op.store_key(),
                            error = %err,
                            "transient failure after requeue, dropping operation"
                        );
                    }
                    report.failed += 1;
                    op.complete(Err(err));
                }
            }
        }

        report.requeued = failed.len();
        for op in failed {
            self.queue.enqueue(op);
        }
        report
    }
}

/// Rebuilds a drain-level failure for each queued ticket.
fn replay(err: &CoordError) -> CoordError {
    match err {
        CoordError::LockTimeout { kind, waited } => CoordError::LockTimeout {
            kind: kind.clone(),
            waited: *waited,
        },
        CoordError::Cancelled { kind } => CoordError::Cancelled { kind: kind.clone() },
        other => CoordError::Internal(other.to_string()),
    }
}
