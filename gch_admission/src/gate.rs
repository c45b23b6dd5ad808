use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::{AdmissionError, AdmissionMetrics, AdmissionPermit};

/// The two-semaphore admission gate shared by the fixed and adaptive
/// limiters.
///
/// The `cap` semaphore carries the hard in-flight limit and is only ever
/// try-acquired: a request finding it empty overflows without queueing.
/// The `ceiling` semaphore carries the (possibly moving) concurrency
/// ceiling; waiters queue on it in FIFO order.
#[derive(Debug)]
pub(crate) struct Gate {
    cap: Arc<Semaphore>,
    ceiling: Arc<Semaphore>,
    /// The ceiling value the gate currently aims for.
    current_ceiling: AtomicUsize,
    shared: Arc<GateShared>,
}

#[derive(Debug)]
pub(crate) struct GateShared {
    /// Ceiling permits that shrinking could not remove because they were
    /// in flight; settled as their holders leave.
    debt: AtomicUsize,
    metrics: AdmissionMetrics,
}

impl Gate {
    pub(crate) fn new(max: usize, ceiling: usize, metrics: AdmissionMetrics) -> Self {
        assert!(max > 0, "a gate needs a non-zero hard cap");
        let ceiling = ceiling.min(max);
        Self {
            cap: Arc::new(Semaphore::new(max)),
            ceiling: Arc::new(Semaphore::new(ceiling)),
            current_ceiling: AtomicUsize::new(ceiling),
            shared: Arc::new(GateShared {
                debt: AtomicUsize::new(0),
                metrics,
            }),
        }
    }

    pub(crate) fn metrics(&self) -> &AdmissionMetrics {
        &self.shared.metrics
    }

    pub(crate) async fn enter(
        &self,
        queue_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<AdmissionPermit, AdmissionError> {
        let t_start = Instant::now();

        let cap_permit = match Arc::clone(&self.cap).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.shared.metrics.overflows.inc(1);
                return Err(AdmissionError::Overflow);
            }
        };

        let mut pending = PendingGuard::new(&self.shared.metrics);
        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AdmissionError::Canceled),
            acquired = tokio::time::timeout(
                queue_timeout,
                Arc::clone(&self.ceiling).acquire_owned(),
            ) => match acquired {
                Ok(Ok(permit)) => Ok(permit),
                // the semaphore is only closed when the limiter shuts down
                Ok(Err(_)) => Err(AdmissionError::Canceled),
                Err(_) => Err(AdmissionError::Timeout),
            },
        };
        self.shared.metrics.acquire_duration.record(t_start.elapsed());

        match acquired {
            Ok(ceiling_permit) => {
                pending.complete();
                self.shared.metrics.in_flight.inc(1);
                Ok(AdmissionPermit {
                    inner: Some(PermitInner {
                        _cap: cap_permit,
                        ceiling: Some(ceiling_permit),
                        shared: Arc::clone(&self.shared),
                    }),
                })
            }
            Err(err) => {
                match err {
                    AdmissionError::Timeout => {
                        pending.complete();
                        self.shared.metrics.timeouts.inc(1);
                    }
                    // leave the guard pending so the drop below counts the
                    // cancellation, the same way a dropped enter future is
                    // counted
                    AdmissionError::Canceled | AdmissionError::Overflow => {}
                }
                Err(err)
            }
        }
    }

    /// Move the ceiling to `target`, growing immediately and shrinking as
    /// in-flight permits return.
    pub(crate) fn set_ceiling(&self, target: usize) {
        let previous = self.current_ceiling.swap(target, Ordering::Relaxed);
        if target > previous {
            let mut grow = target - previous;
            // growth first cancels outstanding shrink debt; those permits
            // are still in circulation and now stay there
            loop {
                let debt = self.shared.debt.load(Ordering::Relaxed);
                let cancel = debt.min(grow);
                if cancel == 0 {
                    break;
                }
                if self
                    .shared
                    .debt
                    .compare_exchange(debt, debt - cancel, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    grow -= cancel;
                    break;
                }
            }
            if grow > 0 {
                self.ceiling.add_permits(grow);
            }
        } else if target < previous {
            let shrink = previous - target;
            let forgotten = self.ceiling.forget_permits(shrink);
            let remainder = shrink - forgotten;
            if remainder > 0 {
                self.shared.debt.fetch_add(remainder, Ordering::Relaxed);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn ceiling_permits_available(&self) -> usize {
        self.ceiling.available_permits()
    }

    #[cfg(test)]
    pub(crate) fn debt(&self) -> usize {
        self.shared.debt.load(Ordering::Relaxed)
    }
}

/// The state an [`AdmissionPermit`] of a gated limiter holds.
#[derive(Debug)]
pub(crate) struct PermitInner {
    /// Held purely so dropping the permit frees a hard-cap slot.
    _cap: OwnedSemaphorePermit,
    ceiling: Option<OwnedSemaphorePermit>,
    shared: Arc<GateShared>,
}

impl Drop for PermitInner {
    fn drop(&mut self) {
        self.shared.metrics.in_flight.dec(1);
        if let Some(ceiling) = self.ceiling.take() {
            // settle one unit of shrink debt instead of returning the slot
            let settled = self
                .shared
                .debt
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |debt| {
                    debt.checked_sub(1)
                })
                .is_ok();
            if settled {
                ceiling.forget();
            }
        }
    }
}

/// Tracks the "waiting for admission" window.
///
/// Dropping the guard before [`complete`](Self::complete) counts as a
/// cancellation, which covers both an explicit cancel and the enter future
/// being dropped mid-wait.
struct PendingGuard<'a> {
    metrics: &'a AdmissionMetrics,
    completed: bool,
}

impl<'a> PendingGuard<'a> {
    fn new(metrics: &'a AdmissionMetrics) -> Self {
        metrics.pending.inc(1);
        Self {
            metrics,
            completed: false,
        }
    }

    fn complete(&mut self) {
        self.completed = true;
        self.metrics.pending.dec(1);
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.metrics.pending.dec(1);
            self.metrics.cancelled_while_pending.inc(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;

    use futures::FutureExt;
    use tokio::pin;

    use super::*;

    fn gate(max: usize, ceiling: usize) -> Gate {
        Gate::new(max, ceiling, AdmissionMetrics::new_unregistered())
    }

    #[tokio::test]
    async fn test_overflow_at_hard_cap() {
        let gate = gate(2, 2);
        let cancel = CancellationToken::new();

        let _p1 = gate.enter(Duration::from_secs(1), &cancel).await.unwrap();
        let _p2 = gate.enter(Duration::from_secs(1), &cancel).await.unwrap();

        // the third request is refused immediately, without queueing
        let err = gate
            .enter(Duration::from_secs(1), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, AdmissionError::Overflow);
        assert_eq!(gate.metrics().overflows.fetch(), 1);
        assert_eq!(gate.metrics().pending.fetch(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_timeout() {
        let gate = gate(2, 1);
        let cancel = CancellationToken::new();

        let _p1 = gate.enter(Duration::from_secs(60), &cancel).await.unwrap();

        // below the cap but above the ceiling: waits, then times out
        let err = gate
            .enter(Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, AdmissionError::Timeout);
        assert_eq!(gate.metrics().timeouts.fetch(), 1);
        assert_eq!(gate.metrics().pending.fetch(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_while_waiting() {
        let gate = Arc::new(gate(2, 1));
        let cancel = CancellationToken::new();

        let _p1 = gate.enter(Duration::from_secs(60), &cancel).await.unwrap();

        let waiter = {
            let gate = Arc::clone(&gate);
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.enter(Duration::from_secs(60), &cancel).await })
        };
        tokio::task::yield_now().await;

        cancel.cancel();
        assert_eq!(waiter.await.unwrap().unwrap_err(), AdmissionError::Canceled);
        assert_eq!(gate.metrics().cancelled_while_pending.fetch(), 1);
        assert_eq!(gate.metrics().pending.fetch(), 0);
    }

    #[tokio::test]
    async fn test_fifo_admission_on_leave() {
        let gate = Arc::new(gate(4, 1));
        let cancel = CancellationToken::new();

        let p1 = gate.enter(Duration::from_secs(60), &cancel).await.unwrap();

        let fut = gate.enter(Duration::from_secs(60), &cancel);
        pin!(fut);
        assert_fut_pending(&mut fut).await;

        drop(p1);
        let _p2 = fut.await.unwrap();
        assert_eq!(gate.metrics().in_flight.fetch(), 1);
    }

    #[tokio::test]
    async fn test_dropped_enter_counts_as_cancelled() {
        let gate = gate(4, 1);
        let cancel = CancellationToken::new();

        let _p1 = gate.enter(Duration::from_secs(60), &cancel).await.unwrap();
        {
            let fut = gate.enter(Duration::from_secs(60), &cancel);
            pin!(fut);
            assert_fut_pending(&mut fut).await;
            // `fut` is dropped here
        }
        assert_eq!(gate.metrics().cancelled_while_pending.fetch(), 1);
        assert_eq!(gate.metrics().pending.fetch(), 0);
    }

    #[tokio::test]
    async fn test_shrink_settles_as_permits_return() {
        let gate = Arc::new(gate(8, 4));
        let cancel = CancellationToken::new();

        let permits: Vec<_> = futures::future::join_all(
            (0..4).map(|_| gate.enter(Duration::from_secs(60), &cancel)),
        )
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

        // all four slots are in flight; shrinking to 1 leaves a debt of 3
        gate.set_ceiling(1);
        assert_eq!(gate.debt(), 3);
        assert_eq!(gate.ceiling_permits_available(), 0);

        // each leave settles one unit of debt instead of freeing a slot
        for permit in permits {
            drop(permit);
        }
        assert_eq!(gate.debt(), 0);
        assert_eq!(gate.ceiling_permits_available(), 1);

        // growing back makes the slots available again
        gate.set_ceiling(4);
        assert_eq!(gate.ceiling_permits_available(), 4);
    }

    #[tokio::test]
    async fn test_grow_cancels_debt() {
        let gate = Arc::new(gate(8, 4));
        let cancel = CancellationToken::new();

        let permits: Vec<_> = futures::future::join_all(
            (0..4).map(|_| gate.enter(Duration::from_secs(60), &cancel)),
        )
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

        gate.set_ceiling(1);
        assert_eq!(gate.debt(), 3);

        // growing while the debt is outstanding cancels it first
        gate.set_ceiling(4);
        assert_eq!(gate.debt(), 0);

        for permit in permits {
            drop(permit);
        }
        assert_eq!(gate.ceiling_permits_available(), 4);
    }

    /// Assert that the given future does not complete yet.
    async fn assert_fut_pending<F>(fut: &mut F)
    where
        F: Future + Send + Unpin,
    {
        futures::select_biased! {
            _ = fut.fuse() => panic!("future is not pending"),
            _ = tokio::task::yield_now().fuse() => {}
        }
    }
}
