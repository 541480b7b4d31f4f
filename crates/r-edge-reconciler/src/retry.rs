//! ---
//! ems_section: "04-configuration-orchestration"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Workload lifecycle reconciliation against an orchestration backend."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Cancellable start attempt loops.
//!
//! An attempt runs on its own tokio task and calls
//! [`OrchestrationBackend::start`] until it succeeds, is cancelled, or runs out of
//! retry budget. Cancellation is cooperative: it is observed before each call and
//! while sleeping between calls, never in the middle of a backend call. A start
//! that completes after cancellation is dropped without a report.
//!
//! Attempts spawned by one [`RetryScheduler`] run strictly one after another: a
//! new attempt waits for its predecessor's task to exit before its first call, so
//! a cancelled start still in flight can never overlap or outlive a newer one.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use r_edge_workload::WorkloadDescriptor;
use tokio::sync::{mpsc, watch};
use tokio::task::{yield_now, JoinHandle};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::backend::{OrchestrationBackend, WorkloadHandle};
use crate::metrics::ReconcilerMetrics;

/// Message sent by an attempt back to its reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptReport {
    /// The backend started the workload.
    Ready {
        /// Attempt generation.
        generation: u64,
        /// Handle of the started instance.
        handle: WorkloadHandle,
        /// Start calls made, including the successful one.
        attempts: u32,
    },
    /// One start call failed and another may follow.
    AttemptFailed {
        /// Attempt generation.
        generation: u64,
        /// Number of failed calls so far.
        attempt: u32,
    },
    /// The retry budget ran out.
    Exhausted {
        /// Attempt generation.
        generation: u64,
        /// Start calls made.
        attempts: u32,
    },
}

/// Spawns attempt loops for one workload identity and tracks how many are alive.
#[derive(Debug, Default)]
pub struct RetryScheduler {
    live: Arc<AtomicUsize>,
    metrics: Option<ReconcilerMetrics>,
    last: Option<JoinHandle<()>>,
}

impl RetryScheduler {
    /// Create a scheduler with an optional metrics handle.
    pub fn new(metrics: Option<ReconcilerMetrics>) -> Self {
        Self {
            live: Arc::new(AtomicUsize::new(0)),
            metrics,
            last: None,
        }
    }

    /// Number of attempt tasks that have not finished yet.
    pub fn live_attempts(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Queue an attempt loop for `descriptor`, reporting under `generation`.
    ///
    /// The loop makes its first call only once the previously spawned attempt has
    /// exited.
    pub fn spawn(
        &mut self,
        generation: u64,
        descriptor: Arc<WorkloadDescriptor>,
        backend: Arc<dyn OrchestrationBackend>,
        reports: mpsc::UnboundedSender<AttemptReport>,
    ) -> AttemptHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.live.fetch_add(1, Ordering::SeqCst);
        let guard = LiveGuard(self.live.clone());
        let attempt = Attempt {
            generation,
            descriptor,
            backend,
            reports,
            cancel: cancel_rx,
            metrics: self.metrics.clone(),
        };
        let predecessor = self.last.take();
        self.last = Some(tokio::spawn(async move {
            let _guard = guard;
            if let Some(predecessor) = predecessor {
                if let Err(err) = predecessor.await {
                    warn!(generation, error = %err, "previous start attempt ended abnormally");
                }
            }
            attempt.run().await;
        }));
        AttemptHandle {
            generation,
            cancel: cancel_tx,
        }
    }
}

/// Ownership of one running attempt loop. Dropping it cancels the loop.
#[derive(Debug)]
pub struct AttemptHandle {
    generation: u64,
    cancel: watch::Sender<bool>,
}

impl AttemptHandle {
    /// Generation the attempt reports under.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Ask the loop to stop at its next cancellation point.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }
}

impl Drop for AttemptHandle {
    fn drop(&mut self) {
        self.cancel.send_replace(true);
    }
}

struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Attempt {
    generation: u64,
    descriptor: Arc<WorkloadDescriptor>,
    backend: Arc<dyn OrchestrationBackend>,
    reports: mpsc::UnboundedSender<AttemptReport>,
    cancel: watch::Receiver<bool>,
    metrics: Option<ReconcilerMetrics>,
}

impl Attempt {
    async fn run(mut self) {
        let workload = self.descriptor.name().to_owned();
        let generation = self.generation;
        let policy = self.descriptor.retry_policy();
        let mut attempts: u32 = 0;

        loop {
            if self.is_cancelled() {
                debug!(workload = %workload, generation, "start attempt cancelled");
                return;
            }
            if !policy.allows_attempt(attempts) {
                break;
            }
            if attempts > 0 {
                let interval = policy.retry_interval();
                if interval.is_zero() {
                    // Back-to-back retries still hand the worker back between calls.
                    yield_now().await;
                } else {
                    tokio::select! {
                        _ = sleep(interval) => {}
                        _ = wait_for_cancel(&mut self.cancel) => {
                            debug!(workload = %workload, generation, "start attempt cancelled while waiting to retry");
                            return;
                        }
                    }
                }
                if self.is_cancelled() {
                    debug!(workload = %workload, generation, "start attempt cancelled");
                    return;
                }
            }

            attempts += 1;
            let result = self.backend.start(&self.descriptor).await;
            if let Some(metrics) = &self.metrics {
                metrics.record_start_attempt(&workload, result.is_ok());
            }
            if self.is_cancelled() {
                debug!(
                    workload = %workload,
                    generation,
                    attempt = attempts,
                    "discarding start result of a cancelled attempt",
                );
                return;
            }

            match result {
                Ok(handle) => {
                    info!(workload = %workload, handle = %handle, attempt = attempts, "workload started");
                    let _ = self.reports.send(AttemptReport::Ready {
                        generation,
                        handle,
                        attempts,
                    });
                    return;
                }
                Err(err) => {
                    warn!(workload = %workload, attempt = attempts, error = %err, "workload start attempt failed");
                    let _ = self.reports.send(AttemptReport::AttemptFailed {
                        generation,
                        attempt: attempts,
                    });
                }
            }
        }

        let _ = self.reports.send(AttemptReport::Exhausted {
            generation,
            attempts,
        });
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

/// Resolves once cancellation is requested or the handle is gone.
async fn wait_for_cancel(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|cancelled| *cancelled).await;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::time::timeout;

    use super::*;
    use crate::backend::BackendError;

    #[derive(Debug, Default)]
    struct ScriptedBackend {
        failures: usize,
        first_call_latency: Duration,
        starts: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedBackend {
        fn failing(failures: usize) -> Self {
            Self {
                failures,
                ..Default::default()
            }
        }

        fn slow_first_call(latency: Duration) -> Self {
            Self {
                first_call_latency: latency,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl OrchestrationBackend for ScriptedBackend {
        async fn start(
            &self,
            descriptor: &WorkloadDescriptor,
        ) -> Result<WorkloadHandle, BackendError> {
            let call = self.starts.fetch_add(1, Ordering::SeqCst);
            let overlapping = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(overlapping, Ordering::SeqCst);
            if call == 0 && !self.first_call_latency.is_zero() {
                tokio::time::sleep(self.first_call_latency).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if call < self.failures {
                Err(BackendError::StartFailed {
                    workload: descriptor.name().to_owned(),
                    reason: "scripted".into(),
                })
            } else {
                Ok(WorkloadHandle::new(format!("c{call}"), descriptor.name()))
            }
        }

        async fn stop(&self, _handle: &WorkloadHandle) -> Result<(), BackendError> {
            Ok(())
        }

        async fn delete(&self, _handle: &WorkloadHandle) -> Result<(), BackendError> {
            Ok(())
        }

        async fn list_existing(&self) -> Result<Vec<WorkloadHandle>, BackendError> {
            Ok(Vec::new())
        }
    }

    fn descriptor(max_retries: u32, interval: Duration) -> Arc<WorkloadDescriptor> {
        Arc::new(
            WorkloadDescriptor::builder("modbus-bridge", "bridge")
                .enabled(true)
                .max_retries(max_retries)
                .retry_interval(interval)
                .build(),
        )
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<AttemptReport>) -> AttemptReport {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("report in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn reports_every_failure_then_readiness() {
        let backend = Arc::new(ScriptedBackend::failing(2));
        let mut scheduler = RetryScheduler::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _attempt = scheduler.spawn(7, descriptor(0, Duration::ZERO), backend.clone(), tx);

        assert_eq!(
            next(&mut rx).await,
            AttemptReport::AttemptFailed {
                generation: 7,
                attempt: 1
            }
        );
        assert_eq!(
            next(&mut rx).await,
            AttemptReport::AttemptFailed {
                generation: 7,
                attempt: 2
            }
        );
        match next(&mut rx).await {
            AttemptReport::Ready {
                generation,
                attempts,
                handle,
            } => {
                assert_eq!(generation, 7);
                assert_eq!(attempts, 3);
                assert_eq!(handle.name, "modbus-bridge");
            }
            other => panic!("unexpected report {other:?}"),
        }
        assert_eq!(backend.starts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn bounded_budget_reports_exhaustion_once() {
        let backend = Arc::new(ScriptedBackend::failing(usize::MAX));
        let mut scheduler = RetryScheduler::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _attempt = scheduler.spawn(1, descriptor(3, Duration::ZERO), backend.clone(), tx);

        for expected in 1..=3 {
            assert_eq!(
                next(&mut rx).await,
                AttemptReport::AttemptFailed {
                    generation: 1,
                    attempt: expected
                }
            );
        }
        assert_eq!(
            next(&mut rx).await,
            AttemptReport::Exhausted {
                generation: 1,
                attempts: 3
            }
        );
        assert_eq!(backend.starts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_interrupts_retry_sleep() {
        let backend = Arc::new(ScriptedBackend::failing(usize::MAX));
        let mut scheduler = RetryScheduler::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let attempt = scheduler.spawn(2, descriptor(0, Duration::from_secs(3600)), backend.clone(), tx);

        assert!(matches!(
            next(&mut rx).await,
            AttemptReport::AttemptFailed { attempt: 1, .. }
        ));
        assert_eq!(scheduler.live_attempts(), 1);
        drop(attempt);

        timeout(Duration::from_secs(5), async {
            while scheduler.live_attempts() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("attempt task exits after cancellation");
        assert!(rx.recv().await.is_none());
        assert_eq!(backend.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn next_attempt_waits_for_cancelled_call_to_return() {
        let backend = Arc::new(ScriptedBackend::slow_first_call(Duration::from_millis(150)));
        let mut scheduler = RetryScheduler::default();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let first = scheduler.spawn(1, descriptor(0, Duration::ZERO), backend.clone(), tx.clone());
        timeout(Duration::from_secs(5), async {
            while backend.starts.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("first call issued");
        drop(first);
        let _second = scheduler.spawn(2, descriptor(0, Duration::ZERO), backend.clone(), tx);
        assert_eq!(scheduler.live_attempts(), 2);

        match next(&mut rx).await {
            AttemptReport::Ready {
                generation, handle, ..
            } => {
                assert_eq!(generation, 2);
                assert_eq!(handle.id, "c1");
            }
            other => panic!("unexpected report {other:?}"),
        }
        assert_eq!(backend.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(backend.starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn zero_interval_retries_yield_to_cancellation() {
        let backend = Arc::new(ScriptedBackend::failing(usize::MAX));
        let mut scheduler = RetryScheduler::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let attempt = scheduler.spawn(3, descriptor(0, Duration::ZERO), backend.clone(), tx);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(backend.starts.load(Ordering::SeqCst) > 1);
        drop(attempt);

        timeout(Duration::from_secs(5), async {
            while scheduler.live_attempts() > 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("attempt task exits after cancellation");
        let calls = backend.starts.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(backend.starts.load(Ordering::SeqCst), calls);
    }
}
