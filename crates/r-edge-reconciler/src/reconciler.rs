//! ---
//! ems_section: "04-configuration-orchestration"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Workload lifecycle reconciliation against an orchestration backend."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::mem;
use std::sync::Arc;

use r_edge_common::TrustPolicy;
use r_edge_workload::WorkloadDescriptor;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::backend::{find_existing, OrchestrationBackend, WorkloadHandle};
use crate::metrics::ReconcilerMetrics;
use crate::retry::{AttemptReport, RetryScheduler};
use crate::state::{LifecycleState, LifecycleStateKind, ReconcilerEvent, StateTransition, WorkloadStatus};
use crate::trust::{self, TrustValidator};

/// State machine keeping one workload identity converged with its descriptor.
///
/// Events must be handled one at a time; [`crate::ReconcilerHost`] provides that
/// serialisation. Start attempts report back through the receiver returned by
/// [`Reconciler::new`], and each report is fed in as a [`ReconcilerEvent`].
#[derive(Debug)]
pub struct Reconciler {
    name: String,
    backend: Arc<dyn OrchestrationBackend>,
    validator: Option<Arc<dyn TrustValidator>>,
    trust_policy: TrustPolicy,
    scheduler: RetryScheduler,
    reports: mpsc::UnboundedSender<AttemptReport>,
    state: LifecycleState,
    generation: u64,
    failed_attempts: u32,
    startup_failed: bool,
    metrics: Option<ReconcilerMetrics>,
}

impl Reconciler {
    /// Create a reconciler in `Disabled` together with its attempt report stream.
    pub fn new(
        name: impl Into<String>,
        backend: Arc<dyn OrchestrationBackend>,
        validator: Option<Arc<dyn TrustValidator>>,
        metrics: Option<ReconcilerMetrics>,
    ) -> (Self, mpsc::UnboundedReceiver<AttemptReport>) {
        let name = name.into();
        let (reports, rx) = mpsc::unbounded_channel();
        if let Some(metrics) = &metrics {
            metrics.set_state(&name, LifecycleStateKind::Disabled);
        }
        let reconciler = Self {
            name,
            backend,
            validator,
            trust_policy: TrustPolicy::Advisory,
            scheduler: RetryScheduler::new(metrics.clone()),
            reports,
            state: LifecycleState::initial(),
            generation: 0,
            failed_attempts: 0,
            startup_failed: false,
            metrics,
        };
        (reconciler, rx)
    }

    /// Set how trust verdicts are treated.
    ///
    /// Under [`TrustPolicy::Enforce`] descriptors are vetted before they are
    /// delivered, so entering `Starting` does not validate them again.
    pub fn set_trust_policy(&mut self, policy: TrustPolicy) {
        self.trust_policy = policy;
    }

    /// Workload identity.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state variant.
    pub fn state(&self) -> LifecycleStateKind {
        self.state.kind()
    }

    /// Last accepted descriptor.
    pub fn descriptor(&self) -> Option<&Arc<WorkloadDescriptor>> {
        self.state.descriptor()
    }

    /// Start attempt tasks still alive, cancelled ones included until they exit.
    pub fn live_attempts(&self) -> usize {
        self.scheduler.live_attempts()
    }

    /// Observability snapshot.
    pub fn status(&self) -> WorkloadStatus {
        let descriptor = self.state.descriptor();
        WorkloadStatus {
            name: self.name.clone(),
            state: self.state.kind(),
            enabled: descriptor.map(|d| d.enabled()).unwrap_or(false),
            image: descriptor.map(|d| d.image_reference()),
            handle: self.state.handle().cloned(),
            generation: self.generation,
            failed_attempts: self.failed_attempts,
            startup_failed: self.startup_failed,
        }
    }

    /// Apply one event. Returns the resulting transition when the status changed.
    pub async fn handle(&mut self, event: ReconcilerEvent) -> Option<StateTransition> {
        if let ReconcilerEvent::ConfigurationUpdated(descriptor) = &event {
            if descriptor.name() != self.name {
                warn!(
                    workload = %self.name,
                    received = descriptor.name(),
                    "ignoring configuration addressed to another workload",
                );
                return None;
            }
        }

        let cause = event.cause();
        let before = self.status();
        let state = mem::replace(&mut self.state, LifecycleState::initial());
        self.state = self.transition(state, event).await;
        let after = self.status();
        if before == after {
            return None;
        }

        if before.state != after.state {
            info!(
                workload = %self.name,
                from = %before.state,
                to = %after.state,
                cause,
                "workload state changed",
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_transition(&self.name, before.state, after.state);
            }
        }
        Some(StateTransition {
            from: before.state,
            to: after.state,
            cause,
            status: after,
        })
    }

    async fn transition(&mut self, state: LifecycleState, event: ReconcilerEvent) -> LifecycleState {
        use LifecycleState as S;
        use ReconcilerEvent as E;

        match (state, event) {
            (S::Disabled { .. }, E::ConfigurationUpdated(new)) => self.converge(new).await,
            (S::Disabled { descriptor: Some(current) }, E::Connect) => self.converge(current).await,

            (S::Starting { descriptor, attempt }, E::ConfigurationUpdated(new)) => {
                if descriptor == new {
                    debug!(workload = %self.name, "configuration unchanged; start attempt continues");
                    return S::Starting { descriptor, attempt };
                }
                info!(
                    workload = %self.name,
                    changed = ?descriptor.diff(&new),
                    "configuration changed while starting; superseding attempt",
                );
                attempt.cancel();
                drop(attempt);
                self.accept(new)
            }
            (S::Starting { descriptor, attempt }, E::ContainerReady { generation, handle })
                if attempt.generation() == generation =>
            {
                drop(attempt);
                S::Created { descriptor, handle }
            }
            (S::Starting { descriptor, attempt }, E::AttemptFailed { generation, attempt: failed })
                if attempt.generation() == generation =>
            {
                self.failed_attempts = failed;
                S::Starting { descriptor, attempt }
            }
            (S::Starting { descriptor, attempt }, E::StartupFailure { generation, attempts })
                if attempt.generation() == generation =>
            {
                drop(attempt);
                error!(
                    workload = %self.name,
                    image = %descriptor.image_reference(),
                    attempts,
                    "workload failed to start; retry budget exhausted",
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_startup_failure(&self.name);
                }
                self.startup_failed = true;
                S::Disabled { descriptor: Some(descriptor) }
            }
            (S::Starting { descriptor, attempt }, E::Disabled) => {
                attempt.cancel();
                drop(attempt);
                // A start may have landed just before the cancellation was seen.
                // This narrows the window but cannot close it.
                if let Some(handle) = self.lookup().await {
                    info!(workload = %self.name, handle = %handle, "tearing down workload started during cancellation");
                    self.teardown(&handle).await;
                }
                S::Disabled { descriptor: Some(descriptor) }
            }

            (S::Created { descriptor, handle }, E::ConfigurationUpdated(new)) => {
                if descriptor == new {
                    debug!(workload = %self.name, "configuration unchanged; workload left running");
                    return S::Created { descriptor, handle };
                }
                info!(
                    workload = %self.name,
                    changed = ?descriptor.diff(&new),
                    "configuration changed; replacing running workload",
                );
                self.teardown(&handle).await;
                self.accept(new)
            }
            (S::Created { descriptor, handle }, E::Disabled) => {
                self.teardown(&handle).await;
                S::Disabled { descriptor: Some(descriptor) }
            }

            (
                state,
                event @ (E::ContainerReady { .. } | E::AttemptFailed { .. } | E::StartupFailure { .. }),
            ) => {
                debug!(
                    workload = %self.name,
                    state = %state.kind(),
                    event = event.cause(),
                    "discarding report from a superseded start attempt",
                );
                state
            }
            (state, event) => {
                debug!(
                    workload = %self.name,
                    state = %state.kind(),
                    event = event.cause(),
                    "event has no effect in current state",
                );
                state
            }
        }
    }

    /// Existence check from `Disabled`: adopt a running instance or start a new one.
    async fn converge(&mut self, descriptor: Arc<WorkloadDescriptor>) -> LifecycleState {
        if !descriptor.enabled() {
            return LifecycleState::Disabled {
                descriptor: Some(descriptor),
            };
        }
        match find_existing(self.backend.as_ref(), &self.name).await {
            Ok(Some(handle)) => {
                info!(workload = %self.name, handle = %handle, "adopting existing workload");
                LifecycleState::Created { descriptor, handle }
            }
            Ok(None) => self.enter_starting(descriptor),
            Err(err) => {
                warn!(
                    workload = %self.name,
                    error = %err,
                    "existence check failed; staying disabled",
                );
                LifecycleState::Disabled {
                    descriptor: Some(descriptor),
                }
            }
        }
    }

    /// Move to the state `descriptor` asks for after the previous one was released.
    fn accept(&mut self, descriptor: Arc<WorkloadDescriptor>) -> LifecycleState {
        if descriptor.enabled() {
            self.enter_starting(descriptor)
        } else {
            LifecycleState::Disabled {
                descriptor: Some(descriptor),
            }
        }
    }

    fn enter_starting(&mut self, descriptor: Arc<WorkloadDescriptor>) -> LifecycleState {
        if self.trust_policy == TrustPolicy::Advisory {
            trust::evaluate(&descriptor, self.validator.as_deref());
        }
        self.generation += 1;
        self.failed_attempts = 0;
        self.startup_failed = false;
        let attempt = self.scheduler.spawn(
            self.generation,
            descriptor.clone(),
            self.backend.clone(),
            self.reports.clone(),
        );
        LifecycleState::Starting {
            descriptor,
            attempt,
        }
    }

    async fn lookup(&self) -> Option<WorkloadHandle> {
        match find_existing(self.backend.as_ref(), &self.name).await {
            Ok(found) => found,
            Err(err) => {
                warn!(workload = %self.name, error = %err, "existence check failed");
                None
            }
        }
    }

    /// Stop then delete; failures are logged and never block the transition.
    async fn teardown(&self, handle: &WorkloadHandle) {
        if let Err(err) = self.backend.stop(handle).await {
            warn!(workload = %self.name, handle = %handle, error = %err, "failed to stop workload");
        }
        if let Err(err) = self.backend.delete(handle).await {
            warn!(workload = %self.name, handle = %handle, error = %err, "failed to delete workload");
        }
        info!(workload = %self.name, handle = %handle, "workload torn down");
    }
}
