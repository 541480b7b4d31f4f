//! ---
//! ems_section: "04-configuration-orchestration"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Workload lifecycle reconciliation against an orchestration backend."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use parking_lot::Mutex;
use r_edge_common::TrustPolicy;
use r_edge_workload::WorkloadDescriptor;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::OrchestrationBackend;
use crate::metrics::ReconcilerMetrics;
use crate::reconciler::Reconciler;
use crate::retry::AttemptReport;
use crate::state::{LifecycleStateKind, ReconcilerEvent, StateTransition, WorkloadStatus};
use crate::trust::{self, TrustValidator};

const TRANSITION_CAPACITY: usize = 64;

/// Errors returned to callers feeding a host.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HostError {
    /// The descriptor belongs to another workload identity.
    #[error("descriptor for `{found}` delivered to host of `{expected}`")]
    IdentityMismatch {
        /// Identity served by the host.
        expected: String,
        /// Identity carried by the descriptor.
        found: String,
    },
    /// The host task has exited.
    #[error("reconciler host for `{0}` is no longer running")]
    Closed(String),
}

/// Knobs shared by every host of a fleet.
#[derive(Debug, Clone, Default)]
pub struct HostOptions {
    /// How negative trust verdicts are treated before delivery.
    pub trust_policy: TrustPolicy,
    /// Optional metrics handle.
    pub metrics: Option<ReconcilerMetrics>,
}

#[derive(Debug)]
enum HostCommand {
    Event(ReconcilerEvent),
    Shutdown,
}

/// Owns one [`Reconciler`] and serialises every event for its identity.
///
/// Callers never wait on the backend: updates are queued and applied in order by
/// the host task, which also consumes start attempt reports.
#[derive(Debug)]
pub struct ReconcilerHost {
    name: String,
    commands: mpsc::UnboundedSender<HostCommand>,
    status: watch::Receiver<WorkloadStatus>,
    transitions: broadcast::Sender<StateTransition>,
    validator: Option<Arc<dyn TrustValidator>>,
    trust_policy: TrustPolicy,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReconcilerHost {
    /// Spawn the host task for `name`.
    pub fn spawn(
        name: impl Into<String>,
        backend: Arc<dyn OrchestrationBackend>,
        validator: Option<Arc<dyn TrustValidator>>,
        options: HostOptions,
    ) -> Self {
        let name = name.into();
        let (mut reconciler, reports) =
            Reconciler::new(name.clone(), backend, validator.clone(), options.metrics);
        reconciler.set_trust_policy(options.trust_policy);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(reconciler.status());
        let (transitions_tx, _) = broadcast::channel(TRANSITION_CAPACITY);

        let task = tokio::spawn(run_host(
            reconciler,
            commands_rx,
            reports,
            status_tx,
            transitions_tx.clone(),
        ));
        info!(workload = %name, "reconciler host started");

        Self {
            name,
            commands: commands_tx,
            status: status_rx,
            transitions: transitions_tx,
            validator,
            trust_policy: options.trust_policy,
            task: Mutex::new(Some(task)),
        }
    }

    /// Workload identity served by this host.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a new descriptor. Returns as soon as it is queued.
    pub fn update_configuration(&self, descriptor: WorkloadDescriptor) -> Result<(), HostError> {
        if descriptor.name() != self.name {
            return Err(HostError::IdentityMismatch {
                expected: self.name.clone(),
                found: descriptor.name().to_owned(),
            });
        }
        let descriptor = self.apply_trust_policy(descriptor);
        self.send(ReconcilerEvent::ConfigurationUpdated(Arc::new(descriptor)))
    }

    /// Forward the periodic backend health signal.
    pub fn connect(&self) -> Result<(), HostError> {
        self.send(ReconcilerEvent::Connect)
    }

    /// Force the workload down while keeping the host alive.
    pub fn disable(&self) -> Result<(), HostError> {
        self.send(ReconcilerEvent::Disabled)
    }

    /// Current state.
    pub fn state(&self) -> LifecycleStateKind {
        self.status.borrow().state
    }

    /// Latest published status.
    pub fn status(&self) -> WorkloadStatus {
        self.status.borrow().clone()
    }

    /// Receiver following every status change.
    pub fn watch_status(&self) -> watch::Receiver<WorkloadStatus> {
        self.status.clone()
    }

    /// Subscribe to transitions published after this call.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions.subscribe()
    }

    /// Tear the workload down and wait for the host task to exit.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(HostCommand::Shutdown);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(workload = %self.name, error = %err, "reconciler host task ended abnormally");
            }
        }
    }

    fn send(&self, event: ReconcilerEvent) -> Result<(), HostError> {
        self.commands
            .send(HostCommand::Event(event))
            .map_err(|_| HostError::Closed(self.name.clone()))
    }

    fn apply_trust_policy(&self, descriptor: WorkloadDescriptor) -> WorkloadDescriptor {
        if self.trust_policy != TrustPolicy::Enforce || !descriptor.enabled() {
            return descriptor;
        }
        let outcome = trust::evaluate(&descriptor, self.validator.as_deref());
        if outcome.permits_launch() {
            descriptor
        } else {
            warn!(
                workload = %self.name,
                outcome = %outcome,
                "trust policy blocks launch; delivering workload disabled",
            );
            descriptor.with_enabled(false)
        }
    }
}

async fn run_host(
    mut reconciler: Reconciler,
    mut commands: mpsc::UnboundedReceiver<HostCommand>,
    mut reports: mpsc::UnboundedReceiver<AttemptReport>,
    status: watch::Sender<WorkloadStatus>,
    transitions: broadcast::Sender<StateTransition>,
) {
    loop {
        let event = tokio::select! {
            command = commands.recv() => match command {
                Some(HostCommand::Event(event)) => event,
                Some(HostCommand::Shutdown) | None => break,
            },
            Some(report) = reports.recv() => ReconcilerEvent::from(report),
        };
        apply(&mut reconciler, event, &status, &transitions).await;
    }

    apply(&mut reconciler, ReconcilerEvent::Disabled, &status, &transitions).await;
    debug!(workload = %reconciler.name(), "reconciler host stopped");
}

async fn apply(
    reconciler: &mut Reconciler,
    event: ReconcilerEvent,
    status: &watch::Sender<WorkloadStatus>,
    transitions: &broadcast::Sender<StateTransition>,
) {
    if let Some(transition) = reconciler.handle(event).await {
        status.send_replace(transition.status.clone());
        let _ = transitions.send(transition);
    }
}
