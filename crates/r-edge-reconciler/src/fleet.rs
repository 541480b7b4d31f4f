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

use indexmap::IndexMap;
use parking_lot::RwLock;
use r_edge_workload::WorkloadDescriptor;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::backend::OrchestrationBackend;
use crate::host::{HostError, HostOptions, ReconcilerHost};
use crate::state::WorkloadStatus;
use crate::trust::TrustValidator;

/// Read-only view over the status of every workload in a fleet.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    inner: Arc<RwLock<IndexMap<String, watch::Receiver<WorkloadStatus>>>>,
}

impl StatusBoard {
    /// Statuses in configuration order.
    pub fn snapshot(&self) -> Vec<WorkloadStatus> {
        self.inner
            .read()
            .values()
            .map(|status| status.borrow().clone())
            .collect()
    }

    /// Status of a single workload.
    pub fn get(&self, name: &str) -> Option<WorkloadStatus> {
        self.inner
            .read()
            .get(name)
            .map(|status| status.borrow().clone())
    }

    /// Number of tracked workloads.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether no workload is tracked.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    fn insert(&self, name: String, status: watch::Receiver<WorkloadStatus>) {
        self.inner.write().insert(name, status);
    }

    fn remove(&self, name: &str) {
        self.inner.write().shift_remove(name);
    }
}

/// Summary of one [`WorkloadFleet::apply`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FleetChanges {
    /// Workloads that got a new host.
    pub added: Vec<String>,
    /// Workloads whose host received the descriptor again.
    pub retained: Vec<String>,
    /// Workloads whose host was shut down.
    pub removed: Vec<String>,
}

/// One [`ReconcilerHost`] per workload identity, sharing a backend and validator.
#[derive(Debug)]
pub struct WorkloadFleet {
    backend: Arc<dyn OrchestrationBackend>,
    validator: Option<Arc<dyn TrustValidator>>,
    options: HostOptions,
    hosts: IndexMap<String, ReconcilerHost>,
    board: StatusBoard,
}

impl WorkloadFleet {
    /// Create an empty fleet.
    pub fn new(
        backend: Arc<dyn OrchestrationBackend>,
        validator: Option<Arc<dyn TrustValidator>>,
        options: HostOptions,
    ) -> Self {
        Self {
            backend,
            validator,
            options,
            hosts: IndexMap::new(),
            board: StatusBoard::default(),
        }
    }

    /// Converge the fleet onto a complete set of descriptors.
    ///
    /// Hosts are spawned for new names and shut down for names no longer present.
    /// Existing hosts receive their descriptor again; unchanged ones ignore it.
    pub async fn apply(
        &mut self,
        descriptors: Vec<WorkloadDescriptor>,
    ) -> Result<FleetChanges, HostError> {
        let mut changes = FleetChanges::default();
        let wanted: Vec<String> = descriptors.iter().map(|d| d.name().to_owned()).collect();

        let stale: Vec<String> = self
            .hosts
            .keys()
            .filter(|name| !wanted.contains(name))
            .cloned()
            .collect();
        for name in stale {
            if let Some(host) = self.hosts.shift_remove(&name) {
                info!(workload = %name, "workload removed from configuration");
                host.shutdown().await;
                self.board.remove(&name);
                changes.removed.push(name);
            }
        }

        for descriptor in descriptors {
            let name = descriptor.name().to_owned();
            match self.hosts.get(&name) {
                Some(host) => {
                    host.update_configuration(descriptor)?;
                    changes.retained.push(name);
                }
                None => {
                    let host = ReconcilerHost::spawn(
                        name.clone(),
                        self.backend.clone(),
                        self.validator.clone(),
                        self.options.clone(),
                    );
                    host.update_configuration(descriptor)?;
                    self.board.insert(name.clone(), host.watch_status());
                    self.hosts.insert(name.clone(), host);
                    changes.added.push(name);
                }
            }
        }
        Ok(changes)
    }

    /// Forward the backend health signal to every host.
    pub fn connect_all(&self) {
        for host in self.hosts.values() {
            if let Err(err) = host.connect() {
                warn!(workload = %host.name(), error = %err, "failed to deliver connect signal");
            }
        }
    }

    /// Host serving `name`.
    pub fn host(&self, name: &str) -> Option<&ReconcilerHost> {
        self.hosts.get(name)
    }

    /// Shared status view.
    pub fn board(&self) -> StatusBoard {
        self.board.clone()
    }

    /// Current status of every workload.
    pub fn statuses(&self) -> Vec<WorkloadStatus> {
        self.board.snapshot()
    }

    /// Tear every workload down and stop all hosts.
    pub async fn shutdown(&mut self) {
        for (name, host) in self.hosts.drain(..) {
            host.shutdown().await;
            self.board.remove(&name);
        }
        info!("workload fleet stopped");
    }
}
