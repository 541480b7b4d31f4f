//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "02-backend"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "In-memory orchestration backend with scripted failures."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use r_edge_common::SimulationConfig;
use r_edge_reconciler::{BackendError, OrchestrationBackend, WorkloadHandle};
use r_edge_workload::WorkloadDescriptor;
use tokio::time::sleep;
use tracing::debug;

/// A call received by the simulated backend, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    /// `start` for a workload.
    Start {
        /// Workload identity.
        name: String,
        /// Image repository.
        image: String,
        /// Image tag.
        tag: String,
    },
    /// `stop` of an instance.
    Stop {
        /// Instance identifier.
        id: String,
    },
    /// `delete` of an instance.
    Delete {
        /// Instance identifier.
        id: String,
    },
    /// `list_existing`.
    List,
}

/// An instance known to the simulated backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedWorkload {
    /// Handle returned to callers.
    pub handle: WorkloadHandle,
    /// `image:tag` the instance was started from.
    pub image: String,
    /// Whether the instance has not been stopped.
    pub running: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartFailures {
    Next(u32),
    Always,
}

/// Calls kept by the call log; older entries are dropped first.
pub const CALL_LOG_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct SimState {
    workloads: IndexMap<String, SimulatedWorkload>,
    calls: VecDeque<BackendCall>,
    start_counts: HashMap<String, usize>,
    start_failures: HashMap<String, StartFailures>,
    start_latency: Duration,
    image_latency: HashMap<String, Duration>,
    fail_list: bool,
    fail_stop: bool,
    fail_delete: bool,
}

impl SimState {
    fn record(&mut self, call: BackendCall) {
        if let BackendCall::Start { name, .. } = &call {
            *self.start_counts.entry(name.clone()).or_default() += 1;
        }
        if self.calls.len() == CALL_LOG_CAPACITY {
            self.calls.pop_front();
        }
        self.calls.push_back(call);
    }
}

/// Orchestration backend keeping its instances in memory.
///
/// Instances are keyed by workload name; starting a name that already exists
/// replaces the previous instance.
#[derive(Debug, Default)]
pub struct SimulatedBackend {
    state: Mutex<SimState>,
    next_id: AtomicU64,
}

impl SimulatedBackend {
    /// Empty backend with no scripted failures.
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend configured from the daemon's simulation section.
    pub fn from_config(config: &SimulationConfig) -> Self {
        let backend = Self::new();
        backend.set_start_latency(config.start_latency);
        for (name, failures) in &config.failing_starts {
            backend.fail_next_starts(name, *failures);
        }
        for name in &config.preexisting {
            backend.seed_running(name, "preexisting:unknown");
        }
        backend
    }

    /// Fail the next `count` start calls for `name`.
    pub fn fail_next_starts(&self, name: &str, count: u32) {
        let mut state = self.state.lock();
        if count == 0 {
            state.start_failures.remove(name);
        } else {
            state
                .start_failures
                .insert(name.to_owned(), StartFailures::Next(count));
        }
    }

    /// Fail every start call for `name` until cleared.
    pub fn fail_starts_always(&self, name: &str) {
        self.state
            .lock()
            .start_failures
            .insert(name.to_owned(), StartFailures::Always);
    }

    /// Remove scripted start failures for `name`.
    pub fn clear_start_failures(&self, name: &str) {
        self.state.lock().start_failures.remove(name);
    }

    /// Delay applied to every start call before it resolves.
    pub fn set_start_latency(&self, latency: Duration) {
        self.state.lock().start_latency = latency;
    }

    /// Delay for start calls of one `image:tag` reference, overriding the common latency.
    pub fn set_image_start_latency(&self, reference: &str, latency: Duration) {
        self.state
            .lock()
            .image_latency
            .insert(reference.to_owned(), latency);
    }

    /// Make `list_existing` fail.
    pub fn fail_list(&self, fail: bool) {
        self.state.lock().fail_list = fail;
    }

    /// Make `stop` fail.
    pub fn fail_stop(&self, fail: bool) {
        self.state.lock().fail_stop = fail;
    }

    /// Make `delete` fail.
    pub fn fail_delete(&self, fail: bool) {
        self.state.lock().fail_delete = fail;
    }

    /// Register an instance as already running, as after a daemon restart.
    pub fn seed_running(&self, name: &str, image: &str) -> WorkloadHandle {
        let handle = WorkloadHandle::new(self.allocate_id(), name);
        self.state.lock().workloads.insert(
            name.to_owned(),
            SimulatedWorkload {
                handle: handle.clone(),
                image: image.to_owned(),
                running: true,
            },
        );
        handle
    }

    /// The most recent calls, oldest first, at most [`CALL_LOG_CAPACITY`] of them.
    pub fn calls(&self) -> Vec<BackendCall> {
        self.state.lock().calls.iter().cloned().collect()
    }

    /// Number of start calls received for `name` since the backend was created.
    pub fn start_calls_for(&self, name: &str) -> usize {
        self.state
            .lock()
            .start_counts
            .get(name)
            .copied()
            .unwrap_or_default()
    }

    /// Number of logged stop calls for instance `id`.
    pub fn stop_calls_for(&self, id: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| matches!(call, BackendCall::Stop { id: stopped } if stopped == id))
            .count()
    }

    /// Number of logged delete calls for instance `id`.
    pub fn delete_calls_for(&self, id: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| matches!(call, BackendCall::Delete { id: deleted } if deleted == id))
            .count()
    }

    /// Instances that are currently running.
    pub fn running(&self) -> Vec<SimulatedWorkload> {
        self.state
            .lock()
            .workloads
            .values()
            .filter(|workload| workload.running)
            .cloned()
            .collect()
    }

    /// Instance registered under `name`, running or stopped.
    pub fn workload(&self, name: &str) -> Option<SimulatedWorkload> {
        self.state.lock().workloads.get(name).cloned()
    }

    fn allocate_id(&self) -> String {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        format!("sim-{id:06}")
    }

    fn take_start_failure(state: &mut SimState, name: &str) -> bool {
        match state.start_failures.get(name).copied() {
            Some(StartFailures::Always) => true,
            Some(StartFailures::Next(remaining)) => {
                if remaining <= 1 {
                    state.start_failures.remove(name);
                } else {
                    state
                        .start_failures
                        .insert(name.to_owned(), StartFailures::Next(remaining - 1));
                }
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl OrchestrationBackend for SimulatedBackend {
    async fn start(&self, descriptor: &WorkloadDescriptor) -> Result<WorkloadHandle, BackendError> {
        let latency = {
            let mut state = self.state.lock();
            state.record(BackendCall::Start {
                name: descriptor.name().to_owned(),
                image: descriptor.image().to_owned(),
                tag: descriptor.tag().to_owned(),
            });
            state
                .image_latency
                .get(&descriptor.image_reference())
                .copied()
                .unwrap_or(state.start_latency)
        };
        if !latency.is_zero() {
            sleep(latency).await;
        }

        let mut state = self.state.lock();
        if Self::take_start_failure(&mut state, descriptor.name()) {
            debug!(workload = descriptor.name(), "simulated start failure");
            return Err(BackendError::StartFailed {
                workload: descriptor.name().to_owned(),
                reason: "simulated failure".into(),
            });
        }
        let handle = WorkloadHandle::new(self.allocate_id(), descriptor.name());
        state.workloads.insert(
            descriptor.name().to_owned(),
            SimulatedWorkload {
                handle: handle.clone(),
                image: descriptor.image_reference(),
                running: true,
            },
        );
        debug!(workload = descriptor.name(), handle = %handle, "simulated start");
        Ok(handle)
    }

    async fn stop(&self, handle: &WorkloadHandle) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.record(BackendCall::Stop {
            id: handle.id.clone(),
        });
        if state.fail_stop {
            return Err(BackendError::OperationFailed {
                operation: "stop",
                id: handle.id.clone(),
                reason: "simulated failure".into(),
            });
        }
        match state
            .workloads
            .values_mut()
            .find(|workload| workload.handle.id == handle.id)
        {
            Some(workload) => {
                workload.running = false;
                Ok(())
            }
            None => Err(BackendError::NotFound(handle.id.clone())),
        }
    }

    async fn delete(&self, handle: &WorkloadHandle) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.record(BackendCall::Delete {
            id: handle.id.clone(),
        });
        if state.fail_delete {
            return Err(BackendError::OperationFailed {
                operation: "delete",
                id: handle.id.clone(),
                reason: "simulated failure".into(),
            });
        }
        let position = state
            .workloads
            .values()
            .position(|workload| workload.handle.id == handle.id);
        match position {
            Some(index) => {
                state.workloads.shift_remove_index(index);
                Ok(())
            }
            None => Err(BackendError::NotFound(handle.id.clone())),
        }
    }

    async fn list_existing(&self) -> Result<Vec<WorkloadHandle>, BackendError> {
        let mut state = self.state.lock();
        state.record(BackendCall::List);
        if state.fail_list {
            return Err(BackendError::Unavailable("simulated list failure".into()));
        }
        Ok(state
            .workloads
            .values()
            .map(|workload| workload.handle.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nginx() -> WorkloadDescriptor {
        WorkloadDescriptor::builder("web", "nginx").enabled(true).build()
    }

    #[tokio::test]
    async fn scripted_failures_run_out() {
        let backend = SimulatedBackend::new();
        backend.fail_next_starts("web", 2);
        assert!(backend.start(&nginx()).await.is_err());
        assert!(backend.start(&nginx()).await.is_err());
        let handle = backend.start(&nginx()).await.unwrap();
        assert_eq!(handle.name, "web");
        assert_eq!(backend.start_calls_for("web"), 3);
        assert_eq!(backend.running().len(), 1);
        assert_eq!(backend.running()[0].image, "nginx:latest");
    }

    #[tokio::test]
    async fn stop_and_delete_remove_instances() {
        let backend = SimulatedBackend::new();
        let handle = backend.seed_running("web", "nginx:1.25");
        assert_eq!(backend.list_existing().await.unwrap(), vec![handle.clone()]);

        backend.stop(&handle).await.unwrap();
        assert!(backend.running().is_empty());
        assert!(backend.workload("web").is_some());
        backend.delete(&handle).await.unwrap();
        assert!(backend.workload("web").is_none());
        assert_eq!(
            backend.delete(&handle).await,
            Err(BackendError::NotFound(handle.id.clone()))
        );
        assert_eq!(backend.stop_calls_for(&handle.id), 1);
        assert_eq!(backend.delete_calls_for(&handle.id), 2);
    }

    #[tokio::test]
    async fn call_log_keeps_only_recent_calls() {
        let backend = SimulatedBackend::new();
        backend.start(&nginx()).await.unwrap();
        for _ in 0..CALL_LOG_CAPACITY + 10 {
            backend.list_existing().await.unwrap();
        }

        let calls = backend.calls();
        assert_eq!(calls.len(), CALL_LOG_CAPACITY);
        assert!(calls.iter().all(|call| *call == BackendCall::List));
        assert_eq!(backend.start_calls_for("web"), 1);
    }

    #[tokio::test]
    async fn image_latency_overrides_common_latency() {
        let backend = SimulatedBackend::new();
        backend.set_start_latency(Duration::from_secs(3600));
        backend.set_image_start_latency("nginx:latest", Duration::ZERO);
        let handle = tokio::time::timeout(Duration::from_secs(5), backend.start(&nginx()))
            .await
            .expect("start not delayed")
            .unwrap();
        assert_eq!(handle.name, "web");
    }

    #[test]
    fn configuration_seeds_backend() {
        let config: SimulationConfig = toml::from_str(
            r#"
            start_latency_ms = 5
            preexisting = ["historian"]
            [failing_starts]
            web = 1
            "#,
        )
        .unwrap();
        let backend = SimulatedBackend::from_config(&config);
        assert_eq!(backend.running().len(), 1);
        assert_eq!(backend.running()[0].handle.name, "historian");
        assert_eq!(
            backend.state.lock().start_failures.get("web"),
            Some(&StartFailures::Next(1))
        );
    }
}
