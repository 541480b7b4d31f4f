//! ---
//! ems_section: "04-configuration-orchestration"
//! ems_subsection: "tests"
//! ems_type: "test"
//! ems_scope: "code"
//! ems_description: "Reconciler hosts and fleets driven through their public handles."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use r_edge_common::TrustPolicy;
use r_edge_metrics::new_registry;
use r_edge_reconciler::{
    HostError, HostOptions, LifecycleStateKind, ReconcilerHost, ReconcilerMetrics, TrustError,
    TrustRequest, TrustValidator, TrustVerdict, WorkloadFleet, WorkloadStatus,
};
use r_edge_sim::{AllowlistValidator, SimulatedBackend};
use r_edge_workload::WorkloadDescriptor;
use tokio::sync::watch;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn workload(name: &str, tag: &str) -> WorkloadDescriptor {
    WorkloadDescriptor::builder(name, "registry.local/historian")
        .tag(tag)
        .enabled(true)
        .max_retries(0)
        .retry_interval(Duration::from_millis(10))
        .build()
}

#[derive(Debug)]
struct CountingValidator {
    inner: AllowlistValidator,
    calls: AtomicUsize,
}

impl TrustValidator for CountingValidator {
    fn verify(&self, request: &TrustRequest<'_>) -> Result<TrustVerdict, TrustError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.verify(request)
    }
}

async fn wait_for_state(
    status: &mut watch::Receiver<WorkloadStatus>,
    state: LifecycleStateKind,
) -> WorkloadStatus {
    timeout(WAIT, status.wait_for(|status| status.state == state))
        .await
        .expect("state reached in time")
        .expect("host alive")
        .clone()
}

#[tokio::test]
async fn host_publishes_each_transition_in_order() {
    let backend = Arc::new(SimulatedBackend::new());
    backend.fail_next_starts("historian", 1);
    let host = ReconcilerHost::spawn("historian", backend.clone(), None, HostOptions::default());
    let mut transitions = host.subscribe_transitions();

    host.update_configuration(workload("historian", "2.1"))
        .expect("queued");

    let mut observed = Vec::new();
    while observed.last().map(|(_, to)| *to) != Some(LifecycleStateKind::Created) {
        let transition = timeout(WAIT, transitions.recv())
            .await
            .expect("transition in time")
            .expect("transition channel open");
        observed.push((transition.from, transition.to));
    }

    assert_eq!(
        observed,
        vec![
            (LifecycleStateKind::Disabled, LifecycleStateKind::Starting),
            (LifecycleStateKind::Starting, LifecycleStateKind::Starting),
            (LifecycleStateKind::Starting, LifecycleStateKind::Created),
        ]
    );
    assert_eq!(host.state(), LifecycleStateKind::Created);
    assert_eq!(backend.start_calls_for("historian"), 2);

    host.shutdown().await;
    assert!(backend.running().is_empty());
}

#[tokio::test]
async fn host_rejects_foreign_descriptor() {
    let backend = Arc::new(SimulatedBackend::new());
    let host = ReconcilerHost::spawn("historian", backend, None, HostOptions::default());

    let err = host
        .update_configuration(workload("scada-bridge", "1"))
        .unwrap_err();
    assert_eq!(
        err,
        HostError::IdentityMismatch {
            expected: "historian".into(),
            found: "scada-bridge".into(),
        }
    );
    host.shutdown().await;
    assert!(matches!(host.connect(), Err(HostError::Closed(_))));
}

#[tokio::test]
async fn enforced_trust_policy_delivers_rejected_images_disabled() {
    let backend = Arc::new(SimulatedBackend::new());
    let validator: Arc<dyn TrustValidator> = Arc::new(AllowlistValidator::new().allow(
        "fleet-root",
        "registry.local/historian:2.1",
        "sha256:9f2c",
    ));
    let options = HostOptions {
        trust_policy: TrustPolicy::Enforce,
        metrics: None,
    };
    let host = ReconcilerHost::spawn("historian", backend.clone(), Some(validator), options);
    let mut status = host.watch_status();

    let unsigned = WorkloadDescriptor::builder("historian", "registry.local/historian")
        .tag("2.2")
        .enabled(true)
        .trust_anchor("fleet-root")
        .build();
    host.update_configuration(unsigned).expect("queued");
    let blocked = timeout(WAIT, status.wait_for(|status| status.image.is_some()))
        .await
        .expect("status in time")
        .expect("host alive")
        .clone();
    assert_eq!(blocked.state, LifecycleStateKind::Disabled);
    assert!(!blocked.enabled);
    assert_eq!(backend.start_calls_for("historian"), 0);

    let signed = WorkloadDescriptor::builder("historian", "registry.local/historian")
        .tag("2.1")
        .enabled(true)
        .trust_anchor("fleet-root")
        .build();
    host.update_configuration(signed).expect("queued");
    wait_for_state(&mut status, LifecycleStateKind::Created).await;

    host.shutdown().await;
}

#[tokio::test]
async fn advisory_trust_policy_launches_anyway() {
    let backend = Arc::new(SimulatedBackend::new());
    let validator: Arc<dyn TrustValidator> = Arc::new(AllowlistValidator::new());
    let host = ReconcilerHost::spawn(
        "historian",
        backend.clone(),
        Some(validator),
        HostOptions::default(),
    );
    let mut status = host.watch_status();

    let anchored = WorkloadDescriptor::builder("historian", "registry.local/historian")
        .enabled(true)
        .trust_anchor("unknown-root")
        .build();
    host.update_configuration(anchored).expect("queued");

    wait_for_state(&mut status, LifecycleStateKind::Created).await;
    assert_eq!(backend.start_calls_for("historian"), 1);
    host.shutdown().await;
}

#[tokio::test]
async fn host_records_reconciler_metrics() {
    let registry = new_registry();
    let metrics = ReconcilerMetrics::new(registry.clone()).expect("metrics register");
    let backend = Arc::new(SimulatedBackend::new());
    backend.fail_next_starts("historian", 1);
    let host = ReconcilerHost::spawn(
        "historian",
        backend,
        None,
        HostOptions {
            trust_policy: TrustPolicy::Advisory,
            metrics: Some(metrics),
        },
    );
    let mut status = host.watch_status();
    host.update_configuration(workload("historian", "2.1"))
        .expect("queued");
    wait_for_state(&mut status, LifecycleStateKind::Created).await;

    let families = registry.gather();
    let family = |name: &str| {
        families
            .iter()
            .find(|family| family.get_name() == name)
            .unwrap_or_else(|| panic!("metric family {name} missing"))
    };
    let state = family("r_edge_reconciler_state");
    assert_eq!(state.get_metric()[0].get_gauge().get_value(), 2.0);
    let attempts: f64 = family("r_edge_reconciler_start_attempts_total")
        .get_metric()
        .iter()
        .map(|metric| metric.get_counter().get_value())
        .sum();
    assert_eq!(attempts, 2.0);

    let label = |metric: &prometheus::proto::Metric, name: &str| {
        metric
            .get_label()
            .iter()
            .find(|pair| pair.get_name() == name)
            .map(|pair| pair.get_value().to_owned())
            .unwrap_or_default()
    };
    let mut transitions: Vec<(String, String, f64)> = family("r_edge_reconciler_transitions_total")
        .get_metric()
        .iter()
        .map(|metric| {
            (
                label(metric, "from"),
                label(metric, "to"),
                metric.get_counter().get_value(),
            )
        })
        .collect();
    transitions.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
    assert_eq!(
        transitions,
        vec![
            ("disabled".to_owned(), "starting".to_owned(), 1.0),
            ("starting".to_owned(), "created".to_owned(), 1.0),
        ]
    );

    host.shutdown().await;
}

#[tokio::test]
async fn trust_validation_runs_once_per_launch() {
    for policy in [TrustPolicy::Advisory, TrustPolicy::Enforce] {
        let backend = Arc::new(SimulatedBackend::new());
        let validator = Arc::new(CountingValidator {
            inner: AllowlistValidator::new().allow(
                "fleet-root",
                "registry.local/historian:2.1",
                "sha256:9f2c",
            ),
            calls: AtomicUsize::new(0),
        });
        let shared: Arc<dyn TrustValidator> = validator.clone();
        let options = HostOptions {
            trust_policy: policy,
            metrics: None,
        };
        let host = ReconcilerHost::spawn("historian", backend.clone(), Some(shared), options);
        let mut status = host.watch_status();

        let signed = WorkloadDescriptor::builder("historian", "registry.local/historian")
            .tag("2.1")
            .enabled(true)
            .trust_anchor("fleet-root")
            .build();
        host.update_configuration(signed).expect("queued");
        wait_for_state(&mut status, LifecycleStateKind::Created).await;

        assert_eq!(validator.calls.load(Ordering::SeqCst), 1, "{policy:?}");
        assert_eq!(backend.start_calls_for("historian"), 1);
        host.shutdown().await;
    }
}

#[tokio::test]
async fn fleet_follows_configuration_changes() {
    let backend = Arc::new(SimulatedBackend::new());
    let mut fleet = WorkloadFleet::new(backend.clone(), None, HostOptions::default());

    let changes = fleet
        .apply(vec![workload("historian", "2.1"), workload("scada-bridge", "1.0")])
        .await
        .expect("fleet applied");
    assert_eq!(changes.added, vec!["historian", "scada-bridge"]);

    for name in ["historian", "scada-bridge"] {
        let mut status = fleet.host(name).expect("host").watch_status();
        wait_for_state(&mut status, LifecycleStateKind::Created).await;
    }
    assert_eq!(backend.running().len(), 2);

    let changes = fleet
        .apply(vec![workload("historian", "2.1")])
        .await
        .expect("fleet applied");
    assert_eq!(changes.retained, vec!["historian"]);
    assert_eq!(changes.removed, vec!["scada-bridge"]);
    assert!(backend.workload("scada-bridge").is_none());
    assert_eq!(backend.start_calls_for("historian"), 1);

    let board = fleet.board();
    assert_eq!(board.len(), 1);
    assert_eq!(
        board.get("historian").map(|status| status.state),
        Some(LifecycleStateKind::Created)
    );

    fleet.shutdown().await;
    assert!(backend.running().is_empty());
    assert!(board.is_empty());
}
