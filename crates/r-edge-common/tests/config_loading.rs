//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "tests"
//! ems_type: "test"
//! ems_scope: "code"
//! ems_description: "Configuration discovery and reload fingerprinting."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::path::PathBuf;

use r_edge_common::{hash_app_config, AppConfig, LogFormat, TrustPolicy};
use tempfile::tempdir;

const GATEWAY: &str = r#"
mode = "simulation"

[logging]
format = "pretty"

[reconciler]
trust_policy = "enforce"

[workloads.historian]
"container.enabled" = true
"container.image" = "registry.local/historian"
"container.image.tag" = "2.1"
"#;

#[test]
fn first_existing_candidate_wins() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("r-edge.toml");
    let present = dir.path().join("gateway.toml");
    fs::write(&present, GATEWAY).unwrap();

    let loaded = AppConfig::load_with_source(&[missing, present.clone()]).expect("config loads");
    assert_eq!(loaded.source, present);
    assert!(loaded.config.mode.is_simulation());
    assert_eq!(loaded.config.logging.format, LogFormat::Pretty);
    assert_eq!(loaded.config.reconciler.trust_policy, TrustPolicy::Enforce);
    assert_eq!(
        loaded.config.workload_properties()["historian"]["container.image.tag"],
        "2.1"
    );
}

#[test]
fn missing_candidates_are_listed_in_error() {
    let dir = tempdir().unwrap();
    let candidates: Vec<PathBuf> = vec![dir.path().join("a.toml"), dir.path().join("b.toml")];
    let err = AppConfig::load(&candidates).expect_err("nothing to load");
    let message = err.to_string();
    assert!(message.contains("a.toml"));
    assert!(message.contains("b.toml"));
}

#[test]
fn invalid_file_reports_its_path() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("broken.toml");
    fs::write(&path, "[reconciler]\nconnect_interval = \"soon\"\n").unwrap();

    let err = AppConfig::from_path(&path).expect_err("invalid config rejected");
    assert!(format!("{err:#}").contains("broken.toml"));
}

#[test]
fn rewritten_workload_changes_the_fingerprint() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("gateway.toml");
    fs::write(&path, GATEWAY).unwrap();
    let before = hash_app_config(&AppConfig::from_path(&path).unwrap()).unwrap();

    fs::write(&path, GATEWAY).unwrap();
    let unchanged = hash_app_config(&AppConfig::from_path(&path).unwrap()).unwrap();
    assert_eq!(before, unchanged);

    fs::write(&path, GATEWAY.replace("\"2.1\"", "\"2.2\"")).unwrap();
    let after = hash_app_config(&AppConfig::from_path(&path).unwrap()).unwrap();
    assert_ne!(before, after);
}
