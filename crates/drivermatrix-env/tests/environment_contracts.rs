//! Contract tests for the Environment capability interface.
//!
//! Both environment kinds must satisfy the same provision / operate /
//! observe / teardown lifecycle through a lease.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use drivermatrix_env::fakes::FakeProvisioner;
use drivermatrix_env::{
    ClusterManagerConfig, EnvError, EnvironmentKind, EnvironmentLease, ExternalProvisioner, Operation,
    ProvisionRequest, Provisioner, SimulatorConfig,
};

fn request(kind: EnvironmentKind, label: &str) -> ProvisionRequest {
    match kind {
        EnvironmentKind::Cluster => ProvisionRequest::cluster(label, "4.0", 3),
        EnvironmentKind::Simulator => ProvisionRequest::simulator(label, "4.0", 3),
    }
}

#[tokio::test]
async fn lifecycle_is_uniform_across_kinds() {
    for kind in [EnvironmentKind::Cluster, EnvironmentKind::Simulator] {
        let provisioner = FakeProvisioner::new();
        let label = format!("contract-{}", kind);
        let lease = EnvironmentLease::acquire(Arc::new(provisioner.clone()), &request(kind, &label), Duration::from_secs(1))
            .await
            .unwrap();

        let env = lease.env();
        assert_eq!(env.info().kind, kind);
        assert_eq!(env.node_count(), 3);
        assert!(env.issue_operation(Operation::Read).await.is_ok());
        assert!(env.observe_health().await.unwrap().converged_on("4.0"));

        lease.release().await;
        assert_eq!(provisioner.teardown_count(&label), 1);
        assert_eq!(provisioner.live_count(), 0);
    }
}

#[tokio::test]
async fn failed_provisioning_leaves_nothing_live() {
    let provisioner = FakeProvisioner::new().failing_label("broken");
    let result = EnvironmentLease::acquire(
        Arc::new(provisioner.clone()),
        &request(EnvironmentKind::Cluster, "v-broken-standard"),
        Duration::from_secs(1),
    )
    .await;

    assert!(result.is_err());
    assert_eq!(provisioner.live_count(), 0);
    assert_eq!(provisioner.provisioned_count(), 0);
}

#[tokio::test]
async fn swap_converges_cluster_on_target() {
    let provisioner = FakeProvisioner::new();
    let lease = EnvironmentLease::acquire(
        Arc::new(provisioner.clone()),
        &request(EnvironmentKind::Cluster, "swap"),
        Duration::from_secs(1),
    )
    .await
    .unwrap();
    let env = lease.env();

    for node in 0..env.node_count() {
        env.swap_node(node, "4.1").await.unwrap();
    }
    assert!(env.observe_health().await.unwrap().converged_on("4.1"));
    lease.release().await;
}

/// Shell stand-in for the cluster manager: appends its arguments to a log
/// and sleeps `start_secs` on `start`.
fn fake_manager(dir: &Path, start_secs: u32) -> (ClusterManagerConfig, PathBuf) {
    let log = dir.join("manager.log");
    let script = dir.join("fake-ccm");
    std::fs::write(
        &script,
        format!(
            "#!/bin/sh\necho \"$@\" >> '{}'\nif [ \"$1\" = start ]; then sleep {}; fi\n",
            log.display(),
            start_secs
        ),
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    let config = ClusterManagerConfig {
        binary: script.display().to_string(),
        config_root: dir.join("clusters"),
        ..Default::default()
    };
    (config, log)
}

fn commands_for(log: &str, config_dir: &Path) -> Vec<String> {
    let flag = format!("--config-dir={}", config_dir.display());
    log.lines()
        .filter(|line| line.ends_with(&flag))
        .map(|line| line.split_whitespace().next().unwrap_or_default().to_string())
        .collect()
}

#[tokio::test]
async fn concurrent_clusters_get_their_own_addresses_and_state() {
    let dir = tempfile::tempdir().unwrap();
    let (config, log) = fake_manager(dir.path(), 0);
    let root = config.config_root.clone();
    let provisioner = ExternalProvisioner::new(config, SimulatorConfig::default());

    let first = ProvisionRequest::cluster("v1-standard", "4.0", 2);
    let second = ProvisionRequest::cluster("v2-standard", "4.0", 2);
    let (a, b) = tokio::join!(provisioner.provision(&first), provisioner.provision(&second));
    let (a, b) = (a.unwrap(), b.unwrap());

    let a_points = &a.info().contact_points;
    let b_points = &b.info().contact_points;
    assert_eq!(a_points.len(), 2);
    assert!(a_points.iter().all(|p| !b_points.contains(p)), "{a_points:?} vs {b_points:?}");

    a.teardown().await.unwrap();
    b.teardown().await.unwrap();

    let log = std::fs::read_to_string(log).unwrap();
    assert_eq!(log.lines().count(), 6, "{log}");
    for cluster in ["dm_v1_standard", "dm_v2_standard"] {
        assert_eq!(commands_for(&log, &root.join(cluster)), vec!["create", "start", "remove"], "{log}");
    }
    let prefixes: std::collections::BTreeSet<_> = log
        .lines()
        .filter(|line| line.starts_with("create"))
        .filter_map(|line| line.split(" -i ").nth(1))
        .map(|rest| rest.split_whitespace().next().unwrap_or_default().to_string())
        .collect();
    assert_eq!(prefixes.len(), 2, "{log}");
}

#[tokio::test]
async fn abandoned_cluster_start_is_removed() {
    let dir = tempfile::tempdir().unwrap();
    let (config, log) = fake_manager(dir.path(), 1);
    let provisioner = ExternalProvisioner::new(config, SimulatorConfig::default());

    let err = EnvironmentLease::acquire(
        Arc::new(provisioner),
        &ProvisionRequest::cluster("slow", "4.0", 1),
        Duration::from_millis(200),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, EnvError::ProvisionTimeout { .. }));

    let mut removed = false;
    for _ in 0..100 {
        let text = std::fs::read_to_string(&log).unwrap_or_default();
        if text.lines().any(|line| line.starts_with("remove dm_slow")) {
            removed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(removed, "cluster created by an abandoned acquire was never removed");
}

#[tokio::test]
async fn simulator_never_adopts_a_foreign_listener() {
    let foreign = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = foreign.local_addr().unwrap().port();
    let simulator = SimulatorConfig {
        binary: PathBuf::from("sleep"),
        args: vec!["30".to_string()],
        port,
        ports: 2,
        start_timeout_ms: 300,
        poll_interval_ms: 20,
        ..Default::default()
    };
    let provisioner = ExternalProvisioner::new(ClusterManagerConfig::default(), simulator);

    let result = provisioner
        .provision(&ProvisionRequest::simulator("v2-simulation", "4.0", 1))
        .await;
    match result {
        Ok(env) => panic!("started against someone else's listener: {:?}", env.info().contact_points),
        Err(EnvError::ProvisionTimeout { .. }) | Err(EnvError::AddressesExhausted { .. }) => {}
        Err(other) => panic!("unexpected error: {other}"),
    }
}
