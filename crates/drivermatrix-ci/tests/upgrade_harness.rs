//! Integration tests for the rolling-upgrade harness against fake clusters.

use std::sync::Arc;
use std::time::Duration;

use drivermatrix_ci::{UpgradeConfig, UpgradeHarness, UpgradeState};
use drivermatrix_env::fakes::FakeProvisioner;
use drivermatrix_env::{Environment, ProvisionRequest, Provisioner};

fn harness(max_error_rate: f64) -> UpgradeHarness {
    UpgradeHarness::new(UpgradeConfig {
        max_error_rate,
        operations_per_phase: 50,
        operation_interval_ms: 0,
        ..Default::default()
    })
}

async fn cluster(provisioner: &FakeProvisioner, label: &str) -> Arc<dyn Environment> {
    provisioner
        .provision(&ProvisionRequest::cluster(label, "3.11", 3))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_error_rate_within_threshold_is_verified() {
    let provisioner = FakeProvisioner::new().with_upgrade_error_rate(0.02);
    let env = cluster(&provisioner, "within").await;

    let report = harness(0.05).run(env.as_ref(), "4.0").await;

    assert_eq!(report.final_state, UpgradeState::Verified);
    assert_eq!(
        report.transitions,
        vec![
            UpgradeState::BaselineRunning,
            UpgradeState::SwapInProgress,
            UpgradeState::PostSwapRunning,
            UpgradeState::Verified,
        ]
    );
    assert!(env.observe_health().await.unwrap().converged_on("4.0"));
    let swap = report.phase(UpgradeState::SwapInProgress).unwrap();
    assert!(swap.issued >= 3, "operations must keep flowing during swaps");
}

#[tokio::test]
async fn test_error_rate_above_threshold_fails() {
    let provisioner = FakeProvisioner::new().with_upgrade_error_rate(0.5);
    let env = cluster(&provisioner, "above").await;

    let report = harness(0.05).run(env.as_ref(), "4.0").await;

    assert_eq!(report.final_state, UpgradeState::Failed);
    assert_eq!(
        report.transitions,
        vec![
            UpgradeState::BaselineRunning,
            UpgradeState::SwapInProgress,
            UpgradeState::Failed,
        ]
    );
    let swap = report.phase(UpgradeState::SwapInProgress).unwrap();
    assert!(swap.error_rate() > 0.05);
    assert!(report.detail.unwrap().contains("swap error rate"));
}

#[tokio::test]
async fn test_operations_flow_while_a_slow_swap_runs() {
    let provisioner = FakeProvisioner::new().with_swap_delay(Duration::from_millis(30));
    let env = cluster(&provisioner, "slow").await;
    let harness = UpgradeHarness::new(UpgradeConfig {
        operations_per_phase: 3,
        operation_interval_ms: 1,
        ..Default::default()
    });

    let report = harness.run(env.as_ref(), "4.0").await;

    assert!(report.verified());
    let swap = report.phase(UpgradeState::SwapInProgress).unwrap();
    // At least one operation per node, and more while each swap is pending.
    assert!(swap.issued > 3);
}

#[tokio::test]
async fn test_failed_node_swap_fails_upgrade() {
    let provisioner = FakeProvisioner::new().failing_swap(1);
    let env = cluster(&provisioner, "swapfail").await;

    let report = harness(0.05).run(env.as_ref(), "4.0").await;

    assert_eq!(report.final_state, UpgradeState::Failed);
    assert!(report.detail.unwrap().contains("node2"));
    let health = env.observe_health().await.unwrap();
    assert_eq!(health.nodes[0].version, "4.0");
    assert_eq!(health.nodes[2].version, "3.11");
}

#[tokio::test]
async fn test_unavailability_window_bound() {
    let provisioner = FakeProvisioner::new()
        .with_upgrade_error_rate(1.0)
        .with_swap_delay(Duration::from_millis(40));
    let env = cluster(&provisioner, "window").await;
    let harness = UpgradeHarness::new(UpgradeConfig {
        max_error_rate: 1.0,
        max_unavailable_window_ms: Some(10),
        operations_per_phase: 3,
        operation_interval_ms: 1,
        ..Default::default()
    });

    let report = harness.run(env.as_ref(), "4.0").await;

    assert_eq!(report.final_state, UpgradeState::Failed);
    assert!(report.detail.unwrap().contains("unavailability window"));
}

#[tokio::test]
async fn test_simulator_cannot_be_upgraded() {
    let provisioner = FakeProvisioner::new();
    let env = provisioner
        .provision(&ProvisionRequest::simulator("sim", "4.0", 1))
        .await
        .unwrap();

    let report = harness(0.05).run(env.as_ref(), "5.0").await;

    assert_eq!(report.final_state, UpgradeState::Failed);
    assert!(report.detail.unwrap().contains("node swap"));
}
