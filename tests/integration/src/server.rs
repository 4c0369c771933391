//! End-to-end tests for the flowpool-server binary on the memory store.

use crate::helpers::{run_server, TestServer};

const FAST_SCHEDULERS: &str = r#"
[pool]
name = "itest"

[schedulers.leader]
interval = "1s"
initial_delay = "0"

[schedulers.member]
interval = "1s"
initial_delay = "0"
"#;

#[tokio::test]
async fn single_replica_becomes_ready() {
    let server = TestServer::start(FAST_SCHEDULERS);

    let body = server.wait_for_status("/health/ready", 200).await;
    assert_eq!(body["status"], "UP");
    assert_eq!(body["name"], "Lease Acquisition");

    let check = &body["checks"][0];
    assert_eq!(check["leaseAcquired"], true);
    assert_eq!(check["leaseName"], "flow-pool-member-itest-00");
    assert_eq!(check["poolName"], "itest");
    assert_eq!(check["podName"], "itest-0");
    assert_eq!(check["podNamespace"], "itest");
}

#[tokio::test]
async fn liveness_answers_regardless_of_membership() {
    let server = TestServer::start(FAST_SCHEDULERS);
    let body = server.wait_for_status("/health/live", 200).await;
    assert_eq!(body["status"], "UP");
}

#[tokio::test]
async fn member_disabled_is_ready_without_a_lease() {
    let config = format!("{FAST_SCHEDULERS}\n[lease.member]\nenabled = false\n");
    let server = TestServer::start(&config);

    let body = server.wait_for_status("/health/ready", 200).await;
    let check = &body["checks"][0];
    assert_eq!(check["leaseEnabled"], false);
    assert_eq!(check["leaseAcquired"], false);
    assert_eq!(check["reason"], "member lease is not enabled");
}

#[test]
fn config_template_is_printed() {
    let output = run_server(&["--config-template"]);
    assert!(output.status.success(), "exit code: {:?}", output.status);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("await_lease_timeout"), "stdout: {stdout}");
    assert!(stdout.contains("[schedulers.member]"), "stdout: {stdout}");
}

#[test]
fn unknown_store_is_rejected() {
    let output = run_server(&["--store", "etcd", "--identity", "local"]);
    assert_eq!(output.status.code(), Some(1));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown store"), "stderr: {stderr}");
}
