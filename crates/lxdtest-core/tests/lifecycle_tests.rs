//! Lifecycle tests against the mock hypervisor.
//!
//! Every wait interval is zero so the bounded polls run instantly.

use lxdtest_config::{DriverConfig, TransportConfig};
use lxdtest_core::test_support::{MockCall, MockHypervisor, MockSession, MockSessionFactory};
use lxdtest_core::{CoreError, DestroyOutcome, InstanceState, LifecycleController, LxdTransport, TestInstance};
use lxdtest_provider::ContainerStatus;
use std::sync::Arc;
use tempfile::TempDir;

const PUBLIC_KEY: &str =
    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl test@example.com";

/// A private key file with a valid sibling `.pub`
fn key_dir() -> TempDir {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("id_ed25519"), "private").unwrap();
    std::fs::write(tmp.path().join("id_ed25519.pub"), PUBLIC_KEY).unwrap();
    tmp
}

fn driver_config(keys: &TempDir) -> DriverConfig {
    DriverConfig {
        ssh_key: Some(keys.path().join("id_ed25519").display().to_string()),
        wait_interval_secs: 0,
        ..Default::default()
    }
}

fn transport(driver: &DriverConfig, session: Arc<MockSession>) -> LxdTransport {
    let config = TransportConfig {
        ready_interval_secs: 0,
        ..Default::default()
    };
    LxdTransport::new(config, driver).with_session_factory(Arc::new(MockSessionFactory::new(session)))
}

struct Harness {
    mock: Arc<MockHypervisor>,
    session: Arc<MockSession>,
    controller: LifecycleController,
    transport: LxdTransport,
    _keys: TempDir,
}

fn harness(mock: MockHypervisor) -> Harness {
    let keys = key_dir();
    harness_with(mock, driver_config(&keys), keys)
}

fn harness_with(mock: MockHypervisor, driver: DriverConfig, keys: TempDir) -> Harness {
    let mock = Arc::new(mock);
    let session = Arc::new(MockSession::new());
    Harness {
        controller: LifecycleController::new(mock.clone(), driver.clone()),
        transport: transport(&driver, session.clone()),
        mock,
        session,
        _keys: keys,
    }
}

fn instance() -> TestInstance {
    TestInstance::new("default-ubuntu", "ubuntu:22.04")
}

fn position(calls: &[MockCall], pred: impl Fn(&MockCall) -> bool) -> usize {
    calls.iter().position(pred).expect("call not recorded")
}

#[tokio::test]
async fn test_create_launches_and_starts_absent_container() {
    let h = harness(MockHypervisor::new());

    let state = h
        .controller
        .create(&instance(), InstanceState::default(), &h.transport)
        .await
        .unwrap();

    assert_eq!(h.mock.count(|c| matches!(c, MockCall::Launch { .. })), 1);
    assert_eq!(h.mock.count(|c| matches!(c, MockCall::Start { .. })), 1);

    let calls = h.mock.get_calls();
    let launch = position(&calls, |c| matches!(c, MockCall::Launch { .. }));
    let start = position(&calls, |c| matches!(c, MockCall::Start { .. }));
    let first_exec = position(&calls, |c| matches!(c, MockCall::Exec { .. }));
    assert!(launch < start);
    assert!(start < first_exec);
    assert_eq!(
        calls[launch],
        MockCall::Launch {
            name: "default-ubuntu".into(),
            image: "ubuntu:22.04".into()
        }
    );

    assert_eq!(state.name.as_deref(), Some("default-ubuntu"));
    assert_eq!(state.hostname.as_deref(), Some("10.0.0.5"));
    assert_eq!(state.username.as_deref(), Some("ubuntu"));
    assert!(state.ssh_key.is_some());
}

#[tokio::test]
async fn test_create_skips_start_when_launch_yields_running() {
    let h = harness(MockHypervisor::new().status_after_launch(ContainerStatus::Running));

    h.controller
        .create(&instance(), InstanceState::default(), &h.transport)
        .await
        .unwrap();

    assert_eq!(h.mock.count(|c| matches!(c, MockCall::Launch { .. })), 1);
    assert_eq!(h.mock.count(|c| matches!(c, MockCall::Start { .. })), 0);
    assert_eq!(h.mock.exec_commands().len(), 3);
}

#[tokio::test]
async fn test_create_reuses_running_container() {
    let h = harness(MockHypervisor::new().with_container("default-ubuntu", ContainerStatus::Running));

    h.controller
        .create(&instance(), InstanceState::default(), &h.transport)
        .await
        .unwrap();

    assert_eq!(h.mock.count(|c| matches!(c, MockCall::Launch { .. })), 0);
    assert_eq!(h.mock.count(|c| matches!(c, MockCall::Start { .. })), 0);
    assert_eq!(h.mock.exec_commands().len(), 3);
}

#[tokio::test]
async fn test_create_starts_stopped_container_without_launch() {
    let h = harness(MockHypervisor::new().with_container("default-ubuntu", ContainerStatus::Stopped));

    h.controller
        .create(&instance(), InstanceState::default(), &h.transport)
        .await
        .unwrap();

    assert_eq!(h.mock.count(|c| matches!(c, MockCall::Launch { .. })), 0);
    assert_eq!(h.mock.count(|c| matches!(c, MockCall::Start { .. })), 1);
}

#[tokio::test]
async fn test_create_times_out_after_eleven_checks() {
    let h = harness(
        MockHypervisor::new().status_after_start(ContainerStatus::Other("Starting".into())),
    );

    let err = h
        .controller
        .create(&instance(), InstanceState::default(), &h.transport)
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::Timeout { checks: 11, .. }), "{err}");

    let calls = h.mock.get_calls();
    let start = position(&calls, |c| matches!(c, MockCall::Start { .. }));
    let checks = calls[start..]
        .iter()
        .filter(|c| matches!(c, MockCall::List { .. }))
        .count();
    assert_eq!(checks, 11);
    assert!(h.mock.exec_commands().is_empty());
}

#[tokio::test]
async fn test_create_picks_up_transitional_status() {
    let h = harness(
        MockHypervisor::new().status_after_start(ContainerStatus::Other("RUNNING (frozen)".into())),
    );

    h.controller
        .create(&instance(), InstanceState::default(), &h.transport)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_create_without_key_fails_before_exec() {
    let keys = key_dir();
    let driver = DriverConfig {
        ssh_key: None,
        wait_interval_secs: 0,
        ..Default::default()
    };
    let h = harness_with(
        MockHypervisor::new().with_container("default-ubuntu", ContainerStatus::Running),
        driver,
        keys,
    );

    let err = h
        .controller
        .create(&instance(), InstanceState::default(), &h.transport)
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::Configuration(_)));
    assert!(err.to_string().contains("No SSH key provided"));
    assert!(h.mock.exec_commands().is_empty());
}

#[tokio::test]
async fn test_create_with_missing_key_file_fails_before_exec() {
    let keys = key_dir();
    let driver = DriverConfig {
        ssh_key: Some(keys.path().join("absent").display().to_string()),
        wait_interval_secs: 0,
        ..Default::default()
    };
    let h = harness_with(
        MockHypervisor::new().with_container("default-ubuntu", ContainerStatus::Running),
        driver,
        keys,
    );

    let err = h
        .controller
        .create(&instance(), InstanceState::default(), &h.transport)
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::Configuration(_)));
    assert!(h.mock.exec_commands().is_empty());
}

#[tokio::test]
async fn test_provisioning_commands_in_order() {
    let h = harness(MockHypervisor::new().with_container("default-ubuntu", ContainerStatus::Running));

    h.controller
        .create(&instance(), InstanceState::default(), &h.transport)
        .await
        .unwrap();

    let commands = h.mock.exec_commands();
    assert!(commands[0].starts_with("test -f /home/ubuntu/.ssh/authorized_keys"));
    assert_eq!(
        commands[1],
        "echo 'ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl' > /home/ubuntu/.ssh/authorized_keys"
    );
    assert_eq!(commands[2], "chown -R ubuntu:ubuntu /home/ubuntu/.ssh");
}

#[tokio::test]
async fn test_provisioning_failure_stops_sequence() {
    let h = harness(
        MockHypervisor::new()
            .with_container("default-ubuntu", ContainerStatus::Running)
            .fail_exec(2, 1),
    );

    let err = h
        .controller
        .create(&instance(), InstanceState::default(), &h.transport)
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::Provider(_)));
    assert_eq!(err.exit_code(), Some(1));
    assert_eq!(h.mock.exec_commands().len(), 2);
}

#[tokio::test]
async fn test_create_keeps_caller_credentials() {
    let h = harness(MockHypervisor::new().with_container("default-ubuntu", ContainerStatus::Running));
    let prior = InstanceState {
        ssh_key: Some("/home/me/.ssh/other".into()),
        username: Some("kitchen".into()),
        ..Default::default()
    };

    let state = h.controller.create(&instance(), prior, &h.transport).await.unwrap();

    assert_eq!(state.ssh_key.as_deref(), Some("/home/me/.ssh/other"));
    assert_eq!(state.username.as_deref(), Some("kitchen"));
}

#[tokio::test]
async fn test_create_without_ipv4_leaves_hostname_unset() {
    let h = harness(MockHypervisor::new().with_address(None));

    let state = h
        .controller
        .create(&instance(), InstanceState::default(), &h.transport)
        .await
        .unwrap();

    assert_eq!(state.hostname, None);
}

#[tokio::test]
async fn test_create_fails_when_transport_never_ready() {
    let h = harness(MockHypervisor::new().with_container("default-ubuntu", ContainerStatus::Running));
    h.session.set_status(ContainerStatus::Stopped);

    let err = h
        .controller
        .create(&instance(), InstanceState::default(), &h.transport)
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::TransportFailed { exit_code: None, .. }));
    assert_eq!(h.session.status_checks(), 11);
}

#[tokio::test]
async fn test_destroy_absent_container_is_noop() {
    let h = harness(MockHypervisor::new());

    let outcome = h.controller.destroy("default-ubuntu").await.unwrap();

    assert_eq!(outcome, DestroyOutcome::default());
    assert_eq!(h.mock.count(|c| matches!(c, MockCall::Stop { .. })), 0);
    assert_eq!(h.mock.count(|c| matches!(c, MockCall::Delete { .. })), 0);
}

#[tokio::test]
async fn test_destroy_running_container_stops_then_deletes() {
    let h = harness(MockHypervisor::new().with_container("default-ubuntu", ContainerStatus::Running));

    let outcome = h.controller.destroy("default-ubuntu").await.unwrap();

    assert_eq!(
        outcome,
        DestroyOutcome {
            stopped: true,
            deleted: true
        }
    );
    let calls = h.mock.get_calls();
    let stop = position(&calls, |c| matches!(c, MockCall::Stop { .. }));
    let delete = position(&calls, |c| matches!(c, MockCall::Delete { .. }));
    assert!(stop < delete);
    assert!(h.mock.current().is_none());
}

#[tokio::test]
async fn test_destroy_stopped_container_only_deletes() {
    let h = harness(MockHypervisor::new().with_container("default-ubuntu", ContainerStatus::Stopped));

    let outcome = h.controller.destroy("default-ubuntu").await.unwrap();

    assert!(!outcome.stopped);
    assert!(outcome.deleted);
    assert_eq!(h.mock.count(|c| matches!(c, MockCall::Stop { .. })), 0);
}

#[tokio::test]
async fn test_destroy_ignores_prefix_neighbours() {
    let h = harness(MockHypervisor::new().with_container("default-ubuntu-2", ContainerStatus::Running));

    let outcome = h.controller.destroy("default-ubuntu").await.unwrap();

    assert_eq!(outcome, DestroyOutcome::default());
    assert!(h.mock.current().is_some());
}

#[tokio::test]
async fn test_run_forwards_command() {
    let h = harness(MockHypervisor::new().with_container("default-ubuntu", ContainerStatus::Running));

    h.controller.run("default-ubuntu", "uname -a").await.unwrap();

    assert_eq!(h.mock.exec_commands(), vec!["uname -a"]);
}
