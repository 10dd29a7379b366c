use std::sync::Arc;
use std::time::Duration;

use rnfleet::config::SessionOptions;
use rnfleet::error::{ErrorKind, NetError};
use rnfleet::profile::{Credentials, DeviceKind, DeviceProfile};
use rnfleet::session::{ConfigChange, Session, SessionState, TxState, VerifyCheck};
use rnfleet::transport::{SimDevice, SimDeviceHandle, SimTransport};

const RUNNING_CONFIG: &str = include_str!("fixtures/ios_running_config.txt");
const HOST: &str = "10.0.0.1";
const BACKUP: &str = concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/tests/fixtures/ios_backup_config.txt"
);

fn lab() -> (SimTransport, SimDeviceHandle) {
    let transport = SimTransport::new();
    let device = transport.add_device(
        HOST,
        SimDevice::new("R1", DeviceKind::CiscoIos)
            .with_enable_secret("en")
            .with_running_config(RUNNING_CONFIG),
    );
    (transport, device)
}

fn options() -> SessionOptions {
    SessionOptions {
        connect_timeout: Duration::from_secs(5),
        command_timeout: Duration::from_secs(5),
    }
}

async fn open(transport: &SimTransport) -> Session {
    let profile = DeviceProfile::new(HOST, Credentials::password("admin", "admin"), DeviceKind::CiscoIos)
        .with_enable_secret("en");
    Session::open(Arc::new(transport.clone()), profile, options(), None)
        .await
        .expect("session should open")
}

fn expect_apply_error(result: Result<rnfleet::session::ConfigTransaction, NetError>) -> NetError {
    match result {
        Ok(tx) => panic!("change should not commit: {tx:?}"),
        Err(err) => err,
    }
}

#[tokio::test]
async fn committed_change_discards_the_snapshot() {
    let (transport, device) = lab();
    let mut session = open(&transport).await;

    let change = ConfigChange::new(
        "add loopback1",
        ["interface Loopback1", "ip address 198.51.100.1 255.255.255.255"],
    )
    .with_verify(VerifyCheck::contains("show running-config", "interface Loopback1"));

    let tx = session.apply(&change).await.expect("change should commit");
    assert!(tx.committed());
    assert_eq!(tx.state, TxState::Closed);
    assert!(tx.snapshot.is_none());
    assert_eq!(tx.applied, change.commands);
    assert!(tx.rollback_commands.is_empty());
    assert_eq!(
        device.section("interface Loopback1"),
        Some(vec!["ip address 198.51.100.1 255.255.255.255".to_string()])
    );
    assert_eq!(session.state(), SessionState::Privileged);
    assert_eq!(session.mode(), "enable");
}

#[tokio::test]
async fn rejected_command_rolls_the_interface_back_up() {
    let (transport, device) = lab();
    device.reject("speed 100000");
    let mut session = open(&transport).await;

    let change = ConfigChange::new(
        "shut uplink",
        ["interface GigabitEthernet0/1", "shutdown", "speed 100000"],
    );
    let err = expect_apply_error(session.apply(&change).await);

    let NetError::ApplyError { cause, report, .. } = &err else {
        panic!("expected ApplyError, got {err}");
    };
    assert_eq!(cause.kind(), ErrorKind::Device);
    assert!(report.rolled_back());
    assert_eq!(report.state, TxState::Closed);
    assert_eq!(report.applied, vec!["interface GigabitEthernet0/1", "shutdown"]);
    assert_eq!(
        report.rollback_commands,
        vec!["interface GigabitEthernet0/1", "no shutdown", "exit"]
    );
    assert_eq!(
        report.history,
        vec![
            TxState::Created,
            TxState::SnapshotTaken,
            TxState::Applying,
            TxState::RollingBack,
            TxState::RolledBack,
            TxState::Closed,
        ]
    );

    let status = session
        .run_one("show interfaces GigabitEthernet0/1", Duration::from_secs(5))
        .await
        .expect("status");
    assert!(status.output.contains("is up, line protocol is up"));
    assert!(
        !device
            .section("interface GigabitEthernet0/1")
            .expect("section")
            .contains(&"shutdown".to_string())
    );
}

#[tokio::test]
async fn rejected_shutdown_leaves_the_interface_up() {
    let (transport, device) = lab();
    device.reject("shutdown");
    let mut session = open(&transport).await;
    let before = device.running_config();

    let change = ConfigChange::new("shut uplink", ["interface GigabitEthernet0/1", "shutdown"])
        .with_verify(VerifyCheck::contains(
            "show interfaces GigabitEthernet0/1",
            "administratively down",
        ));
    let err = expect_apply_error(session.apply(&change).await);

    let NetError::ApplyError { cause, report, .. } = &err else {
        panic!("expected ApplyError, got {err}");
    };
    match cause.as_ref() {
        NetError::DeviceError { command, .. } => assert_eq!(command, "shutdown"),
        other => panic!("unexpected cause: {other}"),
    }
    assert!(report.rolled_back());
    assert!(report.rollback_commands.is_empty());
    assert_eq!(device.running_config(), before);

    let status = session
        .run_one("show interfaces GigabitEthernet0/1", Duration::from_secs(5))
        .await
        .expect("status");
    assert!(status.output.contains("is up, line protocol is up"));
}

#[tokio::test]
async fn failed_verification_restores_the_previous_value() {
    let (transport, device) = lab();
    let mut session = open(&transport).await;
    let before = device.running_config();

    let change = ConfigChange::new(
        "reserve gi0/2",
        ["interface GigabitEthernet0/2", "description reserved"],
    )
    .with_verify(VerifyCheck::contains(
        "show interfaces GigabitEthernet0/2",
        "line protocol is up",
    ));
    let err = expect_apply_error(session.apply(&change).await);

    let NetError::ApplyError { cause, report, .. } = &err else {
        panic!("expected ApplyError, got {err}");
    };
    assert!(matches!(**cause, NetError::VerifyFailed(_)));
    assert!(report.history.contains(&TxState::Verifying));
    assert_eq!(
        report.rollback_commands,
        vec![
            "interface GigabitEthernet0/2",
            "no description reserved",
            "description spare",
            "exit",
        ]
    );
    assert_eq!(device.running_config(), before);
}

#[tokio::test]
async fn connection_drop_mid_apply_reconnects_and_rolls_back() {
    let (transport, device) = lab();
    device.drop_on("description maintenance");
    let mut session = open(&transport).await;

    let change = ConfigChange::new(
        "maintenance",
        [
            "interface GigabitEthernet0/1",
            "shutdown",
            "description maintenance",
        ],
    );
    let err = expect_apply_error(session.apply(&change).await);

    let NetError::ApplyError { cause, report, .. } = &err else {
        panic!("expected ApplyError, got {err}");
    };
    assert!(matches!(**cause, NetError::ChannelDisconnectError));
    assert_eq!(report.applied, vec!["interface GigabitEthernet0/1", "shutdown"]);
    assert!(report.rolled_back());
    assert_eq!(transport.connect_count(), 2);
    assert_eq!(session.state(), SessionState::Privileged);

    let lines = device
        .section("interface GigabitEthernet0/1")
        .expect("section");
    assert!(!lines.contains(&"shutdown".to_string()));
    assert!(lines.contains(&"description uplink to core".to_string()));
}

#[tokio::test]
async fn explicit_rollback_runs_verbatim_without_confirmation() {
    let (transport, device) = lab();
    device.reject("speed 100000");
    let mut session = open(&transport).await;

    let change = ConfigChange::new(
        "maintenance",
        [
            "interface GigabitEthernet0/1",
            "description maintenance",
            "shutdown",
            "speed 100000",
        ],
    )
    .with_explicit_rollback(["interface GigabitEthernet0/1", "no shutdown", "exit"])
    .with_confirm_rollback(false);
    let err = expect_apply_error(session.apply(&change).await);

    let report = err.transaction().expect("report");
    assert!(report.rolled_back());
    assert_eq!(
        report.rollback_commands,
        vec!["interface GigabitEthernet0/1", "no shutdown", "exit"]
    );

    // The explicit plan only restores the admin state.
    let lines = device
        .section("interface GigabitEthernet0/1")
        .expect("section");
    assert!(!lines.contains(&"shutdown".to_string()));
    assert!(lines.contains(&"description maintenance".to_string()));
}

#[tokio::test]
async fn failed_rollback_is_fatal() {
    let (transport, device) = lab();
    device.reject("speed 100000");
    device.reject("no shutdown");
    let mut session = open(&transport).await;

    let change = ConfigChange::new(
        "shut uplink",
        ["interface GigabitEthernet0/1", "shutdown", "speed 100000"],
    );
    let err = expect_apply_error(session.apply(&change).await);

    assert!(err.is_fatal());
    assert!(!err.is_retryable());
    let NetError::RollbackFailedError { detail, report, .. } = &err else {
        panic!("expected RollbackFailedError, got {err}");
    };
    assert!(detail.contains("no shutdown"));
    assert_eq!(report.state, TxState::Closed);
    assert!(report.history.contains(&TxState::RollbackFailed));
    assert!(!report.rolled_back());
}

#[tokio::test]
async fn snapshot_failure_sends_no_configuration() {
    let (transport, device) = lab();
    device.reject("show running-config");
    let mut session = open(&transport).await;

    let change = ConfigChange::new("shut uplink", ["interface GigabitEthernet0/1", "shutdown"]);
    let err = expect_apply_error(session.apply(&change).await);

    let report = err.transaction().expect("report");
    assert_eq!(report.history, vec![TxState::Created, TxState::Closed]);
    assert!(report.applied.is_empty());
    assert!(!device.history().iter().any(|cmd| cmd == "configure terminal"));
}

#[tokio::test]
async fn mutating_verify_command_is_refused_before_anything_is_sent() {
    let (transport, device) = lab();
    let mut session = open(&transport).await;
    let sent_before = device.history().len();

    let change = ConfigChange::new("bad verify", ["interface GigabitEthernet0/1", "shutdown"])
        .with_verify(VerifyCheck::contains("clear counters", "cleared"));
    let err = expect_apply_error(session.apply(&change).await);

    assert!(matches!(err, NetError::InvalidTransaction(_)));
    assert_eq!(device.history().len(), sent_before);
}

#[tokio::test]
async fn backup_restore_merges_the_saved_configuration() {
    let (transport, device) = lab();
    let mut session = open(&transport).await;

    let change = ConfigChange::from_backup_file(BACKUP, DeviceKind::CiscoIos)
        .expect("backup should load")
        .with_verify(VerifyCheck::contains("show running-config", "interface Loopback9"));
    let tx = session.apply(&change).await.expect("restore should commit");

    assert!(tx.committed());
    assert_eq!(
        device.section("interface Loopback9"),
        Some(vec!["ip address 203.0.113.9 255.255.255.255".to_string()])
    );
    let uplink = device
        .section("interface GigabitEthernet0/1")
        .expect("section");
    assert!(uplink.contains(&"description uplink to core-2".to_string()));
    assert!(!uplink.contains(&"description uplink to core".to_string()));
    assert!(device.has_global("ntp server 192.0.2.123"));
    assert_eq!(session.state(), SessionState::Privileged);
}

#[tokio::test]
async fn rejected_backup_line_restores_the_previous_configuration() {
    let (transport, device) = lab();
    device.reject("ip address 203.0.113.9 255.255.255.255");
    let mut session = open(&transport).await;
    let before = device.running_config();

    let change = ConfigChange::from_backup_file(BACKUP, DeviceKind::CiscoIos).expect("backup");
    let err = expect_apply_error(session.apply(&change).await);

    let NetError::ApplyError { report, .. } = &err else {
        panic!("expected ApplyError, got {err}");
    };
    assert!(report.rolled_back());
    assert!(
        report
            .rollback_commands
            .contains(&"no interface Loopback9".to_string())
    );
    assert_eq!(device.running_config(), before);
    assert!(device.section("interface Loopback9").is_none());
}

#[test]
fn missing_backup_file_is_an_invalid_transaction() {
    let err = ConfigChange::from_backup_file(
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/missing.cfg"),
        DeviceKind::CiscoIos,
    )
    .expect_err("missing file");
    assert!(matches!(err, NetError::InvalidTransaction(msg) if msg.contains("missing.cfg")));
}
