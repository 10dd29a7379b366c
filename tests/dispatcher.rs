use std::sync::Arc;
use std::time::Duration;

use rnfleet::config::DispatcherConfig;
use rnfleet::error::{ConnectError, NetError};
use rnfleet::profile::{Credentials, DeviceKind, DeviceProfile};
use rnfleet::session::{
    CommandBatch, ConfigChange, DeviceOutcome, Dispatcher, Job, Operation, OperationOutput,
};
use rnfleet::transport::{SimDevice, SimDeviceHandle, SimTransport};
use tokio_util::sync::CancellationToken;

const RUNNING_CONFIG: &str = include_str!("fixtures/ios_running_config.txt");
const UPTIME: &str = "show version | include uptime";

fn add_router(transport: &SimTransport, host: &str, name: &str) -> SimDeviceHandle {
    transport.add_device(
        host,
        SimDevice::new(name, DeviceKind::CiscoIos)
            .with_enable_secret("en")
            .with_output(UPTIME, format!("{name} uptime is 1 week, 3 days")),
    )
}

fn profile(host: &str) -> DeviceProfile {
    DeviceProfile::new(host, Credentials::password("admin", "admin"), DeviceKind::CiscoIos)
        .with_enable_secret("en")
}

fn dispatcher(transport: &SimTransport, max_sessions: usize) -> Dispatcher {
    let config = DispatcherConfig {
        max_sessions,
        command_timeout_secs: 5,
        connect_timeout_secs: 5,
    };
    Dispatcher::new(Arc::new(transport.clone()), config).expect("valid config")
}

fn uptime_query() -> Operation {
    Operation::query(CommandBatch::new([UPTIME]))
}

fn query_output(outcome: Option<&DeviceOutcome>) -> String {
    match outcome {
        Some(DeviceOutcome::Success(OperationOutput::Query(batch))) => batch.outputs().join("\n"),
        other => panic!("expected a successful query, got {other:?}"),
    }
}

#[tokio::test]
async fn unreachable_device_does_not_affect_the_others() {
    let transport = SimTransport::new();
    add_router(&transport, "10.0.0.1", "R1");
    add_router(&transport, "10.0.0.2", "R2");
    add_router(&transport, "10.0.0.3", "R3");
    transport.set_unreachable("10.0.0.3");
    let profiles = ["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"]
        .map(profile)
        .to_vec();

    let report = dispatcher(&transport, 8).execute(&profiles, uptime_query()).await;

    assert_eq!(report.len(), 4);
    assert!(!report.degraded);
    assert_eq!(
        query_output(report.first(&profiles[0].id())),
        "R1 uptime is 1 week, 3 days"
    );
    assert_eq!(
        query_output(report.first(&profiles[1].id())),
        "R2 uptime is 1 week, 3 days"
    );
    for unreachable in &profiles[2..] {
        assert!(matches!(
            report.first(&unreachable.id()),
            Some(DeviceOutcome::Failed(NetError::Connect(
                ConnectError::UnreachableError { .. }
            )))
        ));
    }
    assert_eq!(transport.open_sessions(), 0);
}

#[tokio::test]
async fn open_sessions_never_exceed_the_limit() {
    let transport = SimTransport::new();
    let mut profiles = Vec::new();
    for n in 1..=5 {
        let host = format!("10.0.1.{n}");
        let device = add_router(&transport, &host, &format!("SW{n}"));
        device.delay(UPTIME, Duration::from_millis(100));
        profiles.push(profile(&host));
    }

    let report = dispatcher(&transport, 2).execute(&profiles, uptime_query()).await;

    assert_eq!(report.len(), 5);
    assert!(
        report
            .devices
            .values()
            .all(|outcomes| outcomes.iter().all(DeviceOutcome::is_success))
    );
    assert_eq!(transport.peak_sessions(), 2);
    assert_eq!(transport.connect_count(), 5);
    assert_eq!(transport.open_sessions(), 0);
}

#[tokio::test]
async fn jobs_for_one_device_run_in_submission_order_on_one_session() {
    let transport = SimTransport::new();
    let device = add_router(&transport, "10.0.0.1", "R1");
    let target = profile("10.0.0.1");

    let jobs = vec![
        Job::new(
            target.clone(),
            Operation::configure(ConfigChange::new(
                "describe gi0/1",
                ["interface GigabitEthernet0/1", "description first"],
            )),
        ),
        Job::new(
            target.clone(),
            Operation::query(CommandBatch::new(["show interfaces GigabitEthernet0/1"])),
        ),
        Job::new(
            target.clone(),
            Operation::configure(ConfigChange::new(
                "redescribe gi0/1",
                ["interface GigabitEthernet0/1", "description second"],
            )),
        ),
    ];

    let report = dispatcher(&transport, 4).execute_jobs(jobs).await;

    let outcomes = report.outcomes(&target.id()).expect("outcomes");
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(DeviceOutcome::is_success));
    assert!(matches!(
        &outcomes[0],
        DeviceOutcome::Success(OperationOutput::Configure(tx)) if tx.committed()
    ));
    assert_eq!(transport.connect_count(), 1);

    let history = device.history();
    let position = |command: &str| {
        history
            .iter()
            .position(|sent| sent == command)
            .unwrap_or_else(|| panic!("'{command}' was never sent"))
    };
    assert!(position("description first") < position("show interfaces GigabitEthernet0/1"));
    assert!(position("show interfaces GigabitEthernet0/1") < position("description second"));
    assert_eq!(
        device.section("interface GigabitEthernet0/1"),
        Some(vec!["description second".to_string()])
    );
}

#[tokio::test]
async fn concurrent_runs_serialize_on_the_same_device() {
    let transport = SimTransport::new();
    let device = add_router(&transport, "10.0.0.1", "R1");
    device.delay(UPTIME, Duration::from_millis(100));
    let profiles = vec![profile("10.0.0.1")];
    let dispatcher = dispatcher(&transport, 8);

    let (first, second) = tokio::join!(
        dispatcher.execute(&profiles, uptime_query()),
        dispatcher.execute(&profiles, uptime_query()),
    );

    assert!(first.first(&profiles[0].id()).is_some_and(DeviceOutcome::is_success));
    assert!(second.first(&profiles[0].id()).is_some_and(DeviceOutcome::is_success));
    assert_eq!(transport.peak_sessions(), 1);
    assert_eq!(transport.connect_count(), 2);
}

#[tokio::test]
async fn cancelled_before_start_sends_nothing() {
    let transport = SimTransport::new();
    add_router(&transport, "10.0.0.1", "R1");
    add_router(&transport, "10.0.0.2", "R2");
    let profiles = vec![profile("10.0.0.1"), profile("10.0.0.2")];
    let dispatcher = dispatcher(&transport, 2);

    let token = CancellationToken::new();
    token.cancel();
    let report = dispatcher
        .execute_until(&profiles, uptime_query(), token)
        .await;

    for target in &profiles {
        assert!(matches!(
            report.first(&target.id()),
            Some(DeviceOutcome::Failed(NetError::Cancelled))
        ));
    }
    assert_eq!(transport.connect_count(), 0);

    let report = dispatcher.execute(&profiles, uptime_query()).await;
    assert!(
        profiles
            .iter()
            .all(|target| report.first(&target.id()).is_some_and(DeviceOutcome::is_success))
    );
}

#[tokio::test]
async fn runs_after_a_dispatcher_cancel_still_execute() {
    let transport = SimTransport::new();
    let device = add_router(&transport, "10.0.0.1", "R1");
    device.delay(UPTIME, Duration::from_millis(300));
    let profiles = vec![profile("10.0.0.1")];
    let dispatcher = Arc::new(dispatcher(&transport, 1));

    let cancelling = dispatcher.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancelling.cancel();
    });
    let report = dispatcher.execute(&profiles, uptime_query()).await;
    assert!(matches!(
        report.first(&profiles[0].id()),
        Some(DeviceOutcome::Failed(NetError::TimeoutError { .. } | NetError::Cancelled))
    ));

    device.delay(UPTIME, Duration::ZERO);
    let report = dispatcher.execute(&profiles, uptime_query()).await;
    assert_eq!(
        query_output(report.first(&profiles[0].id())),
        "R1 uptime is 1 week, 3 days"
    );
    assert_eq!(transport.open_sessions(), 0);
}

#[tokio::test]
async fn cancelling_a_sent_command_reports_a_timeout() {
    let transport = SimTransport::new();
    let device = add_router(&transport, "10.0.0.1", "R1");
    device.hang("show tech-support");
    let profiles = vec![profile("10.0.0.1")];
    let config = DispatcherConfig {
        max_sessions: 1,
        command_timeout_secs: 60,
        connect_timeout_secs: 5,
    };
    let dispatcher = Dispatcher::new(Arc::new(transport.clone()), config).expect("valid config");

    let token = dispatcher.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        token.cancel();
    });
    let report = dispatcher
        .execute(
            &profiles,
            Operation::query(CommandBatch::new(["show tech-support"])),
        )
        .await;

    match report.first(&profiles[0].id()) {
        Some(DeviceOutcome::Failed(NetError::TimeoutError { command, .. })) => {
            assert_eq!(command, "show tech-support")
        }
        other => panic!("expected a timeout, got {other:?}"),
    }
    assert_eq!(transport.open_sessions(), 0);
}

#[tokio::test]
async fn failed_rollback_aborts_the_rest_of_the_device_queue() {
    let transport = SimTransport::new();
    let broken = transport.add_device(
        "10.0.0.1",
        SimDevice::new("R1", DeviceKind::CiscoIos)
            .with_enable_secret("en")
            .with_running_config(RUNNING_CONFIG)
            .with_output(UPTIME, "R1 uptime is 1 week, 3 days"),
    );
    broken.reject("speed 100000");
    broken.reject("no shutdown");
    add_router(&transport, "10.0.0.2", "R2");
    let (r1, r2) = (profile("10.0.0.1"), profile("10.0.0.2"));

    let change = ConfigChange::new(
        "shut uplink",
        ["interface GigabitEthernet0/1", "shutdown", "speed 100000"],
    );
    let jobs = vec![
        Job::new(r1.clone(), Operation::configure(change)),
        Job::new(r1.clone(), uptime_query()),
        Job::new(r2.clone(), uptime_query()),
    ];

    let report = dispatcher(&transport, 4).execute_jobs(jobs).await;

    assert!(report.degraded);
    let outcomes = report.outcomes(&r1.id()).expect("outcomes");
    assert!(matches!(
        &outcomes[0],
        DeviceOutcome::Failed(NetError::RollbackFailedError { .. })
    ));
    let DeviceOutcome::Failed(NetError::RollbackFailedError { report: tx, .. }) = &outcomes[0] else {
        unreachable!();
    };
    assert_eq!(
        tx.rollback_commands,
        vec!["interface GigabitEthernet0/1", "no shutdown", "exit"]
    );
    assert!(matches!(&outcomes[1], DeviceOutcome::Failed(NetError::Aborted(_))));
    assert!(
        !broken
            .history()
            .iter()
            .any(|command| command == UPTIME)
    );
    assert!(report.first(&r2.id()).is_some_and(DeviceOutcome::is_success));
}

#[tokio::test]
async fn partially_failed_query_keeps_collected_results() {
    let transport = SimTransport::new();
    add_router(&transport, "10.0.0.1", "R1");
    let profiles = vec![profile("10.0.0.1")];

    let report = dispatcher(&transport, 1)
        .execute(
            &profiles,
            Operation::query(CommandBatch::new([UPTIME, "show bogus"])),
        )
        .await;

    match report.first(&profiles[0].id()) {
        Some(DeviceOutcome::Partial(OperationOutput::Query(batch))) => {
            assert_eq!(batch.results.len(), 2);
            assert!(batch.results[0].success);
            assert!(!batch.results[1].success);
        }
        other => panic!("expected a partial result, got {other:?}"),
    }
    assert!(!report.degraded);
}

#[tokio::test]
async fn query_where_every_command_fails_keeps_each_result() {
    let transport = SimTransport::new();
    add_router(&transport, "10.0.0.1", "R1");
    let profiles = vec![profile("10.0.0.1")];

    let report = dispatcher(&transport, 1)
        .execute(
            &profiles,
            Operation::query(CommandBatch::new(["show bogus1", "show bogus2", "show bogus3"])),
        )
        .await;

    match report.first(&profiles[0].id()) {
        Some(DeviceOutcome::Partial(OperationOutput::Query(batch))) => {
            assert_eq!(batch.results.len(), 3);
            assert!(batch.results.iter().all(|result| !result.success));
            assert!(batch.failure.is_some());
        }
        other => panic!("expected a partial result, got {other:?}"),
    }
}

#[test]
fn zero_sessions_is_rejected() {
    let config = DispatcherConfig {
        max_sessions: 0,
        ..DispatcherConfig::default()
    };
    let result = Dispatcher::new(Arc::new(SimTransport::new()), config);
    assert!(matches!(result, Err(NetError::InvalidConfig(_))));
}
