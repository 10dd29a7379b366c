use std::sync::Arc;
use std::time::Duration;

use rnfleet::config::SessionOptions;
use rnfleet::error::{ErrorKind, NetError};
use rnfleet::profile::{Credentials, DeviceKind, DeviceProfile};
use rnfleet::session::{
    CommandBatch, Session, SessionEvent, SessionRecordLevel, SessionRecorder, SessionState,
};
use rnfleet::transport::{SimDevice, SimDeviceHandle, SimTransport};

const RUNNING_CONFIG: &str = include_str!("fixtures/ios_running_config.txt");
const HOST: &str = "10.0.0.1";
const TIMEOUT: Duration = Duration::from_secs(5);

fn lab() -> (SimTransport, SimDeviceHandle) {
    let transport = SimTransport::new();
    let device = transport.add_device(
        HOST,
        SimDevice::new("R1", DeviceKind::CiscoIos)
            .with_enable_secret("en")
            .with_running_config(RUNNING_CONFIG)
            .with_output(
                "show version | include uptime",
                "edge-r1 uptime is 3 weeks, 2 days, 4 hours, 12 minutes",
            )
            .with_output("show clock", "*10:15:01.123 UTC Mon Oct 19 2026"),
    );
    (transport, device)
}

fn profile() -> DeviceProfile {
    DeviceProfile::new(HOST, Credentials::password("admin", "admin"), DeviceKind::CiscoIos)
        .with_enable_secret("en")
}

fn options() -> SessionOptions {
    SessionOptions {
        connect_timeout: TIMEOUT,
        command_timeout: TIMEOUT,
    }
}

async fn open(transport: &SimTransport, recorder: Option<SessionRecorder>) -> Session {
    Session::open(Arc::new(transport.clone()), profile(), options(), recorder)
        .await
        .expect("session should open")
}

#[tokio::test]
async fn uptime_query_returns_device_output() {
    let (transport, _device) = lab();
    let mut session = open(&transport, None).await;

    let batch = CommandBatch::new(["show version | include uptime"]);
    assert!(!batch.mutating);
    let result = session.run_batch(&batch, TIMEOUT, false).await;

    assert!(result.is_success());
    assert_eq!(result.results.len(), 1);
    assert_eq!(result.results[0].command, "show version | include uptime");
    assert_eq!(
        result.results[0].output,
        "edge-r1 uptime is 3 weeks, 2 days, 4 hours, 12 minutes"
    );
    assert_eq!(session.prompt(), "edge-r1#");
}

#[tokio::test]
async fn repeated_query_yields_identical_results() {
    let (transport, _device) = lab();
    let mut session = open(&transport, None).await;
    let batch = CommandBatch::new([
        "show version | include uptime",
        "show interfaces GigabitEthernet0/1",
        "show clock",
    ]);

    let first = session.run_batch(&batch, TIMEOUT, false).await;
    let second = session.run_batch(&batch, TIMEOUT, false).await;
    assert!(first.is_success());
    assert_eq!(first, second);
}

#[tokio::test]
async fn query_continues_past_a_rejected_command() {
    let (transport, _device) = lab();
    let mut session = open(&transport, None).await;
    let batch = CommandBatch::new([
        "show version | include uptime",
        "show bogus",
        "show interfaces GigabitEthernet0/2",
    ]);

    let result = session
        .run_batch(&batch, TIMEOUT, batch.default_stop_on_error())
        .await;

    assert_eq!(result.results.len(), 3);
    assert!(!result.truncated);
    assert!(result.results[0].success);
    assert!(!result.results[1].success);
    assert_eq!(
        result.results[1].error.as_ref().map(|e| e.kind),
        Some(ErrorKind::Device)
    );
    assert!(result.results[1].output.contains("Invalid input"));
    assert!(
        result.results[2]
            .output
            .contains("administratively down")
    );
    assert!(matches!(result.failure, Some(NetError::DeviceError { .. })));
}

#[tokio::test]
async fn stop_on_error_truncates_the_batch() {
    let (transport, device) = lab();
    let mut session = open(&transport, None).await;
    let batch = CommandBatch::new(["show bogus", "show clock"]);

    let result = session.run_batch(&batch, TIMEOUT, true).await;

    assert_eq!(result.results.len(), 1);
    assert!(result.truncated);
    assert!(!result.is_success());
    assert!(!device.history().iter().any(|cmd| cmd == "show clock"));
}

#[tokio::test]
async fn hanging_command_times_out_with_its_name() {
    let (transport, device) = lab();
    device.hang("show tech-support");
    let mut session = open(&transport, None).await;

    let err = session
        .run_one("show tech-support", Duration::from_millis(300))
        .await
        .expect_err("command should time out");
    match &err {
        NetError::TimeoutError { command, .. } => assert_eq!(command, "show tech-support"),
        other => panic!("unexpected error type: {other}"),
    }
    assert!(err.is_retryable());

    let clock = session
        .run_one("show clock", TIMEOUT)
        .await
        .expect("session still usable");
    assert_eq!(clock.output, "*10:15:01.123 UTC Mon Oct 19 2026");
}

#[tokio::test]
async fn late_output_of_a_timed_out_command_is_not_attributed_to_the_next() {
    let (transport, device) = lab();
    device.delay("show version | include uptime", Duration::from_millis(400));
    device.delay("show clock", Duration::from_millis(400));
    let mut session = open(&transport, None).await;

    let err = session
        .run_one("show version | include uptime", Duration::from_millis(100))
        .await
        .expect_err("command should time out");
    assert!(matches!(err, NetError::TimeoutError { .. }));

    let clock = session
        .run_one("show clock", Duration::from_secs(2))
        .await
        .expect("clock");
    assert_eq!(clock.output, "*10:15:01.123 UTC Mon Oct 19 2026");

    let uptime = session
        .run_one("show version | include uptime", Duration::from_secs(2))
        .await
        .expect("uptime");
    assert_eq!(
        uptime.output,
        "edge-r1 uptime is 3 weeks, 2 days, 4 hours, 12 minutes"
    );
}

#[tokio::test]
async fn dropped_connection_ends_the_batch_and_the_session() {
    let (transport, device) = lab();
    device.drop_on("show logging");
    let mut session = open(&transport, None).await;
    let batch = CommandBatch::new([
        "show version | include uptime",
        "show logging",
        "show clock",
    ]);

    let result = session.run_batch(&batch, TIMEOUT, false).await;

    assert_eq!(result.results.len(), 2);
    assert!(result.truncated);
    assert!(matches!(
        result.failure,
        Some(NetError::ChannelDisconnectError)
    ));
    assert_eq!(session.state(), SessionState::Failed);
    assert!(!session.is_usable());

    let err = session
        .run_one("show clock", TIMEOUT)
        .await
        .expect_err("failed session refuses commands");
    assert!(matches!(err, NetError::SessionStateError { .. }));
}

#[tokio::test]
async fn paged_output_is_collected_in_full() {
    let (transport, device) = lab();
    let log = (1..=40)
        .map(|n| format!("Oct 19 10:{n:02}: %LINK-3-UPDOWN: event {n}"))
        .collect::<Vec<_>>()
        .join("\n");
    device.set_output("show logging", &log);
    let mut session = open(&transport, None).await;

    session
        .run_one("terminal length 24", TIMEOUT)
        .await
        .expect("paging on");
    let result = session
        .run_one("show logging", TIMEOUT)
        .await
        .expect("paged output");

    let lines = result.output.lines().collect::<Vec<_>>();
    assert_eq!(lines.len(), 40);
    assert_eq!(lines[0], "Oct 19 10:01: %LINK-3-UPDOWN: event 1");
    assert_eq!(lines[39], "Oct 19 10:40: %LINK-3-UPDOWN: event 40");
    assert!(!result.output.contains("More"));
}

#[tokio::test]
async fn nxos_sessions_skip_enable() {
    let transport = SimTransport::new();
    let device = transport.add_device(HOST, SimDevice::new("N9K", DeviceKind::CiscoNxos));
    let profile = DeviceProfile::new(HOST, Credentials::password("admin", "admin"), DeviceKind::CiscoNxos);

    let session = Session::open(Arc::new(transport.clone()), profile, options(), None)
        .await
        .expect("session should open");

    assert_eq!(session.state(), SessionState::Privileged);
    assert!(!device.history().iter().any(|cmd| cmd == "enable"));
}

#[tokio::test]
async fn recorder_captures_commands_and_results() {
    let (transport, _device) = lab();
    let recorder = SessionRecorder::new(SessionRecordLevel::KeyEventsOnly);
    let mut session = open(&transport, Some(recorder.clone())).await;

    session
        .run_one("show clock", TIMEOUT)
        .await
        .expect("show clock");
    session.close().await;

    let events = recorder.events_for(&profile().id()).expect("events");
    assert!(matches!(events.first(), Some(SessionEvent::StateChanged { .. })));
    assert!(events.iter().any(|event| matches!(
        event,
        SessionEvent::CommandResult { command, success: true, .. } if command == "show clock"
    )));
    assert!(matches!(
        events.last(),
        Some(SessionEvent::SessionClosed { .. })
    ));

    let jsonl = recorder.to_jsonl().expect("jsonl");
    let restored = SessionRecorder::from_jsonl(&jsonl).expect("restore");
    assert_eq!(restored.entries().expect("entries").len(), events.len());
}
