//! Collects a health report from a small fleet, toggles one interface and
//! restores a saved baseline.
//!
//! Runs against an in-memory lab by default. Pass
//! `--ssh <host> <user> <password> <enable-secret>` to target a real device.

use std::sync::Arc;

use anyhow::{Context, bail};
use rnfleet::config::DispatcherConfig;
use rnfleet::profile::{Credentials, DeviceKind, DeviceProfile};
use rnfleet::session::{
    CommandBatch, ConfigChange, DeviceOutcome, Dispatcher, Operation, OperationOutput, RunReport,
    VerifyCheck,
};
use rnfleet::transport::{SimDevice, SimTransport, SshTransport, Transport};

const REPORT_COMMANDS: &[&str] = &[
    "show version | include uptime",
    "show interfaces GigabitEthernet0/1 | include input rate|output rate",
    "show mac address-table",
    "show processes cpu sorted | exclude 0.00%",
    "show memory statistics",
];

const INTERFACE: &str = "GigabitEthernet0/1";

/// Saved baseline replayed at the end of the run.
const BASELINE: &str = "!\ninterface GigabitEthernet0/1\n description uplink\n no shutdown\n!\nend\n";

fn lab() -> (SimTransport, Vec<DeviceProfile>) {
    let transport = SimTransport::new();
    let mut profiles = Vec::new();
    for (host, name) in [("10.0.0.1", "core-r1"), ("10.0.0.2", "edge-r2"), ("10.0.0.3", "edge-r3")] {
        transport.add_device(
            host,
            SimDevice::new(name, DeviceKind::CiscoIos)
                .with_enable_secret("lab")
                .with_running_config(&format!(
                    "hostname {name}\n!\ninterface {INTERFACE}\n description uplink\n!\nend\n"
                ))
                .with_output(
                    "show version | include uptime",
                    format!("{name} uptime is 12 weeks, 1 day, 2 hours, 5 minutes"),
                )
                .with_output(
                    "show interfaces GigabitEthernet0/1 | include input rate|output rate",
                    "  5 minute input rate 2000 bits/sec, 3 packets/sec\n  5 minute output rate 1000 bits/sec, 1 packets/sec",
                )
                .with_output(
                    "show mac address-table",
                    "          Mac Address Table\n-------------------------------------------\nVlan    Mac Address       Type        Ports\n----    -----------       --------    -----\n   1    0050.7966.6800    DYNAMIC     Gi0/1",
                )
                .with_output(
                    "show processes cpu sorted | exclude 0.00%",
                    "CPU utilization for five seconds: 3%/0%; one minute: 2%; five minutes: 2%\n PID Runtime(ms)     Invoked      uSecs   5Sec   1Min   5Min TTY Process\n 188       52108      311562        167  1.27%  0.91%  0.88%   0 IP Input",
                )
                .with_output(
                    "show memory statistics",
                    "                Head    Total(b)     Used(b)     Free(b)   Lowest(b)  Largest(b)\nProcessor   7F1E2A10   262144000    98304000   163840000   160112344   159383064\n      I/O    E000000    33554432    12018752    21535680    21402144    21477340",
                ),
        );
        profiles.push(
            DeviceProfile::new(host, Credentials::password("admin", "admin"), DeviceKind::CiscoIos)
                .with_enable_secret("lab"),
        );
    }
    (transport, profiles)
}

fn ssh_target(args: &[String]) -> anyhow::Result<(Arc<dyn Transport>, Vec<DeviceProfile>)> {
    let [host, user, password, secret] = args else {
        bail!("usage: device_report --ssh <host> <user> <password> <enable-secret>");
    };
    let profile = DeviceProfile::new(
        host.as_str(),
        Credentials::password(user.as_str(), password.as_str()),
        DeviceKind::CiscoIos,
    )
    .with_enable_secret(secret.as_str());
    Ok((Arc::new(SshTransport::default()), vec![profile]))
}

fn print_report(title: &str, report: &RunReport) {
    println!("== {title} (degraded={})", report.degraded);
    for (device, outcomes) in &report.devices {
        for outcome in outcomes {
            match outcome {
                DeviceOutcome::Success(OperationOutput::Query(batch))
                | DeviceOutcome::Partial(OperationOutput::Query(batch)) => {
                    for result in &batch.results {
                        println!("[{device}] {} (success={})", result.command, result.success);
                        for line in result.output.lines() {
                            println!("    {line}");
                        }
                    }
                }
                DeviceOutcome::Success(OperationOutput::Configure(tx))
                | DeviceOutcome::Partial(OperationOutput::Configure(tx)) => {
                    println!("[{device}] {} committed, applied={:?}", tx.name, tx.applied);
                }
                DeviceOutcome::Failed(err) => {
                    println!("[{device}] failed ({:?}): {err}", err.kind());
                    if let Some(tx) = err.transaction() {
                        println!("    rollback={:?}", tx.rollback_commands);
                    }
                }
            }
        }
    }
}

fn toggle(name: &str, command: &str, expected: &str) -> Operation {
    Operation::configure(
        ConfigChange::new(name, [format!("interface {INTERFACE}"), command.to_string()]).with_verify(
            VerifyCheck::contains(format!("show interfaces {INTERFACE}"), expected),
        ),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let (transport, profiles): (Arc<dyn Transport>, Vec<DeviceProfile>) =
        match args.first().map(String::as_str) {
            Some("--ssh") => ssh_target(&args[1..])?,
            _ => {
                let (sim, profiles) = lab();
                (Arc::new(sim), profiles)
            }
        };

    let config = DispatcherConfig::from_json(r#"{"max_sessions": 2, "command_timeout_secs": 30}"#)
        .context("dispatcher config")?;
    let dispatcher = Dispatcher::new(transport, config)?;

    let report = dispatcher
        .execute(&profiles, Operation::query(CommandBatch::new(REPORT_COMMANDS.iter().copied())))
        .await;
    print_report("health", &report);

    let report = dispatcher
        .execute(
            &profiles,
            toggle("disable uplink", "shutdown", "administratively down"),
        )
        .await;
    print_report("interface down", &report);

    let report = dispatcher
        .execute(
            &profiles,
            toggle("enable uplink", "no shutdown", "line protocol is up"),
        )
        .await;
    print_report("interface up", &report);

    let restore = ConfigChange::from_backup("restore baseline", BASELINE, DeviceKind::CiscoIos)?
        .with_verify(VerifyCheck::contains(
            format!("show interfaces {INTERFACE}"),
            "line protocol is up",
        ));
    let report = dispatcher
        .execute(&profiles, Operation::configure(restore))
        .await;
    print_report("baseline restored", &report);

    if report.degraded {
        bail!("at least one device is in an unknown state");
    }
    Ok(())
}
