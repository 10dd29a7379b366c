//! # rnfleet - Fleet Command Execution and Transactional Configuration
//!
//! `rnfleet` runs CLI commands and configuration changes on many network
//! devices over SSH at once. Every device gets one interactive shell driven by
//! a prompt-aware state machine; configuration changes run as transactions
//! that snapshot the running configuration first and roll back when a command
//! is rejected, the connection drops or a verification check fails.
//!
//! ## Features
//!
//! - **Sessions**: connect, authenticate, elevate to privileged mode and track
//!   the CLI mode from the prompt
//! - **Command Execution**: ordered batches with per-command results, error
//!   pattern detection, pagination and timeouts
//! - **Transactions**: snapshot, apply, verify, and derived or explicit
//!   rollback confirmed against the snapshot digest
//! - **Dispatcher**: bounded concurrency across a fleet, per-device
//!   serialization and cancellation
//! - **Maximum Compatibility**: selectable SSH algorithm profiles for legacy
//!   devices
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rnfleet::config::DispatcherConfig;
//! use rnfleet::profile::{Credentials, DeviceKind, DeviceProfile};
//! use rnfleet::session::{CommandBatch, Dispatcher, Operation};
//! use rnfleet::transport::SshTransport;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let profiles = vec![
//!         DeviceProfile::new(
//!             "192.168.1.1",
//!             Credentials::password("admin", "password"),
//!             DeviceKind::CiscoIos,
//!         )
//!         .with_enable_secret("enable"),
//!     ];
//!
//!     let dispatcher = Dispatcher::new(
//!         Arc::new(SshTransport::default()),
//!         DispatcherConfig::default(),
//!     )?;
//!     let batch = CommandBatch::new(["show version | include uptime"]);
//!     let report = dispatcher.execute(&profiles, Operation::query(batch)).await;
//!
//!     for (device, outcomes) in &report.devices {
//!         println!("{device}: {:?}", outcomes);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`session::Session`] - One authenticated shell with mode tracking
//! - [`session::Dispatcher`] - Fans operations out over many devices
//! - [`session::ConfigChange`] - A configuration transaction request
//! - [`device::DeviceHandler`] - Prompt and mode state machine
//! - [`transport`] - SSH transport and an in-memory simulated network
//! - [`error::NetError`] - Error types and the reporting taxonomy
//! - [`config`] - Dispatcher settings and SSH algorithm profiles

pub mod config;
pub mod device;
pub mod error;
pub mod profile;
pub mod session;
pub mod templates;
pub mod transport;
