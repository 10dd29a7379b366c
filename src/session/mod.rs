//! Device sessions, command execution and configuration transactions.
//!
//! This module owns everything that happens on an open shell: prompt
//! detection, CLI mode changes, batch execution, transactional configuration
//! with rollback, and the dispatcher that fans work out over many devices.
//!
//! # Main Components
//!
//! - [`Session`] - One authenticated shell with state tracking
//! - [`CommandBatch`] / [`ExecutionResult`] - Command execution
//! - [`ConfigChange`] / [`ConfigTransaction`] - Snapshot, apply, verify, rollback
//! - [`Dispatcher`] - Bounded, per-device serialized execution across a fleet
//! - [`SessionRecorder`] - Structured per-device event log

use log::{debug, trace, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::{DispatcherConfig, SessionOptions};
use crate::device::{DeviceHandler, IGNORE_START_LINE};
use crate::error::{ConnectError, ErrorKind, NetError};
use crate::profile::DeviceProfile;
use crate::templates::{DeviceTemplate, ENABLE_PASSWORD_PARAM, is_read_only_command};
use crate::transport::{ShellChannel, Transport};

pub use dispatcher::{DeviceOutcome, Dispatcher, Job, Operation, OperationOutput, RunReport};
pub use executor::{BatchResult, CommandBatch, CommandFailure, ExecutionResult};
pub use recording::{SessionEvent, SessionRecordEntry, SessionRecordLevel, SessionRecorder};
pub use transaction::{
    ConfigChange, ConfigSnapshot, ConfigTransaction, RollbackPlan, RollbackPolicy, TxState,
    VerifyCheck, plan_rollback,
};

/// Connection and privilege state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    Privileged,
    Failed,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Ready => "ready",
            SessionState::Privileged => "privileged",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One authenticated shell to one device.
///
/// A session is driven by exactly one task at a time; every operation takes
/// `&mut self`.
pub struct Session {
    profile: DeviceProfile,
    transport: Arc<dyn Transport>,
    template: DeviceTemplate,
    handler: DeviceHandler,
    channel: Option<Box<dyn ShellChannel>>,
    state: SessionState,

    /// Last prompt text seen on the shell.
    prompt: String,

    options: SessionOptions,
    recorder: Option<SessionRecorder>,

    /// Command lines written to the shell since the session was created.
    commands_sent: u64,
    last_command: Option<String>,
    /// A command timed out and its output may still arrive.
    desynced: bool,
}

mod applier;
mod client;
mod dispatcher;
mod executor;
mod recording;
mod transaction;
