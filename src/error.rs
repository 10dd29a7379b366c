//! Error types for sessions, command execution and configuration transactions.
//!
//! [`ConnectError`] covers everything that can go wrong while a session is
//! being opened. [`NetError`] is the crate-wide error and nests
//! `ConnectError`; [`NetError::kind`] maps every variant onto the
//! [`ErrorKind`] taxonomy that callers branch on.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::{ConfigTransaction, SessionState};

/// Errors raised while opening a session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The device refused the supplied credentials.
    #[error("authentication failed for {device}: {detail}")]
    AuthError { device: String, detail: String },

    /// The transport could not be established, or the device never
    /// presented a prompt.
    #[error("device {device} unreachable: {detail}")]
    UnreachableError { device: String, detail: String },

    /// Elevation to the privileged mode was rejected.
    #[error("privilege elevation rejected on {device}: {detail}")]
    PrivilegeError { device: String, detail: String },

    /// The profile cannot be used to build a session (bad template, etc).
    #[error("invalid profile for {device}: {detail}")]
    InvalidProfile { device: String, detail: String },
}

/// Errors that can occur during command execution, configuration
/// transactions and dispatching.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NetError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// No prompt was detected within the command budget.
    ///
    /// The error carries the partial output received before the timeout.
    #[error("exec command timeout: '{command}'")]
    TimeoutError { command: String, partial: String },

    /// The device answered with a recognized error pattern.
    #[error("device rejected '{command}': {detail}")]
    DeviceError {
        command: String,
        detail: String,
        output: String,
    },

    /// The session is not in a state that accepts the requested action.
    #[error("session is {state}, cannot {action}")]
    SessionStateError {
        state: SessionState,
        action: String,
    },

    /// A configuration transaction failed and was rolled back.
    #[error("transaction '{transaction}' rolled back: {cause}")]
    ApplyError {
        transaction: String,
        cause: Box<NetError>,
        report: Box<ConfigTransaction>,
    },

    /// Rollback of a configuration transaction failed.
    ///
    /// The device may be left in an unknown state. Never retried automatically.
    #[error("rollback of '{transaction}' failed, device state unknown: {detail}")]
    RollbackFailedError {
        transaction: String,
        detail: String,
        report: Box<ConfigTransaction>,
    },

    /// A post-change verification check did not hold.
    #[error("verification failed: {0}")]
    VerifyFailed(String),

    /// The SSH channel was disconnected while waiting for a prompt.
    #[error("channel disconnect on wait prompt")]
    ChannelDisconnectError,

    /// The operation was cancelled before anything was sent to the device.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation never ran because an earlier one left the device in an
    /// unknown state.
    #[error("operation aborted: {0}")]
    Aborted(String),

    /// The target CLI mode cannot be reached from the current mode.
    #[error("unreachable state {0}")]
    UnreachableState(String),

    /// A device handler definition could not be compiled.
    #[error("invalid device handler config: {0}")]
    InvalidDeviceHandlerConfig(String),

    /// A configuration change failed validation before execution.
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    /// Dispatcher or session configuration failed validation.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// No built-in template exists for the requested device kind.
    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("internal error: {0}")]
    InternalServerError(String),
}

/// Taxonomy used for result reporting and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connect,
    Timeout,
    Device,
    SessionState,
    Apply,
    RollbackFailed,
    Cancelled,
    Internal,
}

impl NetError {
    /// Classifies the error onto the reporting taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            NetError::Connect(_) | NetError::ChannelDisconnectError => ErrorKind::Connect,
            NetError::TimeoutError { .. } => ErrorKind::Timeout,
            NetError::DeviceError { .. } | NetError::VerifyFailed(_) => ErrorKind::Device,
            NetError::SessionStateError { .. } | NetError::UnreachableState(_) => {
                ErrorKind::SessionState
            }
            NetError::ApplyError { .. } => ErrorKind::Apply,
            NetError::RollbackFailedError { .. } => ErrorKind::RollbackFailed,
            NetError::Cancelled | NetError::Aborted(_) => ErrorKind::Cancelled,
            NetError::InvalidDeviceHandlerConfig(_)
            | NetError::InvalidTransaction(_)
            | NetError::InvalidConfig(_)
            | NetError::TemplateNotFound(_)
            | NetError::InternalServerError(_) => ErrorKind::Internal,
        }
    }

    /// Connect and timeout failures may succeed when the caller tries again.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Connect | ErrorKind::Timeout)
    }

    /// True only for failures that leave the device in an unknown state.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::RollbackFailed
    }

    /// Transaction report attached to apply and rollback failures.
    pub fn transaction(&self) -> Option<&ConfigTransaction> {
        match self {
            NetError::ApplyError { report, .. } | NetError::RollbackFailedError { report, .. } => {
                Some(report)
            }
            _ => None,
        }
    }
}
