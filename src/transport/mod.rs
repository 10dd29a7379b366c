//! Byte-level shell transports.
//!
//! A [`Transport`] turns a [`DeviceProfile`] into an interactive
//! [`ShellChannel`]. The session layer owns prompt detection; a channel only
//! moves text in both directions.
//!
//! - [`SshTransport`] - real devices over SSH with an interactive PTY shell
//! - [`SimTransport`] - in-memory Cisco-like devices for tests and demos

use async_trait::async_trait;

use crate::error::{ConnectError, NetError};
use crate::profile::DeviceProfile;

pub use security::{ConnectionSecurityOptions, HostKeyCheck, SecurityLevel};
pub use sim::{SimDevice, SimDeviceHandle, SimTransport};
pub use ssh::SshTransport;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Authenticates and opens an interactive shell.
    async fn connect(&self, profile: &DeviceProfile) -> Result<Box<dyn ShellChannel>, ConnectError>;
}

#[async_trait]
pub trait ShellChannel: Send {
    /// Writes raw text to the shell. Callers append line terminators.
    async fn send(&mut self, data: &str) -> Result<(), NetError>;

    /// Next chunk of shell output, or `None` once the shell is gone.
    async fn recv(&mut self) -> Option<String>;

    /// Discards output that is already buffered.
    fn drain(&mut self);

    fn is_closed(&self) -> bool;

    /// Releases the shell. Safe to call more than once.
    async fn close(&mut self);
}

mod security;
mod sim;
mod ssh;
