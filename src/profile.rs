//! Device identity and credentials.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::NetError;

/// Supported device families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    CiscoIos,
    CiscoXe,
    CiscoNxos,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::CiscoIos => "cisco_ios",
            DeviceKind::CiscoXe => "cisco_xe",
            DeviceKind::CiscoNxos => "cisco_nxos",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceKind {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cisco_ios" | "ios" => Ok(DeviceKind::CiscoIos),
            "cisco_xe" | "ios_xe" => Ok(DeviceKind::CiscoXe),
            "cisco_nxos" | "nxos" => Ok(DeviceKind::CiscoNxos),
            other => Err(NetError::TemplateNotFound(other.to_string())),
        }
    }
}

/// How the session authenticates.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Password(String),
    KeyFile {
        path: String,
        #[serde(default)]
        passphrase: Option<String>,
    },
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Password(_) => f.write_str("Password(<redacted>)"),
            AuthMethod::KeyFile { path, passphrase } => f
                .debug_struct("KeyFile")
                .field("path", path)
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Credentials {
    pub username: String,
    pub auth: AuthMethod,
}

impl Credentials {
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            auth: AuthMethod::Password(password.into()),
        }
    }
}

fn default_port() -> u16 {
    22
}

/// One target device. Immutable once built.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DeviceProfile {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub credentials: Credentials,
    pub kind: DeviceKind,
    #[serde(default)]
    pub enable_secret: Option<String>,
}

impl DeviceProfile {
    pub fn new(host: impl Into<String>, credentials: Credentials, kind: DeviceKind) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            credentials,
            kind,
            enable_secret: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_enable_secret(mut self, secret: impl Into<String>) -> Self {
        self.enable_secret = Some(secret.into());
        self
    }

    /// Identity used as the result key: `user@host:port`.
    pub fn id(&self) -> String {
        format!("{}@{}:{}", self.credentials.username, self.host, self.port)
    }
}

impl fmt::Debug for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceProfile")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("credentials", &self.credentials)
            .field("kind", &self.kind)
            .field(
                "enable_secret",
                &self.enable_secret.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}
