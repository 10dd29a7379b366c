use std::time::Duration;

use async_ssh2_tokio::client::{AuthMethod as SshAuth, Client};
use async_ssh2_tokio::{Config, Error as SshError};
use async_trait::async_trait;
use log::debug;
use russh::ChannelMsg;
use tokio::sync::mpsc::{self, Receiver, Sender};

use super::{ConnectionSecurityOptions, ShellChannel, Transport};
use crate::error::{ConnectError, NetError};
use crate::profile::{AuthMethod, DeviceProfile};

/// Opens interactive PTY shells over SSH.
#[derive(Debug, Clone, Default)]
pub struct SshTransport {
    security: ConnectionSecurityOptions,
    inactivity_timeout: Option<Duration>,
}

impl SshTransport {
    pub fn new(security: ConnectionSecurityOptions) -> Self {
        Self {
            security,
            inactivity_timeout: Some(Duration::from_secs(60)),
        }
    }

    pub fn with_inactivity_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.inactivity_timeout = timeout;
        self
    }
}

fn classify(device: &str, err: SshError) -> ConnectError {
    match err {
        SshError::PasswordWrong | SshError::KeyAuthFailed => ConnectError::AuthError {
            device: device.to_string(),
            detail: err.to_string(),
        },
        SshError::KeyInvalid(_) => ConnectError::InvalidProfile {
            device: device.to_string(),
            detail: err.to_string(),
        },
        other => ConnectError::UnreachableError {
            device: device.to_string(),
            detail: other.to_string(),
        },
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(&self, profile: &DeviceProfile) -> Result<Box<dyn ShellChannel>, ConnectError> {
        let device_addr = profile.id();

        let config = Config {
            preferred: self.security.preferred(),
            inactivity_timeout: self.inactivity_timeout,
            ..Default::default()
        };

        let auth = match &profile.credentials.auth {
            AuthMethod::Password(password) => SshAuth::with_password(password),
            AuthMethod::KeyFile { path, passphrase } => {
                SshAuth::with_key_file(path, passphrase.as_deref())
            }
        };

        let client = Client::connect_with_config(
            (profile.host.clone(), profile.port),
            &profile.credentials.username,
            auth,
            self.security.host_key.server_check(),
            config,
        )
        .await
        .map_err(|err| classify(&device_addr, err))?;
        debug!("{} TCP connection successful", device_addr);

        let unreachable = |err: russh::Error| ConnectError::UnreachableError {
            device: device_addr.clone(),
            detail: err.to_string(),
        };
        let mut channel = client
            .get_channel()
            .await
            .map_err(|err| classify(&device_addr, err))?;
        channel
            .request_pty(false, "xterm", 800, 600, 0, 0, &[])
            .await
            .map_err(unreachable)?;
        channel.request_shell(false).await.map_err(unreachable)?;
        debug!("{} Shell request successful", device_addr);

        let (sender_to_shell, mut receiver_from_user) = mpsc::channel::<String>(256);
        let (sender_to_user, receiver_from_shell) = mpsc::channel::<String>(256);

        let io_task_device_addr = device_addr.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    data = receiver_from_user.recv() => {
                        let Some(data) = data else {
                            debug!("{} Shell input closed. Closing task.", io_task_device_addr);
                            let _ = channel.eof().await;
                            break;
                        };
                        if let Err(e) = channel.data(data.as_bytes()).await {
                            debug!("{} Failed to send data to shell: {:?}", io_task_device_addr, e);
                            break;
                        }
                    },
                    Some(msg) = channel.wait() => {
                        match msg {
                            ChannelMsg::Data { ref data } => {
                                let text = String::from_utf8_lossy(data).into_owned();
                                if sender_to_user.send(text).await.is_err() {
                                    debug!("{} Shell output receiver dropped. Closing task.", io_task_device_addr);
                                    break;
                                }
                            }
                            ChannelMsg::ExitStatus { exit_status } => {
                                debug!("{} Shell exited with status code: {}", io_task_device_addr, exit_status);
                                let _ = channel.eof().await;
                                break;
                            }
                            ChannelMsg::Eof => {
                                debug!("{} Shell sent EOF.", io_task_device_addr);
                                break;
                            }
                            _ => {}
                        }
                    }
                    else => break,
                }
            }
            debug!("{} SSH I/O task ended.", io_task_device_addr);
        });

        Ok(Box::new(SshChannel {
            device_addr,
            client: Some(client),
            sender: sender_to_shell,
            recv: receiver_from_shell,
        }))
    }
}

struct SshChannel {
    device_addr: String,
    client: Option<Client>,
    sender: Sender<String>,
    recv: Receiver<String>,
}

#[async_trait]
impl ShellChannel for SshChannel {
    async fn send(&mut self, data: &str) -> Result<(), NetError> {
        self.sender
            .send(data.to_string())
            .await
            .map_err(|_| NetError::ChannelDisconnectError)
    }

    async fn recv(&mut self) -> Option<String> {
        self.recv.recv().await
    }

    fn drain(&mut self) {
        while self.recv.try_recv().is_ok() {}
    }

    fn is_closed(&self) -> bool {
        self.client
            .as_ref()
            .map(|client| client.is_closed())
            .unwrap_or(true)
    }

    async fn close(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        debug!("{} Safely closing SSH connection...", self.device_addr);
        self.recv.close();
        if !client.is_closed() {
            if let Err(e) = self.sender.send("exit\n".to_string()).await {
                debug!("Failed to send exit command: {:?}", e);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if let Err(e) = client.disconnect().await {
            debug!("{} Disconnect failed: {:?}", self.device_addr, e);
        }
        debug!("{} SSH connection safely closed", self.device_addr);
    }
}
