//! In-memory Cisco-like devices.
//!
//! [`SimTransport`] behaves like a small lab network: every registered
//! [`SimDevice`] keeps a running configuration that survives reconnects,
//! answers `show` commands, walks the exec/config modes and prints the same
//! prompts and error markers a real IOS box does. Failure injection
//! (rejected, hanging, delayed and connection-dropping commands) and session
//! counters make it the backbone of the integration tests.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::{ShellChannel, Transport};
use crate::error::{ConnectError, NetError};
use crate::profile::{AuthMethod, DeviceKind, DeviceProfile};
use crate::session::ConfigSnapshot;
use crate::templates::DeviceTemplate;

/// Lines printed before a `--More--` marker while paging is on.
const PAGE_LINES: usize = 24;

/// Settings that hold one value per context.
const SINGLE_VALUED: &[&str] = &[
    "description",
    "ip address",
    "speed",
    "duplex",
    "mtu",
    "bandwidth",
    "switchport mode",
    "switchport access",
    "encapsulation",
    "hostname",
];

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State and behaviour of one simulated device.
pub struct SimDevice {
    hostname: String,
    username: String,
    password: String,
    key_path: Option<String>,
    enable_secret: Option<String>,
    lands_privileged: bool,
    template: DeviceTemplate,
    global: BTreeSet<String>,
    sections: BTreeMap<String, BTreeSet<String>>,
    outputs: HashMap<String, String>,
    rejected: HashSet<String>,
    hanging: HashSet<String>,
    delays: HashMap<String, Duration>,
    drop_on: HashSet<String>,
    history: Vec<String>,
}

impl SimDevice {
    pub fn new(hostname: impl Into<String>, kind: DeviceKind) -> Self {
        let hostname = hostname.into();
        let template = DeviceTemplate::for_kind(kind);
        let mut global = BTreeSet::new();
        global.insert(format!("hostname {hostname}"));
        Self {
            hostname,
            username: "admin".to_string(),
            password: "admin".to_string(),
            key_path: None,
            enable_secret: None,
            lands_privileged: !template.requires_enable,
            template,
            global,
            sections: BTreeMap::new(),
            outputs: HashMap::new(),
            rejected: HashSet::new(),
            hanging: HashSet::new(),
            delays: HashMap::new(),
            drop_on: HashSet::new(),
            history: Vec::new(),
        }
    }

    pub fn with_login(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_key_file(mut self, path: impl Into<String>) -> Self {
        self.key_path = Some(path.into());
        self
    }

    pub fn with_enable_secret(mut self, secret: impl Into<String>) -> Self {
        self.enable_secret = Some(secret.into());
        self
    }

    /// Replaces the configuration with a `show running-config` style text.
    pub fn with_running_config(mut self, text: &str) -> Self {
        let snapshot = ConfigSnapshot::parse(text, &self.template);
        self.global = snapshot.global.into_iter().collect();
        self.sections = snapshot
            .sections
            .into_iter()
            .map(|(header, lines)| (header, lines.into_iter().collect()))
            .collect();
        if let Some(name) = self
            .global
            .iter()
            .find_map(|line| line.strip_prefix("hostname "))
        {
            self.hostname = name.trim().to_string();
        }
        self
    }

    pub fn with_output(mut self, command: impl Into<String>, output: impl Into<String>) -> Self {
        self.outputs.insert(command.into(), output.into());
        self
    }

    fn prompt(&self, mode: &SimMode) -> String {
        match mode {
            SimMode::User => format!("{}>", self.hostname),
            SimMode::Privileged => format!("{}#", self.hostname),
            SimMode::Config => format!("{}(config)#", self.hostname),
            SimMode::Section(header) => {
                let tag = match header.split_whitespace().next().unwrap_or_default() {
                    "interface" => "if",
                    "router" => "router",
                    "line" => "line",
                    "vlan" => "vlan",
                    "ip" | "ipv6" => "ext-nacl",
                    "route-map" => "route-map",
                    "policy-map" => "pmap",
                    "class-map" => "cmap",
                    "vrf" => "vrf",
                    _ => "sub",
                };
                format!("{}(config-{tag})#", self.hostname)
            }
        }
    }

    fn render_running_config(&self) -> String {
        let mut body = String::new();
        body.push_str("!\r\n");
        for line in &self.global {
            body.push_str(line);
            body.push_str("\r\n");
        }
        for (header, lines) in &self.sections {
            body.push_str("!\r\n");
            body.push_str(header);
            body.push_str("\r\n");
            for line in lines {
                body.push(' ');
                body.push_str(line);
                body.push_str("\r\n");
            }
        }
        body.push_str("!\r\nend\r\n");
        format!(
            "Building configuration...\r\n\r\nCurrent configuration : {} bytes\r\n{body}",
            body.len()
        )
    }

    fn interface_status(&self, name: &str) -> Option<String> {
        let lines = self.sections.get(&format!("interface {name}"))?;
        if lines.contains("shutdown") {
            Some(format!(
                "{name} is administratively down, line protocol is down\r\n"
            ))
        } else {
            Some(format!("{name} is up, line protocol is up\r\n"))
        }
    }

    fn set_line(&mut self, context: Option<&str>, line: &str) {
        let key = self.template.setting_key(line);
        if context.is_none()
            && let Some(name) = line.strip_prefix("hostname ")
        {
            self.hostname = name.trim().to_string();
        }
        let template = &self.template;
        let lines = match context {
            Some(header) => self.sections.entry(header.to_string()).or_default(),
            None => &mut self.global,
        };
        if SINGLE_VALUED.contains(&key.as_str()) {
            lines.retain(|existing| template.setting_key(existing) != key);
        }
        lines.insert(line.to_string());
    }

    fn remove_lines(&mut self, context: Option<&str>, target: &str) {
        let prefix = format!("{target} ");
        let lines = match context {
            Some(header) => match self.sections.get_mut(header) {
                Some(lines) => lines,
                None => return,
            },
            None => &mut self.global,
        };
        lines.retain(|line| line != target && !line.starts_with(&prefix));
    }
}

/// Shared handle to a registered device, for inspection and fault injection.
#[derive(Clone)]
pub struct SimDeviceHandle(Arc<Mutex<SimDevice>>);

impl SimDeviceHandle {
    fn lock(&self) -> MutexGuard<'_, SimDevice> {
        lock(&self.0)
    }

    /// The device answers `command` with an invalid-input error.
    pub fn reject(&self, command: &str) {
        self.lock().rejected.insert(command.to_string());
    }

    /// The device echoes `command` and never prints a prompt again.
    pub fn hang(&self, command: &str) {
        self.lock().hanging.insert(command.to_string());
    }

    pub fn delay(&self, command: &str, delay: Duration) {
        self.lock().delays.insert(command.to_string(), delay);
    }

    /// The next time `command` arrives the connection drops before it runs.
    pub fn drop_on(&self, command: &str) {
        self.lock().drop_on.insert(command.to_string());
    }

    pub fn set_output(&self, command: &str, output: &str) {
        self.lock()
            .outputs
            .insert(command.to_string(), output.to_string());
    }

    pub fn running_config(&self) -> String {
        self.lock().render_running_config()
    }

    /// Lines configured under `header`, or `None` if the section is absent.
    pub fn section(&self, header: &str) -> Option<Vec<String>> {
        self.lock()
            .sections
            .get(header)
            .map(|lines| lines.iter().cloned().collect())
    }

    pub fn has_global(&self, line: &str) -> bool {
        self.lock().global.contains(line)
    }

    /// Every command line received, passwords excluded.
    pub fn history(&self) -> Vec<String> {
        self.lock().history.clone()
    }
}

#[derive(Default)]
struct SimStats {
    open: AtomicUsize,
    peak: AtomicUsize,
    connects: AtomicUsize,
}

#[derive(Default)]
struct SimNetwork {
    devices: Mutex<HashMap<String, SimDeviceHandle>>,
    unreachable: Mutex<HashSet<String>>,
    connect_delay: Mutex<Duration>,
    stats: Arc<SimStats>,
}

/// Transport backed by simulated devices, keyed by host.
#[derive(Clone, Default)]
pub struct SimTransport {
    network: Arc<SimNetwork>,
}

impl SimTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, host: impl Into<String>, device: SimDevice) -> SimDeviceHandle {
        let handle = SimDeviceHandle(Arc::new(Mutex::new(device)));
        lock(&self.network.devices).insert(host.into(), handle.clone());
        handle
    }

    pub fn device(&self, host: &str) -> Option<SimDeviceHandle> {
        lock(&self.network.devices).get(host).cloned()
    }

    /// Connections to `host` fail as if the address were unroutable.
    pub fn set_unreachable(&self, host: impl Into<String>) {
        lock(&self.network.unreachable).insert(host.into());
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *lock(&self.network.connect_delay) = delay;
    }

    /// Channels currently open.
    pub fn open_sessions(&self) -> usize {
        self.network.stats.open.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open channels seen so far.
    pub fn peak_sessions(&self) -> usize {
        self.network.stats.peak.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.network.stats.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn connect(&self, profile: &DeviceProfile) -> Result<Box<dyn ShellChannel>, ConnectError> {
        let device_addr = profile.id();
        let delay = *lock(&self.network.connect_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let unreachable = lock(&self.network.unreachable).contains(&profile.host);
        let handle = match self.device(&profile.host) {
            Some(handle) if !unreachable => handle,
            _ => {
                return Err(ConnectError::UnreachableError {
                    device: device_addr,
                    detail: "no route to host".to_string(),
                });
            }
        };

        let banner = {
            let device = handle.lock();
            let accepted = profile.credentials.username == device.username
                && match &profile.credentials.auth {
                    AuthMethod::Password(password) => *password == device.password,
                    AuthMethod::KeyFile { path, .. } => device.key_path.as_ref() == Some(path),
                };
            if !accepted {
                return Err(ConnectError::AuthError {
                    device: device_addr,
                    detail: "permission denied".to_string(),
                });
            }
            let mode = if device.lands_privileged {
                SimMode::Privileged
            } else {
                SimMode::User
            };
            let banner = format!("\r\n{}", device.prompt(&mode));
            (mode, banner)
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let (mode, text) = banner;
        let _ = tx.send(text);

        let stats = self.network.stats.clone();
        let open = stats.open.fetch_add(1, Ordering::SeqCst) + 1;
        stats.peak.fetch_max(open, Ordering::SeqCst);
        stats.connects.fetch_add(1, Ordering::SeqCst);
        debug!("{} simulated shell opened ({} open)", device_addr, open);

        Ok(Box::new(SimChannel {
            device: handle,
            stats,
            tx: Some(tx),
            rx,
            shell: SimShell {
                mode,
                awaiting_password: false,
                paging: true,
                pending_more: None,
            },
            input: String::new(),
            released: false,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SimMode {
    User,
    Privileged,
    Config,
    Section(String),
}

enum Outcome {
    Output(String),
    Invalid,
    Password,
    Logout,
}

enum Reply {
    Now(String),
    After(Duration, String),
    Disconnect(String),
}

/// Per-connection CLI state.
struct SimShell {
    mode: SimMode,
    awaiting_password: bool,
    paging: bool,
    pending_more: Option<String>,
}

impl SimShell {
    fn handle(&mut self, device: &mut SimDevice, line: &str) -> Reply {
        if self.awaiting_password {
            self.awaiting_password = false;
            if device.enable_secret.as_deref() == Some(line) {
                self.mode = SimMode::Privileged;
                return Reply::Now(format!("\r\n{}", device.prompt(&self.mode)));
            }
            return Reply::Now(format!(
                "\r\n% Access denied\r\n\r\n{}",
                device.prompt(&self.mode)
            ));
        }

        let command = line.trim();
        let echo = format!("{command}\r\n");
        if command.is_empty() {
            return Reply::Now(format!("\r\n{}", device.prompt(&self.mode)));
        }
        device.history.push(command.to_string());

        if device.drop_on.remove(command) {
            return Reply::Disconnect(echo);
        }
        if device.hanging.contains(command) {
            return Reply::Now(echo);
        }

        let outcome = if device.rejected.contains(command) {
            Outcome::Invalid
        } else if matches!(self.mode, SimMode::User | SimMode::Privileged) {
            self.exec(device, command)
        } else {
            self.configure(device, command)
        };

        let text = match outcome {
            Outcome::Logout => return Reply::Disconnect(echo),
            Outcome::Password => format!("{echo}Password: "),
            Outcome::Invalid => {
                let prompt = device.prompt(&self.mode);
                format!(
                    "{echo}{:width$}^\r\n% Invalid input detected at '^' marker.\r\n\r\n{prompt}",
                    "",
                    width = prompt.len()
                )
            }
            Outcome::Output(body) => self.paginate(device, echo, body),
        };

        match device.delays.get(command) {
            Some(delay) => Reply::After(*delay, text),
            None => Reply::Now(text),
        }
    }

    fn paginate(&mut self, device: &SimDevice, echo: String, body: String) -> String {
        let prompt = device.prompt(&self.mode);
        let lines = body.split_inclusive('\n').collect::<Vec<_>>();
        if !self.paging || lines.len() <= PAGE_LINES {
            return format!("{echo}{body}{prompt}");
        }
        let first = lines[..PAGE_LINES].concat();
        let rest = lines[PAGE_LINES..].concat();
        self.pending_more = Some(format!("\r        \r{rest}{prompt}"));
        format!("{echo}{first} --More-- ")
    }

    fn exec(&mut self, device: &mut SimDevice, command: &str) -> Outcome {
        let privileged = self.mode == SimMode::Privileged;
        match command {
            "enable" => {
                if privileged || device.enable_secret.is_none() {
                    self.mode = SimMode::Privileged;
                    Outcome::Output(String::new())
                } else {
                    self.awaiting_password = true;
                    Outcome::Password
                }
            }
            "disable" if privileged => {
                self.mode = SimMode::User;
                Outcome::Output(String::new())
            }
            "exit" | "logout" => Outcome::Logout,
            "terminal length 0" => {
                self.paging = false;
                Outcome::Output(String::new())
            }
            "configure terminal" | "conf t" if privileged => {
                self.mode = SimMode::Config;
                Outcome::Output(
                    "Enter configuration commands, one per line.  End with CNTL/Z.\r\n"
                        .to_string(),
                )
            }
            "show running-config" if privileged => {
                Outcome::Output(device.render_running_config())
            }
            _ => {
                if command.starts_with("terminal length ") {
                    self.paging = true;
                    return Outcome::Output(String::new());
                }
                if command.starts_with("terminal width ") {
                    return Outcome::Output(String::new());
                }
                if let Some(output) = device.outputs.get(command) {
                    return Outcome::Output(to_crlf(output));
                }
                let interface = command
                    .strip_prefix("show interfaces ")
                    .or_else(|| command.strip_prefix("show interface "));
                match interface.and_then(|name| device.interface_status(name.trim())) {
                    Some(status) => Outcome::Output(status),
                    None => Outcome::Invalid,
                }
            }
        }
    }

    fn configure(&mut self, device: &mut SimDevice, command: &str) -> Outcome {
        let context = match &self.mode {
            SimMode::Section(header) => Some(header.clone()),
            _ => None,
        };
        match command {
            "end" => {
                self.mode = SimMode::Privileged;
                return Outcome::Output(String::new());
            }
            "exit" => {
                self.mode = if context.is_some() {
                    SimMode::Config
                } else {
                    SimMode::Privileged
                };
                return Outcome::Output(String::new());
            }
            _ => {}
        }

        if device.template.is_context_header(command) {
            device.sections.entry(command.to_string()).or_default();
            self.mode = SimMode::Section(command.to_string());
            return Outcome::Output(String::new());
        }
        if let Some(target) = command.strip_prefix("no ") {
            let target = target.trim();
            if device.template.is_context_header(target) {
                device.sections.remove(target);
                self.mode = SimMode::Config;
            } else {
                device.remove_lines(context.as_deref(), target);
            }
            return Outcome::Output(String::new());
        }
        if let Some(target) = command.strip_prefix("default ") {
            let target = target.trim();
            if device.template.is_context_header(target) {
                if let Some(lines) = device.sections.get_mut(target) {
                    lines.clear();
                }
            } else {
                device.remove_lines(context.as_deref(), target);
            }
            return Outcome::Output(String::new());
        }
        if let Some(exec) = command.strip_prefix("do ") {
            let saved = std::mem::replace(&mut self.mode, SimMode::Privileged);
            let outcome = self.exec(device, exec.trim());
            self.mode = saved;
            return outcome;
        }

        device.set_line(context.as_deref(), command);
        Outcome::Output(String::new())
    }
}

fn to_crlf(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    for line in text.lines() {
        out.push_str(line);
        out.push_str("\r\n");
    }
    out
}

struct SimChannel {
    device: SimDeviceHandle,
    stats: Arc<SimStats>,
    tx: Option<UnboundedSender<String>>,
    rx: UnboundedReceiver<String>,
    shell: SimShell,
    input: String,
    released: bool,
}

impl SimChannel {
    fn deliver(&mut self, reply: Reply) {
        let Some(tx) = self.tx.as_ref() else {
            return;
        };
        match reply {
            Reply::Now(text) => {
                let _ = tx.send(text);
            }
            Reply::After(delay, text) => {
                let tx = tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(text);
                });
            }
            Reply::Disconnect(text) => {
                let _ = tx.send(text);
                trace!("simulated device dropped the connection");
                self.tx = None;
            }
        }
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.tx = None;
        self.stats.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ShellChannel for SimChannel {
    async fn send(&mut self, data: &str) -> Result<(), NetError> {
        if self.tx.is_none() {
            return Err(NetError::ChannelDisconnectError);
        }
        self.input.push_str(data);

        if self.input.starts_with(' ')
            && let Some(rest) = self.shell.pending_more.take()
        {
            self.input.remove(0);
            self.deliver(Reply::Now(rest));
        }

        while let Some(pos) = self.input.find('\n') {
            let line = self.input.drain(..=pos).collect::<String>();
            let line = line.trim_end_matches(['\r', '\n']).to_string();
            let reply = {
                let mut device = self.device.lock();
                self.shell.handle(&mut device, &line)
            };
            self.deliver(reply);
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    fn drain(&mut self) {
        while self.rx.try_recv().is_ok() {}
    }

    fn is_closed(&self) -> bool {
        self.released || self.tx.is_none()
    }

    async fn close(&mut self) {
        self.release();
    }
}

impl Drop for SimChannel {
    fn drop(&mut self) {
        self.release();
    }
}
