//! Predefined device templates.
//!
//! A [`DeviceTemplate`] bundles everything the session layer needs to know
//! about one device family: the prompt state machine, whether the device
//! must be elevated with `enable`, the commands that prepare a fresh shell,
//! how to read the running configuration, and the configuration grammar
//! rules used when planning a rollback.

use crate::device::{DeviceHandler, HandlerSpec, InputRule, InputValue, PromptRule, Transition};
use crate::error::NetError;
use crate::profile::DeviceKind;

/// Mode names used by the Cisco templates.
pub const LOGIN_MODE: &str = "login";
pub const ENABLE_MODE: &str = "enable";
pub const CONFIG_MODE: &str = "config";
pub const CONFIG_SUB_MODE: &str = "config_sub";

/// Dynamic handler parameter carrying the enable secret.
pub const ENABLE_PASSWORD_PARAM: &str = "EnablePassword";

/// Command prefixes that open a configuration context.
const CONTEXT_PREFIXES: &[&str] = &[
    "interface ",
    "router ",
    "line ",
    "vlan ",
    "ip access-list ",
    "ipv6 access-list ",
    "route-map ",
    "policy-map ",
    "class-map ",
    "vrf definition ",
];

/// Command prefixes that never change device state.
const READ_ONLY_PREFIXES: &[&str] = &["show", "ping", "traceroute", "dir", "more"];

/// First words whose setting key spans two tokens (`ip address`, `switchport mode`).
const COMPOUND_KEYWORDS: &[&str] = &[
    "ip",
    "ipv6",
    "switchport",
    "spanning-tree",
    "standby",
    "vrrp",
    "logging",
    "snmp-server",
    "ntp",
    "service",
    "aaa",
    "username",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTemplate {
    pub kind: DeviceKind,
    /// Login lands in an unprivileged mode and needs `enable`.
    pub requires_enable: bool,
    pub privileged_mode: &'static str,
    pub config_mode: &'static str,
    pub snapshot_command: &'static str,
    /// Sent best-effort right after the session reaches privileged mode.
    pub session_prep: Vec<&'static str>,
    handler_spec: HandlerSpec,
}

impl DeviceTemplate {
    pub fn for_kind(kind: DeviceKind) -> Self {
        let (requires_enable, session_prep) = match kind {
            DeviceKind::CiscoIos | DeviceKind::CiscoXe => {
                (true, vec!["terminal length 0", "terminal width 511"])
            }
            // NX-OS logs straight into network-admin.
            DeviceKind::CiscoNxos => (false, vec!["terminal length 0", "terminal width 511"]),
        };
        Self {
            kind,
            requires_enable,
            privileged_mode: ENABLE_MODE,
            config_mode: CONFIG_MODE,
            snapshot_command: "show running-config",
            session_prep,
            handler_spec: cisco_handler_spec(),
        }
    }

    /// Compiles a fresh prompt state machine for this template.
    pub fn handler(&self) -> Result<DeviceHandler, NetError> {
        DeviceHandler::new(self.handler_spec.clone())
    }

    pub fn is_read_only(&self, command: &str) -> bool {
        is_read_only_command(command)
    }

    /// True when `line` opens a configuration context such as `interface Gi0/1`.
    pub fn is_context_header(&self, line: &str) -> bool {
        let lower = line.trim().to_ascii_lowercase();
        CONTEXT_PREFIXES
            .iter()
            .any(|prefix| lower.starts_with(prefix) && lower.len() > prefix.len())
    }

    /// Key identifying which configuration setting a line assigns.
    ///
    /// Lines sharing a key overwrite each other on the device, e.g.
    /// `description uplink` and `description core` both have key `description`.
    pub fn setting_key(&self, line: &str) -> String {
        let mut tokens = line.split_whitespace();
        let first = tokens.next().unwrap_or_default().to_ascii_lowercase();
        if COMPOUND_KEYWORDS.contains(&first.as_str())
            && let Some(second) = tokens.next()
        {
            return format!("{first} {}", second.to_ascii_lowercase());
        }
        first
    }
}

/// True for commands that never change device state (`show`, `ping`, ...).
pub fn is_read_only_command(command: &str) -> bool {
    let cmd = command.trim().to_ascii_lowercase();
    READ_ONLY_PREFIXES.iter().any(|prefix| {
        cmd == *prefix
            || cmd
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with(' '))
    })
}

/// Prompt machine shared by IOS, IOS-XE and NX-OS.
fn cisco_handler_spec() -> HandlerSpec {
    let prompt = |state: &str, pattern: &str| PromptRule {
        state: state.to_string(),
        patterns: vec![pattern.to_string()],
    };
    let edge = |from: &str, command: &str, to: &str| Transition {
        from: from.to_string(),
        command: command.to_string(),
        to: to.to_string(),
    };

    HandlerSpec {
        prompts: vec![
            prompt(CONFIG_SUB_MODE, r"^[A-Za-z0-9_.\-@/:]{1,63}\(config-[^)]+\)#\s*$"),
            prompt(CONFIG_MODE, r"^[A-Za-z0-9_.\-@/:]{1,63}\(config\)#\s*$"),
            prompt(ENABLE_MODE, r"^[A-Za-z0-9_.\-@/:]{1,63}#\s*$"),
            prompt(LOGIN_MODE, r"^[A-Za-z0-9_.\-@/:]{1,63}>\s*$"),
        ],
        inputs: vec![
            InputRule {
                state: ENABLE_PASSWORD_PARAM.to_string(),
                patterns: vec![r"^\x00*\r?(Enable )?[Pp]assword:\s*$".to_string()],
                input: InputValue::Param(ENABLE_PASSWORD_PARAM.to_string()),
                record: true,
            },
            InputRule {
                state: "Confirm".to_string(),
                patterns: vec![r"\[confirm\]\s*$".to_string()],
                input: InputValue::Static("\n".to_string()),
                record: false,
            },
        ],
        more_patterns: vec![r"^\s*-+\s*More\s*-+\s*$".to_string()],
        error_patterns: vec![
            r"^%\s*(Invalid|Incomplete|Ambiguous|Unknown|Bad|Access denied|Error).*".to_string(),
            r"^Command authorization failed.*".to_string(),
            r"^Command rejected:.*".to_string(),
        ],
        ignore_errors: Vec::new(),
        transitions: vec![
            edge(LOGIN_MODE, "enable", ENABLE_MODE),
            edge(ENABLE_MODE, "configure terminal", CONFIG_MODE),
            edge(CONFIG_MODE, "end", ENABLE_MODE),
            edge(CONFIG_SUB_MODE, "exit", CONFIG_MODE),
            edge(CONFIG_SUB_MODE, "end", ENABLE_MODE),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ios() -> DeviceTemplate {
        DeviceTemplate::for_kind(DeviceKind::CiscoIos)
    }

    #[test]
    fn cisco_handler_classifies_each_mode() {
        let mut handler = ios().handler().expect("cisco handler should build");

        handler.read("R1>");
        assert_eq!(handler.current_state(), LOGIN_MODE);
        handler.read("R1#");
        assert_eq!(handler.current_state(), ENABLE_MODE);
        handler.read("R1(config)#");
        assert_eq!(handler.current_state(), CONFIG_MODE);
        handler.read("R1(config-if)#");
        assert_eq!(handler.current_state(), CONFIG_SUB_MODE);
        handler.read("core-sw01.lab(config-router)#");
        assert_eq!(handler.current_state(), CONFIG_SUB_MODE);
    }

    #[test]
    fn every_kind_builds_its_handler() {
        for kind in [DeviceKind::CiscoIos, DeviceKind::CiscoXe, DeviceKind::CiscoNxos] {
            let mut handler = DeviceTemplate::for_kind(kind)
                .handler()
                .unwrap_or_else(|err| panic!("{} handler should build: {err}", kind.as_str()));
            handler.read("switch01#");
            assert_eq!(handler.current_state(), ENABLE_MODE);
        }
    }

    #[test]
    fn cisco_handler_flags_invalid_input() {
        let mut handler = ios().handler().expect("cisco handler should build");
        handler.read("% Invalid input detected at '^' marker.");
        assert!(handler.error());
        handler.read("GigabitEthernet0/1 is up, line protocol is up");
        assert!(!handler.error());
    }

    #[test]
    fn enable_password_prompt_uses_configured_secret() {
        let mut handler = ios().handler().expect("cisco handler should build");
        assert!(handler.awaits_input("Password: "));
        assert_eq!(handler.read_need_write("Password: "), None);

        handler.set_param(ENABLE_PASSWORD_PARAM, "s3cret\n".to_string());
        assert_eq!(
            handler.read_need_write("Password: "),
            Some(("s3cret\n".to_string(), true))
        );
    }

    #[test]
    fn config_path_from_login_goes_through_enable() {
        let mut handler = ios().handler().expect("cisco handler should build");
        handler.read("R1>");
        let path = handler.trans_state_write(CONFIG_MODE).expect("config reachable");
        let commands = path.iter().map(|(cmd, _)| cmd.as_str()).collect::<Vec<_>>();
        assert_eq!(commands, vec!["enable", "configure terminal"]);

        handler.read("R1(config-if)#");
        let path = handler.trans_state_write(ENABLE_MODE).expect("enable reachable");
        assert_eq!(path, vec![("end".to_string(), ENABLE_MODE.to_string())]);
    }

    #[test]
    fn read_only_classification_matches_whole_words() {
        let template = ios();
        assert!(template.is_read_only("show version | include uptime"));
        assert!(template.is_read_only("  ping 10.0.0.2"));
        assert!(!template.is_read_only("shutdown"));
        assert!(!template.is_read_only("interface Gi0/1"));
    }

    #[test]
    fn context_headers_are_recognized() {
        let template = ios();
        assert!(template.is_context_header("interface GigabitEthernet0/1"));
        assert!(template.is_context_header("router ospf 1"));
        assert!(template.is_context_header("ip access-list extended MGMT"));
        assert!(!template.is_context_header("ip route 0.0.0.0 0.0.0.0 10.0.0.1"));
        assert!(!template.is_context_header("description uplink"));
    }

    #[test]
    fn setting_key_groups_overwriting_lines() {
        let template = ios();
        assert_eq!(template.setting_key("description core uplink"), "description");
        assert_eq!(
            template.setting_key("ip address 10.0.0.1 255.255.255.0"),
            "ip address"
        );
        assert_eq!(template.setting_key("switchport mode access"), "switchport mode");
        assert_eq!(template.setting_key("shutdown"), "shutdown");
    }

    #[test]
    fn nxos_does_not_require_enable() {
        assert!(!DeviceTemplate::for_kind(DeviceKind::CiscoNxos).requires_enable);
        assert!(DeviceTemplate::for_kind(DeviceKind::CiscoXe).requires_enable);
    }
}
