//! Device state machine handler for network devices.
//!
//! A [`DeviceHandler`] classifies every line the device prints into one of a
//! small set of states: plain output, a pagination marker, an error, a CLI
//! prompt (one state per CLI mode), or a line that expects interactive input
//! such as an enable password. Sessions feed it line by line and use it to
//! decide when a command has finished and how to move between CLI modes.

use std::collections::{HashMap, HashSet, VecDeque};

use log::trace;
use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::NetError;

/// Prompt patterns for one CLI mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PromptRule {
    pub state: String,
    pub patterns: Vec<String>,
}

/// Value sent back when an interactive input line is detected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum InputValue {
    /// Literal text.
    Static(String),
    /// Looked up in the handler's dynamic parameters (e.g. the enable secret).
    Param(String),
}

/// An interactive prompt the handler answers on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct InputRule {
    pub state: String,
    pub patterns: Vec<String>,
    pub input: InputValue,
    /// Keep the prompt text in the collected output.
    pub record: bool,
}

/// Edge of the CLI mode graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Transition {
    pub from: String,
    pub command: String,
    pub to: String,
}

/// Declarative handler definition, compiled by [`DeviceHandler::new`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct HandlerSpec {
    pub prompts: Vec<PromptRule>,
    pub inputs: Vec<InputRule>,
    pub more_patterns: Vec<String>,
    pub error_patterns: Vec<String>,
    pub ignore_errors: Vec<String>,
    pub transitions: Vec<Transition>,
}

pub struct DeviceHandler {
    /// Index of the current state in the `all_states` vector
    current_state_index: usize,

    /// All possible states the device can be in
    all_states: Vec<String>,

    /// Combined regex set for matching all state patterns
    all_regex: RegexSet,

    /// Maps regex match index to state index
    regex_index_map: HashMap<usize, usize>,

    /// Index range for prompt states in `all_states` (start, end)
    prompt_index: (usize, usize),

    /// Interactive input per state name
    input_map: HashMap<String, (InputValue, bool)>,

    /// Lowercased mode graph
    edges: Vec<Transition>,

    /// Regex patterns for errors that should be ignored
    ignore_errors: Option<RegexSet>,

    /// Dynamic parameters for input substitution (e.g. the enable secret)
    dyn_param: HashMap<String, String>,

    /// Last prompt text matched by the state machine.
    current_prompt: Option<String>,
}

/// Predefined states that exist in every device handler.
const PRE_STATE: [&str; 3] = ["output", "more", "error"];

const MORE_STATE: usize = 1;
const ERROR_STATE: usize = 2;

impl DeviceHandler {
    /// Compiles a handler definition.
    ///
    /// Prompt patterns get a common prefix that tolerates leading NUL bytes
    /// and a single carriage return, which some devices emit before the prompt.
    pub fn new(spec: HandlerSpec) -> Result<DeviceHandler, NetError> {
        let mut all_states: Vec<String> = PRE_STATE.iter().map(|s| s.to_string()).collect();
        let mut regexs: Vec<String> = Vec::new();
        let mut regex_index_map = HashMap::new();

        for pattern in &spec.more_patterns {
            regex_index_map.insert(regexs.len(), MORE_STATE);
            regexs.push(pattern.clone());
        }
        for pattern in &spec.error_patterns {
            regex_index_map.insert(regexs.len(), ERROR_STATE);
            regexs.push(pattern.clone());
        }

        if spec.prompts.is_empty() {
            return Err(NetError::InvalidDeviceHandlerConfig(
                "handler defines no prompt".to_string(),
            ));
        }
        let prompt_start = all_states.len();
        for rule in &spec.prompts {
            let state_index = all_states.len();
            all_states.push(rule.state.to_ascii_lowercase());
            for pattern in &rule.patterns {
                regex_index_map.insert(regexs.len(), state_index);
                regexs.push(format!(
                    r"^\x00*\r{{0,1}}{}",
                    pattern.trim_start_matches('^')
                ));
            }
        }
        let prompt_index = (prompt_start, all_states.len() - 1);

        let mut input_map = HashMap::new();
        for rule in &spec.inputs {
            let state = rule.state.to_ascii_lowercase();
            let state_index = all_states.len();
            all_states.push(state.clone());
            for pattern in &rule.patterns {
                regex_index_map.insert(regexs.len(), state_index);
                regexs.push(pattern.clone());
            }
            input_map.insert(state, (rule.input.clone(), rule.record));
        }
        input_map.insert(
            PRE_STATE[MORE_STATE].to_string(),
            (InputValue::Static(" ".to_string()), false),
        );

        let all_regex = RegexSet::new(&regexs).map_err(|err| {
            NetError::InvalidDeviceHandlerConfig(format!(
                "failed to build state regex set: {err}"
            ))
        })?;

        let ignore_errors = if spec.ignore_errors.is_empty() {
            None
        } else {
            Some(RegexSet::new(&spec.ignore_errors).map_err(|err| {
                NetError::InvalidDeviceHandlerConfig(format!(
                    "invalid ignore_errors regex set: {err}"
                ))
            })?)
        };

        let edges = spec
            .transitions
            .iter()
            .map(|t| Transition {
                from: t.from.to_ascii_lowercase(),
                command: t.command.clone(),
                to: t.to.to_ascii_lowercase(),
            })
            .collect::<Vec<_>>();

        for edge in &edges {
            for state in [&edge.from, &edge.to] {
                if !all_states[prompt_index.0..=prompt_index.1].contains(state) {
                    return Err(NetError::InvalidDeviceHandlerConfig(format!(
                        "transition references unknown prompt state '{state}'"
                    )));
                }
            }
        }

        Ok(Self {
            current_state_index: 0,
            all_states,
            all_regex,
            regex_index_map,
            prompt_index,
            input_map,
            edges,
            ignore_errors,
            dyn_param: HashMap::new(),
            current_prompt: None,
        })
    }

    /// Sets a dynamic parameter used by [`InputValue::Param`] inputs.
    pub fn set_param(&mut self, key: &str, value: String) {
        self.dyn_param.insert(key.to_string(), value);
    }

    /// Matches a line against all known patterns; the first match wins.
    /// Lines matching nothing are plain output.
    fn line2state(&self, line: &str) -> usize {
        self.all_regex
            .matches(line)
            .into_iter()
            .next()
            .and_then(|index| self.regex_index_map.get(&index).copied())
            .unwrap_or(0)
    }

    /// Reads a line of output and updates the current state.
    pub fn read(&mut self, line: &str) {
        let state_index = self.line2state(line);
        trace!(
            "Read line {:?} -> {:?}",
            line,
            self.all_states.get(state_index)
        );
        if state_index == ERROR_STATE && self.ignore_error(line) {
            trace!("Ignoring error state");
            self.current_state_index = 0;
            return;
        }
        if self.match_prompt(state_index) {
            self.current_prompt = Some(line.to_string());
        }
        self.current_state_index = state_index;
    }

    fn ignore_error(&self, line: &str) -> bool {
        self.ignore_errors
            .as_ref()
            .map(|set| set.is_match(line))
            .unwrap_or(false)
    }

    fn match_prompt(&self, index: usize) -> bool {
        let (start, end) = self.prompt_index;
        index >= start && index <= end
    }

    /// Checks if a (possibly partial) line is a prompt.
    pub fn read_prompt(&self, line: &str) -> bool {
        self.match_prompt(self.line2state(line))
    }

    /// Checks if a line requires input and returns `(input, record)`.
    pub fn read_need_write(&self, line: &str) -> Option<(String, bool)> {
        let state_index = self.line2state(line);
        let state = self.all_states.get(state_index)?;
        let (value, record) = self.input_map.get(state)?;
        match value {
            InputValue::Static(s) => Some((s.clone(), *record)),
            InputValue::Param(key) => self.dyn_param.get(key).map(|v| (v.clone(), *record)),
        }
    }

    /// True when the line is an interactive prompt, whether or not a value
    /// is configured for it.
    pub fn awaits_input(&self, line: &str) -> bool {
        self.all_states
            .get(self.line2state(line))
            .map(|state| self.input_map.contains_key(state))
            .unwrap_or(false)
    }

    /// Returns the current state name.
    pub fn current_state(&self) -> &str {
        self.all_states
            .get(self.current_state_index)
            .map(|s| s.as_str())
            .unwrap_or(PRE_STATE[0])
    }

    /// Returns last prompt text matched by the state machine.
    pub fn current_prompt(&self) -> Option<&str> {
        self.current_prompt.as_deref()
    }

    /// True when the last line read was a prompt.
    pub fn at_prompt(&self) -> bool {
        self.match_prompt(self.current_state_index)
    }

    /// Checks if the current state is the error state.
    pub fn error(&self) -> bool {
        self.current_state_index == ERROR_STATE
    }

    /// Calculates the commands needed to reach `state` from the current prompt.
    ///
    /// Breadth-first search over the transition graph yields the shortest
    /// path as `(command, state_after_command)` pairs.
    pub fn trans_state_write(&self, state: &str) -> Result<Vec<(String, String)>, NetError> {
        let start_node = self.current_state().to_string();
        let end_node = state.to_ascii_lowercase();
        if start_node == end_node {
            return Ok(Vec::new());
        }

        let mut adj_list: HashMap<&str, Vec<&Transition>> = HashMap::new();
        for edge in &self.edges {
            adj_list.entry(edge.from.as_str()).or_default().push(edge);
        }

        let mut queue = VecDeque::new();
        queue.push_back(start_node.as_str());
        let mut visited = HashSet::new();
        visited.insert(start_node.as_str());
        // child -> edge that discovered it
        let mut predecessors: HashMap<&str, &Transition> = HashMap::new();

        while let Some(current) = queue.pop_front() {
            if current == end_node {
                break;
            }
            for edge in adj_list.get(current).into_iter().flatten() {
                if visited.insert(edge.to.as_str()) {
                    predecessors.insert(edge.to.as_str(), edge);
                    queue.push_back(edge.to.as_str());
                }
            }
        }

        if !predecessors.contains_key(end_node.as_str()) {
            return Err(NetError::UnreachableState(end_node));
        }

        let mut path = Vec::new();
        let mut current = end_node.as_str();
        while current != start_node {
            let edge = predecessors.get(current).ok_or_else(|| {
                NetError::InternalServerError(format!(
                    "failed to backtrack path from '{end_node}' to '{start_node}'"
                ))
            })?;
            path.push((edge.command.clone(), edge.to.clone()));
            current = edge.from.as_str();
        }
        path.reverse();
        trace!("Command path: '{:?}'", path);
        Ok(path)
    }
}

/// Regex pattern for matching and removing control characters at the start of lines.
///
/// Carriage returns and backspaces at the beginning of terminal output would
/// otherwise defeat anchored prompt and error patterns.
pub static IGNORE_START_LINE: Lazy<Regex> =
    Lazy::new(
        || match Regex::new(r"^(\r+(\s+\r+)*)|(\u{8}+(\s+\u{8}+)*)") {
            Ok(re) => re,
            Err(err) => panic!("invalid IGNORE_START_LINE regex: {err}"),
        },
    );
