use super::*;
use crate::profile::DeviceKind;
use std::path::Path;

/// How a failed change is undone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RollbackPolicy {
    /// Compute the inverse from the pre-change snapshot.
    #[default]
    Derive,
    /// Run these commands in configuration mode instead.
    Explicit { commands: Vec<String> },
}

type Predicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// A read-only command plus a predicate its output must satisfy.
#[derive(Clone)]
pub struct VerifyCheck {
    pub command: String,
    pub description: String,
    predicate: Predicate,
}

impl fmt::Debug for VerifyCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifyCheck")
            .field("command", &self.command)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

impl VerifyCheck {
    /// Output must contain `needle`.
    pub fn contains(command: impl Into<String>, needle: impl Into<String>) -> Self {
        let needle = needle.into();
        Self {
            command: command.into(),
            description: format!("output contains '{needle}'"),
            predicate: Arc::new(move |output| output.contains(&needle)),
        }
    }

    /// Output must not contain `needle`.
    pub fn absent(command: impl Into<String>, needle: impl Into<String>) -> Self {
        let needle = needle.into();
        Self {
            command: command.into(),
            description: format!("output lacks '{needle}'"),
            predicate: Arc::new(move |output| !output.contains(&needle)),
        }
    }

    /// Output must match `pattern` somewhere.
    pub fn matches(command: impl Into<String>, pattern: &str) -> Result<Self, NetError> {
        let re = Regex::new(pattern).map_err(|err| {
            NetError::InvalidTransaction(format!("invalid verify pattern '{pattern}': {err}"))
        })?;
        Ok(Self {
            command: command.into(),
            description: format!("output matches /{pattern}/"),
            predicate: Arc::new(move |output| re.is_match(output)),
        })
    }

    pub fn custom<F>(command: impl Into<String>, description: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self {
            command: command.into(),
            description: description.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn check(&self, output: &str) -> bool {
        (self.predicate)(output)
    }
}

/// A configuration change to apply transactionally.
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub name: String,
    pub commands: Vec<String>,
    pub verify: Vec<VerifyCheck>,
    pub rollback: RollbackPolicy,
    /// Per-command budget; the session default applies when unset.
    pub timeout: Option<Duration>,
    /// Re-read the configuration after rollback and require it to match the
    /// pre-change snapshot.
    pub confirm_rollback: bool,
}

impl ConfigChange {
    pub fn new<I, S>(name: impl Into<String>, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            commands: commands.into_iter().map(Into::into).collect(),
            verify: Vec::new(),
            rollback: RollbackPolicy::Derive,
            timeout: None,
            confirm_rollback: true,
        }
    }

    /// Builds a change that replays a saved `show running-config`.
    ///
    /// Comment, banner-noise and `end` lines are dropped, indentation is
    /// removed and every section is closed with `exit`. The result merges
    /// into the running configuration; lines missing from the backup are
    /// left alone.
    pub fn from_backup(
        name: impl Into<String>,
        text: &str,
        kind: DeviceKind,
    ) -> Result<Self, NetError> {
        let name = name.into();
        let template = DeviceTemplate::for_kind(kind);
        let mut commands = Vec::new();
        let mut in_section = false;

        for raw in text.lines() {
            let line = raw.trim_end();
            let trimmed = line.trim();
            if trimmed.is_empty() || NOISE_LINE.is_match(trimmed) {
                continue;
            }
            if line.starts_with(' ') {
                commands.push(trimmed.to_string());
                continue;
            }
            if in_section {
                commands.push("exit".to_string());
                in_section = false;
            }
            if trimmed.starts_with('!') || trimmed == "end" {
                continue;
            }
            in_section = template.is_context_header(trimmed);
            commands.push(trimmed.to_string());
        }
        if in_section {
            commands.push("exit".to_string());
        }

        if commands.is_empty() {
            return Err(NetError::InvalidTransaction(format!(
                "backup '{name}' contains no configuration"
            )));
        }
        Ok(Self::new(name, commands))
    }

    /// Reads a backup file and builds a change from it, named after the file.
    pub fn from_backup_file(path: impl AsRef<Path>, kind: DeviceKind) -> Result<Self, NetError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| {
            NetError::InvalidTransaction(format!("cannot read backup {}: {err}", path.display()))
        })?;
        Self::from_backup(format!("restore {}", path.display()), &text, kind)
    }

    pub fn with_verify(mut self, check: VerifyCheck) -> Self {
        self.verify.push(check);
        self
    }

    pub fn with_explicit_rollback<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rollback = RollbackPolicy::Explicit {
            commands: commands.into_iter().map(Into::into).collect(),
        };
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_confirm_rollback(mut self, confirm: bool) -> Self {
        self.confirm_rollback = confirm;
        self
    }

    pub fn validate(&self) -> Result<(), NetError> {
        if self.name.trim().is_empty() {
            return Err(NetError::InvalidTransaction(
                "change name must not be empty".to_string(),
            ));
        }
        if self.commands.is_empty() {
            return Err(NetError::InvalidTransaction(format!(
                "change '{}' has no commands",
                self.name
            )));
        }
        let explicit = match &self.rollback {
            RollbackPolicy::Explicit { commands } => commands.as_slice(),
            RollbackPolicy::Derive => &[],
        };
        for command in self.commands.iter().chain(explicit) {
            if command.trim().is_empty() || command.contains('\n') {
                return Err(NetError::InvalidTransaction(format!(
                    "change '{}' contains an empty or multi-line command",
                    self.name
                )));
            }
        }
        if let Some(check) = self.verify.iter().find(|c| !is_read_only_command(&c.command)) {
            return Err(NetError::InvalidTransaction(format!(
                "verify command '{}' is not read-only",
                check.command
            )));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(NetError::InvalidTransaction(
                "timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lifecycle of a [`ConfigTransaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TxState {
    Created,
    SnapshotTaken,
    Applying,
    Verifying,
    Committed,
    RollingBack,
    RolledBack,
    RollbackFailed,
    Closed,
}

/// Report of one configuration transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConfigTransaction {
    pub name: String,
    pub commands: Vec<String>,
    /// Pre-change baseline; discarded once the change commits.
    pub snapshot: Option<ConfigSnapshot>,
    /// Commands the device accepted, in order.
    pub applied: Vec<String>,
    pub results: Vec<ExecutionResult>,
    pub rollback_commands: Vec<String>,
    pub history: Vec<TxState>,
    pub state: TxState,
}

impl ConfigTransaction {
    pub(super) fn new(change: &ConfigChange) -> Self {
        Self {
            name: change.name.clone(),
            commands: change.commands.clone(),
            snapshot: None,
            applied: Vec::new(),
            results: Vec::new(),
            rollback_commands: Vec::new(),
            history: vec![TxState::Created],
            state: TxState::Created,
        }
    }

    pub(super) fn advance(&mut self, next: TxState) {
        trace!("transaction '{}' {:?} -> {:?}", self.name, self.state, next);
        self.history.push(next);
        self.state = next;
    }

    pub fn committed(&self) -> bool {
        self.history.contains(&TxState::Committed)
    }

    pub fn rolled_back(&self) -> bool {
        self.history.contains(&TxState::RolledBack)
    }
}

/// Normalised running configuration.
///
/// Global lines and the lines of each context section are kept sorted, so
/// two snapshots of the same configuration compare equal regardless of the
/// order the device printed them in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ConfigSnapshot {
    pub global: Vec<String>,
    pub sections: BTreeMap<String, Vec<String>>,
    /// Hex SHA-256 of the normalised form.
    pub digest: String,
}

static NOISE_LINE: Lazy<Regex> = Lazy::new(|| {
    match Regex::new(
        r"^(Building configuration|Current configuration|Last configuration change|NVRAM config last updated)",
    ) {
        Ok(re) => re,
        Err(err) => panic!("invalid NOISE_LINE regex: {err}"),
    }
});

impl ConfigSnapshot {
    /// Parses `show running-config` output.
    pub fn parse(text: &str, template: &DeviceTemplate) -> Self {
        let mut global = BTreeSet::new();
        let mut sections: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut current: Option<String> = None;

        for raw in text.lines() {
            let line = raw.trim_end();
            let trimmed = line.trim();
            if trimmed.is_empty() || NOISE_LINE.is_match(trimmed) {
                continue;
            }
            if trimmed.starts_with('!') {
                current = None;
                continue;
            }
            let indented = line.starts_with(' ');
            if !indented {
                if trimmed == "end" {
                    current = None;
                } else if template.is_context_header(trimmed) {
                    sections.entry(trimmed.to_string()).or_default();
                    current = Some(trimmed.to_string());
                } else {
                    global.insert(trimmed.to_string());
                    current = None;
                }
                continue;
            }
            match current.as_ref().and_then(|header| sections.get_mut(header)) {
                Some(lines) => {
                    lines.insert(trimmed.to_string());
                }
                None => {
                    global.insert(trimmed.to_string());
                }
            }
        }

        Self::from_parts(
            global.into_iter().collect(),
            sections
                .into_iter()
                .map(|(header, lines)| (header, lines.into_iter().collect()))
                .collect(),
        )
    }

    fn from_parts(global: Vec<String>, sections: BTreeMap<String, Vec<String>>) -> Self {
        let mut hasher = Sha256::new();
        for line in &global {
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
        }
        for (header, lines) in &sections {
            hasher.update(header.as_bytes());
            hasher.update(b"\n");
            for line in lines {
                hasher.update(b" ");
                hasher.update(line.as_bytes());
                hasher.update(b"\n");
            }
        }
        let digest: [u8; 32] = hasher.finalize().into();
        let digest = digest.iter().map(|b| format!("{b:02x}")).collect();
        Self {
            global,
            sections,
            digest,
        }
    }

    pub fn section(&self, header: &str) -> Option<&[String]> {
        self.sections.get(header).map(|lines| lines.as_slice())
    }

    /// Lines of a context, or the global lines for `None`. Empty when the
    /// section does not exist.
    pub fn lines(&self, context: Option<&str>) -> &[String] {
        match context {
            Some(header) => self.section(header).unwrap_or(&[]),
            None => &self.global,
        }
    }
}

/// Ordered configuration commands that restore a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RollbackPlan {
    pub commands: Vec<String>,
    /// Some lines are re-applied verbatim from the snapshot.
    pub verbatim: bool,
}

enum AppliedLine<'a> {
    Header(&'a str),
    RemoveSection(&'a str),
    Setting {
        context: Option<&'a str>,
        line: &'a str,
    },
}

/// Lines of `base` that `target` addresses (`shutdown` addresses `shutdown`
/// and `shutdown vlan 10`).
fn addressed_by<'a>(base: &'a [String], target: &'a str) -> impl Iterator<Item = String> + 'a {
    base.iter()
        .filter(move |line| {
            line.as_str() == target
                || line
                    .strip_prefix(target)
                    .is_some_and(|rest| rest.starts_with(' '))
        })
        .cloned()
}

/// Computes the commands that undo `applied` relative to `snapshot`.
///
/// Commands are undone in reverse order:
/// - a context header only sets context; a section that did not exist before
///   is removed with `no <header>` and its settings need no undo
/// - a setting already in the snapshot changed nothing
/// - `no X` is undone by re-adding the snapshot lines it removed
/// - `no <header>` re-applies the whole section from the snapshot
/// - `default X` re-applies the affected snapshot lines verbatim
/// - a new setting `X` is undone by `no X` followed by the snapshot lines
///   with the same setting key
pub fn plan_rollback(
    template: &DeviceTemplate,
    snapshot: &ConfigSnapshot,
    applied: &[String],
) -> RollbackPlan {
    let mut items = Vec::with_capacity(applied.len());
    let mut created: HashSet<&str> = HashSet::new();
    let mut context: Option<&str> = None;

    for command in applied {
        let line = command.trim();
        if line.is_empty() || line == "exit" || line == "end" {
            context = None;
            continue;
        }
        if template.is_context_header(line) {
            if snapshot.section(line).is_none() {
                created.insert(line);
            }
            context = Some(line);
            items.push(AppliedLine::Header(line));
            continue;
        }
        if let Some(target) = line
            .strip_prefix("no ")
            .map(str::trim)
            .filter(|target| template.is_context_header(target))
        {
            context = None;
            items.push(AppliedLine::RemoveSection(target));
            continue;
        }
        items.push(AppliedLine::Setting { context, line });
    }

    let mut steps: Vec<(Option<&str>, Vec<String>)> = Vec::new();
    let mut removed: HashSet<&str> = HashSet::new();
    let mut verbatim = false;

    for item in items.iter().rev() {
        match *item {
            AppliedLine::Header(header) => {
                if created.contains(header) && removed.insert(header) {
                    steps.push((None, vec![format!("no {header}")]));
                }
            }
            AppliedLine::RemoveSection(header) => {
                if let Some(lines) = snapshot.section(header) {
                    steps.push((Some(header), lines.to_vec()));
                    verbatim = true;
                }
            }
            AppliedLine::Setting { context, line } => {
                if context.is_some_and(|header| created.contains(header)) {
                    continue;
                }
                let base = snapshot.lines(context);
                if base.iter().any(|existing| existing == line) {
                    continue;
                }
                let undo = if let Some(target) = line
                    .strip_prefix("no ")
                    .or_else(|| line.strip_prefix("default "))
                {
                    addressed_by(base, target.trim()).collect::<Vec<_>>()
                } else {
                    let key = template.setting_key(line);
                    let mut undo = vec![format!("no {line}")];
                    undo.extend(
                        base.iter()
                            .filter(|existing| template.setting_key(existing) == key)
                            .cloned(),
                    );
                    undo
                };
                if undo.iter().any(|cmd| base.contains(cmd)) {
                    verbatim = true;
                }
                if !undo.is_empty() {
                    steps.push((context, undo));
                }
            }
        }
    }

    let mut commands = Vec::new();
    let mut open: Option<&str> = None;
    for (context, lines) in steps {
        if open != context {
            if open.is_some() {
                commands.push("exit".to_string());
            }
            if let Some(header) = context {
                commands.push(header.to_string());
            }
            open = context;
        }
        commands.extend(lines);
    }
    if open.is_some() {
        commands.push("exit".to_string());
    }

    RollbackPlan { commands, verbatim }
}
