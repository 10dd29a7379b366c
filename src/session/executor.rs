use super::*;

/// Why a single command failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CommandFailure {
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome of one command.
///
/// Carries no timing data, so results from two runs against an unchanged
/// device compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionResult {
    pub command: String,
    pub output: String,
    pub success: bool,
    pub error: Option<CommandFailure>,
}

impl ExecutionResult {
    fn ok(command: &str, output: String) -> Self {
        Self {
            command: command.to_string(),
            output,
            success: true,
            error: None,
        }
    }

    fn failed(command: &str, err: &NetError) -> Self {
        let output = match err {
            NetError::DeviceError { output, .. } => output.clone(),
            NetError::TimeoutError { partial, .. } => partial.clone(),
            _ => String::new(),
        };
        Self {
            command: command.to_string(),
            output,
            success: false,
            error: Some(CommandFailure {
                kind: err.kind(),
                message: err.to_string(),
            }),
        }
    }
}

/// Ordered command list. Insertion order is execution order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CommandBatch {
    pub commands: Vec<String>,
    /// Whether any command may change device state.
    pub mutating: bool,
}

impl CommandBatch {
    /// Builds a batch, marking it read-only when every command is.
    pub fn new<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let commands = commands.into_iter().map(Into::into).collect::<Vec<String>>();
        let mutating = !commands.iter().all(|cmd| is_read_only_command(cmd));
        Self { commands, mutating }
    }

    pub fn read_only<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            commands: commands.into_iter().map(Into::into).collect(),
            mutating: false,
        }
    }

    pub fn mutating<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            commands: commands.into_iter().map(Into::into).collect(),
            mutating: true,
        }
    }

    /// Queries keep going after a failure, state-changing batches stop.
    pub fn default_stop_on_error(&self) -> bool {
        self.mutating
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Results of a batch, in execution order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResult {
    pub results: Vec<ExecutionResult>,
    /// The batch stopped before its last command.
    pub truncated: bool,
    /// First error encountered, if any.
    pub failure: Option<NetError>,
}

impl BatchResult {
    pub fn is_success(&self) -> bool {
        self.failure.is_none() && !self.truncated
    }

    pub fn outputs(&self) -> Vec<&str> {
        self.results.iter().map(|r| r.output.as_str()).collect()
    }
}

impl Session {
    /// Sends exactly one command line and waits for the prompt.
    pub async fn run_one(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecutionResult, NetError> {
        self.ensure_usable(&format!("run '{command}'"))?;

        let result = self
            .exchange(command, timeout)
            .await
            .and_then(|reply| match reply.device_error(command) {
                Some(err) => Err(err),
                None => Ok(ExecutionResult::ok(command, reply.output(command))),
            });

        let (success, output, error) = match &result {
            Ok(done) => (true, done.output.clone(), None),
            Err(err) => {
                let failed = ExecutionResult::failed(command, err);
                (false, failed.output, Some(err.kind()))
            }
        };
        self.record(SessionEvent::CommandResult {
            command: command.to_string(),
            success,
            output,
            error,
        });
        result
    }

    /// Runs `batch` in order on this session.
    ///
    /// With `stop_on_error` a failing command ends the batch; a lost
    /// connection always does. Whatever was collected is returned.
    pub async fn run_batch(
        &mut self,
        batch: &CommandBatch,
        timeout: Duration,
        stop_on_error: bool,
    ) -> BatchResult {
        let mut outcome = BatchResult::default();
        let total = batch.commands.len();

        for (index, command) in batch.commands.iter().enumerate() {
            match self.run_one(command, timeout).await {
                Ok(result) => outcome.results.push(result),
                Err(err) => {
                    debug!("{} '{}' failed: {}", self.profile.id(), command, err);
                    outcome.results.push(ExecutionResult::failed(command, &err));
                    let unrecoverable = !self.is_usable();
                    if outcome.failure.is_none() {
                        outcome.failure = Some(err);
                    }
                    if stop_on_error || unrecoverable {
                        outcome.truncated = index + 1 < total;
                        break;
                    }
                }
            }
        }
        outcome
    }
}
