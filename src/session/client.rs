use super::*;

/// Output collected between a command and the next prompt.
#[derive(Debug, Clone, Default)]
pub(super) struct Reply {
    pub lines: Vec<String>,
    /// Lines that matched an error pattern.
    pub errors: Vec<String>,
    pub prompt: String,
}

impl Reply {
    /// Output without the command echo and trailing blank lines.
    pub fn output(&self, command: &str) -> String {
        let mut lines = self.lines.as_slice();
        if let Some(first) = lines.first()
            && !command.trim().is_empty()
            && first.trim() == command.trim()
        {
            lines = &lines[1..];
        }
        while let Some(last) = lines.last()
            && last.trim().is_empty()
        {
            lines = &lines[..lines.len() - 1];
        }
        while let Some(first) = lines.first()
            && first.trim().is_empty()
        {
            lines = &lines[1..];
        }
        lines.join("\n")
    }

    pub(super) fn device_error(&self, command: &str) -> Option<NetError> {
        if self.errors.is_empty() {
            return None;
        }
        Some(NetError::DeviceError {
            command: command.to_string(),
            detail: self.errors.join("\n"),
            output: self.output(command),
        })
    }
}

impl Session {
    /// Opens a session: connect, authenticate, wait for the first prompt and
    /// elevate to privileged mode when the device family needs it.
    pub async fn open(
        transport: Arc<dyn Transport>,
        profile: DeviceProfile,
        options: SessionOptions,
        recorder: Option<SessionRecorder>,
    ) -> Result<Session, ConnectError> {
        let template = DeviceTemplate::for_kind(profile.kind);
        let handler = Self::build_handler(&template, &profile)?;
        let mut session = Session {
            profile,
            transport,
            template,
            handler,
            channel: None,
            state: SessionState::Disconnected,
            prompt: String::new(),
            options,
            recorder,
            commands_sent: 0,
            last_command: None,
            desynced: false,
        };
        session.establish().await?;
        Ok(session)
    }

    fn build_handler(
        template: &DeviceTemplate,
        profile: &DeviceProfile,
    ) -> Result<DeviceHandler, ConnectError> {
        let mut handler = template
            .handler()
            .map_err(|err| ConnectError::InvalidProfile {
                device: profile.id(),
                detail: err.to_string(),
            })?;
        if let Some(secret) = profile.enable_secret.as_ref() {
            handler.set_param(ENABLE_PASSWORD_PARAM, format!("{secret}\n"));
        }
        Ok(handler)
    }

    async fn establish(&mut self) -> Result<(), ConnectError> {
        let device = self.profile.id();
        let timeout = self.options.connect_timeout;
        self.transition(SessionState::Connecting);

        let connected =
            tokio::time::timeout(timeout, self.transport.connect(&self.profile)).await;
        let channel = match connected {
            Ok(Ok(channel)) => channel,
            Ok(Err(err)) => {
                self.transition(SessionState::Failed);
                return Err(err);
            }
            Err(_) => {
                self.transition(SessionState::Failed);
                return Err(ConnectError::UnreachableError {
                    device,
                    detail: format!("connect timed out after {}s", timeout.as_secs()),
                });
            }
        };
        debug!("{} transport connected", device);
        self.channel = Some(channel);
        self.desynced = false;

        let reply = match self.read_until_prompt("", timeout).await {
            Ok(reply) => reply,
            Err(err) => {
                self.abandon().await;
                let detail = match err {
                    NetError::TimeoutError { .. } => {
                        format!("no prompt within {}s", timeout.as_secs())
                    }
                    other => other.to_string(),
                };
                return Err(ConnectError::UnreachableError { device, detail });
            }
        };
        self.prompt = reply.prompt;
        self.transition(SessionState::Ready);
        self.record(SessionEvent::SessionOpened {
            prompt: self.prompt.clone(),
            mode: self.handler.current_state().to_string(),
        });

        let privileged = self.template.privileged_mode;
        if self.handler.current_state() == privileged {
            self.transition(SessionState::Privileged);
        } else if self.template.requires_enable {
            if let Err(err) = self.enter_mode(privileged).await {
                warn!("{} privilege elevation failed: {}", device, err);
                self.abandon().await;
                let detail = match err {
                    NetError::DeviceError { detail, .. } => detail,
                    other => other.to_string(),
                };
                return Err(ConnectError::PrivilegeError { device, detail });
            }
            self.transition(SessionState::Privileged);
        }

        self.prepare().await;
        Ok(())
    }

    /// Sends the template's preparation commands; failures are only logged.
    async fn prepare(&mut self) {
        let timeout = self.options.command_timeout;
        for command in self.template.session_prep.clone() {
            match self.exchange(command, timeout).await {
                Ok(reply) => {
                    if let Some(err) = reply.device_error(command) {
                        warn!("{} session prep '{}' rejected: {}", self.profile.id(), command, err);
                    }
                }
                Err(err) => {
                    warn!("{} session prep '{}' failed: {}", self.profile.id(), command, err);
                }
            }
        }
    }

    /// Drops the channel after a failed open.
    async fn abandon(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
        }
        self.transition(SessionState::Failed);
    }

    /// Releases the transport. Idempotent, safe from any state.
    pub async fn close(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            debug!("{} Safely closing session...", self.profile.id());
            channel.close().await;
        }
        if self.state != SessionState::Closed {
            let reason = format!("closed from {}", self.state);
            self.transition(SessionState::Closed);
            self.record(SessionEvent::SessionClosed { reason });
        }
    }

    /// Closes and re-establishes the session with the same profile.
    pub async fn reopen(&mut self) -> Result<(), ConnectError> {
        debug!("{} reopening session", self.profile.id());
        self.close().await;
        self.handler = Self::build_handler(&self.template, &self.profile)?;
        self.transition(SessionState::Disconnected);
        self.establish().await
    }

    /// Walks the mode graph to `mode` (e.g. `config`, `enable`).
    pub async fn enter_mode(&mut self, mode: &str) -> Result<(), NetError> {
        self.ensure_usable(&format!("enter {mode} mode"))?;
        let timeout = self.options.command_timeout;
        if !self.handler.at_prompt() {
            debug!("{} resynchronising on an empty line", self.profile.id());
            self.exchange("", timeout).await?;
        }

        let path = self.handler.trans_state_write(mode)?;
        for (command, expected) in path {
            debug!("Trans state command: {}", command);
            let reply = self.exchange(&command, timeout).await?;
            if let Some(err) = reply.device_error(&command) {
                return Err(err);
            }
            let current = self.handler.current_state();
            if current != expected {
                return Err(NetError::UnreachableState(format!(
                    "'{command}' left {} in '{current}' instead of '{expected}'",
                    self.profile.id()
                )));
            }
        }
        Ok(())
    }

    /// Sends one line and reads up to the next prompt.
    pub(super) async fn exchange(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<Reply, NetError> {
        let state = self.state;
        let mode = self.handler.current_state().to_string();
        let Some(channel) = self.channel.as_mut() else {
            return Err(NetError::SessionStateError {
                state,
                action: format!("send '{command}'"),
            });
        };

        // 1. Clear any residual data in the receiver
        channel.drain();

        // 2. Send command to remote shell
        if let Err(err) = channel.send(&format!("{command}\n")).await {
            self.transition(SessionState::Failed);
            return Err(err);
        }
        self.commands_sent += 1;
        self.last_command = Some(command.to_string());
        self.record(SessionEvent::CommandSent {
            command: command.to_string(),
            mode,
        });

        // 3. Receive data
        let reply = self.read_until_prompt(command, timeout).await?;
        self.prompt = reply.prompt.clone();
        Ok(reply)
    }

    /// Consumes shell output until the trailing partial line is a prompt.
    ///
    /// Interactive prompts (enable password, `[confirm]`, pagination) are
    /// answered as they appear. Error-pattern lines are collected into
    /// [`Reply::errors`].
    ///
    /// After a timeout the output of the abandoned command may still be in
    /// flight, so everything up to the echo of `command` is discarded.
    pub(super) async fn read_until_prompt(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<Reply, NetError> {
        let state = self.state;
        let device = self.profile.id();
        let Some(channel) = self.channel.as_mut() else {
            return Err(NetError::SessionStateError {
                state,
                action: format!("read output of '{command}'"),
            });
        };
        let handler = &mut self.handler;
        let recorder = self.recorder.as_ref();
        let echo = command.trim();
        let resync = self.desynced && !echo.is_empty();
        let mut skipping = resync;

        let mut reply = Reply::default();
        let mut line_buffer = String::new();

        let result = tokio::time::timeout(timeout, async {
            loop {
                let Some(data) = channel.recv().await else {
                    return Err(NetError::ChannelDisconnectError);
                };
                trace!("{:?}", data);
                if let Some(recorder) = recorder {
                    let _ = recorder.record_raw_chunk(&device, data.clone());
                }
                line_buffer.push_str(&data);

                while let Some(newline_pos) = line_buffer.find('\n') {
                    let line = line_buffer.drain(..=newline_pos).collect::<String>();
                    let trim_start = IGNORE_START_LINE.replace(&line, "");
                    let trimmed_line = trim_start.trim_end();

                    if skipping {
                        if !trimmed_line.ends_with(echo) {
                            trace!("discarding stale line {:?}", trimmed_line);
                            continue;
                        }
                        skipping = false;
                    }
                    handler.read(trimmed_line);
                    if handler.error() {
                        reply.errors.push(trimmed_line.to_string());
                    }
                    reply.lines.push(trimmed_line.to_string());
                }

                // The prompt never ends with a newline, so it is always the
                // trailing partial line.
                if !line_buffer.is_empty() {
                    let partial = IGNORE_START_LINE.replace(&line_buffer, "").to_string();
                    if skipping {
                        if handler.read_prompt(&partial) {
                            handler.read(&partial);
                            line_buffer.clear();
                        } else if let Some((input, is_record)) = handler.read_need_write(&partial) {
                            handler.read(&partial);
                            if !is_record {
                                line_buffer.clear();
                            }
                            channel.send(&input).await?;
                        }
                        continue;
                    }
                    if handler.read_prompt(&partial) {
                        handler.read(&partial);
                        reply.prompt = partial.trim_end().to_string();
                        line_buffer.clear();
                        return Ok(());
                    }
                    if let Some((input, is_record)) = handler.read_need_write(&partial) {
                        handler.read(&partial);
                        if !is_record {
                            line_buffer.clear();
                        }
                        trace!("Input required: '{:?}'", partial);
                        channel.send(&input).await?;
                    } else if handler.awaits_input(&partial) {
                        return Err(NetError::DeviceError {
                            command: command.to_string(),
                            detail: format!(
                                "device asked for '{}' but no value is configured",
                                partial.trim()
                            ),
                            output: reply.lines.join("\n"),
                        });
                    }
                }
            }
        })
        .await;

        match result {
            Ok(Ok(())) => {
                if resync {
                    self.desynced = false;
                }
                Ok(reply)
            }
            Ok(Err(NetError::ChannelDisconnectError)) => {
                debug!("{} channel disconnected while waiting for a prompt", device);
                self.transition(SessionState::Failed);
                Err(NetError::ChannelDisconnectError)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => {
                self.desynced = true;
                let mut partial = reply.output(command);
                if !line_buffer.is_empty() {
                    if !partial.is_empty() {
                        partial.push('\n');
                    }
                    partial.push_str(line_buffer.trim_end());
                }
                Err(NetError::TimeoutError {
                    command: command.to_string(),
                    partial,
                })
            }
        }
    }

    pub(super) fn ensure_usable(&self, action: &str) -> Result<(), NetError> {
        if self.is_usable() {
            return Ok(());
        }
        Err(NetError::SessionStateError {
            state: self.state,
            action: action.to_string(),
        })
    }

    /// True when commands can be sent: Ready or Privileged with a live channel.
    pub fn is_usable(&self) -> bool {
        matches!(self.state, SessionState::Ready | SessionState::Privileged)
            && self
                .channel
                .as_ref()
                .map(|channel| !channel.is_closed())
                .unwrap_or(false)
    }

    pub(super) fn transition(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        let from = self.state;
        debug!("{} session {} -> {}", self.profile.id(), from, next);
        self.state = next;
        self.record(SessionEvent::StateChanged { from, to: next });
    }

    pub(super) fn record(&self, event: SessionEvent) {
        if let Some(recorder) = self.recorder.as_ref() {
            let _ = recorder.record_event(&self.profile.id(), event);
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn template(&self) -> &DeviceTemplate {
        &self.template
    }

    /// Current CLI mode as named by the template (`login`, `enable`, `config`, ...).
    pub fn mode(&self) -> &str {
        self.handler.current_state()
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub(super) fn commands_sent(&self) -> u64 {
        self.commands_sent
    }

    pub(super) fn last_command(&self) -> Option<&str> {
        self.last_command.as_deref()
    }
}
