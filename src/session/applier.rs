use super::*;

impl Session {
    /// Reads and normalises the running configuration from privileged mode.
    pub async fn snapshot(&mut self, timeout: Duration) -> Result<ConfigSnapshot, NetError> {
        let privileged = self.template.privileged_mode;
        self.enter_mode(privileged).await?;
        let command = self.template.snapshot_command;
        let result = self.run_one(command, timeout).await?;
        Ok(ConfigSnapshot::parse(&result.output, &self.template))
    }

    /// Applies `change` as a transaction.
    ///
    /// `Ok` always means committed. Any failure after the snapshot rolls the
    /// device back and returns [`NetError::ApplyError`] with the report; a
    /// failed rollback returns [`NetError::RollbackFailedError`].
    pub async fn apply(&mut self, change: &ConfigChange) -> Result<ConfigTransaction, NetError> {
        change.validate()?;
        self.ensure_usable(&format!("apply '{}'", change.name))?;
        let timeout = change.timeout.unwrap_or(self.options.command_timeout);
        let mut tx = ConfigTransaction::new(change);
        debug!(
            "{} applying '{}' ({} commands)",
            self.profile.id(),
            change.name,
            change.commands.len()
        );

        match self.snapshot(timeout).await {
            Ok(snapshot) => {
                tx.snapshot = Some(snapshot);
                tx.advance(TxState::SnapshotTaken);
            }
            Err(cause) => {
                debug!("{} snapshot failed, nothing sent: {}", self.profile.id(), cause);
                tx.advance(TxState::Closed);
                return Err(NetError::ApplyError {
                    transaction: change.name.clone(),
                    cause: Box::new(cause),
                    report: Box::new(tx),
                });
            }
        }

        let cause = match self.apply_and_verify(change, &mut tx, timeout).await {
            Ok(()) => {
                tx.snapshot = None;
                tx.advance(TxState::Committed);
                tx.advance(TxState::Closed);
                debug!("{} '{}' committed", self.profile.id(), change.name);
                self.record(SessionEvent::TxCommitted {
                    name: change.name.clone(),
                    applied: tx.applied.clone(),
                });
                return Ok(tx);
            }
            Err(cause) => cause,
        };

        self.roll_back(change, tx, cause, timeout).await
    }

    async fn apply_and_verify(
        &mut self,
        change: &ConfigChange,
        tx: &mut ConfigTransaction,
        timeout: Duration,
    ) -> Result<(), NetError> {
        tx.advance(TxState::Applying);
        let config_mode = self.template.config_mode;
        self.enter_mode(config_mode).await?;

        let batch = CommandBatch::mutating(change.commands.clone());
        let outcome = self.run_batch(&batch, timeout, true).await;
        tx.applied = outcome
            .results
            .iter()
            .filter(|result| result.success)
            .map(|result| result.command.clone())
            .collect();
        tx.results = outcome.results;
        if let Some(err) = outcome.failure {
            return Err(err);
        }

        let privileged = self.template.privileged_mode;
        self.enter_mode(privileged).await?;

        tx.advance(TxState::Verifying);
        for check in &change.verify {
            let result = self.run_one(&check.command, timeout).await?;
            if !check.check(&result.output) {
                return Err(NetError::VerifyFailed(format!(
                    "'{}': expected {}",
                    check.command, check.description
                )));
            }
        }
        Ok(())
    }

    async fn roll_back(
        &mut self,
        change: &ConfigChange,
        mut tx: ConfigTransaction,
        cause: NetError,
        timeout: Duration,
    ) -> Result<ConfigTransaction, NetError> {
        tx.advance(TxState::RollingBack);
        debug!("{} rolling back '{}': {}", self.profile.id(), change.name, cause);

        match self.restore(change, &mut tx, timeout).await {
            Ok(()) => {
                tx.advance(TxState::RolledBack);
                tx.advance(TxState::Closed);
                self.record(SessionEvent::TxRolledBack {
                    name: change.name.clone(),
                    cause: cause.to_string(),
                    rollback_commands: tx.rollback_commands.clone(),
                });
                Err(NetError::ApplyError {
                    transaction: change.name.clone(),
                    cause: Box::new(cause),
                    report: Box::new(tx),
                })
            }
            Err(detail) => {
                warn!(
                    "{} rollback of '{}' failed, device state unknown: {}",
                    self.profile.id(),
                    change.name,
                    detail
                );
                tx.advance(TxState::RollbackFailed);
                tx.advance(TxState::Closed);
                self.record(SessionEvent::FatalError {
                    detail: format!("rollback of '{}' failed: {detail}", change.name),
                });
                Err(NetError::RollbackFailedError {
                    transaction: change.name.clone(),
                    detail: format!("{detail} (after: {cause})"),
                    report: Box::new(tx),
                })
            }
        }
    }

    /// Brings the device back to the pre-change snapshot.
    async fn restore(
        &mut self,
        change: &ConfigChange,
        tx: &mut ConfigTransaction,
        timeout: Duration,
    ) -> Result<(), String> {
        if !self.is_usable() {
            self.reopen()
                .await
                .map_err(|err| format!("reconnect failed: {err}"))?;
        }

        let Some(snapshot) = tx.snapshot.as_ref() else {
            return Err("no pre-change snapshot".to_string());
        };
        let plan = match &change.rollback {
            RollbackPolicy::Derive => plan_rollback(&self.template, snapshot, &tx.applied).commands,
            RollbackPolicy::Explicit { commands } => commands.clone(),
        };
        let baseline = snapshot.digest.clone();
        tx.rollback_commands = plan.clone();

        let config_mode = self.template.config_mode;
        let privileged = self.template.privileged_mode;
        if !plan.is_empty() {
            self.enter_mode(config_mode)
                .await
                .map_err(|err| format!("cannot enter configuration mode: {err}"))?;
            for command in &plan {
                self.run_one(command, timeout)
                    .await
                    .map_err(|err| format!("rollback command '{command}' failed: {err}"))?;
            }
        }
        self.enter_mode(privileged)
            .await
            .map_err(|err| format!("cannot leave configuration mode: {err}"))?;

        if change.confirm_rollback {
            let after = self
                .snapshot(timeout)
                .await
                .map_err(|err| format!("confirmation snapshot failed: {err}"))?;
            if after.digest != baseline {
                return Err(format!(
                    "running configuration differs from the pre-change snapshot ({} != {})",
                    &after.digest[..12],
                    &baseline[..12]
                ));
            }
        }
        Ok(())
    }
}
