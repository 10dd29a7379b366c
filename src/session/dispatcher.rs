use super::*;
use std::sync::{Mutex as StdMutex, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit};

/// Work for one device.
#[derive(Debug, Clone)]
pub enum Operation {
    /// Run a command batch in the current (privileged) mode.
    Query {
        batch: CommandBatch,
        timeout: Option<Duration>,
        /// Defaults to [`CommandBatch::default_stop_on_error`].
        stop_on_error: Option<bool>,
    },
    /// Apply a configuration change transactionally.
    Configure(ConfigChange),
}

impl Operation {
    pub fn query(batch: CommandBatch) -> Self {
        Operation::Query {
            batch,
            timeout: None,
            stop_on_error: None,
        }
    }

    pub fn configure(change: ConfigChange) -> Self {
        Operation::Configure(change)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutput {
    Query(BatchResult),
    Configure(ConfigTransaction),
}

/// Result of one operation on one device.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceOutcome {
    Success(OperationOutput),
    /// At least one command of a query failed; every collected result is kept.
    Partial(OperationOutput),
    Failed(NetError),
}

impl DeviceOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DeviceOutcome::Success(_))
    }

    pub fn error(&self) -> Option<&NetError> {
        match self {
            DeviceOutcome::Failed(err) => Some(err),
            DeviceOutcome::Partial(OperationOutput::Query(batch)) => batch.failure.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub profile: DeviceProfile,
    pub operation: Operation,
}

impl Job {
    pub fn new(profile: DeviceProfile, operation: Operation) -> Self {
        Self { profile, operation }
    }
}

/// Aggregated results of one dispatcher call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    /// One entry per device, outcomes in submission order.
    pub devices: BTreeMap<String, Vec<DeviceOutcome>>,
    /// A rollback failed somewhere and a device was left in an unknown state.
    pub degraded: bool,
}

impl RunReport {
    pub fn outcomes(&self, device: &str) -> Option<&[DeviceOutcome]> {
        self.devices.get(device).map(|outcomes| outcomes.as_slice())
    }

    /// Outcome of the first operation submitted for `device`.
    pub fn first(&self, device: &str) -> Option<&DeviceOutcome> {
        self.devices.get(device).and_then(|outcomes| outcomes.first())
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Runs operations across many devices with a bounded number of sessions.
///
/// One worker task per device; jobs for the same device run on one session
/// in submission order, and concurrent calls on the same dispatcher queue
/// behind a per-device FIFO lock.
///
/// [`Dispatcher::cancel`] stops every run in flight. Runs started after it
/// are not affected; a single run is cancelled through the token passed to
/// [`Dispatcher::execute_jobs_until`].
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    config: DispatcherConfig,
    semaphore: Arc<Semaphore>,
    device_locks: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
    /// Parent of the tokens of every run started since the last `cancel()`.
    cancel: StdMutex<CancellationToken>,
    recorder: Option<SessionRecorder>,
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>, config: DispatcherConfig) -> Result<Self, NetError> {
        config.validate()?;
        Ok(Self {
            transport,
            semaphore: Arc::new(Semaphore::new(config.max_sessions)),
            config,
            device_locks: Arc::new(StdMutex::new(HashMap::new())),
            cancel: StdMutex::new(CancellationToken::new()),
            recorder: None,
        })
    }

    pub fn with_recorder(mut self, recorder: SessionRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Token shared by the runs currently in flight; cancelling it stops
    /// them and their queued work.
    pub fn cancel_token(&self) -> CancellationToken {
        lock(&self.cancel).clone()
    }

    /// Stops in-flight and queued work of every run started so far.
    pub fn cancel(&self) {
        let mut current = lock(&self.cancel);
        current.cancel();
        *current = CancellationToken::new();
    }

    /// Runs `operation` against every profile.
    pub async fn execute(&self, profiles: &[DeviceProfile], operation: Operation) -> RunReport {
        self.execute_until(profiles, operation, CancellationToken::new())
            .await
    }

    /// Like [`Dispatcher::execute`], stopping when `cancel` fires.
    pub async fn execute_until(
        &self,
        profiles: &[DeviceProfile],
        operation: Operation,
        cancel: CancellationToken,
    ) -> RunReport {
        let jobs = profiles
            .iter()
            .map(|profile| Job::new(profile.clone(), operation.clone()))
            .collect();
        self.execute_jobs_until(jobs, cancel).await
    }

    /// Runs a list of jobs; jobs for one device share a session.
    pub async fn execute_jobs(&self, jobs: Vec<Job>) -> RunReport {
        self.execute_jobs_until(jobs, CancellationToken::new()).await
    }

    /// Like [`Dispatcher::execute_jobs`], stopping when `cancel` fires.
    pub async fn execute_jobs_until(&self, jobs: Vec<Job>, cancel: CancellationToken) -> RunReport {
        let mut groups: Vec<(String, DeviceProfile, Vec<Operation>)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for job in jobs {
            let id = job.profile.id();
            match index.get(&id) {
                Some(&slot) => groups[slot].2.push(job.operation),
                None => {
                    index.insert(id.clone(), groups.len());
                    groups.push((id, job.profile, vec![job.operation]));
                }
            }
        }
        debug!(
            "dispatching {} devices with at most {} sessions",
            groups.len(),
            self.config.max_sessions
        );

        let run = self.cancel_token().child_token();
        if cancel.is_cancelled() {
            run.cancel();
        }
        let forward = {
            let run = run.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => run.cancel(),
                    _ = run.cancelled() => {}
                }
            })
        };

        let mut handles = Vec::with_capacity(groups.len());
        for (id, profile, operations) in groups {
            let worker = Worker {
                transport: self.transport.clone(),
                options: self.config.session_options(),
                semaphore: self.semaphore.clone(),
                device_lock: self.device_lock(&id),
                cancel: run.clone(),
                recorder: self.recorder.clone(),
            };
            let count = operations.len();
            let handle = tokio::spawn(worker.run(profile, operations));
            handles.push((id, count, handle));
        }

        let mut report = RunReport::default();
        for (id, count, handle) in handles {
            let outcomes = match handle.await {
                Ok(outcomes) => outcomes,
                Err(err) => {
                    warn!("{} device worker failed: {}", id, err);
                    vec![
                        DeviceOutcome::Failed(NetError::InternalServerError(format!(
                            "device worker failed: {err}"
                        )));
                        count
                    ]
                }
            };
            if outcomes
                .iter()
                .any(|outcome| outcome.error().is_some_and(NetError::is_fatal))
            {
                report.degraded = true;
            }
            report.devices.insert(id, outcomes);
        }

        forward.abort();
        self.prune_device_locks();
        report
    }

    fn device_lock(&self, id: &str) -> Arc<Mutex<()>> {
        lock(&self.device_locks)
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    /// Drops locks no worker holds or waits on.
    fn prune_device_locks(&self) {
        lock(&self.device_locks).retain(|_, device_lock| Arc::strong_count(device_lock) > 1);
    }
}

struct Worker {
    transport: Arc<dyn Transport>,
    options: SessionOptions,
    semaphore: Arc<Semaphore>,
    device_lock: Arc<Mutex<()>>,
    cancel: CancellationToken,
    recorder: Option<SessionRecorder>,
}

impl Worker {
    async fn run(self, profile: DeviceProfile, operations: Vec<Operation>) -> Vec<DeviceOutcome> {
        let id = profile.id();
        let total = operations.len();
        let cancelled = || vec![DeviceOutcome::Failed(NetError::Cancelled); total];

        let _device_guard: OwnedMutexGuard<()> = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return cancelled(),
            guard = self.device_lock.clone().lock_owned() => guard,
        };
        // Held until the session is closed at the end of this function.
        let _permit: OwnedSemaphorePermit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return cancelled(),
            permit = self.semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    return vec![
                        DeviceOutcome::Failed(NetError::InternalServerError(
                            "session pool closed".to_string(),
                        ));
                        total
                    ];
                }
            },
        };

        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return cancelled(),
            opened = Session::open(
                self.transport.clone(),
                profile,
                self.options,
                self.recorder.clone(),
            ) => opened,
        };
        let mut session = match opened {
            Ok(session) => session,
            Err(err) => {
                debug!("{} open failed: {}", id, err);
                return vec![DeviceOutcome::Failed(NetError::Connect(err)); total];
            }
        };

        let mut outcomes = Vec::with_capacity(total);
        let mut fatal: Option<String> = None;
        for operation in operations {
            if let Some(transaction) = fatal.as_ref() {
                outcomes.push(DeviceOutcome::Failed(NetError::Aborted(format!(
                    "rollback of '{transaction}' left {id} in an unknown state"
                ))));
                continue;
            }
            if self.cancel.is_cancelled() {
                outcomes.push(DeviceOutcome::Failed(NetError::Cancelled));
                continue;
            }

            let sent_before = session.commands_sent();
            let finished = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                outcome = run_operation(&mut session, &operation, &self.options) => Some(outcome),
            };
            match finished {
                Some(outcome) => {
                    if let DeviceOutcome::Failed(NetError::RollbackFailedError { transaction, .. }) =
                        &outcome
                    {
                        fatal = Some(transaction.clone());
                    }
                    outcomes.push(outcome);
                }
                None if session.commands_sent() > sent_before => {
                    let command = session.last_command().unwrap_or_default().to_string();
                    debug!("{} cancelled while awaiting '{}'", id, command);
                    outcomes.push(DeviceOutcome::Failed(NetError::TimeoutError {
                        command,
                        partial: String::new(),
                    }));
                    session.close().await;
                }
                None => outcomes.push(DeviceOutcome::Failed(NetError::Cancelled)),
            }
        }

        session.close().await;
        outcomes
    }
}

async fn run_operation(
    session: &mut Session,
    operation: &Operation,
    options: &SessionOptions,
) -> DeviceOutcome {
    match operation {
        Operation::Query {
            batch,
            timeout,
            stop_on_error,
        } => {
            let timeout = timeout.unwrap_or(options.command_timeout);
            let stop_on_error = stop_on_error.unwrap_or_else(|| batch.default_stop_on_error());
            let result = session.run_batch(batch, timeout, stop_on_error).await;
            match result.failure.clone() {
                None if !result.truncated => DeviceOutcome::Success(OperationOutput::Query(result)),
                Some(err) if result.results.is_empty() => DeviceOutcome::Failed(err),
                _ => DeviceOutcome::Partial(OperationOutput::Query(result)),
            }
        }
        Operation::Configure(change) => match session.apply(change).await {
            Ok(tx) => DeviceOutcome::Success(OperationOutput::Configure(tx)),
            Err(err) => DeviceOutcome::Failed(err),
        },
    }
}
