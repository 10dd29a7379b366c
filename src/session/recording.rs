use super::*;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Session recording granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionRecordLevel {
    /// Disable recording.
    Off,
    /// Record key events only.
    #[default]
    KeyEventsOnly,
    /// Record key events and raw chunks.
    Full,
}

/// A single recorded session event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SessionRecordEntry {
    pub ts_ms: u128,
    /// `user@host:port` of the session that produced the event.
    pub device: String,
    pub event: SessionEvent,
}

/// Supported recorded event types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionOpened {
        prompt: String,
        mode: String,
    },
    SessionClosed {
        reason: String,
    },
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    CommandSent {
        command: String,
        mode: String,
    },
    CommandResult {
        command: String,
        success: bool,
        output: String,
        #[serde(default)]
        error: Option<ErrorKind>,
    },
    TxCommitted {
        name: String,
        applied: Vec<String>,
    },
    TxRolledBack {
        name: String,
        cause: String,
        rollback_commands: Vec<String>,
    },
    FatalError {
        detail: String,
    },
    RawChunk {
        data: String,
    },
}

/// In-memory session recorder.
///
/// Clones share one event log, so a single recorder can be handed to every
/// session of a dispatcher run.
#[derive(Debug, Clone)]
pub struct SessionRecorder {
    level: SessionRecordLevel,
    entries: Arc<Mutex<Vec<SessionRecordEntry>>>,
}

fn lock_error<E: fmt::Display>(err: E) -> NetError {
    NetError::InternalServerError(format!("record lock error: {err}"))
}

impl SessionRecorder {
    /// Create a recorder with the given level.
    pub fn new(level: SessionRecordLevel) -> Self {
        Self {
            level,
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Current recording level.
    pub fn level(&self) -> SessionRecordLevel {
        self.level
    }

    /// Record a key-level event.
    pub fn record_event(&self, device: &str, event: SessionEvent) -> Result<(), NetError> {
        if self.level == SessionRecordLevel::Off {
            return Ok(());
        }
        let mut guard = self.entries.lock().map_err(lock_error)?;
        guard.push(SessionRecordEntry {
            ts_ms: now_ms(),
            device: device.to_string(),
            event,
        });
        Ok(())
    }

    /// Record raw shell data chunk when enabled.
    pub fn record_raw_chunk(&self, device: &str, data: String) -> Result<(), NetError> {
        if self.level != SessionRecordLevel::Full {
            return Ok(());
        }
        self.record_event(device, SessionEvent::RawChunk { data })
    }

    /// Snapshot all records.
    pub fn entries(&self) -> Result<Vec<SessionRecordEntry>, NetError> {
        let guard = self.entries.lock().map_err(lock_error)?;
        Ok(guard.clone())
    }

    /// Events of one device, in recording order.
    pub fn events_for(&self, device: &str) -> Result<Vec<SessionEvent>, NetError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|entry| entry.device == device)
            .map(|entry| entry.event)
            .collect())
    }

    /// Clears all recorded events.
    pub fn clear(&self) -> Result<(), NetError> {
        let mut guard = self.entries.lock().map_err(lock_error)?;
        guard.clear();
        Ok(())
    }

    /// Export records as JSONL.
    pub fn to_jsonl(&self) -> Result<String, NetError> {
        let entries = self.entries()?;
        let mut lines = Vec::with_capacity(entries.len());
        for entry in entries {
            let line = serde_json::to_string(&entry).map_err(|e| {
                NetError::InternalServerError(format!("record encode error: {e}"))
            })?;
            lines.push(line);
        }
        Ok(lines.join("\n"))
    }

    /// Restore recorder from JSONL lines.
    pub fn from_jsonl(jsonl: &str) -> Result<Self, NetError> {
        let mut parsed = Vec::new();
        for line in jsonl.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: SessionRecordEntry = serde_json::from_str(line).map_err(|e| {
                NetError::InternalServerError(format!("record decode error: {e}"))
            })?;
            parsed.push(entry);
        }

        Ok(Self {
            level: SessionRecordLevel::Full,
            entries: Arc::new(Mutex::new(parsed)),
        })
    }
}

impl Default for SessionRecorder {
    fn default() -> Self {
        Self::new(SessionRecordLevel::default())
    }
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}
