use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::serializer::Serializer;

/// Default number of additional retries after the first failed attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default per-attempt deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);

/// Default lifetime of terminal task records in the broker.
pub const DEFAULT_TTL: Duration = Duration::from_secs(180);

/// Default backoff table used when none is configured.
pub fn default_retry_intervals() -> Vec<Duration> {
    vec![
        Duration::from_secs(60),
        Duration::from_secs(120),
        Duration::from_secs(180),
    ]
}

/// Task status in the queue lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task is on the live list or delayed set, waiting for a worker.
    Waiting,
    /// Task is currently being executed by a worker.
    Processing,
    /// Handler returned success.
    Succeeded,
    /// Handler failed and retries are exhausted.
    Failed,
    /// Task was canceled before execution.
    Canceled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Processing => "processing",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(TaskStatus::Waiting),
            "processing" => Some(TaskStatus::Processing),
            "succeeded" => Some(TaskStatus::Succeeded),
            "failed" => Some(TaskStatus::Failed),
            "canceled" => Some(TaskStatus::Canceled),
            _ => None,
        }
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

/// One unit of work: identity, payload, lifecycle state, and scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier, time-ordered (UUIDv7).
    pub id: String,

    /// Name of the queue this task belongs to.
    pub name: String,

    /// Serialized payload bytes.
    pub payload: Vec<u8>,

    /// Current lifecycle status.
    pub status: TaskStatus,

    /// When the task was accepted by the broker.
    pub published_at: DateTime<Utc>,

    /// When the last handler invocation started.
    pub started_at: Option<DateTime<Utc>>,

    /// When the task reached a terminal status.
    pub processed_at: Option<DateTime<Utc>>,

    /// Wall time of the last handler invocation, in seconds.
    pub exec_time: f64,

    /// Earliest execution time; in the future means the task is delayed.
    pub eta: Option<DateTime<Utc>>,

    /// Number of handler invocations so far.
    pub attempts: u32,

    /// Additional retries allowed after the first failure
    /// (0 means no retries, 3 means up to 4 attempts in total).
    pub max_retries: u32,

    /// Backoff table; retry k waits `retry_intervals[min(k, len - 1)]`.
    pub retry_intervals: Vec<Duration>,

    /// Per-attempt deadline for the handler pipeline.
    pub timeout: Duration,

    /// Lifetime of the record in the broker after reaching a terminal status.
    pub ttl: Duration,

    /// Last error message, set on failed attempts.
    pub error: Option<String>,

    /// Optional result bytes produced by the handler.
    pub result: Option<Vec<u8>>,
}

impl Task {
    /// Create a waiting task with default execution options.
    pub fn new(name: impl Into<String>, payload: Vec<u8>) -> Self {
        Task {
            id: Uuid::now_v7().to_string(),
            name: name.into(),
            payload,
            status: TaskStatus::Waiting,
            published_at: Utc::now(),
            started_at: None,
            processed_at: None,
            exec_time: 0.0,
            eta: None,
            attempts: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_intervals: default_retry_intervals(),
            timeout: DEFAULT_TIMEOUT,
            ttl: DEFAULT_TTL,
            error: None,
            result: None,
        }
    }

    /// True when `eta` is set and still in the future.
    pub fn is_delayed(&self, now: DateTime<Utc>) -> bool {
        self.eta.map(|eta| eta > now).unwrap_or(false)
    }

    /// Whether another attempt may be scheduled after a failure.
    ///
    /// Total allowed attempts are `max_retries + 1`.
    pub fn can_retry(&self) -> bool {
        self.attempts <= self.max_retries
    }

    /// Zero-based index of the retry that would follow the last failure.
    pub fn retry_index(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    /// Delay before the next retry, read from the backoff table.
    pub fn retry_delay(&self) -> Duration {
        if self.retry_intervals.is_empty() {
            return Duration::ZERO;
        }
        let idx = (self.retry_index() as usize).min(self.retry_intervals.len() - 1);
        self.retry_intervals[idx]
    }

    /// Transition `waiting -> processing`; counts the attempt.
    pub fn mark_processing(&mut self) {
        self.status = TaskStatus::Processing;
        self.started_at = Some(Utc::now());
        self.attempts += 1;
    }

    /// Terminal success: store the result and close out timing.
    pub fn mark_succeeded(&mut self, result: Option<Vec<u8>>, exec_time: f64) {
        self.status = TaskStatus::Succeeded;
        self.result = result;
        self.exec_time = exec_time;
        self.processed_at = Some(Utc::now());
        self.error = None;
    }

    /// Record the error of a failed attempt without deciding the outcome.
    pub fn record_failure(&mut self, error: impl Into<String>, exec_time: f64) {
        self.error = Some(error.into());
        self.exec_time = exec_time;
    }

    /// Schedule the next attempt: back to `waiting` with a future eta.
    pub fn schedule_retry(&mut self, eta: DateTime<Utc>) {
        self.status = TaskStatus::Waiting;
        self.eta = Some(eta);
    }

    /// Terminal failure after retries are exhausted.
    pub fn mark_failed(&mut self) {
        self.status = TaskStatus::Failed;
        self.processed_at = Some(Utc::now());
    }

    /// Terminal cancellation.
    pub fn mark_canceled(&mut self) {
        self.status = TaskStatus::Canceled;
        self.processed_at = Some(Utc::now());
    }

    /// Encode the record through the engine serializer.
    pub fn to_record(&self, serializer: &dyn Serializer) -> Result<Vec<u8>> {
        let value = serde_json::to_value(self)?;
        serializer.dumps(&value)
    }

    /// Decode a record produced by `to_record`.
    pub fn from_record(bytes: &[u8], serializer: &dyn Serializer) -> Result<Task> {
        let value = serializer.loads(bytes)?;
        Ok(serde_json::from_value(value)?)
    }
}
