//! Typed outbox on top of `sync_queue`: operations, priorities, dedup keys,
//! admission control and the retry schedule.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::{SyncConfig, TrackerConfig};
use crate::database::{user_message, Database, EnqueueOutcome, NewTask, QueuedTask};
use crate::error::{DbResult, QueueError, SyncError};

/// Server-visible time-entry transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Start,
    Pause,
    Resume,
    Stop,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Start => "start",
            Operation::Pause => "pause",
            Operation::Resume => "resume",
            Operation::Stop => "stop",
        }
    }

    pub fn priority(&self) -> TaskPriority {
        match self {
            Operation::Start | Operation::Stop => TaskPriority::Critical,
            Operation::Pause | Operation::Resume => TaskPriority::High,
        }
    }
}

impl FromStr for Operation {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Operation::Start),
            "pause" => Ok(Operation::Pause),
            "resume" => Ok(Operation::Resume),
            "stop" => Ok(Operation::Stop),
            other => Err(SyncError::UnknownOperation(other.to_string())),
        }
    }
}

/// Lower value wins at admission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    Critical = 0, // start, stop
    High = 1,     // pause, resume
}

/// Logical time entry a payload refers to: the client `localId` when present,
/// else the server `id`, else a hash of the payload.
pub fn entry_key(payload: &serde_json::Value) -> String {
    if let Some(local) = json_id(&payload["localId"]) {
        return local;
    }
    if let Some(id) = json_id(&payload["id"]) {
        return format!("id:{}", id);
    }
    let mut hasher = DefaultHasher::new();
    payload.to_string().hash(&mut hasher);
    format!("payload:{:x}", hasher.finish())
}

/// Ids arrive as strings or numbers depending on the endpoint.
pub(crate) fn json_id(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Retry delay after `attempt_count` failed attempts: `min(base * 2^attempt_count, cap)`.
pub fn backoff_delay(base_secs: u64, cap_secs: u64, attempt_count: u32) -> u64 {
    let factor = 1u64.checked_shl(attempt_count).unwrap_or(u64::MAX);
    base_secs.saturating_mul(factor).min(cap_secs)
}

/// Durable outbox of pending time-entry operations.
pub struct SyncQueue {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    capacity: usize,
    dedup_window_secs: i64,
    backoff_base_secs: u64,
    backoff_cap_secs: u64,
    max_retries: u32,
    /// Wakes the background worker after every successful enqueue.
    wake: Arc<Notify>,
}

impl SyncQueue {
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>, config: &TrackerConfig) -> Self {
        Self::with_sync_config(db, clock, config.queue_capacity, config.dedup_window_secs, &config.sync)
    }

    pub fn with_sync_config(
        db: Arc<Database>,
        clock: Arc<dyn Clock>,
        capacity: usize,
        dedup_window_secs: i64,
        sync: &SyncConfig,
    ) -> Self {
        Self {
            db,
            clock,
            capacity,
            dedup_window_secs,
            backoff_base_secs: sync.backoff_base_secs,
            backoff_cap_secs: sync.backoff_cap_secs,
            max_retries: sync.max_retries,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Append an operation. A pending equivalent (same operation, same entry)
    /// created within the dedup window is returned instead of a new task.
    pub fn enqueue(&self, operation: Operation, payload: &serde_json::Value) -> Result<i64, QueueError> {
        let payload_str =
            serde_json::to_string(payload).map_err(|e| QueueError::Serialize(e.to_string()))?;
        let entry = entry_key(payload);
        let dedup_key = format!("{}:{}", operation.as_str(), entry);
        let task = NewTask {
            operation: operation.as_str(),
            entry_key: &entry,
            dedup_key: &dedup_key,
            payload: &payload_str,
            priority: operation.priority() as i32,
        };

        let outcome = self
            .db
            .insert_task(&task, self.clock.now_secs(), self.dedup_window_secs, self.capacity)
            .map_err(|e| {
                error!("[QUEUE] Failed to enqueue {}: {}", operation.as_str(), e);
                match e {
                    crate::error::DbError::Encryption(msg) => QueueError::Encryption(msg),
                    other => QueueError::Persistence(user_message(&other)),
                }
            })?;

        match outcome {
            EnqueueOutcome::Inserted { id, evicted } => {
                info!(
                    "[QUEUE] Enqueued {} for entry {} as task {}{}",
                    operation.as_str(),
                    entry,
                    id,
                    if evicted > 0 { " (evicted older task)" } else { "" }
                );
                self.wake.notify_one();
                Ok(id)
            }
            EnqueueOutcome::Duplicate { id } => Ok(id),
            EnqueueOutcome::Rejected { queue_size } => {
                warn!(
                    "[QUEUE] Dropped {} for entry {}: queue holds {} tasks",
                    operation.as_str(),
                    entry,
                    queue_size
                );
                Err(QueueError::QueueFull {
                    capacity: self.capacity,
                })
            }
        }
    }

    /// Due tasks, oldest first, at most `limit`.
    pub fn get_due_tasks(&self, limit: usize) -> DbResult<Vec<QueuedTask>> {
        self.db.due_tasks(self.max_retries, self.clock.now_secs(), limit)
    }

    pub fn mark_sent(&self, id: i64, entry_mapping: Option<(&str, &str)>) -> DbResult<()> {
        self.db.mark_task_sent(id, self.clock.now_secs(), entry_mapping)
    }

    pub fn mark_remote_confirmed(&self, id: i64, remote_entry_id: Option<&str>) -> DbResult<()> {
        self.db
            .mark_remote_confirmed(id, remote_entry_id, self.clock.now_secs())
    }

    /// Count a failed attempt and schedule the next one. Returns true when the
    /// task ran out of attempts and moved to `failed`.
    pub fn record_failure(&self, task: &QueuedTask, error: &SyncError) -> DbResult<bool> {
        let attempts = task.attempt_count.saturating_add(1);
        let exhausted = attempts >= self.max_retries;
        let delay = backoff_delay(self.backoff_base_secs, self.backoff_cap_secs, task.attempt_count);
        let next_retry_at = self.clock.now_secs().saturating_add(delay as i64);
        self.db
            .record_failure(task.id, attempts, next_retry_at, &error.to_string(), exhausted)?;
        if exhausted {
            warn!(
                "[SYNC] Task {} ({}) failed after {} attempts: {}",
                task.id, task.operation, attempts, error
            );
        } else {
            info!(
                "[SYNC] Task {} ({}) will retry in {}s (attempt {}): {}",
                task.id, task.operation, delay, attempts, error
            );
        }
        Ok(exhausted)
    }

    pub fn has_earlier_pending(&self, task: &QueuedTask) -> DbResult<bool> {
        self.db.has_earlier_pending(&task.entry_key, task.id)
    }

    pub fn expedite_pending(&self) -> DbResult<usize> {
        self.db.expedite_pending(self.clock.now_secs())
    }

    pub fn retry_failed(&self, limit: usize) -> DbResult<usize> {
        let count = self.db.reset_failed_tasks(limit, self.clock.now_secs())?;
        if count > 0 {
            self.wake.notify_one();
        }
        Ok(count)
    }

    /// Drop sent tasks older than `max_age_secs`.
    pub fn prune_sent(&self, max_age_secs: i64) -> DbResult<usize> {
        self.db.prune_sent(self.clock.now_secs() - max_age_secs)
    }
}
