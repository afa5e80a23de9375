//! `sync_queue` persistence. Callers pass `now` so the worker and the
//! tests share one clock.

use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use tracing::{error, info, warn};

use super::{log_io_error_if_any, meta, Database};
use crate::error::{DbError, DbResult};
use crate::models::{FailedTaskInfo, QueueStats};

/// Priority value stored for start/stop; lower is more important.
pub const PRIORITY_CRITICAL: i32 = 0;

/// A task about to be appended. `payload` is plaintext JSON; it is encrypted
/// before it touches disk.
#[derive(Debug, Clone)]
pub struct NewTask<'a> {
    pub operation: &'a str,
    pub entry_key: &'a str,
    pub dedup_key: &'a str,
    pub payload: &'a str,
    pub priority: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Inserted { id: i64, evicted: usize },
    /// An equivalent pending task was created inside the dedup window.
    Duplicate { id: i64 },
    /// Admission control refused the task; the drop was recorded.
    Rejected { queue_size: i64 },
}

/// A pending task loaded for a sync pass, payload already decrypted.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub id: i64,
    pub operation: String,
    pub entry_key: String,
    pub payload: String,
    pub attempt_count: u32,
    pub idempotency_key: String,
    pub created_at: i64,
    /// Set when the remote call succeeded but `mark_sent` did not commit.
    pub remote_confirmed: bool,
    pub remote_entry_id: Option<String>,
}

impl Database {
    /// Append a task in one IMMEDIATE transaction: dedup check, admission
    /// control, insert, idempotency key and drop bookkeeping commit together.
    pub fn insert_task(
        &self,
        task: &NewTask<'_>,
        now: i64,
        dedup_window_secs: i64,
        capacity: usize,
    ) -> DbResult<EnqueueOutcome> {
        let install_id = self.install_id();
        let encrypted_payload = self.encryption.encrypt(task.payload).map_err(|e| {
            error!("[DB] Encryption failed for payload: {}", e);
            DbError::Encryption(e)
        })?;

        let mut conn = self.lock_conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| {
                log_io_error_if_any("insert_task begin", &e);
                e
            })?;

        // Only a repeat of the newest pending task for this entry is a duplicate;
        // pause, resume, pause are three real transitions.
        let newest: Option<(i64, String, i64)> = tx
            .query_row(
                "SELECT id, dedup_key, created_at FROM sync_queue
                 WHERE entry_key = ?1 AND status = 'pending'
                 ORDER BY id DESC LIMIT 1",
                params![task.entry_key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let existing = newest.and_then(|(id, dedup_key, created_at)| {
            (dedup_key == task.dedup_key && created_at > now - dedup_window_secs).then_some(id)
        });
        if let Some(id) = existing {
            warn!(
                "[QUEUE] Duplicate {} for entry {} within {}s, returning task {}",
                task.operation, task.entry_key, dedup_window_secs, id
            );
            tx.commit()?;
            return Ok(EnqueueOutcome::Duplicate { id });
        }

        let queue_size: i64 = tx.query_row(
            "SELECT COUNT(*) FROM sync_queue WHERE status IN ('pending', 'failed')",
            [],
            |row| row.get(0),
        )?;

        let mut evicted = 0usize;
        if queue_size >= capacity as i64 {
            let victim: Option<(i64, String)> = if task.priority == PRIORITY_CRITICAL {
                tx.query_row(
                    "SELECT id, operation FROM sync_queue
                     WHERE status = 'pending' AND priority > ?1
                     ORDER BY created_at ASC, id ASC LIMIT 1",
                    params![PRIORITY_CRITICAL],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?
            } else {
                None
            };

            match victim {
                Some((victim_id, victim_op)) => {
                    tx.execute("DELETE FROM sync_queue WHERE id = ?1", params![victim_id])?;
                    let reason = format!(
                        "queue full ({} tasks): evicted {} task {} for {}",
                        queue_size, victim_op, victim_id, task.operation
                    );
                    warn!("[QUEUE] {}", reason);
                    record_drop(&tx, &reason)?;
                    evicted = 1;
                }
                None => {
                    let reason = format!(
                        "queue full ({} tasks): dropped {} for entry {}",
                        queue_size, task.operation, task.entry_key
                    );
                    warn!("[QUEUE] {}", reason);
                    record_drop(&tx, &reason)?;
                    tx.commit()?;
                    return Ok(EnqueueOutcome::Rejected { queue_size });
                }
            }
        }

        tx.execute(
            "INSERT INTO sync_queue (operation, entry_key, dedup_key, payload, status, priority,
                                     attempt_count, next_retry_at, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, 0, ?6, ?6)",
            params![
                task.operation,
                task.entry_key,
                task.dedup_key,
                encrypted_payload,
                task.priority,
                now
            ],
        )
        .map_err(|e| {
            log_io_error_if_any("insert_task", &e);
            e
        })?;
        let id = tx.last_insert_rowid();

        // Derived from the task id, so every resend of this task carries the same key
        tx.execute(
            "UPDATE sync_queue SET idempotency_key = ?1 WHERE id = ?2",
            params![format!("{}:{}", install_id, id), id],
        )?;

        tx.commit().map_err(|e| {
            log_io_error_if_any("insert_task commit", &e);
            error!("[DB] Failed to commit sync task: {}", e);
            e
        })?;
        Ok(EnqueueOutcome::Inserted { id, evicted })
    }

    /// Pending tasks under the retry limit whose backoff has elapsed, oldest first.
    pub fn due_tasks(&self, max_retries: u32, now: i64, limit: usize) -> DbResult<Vec<QueuedTask>> {
        let rows: Vec<(QueuedTask, String)> = {
            let conn = self.lock_conn()?;
            let mut stmt = conn.prepare(
                "SELECT id, operation, entry_key, payload, attempt_count, idempotency_key,
                        created_at, remote_confirmed_at, remote_entry_id
                 FROM sync_queue
                 WHERE status = 'pending' AND attempt_count < ?1 AND next_retry_at <= ?2
                 ORDER BY created_at ASC, id ASC
                 LIMIT ?3",
            )?;
            let mapped = stmt.query_map(
                params![max_retries, now, limit as i64],
                |row| {
                    let id: i64 = row.get(0)?;
                    Ok((
                        QueuedTask {
                            id,
                            operation: row.get(1)?,
                            entry_key: row.get(2)?,
                            payload: String::new(),
                            attempt_count: row.get(4)?,
                            idempotency_key: row
                                .get::<_, Option<String>>(5)?
                                .unwrap_or_else(|| format!("task:{}", id)),
                            created_at: row.get(6)?,
                            remote_confirmed: row.get::<_, Option<i64>>(7)?.is_some(),
                            remote_entry_id: row.get(8)?,
                        },
                        row.get::<_, String>(3)?,
                    ))
                },
            )?;
            let rows = mapped.collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut tasks = Vec::with_capacity(rows.len());
        for (mut task, encrypted) in rows {
            match self.encryption.decrypt(&encrypted) {
                Ok(payload) => {
                    task.payload = payload;
                    tasks.push(task);
                }
                Err(e) => {
                    // Undecryptable payload (key changed): retrying cannot help
                    error!("[QUEUE] Task {} payload unreadable: {}", task.id, e);
                    self.record_failure(task.id, task.attempt_count, now, &e, true)?;
                }
            }
        }
        Ok(tasks)
    }

    /// Terminal success. An entry-id mapping from a create response and
    /// `last_sync_at` are written in the same transaction.
    pub fn mark_task_sent(
        &self,
        id: i64,
        now: i64,
        entry_mapping: Option<(&str, &str)>,
    ) -> DbResult<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "UPDATE sync_queue SET status = 'sent', last_attempt_at = ?1, error_message = NULL
             WHERE id = ?2",
            params![now, id],
        )?;
        if let Some((entry_key, server_id)) = entry_mapping {
            tx.execute(
                "INSERT INTO app_meta (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = ?2",
                params![meta::entry_mapping(entry_key), server_id],
            )?;
        }
        tx.execute(
            "INSERT INTO app_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2",
            params![meta::LAST_SYNC_AT, now.to_string()],
        )?;
        tx.commit().map_err(|e| {
            log_io_error_if_any("mark_task_sent commit", &e);
            e
        })?;
        Ok(())
    }

    /// Remember that the server already applied this task. Status stays
    /// pending; the next pass reconciles without another request.
    pub fn mark_remote_confirmed(
        &self,
        id: i64,
        remote_entry_id: Option<&str>,
        now: i64,
    ) -> DbResult<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE sync_queue
             SET remote_confirmed_at = ?1, remote_entry_id = COALESCE(?2, remote_entry_id),
                 next_retry_at = ?1
             WHERE id = ?3 AND status = 'pending'",
            params![now, remote_entry_id, id],
        )?;
        Ok(())
    }

    /// Record a failed attempt. `exhausted` moves the task to `failed`.
    pub fn record_failure(
        &self,
        id: i64,
        attempt_count: u32,
        next_retry_at: i64,
        error_message: &str,
        exhausted: bool,
    ) -> DbResult<()> {
        let conn = self.lock_conn()?;
        let status = if exhausted { "failed" } else { "pending" };
        conn.execute(
            "UPDATE sync_queue
             SET status = ?1, attempt_count = ?2, next_retry_at = ?3, error_message = ?4
             WHERE id = ?5",
            params![status, attempt_count, next_retry_at, error_message, id],
        )
        .map_err(|e| {
            log_io_error_if_any("record_failure", &e);
            e
        })?;
        Ok(())
    }

    /// Whether an older pending task for the same entry must go first.
    pub fn has_earlier_pending(&self, entry_key: &str, id: i64) -> DbResult<bool> {
        let conn = self.lock_conn()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sync_queue
                           WHERE entry_key = ?1 AND id < ?2 AND status = 'pending')",
            params![entry_key, id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Make every backing-off pending task due now. Used when connectivity returns.
    pub fn expedite_pending(&self, now: i64) -> DbResult<usize> {
        let conn = self.lock_conn()?;
        let count = conn.execute(
            "UPDATE sync_queue SET next_retry_at = ?1 WHERE status = 'pending' AND next_retry_at > ?1",
            params![now],
        )?;
        Ok(count)
    }

    pub fn pending_count(&self) -> DbResult<i64> {
        self.count_by_status("pending")
    }

    pub fn failed_count(&self) -> DbResult<i64> {
        self.count_by_status("failed")
    }

    fn count_by_status(&self, status: &str) -> DbResult<i64> {
        let conn = self.lock_conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM sync_queue WHERE status = ?1",
            params![status],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn get_queue_stats(&self) -> DbResult<QueueStats> {
        let conn = self.lock_conn()?;

        let mut stmt = conn.prepare(
            "SELECT operation, COUNT(*) FROM sync_queue WHERE status = 'pending' GROUP BY operation",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        let mut pending_by_operation = HashMap::new();
        for row in rows {
            let (operation, count) = row?;
            pending_by_operation.insert(operation, count);
        }

        let mut counts = HashMap::new();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM sync_queue GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (status, count) = row?;
            counts.insert(status, count);
        }

        Ok(QueueStats {
            pending_count: counts.get("pending").copied().unwrap_or(0),
            failed_count: counts.get("failed").copied().unwrap_or(0),
            sent_count: counts.get("sent").copied().unwrap_or(0),
            pending_by_operation,
        })
    }

    pub fn get_failed_tasks(&self, limit: usize) -> DbResult<Vec<FailedTaskInfo>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, operation, attempt_count, created_at, error_message
             FROM sync_queue
             WHERE status = 'failed'
             ORDER BY created_at DESC, id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(FailedTaskInfo {
                id: row.get(0)?,
                operation: row.get(1)?,
                attempt_count: row.get(2)?,
                created_at: row.get(3)?,
                error_message: row.get(4)?,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Move up to `limit` failed tasks back to pending with a fresh retry budget.
    pub fn reset_failed_tasks(&self, limit: usize, now: i64) -> DbResult<usize> {
        let conn = self.lock_conn()?;
        let count = conn.execute(
            "UPDATE sync_queue
             SET status = 'pending', attempt_count = 0, next_retry_at = ?1, error_message = NULL
             WHERE id IN (
                 SELECT id FROM sync_queue WHERE status = 'failed'
                 ORDER BY created_at ASC, id ASC LIMIT ?2
             )",
            params![now, limit as i64],
        )?;
        if count > 0 {
            info!("[QUEUE] Reset {} failed tasks to pending", count);
        }
        Ok(count)
    }

    pub fn clear_sync_queue(&self) -> DbResult<usize> {
        let conn = self.lock_conn()?;
        let count = conn.execute("DELETE FROM sync_queue", [])?;
        warn!("[QUEUE] Cleared sync queue ({} tasks)", count);
        Ok(count)
    }

    /// Delete sent tasks confirmed before `before`.
    pub fn prune_sent(&self, before: i64) -> DbResult<usize> {
        let conn = self.lock_conn()?;
        let count = conn.execute(
            "DELETE FROM sync_queue WHERE status = 'sent' AND COALESCE(last_attempt_at, created_at) < ?1",
            params![before],
        )?;
        Ok(count)
    }
}

/// Count a dropped task and remember why, inside the caller's transaction.
fn record_drop(tx: &rusqlite::Transaction<'_>, reason: &str) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO app_meta (key, value) VALUES (?1, '1')
         ON CONFLICT(key) DO UPDATE SET value = CAST(COALESCE(value, '0') AS INTEGER) + 1",
        params![meta::DROPPED_COUNT],
    )?;
    tx.execute(
        "INSERT INTO app_meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = ?2",
        params![meta::LAST_DROP_REASON, reason],
    )?;
    Ok(())
}
