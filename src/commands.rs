use crate::auth::AuthManager;
use crate::clock::Clock;
use crate::config::TrackerConfig;
use crate::database::{meta, user_message, Database, TimerRow};
use crate::engine::{RestoreReport, TimerEngine, TimerStateSnapshot, TimerStatus};
use crate::error::{QueueError, SyncError, TimerError};
use crate::models::{FailedTaskInfo, QueueStats, SyncStatus};
use crate::monitor::{ActivityMonitor, IdleDecision};
use crate::sync::{Operation, SyncManager, SyncQueue};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{error, info, warn};

/// Local command surface consumed by the presentation layer.
///
/// Every timer command commits locally first and then appends the matching
/// outbox task. A failed append never rolls a committed transition back; it
/// is logged and shown in `get_sync_status()`.
pub struct Tracker {
    engine: Arc<TimerEngine>,
    queue: Arc<SyncQueue>,
    sync: Arc<SyncManager>,
    auth: Arc<AuthManager>,
    monitor: ActivityMonitor,
    /// Serializes transition + enqueue pairs so outbox order matches FSM order.
    commands: Mutex<()>,
    last_enqueue_error: Mutex<Option<String>>,
}

impl Tracker {
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>, config: &TrackerConfig) -> Self {
        let engine = Arc::new(TimerEngine::new(
            Some(db.clone()),
            clock.clone(),
            config.sleep_gap_threshold_secs,
        ));
        let queue = Arc::new(SyncQueue::new(db, clock, config));
        let auth = Arc::new(AuthManager::new(config.sync.api_base_url.clone()));
        let sync = Arc::new(SyncManager::new(
            queue.clone(),
            auth.clone(),
            config.sync.clone(),
        ));
        Self {
            engine,
            queue,
            sync,
            auth,
            monitor: ActivityMonitor::new(config.idle_threshold_secs),
            commands: Mutex::new(()),
            last_enqueue_error: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &Arc<TimerEngine> {
        &self.engine
    }

    pub fn sync_manager(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    fn lock_commands(&self) -> Result<MutexGuard<'_, ()>, TimerError> {
        self.commands
            .lock()
            .map_err(|_| TimerError::LockPoisoned("commands"))
    }

    /// Crash recovery at startup. A session that was running when the process
    /// died comes back paused, and the server is told about the pause.
    pub fn restore(&self) -> Result<RestoreReport, TimerError> {
        let _guard = self.lock_commands()?;
        let report = self.engine.restore()?;
        if report.was_running {
            self.enqueue_for_active_entry(Operation::Pause);
        }
        if report.snapshot.state == TimerStatus::Paused {
            self.monitor.start_monitoring();
        }
        Ok(report)
    }

    pub fn start(&self) -> Result<TimerStateSnapshot, TimerError> {
        self.start_with(Value::Null)
    }

    /// Start (or continue a paused entry). `fields` are extra attributes for a
    /// new time entry, e.g. `{"projectId": "..."}`.
    pub fn start_with(&self, fields: Value) -> Result<TimerStateSnapshot, TimerError> {
        let _guard = self.lock_commands()?;
        let before = self.engine.get_state().state;
        let snapshot = self.engine.start()?;
        self.monitor.start_monitoring();

        if before == TimerStatus::Paused && self.active_entry().is_some() {
            self.enqueue_for_active_entry(Operation::Resume);
            return Ok(snapshot);
        }

        let local_id = uuid::Uuid::new_v4().to_string();
        if let Err(e) = self.queue.db().set_app_meta(meta::ACTIVE_ENTRY_KEY, &local_id) {
            error!("[TIMER] Failed to remember active entry {}: {}", local_id, e);
            self.note_enqueue_error(user_message(&e));
        }
        let mut payload = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        payload.insert("localId".into(), json!(local_id));
        if let Some(started_at) = snapshot.session_start {
            payload.insert("startedAt".into(), json!(started_at));
            if let Some(ts) = chrono::DateTime::from_timestamp(started_at, 0) {
                payload.insert("startTime".into(), json!(ts.to_rfc3339()));
            }
        }
        self.enqueue_logged(Operation::Start, &Value::Object(payload));
        Ok(snapshot)
    }

    pub fn pause(&self) -> Result<TimerStateSnapshot, TimerError> {
        let _guard = self.lock_commands()?;
        let snapshot = self.engine.pause()?;
        self.enqueue_for_active_entry(Operation::Pause);
        Ok(snapshot)
    }

    pub fn resume(&self) -> Result<TimerStateSnapshot, TimerError> {
        let _guard = self.lock_commands()?;
        let snapshot = self.engine.resume()?;
        self.monitor.start_monitoring();
        self.enqueue_for_active_entry(Operation::Resume);
        Ok(snapshot)
    }

    pub fn stop(&self) -> Result<TimerStateSnapshot, TimerError> {
        let _guard = self.lock_commands()?;
        let snapshot = self.engine.stop()?;
        self.monitor.stop_monitoring();
        self.enqueue_for_active_entry(Operation::Stop);
        if let Err(e) = self.queue.db().set_app_meta(meta::ACTIVE_ENTRY_KEY, "") {
            warn!("[TIMER] Failed to clear active entry: {}", e);
        }
        Ok(snapshot)
    }

    pub fn get_state(&self) -> TimerStateSnapshot {
        self.engine.get_state()
    }

    pub fn save_state(&self) -> Result<(), TimerError> {
        self.engine.save_state()
    }

    /// The timer row as last written by whichever process owns the timer.
    /// Reads the store only; the in-memory engine is not consulted.
    pub fn persisted_state(&self) -> Result<Option<TimerRow>, TimerError> {
        self.queue
            .db()
            .load_timer_state()
            .map_err(|e| TimerError::Persistence(user_message(&e)))
    }

    pub fn reset_day(&self) -> Result<TimerStateSnapshot, TimerError> {
        let _guard = self.lock_commands()?;
        self.engine.reset_day()
    }

    /// Background tick: heartbeat, rollover and sleep detection. A sleep
    /// pause is reported to the server like a user pause.
    pub fn heartbeat(&self) -> Result<Option<TimerStateSnapshot>, TimerError> {
        let _guard = self.lock_commands()?;
        let paused = self.engine.heartbeat()?;
        if paused.is_some() {
            self.enqueue_for_active_entry(Operation::Pause);
        }
        Ok(paused)
    }

    /// Idle signal from the platform idle detector. Returns the snapshot when the
    /// report paused the timer.
    pub fn report_idle(&self, idle_secs: u64) -> Result<Option<TimerStateSnapshot>, TimerError> {
        let _guard = self.lock_commands()?;
        let current = self.engine.get_state();
        let running = current.state == TimerStatus::Running;
        let idle_secs = match self.monitor.report_idle(idle_secs, running) {
            IdleDecision::Ignore => return Ok(None),
            IdleDecision::Pause { idle_secs } => idle_secs,
        };

        let session = current
            .elapsed_seconds
            .saturating_sub(current.accumulated_seconds);
        let work_elapsed = session.saturating_sub(idle_secs);
        match self.engine.pause_idle(work_elapsed) {
            Ok(snapshot) => {
                self.enqueue_for_active_entry(Operation::Pause);
                Ok(Some(snapshot))
            }
            Err(e) => {
                self.monitor.clear_idle_pause();
                Err(e)
            }
        }
    }

    /// Activity signal. True when the timer had been paused for idleness.
    pub fn report_activity(&self) -> bool {
        self.monitor.report_activity()
    }

    /// Append an arbitrary operation to the outbox.
    pub fn enqueue(&self, operation: Operation, payload: &Value) -> Result<i64, QueueError> {
        let id = self.queue.enqueue(operation, payload)?;
        self.clear_enqueue_error();
        Ok(id)
    }

    pub async fn sync_now(&self, max_tasks: usize) -> Result<usize, SyncError> {
        self.sync.sync_now(max_tasks).await
    }

    pub fn get_sync_status(&self) -> Result<SyncStatus, SyncError> {
        let mut status = self.sync.get_sync_status()?;
        if self.auth.reauth_required() {
            status.reauth_required = true;
        }
        status.last_enqueue_error = self
            .last_enqueue_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Ok(status)
    }

    pub async fn set_tokens(&self, access_token: Option<String>, refresh_token: Option<String>) {
        self.auth.set_tokens(access_token, refresh_token).await;
    }

    pub fn get_queue_stats(&self) -> Result<QueueStats, SyncError> {
        self.queue
            .db()
            .get_queue_stats()
            .map_err(|e| SyncError::Db(e.to_string()))
    }

    pub fn get_failed_tasks(&self, limit: usize) -> Result<Vec<FailedTaskInfo>, SyncError> {
        self.queue
            .db()
            .get_failed_tasks(limit)
            .map_err(|e| SyncError::Db(e.to_string()))
    }

    /// Move failed tasks back to pending; the background loop picks them up.
    pub fn retry_failed_tasks(&self, limit: usize) -> Result<usize, SyncError> {
        let count = self
            .queue
            .retry_failed(limit)
            .map_err(|e| SyncError::Db(e.to_string()))?;
        info!("[SYNC] Reset {} failed tasks back to pending", count);
        Ok(count)
    }

    pub fn clear_sync_queue(&self) -> Result<usize, SyncError> {
        let count = self
            .queue
            .db()
            .clear_sync_queue()
            .map_err(|e| SyncError::Db(e.to_string()))?;
        warn!("[QUEUE] Cleared {} unsent tasks", count);
        Ok(count)
    }

    fn active_entry(&self) -> Option<String> {
        match self.queue.db().get_app_meta(meta::ACTIVE_ENTRY_KEY) {
            Ok(key) => key.filter(|k| !k.is_empty()),
            Err(e) => {
                error!("[TIMER] Failed to read active entry: {}", e);
                None
            }
        }
    }

    fn enqueue_for_active_entry(&self, operation: Operation) {
        match self.active_entry() {
            Some(local_id) => self.enqueue_logged(operation, &json!({ "localId": local_id })),
            None => warn!(
                "[QUEUE] No active time entry, {} not sent to server",
                operation.as_str()
            ),
        }
    }

    fn enqueue_logged(&self, operation: Operation, payload: &Value) {
        match self.queue.enqueue(operation, payload) {
            Ok(_) => self.clear_enqueue_error(),
            Err(e) => {
                error!(
                    "[QUEUE] {} committed locally but not queued: {}",
                    operation.as_str(),
                    e
                );
                self.note_enqueue_error(e.to_string());
            }
        }
    }

    fn note_enqueue_error(&self, message: String) {
        *self
            .last_enqueue_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(message);
    }

    fn clear_enqueue_error(&self) {
        *self
            .last_enqueue_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::local_day_start;
    use tempfile::TempDir;

    fn tracker() -> (Tracker, Arc<ManualClock>, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::new(&dir.path().join("test.db")).unwrap());
        let clock = Arc::new(ManualClock::starting_now());
        clock.set_wall(local_day_start(clock.now_secs()) + 9 * 3600);
        let config = TrackerConfig {
            data_dir: dir.path().to_path_buf(),
            ..TrackerConfig::default()
        };
        let tracker = Tracker::new(db, clock.clone(), &config);
        tracker.restore().unwrap();
        (tracker, clock, dir)
    }

    fn queued(tracker: &Tracker) -> Vec<(String, Value)> {
        tracker
            .queue
            .get_due_tasks(100)
            .unwrap()
            .into_iter()
            .map(|t| (t.operation, serde_json::from_str(&t.payload).unwrap()))
            .collect()
    }

    #[test]
    fn test_start_pause_resume_stop_enqueues_one_entry() {
        let (tracker, clock, _dir) = tracker();
        tracker.start_with(json!({"projectId": "p1"})).unwrap();
        clock.advance(5);
        tracker.pause().unwrap();
        tracker.resume().unwrap();
        clock.advance(3);
        let snapshot = tracker.stop().unwrap();
        assert_eq!(snapshot.accumulated_seconds, 8);

        let tasks = queued(&tracker);
        let ops: Vec<&str> = tasks.iter().map(|(op, _)| op.as_str()).collect();
        assert_eq!(ops, vec!["start", "pause", "resume", "stop"]);
        let local_id = tasks[0].1["localId"].as_str().unwrap().to_string();
        assert_eq!(tasks[0].1["projectId"], "p1");
        assert!(tasks[0].1["startedAt"].is_i64());
        for (_, payload) in &tasks[1..] {
            assert_eq!(payload["localId"], local_id.as_str());
        }
        assert!(tracker.active_entry().is_none());
    }

    #[test]
    fn test_quick_pause_resume_pause_keeps_every_transition() {
        let (tracker, clock, _dir) = tracker();
        tracker.start().unwrap();
        clock.advance(1);
        tracker.pause().unwrap();
        clock.advance(1);
        tracker.resume().unwrap();
        clock.advance(1);
        tracker.pause().unwrap();

        let ops: Vec<String> = queued(&tracker).into_iter().map(|(op, _)| op).collect();
        assert_eq!(ops, vec!["start", "pause", "resume", "pause"]);
    }

    #[test]
    fn test_start_from_paused_resumes_same_entry() {
        let (tracker, clock, _dir) = tracker();
        tracker.start().unwrap();
        clock.advance(2);
        tracker.pause().unwrap();
        tracker.start().unwrap();

        let tasks = queued(&tracker);
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[2].0, "resume");
        assert_eq!(tasks[2].1["localId"], tasks[0].1["localId"]);
    }

    #[test]
    fn test_invalid_transition_enqueues_nothing() {
        let (tracker, _clock, _dir) = tracker();
        assert!(matches!(
            tracker.pause(),
            Err(TimerError::InvalidTransition { .. })
        ));
        assert!(queued(&tracker).is_empty());
    }

    #[test]
    fn test_failed_enqueue_keeps_transition_and_is_reported() {
        let (tracker, _clock, _dir) = tracker();
        tracker.start().unwrap();
        tracker
            .queue
            .db()
            .conn
            .lock()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER fail_queue BEFORE INSERT ON sync_queue
                 BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
            )
            .unwrap();

        let snapshot = tracker.pause().unwrap();
        assert_eq!(snapshot.state, TimerStatus::Paused);
        let status = tracker.get_sync_status().unwrap();
        assert!(status.last_enqueue_error.is_some());
        assert_eq!(status.pending_count, 1);
    }

    #[test]
    fn test_idle_report_pauses_and_credits_work_time() {
        let (tracker, clock, _dir) = tracker();
        tracker.start().unwrap();
        clock.advance(300);

        let snapshot = tracker.report_idle(180).unwrap().unwrap();
        assert_eq!(snapshot.state, TimerStatus::Paused);
        assert_eq!(snapshot.accumulated_seconds, 120);
        assert!(tracker.report_idle(240).unwrap().is_none());
        assert!(tracker.report_activity());

        let ops: Vec<String> = queued(&tracker).into_iter().map(|(op, _)| op).collect();
        assert_eq!(ops, vec!["start", "pause"]);
    }

    #[test]
    fn test_restore_of_running_session_enqueues_pause() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::new(&dir.path().join("test.db")).unwrap());
        let clock = Arc::new(ManualClock::starting_now());
        clock.set_wall(local_day_start(clock.now_secs()) + 9 * 3600);
        let config = TrackerConfig::default();

        let first = Tracker::new(db.clone(), clock.clone(), &config);
        first.restore().unwrap();
        first.start().unwrap();
        clock.advance(20);
        first.save_state().unwrap();
        drop(first);

        let second = Tracker::new(db, clock.clone(), &config);
        let report = second.restore().unwrap();
        assert!(report.was_running);
        assert_eq!(report.snapshot.state, TimerStatus::Paused);
        let ops: Vec<String> = queued(&second).into_iter().map(|(op, _)| op).collect();
        assert_eq!(ops, vec!["start", "pause"]);
    }
}
