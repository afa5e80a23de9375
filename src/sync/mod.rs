use crate::auth::TokenProvider;
use crate::config::SyncConfig;
use crate::database::meta;
use crate::error::SyncError;
use crate::models::SyncStatus;
use rand::Rng;
use scopeguard::guard;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod queue;

pub use queue::{backoff_delay, entry_key, Operation, SyncQueue, TaskPriority};
use queue::json_id;

use crate::database::QueuedTask;

/// Tasks per background pass.
pub const BACKGROUND_BATCH: usize = 50;

/// Sent tasks are kept this long for diagnostics before pruning.
const SENT_RETENTION_SECS: i64 = 7 * 24 * 60 * 60;

/// 400 bodies meaning the server already holds the desired state.
const ALREADY_ACHIEVED: [&str; 4] = [
    "Only running entries can be paused",
    "Only paused entries can be resumed",
    "Time entry is already stopped",
    "User already has an active time entry",
];

/// Published result of the latest pass: (generation, result).
type PassResult = (u64, Option<Result<usize, SyncError>>);

struct Flight {
    running: bool,
    generation: u64,
}

/// Drains the outbox against the remote API.
///
/// Single-flight: one pass at a time. A caller arriving while a pass is in
/// flight waits up to `join_timeout_secs` and receives that pass's result,
/// or `SyncError::Busy`. Network I/O happens outside every lock.
pub struct SyncManager {
    queue: Arc<SyncQueue>,
    tokens: Arc<dyn TokenProvider>,
    client: reqwest::Client,
    config: SyncConfig,
    flight: Mutex<Flight>,
    results: watch::Sender<PassResult>,
    is_online: AtomicBool,
    auth_degraded: AtomicBool,
    reauth_required: AtomicBool,
    cancel: CancellationToken,
}

impl SyncManager {
    pub fn new(queue: Arc<SyncQueue>, tokens: Arc<dyn TokenProvider>, config: SyncConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let (results, _) = watch::channel((0, None));
        Self {
            queue,
            tokens,
            client,
            config,
            flight: Mutex::new(Flight {
                running: false,
                generation: 0,
            }),
            results,
            is_online: AtomicBool::new(true),
            auth_degraded: AtomicBool::new(false),
            reauth_required: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }

    /// Stop the background loop and any pass at its next task boundary.
    pub fn shutdown(&self) {
        info!("[SYNC] Shutdown requested");
        self.cancel.cancel();
    }

    /// Run one pass over at most `max_tasks` due tasks, or join the pass
    /// already in flight. Returns the number of tasks confirmed.
    pub async fn sync_now(&self, max_tasks: usize) -> Result<usize, SyncError> {
        let (join, generation) = {
            let mut flight = self
                .flight
                .lock()
                .map_err(|_| SyncError::Db("sync flight lock poisoned".into()))?;
            if flight.running {
                (true, flight.generation)
            } else {
                flight.running = true;
                flight.generation += 1;
                (false, flight.generation)
            }
        };

        if join {
            debug!(
                "[SYNC] Pass {} in flight, waiting up to {}s",
                generation, self.config.join_timeout_secs
            );
            let mut rx = self.results.subscribe();
            let joined = tokio::time::timeout(
                Duration::from_secs(self.config.join_timeout_secs),
                rx.wait_for(|(g, result)| *g >= generation && result.is_some()),
            )
            .await;
            return match joined {
                Ok(Ok(value)) => value.1.clone().unwrap_or(Err(SyncError::Busy)),
                _ => {
                    warn!("[SYNC] Timed out waiting for in-flight pass {}", generation);
                    Err(SyncError::Busy)
                }
            };
        }

        // Released even if the pass panics
        let _flight_guard = guard((), |_| {
            if let Ok(mut flight) = self.flight.lock() {
                flight.running = false;
            }
        });

        let result = self.run_pass(max_tasks).await;
        self.results.send_replace((generation, Some(result.clone())));
        result
    }

    async fn run_pass(&self, max_tasks: usize) -> Result<usize, SyncError> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        if let Err(e) = self.tokens.current().await {
            info!("[SYNC] Skipping sync (no token): {}", e);
            return Ok(0);
        }

        let tasks = self
            .queue
            .get_due_tasks(max_tasks)
            .map_err(|e| SyncError::Db(format!("get due tasks: {}", e)))?;
        if tasks.is_empty() {
            debug!("[SYNC] No tasks due (empty queue or backoff)");
            return Ok(0);
        }
        info!("[SYNC] Starting pass: {} due tasks", tasks.len());

        // Checked between tasks; a request already on the wire is never dropped
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.pass_timeout_secs);
        let mut synced = 0usize;
        let mut failed = 0usize;
        // Entries with an unconfirmed task earlier in this pass
        let mut blocked: HashSet<String> = HashSet::new();
        let mut refresh_allowed = true;

        for task in tasks {
            if self.cancel.is_cancelled() {
                info!("[SYNC] Pass cancelled after {} tasks", synced + failed);
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "[SYNC] Pass exceeded {}s after {} tasks, leaving the rest for the next pass",
                    self.config.pass_timeout_secs,
                    synced + failed
                );
                break;
            }

            let earlier = blocked.contains(&task.entry_key)
                || self
                    .queue
                    .has_earlier_pending(&task)
                    .map_err(|e| SyncError::Db(format!("ordering check: {}", e)))?;
            if earlier {
                debug!(
                    "[SYNC] Task {} waits for an earlier task of entry {}",
                    task.id, task.entry_key
                );
                blocked.insert(task.entry_key.clone());
                continue;
            }

            if task.remote_confirmed {
                info!(
                    "[SYNC] Task {} already confirmed by server, reconciling locally",
                    task.id
                );
                if self
                    .commit_sent(&task, task.remote_entry_id.as_deref())
                    .await
                {
                    synced += 1;
                } else {
                    blocked.insert(task.entry_key.clone());
                }
                continue;
            }

            info!(
                "[SYNC] Processing task {}: {} (attempt {})",
                task.id,
                task.operation,
                task.attempt_count + 1
            );
            match self.sync_task(&task, &mut refresh_allowed).await {
                Ok(server_id) => {
                    self.set_online(true);
                    self.auth_degraded.store(false, Ordering::Release);
                    self.reauth_required.store(false, Ordering::Release);
                    if self.commit_sent(&task, server_id.as_deref()).await {
                        synced += 1;
                    } else {
                        blocked.insert(task.entry_key.clone());
                    }
                }
                Err(e) => {
                    failed += 1;
                    match &e {
                        err if err.is_connectivity() => self.set_online(false),
                        SyncError::AuthExpired(_) => {
                            self.set_online(true);
                            self.auth_degraded.store(true, Ordering::Release);
                        }
                        SyncError::ReauthRequired(_) => {
                            self.auth_degraded.store(true, Ordering::Release);
                            self.reauth_required.store(true, Ordering::Release);
                        }
                        SyncError::Http { .. } => self.set_online(true),
                        _ => {}
                    }
                    blocked.insert(task.entry_key.clone());
                    if let Err(db_err) = self.queue.record_failure(&task, &e) {
                        error!(
                            "[SYNC] Failed to record failure for task {}: {}",
                            task.id, db_err
                        );
                    }
                }
            }
        }

        if synced > 0 || failed > 0 {
            info!("[SYNC] Pass completed: {} synced, {} failed", synced, failed);
        }
        Ok(synced)
    }

    /// One remote attempt (plus at most one refresh-and-retry on 401).
    /// Returns the server entry id when the response carries one.
    async fn sync_task(
        &self,
        task: &QueuedTask,
        refresh_allowed: &mut bool,
    ) -> Result<Option<String>, SyncError> {
        let operation: Operation = task.operation.parse()?;
        let payload: serde_json::Value = serde_json::from_str(&task.payload)
            .map_err(|e| SyncError::ParsePayload(e.to_string()))?;
        let entry_id = self.resolve_entry_id(operation, &payload, &task.entry_key)?;

        let mut access_token = self.tokens.current().await?;
        let mut refreshed = false;

        loop {
            let response = self
                .build_request(
                    operation,
                    &payload,
                    entry_id.as_deref(),
                    &access_token,
                    &task.idempotency_key,
                )
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        SyncError::Timeout(e.to_string())
                    } else {
                        SyncError::Network(e.to_string())
                    }
                })?;

            let status = response.status();
            if status == reqwest::StatusCode::UNAUTHORIZED {
                if refreshed {
                    *refresh_allowed = false;
                    warn!("[SYNC] Task {} still 401 after token refresh", task.id);
                    return Err(SyncError::AuthExpired(
                        "401 after token refresh".into(),
                    ));
                }
                if !*refresh_allowed {
                    return Err(SyncError::AuthExpired(
                        "401 and token refresh already failed in this pass".into(),
                    ));
                }
                info!(
                    "[SYNC] Token expired (401), refreshing token for task {}",
                    task.id
                );
                match self.tokens.refresh().await {
                    Ok(token) => {
                        access_token = token;
                        refreshed = true;
                        continue;
                    }
                    Err(e) => {
                        *refresh_allowed = false;
                        warn!("[SYNC] Failed to refresh token for task {}: {}", task.id, e);
                        return Err(e.into());
                    }
                }
            }

            let body = response.text().await.unwrap_or_default();
            if status.is_success() {
                let server_id = serde_json::from_str::<serde_json::Value>(&body)
                    .ok()
                    .and_then(|v| json_id(&v["id"]).or_else(|| json_id(&v["data"]["id"])));
                return Ok(server_id);
            }

            if status == reqwest::StatusCode::BAD_REQUEST
                && ALREADY_ACHIEVED.iter().any(|m| body.contains(m))
            {
                info!(
                    "[SYNC] Task {} HTTP 400 state-already-achieved, treating as sent",
                    task.id
                );
                return Ok(None);
            }

            let message = if body.is_empty() {
                status.canonical_reason().unwrap_or("Unknown").to_string()
            } else {
                body
            };
            return Err(SyncError::Http {
                status: status.as_u16(),
                message,
            });
        }
    }

    /// Server id for pause/resume/stop: from the payload, else the mapping
    /// recorded when the create call was confirmed.
    fn resolve_entry_id(
        &self,
        operation: Operation,
        payload: &serde_json::Value,
        entry_key: &str,
    ) -> Result<Option<String>, SyncError> {
        if operation == Operation::Start {
            return Ok(None);
        }
        if let Some(id) = json_id(&payload["id"]) {
            return Ok(Some(id));
        }
        self.queue
            .db()
            .entry_server_id(entry_key)
            .map_err(|e| SyncError::Db(format!("entry mapping: {}", e)))?
            .map(Some)
            .ok_or_else(|| SyncError::UnresolvedEntry(entry_key.to_string()))
    }

    fn build_request(
        &self,
        operation: Operation,
        payload: &serde_json::Value,
        entry_id: Option<&str>,
        access_token: &str,
        idempotency_key: &str,
    ) -> reqwest::RequestBuilder {
        let base = &self.config.api_base_url;
        let (request, body) = match (operation, entry_id) {
            (Operation::Start, _) | (_, None) => (
                self.client.post(format!("{}/time-entries", base)),
                payload.clone(),
            ),
            (op, Some(id)) => (
                self.client
                    .put(format!("{}/time-entries/{}/{}", base, id, op.as_str())),
                serde_json::json!({}),
            ),
        };
        request
            .header("Authorization", format!("Bearer {}", access_token))
            .header("X-App-Version", &self.config.app_version)
            .header("X-Idempotency-Key", idempotency_key)
            .json(&body)
    }

    /// Mark a remotely-confirmed task sent, retrying the local write. If it
    /// still fails, record the remote confirmation so the next pass only
    /// reconciles. Returns whether the task is now terminal.
    async fn commit_sent(&self, task: &QueuedTask, server_id: Option<&str>) -> bool {
        let mapping = match (task.operation.as_str(), server_id) {
            ("start", Some(id)) => Some((task.entry_key.as_str(), id)),
            _ => None,
        };

        const MAX_ATTEMPTS: u32 = 3;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.queue.mark_sent(task.id, mapping) {
                Ok(()) => return true,
                Err(e) if attempt < MAX_ATTEMPTS => {
                    // 100ms, 200ms
                    let delay_ms = 100u64 << (attempt - 1);
                    warn!(
                        "[SYNC] Failed to mark task {} sent (attempt {}): {}. Retrying in {}ms...",
                        task.id, attempt, e, delay_ms
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                Err(e) => {
                    error!(
                        "[SYNC] Failed to mark task {} sent after {} attempts: {}",
                        task.id, MAX_ATTEMPTS, e
                    );
                }
            }
        }

        match self.queue.mark_remote_confirmed(task.id, server_id) {
            Ok(()) => warn!(
                "[SYNC] Task {} recorded as server-confirmed; next pass reconciles without resending",
                task.id
            ),
            Err(e) => error!(
                "[SYNC] CRITICAL: task {} confirmed remotely but nothing could be recorded ({}). It will be resent with idempotency key {}.",
                task.id, e, task.idempotency_key
            ),
        }
        false
    }

    fn set_online(&self, online: bool) {
        let was_online = self.is_online.swap(online, Ordering::AcqRel);
        if online && !was_online {
            match self.queue.expedite_pending() {
                Ok(n) if n > 0 => {
                    info!("[SYNC] Back online, {} backed-off tasks made due", n);
                    self.queue.wake_handle().notify_one();
                }
                Ok(_) => info!("[SYNC] Back online"),
                Err(e) => warn!("[SYNC] Back online, failed to expedite retries: {}", e),
            }
        } else if !online && was_online {
            warn!("[SYNC] Remote unreachable, working offline");
        }
    }

    /// Counters for the UI. Reads local state only, never the network.
    pub fn get_sync_status(&self) -> Result<SyncStatus, SyncError> {
        let db = self.queue.db();
        let map = |e: crate::error::DbError| SyncError::Db(e.to_string());
        Ok(SyncStatus {
            pending_count: db.pending_count().map_err(map)?,
            failed_count: db.failed_count().map_err(map)?,
            is_online: self.is_online.load(Ordering::Acquire),
            last_sync_at: db.meta_i64(meta::LAST_SYNC_AT).map_err(map)?,
            auth_degraded: self.auth_degraded.load(Ordering::Acquire),
            reauth_required: self.reauth_required.load(Ordering::Acquire),
            dropped_count: db.meta_i64(meta::DROPPED_COUNT).map_err(map)?.unwrap_or(0),
            last_drop_reason: db.get_app_meta(meta::LAST_DROP_REASON).map_err(map)?,
            last_enqueue_error: None,
        })
    }

    /// Background loop: first pass after the startup delay plus 1-3s jitter,
    /// then on every interval tick or enqueue notification until shutdown.
    pub async fn run_loop(&self) {
        let jitter = rand::thread_rng().gen_range(1..=3);
        let startup = Duration::from_secs(self.config.startup_delay_secs + jitter);
        info!("[SYNC] Background sync starts in {}s", startup.as_secs());
        tokio::select! {
            _ = tokio::time::sleep(startup) => {}
            _ = self.cancel.cancelled() => return,
        }

        let wake = self.queue.wake_handle();
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("[SYNC] Background loop stopped");
                    return;
                }
                _ = interval.tick() => {}
                _ = wake.notified() => debug!("[SYNC] Woken by enqueue"),
            }

            match self.sync_now(BACKGROUND_BATCH).await {
                Ok(n) if n > 0 => info!("[SYNC] Background pass synced {} tasks", n),
                Ok(_) => {}
                Err(SyncError::Busy) => debug!("[SYNC] Background pass skipped, another in flight"),
                Err(e) => warn!("[SYNC] Background pass failed: {}", e),
            }
            if let Err(e) = self.queue.prune_sent(SENT_RETENTION_SECS) {
                warn!("[SYNC] Failed to prune sent tasks: {}", e);
            }
        }
    }
}
