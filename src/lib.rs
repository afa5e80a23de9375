use std::panic;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod auth;
pub mod clock;
pub mod commands;
pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod models;
pub mod monitor;
pub mod sync;

pub use crate::clock::{Clock, SystemClock};
pub use crate::commands::Tracker;
pub use crate::config::{SyncConfig, TrackerConfig};
pub use crate::database::Database;
pub use crate::engine::{RestoreReport, TimerEngine, TimerStateSnapshot, TimerStatus};
pub use crate::error::{QueueError, SyncError, TimerError};
pub use crate::sync::{Operation, SyncManager, TaskPriority};

use crate::error::DbError;

static PANIC_ENGINE: OnceLock<Arc<TimerEngine>> = OnceLock::new();

#[cfg(test)]
mod tests;

/// `RUST_LOG` when set, `info` otherwise. Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

/// Persist timer state before the default panic handler runs.
fn install_panic_hook(engine: Arc<TimerEngine>) {
    if PANIC_ENGINE.set(engine).is_err() {
        return;
    }
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        if let Some(engine) = PANIC_ENGINE.get() {
            if let Err(e) = engine.save_state() {
                eprintln!("[PANIC_RECOVERY] Failed to persist timer state: {}", e);
            } else {
                eprintln!("[PANIC_RECOVERY] Timer state persisted before panic");
            }
        }
        default_hook(info);
    }));
}

/// Open the store under `data_dir`. A database that fails its integrity
/// check is moved aside as `timeledger.db.corrupted.<ts>` and recreated once.
pub fn open_database(data_dir: &Path) -> Result<Arc<Database>, String> {
    std::fs::create_dir_all(data_dir).map_err(|e| {
        let msg = match e.kind() {
            std::io::ErrorKind::PermissionDenied => {
                "Permission denied. Check the data directory is writable."
            }
            std::io::ErrorKind::StorageFull => "Disk full. Free space on drive.",
            _ => "Failed to create data directory.",
        };
        format!("{} Path: {}: {}", msg, data_dir.display(), e)
    })?;

    let db_path = data_dir.join("timeledger.db");
    match Database::new(&db_path) {
        Ok(db) => Ok(Arc::new(db)),
        Err(DbError::Corrupted(detail)) if db_path.exists() => {
            let backup_path = data_dir.join(format!(
                "timeledger.db.corrupted.{}",
                chrono::Utc::now().timestamp()
            ));
            std::fs::rename(&db_path, &backup_path).map_err(|rename_e| {
                warn!(
                    "[DB] Failed to rename corrupted DB to {:?}: {}",
                    backup_path, rename_e
                );
                format!("Database corrupted and could not backup: {}", detail)
            })?;
            for suffix in ["-wal", "-shm"] {
                let side = data_dir.join(format!("timeledger.db{}", suffix));
                if side.exists() {
                    let _ = std::fs::remove_file(side);
                }
            }
            info!("[DB] Corrupted DB backed up to {:?}, starting fresh", backup_path);
            Database::new(&db_path)
                .map(Arc::new)
                .map_err(|e2| format!("Failed to create fresh database: {}", e2))
        }
        Err(e) => Err(format!("Failed to initialize database: {}", e)),
    }
}

/// An opened tracker. `bootstrap` restores the timer and owns it until
/// `shutdown`; `open` only reads state and works the outbox, so it can run
/// next to a live session without touching the timer.
pub struct Runtime {
    tracker: Arc<Tracker>,
    /// Set only when this process restored (and so owns) the timer.
    report: Option<RestoreReport>,
    config: TrackerConfig,
    shutdown: CancellationToken,
    threads: Vec<JoinHandle<()>>,
}

impl Runtime {
    pub fn bootstrap(config: TrackerConfig) -> Result<Self, String> {
        let db = open_database(&config.data_dir)?;
        let tracker = Arc::new(Tracker::new(db, Arc::new(SystemClock), &config));
        install_panic_hook(tracker.engine().clone());

        let report = tracker.restore().map_err(|e| e.to_string())?;
        if let Some(anomaly) = &report.anomaly {
            warn!("[RECOVERY] Restored with clock anomaly: {}", anomaly);
        }
        Ok(Self::with_tracker(tracker, Some(report), config))
    }

    /// Store and outbox access without restoring the timer.
    pub fn open(config: TrackerConfig) -> Result<Self, String> {
        let db = open_database(&config.data_dir)?;
        let tracker = Arc::new(Tracker::new(db, Arc::new(SystemClock), &config));
        Ok(Self::with_tracker(tracker, None, config))
    }

    fn with_tracker(
        tracker: Arc<Tracker>,
        report: Option<RestoreReport>,
        config: TrackerConfig,
    ) -> Self {
        Self {
            tracker,
            report,
            config,
            shutdown: CancellationToken::new(),
            threads: Vec::new(),
        }
    }

    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    pub fn restore_report(&self) -> Option<&RestoreReport> {
        self.report.as_ref()
    }

    /// Periodic heartbeat (save, rollover, sleep detection) and the
    /// background sync loop, each on its own thread with its own runtime.
    pub fn spawn_background(&mut self) {
        let tracker = self.tracker.clone();
        let shutdown = self.shutdown.clone();
        let save_interval = Duration::from_secs(self.config.save_interval_secs.max(1));
        self.threads.push(std::thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
                Ok(rt) => rt,
                Err(e) => {
                    error!(
                        "[TIMER] CRITICAL: Failed to create runtime for periodic save: {}. \
                        Timer state will only be saved on transitions and shutdown.",
                        e
                    );
                    return;
                }
            };
            rt.block_on(async {
                let mut interval = tokio::time::interval(save_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = interval.tick() => {}
                    }
                    match tracker.heartbeat() {
                        Ok(Some(_)) => info!("[TIMER] Paused after system sleep"),
                        Ok(None) => debug!("[TIMER] State saved periodically"),
                        Err(e) => warn!("[TIMER] Failed to save state periodically: {}", e),
                    }
                }
            });
        }));

        let sync = self.tracker.sync_manager().clone();
        let shutdown = self.shutdown.clone();
        self.threads.push(std::thread::spawn(move || loop {
            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    error!(
                        "[SYNC] CRITICAL: Failed to create Tokio runtime for background sync: {}. Retrying in 10s...",
                        e
                    );
                    std::thread::sleep(Duration::from_secs(10));
                    continue;
                }
            };
            rt.block_on(sync.run_loop());
            if shutdown.is_cancelled() {
                return;
            }
            error!("[SYNC] Background sync task exited unexpectedly. Restarting in 10s...");
            std::thread::sleep(Duration::from_secs(10));
        }));
        info!("[SYNC] Background sync and heartbeat threads started");
    }

    /// Stop background work and, when this process owns the timer, flush it.
    pub fn shutdown(mut self) {
        info!("[SHUTDOWN] Stopping background work");
        self.shutdown.cancel();
        self.tracker.sync_manager().shutdown();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("[SHUTDOWN] Background thread panicked");
            }
        }
        if self.report.is_none() {
            return;
        }
        match self.tracker.save_state() {
            Ok(()) => info!("[SHUTDOWN] Timer state saved successfully on exit"),
            Err(e) => error!("[SHUTDOWN] Failed to save timer state on exit: {}", e),
        }
    }
}
