use crate::clock::Clock;
use crate::database::Database;
use crate::error::{ClockAnomaly, TimerError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;

mod core;
mod db;

/// Longest session a restore will credit from wall-clock time.
pub const MAX_PLAUSIBLE_SESSION_SECS: u64 = 24 * 60 * 60;

/// Timer Engine: strict FSM over two locks.
///
/// Lock order is always `state` then `totals`. Every transition computes the
/// post-transition record, persists it while holding both locks, and only
/// then updates memory and republishes `published`.
pub struct TimerEngine {
    /// FSM state and the crash-recovery flag.
    pub(crate) state: Mutex<StateCell>,
    /// Day-scoped accumulated seconds and the day boundary they belong to.
    pub(crate) totals: Mutex<DayTotals>,
    /// Last committed state, read by `get_state` without touching the FSM locks.
    pub(crate) published: RwLock<Published>,
    /// Wall/monotonic pair observed by the previous heartbeat (sleep detection).
    pub(crate) last_tick: Mutex<Option<(i64, Instant)>>,
    pub(crate) db: Option<Arc<Database>>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) sleep_gap_threshold_secs: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct StateCell {
    pub(crate) state: TimerState,
    pub(crate) restored_from_running: bool,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct DayTotals {
    pub(crate) seconds: u64,
    /// Local midnight (Unix seconds) of the day `seconds` belongs to.
    pub(crate) day_start: i64,
}

/// Copy of the committed state for lock-free-ish reads.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Published {
    pub(crate) status: TimerStatus,
    pub(crate) accumulated: u64,
    pub(crate) session_start: Option<i64>,
    pub(crate) session_instant: Option<Instant>,
    pub(crate) day_start: i64,
    pub(crate) restored_from_running: bool,
}

/// Timer state. Running carries its session start, so a session start
/// without Running cannot be represented.
#[derive(Debug, Clone)]
pub enum TimerState {
    Stopped,
    Running {
        /// Unix timestamp (seconds), persisted and sent to the API
        started_at: i64,
        /// Monotonic start, bounds elapsed against wall-clock jumps
        started_at_instant: Instant,
    },
    Paused,
}

impl TimerState {
    pub fn status(&self) -> TimerStatus {
        match self {
            TimerState::Stopped => TimerStatus::Stopped,
            TimerState::Running { .. } => TimerStatus::Running,
            TimerState::Paused => TimerStatus::Paused,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimerStatus {
    Stopped,
    Running,
    Paused,
}

impl TimerStatus {
    /// Form stored in `timer_state.state`.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            TimerStatus::Stopped => "stopped",
            TimerStatus::Running => "running",
            TimerStatus::Paused => "paused",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "stopped" => Some(TimerStatus::Stopped),
            "running" => Some(TimerStatus::Running),
            "paused" => Some(TimerStatus::Paused),
            _ => None,
        }
    }
}

impl fmt::Display for TimerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TimerStatus::Stopped => "STOPPED",
            TimerStatus::Running => "RUNNING",
            TimerStatus::Paused => "PAUSED",
        })
    }
}

/// What the UI renders. `elapsed_seconds` and `today_seconds` are derived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerStateSnapshot {
    pub state: TimerStatus,
    /// accumulated + the whole current session (including any pre-midnight part)
    pub elapsed_seconds: u64,
    pub accumulated_seconds: u64,
    pub session_start: Option<i64>,
    pub day_start: i64,
    pub restored_from_running: bool,
    /// accumulated + the part of the current session since `day_start`
    pub today_seconds: u64,
}

/// Outcome of crash recovery at startup.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub snapshot: TimerStateSnapshot,
    /// The persisted state was Running and has been folded into Paused.
    pub was_running: bool,
    pub credited_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anomaly: Option<ClockAnomaly>,
    pub day_rolled_over: bool,
}

impl TimerEngine {
    pub fn new(db: Option<Arc<Database>>, clock: Arc<dyn Clock>, sleep_gap_threshold_secs: u64) -> Self {
        let now = clock.now_secs();
        let day_start = local_day_start(now);
        Self {
            state: Mutex::new(StateCell {
                state: TimerState::Stopped,
                restored_from_running: false,
            }),
            totals: Mutex::new(DayTotals {
                seconds: 0,
                day_start,
            }),
            published: RwLock::new(Published {
                status: TimerStatus::Stopped,
                accumulated: 0,
                session_start: None,
                session_instant: None,
                day_start,
                restored_from_running: false,
            }),
            last_tick: Mutex::new(None),
            db,
            clock,
            sleep_gap_threshold_secs,
        }
    }

    pub(crate) fn lock_state(&self) -> Result<MutexGuard<'_, StateCell>, TimerError> {
        self.state.lock().map_err(|_| TimerError::LockPoisoned("state"))
    }

    pub(crate) fn lock_totals(&self) -> Result<MutexGuard<'_, DayTotals>, TimerError> {
        self.totals.lock().map_err(|_| TimerError::LockPoisoned("accumulated"))
    }
}

/// Local midnight of the calendar day containing `ts`.
pub fn local_day_start(ts: i64) -> i64 {
    use chrono::{Local, TimeZone};
    Local
        .timestamp_opt(ts, 0)
        .single()
        .and_then(|dt| dt.date_naive().and_hms_opt(0, 0, 0))
        .and_then(|midnight| Local.from_local_datetime(&midnight).earliest())
        .map(|dt| dt.timestamp())
        .unwrap_or_else(|| ts - ts.rem_euclid(86_400))
}

/// Session length: monotonic, capped by wall time when the wall clock is sane.
/// A sleeping machine stops the monotonic clock; a drifting one is capped by wall.
pub(crate) fn session_elapsed(started_at: i64, started_at_instant: Instant, now: i64, now_mono: Instant) -> u64 {
    let monotonic = now_mono.saturating_duration_since(started_at_instant).as_secs();
    let wall = now - started_at;
    if wall < 0 {
        monotonic
    } else {
        monotonic.min(wall as u64)
    }
}
