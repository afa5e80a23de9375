use crate::database::{user_message, TimerRow};
use crate::engine::core::{fold, Next};
use crate::engine::{
    local_day_start, session_elapsed, DayTotals, RestoreReport, TimerEngine, TimerState,
    TimerStatus, MAX_PLAUSIBLE_SESSION_SECS,
};
use crate::error::{ClockAnomaly, TimerError};
use std::time::Instant;
use tracing::{error, info, warn};

impl TimerEngine {
    /// Durable form of a post-transition record. A running session carries its
    /// monotonic length so far; `restore` trusts that over wall-clock arithmetic.
    pub(crate) fn row_for(&self, next: &Next, now: i64, now_mono: Instant) -> TimerRow {
        let (session_started_at, session_elapsed_at_save) = match next.state {
            TimerState::Running {
                started_at,
                started_at_instant,
            } => (
                Some(started_at),
                session_elapsed(started_at, started_at_instant, now, now_mono),
            ),
            _ => (None, 0),
        };
        TimerRow {
            state: next.state.status().as_db_str().to_string(),
            accumulated_seconds: next.totals.seconds,
            session_started_at,
            day_start: next.totals.day_start,
            restored_from_running: next.restored_from_running,
            session_elapsed_at_save,
            saved_at: now,
        }
    }

    /// Write one timer row. Without a store (unit tests) this is a no-op.
    pub(crate) fn persist(&self, row: &TimerRow) -> Result<(), TimerError> {
        let db = match &self.db {
            Some(db) => db,
            None => return Ok(()),
        };
        db.save_timer_state(row).map_err(|e| {
            error!("[TIMER] Failed to persist {} state: {}", row.state, e);
            TimerError::Persistence(user_message(&e))
        })
    }

    /// Crash recovery. Runs once at startup before any command.
    ///
    /// Stopped and Paused load as-is. Running is never resumed: the session up
    /// to now is folded in and the timer comes back Paused with
    /// `restored_from_running`. Credited time is the monotonic length recorded
    /// at the last save plus the wall time since that save; if the wall clock
    /// went backward or the total is implausible, only the monotonic part is
    /// credited and the anomaly is reported.
    pub fn restore(&self) -> Result<RestoreReport, TimerError> {
        let mut cell = self.lock_state()?;
        let mut totals = self.lock_totals()?;
        let now = self.clock.now_secs();
        let now_mono = self.clock.monotonic();

        let loaded = match &self.db {
            Some(db) => db.load_timer_state().map_err(|e| {
                error!("[RECOVERY] Failed to load timer state: {}", e);
                TimerError::Persistence(user_message(&e))
            })?,
            None => None,
        };

        let row = match loaded {
            Some(row) => row,
            None => {
                info!("[RECOVERY] No saved timer state, starting fresh");
                let next = Next {
                    state: TimerState::Stopped,
                    restored_from_running: false,
                    totals: DayTotals {
                        seconds: 0,
                        day_start: local_day_start(now),
                    },
                };
                let snapshot = self.commit(&mut cell, &mut totals, next, now, now_mono)?;
                return Ok(RestoreReport {
                    snapshot,
                    was_running: false,
                    credited_seconds: 0,
                    anomaly: None,
                    day_rolled_over: false,
                });
            }
        };

        let saved_totals = DayTotals {
            seconds: row.accumulated_seconds,
            day_start: row.day_start,
        };
        let status = match TimerStatus::from_db_str(&row.state) {
            Some(TimerStatus::Running) if row.session_started_at.is_none() => {
                warn!("[RECOVERY] Running row without session start, treating as paused");
                TimerStatus::Paused
            }
            Some(status) => status,
            None => {
                warn!("[RECOVERY] Unknown saved state {:?}, treating as stopped", row.state);
                TimerStatus::Stopped
            }
        };

        let mut anomaly = None;
        let mut credited_seconds = 0;
        let (restored_state, restored_flag, mut new_totals) = match (status, row.session_started_at)
        {
            (TimerStatus::Running, Some(started_at)) => {
                let (credited, found) = credited_after_crash(&row, started_at, now);
                if let Some(found) = &found {
                    warn!("[RECOVERY] Clock anomaly: {}. Crediting monotonic time only.", found);
                }
                anomaly = found;
                credited_seconds = credited;

                let today = local_day_start(now);
                let folded = if today > saved_totals.day_start {
                    // Only the credited part that falls after today's midnight counts for today
                    let session_end = started_at.saturating_add(credited as i64);
                    (session_end - today).clamp(0, credited as i64) as u64
                } else {
                    fold(saved_totals, started_at, credited, now)
                };
                info!(
                    "[RECOVERY] Timer was running: accumulated={}s, credited={}s, final={}s. Restored as paused.",
                    row.accumulated_seconds, credited, folded
                );
                (
                    TimerState::Paused,
                    true,
                    DayTotals {
                        seconds: folded,
                        day_start: today.max(saved_totals.day_start),
                    },
                )
            }
            (TimerStatus::Paused, _) => (TimerState::Paused, row.restored_from_running, saved_totals),
            _ => (TimerState::Stopped, false, saved_totals),
        };

        let rolled = self.rolled_totals(&new_totals, now);
        let day_rolled_over = rolled.day_start != saved_totals.day_start;
        new_totals = rolled;

        let next = Next {
            state: restored_state,
            restored_from_running: restored_flag,
            totals: new_totals,
        };
        let snapshot = self.commit(&mut cell, &mut totals, next, now, now_mono)?;

        info!(
            "[RECOVERY] Restored state {} with accumulated {}s",
            snapshot.state, snapshot.accumulated_seconds
        );
        Ok(RestoreReport {
            snapshot,
            was_running: status == TimerStatus::Running,
            credited_seconds,
            anomaly,
            day_rolled_over,
        })
    }
}

/// Seconds of a crashed running session to credit, plus any clock anomaly.
fn credited_after_crash(row: &TimerRow, started_at: i64, now: i64) -> (u64, Option<ClockAnomaly>) {
    let monotonic_part = row.session_elapsed_at_save;
    // Rows written before heartbeats existed have no save time: measure from session start
    let saved_at = if row.saved_at >= started_at {
        row.saved_at
    } else {
        started_at
    };

    if now < saved_at {
        return (
            monotonic_part,
            Some(ClockAnomaly::Backward {
                now,
                reference: saved_at,
            }),
        );
    }

    let total = monotonic_part.saturating_add((now - saved_at) as u64);
    if total > MAX_PLAUSIBLE_SESSION_SECS {
        return (
            monotonic_part.min(MAX_PLAUSIBLE_SESSION_SECS),
            Some(ClockAnomaly::ImplausibleGap {
                elapsed_secs: total,
                limit_secs: MAX_PLAUSIBLE_SESSION_SECS,
            }),
        );
    }
    (total, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::database::Database;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        db: Arc<Database>,
        clock: Arc<ManualClock>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let db = Arc::new(Database::new(&dir.path().join("test.db")).unwrap());
            let clock = Arc::new(ManualClock::starting_now());
            clock.set_wall(local_day_start(clock.now_secs()) + 10 * 3600);
            Self {
                _dir: dir,
                db,
                clock,
            }
        }

        /// A fresh engine over the same store, as after a process restart.
        fn engine(&self) -> TimerEngine {
            TimerEngine::new(Some(self.db.clone()), self.clock.clone(), 300)
        }
    }

    #[test]
    fn test_restore_fresh_install_persists_stopped() {
        let fx = Fixture::new();
        let report = fx.engine().restore().unwrap();
        assert_eq!(report.snapshot.state, TimerStatus::Stopped);
        assert!(!report.was_running);
        assert_eq!(fx.db.load_timer_state().unwrap().unwrap().state, "stopped");
    }

    #[test]
    fn test_restore_paused_loads_as_is() {
        let fx = Fixture::new();
        let engine = fx.engine();
        engine.restore().unwrap();
        engine.start().unwrap();
        fx.clock.advance(42);
        engine.pause().unwrap();
        drop(engine);

        fx.clock.advance(1000);
        let report = fx.engine().restore().unwrap();
        assert_eq!(report.snapshot.state, TimerStatus::Paused);
        assert_eq!(report.snapshot.accumulated_seconds, 42);
        assert!(!report.snapshot.restored_from_running);
    }

    #[test]
    fn test_restore_running_comes_back_paused() {
        let fx = Fixture::new();
        let engine = fx.engine();
        engine.restore().unwrap();
        engine.start().unwrap();
        fx.clock.advance(10);
        engine.pause().unwrap();
        engine.resume().unwrap();
        fx.clock.advance(30);
        engine.save_state().unwrap();
        fx.clock.advance(20);
        drop(engine); // crash

        let restarted = fx.engine();
        let report = restarted.restore().unwrap();
        assert!(report.was_running);
        assert_eq!(report.anomaly, None);
        assert_eq!(report.credited_seconds, 50);
        assert_eq!(report.snapshot.state, TimerStatus::Paused);
        assert!(report.snapshot.restored_from_running);
        assert_eq!(report.snapshot.accumulated_seconds, 60);
        assert_eq!(report.snapshot.session_start, None);

        let row = fx.db.load_timer_state().unwrap().unwrap();
        assert_eq!(row.state, "paused");
        assert!(row.restored_from_running);

        // Explicit resume clears the flag
        assert!(!restarted.resume().unwrap().restored_from_running);
    }

    #[test]
    fn test_restore_backward_clock_credits_monotonic_only() {
        let fx = Fixture::new();
        let engine = fx.engine();
        engine.restore().unwrap();
        engine.start().unwrap();
        fx.clock.advance(25);
        engine.save_state().unwrap();
        drop(engine);

        fx.clock.jump_wall(-3600);
        let report = fx.engine().restore().unwrap();
        assert!(matches!(report.anomaly, Some(ClockAnomaly::Backward { .. })));
        assert_eq!(report.credited_seconds, 25);
        assert_eq!(report.snapshot.accumulated_seconds, 25);
        assert_eq!(report.snapshot.state, TimerStatus::Paused);
    }

    #[test]
    fn test_restore_implausible_gap_is_flagged() {
        let fx = Fixture::new();
        let engine = fx.engine();
        engine.restore().unwrap();
        engine.start().unwrap();
        fx.clock.advance(15);
        engine.save_state().unwrap();
        drop(engine);

        fx.clock.jump_wall(3 * 86_400);
        let report = fx.engine().restore().unwrap();
        assert!(matches!(
            report.anomaly,
            Some(ClockAnomaly::ImplausibleGap { .. })
        ));
        assert_eq!(report.credited_seconds, 15);
        assert!(report.day_rolled_over);
        // The credited part belongs to an earlier day
        assert_eq!(report.snapshot.accumulated_seconds, 0);
    }

    #[test]
    fn test_failed_write_rolls_back_transition() {
        let fx = Fixture::new();
        let engine = fx.engine();
        engine.restore().unwrap();
        engine.start().unwrap();
        fx.clock.advance(5);

        fx.db
            .conn
            .lock()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER fail_timer BEFORE UPDATE ON timer_state
                 BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
            )
            .unwrap();

        assert!(matches!(engine.pause(), Err(TimerError::Persistence(_))));
        let snapshot = engine.get_state();
        assert_eq!(snapshot.state, TimerStatus::Running);
        assert_eq!(snapshot.accumulated_seconds, 0);
        assert_eq!(snapshot.elapsed_seconds, 5);
    }
}
