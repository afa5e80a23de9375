use crate::engine::{
    local_day_start, session_elapsed, DayTotals, Published, StateCell, TimerEngine, TimerState,
    TimerStateSnapshot, TimerStatus,
};
use crate::error::TimerError;
use std::sync::PoisonError;
use std::time::Instant;
use tracing::{info, warn};

/// Accumulated seconds are stored as SQLite INTEGER.
const MAX_ACCUMULATED: u64 = i64::MAX as u64;

/// Post-transition record, computed before anything is mutated.
pub(crate) struct Next {
    pub(crate) state: TimerState,
    pub(crate) restored_from_running: bool,
    pub(crate) totals: DayTotals,
}

fn invalid(from: TimerStatus, event: &'static str) -> TimerError {
    warn!("[FSM] Invalid transition: cannot {} from {}", event, from);
    TimerError::InvalidTransition { from, event }
}

/// Fold a finished session into the day total. A session that began before
/// `day_start` only contributes its part after midnight.
pub(crate) fn fold(totals: DayTotals, started_at: i64, session_secs: u64, now: i64) -> u64 {
    let portion = if started_at < totals.day_start {
        session_secs.min((now - totals.day_start).max(0) as u64)
    } else {
        session_secs
    };
    totals.seconds.saturating_add(portion).min(MAX_ACCUMULATED)
}

impl TimerEngine {
    /// Stopped → Running, or Paused → Running (same as resume).
    pub fn start(&self) -> Result<TimerStateSnapshot, TimerError> {
        let mut cell = self.lock_state()?;
        let mut totals = self.lock_totals()?;
        let now = self.clock.now_secs();
        let now_mono = self.clock.monotonic();

        let from = cell.state.status();
        if from == TimerStatus::Running {
            return Err(invalid(from, "start"));
        }

        let base = self.rolled_totals(&totals, now);
        let snapshot = self.commit(
            &mut cell,
            &mut totals,
            Next {
                state: TimerState::Running {
                    started_at: now,
                    started_at_instant: now_mono,
                },
                restored_from_running: false,
                totals: base,
            },
            now,
            now_mono,
        )?;
        info!("[TIMER] {} → RUNNING (accumulated {}s)", from, base.seconds);
        Ok(snapshot)
    }

    /// Running → Paused, folding the session into the day total.
    pub fn pause(&self) -> Result<TimerStateSnapshot, TimerError> {
        self.pause_internal(None, "pause")
    }

    /// Running → Paused on idle. Only `work_elapsed_secs` of the session (the
    /// part before the user went idle) is credited.
    pub fn pause_idle(&self, work_elapsed_secs: u64) -> Result<TimerStateSnapshot, TimerError> {
        self.pause_internal(Some(work_elapsed_secs), "idle pause")
    }

    fn pause_internal(
        &self,
        work_elapsed_override: Option<u64>,
        event: &'static str,
    ) -> Result<TimerStateSnapshot, TimerError> {
        let mut cell = self.lock_state()?;
        let mut totals = self.lock_totals()?;
        let now = self.clock.now_secs();
        let now_mono = self.clock.monotonic();

        let (started_at, started_at_instant) = match cell.state {
            TimerState::Running {
                started_at,
                started_at_instant,
            } => (started_at, started_at_instant),
            ref other => return Err(invalid(other.status(), event)),
        };

        let base = self.rolled_totals(&totals, now);
        let measured = session_elapsed(started_at, started_at_instant, now, now_mono);
        let session_secs = match work_elapsed_override {
            Some(work) => work.min(measured),
            None => measured,
        };
        let new_accumulated = fold(base, started_at, session_secs, now);

        let snapshot = self.commit(
            &mut cell,
            &mut totals,
            Next {
                state: TimerState::Paused,
                restored_from_running: false,
                totals: DayTotals {
                    seconds: new_accumulated,
                    day_start: base.day_start,
                },
            },
            now,
            now_mono,
        )?;
        info!(
            "[TIMER] RUNNING → PAUSED ({}): session {}s, accumulated {}s",
            event, session_secs, new_accumulated
        );
        Ok(snapshot)
    }

    /// Paused → Running.
    pub fn resume(&self) -> Result<TimerStateSnapshot, TimerError> {
        let mut cell = self.lock_state()?;
        let mut totals = self.lock_totals()?;
        let now = self.clock.now_secs();
        let now_mono = self.clock.monotonic();

        let from = cell.state.status();
        if from != TimerStatus::Paused {
            return Err(invalid(from, "resume"));
        }

        let base = self.rolled_totals(&totals, now);
        let snapshot = self.commit(
            &mut cell,
            &mut totals,
            Next {
                state: TimerState::Running {
                    started_at: now,
                    started_at_instant: now_mono,
                },
                restored_from_running: false,
                totals: base,
            },
            now,
            now_mono,
        )?;
        info!("[TIMER] PAUSED → RUNNING (accumulated {}s)", base.seconds);
        Ok(snapshot)
    }

    /// Running/Paused → Stopped. The day total is kept for "today" display.
    pub fn stop(&self) -> Result<TimerStateSnapshot, TimerError> {
        let mut cell = self.lock_state()?;
        let mut totals = self.lock_totals()?;
        let now = self.clock.now_secs();
        let now_mono = self.clock.monotonic();

        let base = self.rolled_totals(&totals, now);
        let from = cell.state.status();
        let new_totals = match cell.state {
            TimerState::Running {
                started_at,
                started_at_instant,
            } => {
                let session_secs = session_elapsed(started_at, started_at_instant, now, now_mono);
                DayTotals {
                    seconds: fold(base, started_at, session_secs, now),
                    day_start: base.day_start,
                }
            }
            TimerState::Paused => base,
            TimerState::Stopped => return Err(invalid(from, "stop")),
        };

        let snapshot = self.commit(
            &mut cell,
            &mut totals,
            Next {
                state: TimerState::Stopped,
                restored_from_running: false,
                totals: new_totals,
            },
            now,
            now_mono,
        )?;
        info!("[TIMER] {} → STOPPED (accumulated {}s)", from, new_totals.seconds);
        Ok(snapshot)
    }

    /// Snapshot of the last committed state. Never takes the FSM locks and
    /// never touches the store.
    pub fn get_state(&self) -> TimerStateSnapshot {
        let published = *self
            .published
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        snapshot_of(&published, self.clock.now_secs(), self.clock.monotonic())
    }

    /// Reset the day total if the local calendar day changed since `day_start`.
    /// Same-day calls change nothing. A running session keeps running.
    pub fn reset_day(&self) -> Result<TimerStateSnapshot, TimerError> {
        let mut cell = self.lock_state()?;
        let mut totals = self.lock_totals()?;
        let now = self.clock.now_secs();
        let now_mono = self.clock.monotonic();

        let rolled = self.rolled_totals(&totals, now);
        if rolled.day_start == totals.day_start {
            let published = *self
                .published
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            return Ok(snapshot_of(&published, now, now_mono));
        }

        let next = Next {
            state: cell.state.clone(),
            restored_from_running: cell.restored_from_running,
            totals: rolled,
        };
        self.commit(&mut cell, &mut totals, next, now, now_mono)
    }

    /// Explicit flush of the current state, refreshing the crash-recovery heartbeat.
    pub fn save_state(&self) -> Result<(), TimerError> {
        let mut cell = self.lock_state()?;
        let mut totals = self.lock_totals()?;
        let now = self.clock.now_secs();
        let now_mono = self.clock.monotonic();
        let next = Next {
            state: cell.state.clone(),
            restored_from_running: cell.restored_from_running,
            totals: *totals,
        };
        self.commit(&mut cell, &mut totals, next, now, now_mono)?;
        Ok(())
    }

    /// Periodic tick from the background save thread.
    ///
    /// A wall-clock gap much larger than the monotonic gap since the previous
    /// tick means the machine slept: a running timer is paused crediting only
    /// awake time, and the returned snapshot tells the caller to report the pause.
    /// Otherwise applies day rollover and refreshes the heartbeat of a running session.
    pub fn heartbeat(&self) -> Result<Option<TimerStateSnapshot>, TimerError> {
        let now = self.clock.now_secs();
        let now_mono = self.clock.monotonic();

        let slept_secs = {
            let mut last = self
                .last_tick
                .lock()
                .map_err(|_| TimerError::LockPoisoned("heartbeat"))?;
            let previous = last.replace((now, now_mono));
            previous.and_then(|(wall, mono)| {
                let wall_delta = now - wall;
                let mono_delta = now_mono.saturating_duration_since(mono).as_secs() as i64;
                let gap = wall_delta - mono_delta;
                (gap >= self.sleep_gap_threshold_secs as i64).then_some(gap as u64)
            })
        };

        let mut cell = self.lock_state()?;
        let mut totals = self.lock_totals()?;
        let base = self.rolled_totals(&totals, now);

        let running_since = match cell.state {
            TimerState::Running {
                started_at,
                started_at_instant,
            } => Some((started_at, started_at_instant)),
            _ => None,
        };
        if let (Some(gap), Some((started_at, started_at_instant))) = (slept_secs, running_since) {
            let awake_secs = now_mono.saturating_duration_since(started_at_instant).as_secs();
            let new_accumulated = fold(base, started_at, awake_secs, now);
            let snapshot = self.commit(
                &mut cell,
                &mut totals,
                Next {
                    state: TimerState::Paused,
                    restored_from_running: false,
                    totals: DayTotals {
                        seconds: new_accumulated,
                        day_start: base.day_start,
                    },
                },
                now,
                now_mono,
            )?;
            warn!(
                "[SLEEP] System sleep of ~{}s detected, timer paused (credited {}s awake)",
                gap, awake_secs
            );
            return Ok(Some(snapshot));
        }

        let rolled = base.day_start != totals.day_start;
        if rolled || running_since.is_some() {
            let next = Next {
                state: cell.state.clone(),
                restored_from_running: cell.restored_from_running,
                totals: base,
            };
            self.commit(&mut cell, &mut totals, next, now, now_mono)?;
        }
        Ok(None)
    }

    /// Totals adjusted for a local-midnight crossing. Only forward changes
    /// roll; a wall clock set back to an earlier day keeps the current total.
    pub(crate) fn rolled_totals(&self, totals: &DayTotals, now: i64) -> DayTotals {
        let today = local_day_start(now);
        if today <= totals.day_start {
            return *totals;
        }
        let days = (today - totals.day_start) / 86_400;
        if days > 1 {
            warn!(
                "[DAY_ROLLOVER] Suspicious day change of {} days. Possible timezone change or clock manipulation.",
                days
            );
        }
        info!(
            "[DAY_ROLLOVER] Day changed (local midnight), resetting accumulated {}s",
            totals.seconds
        );
        DayTotals {
            seconds: 0,
            day_start: today,
        }
    }

    /// Persist `next` while the caller holds both locks, then flip memory.
    /// A failed write leaves memory untouched.
    pub(crate) fn commit(
        &self,
        cell: &mut StateCell,
        totals: &mut DayTotals,
        next: Next,
        now: i64,
        now_mono: Instant,
    ) -> Result<TimerStateSnapshot, TimerError> {
        let row = self.row_for(&next, now, now_mono);
        self.persist(&row)?;

        cell.state = next.state;
        cell.restored_from_running = next.restored_from_running;
        *totals = next.totals;

        let published = Published {
            status: cell.state.status(),
            accumulated: totals.seconds,
            session_start: match cell.state {
                TimerState::Running { started_at, .. } => Some(started_at),
                _ => None,
            },
            session_instant: match cell.state {
                TimerState::Running {
                    started_at_instant, ..
                } => Some(started_at_instant),
                _ => None,
            },
            day_start: totals.day_start,
            restored_from_running: cell.restored_from_running,
        };
        *self
            .published
            .write()
            .unwrap_or_else(PoisonError::into_inner) = published;
        Ok(snapshot_of(&published, now, now_mono))
    }
}

pub(crate) fn snapshot_of(p: &Published, now: i64, now_mono: Instant) -> TimerStateSnapshot {
    let (session_secs, today_session_secs) = match (p.session_start, p.session_instant) {
        (Some(started_at), Some(instant)) => {
            let secs = session_elapsed(started_at, instant, now, now_mono);
            let today = if started_at < p.day_start {
                secs.min((now - p.day_start).max(0) as u64)
            } else {
                secs
            };
            (secs, today)
        }
        _ => (0, 0),
    };
    TimerStateSnapshot {
        state: p.status,
        elapsed_seconds: p.accumulated.saturating_add(session_secs),
        accumulated_seconds: p.accumulated,
        session_start: p.session_start,
        day_start: p.day_start,
        restored_from_running: p.restored_from_running,
        today_seconds: p.accumulated.saturating_add(today_session_secs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use std::sync::Arc;

    fn engine_at_noon() -> (TimerEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let noon = local_day_start(clock.now_secs()) + 12 * 3600;
        clock.set_wall(noon);
        let engine = TimerEngine::new(None, clock.clone(), 300);
        (engine, clock)
    }

    #[test]
    fn test_start_pause_resume_stop_folds_sessions() {
        let (engine, clock) = engine_at_noon();
        engine.start().unwrap();
        clock.advance(5);
        assert_eq!(engine.pause().unwrap().accumulated_seconds, 5);
        clock.advance(100);
        engine.resume().unwrap();
        clock.advance(3);
        let snapshot = engine.stop().unwrap();

        assert_eq!(snapshot.state, TimerStatus::Stopped);
        assert_eq!(snapshot.accumulated_seconds, 8);
        assert_eq!(snapshot.session_start, None);
    }

    #[test]
    fn test_invalid_transitions_leave_state() {
        let (engine, _clock) = engine_at_noon();
        assert_eq!(
            engine.pause().unwrap_err(),
            TimerError::InvalidTransition {
                from: TimerStatus::Stopped,
                event: "pause"
            }
        );
        assert!(engine.resume().is_err());
        assert!(engine.stop().is_err());

        engine.start().unwrap();
        assert!(engine.start().is_err());
        assert!(engine.resume().is_err());
        assert_eq!(engine.get_state().state, TimerStatus::Running);
    }

    #[test]
    fn test_start_from_paused_acts_as_resume() {
        let (engine, clock) = engine_at_noon();
        engine.start().unwrap();
        clock.advance(10);
        engine.pause().unwrap();
        let snapshot = engine.start().unwrap();
        assert_eq!(snapshot.state, TimerStatus::Running);
        assert_eq!(snapshot.accumulated_seconds, 10);
    }

    #[test]
    fn test_get_state_derives_elapsed_while_running() {
        let (engine, clock) = engine_at_noon();
        engine.start().unwrap();
        clock.advance(7);
        engine.pause().unwrap();
        engine.resume().unwrap();
        clock.advance(4);

        let snapshot = engine.get_state();
        assert_eq!(snapshot.accumulated_seconds, 7);
        assert_eq!(snapshot.elapsed_seconds, 11);
        assert_eq!(snapshot.today_seconds, 11);
        assert!(snapshot.session_start.is_some());
    }

    #[test]
    fn test_wall_jump_backward_does_not_lose_session() {
        let (engine, clock) = engine_at_noon();
        engine.start().unwrap();
        clock.advance(60);
        clock.jump_wall(-600);
        assert_eq!(engine.pause().unwrap().accumulated_seconds, 60);
    }

    #[test]
    fn test_wall_jump_forward_is_capped_by_monotonic() {
        let (engine, clock) = engine_at_noon();
        engine.start().unwrap();
        clock.advance(30);
        clock.jump_wall(3600);
        assert_eq!(engine.pause().unwrap().accumulated_seconds, 30);
    }

    #[test]
    fn test_pause_idle_credits_only_work_time() {
        let (engine, clock) = engine_at_noon();
        engine.start().unwrap();
        clock.advance(300);
        assert_eq!(engine.pause_idle(180).unwrap().accumulated_seconds, 180);

        engine.resume().unwrap();
        clock.advance(20);
        // Override larger than the session is capped
        assert_eq!(engine.pause_idle(1_000).unwrap().accumulated_seconds, 200);
    }

    #[test]
    fn test_fold_saturates() {
        let totals = DayTotals {
            seconds: MAX_ACCUMULATED - 5,
            day_start: 0,
        };
        assert_eq!(fold(totals, 10, 100, 110), MAX_ACCUMULATED);
    }

    #[test]
    fn test_reset_day_same_day_is_noop() {
        let (engine, clock) = engine_at_noon();
        engine.start().unwrap();
        clock.advance(50);
        engine.pause().unwrap();

        let first = engine.reset_day().unwrap();
        let second = engine.reset_day().unwrap();
        assert_eq!(first, second);
        assert_eq!(second.accumulated_seconds, 50);
    }

    #[test]
    fn test_reset_day_after_midnight_keeps_running_session() {
        let (engine, clock) = engine_at_noon();
        let day_one = engine.get_state().day_start;
        engine.start().unwrap();
        clock.advance(60);
        engine.pause().unwrap();
        engine.resume().unwrap();

        // 23:59:00 → 00:01:00 next day
        let before_midnight = local_day_start(clock.now_secs() + 86_400) - 60;
        let step = (before_midnight - clock.now_secs()) as u64;
        clock.advance(step);
        clock.advance(120);

        let snapshot = engine.reset_day().unwrap();
        assert_eq!(snapshot.state, TimerStatus::Running);
        assert_eq!(snapshot.accumulated_seconds, 0);
        assert!(snapshot.day_start > day_one);
        assert_eq!(snapshot.today_seconds, 60);
        assert_eq!(snapshot.elapsed_seconds, step + 120);

        // Idempotent on the same day
        assert_eq!(engine.reset_day().unwrap().accumulated_seconds, 0);

        // Folding the cross-midnight session credits only the new day
        assert_eq!(engine.pause().unwrap().accumulated_seconds, 60);
    }

    #[test]
    fn test_transition_rolls_day_before_start() {
        let (engine, clock) = engine_at_noon();
        engine.start().unwrap();
        clock.advance(100);
        engine.stop().unwrap();

        clock.advance(86_400);
        let snapshot = engine.start().unwrap();
        assert_eq!(snapshot.accumulated_seconds, 0);
    }

    #[test]
    fn test_heartbeat_detects_sleep_and_pauses() {
        let (engine, clock) = engine_at_noon();
        engine.start().unwrap();
        assert!(engine.heartbeat().unwrap().is_none());

        clock.advance(100);
        clock.jump_wall(600);
        let snapshot = engine.heartbeat().unwrap().expect("sleep pause");
        assert_eq!(snapshot.state, TimerStatus::Paused);
        assert_eq!(snapshot.accumulated_seconds, 100);
        assert!(!snapshot.restored_from_running);

        // No auto-resume on later ticks
        clock.advance(30);
        assert!(engine.heartbeat().unwrap().is_none());
        assert_eq!(engine.get_state().state, TimerStatus::Paused);
    }

    #[test]
    fn test_heartbeat_small_gap_is_not_sleep() {
        let (engine, clock) = engine_at_noon();
        engine.start().unwrap();
        engine.heartbeat().unwrap();
        clock.advance(30);
        clock.jump_wall(60);
        assert!(engine.heartbeat().unwrap().is_none());
        assert_eq!(engine.get_state().state, TimerStatus::Running);
    }
}
