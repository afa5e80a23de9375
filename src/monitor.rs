use std::sync::Mutex;
use tracing::{debug, info};

/// What the tracker should do with an idle report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleDecision {
    /// Below threshold, not monitoring, or already handled this idle stretch.
    Ignore,
    /// Pause the running timer, crediting the session minus `idle_secs`.
    Pause { idle_secs: u64 },
}

#[derive(Debug, Default)]
struct MonitorState {
    is_monitoring: bool,
    /// An idle pause was issued and no activity has been seen since.
    idle_paused: bool,
    last_idle_secs: u64,
}

/// Consumes idle/active signals produced by a platform idle detector elsewhere.
/// Decides when an idle stretch should pause the timer; it never resumes.
pub struct ActivityMonitor {
    idle_threshold_secs: u64,
    state: Mutex<MonitorState>,
}

impl ActivityMonitor {
    pub fn new(idle_threshold_secs: u64) -> Self {
        Self {
            idle_threshold_secs,
            state: Mutex::new(MonitorState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        // Plain flags: a poisoned guard still holds consistent data
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn start_monitoring(&self) {
        let mut s = self.lock();
        s.is_monitoring = true;
        s.idle_paused = false;
        info!("[IDLE] Monitoring started (threshold {}s)", self.idle_threshold_secs);
    }

    pub fn stop_monitoring(&self) {
        let mut s = self.lock();
        s.is_monitoring = false;
        s.idle_paused = false;
        info!("[IDLE] Monitoring stopped");
    }

    pub fn is_monitoring(&self) -> bool {
        self.lock().is_monitoring
    }

    pub fn is_idle_paused(&self) -> bool {
        self.lock().idle_paused
    }

    /// The idle detector reports the user has been idle for `idle_secs`.
    /// `timer_running` is the caller's current view of the engine.
    pub fn report_idle(&self, idle_secs: u64, timer_running: bool) -> IdleDecision {
        let mut s = self.lock();
        s.last_idle_secs = idle_secs;
        if !s.is_monitoring || !timer_running || s.idle_paused {
            return IdleDecision::Ignore;
        }
        if idle_secs < self.idle_threshold_secs {
            return IdleDecision::Ignore;
        }
        s.idle_paused = true;
        info!("[IDLE] Idle for {}s, requesting pause", idle_secs);
        IdleDecision::Pause { idle_secs }
    }

    /// Input was seen again. Returns true when the preceding idle stretch had
    /// paused the timer, so the UI can offer to resume.
    pub fn report_activity(&self) -> bool {
        let mut s = self.lock();
        s.last_idle_secs = 0;
        let was_idle_paused = std::mem::replace(&mut s.idle_paused, false);
        if was_idle_paused {
            debug!("[IDLE] Activity after idle pause");
        }
        was_idle_paused
    }

    /// Forget a pending idle pause, e.g. when the pause itself could not be committed.
    pub fn clear_idle_pause(&self) {
        self.lock().idle_paused = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_monitor_new() {
        let monitor = ActivityMonitor::new(120);
        assert!(!monitor.is_monitoring());
        assert!(!monitor.is_idle_paused());
    }

    #[test]
    fn test_activity_monitor_start_stop() {
        let monitor = ActivityMonitor::new(120);
        monitor.start_monitoring();
        assert!(monitor.is_monitoring());
        monitor.stop_monitoring();
        assert!(!monitor.is_monitoring());
    }

    #[test]
    fn test_idle_below_threshold_is_ignored() {
        let monitor = ActivityMonitor::new(120);
        monitor.start_monitoring();
        assert_eq!(monitor.report_idle(119, true), IdleDecision::Ignore);
        assert!(!monitor.is_idle_paused());
    }

    #[test]
    fn test_idle_pause_fires_once_per_stretch() {
        let monitor = ActivityMonitor::new(120);
        monitor.start_monitoring();
        assert_eq!(
            monitor.report_idle(150, true),
            IdleDecision::Pause { idle_secs: 150 }
        );
        assert_eq!(monitor.report_idle(200, true), IdleDecision::Ignore);

        assert!(monitor.report_activity());
        assert!(!monitor.report_activity());
        assert_eq!(
            monitor.report_idle(121, true),
            IdleDecision::Pause { idle_secs: 121 }
        );
    }

    #[test]
    fn test_idle_ignored_when_not_running_or_not_monitoring() {
        let monitor = ActivityMonitor::new(60);
        assert_eq!(monitor.report_idle(600, true), IdleDecision::Ignore);
        monitor.start_monitoring();
        assert_eq!(monitor.report_idle(600, false), IdleDecision::Ignore);
    }
}
