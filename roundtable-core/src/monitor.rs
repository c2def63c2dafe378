use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::session::SessionId;

/// Recent step durations kept for the rolling average
const WINDOW: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SessionStats {
    pub steps: u64,
    pub failures: u64,
    pub total_time: Duration,
}

impl SessionStats {
    pub fn average(&self) -> Duration {
        if self.steps == 0 {
            return Duration::ZERO;
        }
        self.total_time / self.steps as u32
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSummary {
    pub uptime: Duration,
    pub tracked_sessions: usize,
    pub total_steps: u64,
    pub failed_steps: u64,
    pub avg_step_ms: f64,
    pub error_rate_percent: f64,
}

#[derive(Default)]
struct MonitorState {
    recent: VecDeque<Duration>,
    sessions: HashMap<SessionId, SessionStats>,
    total_steps: u64,
    failed_steps: u64,
}

/// Step timings and failure counts, overall and per session
pub struct PerformanceMonitor {
    started: Instant,
    state: Mutex<MonitorState>,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            state: Mutex::new(MonitorState::default()),
        }
    }

    pub fn record_step(&self, session_id: SessionId, elapsed: Duration, success: bool) {
        let mut state = self.state.lock();
        if state.recent.len() == WINDOW {
            state.recent.pop_front();
        }
        state.recent.push_back(elapsed);
        state.total_steps += 1;
        if !success {
            state.failed_steps += 1;
        }

        let stats = state.sessions.entry(session_id).or_default();
        stats.steps += 1;
        stats.total_time += elapsed;
        if !success {
            stats.failures += 1;
        }
    }

    pub fn session(&self, session_id: &SessionId) -> Option<SessionStats> {
        self.state.lock().sessions.get(session_id).copied()
    }

    pub fn remove_session(&self, session_id: &SessionId) {
        self.state.lock().sessions.remove(session_id);
    }

    pub fn summary(&self) -> PerformanceSummary {
        let state = self.state.lock();
        let avg_step_ms = if state.recent.is_empty() {
            0.0
        } else {
            let total: Duration = state.recent.iter().sum();
            total.as_secs_f64() * 1000.0 / state.recent.len() as f64
        };
        let error_rate_percent = if state.total_steps == 0 {
            0.0
        } else {
            state.failed_steps as f64 * 100.0 / state.total_steps as f64
        };

        PerformanceSummary {
            uptime: self.started.elapsed(),
            tracked_sessions: state.sessions.len(),
            total_steps: state.total_steps,
            failed_steps: state.failed_steps,
            avg_step_ms,
            error_rate_percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_tracks_errors_and_average() {
        let monitor = PerformanceMonitor::new();
        let a = SessionId::new();
        let b = SessionId::new();

        monitor.record_step(a, Duration::from_millis(10), true);
        monitor.record_step(a, Duration::from_millis(30), false);
        monitor.record_step(b, Duration::from_millis(20), true);
        monitor.record_step(b, Duration::from_millis(20), true);

        let summary = monitor.summary();
        assert_eq!(summary.total_steps, 4);
        assert_eq!(summary.failed_steps, 1);
        assert_eq!(summary.tracked_sessions, 2);
        assert!((summary.avg_step_ms - 20.0).abs() < 1e-6);
        assert!((summary.error_rate_percent - 25.0).abs() < 1e-6);

        let stats = monitor.session(&a).unwrap();
        assert_eq!(stats.steps, 2);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.average(), Duration::from_millis(20));

        monitor.remove_session(&a);
        assert!(monitor.session(&a).is_none());
        assert_eq!(monitor.summary().total_steps, 4);
    }

    #[test]
    fn average_window_is_bounded() {
        let monitor = PerformanceMonitor::new();
        let id = SessionId::new();
        for _ in 0..WINDOW {
            monitor.record_step(id, Duration::from_millis(100), true);
        }
        for _ in 0..WINDOW {
            monitor.record_step(id, Duration::from_millis(10), true);
        }
        assert!((monitor.summary().avg_step_ms - 10.0).abs() < 1e-6);
    }
}
