//! Metrics collection for cohost sessions
//!
//! Tracks open latency, duration, frame and chunk counters, and error
//! history for each voice session cycle. Shown by the console `status`
//! command.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::streaming::SessionStats;

/// Maximum number of finished sessions to retain in history
const MAX_SESSION_HISTORY: usize = 50;

/// Maximum number of errors to retain in history
const MAX_ERROR_HISTORY: usize = 20;

/// Metrics for one finished session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub session_id: String,
    /// Unix timestamp when the session was requested (seconds)
    pub started_at: u64,
    /// Time from request to agent setup acknowledged
    pub open_latency_ms: u64,
    /// Total time from request to finish
    pub duration_ms: u64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub chunks_scheduled: u64,
    pub chunks_rejected: u64,
    pub interruptions: u64,
    pub transcript_chars: u64,
    /// Whether the session opened and closed normally
    pub success: bool,
    pub error_message: Option<String>,
}

/// Summary statistics across all recorded sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_sessions: u64,
    pub successful_sessions: u64,
    pub failed_sessions: u64,
    /// Averages across successful sessions
    pub avg_open_latency_ms: u64,
    pub avg_duration_ms: u64,
    pub total_frames_dropped: u64,
    pub total_interruptions: u64,
    pub last_error: Option<ErrorRecord>,
}

/// Record of an error that occurred during operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Unix timestamp when error occurred (seconds)
    pub timestamp: u64,
    /// Category of error (e.g., "open", "agent", "audio")
    pub error_type: String,
    pub message: String,
    pub session_id: Option<String>,
}

struct SessionInProgress {
    started_at: Instant,
    started_at_unix: u64,
}

impl SessionInProgress {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            started_at_unix: unix_now(),
        }
    }

    fn to_metrics(
        &self,
        session_id: Uuid,
        stats: &SessionStats,
        success: bool,
        error_message: Option<String>,
    ) -> SessionMetrics {
        SessionMetrics {
            session_id: session_id.to_string(),
            started_at: self.started_at_unix,
            open_latency_ms: stats
                .open_latency
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            duration_ms: self.started_at.elapsed().as_millis() as u64,
            frames_sent: stats.frames_sent,
            frames_dropped: stats.frames_dropped,
            chunks_scheduled: stats.chunks_scheduled,
            chunks_rejected: stats.chunks_rejected,
            interruptions: stats.interruptions,
            transcript_chars: stats.transcript_chars,
            success,
            error_message,
        }
    }
}

/// Collects and stores metrics for voice sessions
pub struct MetricsCollector {
    /// Finished sessions (newest first)
    history: VecDeque<SessionMetrics>,
    /// Errors (newest first)
    errors: VecDeque<ErrorRecord>,
    /// A closing session may still be draining playback when the next one starts
    in_progress: HashMap<Uuid, SessionInProgress>,
    total_sessions: u64,
    successful_sessions: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(MAX_SESSION_HISTORY),
            errors: VecDeque::with_capacity(MAX_ERROR_HISTORY),
            in_progress: HashMap::new(),
            total_sessions: 0,
            successful_sessions: 0,
        }
    }

    /// Start tracking a session that is about to open
    pub fn start_session(&mut self, session_id: Uuid) {
        log::debug!("Metrics: starting session {}", session_id);
        if self
            .in_progress
            .insert(session_id, SessionInProgress::new())
            .is_none()
        {
            self.total_sessions += 1;
        }
    }

    /// The agent acknowledged setup
    pub fn session_opened(&mut self, session_id: Uuid, stats: &SessionStats) {
        if self.in_progress.contains_key(&session_id) {
            log::info!(
                "Metrics: session {} opened in {:?}",
                session_id,
                stats.open_latency
            );
        }
    }

    /// The session closed normally
    pub fn session_finished(&mut self, session_id: Uuid, stats: &SessionStats) {
        if let Some(session) = self.in_progress.remove(&session_id) {
            let metrics = session.to_metrics(session_id, stats, true, None);
            log::info!(
                "Metrics: session {} finished - {}ms, {}/{} frames dropped, {} chunks, {} cut",
                metrics.session_id,
                metrics.duration_ms,
                metrics.frames_dropped,
                metrics.frames_sent + metrics.frames_dropped,
                metrics.chunks_scheduled,
                metrics.interruptions
            );
            self.add_to_history(metrics);
            self.successful_sessions += 1;
        }
    }

    /// The session failed to open or ended with an error
    pub fn session_failed(&mut self, session_id: Uuid, stats: &SessionStats, error: String) {
        if let Some(session) = self.in_progress.remove(&session_id) {
            let metrics = session.to_metrics(session_id, stats, false, Some(error.clone()));
            log::warn!(
                "Metrics: session {} failed after {}ms - {}",
                metrics.session_id,
                metrics.duration_ms,
                error
            );
            self.add_to_history(metrics);
        }

        self.record_error("session".to_string(), error, Some(session_id.to_string()));
    }

    /// Record an error (not necessarily tied to a session)
    pub fn record_error(
        &mut self,
        error_type: String,
        message: String,
        session_id: Option<String>,
    ) {
        let error = ErrorRecord {
            timestamp: unix_now(),
            error_type,
            message,
            session_id,
        };

        log::debug!("Metrics: recording error - {:?}", error);

        self.errors.push_front(error);
        while self.errors.len() > MAX_ERROR_HISTORY {
            self.errors.pop_back();
        }
    }

    pub fn get_summary(&self) -> MetricsSummary {
        let successful: Vec<_> = self.history.iter().filter(|s| s.success).collect();
        let count = successful.len() as u64;

        let (avg_latency, avg_duration) = if count > 0 {
            let sum_latency: u64 = successful.iter().map(|s| s.open_latency_ms).sum();
            let sum_duration: u64 = successful.iter().map(|s| s.duration_ms).sum();
            (sum_latency / count, sum_duration / count)
        } else {
            (0, 0)
        };

        MetricsSummary {
            total_sessions: self.total_sessions,
            successful_sessions: self.successful_sessions,
            failed_sessions: self
                .history
                .iter()
                .filter(|s| !s.success)
                .count() as u64,
            avg_open_latency_ms: avg_latency,
            avg_duration_ms: avg_duration,
            total_frames_dropped: self.history.iter().map(|s| s.frames_dropped).sum(),
            total_interruptions: self.history.iter().map(|s| s.interruptions).sum(),
            last_error: self.errors.front().cloned(),
        }
    }

    /// Finished sessions, newest first
    pub fn get_history(&self) -> Vec<SessionMetrics> {
        self.history.iter().cloned().collect()
    }

    /// Errors, newest first
    pub fn get_errors(&self) -> Vec<ErrorRecord> {
        self.errors.iter().cloned().collect()
    }

    pub fn is_active_session(&self, session_id: Uuid) -> bool {
        self.in_progress.contains_key(&session_id)
    }

    fn add_to_history(&mut self, metrics: SessionMetrics) {
        self.history.push_front(metrics);
        while self.history.len() > MAX_SESSION_HISTORY {
            self.history.pop_back();
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn stats(frames_sent: u64, interruptions: u64) -> SessionStats {
        SessionStats {
            open_latency: Some(Duration::from_millis(120)),
            frames_sent,
            interruptions,
            ..SessionStats::default()
        }
    }

    #[test]
    fn test_new_collector_is_empty() {
        let collector = MetricsCollector::new();
        let summary = collector.get_summary();

        assert_eq!(summary.total_sessions, 0);
        assert_eq!(summary.successful_sessions, 0);
        assert_eq!(summary.failed_sessions, 0);
        assert!(collector.get_history().is_empty());
        assert!(collector.get_errors().is_empty());
    }

    #[test]
    fn test_successful_session_tracking() {
        let mut collector = MetricsCollector::new();
        let id = Uuid::new_v4();

        collector.start_session(id);
        assert!(collector.is_active_session(id));
        collector.session_opened(id, &stats(0, 0));
        collector.session_finished(id, &stats(40, 2));

        assert!(!collector.is_active_session(id));
        let summary = collector.get_summary();
        assert_eq!(summary.total_sessions, 1);
        assert_eq!(summary.successful_sessions, 1);
        assert_eq!(summary.avg_open_latency_ms, 120);
        assert_eq!(summary.total_interruptions, 2);

        let history = collector.get_history();
        assert!(history[0].success);
        assert_eq!(history[0].frames_sent, 40);
    }

    #[test]
    fn test_failed_session_tracking() {
        let mut collector = MetricsCollector::new();
        let id = Uuid::new_v4();

        collector.start_session(id);
        collector.session_failed(id, &SessionStats::default(), "setup timeout".to_string());

        let summary = collector.get_summary();
        assert_eq!(summary.total_sessions, 1);
        assert_eq!(summary.failed_sessions, 1);
        assert_eq!(summary.last_error.unwrap().message, "setup timeout");
        assert_eq!(
            collector.get_history()[0].error_message,
            Some("setup timeout".to_string())
        );
    }

    #[test]
    fn test_overlapping_sessions_are_tracked_separately() {
        let mut collector = MetricsCollector::new();
        let draining = Uuid::new_v4();
        let next = Uuid::new_v4();

        collector.start_session(draining);
        collector.start_session(next);
        collector.session_finished(draining, &stats(10, 0));

        assert!(collector.is_active_session(next));
        assert_eq!(collector.get_history().len(), 1);
        assert_eq!(collector.get_summary().total_sessions, 2);
    }

    #[test]
    fn test_finish_of_unknown_session_is_ignored() {
        let mut collector = MetricsCollector::new();
        collector.session_finished(Uuid::new_v4(), &stats(1, 0));
        assert!(collector.get_history().is_empty());
        assert_eq!(collector.get_summary().successful_sessions, 0);
    }

    #[test]
    fn test_history_limit() {
        let mut collector = MetricsCollector::new();

        for i in 0..(MAX_SESSION_HISTORY + 10) {
            let id = Uuid::new_v4();
            collector.start_session(id);
            collector.session_finished(id, &stats(i as u64, 0));
        }

        let history = collector.get_history();
        assert_eq!(history.len(), MAX_SESSION_HISTORY);
        // Newest first
        assert!(history[0].frames_sent > history[MAX_SESSION_HISTORY - 1].frames_sent);
    }

    #[test]
    fn test_error_limit() {
        let mut collector = MetricsCollector::new();
        for i in 0..(MAX_ERROR_HISTORY + 5) {
            collector.record_error("agent".to_string(), format!("error {}", i), None);
        }
        let errors = collector.get_errors();
        assert_eq!(errors.len(), MAX_ERROR_HISTORY);
        assert_eq!(errors[0].message, format!("error {}", MAX_ERROR_HISTORY + 4));
    }
}
