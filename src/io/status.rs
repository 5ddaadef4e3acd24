//! Progress and cancellation side channel.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// User-visible query state; exactly one holds at a time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryStatus {
    Wait,
    Ok,
    Error(String),
    Cancel,
}

impl std::fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryStatus::Wait => write!(f, "WAIT"),
            QueryStatus::Ok => write!(f, "OK"),
            QueryStatus::Error(msg) => write!(f, "ERROR: {}", msg),
            QueryStatus::Cancel => write!(f, "CANCEL"),
        }
    }
}

/// Result/progress capability driven by the orchestrator.
///
/// Implemented by whatever persists query status; the engine only pushes
/// progress and polls for cancellation.
pub trait StatusReporter: Send + Sync {
    fn report_progress(&self, increment: usize);

    fn report_error(&self, message: &str);

    fn poll_cancelled(&self) -> bool;

    /// Total number of progress steps (geo chunks) for the query
    fn report_total(&self, _total: usize) {}

    fn report_complete(&self) {}

    fn report_cancelled(&self) {}
}

/// Per-query cancellation flag shared by the orchestrator and its workers.
///
/// Polled only; setting it never interrupts work already running.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct StatusState {
    status: QueryStatus,
    completed: usize,
    total: usize,
}

/// Status store held in memory
#[derive(Debug)]
pub struct InMemoryStatus {
    state: Mutex<StatusState>,
    cancel_requested: AtomicBool,
}

impl Default for InMemoryStatus {
    fn default() -> Self {
        Self {
            state: Mutex::new(StatusState {
                status: QueryStatus::Wait,
                completed: 0,
                total: 0,
            }),
            cancel_requested: AtomicBool::new(false),
        }
    }
}

impl InMemoryStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the running query to stop
    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    pub fn status(&self) -> QueryStatus {
        self.with_state(|s| s.status.clone())
    }

    /// (completed, total) geo chunks
    pub fn progress(&self) -> (usize, usize) {
        self.with_state(|s| (s.completed, s.total))
    }

    pub fn fraction(&self) -> f64 {
        let (completed, total) = self.progress();
        if total == 0 {
            0.0
        } else {
            completed as f64 / total as f64
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut StatusState) -> R) -> R {
        match self.state.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

impl StatusReporter for InMemoryStatus {
    fn report_progress(&self, increment: usize) {
        self.with_state(|s| s.completed += increment);
    }

    fn report_error(&self, message: &str) {
        self.with_state(|s| s.status = QueryStatus::Error(message.to_string()));
    }

    fn poll_cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    fn report_total(&self, total: usize) {
        self.with_state(|s| {
            s.total = total;
            s.completed = 0;
            s.status = QueryStatus::Wait;
        });
    }

    fn report_complete(&self) {
        self.with_state(|s| s.status = QueryStatus::Ok);
    }

    fn report_cancelled(&self) {
        self.with_state(|s| s.status = QueryStatus::Cancel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        let status = InMemoryStatus::new();
        assert_eq!(status.status(), QueryStatus::Wait);

        status.report_total(4);
        status.report_progress(1);
        status.report_progress(1);
        assert_eq!(status.progress(), (2, 4));
        assert!((status.fraction() - 0.5).abs() < 1e-12);

        status.report_error("archive offline");
        assert_eq!(status.status(), QueryStatus::Error("archive offline".to_string()));
        assert_eq!(status.status().to_string(), "ERROR: archive offline");
    }

    #[test]
    fn test_cancel_request_is_polled() {
        let status = InMemoryStatus::new();
        assert!(!status.poll_cancelled());
        status.request_cancel();
        assert!(status.poll_cancelled());
    }

    #[test]
    fn test_cancellation_flag_is_shared() {
        let flag = CancellationFlag::new();
        let worker_view = flag.clone();
        flag.cancel();
        assert!(worker_view.is_cancelled());
    }
}
