//! Shared serving state.
//!
//! The KB snapshot bundles the readiness flag, the retriever, and the
//! status report it was built with into one immutable value swapped whole
//! behind a single lock — a reader can never observe a retriever paired
//! with a different build's metadata. Request handlers only read; the
//! background build task is the single writer.

use std::sync::{Arc, Mutex, RwLock};

use crate::index::{IndexReport, Retriever};

/// Immutable snapshot of the KB serving state.
pub struct KbSnapshot {
    /// Set once the background build task has finished (in any status).
    pub ready: bool,
    pub retriever: Option<Arc<Retriever>>,
    pub report: IndexReport,
}

impl KbSnapshot {
    pub fn initializing() -> Self {
        Self {
            ready: false,
            retriever: None,
            report: IndexReport::initializing(),
        }
    }
}

/// State shared between request handlers and the background build task.
pub struct SharedState {
    kb: RwLock<Arc<KbSnapshot>>,
    /// Last report seen by `/summarize`, used as the chat fallback.
    last_report: Mutex<Option<String>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            kb: RwLock::new(Arc::new(KbSnapshot::initializing())),
            last_report: Mutex::new(None),
        }
    }

    /// Current snapshot; cheap Arc clone, never blocks on the builder.
    pub fn kb(&self) -> Arc<KbSnapshot> {
        self.kb.read().expect("kb snapshot lock poisoned").clone()
    }

    /// Swap in a new snapshot. Called only by the background build task.
    pub fn publish(&self, snapshot: KbSnapshot) {
        *self.kb.write().expect("kb snapshot lock poisoned") = Arc::new(snapshot);
    }

    pub fn last_report(&self) -> Option<String> {
        self.last_report
            .lock()
            .expect("last report lock poisoned")
            .clone()
    }

    pub fn set_last_report(&self, report: String) {
        *self
            .last_report
            .lock()
            .expect("last report lock poisoned") = Some(report);
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexStatus;

    #[test]
    fn test_initial_snapshot_not_ready() {
        let state = SharedState::new();
        let snapshot = state.kb();
        assert!(!snapshot.ready);
        assert!(snapshot.retriever.is_none());
        assert_eq!(snapshot.report.status, IndexStatus::Initializing);
    }

    #[test]
    fn test_publish_swaps_whole_snapshot() {
        let state = SharedState::new();
        state.publish(KbSnapshot {
            ready: true,
            retriever: None,
            report: IndexReport::index_error("embedding backend unavailable"),
        });

        let snapshot = state.kb();
        assert!(snapshot.ready);
        assert_eq!(snapshot.report.status, IndexStatus::IndexError);
        assert!(snapshot.report.error.is_some());
    }

    #[test]
    fn test_last_report_fallback() {
        let state = SharedState::new();
        assert!(state.last_report().is_none());
        state.set_last_report("BP 140/90".to_string());
        assert_eq!(state.last_report().as_deref(), Some("BP 140/90"));
    }
}
