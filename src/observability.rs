//! Tracing setup and in-process counters

use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::EnvFilter;

/// Install the global `fmt` subscriber, filtered by `RUST_LOG` (default `info`)
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Pipeline counters shared by the upload path and the consumer
#[derive(Debug, Default)]
pub struct Metrics {
    uploads_accepted: AtomicU64,
    uploads_failed: AtomicU64,
    tasks_published: AtomicU64,
    tasks_consumed: AtomicU64,
    artifacts_missing: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upload_accepted(&self) {
        self.uploads_accepted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "uploads_accepted", "Metric incremented");
    }

    pub fn upload_failed(&self) {
        self.uploads_failed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "uploads_failed", "Metric incremented");
    }

    pub fn task_published(&self) {
        self.tasks_published.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "tasks_published", "Metric incremented");
    }

    pub fn task_consumed(&self) {
        self.tasks_consumed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "tasks_consumed", "Metric incremented");
    }

    pub fn artifact_missing(&self) {
        self.artifacts_missing.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "artifacts_missing", "Metric incremented");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uploads_accepted: self.uploads_accepted.load(Ordering::Relaxed),
            uploads_failed: self.uploads_failed.load(Ordering::Relaxed),
            tasks_published: self.tasks_published.load(Ordering::Relaxed),
            tasks_consumed: self.tasks_consumed.load(Ordering::Relaxed),
            artifacts_missing: self.artifacts_missing.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub uploads_accepted: u64,
    pub uploads_failed: u64,
    pub tasks_published: u64,
    pub tasks_consumed: u64,
    pub artifacts_missing: u64,
}
