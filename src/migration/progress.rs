// ABOUTME: Shared byte/row/file counters and the periodic progress logger
// ABOUTME: Counters are atomics owned by a run and shared with workers by Arc

use crate::utils::{format_bytes, format_duration, megabytes_per_second};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Monotonic counters for one dump or restore run
#[derive(Debug, Default)]
pub struct Stats {
    bytes: AtomicU64,
    rows: AtomicU64,
    files: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub bytes: u64,
    pub rows: u64,
    pub files: u64,
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_bytes(&self, count: u64) {
        self.bytes.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_rows(&self, count: u64) {
        self.rows.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_files(&self, count: u64) {
        self.files.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes: self.bytes.load(Ordering::Relaxed),
            rows: self.rows.load(Ordering::Relaxed),
            files: self.files.load(Ordering::Relaxed),
        }
    }
}

/// Render one progress line
pub fn progress_line(label: &str, snapshot: StatsSnapshot, elapsed: Duration) -> String {
    format!(
        "{}: {} rows, {} files, {} in {} ({:.2} MB/s)",
        label,
        snapshot.rows,
        snapshot.files,
        format_bytes(snapshot.bytes),
        format_duration(elapsed),
        megabytes_per_second(snapshot.bytes, elapsed)
    )
}

/// Background task logging [`Stats`] every interval
///
/// Stops when [`ProgressReporter::stop`] is awaited, when the handle is
/// dropped, or when the parent token is cancelled. It never affects the run.
pub struct ProgressReporter {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    pub fn start(
        stats: Arc<Stats>,
        interval: Duration,
        label: &'static str,
        parent: &CancellationToken,
    ) -> Self {
        let token = parent.child_token();
        let task_token = token.clone();
        let started = Instant::now();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        tracing::info!("{}", progress_line(label, stats.snapshot(), started.elapsed()));
                    }
                }
            }
        });

        Self {
            token,
            handle: Some(handle),
        }
    }

    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
