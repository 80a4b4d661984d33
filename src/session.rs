use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use crate::error::BuildError;

/// Shared state of one build run, owned by the controlling context and passed
/// by reference into every core call. The worker only ever reads the
/// cancellation flag; the controlling context only ever sets it.
#[derive(Debug, Default)]
pub struct BuildSession {
    cancelled: AtomicBool,
}

impl BuildSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// One-shot cooperative cancellation. Safe to call from any thread at any
    /// time; the build observes it at the next poll point.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Poll point: turns an observed cancellation into the unwinding error.
    pub fn check(&self) -> Result<(), BuildError> {
        if self.is_cancelled() {
            Err(BuildError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Progress values produced by the worker for the controlling context.
/// Indeterminate marks the outer wildcard expansion where no total is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Indeterminate,
    Percent(u32),
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    Completed,
    Cancelled,
}

/// Final accounting of a build run. Failures are reported as errors instead;
/// a report always means the output files reflect the stated outcome.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub added_count:        u64,
    pub volume_count:       u32,
    pub uncompressed_bytes: u64,
    pub compressed_bytes:   u64,
    pub elapsed:            Duration,
    pub outcome:            BuildOutcome,
}

impl BuildReport {
    /// Space saved as `100 * max(0, uncompressed / compressed - 1)` percent,
    /// guarding the zero-compressed case.
    pub fn compression_percent(&self) -> f64 {
        if self.compressed_bytes == 0 {
            return 0.0;
        }
        let uncompressed = self.uncompressed_bytes as f64;
        let compressed = self.compressed_bytes as f64;
        100.0 * (uncompressed / compressed - 1.0).max(0.0)
    }

    pub fn elapsed_display(&self) -> String {
        let total = self.elapsed.as_secs();
        format!(
            "{:02}:{:02}:{:02}",
            total / 3600,
            (total % 3600) / 60,
            total % 60
        )
    }
}
