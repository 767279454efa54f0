//! Progress adaptation.
//!
//! Engine steps report raw byte and file counts to a [`ProgressTracker`],
//! which turns them into canonical [`ProgressEvent`]s for the caller's
//! callback. Without a callback the tracker records nothing.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::services::storage::ProgressEvent;

/// Caller-supplied progress sink.
pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

#[derive(Debug, Default)]
struct Counters {
    bytes_transferred: u64,
    total_bytes: Option<u64>,
    files_processed: u64,
    total_files: Option<u64>,
    current_file: Option<String>,
}

pub struct ProgressTracker {
    operation: String,
    callback: Option<ProgressCallback>,
    started: Instant,
    counters: Mutex<Counters>,
}

impl ProgressTracker {
    pub fn new(operation: impl Into<String>, callback: Option<ProgressCallback>) -> Self {
        Self {
            operation: operation.into(),
            callback,
            started: Instant::now(),
            counters: Mutex::new(Counters::default()),
        }
    }

    /// A tracker that never emits.
    pub fn disabled(operation: impl Into<String>) -> Self {
        Self::new(operation, None)
    }

    pub fn is_enabled(&self) -> bool {
        self.callback.is_some()
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Set the expected totals. `total_files` is `None` for single-file
    /// transfers.
    pub fn set_totals(&self, total_bytes: Option<u64>, total_files: Option<u64>) {
        if !self.is_enabled() {
            return;
        }
        {
            let mut counters = self.counters();
            counters.total_bytes = total_bytes;
            counters.total_files = total_files;
        }
        self.emit();
    }

    /// Record `bytes` more transferred for `file`.
    pub fn add_bytes(&self, bytes: u64, file: Option<&str>) {
        if !self.is_enabled() {
            return;
        }
        {
            let mut counters = self.counters();
            counters.bytes_transferred = counters.bytes_transferred.saturating_add(bytes);
            if let Some(file) = file {
                counters.current_file = Some(file.to_string());
            }
        }
        self.emit();
    }

    /// Take back bytes counted by a transfer that then failed.
    pub fn rewind_bytes(&self, bytes: u64) {
        if !self.is_enabled() || bytes == 0 {
            return;
        }
        {
            let mut counters = self.counters();
            counters.bytes_transferred = counters.bytes_transferred.saturating_sub(bytes);
        }
        self.emit();
    }

    /// Record one more file completed.
    pub fn file_done(&self, file: &str) {
        if !self.is_enabled() {
            return;
        }
        {
            let mut counters = self.counters();
            counters.files_processed += 1;
            counters.current_file = Some(file.to_string());
        }
        self.emit();
    }

    /// Build the current event without emitting it.
    pub fn snapshot(&self) -> ProgressEvent {
        let counters = self.counters();
        let elapsed = self.started.elapsed().as_secs_f64();

        let bytes_per_second = if elapsed > 0.0 && counters.bytes_transferred > 0 {
            Some(counters.bytes_transferred as f64 / elapsed)
        } else {
            None
        };
        let estimated_time_remaining = match (bytes_per_second, counters.total_bytes) {
            (Some(bps), Some(total)) if bps > 0.0 => {
                let remaining = total.saturating_sub(counters.bytes_transferred) as f64;
                Some((remaining / bps * 1000.0).round() as u64)
            }
            _ => None,
        };

        ProgressEvent {
            operation: self.operation.clone(),
            bytes_transferred: counters.bytes_transferred,
            total_bytes: counters.total_bytes,
            percentage: ProgressEvent::percentage_of(
                counters.bytes_transferred,
                counters.total_bytes,
            ),
            current_file: counters.current_file.clone(),
            files_processed: counters.total_files.map(|_| counters.files_processed),
            total_files: counters.total_files,
            estimated_time_remaining,
            bytes_per_second,
        }
    }

    fn emit(&self) {
        if let Some(callback) = &self.callback {
            // The lock is released before the callback runs.
            let event = self.snapshot();
            callback(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording() -> (ProgressCallback, Arc<Mutex<Vec<ProgressEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let callback: ProgressCallback = Arc::new(move |e| sink.lock().unwrap().push(e));
        (callback, events)
    }

    #[test]
    fn test_events_follow_counts() {
        let (callback, events) = recording();
        let tracker = ProgressTracker::new("download", Some(callback));
        tracker.set_totals(Some(200), Some(2));
        tracker.add_bytes(50, Some("/a"));
        tracker.file_done("/a");
        tracker.add_bytes(150, Some("/b"));

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 4);
        assert_eq!(events[1].percentage, 25);
        assert_eq!(events[1].current_file.as_deref(), Some("/a"));
        assert_eq!(events[2].files_processed, Some(1));
        let last = events.last().unwrap();
        assert_eq!(last.percentage, 100);
        assert_eq!(last.bytes_transferred, 200);
        assert_eq!(last.operation, "download");
    }

    #[test]
    fn test_disabled_tracker_records_nothing() {
        let tracker = ProgressTracker::disabled("upload");
        tracker.set_totals(Some(10), None);
        tracker.add_bytes(10, None);
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.bytes_transferred, 0);
        assert_eq!(snapshot.percentage, 0);
    }

    #[test]
    fn test_unknown_total_is_zero_percent() {
        let (callback, events) = recording();
        let tracker = ProgressTracker::new("read", Some(callback));
        tracker.add_bytes(1024, None);
        let events = events.lock().unwrap();
        assert_eq!(events[0].percentage, 0);
        assert!(events[0].files_processed.is_none());
    }
}
