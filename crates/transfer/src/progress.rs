//! Transfer progress reporting.
//!
//! The engine pushes [`ProgressReport`]s into a caller-supplied
//! [`ProgressSink`]; sinks decide what to do with them. [`FileSink`] writes
//! the pipe-delimited status line external monitors poll.

use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::warn;

/// Reports are throttled to at most one per this interval, except the final
/// one which is always delivered.
const MIN_REPORT_INTERVAL: Duration = Duration::from_millis(500);

/// A snapshot of transfer progress.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressReport {
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub elapsed: Duration,
    /// Average throughput since the transfer started, in MB/s.
    pub rate_mbps: f64,
    /// Wall-clock start of the transfer, seconds since the epoch.
    pub started_unix: u64,
    /// True exactly once, when the transfer finishes.
    pub finished: bool,
}

impl ProgressReport {
    pub fn percent(&self) -> u64 {
        if self.bytes_total == 0 {
            100
        } else {
            self.bytes_done * 100 / self.bytes_total
        }
    }
}

/// Consumer of progress reports.
pub trait ProgressSink: Send + Sync {
    fn report(&self, report: &ProgressReport);
}

/// Discards all reports.
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn report(&self, _report: &ProgressReport) {}
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressReport) + Send + Sync,
{
    fn report(&self, report: &ProgressReport) {
        self(report)
    }
}

/// Writes each report to a status file as a single pipe-delimited line:
///
/// ```text
/// <percent>|<rate MB/s>|<elapsed s>|<bytes done>|<bytes total>|<start unix ts>
/// ```
///
/// The file is replaced atomically on every report, and the final report's
/// line is newline-terminated so pollers can tell a finished transfer from
/// an in-flight one.
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn render(report: &ProgressReport) -> String {
        let mut line = String::new();
        let _ = write!(
            line,
            "{}|{:.2}|{:.2}|{}|{}|{}",
            report.percent(),
            report.rate_mbps,
            report.elapsed.as_secs_f64(),
            report.bytes_done,
            report.bytes_total,
            report.started_unix,
        );
        if report.finished {
            line.push('\n');
        }
        line
    }
}

impl ProgressSink for FileSink {
    fn report(&self, report: &ProgressReport) {
        let tmp = self.path.with_extension("tmp");
        let result = fs::write(&tmp, Self::render(report)).and_then(|()| {
            fs::rename(&tmp, &self.path)
        });
        // A broken status file must never fail the transfer itself.
        if let Err(err) = result {
            warn!(path = %self.path.display(), %err, "failed to write progress file");
        }
    }
}

/// Shared progress accumulator for one transfer.
///
/// Part workers add byte counts as parts complete; the tracker throttles
/// and fans reports out to the sink.
pub struct ProgressTracker {
    total: u64,
    consumed: AtomicU64,
    start: Instant,
    started_unix: u64,
    sink: Box<dyn ProgressSink>,
    last_emit: Mutex<Option<Instant>>,
}

impl ProgressTracker {
    pub fn new(total: u64, sink: Box<dyn ProgressSink>) -> Self {
        let started_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            total,
            consumed: AtomicU64::new(0),
            start: Instant::now(),
            started_unix,
            sink,
            last_emit: Mutex::new(None),
        }
    }

    /// Pre-credits bytes restored from a checkpoint.
    pub fn set_consumed(&self, bytes: u64) {
        self.consumed.store(bytes, Ordering::Relaxed);
    }

    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }

    /// Records `bytes` more transferred and maybe emits a report.
    pub fn add(&self, bytes: u64) {
        self.consumed.fetch_add(bytes, Ordering::Relaxed);
        self.emit(false);
    }

    /// Emits the final report, bypassing the throttle.
    pub fn finish(&self) {
        self.emit(true);
    }

    fn emit(&self, finished: bool) {
        if !finished {
            let mut last = self.last_emit.lock().unwrap();
            let now = Instant::now();
            if let Some(prev) = *last
                && now.duration_since(prev) < MIN_REPORT_INTERVAL
            {
                return;
            }
            *last = Some(now);
        }

        let done = self.consumed();
        let elapsed = self.start.elapsed();
        let secs = elapsed.as_secs_f64();
        let rate_mbps = if secs > 0.0 {
            done as f64 / secs / (1024.0 * 1024.0)
        } else {
            0.0
        };
        self.sink.report(&ProgressReport {
            bytes_done: done,
            bytes_total: self.total,
            elapsed,
            rate_mbps,
            started_unix: self.started_unix,
            finished,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn percent_handles_empty_total() {
        let r = ProgressReport {
            bytes_done: 0,
            bytes_total: 0,
            elapsed: Duration::ZERO,
            rate_mbps: 0.0,
            started_unix: 0,
            finished: true,
        };
        assert_eq!(r.percent(), 100);
    }

    #[test]
    fn file_sink_writes_pipe_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress");
        let sink = FileSink::new(&path);

        sink.report(&ProgressReport {
            bytes_done: 4_194_304,
            bytes_total: 10_485_760,
            elapsed: Duration::from_secs(2),
            rate_mbps: 2.0,
            started_unix: 1_700_000_000,
            finished: false,
        });

        let line = fs::read_to_string(&path).unwrap();
        assert!(!line.ends_with('\n'));
        let fields: Vec<&str> = line.split('|').collect();
        assert_eq!(
            fields,
            vec!["40", "2.00", "2.00", "4194304", "10485760", "1700000000"]
        );
    }

    #[test]
    fn final_report_line_is_newline_terminated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress");
        let sink = FileSink::new(&path);

        sink.report(&ProgressReport {
            bytes_done: 10,
            bytes_total: 10,
            elapsed: Duration::from_secs(1),
            rate_mbps: 0.0,
            started_unix: 0,
            finished: true,
        });

        let line = fs::read_to_string(&path).unwrap();
        assert!(line.ends_with('\n'));
        assert!(line.starts_with("100|"));
    }

    #[test]
    fn tracker_throttles_but_always_delivers_final() {
        let count = Arc::new(AtomicUsize::new(0));
        let counting = {
            let count = Arc::clone(&count);
            move |_: &ProgressReport| {
                count.fetch_add(1, Ordering::Relaxed);
            }
        };
        let tracker = ProgressTracker::new(100, Box::new(counting));

        // Rapid-fire updates collapse to one emission.
        for _ in 0..50 {
            tracker.add(1);
        }
        let after_adds = count.load(Ordering::Relaxed);
        assert_eq!(after_adds, 1);

        tracker.finish();
        assert_eq!(count.load(Ordering::Relaxed), after_adds + 1);
        assert_eq!(tracker.consumed(), 50);
    }

    #[test]
    fn resumed_bytes_are_pre_credited() {
        let tracker = ProgressTracker::new(100, Box::new(NoopSink));
        tracker.set_consumed(40);
        tracker.add(10);
        assert_eq!(tracker.consumed(), 50);
    }
}
