use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "INFO",
            Self::Success => "SUCCESS",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Destination for run log lines.
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, msg: &str);

    fn info(&self, msg: &str) {
        self.log(LogLevel::Info, msg);
    }

    fn success(&self, msg: &str) {
        self.log(LogLevel::Success, msg);
    }

    fn warn(&self, msg: &str) {
        self.log(LogLevel::Warning, msg);
    }

    fn error(&self, msg: &str) {
        self.log(LogLevel::Error, msg);
    }
}

pub struct ConsoleProgress {
    enabled: bool,
    t0: Instant,
}

impl ConsoleProgress {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            t0: Instant::now(),
        }
    }
}

impl LogSink for ConsoleProgress {
    fn log(&self, level: LogLevel, msg: &str) {
        if !self.enabled {
            return;
        }
        let ts = fmt_elapsed(self.t0.elapsed().as_secs_f64());
        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "[{ts}] [{level}] {msg}");
    }
}

/// Counters shared between the pipeline thread (writer) and observers (readers).
#[derive(Debug)]
pub struct ProgressTracker {
    total: AtomicUsize,
    processed: AtomicUsize,
    started: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProgressSnapshot {
    pub processed: usize,
    pub total: usize,
    pub elapsed: Duration,
    pub eta: Option<Duration>,
}

impl ProgressTracker {
    pub fn new(total: usize) -> Self {
        Self {
            total: AtomicUsize::new(total),
            processed: AtomicUsize::new(0),
            started: Instant::now(),
        }
    }

    pub fn set_total(&self, total: usize) {
        self.total.store(total, Ordering::Relaxed);
    }

    pub fn advance(&self, newly_resolved: usize) {
        if newly_resolved > 0 {
            self.processed.fetch_add(newly_resolved, Ordering::Relaxed);
        }
    }

    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let processed = self.processed.load(Ordering::Relaxed);
        let total = self.total.load(Ordering::Relaxed);
        let elapsed = self.started.elapsed();
        ProgressSnapshot {
            processed,
            total,
            elapsed,
            eta: estimate_eta(elapsed, processed, total),
        }
    }
}

/// `(elapsed / processed) * (total - processed)`; unknown until something has been processed.
pub fn estimate_eta(elapsed: Duration, processed: usize, total: usize) -> Option<Duration> {
    if processed == 0 {
        return None;
    }
    let remaining = total.saturating_sub(processed);
    Some(elapsed.div_f64(processed as f64).mul_f64(remaining as f64))
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pct = if self.total == 0 {
            0.0
        } else {
            self.processed as f64 / self.total as f64 * 100.0
        };
        let eta = self
            .eta
            .map(|d| fmt_elapsed(d.as_secs_f64()))
            .unwrap_or_else(|| "--:--".to_string());
        write!(
            f,
            "{}/{} ({pct:.0}%) Elapsed: {} ETA: {eta}",
            self.processed,
            self.total,
            fmt_elapsed(self.elapsed.as_secs_f64())
        )
    }
}

/// Periodically reports a tracker's snapshot until dropped.
pub struct ProgressTicker {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl ProgressTicker {
    pub fn spawn(
        tracker: Arc<ProgressTracker>,
        sink: Arc<dyn LogSink>,
        interval: Duration,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        if interval.is_zero() {
            return Self { stop, handle: None };
        }
        let flag = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            let step = interval.min(Duration::from_millis(100));
            let mut since_report = Duration::ZERO;
            while !flag.load(Ordering::Relaxed) {
                std::thread::sleep(step);
                since_report += step;
                if since_report >= interval {
                    since_report = Duration::ZERO;
                    sink.info(&tracker.snapshot().to_string());
                }
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for ProgressTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

pub fn fmt_elapsed(seconds: f64) -> String {
    let seconds = seconds.max(0.0) as u64;
    let h = seconds / 3600;
    let m = (seconds % 3600) / 60;
    let s = seconds % 60;
    if h > 0 {
        format!("{h:02}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::{LogLevel, LogSink};

    #[derive(Default)]
    pub struct MemoryLog {
        pub lines: Mutex<Vec<(LogLevel, String)>>,
    }

    impl MemoryLog {
        pub fn at(&self, level: LogLevel) -> Vec<String> {
            self.lines
                .lock()
                .expect("log lock")
                .iter()
                .filter(|(l, _)| *l == level)
                .map(|(_, m)| m.clone())
                .collect()
        }
    }

    impl LogSink for MemoryLog {
        fn log(&self, level: LogLevel, msg: &str) {
            self.lines
                .lock()
                .expect("log lock")
                .push((level, msg.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eta_is_unknown_before_first_chapter() {
        assert_eq!(estimate_eta(Duration::from_secs(30), 0, 10), None);
    }

    #[test]
    fn eta_scales_average_by_remaining() {
        let eta = estimate_eta(Duration::from_secs(40), 4, 10).expect("eta");
        assert_eq!(eta.as_secs(), 60);
        assert_eq!(estimate_eta(Duration::from_secs(40), 10, 10), Some(Duration::ZERO));
    }

    #[test]
    fn tracker_accumulates() {
        let t = ProgressTracker::new(5);
        t.advance(2);
        t.advance(0);
        t.advance(1);
        let snap = t.snapshot();
        assert_eq!(snap.processed, 3);
        assert_eq!(snap.total, 5);
        assert!(snap.eta.is_some());
    }

    #[test]
    fn snapshot_display_marks_unknown_eta() {
        let snap = ProgressSnapshot {
            processed: 0,
            total: 4,
            elapsed: Duration::from_secs(65),
            eta: None,
        };
        assert_eq!(snap.to_string(), "0/4 (0%) Elapsed: 01:05 ETA: --:--");
    }

    #[test]
    fn fmt_elapsed_switches_to_hours() {
        assert_eq!(fmt_elapsed(59.9), "00:59");
        assert_eq!(fmt_elapsed(3725.0), "01:02:05");
    }
}
