//! Progress streaming for long-running stages
//!
//! A [`ProgressHub`] owns the sending side of a flume channel and hands out
//! per-stage [`ProgressReporter`]s. Routine updates are throttled and are
//! dropped while the queue holds `capacity` events, so a slow consumer bounds
//! the backlog. Warnings, errors and completion events are always queued and
//! never block the producer, which may be an async task. The stream ends when
//! the hub has been closed and every reporter has been dropped.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

/// Long-running operation a progress event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    MovieScan,
    TvScan,
    ComplianceScan,
    TitleResolution,
    Cleanup,
    BatchRename,
    Backup,
    VerifyBackup,
    RevertBackup,
    Report,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::MovieScan => "movie scan",
            Operation::TvScan => "tv scan",
            Operation::ComplianceScan => "compliance scan",
            Operation::TitleResolution => "title resolution",
            Operation::Cleanup => "cleanup",
            Operation::BatchRename => "batch rename",
            Operation::Backup => "backup",
            Operation::VerifyBackup => "backup verification",
            Operation::RevertBackup => "backup revert",
            Operation::Report => "report",
        };
        write!(f, "{}", name)
    }
}

/// Phase within an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Starting,
    Scanning,
    Analyzing,
    Applying,
    Complete,
}

/// Event severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

/// Verbosity of the progress stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Warnings and errors only
    Quiet,
    #[default]
    Normal,
    /// Adds per-file debug events
    Verbose,
}

impl LogLevel {
    /// Whether events of this severity are emitted at this level
    pub fn allows(self, severity: Severity) -> bool {
        match self {
            LogLevel::Quiet => severity >= Severity::Warn,
            LogLevel::Normal => severity >= Severity::Info,
            LogLevel::Verbose => true,
        }
    }

    /// Parse from a config string, defaulting to normal
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "quiet" => Some(LogLevel::Quiet),
            "normal" => Some(LogLevel::Normal),
            "verbose" => Some(LogLevel::Verbose),
            _ => None,
        }
    }
}

/// Running counters carried on each event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressStats {
    pub files_processed: u64,
    pub duplicates_found: u64,
    pub issues_found: u64,
    pub errors: u64,
}

/// Progress event streamed to presentation layers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanProgress {
    pub operation: Operation,
    pub stage: Stage,
    pub current: u64,
    pub total: u64,
    pub percentage: f64,
    pub message: String,
    pub severity: Severity,
    /// Set for errors the consumer should surface prominently
    pub alert: bool,
    pub stats: ProgressStats,
    pub started_at: DateTime<Utc>,
    pub elapsed_secs: f64,
}

/// Throttling and verbosity for a reporter
#[derive(Debug, Clone, Copy)]
pub struct ProgressConfig {
    /// Minimum spacing between throttled updates
    pub min_interval: Duration,
    pub level: LogLevel,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(200),
            level: LogLevel::Normal,
        }
    }
}

impl ProgressConfig {
    /// Slower cadence used while snapshotting backups
    pub fn for_backup(level: LogLevel) -> Self {
        Self {
            min_interval: Duration::from_millis(500),
            level,
        }
    }
}

/// Producer side of the progress stream
pub struct ProgressHub {
    tx: flume::Sender<ScanProgress>,
    capacity: usize,
}

impl ProgressHub {
    /// Create a hub whose routine updates back off at `capacity` queued
    /// events, returning the consumer side
    pub fn new(capacity: usize) -> (Self, flume::Receiver<ScanProgress>) {
        let (tx, rx) = flume::unbounded();
        let capacity = capacity.max(1);
        (Self { tx, capacity }, rx)
    }

    /// Create a reporter for one stage
    pub fn reporter(&self, operation: Operation, config: ProgressConfig) -> ProgressReporter {
        ProgressReporter::with_sender(operation, config, Some((self.tx.clone(), self.capacity)))
    }

    /// Close the producer side. Consumers see end-of-stream once every
    /// reporter created from this hub has also been dropped.
    pub fn close(self) {
        debug!("Closing progress hub");
        drop(self.tx);
    }
}

#[derive(Debug)]
struct ReporterState {
    stage: Stage,
    current: u64,
    total: u64,
    stats: ProgressStats,
    errors: Vec<String>,
    last_emit: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Throttled,
    Immediate,
}

/// Per-stage progress writer. Clones share counters and throttling.
#[derive(Clone)]
pub struct ProgressReporter {
    operation: Operation,
    config: ProgressConfig,
    /// Sender plus the queue length at which throttled updates are dropped
    tx: Option<(flume::Sender<ScanProgress>, usize)>,
    state: Arc<Mutex<ReporterState>>,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("operation", &self.operation)
            .field("config", &self.config)
            .field("connected", &self.tx.is_some())
            .finish()
    }
}

impl ProgressReporter {
    fn with_sender(
        operation: Operation,
        config: ProgressConfig,
        tx: Option<(flume::Sender<ScanProgress>, usize)>,
    ) -> Self {
        Self {
            operation,
            config,
            tx,
            state: Arc::new(Mutex::new(ReporterState {
                stage: Stage::Starting,
                current: 0,
                total: 0,
                stats: ProgressStats::default(),
                errors: Vec::new(),
                last_emit: None,
            })),
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    /// A reporter that keeps counters but has no consumer
    pub fn detached(operation: Operation) -> Self {
        Self::with_sender(operation, ProgressConfig::default(), None)
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Announce the start of the operation
    pub fn start(&self, total: u64, message: impl Into<String>) {
        {
            let mut state = self.state.lock();
            state.total = total;
            state.current = 0;
            state.stage = Stage::Starting;
        }
        self.emit(Severity::Info, message.into(), false, Delivery::Immediate);
    }

    /// Change the total when it becomes known mid-stage
    pub fn set_total(&self, total: u64) {
        self.state.lock().total = total;
    }

    /// Enter a new stage
    pub fn stage(&self, stage: Stage, message: impl Into<String>) {
        self.state.lock().stage = stage;
        self.emit(Severity::Info, message.into(), false, Delivery::Immediate);
    }

    /// Report the current position, throttled
    pub fn update(&self, current: u64, message: impl Into<String>) {
        self.state.lock().current = current;
        self.emit(Severity::Info, message.into(), false, Delivery::Throttled);
    }

    /// Count one processed file and emit a throttled update
    pub fn file_processed(&self, path: &std::path::Path) {
        {
            let mut state = self.state.lock();
            state.current += 1;
            state.stats.files_processed += 1;
        }
        if self.config.level == LogLevel::Verbose {
            self.emit(
                Severity::Debug,
                format!("Processed {}", path.display()),
                false,
                Delivery::Throttled,
            );
        } else {
            self.emit(Severity::Info, String::new(), false, Delivery::Throttled);
        }
    }

    pub fn duplicates_found(&self, count: u64) {
        self.state.lock().stats.duplicates_found += count;
    }

    pub fn issues_found(&self, count: u64) {
        self.state.lock().stats.issues_found += count;
    }

    /// Non-fatal problem, always delivered
    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(operation = %self.operation, message = %message, "Progress warning");
        self.emit(Severity::Warn, message, false, Delivery::Immediate);
    }

    /// Item failure, always delivered with an alert
    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        error!(operation = %self.operation, message = %message, "Progress error");
        self.record_error(&message);
        self.emit(Severity::Error, message, true, Delivery::Immediate);
    }

    /// Failure that stops the operation, always delivered with an alert
    pub fn critical(&self, message: impl Into<String>) {
        let message = message.into();
        error!(operation = %self.operation, message = %message, "Progress critical");
        self.record_error(&message);
        self.emit(Severity::Critical, message, true, Delivery::Immediate);
    }

    /// Mark the operation finished
    pub fn complete(&self, message: impl Into<String>) {
        {
            let mut state = self.state.lock();
            state.stage = Stage::Complete;
            state.current = state.total.max(state.current);
        }
        self.emit(Severity::Info, message.into(), false, Delivery::Immediate);
    }

    pub fn stats(&self) -> ProgressStats {
        self.state.lock().stats
    }

    /// Error messages recorded so far
    pub fn errors(&self) -> Vec<String> {
        self.state.lock().errors.clone()
    }

    fn record_error(&self, message: &str) {
        let mut state = self.state.lock();
        state.stats.errors += 1;
        state.errors.push(message.to_string());
    }

    fn emit(&self, severity: Severity, message: String, alert: bool, delivery: Delivery) {
        if !self.config.level.allows(severity) {
            return;
        }
        let Some((tx, capacity)) = &self.tx else {
            return;
        };

        let event = {
            let mut state = self.state.lock();
            let now = Instant::now();
            if delivery == Delivery::Throttled {
                let too_soon = state
                    .last_emit
                    .is_some_and(|last| now.duration_since(last) < self.config.min_interval);
                if too_soon || tx.len() >= *capacity {
                    return;
                }
            }
            state.last_emit = Some(now);

            let percentage = if state.total > 0 {
                (state.current as f64 / state.total as f64 * 100.0).min(100.0)
            } else {
                0.0
            };

            ScanProgress {
                operation: self.operation,
                stage: state.stage,
                current: state.current,
                total: state.total,
                percentage,
                message,
                severity,
                alert,
                stats: state.stats,
                started_at: self.started_at,
                elapsed_secs: self.started.elapsed().as_secs_f64(),
            }
        };

        // The queue is unbounded, so this never blocks. A consumer that went
        // away is not an error for the producer.
        let _ = tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::Path;

    fn drain(rx: &flume::Receiver<ScanProgress>) -> Vec<ScanProgress> {
        rx.try_iter().collect()
    }

    #[test]
    fn test_updates_are_throttled() {
        let (hub, rx) = ProgressHub::new(64);
        let config = ProgressConfig {
            min_interval: Duration::from_secs(60),
            level: LogLevel::Normal,
        };
        let reporter = hub.reporter(Operation::MovieScan, config);
        reporter.start(100, "Scanning");
        for i in 0..50 {
            reporter.update(i, "tick");
        }
        let events = drain(&rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].total, 100);
    }

    #[test]
    fn test_errors_are_never_throttled() {
        let (hub, rx) = ProgressHub::new(64);
        let config = ProgressConfig {
            min_interval: Duration::from_secs(60),
            level: LogLevel::Quiet,
        };
        let reporter = hub.reporter(Operation::Cleanup, config);
        reporter.start(2, "Cleaning");
        reporter.error("first");
        reporter.critical("second");

        let events = drain(&rx);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.alert));
        assert_eq!(events[1].severity, Severity::Critical);
        assert_eq!(reporter.stats().errors, 2);
        assert_eq!(reporter.errors(), vec!["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn test_stream_ends_after_close_and_reporters_drop() {
        let (hub, rx) = ProgressHub::new(8);
        let reporter = hub.reporter(Operation::TvScan, ProgressConfig::default());
        reporter.file_processed(Path::new("/lib/a.mkv"));
        reporter.complete("done");
        hub.close();
        drop(reporter);

        let events: Vec<ScanProgress> = rx.iter().collect();
        let last = events.last().expect("completion event");
        assert_eq!(last.stage, Stage::Complete);
        assert_eq!(last.stats.files_processed, 1);
        assert!(rx.recv().is_err());
    }

    #[test]
    fn test_full_queue_drops_updates_but_keeps_alerts() {
        let (hub, rx) = ProgressHub::new(2);
        let config = ProgressConfig {
            min_interval: Duration::ZERO,
            level: LogLevel::Normal,
        };
        let reporter = hub.reporter(Operation::Cleanup, config);
        reporter.start(10, "Cleaning");
        reporter.update(1, "tick");
        reporter.update(2, "dropped");
        for i in 0..5 {
            reporter.error(format!("failure {}", i));
        }
        reporter.complete("done");

        let events = drain(&rx);
        assert_eq!(events.len(), 8);
        assert!(events.iter().all(|e| e.message != "dropped"));
        assert_eq!(events.last().unwrap().stage, Stage::Complete);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_alerts_from_async_code_do_not_wait_for_consumer() {
        let (hub, rx) = ProgressHub::new(1);
        let reporter = hub.reporter(Operation::MovieScan, ProgressConfig::default());
        for i in 0..16 {
            reporter.warn(format!("warning {}", i));
        }
        hub.close();
        drop(reporter);

        let mut received = 0;
        while rx.recv_async().await.is_ok() {
            received += 1;
        }
        assert_eq!(received, 16);
    }

    #[test]
    fn test_detached_reporter_keeps_counts() {
        let reporter = ProgressReporter::detached(Operation::Backup);
        reporter.duplicates_found(3);
        reporter.issues_found(1);
        reporter.error("oops");
        let stats = reporter.stats();
        assert_eq!(stats.duplicates_found, 3);
        assert_eq!(stats.issues_found, 1);
        assert_eq!(stats.errors, 1);
    }

    #[test]
    fn test_log_level_filtering() {
        assert!(!LogLevel::Quiet.allows(Severity::Info));
        assert!(LogLevel::Quiet.allows(Severity::Warn));
        assert!(!LogLevel::Normal.allows(Severity::Debug));
        assert!(LogLevel::Verbose.allows(Severity::Debug));
        assert_eq!(LogLevel::parse("VERBOSE"), Some(LogLevel::Verbose));
        assert_eq!(LogLevel::parse("loud"), None);
    }
}
