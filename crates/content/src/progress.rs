use log::{info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub const REPORT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressAction {
    Extracted,
    Validated,
}

impl ProgressAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressAction::Extracted => "extracted",
            ProgressAction::Validated => "validated",
        }
    }
}

/// Byte counter shared between a content walk and its reporter.
#[derive(Debug)]
pub struct CopyProgress {
    bytes_processed: AtomicU64,
    started: Instant,
}

impl CopyProgress {
    pub fn new() -> Self {
        Self {
            bytes_processed: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn add(&self, bytes: u64) {
        self.bytes_processed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self, action: ProgressAction, total_bytes: u64) -> ProgressSnapshot {
        ProgressSnapshot {
            action,
            bytes_processed: self.bytes_processed(),
            total_bytes,
            elapsed: self.elapsed(),
        }
    }
}

impl Default for CopyProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub action: ProgressAction,
    pub bytes_processed: u64,
    pub total_bytes: u64,
    pub elapsed: Duration,
}

pub trait ProgressSink: Send {
    fn update(&mut self, snapshot: &ProgressSnapshot);
    fn finish(&mut self, snapshot: &ProgressSnapshot);
}

/// Writes progress through the `log` facade.
#[derive(Debug, Default)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn update(&mut self, snapshot: &ProgressSnapshot) {
        info!("{}", format_progress(snapshot, false));
    }

    fn finish(&mut self, snapshot: &ProgressSnapshot) {
        info!("{}", format_progress(snapshot, true));
    }
}

/// Samples a [`CopyProgress`] on its own thread until finished or dropped.
/// The final snapshot is always delivered before `finish` returns.
pub struct ProgressReporter {
    done: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    pub fn spawn(
        action: ProgressAction,
        total_bytes: u64,
        progress: Arc<CopyProgress>,
        sink: Box<dyn ProgressSink>,
    ) -> Self {
        Self::spawn_with_interval(action, total_bytes, progress, sink, REPORT_INTERVAL)
    }

    pub fn spawn_with_interval(
        action: ProgressAction,
        total_bytes: u64,
        progress: Arc<CopyProgress>,
        mut sink: Box<dyn ProgressSink>,
        interval: Duration,
    ) -> Self {
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let handle = std::thread::spawn(move || loop {
            match done_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    sink.update(&progress.snapshot(action, total_bytes));
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    sink.finish(&progress.snapshot(action, total_bytes));
                    return;
                }
            }
        });
        Self {
            done: Some(done_tx),
            handle: Some(handle),
        }
    }

    pub fn finish(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("progress reporter thread panicked");
            }
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.stop();
    }
}

/// "1.5 GiB extracted, 12s elapsed, 128.0 MiB/s"
pub fn format_progress(snapshot: &ProgressSnapshot, finished: bool) -> String {
    let seconds = snapshot.elapsed.as_secs_f64();
    let rate = if seconds > 0.0 {
        format!(", {}/s", format_bytes((snapshot.bytes_processed as f64 / seconds) as u64))
    } else {
        String::new()
    };
    let percent = if snapshot.total_bytes > 0 && !finished {
        format!(
            " ({:.0}%)",
            (snapshot.bytes_processed as f64 / snapshot.total_bytes as f64 * 100.0).min(100.0)
        )
    } else {
        String::new()
    };
    if finished {
        let mut action = snapshot.action.as_str().to_string();
        if let Some(first) = action.get_mut(0..1) {
            first.make_ascii_uppercase();
        }
        format!(
            "{} {} in {}{}",
            action,
            format_bytes(snapshot.bytes_processed),
            format_duration(snapshot.elapsed),
            rate
        )
    } else {
        format!(
            "{} {}{}, {} elapsed{}",
            format_bytes(snapshot.bytes_processed),
            snapshot.action.as_str(),
            percent,
            format_duration(snapshot.elapsed),
            rate
        )
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 3600 {
        format!("{}h{:02}m{:02}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorded {
        updates: Vec<ProgressSnapshot>,
        finished: Vec<ProgressSnapshot>,
    }

    struct RecordingSink(Arc<Mutex<Recorded>>);

    impl ProgressSink for RecordingSink {
        fn update(&mut self, snapshot: &ProgressSnapshot) {
            self.0.lock().unwrap().updates.push(*snapshot);
        }

        fn finish(&mut self, snapshot: &ProgressSnapshot) {
            self.0.lock().unwrap().finished.push(*snapshot);
        }
    }

    #[test]
    fn reporter_samples_and_flushes_final_value() {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let progress = Arc::new(CopyProgress::new());
        let reporter = ProgressReporter::spawn_with_interval(
            ProgressAction::Extracted,
            100,
            progress.clone(),
            Box::new(RecordingSink(recorded.clone())),
            Duration::from_millis(5),
        );
        progress.add(40);
        std::thread::sleep(Duration::from_millis(100));
        progress.add(60);
        reporter.finish();

        let recorded = recorded.lock().unwrap();
        assert!(!recorded.updates.is_empty());
        assert_eq!(recorded.finished.len(), 1);
        assert_eq!(recorded.finished[0].bytes_processed, 100);
        assert_eq!(recorded.finished[0].action, ProgressAction::Extracted);
    }

    #[test]
    fn dropping_reporter_stops_thread() {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let progress = Arc::new(CopyProgress::new());
        {
            let _reporter = ProgressReporter::spawn(
                ProgressAction::Validated,
                0,
                progress.clone(),
                Box::new(RecordingSink(recorded.clone())),
            );
            progress.add(7);
        }
        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded.finished.len(), 1);
        assert_eq!(recorded.finished[0].bytes_processed, 7);
    }

    #[test]
    fn formats_sizes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.0 GiB");
    }

    #[test]
    fn formats_progress_lines() {
        let snapshot = ProgressSnapshot {
            action: ProgressAction::Extracted,
            bytes_processed: 2048,
            total_bytes: 4096,
            elapsed: Duration::from_secs(2),
        };
        assert_eq!(
            format_progress(&snapshot, false),
            "2.0 KiB extracted (50%), 2s elapsed, 1.0 KiB/s"
        );
        assert_eq!(
            format_progress(&snapshot, true),
            "Extracted 2.0 KiB in 2s, 1.0 KiB/s"
        );
    }
}
