use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use winstick_content::{format_progress, ProgressAction, ProgressSink, ProgressSnapshot};

/// Drives an `indicatif` bar from the content engine's reporter thread.
pub struct BarSink {
    bar: ProgressBar,
}

impl BarSink {
    pub fn new(action: ProgressAction) -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(bar_style());
        Self::with_bar(bar, action)
    }

    fn with_bar(bar: ProgressBar, action: ProgressAction) -> Self {
        bar.set_message(action.as_str());
        Self { bar }
    }

    fn show(&self, snapshot: &ProgressSnapshot) {
        self.bar.set_length(snapshot.total_bytes);
        self.bar.set_position(snapshot.bytes_processed);
    }
}

impl ProgressSink for BarSink {
    fn update(&mut self, snapshot: &ProgressSnapshot) {
        self.show(snapshot);
    }

    fn finish(&mut self, snapshot: &ProgressSnapshot) {
        self.show(snapshot);
        self.bar.finish_and_clear();
        info!("{}", format_progress(snapshot, true));
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{msg:>9} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec} ETA {eta}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("=> ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn bar_follows_snapshots() {
        let bar = ProgressBar::hidden();
        let mut sink = BarSink::with_bar(bar.clone(), ProgressAction::Validated);
        let mut snapshot = ProgressSnapshot {
            action: ProgressAction::Validated,
            bytes_processed: 10,
            total_bytes: 40,
            elapsed: Duration::from_secs(1),
        };
        sink.update(&snapshot);
        assert_eq!(bar.position(), 10);
        assert_eq!(bar.length(), Some(40));
        assert_eq!(bar.message(), "validated");

        snapshot.bytes_processed = 40;
        sink.finish(&snapshot);
        assert_eq!(bar.position(), 40);
        assert!(bar.is_finished());
    }
}
