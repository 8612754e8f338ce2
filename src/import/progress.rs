//! Progress reporting for ingestion runs

use super::source::IngestStats;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::Write;
use std::time::{Duration, Instant};

/// Heartbeat and summary output for one ingestion run.
///
/// On a terminal the spinner carries the heartbeat. When the spinner is
/// hidden (stderr redirected) every committed batch writes one `.` instead.
pub struct IngestProgress {
    /// Spinner (None if running in quiet mode)
    progress_bar: Option<ProgressBar>,
    /// Receives the `.` heartbeats while the spinner is hidden
    fallback: Box<dyn Write>,
    /// Start time
    start_time: Instant,
    /// Heartbeats emitted so far
    heartbeats: usize,
}

impl IngestProgress {
    /// Create a new progress tracker drawing to stderr
    pub fn new(source_name: &str, quiet: bool) -> Self {
        Self::with_output(
            source_name,
            quiet,
            ProgressDrawTarget::stderr(),
            Box::new(std::io::stderr()),
        )
    }

    fn with_output(
        source_name: &str,
        quiet: bool,
        target: ProgressDrawTarget,
        fallback: Box<dyn Write>,
    ) -> Self {
        let progress_bar = if !quiet {
            let pb = ProgressBar::with_draw_target(None, target);
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.green} [{elapsed_precise}] {pos} records {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            pb.set_message(source_name.to_string());
            Some(pb)
        } else {
            None
        };

        Self {
            progress_bar,
            fallback,
            start_time: Instant::now(),
            heartbeats: 0,
        }
    }

    /// Liveness signal after a committed batch
    pub fn batch_committed(&mut self, stats: &IngestStats) {
        let Some(ref pb) = self.progress_bar else {
            return;
        };
        self.heartbeats += 1;

        if pb.is_hidden() {
            // Write failures are ignored
            let _ = self.fallback.write_all(b".").and_then(|_| self.fallback.flush());
        } else {
            pb.set_position(stats.records_processed as u64);

            let elapsed = self.start_time.elapsed().as_secs_f64();
            let rate = if elapsed > 0.0 {
                stats.records_processed as f64 / elapsed
            } else {
                0.0
            };
            pb.set_message(format!(
                "| {} new, {} updated | {:.0} rec/s",
                stats.inserted, stats.updated, rate
            ));
        }
    }

    /// Number of heartbeats emitted
    pub fn heartbeats(&self) -> usize {
        self.heartbeats
    }

    /// Time since the run started
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Cancellation was requested; leave the spinner with a marker
    pub fn cancelled(&mut self) {
        self.end_dot_line();
        if let Some(ref pb) = self.progress_bar {
            pb.abandon_with_message("Cancelled");
        }
    }

    /// Finish the spinner
    pub fn finish(&mut self, stats: &IngestStats) {
        self.end_dot_line();
        if let Some(ref pb) = self.progress_bar {
            pb.set_position(stats.records_processed as u64);
            pb.finish_with_message(format!(
                "| done: {} new, {} updated, {} unchanged",
                stats.inserted, stats.updated, stats.unchanged
            ));
        }
    }

    /// Terminate the line of `.` heartbeats
    fn end_dot_line(&mut self) {
        let hidden = self.progress_bar.as_ref().is_some_and(|pb| pb.is_hidden());
        if hidden && self.heartbeats > 0 {
            let _ = writeln!(self.fallback);
        }
    }
}

/// Final `<count> records` and elapsed lines
pub fn print_summary(stats: &IngestStats) {
    println!("{} records", stats.records_processed);
    println!("{:.2?}", Duration::from_secs_f64(stats.elapsed_seconds));
}
