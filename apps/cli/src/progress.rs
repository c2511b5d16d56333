//! Progress bar for a single fetch, fed from engine callbacks

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

/// Progress bar driven by `onprogress`; safe to update from any thread
#[derive(Clone)]
pub struct FetchProgress {
    bar: ProgressBar,
}

impl FetchProgress {
    pub fn new(label: &str, visible: bool) -> Self {
        let bar = if visible {
            ProgressBar::new_spinner()
        } else {
            ProgressBar::hidden()
        };

        bar.set_style(spinner_style());
        bar.set_message(label.to_string());

        Self { bar }
    }

    /// Record `received` bytes out of `total`
    pub fn update(&self, received: u64, total: Option<u64>) {
        match total {
            Some(total) if total > 0 => {
                if self.bar.length() != Some(total) {
                    self.bar.set_length(total);
                    self.bar.set_style(bar_style());
                }
            }
            _ => self.bar.tick(),
        }
        self.bar.set_position(received);
    }

    pub fn finish(&self, status: u16) {
        self.bar.finish_with_message(format!(
            "{} Done ({})",
            style("✓").green().bold(),
            status
        ));
    }

    pub fn fail(&self, reason: &str) {
        self.bar.abandon_with_message(format!(
            "{} Failed: {}",
            style("✗").red().bold(),
            reason
        ));
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓▒░  ")
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.green} [{elapsed_precise}] {bytes} ({bytes_per_sec}) {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}
