//! Terminal rendering surface

use std::time::Duration;

use async_trait::async_trait;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use pagestash_core::surface::RenderSurface;
use pagestash_core::tracker::TrackerState;
use pagestash_core::{ArchiveHandle, SurfaceUpdate};

/// Shows capture progress as a spinner on stderr.
///
/// The progress view "loads" by starting the spinner; each progress event
/// updates its message, and a terminal update stops it.
pub struct TerminalSurface {
    spinner: ProgressBar,
}

impl TerminalSurface {
    /// Create a surface; when `visible` is false nothing is drawn.
    pub fn new(visible: bool) -> Self {
        let spinner = if visible {
            ProgressBar::new_spinner()
        } else {
            ProgressBar::hidden()
        };
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        Self { spinner }
    }
}

#[async_trait]
impl RenderSurface for TerminalSurface {
    fn id(&self) -> &str {
        "terminal"
    }

    async fn load_url(&self, url: &str) -> pagestash_core::Result<()> {
        tracing::debug!("Progress view {} rendered in terminal", url);
        self.spinner.set_message("Launching browser");
        self.spinner.enable_steady_tick(Duration::from_millis(120));
        Ok(())
    }

    fn push(&self, update: SurfaceUpdate) {
        match update {
            SurfaceUpdate::Progress(event) => {
                let state = match event.state {
                    TrackerState::Active => "loading",
                    TrackerState::Idle => "idle",
                };
                let failed = if event.failed > 0 {
                    format!(", {} failed", event.failed).yellow().to_string()
                } else {
                    String::new()
                };
                self.spinner.set_message(format!(
                    "{state}: {} pending, {} done{failed}",
                    event.pending_count, event.completed
                ));
            },
            SurfaceUpdate::Failed { stage, message } => {
                self.spinner.abandon_with_message(format!(
                    "{} during {stage}: {message}",
                    "Capture failed".red()
                ));
            },
            SurfaceUpdate::Completed { .. } => self.spinner.finish_and_clear(),
        }
    }

    fn bind_archive(&self, archive: ArchiveHandle) {
        tracing::debug!(
            "Archive {} ready for replay",
            archive.archive().source_path().display()
        );
    }
}
