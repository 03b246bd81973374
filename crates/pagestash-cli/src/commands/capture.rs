//! Capture a page into an archive

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use colored::Colorize;
use is_terminal::IsTerminal;
use pagestash_core::orchestrator::CaptureOverrides;
use pagestash_core::{CaptureOrchestrator, CaptureOutcome, Config};
use serde::Serialize;
use tracing::info;

use crate::cli::CaptureArgs;
use crate::output::{OutputFormat, TerminalSurface, format_bytes, print_json};

/// Summary printed after a successful capture
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureSummary {
    /// Where the archive was written
    pub archive_path: PathBuf,
    /// Archive size on disk
    pub size_bytes: u64,
    /// Resources stored in the archive
    pub resource_count: usize,
    /// Resources that failed and were left out
    pub failed_count: usize,
    /// Launch to archive written
    pub duration_ms: u64,
    /// Requested URL
    pub source_url: String,
    /// Captured document URL
    pub final_url: String,
    /// Page title
    pub title: Option<String>,
}

impl CaptureSummary {
    fn from_outcome(outcome: &CaptureOutcome) -> Self {
        let result = &outcome.result;
        let size_bytes = std::fs::metadata(&result.archive_path).map_or(0, |m| m.len());
        Self {
            archive_path: result.archive_path.clone(),
            size_bytes,
            resource_count: result.resource_count,
            failed_count: result.failed_count,
            duration_ms: result.duration_ms,
            source_url: result.source_url.to_string(),
            final_url: result.final_url.to_string(),
            title: result.title.clone(),
        }
    }
}

/// Fold command-line flags into the loaded configuration.
pub fn apply_overrides(config: &mut Config, args: &CaptureArgs) {
    let capture = &mut config.capture;
    if let Some(ms) = args.quiet_period_ms {
        capture.quiet_period_ms = ms;
    }
    if let Some(secs) = args.timeout_secs {
        capture.capture_timeout_secs = secs;
    }
    if args.no_amp {
        capture.prefer_amp = false;
    }
    if !args.modes.is_empty() {
        capture.profile_modes.clone_from(&args.modes);
    }
}

/// Execute the capture command
pub async fn execute_capture(mut config: Config, args: CaptureArgs, quiet: bool) -> Result<()> {
    apply_overrides(&mut config, &args);
    let orchestrator =
        CaptureOrchestrator::from_config(config).context("Invalid capture configuration")?;

    let visible = !quiet && !args.format.is_machine() && std::io::stderr().is_terminal();
    let surface = Arc::new(TerminalSurface::new(visible));
    let overrides = CaptureOverrides {
        options: None,
        destination: args.out.clone(),
    };

    info!("Capturing {}", args.url);
    let outcome = tokio::select! {
        outcome = orchestrator.start_capture_with(&args.url, surface.clone(), overrides) => {
            outcome.with_context(|| format!("Failed to capture {}", args.url))?
        },
        _ = tokio::signal::ctrl_c() => {
            bail!("Capture of {} interrupted", args.url);
        },
    };

    let summary = CaptureSummary::from_outcome(&outcome);
    match args.format {
        OutputFormat::Json => print_json(&summary)?,
        OutputFormat::Text => print_text_summary(&summary, quiet),
    }
    Ok(())
}

fn print_text_summary(summary: &CaptureSummary, quiet: bool) {
    if quiet {
        println!("{}", summary.archive_path.display());
        return;
    }

    println!(
        "{} {}",
        "✓".green(),
        summary.title.as_deref().unwrap_or(&summary.final_url).bold()
    );
    println!("  Archive:   {}", summary.archive_path.display());
    println!(
        "  Resources: {} ({})",
        summary.resource_count,
        format_bytes(summary.size_bytes)
    );
    if summary.failed_count > 0 {
        println!(
            "  {}",
            format!("{} resource(s) could not be captured", summary.failed_count).yellow()
        );
    }
    if summary.final_url != summary.source_url {
        println!("  Captured:  {}", summary.final_url);
    }
    println!("  Took:      {} ms", summary.duration_ms);
}
