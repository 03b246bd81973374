//! Show the contents of an archive

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use colored::Colorize;
use pagestash_core::ArchiveManifest;
use pagestash_core::ArchiveReader;
use serde::Serialize;

use crate::output::{OutputFormat, format_bytes, print_json};

/// Archive details
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveReport {
    /// Archive file
    pub path: PathBuf,
    /// Size on disk
    pub size_bytes: u64,
    /// Uncompressed payload bytes
    pub payload_bytes: u64,
    /// Table of contents
    pub manifest: ArchiveManifest,
}

/// Read an archive's manifest.
pub fn read_report(path: &Path) -> Result<ArchiveReport> {
    let reader = ArchiveReader::open(path)
        .with_context(|| format!("Failed to open archive {}", path.display()))?;
    let size_bytes = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .len();
    let manifest = reader.manifest().clone();
    Ok(ArchiveReport {
        path: path.to_path_buf(),
        size_bytes,
        payload_bytes: manifest.total_size(),
        manifest,
    })
}

/// Execute the inspect command
pub fn execute_inspect(path: &Path, format: OutputFormat) -> Result<()> {
    let report = read_report(path)?;
    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Text => print_text_report(&report),
    }
    Ok(())
}

fn print_text_report(report: &ArchiveReport) {
    let manifest = &report.manifest;
    println!(
        "{}",
        manifest.title.as_deref().unwrap_or("(untitled)").bold()
    );
    println!("Source:    {}", manifest.source_url);
    if manifest.final_url != manifest.source_url {
        println!("Captured:  {}", manifest.final_url);
    }
    println!("When:      {}", manifest.captured_at.to_rfc3339());
    println!("Profile:   {}", manifest.profile);
    println!(
        "Size:      {} on disk, {} uncompressed",
        format_bytes(report.size_bytes),
        format_bytes(report.payload_bytes)
    );
    println!();

    println!("{} resources", manifest.resources.len());
    for entry in &manifest.resources {
        let kind = serde_json::to_value(entry.kind)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        println!(
            "  {:<10} {:>10}  {}",
            kind.dimmed(),
            format_bytes(entry.size),
            entry.url
        );
    }

    if !manifest.failures.is_empty() {
        println!();
        println!("{}", format!("{} failed", manifest.failures.len()).yellow());
        for failure in &manifest.failures {
            println!("  {}  {}", failure.url, failure.reason.dimmed());
        }
    }
}
