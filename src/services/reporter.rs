//! Scan report persistence
//!
//! One report per scan run, written as `scan_<timestamp>.json` with a plain
//! text summary alongside it.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use super::cleaner::ComplianceIssue;
use super::quality_evaluator::DuplicateGroup;
use super::title_resolver::TvTitleConflict;
use crate::error::{Result, SweepError};

/// Number of groups listed in the text summary
const TOP_OFFENDERS: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReportSummary {
    pub total_duplicates: usize,
    /// Non-keeper files across all duplicate groups
    pub total_files_to_delete: usize,
    pub space_to_free: u64,
}

impl ReportSummary {
    pub fn for_groups<'a>(groups: impl IntoIterator<Item = &'a DuplicateGroup>) -> Self {
        groups.into_iter().fold(Self::default(), |mut summary, group| {
            summary.total_duplicates += 1;
            summary.total_files_to_delete += group.deletion_candidates().count();
            summary.space_to_free += group.space_to_free();
            summary
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub generated_at: DateTime<Utc>,
    pub movie_duplicates: Vec<DuplicateGroup>,
    pub tv_duplicates: Vec<DuplicateGroup>,
    pub compliance_issues: Vec<ComplianceIssue>,
    pub ambiguous_tv_shows: Vec<TvTitleConflict>,
    pub summary: ReportSummary,
}

impl ScanReport {
    pub fn new(
        movie_duplicates: Vec<DuplicateGroup>,
        tv_duplicates: Vec<DuplicateGroup>,
        compliance_issues: Vec<ComplianceIssue>,
        ambiguous_tv_shows: Vec<TvTitleConflict>,
    ) -> Self {
        let summary = ReportSummary::for_groups(movie_duplicates.iter().chain(&tv_duplicates));
        Self {
            generated_at: Utc::now(),
            movie_duplicates,
            tv_duplicates,
            compliance_issues,
            ambiguous_tv_shows,
            summary,
        }
    }

    /// Every duplicate group, movies first
    pub fn all_duplicates(&self) -> impl Iterator<Item = &DuplicateGroup> {
        self.movie_duplicates.iter().chain(&self.tv_duplicates)
    }

    /// Plain text summary of the report
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Media library scan report");
        let _ = writeln!(out, "Generated: {}", self.generated_at.format("%Y-%m-%d %H:%M:%S UTC"));
        let _ = writeln!(out);
        let _ = writeln!(out, "Movie duplicate groups:  {}", self.movie_duplicates.len());
        let _ = writeln!(out, "TV duplicate groups:     {}", self.tv_duplicates.len());
        let _ = writeln!(out, "Compliance issues:       {}", self.compliance_issues.len());
        let _ = writeln!(out, "Ambiguous TV shows:      {}", self.ambiguous_tv_shows.len());
        let _ = writeln!(out, "Files to delete:         {}", self.summary.total_files_to_delete);
        let _ = writeln!(out, "Space to free:           {}", format_bytes(self.summary.space_to_free));

        let mut offenders: Vec<&DuplicateGroup> = self.all_duplicates().collect();
        offenders.sort_by(|a, b| b.space_to_free().cmp(&a.space_to_free()));
        if !offenders.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "Top offenders:");
            for group in offenders.iter().take(TOP_OFFENDERS) {
                let _ = writeln!(
                    out,
                    "  {:<50} {:>3} files  {:>10}  keep {}",
                    group.key().to_string(),
                    group.len(),
                    format_bytes(group.space_to_free()),
                    group.keeper().path.display()
                );
            }
        }

        if !self.ambiguous_tv_shows.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "Ambiguous TV shows:");
            for conflict in &self.ambiguous_tv_shows {
                let _ = writeln!(
                    out,
                    "  {} -> {} ({})",
                    conflict.folder_path.display(),
                    conflict.resolved_title,
                    conflict.reason
                );
            }
        }
        out
    }
}

/// Format bytes into a human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.1} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Paths of the files written for one report
#[derive(Debug, Clone)]
pub struct WrittenReport {
    pub json: PathBuf,
    pub text: PathBuf,
}

/// Writes reports into a directory
#[derive(Debug, Clone)]
pub struct ReportWriter {
    dir: PathBuf,
}

impl ReportWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write(&self, report: &ScanReport) -> Result<WrittenReport> {
        fs::create_dir_all(&self.dir).map_err(|e| SweepError::access(&self.dir, e))?;
        let stem = format!("scan_{}", report.generated_at.format("%Y%m%d_%H%M%S"));

        let json = self.dir.join(format!("{}.json", stem));
        fs::write(&json, serde_json::to_vec_pretty(report)?).map_err(|e| SweepError::access(&json, e))?;

        let text = self.dir.join(format!("{}.txt", stem));
        fs::write(&text, report.render_text()).map_err(|e| SweepError::access(&text, e))?;

        info!(
            path = %json.display(),
            duplicates = report.summary.total_duplicates,
            space_to_free = report.summary.space_to_free,
            "Scan report written"
        );
        Ok(WrittenReport { json, text })
    }
}
