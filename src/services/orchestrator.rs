//! Scan orchestration
//!
//! Runs the stages of a scan in order: movies, TV, compliance, title
//! resolution, report. Within a stage each library root is walked on its
//! own blocking task; results are merged in root order once every task has
//! finished. Cancellation is observed inside each walk and again between
//! stages.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::cleaner::ComplianceIssue;
use super::progress::{Operation, ProgressConfig, ProgressHub, ProgressReporter, Stage};
use super::quality_evaluator::{self, DuplicateGroup};
use super::reporter::ScanReport;
use super::scanner::{MovieDetector, TvDetector};
use super::title_resolver::{LookupCache, MetadataLookup, MetadataVerifier, TitleResolver, TvTitleConflict};
use crate::config::Config;
use crate::error::{Result, SweepError};

/// Finds paths that break the library naming convention
pub trait ComplianceChecker: Send + Sync {
    /// Check every root, ignoring paths in `exclude`
    fn check(&self, roots: &[PathBuf], exclude: &HashSet<PathBuf>) -> Vec<ComplianceIssue>;
}

/// Drives a full scan and produces a [`ScanReport`]
pub struct ScanCoordinator {
    config: Config,
    lookup: Option<Arc<dyn MetadataLookup>>,
    compliance: Option<Arc<dyn ComplianceChecker>>,
}

impl ScanCoordinator {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            lookup: None,
            compliance: None,
        }
    }

    /// Verify ambiguous TV titles against a metadata capability
    pub fn with_lookup(mut self, lookup: Arc<dyn MetadataLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    pub fn with_compliance(mut self, checker: Arc<dyn ComplianceChecker>) -> Self {
        self.compliance = Some(checker);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn reporter(&self, hub: &ProgressHub, operation: Operation) -> ProgressReporter {
        hub.reporter(
            operation,
            ProgressConfig {
                level: self.config.log_level,
                ..Default::default()
            },
        )
    }

    /// Run every stage. The hub is closed when this returns, whatever the
    /// outcome.
    pub async fn run(&self, token: CancellationToken, hub: ProgressHub) -> Result<ScanReport> {
        let outcome = self.run_stages(&token, &hub).await;
        hub.close();

        match &outcome {
            Ok(report) => info!(
                duplicates = report.summary.total_duplicates,
                files_to_delete = report.summary.total_files_to_delete,
                space_to_free = report.summary.space_to_free,
                ambiguous_shows = report.ambiguous_tv_shows.len(),
                "Scan finished"
            ),
            Err(e) if e.is_cancelled() => warn!(error = %e, "Scan stopped"),
            Err(e) => error!(error = %e, "Scan failed"),
        }
        outcome
    }

    async fn run_stages(&self, token: &CancellationToken, hub: &ProgressHub) -> Result<ScanReport> {
        let threshold = self.config.similarity_threshold;

        checkpoint(token, "movie scan")?;
        let movie_reporter = self.reporter(hub, Operation::MovieScan);
        movie_reporter.start(0, "Scanning movie libraries");
        let detector = MovieDetector::new(threshold);
        let keyed = {
            let detector = detector.clone();
            scan_roots(&self.config.movie_paths, token, &movie_reporter, move |root, token, reporter| {
                detector.scan_root(root, token, reporter)
            })
            .await?
        };
        movie_reporter.stage(Stage::Analyzing, "Grouping movies");
        let movie_duplicates = quality_evaluator::rank_all(detector.group(keyed, &movie_reporter));
        movie_reporter.complete(format!("{} movie duplicate groups", movie_duplicates.len()));

        checkpoint(token, "tv scan")?;
        let tv_reporter = self.reporter(hub, Operation::TvScan);
        tv_reporter.start(0, "Scanning TV libraries");
        let tv_detector = TvDetector::new();
        let keyed = {
            let tv_detector = tv_detector.clone();
            scan_roots(&self.config.tv_paths, token, &tv_reporter, move |root, token, reporter| {
                tv_detector.scan_root(root, token, reporter)
            })
            .await?
        };
        tv_reporter.stage(Stage::Analyzing, "Grouping episodes");
        let tv_duplicates = quality_evaluator::rank_all(tv_detector.group(keyed, &tv_reporter));
        tv_reporter.complete(format!("{} episode duplicate groups", tv_duplicates.len()));

        checkpoint(token, "compliance scan")?;
        let compliance_issues = self
            .check_compliance(hub, movie_duplicates.iter().chain(&tv_duplicates))
            .await?;

        checkpoint(token, "title resolution")?;
        let ambiguous_tv_shows = self.resolve_titles(token, hub).await?;

        checkpoint(token, "report")?;
        let report_reporter = self.reporter(hub, Operation::Report);
        let report = ScanReport::new(movie_duplicates, tv_duplicates, compliance_issues, ambiguous_tv_shows);
        report_reporter.complete(format!(
            "{} duplicate groups, {} files to delete",
            report.summary.total_duplicates, report.summary.total_files_to_delete
        ));
        Ok(report)
    }

    async fn check_compliance<'a>(
        &self,
        hub: &ProgressHub,
        duplicates: impl Iterator<Item = &'a DuplicateGroup>,
    ) -> Result<Vec<ComplianceIssue>> {
        let Some(checker) = self.compliance.clone() else {
            return Ok(Vec::new());
        };
        let reporter = self.reporter(hub, Operation::ComplianceScan);
        reporter.start(0, "Checking naming compliance");

        let exclude: HashSet<PathBuf> = duplicates
            .flat_map(|group| group.deletion_candidates().map(|f| f.path.clone()))
            .collect();
        let roots = self.config.all_roots();
        let issues = tokio::task::spawn_blocking(move || checker.check(&roots, &exclude))
            .await
            .map_err(|e| SweepError::Task(e.to_string()))?;

        reporter.issues_found(issues.len() as u64);
        reporter.complete(format!("{} compliance issues", issues.len()));
        Ok(issues)
    }

    async fn resolve_titles(&self, token: &CancellationToken, hub: &ProgressHub) -> Result<Vec<TvTitleConflict>> {
        let reporter = self.reporter(hub, Operation::TitleResolution);
        reporter.start(0, "Resolving TV show titles");

        let resolver = TitleResolver::new(self.config.similarity_threshold);
        let mut conflicts = scan_roots(&self.config.tv_paths, token, &reporter, move |root, token, reporter| {
            resolver.scan_root(root, token, reporter)
        })
        .await?;

        if let Some(lookup) = &self.lookup
            && !conflicts.is_empty()
        {
            reporter.stage(Stage::Analyzing, "Verifying titles");
            let cache = Arc::new(LookupCache::new());
            let verifier = MetadataVerifier::new(lookup.clone(), cache, self.config.lookup.clone());
            TitleResolver::verify_all(&mut conflicts, &verifier, token, &reporter).await?;
        }

        reporter.complete(format!("{} ambiguous shows", conflicts.len()));
        Ok(conflicts)
    }
}

fn checkpoint(token: &CancellationToken, stage: &str) -> Result<()> {
    if token.is_cancelled() {
        info!(stage = stage, "Cancelled before stage");
        return Err(SweepError::cancelled(stage));
    }
    Ok(())
}

/// Run `scan` for every root on its own blocking task and concatenate the
/// results in root order. The first failing root, in root order, wins.
async fn scan_roots<T, F>(
    roots: &[PathBuf],
    token: &CancellationToken,
    reporter: &ProgressReporter,
    scan: F,
) -> Result<Vec<T>>
where
    T: Send + 'static,
    F: Fn(&Path, &CancellationToken, &ProgressReporter) -> Result<Vec<T>> + Clone + Send + 'static,
{
    let handles = roots.iter().map(|root| {
        let scan = scan.clone();
        let root = root.clone();
        let token = token.clone();
        let reporter = reporter.clone();
        tokio::task::spawn_blocking(move || scan(&root, &token, &reporter))
    });

    let mut merged = Vec::new();
    for joined in join_all(handles).await {
        let items = joined.map_err(|e| SweepError::Task(e.to_string()))??;
        merged.extend(items);
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::cleaner::SuggestedAction;
    use crate::services::progress::ScanProgress;
    use assert_matches::assert_matches;
    use std::fs;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"data").unwrap();
    }

    async fn count_events(rx: flume::Receiver<ScanProgress>) -> usize {
        let mut count = 0;
        while rx.recv_async().await.is_ok() {
            count += 1;
        }
        count
    }

    fn config(movies: Vec<PathBuf>, tv: Vec<PathBuf>) -> Config {
        Config {
            movie_paths: movies,
            tv_paths: tv,
            ..Default::default()
        }
    }

    struct FlagEverything;

    impl ComplianceChecker for FlagEverything {
        fn check(&self, roots: &[PathBuf], exclude: &HashSet<PathBuf>) -> Vec<ComplianceIssue> {
            roots
                .iter()
                .flat_map(|root| walkdir::WalkDir::new(root).into_iter().filter_map(|e| e.ok()))
                .filter(|e| e.file_type().is_file() && !exclude.contains(e.path()))
                .map(|e| ComplianceIssue {
                    path: e.path().to_path_buf(),
                    issue_type: "test".into(),
                    problem: "flagged".into(),
                    suggested_path: e.path().to_path_buf(),
                    suggested_action: SuggestedAction::ManualReview,
                })
                .collect()
        }
    }

    #[tokio::test]
    async fn test_run_merges_roots_and_closes_stream() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        touch(a.path(), "Heat (1995)/Heat.1995.1080p.mkv");
        touch(b.path(), "Heat (1995)/Heat.1995.720p.mkv");

        let (hub, rx) = ProgressHub::new(64);
        let drain = tokio::spawn(count_events(rx));

        let coordinator = ScanCoordinator::new(config(vec![a.path().into(), b.path().into()], Vec::new()))
            .with_compliance(Arc::new(FlagEverything));
        let report = coordinator.run(CancellationToken::new(), hub).await.unwrap();

        assert_eq!(report.movie_duplicates.len(), 1);
        assert_eq!(report.movie_duplicates[0].len(), 2);
        assert_eq!(
            report.movie_duplicates[0].keeper().path,
            a.path().join("Heat (1995)/Heat.1995.1080p.mkv")
        );
        assert_eq!(report.compliance_issues.len(), 1);
        assert!(drain.await.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_cancelled_run_reports_cancellation() {
        let a = tempfile::tempdir().unwrap();
        touch(a.path(), "Heat (1995)/Heat.1995.mkv");
        let token = CancellationToken::new();
        token.cancel();

        let (hub, rx) = ProgressHub::new(8);
        let result = ScanCoordinator::new(config(vec![a.path().into()], Vec::new()))
            .run(token, hub)
            .await;
        assert_matches!(result, Err(SweepError::Cancelled { .. }));
        assert!(rx.recv_async().await.is_err());
    }

    #[tokio::test]
    async fn test_missing_root_fails_stage() {
        let a = tempfile::tempdir().unwrap();
        let (hub, _rx) = ProgressHub::new(8);
        let result = ScanCoordinator::new(config(Vec::new(), vec![a.path().join("missing")]))
            .run(CancellationToken::new(), hub)
            .await;
        assert_matches!(result, Err(SweepError::Access { .. }));
    }
}
