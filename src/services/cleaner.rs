//! Safe cleaner
//!
//! Applies duplicate deletions, compliance fixes and show renames behind a
//! fixed set of safety checks:
//!
//! - targets must be absolute without `..`, are resolved through symlinks
//!   and must not land inside a protected path or too close to the root
//! - a duplicate that is the keeper's own data (symlink or hard link) is
//!   never deleted
//! - cumulative deleted bytes never exceed the configured cap
//! - renamed files keep their uid/gid
//!
//! A safety violation abandons the rest of the run. Any other per-item
//! failure is recorded and the batch carries on. Cancellation stops at the
//! next file boundary and returns what was already done. Dry runs take every
//! decision a real run would and log the same operations, but touch nothing.

use std::fs::{self, Metadata};
use std::io;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backup::{BackupSnapshot, OperationRecord};
use super::filename_parser;
use super::progress::{ProgressReporter, Stage};
use super::quality_evaluator::DuplicateGroup;
use super::walker::{LibraryWalk, WalkEvent};
use crate::error::{Result, SafetyViolation, SweepError};

/// System locations that are never touched
pub const DEFAULT_PROTECTED_PATHS: &[&str] = &[
    "/usr", "/etc", "/bin", "/sbin", "/boot", "/sys", "/proc", "/dev", "/run", "/lib", "/lib64",
    "/var", "/opt", "/srv", "/root",
];

/// Minimum number of normal path components a target must have
pub const DEFAULT_MIN_DEPTH: usize = 3;

/// Safety settings for a cleaner run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    pub protected_paths: Vec<PathBuf>,
    /// Cumulative byte cap for deletions in one run, 0 for no cap
    pub max_delete_bytes: u64,
    pub min_depth: usize,
    pub dry_run: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            protected_paths: DEFAULT_PROTECTED_PATHS.iter().map(PathBuf::from).collect(),
            max_delete_bytes: 0,
            min_depth: DEFAULT_MIN_DEPTH,
            dry_run: true,
        }
    }
}

/// Kind of filesystem mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Delete,
    Rename,
    Move,
}

/// One entry of the operation log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OperationKind,
    pub source: PathBuf,
    pub destination: Option<PathBuf>,
    pub timestamp: DateTime<Utc>,
    /// False for dry runs and failed attempts
    pub completed: bool,
}

/// How a compliance issue should be fixed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedAction {
    Rename,
    Reorganize,
    ManualReview,
}

/// A path that does not follow the library naming convention
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceIssue {
    pub path: PathBuf,
    pub issue_type: String,
    pub problem: String,
    pub suggested_path: PathBuf,
    pub suggested_action: SuggestedAction,
}

/// Aggregate outcome of a cleaner run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanResult {
    pub duplicates_deleted: usize,
    pub compliance_fixed: usize,
    pub space_freed: u64,
    pub errors: Vec<String>,
    pub operations: Vec<Operation>,
    /// Set when the run was cut short by a safety rule
    pub safety_violation: Option<SafetyViolation>,
    /// Set when the run stopped early on cancellation
    pub cancelled: bool,
    pub dry_run: bool,
}

impl CleanResult {
    pub fn is_aborted(&self) -> bool {
        self.safety_violation.is_some()
    }

    /// The cancellation as an error, for callers that treat it as one
    pub fn cancellation_error(&self) -> Option<SweepError> {
        self.cancelled.then(|| SweepError::cancelled("cleanup"))
    }

    /// Per-item failures as a partial-operation error, if there were any
    pub fn partial_error(&self) -> Option<SweepError> {
        if self.errors.is_empty() {
            return None;
        }
        Some(SweepError::PartialOperation {
            failed: self.errors.len(),
            total: self.operations.len() + self.errors.len(),
        })
    }
}

/// Audit record for one file or folder rename
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameResult {
    pub old_path: PathBuf,
    pub new_path: PathBuf,
    pub is_folder: bool,
    pub success: bool,
    pub error: Option<String>,
}

/// Outcome of renaming one show across all base paths
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShowRename {
    pub renames: Vec<RenameResult>,
    /// Set when a safety rule stopped the remaining renames
    pub safety_violation: Option<SafetyViolation>,
}

impl ShowRename {
    pub fn is_aborted(&self) -> bool {
        self.safety_violation.is_some()
    }

    pub fn failed(&self) -> usize {
        self.renames.iter().filter(|r| !r.success).count()
    }
}

/// Applies cleanups under a [`SafetyConfig`]
#[derive(Debug, Clone)]
pub struct Cleaner {
    config: SafetyConfig,
    /// Library roots, used as the upper bound for empty-folder removal
    roots: Vec<PathBuf>,
}

impl Cleaner {
    pub fn new(config: SafetyConfig, roots: Vec<PathBuf>) -> Self {
        Self { config, roots }
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    pub fn is_dry_run(&self) -> bool {
        self.config.dry_run
    }

    /// Check a target against the protected set and depth rule.
    ///
    /// Returns the resolved path. Targets that do not exist yet are resolved
    /// through their nearest existing ancestor.
    pub fn check_target(&self, path: &Path) -> std::result::Result<PathBuf, SafetyViolation> {
        if !path.is_absolute() || path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(SafetyViolation::UnsafePath {
                path: path.to_path_buf(),
            });
        }
        let resolved = resolve(path);

        for protected in &self.config.protected_paths {
            let canonical = protected.canonicalize().unwrap_or_else(|_| protected.clone());
            if path.starts_with(protected)
                || resolved.starts_with(protected)
                || resolved.starts_with(&canonical)
            {
                return Err(SafetyViolation::ProtectedPath {
                    path: path.to_path_buf(),
                    protected: protected.clone(),
                });
            }
        }

        let depth = resolved
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .count();
        if depth < self.config.min_depth {
            return Err(SafetyViolation::TooShallow {
                path: path.to_path_buf(),
                depth,
                min_depth: self.config.min_depth,
            });
        }

        Ok(resolved)
    }

    /// Delete duplicate candidates and fix compliance issues.
    ///
    /// Groups are processed one at a time in order. When `journal` is given,
    /// every real mutation is recorded into it for later revert. A cancelled
    /// run still returns `Ok` with `cancelled` set and the work done so far.
    pub fn clean(
        &self,
        groups: &[DuplicateGroup],
        issues: &[ComplianceIssue],
        token: &CancellationToken,
        reporter: &ProgressReporter,
        mut journal: Option<&mut BackupSnapshot>,
    ) -> Result<CleanResult> {
        let mut result = CleanResult {
            dry_run: self.config.dry_run,
            ..Default::default()
        };
        let total = groups.iter().map(|g| g.len().saturating_sub(1)).sum::<usize>() + issues.len();
        reporter.start(total as u64, "Cleaning library");
        info!(
            groups = groups.len(),
            issues = issues.len(),
            dry_run = self.config.dry_run,
            "Starting cleanup"
        );

        let mut done = 0u64;
        reporter.stage(Stage::Applying, "Removing duplicates");
        'groups: for group in groups {
            for file in group.deletion_candidates() {
                if token.is_cancelled() {
                    result.cancelled = true;
                    break 'groups;
                }
                let keeper = &group.keeper().path;
                if &file.path == keeper {
                    continue;
                }
                if same_file(&file.path, keeper) {
                    let message = format!("{}: same file as keeper {}", file.path.display(), keeper.display());
                    warn!(path = %file.path.display(), keeper = %keeper.display(), "Duplicate shares data with keeper, skipping");
                    reporter.warn(format!("Skipped {}", message));
                    result.errors.push(message);
                    done += 1;
                    reporter.update(done, format!("Skipped {}", file.path.display()));
                    continue;
                }

                match self.delete_file(&file.path, file.size, &mut result, journal.as_deref_mut()) {
                    Ok(()) => result.duplicates_deleted += 1,
                    Err(SweepError::Safety(violation)) => {
                        self.abort(&mut result, violation, reporter);
                        break 'groups;
                    }
                    Err(e) => {
                        warn!(path = %file.path.display(), error = %e, "Failed to delete duplicate");
                        reporter.error(format!("Failed to delete {}: {}", file.path.display(), e));
                        result.errors.push(format!("{}: {}", file.path.display(), e));
                    }
                }
                done += 1;
                reporter.update(done, format!("Processed {}", file.path.display()));
            }
        }

        if !result.is_aborted() && !result.cancelled {
            reporter.stage(Stage::Applying, "Fixing compliance issues");
            for issue in issues {
                if token.is_cancelled() {
                    result.cancelled = true;
                    break;
                }

                match self.fix_issue(issue, &mut result, journal.as_deref_mut()) {
                    Ok(true) => result.compliance_fixed += 1,
                    Ok(false) => {}
                    Err(SweepError::Safety(violation)) => {
                        self.abort(&mut result, violation, reporter);
                        break;
                    }
                    Err(e) => {
                        warn!(path = %issue.path.display(), error = %e, "Failed to fix compliance issue");
                        reporter.error(format!("Failed to fix {}: {}", issue.path.display(), e));
                        result.errors.push(format!("{}: {}", issue.path.display(), e));
                    }
                }
                done += 1;
                reporter.update(done, format!("Processed {}", issue.path.display()));
            }
        }

        info!(
            deleted = result.duplicates_deleted,
            fixed = result.compliance_fixed,
            space_freed = result.space_freed,
            errors = result.errors.len(),
            aborted = result.is_aborted(),
            cancelled = result.cancelled,
            "Cleanup finished"
        );
        if result.cancelled {
            reporter.warn("Cleanup cancelled");
        }
        reporter.complete(format!(
            "Deleted {} duplicates, fixed {} issues",
            result.duplicates_deleted, result.compliance_fixed
        ));
        Ok(result)
    }

    fn abort(&self, result: &mut CleanResult, violation: SafetyViolation, reporter: &ProgressReporter) {
        warn!(violation = %violation, "Safety violation, abandoning remaining work");
        reporter.critical(format!("Safety violation: {}", violation));
        result.errors.push(violation.to_string());
        result.safety_violation = Some(violation);
    }

    fn delete_file(
        &self,
        path: &Path,
        size: u64,
        result: &mut CleanResult,
        journal: Option<&mut BackupSnapshot>,
    ) -> Result<()> {
        self.check_target(path)?;

        let cap = self.config.max_delete_bytes;
        let attempted = result.space_freed + size;
        if cap > 0 && attempted > cap {
            return Err(SafetyViolation::SizeCapExceeded { attempted, cap }.into());
        }

        if self.config.dry_run {
            debug!(path = %path.display(), size = size, "Dry run: would delete");
            result.operations.push(operation(OperationKind::Delete, path, None, false));
            result.space_freed = attempted;
            return Ok(());
        }

        let outcome = fs::remove_file(path);
        record(journal, OperationKind::Delete, path, None, &outcome);
        outcome.map_err(|e| SweepError::access(path, e))?;

        info!(path = %path.display(), size = size, "Deleted duplicate");
        result.operations.push(operation(OperationKind::Delete, path, None, true));
        result.space_freed = attempted;
        self.remove_empty_parents(path);
        Ok(())
    }

    /// Apply one compliance fix. `Ok(false)` means the issue was left alone.
    fn fix_issue(
        &self,
        issue: &ComplianceIssue,
        result: &mut CleanResult,
        journal: Option<&mut BackupSnapshot>,
    ) -> Result<bool> {
        let kind = match issue.suggested_action {
            SuggestedAction::ManualReview => {
                debug!(path = %issue.path.display(), "Manual review required, skipping");
                result.errors.push(format!(
                    "{}: manual review required ({})",
                    issue.path.display(),
                    issue.problem
                ));
                return Ok(false);
            }
            SuggestedAction::Rename => OperationKind::Rename,
            SuggestedAction::Reorganize => OperationKind::Move,
        };

        self.move_path(&issue.path, &issue.suggested_path, kind, result, journal)?;
        self.remove_empty_parents(&issue.path);
        Ok(true)
    }

    /// Rename or move a path, keeping its owner and refusing to overwrite
    fn move_path(
        &self,
        from: &Path,
        to: &Path,
        kind: OperationKind,
        result: &mut CleanResult,
        journal: Option<&mut BackupSnapshot>,
    ) -> Result<()> {
        self.check_target(from)?;
        self.check_target(to)?;

        if to.exists() {
            return Err(SweepError::Validation(format!(
                "destination already exists: {}",
                to.display()
            )));
        }

        if self.config.dry_run {
            debug!(from = %from.display(), to = %to.display(), "Dry run: would move");
            result.operations.push(operation(kind, from, Some(to), false));
            return Ok(());
        }

        let outcome = rename_preserving_owner(from, to);
        record(journal, kind, from, Some(to), &outcome);
        outcome.map_err(|e| SweepError::access(from, e))?;

        info!(from = %from.display(), to = %to.display(), "Moved file");
        result.operations.push(operation(kind, from, Some(to), true));
        Ok(())
    }

    /// Rename a show's episode files, then its folder.
    ///
    /// Every folder directly under a base path whose title (ignoring any
    /// `(YYYY)`) matches `old_title` is renewed. Files inside are renamed
    /// first so a failed folder rename still leaves correctly named files.
    /// A safety violation stops every rename after it.
    pub fn rename_show(
        &self,
        base_paths: &[PathBuf],
        old_title: &str,
        new_title: &str,
        mut journal: Option<&mut BackupSnapshot>,
    ) -> Result<ShowRename> {
        let new_title = new_title.trim();
        if new_title.is_empty() || !sanitize_filename::is_sanitized(new_title) {
            return Err(SweepError::Validation(format!(
                "invalid show title: '{}'",
                new_title
            )));
        }

        let mut outcome = ShowRename::default();
        'bases: for base in base_paths {
            let entries = fs::read_dir(base).map_err(|e| SweepError::access(base, e))?;
            let mut show_dirs: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
                .map(|entry| entry.path())
                .filter(|path| {
                    path.file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| filename_parser::extract_show_title(n).0)
                        .is_some_and(|title| title.to_lowercase() == old_title.trim().to_lowercase())
                })
                .collect();
            show_dirs.sort();

            for show_dir in show_dirs {
                self.rename_episodes(&show_dir, new_title, &mut outcome, journal.as_deref_mut());
                if outcome.is_aborted() {
                    break 'bases;
                }
                self.rename_show_folder(&show_dir, new_title, &mut outcome, journal.as_deref_mut());
                if outcome.is_aborted() {
                    break 'bases;
                }
            }
        }

        info!(
            old_title = old_title,
            new_title = new_title,
            renamed = outcome.renames.len() - outcome.failed(),
            failed = outcome.failed(),
            aborted = outcome.is_aborted(),
            "Show rename finished"
        );
        Ok(outcome)
    }

    fn rename_episodes(
        &self,
        show_dir: &Path,
        new_title: &str,
        outcome: &mut ShowRename,
        mut journal: Option<&mut BackupSnapshot>,
    ) {
        let files: Vec<PathBuf> = LibraryWalk::new(show_dir)
            .filter_map(|event| match event {
                WalkEvent::File { path, .. } if filename_parser::is_video_file(&path) => Some(path),
                WalkEvent::Error { path, error, .. } => {
                    warn!(path = ?path, error = %error, "Skipping unreadable entry during rename");
                    None
                }
                _ => None,
            })
            .collect();

        for old_path in files {
            let Some(new_name) = old_path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| filename_parser::retitle_episode(n, new_title))
            else {
                continue;
            };
            let new_path = old_path.with_file_name(&new_name);
            if new_path == old_path {
                continue;
            }
            self.rename_one(&old_path, &new_path, false, outcome, journal.as_deref_mut());
            if outcome.is_aborted() {
                return;
            }
        }
    }

    fn rename_show_folder(
        &self,
        show_dir: &Path,
        new_title: &str,
        outcome: &mut ShowRename,
        journal: Option<&mut BackupSnapshot>,
    ) {
        let Some(name) = show_dir.file_name().and_then(|n| n.to_str()) else {
            return;
        };
        let (_, year) = filename_parser::extract_show_title(name);
        let new_name = match year {
            Some(year) => format!("{} ({})", new_title, year),
            None => new_title.to_string(),
        };
        if new_name != name {
            self.rename_one(show_dir, &show_dir.with_file_name(new_name), true, outcome, journal);
        }
    }

    fn rename_one(
        &self,
        old_path: &Path,
        new_path: &Path,
        is_folder: bool,
        outcome: &mut ShowRename,
        journal: Option<&mut BackupSnapshot>,
    ) {
        let mut scratch = CleanResult::default();
        let error = match self.move_path(old_path, new_path, OperationKind::Rename, &mut scratch, journal) {
            Ok(()) => None,
            Err(SweepError::Safety(violation)) => {
                warn!(violation = %violation, "Safety violation, abandoning show rename");
                let message = violation.to_string();
                outcome.safety_violation = Some(violation);
                Some(message)
            }
            Err(e) => {
                warn!(from = %old_path.display(), to = %new_path.display(), error = %e, "Rename failed");
                Some(e.to_string())
            }
        };
        outcome.renames.push(RenameResult {
            old_path: old_path.to_path_buf(),
            new_path: new_path.to_path_buf(),
            is_folder,
            success: error.is_none(),
            error,
        });
    }

    /// Remove now-empty folders above `path`, stopping below its library root
    fn remove_empty_parents(&self, path: &Path) {
        if self.config.dry_run {
            return;
        }
        let Some(root) = self.roots.iter().find(|root| path.starts_with(root)) else {
            return;
        };

        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == root.as_path() || !dir.starts_with(root) {
                break;
            }
            let is_empty = fs::read_dir(dir)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(false);
            if !is_empty {
                break;
            }
            match fs::remove_dir(dir) {
                Ok(()) => debug!(path = %dir.display(), "Removed empty folder"),
                Err(e) => {
                    debug!(path = %dir.display(), error = %e, "Could not remove folder");
                    break;
                }
            }
            current = dir.parent();
        }
    }
}

/// Resolve symlinks through the nearest existing ancestor of `path`
fn resolve(path: &Path) -> PathBuf {
    let mut missing = Vec::new();
    let mut current = path;
    loop {
        if let Ok(canonical) = current.canonicalize() {
            return missing.iter().rev().fold(canonical, |acc, name| acc.join(name));
        }
        match (current.parent(), current.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name);
                current = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}

/// Whether two paths reach the same file data
#[cfg(unix)]
fn same_file(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (fs::metadata(a), fs::metadata(b)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_file(a: &Path, b: &Path) -> bool {
    matches!((a.canonicalize(), b.canonicalize()), (Ok(a), Ok(b)) if a == b)
}

fn operation(kind: OperationKind, source: &Path, destination: Option<&Path>, completed: bool) -> Operation {
    Operation {
        kind,
        source: source.to_path_buf(),
        destination: destination.map(Path::to_path_buf),
        timestamp: Utc::now(),
        completed,
    }
}

fn record(
    journal: Option<&mut BackupSnapshot>,
    kind: OperationKind,
    from: &Path,
    to: Option<&Path>,
    outcome: &io::Result<()>,
) {
    if let Some(snapshot) = journal {
        snapshot.record_operation(OperationRecord::new(
            kind,
            from,
            to,
            outcome.as_ref().err().map(ToString::to_string),
        ));
    }
}

/// Rename `from` to `to`, creating parents and keeping ownership
fn rename_preserving_owner(from: &Path, to: &Path) -> io::Result<()> {
    let original = fs::symlink_metadata(from)?;
    if let Some(parent) = to.parent() {
        let missing: Vec<PathBuf> = parent
            .ancestors()
            .take_while(|dir| !dir.exists())
            .map(Path::to_path_buf)
            .collect();
        fs::create_dir_all(parent)?;
        for dir in missing.iter().rev() {
            preserve_ownership(&original, dir)?;
        }
    }
    fs::rename(from, to)?;
    preserve_ownership(&original, to)
}

#[cfg(unix)]
fn preserve_ownership(original: &Metadata, path: &Path) -> io::Result<()> {
    use std::os::unix::fs::{MetadataExt, lchown};

    let current = fs::symlink_metadata(path)?;
    if current.uid() == original.uid() && current.gid() == original.gid() {
        return Ok(());
    }
    lchown(path, Some(original.uid()), Some(original.gid()))
}

#[cfg(not(unix))]
fn preserve_ownership(_original: &Metadata, _path: &Path) -> io::Result<()> {
    Ok(())
}
