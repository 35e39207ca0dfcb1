//! Library snapshots and revert
//!
//! A snapshot records what a set of library roots looked like before a
//! destructive run, plus a journal of every rename, move and delete the run
//! performed. Snapshots are stored as one JSON document per backup id.
//!
//! Status only moves forward: in progress, then completed, then reverted.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cleaner::{CleanResult, Cleaner, ComplianceIssue, OperationKind};
use super::progress::{ProgressReporter, Stage};
use super::quality_evaluator::DuplicateGroup;
use super::walker::{LibraryWalk, WalkEvent};
use crate::error::{Result, SweepError};

/// Lifecycle of a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    InProgress,
    Completed,
    Reverted,
}

/// A file as it was when the snapshot was taken
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub original_path: PathBuf,
    /// Path relative to the library root it was found under
    pub rel_path: PathBuf,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// A mutation applied after the snapshot was taken
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub kind: OperationKind,
    pub old_path: PathBuf,
    pub new_path: Option<PathBuf>,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
}

impl OperationRecord {
    pub fn new(kind: OperationKind, old_path: &Path, new_path: Option<&Path>, error: Option<String>) -> Self {
        Self {
            kind,
            old_path: old_path.to_path_buf(),
            new_path: new_path.map(Path::to_path_buf),
            timestamp: Utc::now(),
            success: error.is_none(),
            error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSnapshot {
    pub backup_id: String,
    pub created_at: DateTime<Utc>,
    pub library_type: String,
    pub library_paths: Vec<PathBuf>,
    pub total_files: usize,
    pub total_size: u64,
    pub entries: Vec<FileEntry>,
    pub operations: Vec<OperationRecord>,
    status: BackupStatus,
}

impl BackupSnapshot {
    pub fn status(&self) -> BackupStatus {
        self.status
    }

    pub fn record_operation(&mut self, record: OperationRecord) {
        self.operations.push(record);
    }

    fn transition(&mut self, to: BackupStatus) -> Result<()> {
        let allowed = matches!(
            (self.status, to),
            (BackupStatus::InProgress, BackupStatus::Completed)
                | (BackupStatus::Completed, BackupStatus::Reverted)
        );
        if !allowed {
            return Err(SweepError::Backup(format!(
                "backup {} cannot move from {:?} to {:?}",
                self.backup_id, self.status, to
            )));
        }
        self.status = to;
        Ok(())
    }
}

/// A recorded entry that no longer matches the filesystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "problem", rename_all = "snake_case")]
pub enum IntegrityProblem {
    Missing { path: PathBuf },
    SizeChanged { path: PathBuf, expected: u64, actual: u64 },
}

impl IntegrityProblem {
    pub fn path(&self) -> &Path {
        match self {
            IntegrityProblem::Missing { path } | IntegrityProblem::SizeChanged { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub intact: bool,
    pub checked: usize,
    pub problems: Vec<IntegrityProblem>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RevertSummary {
    pub restored: usize,
    /// Deleted files cannot be brought back
    pub unrecoverable: usize,
    pub errors: Vec<String>,
}

/// Creates, stores and reverts snapshots
#[derive(Debug, Clone)]
pub struct BackupManager {
    dir: PathBuf,
}

impl BackupManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<data dir>/mediasweep/backups`, or a relative fallback
    pub fn default_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mediasweep")
            .join("backups")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn snapshot_path(&self, backup_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", backup_id))
    }

    fn new_backup_id(label: &str) -> String {
        let label = sanitize_filename::sanitize(label.trim()).replace(' ', "_");
        let label = if label.is_empty() { "backup".to_string() } else { label };
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}_{}_{}", label, Utc::now().format("%Y%m%d_%H%M%S"), &suffix[..8])
    }

    /// Record every file under `paths` and persist the snapshot as completed
    pub fn create_backup(
        &self,
        label: &str,
        library_type: &str,
        paths: &[PathBuf],
        token: &CancellationToken,
        reporter: &ProgressReporter,
    ) -> Result<BackupSnapshot> {
        let mut snapshot = BackupSnapshot {
            backup_id: Self::new_backup_id(label),
            created_at: Utc::now(),
            library_type: library_type.to_string(),
            library_paths: paths.to_vec(),
            total_files: 0,
            total_size: 0,
            entries: Vec::new(),
            operations: Vec::new(),
            status: BackupStatus::InProgress,
        };
        reporter.start(0, format!("Creating backup {}", snapshot.backup_id));
        info!(backup_id = %snapshot.backup_id, roots = paths.len(), "Creating backup");

        for root in paths {
            super::walker::check_root(root)?;
            for event in LibraryWalk::new(root) {
                if token.is_cancelled() {
                    return Err(SweepError::cancelled("backup"));
                }
                match event {
                    WalkEvent::File { path, metadata } => {
                        let rel_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
                        let modified = metadata.modified().ok().map(DateTime::<Utc>::from);
                        snapshot.total_size += metadata.len();
                        reporter.file_processed(&path);
                        snapshot.entries.push(FileEntry {
                            original_path: path,
                            rel_path,
                            size: metadata.len(),
                            modified,
                        });
                    }
                    WalkEvent::Error { depth: 0, error, .. } => {
                        return Err(SweepError::access(root, error));
                    }
                    WalkEvent::Error { path, error, .. } => {
                        warn!(path = ?path, error = %error, "Skipping unreadable entry in backup");
                        reporter.warn(format!("Skipped unreadable entry: {}", error));
                    }
                    WalkEvent::Dir { .. } => {}
                }
            }
        }
        snapshot.total_files = snapshot.entries.len();

        snapshot.transition(BackupStatus::Completed)?;
        self.save(&snapshot)?;
        info!(
            backup_id = %snapshot.backup_id,
            files = snapshot.total_files,
            bytes = snapshot.total_size,
            "Backup created"
        );
        reporter.complete(format!("Backed up {} files", snapshot.total_files));
        Ok(snapshot)
    }

    /// Persist a snapshot atomically
    pub fn save(&self, snapshot: &BackupSnapshot) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| SweepError::access(&self.dir, e))?;
        let target = self.snapshot_path(&snapshot.backup_id);
        let tmp = target.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(snapshot)?;
        fs::write(&tmp, json).map_err(|e| SweepError::access(&tmp, e))?;
        fs::rename(&tmp, &target).map_err(|e| SweepError::access(&target, e))?;
        debug!(path = %target.display(), "Saved backup snapshot");
        Ok(())
    }

    pub fn load_backup(&self, backup_id: &str) -> Result<BackupSnapshot> {
        let path = self.snapshot_path(backup_id);
        let bytes = fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SweepError::Backup(format!("backup not found: {}", backup_id)),
            _ => SweepError::access(&path, e),
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// All stored snapshots, newest first. Unreadable files are skipped.
    pub fn list_backups(&self) -> Result<Vec<BackupSnapshot>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SweepError::access(&self.dir, e)),
        };

        let mut snapshots: Vec<BackupSnapshot> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| {
                let parsed = fs::read(&path)
                    .map_err(|e| e.to_string())
                    .and_then(|bytes| serde_json::from_slice::<BackupSnapshot>(&bytes).map_err(|e| e.to_string()));
                match parsed {
                    Ok(snapshot) => Some(snapshot),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping unreadable backup");
                        None
                    }
                }
            })
            .collect();
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(snapshots)
    }

    pub fn delete_backup(&self, backup_id: &str) -> Result<()> {
        let path = self.snapshot_path(backup_id);
        fs::remove_file(&path).map_err(|e| SweepError::access(&path, e))?;
        info!(backup_id = backup_id, "Deleted backup");
        Ok(())
    }

    /// Re-stat every recorded entry and list those that moved or changed size
    pub fn verify_integrity(&self, snapshot: &BackupSnapshot, reporter: &ProgressReporter) -> IntegrityReport {
        reporter.start(snapshot.entries.len() as u64, "Verifying backup");
        let mut report = IntegrityReport {
            checked: snapshot.entries.len(),
            ..Default::default()
        };

        for (i, entry) in snapshot.entries.iter().enumerate() {
            match fs::metadata(&entry.original_path) {
                Ok(metadata) if metadata.len() != entry.size => {
                    report.problems.push(IntegrityProblem::SizeChanged {
                        path: entry.original_path.clone(),
                        expected: entry.size,
                        actual: metadata.len(),
                    });
                }
                Ok(_) => {}
                Err(_) => report.problems.push(IntegrityProblem::Missing {
                    path: entry.original_path.clone(),
                }),
            }
            reporter.update(i as u64 + 1, format!("Checked {}", entry.rel_path.display()));
        }

        report.intact = report.problems.is_empty();
        if !report.intact {
            reporter.warn(format!("{} entries changed since backup", report.problems.len()));
        }
        reporter.complete("Verification finished");
        report
    }

    /// Undo the journalled renames and moves of a completed snapshot
    pub fn revert_backup(&self, backup_id: &str, reporter: &ProgressReporter) -> Result<RevertSummary> {
        let mut snapshot = self.load_backup(backup_id)?;
        if snapshot.status != BackupStatus::Completed {
            return Err(SweepError::Backup(format!(
                "backup {} is {:?}; only completed backups can be reverted",
                backup_id, snapshot.status
            )));
        }

        let applied: Vec<OperationRecord> = snapshot
            .operations
            .iter()
            .filter(|op| op.success)
            .rev()
            .cloned()
            .collect();
        reporter.start(applied.len() as u64, format!("Reverting {}", backup_id));
        reporter.stage(Stage::Applying, "Restoring original paths");

        let mut summary = RevertSummary::default();
        for (i, op) in applied.iter().enumerate() {
            match (&op.kind, &op.new_path) {
                (OperationKind::Delete, _) => {
                    summary.unrecoverable += 1;
                    warn!(path = %op.old_path.display(), "Deleted file cannot be restored");
                    reporter.warn(format!("Cannot restore deleted {}", op.old_path.display()));
                }
                (_, Some(new_path)) => match restore(new_path, &op.old_path) {
                    Ok(()) => summary.restored += 1,
                    Err(e) => {
                        reporter.error(format!("Failed to restore {}: {}", op.old_path.display(), e));
                        summary.errors.push(format!("{}: {}", op.old_path.display(), e));
                    }
                },
                (_, None) => {
                    summary.errors.push(format!("{}: no destination recorded", op.old_path.display()));
                }
            }
            reporter.update(i as u64 + 1, format!("Reverted {}", op.old_path.display()));
        }

        snapshot.transition(BackupStatus::Reverted)?;
        self.save(&snapshot)?;
        info!(
            backup_id = backup_id,
            restored = summary.restored,
            unrecoverable = summary.unrecoverable,
            errors = summary.errors.len(),
            "Backup reverted"
        );
        reporter.complete(format!("Restored {} paths", summary.restored));
        Ok(summary)
    }

    /// Snapshot the roots, run the cleaner with the snapshot as journal, save.
    ///
    /// A cancelled cleanup still saves the journal of what it applied.
    pub fn guarded_clean(
        &self,
        cleaner: &Cleaner,
        roots: &[PathBuf],
        groups: &[DuplicateGroup],
        issues: &[ComplianceIssue],
        token: &CancellationToken,
        backup_progress: &ProgressReporter,
        clean_progress: &ProgressReporter,
    ) -> Result<(BackupSnapshot, CleanResult)> {
        let mut snapshot = self.create_backup("cleanup", "library", roots, token, backup_progress)?;
        let outcome = cleaner.clean(groups, issues, token, clean_progress, Some(&mut snapshot));
        self.save(&snapshot)?;
        Ok((snapshot, outcome?))
    }
}

fn restore(from: &Path, to: &Path) -> std::io::Result<()> {
    if to.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("{} already exists", to.display()),
        ));
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(from, to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::cleaner::SafetyConfig;
    use crate::services::progress::Operation;
    use assert_matches::assert_matches;

    fn reporter() -> ProgressReporter {
        ProgressReporter::detached(Operation::Backup)
    }

    fn library() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let movie = dir.path().join("Heat (1995)");
        fs::create_dir_all(&movie).unwrap();
        fs::write(movie.join("Heat (1995).mkv"), vec![0u8; 64]).unwrap();
        fs::write(movie.join("Heat (1995).srt"), b"subs").unwrap();
        dir
    }

    #[test]
    fn test_backup_id_format() {
        let id = BackupManager::new_backup_id("movies");
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "movies");
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 6);
        assert_eq!(parts[3].len(), 8);
    }

    #[test]
    fn test_create_and_verify_backup() {
        let lib = library();
        let store = tempfile::tempdir().unwrap();
        let manager = BackupManager::new(store.path());
        let roots = vec![lib.path().to_path_buf()];

        let snapshot = manager
            .create_backup("movies", "movie", &roots, &CancellationToken::new(), &reporter())
            .unwrap();
        assert_eq!(snapshot.status(), BackupStatus::Completed);
        assert_eq!(snapshot.total_files, 2);
        assert_eq!(snapshot.total_size, 68);

        let report = manager.verify_integrity(&snapshot, &reporter());
        assert!(report.intact);

        let movie = lib.path().join("Heat (1995)/Heat (1995).mkv");
        fs::write(&movie, vec![0u8; 10]).unwrap();
        let report = manager.verify_integrity(&snapshot, &reporter());
        assert!(!report.intact);
        assert_eq!(report.problems.len(), 1);
        assert_eq!(report.problems[0].path(), movie.as_path());
    }

    #[test]
    fn test_list_backups_newest_first() {
        let lib = library();
        let store = tempfile::tempdir().unwrap();
        let manager = BackupManager::new(store.path());
        let roots = vec![lib.path().to_path_buf()];
        let token = CancellationToken::new();

        let first = manager.create_backup("a", "movie", &roots, &token, &reporter()).unwrap();
        let mut second = manager.create_backup("b", "movie", &roots, &token, &reporter()).unwrap();
        second.created_at = first.created_at + chrono::Duration::seconds(5);
        manager.save(&second).unwrap();

        let listed = manager.list_backups().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].backup_id, second.backup_id);

        manager.delete_backup(&first.backup_id).unwrap();
        assert_eq!(manager.list_backups().unwrap().len(), 1);
    }

    #[test]
    fn test_revert_only_from_completed() {
        let lib = library();
        let store = tempfile::tempdir().unwrap();
        let manager = BackupManager::new(store.path());
        let roots = vec![lib.path().to_path_buf()];

        let mut snapshot = manager
            .create_backup("movies", "movie", &roots, &CancellationToken::new(), &reporter())
            .unwrap();
        let old = lib.path().join("Heat (1995)/Heat (1995).srt");
        let new = lib.path().join("Heat (1995)/Heat (1995).en.srt");
        fs::rename(&old, &new).unwrap();
        snapshot.record_operation(OperationRecord::new(OperationKind::Rename, &old, Some(&new), None));
        snapshot.record_operation(OperationRecord::new(
            OperationKind::Delete,
            &lib.path().join("gone.mkv"),
            None,
            None,
        ));
        manager.save(&snapshot).unwrap();

        let summary = manager.revert_backup(&snapshot.backup_id, &reporter()).unwrap();
        assert_eq!(summary.restored, 1);
        assert_eq!(summary.unrecoverable, 1);
        assert!(old.exists());
        assert_eq!(
            manager.load_backup(&snapshot.backup_id).unwrap().status(),
            BackupStatus::Reverted
        );

        assert_matches!(
            manager.revert_backup(&snapshot.backup_id, &reporter()),
            Err(SweepError::Backup(_))
        );
    }

    #[test]
    fn test_guarded_clean_journals_operations() {
        let lib = library();
        let store = tempfile::tempdir().unwrap();
        let manager = BackupManager::new(store.path());
        let roots = vec![lib.path().to_path_buf()];
        let cleaner = Cleaner::new(
            SafetyConfig {
                protected_paths: Vec::new(),
                dry_run: false,
                ..Default::default()
            },
            roots.clone(),
        );
        let issue = ComplianceIssue {
            path: lib.path().join("Heat (1995)/Heat (1995).srt"),
            issue_type: "subtitle".into(),
            problem: "missing language code".into(),
            suggested_path: lib.path().join("Heat (1995)/Heat (1995).en.srt"),
            suggested_action: crate::services::cleaner::SuggestedAction::Rename,
        };

        let (snapshot, result) = manager
            .guarded_clean(
                &cleaner,
                &roots,
                &[],
                &[issue],
                &CancellationToken::new(),
                &reporter(),
                &reporter(),
            )
            .unwrap();
        assert_eq!(result.compliance_fixed, 1);
        assert_eq!(snapshot.operations.len(), 1);

        let stored = manager.load_backup(&snapshot.backup_id).unwrap();
        assert_eq!(stored.operations.len(), 1);
        manager.revert_backup(&snapshot.backup_id, &reporter()).unwrap();
        assert!(lib.path().join("Heat (1995)/Heat (1995).srt").exists());
    }
}
