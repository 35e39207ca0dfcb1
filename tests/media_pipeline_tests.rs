//! Integration tests for the scan and cleanup pipeline
//!
//! These tests drive the public API end to end:
//! - Name normalization and grouping
//! - Keeper selection and report totals
//! - Title conflict decisions
//! - Safety rules and cancellation of the cleaner
//! - Backup verification

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use mediasweep::services::ProgressReporter;
use mediasweep::services::progress::Operation;
use tokio_util::sync::CancellationToken;

const GIB: u64 = 1024 * 1024 * 1024;

fn touch(root: &Path, rel: &str, size: u64) -> PathBuf {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let file = File::create(&path).unwrap();
    file.set_len(size).unwrap();
    path
}

fn reporter(operation: Operation) -> ProgressReporter {
    ProgressReporter::detached(operation)
}

// ============================================================================
// Normalization
// ============================================================================

mod normalization {
    use mediasweep::services::filename_parser::{NormalizedName, normalize};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_scene_and_library_names_agree() {
        let expected = NormalizedName {
            title: "movie".into(),
            year: Some(2024),
        };
        assert_eq!(normalize("Movie.2024.1080p.BluRay.x264-GROUP.mkv"), expected);
        assert_eq!(normalize("Movie (2024)"), expected);
        assert_eq!(normalize("Movie (2024).mkv"), expected);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let samples = [
            "The.Matrix.1999.2160p.UHD.BluRay.REMUX.HDR.HEVC-FGT.mkv",
            "Spider-Man: No Way Home (2021) [1080p]",
            "The Nun II (2023)",
            "2012 (2009)",
            "Charlotte's Web (2006) EXTENDED",
            "Blade Runner 2049 (2017)",
        ];
        for sample in samples {
            let once = normalize(sample);
            assert_eq!(normalize(&once.to_string()), once, "sample: {}", sample);
        }
    }

    #[test]
    fn test_short_titles_are_unresolved() {
        assert!(!normalize("XY.1080p.mkv").is_resolved());
        assert!(normalize("Heat (1995)").is_resolved());
    }
}

// ============================================================================
// Duplicate Detection
// ============================================================================

mod detection {
    use super::*;
    use mediasweep::services::{MovieDetector, TvDetector};

    #[test]
    fn test_roman_numeral_sequels_group() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "The Nun II (2023)/The Nun II (2023).mkv", 10);
        touch(dir.path(), "The Nun 2 (2023)/The Nun 2 (2023).mkv", 10);

        let groups = MovieDetector::default()
            .detect(
                &[dir.path().to_path_buf()],
                &CancellationToken::new(),
                &reporter(Operation::MovieScan),
            )
            .unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].files.len(), 2);
    }

    #[test]
    fn test_different_seasons_never_group() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "Show/Show S01E01.mkv", 10);
        touch(dir.path(), "Show/Show S02E01.mkv", 10);

        let groups = TvDetector::new()
            .detect(
                &[dir.path().to_path_buf()],
                &CancellationToken::new(),
                &reporter(Operation::TvScan),
            )
            .unwrap();
        assert!(groups.is_empty());
    }

    #[test]
    fn test_roots_merge_into_one_group() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        touch(first.path(), "Lost (2004)/Season 1/Lost.S01E05.720p.mkv", 10);
        touch(second.path(), "Lost/Lost - S01E05 - White Rabbit.mkv", 10);

        let groups = TvDetector::new()
            .detect(
                &[first.path().to_path_buf(), second.path().to_path_buf()],
                &CancellationToken::new(),
                &reporter(Operation::TvScan),
            )
            .unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].key.to_string(), "lost|S01E05");
    }

    #[test]
    fn test_decorated_season_folders_keep_shows_apart() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "Lost (2004)/Season 01 (2004)/S01E01.mkv", 10);
        touch(dir.path(), "Heroes (2006)/Season 01 (2004)/S01E01.mkv", 10);
        touch(dir.path(), "Heroes (2006)/Season 1 - Bluray/Heroes.S01E01.1080p.mkv", 10);

        let groups = TvDetector::new()
            .detect(
                &[dir.path().to_path_buf()],
                &CancellationToken::new(),
                &reporter(Operation::TvScan),
            )
            .unwrap();
        let keys: Vec<String> = groups.iter().map(|g| g.key.to_string()).collect();
        assert_eq!(keys, vec!["heroes|S01E01".to_string()]);
    }
}

// ============================================================================
// End-to-End Scan
// ============================================================================

mod end_to_end {
    use super::*;
    use mediasweep::Config;
    use mediasweep::services::title_resolver::VerifiedTitle;
    use mediasweep::services::{MetadataLookup, ProgressHub, ReportWriter, ScanCoordinator};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_matrix_library_yields_one_group() {
        let dir = tempfile::tempdir().unwrap();
        let uhd = touch(dir.path(), "The Matrix (1999)/The.Matrix.1999.2160p.mkv", 3 * GIB);
        let fhd = touch(dir.path(), "The Matrix (1999)/The.Matrix.1999.1080p.mkv", 3 * GIB / 2);

        let config = Config {
            movie_paths: vec![dir.path().to_path_buf()],
            ..Default::default()
        };
        let (hub, _events) = ProgressHub::new(256);
        let report = ScanCoordinator::new(config)
            .run(CancellationToken::new(), hub)
            .await
            .unwrap();

        assert_eq!(report.movie_duplicates.len(), 1);
        let group = &report.movie_duplicates[0];
        assert_eq!(group.keeper().path, uhd);
        assert!(group.deletion_candidates().all(|f| f.path != uhd));
        assert_eq!(group.files()[1].file.path, fhd);
        assert_eq!(report.summary.space_to_free, 3 * GIB / 2);
        assert_eq!(report.summary.total_files_to_delete, 1);

        let out = tempfile::tempdir().unwrap();
        let written = ReportWriter::new(out.path()).write(&report).unwrap();
        assert!(written.json.exists());
        assert!(written.text.exists());
    }

    struct KnownShows;

    #[async_trait::async_trait]
    impl MetadataLookup for KnownShows {
        async fn lookup(&self, title: &str, _year: Option<u16>) -> anyhow::Result<Option<VerifiedTitle>> {
            Ok((title == "The Office").then(|| VerifiedTitle {
                id: "office".into(),
                title: "The Office".into(),
                year: Some(2005),
            }))
        }
    }

    #[test]
    fn test_ambiguous_shows_are_verified_not_dropped() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "The Office (2005)/Season 01/Parks Rec S01E01.mkv", 10);
        touch(dir.path(), "Mystery Show (2010)/Season 01/Other Thing S01E01.mkv", 10);

        let config = Config {
            tv_paths: vec![dir.path().to_path_buf()],
            ..Default::default()
        };
        let (hub, _events) = ProgressHub::new(256);
        let report = tokio_test::block_on(
            ScanCoordinator::new(config)
                .with_lookup(Arc::new(KnownShows))
                .run(CancellationToken::new(), hub),
        )
        .unwrap();

        assert_eq!(report.ambiguous_tv_shows.len(), 2);
        let verified: Vec<bool> = report.ambiguous_tv_shows.iter().map(|c| c.api_verified).collect();
        assert_eq!(verified, vec![false, true]);
    }
}

// ============================================================================
// Title Decisions
// ============================================================================

mod title_decisions {
    use super::*;
    use mediasweep::services::title_resolver::TitleResolver;
    use mediasweep::services::{ConflictWorkflow, UserDecision, WorkflowAction, WorkflowState};

    #[test]
    fn test_skip_resolves_to_higher_confidence_folder() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "Doctor Who (2005)/Season 1/Torchwood S01E01.mkv", 10);

        let mut conflicts = TitleResolver::default()
            .scan_root(
                dir.path(),
                &CancellationToken::new(),
                &reporter(Operation::TitleResolution),
            )
            .unwrap();
        assert_eq!(conflicts.len(), 1);
        let conflict = &mut conflicts[0];
        conflict.folder_match.as_mut().unwrap().confidence = 0.90;
        conflict.filename_match.as_mut().unwrap().confidence = 0.85;

        let mut workflow = ConflictWorkflow::new(conflicts);
        assert_eq!(workflow.handle(WorkflowAction::Skip).unwrap(), WorkflowState::BatchSummary);
        let conflict = &workflow.conflicts()[0];
        assert_eq!(conflict.resolved_title, "Doctor Who");
        assert_eq!(conflict.decision(), &UserDecision::Skipped);
        assert_eq!(conflict.effective_title(), None);
    }
}

// ============================================================================
// Cleaner Safety
// ============================================================================

mod cleaner_safety {
    use super::*;
    use assert_matches::assert_matches;
    use mediasweep::SafetyViolation;
    use mediasweep::services::{
        Cleaner, ComplianceIssue, MovieDetector, ProgressConfig, ProgressHub, SafetyConfig, SuggestedAction,
        quality_evaluator,
    };
    use std::time::Duration;

    fn groups_for(root: &Path) -> Vec<mediasweep::services::DuplicateGroup> {
        let candidates = MovieDetector::default()
            .detect(
                &[root.to_path_buf()],
                &CancellationToken::new(),
                &reporter(Operation::MovieScan),
            )
            .unwrap();
        quality_evaluator::rank_all(candidates)
    }

    #[test]
    fn test_size_cap_allows_exactly_one_deletion() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "Heat (1995)/Heat.1995.2160p.mkv", 600);
        let first = touch(dir.path(), "Heat (1995)/Heat.1995.1080p.mkv", 600);
        let second = touch(dir.path(), "Heat (1995)/Heat.1995.720p.mkv", 600);

        let config = SafetyConfig {
            protected_paths: Vec::new(),
            max_delete_bytes: 1000,
            dry_run: false,
            ..Default::default()
        };
        let result = Cleaner::new(config, vec![dir.path().to_path_buf()])
            .clean(
                &groups_for(dir.path()),
                &[],
                &CancellationToken::new(),
                &reporter(Operation::Cleanup),
                None,
            )
            .unwrap();

        assert_eq!(result.duplicates_deleted, 1);
        assert!(!first.exists());
        assert!(second.exists());
        assert_matches!(result.safety_violation, Some(SafetyViolation::SizeCapExceeded { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_into_protected_path_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let protected = dir.path().join("protected");
        let library = dir.path().join("library");
        let target = touch(&protected, "Heat.1995.720p.mkv", 100);
        touch(&library, "Heat (1995)/Heat.1995.2160p.mkv", 100);
        let link = library.join("Heat (1995)/Heat.1995.720p.mkv");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let config = SafetyConfig {
            protected_paths: vec![protected.clone()],
            dry_run: false,
            ..Default::default()
        };
        let result = Cleaner::new(config, vec![library.clone()])
            .clean(
                &groups_for(&library),
                &[],
                &CancellationToken::new(),
                &reporter(Operation::Cleanup),
                None,
            )
            .unwrap();

        assert_matches!(result.safety_violation, Some(SafetyViolation::ProtectedPath { .. }));
        assert_eq!(result.duplicates_deleted, 0);
        assert!(result.operations.is_empty());
        assert!(fs::symlink_metadata(&link).is_ok());
        assert!(target.exists());
    }

    #[test]
    fn test_parent_dir_segments_in_fix_target_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let protected = dir.path().join("protected");
        fs::create_dir_all(&protected).unwrap();
        let loose = touch(dir.path(), "library/incoming/Alien.1979.mkv", 100);

        let issue = ComplianceIssue {
            path: loose.clone(),
            issue_type: "naming".into(),
            problem: "not in a movie folder".into(),
            suggested_path: dir
                .path()
                .join("library/nonexistent/../../protected/Alien (1979).mkv"),
            suggested_action: SuggestedAction::Reorganize,
        };
        let config = SafetyConfig {
            protected_paths: vec![protected.clone()],
            dry_run: false,
            ..Default::default()
        };
        let result = Cleaner::new(config, vec![dir.path().join("library")])
            .clean(
                &[],
                &[issue],
                &CancellationToken::new(),
                &reporter(Operation::Cleanup),
                None,
            )
            .unwrap();

        assert_matches!(result.safety_violation, Some(SafetyViolation::UnsafePath { .. }));
        assert_eq!(result.compliance_fixed, 0);
        assert!(loose.exists());
        assert!(!protected.join("Alien (1979).mkv").exists());
    }

    #[test]
    fn test_hard_linked_duplicate_keeps_keeper_data() {
        let dir = tempfile::tempdir().unwrap();
        let keeper = touch(dir.path(), "Heat (1995)/Heat.1995.2160p.mkv", 100);
        let linked = dir.path().join("Heat (1995)/Heat.1995.720p.mkv");
        fs::hard_link(&keeper, &linked).unwrap();

        let groups = groups_for(dir.path());
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].keeper().path, keeper);

        let result = Cleaner::new(
            SafetyConfig {
                protected_paths: Vec::new(),
                dry_run: false,
                ..Default::default()
            },
            vec![dir.path().to_path_buf()],
        )
        .clean(&groups, &[], &CancellationToken::new(), &reporter(Operation::Cleanup), None)
        .unwrap();

        assert_eq!(result.duplicates_deleted, 0);
        assert_eq!(result.space_freed, 0);
        assert_eq!(result.errors.len(), 1);
        assert!(linked.exists());
        assert_eq!(fs::metadata(&keeper).unwrap().len(), 100);
    }

    #[test]
    fn test_cancelled_cleanup_reports_what_it_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let mut duplicates = Vec::new();
        for i in 0..40 {
            touch(dir.path(), &format!("Film {i} (2001)/Film.{i}.2001.2160p.mkv"), 10);
            duplicates.push(touch(dir.path(), &format!("Film {i} (2001)/Film.{i}.2001.720p.mkv"), 10));
        }
        let groups = groups_for(dir.path());
        assert_eq!(groups.len(), 40);

        let token = CancellationToken::new();
        let (hub, events) = ProgressHub::new(1024);
        let progress = hub.reporter(
            Operation::Cleanup,
            ProgressConfig {
                min_interval: Duration::ZERO,
                ..Default::default()
            },
        );
        drop(hub);
        let watcher = {
            let token = token.clone();
            std::thread::spawn(move || {
                for event in events.iter() {
                    if event.current >= 1 {
                        token.cancel();
                        break;
                    }
                }
            })
        };

        let cleaner = Cleaner::new(
            SafetyConfig {
                protected_paths: Vec::new(),
                dry_run: false,
                ..Default::default()
            },
            vec![dir.path().to_path_buf()],
        );
        let result = cleaner.clean(&groups, &[], &token, &progress, None).unwrap();
        drop(progress);
        watcher.join().unwrap();

        let gone = duplicates.iter().filter(|path| !path.exists()).count();
        assert_eq!(result.duplicates_deleted, gone);
        assert_eq!(result.operations.len(), gone);
        assert_eq!(result.space_freed, gone as u64 * 10);
        if result.cancelled {
            assert!(gone < duplicates.len());
            assert!(result.cancellation_error().is_some());
        } else {
            assert_eq!(gone, duplicates.len());
        }
    }
}

// ============================================================================
// Backup Integrity
// ============================================================================

mod backup_integrity {
    use super::*;
    use mediasweep::services::BackupManager;

    #[test]
    fn test_verify_detects_resized_file() {
        let library = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let tracked = touch(library.path(), "Alien (1979)/Alien (1979).mkv", 4096);
        touch(library.path(), "Aliens (1986)/Aliens (1986).mkv", 2048);

        let manager = BackupManager::new(store.path());
        let snapshot = manager
            .create_backup(
                "movies",
                "movie",
                &[library.path().to_path_buf()],
                &CancellationToken::new(),
                &reporter(Operation::Backup),
            )
            .unwrap();

        let report = manager.verify_integrity(&snapshot, &reporter(Operation::VerifyBackup));
        assert!(report.intact);
        assert!(report.problems.is_empty());

        File::options().write(true).open(&tracked).unwrap().set_len(10).unwrap();
        let report = manager.verify_integrity(&snapshot, &reporter(Operation::VerifyBackup));
        assert!(!report.intact);
        let paths: Vec<&Path> = report.problems.iter().map(|p| p.path()).collect();
        assert_eq!(paths, vec![tracked.as_path()]);
    }
}
