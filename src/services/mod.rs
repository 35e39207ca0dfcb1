//! Library scanning, cleanup and backup services

pub mod backup;
pub mod cleaner;
pub mod conflict_workflow;
pub mod filename_parser;
pub mod logging;
pub mod orchestrator;
pub mod progress;
pub mod quality_evaluator;
pub mod rate_limiter;
pub mod reporter;
pub mod scanner;
pub mod text_utils;
pub mod title_resolver;
pub mod walker;

pub use backup::{BackupManager, BackupSnapshot, BackupStatus, IntegrityReport};
pub use cleaner::{CleanResult, Cleaner, ComplianceIssue, RenameResult, SafetyConfig, ShowRename, SuggestedAction};
pub use conflict_workflow::{ConflictWorkflow, WorkflowAction, WorkflowError, WorkflowState};
pub use filename_parser::{NormalizedName, normalize};
pub use logging::init_tracing;
pub use orchestrator::{ComplianceChecker, ScanCoordinator};
pub use progress::{LogLevel, Operation, ProgressConfig, ProgressHub, ProgressReporter, ScanProgress, Severity};
pub use quality_evaluator::DuplicateGroup;
pub use reporter::{ReportSummary, ReportWriter, ScanReport};
pub use scanner::{MediaFile, MovieDetector, TvDetector};
pub use title_resolver::{MetadataLookup, TitleResolver, TvTitleConflict, UserDecision, VerifiedTitle};
