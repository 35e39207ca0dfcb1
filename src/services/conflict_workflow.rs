//! Decision workflow for TV title conflicts
//!
//! Drives a list of [`TvTitleConflict`]s from review to applied renames.
//! Decisions can change freely until the batch is confirmed; from then on
//! the list is only read.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::backup::BackupSnapshot;
use super::cleaner::{Cleaner, RenameResult};
use super::progress::{ProgressReporter, Stage};
use super::title_resolver::{TvTitleConflict, UserDecision};
use crate::error::SafetyViolation;

/// Longest custom title accepted
pub const MAX_TITLE_LEN: usize = 200;

const FORBIDDEN_TITLE_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "index", rename_all = "snake_case")]
pub enum WorkflowState {
    ConflictReview(usize),
    Editing(usize),
    BatchSummary,
    Applying,
    Done,
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowState::ConflictReview(i) => write!(f, "reviewing conflict {}", i + 1),
            WorkflowState::Editing(i) => write!(f, "editing conflict {}", i + 1),
            WorkflowState::BatchSummary => write!(f, "batch summary"),
            WorkflowState::Applying => write!(f, "applying"),
            WorkflowState::Done => write!(f, "done"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowAction {
    SelectFolder,
    SelectFilename,
    SelectCustom,
    ConfirmEdit(String),
    CancelEdit,
    Skip,
    Next,
    Prev,
    OpenSummary,
    CancelSummary,
    ConfirmSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
    #[error("{action:?} is not allowed while {state}")]
    InvalidTransition {
        state: WorkflowState,
        action: WorkflowAction,
    },

    #[error("conflict has no {0} candidate")]
    MissingCandidate(&'static str),

    #[error("invalid title: {0}")]
    InvalidTitle(String),

    #[error("{0} conflicts are still undecided")]
    Undecided(usize),
}

/// Validate and trim a user-supplied show title
pub fn validate_custom_title(raw: &str) -> Result<String, WorkflowError> {
    let title = raw.trim();
    if title.is_empty() {
        return Err(WorkflowError::InvalidTitle("title is empty".into()));
    }
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(WorkflowError::InvalidTitle(format!(
            "title is longer than {} characters",
            MAX_TITLE_LEN
        )));
    }
    if let Some(c) = title
        .chars()
        .find(|c| FORBIDDEN_TITLE_CHARS.contains(c) || c.is_control())
    {
        return Err(WorkflowError::InvalidTitle(format!(
            "title contains forbidden character {:?}",
            c
        )));
    }
    if !sanitize_filename::is_sanitized(title) {
        return Err(WorkflowError::InvalidTitle(
            "title is not a valid file name".into(),
        ));
    }
    Ok(title.to_string())
}

/// Result of applying confirmed decisions
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchRenameOutcome {
    /// Rename results per conflict, in conflict order
    pub results: Vec<(PathBuf, Vec<RenameResult>)>,
    pub skipped: usize,
    pub failures: usize,
    /// Set when a safety rule stopped the batch
    pub safety_violation: Option<SafetyViolation>,
}

pub struct ConflictWorkflow {
    conflicts: Vec<TvTitleConflict>,
    state: WorkflowState,
}

impl ConflictWorkflow {
    /// Start reviewing; with nothing to review the workflow is already done
    pub fn new(conflicts: Vec<TvTitleConflict>) -> Self {
        let state = if conflicts.is_empty() {
            WorkflowState::Done
        } else {
            WorkflowState::ConflictReview(0)
        };
        Self { conflicts, state }
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    pub fn conflicts(&self) -> &[TvTitleConflict] {
        &self.conflicts
    }

    pub fn into_conflicts(self) -> Vec<TvTitleConflict> {
        self.conflicts
    }

    /// The conflict under review or being edited
    pub fn current(&self) -> Option<&TvTitleConflict> {
        match self.state {
            WorkflowState::ConflictReview(i) | WorkflowState::Editing(i) => self.conflicts.get(i),
            _ => None,
        }
    }

    pub fn undecided(&self) -> usize {
        self.conflicts
            .iter()
            .filter(|c| !c.decision().is_decided())
            .count()
    }

    pub fn all_decided(&self) -> bool {
        self.undecided() == 0
    }

    /// Apply one user action. Invalid actions leave the state untouched.
    pub fn handle(&mut self, action: WorkflowAction) -> Result<WorkflowState, WorkflowError> {
        let next = match (self.state, action) {
            (WorkflowState::ConflictReview(i), WorkflowAction::SelectFolder) => {
                let conflict = &mut self.conflicts[i];
                let title = conflict
                    .folder_match
                    .as_ref()
                    .map(|c| c.title.clone())
                    .ok_or(WorkflowError::MissingCandidate("folder"))?;
                conflict.decision = UserDecision::FolderTitle;
                conflict.resolved_title = title;
                self.after_decision(i)
            }
            (WorkflowState::ConflictReview(i), WorkflowAction::SelectFilename) => {
                let conflict = &mut self.conflicts[i];
                let title = conflict
                    .filename_match
                    .as_ref()
                    .map(|c| c.title.clone())
                    .ok_or(WorkflowError::MissingCandidate("filename"))?;
                conflict.decision = UserDecision::FilenameTitle;
                conflict.resolved_title = title;
                self.after_decision(i)
            }
            (WorkflowState::ConflictReview(i), WorkflowAction::SelectCustom) => {
                WorkflowState::Editing(i)
            }
            (WorkflowState::ConflictReview(i), WorkflowAction::Skip) => {
                let conflict = &mut self.conflicts[i];
                if let Some(title) = conflict.preferred_title().map(str::to_string) {
                    conflict.resolved_title = title;
                }
                conflict.decision = UserDecision::Skipped;
                if self.all_decided() {
                    WorkflowState::BatchSummary
                } else {
                    WorkflowState::ConflictReview((i + 1).min(self.conflicts.len() - 1))
                }
            }
            (WorkflowState::ConflictReview(i), WorkflowAction::Next) => {
                WorkflowState::ConflictReview((i + 1).min(self.conflicts.len() - 1))
            }
            (WorkflowState::ConflictReview(i), WorkflowAction::Prev) => {
                WorkflowState::ConflictReview(i.saturating_sub(1))
            }
            (WorkflowState::ConflictReview(_), WorkflowAction::OpenSummary) => {
                let undecided = self.undecided();
                if undecided > 0 {
                    return Err(WorkflowError::Undecided(undecided));
                }
                WorkflowState::BatchSummary
            }
            (WorkflowState::Editing(i), WorkflowAction::ConfirmEdit(text)) => {
                let title = validate_custom_title(&text)?;
                let conflict = &mut self.conflicts[i];
                conflict.resolved_title = title.clone();
                conflict.decision = UserDecision::CustomTitle(title);
                self.after_decision(i)
            }
            (WorkflowState::Editing(i), WorkflowAction::CancelEdit) => {
                WorkflowState::ConflictReview(i)
            }
            (WorkflowState::BatchSummary, WorkflowAction::CancelSummary) => {
                WorkflowState::ConflictReview(0)
            }
            (WorkflowState::BatchSummary, WorkflowAction::ConfirmSummary) => WorkflowState::Applying,
            (state, action) => {
                return Err(WorkflowError::InvalidTransition { state, action });
            }
        };

        debug!(from = %self.state, to = %next, "Workflow transition");
        self.state = next;
        Ok(next)
    }

    fn after_decision(&self, index: usize) -> WorkflowState {
        if self.all_decided() {
            WorkflowState::BatchSummary
        } else {
            WorkflowState::ConflictReview(index)
        }
    }

    /// Rename every decided show, one conflict at a time.
    ///
    /// Must be called in `Applying`. Failures are counted per conflict and
    /// the batch carries on, except after a safety violation, which leaves
    /// the remaining conflicts untouched. Always ends in `Done`.
    pub fn apply_batch(
        &mut self,
        cleaner: &Cleaner,
        base_paths: &[PathBuf],
        mut snapshot: Option<&mut BackupSnapshot>,
        progress: &ProgressReporter,
    ) -> Result<BatchRenameOutcome, WorkflowError> {
        if self.state != WorkflowState::Applying {
            return Err(WorkflowError::InvalidTransition {
                state: self.state,
                action: WorkflowAction::ConfirmSummary,
            });
        }

        let mut outcome = BatchRenameOutcome::default();
        progress.start(self.conflicts.len() as u64, "Applying title decisions");
        progress.stage(Stage::Applying, "Renaming shows");

        for (i, conflict) in self.conflicts.iter().enumerate() {
            let Some(new_title) = conflict.effective_title() else {
                outcome.skipped += 1;
                progress.update(i as u64 + 1, format!("Skipped {}", conflict.folder_path.display()));
                continue;
            };
            let old_title = conflict.current_title();

            match cleaner.rename_show(base_paths, &old_title, new_title, snapshot.as_deref_mut()) {
                Ok(show) => {
                    let failed = show.failed();
                    if failed > 0 {
                        outcome.failures += 1;
                        progress.error(format!(
                            "{} of {} renames failed for {}",
                            failed,
                            show.renames.len(),
                            old_title
                        ));
                    }
                    outcome.results.push((conflict.folder_path.clone(), show.renames));
                    if let Some(violation) = show.safety_violation {
                        warn!(show = %old_title, violation = %violation, "Safety violation, abandoning remaining renames");
                        progress.critical(format!("Safety violation: {}", violation));
                        outcome.safety_violation = Some(violation);
                        break;
                    }
                }
                Err(e) => {
                    warn!(show = %old_title, error = %e, "Show rename failed");
                    progress.error(format!("Rename of {} failed: {}", old_title, e));
                    outcome.failures += 1;
                    outcome.results.push((conflict.folder_path.clone(), Vec::new()));
                }
            }
            progress.update(i as u64 + 1, format!("Renamed {}", old_title));
        }

        self.state = WorkflowState::Done;
        info!(
            renamed = outcome.results.len(),
            skipped = outcome.skipped,
            failures = outcome.failures,
            aborted = outcome.safety_violation.is_some(),
            "Title decisions applied"
        );
        progress.complete("Title decisions applied");
        Ok(outcome)
    }
}
