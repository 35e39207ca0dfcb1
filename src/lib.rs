//! Mediasweep - duplicate detection and safe cleanup for media libraries
//!
//! Scans movie and TV roots for duplicate files, picks the best copy of
//! each, flags TV shows whose folder and file names disagree, and applies
//! deletions and renames behind protected-path, depth and size-cap checks
//! with a revertible backup journal.

pub mod config;
pub mod error;
pub mod services;

pub use config::Config;
pub use error::{Result, SafetyViolation, SweepError};
