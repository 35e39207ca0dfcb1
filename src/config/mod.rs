//! Application configuration management

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::error::SweepError;
use crate::services::backup::BackupManager;
use crate::services::cleaner::SafetyConfig;
use crate::services::filename_parser::is_video_file;
use crate::services::progress::LogLevel;
use crate::services::rate_limiter::RetryConfig;
use crate::services::text_utils::DEFAULT_SIMILARITY_THRESHOLD;
use crate::services::title_resolver::VerifierConfig;
use crate::services::walker::{LibraryWalk, WalkEvent};

/// Most videos counted when sampling a root for content
const VIDEO_SAMPLE_LIMIT: usize = 10;

/// Name of the scratch file used to test that a root accepts writes
const WRITE_TEST_FILE: &str = ".mediasweep_write_test";

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Movie library roots
    pub movie_paths: Vec<PathBuf>,

    /// TV library roots
    pub tv_paths: Vec<PathBuf>,

    /// Cleaner safety rules
    pub safety: SafetyConfig,

    /// Similarity above which two titles count as the same
    pub similarity_threshold: f64,

    /// Where scan reports are written
    pub report_dir: PathBuf,

    /// Where backup snapshots are stored
    pub backup_dir: PathBuf,

    /// Progress stream verbosity
    pub log_level: LogLevel,

    /// Metadata lookup bounds
    pub lookup: VerifierConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            movie_paths: Vec::new(),
            tv_paths: Vec::new(),
            safety: SafetyConfig::default(),
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            report_dir: default_data_dir().join("reports"),
            backup_dir: BackupManager::default_dir(),
            log_level: LogLevel::default(),
            lookup: VerifierConfig::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("./data"))
        .join("mediasweep")
}

fn path_list(value: &str) -> Vec<PathBuf> {
    env::split_paths(value)
        .filter(|p| !p.as_os_str().is_empty())
        .collect()
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key/value source
    pub fn from_lookup<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let protected = get("MEDIASWEEP_PROTECTED_PATHS")
            .map(|v| path_list(&v))
            .filter(|paths| !paths.is_empty())
            .unwrap_or(defaults.safety.protected_paths);

        let safety = SafetyConfig {
            protected_paths: protected,
            max_delete_bytes: get("MEDIASWEEP_MAX_DELETE_BYTES")
                .unwrap_or_else(|| "0".to_string())
                .parse()
                .context("Invalid MEDIASWEEP_MAX_DELETE_BYTES")?,
            dry_run: get("MEDIASWEEP_DRY_RUN")
                .map(|v| !(v == "false" || v == "0"))
                .unwrap_or(true),
            ..defaults.safety
        };

        let log_level = match get("MEDIASWEEP_LOG_LEVEL") {
            Some(value) => LogLevel::parse(&value)
                .with_context(|| format!("Invalid MEDIASWEEP_LOG_LEVEL: {}", value))?,
            None => LogLevel::default(),
        };

        let lookup = VerifierConfig {
            retry: RetryConfig {
                max_retries: get("MEDIASWEEP_LOOKUP_RETRIES")
                    .unwrap_or_else(|| "3".to_string())
                    .parse()
                    .context("Invalid MEDIASWEEP_LOOKUP_RETRIES")?,
                ..Default::default()
            },
            timeout: Duration::from_secs(
                get("MEDIASWEEP_LOOKUP_TIMEOUT_SECS")
                    .unwrap_or_else(|| "10".to_string())
                    .parse()
                    .context("Invalid MEDIASWEEP_LOOKUP_TIMEOUT_SECS")?,
            ),
            ..defaults.lookup
        };

        Ok(Self {
            movie_paths: get("MEDIASWEEP_MOVIE_PATHS")
                .map(|v| path_list(&v))
                .unwrap_or_default(),

            tv_paths: get("MEDIASWEEP_TV_PATHS")
                .map(|v| path_list(&v))
                .unwrap_or_default(),

            safety,

            similarity_threshold: get("MEDIASWEEP_SIMILARITY_THRESHOLD")
                .unwrap_or_else(|| DEFAULT_SIMILARITY_THRESHOLD.to_string())
                .parse()
                .context("Invalid MEDIASWEEP_SIMILARITY_THRESHOLD")?,

            report_dir: get("MEDIASWEEP_REPORT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.report_dir),

            backup_dir: get("MEDIASWEEP_BACKUP_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.backup_dir),

            log_level,

            lookup,
        })
    }

    /// Check every root and keep only the accessible ones, symlinks resolved.
    ///
    /// Inaccessible roots are dropped with a warning. Fails only when no
    /// root at all is usable. Pass `require_writable` for runs that rename
    /// or delete.
    pub fn check_libraries(
        &mut self,
        require_writable: bool,
    ) -> std::result::Result<LibraryValidation, SweepError> {
        let movies = validate_library_paths(&self.movie_paths, require_writable);
        let tv = validate_library_paths(&self.tv_paths, require_writable);
        self.movie_paths = movies.accessible().collect();
        self.tv_paths = tv.accessible().collect();

        let mut validation = movies;
        validation.checks.extend(tv.checks);
        validation.warnings.extend(tv.warnings);
        if !validation.can_proceed() {
            return Err(SweepError::Validation(format!(
                "no accessible library roots: {}",
                validation.warnings.join("; ")
            )));
        }
        Ok(validation)
    }

    /// All configured roots, movies first
    pub fn all_roots(&self) -> Vec<PathBuf> {
        self.movie_paths.iter().chain(&self.tv_paths).cloned().collect()
    }

    /// Reject configurations no run should start with
    pub fn validate(&self) -> std::result::Result<(), SweepError> {
        if self.movie_paths.is_empty() && self.tv_paths.is_empty() {
            return Err(SweepError::Validation(
                "no library roots configured (set MEDIASWEEP_MOVIE_PATHS or MEDIASWEEP_TV_PATHS)"
                    .into(),
            ));
        }
        if !(self.similarity_threshold > 0.0 && self.similarity_threshold <= 1.0) {
            return Err(SweepError::Validation(format!(
                "similarity threshold {} is outside (0, 1]",
                self.similarity_threshold
            )));
        }
        if let Some(root) = self.all_roots().iter().find(|p| p.is_relative()) {
            return Err(SweepError::Validation(format!(
                "library root must be absolute: {}",
                root.display()
            )));
        }
        Ok(())
    }
}

/// Accessibility of one library root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathCheck {
    pub path: PathBuf,
    /// The path with symlinks resolved, once it is known to exist
    pub resolved: Option<PathBuf>,
    pub readable: bool,
    /// Only tested when writes are required
    pub writable: bool,
    /// Videos seen while sampling, at most [`VIDEO_SAMPLE_LIMIT`]
    pub video_sample: usize,
    pub error: Option<String>,
}

impl PathCheck {
    pub fn is_accessible(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcome of checking a set of library roots
#[derive(Debug, Clone, Default)]
pub struct LibraryValidation {
    pub checks: Vec<PathCheck>,
    pub warnings: Vec<String>,
}

impl LibraryValidation {
    /// True when at least one root can be scanned
    pub fn can_proceed(&self) -> bool {
        self.checks.iter().any(PathCheck::is_accessible)
    }

    /// Resolved paths of the accessible roots
    pub fn accessible(&self) -> impl Iterator<Item = PathBuf> + '_ {
        self.checks
            .iter()
            .filter(|check| check.is_accessible())
            .filter_map(|check| check.resolved.clone())
    }
}

/// Check that `path` is an existing, readable (and optionally writable) directory
pub fn check_library_path(path: &Path, require_writable: bool) -> PathCheck {
    let mut check = PathCheck {
        path: path.to_path_buf(),
        resolved: None,
        readable: false,
        writable: false,
        video_sample: 0,
        error: None,
    };

    let resolved = match path.canonicalize() {
        Ok(resolved) => resolved,
        Err(e) => {
            check.error = Some(format!("cannot access {}: {}", path.display(), e));
            return check;
        }
    };
    check.resolved = Some(resolved.clone());

    if !resolved.is_dir() {
        check.error = Some(format!("{} is not a directory", path.display()));
        return check;
    }
    if let Err(e) = fs::read_dir(&resolved) {
        check.error = Some(format!("cannot read {}: {}", path.display(), e));
        return check;
    }
    check.readable = true;

    if require_writable {
        let scratch = resolved.join(WRITE_TEST_FILE);
        match fs::File::create(&scratch).and_then(|file| {
            drop(file);
            fs::remove_file(&scratch)
        }) {
            Ok(()) => check.writable = true,
            Err(e) => {
                check.error = Some(format!("cannot write to {}: {}", path.display(), e));
                return check;
            }
        }
    }

    check.video_sample = LibraryWalk::new(&resolved)
        .filter(|event| matches!(event, WalkEvent::File { path, .. } if is_video_file(path)))
        .take(VIDEO_SAMPLE_LIMIT)
        .count();
    check
}

/// Check each root, collecting a warning for every unusable or empty one
pub fn validate_library_paths(paths: &[PathBuf], require_writable: bool) -> LibraryValidation {
    let mut validation = LibraryValidation::default();
    for path in paths {
        let check = check_library_path(path, require_writable);
        match &check.error {
            Some(error) => {
                warn!(path = %path.display(), error = %error, "Skipping inaccessible library root");
                validation.warnings.push(error.clone());
            }
            None if check.video_sample == 0 => {
                warn!(path = %path.display(), "No video files found in library root");
                validation
                    .warnings
                    .push(format!("no video files found in {}", path.display()));
            }
            None => debug!(path = %path.display(), videos = check.video_sample, "Library root is accessible"),
        }
        validation.checks.push(check);
    }
    validation
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults_are_safe() {
        let config = load(&[]).unwrap();
        assert!(config.safety.dry_run);
        assert_eq!(config.safety.max_delete_bytes, 0);
        assert!(config.safety.protected_paths.contains(&PathBuf::from("/etc")));
        assert!((config.similarity_threshold - 0.85).abs() < f64::EPSILON);
        assert_eq!(config.lookup.retry.max_retries, 3);
        assert_matches!(config.validate(), Err(SweepError::Validation(_)));
    }

    #[test]
    fn test_reads_paths_and_overrides() {
        let config = load(&[
            ("MEDIASWEEP_MOVIE_PATHS", "/mnt/movies:/mnt/movies2"),
            ("MEDIASWEEP_TV_PATHS", "/mnt/tv"),
            ("MEDIASWEEP_PROTECTED_PATHS", "/mnt/keep"),
            ("MEDIASWEEP_MAX_DELETE_BYTES", "1000"),
            ("MEDIASWEEP_DRY_RUN", "false"),
            ("MEDIASWEEP_LOG_LEVEL", "verbose"),
        ])
        .unwrap();
        assert_eq!(config.movie_paths.len(), 2);
        assert_eq!(config.tv_paths, vec![PathBuf::from("/mnt/tv")]);
        assert_eq!(config.safety.protected_paths, vec![PathBuf::from("/mnt/keep")]);
        assert_eq!(config.safety.max_delete_bytes, 1000);
        assert!(!config.safety.dry_run);
        assert_eq!(config.log_level, LogLevel::Verbose);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_values() {
        assert!(load(&[("MEDIASWEEP_MAX_DELETE_BYTES", "lots")]).is_err());
        assert!(load(&[("MEDIASWEEP_LOG_LEVEL", "loud")]).is_err());

        let config = load(&[
            ("MEDIASWEEP_MOVIE_PATHS", "relative/movies"),
            ("MEDIASWEEP_SIMILARITY_THRESHOLD", "0.9"),
        ])
        .unwrap();
        assert_matches!(config.validate(), Err(SweepError::Validation(_)));

        let config = load(&[
            ("MEDIASWEEP_MOVIE_PATHS", "/movies"),
            ("MEDIASWEEP_SIMILARITY_THRESHOLD", "1.5"),
        ])
        .unwrap();
        assert_matches!(config.validate(), Err(SweepError::Validation(_)));
    }

    #[test]
    fn test_check_library_path() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("Heat (1995)")).unwrap();
        fs::write(dir.path().join("Heat (1995)/Heat (1995).mkv"), b"x").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let check = check_library_path(dir.path(), true);
        assert!(check.is_accessible());
        assert!(check.readable && check.writable);
        assert_eq!(check.video_sample, 1);
        assert!(!dir.path().join(WRITE_TEST_FILE).exists());

        let missing = check_library_path(&dir.path().join("missing"), false);
        assert!(!missing.is_accessible());
        assert!(missing.resolved.is_none());

        let file = check_library_path(&dir.path().join("notes.txt"), false);
        assert!(file.error.unwrap().contains("not a directory"));
    }

    #[test]
    fn test_check_libraries_drops_unusable_roots() {
        let movies = tempfile::tempdir().unwrap();
        let tv = tempfile::tempdir().unwrap();
        let mut config = Config {
            movie_paths: vec![movies.path().to_path_buf(), movies.path().join("gone")],
            tv_paths: vec![tv.path().to_path_buf()],
            ..Default::default()
        };

        let validation = config.check_libraries(false).unwrap();
        assert_eq!(validation.checks.len(), 3);
        assert_eq!(config.movie_paths, vec![movies.path().canonicalize().unwrap()]);
        assert_eq!(config.tv_paths.len(), 1);
        // one missing root plus two empty ones
        assert_eq!(validation.warnings.len(), 3);

        let mut config = Config {
            movie_paths: vec![movies.path().join("gone")],
            ..Default::default()
        };
        assert_matches!(config.check_libraries(false), Err(SweepError::Validation(_)));
    }
}
