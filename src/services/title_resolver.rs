//! TV show title conflict detection
//!
//! For shows stored as `Show (Year)/Season N/episode`, the title implied by
//! the show folder is compared against the title implied by the episode
//! filenames. Shows whose titles genuinely disagree become
//! [`TvTitleConflict`]s for the decision workflow. An optional metadata
//! lookup can annotate conflicts, but never removes them.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::filename_parser;
use super::progress::ProgressReporter;
use super::rate_limiter::{DirectLimiter, RateLimitConfig, RetryConfig, retry_async};
use super::scanner::{self, walk_videos};
use super::text_utils::{self, DEFAULT_SIMILARITY_THRESHOLD};
use crate::error::{Result, SweepError};

/// Words that usually mean a title is a release group or codec, not a show
const GARBAGE_WORDS: &[&str] = &[
    "airtv", "rarbg", "ntb", "playweb", "dimension", "lol", "killers", "ettv", "eztv", "yts",
    "yify", "sparks", "fgt", "ion10", "x264", "x265", "h264", "h265", "hevc", "web", "webrip",
    "webdl", "hdtv", "bluray", "amzn", "nf",
];

/// Markers whose presence in a raw name lowers confidence
const RELEASE_MARKERS: &[&str] = &["1080P", "720P", "X264", "X265", "BLURAY", "WEB-DL"];

/// Known show subtitles that legitimately extend a title
const SHOW_SUBTITLES: &[&str] = &[
    "the series",
    "the animated series",
    "the next generation",
    "the original series",
    "deep space nine",
    "voyager",
    "enterprise",
];

/// Where a title candidate was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TitleSource {
    Folder,
    Filename,
}

/// A title extracted from a folder name or a filename
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TitleCandidate {
    pub title: String,
    pub year: Option<u16>,
    /// Confidence in `0.0..=1.0`
    pub confidence: f64,
    pub source: TitleSource,
}

impl TitleCandidate {
    /// Extract a candidate from a raw folder or file name
    pub fn extract(raw: &str, source: TitleSource) -> Option<Self> {
        let (title, year) = filename_parser::extract_show_title(raw);
        if title.is_empty() {
            return None;
        }
        Some(Self {
            confidence: title_confidence(&title, raw),
            title,
            year,
            source,
        })
    }
}

/// The user's choice for a conflict
///
/// The custom title lives inside its variant so there is exactly one place
/// a chosen title can come from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "decision", content = "title", rename_all = "snake_case")]
pub enum UserDecision {
    #[default]
    Undecided,
    FolderTitle,
    FilenameTitle,
    CustomTitle(String),
    Skipped,
}

impl UserDecision {
    pub fn is_decided(&self) -> bool {
        !matches!(self, UserDecision::Undecided)
    }
}

impl fmt::Display for UserDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserDecision::Undecided => write!(f, "undecided"),
            UserDecision::FolderTitle => write!(f, "folder title"),
            UserDecision::FilenameTitle => write!(f, "filename title"),
            UserDecision::CustomTitle(title) => write!(f, "custom title '{}'", title),
            UserDecision::Skipped => write!(f, "skipped"),
        }
    }
}

/// A show whose folder and filename titles disagree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TvTitleConflict {
    pub folder_path: PathBuf,
    pub folder_match: Option<TitleCandidate>,
    pub filename_match: Option<TitleCandidate>,
    pub reason: String,
    pub api_verified: bool,
    /// Suggested title shown to the user
    pub resolved_title: String,
    pub confidence: f64,
    /// Episode files found under the show folder
    pub episode_count: usize,
    pub(super) decision: UserDecision,
}

impl TvTitleConflict {
    pub fn decision(&self) -> &UserDecision {
        &self.decision
    }

    /// Custom title, when that is the decision
    pub fn custom_title(&self) -> Option<&str> {
        match &self.decision {
            UserDecision::CustomTitle(title) => Some(title),
            _ => None,
        }
    }

    /// Title a rename should apply, or `None` when nothing is renamed
    pub fn effective_title(&self) -> Option<&str> {
        match &self.decision {
            UserDecision::FolderTitle => self.folder_match.as_ref().map(|c| c.title.as_str()),
            UserDecision::FilenameTitle => self.filename_match.as_ref().map(|c| c.title.as_str()),
            UserDecision::CustomTitle(title) => Some(title.as_str()),
            UserDecision::Skipped | UserDecision::Undecided => None,
        }
    }

    /// Current on-disk title of the show folder
    pub fn current_title(&self) -> String {
        self.folder_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| filename_parser::extract_show_title(n).0)
            .unwrap_or_default()
    }

    /// Higher-confidence candidate title. Ties favour the folder.
    pub fn preferred_title(&self) -> Option<&str> {
        match (&self.folder_match, &self.filename_match) {
            (Some(folder), Some(file)) if file.confidence > folder.confidence => Some(&file.title),
            (Some(folder), _) => Some(&folder.title),
            (None, Some(file)) => Some(&file.title),
            (None, None) => None,
        }
    }
}

/// Outcome of comparing two title candidates
#[derive(Debug, Clone, PartialEq)]
pub struct TitleComparison {
    pub ambiguous: bool,
    pub resolved_title: String,
    pub confidence: f64,
    pub reason: String,
}

/// Whether a title consists mostly of release-group or codec words
pub fn is_garbage_title(title: &str) -> bool {
    let words: Vec<String> = title.split_whitespace().map(str::to_lowercase).collect();
    if words.is_empty() || !title.chars().any(char::is_alphabetic) {
        return true;
    }
    let garbage = words
        .iter()
        .filter(|w| GARBAGE_WORDS.contains(&w.as_str()))
        .count();
    garbage * 2 >= words.len()
}

/// Confidence that `title`, extracted from `original`, is the real show title
pub fn title_confidence(title: &str, original: &str) -> f64 {
    let mut confidence: f64 = 1.0;

    if is_garbage_title(title) {
        confidence -= 0.8;
    }
    if title.chars().count() < 3 {
        confidence -= 0.5;
    }
    if !title.contains(' ') {
        confidence -= 0.3;
    }
    if original.contains('(') && original.contains(')') {
        confidence += 0.1;
    }
    let upper = original.to_uppercase();
    if RELEASE_MARKERS.iter().any(|m| upper.contains(m)) {
        confidence -= 0.1;
    }

    confidence.clamp(0.0, 1.0)
}

fn looks_like_show_subtitle(text: &str) -> bool {
    let lower = text.to_lowercase();
    if SHOW_SUBTITLES.iter().any(|s| lower.contains(s)) {
        return true;
    }
    let words: Vec<&str> = lower.split_whitespace().collect();
    (2..=3).contains(&words.len()) && words[0] == "the"
}

fn length_slack(len: usize) -> usize {
    (len * 30 / 100).max(5)
}

/// Compare folder and filename candidates and decide whether they conflict
pub fn compare_titles(
    folder: &TitleCandidate,
    filename: &TitleCandidate,
    threshold: f64,
) -> TitleComparison {
    let keep_folder = |reason: &str| TitleComparison {
        ambiguous: false,
        resolved_title: folder.title.clone(),
        confidence: folder.confidence,
        reason: reason.to_string(),
    };

    if folder.title.eq_ignore_ascii_case(&filename.title) {
        return keep_folder("Folder and filename titles match");
    }

    let folder_lower = folder.title.to_lowercase();
    let file_lower = filename.title.to_lowercase();
    let folder_len = folder.title.chars().count();
    let file_len = filename.title.chars().count();

    if file_len + 2 < folder_len
        && !file_lower.contains(' ')
        && text_utils::token_set_ratio(&folder_lower, &file_lower) > 0.99
    {
        return keep_folder("Filename is an incomplete fragment of the folder title");
    }

    if let Some(extra) = folder_lower.strip_prefix(&file_lower) {
        let extra = extra.trim_start_matches([' ', ':', '-']).trim();
        if !extra.is_empty()
            && (extra.starts_with("with ") || extra.starts_with("the ") || looks_like_show_subtitle(extra))
        {
            return keep_folder("Folder contains the complete show title with host or subtitle");
        }
    }

    if text_utils::squash(&folder.title) == text_utils::squash(&filename.title) {
        return keep_folder("Titles are essentially the same (minor formatting differences)");
    }

    let folder_key = filename_parser::normalize(&folder.title);
    let file_key = filename_parser::normalize(&filename.title);
    if text_utils::titles_compatible(&folder_key.title, &file_key.title, threshold) {
        return keep_folder("Titles differ only slightly");
    }

    if file_len > folder_len + length_slack(folder_len) {
        if folder_len < 5 {
            return TitleComparison {
                ambiguous: true,
                resolved_title: filename.title.clone(),
                confidence: filename.confidence * 0.8,
                reason: "Folder title is very short, filename provides a more complete title"
                    .to_string(),
            };
        }
        if let Some(extra) = file_lower.strip_prefix(&format!("{} ", folder_lower)) {
            if !looks_like_show_subtitle(extra) {
                return keep_folder("Filename includes an episode title after the show name");
            }
            return TitleComparison {
                ambiguous: true,
                resolved_title: filename.title.clone(),
                confidence: filename.confidence * 0.8,
                reason: "Filename contains a show subtitle not in the folder name".to_string(),
            };
        }
        return TitleComparison {
            ambiguous: true,
            resolved_title: filename.title.clone(),
            confidence: filename.confidence * 0.8,
            reason: "Filename has a significantly longer title".to_string(),
        };
    }

    if folder_len > file_len + length_slack(file_len) {
        return TitleComparison {
            ambiguous: true,
            resolved_title: folder.title.clone(),
            confidence: folder.confidence * 0.85,
            reason: "Folder has a significantly longer title than the filename".to_string(),
        };
    }

    TitleComparison {
        ambiguous: true,
        resolved_title: folder.title.clone(),
        confidence: 0.5,
        reason: format!(
            "Conflicting titles: '{}' (folder) vs '{}' (filename)",
            folder.title, filename.title
        ),
    }
}

/// A title confirmed by the metadata capability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedTitle {
    /// Provider-specific series identifier
    pub id: String,
    pub title: String,
    pub year: Option<u16>,
}

/// Pluggable metadata capability
///
/// `Ok(None)` means the provider answered and knows no such show. `Err`
/// means the provider could not answer and the call may be retried.
#[async_trait]
pub trait MetadataLookup: Send + Sync {
    async fn lookup(&self, title: &str, year: Option<u16>) -> anyhow::Result<Option<VerifiedTitle>>;

    fn name(&self) -> &str {
        "metadata"
    }
}

/// Result of a verified lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    Verified(VerifiedTitle),
    NotFound,
    Unavailable(String),
}

/// Lookup results for one scan run
#[derive(Debug, Default)]
pub struct LookupCache {
    entries: RwLock<HashMap<(String, Option<u16>), LookupResult>>,
}

impl LookupCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(title: &str, year: Option<u16>) -> (String, Option<u16>) {
        (title.trim().to_lowercase(), year)
    }

    pub fn get(&self, title: &str, year: Option<u16>) -> Option<LookupResult> {
        self.entries.read().get(&Self::key(title, year)).cloned()
    }

    pub fn insert(&self, title: &str, year: Option<u16>, result: LookupResult) {
        self.entries.write().insert(Self::key(title, year), result);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Settings for bounded lookups
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    pub retry: RetryConfig,
    /// Time allowed for a single attempt
    pub timeout: Duration,
    pub rate_limit: RateLimitConfig,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            timeout: Duration::from_secs(10),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// Rate-limited, retried and cached access to a [`MetadataLookup`]
pub struct MetadataVerifier {
    lookup: Arc<dyn MetadataLookup>,
    cache: Arc<LookupCache>,
    limiter: Arc<DirectLimiter>,
    config: VerifierConfig,
}

impl MetadataVerifier {
    pub fn new(lookup: Arc<dyn MetadataLookup>, cache: Arc<LookupCache>, config: VerifierConfig) -> Self {
        Self {
            limiter: config.rate_limit.build(),
            lookup,
            cache,
            config,
        }
    }

    /// Look up a title, consulting the session cache first
    pub async fn verify(&self, title: &str, year: Option<u16>) -> LookupResult {
        if let Some(cached) = self.cache.get(title, year) {
            debug!(title = title, "Lookup cache hit");
            return cached;
        }

        let lookup = &self.lookup;
        let limiter = &self.limiter;
        let timeout = self.config.timeout;
        let outcome = retry_async(
            move || async move {
                limiter.until_ready().await;
                match tokio::time::timeout(timeout, lookup.lookup(title, year)).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow!("lookup timed out after {:?}", timeout)),
                }
            },
            &self.config.retry,
            self.lookup.name(),
        )
        .await;

        let result = match outcome {
            Ok(Some(verified)) => LookupResult::Verified(verified),
            Ok(None) => LookupResult::NotFound,
            Err(e) => {
                warn!(title = title, provider = self.lookup.name(), error = %e, "Metadata lookup unavailable");
                LookupResult::Unavailable(e.to_string())
            }
        };
        self.cache.insert(title, year, result.clone());
        result
    }

    /// Annotate a conflict with lookup results for both candidates
    pub async fn verify_conflict(&self, conflict: &mut TvTitleConflict) {
        let folder = match &conflict.folder_match {
            Some(c) => self.verify(&c.title, c.year).await,
            None => LookupResult::NotFound,
        };
        let filename = match &conflict.filename_match {
            Some(c) => self.verify(&c.title, c.year.or(conflict.folder_match.as_ref().and_then(|f| f.year))).await,
            None => LookupResult::NotFound,
        };

        match (folder, filename) {
            (LookupResult::Verified(a), LookupResult::Verified(b)) if a.id == b.id => {
                conflict.api_verified = true;
                conflict.reason = format!("{}; both titles match '{}'", conflict.reason, a.title);
                conflict.resolved_title = a.title;
            }
            (LookupResult::Verified(a), LookupResult::Verified(b)) => {
                conflict.api_verified = true;
                conflict.confidence = 0.6;
                conflict.reason = format!(
                    "{}; folder matches '{}' but filename matches '{}'",
                    conflict.reason, a.title, b.title
                );
            }
            (LookupResult::Verified(a), _) => {
                conflict.api_verified = true;
                conflict.reason = format!("{}; folder title verified as '{}'", conflict.reason, a.title);
                conflict.resolved_title = a.title;
            }
            (_, LookupResult::Verified(b)) => {
                conflict.api_verified = true;
                conflict.reason = format!("{}; filename title verified as '{}'", conflict.reason, b.title);
                conflict.resolved_title = b.title;
            }
            _ => {
                debug!(show = %conflict.folder_path.display(), "No verification available");
            }
        }
    }
}

/// Folder-vs-filename comparison for one episode file
#[derive(Debug, Clone)]
pub struct ShowResolution {
    pub folder_path: PathBuf,
    pub folder_match: TitleCandidate,
    pub filename_match: TitleCandidate,
    pub comparison: TitleComparison,
}

impl ShowResolution {
    fn into_conflict(self, episode_count: usize) -> TvTitleConflict {
        TvTitleConflict {
            folder_path: self.folder_path,
            folder_match: Some(self.folder_match),
            filename_match: Some(self.filename_match),
            reason: self.comparison.reason,
            api_verified: false,
            resolved_title: self.comparison.resolved_title,
            confidence: self.comparison.confidence,
            episode_count,
            decision: UserDecision::Undecided,
        }
    }
}

/// Detects title conflicts across TV roots
#[derive(Debug, Clone)]
pub struct TitleResolver {
    threshold: f64,
}

impl Default for TitleResolver {
    fn default() -> Self {
        Self::new(DEFAULT_SIMILARITY_THRESHOLD)
    }
}

impl TitleResolver {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Compare the show folder title with the filename title of one episode.
    ///
    /// Only season-folder layouts have a separate show folder, so other
    /// layouts yield `None`.
    pub fn resolve_file(&self, path: &Path, root: &Path) -> Option<ShowResolution> {
        let file_name = path.file_name()?.to_str()?;
        filename_parser::parse_episode(file_name)?;

        let season_dir = path.parent()?;
        if season_dir == root || !scanner::is_season_folder(season_dir.file_name()?.to_str()?) {
            return None;
        }
        let show_dir = season_dir.parent()?;
        if show_dir == root || !show_dir.starts_with(root) {
            return None;
        }
        let show_name = show_dir.file_name()?.to_str()?;

        let folder_match = TitleCandidate::extract(show_name, TitleSource::Folder)?;
        let filename_match = TitleCandidate::extract(file_name, TitleSource::Filename)?;
        let comparison = compare_titles(&folder_match, &filename_match, self.threshold);

        Some(ShowResolution {
            folder_path: show_dir.to_path_buf(),
            folder_match,
            filename_match,
            comparison,
        })
    }

    /// Walk one TV root and collect ambiguous shows, in folder order
    pub fn scan_root(
        &self,
        root: &Path,
        token: &CancellationToken,
        reporter: &ProgressReporter,
    ) -> Result<Vec<TvTitleConflict>> {
        info!(root = %root.display(), "Resolving TV titles");
        let mut shows: BTreeMap<PathBuf, (Option<ShowResolution>, usize)> = BTreeMap::new();

        walk_videos(root, "title resolution", token, reporter, |path, _| {
            let Some(resolution) = self.resolve_file(&path, root) else {
                return;
            };
            let entry = shows
                .entry(resolution.folder_path.clone())
                .or_insert((None, 0));
            entry.1 += 1;
            if entry.0.is_none() {
                entry.0 = Some(resolution);
            }
        })?;

        let conflicts: Vec<TvTitleConflict> = shows
            .into_values()
            .filter_map(|(resolution, count)| {
                let resolution = resolution?;
                resolution
                    .comparison
                    .ambiguous
                    .then(|| resolution.into_conflict(count))
            })
            .collect();

        reporter.issues_found(conflicts.len() as u64);
        info!(root = %root.display(), conflicts = conflicts.len(), "TV titles resolved");
        Ok(conflicts)
    }

    /// Annotate every conflict using the metadata capability
    pub async fn verify_all(
        conflicts: &mut [TvTitleConflict],
        verifier: &MetadataVerifier,
        token: &CancellationToken,
        reporter: &ProgressReporter,
    ) -> Result<()> {
        let total = conflicts.len() as u64;
        reporter.set_total(total);
        for (i, conflict) in conflicts.iter_mut().enumerate() {
            if token.is_cancelled() {
                return Err(SweepError::cancelled("title verification"));
            }
            verifier.verify_conflict(conflict).await;
            reporter.update(i as u64 + 1, format!("Verified {}", conflict.resolved_title));
        }
        Ok(())
    }
}
