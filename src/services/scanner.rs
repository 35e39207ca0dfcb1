//! Duplicate detectors for movie and TV libraries
//!
//! Each detector walks one root at a time without shared state and returns
//! keyed files. Keyed files from every root are merged into candidate groups
//! afterwards, so the merge is the only step that sees all roots at once.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::Metadata;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::filename_parser::{self, EpisodeCode, NormalizedName, Resolution, Source};
use super::progress::{ProgressReporter, Stage};
use super::text_utils::{self, DEFAULT_SIMILARITY_THRESHOLD};
use super::walker::{self, LibraryWalk, WalkEvent};
use crate::error::{Result, SweepError};

/// Folder names holding bonus material rather than the feature
const EXTRAS_DIRS: &[&str] = &[
    "extras",
    "featurettes",
    "behind the scenes",
    "deleted scenes",
    "interviews",
    "trailers",
    "samples",
    "shorts",
];

static SEASON_DIR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(season(\b|\d)|specials\b|s\d{1,2}\b)").expect("valid season regex")
});

/// A video file found during a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFile {
    pub path: PathBuf,
    pub size: u64,
    pub resolution: Resolution,
    pub source: Source,
    pub is_empty: bool,
}

impl MediaFile {
    /// Build from a path and its metadata, parsing quality tags from the name
    pub fn from_metadata(path: PathBuf, metadata: &Metadata) -> Self {
        let (resolution, source) = filename_parser::parse_quality(&path);
        let size = metadata.len();
        Self {
            path,
            size,
            resolution,
            source,
            is_empty: size == 0,
        }
    }
}

/// Identity shared by the members of a duplicate group
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GroupKey {
    Movie(NormalizedName),
    Episode { show: String, code: EpisodeCode },
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupKey::Movie(name) => write!(f, "{}", name),
            GroupKey::Episode { show, code } => write!(f, "{}|{}", show, code),
        }
    }
}

/// Files sharing a key, in scan order, before ranking
#[derive(Debug, Clone)]
pub struct CandidateGroup {
    pub key: GroupKey,
    pub files: Vec<MediaFile>,
}

/// A file tagged with the key it groups under
pub type KeyedFile = (GroupKey, MediaFile);

fn is_extras_dir(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| EXTRAS_DIRS.contains(&n.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Whether a folder name starts like "Season 1", "S01" or "Specials".
/// Trailing text such as "Season 01 (2004)" is allowed.
pub fn is_season_folder(name: &str) -> bool {
    SEASON_DIR_RE.is_match(name.trim())
}

/// Shared walk loop: cancellation checks, error policy and progress
pub(crate) fn walk_videos<F>(
    root: &Path,
    stage: &str,
    token: &CancellationToken,
    reporter: &ProgressReporter,
    mut on_file: F,
) -> Result<()>
where
    F: FnMut(PathBuf, &Metadata),
{
    walker::check_root(root)?;
    reporter.stage(Stage::Scanning, format!("Scanning {}", root.display()));

    let mut walk = LibraryWalk::new(root);
    while let Some(event) = walk.next() {
        if token.is_cancelled() {
            info!(root = %root.display(), stage = stage, "Walk cancelled");
            return Err(SweepError::cancelled(stage));
        }

        match event {
            WalkEvent::Dir { path, depth } => {
                if depth > 0 && is_extras_dir(&path) {
                    debug!(path = %path.display(), "Skipping extras folder");
                    walk.skip_current_dir();
                }
            }
            WalkEvent::File { path, metadata } => {
                if !filename_parser::is_video_file(&path) {
                    continue;
                }
                reporter.file_processed(&path);
                on_file(path, &metadata);
            }
            WalkEvent::Error { depth: 0, error, .. } => {
                return Err(SweepError::access(root, error));
            }
            WalkEvent::Error { path, error, .. } => {
                let shown = path
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                warn!(path = %shown, error = %error, "Skipping unreadable entry");
                reporter.warn(format!("Skipped unreadable {}: {}", shown, error));
            }
        }
    }
    Ok(())
}

/// Merge keyed files into groups of at least two members, sorted by key
fn into_groups(
    clusters: Vec<(GroupKey, Vec<MediaFile>)>,
    reporter: &ProgressReporter,
) -> Vec<CandidateGroup> {
    let mut groups: Vec<CandidateGroup> = clusters
        .into_iter()
        .filter(|(_, files)| files.len() >= 2)
        .map(|(key, files)| CandidateGroup { key, files })
        .collect();
    groups.sort_by(|a, b| a.key.cmp(&b.key));
    reporter.duplicates_found(groups.len() as u64);
    groups
}

/// Movie duplicate detector
#[derive(Debug, Clone)]
pub struct MovieDetector {
    threshold: f64,
}

impl Default for MovieDetector {
    fn default() -> Self {
        Self::new(DEFAULT_SIMILARITY_THRESHOLD)
    }
}

impl MovieDetector {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Key for a movie file: its folder name, or the filename when the file
    /// sits directly in the root or the folder name does not resolve.
    pub fn movie_key(path: &Path, root: &Path) -> Option<NormalizedName> {
        let parent = path.parent();
        if let Some(parent) = parent.filter(|p| *p != root) {
            if let Some(name) = parent.file_name().and_then(|n| n.to_str()) {
                let key = filename_parser::normalize(name);
                if key.is_resolved() {
                    return Some(key);
                }
            }
        }
        let file_name = path.file_name()?.to_str()?;
        let key = filename_parser::normalize(file_name);
        key.is_resolved().then_some(key)
    }

    /// Walk one root and key every movie file
    pub fn scan_root(
        &self,
        root: &Path,
        token: &CancellationToken,
        reporter: &ProgressReporter,
    ) -> Result<Vec<KeyedFile>> {
        info!(root = %root.display(), "Scanning movie root");
        let mut keyed = Vec::new();
        walk_videos(root, "movie scan", token, reporter, |path, metadata| {
            match Self::movie_key(&path, root) {
                Some(key) => keyed.push((GroupKey::Movie(key), MediaFile::from_metadata(path, metadata))),
                None => debug!(path = %path.display(), "Unresolved movie title, not grouped"),
            }
        })?;
        info!(root = %root.display(), files = keyed.len(), "Movie root scanned");
        Ok(keyed)
    }

    /// Group keyed files from all roots, merging near-identical titles
    pub fn group(&self, keyed: Vec<KeyedFile>, reporter: &ProgressReporter) -> Vec<CandidateGroup> {
        let mut clusters: Vec<(GroupKey, Vec<MediaFile>)> = Vec::new();
        let mut by_key: HashMap<NormalizedName, usize> = HashMap::new();
        let mut by_year: HashMap<Option<u16>, Vec<usize>> = HashMap::new();
        let mut seen: HashSet<PathBuf> = HashSet::new();

        for (key, file) in keyed {
            let GroupKey::Movie(name) = key else {
                continue;
            };
            if !seen.insert(file.path.clone()) {
                continue;
            }

            if let Some(&idx) = by_key.get(&name) {
                clusters[idx].1.push(file);
                continue;
            }

            let fuzzy = by_year.get(&name.year).and_then(|candidates| {
                candidates.iter().copied().find(|&idx| match &clusters[idx].0 {
                    GroupKey::Movie(rep) => {
                        text_utils::titles_compatible(&rep.title, &name.title, self.threshold)
                    }
                    GroupKey::Episode { .. } => false,
                })
            });

            match fuzzy {
                Some(idx) => {
                    debug!(title = %name, into = %clusters[idx].0, "Fuzzy-merged movie title");
                    by_key.insert(name, idx);
                    clusters[idx].1.push(file);
                }
                None => {
                    let idx = clusters.len();
                    by_year.entry(name.year).or_default().push(idx);
                    by_key.insert(name.clone(), idx);
                    clusters.push((GroupKey::Movie(name), vec![file]));
                }
            }
        }

        into_groups(clusters, reporter)
    }

    /// Scan roots one after another and group the result
    pub fn detect(
        &self,
        roots: &[PathBuf],
        token: &CancellationToken,
        reporter: &ProgressReporter,
    ) -> Result<Vec<CandidateGroup>> {
        let mut keyed = Vec::new();
        for root in roots {
            keyed.extend(self.scan_root(root, token, reporter)?);
        }
        Ok(self.group(keyed, reporter))
    }
}

/// TV episode duplicate detector
#[derive(Debug, Clone, Default)]
pub struct TvDetector;

impl TvDetector {
    pub fn new() -> Self {
        Self
    }

    /// Show name for an episode file.
    ///
    /// Season folders defer to the folder above them. Flat layouts use the
    /// filename title, then the parent folder.
    pub fn show_name(path: &Path, root: &Path) -> Option<String> {
        let parent = path.parent()?;
        let parent_name = parent.file_name().and_then(|n| n.to_str());

        if parent != root && parent_name.is_some_and(is_season_folder) {
            let show_name = parent.parent()?.file_name()?.to_str()?;
            return Some(filename_parser::extract_show_title(show_name).0);
        }

        let file_name = path.file_name()?.to_str()?;
        let (from_file, _) = filename_parser::extract_show_title(file_name);
        if from_file.chars().count() > 2 {
            return Some(from_file);
        }

        if parent == root {
            return None;
        }
        parent_name.map(|n| filename_parser::extract_show_title(n).0)
    }

    /// Group key for an episode file, if it has a code and a resolvable show
    pub fn episode_key(path: &Path, root: &Path) -> Option<GroupKey> {
        let file_name = path.file_name()?.to_str()?;
        let code = filename_parser::parse_episode(file_name)?;
        let show = filename_parser::normalize(&Self::show_name(path, root)?);
        if !show.is_resolved() {
            return None;
        }
        Some(GroupKey::Episode {
            show: show.title,
            code,
        })
    }

    /// Walk one root and key every episode file
    pub fn scan_root(
        &self,
        root: &Path,
        token: &CancellationToken,
        reporter: &ProgressReporter,
    ) -> Result<Vec<KeyedFile>> {
        info!(root = %root.display(), "Scanning TV root");
        let mut keyed = Vec::new();
        walk_videos(root, "tv scan", token, reporter, |path, metadata| {
            match Self::episode_key(&path, root) {
                Some(key) => keyed.push((key, MediaFile::from_metadata(path, metadata))),
                None => debug!(path = %path.display(), "No episode identity, not grouped"),
            }
        })?;
        info!(root = %root.display(), files = keyed.len(), "TV root scanned");
        Ok(keyed)
    }

    /// Group keyed files from all roots by (show, season, episode)
    pub fn group(&self, keyed: Vec<KeyedFile>, reporter: &ProgressReporter) -> Vec<CandidateGroup> {
        let mut clusters: Vec<(GroupKey, Vec<MediaFile>)> = Vec::new();
        let mut by_key: HashMap<GroupKey, usize> = HashMap::new();
        let mut seen: HashSet<PathBuf> = HashSet::new();

        for (key, file) in keyed {
            if !seen.insert(file.path.clone()) {
                continue;
            }
            match by_key.get(&key) {
                Some(&idx) => clusters[idx].1.push(file),
                None => {
                    by_key.insert(key.clone(), clusters.len());
                    clusters.push((key, vec![file]));
                }
            }
        }

        into_groups(clusters, reporter)
    }

    /// Scan roots one after another and group the result
    pub fn detect(
        &self,
        roots: &[PathBuf],
        token: &CancellationToken,
        reporter: &ProgressReporter,
    ) -> Result<Vec<CandidateGroup>> {
        let mut keyed = Vec::new();
        for root in roots {
            keyed.extend(self.scan_root(root, token, reporter)?);
        }
        Ok(self.group(keyed, reporter))
    }
}
