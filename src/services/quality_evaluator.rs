//! Quality scoring and keeper selection
//!
//! Scores are integers: a resolution bucket, a source bucket and up to ten
//! points for file size. Ranking a [`CandidateGroup`] is the only way to
//! build a [`DuplicateGroup`], so every group the cleaner sees has its
//! keeper at index 0.

use serde::Serialize;
use tracing::debug;

use super::filename_parser::{Resolution, Source};
use super::scanner::{CandidateGroup, GroupKey, MediaFile};

/// Score given to zero-byte files so they always rank last
pub const EMPTY_FILE_SCORE: i64 = -1_000;

const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;

/// Maximum points awarded for size
const MAX_SIZE_POINTS: i64 = 10;

/// Points for a resolution tag
pub fn resolution_points(resolution: Resolution) -> i64 {
    match resolution {
        Resolution::Uhd2160 => 400,
        Resolution::Fhd1080 => 300,
        Resolution::Hd720 => 200,
        Resolution::Sd480 => 100,
        Resolution::Unknown => 0,
    }
}

/// Points for a source tag
pub fn source_points(source: Source) -> i64 {
    match source {
        Source::Remux => 50,
        Source::BluRay => 40,
        Source::WebDl => 30,
        Source::Web => 25,
        Source::Hdtv => 20,
        Source::DvdRip => 10,
        Source::Unknown => 0,
    }
}

/// Score a single file
pub fn score(file: &MediaFile) -> i64 {
    if file.is_empty || file.size == 0 {
        return EMPTY_FILE_SCORE;
    }
    let size_points = ((file.size / BYTES_PER_GB) as i64).min(MAX_SIZE_POINTS);
    resolution_points(file.resolution) + source_points(file.source) + size_points
}

/// A file and the score it was ranked by
#[derive(Debug, Clone, Serialize)]
pub struct ScoredFile {
    #[serde(flatten)]
    pub file: MediaFile,
    pub score: i64,
}

/// A ranked duplicate set. Index 0 is the keeper.
#[derive(Debug, Clone, Serialize)]
pub struct DuplicateGroup {
    key: GroupKey,
    files: Vec<ScoredFile>,
}

impl DuplicateGroup {
    pub fn key(&self) -> &GroupKey {
        &self.key
    }

    /// All members, best first
    pub fn files(&self) -> &[ScoredFile] {
        &self.files
    }

    /// The file that is retained
    pub fn keeper(&self) -> &MediaFile {
        &self.files[0].file
    }

    /// Every member except the keeper
    pub fn deletion_candidates(&self) -> impl Iterator<Item = &MediaFile> {
        self.files.iter().skip(1).map(|scored| &scored.file)
    }

    /// Bytes freed by deleting every candidate
    pub fn space_to_free(&self) -> u64 {
        self.deletion_candidates().map(|f| f.size).sum()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Rank a candidate group best-first. Equal scores keep scan order.
///
/// Returns `None` for groups with fewer than two files, which are not
/// duplicate sets.
pub fn rank(group: CandidateGroup) -> Option<DuplicateGroup> {
    if group.files.len() < 2 {
        return None;
    }

    let mut files: Vec<ScoredFile> = group
        .files
        .into_iter()
        .map(|file| ScoredFile {
            score: score(&file),
            file,
        })
        .collect();
    files.sort_by(|a, b| b.score.cmp(&a.score));

    debug!(
        key = %group.key,
        keeper = %files[0].file.path.display(),
        keeper_score = files[0].score,
        members = files.len(),
        "Ranked duplicate group"
    );

    Some(DuplicateGroup {
        key: group.key,
        files,
    })
}

/// Rank every candidate group
pub fn rank_all(groups: Vec<CandidateGroup>) -> Vec<DuplicateGroup> {
    groups.into_iter().filter_map(rank).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::filename_parser::NormalizedName;
    use std::path::PathBuf;

    const GB: u64 = 1024 * 1024 * 1024;

    fn file(name: &str, size: u64, resolution: Resolution, source: Source) -> MediaFile {
        MediaFile {
            path: PathBuf::from(name),
            size,
            resolution,
            source,
            is_empty: size == 0,
        }
    }

    fn key() -> GroupKey {
        GroupKey::Movie(NormalizedName {
            title: "movie".into(),
            year: Some(2024),
        })
    }

    #[test]
    fn test_score_buckets() {
        assert_eq!(score(&file("a", 0, Resolution::Fhd1080, Source::WebDl)), EMPTY_FILE_SCORE);
        assert_eq!(score(&file("a", 5 * GB, Resolution::Fhd1080, Source::Remux)), 355);
        assert_eq!(score(&file("a", 3 * GB, Resolution::Fhd1080, Source::BluRay)), 343);
        assert_eq!(score(&file("a", 2 * GB, Resolution::Fhd1080, Source::WebDl)), 332);
        assert_eq!(score(&file("a", GB, Resolution::Hd720, Source::Hdtv)), 221);
        assert_eq!(score(&file("a", 40 * GB, Resolution::Uhd2160, Source::Unknown)), 410);
    }

    #[test]
    fn test_rank_puts_best_first() {
        let group = CandidateGroup {
            key: key(),
            files: vec![
                file("720", GB, Resolution::Hd720, Source::Web),
                file("2160", 3 * GB, Resolution::Uhd2160, Source::Unknown),
                file("empty", 0, Resolution::Uhd2160, Source::Remux),
            ],
        };
        let ranked = rank(group).unwrap();
        assert_eq!(ranked.keeper().path, PathBuf::from("2160"));
        let max = ranked.files().iter().map(|f| f.score).max().unwrap();
        assert_eq!(ranked.files()[0].score, max);
        let candidates: Vec<_> = ranked.deletion_candidates().map(|f| f.path.clone()).collect();
        assert_eq!(candidates, vec![PathBuf::from("720"), PathBuf::from("empty")]);
    }

    #[test]
    fn test_rank_ties_keep_scan_order() {
        let group = CandidateGroup {
            key: key(),
            files: vec![
                file("first", GB, Resolution::Fhd1080, Source::BluRay),
                file("second", GB, Resolution::Fhd1080, Source::BluRay),
            ],
        };
        let ranked = rank(group).unwrap();
        assert_eq!(ranked.keeper().path, PathBuf::from("first"));
        assert_eq!(ranked.space_to_free(), GB);
    }

    #[test]
    fn test_single_file_is_not_a_group() {
        let group = CandidateGroup {
            key: key(),
            files: vec![file("only", GB, Resolution::Fhd1080, Source::BluRay)],
        };
        assert!(rank(group).is_none());
    }
}
