//! Filename parser and normalizer for library names
//!
//! Turns names like:
//! - "Movie.2024.1080p.BluRay.x264-GROUP.mkv"
//! - "The Nun II (2023)"
//! - "Breaking.Bad.S01E01.720p.HDTV.x264-CTU.mkv"
//!
//! into comparable keys, episode codes and quality tags.

use std::fmt;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Video file extensions we recognize
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "avi", "mov", "wmv", "flv", "webm", "m4v", "mpg", "mpeg", "m2ts", "ts",
];

/// Sidecar extensions dropped alongside video extensions
const SUBTITLE_EXTENSIONS: &[&str] = &["srt", "sub", "ass", "ssa", "idx"];

/// Titles shorter than this are unresolved and never grouped
pub const MIN_TITLE_LEN: usize = 3;

/// Release markers that are never part of a title
const STRONG_NOISE: &[&str] = &[
    "2160p", "1080p", "720p", "480p", "576p", "4k", "uhd", "bluray", "bdrip", "brrip", "bdremux",
    "remux", "webdl", "webrip", "hdtv", "hdrip", "dvdrip", "dvdscr", "x264", "x265", "h264",
    "h265", "hevc", "avc", "xvid", "divx", "av1", "10bit", "8bit", "hdr", "hdr10", "hdr10plus",
    "dovi", "aac", "ac3", "eac3", "dts", "dtshd", "truehd", "atmos", "ddp", "ddp5", "dd5", "flac",
];

/// Edition markers trimmed only from the end of a title
const WEAK_NOISE: &[&str] = &[
    "extended", "unrated", "uncut", "remastered", "proper", "repack", "internal", "limited",
    "commentary", "imax",
];

/// Words that turn a trailing "cut" into an edition marker
const EDITION_WORDS: &[&str] = &["directors", "extended", "theatrical", "special", "ultimate"];

static BRACKETED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[[^\]]*\]|\{[^}]*\}").expect("valid bracket regex"));

static AUDIO_CHANNELS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:ddp|dd|aac|eac3|ac3|dts|truehd|atmos|flac|opus)?[257]\.[01]\b")
        .expect("valid channel regex")
});

static MARKER_ALIASES: Lazy<[(Regex, &'static str); 6]> = Lazy::new(|| {
    [
        (Regex::new(r"blu-?ray").expect("valid"), "bluray"),
        (Regex::new(r"web-?dl").expect("valid"), "webdl"),
        (Regex::new(r"web-?rip").expect("valid"), "webrip"),
        (Regex::new(r"\bh\.?26([45])").expect("valid"), "h26$1"),
        (Regex::new(r"dts-hd").expect("valid"), "dtshd"),
        (Regex::new(r"hdr10\+").expect("valid"), "hdr10plus"),
    ]
});

static RELEASE_GROUP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-[a-z0-9]+$").expect("valid release group regex"));

static SXXEYY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[Ss](\d{1,2})[Ee](\d{1,2})").expect("valid episode regex"));

static NXNN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{1,2})[xX](\d{2})\b").expect("valid episode regex"));

static PAREN_YEAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\((\d{4})\)").expect("valid year regex"));

static RESOLUTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(2160p|4k|uhd|1080p|720p|480p)").expect("valid regex"));

static WEB_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bWEB\b").expect("valid web regex"));

/// Canonical comparable key for a movie or show name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NormalizedName {
    pub title: String,
    pub year: Option<u16>,
}

impl NormalizedName {
    /// Whether the title is long enough to take part in grouping
    pub fn is_resolved(&self) -> bool {
        self.title.chars().count() >= MIN_TITLE_LEN
    }
}

impl fmt::Display for NormalizedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.year {
            Some(year) => write!(f, "{} ({})", self.title, year),
            None => write!(f, "{}", self.title),
        }
    }
}

/// Season and episode parsed from a filename
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EpisodeCode {
    pub season: u32,
    pub episode: u32,
}

impl fmt::Display for EpisodeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{:02}E{:02}", self.season, self.episode)
    }
}

/// Resolution tag of a media file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    #[serde(rename = "2160p")]
    Uhd2160,
    #[serde(rename = "1080p")]
    Fhd1080,
    #[serde(rename = "720p")]
    Hd720,
    #[serde(rename = "480p")]
    Sd480,
    Unknown,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Uhd2160 => write!(f, "2160p"),
            Resolution::Fhd1080 => write!(f, "1080p"),
            Resolution::Hd720 => write!(f, "720p"),
            Resolution::Sd480 => write!(f, "480p"),
            Resolution::Unknown => write!(f, "unknown"),
        }
    }
}

/// Source or rip type of a media file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Remux,
    BluRay,
    WebDl,
    Web,
    Hdtv,
    DvdRip,
    Unknown,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Remux => write!(f, "REMUX"),
            Source::BluRay => write!(f, "BLURAY"),
            Source::WebDl => write!(f, "WEB-DL"),
            Source::Web => write!(f, "WEB"),
            Source::Hdtv => write!(f, "HDTV"),
            Source::DvdRip => write!(f, "DVDRIP"),
            Source::Unknown => write!(f, "unknown"),
        }
    }
}

/// Check whether a path has a video extension
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| VIDEO_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn strip_extension(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, ext)) => {
            let ext = ext.to_lowercase();
            if VIDEO_EXTENSIONS.contains(&ext.as_str()) || SUBTITLE_EXTENSIONS.contains(&ext.as_str())
            {
                stem
            } else {
                name
            }
        }
        None => name,
    }
}

fn is_strong_noise(token: &str) -> bool {
    STRONG_NOISE.contains(&token)
}

fn roman_to_digit(token: &str) -> &str {
    match token {
        "ii" => "2",
        "iii" => "3",
        "iv" => "4",
        "vi" => "6",
        "vii" => "7",
        "viii" => "8",
        "ix" => "9",
        other => other,
    }
}

fn parse_year(token: &str) -> Option<u16> {
    if token.len() != 4 || !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    token.parse::<u16>().ok().filter(|y| (1900..=2099).contains(y))
}

/// Normalize a raw file or folder name into a comparable key
///
/// Case is folded, extensions and release markers are stripped, and the
/// name is cut at the last year token. The leading token is never taken as
/// a year so names like "2012" keep a title.
pub fn normalize(raw: &str) -> NormalizedName {
    let mut lowered = strip_extension(raw.trim()).to_lowercase();
    lowered = BRACKETED_RE.replace_all(&lowered, " ").into_owned();
    lowered = AUDIO_CHANNELS_RE.replace_all(&lowered, " ").into_owned();
    for (re, replacement) in MARKER_ALIASES.iter() {
        lowered = re.replace_all(&lowered, *replacement).into_owned();
    }

    let has_markers = lowered
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(is_strong_noise);
    if has_markers {
        lowered = RELEASE_GROUP_RE.replace(&lowered, "").into_owned();
    }

    let mut cleaned = String::with_capacity(lowered.len());
    for c in lowered.chars() {
        match c {
            '&' => cleaned.push_str(" and "),
            '\'' | '\u{2019}' => {}
            c if c.is_alphanumeric() => cleaned.push(c),
            _ => cleaned.push(' '),
        }
    }

    let mut tokens: Vec<&str> = cleaned.split_whitespace().map(roman_to_digit).collect();

    let mut year = None;
    if let Some(idx) = (1..tokens.len()).rev().find(|&i| parse_year(tokens[i]).is_some()) {
        year = parse_year(tokens[idx]);
        tokens.truncate(idx);
    }

    let mut title: Vec<&str> = Vec::with_capacity(tokens.len());
    for (i, token) in tokens.iter().copied().enumerate() {
        let after_marker = i > 0 && is_strong_noise(tokens[i - 1]);
        if is_strong_noise(token) || (token == "web" && after_marker) {
            continue;
        }
        title.push(token);
    }

    loop {
        let trailing = match title.as_slice() {
            [.., last] if WEAK_NOISE.contains(last) => 1,
            [.., edition, "cut"] if EDITION_WORDS.contains(edition) => 2,
            _ => 0,
        };
        if trailing == 0 {
            break;
        }
        title.truncate(title.len() - trailing);
    }

    // Nothing but markers before the year: the year is the title.
    let mut title = title.join(" ");
    if title.is_empty()
        && let Some(digits) = year.take()
    {
        title = digits.to_string();
    }

    let normalized = NormalizedName { title, year };
    trace!(raw = raw, title = %normalized.title, year = ?normalized.year, "Normalized name");
    normalized
}

/// Parse an episode code (S01E02 or 1x02) from a filename
pub fn parse_episode(filename: &str) -> Option<EpisodeCode> {
    let caps = SXXEYY_RE
        .captures(filename)
        .or_else(|| NXNN_RE.captures(filename))?;
    let season = caps.get(1)?.as_str().parse().ok()?;
    let episode = caps.get(2)?.as_str().parse().ok()?;
    Some(EpisodeCode { season, episode })
}

/// Byte range of the first episode code in a name
fn episode_span(name: &str) -> Option<(usize, usize)> {
    SXXEYY_RE
        .find(name)
        .or_else(|| NXNN_RE.find(name))
        .map(|m| (m.start(), m.end()))
}

/// Rebuild an episode filename under a new show title.
///
/// `Old.Show.S01E02.Pilot.mkv` becomes `New Show S01E02.Pilot.mkv`: the
/// code is re-emitted as `SxxEyy` and everything after it is kept.
pub fn retitle_episode(file_name: &str, new_title: &str) -> Option<String> {
    let code = parse_episode(file_name)?;
    let (_, end) = episode_span(file_name)?;
    Some(format!("{} {}{}", new_title.trim(), code, &file_name[end..]))
}

/// Parse a resolution tag from a name
pub fn parse_resolution(name: &str) -> Resolution {
    match RESOLUTION_RE
        .captures(name)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_lowercase())
        .as_deref()
    {
        Some("2160p") | Some("4k") | Some("uhd") => Resolution::Uhd2160,
        Some("1080p") => Resolution::Fhd1080,
        Some("720p") => Resolution::Hd720,
        Some("480p") => Resolution::Sd480,
        _ => Resolution::Unknown,
    }
}

/// Parse a source tag from a name
pub fn parse_source(name: &str) -> Source {
    let upper = name.to_uppercase();

    if upper.contains("REMUX") {
        Source::Remux
    } else if upper.contains("BLURAY")
        || upper.contains("BLU-RAY")
        || upper.contains("BDRIP")
        || upper.contains("BRRIP")
    {
        Source::BluRay
    } else if upper.contains("WEB-DL") || upper.contains("WEBDL") {
        Source::WebDl
    } else if upper.contains("WEBRIP") || WEB_RE.is_match(&upper) {
        Source::Web
    } else if upper.contains("HDTV") {
        Source::Hdtv
    } else if upper.contains("DVDRIP") {
        Source::DvdRip
    } else {
        Source::Unknown
    }
}

/// Resolution and source for a file, falling back to its folder name
pub fn parse_quality(path: &Path) -> (Resolution, Source) {
    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let parent_name = path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .unwrap_or("");

    let mut resolution = parse_resolution(file_name);
    if resolution == Resolution::Unknown {
        resolution = parse_resolution(parent_name);
    }
    let mut source = parse_source(file_name);
    if source == Source::Unknown {
        source = parse_source(parent_name);
    }
    (resolution, source)
}

/// Extract a display title and year from a show folder or episode filename
///
/// The year is only taken from a parenthesised `(YYYY)`. Everything from the
/// first episode code onward is dropped, as are release markers. Words are
/// capitalised for display.
pub fn extract_show_title(name: &str) -> (String, Option<u16>) {
    let stem = strip_extension(name.trim());

    let year = PAREN_YEAR_RE
        .captures(stem)
        .and_then(|caps| caps.get(1))
        .and_then(|m| parse_year(m.as_str()));

    let before_episode = match episode_span(stem) {
        Some((start, _)) => &stem[..start],
        None => stem,
    };

    let without_year = PAREN_YEAR_RE.replace_all(before_episode, " ");
    let without_groups = BRACKETED_RE.replace_all(&without_year, " ");
    let spaced: String = without_groups
        .chars()
        .map(|c| match c {
            '.' | '_' => ' ',
            c => c,
        })
        .collect();

    let words: Vec<String> = spaced
        .split_whitespace()
        .filter(|w| !is_strong_noise(&w.to_lowercase()))
        .filter(|w| parse_year(w).is_none() || year.is_none())
        .map(capitalize)
        .collect();

    let title = words
        .join(" ")
        .trim_matches(|c: char| c == '-' || c == ' ')
        .to_string();
    (title, year)
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
