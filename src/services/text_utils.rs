//! Shared text comparison utilities
//!
//! Similarity scores are in `0.0..=1.0`. Inputs are expected to be
//! normalized already (see [`super::filename_parser::normalize`]).

use std::collections::BTreeSet;

use rapidfuzz::distance::levenshtein;

/// Default similarity above which two titles count as the same
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.85;

/// Calculate similarity between two strings (0.0 to 1.0).
/// Uses rapidfuzz normalized Levenshtein similarity.
pub fn string_similarity(s1: &str, s2: &str) -> f64 {
    if s1.is_empty() && s2.is_empty() {
        return 1.0;
    }

    levenshtein::normalized_similarity(s1.chars(), s2.chars())
}

/// Word-order independent similarity that tolerates extra words on one side.
///
/// Shared words are compared against each side's full word set and the best
/// of the pairwise scores wins, so "office" vs "the office" scores 1.0.
pub fn token_set_ratio(s1: &str, s2: &str) -> f64 {
    let a: BTreeSet<&str> = s1.split_whitespace().collect();
    let b: BTreeSet<&str> = s2.split_whitespace().collect();

    let shared: Vec<&str> = a.intersection(&b).copied().collect();
    let only_a: Vec<&str> = a.difference(&b).copied().collect();
    let only_b: Vec<&str> = b.difference(&a).copied().collect();

    if shared.is_empty() {
        let sorted_a: Vec<&str> = a.into_iter().collect();
        let sorted_b: Vec<&str> = b.into_iter().collect();
        return string_similarity(&sorted_a.join(" "), &sorted_b.join(" "));
    }

    let base = shared.join(" ");
    let with_a = join_words(&base, &only_a);
    let with_b = join_words(&base, &only_b);

    string_similarity(&base, &with_a)
        .max(string_similarity(&base, &with_b))
        .max(string_similarity(&with_a, &with_b))
}

fn join_words(base: &str, extra: &[&str]) -> String {
    if extra.is_empty() {
        base.to_string()
    } else {
        format!("{} {}", base, extra.join(" "))
    }
}

/// Purely numeric words, used to keep sequels apart
pub fn numeric_tokens(s: &str) -> BTreeSet<&str> {
    s.split_whitespace()
        .filter(|t| t.chars().all(|c| c.is_ascii_digit()))
        .collect()
}

/// Whether two normalized titles are close enough to be the same title.
///
/// Titles carrying different numbers never match ("iron man 2" vs
/// "iron man 3") regardless of edit distance.
pub fn titles_compatible(a: &str, b: &str, threshold: f64) -> bool {
    if a == b {
        return true;
    }
    if numeric_tokens(a) != numeric_tokens(b) {
        return false;
    }
    string_similarity(a, b) > threshold
}

/// Collapse a title to lowercase letters and digits only
pub fn squash(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_similarity() {
        assert!((string_similarity("matrix", "matrix") - 1.0).abs() < f64::EPSILON);
        assert!(string_similarity("", "") > 0.99);
        assert!(string_similarity("spiderman", "spider man") > 0.85);
        assert!(string_similarity("alien", "heat") < 0.5);
    }

    #[test]
    fn test_token_set_ratio() {
        assert!(token_set_ratio("office", "the office") > 0.99);
        assert!(token_set_ratio("wars star", "star wars") > 0.99);
        assert!(token_set_ratio("alien", "predator") < 0.5);
    }

    #[test]
    fn test_titles_compatible_guards_numbers() {
        assert!(titles_compatible("the nun 2", "the nun 2", 0.85));
        assert!(titles_compatible("spiderman", "spider man", 0.85));
        assert!(!titles_compatible("iron man 2", "iron man 3", 0.85));
        assert!(!titles_compatible("alien", "aliens vs predator", 0.85));
    }

    #[test]
    fn test_squash() {
        assert_eq!(squash("Spider-Man: Homecoming"), "spidermanhomecoming");
    }
}
