//! Deterministic extraction from the raw utterance.

use std::sync::LazyLock;

use regex::Regex;

/// Matches size-limit phrases like "under 500MB", "max 2 GB",
/// "not more than 1GB", "up to 0.5 gb".
static SIZE_LIMIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:under|below|max(?:imum)?|not more than|no more than|up to|at most|less than)\s*:?\s*([0-9]+(?:\.[0-9]+)?)\s*(mb|gb|megabytes?|gigabytes?)\b",
    )
    .expect("size-limit regex is valid")
});

/// Parses a dataset size cap in GB out of the utterance, if one is phrased.
///
/// MB values are divided by 1024. Parsing the same utterance twice always
/// yields the same answer.
#[must_use]
pub fn parse_size_limit_gb(utterance: &str) -> Option<f64> {
    let captures = SIZE_LIMIT.captures(utterance)?;
    let value: f64 = captures.get(1)?.as_str().parse().ok()?;
    let unit = captures.get(2)?.as_str().to_lowercase();

    let gb = if unit.starts_with('m') {
        value / 1024.0
    } else {
        value
    };
    (gb > 0.0).then_some(gb)
}

/// Derives a short title from the utterance for plans with a missing name.
#[must_use]
pub fn derive_title(utterance: &str) -> String {
    let mut title = String::new();
    for word in utterance.split_whitespace() {
        if !title.is_empty() {
            title.push(' ');
        }
        title.push_str(word);
        if title.len() >= 60 {
            break;
        }
    }
    truncate_at_boundary(&mut title, 60);
    if title.is_empty() {
        "Untitled Project".to_string()
    } else {
        title
    }
}

/// Truncates to at most `max` bytes without splitting a character.
pub(crate) fn truncate_at_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}
