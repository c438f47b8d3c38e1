//! `matchImages` glob matching, per the driver's wildcard language: `*`
//! means zero-or-more of any character, matched only against the full
//! string (no path-segment semantics as in shell globs).

/// An empty pattern list matches everything, per the driver's source-3
/// rule ("no providers configured" is indistinguishable from "provider
/// matches nothing" only when the list is literally absent — an empty
/// `matchImages` array for a configured provider matches every image).
pub fn wildcard_match_any(patterns: &[String], candidate: &str) -> bool {
    if patterns.is_empty() {
        return true;
    }
    patterns.iter().any(|pattern| wildcard_match(pattern, candidate))
}

pub fn wildcard_match(pattern: &str, candidate: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let candidate: Vec<char> = candidate.chars().collect();
    match_from(&pattern, &candidate)
}

fn match_from(pattern: &[char], candidate: &[char]) -> bool {
    match pattern.first() {
        None => candidate.is_empty(),
        Some('*') => {
            // `*` may consume zero or more characters; try every split.
            (0..=candidate.len()).any(|i| match_from(&pattern[1..], &candidate[i..]))
        }
        Some(c) => match candidate.first() {
            Some(d) if c == d => match_from(&pattern[1..], &candidate[1..]),
            _ => false,
        },
    }
}
