//! Literal glob matching for classifier rule conditions.
//!
//! Semantics:
//! - Matching is case-sensitive and performs no path normalisation:
//!   `/sandbox/../x` does not match `/sandbox/**` because `**` never
//!   matches a `.` or `..` segment.
//! - `*` matches any run of characters within one path segment (never `/`).
//! - `?` matches exactly one character within a segment.
//! - A segment consisting solely of `**` matches zero or more whole
//!   segments (dot segments excluded).
//! - `!(pattern)` wrapping the whole pattern inverts the match.

/// Match `value` against `pattern`.
pub fn matches(value: &str, pattern: &str) -> bool {
    // Whole-pattern negation: `!(p)` is the exact complement of `p`.
    if let Some(inner) = pattern.strip_prefix("!(").and_then(|rest| rest.strip_suffix(')')) {
        return !matches(value, inner);
    }

    let value_segs: Vec<&str> = value.split('/').collect();
    let pattern_segs: Vec<&str> = pattern.split('/').collect();
    match_segments(&value_segs, &pattern_segs)
}

fn match_segments(value: &[&str], pattern: &[&str]) -> bool {
    match pattern.first() {
        None => value.is_empty(),
        Some(&"**") => {
            let rest = &pattern[1..];
            // Zero segments consumed.
            if match_segments(value, rest) {
                return true;
            }
            // Consume one non-dot segment and retry with `**` still active.
            match value.first() {
                Some(seg) if *seg != "." && *seg != ".." => {
                    match_segments(&value[1..], pattern)
                }
                _ => false,
            }
        }
        Some(seg_pattern) => match value.first() {
            Some(seg) => {
                match_one_segment(seg, seg_pattern) && match_segments(&value[1..], &pattern[1..])
            }
            None => false,
        },
    }
}

/// Match a single path segment against a segment pattern (`*`/`?` wildcards).
fn match_one_segment(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    match_chars(&text, &pattern)
}

fn match_chars(text: &[char], pattern: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('*') => {
            // Collapse consecutive stars; within a segment `**` degrades to `*`.
            let mut rest = &pattern[1..];
            while rest.first() == Some(&'*') {
                rest = &rest[1..];
            }
            (0..=text.len()).any(|i| match_chars(&text[i..], rest))
        }
        Some('?') => !text.is_empty() && match_chars(&text[1..], &pattern[1..]),
        Some(c) => text.first() == Some(c) && match_chars(&text[1..], &pattern[1..]),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
