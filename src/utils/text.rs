//! Character-aware truncation helpers.

/// Truncate `s` to at most `max` characters, never splitting a code point.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Truncate `s` to `max` characters and append a marker naming how many
/// characters were dropped. Strings within the limit are returned as-is.
pub fn truncate_with_marker(s: &str, max: usize) -> String {
    let total = s.chars().count();
    if total <= max {
        return s.to_string();
    }
    let omitted = total - max;
    format!(
        "{}\n...[truncated {} characters]",
        truncate_chars(s, max),
        omitted
    )
}
