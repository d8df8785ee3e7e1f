//! Char-safe length and truncation helpers.
//!
//! All sizes in this crate are counted in Unicode scalar values, matching
//! SQLite's `LENGTH()` on TEXT, so never slice by byte offset.

/// Length in chars.
pub fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// The first `max_chars` chars of `s`.
pub fn head_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => s.get(..idx).unwrap_or(s),
        None => s,
    }
}

/// The last `max_chars` chars of `s`.
pub fn tail_chars(s: &str, max_chars: usize) -> &str {
    let len = char_len(s);
    if len <= max_chars {
        return s;
    }
    if max_chars == 0 {
        return "";
    }
    match s.char_indices().nth(len - max_chars) {
        Some((idx, _)) => s.get(idx..).unwrap_or(s),
        None => s,
    }
}

/// Cut `s` to `max_chars` chars and append `notice` when anything was cut.
pub fn truncate_with_notice(s: &str, max_chars: usize, notice: &str) -> (String, bool) {
    if char_len(s) > max_chars {
        let mut out = head_chars(s, max_chars).to_string();
        out.push_str(notice);
        (out, true)
    } else {
        (s.to_string(), false)
    }
}
