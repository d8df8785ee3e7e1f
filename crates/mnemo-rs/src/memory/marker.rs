//! The compaction marker embedded at the top of a compacted summary.
//!
//! Two forms exist:
//!
//! - `[COMPRESSED SUMMARY as of 2024-01-15 09:30]`: first compaction, count 1
//! - `[COMPRESSED 3x as of 2024-01-15 09:30]`: count 3
//!
//! The marker is the only record of how many times a summary has been
//! compacted. It is plain text inside the summary, so the generator may
//! mangle or drop an older one; parsing is forgiving and falls back to 0.

use chrono::{DateTime, Local};

const MARKER_PREFIX: &str = "[COMPRESSED ";
const FIRST_MARKER_PREFIX: &str = "[COMPRESSED SUMMARY as of";
const COUNT_SUFFIX: &str = "x as of";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Parsed compaction marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionMarker {
    pub count: u32,
}

impl CompressionMarker {
    /// Find the compaction count recorded in `text`. A numbered marker wins
    /// over the first-compaction form; no marker means 0.
    pub fn parse_count(text: &str) -> u32 {
        Self::find_numbered(text)
            .or_else(|| text.contains(FIRST_MARKER_PREFIX).then_some(1))
            .unwrap_or(0)
    }

    fn find_numbered(text: &str) -> Option<u32> {
        text.match_indices(MARKER_PREFIX).find_map(|(idx, _)| {
            let rest = text.get(idx + MARKER_PREFIX.len()..)?;
            let digits_end = rest
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(rest.len());
            if digits_end == 0 {
                return None;
            }
            let (digits, tail) = rest.split_at(digits_end);
            if !tail.starts_with(COUNT_SUFFIX) {
                return None;
            }
            digits.parse().ok()
        })
    }

    /// Render the marker for compaction number `count` at `at`.
    pub fn render(count: u32, at: DateTime<Local>) -> String {
        let ts = at.format(TIMESTAMP_FORMAT);
        if count <= 1 {
            format!("{FIRST_MARKER_PREFIX} {ts}]")
        } else {
            format!("{MARKER_PREFIX}{count}{COUNT_SUFFIX} {ts}]")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 1, 15, 9, 30, 0).unwrap()
    }

    #[test]
    fn unmarked_text_has_count_zero() {
        assert_eq!(CompressionMarker::parse_count(""), 0);
        assert_eq!(CompressionMarker::parse_count("[2024-01-15 09:30] likes tea"), 0);
        assert_eq!(CompressionMarker::parse_count("[COMPRESSED x as of nothing]"), 0);
    }

    #[test]
    fn first_form_counts_as_one() {
        let text = "[COMPRESSED SUMMARY as of 2024-01-15 09:30]\n\nlikes tea";
        assert_eq!(CompressionMarker::parse_count(text), 1);
    }

    #[test]
    fn numbered_form_reports_its_count() {
        let text = "[COMPRESSED 7x as of 2024-01-15 09:30]\n\nlikes tea";
        assert_eq!(CompressionMarker::parse_count(text), 7);
    }

    #[test]
    fn numbered_marker_wins_over_first_form() {
        let text = "[COMPRESSED SUMMARY as of 2024-01-01 00:00]\nold\n[COMPRESSED 4x as of 2024-02-01 00:00]";
        assert_eq!(CompressionMarker::parse_count(text), 4);
    }

    #[test]
    fn render_uses_first_form_for_count_one() {
        assert_eq!(
            CompressionMarker::render(1, at()),
            "[COMPRESSED SUMMARY as of 2024-01-15 09:30]"
        );
        assert_eq!(
            CompressionMarker::render(3, at()),
            "[COMPRESSED 3x as of 2024-01-15 09:30]"
        );
    }

    #[test]
    fn rendered_markers_parse_back() {
        for count in 1..=5 {
            let text = format!("{}\n\nbody", CompressionMarker::render(count, at()));
            assert_eq!(CompressionMarker::parse_count(&text), count);
        }
    }
}
