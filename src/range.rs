//! Range parsing, ETag comparison, and ETag derivation (spec §4.5, §4.6).
//!
//! Grounded in `original_source/cdn/utils/content-range-value.go` (range
//! grammar) and `cdn/utils/etag.go` / `cdn/backends/filesystem/filesystem.go`
//! (the two independent ETag formulas kept intentionally distinct — see
//! DESIGN.md).

use sha1::{Digest, Sha1};
use std::time::SystemTime;

/// A `(start, length)` window into an object's bytes. Always constructed
/// with `length >= 1` and `start + length <= size` (spec §3,
/// `ContentRangeValue`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub length: u64,
}

impl ContentRange {
    pub fn end_inclusive(&self) -> u64 {
        self.start + self.length - 1
    }

    /// Renders the `Content-Range: bytes a-b/size` field value.
    pub fn to_field(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end_inclusive(), total)
    }
}

/// Parses a `Range: bytes=...` header against an object of `size` bytes
/// (spec §4.5). Unparsable or out-of-bounds specs are dropped individually
/// rather than rejecting the whole header; an empty result means the caller
/// should treat the range as unsatisfiable.
pub fn parse_ranges(range_header: &str, size: u64) -> Vec<ContentRange> {
    let Some(spec) = range_header.strip_prefix("bytes=") else {
        return Vec::new();
    };
    spec.split(',')
        .filter_map(|part| parse_one_range(part.trim(), size))
        .collect()
}

fn parse_one_range(part: &str, size: u64) -> Option<ContentRange> {
    let (before, after) = part.split_once('-')?;
    let before = before.trim();
    let after = after.trim();

    let parsed_before: Option<u64> = if before.is_empty() {
        None
    } else {
        before.parse().ok()
    };
    let parsed_after: Option<u64> = if after.is_empty() {
        None
    } else {
        after.parse().ok()
    };

    match (parsed_before, parsed_after) {
        (Some(a), Some(b)) if b > a && b < size => Some(ContentRange {
            start: a,
            length: b - a + 1,
        }),
        (Some(a), None) if a < size => Some(ContentRange {
            start: a,
            length: size - a,
        }),
        (None, Some(n)) if n >= 1 && n <= size => Some(ContentRange {
            start: size - n,
            length: n,
        }),
        _ => None,
    }
}

/// Strips the surrounding quotes from a single ETag token (weak prefix and
/// all): `"abc"` -> `abc`. Returns `None` for unquoted or empty input.
pub fn strip_etag(raw: &str) -> Option<&str> {
    let raw = raw.trim();
    let start = raw.find('"')? + 1;
    let end = raw.rfind('"')?;
    if end > start {
        Some(&raw[start..end])
    } else {
        None
    }
}

/// Splits a comma-separated `If-Match`/`If-None-Match` header into stripped
/// ETag values, dropping elements that don't parse.
pub fn parse_etag_list(raw: &str) -> Vec<&str> {
    raw.split(',').filter_map(|s| strip_etag(s.trim())).collect()
}

fn sha1_quoted(value: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(value.as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(2 + digest.len() * 2);
    hex.push('"');
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex.push('"');
    hex
}

/// Zone-level fallback ETag (spec §4.6), used when the backend has no
/// ETag of its own: `"` + hex(SHA-1(`"<http-date>:<size>"`)) + `"`.
pub fn zone_fallback_etag(mtime: SystemTime, size: i64) -> String {
    sha1_quoted(&format!("{}:{}", httpdate::fmt_http_date(mtime), size))
}

/// Filesystem-backend ETag (spec §4.2): `"` + hex(SHA-1(`"<size>:<http-date>"`)) + `"`.
/// Note the operand order is swapped relative to [`zone_fallback_etag`] —
/// this mirrors the two independent ETag paths in the original
/// implementation and is preserved intentionally (see DESIGN.md).
pub fn filesystem_etag(size: i64, mtime: SystemTime) -> String {
    sha1_quoted(&format!("{}:{}", size, httpdate::fmt_http_date(mtime)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn range_a_b() {
        let r = parse_ranges("bytes=0-4", 11);
        assert_eq!(r, vec![ContentRange { start: 0, length: 5 }]);
    }

    #[test]
    fn range_suffix() {
        let r = parse_ranges("bytes=-5", 11);
        assert_eq!(r, vec![ContentRange { start: 6, length: 5 }]);
    }

    #[test]
    fn range_open_ended() {
        let r = parse_ranges("bytes=6-", 11);
        assert_eq!(r, vec![ContentRange { start: 6, length: 5 }]);
    }

    #[test]
    fn range_multi() {
        let r = parse_ranges("bytes=0-4,6-10", 11);
        assert_eq!(
            r,
            vec![
                ContentRange { start: 0, length: 5 },
                ContentRange { start: 6, length: 5 },
            ]
        );
    }

    #[test]
    fn range_out_of_bounds_is_dropped() {
        let r = parse_ranges("bytes=100-200", 11);
        assert!(r.is_empty());
    }

    #[test]
    fn range_malformed_has_no_dash() {
        let r = parse_ranges("bytes=abc", 11);
        assert!(r.is_empty());
    }

    #[test]
    fn etag_strip() {
        assert_eq!(strip_etag("\"abc123\""), Some("abc123"));
        assert_eq!(strip_etag("W/\"abc123\""), Some("abc123"));
        assert_eq!(strip_etag("abc123"), None);
    }

    #[test]
    fn etag_list_split() {
        assert_eq!(parse_etag_list("\"a\", \"b\""), vec!["a", "b"]);
    }

    #[test]
    fn etag_is_deterministic() {
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        assert_eq!(zone_fallback_etag(t, 11), zone_fallback_etag(t, 11));
        assert_eq!(filesystem_etag(11, t), filesystem_etag(11, t));
        assert_ne!(zone_fallback_etag(t, 11), filesystem_etag(11, t));
    }
}
