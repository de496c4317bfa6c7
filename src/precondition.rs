//! Precondition and range evaluation as a pure function (spec §4.5; REDESIGN
//! FLAGS recommendation in spec §9 and SPEC_FULL §4.5).
//!
//! Grounded in `original_source/cdn/process-preconditions.go` and
//! `content-range-value.go`. Deliberately takes plain `(headers, resource
//! metadata, policy)` and returns a terminal-or-plan value with no I/O —
//! the ordering rules (P3) are subtle enough to deserve a function the
//! zone handler can call without threading sockets or locks through it.

use std::time::{Duration, SystemTime};

use crate::range::{self, ContentRange};

/// The four conditional headers the precondition engine reads, evaluated in
/// this exact order (spec §4.5, P3).
#[derive(Default, Clone, Copy)]
pub struct Validators<'a> {
    pub if_none_match: Option<&'a str>,
    pub if_match: Option<&'a str>,
    pub if_modified_since: Option<&'a str>,
    pub if_unmodified_since: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreconditionOutcome {
    NotModified,
    PreconditionFailed,
    Continue,
}

/// HTTP dates carry only second resolution; truncate before comparing so a
/// mtime with sub-second precision doesn't spuriously fail an equality
/// check against a parsed `If-Modified-Since` value.
fn truncate_to_second(t: SystemTime) -> SystemTime {
    let dur = t.duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default();
    SystemTime::UNIX_EPOCH + Duration::from_secs(dur.as_secs())
}

fn etag_list_matches(header_value: &str, etag: &str) -> bool {
    if etag.is_empty() {
        return false;
    }
    if header_value.trim() == "*" {
        return true;
    }
    let Some(stripped) = range::strip_etag(etag) else {
        return false;
    };
    range::parse_etag_list(header_value).iter().any(|e| *e == stripped)
}

/// Evaluates If-None-Match, then If-Match, then If-Modified-Since, then
/// If-Unmodified-Since, stopping at the first terminal result (spec §4.5
/// steps 1-5, P3).
pub fn evaluate_preconditions(v: &Validators, etag: &str, mtime: SystemTime) -> PreconditionOutcome {
    if let Some(inm) = v.if_none_match {
        if etag_list_matches(inm, etag) {
            return PreconditionOutcome::NotModified;
        }
    }

    if let Some(im) = v.if_match {
        if !etag.is_empty() && !etag_list_matches(im, etag) {
            return PreconditionOutcome::PreconditionFailed;
        }
    }

    if let Some(ims) = v.if_modified_since {
        if let Ok(parsed) = httpdate::parse_http_date(ims) {
            if truncate_to_second(mtime) <= parsed {
                return PreconditionOutcome::NotModified;
            }
        }
    }

    if let Some(ius) = v.if_unmodified_since {
        if let Ok(parsed) = httpdate::parse_http_date(ius) {
            if truncate_to_second(mtime) > parsed {
                return PreconditionOutcome::PreconditionFailed;
            }
        }
    }

    PreconditionOutcome::Continue
}

/// Outcome of range evaluation (spec §4.5 range rules; the "Range list"
/// design note in spec §9).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangePlan {
    /// No `Range` header, ranges disabled, or `If-Range` mismatched: send
    /// the full body with status 200.
    Full,
    /// One valid range: status 206, single `Content-Range`.
    Single(ContentRange),
    /// Two or more valid ranges: status 206, `multipart/byteranges`.
    Multi(Vec<ContentRange>),
    /// Client sent `Range` but every spec in it was out of bounds or
    /// unparsable: status 416.
    Unsatisfiable,
}

/// Compares `If-Range` against the resource's validators. A date that fails
/// to parse, or an ETag that doesn't match, falls back to the whole body
/// rather than rejecting the request (spec §4.5).
fn if_range_matches(if_range: &str, etag: &str, mtime: SystemTime) -> bool {
    if let Ok(parsed) = httpdate::parse_http_date(if_range) {
        return truncate_to_second(mtime) == parsed;
    }
    match range::strip_etag(if_range) {
        Some(tag) => range::strip_etag(etag).map(|e| e == tag).unwrap_or(false),
        None => false,
    }
}

/// Full range pipeline: `If-Range` gate, then `Range:` parsing against
/// `size`, then single-vs-multipart classification (spec §4.5).
#[allow(clippy::too_many_arguments)]
pub fn evaluate_range(
    allow_range: bool,
    range_header: Option<&str>,
    if_range: Option<&str>,
    etag: &str,
    mtime: SystemTime,
    size: u64,
) -> RangePlan {
    if !allow_range {
        return RangePlan::Full;
    }
    let Some(rh) = range_header else {
        return RangePlan::Full;
    };
    if let Some(ir) = if_range {
        if !if_range_matches(ir, etag, mtime) {
            return RangePlan::Full;
        }
    }

    let ranges = range::parse_ranges(rh, size);
    match ranges.len() {
        0 => RangePlan::Unsatisfiable,
        1 => RangePlan::Single(ranges[0]),
        _ => RangePlan::Multi(ranges),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    const MTIME_STR: &str = "Mon, 01 Jan 2024 00:00:00 GMT";

    fn mtime() -> SystemTime {
        httpdate::parse_http_date(MTIME_STR).unwrap()
    }

    #[test]
    fn if_none_match_wins_before_if_match() {
        let v = Validators {
            if_none_match: Some("\"e3b0\""),
            if_match: Some("\"different\""),
            ..Default::default()
        };
        // If-Match would fail this request (412), but If-None-Match (304) is
        // evaluated first and wins (P3).
        assert_eq!(evaluate_preconditions(&v, "\"e3b0\"", mtime()), PreconditionOutcome::NotModified);
    }

    #[test]
    fn if_match_fails_when_no_candidate_matches() {
        let v = Validators {
            if_match: Some("\"other\""),
            ..Default::default()
        };
        assert_eq!(evaluate_preconditions(&v, "\"e3b0\"", mtime()), PreconditionOutcome::PreconditionFailed);
    }

    #[test]
    fn if_modified_since_equal_mtime_is_not_modified() {
        let v = Validators {
            if_modified_since: Some(MTIME_STR),
            ..Default::default()
        };
        assert_eq!(evaluate_preconditions(&v, "", mtime()), PreconditionOutcome::NotModified);
    }

    #[test]
    fn if_unmodified_since_fails_when_mtime_is_later() {
        let v = Validators {
            if_unmodified_since: Some(MTIME_STR),
            ..Default::default()
        };
        let later = mtime() + StdDuration::from_secs(60);
        assert_eq!(evaluate_preconditions(&v, "", later), PreconditionOutcome::PreconditionFailed);
    }

    #[test]
    fn no_validators_continues() {
        let v = Validators::default();
        assert_eq!(evaluate_preconditions(&v, "\"x\"", mtime()), PreconditionOutcome::Continue);
    }

    #[test]
    fn range_disabled_is_full_even_with_header() {
        assert_eq!(evaluate_range(false, Some("bytes=0-4"), None, "", mtime(), 11), RangePlan::Full);
    }

    #[test]
    fn single_range_classification() {
        let plan = evaluate_range(true, Some("bytes=0-4"), None, "", mtime(), 11);
        assert_eq!(plan, RangePlan::Single(ContentRange { start: 0, length: 5 }));
    }

    #[test]
    fn multi_range_classification() {
        let plan = evaluate_range(true, Some("bytes=0-4,6-10"), None, "", mtime(), 11);
        assert_eq!(
            plan,
            RangePlan::Multi(vec![
                ContentRange { start: 0, length: 5 },
                ContentRange { start: 6, length: 5 },
            ])
        );
    }

    #[test]
    fn unsatisfiable_range_is_reported() {
        let plan = evaluate_range(true, Some("bytes=100-200"), None, "", mtime(), 11);
        assert_eq!(plan, RangePlan::Unsatisfiable);
    }

    #[test]
    fn if_range_mismatch_falls_back_to_full() {
        let plan = evaluate_range(
            true,
            Some("bytes=0-4"),
            Some("Mon, 01 Jan 2024 00:00:01 GMT"),
            "",
            mtime(),
            11,
        );
        assert_eq!(plan, RangePlan::Full);
    }

    #[test]
    fn if_range_etag_match_permits_range() {
        let plan = evaluate_range(true, Some("bytes=0-4"), Some("\"abc\""), "\"abc\"", mtime(), 11);
        assert_eq!(plan, RangePlan::Single(ContentRange { start: 0, length: 5 }));
    }
}
