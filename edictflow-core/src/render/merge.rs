//! Merging a rendered section into an existing file

use std::ops::Range;

use super::{CLOSE_SENTINEL, OPEN_SENTINEL};

/// Byte range of the managed span in `existing`
///
/// Covers the opening sentinel through the closing sentinel and the single
/// newline after it. With no closing sentinel the span runs to the end.
fn managed_span(existing: &str) -> Option<(Range<usize>, bool)> {
    let start = existing.find(OPEN_SENTINEL)?;
    let search_from = start + OPEN_SENTINEL.len();
    match existing[search_from..].find(CLOSE_SENTINEL) {
        Some(offset) => {
            let mut end = search_from + offset + CLOSE_SENTINEL.len();
            if existing[end..].starts_with('\n') {
                end += 1;
            }
            Some((start..end, true))
        }
        None => Some((start..existing.len(), false)),
    }
}

/// Splice `managed` into `existing`
///
/// - no opening sentinel: append after a blank-line separator
/// - both sentinels: replace the span, keep everything else verbatim
/// - opening sentinel only: replace from the opening sentinel onward
pub fn merge_with_existing(existing: &str, managed: &str) -> String {
    match managed_span(existing) {
        Some((span, _)) => {
            let mut out = String::with_capacity(existing.len() + managed.len());
            out.push_str(&existing[..span.start]);
            out.push_str(managed);
            out.push_str(&existing[span.end..]);
            out
        }
        None => {
            if managed.is_empty() {
                return existing.to_string();
            }
            let mut out = String::with_capacity(existing.len() + managed.len() + 2);
            out.push_str(existing);
            if !existing.is_empty() {
                if !existing.ends_with('\n') {
                    out.push('\n');
                }
                if !existing.ends_with("\n\n") {
                    out.push('\n');
                }
            }
            out.push_str(managed);
            out
        }
    }
}

/// Hand-written content around the managed span
///
/// Without an opening sentinel the whole input is `before`.
pub fn extract_manual_content(existing: &str) -> (&str, &str) {
    match managed_span(existing) {
        Some((span, _)) => (&existing[..span.start], &existing[span.end..]),
        None => (existing, ""),
    }
}

/// The managed section as it sits on disk, from the opening sentinel through
/// the closing one; `None` unless both sentinels are present
pub fn managed_section(existing: &str) -> Option<&str> {
    let (span, closed) = managed_span(existing)?;
    if !closed {
        return None;
    }
    let slice = &existing[span];
    Some(slice.strip_suffix('\n').unwrap_or(slice))
}

/// Whether the on-disk managed section differs from the expected render
///
/// A missing sentinel counts as tampering whenever something is expected.
pub fn is_tampered(existing: &str, expected: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    let expected = expected.strip_suffix('\n').unwrap_or(expected);
    match managed_section(existing) {
        Some(actual) => actual != expected,
        None => true,
    }
}
