//! Trace identifier extraction from a trace-propagation header.

/// Extract the correlation id from a trace-propagation header.
///
/// For a W3C `traceparent` (`version-traceid-parentid-flags`) the leading
/// two-hex-digit version field is skipped and the trace id is returned.
/// Any other header yields its first `-`-delimited segment.
/// Blank headers and empty segments yield `None`.
pub fn extract_trace_id(header: &str) -> Option<String> {
    let header = header.trim();
    let mut segments = header.split('-');
    let first = segments.next()?;

    let candidate = if is_version_field(first) && header.contains('-') {
        segments.next()?
    } else {
        first
    };

    if candidate.is_empty() {
        None
    } else {
        Some(candidate.to_string())
    }
}

fn is_version_field(segment: &str) -> bool {
    segment.len() == 2 && segment.chars().all(|c| c.is_ascii_hexdigit())
}
