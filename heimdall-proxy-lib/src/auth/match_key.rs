//! Key-path extraction.
//!
//! The match key binds a whitelist entry to a logical folder without
//! listing every file: the segment following a `YYYY-MM-DD` date segment,
//! or the last non-empty segment when no date is present.

/// Extract the match key from an origin-relative URL path. Returns an
/// empty string for the root path, which never matches anything.
pub fn extract_match_key(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return String::new();
    }

    for (i, seg) in segments.iter().enumerate() {
        if is_date_segment(seg) {
            if let Some(next) = segments.get(i + 1) {
                return (*next).to_string();
            }
            break;
        }
    }

    segments.last().map(|s| (*s).to_string()).unwrap_or_default()
}

/// Exact `YYYY-MM-DD` shape: ten chars, digits split by dashes at
/// positions 4 and 7.
fn is_date_segment(seg: &str) -> bool {
    let b = seg.as_bytes();
    if b.len() != 10 {
        return false;
    }
    b.iter().enumerate().all(|(i, c)| match i {
        4 | 7 => *c == b'-',
        _ => c.is_ascii_digit(),
    })
}
