//! HTTP Range header parsing (RFC 7233, single ranges).

/// How a request's Range header maps onto a file of known size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOutcome {
    /// No Range header, a foreign unit, or a multi-range request:
    /// serve the full content with 200.
    Full,
    /// A satisfiable single range: serve `[start, end]` inclusive with 206.
    Partial { start: u64, end: u64 },
    /// Malformed or unsatisfiable: respond 416 with `Content-Range: bytes */size`.
    Unsatisfiable,
}

pub fn parse_range(header: Option<&str>, size: u64) -> RangeOutcome {
    let Some(header) = header else {
        return RangeOutcome::Full;
    };
    let Some(spec) = header.trim().strip_prefix("bytes=") else {
        // Unknown unit; serve the full representation.
        return RangeOutcome::Full;
    };
    if spec.contains(',') {
        // Multiple ranges are not supported; fall back to full content.
        return RangeOutcome::Full;
    }
    let Some((start_str, end_str)) = spec.split_once('-') else {
        return RangeOutcome::Unsatisfiable;
    };
    let start_str = start_str.trim();
    let end_str = end_str.trim();

    let (start, end) = match (start_str.is_empty(), end_str.is_empty()) {
        // "A-B"
        (false, false) => {
            let (Ok(start), Ok(end)) = (start_str.parse::<u64>(), end_str.parse::<u64>()) else {
                return RangeOutcome::Unsatisfiable;
            };
            (start, end)
        }
        // "A-"
        (false, true) => {
            let Ok(start) = start_str.parse::<u64>() else {
                return RangeOutcome::Unsatisfiable;
            };
            if size == 0 {
                return RangeOutcome::Unsatisfiable;
            }
            (start, size - 1)
        }
        // "-N": the last N bytes
        (true, false) => {
            let Ok(suffix) = end_str.parse::<u64>() else {
                return RangeOutcome::Unsatisfiable;
            };
            if suffix == 0 || size == 0 {
                return RangeOutcome::Unsatisfiable;
            }
            (size.saturating_sub(suffix), size - 1)
        }
        (true, true) => return RangeOutcome::Unsatisfiable,
    };

    if start > end || start >= size || end >= size {
        return RangeOutcome::Unsatisfiable;
    }
    RangeOutcome::Partial { start, end }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: u64 = 3_145_728;

    #[test]
    fn test_no_header_is_full() {
        assert_eq!(parse_range(None, SIZE), RangeOutcome::Full);
    }

    #[test]
    fn test_bounded_range() {
        assert_eq!(
            parse_range(Some("bytes=1048576-2097151"), SIZE),
            RangeOutcome::Partial { start: 1_048_576, end: 2_097_151 }
        );
    }

    #[test]
    fn test_open_ended_range() {
        assert_eq!(
            parse_range(Some("bytes=500-"), SIZE),
            RangeOutcome::Partial { start: 500, end: SIZE - 1 }
        );
    }

    #[test]
    fn test_suffix_range() {
        assert_eq!(
            parse_range(Some("bytes=-500"), SIZE),
            RangeOutcome::Partial { start: SIZE - 500, end: SIZE - 1 }
        );
        // A suffix longer than the file starts at zero.
        assert_eq!(
            parse_range(Some("bytes=-99999999"), 100),
            RangeOutcome::Partial { start: 0, end: 99 }
        );
    }

    #[test]
    fn test_multi_range_falls_back_to_full() {
        assert_eq!(parse_range(Some("bytes=0-1,5-9"), SIZE), RangeOutcome::Full);
    }

    #[test]
    fn test_foreign_unit_is_full() {
        assert_eq!(parse_range(Some("items=0-5"), SIZE), RangeOutcome::Full);
    }

    #[test]
    fn test_unsatisfiable() {
        assert_eq!(parse_range(Some("bytes=10-5"), SIZE), RangeOutcome::Unsatisfiable);
        assert_eq!(parse_range(Some("bytes=3145728-"), SIZE), RangeOutcome::Unsatisfiable);
        assert_eq!(parse_range(Some("bytes=0-3145728"), SIZE), RangeOutcome::Unsatisfiable);
        assert_eq!(parse_range(Some("bytes=-"), SIZE), RangeOutcome::Unsatisfiable);
        assert_eq!(parse_range(Some("bytes=a-b"), SIZE), RangeOutcome::Unsatisfiable);
        assert_eq!(parse_range(Some("bytes=-0"), SIZE), RangeOutcome::Unsatisfiable);
        assert_eq!(parse_range(Some("bytes=0-0"), 0), RangeOutcome::Unsatisfiable);
    }

    #[test]
    fn test_inclusive_window_length() {
        if let RangeOutcome::Partial { start, end } =
            parse_range(Some("bytes=1048576-2097151"), SIZE)
        {
            assert_eq!(end - start + 1, 1_048_576);
        } else {
            panic!("expected partial");
        }
    }
}
