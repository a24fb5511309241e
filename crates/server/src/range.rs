/// A resolved, inclusive byte window into a file of known size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteSpan {
    pub start: u64,
    pub end: u64,
}

impl ByteSpan {
    pub fn full(size: u64) -> ByteSpan {
        ByteSpan {
            start: 0,
            end: size.saturating_sub(1),
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` value for a 206 response.
    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    Malformed,
    Unsatisfiable,
}

/// `Content-Range` value for a 416 response.
pub fn unsatisfiable_content_range(size: u64) -> String {
    format!("bytes */{}", size)
}

/// Parses a single-range `Range` header against a file of `size` bytes.
///
/// Accepted forms are `bytes=start-end` (end clamped to the last byte),
/// `bytes=start-` and the suffix form `bytes=-n`. Multi-range requests are
/// rejected as malformed.
pub fn parse_range(header: &str, size: u64) -> Result<ByteSpan, RangeError> {
    let spec = header
        .trim()
        .strip_prefix("bytes=")
        .ok_or(RangeError::Malformed)?;
    if spec.contains(',') {
        return Err(RangeError::Malformed);
    }
    if size == 0 {
        return Err(RangeError::Unsatisfiable);
    }
    let (start_str, end_str) = spec.split_once('-').ok_or(RangeError::Malformed)?;

    if start_str.is_empty() {
        // Suffix form: the last n bytes.
        let suffix = parse_part(end_str)?;
        if suffix == 0 {
            return Err(RangeError::Unsatisfiable);
        }
        return Ok(ByteSpan {
            start: size.saturating_sub(suffix),
            end: size - 1,
        });
    }

    let start = parse_part(start_str)?;
    if start >= size {
        return Err(RangeError::Unsatisfiable);
    }
    let end = if end_str.is_empty() {
        size - 1
    } else {
        let end = parse_part(end_str)?;
        if end < start {
            return Err(RangeError::Malformed);
        }
        end.min(size - 1)
    };
    Ok(ByteSpan { start, end })
}

fn parse_part(value: &str) -> Result<u64, RangeError> {
    value.trim().parse::<u64>().map_err(|_| RangeError::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_range_with_length() {
        let span = parse_range("bytes=0-99", 1000).unwrap();
        assert_eq!(span, ByteSpan { start: 0, end: 99 });
        assert_eq!(span.len(), 100);
        assert_eq!(span.content_range(1000), "bytes 0-99/1000");
    }

    #[test]
    fn open_range_runs_to_last_byte() {
        let span = parse_range("bytes=500-", 1000).unwrap();
        assert_eq!(span, ByteSpan { start: 500, end: 999 });
    }

    #[test]
    fn end_is_clamped_to_file_size() {
        let span = parse_range("bytes=900-5000", 1000).unwrap();
        assert_eq!(span, ByteSpan { start: 900, end: 999 });
    }

    #[test]
    fn suffix_range_takes_trailing_bytes() {
        let span = parse_range("bytes=-100", 1000).unwrap();
        assert_eq!(span, ByteSpan { start: 900, end: 999 });
        let span = parse_range("bytes=-5000", 1000).unwrap();
        assert_eq!(span, ByteSpan::full(1000));
    }

    #[test]
    fn start_past_end_of_file_is_unsatisfiable() {
        assert_eq!(parse_range("bytes=1000-", 1000), Err(RangeError::Unsatisfiable));
        assert_eq!(unsatisfiable_content_range(1000), "bytes */1000");
    }

    #[test]
    fn empty_file_is_unsatisfiable() {
        assert_eq!(parse_range("bytes=0-", 0), Err(RangeError::Unsatisfiable));
    }

    #[test]
    fn multi_range_and_garbage_are_malformed() {
        assert_eq!(parse_range("bytes=0-1,5-9", 1000), Err(RangeError::Malformed));
        assert_eq!(parse_range("items=0-1", 1000), Err(RangeError::Malformed));
        assert_eq!(parse_range("bytes=ten-", 1000), Err(RangeError::Malformed));
        assert_eq!(parse_range("bytes=-", 1000), Err(RangeError::Malformed));
        assert_eq!(parse_range("bytes=9-5", 1000), Err(RangeError::Malformed));
    }
}
