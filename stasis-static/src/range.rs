//! HTTP byte ranges

use bytes::Bytes;

/// More ranges than this in one header is treated as abuse and ignored
pub const MAX_RANGES: usize = 64;

/// An inclusive byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

#[allow(clippy::len_without_is_empty)]
impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Never zero: ranges are inclusive
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` value for a representation of `total` bytes
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

/// Interpretation of a `Range` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeSpec {
    /// Malformed, another unit, or too many ranges: serve the full body
    Ignore,
    /// Well formed but nothing overlaps the representation
    Unsatisfiable,
    /// Sorted, coalesced ranges
    Satisfiable(Vec<ByteRange>),
}

/// Parse a `Range` header against a representation of `len` bytes
pub fn parse_range(header: &str, len: u64) -> RangeSpec {
    let Some((unit, specs)) = header.trim().split_once('=') else {
        return RangeSpec::Ignore;
    };
    if !unit.trim().eq_ignore_ascii_case("bytes") {
        return RangeSpec::Ignore;
    }

    let mut ranges = Vec::new();
    let mut count = 0;
    for spec in specs.split(',') {
        let spec = spec.trim();
        if spec.is_empty() {
            continue;
        }
        count += 1;
        if count > MAX_RANGES {
            return RangeSpec::Ignore;
        }
        let Some((first, last)) = spec.split_once('-') else {
            return RangeSpec::Ignore;
        };
        let (first, last) = (first.trim(), last.trim());

        if first.is_empty() {
            // suffix range: the last N bytes
            let Ok(suffix) = last.parse::<u64>() else {
                return RangeSpec::Ignore;
            };
            if suffix > 0 && len > 0 {
                ranges.push(ByteRange::new(len.saturating_sub(suffix), len - 1));
            }
            continue;
        }

        let Ok(start) = first.parse::<u64>() else {
            return RangeSpec::Ignore;
        };
        let end = if last.is_empty() {
            None
        } else {
            match last.parse::<u64>() {
                Ok(end) if end >= start => Some(end),
                _ => return RangeSpec::Ignore,
            }
        };
        if start >= len {
            continue;
        }
        let end = end.map(|e| e.min(len - 1)).unwrap_or(len - 1);
        ranges.push(ByteRange::new(start, end));
    }

    if count == 0 {
        return RangeSpec::Ignore;
    }
    if ranges.is_empty() {
        return RangeSpec::Unsatisfiable;
    }
    RangeSpec::Satisfiable(coalesce(ranges))
}

fn coalesce(mut ranges: Vec<ByteRange>) -> Vec<ByteRange> {
    ranges.sort_by_key(|r| r.start);
    let mut merged: Vec<ByteRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.start <= last.end.saturating_add(1) => {
                last.end = last.end.max(range.end);
            }
            _ => merged.push(range),
        }
    }
    merged
}

/// One part of a `multipart/byteranges` body
#[derive(Debug, Clone)]
pub struct MultipartPart {
    /// Boundary line and part headers, sent before the part's bytes
    pub header: Bytes,
    pub range: ByteRange,
}

/// Layout of a `multipart/byteranges` body
#[derive(Debug, Clone)]
pub struct Multipart {
    pub boundary: String,
    pub parts: Vec<MultipartPart>,
    /// Closing delimiter
    pub closing: Bytes,
}

impl Multipart {
    /// Lay out `ranges` of a representation; the boundary derives from the validator
    pub fn new(ranges: &[ByteRange], content_type: &str, total: u64, etag: &str) -> Self {
        let hash = blake3::hash(etag.as_bytes());
        let boundary = format!("stasis-{}", hex::encode(&hash.as_bytes()[..12]));

        let parts = ranges
            .iter()
            .enumerate()
            .map(|(i, range)| {
                let lead = if i == 0 { "" } else { "\r\n" };
                let header = format!(
                    "{}--{}\r\nContent-Type: {}\r\nContent-Range: {}\r\n\r\n",
                    lead,
                    boundary,
                    content_type,
                    range.content_range(total)
                );
                MultipartPart {
                    header: Bytes::from(header),
                    range: *range,
                }
            })
            .collect();
        let closing = Bytes::from(format!("\r\n--{}--\r\n", boundary));

        Self {
            boundary,
            parts,
            closing,
        }
    }

    /// `Content-Type` of the whole response
    pub fn content_type(&self) -> String {
        format!("multipart/byteranges; boundary={}", self.boundary)
    }

    /// Exact body length
    pub fn content_length(&self) -> u64 {
        self.parts
            .iter()
            .map(|p| p.header.len() as u64 + p.range.len())
            .sum::<u64>()
            + self.closing.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn ranges(spec: RangeSpec) -> Vec<(u64, u64)> {
        match spec {
            RangeSpec::Satisfiable(r) => r.iter().map(|r| (r.start, r.end)).collect(),
            other => panic!("expected satisfiable, got {:?}", other),
        }
    }

    #[rstest]
    #[case("bytes=0-4", vec![(0, 4)])]
    #[case("bytes=5-", vec![(5, 9)])]
    #[case("bytes=-3", vec![(7, 9)])]
    #[case("bytes=-30", vec![(0, 9)])]
    #[case("bytes=8-100", vec![(8, 9)])]
    #[case("bytes=0-0, -1", vec![(0, 0), (9, 9)])]
    #[case("bytes=0-3,2-5,6-7", vec![(0, 7)])]
    #[case("bytes=6-7, 0-1", vec![(0, 1), (6, 7)])]
    #[case("Bytes = 1-2", vec![(1, 2)])]
    #[case("bytes=0-4, 20-30", vec![(0, 4)])]
    fn test_satisfiable(#[case] header: &str, #[case] expected: Vec<(u64, u64)>) {
        assert_eq!(ranges(parse_range(header, 10)), expected);
    }

    #[rstest]
    #[case("bytes=20-30")]
    #[case("bytes=10-")]
    #[case("bytes=-0")]
    fn test_unsatisfiable(#[case] header: &str) {
        assert_eq!(parse_range(header, 10), RangeSpec::Unsatisfiable);
    }

    #[rstest]
    #[case("items=0-4")]
    #[case("bytes=4-2")]
    #[case("bytes=a-b")]
    #[case("bytes=")]
    #[case("bytes 0-4")]
    #[case("bytes=0-4;1-2")]
    fn test_ignored(#[case] header: &str) {
        assert_eq!(parse_range(header, 10), RangeSpec::Ignore);
    }

    #[test]
    fn test_too_many_ranges() {
        let header = format!(
            "bytes={}",
            (0..=MAX_RANGES).map(|i| format!("{}-{}", i, i)).collect::<Vec<_>>().join(",")
        );
        assert_eq!(parse_range(&header, 1000), RangeSpec::Ignore);
    }

    #[test]
    fn test_empty_representation() {
        assert_eq!(parse_range("bytes=0-", 0), RangeSpec::Unsatisfiable);
        assert_eq!(parse_range("bytes=-5", 0), RangeSpec::Unsatisfiable);
    }

    #[test]
    fn test_multipart_layout() {
        let ranges = [ByteRange::new(0, 1), ByteRange::new(6, 7)];
        let multipart = Multipart::new(&ranges, "text/plain", 10, "\"abc\"");
        assert_eq!(multipart.parts.len(), 2);
        assert!(multipart.content_type().starts_with("multipart/byteranges; boundary=stasis-"));
        assert_eq!(
            multipart.parts[0].header,
            Bytes::from(format!(
                "--{}\r\nContent-Type: text/plain\r\nContent-Range: bytes 0-1/10\r\n\r\n",
                multipart.boundary
            ))
        );
        assert!(multipart.parts[1].header.starts_with(b"\r\n--"));

        let expected = multipart.parts.iter().map(|p| p.header.len() as u64 + 2).sum::<u64>()
            + multipart.closing.len() as u64;
        assert_eq!(multipart.content_length(), expected);
        assert_eq!(
            Multipart::new(&ranges, "text/plain", 10, "\"abc\"").boundary,
            multipart.boundary
        );
    }
}
