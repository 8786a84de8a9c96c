//! `Range: bytes=...` parsing and resolution against an artifact size.
//!
//! Parsing and resolution are separate steps: a header that is not a single
//! well-formed byte range is an [`Error::InvalidArgument`], while a
//! well-formed range that does not overlap the artifact is
//! [`Error::RangeNotSatisfiable`].

use std::fmt;

use reelforge_common::{Error, Result};

/// A single byte-range request as written by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// `bytes=start-end`
    FromTo { start: u64, end: u64 },
    /// `bytes=start-`
    From { start: u64 },
    /// `bytes=-len`, the last `len` bytes
    Suffix { len: u64 },
}

/// An inclusive byte range inside an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Never true; a resolved range covers at least one byte.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// `Content-Range` header value for this range out of `size`.
    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, size)
    }
}

impl RangeSpec {
    /// Parse a `Range` header value.
    pub fn parse(header: &str) -> Result<Self> {
        let header = header.trim();
        let spec = header
            .strip_prefix("bytes=")
            .ok_or_else(|| Error::invalid_argument(format!("unsupported range unit: {header}")))?;

        if spec.contains(',') {
            return Err(Error::invalid_argument("multiple ranges are not supported"));
        }

        let (start, end) = spec
            .split_once('-')
            .ok_or_else(|| Error::invalid_argument(format!("malformed range: {header}")))?;
        let (start, end) = (start.trim(), end.trim());

        match (start.is_empty(), end.is_empty()) {
            (false, false) => Ok(RangeSpec::FromTo {
                start: parse_offset(start, header)?,
                end: parse_offset(end, header)?,
            }),
            (false, true) => Ok(RangeSpec::From {
                start: parse_offset(start, header)?,
            }),
            (true, false) => Ok(RangeSpec::Suffix {
                len: parse_offset(end, header)?,
            }),
            (true, true) => Err(Error::invalid_argument(format!("malformed range: {header}"))),
        }
    }

    /// Resolve against an artifact of `size` bytes, clamping the end.
    pub fn resolve(&self, size: u64) -> Result<ByteRange> {
        let unsatisfiable = || Error::RangeNotSatisfiable {
            range: self.to_string(),
            size,
        };
        if size == 0 {
            return Err(unsatisfiable());
        }
        let last = size - 1;

        match *self {
            RangeSpec::FromTo { start, end } => {
                if end < start || start >= size {
                    return Err(unsatisfiable());
                }
                Ok(ByteRange {
                    start,
                    end: end.min(last),
                })
            }
            RangeSpec::From { start } => {
                if start >= size {
                    return Err(unsatisfiable());
                }
                Ok(ByteRange { start, end: last })
            }
            RangeSpec::Suffix { len } => {
                if len == 0 {
                    return Err(unsatisfiable());
                }
                Ok(ByteRange {
                    start: size.saturating_sub(len),
                    end: last,
                })
            }
        }
    }
}

impl fmt::Display for RangeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RangeSpec::FromTo { start, end } => write!(f, "bytes={start}-{end}"),
            RangeSpec::From { start } => write!(f, "bytes={start}-"),
            RangeSpec::Suffix { len } => write!(f, "bytes=-{len}"),
        }
    }
}

fn parse_offset(value: &str, header: &str) -> Result<u64> {
    if !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::invalid_argument(format!("malformed range: {header}")));
    }
    value
        .parse()
        .map_err(|_| Error::invalid_argument(format!("range offset too large: {header}")))
}

/// Parse and resolve in one step.
pub fn resolve_header(header: &str, size: u64) -> Result<ByteRange> {
    RangeSpec::parse(header)?.resolve(size)
}
