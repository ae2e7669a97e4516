//! HTTP `Range` parsing and response planning
//!
//! Kept free of I/O so the byte arithmetic can be tested on its own. The
//! server turns a [`RangePlan`] into status, headers and a body stream.

/// A single byte range as written in a `Range` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// `bytes=start-` or `bytes=start-end` (end inclusive)
    FromTo { start: u64, end: Option<u64> },
    /// `bytes=-len`, the last `len` bytes
    Suffix(u64),
}

/// Parse a `Range` header value.
///
/// Only the `bytes` unit is understood. For multi-range requests the first
/// range wins. Returns `None` for anything malformed, which callers treat as
/// "no range requested".
pub fn parse_range_header(value: &str) -> Option<ByteRange> {
    let spec = value.trim().strip_prefix("bytes=")?;
    let first = spec.split(',').next()?.trim();
    let (start, end) = first.split_once('-')?;
    let (start, end) = (start.trim(), end.trim());

    if start.is_empty() {
        let len: u64 = end.parse().ok()?;
        return Some(ByteRange::Suffix(len));
    }

    let start: u64 = start.parse().ok()?;
    let end = if end.is_empty() {
        None
    } else {
        Some(end.parse::<u64>().ok()?)
    };
    Some(ByteRange::FromTo { start, end })
}

/// What the server should answer for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangePlan {
    /// 200 with the whole file
    Full { length: u64 },
    /// 206 for `start..=end`
    ///
    /// `waiting` is set when the span starts past the downloaded prefix of an
    /// incomplete file; the body then runs to the end of the file and parks
    /// until the swarm delivers.
    Partial {
        start: u64,
        end: u64,
        length: u64,
        waiting: bool,
    },
    /// 416
    Unsatisfiable { length: u64 },
}

impl RangePlan {
    /// Build the plan for a request against a file in its current state
    pub fn new(range: Option<ByteRange>, length: u64, downloaded: u64, complete: bool) -> Self {
        let (start, end) = match range {
            None => return RangePlan::Full { length },
            Some(ByteRange::Suffix(0)) => return RangePlan::Unsatisfiable { length },
            Some(ByteRange::Suffix(len)) => (length.saturating_sub(len), None),
            Some(ByteRange::FromTo { start, end }) => (start, end),
        };

        if length == 0 || start >= length {
            return RangePlan::Unsatisfiable { length };
        }

        let last = length - 1;
        let end = end.unwrap_or(last).min(last);
        if start > end {
            return RangePlan::Unsatisfiable { length };
        }

        if start >= downloaded && !complete {
            RangePlan::Partial {
                start,
                end: last,
                length,
                waiting: true,
            }
        } else {
            RangePlan::Partial {
                start,
                end,
                length,
                waiting: false,
            }
        }
    }

    /// Value for `Content-Length`
    pub fn content_length(&self) -> u64 {
        match *self {
            RangePlan::Full { length } => length,
            RangePlan::Partial { start, end, .. } => end - start + 1,
            RangePlan::Unsatisfiable { .. } => 0,
        }
    }

    /// Value for `Content-Range`, if the response carries one
    pub fn content_range(&self) -> Option<String> {
        match *self {
            RangePlan::Full { .. } => None,
            RangePlan::Partial { start, end, length, .. } => {
                Some(format!("bytes {}-{}/{}", start, end, length))
            }
            RangePlan::Unsatisfiable { length } => Some(format!("bytes */{}", length)),
        }
    }
}
