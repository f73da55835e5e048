use crate::constants::{EXPAND_LIMIT, MIN_CHUNK, OPTIMAL_CHUNK};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    pub start: u64,
    pub end: u64,
    pub total: u64,
    original_end: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    Invalid,
    Unsatisfiable,
}

impl RangeSpec {
    pub fn parse(header: &str, total: u64) -> Result<RangeSpec, RangeError> {
        let header = header.trim();
        let range = header.strip_prefix("bytes=").ok_or(RangeError::Invalid)?;
        if range.is_empty() || total == 0 {
            return Err(if total == 0 {
                RangeError::Unsatisfiable
            } else {
                RangeError::Invalid
            });
        }

        // Only the first range of a multi-range header is honored.
        let first = range.split(',').next().unwrap_or("").trim();
        let mut parts = first.splitn(2, '-');
        let start_str = parts.next().unwrap_or("").trim();
        let end_str = parts.next().ok_or(RangeError::Invalid)?.trim();

        if start_str.is_empty() {
            // suffix range: bytes=-N
            let suffix: u64 = end_str.parse().map_err(|_| RangeError::Invalid)?;
            if suffix == 0 {
                return Err(RangeError::Unsatisfiable);
            }
            return Ok(RangeSpec {
                start: total.saturating_sub(suffix),
                end: total - 1,
                total,
                original_end: None,
            });
        }

        let start: u64 = start_str.parse().map_err(|_| RangeError::Invalid)?;
        if start >= total {
            return Err(RangeError::Unsatisfiable);
        }

        let end = if end_str.is_empty() {
            total - 1
        } else {
            let end: u64 = end_str.parse().map_err(|_| RangeError::Invalid)?;
            end.min(total - 1)
        };

        if end < start {
            return Err(RangeError::Unsatisfiable);
        }

        Ok(RangeSpec {
            start,
            end,
            total,
            original_end: None,
        })
    }

    /// Widens small requests so one round-trip fills the segment cache
    /// ahead of the playhead. The client is still owed only the original
    /// interval; `owed_end` keeps that boundary.
    pub fn expand(mut self) -> RangeSpec {
        let req = self.end - self.start + 1;
        if req < MIN_CHUNK {
            let end = (self.start + OPTIMAL_CHUNK - 1).min(self.total - 1);
            self.original_end = Some(self.end);
            self.end = end;
        } else if req < EXPAND_LIMIT {
            let grow = (req + req / 2).max(OPTIMAL_CHUNK);
            let end = (self.start + grow - 1).min(self.total - 1);
            if end > self.end {
                self.original_end = Some(self.end);
                self.end = end;
            }
        }
        self
    }

    pub fn is_expanded(&self) -> bool {
        self.original_end.is_some()
    }

    pub fn owed_end(&self) -> u64 {
        self.original_end.unwrap_or(self.end)
    }

    pub fn owed_len(&self) -> u64 {
        self.owed_end() - self.start + 1
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Outbound fetch bounds, aligned to segment boundaries so complete
    /// segments can be stored off the stream.
    pub fn aligned(&self, seg: u64) -> (u64, u64) {
        let start = segment_start(self.start, seg);
        let end = (((self.end / seg) + 1) * seg - 1).min(self.total - 1);
        (start, end)
    }
}

pub fn segment_start(offset: u64, seg: u64) -> u64 {
    (offset / seg) * seg
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub size: u64,
}

pub fn parse_content_range(header: &str) -> Option<ContentRange> {
    // bytes start-end/size
    let rest = header.trim().strip_prefix("bytes")?.trim();
    let (range_part, size_part) = rest.split_once('/')?;
    let (start, end) = range_part.split_once('-')?;
    Some(ContentRange {
        start: start.trim().parse().ok()?,
        end: end.trim().parse().ok()?,
        size: size_part.trim().parse().ok()?,
    })
}

pub fn build_content_range(start: u64, end: u64, size: u64) -> String {
    format!("bytes {}-{}/{}", start, end, size)
}
