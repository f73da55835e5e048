use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use indexmap::IndexMap;

use crate::range::segment_start;

#[derive(Debug, Clone)]
pub struct MetadataEntry {
    pub content_length: u64,
    pub content_type: Option<String>,
    pub last_modified: Option<String>,
    pub etag: Option<String>,
}

/// URL-keyed map with a per-cache TTL. Expired entries read as absent and
/// are reaped by the background sweeper; writes overwrite unconditionally.
#[derive(Debug)]
pub struct TtlCache<V> {
    ttl: Duration,
    map: Mutex<HashMap<String, (V, Instant)>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            map: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let map = self.map.lock().expect("ttl cache lock");
        let (value, inserted_at) = map.get(key)?;
        if inserted_at.elapsed() >= self.ttl {
            return None;
        }
        Some(value.clone())
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        let mut map = self.map.lock().expect("ttl cache lock");
        map.insert(key.into(), (value, Instant::now()));
    }

    pub fn remove(&self, key: &str) -> bool {
        let mut map = self.map.lock().expect("ttl cache lock");
        map.remove(key).is_some()
    }

    pub fn sweep(&self) {
        let ttl = self.ttl;
        let mut map = self.map.lock().expect("ttl cache lock");
        map.retain(|_, (_, inserted_at)| inserted_at.elapsed() < ttl);
    }

    pub fn len(&self) -> usize {
        self.map.lock().expect("ttl cache lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SegmentKey {
    url: String,
    start: u64,
}

#[derive(Debug, Clone)]
pub struct Segment {
    pub start: u64,
    pub data: Bytes,
}

impl Segment {
    pub fn end(&self) -> u64 {
        self.start + self.data.len() as u64 - 1
    }
}

#[derive(Debug, Default)]
struct SegmentIndex {
    map: HashMap<SegmentKey, Bytes>,
    // recency order, least recently used first
    order: IndexMap<SegmentKey, ()>,
    bytes: u64,
}

impl SegmentIndex {
    fn bump(&mut self, key: &SegmentKey) {
        if self.order.shift_remove(key).is_some() {
            self.order.insert(key.clone(), ());
        }
    }
}

/// Byte cache over fixed-size aligned segments of remote files, keyed by
/// `(url, segment start)`. Payloads are immutable once inserted, so lookups
/// hand out cheap `Bytes` clones outside the lock.
#[derive(Debug)]
pub struct SegmentCache {
    capacity: u64,
    segment_size: u64,
    inner: Mutex<SegmentIndex>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SegmentCache {
    pub fn new(capacity: u64, segment_size: u64) -> Self {
        Self {
            capacity,
            segment_size,
            inner: Mutex::new(SegmentIndex::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    pub fn get_aligned(&self, url: &str, start: u64) -> Option<Bytes> {
        let key = SegmentKey {
            url: url.to_string(),
            start,
        };
        let mut inner = self.inner.lock().expect("segment cache lock");
        let data = inner.map.get(&key)?.clone();
        inner.bump(&key);
        Some(data)
    }

    /// First writer wins: a segment already present is left untouched and
    /// the late writer's bytes are discarded.
    pub fn put(&self, url: &str, start: u64, data: Bytes) {
        if data.is_empty() || data.len() as u64 > self.segment_size || start % self.segment_size != 0
        {
            return;
        }
        let key = SegmentKey {
            url: url.to_string(),
            start,
        };
        let len = data.len() as u64;
        let mut inner = self.inner.lock().expect("segment cache lock");
        if inner.map.contains_key(&key) {
            return;
        }
        if inner.bytes + len > self.capacity {
            let low_water = self.capacity / 10 * 7;
            while inner.bytes + len > low_water {
                let Some((victim, _)) = inner.order.shift_remove_index(0) else {
                    break;
                };
                if let Some(evicted) = inner.map.remove(&victim) {
                    inner.bytes -= evicted.len() as u64;
                }
            }
        }
        inner.bytes += len;
        inner.map.insert(key.clone(), data);
        inner.order.insert(key, ());
    }

    pub fn has(&self, url: &str, start: u64, end: u64) -> bool {
        let seg = segment_start(start, self.segment_size);
        if seg != segment_start(end, self.segment_size) {
            return false;
        }
        let inner = self.inner.lock().expect("segment cache lock");
        let key = SegmentKey {
            url: url.to_string(),
            start: seg,
        };
        inner
            .map
            .get(&key)
            .map(|data| seg + data.len() as u64 > end)
            .unwrap_or(false)
    }

    /// All cached segments overlapping or contiguous with
    /// `[start - SEG, end + SEG]`, ascending by offset, LRU-bumped.
    pub fn coalesce(&self, url: &str, start: u64, end: u64) -> Vec<Segment> {
        let seg = self.segment_size;
        let first = segment_start(start.saturating_sub(seg), seg);
        let last = segment_start(end.saturating_add(seg), seg);
        let mut inner = self.inner.lock().expect("segment cache lock");
        let mut out = Vec::new();
        let mut pos = first;
        loop {
            let key = SegmentKey {
                url: url.to_string(),
                start: pos,
            };
            if let Some(data) = inner.map.get(&key) {
                out.push(Segment {
                    start: pos,
                    data: data.clone(),
                });
                inner.bump(&key);
            }
            match pos.checked_add(seg) {
                Some(next) if next <= last => pos = next,
                _ => break,
            }
        }
        out
    }

    /// Covering slices for `[start, end]`, or `None` on any gap. Counts a
    /// hit or miss; this is the read path the range engine consults before
    /// touching the origin.
    pub fn lookup(&self, url: &str, start: u64, end: u64) -> Option<Vec<Bytes>> {
        let segments = self.coalesce(url, start, end);
        let covered = cover(&segments, start, end);
        if covered.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        covered
    }

    pub fn entry_count(&self) -> usize {
        self.inner.lock().expect("segment cache lock").map.len()
    }

    pub fn bytes(&self) -> u64 {
        self.inner.lock().expect("segment cache lock").bytes
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        if hits + misses == 0 {
            return 0.0;
        }
        hits as f64 / (hits + misses) as f64
    }
}

/// Slices of `segments` exactly covering `[start, end]`, or `None` if a
/// gap exists.
pub fn cover(segments: &[Segment], start: u64, end: u64) -> Option<Vec<Bytes>> {
    let mut pos = start;
    let mut out = Vec::new();
    for segment in segments {
        let seg_end = segment.end();
        if seg_end < pos {
            continue;
        }
        if segment.start > pos {
            return None;
        }
        let lo = (pos - segment.start) as usize;
        let hi = (end.min(seg_end) - segment.start) as usize + 1;
        out.push(segment.data.slice(lo..hi));
        if seg_end >= end {
            return Some(out);
        }
        pos = seg_end + 1;
    }
    None
}

/// Contiguous bytes for `[start, end]` assembled from `segments`.
pub fn assemble(segments: &[Segment], start: u64, end: u64) -> Option<Bytes> {
    let slices = cover(segments, start, end)?;
    let mut buf = BytesMut::with_capacity((end - start + 1) as usize);
    for slice in slices {
        buf.extend_from_slice(&slice);
    }
    Some(buf.freeze())
}

/// Accumulates a byte stream into aligned segment windows and inserts each
/// completed window into the cache. Partial windows are never inserted; the
/// file's short tail is flushed by `finish` only when the stream reached the
/// end of the file.
#[derive(Debug)]
pub struct SegmentCollector {
    url: String,
    seg: u64,
    total: u64,
    next_offset: Option<u64>,
    win_start: u64,
    buf: BytesMut,
}

impl SegmentCollector {
    pub fn new(url: impl Into<String>, seg: u64, total: u64) -> Self {
        Self {
            url: url.into(),
            seg,
            total,
            next_offset: None,
            win_start: 0,
            buf: BytesMut::new(),
        }
    }

    pub fn push(&mut self, offset: u64, data: &Bytes, cache: &SegmentCache) {
        let mut pos = offset;
        if let Some(expected) = self.next_offset {
            if pos != expected {
                // discontinuity: drop the half-filled window and resync
                self.buf.clear();
            }
        }
        let mut data = data.clone();
        while !data.is_empty() {
            if self.buf.is_empty() {
                let aligned = segment_start(pos + self.seg - 1, self.seg);
                if pos < aligned {
                    let skip = ((aligned - pos) as usize).min(data.len());
                    data.advance(skip);
                    pos += skip as u64;
                    continue;
                }
                self.win_start = pos;
            }
            let room = (self.seg as usize) - self.buf.len();
            let take = room.min(data.len());
            self.buf.extend_from_slice(&data.slice(..take));
            data.advance(take);
            pos += take as u64;
            if self.buf.len() == self.seg as usize {
                cache.put(&self.url, self.win_start, self.buf.split().freeze());
            }
        }
        self.next_offset = Some(pos);
    }

    pub fn finish(mut self, cache: &SegmentCache) {
        if !self.buf.is_empty() && self.win_start + self.buf.len() as u64 == self.total {
            cache.put(&self.url, self.win_start, self.buf.split().freeze());
        }
    }
}

/// Reaps expired TTL entries once per `interval` to bound memory.
pub fn spawn_sweeper(
    interval: Duration,
    metadata: Arc<TtlCache<MetadataEntry>>,
    redirects: Arc<TtlCache<String>>,
    preloads: Arc<TtlCache<()>>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            metadata.sweep();
            redirects.sweep();
            preloads.sweep();
        }
    });
}
