use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{
    ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, ETAG, LAST_MODIFIED, LOCATION,
};
use http::{HeaderMap, Response, StatusCode, Uri};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Frame, Incoming};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::cache::{MetadataEntry, SegmentCache, SegmentCollector, TtlCache};
use crate::constants;
use crate::error::ProxyError;
use crate::range::{build_content_range, parse_content_range, segment_start, RangeError, RangeSpec};
use crate::upstream::{BoxError, OriginClient, ProxyBody};

const BODY_CHANNEL_DEPTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    PartHit,
    Miss,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::PartHit => "PART_HIT",
            CacheStatus::Miss => "MISS",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PreloadOutcome {
    pub cached: bool,
    pub start: u64,
    pub end: u64,
}

/// The byte-serving engine. Satisfies a client range request from the
/// segment cache and/or the origin without ever buffering a whole body:
/// native 206 bodies are passed through, 200 bodies are stream-sliced, and
/// redirects are chased to the CDN once and remembered.
pub struct RangeEngine {
    client: OriginClient,
    segments: Arc<SegmentCache>,
    metadata: Arc<TtlCache<MetadataEntry>>,
    redirects: Arc<TtlCache<String>>,
    preloads: Arc<TtlCache<()>>,
    read_timeout: Duration,
}

impl RangeEngine {
    pub fn new(
        client: OriginClient,
        segments: Arc<SegmentCache>,
        metadata: Arc<TtlCache<MetadataEntry>>,
        redirects: Arc<TtlCache<String>>,
        preloads: Arc<TtlCache<()>>,
    ) -> Self {
        let read_timeout = client.request_timeout();
        Self {
            client,
            segments,
            metadata,
            redirects,
            preloads,
            read_timeout,
        }
    }

    pub async fn serve_range(
        &self,
        url: &str,
        range_header: &str,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let meta = self.metadata_for(url).await?;
        let total = meta.content_length;
        if total == 0 {
            return Err(ProxyError::RangeUnsatisfiable);
        }
        let range = RangeSpec::parse(range_header, total)
            .map_err(map_range_err)?
            .expand();
        let content_type = meta
            .content_type
            .unwrap_or_else(|| constants::DEFAULT_VIDEO_MIME.to_string());

        if let Some(slices) = self.segments.lookup(url, range.start, range.owed_end()) {
            return Ok(self.respond_from_cache(range, &content_type, slices));
        }
        let cache_status = if self
            .segments
            .coalesce(url, range.start, range.owed_end())
            .is_empty()
        {
            CacheStatus::Miss
        } else {
            CacheStatus::PartHit
        };

        // Align the outbound fetch when the parser already widened the
        // request; unexpanded large requests go out untouched so upstream
        // reads stay within one segment of the bytes owed.
        let (out_start, out_end) = if range.is_expanded() {
            range.aligned(self.segments.segment_size())
        } else {
            (range.start, range.end)
        };

        if let Some(cdn) = self.redirects.get(url) {
            let resp = self.client.get(&cdn, Some((out_start, out_end))).await?;
            return self.dispatch_cdn(url, resp, range, out_start, &content_type, cache_status);
        }

        let resp = match self.client.get(url, Some((out_start, out_end))).await {
            Ok(resp) => resp,
            Err(err) => {
                // One authorized retry: a range-less GET may still reveal
                // the redirect target. Never more than once.
                log::warn!("origin range fetch for {url} failed ({err}), probing for redirect");
                let probe = self.client.get(url, None).await?;
                if !is_redirect(probe.status()) {
                    return Err(err);
                }
                probe
            }
        };

        match resp.status() {
            StatusCode::PARTIAL_CONTENT => {
                self.passthrough(url, resp, range, out_start, &content_type, cache_status)
            }
            StatusCode::OK => {
                Ok(self.stream_slice(url, resp, range, &content_type, cache_status))
            }
            status if is_redirect(status) => {
                let location = resolve_location(url, resp.headers())
                    .ok_or_else(|| ProxyError::Upstream("redirect without location".into()))?;
                drop(resp);
                self.redirects.insert(url.to_string(), location.clone());
                let resp = self.client.get(&location, Some((out_start, out_end))).await?;
                self.dispatch_cdn(url, resp, range, out_start, &content_type, cache_status)
            }
            status => Err(ProxyError::UpstreamStatus(status)),
        }
    }

    /// Warms the cache for `[start, start + size - 1]` without a client in
    /// the loop. A fresh preload marker or full segment coverage answers
    /// immediately.
    pub async fn preload(
        &self,
        url: &str,
        start: u64,
        size: u64,
    ) -> Result<PreloadOutcome, ProxyError> {
        let meta = self.metadata_for(url).await?;
        let total = meta.content_length;
        if total == 0 || start >= total {
            return Err(ProxyError::RangeUnsatisfiable);
        }
        let size = if size == 0 {
            self.segments.segment_size()
        } else {
            size
        };
        let end = (start.saturating_add(size) - 1).min(total - 1);
        let marker = format!("{}|{}-{}", url, start, end);
        if self.preloads.get(&marker).is_some() {
            return Ok(PreloadOutcome {
                cached: true,
                start,
                end,
            });
        }
        if self.segments.lookup(url, start, end).is_some() {
            self.preloads.insert(marker, ());
            return Ok(PreloadOutcome {
                cached: true,
                start,
                end,
            });
        }

        let seg = self.segments.segment_size();
        let a_start = segment_start(start, seg);
        let a_end = (((end / seg) + 1) * seg - 1).min(total - 1);
        let fetch_url = self
            .redirects
            .get(url)
            .unwrap_or_else(|| url.to_string());
        let mut resp = self.client.get(&fetch_url, Some((a_start, a_end))).await?;
        if is_redirect(resp.status()) {
            let location = resolve_location(&fetch_url, resp.headers())
                .ok_or_else(|| ProxyError::Upstream("redirect without location".into()))?;
            self.redirects.insert(url.to_string(), location.clone());
            resp = self.client.get(&location, Some((a_start, a_end))).await?;
        }
        match resp.status() {
            StatusCode::PARTIAL_CONTENT => {
                let base = content_range_start(resp.headers()).unwrap_or(a_start);
                self.drain_into_cache(url, resp.into_body(), base, a_end, total)
                    .await?;
            }
            StatusCode::OK => {
                self.drain_into_cache(url, resp.into_body(), 0, a_end, total)
                    .await?;
            }
            status => return Err(ProxyError::UpstreamStatus(status)),
        }
        self.preloads.insert(marker, ());
        Ok(PreloadOutcome {
            cached: false,
            start,
            end,
        })
    }

    pub async fn metadata_for(&self, url: &str) -> Result<MetadataEntry, ProxyError> {
        if let Some(meta) = self.metadata.get(url) {
            return Ok(meta);
        }
        let (mut status, mut headers) = self.client.head(url).await?;
        if is_redirect(status) {
            let location = resolve_location(url, &headers)
                .ok_or_else(|| ProxyError::Upstream("redirect without location".into()))?;
            self.redirects.insert(url.to_string(), location.clone());
            let followed = self.client.head(&location).await?;
            status = followed.0;
            headers = followed.1;
        }
        if !status.is_success() {
            return Err(ProxyError::UpstreamStatus(status));
        }
        let entry = MetadataEntry {
            content_length: header_u64(&headers, CONTENT_LENGTH.as_str()).unwrap_or(0),
            content_type: header_string(&headers, CONTENT_TYPE.as_str()),
            last_modified: header_string(&headers, LAST_MODIFIED.as_str()),
            etag: header_string(&headers, ETAG.as_str()),
        };
        self.metadata.insert(url.to_string(), entry.clone());
        Ok(entry)
    }

    fn dispatch_cdn(
        &self,
        url: &str,
        resp: Response<Incoming>,
        range: RangeSpec,
        out_start: u64,
        content_type: &str,
        cache_status: CacheStatus,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        match resp.status() {
            StatusCode::PARTIAL_CONTENT => {
                self.passthrough(url, resp, range, out_start, content_type, cache_status)
            }
            StatusCode::OK => Ok(self.stream_slice(url, resp, range, content_type, cache_status)),
            status => Err(ProxyError::UpstreamStatus(status)),
        }
    }

    /// Strategy A: upstream honored the range. Owed bytes are forwarded as
    /// they arrive; once the client interval is served the remaining
    /// expanded bytes only feed the segment cache.
    fn passthrough(
        &self,
        url: &str,
        resp: Response<Incoming>,
        range: RangeSpec,
        expected_start: u64,
        content_type: &str,
        cache_status: CacheStatus,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let base = content_range_start(resp.headers()).unwrap_or(expected_start);
        if base > range.start {
            return Err(ProxyError::Upstream(format!(
                "upstream range starts at {base}, needed {}",
                range.start
            )));
        }
        let collector = SegmentCollector::new(url, self.segments.segment_size(), range.total);
        let (tx, rx) = mpsc::channel(BODY_CHANNEL_DEPTH);
        let cache = Arc::clone(&self.segments);
        let read_timeout = self.read_timeout;
        tokio::spawn(pump_passthrough(
            resp.into_body(),
            base,
            range,
            collector,
            cache,
            tx,
            read_timeout,
        ));
        Ok(partial_response(range, content_type, cache_status, channel_body(rx)))
    }

    /// Strategy B: upstream returned the whole file. Only the overlap with
    /// the owed interval is forwarded; the reader is destroyed as soon as
    /// the owed bytes are through.
    fn stream_slice(
        &self,
        url: &str,
        resp: Response<Incoming>,
        range: RangeSpec,
        content_type: &str,
        cache_status: CacheStatus,
    ) -> Response<ProxyBody> {
        let collector = SegmentCollector::new(url, self.segments.segment_size(), range.total);
        let (tx, rx) = mpsc::channel(BODY_CHANNEL_DEPTH);
        let cache = Arc::clone(&self.segments);
        let read_timeout = self.read_timeout;
        tokio::spawn(pump_slice(
            resp.into_body(),
            range,
            collector,
            cache,
            tx,
            read_timeout,
        ));
        partial_response(range, content_type, cache_status, channel_body(rx))
    }

    fn respond_from_cache(
        &self,
        range: RangeSpec,
        content_type: &str,
        slices: Vec<Bytes>,
    ) -> Response<ProxyBody> {
        let frames: Vec<Result<Frame<Bytes>, BoxError>> =
            slices.into_iter().map(|b| Ok(Frame::data(b))).collect();
        let body = StreamBody::new(tokio_stream::iter(frames)).boxed();
        partial_response(range, content_type, CacheStatus::Hit, body)
    }

    async fn drain_into_cache(
        &self,
        url: &str,
        mut body: Incoming,
        base: u64,
        stop_end: u64,
        total: u64,
    ) -> Result<(), ProxyError> {
        let mut collector = SegmentCollector::new(url, self.segments.segment_size(), total);
        let mut offset = base;
        loop {
            let frame = match tokio::time::timeout(self.read_timeout, body.frame()).await {
                Err(_) => return Err(ProxyError::UpstreamTimeout),
                Ok(None) => {
                    collector.finish(&self.segments);
                    return Ok(());
                }
                Ok(Some(Err(err))) => return Err(ProxyError::Upstream(err.to_string())),
                Ok(Some(Ok(frame))) => frame,
            };
            let Ok(data) = frame.into_data() else { continue };
            if data.is_empty() {
                continue;
            }
            let chunk_start = offset;
            offset += data.len() as u64;
            collector.push(chunk_start, &data, &self.segments);
            if offset > stop_end {
                collector.finish(&self.segments);
                return Ok(());
            }
        }
    }
}

async fn pump_passthrough(
    mut body: Incoming,
    base: u64,
    range: RangeSpec,
    collector: SegmentCollector,
    cache: Arc<SegmentCache>,
    tx: mpsc::Sender<Result<Frame<Bytes>, BoxError>>,
    read_timeout: Duration,
) {
    let start = range.start;
    let owed_end = range.owed_end();
    let owed_len = range.owed_len();
    let mut offset = base;
    let mut sent = 0u64;
    let mut tx = Some(tx);
    let mut collector = Some(collector);
    loop {
        let frame = match tokio::time::timeout(read_timeout, body.frame()).await {
            Err(_) => {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(Err("upstream read timed out".into())).await;
                }
                log::warn!("upstream read timed out mid-stream");
                return;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                match tx.take() {
                    Some(tx) => {
                        let _ = tx.send(Err(Box::new(err) as BoxError)).await;
                    }
                    None => log::warn!("upstream body error after client close: {err}"),
                }
                return;
            }
            Ok(Some(Ok(frame))) => frame,
        };
        let Ok(data) = frame.into_data() else { continue };
        if data.is_empty() {
            continue;
        }
        let chunk_start = offset;
        offset += data.len() as u64;
        if let Some(col) = collector.as_mut() {
            col.push(chunk_start, &data, &cache);
        }
        let mut client_done = false;
        if let Some(sender) = tx.as_ref() {
            let lo = chunk_start.max(start);
            let hi = (offset - 1).min(owed_end);
            if lo <= hi {
                let slice =
                    data.slice((lo - chunk_start) as usize..(hi - chunk_start + 1) as usize);
                sent += slice.len() as u64;
                if sender.send(Ok(Frame::data(slice))).await.is_err() {
                    // client went away; nothing partial is cached
                    return;
                }
            }
            client_done = sent >= owed_len;
        }
        if client_done {
            tx = None;
        }
    }
    if let Some(tx) = tx.take() {
        if sent < owed_len {
            let _ = tx.send(Err("upstream body ended early".into())).await;
            return;
        }
    }
    if let Some(col) = collector.take() {
        col.finish(&cache);
    }
}

async fn pump_slice(
    mut body: Incoming,
    range: RangeSpec,
    collector: SegmentCollector,
    cache: Arc<SegmentCache>,
    tx: mpsc::Sender<Result<Frame<Bytes>, BoxError>>,
    read_timeout: Duration,
) {
    let start = range.start;
    let owed_end = range.owed_end();
    let owed_len = range.owed_len();
    let mut collector = collector;
    let mut offset = 0u64;
    let mut sent = 0u64;
    loop {
        let frame = match tokio::time::timeout(read_timeout, body.frame()).await {
            Err(_) => {
                let _ = tx.send(Err("upstream read timed out".into())).await;
                return;
            }
            Ok(None) => {
                // whole file seen; flush a short tail segment if any
                collector.finish(&cache);
                if sent < owed_len {
                    let _ = tx.send(Err("upstream body ended early".into())).await;
                }
                return;
            }
            Ok(Some(Err(err))) => {
                let _ = tx.send(Err(Box::new(err) as BoxError)).await;
                return;
            }
            Ok(Some(Ok(frame))) => frame,
        };
        let Ok(data) = frame.into_data() else { continue };
        if data.is_empty() {
            continue;
        }
        let chunk_start = offset;
        offset += data.len() as u64;
        collector.push(chunk_start, &data, &cache);
        let lo = chunk_start.max(start);
        let hi = (offset - 1).min(owed_end);
        if lo <= hi {
            let slice = data.slice((lo - chunk_start) as usize..(hi - chunk_start + 1) as usize);
            sent += slice.len() as u64;
            if tx.send(Ok(Frame::data(slice))).await.is_err() {
                return;
            }
        }
        if sent >= owed_len || offset > owed_end {
            // destroy the upstream reader; the rest of the file never
            // enters memory
            return;
        }
    }
}

fn channel_body(rx: mpsc::Receiver<Result<Frame<Bytes>, BoxError>>) -> ProxyBody {
    StreamBody::new(ReceiverStream::new(rx)).boxed()
}

fn partial_response(
    range: RangeSpec,
    content_type: &str,
    cache_status: CacheStatus,
    body: ProxyBody,
) -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::PARTIAL_CONTENT)
        .header(
            CONTENT_RANGE,
            build_content_range(range.start, range.owed_end(), range.total),
        )
        .header(CONTENT_LENGTH, range.owed_len().to_string())
        .header(ACCEPT_RANGES, "bytes")
        .header(CONTENT_TYPE, content_type)
        .header(constants::PROTOCOL_CACHE_STATUS_KEY, cache_status.as_str())
        .body(body)
        .unwrap()
}

fn map_range_err(err: RangeError) -> ProxyError {
    match err {
        RangeError::Invalid => ProxyError::MalformedRange,
        RangeError::Unsatisfiable => ProxyError::RangeUnsatisfiable,
    }
}

fn is_redirect(status: StatusCode) -> bool {
    status == StatusCode::MOVED_PERMANENTLY || status == StatusCode::FOUND
}

fn content_range_start(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_range)
        .map(|cr| cr.start)
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn resolve_location(base_url: &str, headers: &HeaderMap) -> Option<String> {
    let location = headers.get(LOCATION)?.to_str().ok()?;
    if location.starts_with("http://") || location.starts_with("https://") {
        return Some(location.to_string());
    }
    let uri: Uri = base_url.parse().ok()?;
    let scheme = uri.scheme_str()?;
    let authority = uri.authority()?;
    let path = if location.starts_with('/') {
        location.to_string()
    } else {
        format!("/{}", location)
    };
    Some(format!("{}://{}{}", scheme, authority, path))
}
