use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Instant;

use anyhow::{Context, Result};
use bytes::Bytes;
use http::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_TYPE, ETAG, LAST_MODIFIED, RANGE};
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::access_log::{format_access_time, AccessLogger};
use crate::cache::{self, MetadataEntry, SegmentCache, TtlCache};
use crate::config::Bootstrap;
use crate::constants;
use crate::engine::RangeEngine;
use crate::error::ProxyError;
use crate::stats::{self, RequestGuard, Stats};
use crate::upstream::{self, empty_body, full_body, BoxError, OriginClient, ProxyBody};

pub async fn run(cfg: Arc<Bootstrap>) -> Result<()> {
    let addr: SocketAddr = cfg.server.addr.parse().context("parse server.addr")?;
    let listener = std::net::TcpListener::bind(addr).context("bind tcp")?;
    listener.set_nonblocking(true)?;
    let listener = TcpListener::from_std(listener)?;
    log::info!("listening on {}", cfg.server.addr);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handlers(shutdown_tx);
    serve(listener, shutdown_rx, cfg).await
}

pub async fn serve(
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
    cfg: Arc<Bootstrap>,
) -> Result<()> {
    let state = Arc::new(AppState::new(cfg)?);
    cache::spawn_sweeper(
        state.cfg.cache.sweep_interval,
        Arc::clone(&state.metadata),
        Arc::clone(&state.redirects),
        Arc::clone(&state.preloads),
    );

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => {
                let (stream, _) = res.context("accept tcp")?;
                let peer = stream.peer_addr().ok().map(|addr| addr.to_string());
                let io = TokioIo::new(stream);
                let state = Arc::clone(&state);

                tokio::spawn(async move {
                    let service = service_fn(move |mut req| {
                        if let Some(peer) = &peer {
                            req.extensions_mut().insert(RemoteAddr(peer.clone()));
                        }
                        handle(req, Arc::clone(&state))
                    });
                    let builder = ConnBuilder::new(TokioExecutor::new());
                    if let Err(err) = builder.serve_connection(io, service).await {
                        log::debug!("http connection error: {err}");
                    }
                });
            }
        }
    }
    Ok(())
}

pub struct AppState {
    pub cfg: Arc<Bootstrap>,
    pub client: OriginClient,
    pub engine: RangeEngine,
    pub stats: Arc<Stats>,
    pub metadata: Arc<TtlCache<MetadataEntry>>,
    pub redirects: Arc<TtlCache<String>>,
    pub preloads: Arc<TtlCache<()>>,
    pub segments: Arc<SegmentCache>,
    access_logger: Option<Arc<AccessLogger>>,
}

impl AppState {
    pub fn new(cfg: Arc<Bootstrap>) -> Result<Self> {
        let client = OriginClient::new(&cfg.upstream);
        let metadata = Arc::new(TtlCache::new(cfg.cache.metadata_ttl));
        let redirects = Arc::new(TtlCache::new(cfg.cache.redirect_ttl));
        let preloads = Arc::new(TtlCache::new(cfg.cache.preload_ttl));
        let segments = Arc::new(SegmentCache::new(cfg.cache.capacity, cfg.cache.segment_size));
        let engine = RangeEngine::new(
            client.clone(),
            Arc::clone(&segments),
            Arc::clone(&metadata),
            Arc::clone(&redirects),
            Arc::clone(&preloads),
        );
        let access_logger = build_access_logger(&cfg);
        Ok(Self {
            cfg,
            client,
            engine,
            stats: Arc::new(Stats::new()),
            metadata,
            redirects,
            preloads,
            segments,
            access_logger,
        })
    }

    fn origin_url(&self, uri: &Uri) -> String {
        let path_and_query = uri.path_and_query().map(|v| v.as_str()).unwrap_or("/");
        format!(
            "{}{}{}",
            self.cfg.upstream.origin.trim_end_matches('/'),
            self.cfg.upstream.path_prefix,
            path_and_query
        )
    }
}

#[derive(Clone)]
struct RemoteAddr(String);

fn build_access_logger(cfg: &Bootstrap) -> Option<Arc<AccessLogger>> {
    let access = cfg.server.access_log.as_ref()?;
    if !access.enabled {
        return None;
    }
    match AccessLogger::new(Some(&access.path)) {
        Ok(logger) => Some(Arc::new(logger)),
        Err(err) => {
            log::warn!("failed to init access log: {err}");
            None
        }
    }
}

fn spawn_signal_handlers(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = async {
                    match sigterm.as_mut() {
                        Some(sig) => { let _ = sig.recv().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        let _ = shutdown.send(true);
    });
}

async fn handle(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> std::result::Result<Response<ProxyBody>, Infallible> {
    let request_id = stats::request_id_from_headers(req.headers());
    let method = req.method().clone();
    let uri = req.uri().clone();
    let remote = req
        .extensions()
        .get::<RemoteAddr>()
        .map(|v| v.0.clone())
        .unwrap_or_else(|| "-".to_string());
    let range_header = req
        .headers()
        .get(RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    let guard = state.stats.track(&method, &uri, range_header.as_deref());
    let started = Instant::now();

    let mut resp = route(req, &state, &request_id).await;

    apply_cors(resp.headers_mut());
    if let Ok(val) = request_id.parse() {
        resp.headers_mut()
            .insert(constants::PROTOCOL_REQUEST_ID_KEY, val);
    }
    log_access(
        &state,
        &remote,
        &method,
        &uri,
        range_header.as_deref(),
        &resp,
        started,
        &request_id,
    );
    let stats = Arc::clone(&state.stats);
    Ok(resp.map(move |inner| meter(inner, stats, guard)))
}

async fn route(req: Request<Incoming>, state: &Arc<AppState>, request_id: &str) -> Response<ProxyBody> {
    if req.method() == Method::OPTIONS {
        return empty_response(StatusCode::OK);
    }

    let path = req.uri().path().to_string();
    if req.method() == Method::GET {
        match path.as_str() {
            "/api/stats" => return stats_response(state),
            "/api/preload" => return handle_preload(req.uri(), state, request_id).await,
            "/healthz" => return text_response(StatusCode::OK, "ok"),
            "/version" => return json_response(&build_info()),
            _ => {}
        }
    }

    if constants::is_video_path(&path) {
        if req.method() == Method::GET {
            let range = req
                .headers()
                .get(RANGE)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string());
            if let Some(range) = range {
                state.stats.record_range_request();
                let url = state.origin_url(req.uri());
                return match state.engine.serve_range(&url, &range).await {
                    Ok(resp) => resp,
                    Err(err) => error_response(&err, request_id),
                };
            }
        } else if req.method() == Method::HEAD {
            let url = state.origin_url(req.uri());
            return match video_head(state, &url).await {
                Ok(resp) => resp,
                Err(err) => error_response(&err, request_id),
            };
        }
    }

    match forward_proxy(req, state, &path).await {
        Ok(resp) => resp,
        Err(err) => error_response(&err, request_id),
    }
}

async fn video_head(state: &Arc<AppState>, url: &str) -> std::result::Result<Response<ProxyBody>, ProxyError> {
    let meta = state.engine.metadata_for(url).await?;
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_LENGTH, meta.content_length.to_string())
        .header(ACCEPT_RANGES, "bytes")
        .header(
            CONTENT_TYPE,
            meta.content_type
                .as_deref()
                .unwrap_or(constants::DEFAULT_VIDEO_MIME),
        );
    if let Some(last_modified) = meta.last_modified.as_deref() {
        builder = builder.header(LAST_MODIFIED, last_modified);
    }
    if let Some(etag) = meta.etag.as_deref() {
        builder = builder.header(ETAG, etag);
    }
    Ok(builder.body(empty_body()).unwrap())
}

/// Transparent streaming reverse proxy for everything that is not a video
/// range request: directory listings, PROPFIND, the player page.
async fn forward_proxy(
    req: Request<Incoming>,
    state: &Arc<AppState>,
    path: &str,
) -> std::result::Result<Response<ProxyBody>, ProxyError> {
    let url = state.origin_url(req.uri());
    let uri: Uri = url
        .parse()
        .map_err(|_| ProxyError::Upstream(format!("invalid upstream url {url}")))?;

    let (parts, body) = req.into_parts();
    let mut headers = parts.headers;
    upstream::sanitize_headers(&mut headers);
    headers.remove(http::header::CONNECTION);

    let mut builder = Request::builder().method(parts.method).uri(uri);
    for (name, value) in headers.iter() {
        builder = builder.header(name, value);
    }
    let outbound = builder
        .body(body.map_err(|err| Box::new(err) as BoxError).boxed())
        .map_err(|err| ProxyError::Upstream(err.to_string()))?;

    let resp = state.client.forward(outbound).await?;
    let is_video = constants::is_video_path(path);
    let (parts, body) = resp.into_parts();
    let mut builder = Response::builder().status(parts.status);
    for (name, value) in parts.headers.iter() {
        if name == &http::header::CONNECTION || name == &http::header::TRANSFER_ENCODING {
            continue;
        }
        builder = builder.header(name, value);
    }
    if is_video {
        builder = builder.header(ACCEPT_RANGES, "bytes");
    }
    Ok(builder
        .body(body.map_err(|err| Box::new(err) as BoxError).boxed())
        .unwrap())
}

async fn handle_preload(uri: &Uri, state: &Arc<AppState>, request_id: &str) -> Response<ProxyBody> {
    let mut path = None;
    let mut start = 0u64;
    let mut size = state.cfg.cache.segment_size;
    if let Some(query) = uri.query() {
        for pair in query.split('&') {
            let mut it = pair.splitn(2, '=');
            let key = it.next().unwrap_or("").trim();
            let val = it.next().unwrap_or("").trim();
            match key {
                "path" if !val.is_empty() => path = Some(val.to_string()),
                "start" => start = val.parse().unwrap_or(0),
                "size" => size = val.parse().unwrap_or(size),
                _ => {}
            }
        }
    }
    let Some(path) = path else {
        return json_error(
            StatusCode::BAD_REQUEST,
            "missing path parameter",
            request_id,
            None,
        );
    };
    let path = if path.starts_with('/') {
        path
    } else {
        format!("/{}", path)
    };
    let url = format!(
        "{}{}{}",
        state.cfg.upstream.origin.trim_end_matches('/'),
        state.cfg.upstream.path_prefix,
        path
    );
    match state.engine.preload(&url, start, size).await {
        Ok(outcome) => json_response(&PreloadReply {
            status: if outcome.cached { "cached" } else { "preloaded" },
            range: format!("{}-{}", outcome.start, outcome.end),
            size: outcome.end - outcome.start + 1,
        }),
        Err(err) => error_response(&err, request_id),
    }
}

#[derive(Serialize)]
struct PreloadReply {
    status: &'static str,
    range: String,
    size: u64,
}

fn stats_response(state: &Arc<AppState>) -> Response<ProxyBody> {
    let cache = stats::CacheStats {
        metadata_entries: state.metadata.len(),
        redirect_entries: state.redirects.len(),
        segment_entries: state.segments.entry_count(),
        segment_bytes: state.segments.bytes(),
        hit_rate: state.segments.hit_rate(),
    };
    json_response(&state.stats.snapshot(cache))
}

#[derive(Serialize)]
struct BuildInfo {
    name: &'static str,
    version: &'static str,
}

fn build_info() -> BuildInfo {
    BuildInfo {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    }
}

fn apply_cors(headers: &mut HeaderMap) {
    headers.insert(
        "Access-Control-Allow-Origin",
        HeaderValue::from_static("*"),
    );
    headers.insert(
        "Access-Control-Allow-Methods",
        HeaderValue::from_static(
            "GET, POST, PUT, DELETE, OPTIONS, PROPFIND, PROPPATCH, MKCOL, COPY, MOVE",
        ),
    );
    headers.insert(
        "Access-Control-Allow-Headers",
        HeaderValue::from_static(
            "Authorization, Content-Type, Depth, Destination, If, Lock-Token, Overwrite, Timeout, X-Requested-With, Range",
        ),
    );
    headers.insert(
        "Access-Control-Expose-Headers",
        HeaderValue::from_static(
            "Content-Length, Content-Type, Date, Last-Modified, ETag, Accept-Ranges, Content-Range",
        ),
    );
    headers.insert(
        "Access-Control-Allow-Credentials",
        HeaderValue::from_static("true"),
    );
}

fn error_response(err: &ProxyError, request_id: &str) -> Response<ProxyBody> {
    let status = err.status();
    match err {
        ProxyError::RangeUnsatisfiable => empty_response(status),
        ProxyError::Internal(inner) => json_error(
            status,
            "internal error",
            request_id,
            Some(&inner.to_string()),
        ),
        _ => json_error(status, &err.to_string(), request_id, None),
    }
}

fn json_error(
    status: StatusCode,
    error: &str,
    request_id: &str,
    message: Option<&str>,
) -> Response<ProxyBody> {
    let body = match message {
        Some(message) => serde_json::json!({
            "error": error,
            "message": message,
            "requestId": request_id,
        }),
        None => serde_json::json!({
            "error": error,
            "requestId": request_id,
        }),
    };
    let payload = serde_json::to_vec(&body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json; charset=utf-8")
        .header(CONTENT_LENGTH, payload.len().to_string())
        .body(full_body(Bytes::from(payload)))
        .unwrap()
}

fn empty_response(status: StatusCode) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .body(empty_body())
        .unwrap()
}

fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(CONTENT_LENGTH, body.len().to_string())
        .body(full_body(Bytes::from(body.to_string())))
        .unwrap()
}

fn json_response<T: Serialize>(payload: &T) -> Response<ProxyBody> {
    match serde_json::to_vec(payload) {
        Ok(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "application/json; charset=utf-8")
            .header(CONTENT_LENGTH, bytes.len().to_string())
            .body(full_body(Bytes::from(bytes)))
            .unwrap(),
        Err(_) => text_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode"),
    }
}

#[allow(clippy::too_many_arguments)]
fn log_access(
    state: &AppState,
    remote: &str,
    method: &Method,
    uri: &Uri,
    range: Option<&str>,
    resp: &Response<ProxyBody>,
    started: Instant,
    request_id: &str,
) {
    let logger = match &state.access_logger {
        Some(logger) => logger,
        None => return,
    };
    let status = resp.status().as_u16();
    let bytes = resp
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");
    let cache_status = resp
        .headers()
        .get(constants::PROTOCOL_CACHE_STATUS_KEY)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");
    let duration_ms = started.elapsed().as_millis();
    let line = format!(
        "{} {} {} {} {} {} {} {} {}\n",
        normalize_field(remote),
        format_access_time(),
        normalize_field(&format!("{}+{}", method, uri)),
        status,
        bytes,
        duration_ms,
        normalize_field(range.unwrap_or("-")),
        cache_status,
        request_id,
    );
    logger.log_line(&line);
}

fn normalize_field(s: &str) -> String {
    if s.is_empty() {
        "-".to_string()
    } else {
        s.replace(' ', "+")
    }
}

/// Counts every client-bound data frame into the throughput meter and
/// releases the active-request entry when the body is dropped, on every
/// exit path.
struct MeteredBody {
    inner: ProxyBody,
    stats: Arc<Stats>,
    _guard: RequestGuard,
}

impl hyper::body::Body for MeteredBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, BoxError>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.stats.record_transfer(data.len() as u64);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

fn meter(inner: ProxyBody, stats: Arc<Stats>, guard: RequestGuard) -> ProxyBody {
    BodyExt::boxed(MeteredBody {
        inner,
        stats,
        _guard: guard,
    })
}
