#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use matinee::config::{Bootstrap, CacheSettings, Logger, Server, Upstream};
use rand::RngCore;
use tokio::net::TcpListener;
use tokio::sync::watch;

pub struct ProxyHandle {
    pub addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

impl ProxyHandle {
    pub fn client(&self) -> TestClient {
        TestClient { proxy_addr: self.addr }
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

pub async fn spawn_proxy(origin: SocketAddr) -> ProxyHandle {
    spawn_proxy_with(origin, |_| {}).await
}

pub async fn spawn_proxy_with<F>(origin: SocketAddr, edit: F) -> ProxyHandle
where
    F: FnOnce(&mut Bootstrap),
{
    let mut cfg = Bootstrap {
        strict: false,
        pidfile: None,
        logger: Logger::default(),
        server: Server {
            addr: "127.0.0.1:0".to_string(),
            access_log: None,
        },
        upstream: Upstream {
            origin: format!("http://{}", origin),
            path_prefix: String::new(),
            ..Upstream::default()
        },
        cache: CacheSettings::default(),
    };
    edit(&mut cfg);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy");
    let addr = listener.local_addr().expect("proxy addr");
    let (shutdown, rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = matinee::server::serve(listener, rx, Arc::new(cfg)).await;
    });
    ProxyHandle { addr, shutdown }
}

#[derive(Clone)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("json body")
    }
}

#[derive(Clone)]
pub struct TestClient {
    proxy_addr: SocketAddr,
}

impl TestClient {
    pub async fn send(&self, method: Method, path: &str, headers: HeaderMap) -> TestResponse {
        let stream = tokio::net::TcpStream::connect(self.proxy_addr)
            .await
            .expect("connect proxy");
        let io = TokioIo::new(stream);
        let (mut sender, conn) = http1::handshake(io).await.expect("handshake");
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let uri: http::Uri = format!("http://{}{}", self.proxy_addr, path)
            .parse()
            .expect("uri");
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(http::header::HOST, self.proxy_addr.to_string());
        for (k, v) in headers.iter() {
            builder = builder.header(k, v);
        }
        let req = builder.body(Full::new(Bytes::new())).expect("request");

        let resp = sender.send_request(req).await.expect("send request");
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.into_body().collect().await.expect("body").to_bytes();

        TestResponse {
            status,
            headers,
            body,
        }
    }

    pub async fn get(&self, path: &str) -> TestResponse {
        self.send(Method::GET, path, HeaderMap::new()).await
    }

    pub async fn get_range(&self, path: &str, range: &str) -> TestResponse {
        let mut headers = HeaderMap::new();
        headers.insert("Range", range.parse().unwrap());
        self.send(Method::GET, path, headers).await
    }

    pub async fn stats(&self) -> serde_json::Value {
        self.get("/api/stats").await.json()
    }
}

pub struct MockServer {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown, mut rx) = tokio::sync::oneshot::channel();
        let hits = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(handler);
        let hits_inner = Arc::clone(&hits);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    res = listener.accept() => {
                        let (stream, _) = match res { Ok(v) => v, Err(_) => break };
                        let io = TokioIo::new(stream);
                        let handler = Arc::clone(&handler);
                        let hits = Arc::clone(&hits_inner);
                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                hits.fetch_add(1, Ordering::SeqCst);
                                let resp = handler(req);
                                async move { Ok::<_, hyper::Error>(resp) }
                            });
                            let builder = ConnBuilder::new(TokioExecutor::new());
                            let _ = builder.serve_connection(io, service).await;
                        });
                    }
                }
            }
        });

        Self {
            addr,
            hits,
            shutdown: Some(shutdown),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

#[derive(Clone)]
pub struct MockFile {
    pub path: PathBuf,
    pub md5: String,
    pub size: usize,
    _temp_dir: Arc<tempfile::TempDir>,
}

pub fn gen_file(size: usize) -> MockFile {
    let mut buf = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut buf);
    let dir = Arc::new(tempfile::tempdir().expect("tempdir"));
    let path = dir.path().join(format!("file-{size}.bin"));
    std::fs::write(&path, &buf).expect("write file");
    let digest = format!("{:x}", md5::compute(&buf));
    MockFile {
        path,
        md5: digest,
        size,
        _temp_dir: dir,
    }
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

pub fn read_range(path: &PathBuf, start: usize, length: usize) -> Vec<u8> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = std::fs::File::open(path).expect("open file");
    file.seek(SeekFrom::Start(start as u64)).expect("seek");
    let mut buf = vec![0u8; length];
    file.read_exact(&mut buf).expect("read range");
    buf
}

fn parse_bytes_range(raw: &str, total: u64) -> Option<(u64, u64)> {
    let rest = raw.trim().strip_prefix("bytes=")?;
    let (start, end) = rest.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = if end.trim().is_empty() {
        total - 1
    } else {
        end.trim().parse::<u64>().ok()?.min(total - 1)
    };
    if start >= total || end < start {
        return None;
    }
    Some((start, end))
}

fn base_headers(file: &MockFile) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("Content-Type", "video/mp4".parse().unwrap());
    headers.insert("ETag", file.md5.parse().unwrap());
    headers.insert(
        "Last-Modified",
        httpdate::fmt_http_date(std::time::SystemTime::now())
            .parse()
            .unwrap(),
    );
    headers
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Bytes) -> Response<Full<Bytes>> {
    let mut builder = Response::builder().status(status);
    for (k, v) in headers.iter() {
        builder = builder.header(k, v);
    }
    builder.body(Full::new(body)).unwrap()
}

/// Origin that honors HEAD and Range (replies 206 to ranged GETs).
pub fn resp_range_file(
    file: &MockFile,
) -> impl Fn(Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync {
    let file = file.clone();
    move |req: Request<Incoming>| {
        let bytes = std::fs::read(&file.path).expect("read file");
        let total = bytes.len() as u64;
        let mut headers = base_headers(&file);
        if req.method() == Method::HEAD {
            headers.insert("Content-Length", total.to_string().parse().unwrap());
            return build_response(StatusCode::OK, headers, Bytes::new());
        }
        let range = req
            .headers()
            .get("Range")
            .and_then(|v| v.to_str().ok())
            .and_then(|raw| parse_bytes_range(raw, total));
        match range {
            Some((start, end)) => {
                let slice = Bytes::from(bytes[start as usize..=end as usize].to_vec());
                headers.insert(
                    "Content-Range",
                    format!("bytes {}-{}/{}", start, end, total).parse().unwrap(),
                );
                headers.insert("Content-Length", slice.len().to_string().parse().unwrap());
                build_response(StatusCode::PARTIAL_CONTENT, headers, slice)
            }
            None => {
                headers.insert("Content-Length", total.to_string().parse().unwrap());
                build_response(StatusCode::OK, headers, Bytes::from(bytes))
            }
        }
    }
}

/// Origin that ignores Range headers and always replies 200 with the full
/// body.
pub fn resp_full_file(
    file: &MockFile,
) -> impl Fn(Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync {
    let file = file.clone();
    move |req: Request<Incoming>| {
        let bytes = std::fs::read(&file.path).expect("read file");
        let total = bytes.len() as u64;
        let mut headers = base_headers(&file);
        headers.insert("Content-Length", total.to_string().parse().unwrap());
        if req.method() == Method::HEAD {
            return build_response(StatusCode::OK, headers, Bytes::new());
        }
        build_response(StatusCode::OK, headers, Bytes::from(bytes))
    }
}

/// Origin that redirects every request to `location`.
pub fn resp_redirect(
    location: String,
) -> impl Fn(Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync {
    move |_req: Request<Incoming>| {
        let mut headers = HeaderMap::new();
        headers.insert("Location", location.parse().unwrap());
        build_response(StatusCode::FOUND, headers, Bytes::new())
    }
}

/// Polls the stats endpoint until `pred` holds or the deadline passes.
pub async fn wait_for_stats<F>(client: &TestClient, pred: F) -> serde_json::Value
where
    F: Fn(&serde_json::Value) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let stats = client.stats().await;
        if pred(&stats) {
            return stats;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("stats condition not met in time: {stats}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
