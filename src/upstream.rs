use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::config::Upstream;
use crate::error::ProxyError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type ProxyBody = BoxBody<Bytes, BoxError>;

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub fn full_body(bytes: Bytes) -> ProxyBody {
    http_body_util::Full::new(bytes)
        .map_err(|never| match never {})
        .boxed()
}

/// Pooled keep-alive client shared by every outbound request, origin and
/// CDN alike. One instance per process.
#[derive(Clone)]
pub struct OriginClient {
    client: Client<HttpsConnector<HttpConnector>, ProxyBody>,
    request_timeout: Duration,
    user_agent: String,
}

impl OriginClient {
    pub fn new(cfg: &Upstream) -> Self {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(cfg.idle_timeout)
            .pool_max_idle_per_host(cfg.max_idle_per_host)
            .build(https);
        Self {
            client,
            request_timeout: cfg.request_timeout,
            user_agent: cfg.user_agent.clone(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// HEAD used only to learn size and representation metadata.
    pub async fn head(&self, url: &str) -> Result<(StatusCode, HeaderMap), ProxyError> {
        let resp = self.dispatch(Method::HEAD, url, None).await?;
        Ok((resp.status(), resp.headers().clone()))
    }

    /// Streaming GET; the caller owns and classifies the response. The
    /// optional range is inclusive bounds.
    pub async fn get(
        &self,
        url: &str,
        range: Option<(u64, u64)>,
    ) -> Result<Response<Incoming>, ProxyError> {
        self.dispatch(Method::GET, url, range).await
    }

    /// Passes an already-built request through the pool; used by the
    /// transparent proxy path. The caller has sanitized the headers.
    pub async fn forward(
        &self,
        req: Request<ProxyBody>,
    ) -> Result<Response<Incoming>, ProxyError> {
        let fut = self.client.request(req);
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(err)) => Err(ProxyError::Upstream(err.to_string())),
            Err(_) => Err(ProxyError::UpstreamTimeout),
        }
    }

    async fn dispatch(
        &self,
        method: Method,
        url: &str,
        range: Option<(u64, u64)>,
    ) -> Result<Response<Incoming>, ProxyError> {
        let uri: Uri = url
            .parse()
            .map_err(|_| ProxyError::Upstream(format!("invalid upstream url {url}")))?;
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("User-Agent", self.user_agent.as_str())
            .header("Accept", "*/*");
        if let Some((start, end)) = range {
            builder = builder.header("Range", format!("bytes={}-{}", start, end));
        }
        let req = builder
            .body(empty_body())
            .map_err(|err| ProxyError::Upstream(err.to_string()))?;
        self.forward(req).await
    }
}

/// Outbound requests never leak the browser's identity to the origin.
pub fn sanitize_headers(headers: &mut HeaderMap) {
    headers.remove(http::header::HOST);
    headers.remove(http::header::ORIGIN);
    headers.remove(http::header::REFERER);
}
