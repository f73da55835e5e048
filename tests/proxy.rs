mod support;

use std::time::Duration;

use http::{HeaderMap, Method, StatusCode};
use support::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const MIB: usize = 1024 * 1024;

#[tokio::test]
async fn test_native_206_passthrough_with_expansion() {
    let file = gen_file(10 * MIB);
    let origin = MockServer::start(resp_range_file(&file)).await;
    let proxy = spawn_proxy(origin.addr()).await;
    let client = proxy.client();

    let resp = client.get_range("/movie.mp4", "bytes=0-1023").await;
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        resp.headers().get("Content-Range").unwrap(),
        &format!("bytes 0-1023/{}", 10 * MIB)
    );
    assert_eq!(resp.headers().get("Content-Length").unwrap(), "1024");
    assert_eq!(resp.headers().get("Accept-Ranges").unwrap(), "bytes");
    assert_eq!(resp.headers().get("Content-Type").unwrap(), "video/mp4");
    assert_eq!(resp.body().len(), 1024);
    assert_eq!(
        hash_bytes(resp.body()),
        hash_bytes(&read_range(&file.path, 0, 1024))
    );

    // the expanded fetch keeps filling the segment cache after the client
    // interval is served
    wait_for_stats(&client, |stats| {
        stats["cache"]["segmentEntries"].as_u64().unwrap_or(0) >= 5
    })
    .await;

    // a second request inside the prefetched window is served from cache
    // with zero upstream traffic
    let hits_before = origin.hits();
    let resp = client.get_range("/movie.mp4", "bytes=512-1535").await;
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(resp.body().len(), 1024);
    assert_eq!(
        hash_bytes(resp.body()),
        hash_bytes(&read_range(&file.path, 512, 1024))
    );
    assert_eq!(resp.headers().get("X-Cache").unwrap(), "HIT");
    assert_eq!(origin.hits(), hits_before);
}

#[tokio::test]
async fn test_repeat_request_is_byte_identical() {
    let file = gen_file(6 * MIB);
    let origin = MockServer::start(resp_range_file(&file)).await;
    let proxy = spawn_proxy(origin.addr()).await;
    let client = proxy.client();

    let first = client.get_range("/movie.mp4", "bytes=4096-8191").await;
    wait_for_stats(&client, |stats| {
        stats["cache"]["segmentEntries"].as_u64().unwrap_or(0) >= 1
    })
    .await;
    let second = client.get_range("/movie.mp4", "bytes=4096-8191").await;

    assert_eq!(first.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(second.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(first.body(), second.body());
    assert_eq!(second.headers().get("X-Cache").unwrap(), "HIT");
}

#[tokio::test]
async fn test_stream_slice_from_200_body() {
    let file = gen_file(8 * MIB);
    let origin = MockServer::start(resp_full_file(&file)).await;
    let proxy = spawn_proxy(origin.addr()).await;
    let client = proxy.client();

    let resp = client.get_range("/movie.mp4", "bytes=1024-2047").await;
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        resp.headers().get("Content-Range").unwrap(),
        &format!("bytes 1024-2047/{}", 8 * MIB)
    );
    assert_eq!(resp.body().len(), 1024);
    assert_eq!(
        hash_bytes(resp.body()),
        hash_bytes(&read_range(&file.path, 1024, 1024))
    );

    // the reader was destroyed at the owed boundary; no complete segment
    // was ever collected
    tokio::time::sleep(Duration::from_millis(200)).await;
    let stats = client.stats().await;
    assert_eq!(stats["cache"]["segmentEntries"].as_u64().unwrap(), 0);
}

#[tokio::test]
async fn test_redirect_follow_and_redirect_cache() {
    let file = gen_file(20 * MIB);
    let cdn = MockServer::start(resp_range_file(&file)).await;
    let origin = MockServer::start(resp_redirect(format!("http://{}/movie.mp4", cdn.addr()))).await;
    let proxy = spawn_proxy(origin.addr()).await;
    let client = proxy.client();

    let resp = client.get_range("/movie.mp4", "bytes=0-1023").await;
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(resp.body().len(), 1024);
    assert_eq!(
        hash_bytes(resp.body()),
        hash_bytes(&read_range(&file.path, 0, 1024))
    );

    let origin_hits = origin.hits();
    let cdn_hits = cdn.hits();

    // an uncached window far from the first: the origin is skipped
    // entirely thanks to the redirect cache
    let start = 12 * MIB;
    let resp = client
        .get_range("/movie.mp4", &format!("bytes={}-{}", start, start + 1023))
        .await;
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        hash_bytes(resp.body()),
        hash_bytes(&read_range(&file.path, start, 1024))
    );
    assert_eq!(origin.hits(), origin_hits);
    assert!(cdn.hits() > cdn_hits);
}

#[tokio::test]
async fn test_unsatisfiable_and_malformed_ranges() {
    let file = gen_file(1 * MIB);
    let origin = MockServer::start(resp_range_file(&file)).await;
    let proxy = spawn_proxy(origin.addr()).await;
    let client = proxy.client();

    let resp = client
        .get_range("/movie.mp4", &format!("bytes={}-", 2 * MIB))
        .await;
    assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    // errors still carry CORS
    assert_eq!(
        resp.headers().get("Access-Control-Allow-Origin").unwrap(),
        "*"
    );

    let resp = client.get_range("/movie.mp4", "chunks=0-1").await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = resp.json();
    assert!(body["error"].as_str().unwrap().contains("range"));
    assert!(body["requestId"].as_str().is_some());
}

#[tokio::test]
async fn test_upstream_error_maps_to_bad_gateway() {
    let origin = MockServer::start(|_req| {
        http::Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(http_body_util::Full::new(bytes::Bytes::new()))
            .unwrap()
    })
    .await;
    let proxy = spawn_proxy(origin.addr()).await;
    let client = proxy.client();

    let resp = client.get_range("/movie.mp4", "bytes=0-1023").await;
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_head_video_served_from_metadata() {
    let file = gen_file(4 * MIB);
    let origin = MockServer::start(resp_range_file(&file)).await;
    let proxy = spawn_proxy(origin.addr()).await;
    let client = proxy.client();

    let resp = client.send(Method::HEAD, "/movie.mp4", HeaderMap::new()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("Content-Length").unwrap(),
        &(4 * MIB).to_string()
    );
    assert_eq!(resp.headers().get("Accept-Ranges").unwrap(), "bytes");

    // second HEAD answers from the metadata cache
    let hits = origin.hits();
    let resp = client.send(Method::HEAD, "/movie.mp4", HeaderMap::new()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(origin.hits(), hits);
}

#[tokio::test]
async fn test_passthrough_proxy_for_non_video() {
    let origin = MockServer::start(|req| {
        assert!(req.headers().get("Origin").is_none());
        assert!(req.headers().get("Referer").is_none());
        http::Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/html")
            .body(http_body_util::Full::new(bytes::Bytes::from_static(
                b"<html>listing</html>",
            )))
            .unwrap()
    })
    .await;
    let proxy = spawn_proxy(origin.addr()).await;
    let client = proxy.client();

    let mut headers = HeaderMap::new();
    headers.insert("Origin", "http://player.local".parse().unwrap());
    headers.insert("Referer", "http://player.local/index".parse().unwrap());
    let resp = client.send(Method::GET, "/share/", headers).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.body().as_ref(), b"<html>listing</html>");
    assert_eq!(
        resp.headers().get("Access-Control-Allow-Origin").unwrap(),
        "*"
    );
}

#[tokio::test]
async fn test_path_prefix_applied_to_origin() {
    let file = gen_file(4 * MIB);
    let inner = resp_range_file(&file);
    let origin = MockServer::start(move |req| {
        assert!(req.uri().path().starts_with("/webdav/"));
        inner(req)
    })
    .await;
    let proxy = spawn_proxy_with(origin.addr(), |cfg| {
        cfg.upstream.path_prefix = "/webdav".to_string();
    })
    .await;
    let client = proxy.client();

    let resp = client.get_range("/movie.mp4", "bytes=0-1023").await;
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(resp.body().len(), 1024);
}

#[tokio::test]
async fn test_client_disconnect_releases_request() {
    let file = gen_file(24 * MIB);
    let origin = MockServer::start(resp_range_file(&file)).await;
    let proxy = spawn_proxy(origin.addr()).await;
    let client = proxy.client();

    // raw connection so the socket can be dropped mid-body
    {
        let mut stream = tokio::net::TcpStream::connect(proxy.addr).await.unwrap();
        let req = format!(
            "GET /movie.mp4 HTTP/1.1\r\nHost: {}\r\nRange: bytes=0-\r\n\r\n",
            proxy.addr
        );
        stream.write_all(req.as_bytes()).await.unwrap();
        let mut buf = vec![0u8; 64 * 1024];
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0);
        assert!(buf[..n].starts_with(b"HTTP/1.1 206"));
        // connection dropped here
    }

    // the engine notices the write failure and lets go of the request;
    // only the stats poll itself remains in the active table
    wait_for_stats(&client, |stats| {
        stats["activeRequests"].as_u64() == Some(1)
    })
    .await;
}
