//! End-to-end tests over real sockets: a local origin server, the proxy
//! in front of it, and a raw HTTP/1.1 client.

use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use http::{Request, Response, StatusCode};
use slimprox::{
    CompressResponder, Mutable, NoscriptResponder, Options, Proxy, ProxyBody, Requester,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Serve every connection with one canned response, HTTP/1.1 with
/// `Connection: close`.
async fn start_origin(content_type: &'static str, body: String) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let body = Arc::new(body);
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let body = Arc::clone(&body);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 16 * 1024];
                let mut read = 0;
                loop {
                    match stream.read(&mut buf[read..]).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => read += n,
                    }
                    if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                    if read == buf.len() {
                        return;
                    }
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });
    addr
}

async fn start_proxy(mut opts: Options) -> (SocketAddr, Arc<Proxy>) {
    // Grab a free port, then hand it to the proxy.
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    opts.addresses = vec![addr.to_string()];
    let proxy = Arc::new(Proxy::new(opts).unwrap());
    {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move {
            let _ = proxy.listen_and_serve().await;
        });
    }
    for _ in 0..100 {
        if TcpStream::connect(addr).await.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    (addr, proxy)
}

/// Send raw request bytes and return (status, headers, body).
async fn raw_request(proxy: SocketAddr, request: String) -> (u16, String, Vec<u8>) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(30), stream.read_to_end(&mut response))
        .await
        .expect("response within deadline")
        .unwrap();

    let head_end = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("complete response head");
    let head = String::from_utf8_lossy(&response[..head_end]).to_string();
    let body = response[head_end + 4..].to_vec();
    let status: u16 = head
        .split_whitespace()
        .nth(1)
        .expect("status line")
        .parse()
        .expect("numeric status");
    (status, head, body)
}

fn get_via_proxy(origin: SocketAddr, extra_headers: &str) -> String {
    format!(
        "GET http://{origin}/page HTTP/1.1\r\nHost: {origin}\r\n{extra_headers}Connection: close\r\n\r\n"
    )
}

#[tokio::test]
async fn forwards_plain_http() {
    let origin = start_origin("text/plain", "hello through the proxy".to_string()).await;
    let (proxy_addr, _proxy) = start_proxy(Options::default()).await;

    let (status, _head, body) = raw_request(proxy_addr, get_via_proxy(origin, "")).await;
    assert_eq!(status, 200);
    assert_eq!(body, b"hello through the proxy");
}

#[tokio::test]
async fn origin_form_without_connect_is_rejected() {
    let (proxy_addr, _proxy) = start_proxy(Options::default()).await;
    let (status, _head, _body) = raw_request(
        proxy_addr,
        "GET /page HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n".to_string(),
    )
    .await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn auth_challenges_and_accepts() {
    let origin = start_origin("text/plain", "secret ok".to_string()).await;
    let (proxy_addr, _proxy) = start_proxy(Options {
        auth: "user:pass".to_string(),
        ..Default::default()
    })
    .await;

    let (status, head, _body) = raw_request(proxy_addr, get_via_proxy(origin, "")).await;
    assert_eq!(status, 407);
    assert!(
        head.contains("Basic realm=\"Proxy\""),
        "challenge should carry the Proxy realm: {head}"
    );

    let token = base64::engine::general_purpose::STANDARD.encode("User:pass");
    let auth_header = format!("Proxy-Authorization: Basic {token}\r\n");
    let (status, _head, body) = raw_request(proxy_addr, get_via_proxy(origin, &auth_header)).await;
    assert_eq!(status, 200, "username comparison is case-insensitive");
    assert_eq!(body, b"secret ok");
}

#[tokio::test]
async fn blocked_host_yields_521() {
    let (proxy_addr, _proxy) = start_proxy(Options {
        block_hosts: vec!["blocked.example".to_string()],
        ..Default::default()
    })
    .await;

    let request = "GET http://blocked.example/ HTTP/1.1\r\nHost: blocked.example\r\nConnection: close\r\n\r\n"
        .to_string();
    let (status, _head, body) = raw_request(proxy_addr, request).await;
    assert_eq!(status, 521);
    assert_eq!(body, b"Down");
}

#[tokio::test]
async fn unreachable_upstream_yields_502() {
    // Find a port with nothing listening on it.
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = probe.local_addr().unwrap();
    drop(probe);

    let (proxy_addr, _proxy) = start_proxy(Options::default()).await;
    let (status, _head, body) = raw_request(proxy_addr, get_via_proxy(dead, "")).await;
    assert_eq!(status, 502);
    assert_eq!(body, b"Bad Gateway");
}

#[tokio::test]
async fn connect_to_odd_port_is_rejected() {
    let (proxy_addr, _proxy) = start_proxy(Options::default()).await;
    let request =
        "CONNECT example.com:9999 HTTP/1.1\r\nHost: example.com:9999\r\nConnection: close\r\n\r\n"
            .to_string();
    let (status, _head, _body) = raw_request(proxy_addr, request).await;
    assert_eq!(status, 403);
}

#[tokio::test]
async fn noscript_rewrites_html_in_flight() {
    let origin = start_origin(
        "text/html; charset=utf-8",
        "<html><body><script>evil()</script><p onclick='x()'>hi</p></body></html>".to_string(),
    )
    .await;
    let (proxy_addr, proxy) = start_proxy(Options::default()).await;
    proxy.add_responder(Arc::new(NoscriptResponder::new()));

    let (status, head, body) = raw_request(proxy_addr, get_via_proxy(origin, "")).await;
    assert_eq!(status, 200);
    let html = String::from_utf8(body).unwrap();
    assert_eq!(html, "<html><body><p>hi</p></body></html>");
    // Content-Length recomputed from the replaced body.
    assert!(
        head.to_lowercase()
            .contains(&format!("content-length: {}", html.len())),
        "{head}"
    );
}

#[tokio::test]
async fn compressor_encodes_for_accepting_clients() {
    let text = "compressible content ".repeat(64);
    let origin = start_origin("text/plain", text.clone()).await;
    let (proxy_addr, proxy) = start_proxy(Options::default()).await;
    proxy.add_responder(Arc::new(CompressResponder::new()));

    let (status, head, body) = raw_request(
        proxy_addr,
        get_via_proxy(origin, "Accept-Encoding: gzip\r\n"),
    )
    .await;
    assert_eq!(status, 200);
    assert!(
        head.to_lowercase().contains("content-encoding: gzip"),
        "{head}"
    );
    let mut decoder = flate2::read::GzDecoder::new(&body[..]);
    let mut decoded = String::new();
    decoder.read_to_string(&mut decoded).unwrap();
    assert_eq!(decoded, text);
}

struct Teapot;

#[async_trait]
impl Requester for Teapot {
    async fn request(
        &self,
        req: Request<ProxyBody>,
    ) -> Result<Request<ProxyBody>, Response<ProxyBody>> {
        if req.uri().path().ends_with("/tea") {
            return Err(Response::builder()
                .status(StatusCode::IM_A_TEAPOT)
                .body(ProxyBody::from(Mutable::from("short and stout")))
                .unwrap());
        }
        Ok(req)
    }
}

#[tokio::test]
async fn requester_can_short_circuit() {
    let origin = start_origin("text/plain", "origin".to_string()).await;
    let (proxy_addr, proxy) = start_proxy(Options::default()).await;
    proxy.add_requester(Arc::new(Teapot));

    let request = format!(
        "GET http://{origin}/tea HTTP/1.1\r\nHost: {origin}\r\nConnection: close\r\n\r\n"
    );
    let (status, head, body) = raw_request(proxy_addr, request).await;
    assert_eq!(status, 418);
    assert_eq!(body, b"short and stout");
    assert!(
        head.to_lowercase().contains("content-length: 15"),
        "early responses get Content-Length from the buffer: {head}"
    );

    // Other paths still reach the origin.
    let (status, _head, body) = raw_request(proxy_addr, get_via_proxy(origin, "")).await;
    assert_eq!(status, 200);
    assert_eq!(body, b"origin");
}
