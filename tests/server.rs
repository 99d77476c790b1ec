use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use rttp_shield::cache::{CacheConfig, MemoryStore, ResponseCache, layer};
use rttp_shield::middleware::Chain;
use rttp_shield::server::Server;
use rttp_shield::{Context, Response, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

struct Reply {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Reply {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

async fn read_reply(stream: &mut TcpStream, buf: &mut BytesMut) -> Reply {
    loop {
        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut parsed = httparse::Response::new(&mut headers);
        if let httparse::Status::Complete(offset) = parsed.parse(buf).unwrap() {
            let headers: Vec<(String, String)> = parsed
                .headers
                .iter()
                .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
                .collect();
            let length: usize = headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                .map(|(_, v)| v.parse().unwrap())
                .unwrap_or(0);
            if buf.len() >= offset + length {
                let status = parsed.code.unwrap();
                let message = buf.split_to(offset + length);
                return Reply {
                    status,
                    headers,
                    body: message[offset..].to_vec(),
                };
            }
        }
        let n = stream.read_buf(buf).await.unwrap();
        assert!(n > 0, "connection closed before a full response arrived");
    }
}

async fn start(
    calls: Arc<AtomicUsize>,
) -> (std::net::SocketAddr, CancellationToken, tokio::task::JoinHandle<()>) {
    let cache = Arc::new(ResponseCache::new(CacheConfig::default(), Arc::new(MemoryStore::new())).unwrap());
    let pipeline = Chain::new().with(layer(cache)).finish(move |ctx: Context| {
        calls.fetch_add(1, Ordering::SeqCst);
        let body = format!(
            "{} {} {} {}",
            ctx.request().method(),
            ctx.request().path(),
            ctx.request().body().len(),
            ctx.request().remote_addr().map(|a| a.ip().to_string()).unwrap_or_default()
        );
        async move { Response::new(StatusCode::Ok).body(body) }
    });

    let server = Server::bind("127.0.0.1:0")
        .await
        .unwrap()
        .with_request_timeout(Some(Duration::from_secs(5)));
    let addr = server.local_addr();
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let task = tokio::spawn(async move {
        server.run_until(pipeline, token).await.unwrap();
    });
    (addr, shutdown, task)
}

#[tokio::test]
async fn serves_and_caches_over_keep_alive() {
    let calls = Arc::new(AtomicUsize::new(0));
    let (addr, shutdown, task) = start(Arc::clone(&calls)).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut buf = BytesMut::new();

    for _ in 0..2 {
        stream
            .write_all(b"GET /contacts?page=1 HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let reply = read_reply(&mut stream, &mut buf).await;
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body, b"GET /contacts 0 127.0.0.1");
        assert_eq!(reply.header("connection"), Some("keep-alive"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn body_is_bounded_by_content_length() {
    let calls = Arc::new(AtomicUsize::new(0));
    let (addr, shutdown, task) = start(Arc::clone(&calls)).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut buf = BytesMut::new();

    // Two pipelined requests in one write.
    stream
        .write_all(
            b"POST /contacts HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello\
              POST /contacts HTTP/1.1\r\nContent-Length: 2\r\nConnection: close\r\n\r\nhi",
        )
        .await
        .unwrap();

    let first = read_reply(&mut stream, &mut buf).await;
    assert_eq!(first.body, b"POST /contacts 5 127.0.0.1");
    let second = read_reply(&mut stream, &mut buf).await;
    assert_eq!(second.body, b"POST /contacts 2 127.0.0.1");
    assert_eq!(second.header("connection"), Some("close"));

    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn malformed_request_gets_json_400() {
    let calls = Arc::new(AtomicUsize::new(0));
    let (addr, shutdown, task) = start(Arc::clone(&calls)).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut buf = BytesMut::new();
    stream.write_all(b"NOT A REQUEST\r\n\r\n").await.unwrap();

    let reply = read_reply(&mut stream, &mut buf).await;
    assert_eq!(reply.status, 400);
    assert_eq!(reply.header("content-type"), Some("application/json"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn oversized_content_length_gets_413() {
    let calls = Arc::new(AtomicUsize::new(0));
    let (addr, shutdown, task) = start(Arc::clone(&calls)).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut buf = BytesMut::new();
    stream
        .write_all(b"POST /contacts HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\n")
        .await
        .unwrap();

    let reply = read_reply(&mut stream, &mut buf).await;
    assert_eq!(reply.status, 413);
    assert_eq!(reply.header("connection"), Some("close"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    shutdown.cancel();
    task.await.unwrap();
}
