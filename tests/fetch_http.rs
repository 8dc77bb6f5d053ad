//! HttpFetcher retry behavior against a scripted loopback server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use memfetch::{ErrorKind, EntryError, Fetch, FetchSettings, HttpFetcher, MemoryError};

/// Serves one scripted response per connection; the last one repeats.
/// `None` accepts the connection and never answers.
async fn serve(script: Vec<Option<(u16, &'static str)>>) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connections);

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let index = counter.fetch_add(1, Ordering::SeqCst);
            let step = script[index.min(script.len() - 1)];
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let Some((status, body)) = step else {
                    tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                    return;
                };
                let response = format!(
                    "HTTP/1.1 {status} X\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (format!("http://{addr}"), connections)
}

fn settings() -> FetchSettings {
    FetchSettings {
        max_attempts: 3,
        attempt_timeout_secs: 1,
        connect_timeout_secs: 1,
        backoff_ms: 10,
        max_backoff_ms: 40,
    }
}

// ─── Retries ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn transient_server_error_is_retried() {
    let (base, connections) = serve(vec![Some((503, "busy")), Some((200, "media-bytes"))]).await;
    let fetcher = HttpFetcher::new(settings()).unwrap();

    let body = fetcher.fetch(&format!("{base}/a.jpg")).await.unwrap();
    assert_eq!(&body[..], b"media-bytes");
    assert_eq!(connections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn rate_limit_is_retried() {
    let (base, connections) = serve(vec![Some((429, "")), Some((429, "")), Some((200, "ok"))]).await;
    let fetcher = HttpFetcher::new(settings()).unwrap();

    let body = fetcher.fetch(&format!("{base}/a.jpg")).await.unwrap();
    assert_eq!(&body[..], b"ok");
    assert_eq!(connections.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn exhausted_retries_report_last_status() {
    let (base, connections) = serve(vec![Some((500, "oops"))]).await;
    let fetcher = HttpFetcher::new(settings()).unwrap();

    let err = fetcher.fetch(&format!("{base}/a.jpg")).await.unwrap_err();
    assert_eq!(connections.load(Ordering::SeqCst), 3);
    let entry = EntryError::from(&err);
    assert_eq!(entry.kind, ErrorKind::Network);
    assert!(entry.message.contains("500"), "{}", entry.message);
    assert!(entry.message.contains("after 3 attempts"), "{}", entry.message);
}

// ─── Fatal responses ─────────────────────────────────────────────────────────

#[tokio::test]
async fn expired_link_is_not_retried() {
    let (base, connections) = serve(vec![Some((403, "expired"))]).await;
    let fetcher = HttpFetcher::new(settings()).unwrap();

    let err = fetcher
        .fetch(&format!("{base}/a.jpg?Signature=topsecret&Expires=1"))
        .await
        .unwrap_err();
    assert_eq!(connections.load(Ordering::SeqCst), 1);
    match err {
        MemoryError::Network { url, reason } => {
            assert!(reason.contains("403"), "{reason}");
            assert!(!url.contains("topsecret"), "{url}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn not_found_is_not_retried() {
    let (base, connections) = serve(vec![Some((404, ""))]).await;
    let fetcher = HttpFetcher::new(settings()).unwrap();

    assert!(fetcher.fetch(&format!("{base}/gone.mp4")).await.is_err());
    assert_eq!(connections.load(Ordering::SeqCst), 1);
}

// ─── Timeouts ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn stalled_attempt_times_out_and_retries() {
    let (base, connections) = serve(vec![None, Some((200, "late"))]).await;
    let fetcher = HttpFetcher::new(settings()).unwrap();

    let body = fetcher.fetch(&format!("{base}/slow.mp4")).await.unwrap();
    assert_eq!(&body[..], b"late");
    assert_eq!(connections.load(Ordering::SeqCst), 2);
}
