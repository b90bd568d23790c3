//! Flusher behavior against a local mock bulk endpoint: trigger timing,
//! backpressure, retries and acknowledged-position bookkeeping.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use pg2search::pipe;
use pg2search::{Document, FlushOptions, Flusher, Lsn, Metrics, SearchClient};

/// Minimal HTTP server recording request bodies and answering from a
/// scripted response queue (200 `{}` once the queue is empty).
struct MockSearch {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
    responses: Arc<Mutex<VecDeque<(u16, String)>>>,
}

impl MockSearch {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let responses: Arc<Mutex<VecDeque<(u16, String)>>> = Arc::new(Mutex::new(VecDeque::new()));

        let req = requests.clone();
        let resp = responses.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(serve_connection(stream, req.clone(), resp.clone()));
            }
        });

        Self {
            addr,
            requests,
            responses,
        }
    }

    fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    async fn push_response(&self, status: u16, body: &str) {
        self.responses
            .lock()
            .await
            .push_back((status, body.to_string()));
    }

    async fn request_count(&self) -> usize {
        self.requests.lock().await.len()
    }

    async fn bodies(&self) -> Vec<Vec<u8>> {
        self.requests.lock().await.clone()
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
    responses: Arc<Mutex<VecDeque<(u16, String)>>>,
) {
    let mut buf: Vec<u8> = Vec::new();
    loop {
        // read one full request: headers, then content-length body bytes
        let header_end = loop {
            if let Some(at) = find_subslice(&buf, b"\r\n\r\n") {
                break at + 4;
            }
            let mut chunk = [0u8; 4096];
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        };

        let headers = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let content_length: usize = headers
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse().ok())?
            })
            .unwrap_or(0);

        while buf.len() < header_end + content_length {
            let mut chunk = [0u8; 4096];
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }

        let body = buf[header_end..header_end + content_length].to_vec();
        buf.drain(..header_end + content_length);
        requests.lock().await.push(body);

        let (status, response_body) = responses
            .lock()
            .await
            .pop_front()
            .unwrap_or((200, "{}".to_string()));
        let reason = if status < 300 { "OK" } else { "Error" };
        let response = format!(
            "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{response_body}",
            response_body.len()
        );
        if stream.write_all(response.as_bytes()).await.is_err() {
            return;
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn doc(pos: u64, meta: &str, data: Option<&str>) -> Document {
    Document {
        position: Lsn(pos),
        meta: Bytes::copy_from_slice(meta.as_bytes()),
        data: data.map(|d| Bytes::copy_from_slice(d.as_bytes())),
    }
}

fn fast_options(capacity: usize) -> FlushOptions {
    FlushOptions {
        capacity,
        idle: Duration::from_millis(500),
        throttle: Duration::from_millis(10),
        debounce: Duration::from_millis(50),
    }
}

struct Harness {
    server: MockSearch,
    tx: pipe::DocTx,
    ack: pipe::AckPosition,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<pg2search::Result<()>>,
}

async fn start_flusher(opts: FlushOptions) -> Harness {
    let server = MockSearch::start().await;
    let client = SearchClient::new(&server.url(), None, None).unwrap();
    let (tx, rx) = pipe::channel();
    let ack = pipe::AckPosition::new();
    let metrics = Arc::new(Metrics::new());
    let cancel = CancellationToken::new();
    let flusher = Flusher::new(client, rx, ack.clone(), metrics.clone(), opts);
    let task = tokio::spawn(flusher.run(cancel.clone()));
    Harness {
        server,
        tx,
        ack,
        metrics,
        cancel,
        task,
    }
}

#[tokio::test]
async fn test_idle_flush_publishes_position() {
    let h = start_flusher(fast_options(64 * 1024)).await;

    // one document right away, then silence
    h.tx.doc(doc(100, r#"{"index":{"_id":"a"}}"#, Some(r#"{"v":1}"#)))
        .await
        .unwrap();

    // well before the idle interval nothing is pushed
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.server.request_count().await, 0);
    assert_eq!(h.ack.get(), Lsn::ZERO);

    // after it, exactly one push carrying the document's position
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(h.server.request_count().await, 1);
    assert_eq!(h.ack.get(), Lsn(100));

    let bodies = h.server.bodies().await;
    assert_eq!(
        bodies[0],
        b"{\"index\":{\"_id\":\"a\"}}\n{\"v\":1}\n\n".to_vec()
    );

    h.cancel.cancel();
    h.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_debounce_flush_after_idle_gap() {
    let h = start_flusher(fast_options(64 * 1024)).await;

    // let the idle interval expire with an empty buffer
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(h.server.request_count().await, 0);

    // two writes back-to-back push after the debounce, not another idle
    h.tx.doc(doc(7, r#"{"index":{"_id":"a"}}"#, Some("{}")))
        .await
        .unwrap();
    h.tx.doc(doc(8, r#"{"index":{"_id":"b"}}"#, Some("{}")))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(h.server.request_count().await, 1);
    assert_eq!(h.ack.get(), Lsn(8));

    let bodies = h.server.bodies().await;
    let body = String::from_utf8(bodies[0].clone()).unwrap();
    assert!(body.contains(r#""_id":"a""#));
    assert!(body.contains(r#""_id":"b""#));

    h.cancel.cancel();
    h.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_full_buffer_backpressure() {
    // tiny buffer, payload far beyond it
    let h = start_flusher(FlushOptions {
        capacity: 256,
        idle: Duration::from_secs(30),
        throttle: Duration::from_millis(5),
        debounce: Duration::from_millis(5),
    })
    .await;

    let produced_max = Arc::new(AtomicU64::new(0));
    let violated = Arc::new(AtomicBool::new(false));

    // sample the no-phantom-ack invariant while producing
    let ack = h.ack.clone();
    let produced = produced_max.clone();
    let flag = violated.clone();
    let sampler = tokio::spawn(async move {
        loop {
            if ack.get().0 > produced.load(Ordering::Acquire) {
                flag.store(true, Ordering::Release);
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    });

    let payload = "x".repeat(80);
    for i in 1..=10u64 {
        produced_max.store(i, Ordering::Release);
        h.tx.doc(doc(
            i,
            r#"{"index":{"_id":"d"}}"#,
            Some(&format!(r#"{{"p":"{payload}"}}"#)),
        ))
        .await
        .unwrap();
    }
    drop(h.tx); // close the pipe so the flusher drains and exits

    h.task.await.unwrap().unwrap();
    sampler.abort();

    assert!(!violated.load(Ordering::Acquire), "ack ran ahead of production");
    assert_eq!(h.ack.get(), Lsn(10), "final ack equals last produced position");
    assert!(
        h.server.request_count().await >= 4,
        "small buffer forces multiple pushes"
    );

    // every push fits the buffer and the concatenation preserves order
    let bodies = h.server.bodies().await;
    let mut all = Vec::new();
    for body in &bodies {
        // each body ends with the batch-terminating extra newline
        assert!(body.len() <= 256 + 1);
        assert!(body.ends_with(b"\n\n"));
        all.extend_from_slice(&body[..body.len() - 1]);
    }
    let text = String::from_utf8(all).unwrap();
    let payload_lines = text
        .lines()
        .filter(|line| line.starts_with(r#"{"p":"#))
        .count();
    assert_eq!(payload_lines, 10, "all ten documents arrived exactly once");
}

#[tokio::test]
async fn test_mark_publishes_when_buffer_empty() {
    let h = start_flusher(fast_options(1024)).await;

    h.tx.mark(Lsn(55)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.ack.get(), Lsn(55));
    assert_eq!(h.server.request_count().await, 0, "marks alone trigger no push");

    // a stale mark never rewinds the acknowledged position
    h.tx.mark(Lsn(44)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.ack.get(), Lsn(55));

    h.cancel.cancel();
    h.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_drains_once() {
    let h = start_flusher(fast_options(1024)).await;

    h.tx.doc(doc(9, r#"{"delete":{"_id":"x"}}"#, None))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.cancel.cancel();
    h.task.await.unwrap().unwrap();

    assert_eq!(h.server.request_count().await, 1);
    assert_eq!(h.ack.get(), Lsn(9));
}

#[tokio::test]
async fn test_transient_errors_are_retried() {
    let h = start_flusher(fast_options(1024)).await;
    h.server.push_response(503, "busy").await;
    h.server.push_response(429, "slow down").await;

    h.tx.doc(doc(3, r#"{"index":{"_id":"r"}}"#, Some("{}")))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.cancel.cancel();
    h.task.await.unwrap().unwrap();

    assert_eq!(h.server.request_count().await, 3, "two failures, then success");
    assert_eq!(h.ack.get(), Lsn(3));

    let metrics = h.metrics.render();
    assert!(metrics.contains("pg2search_bulk_errors_total 2"));
}

#[tokio::test]
async fn test_three_consecutive_errors_are_fatal() {
    let h = start_flusher(fast_options(1024)).await;
    for _ in 0..3 {
        h.server.push_response(500, "broken").await;
    }

    h.tx.doc(doc(3, r#"{"index":{"_id":"r"}}"#, Some("{}")))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.cancel.cancel();

    let err = h.task.await.unwrap().unwrap_err();
    assert!(err.to_string().contains("500"));
    assert_eq!(h.ack.get(), Lsn::ZERO, "failed batches are never acknowledged");
}

#[tokio::test]
async fn test_document_missing_is_tolerated() {
    let h = start_flusher(fast_options(1024)).await;
    h.server
        .push_response(
            200,
            r#"{"errors":true,"items":[{"update":{"error":{"type":"document_missing_exception","reason":"gone"}}}]}"#,
        )
        .await;

    h.tx.doc(doc(4, r#"{"update":{"_id":"m"}}"#, Some(r#"{"doc":{}}"#)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.cancel.cancel();
    h.task.await.unwrap().unwrap();

    assert_eq!(h.server.request_count().await, 1);
    assert_eq!(h.ack.get(), Lsn(4), "tolerated item errors still commit");
}

#[tokio::test]
async fn test_other_item_errors_fail_the_commit() {
    let h = start_flusher(fast_options(1024)).await;
    let item_error =
        r#"{"errors":true,"items":[{"index":{"error":{"type":"mapper_parsing_exception","reason":"bad"}}}]}"#;
    for _ in 0..3 {
        h.server.push_response(200, item_error).await;
    }

    h.tx.doc(doc(4, r#"{"index":{"_id":"m"}}"#, Some("{}")))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.cancel.cancel();

    let err = h.task.await.unwrap().unwrap_err();
    assert!(matches!(err, pg2search::Error::BulkCommitFail));
    assert_eq!(h.ack.get(), Lsn::ZERO);
}

#[tokio::test]
async fn test_ack_is_monotone_across_flushes() {
    let h = start_flusher(FlushOptions {
        capacity: 1024,
        idle: Duration::from_millis(100),
        throttle: Duration::from_millis(5),
        debounce: Duration::from_millis(5),
    })
    .await;

    let mut last_seen = Lsn::ZERO;
    for i in 1..=5u64 {
        h.tx.doc(doc(i * 10, r#"{"index":{"_id":"s"}}"#, Some("{}")))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let now = h.ack.get();
        assert!(now >= last_seen, "published positions never decrease");
        last_seen = now;
    }
    assert_eq!(last_seen, Lsn(50));

    h.cancel.cancel();
    h.task.await.unwrap().unwrap();
}
