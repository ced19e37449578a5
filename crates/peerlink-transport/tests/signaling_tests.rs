//! Signaling Transport Tests
//!
//! Runs the relay link against local servers:
//! - WebSocket path: queued messages, inbound delivery, link loss
//! - HTTP fallback stream: preamble, segment rotation, stale segments
//! - HTTP send path while the socket is not open

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use peerlink_core::{MessageType, SignalMessage};
use peerlink_transport::{HttpRelay, Relay, SignalEvent, SignalingConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message as WsMessage;

fn local_config(port: u16, fallback: bool) -> SignalingConfig {
    SignalingConfig {
        host: "127.0.0.1".into(),
        port,
        fallback,
        stream_timeout: Duration::from_millis(150),
        fallback_grace: Duration::from_millis(50),
        ..Default::default()
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<SignalEvent>) -> SignalEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for signal event")
        .expect("event channel closed")
}

// ============================================================================
// Helper: minimal HTTP relay
// ============================================================================

struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}

async fn read_request(stream: &mut TcpStream) -> Option<HttpRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut lines = head.lines();
    let mut first = lines.next()?.split_whitespace();
    let method = first.next()?.to_string();
    let path = first.next()?.to_string();
    let content_length = lines
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = buf[head_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    Some(HttpRequest { method, path, body })
}

/// How the fake relay answers a stream segment
#[derive(Clone, Copy)]
enum SegmentReply {
    /// 200 after `delay`, with a preamble line and one LEAVE from `seg{i}`
    Stream { slow_segment: Option<u64>, delay_ms: u64 },
    Status(u16),
}

/// Serves stream segments and message POSTs; WebSocket upgrade requests are
/// left hanging so the socket never opens.
async fn start_http_relay(
    reply: SegmentReply,
) -> (u16, mpsc::UnboundedReceiver<(String, String, Vec<u8>)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let seen_tx = seen_tx.clone();
            tokio::spawn(async move {
                let Some(req) = read_request(&mut stream).await else {
                    return;
                };
                let _ = seen_tx.send((req.method.clone(), req.path.clone(), req.body.clone()));

                if req.method == "GET" && req.path.starts_with("/peerjs?") {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    return;
                }

                if let Some(index) = req.path.split("/id?i=").nth(1) {
                    let index: u64 = index.parse().unwrap();
                    match reply {
                        SegmentReply::Status(code) => {
                            let head = format!(
                                "HTTP/1.1 {} Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                                code
                            );
                            let _ = stream.write_all(head.as_bytes()).await;
                        }
                        SegmentReply::Stream {
                            slow_segment,
                            delay_ms,
                        } => {
                            if slow_segment == Some(index) {
                                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                            }
                            let body = format!(
                                "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\n{}\n{{\"type\":\"LEAVE\",\"src\":\"seg{}\"}}\n",
                                "x".repeat(16),
                                index
                            );
                            let _ = stream.write_all(body.as_bytes()).await;
                            let _ = stream.flush().await;
                            tokio::time::sleep(Duration::from_secs(30)).await;
                        }
                    }
                    return;
                }

                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                    .await;
            });
        }
    });

    (port, seen_rx)
}

// ============================================================================
// WebSocket path
// ============================================================================

#[tokio::test]
async fn test_websocket_queue_flush_and_delivery() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let uri = Arc::new(Mutex::new(String::new()));
    let (server_rx_tx, mut server_rx) = mpsc::unbounded_channel::<String>();

    let uri_clone = uri.clone();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            *uri_clone.lock() = req.uri().to_string();
            Ok(resp)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .unwrap();

        ws.send(WsMessage::Text(r#"{"type":"OPEN"}"#.into()))
            .await
            .unwrap();
        if let Some(Ok(WsMessage::Text(text))) = ws.next().await {
            server_rx_tx.send(text).unwrap();
        }
        ws.close(None).await.unwrap();
    });

    let relay = HttpRelay::new(local_config(port, false));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let link = relay.open_link(tx);

    // Sent before start: must be queued and flushed once the socket opens
    let mut early = SignalMessage::new(MessageType::Candidate);
    early.dst = Some("bob".into());
    link.send(early);
    link.start("alice", "tok");

    match next_event(&mut rx).await {
        SignalEvent::Message(msg) => assert_eq!(msg.kind, MessageType::Open),
        other => panic!("expected OPEN, got {:?}", other),
    }

    let received = timeout(Duration::from_secs(5), server_rx.recv())
        .await
        .expect("queued message never flushed")
        .unwrap();
    let received: SignalMessage = serde_json::from_str(&received).unwrap();
    assert_eq!(received.kind, MessageType::Candidate);
    assert_eq!(received.dst.as_deref(), Some("bob"));

    assert_eq!(next_event(&mut rx).await, SignalEvent::Disconnected);
    assert_eq!(*uri.lock(), "/peerjs?key=peerjs&id=alice&token=tok");
}

#[tokio::test]
async fn test_malformed_socket_message_is_dropped() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.send(WsMessage::Text("{not json".into())).await.unwrap();
        ws.send(WsMessage::Text(r#"{"type":"EXPIRE","src":"carol"}"#.into()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let relay = HttpRelay::new(local_config(port, false));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let link = relay.open_link(tx);
    link.start("alice", "tok");

    match next_event(&mut rx).await {
        SignalEvent::Message(msg) => {
            assert_eq!(msg.kind, MessageType::Expire);
            assert_eq!(msg.src.as_deref(), Some("carol"));
        }
        other => panic!("expected EXPIRE, got {:?}", other),
    }
    link.close();
}

#[tokio::test]
async fn test_close_is_idempotent_and_silent() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.send(WsMessage::Text(r#"{"type":"OPEN"}"#.into()))
            .await
            .unwrap();
        while ws.next().await.is_some() {}
    });

    let relay = HttpRelay::new(local_config(port, false));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let link = relay.open_link(tx);
    link.start("alice", "tok");
    assert!(matches!(next_event(&mut rx).await, SignalEvent::Message(_)));

    link.close();
    link.close();
    link.send(SignalMessage::new(MessageType::Leave));

    let extra = timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(extra.is_err(), "closing on purpose must not raise events");
}

// ============================================================================
// Fallback stream
// ============================================================================

#[tokio::test]
async fn test_stale_segment_is_discarded() {
    let (port, _seen) = start_http_relay(SegmentReply::Stream {
        slow_segment: Some(0),
        delay_ms: 400,
    })
    .await;

    let relay = HttpRelay::new(local_config(port, true));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let link = relay.open_link(tx);
    link.start("alice", "tok");

    let mut sources = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_millis(900);
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        match event {
            SignalEvent::Message(msg) => sources.push(msg.src.unwrap_or_default()),
            other => panic!("unexpected event {:?}", other),
        }
    }
    link.close();

    assert!(sources.contains(&"seg1".to_string()), "got {:?}", sources);
    assert!(!sources.contains(&"seg0".to_string()), "stale segment delivered");

    let mut deduped = sources.clone();
    deduped.sort();
    deduped.dedup();
    assert_eq!(deduped.len(), sources.len(), "double delivery: {:?}", sources);
}

#[tokio::test]
async fn test_stream_rejected_disconnects() {
    let (port, _seen) = start_http_relay(SegmentReply::Status(500)).await;

    let relay = HttpRelay::new(local_config(port, true));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let link = relay.open_link(tx);
    link.start("alice", "tok");

    assert_eq!(next_event(&mut rx).await, SignalEvent::Disconnected);
}

#[tokio::test]
async fn test_http_send_path_while_socket_closed() {
    let (port, mut seen) = start_http_relay(SegmentReply::Stream {
        slow_segment: None,
        delay_ms: 0,
    })
    .await;

    let relay = HttpRelay::new(local_config(port, true));
    let (tx, _rx) = mpsc::unbounded_channel();
    let link = relay.open_link(tx);
    link.start("alice", "tok");

    let mut offer = SignalMessage::new(MessageType::Offer);
    offer.dst = Some("bob".into());
    link.send(offer);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let (method, path, body) = tokio::time::timeout_at(deadline, seen.recv())
            .await
            .expect("offer was never posted")
            .unwrap();
        if method == "POST" && path == "/peerjs/alice/tok/offer" {
            let msg: SignalMessage = serde_json::from_slice(&body).unwrap();
            assert_eq!(msg.kind, MessageType::Offer);
            assert_eq!(msg.dst.as_deref(), Some("bob"));
            break;
        }
    }
    link.close();
}
