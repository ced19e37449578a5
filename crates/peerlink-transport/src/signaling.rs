//! Signaling transport
//!
//! Keeps one logical channel to the relay. A WebSocket is the preferred
//! path; a long-poll HTTP stream runs alongside it until the socket has been
//! open for a grace period. The stream is re-opened periodically in indexed
//! segments, and anything read from a segment that has been superseded is
//! discarded.

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use peerlink_core::{LineDecoder, SignalMessage};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{debug, error, info, warn};

use crate::http::HttpApi;
use crate::relay::{SignalEvent, SignalLink};

#[derive(Default)]
struct State {
    id: Option<String>,
    token: Option<String>,
    disconnected: bool,
    /// Messages sent before `start`
    queue: Vec<SignalMessage>,
    ws_tx: Option<mpsc::UnboundedSender<WsMessage>>,
    ws_open: bool,
    ws_task: Option<AbortHandle>,
    post_tx: Option<mpsc::UnboundedSender<SignalMessage>>,
    stream_active: bool,
    /// Index of the most recently started segment
    segment: u64,
    /// Highest segment whose response has started
    live_segment: u64,
    stream_tasks: Vec<AbortHandle>,
}

struct Inner {
    api: HttpApi,
    events: mpsc::UnboundedSender<SignalEvent>,
    state: Mutex<State>,
}

/// WebSocket + HTTP-stream link to the relay
pub struct SignalingSocket {
    inner: Arc<Inner>,
}

impl SignalingSocket {
    pub fn new(api: HttpApi, events: mpsc::UnboundedSender<SignalEvent>) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                events,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Whether the WebSocket is currently open
    pub fn is_socket_open(&self) -> bool {
        self.inner.state.lock().ws_open
    }

    /// Index of the current fallback stream segment
    pub fn current_segment(&self) -> u64 {
        self.inner.state.lock().segment
    }
}

impl SignalLink for SignalingSocket {
    fn start(&self, id: &str, token: &str) {
        let inner = &self.inner;
        let config = inner.api.config();

        let ws_url = match config.websocket_url(id, token) {
            Ok(url) => url,
            Err(e) => {
                let _ = inner.events.send(SignalEvent::Error(e.to_string()));
                return;
            }
        };

        {
            let mut state = inner.state.lock();
            if state.disconnected || state.id.is_some() {
                return;
            }
            state.id = Some(id.to_string());
            state.token = Some(token.to_string());

            let (post_tx, post_rx) = mpsc::unbounded_channel();
            state.post_tx = Some(post_tx);
            tokio::spawn(run_poster(inner.clone(), post_rx, id.to_string(), token.to_string()));
        }

        if config.fallback {
            inner.state.lock().stream_active = true;
            Inner::start_segment(inner, 0);
        }

        let task = tokio::spawn(run_websocket(inner.clone(), ws_url.to_string()));
        inner.state.lock().ws_task = Some(task.abort_handle());
    }

    fn send(&self, message: SignalMessage) {
        self.inner.send(message);
    }

    fn close(&self) {
        let mut state = self.inner.state.lock();
        if state.disconnected {
            return;
        }
        state.disconnected = true;
        state.stream_active = false;
        state.ws_open = false;

        if let Some(tx) = state.ws_tx.take() {
            let _ = tx.send(WsMessage::Close(None));
        }
        state.post_tx = None;
        for task in state.stream_tasks.drain(..) {
            task.abort();
        }
        if let Some(task) = state.ws_task.take() {
            // the writer task owns the sink and finishes the close handshake
            task.abort();
        }
        info!("signaling link closed");
    }
}

impl Drop for SignalingSocket {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    fn emit(&self, event: SignalEvent) {
        let _ = self.events.send(event);
    }

    fn send(&self, message: SignalMessage) {
        let mut state = self.state.lock();
        if state.disconnected {
            debug!(kind = %message.kind, "signaling closed, dropping message");
            return;
        }
        if state.id.is_none() {
            state.queue.push(message);
            return;
        }

        if let (true, Some(tx)) = (state.ws_open, &state.ws_tx) {
            match serde_json::to_string(&message) {
                Ok(text) => {
                    let _ = tx.send(WsMessage::Text(text));
                }
                Err(e) => error!("failed to encode signaling message: {}", e),
            }
            return;
        }
        if let Some(tx) = &state.post_tx {
            let _ = tx.send(message);
        }
    }

    /// Mark the link lost and report it, unless it was closed on purpose
    fn lose_link(&self) {
        {
            let mut state = self.state.lock();
            if state.disconnected {
                return;
            }
            state.disconnected = true;
            state.ws_open = false;
            state.stream_active = false;
            for task in state.stream_tasks.drain(..) {
                task.abort();
            }
        }
        self.emit(SignalEvent::Disconnected);
    }

    fn deliver(&self, text: &str) {
        match serde_json::from_str::<SignalMessage>(text) {
            Ok(message) => self.emit(SignalEvent::Message(message)),
            Err(e) => warn!("invalid relay message {:?}: {}", text, e),
        }
    }

    fn start_segment(self: &Arc<Self>, index: u64) {
        let url = {
            let state = self.state.lock();
            match (&state.id, &state.token) {
                (Some(id), Some(token)) => self.api.config().session_base(id, token),
                _ => return,
            }
        };
        let url = match url {
            Ok(base) => format!("{}/id?i={}", base, index),
            Err(e) => {
                self.emit(SignalEvent::Error(e.to_string()));
                return;
            }
        };

        self.state.lock().segment = index;
        let segment = tokio::spawn(run_segment(self.clone(), index, url));
        let rotation = tokio::spawn(rotate_after_timeout(self.clone(), index));

        let mut state = self.state.lock();
        state.stream_tasks.retain(|t| !t.is_finished());
        state.stream_tasks.push(segment.abort_handle());
        state.stream_tasks.push(rotation.abort_handle());
        debug!(segment = index, "started stream segment");
    }

    fn is_current_segment(&self, index: u64) -> bool {
        let state = self.state.lock();
        state.stream_active && !state.disconnected && state.segment == index
    }

    fn is_superseded(&self, index: u64) -> bool {
        let state = self.state.lock();
        !state.stream_active || state.disconnected || index < state.live_segment
    }

    /// Stop the fallback stream entirely
    fn stop_stream(&self) {
        let mut state = self.state.lock();
        if !state.stream_active {
            return;
        }
        state.stream_active = false;
        for task in state.stream_tasks.drain(..) {
            task.abort();
        }
        debug!("fallback stream stopped");
    }

    fn on_socket_open(self: &Arc<Self>, ws_tx: mpsc::UnboundedSender<WsMessage>) {
        let (queued, fallback_running) = {
            let mut state = self.state.lock();
            if state.disconnected {
                return;
            }
            state.ws_open = true;
            state.ws_tx = Some(ws_tx);
            (std::mem::take(&mut state.queue), state.stream_active)
        };
        info!("signaling socket open");

        if fallback_running {
            let inner = self.clone();
            let grace = self.api.config().fallback_grace;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                inner.stop_stream();
            });
        }

        for message in queued {
            self.send(message);
        }
    }
}

async fn rotate_after_timeout(inner: Arc<Inner>, index: u64) {
    tokio::time::sleep(inner.api.config().stream_timeout).await;

    if !inner.is_current_segment(index) {
        return;
    }
    let ws_open = inner.state.lock().ws_open;
    if ws_open {
        inner.stop_stream();
    } else {
        Inner::start_segment(&inner, index + 1);
    }
}

async fn run_segment(inner: Arc<Inner>, index: u64, url: String) {
    let response = match inner.api.client().post(&url).send().await {
        Ok(r) => r,
        Err(e) => {
            warn!(segment = index, "stream request failed: {}", e);
            if inner.is_current_segment(index) {
                inner.lose_link();
            }
            return;
        }
    };

    if !response.status().is_success() {
        warn!(segment = index, status = response.status().as_u16(), "stream rejected");
        if inner.is_current_segment(index) {
            inner.lose_link();
        }
        return;
    }

    {
        let mut state = inner.state.lock();
        state.live_segment = state.live_segment.max(index);
    }

    let mut decoder = LineDecoder::new();
    let mut preamble = true;
    let mut body = response.bytes_stream();

    while let Some(chunk) = body.next().await {
        if inner.is_superseded(index) {
            debug!(segment = index, "discarding stale stream segment");
            return;
        }
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                debug!(segment = index, "stream read ended: {}", e);
                return;
            }
        };
        decoder.feed(&chunk);
        for line in decoder.lines() {
            if preamble {
                preamble = false;
                continue;
            }
            inner.deliver(&line);
        }
    }
    if decoder.pending() > 0 {
        debug!(segment = index, bytes = decoder.pending(), "segment ended mid-message");
    }
}

async fn run_poster(
    inner: Arc<Inner>,
    mut rx: mpsc::UnboundedReceiver<SignalMessage>,
    id: String,
    token: String,
) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = inner.api.post_message(&id, &token, &message).await {
            warn!(kind = %message.kind, "failed to post signaling message: {}", e);
        }
    }
}

async fn run_websocket(inner: Arc<Inner>, url: String) {
    info!("connecting to relay socket: {}", url);

    let ws_stream = match connect_async(url.as_str()).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            warn!("relay socket failed: {}", e);
            inner.lose_link();
            return;
        }
    };

    let (mut write, mut read) = ws_stream.split();
    let (ws_tx, mut ws_rx) = mpsc::unbounded_channel::<WsMessage>();

    tokio::spawn(async move {
        while let Some(msg) = ws_rx.recv().await {
            let closing = matches!(msg, WsMessage::Close(_));
            if let Err(e) = write.send(msg).await {
                debug!("relay socket write error: {}", e);
                break;
            }
            if closing {
                break;
            }
        }
    });

    inner.on_socket_open(ws_tx);

    while let Some(result) = read.next().await {
        match result {
            Ok(WsMessage::Text(text)) => inner.deliver(&text),
            Ok(WsMessage::Binary(data)) => inner.deliver(&String::from_utf8_lossy(&data)),
            Ok(WsMessage::Close(frame)) => {
                debug!("relay socket close frame: {:?}", frame);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!("relay socket read error: {}", e);
                break;
            }
        }
    }

    info!("relay socket closed");
    inner.lose_link();
}
