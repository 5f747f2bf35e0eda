//! WebSocket transport implementation.
//!
//! This module provides a client WebSocket transport using tokio-tungstenite.
//! Each `open` spawns one connection task; the transport talks to it over a
//! command channel and the task reports back through the [`EventSink`].

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use sockio_protocol::WireFrame;
use std::borrow::Cow;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest,
    handshake::client::Request,
    http::{HeaderName, HeaderValue},
    protocol::{frame::coding::CloseCode, CloseFrame},
    Error as WsError, Message,
};
use tracing::{debug, info, warn};

use crate::traits::{
    ConnectionId, EventSink, Headers, Transport, TransportError, TransportEvent, TransportState,
};

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
    /// Time allowed for the TCP/TLS/upgrade handshake.
    pub connect_timeout: Duration,
    /// Time allowed for the peer to answer our close frame. The stream is
    /// dropped when it runs out.
    pub close_timeout: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: 16 * 1024 * 1024, // 16 MiB
            connect_timeout: Duration::from_secs(20),
            close_timeout: Duration::from_secs(5),
        }
    }
}

enum Outbound {
    Frame(WireFrame),
    Close(String),
}

struct ActiveConnection {
    id: ConnectionId,
    commands: mpsc::UnboundedSender<Outbound>,
    state: Arc<AtomicU8>,
}

impl ActiveConnection {
    fn state(&self) -> TransportState {
        TransportState::from(self.state.load(Ordering::SeqCst))
    }
}

/// WebSocket transport.
pub struct WebSocketTransport {
    config: WebSocketConfig,
    sink: Option<EventSink>,
    active: Option<ActiveConnection>,
}

impl WebSocketTransport {
    /// Create a new WebSocket transport.
    #[must_use]
    pub fn new(config: WebSocketConfig) -> Self {
        Self {
            config,
            sink: None,
            active: None,
        }
    }

    fn live(&self) -> Option<&ActiveConnection> {
        self.active
            .as_ref()
            .filter(|conn| conn.state() != TransportState::Closed)
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(WebSocketConfig::default())
    }
}

fn build_request(url: &str, headers: &Headers) -> Result<Request, TransportError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| TransportError::InvalidUrl(format!("{url}: {e}")))?;

    for (name, value) in headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| TransportError::InvalidHeader(format!("name: {name}")))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|_| TransportError::InvalidHeader(format!("value for {name}")))?;
        request.headers_mut().insert(header_name, header_value);
    }

    Ok(request)
}

impl Transport for WebSocketTransport {
    fn set_event_sink(&mut self, sink: EventSink) {
        self.sink = Some(sink);
    }

    fn open(&mut self, url: &str, headers: &Headers) -> Result<ConnectionId, TransportError> {
        if let Some(conn) = self.live() {
            debug!(connection = %conn.id, "Already opened, skip open");
            return Err(TransportError::AlreadyOpen);
        }
        let sink = self.sink.clone().ok_or(TransportError::NoEventSink)?;
        let request = build_request(url, headers)?;

        let id = ConnectionId::next();
        let state = Arc::new(AtomicU8::new(TransportState::Opening as u8));
        let (commands, rx) = mpsc::unbounded_channel();

        info!(connection = %id, url = %url, "Opening WebSocket");
        tokio::spawn(run_connection(
            id,
            request,
            rx,
            sink,
            Arc::clone(&state),
            self.config.clone(),
        ));

        self.active = Some(ActiveConnection {
            id,
            commands,
            state,
        });
        Ok(id)
    }

    fn close(&mut self, reason: &str) -> Result<(), TransportError> {
        let conn = self.live().ok_or(TransportError::NotConnected)?;
        debug!(connection = %conn.id, reason = %reason, "Closing WebSocket");
        conn.commands
            .send(Outbound::Close(reason.to_string()))
            .map_err(|_| TransportError::NotConnected)
    }

    fn write(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        let conn = self
            .active
            .as_ref()
            .filter(|conn| conn.state() == TransportState::Open)
            .ok_or(TransportError::ConnectionClosed)?;
        conn.commands
            .send(Outbound::Frame(frame))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn state(&self) -> TransportState {
        self.active
            .as_ref()
            .map_or(TransportState::Closed, ActiveConnection::state)
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

fn finish(id: ConnectionId, sink: &EventSink, state: &AtomicU8, normal: bool) {
    state.store(TransportState::Closed as u8, Ordering::SeqCst);
    debug!(connection = %id, normal, "WebSocket closed");
    sink.emit(id, TransportEvent::Closed { normal });
}

async fn run_connection(
    id: ConnectionId,
    request: Request,
    mut commands: mpsc::UnboundedReceiver<Outbound>,
    sink: EventSink,
    state: Arc<AtomicU8>,
    config: WebSocketConfig,
) {
    let connect = tokio::time::timeout(
        config.connect_timeout,
        tokio_tungstenite::connect_async(request),
    );

    let stream = match connect.await {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(WsError::Http(response))) => {
            let headers = response
                .headers()
                .iter()
                .map(|(k, v)| {
                    (
                        k.as_str().to_string(),
                        v.to_str().unwrap_or_default().to_string(),
                    )
                })
                .collect();
            warn!(connection = %id, status = response.status().as_u16(), "Upgrade rejected");
            sink.emit(
                id,
                TransportEvent::HttpResponse {
                    status: response.status().as_u16(),
                    headers,
                },
            );
            finish(id, &sink, &state, false);
            return;
        }
        Ok(Err(e)) => {
            warn!(connection = %id, error = %e, "WebSocket connect failed");
            finish(id, &sink, &state, false);
            return;
        }
        Err(_) => {
            warn!(connection = %id, "WebSocket connect timed out");
            finish(id, &sink, &state, false);
            return;
        }
    };

    state.store(TransportState::Open as u8, Ordering::SeqCst);
    sink.emit(id, TransportEvent::Opened);

    let (mut write, mut read) = stream.split();
    let mut closing = false;
    let close_deadline = tokio::time::sleep(config.close_timeout);
    tokio::pin!(close_deadline);

    let normal = loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Outbound::Frame(frame)) => {
                    let message = match frame {
                        WireFrame::Text(text) => Message::Text(text),
                        WireFrame::Binary(data) => Message::Binary(data.to_vec()),
                    };
                    if let Err(e) = write.send(message).await {
                        warn!(connection = %id, error = %e, "Send failed");
                        break closing;
                    }
                }
                Some(Outbound::Close(reason)) => {
                    if closing {
                        continue;
                    }
                    closing = true;
                    close_deadline
                        .as_mut()
                        .reset(tokio::time::Instant::now() + config.close_timeout);
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: Cow::Owned(reason),
                    };
                    if let Err(e) = write.send(Message::Close(Some(frame))).await {
                        debug!(connection = %id, error = %e, "Close frame not sent");
                        break true;
                    }
                }
                None => {
                    // Transport dropped.
                    if let Err(e) = write.send(Message::Close(None)).await {
                        debug!(connection = %id, error = %e, "Close frame not sent");
                    }
                    break true;
                }
            },
            () = &mut close_deadline, if closing => {
                warn!(
                    connection = %id,
                    timeout_ms = config.close_timeout.as_millis() as u64,
                    "Peer did not answer the close frame, dropping the stream"
                );
                break true;
            }
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if text.len() > config.max_message_size {
                        warn!(connection = %id, size = text.len(), "Message too large, dropped");
                        continue;
                    }
                    sink.emit(id, TransportEvent::Message(WireFrame::Text(text)));
                }
                Some(Ok(Message::Binary(data))) => {
                    if data.len() > config.max_message_size {
                        warn!(connection = %id, size = data.len(), "Message too large, dropped");
                        continue;
                    }
                    sink.emit(id, TransportEvent::Message(WireFrame::Binary(Bytes::from(data))));
                }
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.as_ref().map(|f| f.code);
                    debug!(connection = %id, code = ?code, "Received close frame");
                    break closing || code.map_or(true, |c| c == CloseCode::Normal);
                }
                Some(Ok(_)) => {
                    // Ping/pong control frames are answered by tungstenite.
                }
                Some(Err(WsError::ConnectionClosed)) => break true,
                Some(Err(e)) => {
                    // A locally initiated close can end with a short read.
                    if !closing {
                        warn!(connection = %id, error = %e, "WebSocket error");
                    }
                    break closing;
                }
                None => break closing,
            },
        }
    };

    finish(id, &sink, &state, normal);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_config_default() {
        let config = WebSocketConfig::default();
        assert_eq!(config.max_message_size, 16 * 1024 * 1024);
        assert_eq!(config.connect_timeout, Duration::from_secs(20));
        assert_eq!(config.close_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_build_request_with_headers() {
        let mut headers = Headers::new();
        headers.insert("Authorization".into(), "Bearer t".into());
        let request = build_request("ws://127.0.0.1:3000/socket.io/?EIO=4", &headers).unwrap();
        assert_eq!(request.headers()["authorization"], "Bearer t");
    }

    #[test]
    fn test_build_request_rejects_bad_input() {
        assert!(matches!(
            build_request("not a url", &Headers::new()),
            Err(TransportError::InvalidUrl(_))
        ));
        let mut headers = Headers::new();
        headers.insert("bad header".into(), "v".into());
        assert!(matches!(
            build_request("ws://localhost/", &headers),
            Err(TransportError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_open_requires_sink() {
        let mut transport = WebSocketTransport::default();
        assert!(matches!(
            transport.open("ws://localhost/", &Headers::new()),
            Err(TransportError::NoEventSink)
        ));
        assert_eq!(transport.state(), TransportState::Closed);
        assert!(matches!(
            transport.close("bye"),
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_host_reports_abnormal_close() {
        let (sink, mut rx) = EventSink::channel();
        let mut transport = WebSocketTransport::new(WebSocketConfig {
            connect_timeout: Duration::from_secs(5),
            ..Default::default()
        });
        transport.set_event_sink(sink);

        let id = transport
            .open("ws://127.0.0.1:1/socket.io/", &Headers::new())
            .unwrap();
        let (event_id, event) = rx.recv().await.unwrap();
        assert_eq!(event_id, id);
        assert_eq!(event, TransportEvent::Closed { normal: false });
        assert_eq!(transport.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn test_close_completes_against_silent_peer() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            // Hold the connection without ever reading from it.
            std::future::pending::<()>().await;
        });

        let (sink, mut rx) = EventSink::channel();
        let mut transport = WebSocketTransport::new(WebSocketConfig {
            close_timeout: Duration::from_millis(200),
            ..Default::default()
        });
        transport.set_event_sink(sink);

        let id = transport
            .open(&format!("ws://{addr}/socket.io/"), &Headers::new())
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), (id, TransportEvent::Opened));

        transport.close("Pong timeout").unwrap();
        let closed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("close never completed")
            .unwrap();
        assert_eq!(closed, (id, TransportEvent::Closed { normal: true }));
        assert_eq!(transport.state(), TransportState::Closed);

        server.abort();
    }
}
