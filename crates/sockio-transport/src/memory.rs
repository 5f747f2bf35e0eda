//! In-process transport.
//!
//! [`MemoryTransport`] implements [`Transport`] without any I/O. The paired
//! [`MemoryPeer`] plays the remote side: it accepts or refuses connection
//! attempts, injects inbound frames and inspects what the client wrote.

use sockio_protocol::WireFrame;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::traits::{
    ConnectionId, EventSink, Headers, Transport, TransportError, TransportEvent, TransportState,
};

#[derive(Debug, Default)]
struct Shared {
    sink: Option<EventSink>,
    current: Option<ConnectionId>,
    state: TransportState,
    opens: Vec<(String, Headers)>,
    written: Vec<WireFrame>,
    closes: Vec<String>,
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        if let (Some(sink), Some(id)) = (&self.sink, self.current) {
            sink.emit(id, event);
        }
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Client half of an in-memory connection.
#[derive(Debug)]
pub struct MemoryTransport {
    shared: Arc<Mutex<Shared>>,
}

/// Remote half of an in-memory connection.
#[derive(Debug, Clone)]
pub struct MemoryPeer {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryTransport {
    /// Create a transport and the peer that controls it.
    #[must_use]
    pub fn pair() -> (MemoryTransport, MemoryPeer) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        (
            MemoryTransport {
                shared: Arc::clone(&shared),
            },
            MemoryPeer { shared },
        )
    }
}

impl Transport for MemoryTransport {
    fn set_event_sink(&mut self, sink: EventSink) {
        lock(&self.shared).sink = Some(sink);
    }

    fn open(&mut self, url: &str, headers: &Headers) -> Result<ConnectionId, TransportError> {
        let mut shared = lock(&self.shared);
        if shared.state != TransportState::Closed {
            return Err(TransportError::AlreadyOpen);
        }
        if shared.sink.is_none() {
            return Err(TransportError::NoEventSink);
        }
        let id = ConnectionId::next();
        shared.current = Some(id);
        shared.state = TransportState::Opening;
        shared.opens.push((url.to_string(), headers.clone()));
        Ok(id)
    }

    fn close(&mut self, reason: &str) -> Result<(), TransportError> {
        let mut shared = lock(&self.shared);
        if shared.state == TransportState::Closed {
            return Err(TransportError::NotConnected);
        }
        shared.closes.push(reason.to_string());
        shared.state = TransportState::Closed;
        shared.emit(TransportEvent::Closed { normal: true });
        Ok(())
    }

    fn write(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        let mut shared = lock(&self.shared);
        if shared.state != TransportState::Open {
            return Err(TransportError::ConnectionClosed);
        }
        shared.written.push(frame);
        Ok(())
    }

    fn state(&self) -> TransportState {
        lock(&self.shared).state
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

impl MemoryPeer {
    /// Complete the pending connection attempt.
    pub fn accept(&self) {
        let mut shared = lock(&self.shared);
        if shared.state == TransportState::Opening {
            shared.state = TransportState::Open;
            shared.emit(TransportEvent::Opened);
        }
    }

    /// Fail the pending connection attempt.
    pub fn refuse(&self) {
        self.drop_connection();
    }

    /// Send a frame to the client.
    pub fn send(&self, frame: impl Into<WireFrame>) {
        let shared = lock(&self.shared);
        if shared.state == TransportState::Open {
            shared.emit(TransportEvent::Message(frame.into()));
        }
    }

    /// Answer the upgrade request with a plain HTTP response.
    pub fn respond_http(&self, status: u16, headers: Headers) {
        lock(&self.shared).emit(TransportEvent::HttpResponse { status, headers });
    }

    /// End the connection without a close handshake.
    pub fn drop_connection(&self) {
        self.end(false);
    }

    /// End the connection with a clean close handshake.
    pub fn close(&self) {
        self.end(true);
    }

    fn end(&self, normal: bool) {
        let mut shared = lock(&self.shared);
        if shared.state != TransportState::Closed {
            shared.state = TransportState::Closed;
            shared.emit(TransportEvent::Closed { normal });
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> TransportState {
        lock(&self.shared).state
    }

    /// URLs of every connection attempt so far.
    #[must_use]
    pub fn opened_urls(&self) -> Vec<String> {
        lock(&self.shared)
            .opens
            .iter()
            .map(|(url, _)| url.clone())
            .collect()
    }

    /// Headers of the latest connection attempt.
    #[must_use]
    pub fn last_headers(&self) -> Option<Headers> {
        lock(&self.shared).opens.last().map(|(_, h)| h.clone())
    }

    /// Reasons passed to every client-initiated close.
    #[must_use]
    pub fn close_reasons(&self) -> Vec<String> {
        lock(&self.shared).closes.clone()
    }

    /// Drain the frames written by the client.
    #[must_use]
    pub fn take_written(&self) -> Vec<WireFrame> {
        std::mem::take(&mut lock(&self.shared).written)
    }

    /// Drain the text frames written by the client.
    #[must_use]
    pub fn take_text(&self) -> Vec<String> {
        self.take_written()
            .into_iter()
            .filter_map(|frame| match frame {
                WireFrame::Text(text) => Some(text),
                WireFrame::Binary(_) => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected() -> (
        MemoryTransport,
        MemoryPeer,
        tokio::sync::mpsc::UnboundedReceiver<(ConnectionId, TransportEvent)>,
    ) {
        let (mut transport, peer) = MemoryTransport::pair();
        let (sink, rx) = EventSink::channel();
        transport.set_event_sink(sink);
        (transport, peer, rx)
    }

    #[tokio::test]
    async fn test_open_accept_write() {
        let (mut transport, peer, mut rx) = connected();
        let id = transport.open("ws://x/", &Headers::new()).unwrap();
        assert_eq!(transport.state(), TransportState::Opening);
        assert!(transport.write(WireFrame::from("2")).is_err());

        peer.accept();
        assert_eq!(rx.recv().await, Some((id, TransportEvent::Opened)));

        transport.write(WireFrame::from("3")).unwrap();
        assert_eq!(peer.take_text(), vec!["3".to_string()]);
        assert_eq!(peer.opened_urls(), vec!["ws://x/".to_string()]);
    }

    #[tokio::test]
    async fn test_second_open_is_rejected() {
        let (mut transport, _peer, _rx) = connected();
        transport.open("ws://x/", &Headers::new()).unwrap();
        assert!(matches!(
            transport.open("ws://x/", &Headers::new()),
            Err(TransportError::AlreadyOpen)
        ));
    }

    #[tokio::test]
    async fn test_close_emits_normal_close() {
        let (mut transport, peer, mut rx) = connected();
        let id = transport.open("ws://x/", &Headers::new()).unwrap();
        peer.accept();
        let _ = rx.recv().await;

        transport.close("End by user").unwrap();
        assert_eq!(
            rx.recv().await,
            Some((id, TransportEvent::Closed { normal: true }))
        );
        assert_eq!(peer.close_reasons(), vec!["End by user".to_string()]);
        assert!(matches!(
            transport.close("again"),
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_peer_drop_is_abnormal() {
        let (mut transport, peer, mut rx) = connected();
        let id = transport.open("ws://x/", &Headers::new()).unwrap();
        peer.refuse();
        assert_eq!(
            rx.recv().await,
            Some((id, TransportEvent::Closed { normal: false }))
        );
        assert_eq!(transport.state(), TransportState::Closed);
    }
}
