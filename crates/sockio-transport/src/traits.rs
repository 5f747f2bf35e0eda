//! Transport abstraction traits for sockio.
//!
//! A transport owns one full-duplex frame stream at a time. Commands
//! (`open`, `close`, `write`) return immediately; everything the transport
//! observes is reported asynchronously through an [`EventSink`], tagged with
//! the [`ConnectionId`] it concerns so stale events from a superseded
//! connection can be told apart.

use sockio_protocol::WireFrame;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;

/// Extra HTTP headers sent with the upgrade request.
pub type Headers = BTreeMap<String, String>;

/// Counter backing [`ConnectionId::next`].
static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identifier of one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Allocate a process-unique connection id.
    #[must_use]
    pub fn next() -> Self {
        Self(CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{}", self.0)
    }
}

/// Connection state as seen by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum TransportState {
    #[default]
    Closed = 0,
    Opening = 1,
    Open = 2,
}

impl From<u8> for TransportState {
    fn from(value: u8) -> Self {
        match value {
            1 => TransportState::Opening,
            2 => TransportState::Open,
            _ => TransportState::Closed,
        }
    }
}

/// Something the transport observed.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The stream is established.
    Opened,
    /// The stream ended. `normal` is set for a clean close handshake.
    Closed { normal: bool },
    /// A frame arrived.
    Message(WireFrame),
    /// The server answered the upgrade request with a plain HTTP response.
    HttpResponse { status: u16, headers: Headers },
}

/// Delivery channel for transport events.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<(ConnectionId, TransportEvent)>,
}

impl EventSink {
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<(ConnectionId, TransportEvent)>) -> Self {
        Self { tx }
    }

    /// Create a sink and the receiver its events arrive on.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<(ConnectionId, TransportEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Deliver an event. Returns `false` if the receiver is gone.
    pub fn emit(&self, id: ConnectionId, event: TransportEvent) -> bool {
        self.tx.send((id, event)).is_ok()
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No connection is active.
    #[error("Not connected")]
    NotConnected,

    /// A connection is already active or being established.
    #[error("Connection already active")]
    AlreadyOpen,

    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The target URL could not be used.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// A header name or value was rejected.
    #[error("Invalid header {0}")]
    InvalidHeader(String),

    /// `open` was called before an event sink was installed.
    #[error("No event sink installed")]
    NoEventSink,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// A client-side transport.
///
/// Implementations must deliver events for a connection in the order they
/// were observed, and write frames in the order `write` was called.
pub trait Transport: Send {
    /// Install the sink that receives this transport's events.
    fn set_event_sink(&mut self, sink: EventSink);

    /// Start connecting to `url`. Completion is reported as
    /// [`TransportEvent::Opened`] or [`TransportEvent::Closed`].
    ///
    /// # Errors
    ///
    /// Returns an error if a connection is already active or the request
    /// cannot be built.
    fn open(&mut self, url: &str, headers: &Headers) -> Result<ConnectionId, TransportError>;

    /// Start closing the active connection.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConnected`] if nothing is active.
    fn close(&mut self, reason: &str) -> Result<(), TransportError>;

    /// Queue a frame for sending.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not open.
    fn write(&mut self, frame: WireFrame) -> Result<(), TransportError>;

    /// Current connection state.
    fn state(&self) -> TransportState;

    /// Get the transport name (e.g., "websocket", "memory").
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_are_unique() {
        let id1 = ConnectionId::next();
        let id2 = ConnectionId::next();
        assert_ne!(id1, id2);
        assert!(id1.to_string().starts_with("conn_"));
    }

    #[test]
    fn test_state_from_u8() {
        assert_eq!(TransportState::from(2), TransportState::Open);
        assert_eq!(TransportState::from(9), TransportState::Closed);
    }

    #[tokio::test]
    async fn test_event_sink_delivers_in_order() {
        let (sink, mut rx) = EventSink::channel();
        let id = ConnectionId::next();
        assert!(sink.emit(id, TransportEvent::Opened));
        assert!(sink.emit(id, TransportEvent::Closed { normal: true }));

        assert_eq!(rx.recv().await, Some((id, TransportEvent::Opened)));
        assert_eq!(
            rx.recv().await,
            Some((id, TransportEvent::Closed { normal: true }))
        );

        drop(rx);
        assert!(!sink.emit(id, TransportEvent::Opened));
    }
}
