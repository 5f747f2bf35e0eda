//! # sockio-transport
//!
//! Transport abstraction layer for the sockio client.
//!
//! This crate provides a unified interface for the frame streams the client
//! runs over:
//!
//! - **WebSocket** - tokio-tungstenite, with rustls for `wss://`
//! - **Memory** - an in-process pair for tests and embedding
//!
//! ## Transport Abstraction
//!
//! All transports implement the [`Transport`] trait. Commands return at once;
//! what happens on the wire is reported through an [`EventSink`].
//!
//! ```rust
//! use sockio_transport::{EventSink, Headers, MemoryTransport, Transport, TransportEvent};
//!
//! let (mut transport, peer) = MemoryTransport::pair();
//! let (sink, mut events) = EventSink::channel();
//! transport.set_event_sink(sink);
//!
//! let id = transport.open("ws://localhost/socket.io/", &Headers::new()).unwrap();
//! peer.accept();
//! assert_eq!(events.try_recv().unwrap(), (id, TransportEvent::Opened));
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use memory::{MemoryPeer, MemoryTransport};
pub use traits::{
    ConnectionId, EventSink, Headers, Transport, TransportError, TransportEvent, TransportState,
};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketTransport};
