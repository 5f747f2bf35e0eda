//! # sockio-core
//!
//! Connection engine and namespace multiplexer for the sockio client.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Engine** - Session state machine: handshake, heartbeat, reconnection
//! - **Client** - The task that runs the engine over a transport
//! - **Socket** - Per-namespace listeners, acks, and emit queueing
//! - **Timer** - Keyed, cancellable timers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  Command   ┌─────────────┐  Input   ┌─────────────┐
//! │   Client    │───────────▶│   Driver    │─────────▶│   Engine    │
//! └─────────────┘            └─────────────┘◀─────────└─────────────┘
//!        │                     │        │     Effect
//!        ▼                     ▼        ▼
//! ┌─────────────┐      ┌───────────┐ ┌───────────┐
//! │   Socket    │◀─────│ Transport │ │ TimerSet  │
//! └─────────────┘      └───────────┘ └───────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use sockio_core::{Client, Query};
//! use sockio_protocol::Value;
//! use sockio_transport::{Headers, WebSocketTransport};
//!
//! # async fn run() -> Result<(), sockio_core::ClientError> {
//! let client = Client::spawn("http://localhost:3000", WebSocketTransport::default())?;
//! let chat = client.socket("/chat");
//! chat.on("message", |event| println!("{:?}", event.args()));
//! client.connect(Query::new(), Headers::new());
//! chat.emit("message", vec![Value::from("hello")]);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod socket;
pub mod timer;

pub use client::{Client, ClientBuilder, Status};
pub use config::{ClientConfig, ConfigError};
pub use endpoint::{percent_encode, Endpoint, Query};
pub use engine::{ClientEvent, CloseReason, ConnectionState, Engine, ReconnectPolicy};
pub use error::ClientError;
pub use socket::{Event, Socket};
pub use timer::TimerSet;
