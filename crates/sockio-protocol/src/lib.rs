//! # sockio-protocol
//!
//! Wire protocol definitions for the sockio realtime client.
//!
//! The protocol has two layers sharing one text/binary frame stream:
//!
//! - **Engine frames** - `open`, `close`, `ping`, `pong`, `message`
//! - **Socket packets** - `connect`, `disconnect`, `event`, `ack`,
//!   `connect_error` and their binary variants, addressed to a namespace
//!
//! ## Example
//!
//! ```rust
//! use sockio_protocol::{codec, Packet, PacketCodec, Revision, Value};
//!
//! let packet = Packet::event("/chat", "message", vec![Value::from("hi")]);
//!
//! let frames = codec::encode(&packet, Revision::V4).unwrap();
//! let mut decoder = PacketCodec::new(Revision::V4);
//! let decoded = frames
//!     .into_iter()
//!     .find_map(|frame| decoder.feed(frame).unwrap())
//!     .unwrap();
//! assert_eq!(decoded, packet);
//! ```

pub mod codec;
pub mod packet;
pub mod value;
pub mod version;

pub use codec::{encode, PacketCodec, ProtocolError};
pub use packet::{FrameKind, Packet, PacketKind, WireFrame, DEFAULT_NAMESPACE};
pub use value::{Map, Value, ValueError, ValueKind};
pub use version::{Revision, PROTOCOL_REVISION};
