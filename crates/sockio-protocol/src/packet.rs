//! Packet types for the sockio protocol.
//!
//! A [`Packet`] is one protocol unit: a leading text frame plus any binary
//! attachments it references. Engine-level packets (`open`, `close`, `ping`,
//! `pong`) manage the connection; `message` packets carry a socket-level
//! [`PacketKind`] addressed to a namespace.

use bytes::Bytes;

use crate::value::Value;

/// The default namespace.
pub const DEFAULT_NAMESPACE: &str = "/";

/// Engine frame kind identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    Open = 0,
    Close = 1,
    Ping = 2,
    Pong = 3,
    Message = 4,
}

impl FrameKind {
    /// ASCII digit used on the wire.
    #[must_use]
    pub const fn digit(self) -> char {
        (b'0' + self as u8) as char
    }
}

impl From<FrameKind> for u8 {
    fn from(fk: FrameKind) -> u8 {
        fk as u8
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameKind::Open),
            1 => Ok(FrameKind::Close),
            2 => Ok(FrameKind::Ping),
            3 => Ok(FrameKind::Pong),
            4 => Ok(FrameKind::Message),
            _ => Err("Invalid frame kind"),
        }
    }
}

/// Socket-level packet kinds carried inside `message` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    Connect = 0,
    Disconnect = 1,
    Event = 2,
    Ack = 3,
    ConnectError = 4,
    BinaryEvent = 5,
    BinaryAck = 6,
}

impl PacketKind {
    /// ASCII digit used on the wire.
    #[must_use]
    pub const fn digit(self) -> char {
        (b'0' + self as u8) as char
    }

    /// Whether this kind carries binary attachments.
    #[must_use]
    pub const fn is_binary(self) -> bool {
        matches!(self, PacketKind::BinaryEvent | PacketKind::BinaryAck)
    }

    /// Whether this kind is an event (plain or binary).
    #[must_use]
    pub const fn is_event(self) -> bool {
        matches!(self, PacketKind::Event | PacketKind::BinaryEvent)
    }

    /// Whether this kind is an ack reply (plain or binary).
    #[must_use]
    pub const fn is_ack(self) -> bool {
        matches!(self, PacketKind::Ack | PacketKind::BinaryAck)
    }

    /// The binary-bearing counterpart of an event or ack kind.
    #[must_use]
    pub const fn with_binary(self, binary: bool) -> Self {
        match (self, binary) {
            (PacketKind::Event | PacketKind::BinaryEvent, true) => PacketKind::BinaryEvent,
            (PacketKind::Event | PacketKind::BinaryEvent, false) => PacketKind::Event,
            (PacketKind::Ack | PacketKind::BinaryAck, true) => PacketKind::BinaryAck,
            (PacketKind::Ack | PacketKind::BinaryAck, false) => PacketKind::Ack,
            (other, _) => other,
        }
    }
}

impl From<PacketKind> for u8 {
    fn from(pk: PacketKind) -> u8 {
        pk as u8
    }
}

impl TryFrom<u8> for PacketKind {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketKind::Connect),
            1 => Ok(PacketKind::Disconnect),
            2 => Ok(PacketKind::Event),
            3 => Ok(PacketKind::Ack),
            4 => Ok(PacketKind::ConnectError),
            5 => Ok(PacketKind::BinaryEvent),
            6 => Ok(PacketKind::BinaryAck),
            _ => Err("Invalid packet kind"),
        }
    }
}

/// One frame as written to or read from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Bytes),
}

impl WireFrame {
    #[must_use]
    pub fn is_binary(&self) -> bool {
        matches!(self, WireFrame::Binary(_))
    }

    /// Size of the frame in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            WireFrame::Text(text) => text.len(),
            WireFrame::Binary(data) => data.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&str> for WireFrame {
    fn from(s: &str) -> Self {
        WireFrame::Text(s.to_string())
    }
}

impl From<String> for WireFrame {
    fn from(s: String) -> Self {
        WireFrame::Text(s)
    }
}

impl From<Bytes> for WireFrame {
    fn from(b: Bytes) -> Self {
        WireFrame::Binary(b)
    }
}

/// A protocol packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Engine frame kind.
    pub frame: FrameKind,
    /// Socket packet kind. Only meaningful for `message` frames.
    pub kind: PacketKind,
    /// Target namespace.
    pub namespace: String,
    /// Ack id, for events expecting a reply and for the reply itself.
    pub id: Option<u64>,
    /// Payload values. For events, element 0 is the event name.
    pub payload: Vec<Value>,
}

impl Packet {
    fn engine(frame: FrameKind, payload: Vec<Value>) -> Self {
        Self {
            frame,
            kind: PacketKind::Event,
            namespace: DEFAULT_NAMESPACE.to_string(),
            id: None,
            payload,
        }
    }

    fn message(kind: PacketKind, namespace: impl Into<String>, payload: Vec<Value>) -> Self {
        Self {
            frame: FrameKind::Message,
            kind,
            namespace: namespace.into(),
            id: None,
            payload,
        }
    }

    /// Create an `open` (handshake) packet.
    #[must_use]
    pub fn open(handshake: Value) -> Self {
        Self::engine(FrameKind::Open, vec![handshake])
    }

    /// Create an engine `close` packet.
    #[must_use]
    pub fn close() -> Self {
        Self::engine(FrameKind::Close, Vec::new())
    }

    /// Create a `ping` packet.
    #[must_use]
    pub fn ping() -> Self {
        Self::engine(FrameKind::Ping, Vec::new())
    }

    /// Create a `pong` packet.
    #[must_use]
    pub fn pong() -> Self {
        Self::engine(FrameKind::Pong, Vec::new())
    }

    /// Create a namespace connect request, with an optional auth payload.
    #[must_use]
    pub fn connect(namespace: impl Into<String>, auth: Option<Value>) -> Self {
        Self::message(PacketKind::Connect, namespace, auth.into_iter().collect())
    }

    /// Create a namespace disconnect packet.
    #[must_use]
    pub fn disconnect(namespace: impl Into<String>) -> Self {
        Self::message(PacketKind::Disconnect, namespace, Vec::new())
    }

    /// Create a connect error packet.
    #[must_use]
    pub fn connect_error(namespace: impl Into<String>, data: Value) -> Self {
        Self::message(PacketKind::ConnectError, namespace, vec![data])
    }

    /// Create an event packet. Upgrades to a binary event if any argument
    /// holds binary data.
    #[must_use]
    pub fn event(namespace: impl Into<String>, name: impl Into<String>, args: Vec<Value>) -> Self {
        let mut payload = Vec::with_capacity(args.len() + 1);
        payload.push(Value::String(name.into()));
        payload.extend(args);
        let mut packet = Self::message(PacketKind::Event, namespace, payload);
        packet.kind = packet.kind.with_binary(packet.attachment_count() > 0);
        packet
    }

    /// Create an ack reply for the given id.
    #[must_use]
    pub fn ack(namespace: impl Into<String>, id: u64, payload: Vec<Value>) -> Self {
        let mut packet = Self::message(PacketKind::Ack, namespace, payload);
        packet.kind = packet.kind.with_binary(packet.attachment_count() > 0);
        packet.id = Some(id);
        packet
    }

    /// Set the ack id.
    #[must_use]
    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    /// Number of binary attachments in the payload.
    #[must_use]
    pub fn attachment_count(&self) -> usize {
        self.payload.iter().map(Value::binary_count).sum()
    }

    /// Event name, for event packets.
    #[must_use]
    pub fn event_name(&self) -> Option<&str> {
        if self.frame != FrameKind::Message || !self.kind.is_event() {
            return None;
        }
        self.payload.first().and_then(|v| v.as_str().ok())
    }

    #[must_use]
    pub fn is_default_namespace(&self) -> bool {
        self.namespace == DEFAULT_NAMESPACE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_conversion() {
        assert_eq!(FrameKind::try_from(4), Ok(FrameKind::Message));
        assert!(FrameKind::try_from(7).is_err());
        assert_eq!(PacketKind::try_from(6), Ok(PacketKind::BinaryAck));
        assert!(PacketKind::try_from(9).is_err());
        assert_eq!(FrameKind::Pong.digit(), '3');
        assert_eq!(PacketKind::BinaryEvent.digit(), '5');
    }

    #[test]
    fn test_event_upgrades_to_binary() {
        let plain = Packet::event("/", "msg", vec![Value::from("hi")]);
        assert_eq!(plain.kind, PacketKind::Event);
        assert_eq!(plain.event_name(), Some("msg"));

        let binary = Packet::event("/", "file", vec![Value::binary(b"\x00\x01")]);
        assert_eq!(binary.kind, PacketKind::BinaryEvent);
        assert_eq!(binary.attachment_count(), 1);
    }

    #[test]
    fn test_ack_packet() {
        let ack = Packet::ack("/chat", 12, vec![Value::binary(b"x")]);
        assert_eq!(ack.kind, PacketKind::BinaryAck);
        assert_eq!(ack.id, Some(12));
        assert!(ack.event_name().is_none());
    }

    #[test]
    fn test_with_binary_leaves_other_kinds() {
        assert_eq!(PacketKind::Connect.with_binary(true), PacketKind::Connect);
        assert_eq!(PacketKind::BinaryAck.with_binary(false), PacketKind::Ack);
    }
}
