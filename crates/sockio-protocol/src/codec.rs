//! Codec for encoding and decoding sockio packets.
//!
//! A packet travels as one text frame followed by zero or more binary frames.
//! The text frame layout is:
//!
//! ```text
//! <frame digit>[<packet digit>][<attachments>-][<namespace>,][<ack id>][<json>]
//! ```
//!
//! Every [`Value::Binary`] in the payload is replaced in the JSON by a
//! placeholder object `{"_placeholder":true,"num":N}` and sent as the N-th
//! binary frame after the text frame.

use bytes::Bytes;
use thiserror::Error;
use tracing::warn;

use crate::packet::{FrameKind, Packet, PacketKind, WireFrame, DEFAULT_NAMESPACE};
use crate::value::Value;
use crate::version::Revision;

/// Placeholder marker key.
const PLACEHOLDER_KEY: &str = "_placeholder";

/// Placeholder index key.
const PLACEHOLDER_NUM: &str = "num";

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Text frame carried no data.
    #[error("Empty frame")]
    Empty,

    /// Leading digit is not a known frame kind.
    #[error("Invalid frame kind: {0:?}")]
    InvalidFrameKind(char),

    /// Message subtype digit is not a known packet kind.
    #[error("Invalid packet kind: {0:?}")]
    InvalidPacketKind(char),

    /// Attachment count missing or malformed.
    #[error("Invalid attachment count")]
    InvalidAttachmentCount,

    /// Ack id does not fit in 64 bits.
    #[error("Invalid ack id")]
    InvalidAckId,

    /// JSON encoding or decoding error.
    #[error("Invalid payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Placeholder references an attachment that was never sent.
    #[error("Placeholder {index} out of range ({count} attachments)")]
    PlaceholderOutOfRange { index: u64, count: usize },

    /// Number of placeholders differs from the header count.
    #[error("Attachment count mismatch: header says {expected}, payload has {found}")]
    AttachmentMismatch { expected: usize, found: usize },

    /// Binary frame arrived while no packet was waiting for attachments.
    #[error("Unexpected binary frame: no attachment pending")]
    UnexpectedAttachment,

    /// Invalid packet structure.
    #[error("Invalid packet: {0}")]
    Invalid(&'static str),
}

/// Encode a packet into its wire frames.
///
/// The first frame is always text; one binary frame follows per attachment,
/// in placeholder order.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn encode(packet: &Packet, revision: Revision) -> Result<Vec<WireFrame>, ProtocolError> {
    let mut text = String::new();
    text.push(packet.frame.digit());

    let mut attachments = Vec::new();

    match packet.frame {
        FrameKind::Message => {
            let json = message_json(packet, &mut attachments);
            let kind = packet.kind.with_binary(!attachments.is_empty());
            text.push(kind.digit());

            if !attachments.is_empty() {
                text.push_str(&format!("{}-", attachments.len()));
            }
            if packet.namespace != DEFAULT_NAMESPACE {
                text.push_str(&packet.namespace);
                text.push(',');
            }
            if let Some(id) = packet.id {
                text.push_str(&id.to_string());
            }
            if let Some(json) = json {
                text.push_str(&serde_json::to_string(&json)?);
            }
        }
        FrameKind::Open => {
            if let Some(handshake) = packet.payload.first() {
                let json = to_json(handshake, &mut attachments);
                text.push_str(&serde_json::to_string(&json)?);
            }
        }
        FrameKind::Close | FrameKind::Ping | FrameKind::Pong => {
            if let Some(Value::String(data)) = packet.payload.first() {
                text.push_str(data);
            }
        }
    }

    let mut frames = Vec::with_capacity(1 + attachments.len());
    frames.push(WireFrame::Text(text));
    frames.extend(
        attachments
            .into_iter()
            .map(|data| WireFrame::Binary(binary_frame(data, revision))),
    );

    Ok(frames)
}

fn message_json(packet: &Packet, attachments: &mut Vec<Bytes>) -> Option<serde_json::Value> {
    if packet.kind.is_event() || packet.kind.is_ack() {
        let items = packet
            .payload
            .iter()
            .map(|v| to_json(v, attachments))
            .collect();
        Some(serde_json::Value::Array(items))
    } else {
        packet.payload.first().map(|v| to_json(v, attachments))
    }
}

fn binary_frame(data: Bytes, revision: Revision) -> Bytes {
    if revision.prefixes_binary() {
        let mut prefixed = Vec::with_capacity(data.len() + 1);
        prefixed.push(FrameKind::Message as u8);
        prefixed.extend_from_slice(&data);
        Bytes::from(prefixed)
    } else {
        data
    }
}

/// Convert a value to JSON, moving binary buffers out into `attachments`.
fn to_json(value: &Value, attachments: &mut Vec<Bytes>) -> serde_json::Value {
    value.to_json_with(&mut |data| {
        let index = attachments.len();
        attachments.push(data.clone());
        let mut placeholder = serde_json::Map::new();
        placeholder.insert(PLACEHOLDER_KEY.into(), serde_json::Value::Bool(true));
        placeholder.insert(PLACEHOLDER_NUM.into(), serde_json::Value::from(index));
        serde_json::Value::Object(placeholder)
    })
}

/// Convert JSON back to a value, substituting placeholders.
///
/// `used` counts the placeholders encountered.
fn from_json(
    json: serde_json::Value,
    attachments: &[Bytes],
    used: &mut usize,
) -> Result<Value, ProtocolError> {
    match json {
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(|item| from_json(item, attachments, used))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        serde_json::Value::Object(map) => {
            if let Some(index) = placeholder_index(&map) {
                *used += 1;
                return usize::try_from(index)
                    .ok()
                    .and_then(|i| attachments.get(i))
                    .map(|data| Value::Binary(data.clone()))
                    .ok_or(ProtocolError::PlaceholderOutOfRange {
                        index,
                        count: attachments.len(),
                    });
            }
            map.into_iter()
                .map(|(k, v)| from_json(v, attachments, used).map(|v| (k, v)))
                .collect::<Result<_, _>>()
                .map(Value::Object)
        }
        other => Ok(Value::from(other)),
    }
}

fn placeholder_index(map: &serde_json::Map<String, serde_json::Value>) -> Option<u64> {
    if map.get(PLACEHOLDER_KEY) != Some(&serde_json::Value::Bool(true)) {
        return None;
    }
    map.get(PLACEHOLDER_NUM).and_then(serde_json::Value::as_u64)
}

/// A parsed text frame awaiting its attachments.
#[derive(Debug)]
struct PendingPacket {
    header: Packet,
    json: Option<serde_json::Value>,
    expected: usize,
    attachments: Vec<Bytes>,
}

impl PendingPacket {
    fn is_complete(&self) -> bool {
        self.attachments.len() >= self.expected
    }

    fn finish(self) -> Result<Packet, ProtocolError> {
        let PendingPacket {
            mut header,
            json,
            expected,
            attachments,
        } = self;

        let mut used = 0;
        let value = json
            .map(|json| from_json(json, &attachments, &mut used))
            .transpose()?;

        if used != expected {
            return Err(ProtocolError::AttachmentMismatch {
                expected,
                found: used,
            });
        }

        let Some(value) = value else {
            return Ok(header);
        };

        header.payload = match (header.frame, value) {
            (FrameKind::Message, Value::Array(items))
                if header.kind.is_event() || header.kind.is_ack() =>
            {
                items
            }
            (FrameKind::Message, _) if header.kind.is_event() || header.kind.is_ack() => {
                return Err(ProtocolError::Invalid("event payload must be an array"));
            }
            (_, value) => vec![value],
        };

        Ok(header)
    }
}

/// Stateful packet codec.
///
/// Decoding is incremental: [`PacketCodec::feed`] accepts one frame at a time
/// and yields a packet once it and all of its attachments have arrived.
#[derive(Debug, Default)]
pub struct PacketCodec {
    revision: Revision,
    pending: Option<PendingPacket>,
}

impl PacketCodec {
    /// Create a new codec instance.
    #[must_use]
    pub fn new(revision: Revision) -> Self {
        Self {
            revision,
            pending: None,
        }
    }

    #[must_use]
    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// Encode a packet into wire frames.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self, packet: &Packet) -> Result<Vec<WireFrame>, ProtocolError> {
        encode(packet, self.revision)
    }

    /// Feed one inbound frame.
    ///
    /// Returns `Ok(Some(packet))` once a packet is complete, `Ok(None)` while
    /// attachments are still outstanding.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed frames and for binary frames that no
    /// packet is waiting for. The codec stays usable after an error.
    pub fn feed(&mut self, frame: WireFrame) -> Result<Option<Packet>, ProtocolError> {
        match frame {
            WireFrame::Text(text) => {
                if let Some(partial) = self.pending.take() {
                    warn!(
                        received = partial.attachments.len(),
                        expected = partial.expected,
                        "Discarding packet with missing attachments"
                    );
                }

                let pending = parse_text(&text)?;
                if pending.is_complete() {
                    pending.finish().map(Some)
                } else {
                    self.pending = Some(pending);
                    Ok(None)
                }
            }
            WireFrame::Binary(data) => {
                let data = if self.revision.prefixes_binary()
                    && data.first() == Some(&(FrameKind::Message as u8))
                {
                    data.slice(1..)
                } else {
                    data
                };

                let pending = self
                    .pending
                    .as_mut()
                    .ok_or(ProtocolError::UnexpectedAttachment)?;
                pending.attachments.push(data);

                if pending.is_complete() {
                    match self.pending.take() {
                        Some(done) => done.finish().map(Some),
                        None => Ok(None),
                    }
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Whether a packet is waiting for attachments.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Drop any partially received packet.
    pub fn reset(&mut self) {
        self.pending = None;
    }
}

fn digit(b: u8) -> Option<u8> {
    b.is_ascii_digit().then(|| b - b'0')
}

fn parse_text(text: &str) -> Result<PendingPacket, ProtocolError> {
    let bytes = text.as_bytes();
    let first = *bytes.first().ok_or(ProtocolError::Empty)?;
    let frame = digit(first)
        .and_then(|d| FrameKind::try_from(d).ok())
        .ok_or(ProtocolError::InvalidFrameKind(first as char))?;
    let rest = &text[1..];

    let pending = |header: Packet, json: Option<serde_json::Value>, expected: usize| PendingPacket {
        header,
        json,
        expected,
        attachments: Vec::new(),
    };

    match frame {
        FrameKind::Message => parse_message(rest),
        FrameKind::Open => {
            let json = if rest.is_empty() {
                None
            } else {
                Some(serde_json::from_str(rest)?)
            };
            Ok(pending(engine_header(frame), json, 0))
        }
        FrameKind::Close | FrameKind::Ping | FrameKind::Pong => {
            let mut header = engine_header(frame);
            if !rest.is_empty() {
                header.payload.push(Value::from(rest));
            }
            Ok(pending(header, None, 0))
        }
    }
}

fn engine_header(frame: FrameKind) -> Packet {
    Packet {
        frame,
        kind: PacketKind::Event,
        namespace: DEFAULT_NAMESPACE.to_string(),
        id: None,
        payload: Vec::new(),
    }
}

fn parse_message(text: &str) -> Result<PendingPacket, ProtocolError> {
    let bytes = text.as_bytes();
    let first = *bytes.first().ok_or(ProtocolError::Invalid("missing packet kind"))?;
    let kind = digit(first)
        .and_then(|d| PacketKind::try_from(d).ok())
        .ok_or(ProtocolError::InvalidPacketKind(first as char))?;
    let mut pos = 1;

    let mut expected = 0;
    if kind.is_binary() {
        let dash = text[pos..]
            .find('-')
            .ok_or(ProtocolError::InvalidAttachmentCount)?;
        expected = text[pos..pos + dash]
            .parse::<usize>()
            .map_err(|_| ProtocolError::InvalidAttachmentCount)?;
        pos += dash + 1;
    }

    let mut namespace = DEFAULT_NAMESPACE.to_string();
    if bytes.get(pos) == Some(&b'/') {
        match text[pos..].find(',') {
            Some(comma) => {
                namespace = text[pos..pos + comma].to_string();
                pos += comma + 1;
            }
            None => {
                namespace = text[pos..].to_string();
                pos = text.len();
            }
        }
    }

    let digits = bytes[pos..].iter().take_while(|b| b.is_ascii_digit()).count();
    let id = if digits > 0 {
        let id = text[pos..pos + digits]
            .parse::<u64>()
            .map_err(|_| ProtocolError::InvalidAckId)?;
        pos += digits;
        Some(id)
    } else {
        None
    };

    let body = &text[pos..];
    let json = if body.is_empty() {
        None
    } else {
        Some(serde_json::from_str(body)?)
    };

    let header = Packet {
        frame: FrameKind::Message,
        kind,
        namespace,
        id,
        payload: Vec::new(),
    };

    Ok(PendingPacket {
        header,
        json,
        expected,
        attachments: Vec::new(),
    })
}
