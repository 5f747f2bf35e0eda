//! Connection engine.
//!
//! [`Engine`] is the session state machine. It performs no I/O: every input
//! is a [`Input`] and every consequence is an [`Effect`] for the driver to
//! carry out, so the whole lifecycle (handshake, heartbeat, reconnection,
//! close races) can be exercised without a transport or a clock.
//!
//! ```text
//!            connect            transport opened
//!  Closed ───────────▶ Opening ─────────────────▶ Open
//!    ▲  ▲                 │                        │
//!    │  └─ reconnect ◀────┴──── unexpected close ◀─┤
//!    │      timer                                  │ close()
//!    └──────────────── Closing ◀───────────────────┘
//! ```

use sockio_protocol::{FrameKind, Packet, Revision, Value};
use sockio_transport::Headers;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::endpoint::Query;

const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(25_000);
const DEFAULT_PING_TIMEOUT: Duration = Duration::from_millis(60_000);

/// Reason sent with a user-initiated close.
pub const REASON_USER: &str = "End by user";
/// Reason sent when the server closes the session.
pub const REASON_SERVER: &str = "End by server";
/// Reason sent when the handshake is malformed.
pub const REASON_HANDSHAKE: &str = "Handshake error";
/// Reason sent when the heartbeat times out.
pub const REASON_PONG_TIMEOUT: &str = "Pong timeout";

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    Opening,
    Open,
    Closing,
    #[default]
    Closed,
}

/// Timers the engine arms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Next reconnection attempt.
    Reconnect,
    /// Next client ping (revision 3).
    Heartbeat,
    /// Pong deadline (revision 3) or server liveness deadline (revision 4).
    PongTimeout,
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// Closed by the user or cleanly by the peer.
    Normal,
    /// The connection was lost and will not be retried.
    Drop,
}

/// Connection-level notifications for the application.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The transport is open.
    Open,
    /// Reconnection gave up before a session could be opened.
    Fail,
    /// A reconnection attempt is starting.
    Reconnecting,
    /// A reconnection attempt has been scheduled.
    Reconnect { attempt: u32, delay: Duration },
    /// The session ended.
    Close(CloseReason),
}

/// Parameters of the server's handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct Handshake {
    pub sid: String,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub upgrades: Vec<String>,
    pub max_payload: Option<u64>,
}

impl Handshake {
    /// Parse an `open` payload. Returns `None` without a string `sid`.
    #[must_use]
    pub fn parse(value: &Value) -> Option<Self> {
        let sid = value.get("sid")?.as_str().ok()?.to_string();
        let millis = |key: &str, default: Duration| {
            value
                .get(key)
                .and_then(|v| v.as_i64().ok())
                .and_then(|ms| u64::try_from(ms).ok())
                .map_or(default, Duration::from_millis)
        };
        let upgrades = value
            .get("upgrades")
            .and_then(|v| v.as_array().ok())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().ok().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let max_payload = value
            .get("maxPayload")
            .and_then(|v| v.as_i64().ok())
            .and_then(|n| u64::try_from(n).ok());

        Some(Self {
            sid,
            ping_interval: millis("pingInterval", DEFAULT_PING_INTERVAL),
            ping_timeout: millis("pingTimeout", DEFAULT_PING_TIMEOUT),
            upgrades,
            max_payload,
        })
    }
}

/// Reconnection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    attempts: Option<u32>,
    delay: Duration,
    delay_max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            attempts: None,
            delay: Duration::from_millis(5_000),
            delay_max: Duration::from_millis(25_000),
        }
    }
}

impl ReconnectPolicy {
    #[must_use]
    pub fn new(attempts: Option<u32>, delay: Duration, delay_max: Duration) -> Self {
        let mut policy = Self {
            attempts,
            ..Self::default()
        };
        policy.set_delay_max(delay_max);
        policy.set_delay(delay);
        policy
    }

    #[must_use]
    pub fn attempts(&self) -> Option<u32> {
        self.attempts
    }

    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    #[must_use]
    pub fn delay_max(&self) -> Duration {
        self.delay_max
    }

    pub fn set_attempts(&mut self, attempts: Option<u32>) {
        self.attempts = attempts;
    }

    /// Set the base delay, raising the cap if it would fall below it.
    pub fn set_delay(&mut self, delay: Duration) {
        self.delay = delay;
        if self.delay_max < delay {
            self.delay_max = delay;
        }
    }

    /// Set the cap, lowering the base delay if it would exceed it.
    pub fn set_delay_max(&mut self, delay_max: Duration) {
        self.delay_max = delay_max;
        if self.delay > delay_max {
            self.delay = delay_max;
        }
    }

    /// Whether another attempt is allowed after `made` attempts.
    #[must_use]
    pub fn allows(&self, made: u32) -> bool {
        self.attempts.map_or(true, |max| made < max)
    }

    /// Delay before the attempt following `made` attempts:
    /// `min(delay * 1.5^min(made, 32), delay_max)`, in whole milliseconds.
    #[must_use]
    pub fn delay_for(&self, made: u32) -> Duration {
        let exponent = i32::try_from(made.min(32)).unwrap_or(32);
        let scaled = self.delay.as_millis() as f64 * 1.5f64.powi(exponent);
        let capped = scaled.min(self.delay_max.as_millis() as f64);
        Duration::from_millis(capped.floor() as u64)
    }
}

/// Something that happened, fed to [`Engine::handle`].
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// The application asked to connect.
    Connect { query: Query, headers: Headers },
    /// The application asked to close.
    Close,
    /// The transport finished opening.
    TransportOpened,
    /// The transport closed. `normal` reports a clean close handshake.
    TransportClosed { normal: bool },
    /// Any frame arrived.
    FrameReceived,
    /// An engine-level packet (`open`, `close`, `ping`, `pong`) arrived.
    Packet(Packet),
    /// A timer fired.
    TimerFired(TimerKind),
    /// Reconnection limit changed.
    SetReconnectAttempts(Option<u32>),
    /// Reconnection base delay changed.
    SetReconnectDelay(Duration),
    /// Reconnection delay cap changed.
    SetReconnectDelayMax(Duration),
}

/// Work for the driver, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Open the transport.
    OpenTransport {
        query: Query,
        headers: Headers,
    },
    /// Close the transport.
    CloseTransport { reason: &'static str },
    /// Encode and write a packet.
    Send(Packet),
    /// Arm (or re-arm) a timer.
    ArmTimer { kind: TimerKind, delay: Duration },
    CancelTimer(TimerKind),
    /// Drop any partially decoded packet.
    ResetCodec,
    /// Ask every namespace to connect.
    SocketsOpen,
    /// The transport went away. `final_close` is set when no reconnect
    /// will follow.
    SocketsDisconnect { final_close: bool },
    /// Close and release every namespace.
    SocketsClose,
    /// Tell the application.
    Notify(ClientEvent),
}

/// Why the engine itself asked the transport to close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cause {
    User,
    Fault(&'static str),
}

/// The session state machine.
#[derive(Debug)]
pub struct Engine {
    revision: Revision,
    state: ConnectionState,
    policy: ReconnectPolicy,
    attempts: u32,
    handshake: Option<Handshake>,
    query: Query,
    headers: Headers,
    cause: Option<Cause>,
    reconnect_pending: bool,
    awaiting_pong: bool,
    deferred_connect: Option<(Query, Headers)>,
}

impl Engine {
    #[must_use]
    pub fn new(revision: Revision, policy: ReconnectPolicy) -> Self {
        Self {
            revision,
            state: ConnectionState::Closed,
            policy,
            attempts: 0,
            handshake: None,
            query: Query::new(),
            headers: Headers::new(),
            cause: None,
            reconnect_pending: false,
            awaiting_pong: false,
            deferred_connect: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn revision(&self) -> Revision {
        self.revision
    }

    #[must_use]
    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Reconnection attempts made since the last successful open.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    #[must_use]
    pub fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.handshake.as_ref().map(|h| h.sid.as_str())
    }

    #[must_use]
    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_pending
    }

    /// Apply one input and return the resulting work.
    pub fn handle(&mut self, input: Input) -> Vec<Effect> {
        let mut effects = Vec::new();
        match input {
            Input::Connect { query, headers } => self.connect(query, headers, &mut effects),
            Input::Close => self.close(&mut effects),
            Input::TransportOpened => self.transport_opened(&mut effects),
            Input::TransportClosed { normal } => self.transport_closed(normal, &mut effects),
            Input::FrameReceived => self.frame_received(&mut effects),
            Input::Packet(packet) => self.packet(packet, &mut effects),
            Input::TimerFired(kind) => self.timer_fired(kind, &mut effects),
            Input::SetReconnectAttempts(attempts) => self.policy.set_attempts(attempts),
            Input::SetReconnectDelay(delay) => self.policy.set_delay(delay),
            Input::SetReconnectDelayMax(delay) => self.policy.set_delay_max(delay),
        }
        effects
    }

    fn connect(&mut self, query: Query, headers: Headers, effects: &mut Vec<Effect>) {
        match self.state {
            ConnectionState::Opening | ConnectionState::Open => {
                debug!(state = ?self.state, "Already connecting, ignoring connect");
            }
            ConnectionState::Closing => {
                debug!("Close in progress, connect deferred");
                self.deferred_connect = Some((query, headers));
            }
            ConnectionState::Closed => {
                if self.reconnect_pending {
                    self.reconnect_pending = false;
                    effects.push(Effect::CancelTimer(TimerKind::Reconnect));
                }
                self.query = query;
                self.headers = headers;
                self.attempts = 0;
                self.start_attempt(effects);
            }
        }
    }

    fn start_attempt(&mut self, effects: &mut Vec<Effect>) {
        self.state = ConnectionState::Opening;
        self.handshake = None;
        self.cause = None;
        self.awaiting_pong = false;
        effects.push(Effect::ResetCodec);
        effects.push(Effect::OpenTransport {
            query: self.query.clone(),
            headers: self.headers.clone(),
        });
    }

    fn close(&mut self, effects: &mut Vec<Effect>) {
        match self.state {
            ConnectionState::Opening | ConnectionState::Open => {
                info!("Closing connection");
                self.state = ConnectionState::Closing;
                self.cause = Some(Cause::User);
                effects.push(Effect::SocketsClose);
                effects.extend(self.stop_heartbeat());
                effects.push(Effect::CloseTransport {
                    reason: REASON_USER,
                });
            }
            ConnectionState::Closing => {
                debug!("Close already in progress");
            }
            ConnectionState::Closed => {
                effects.push(Effect::SocketsClose);
                if self.reconnect_pending {
                    info!("Reconnection cancelled");
                    self.reconnect_pending = false;
                    self.attempts = 0;
                    effects.push(Effect::CancelTimer(TimerKind::Reconnect));
                    effects.push(Effect::Notify(ClientEvent::Close(CloseReason::Normal)));
                }
            }
        }
    }

    fn transport_opened(&mut self, effects: &mut Vec<Effect>) {
        match self.state {
            ConnectionState::Opening => {
                info!(attempts = self.attempts, "Connected");
                self.state = ConnectionState::Open;
                self.attempts = 0;
                effects.push(Effect::SocketsOpen);
                effects.push(Effect::Notify(ClientEvent::Open));
            }
            ConnectionState::Closing => {
                debug!("Opened while closing, re-issuing close");
                effects.push(Effect::CloseTransport {
                    reason: REASON_USER,
                });
            }
            state => debug!(?state, "Ignoring transport open"),
        }
    }

    fn transport_closed(&mut self, normal: bool, effects: &mut Vec<Effect>) {
        let was_open = match self.state {
            ConnectionState::Closed => {
                debug!("Ignoring transport close while closed");
                return;
            }
            ConnectionState::Closing => {
                info!("Connection closed");
                self.finish_close(effects);
                effects.push(Effect::Notify(ClientEvent::Close(CloseReason::Normal)));
                if let Some((query, headers)) = self.deferred_connect.take() {
                    self.connect(query, headers, effects);
                }
                return;
            }
            ConnectionState::Open => true,
            ConnectionState::Opening => false,
        };

        let fault = match self.cause {
            Some(Cause::Fault(reason)) => Some(reason),
            _ => None,
        };
        self.finish_close(effects);

        if fault.is_none() && normal {
            info!("Connection closed by peer");
            effects.push(Effect::SocketsDisconnect { final_close: true });
            effects.push(Effect::Notify(ClientEvent::Close(CloseReason::Normal)));
            return;
        }

        warn!(
            reason = fault.unwrap_or("transport failure"),
            was_open, "Connection lost"
        );

        if self.policy.allows(self.attempts) {
            let delay = self.policy.delay_for(self.attempts);
            info!(
                attempt = self.attempts + 1,
                delay_ms = delay.as_millis() as u64,
                "Scheduling reconnect"
            );
            self.reconnect_pending = true;
            effects.push(Effect::SocketsDisconnect { final_close: false });
            effects.push(Effect::ArmTimer {
                kind: TimerKind::Reconnect,
                delay,
            });
            effects.push(Effect::Notify(ClientEvent::Reconnect {
                attempt: self.attempts,
                delay,
            }));
        } else {
            warn!(attempts = self.attempts, "Reconnect attempts exhausted");
            self.attempts = 0;
            effects.push(Effect::SocketsDisconnect { final_close: true });
            effects.push(Effect::Notify(if was_open {
                ClientEvent::Close(CloseReason::Drop)
            } else {
                ClientEvent::Fail
            }));
        }
    }

    fn finish_close(&mut self, effects: &mut Vec<Effect>) {
        self.state = ConnectionState::Closed;
        self.handshake = None;
        self.cause = None;
        effects.extend(self.stop_heartbeat());
    }

    fn stop_heartbeat(&mut self) -> [Effect; 2] {
        self.awaiting_pong = false;
        [
            Effect::CancelTimer(TimerKind::Heartbeat),
            Effect::CancelTimer(TimerKind::PongTimeout),
        ]
    }

    fn fault(&mut self, reason: &'static str, effects: &mut Vec<Effect>) {
        if self.cause.is_some() {
            return;
        }
        warn!(reason, "Closing connection");
        self.cause = Some(Cause::Fault(reason));
        effects.extend(self.stop_heartbeat());
        effects.push(Effect::CloseTransport { reason });
    }

    fn frame_received(&mut self, effects: &mut Vec<Effect>) {
        if self.state != ConnectionState::Open || self.cause.is_some() {
            return;
        }
        let Some(handshake) = &self.handshake else {
            return;
        };
        if self.revision.server_pings() {
            effects.push(Effect::ArmTimer {
                kind: TimerKind::PongTimeout,
                delay: handshake.ping_interval + handshake.ping_timeout,
            });
        } else if self.awaiting_pong {
            effects.push(Effect::ArmTimer {
                kind: TimerKind::PongTimeout,
                delay: handshake.ping_timeout,
            });
        }
    }

    fn packet(&mut self, packet: Packet, effects: &mut Vec<Effect>) {
        if self.state != ConnectionState::Open {
            debug!(frame = ?packet.frame, state = ?self.state, "Ignoring packet");
            return;
        }
        match packet.frame {
            FrameKind::Open => self.on_handshake(packet, effects),
            FrameKind::Close => self.fault(REASON_SERVER, effects),
            FrameKind::Ping => {
                effects.push(Effect::Send(Packet::pong()));
            }
            FrameKind::Pong => {
                if self.revision.server_pings() || !self.awaiting_pong {
                    return;
                }
                self.awaiting_pong = false;
                effects.push(Effect::CancelTimer(TimerKind::PongTimeout));
                if let Some(handshake) = &self.handshake {
                    effects.push(Effect::ArmTimer {
                        kind: TimerKind::Heartbeat,
                        delay: handshake.ping_interval,
                    });
                }
            }
            FrameKind::Message => debug!("Message frames are routed to namespaces"),
        }
    }

    fn on_handshake(&mut self, packet: Packet, effects: &mut Vec<Effect>) {
        let Some(handshake) = packet.payload.first().and_then(Handshake::parse) else {
            self.fault(REASON_HANDSHAKE, effects);
            return;
        };
        debug!(
            sid = %handshake.sid,
            ping_interval_ms = handshake.ping_interval.as_millis() as u64,
            ping_timeout_ms = handshake.ping_timeout.as_millis() as u64,
            "Handshake received"
        );
        let (kind, delay) = if self.revision.server_pings() {
            (
                TimerKind::PongTimeout,
                handshake.ping_interval + handshake.ping_timeout,
            )
        } else {
            (TimerKind::Heartbeat, handshake.ping_interval)
        };
        self.handshake = Some(handshake);
        effects.push(Effect::ArmTimer { kind, delay });
    }

    fn timer_fired(&mut self, kind: TimerKind, effects: &mut Vec<Effect>) {
        match kind {
            TimerKind::Reconnect => {
                if self.state != ConnectionState::Closed || !self.reconnect_pending {
                    return;
                }
                self.reconnect_pending = false;
                self.attempts += 1;
                info!(attempt = self.attempts, "Reconnecting");
                effects.push(Effect::Notify(ClientEvent::Reconnecting));
                self.start_attempt(effects);
            }
            TimerKind::Heartbeat => {
                if self.state != ConnectionState::Open || self.cause.is_some() {
                    return;
                }
                let Some(timeout) = self.handshake.as_ref().map(|h| h.ping_timeout) else {
                    return;
                };
                effects.push(Effect::Send(Packet::ping()));
                if !self.awaiting_pong {
                    self.awaiting_pong = true;
                    effects.push(Effect::ArmTimer {
                        kind: TimerKind::PongTimeout,
                        delay: timeout,
                    });
                }
            }
            TimerKind::PongTimeout => {
                if self.state == ConnectionState::Open && self.handshake.is_some() {
                    self.fault(REASON_PONG_TIMEOUT, effects);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sockio_protocol::Map;

    fn handshake_packet(sid: &str, interval: i64, timeout: i64) -> Packet {
        let mut map = Map::new();
        map.insert("sid".into(), Value::from(sid));
        map.insert("pingInterval".into(), Value::Int(interval));
        map.insert("pingTimeout".into(), Value::Int(timeout));
        Packet::open(Value::Object(map))
    }

    fn connect() -> Input {
        Input::Connect {
            query: Query::new(),
            headers: Headers::new(),
        }
    }

    fn open_engine(revision: Revision) -> Engine {
        let mut engine = Engine::new(revision, ReconnectPolicy::default());
        engine.handle(connect());
        engine.handle(Input::TransportOpened);
        engine.handle(Input::Packet(handshake_packet("abc", 25_000, 60_000)));
        engine
    }

    fn notifications(effects: &[Effect]) -> Vec<ClientEvent> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Notify(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_reconnect_delay_sequence() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (0..7)
            .map(|n| policy.delay_for(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![5000, 7500, 11250, 16875, 25000, 25000, 25000]);
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(25000));
    }

    #[test]
    fn test_delay_bounds_stay_ordered() {
        let mut policy = ReconnectPolicy::default();
        policy.set_delay(Duration::from_secs(40));
        assert_eq!(policy.delay_max(), Duration::from_secs(40));

        policy.set_delay_max(Duration::from_secs(2));
        assert_eq!(policy.delay(), Duration::from_secs(2));
        assert_eq!(policy.delay_max(), Duration::from_secs(2));

        policy.set_attempts(Some(2));
        assert!(policy.allows(1));
        assert!(!policy.allows(2));
    }

    #[test]
    fn test_handshake_parsing() {
        let parsed = Handshake::parse(&handshake_packet("s1", 100, 200).payload[0]).unwrap();
        assert_eq!(parsed.sid, "s1");
        assert_eq!(parsed.ping_interval, Duration::from_millis(100));
        assert_eq!(parsed.ping_timeout, Duration::from_millis(200));

        let mut map = Map::new();
        map.insert("sid".into(), Value::from("s2"));
        map.insert("pingInterval".into(), Value::from("soon"));
        map.insert("maxPayload".into(), Value::Int(1_000_000));
        map.insert(
            "upgrades".into(),
            Value::Array(vec![Value::from("webtransport")]),
        );
        let parsed = Handshake::parse(&Value::Object(map)).unwrap();
        assert_eq!(parsed.ping_interval, DEFAULT_PING_INTERVAL);
        assert_eq!(parsed.ping_timeout, DEFAULT_PING_TIMEOUT);
        assert_eq!(parsed.max_payload, Some(1_000_000));
        assert_eq!(parsed.upgrades, vec!["webtransport".to_string()]);

        let mut map = Map::new();
        map.insert("sid".into(), Value::Int(7));
        assert!(Handshake::parse(&Value::Object(map)).is_none());
    }

    #[test]
    fn test_connect_opens_transport() {
        let mut engine = Engine::new(Revision::V4, ReconnectPolicy::default());
        let effects = engine.handle(connect());
        assert_eq!(engine.state(), ConnectionState::Opening);
        assert_eq!(effects[0], Effect::ResetCodec);
        assert!(matches!(effects[1], Effect::OpenTransport { .. }));

        // Connecting again is a no-op.
        assert!(engine.handle(connect()).is_empty());

        let effects = engine.handle(Input::TransportOpened);
        assert_eq!(engine.state(), ConnectionState::Open);
        assert_eq!(effects[0], Effect::SocketsOpen);
        assert_eq!(notifications(&effects), vec![ClientEvent::Open]);
        assert!(engine.handle(connect()).is_empty());
    }

    #[test]
    fn test_handshake_arms_liveness_timer() {
        let mut engine = Engine::new(Revision::V4, ReconnectPolicy::default());
        engine.handle(connect());
        engine.handle(Input::TransportOpened);
        let effects = engine.handle(Input::Packet(handshake_packet("abc", 25_000, 60_000)));
        assert_eq!(engine.session_id(), Some("abc"));
        assert_eq!(
            effects,
            vec![Effect::ArmTimer {
                kind: TimerKind::PongTimeout,
                delay: Duration::from_millis(85_000),
            }]
        );

        // Server ping is answered, and any frame pushes the deadline out.
        let effects = engine.handle(Input::Packet(Packet::ping()));
        assert_eq!(effects, vec![Effect::Send(Packet::pong())]);
        let effects = engine.handle(Input::FrameReceived);
        assert!(matches!(
            effects[0],
            Effect::ArmTimer {
                kind: TimerKind::PongTimeout,
                ..
            }
        ));
    }

    #[test]
    fn test_client_ping_heartbeat() {
        let mut engine = Engine::new(Revision::V3, ReconnectPolicy::default());
        engine.handle(connect());
        engine.handle(Input::TransportOpened);
        let effects = engine.handle(Input::Packet(handshake_packet("abc", 25_000, 60_000)));
        assert_eq!(
            effects,
            vec![Effect::ArmTimer {
                kind: TimerKind::Heartbeat,
                delay: Duration::from_millis(25_000),
            }]
        );

        let effects = engine.handle(Input::TimerFired(TimerKind::Heartbeat));
        assert_eq!(
            effects,
            vec![
                Effect::Send(Packet::ping()),
                Effect::ArmTimer {
                    kind: TimerKind::PongTimeout,
                    delay: Duration::from_millis(60_000),
                },
            ]
        );

        let effects = engine.handle(Input::Packet(Packet::pong()));
        assert_eq!(
            effects,
            vec![
                Effect::CancelTimer(TimerKind::PongTimeout),
                Effect::ArmTimer {
                    kind: TimerKind::Heartbeat,
                    delay: Duration::from_millis(25_000),
                },
            ]
        );
    }

    #[test]
    fn test_pong_timeout_schedules_reconnect() {
        let mut engine = open_engine(Revision::V3);
        engine.handle(Input::TimerFired(TimerKind::Heartbeat));

        let effects = engine.handle(Input::TimerFired(TimerKind::PongTimeout));
        assert!(effects.contains(&Effect::CloseTransport {
            reason: REASON_PONG_TIMEOUT
        }));

        // The transport reports a clean close, but the engine caused it.
        let effects = engine.handle(Input::TransportClosed { normal: true });
        assert_eq!(engine.state(), ConnectionState::Closed);
        assert_eq!(engine.session_id(), None);
        assert!(effects.contains(&Effect::SocketsDisconnect { final_close: false }));
        assert!(effects.contains(&Effect::ArmTimer {
            kind: TimerKind::Reconnect,
            delay: Duration::from_millis(5000),
        }));
        assert_eq!(
            notifications(&effects),
            vec![ClientEvent::Reconnect {
                attempt: 0,
                delay: Duration::from_millis(5000),
            }]
        );

        let effects = engine.handle(Input::TimerFired(TimerKind::Reconnect));
        assert_eq!(engine.state(), ConnectionState::Opening);
        assert_eq!(engine.attempts(), 1);
        assert_eq!(notifications(&effects), vec![ClientEvent::Reconnecting]);
        assert!(effects.contains(&Effect::ResetCodec));
    }

    #[test]
    fn test_clean_peer_close_does_not_reconnect() {
        let mut engine = open_engine(Revision::V4);
        let effects = engine.handle(Input::TransportClosed { normal: true });
        assert_eq!(engine.state(), ConnectionState::Closed);
        assert!(!engine.reconnect_pending());
        assert_eq!(
            notifications(&effects),
            vec![ClientEvent::Close(CloseReason::Normal)]
        );
    }

    #[test]
    fn test_server_close_frame_reconnects() {
        let mut engine = open_engine(Revision::V4);
        let effects = engine.handle(Input::Packet(Packet::close()));
        assert!(effects.contains(&Effect::CloseTransport {
            reason: REASON_SERVER
        }));
        engine.handle(Input::TransportClosed { normal: true });
        assert!(engine.reconnect_pending());
    }

    #[test]
    fn test_close_frame_before_handshake_reconnects() {
        let mut engine = Engine::new(Revision::V4, ReconnectPolicy::default());
        engine.handle(connect());
        engine.handle(Input::TransportOpened);
        engine.handle(Input::Packet(Packet::close()));
        engine.handle(Input::TransportClosed { normal: true });
        assert!(engine.reconnect_pending());
    }

    #[test]
    fn test_handshake_error_forces_close() {
        let mut engine = Engine::new(Revision::V4, ReconnectPolicy::default());
        engine.handle(connect());
        engine.handle(Input::TransportOpened);
        let effects = engine.handle(Input::Packet(Packet::open(Value::object())));
        assert!(effects.contains(&Effect::CloseTransport {
            reason: REASON_HANDSHAKE
        }));
        engine.handle(Input::TransportClosed { normal: true });
        assert!(engine.reconnect_pending());
    }

    #[test]
    fn test_user_close() {
        let mut engine = open_engine(Revision::V4);
        let effects = engine.handle(Input::Close);
        assert_eq!(engine.state(), ConnectionState::Closing);
        assert_eq!(effects[0], Effect::SocketsClose);
        assert_eq!(
            effects.last(),
            Some(&Effect::CloseTransport {
                reason: REASON_USER
            })
        );

        let effects = engine.handle(Input::TransportClosed { normal: false });
        assert_eq!(engine.state(), ConnectionState::Closed);
        assert!(!engine.reconnect_pending());
        assert_eq!(
            notifications(&effects),
            vec![ClientEvent::Close(CloseReason::Normal)]
        );
    }

    #[test]
    fn test_open_while_closing_reissues_close() {
        let mut engine = Engine::new(Revision::V4, ReconnectPolicy::default());
        engine.handle(connect());
        engine.handle(Input::Close);
        let effects = engine.handle(Input::TransportOpened);
        assert_eq!(
            effects,
            vec![Effect::CloseTransport {
                reason: REASON_USER
            }]
        );
        assert_eq!(engine.state(), ConnectionState::Closing);
    }

    #[test]
    fn test_connect_while_closing_is_deferred() {
        let mut engine = open_engine(Revision::V4);
        engine.handle(Input::Close);
        assert!(engine.handle(connect()).is_empty());

        let effects = engine.handle(Input::TransportClosed { normal: true });
        assert_eq!(engine.state(), ConnectionState::Opening);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::OpenTransport { .. })));
    }

    #[test]
    fn test_close_cancels_pending_reconnect() {
        let mut engine = open_engine(Revision::V4);
        engine.handle(Input::TransportClosed { normal: false });
        assert!(engine.reconnect_pending());

        let effects = engine.handle(Input::Close);
        assert!(!engine.reconnect_pending());
        assert!(effects.contains(&Effect::CancelTimer(TimerKind::Reconnect)));

        // A fire that raced the cancel does nothing.
        assert!(engine
            .handle(Input::TimerFired(TimerKind::Reconnect))
            .is_empty());
        assert_eq!(engine.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_connect_cancels_pending_reconnect() {
        let mut engine = open_engine(Revision::V4);
        engine.handle(Input::TransportClosed { normal: false });
        let effects = engine.handle(connect());
        assert_eq!(effects[0], Effect::CancelTimer(TimerKind::Reconnect));
        assert_eq!(engine.state(), ConnectionState::Opening);
    }

    #[test]
    fn test_exhausted_attempts_fail() {
        let mut engine = Engine::new(
            Revision::V4,
            ReconnectPolicy::new(Some(2), Duration::from_secs(1), Duration::from_secs(10)),
        );
        engine.handle(connect());

        let mut delays = Vec::new();
        for _ in 0..2 {
            let effects = engine.handle(Input::TransportClosed { normal: false });
            assert!(engine.reconnect_pending());
            delays.extend(effects.iter().filter_map(|e| match e {
                Effect::ArmTimer {
                    kind: TimerKind::Reconnect,
                    delay,
                } => Some(*delay),
                _ => None,
            }));
            engine.handle(Input::TimerFired(TimerKind::Reconnect));
        }
        assert_eq!(
            delays,
            vec![Duration::from_millis(1000), Duration::from_millis(1500)]
        );

        let effects = engine.handle(Input::TransportClosed { normal: false });
        assert!(!engine.reconnect_pending());
        assert!(effects.contains(&Effect::SocketsDisconnect { final_close: true }));
        assert_eq!(notifications(&effects), vec![ClientEvent::Fail]);
    }

    #[test]
    fn test_dropped_session_without_attempts_reports_drop() {
        let mut engine = Engine::new(
            Revision::V4,
            ReconnectPolicy::new(Some(0), Duration::from_secs(1), Duration::from_secs(10)),
        );
        engine.handle(connect());
        engine.handle(Input::TransportOpened);
        let effects = engine.handle(Input::TransportClosed { normal: false });
        assert_eq!(
            notifications(&effects),
            vec![ClientEvent::Close(CloseReason::Drop)]
        );
    }

    #[test]
    fn test_stale_inputs_are_ignored() {
        let mut engine = Engine::new(Revision::V4, ReconnectPolicy::default());
        assert!(engine
            .handle(Input::TransportClosed { normal: false })
            .is_empty());
        assert!(engine.handle(Input::TransportOpened).is_empty());
        assert!(engine
            .handle(Input::TimerFired(TimerKind::PongTimeout))
            .is_empty());
        assert!(engine.handle(Input::Packet(Packet::ping())).is_empty());
    }
}
