//! Namespace sockets.
//!
//! A [`Socket`] is the application's handle on one namespace multiplexed
//! over the client's connection. It holds the namespace's event listeners,
//! the callbacks of emitted events awaiting an ack, and the emits issued
//! before the namespace was connected.
//!
//! The client task drives each socket through [`NamespaceLink`]; the
//! application only sees the public methods.

use sockio_protocol::{Packet, PacketKind, Revision, Value, DEFAULT_NAMESPACE};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::client::Command;

/// Event listener.
pub type Listener = Arc<dyn Fn(&mut Event) + Send + Sync>;

/// Connect error listener.
pub type ErrorListener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Ack callback, invoked at most once with the reply payload.
pub type AckCallback = Box<dyn FnOnce(Vec<Value>) + Send>;

/// Prefix `/` onto a namespace path that lacks one.
#[must_use]
pub fn normalize_namespace(namespace: &str) -> String {
    if namespace.starts_with('/') {
        namespace.to_string()
    } else {
        format!("/{namespace}")
    }
}

/// An event delivered to a listener.
#[derive(Debug)]
pub struct Event {
    namespace: String,
    name: String,
    args: Vec<Value>,
    ack_id: Option<u64>,
    reply: Option<Vec<Value>>,
}

impl Event {
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arguments following the event name.
    #[must_use]
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    #[must_use]
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// Whether the sender is waiting for an ack.
    #[must_use]
    pub fn need_ack(&self) -> bool {
        self.ack_id.is_some()
    }

    /// Reply to the sender. Ignored if no ack was requested; a second call
    /// replaces the first reply.
    pub fn ack(&mut self, reply: Vec<Value>) {
        self.reply = Some(reply);
    }
}

/// A namespace lifecycle change reported by [`NamespaceLink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Connected,
    Disconnected,
}

/// Outcome of driving a socket.
#[derive(Debug, Default)]
pub(crate) struct Dispatch {
    /// Packets to send, in order.
    pub outbound: Vec<Packet>,
    pub lifecycle: Option<Lifecycle>,
}

/// How the client task drives a namespace.
pub(crate) trait NamespaceLink {
    /// The transport opened: request the namespace.
    fn on_open(&self, revision: Revision) -> Dispatch;

    /// A packet addressed to this namespace arrived.
    fn on_message_packet(&self, packet: Packet) -> Dispatch;

    /// The namespace is being closed locally. Returns the packets to send.
    fn on_close(&self) -> Vec<Packet>;

    /// The transport went away. `final_close` is set when no reconnect
    /// will follow.
    fn on_disconnect(&self, final_close: bool);
}

#[derive(Default)]
struct SocketState {
    listeners: HashMap<String, Listener>,
    error_listener: Option<ErrorListener>,
    acks: BTreeMap<u64, AckCallback>,
    queue: VecDeque<Packet>,
    connected: bool,
    requested: bool,
    next_id: u64,
    auth: Option<Value>,
}

impl SocketState {
    fn reset(&mut self, final_close: bool) {
        self.connected = false;
        self.requested = false;
        if final_close {
            self.acks.clear();
            self.queue.clear();
        }
    }
}

struct Inner {
    namespace: String,
    commands: mpsc::UnboundedSender<Command>,
    state: Mutex<SocketState>,
}

/// Handle on one namespace. Cheap to clone.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<Inner>,
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("namespace", &self.inner.namespace)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Socket {
    pub(crate) fn new(namespace: String, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            inner: Arc::new(Inner {
                namespace,
                commands,
                state: Mutex::new(SocketState::default()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SocketState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    /// Whether the server has confirmed the namespace.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    /// Number of emitted events still waiting for an ack.
    #[must_use]
    pub fn pending_acks(&self) -> usize {
        self.state().acks.len()
    }

    /// Register the listener for `name`, replacing any previous one.
    pub fn on<F>(&self, name: impl Into<String>, listener: F)
    where
        F: Fn(&mut Event) + Send + Sync + 'static,
    {
        self.state().listeners.insert(name.into(), Arc::new(listener));
    }

    pub fn off(&self, name: &str) {
        self.state().listeners.remove(name);
    }

    pub fn off_all(&self) {
        self.state().listeners.clear();
    }

    /// Register the listener for connect errors.
    pub fn on_error<F>(&self, listener: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.state().error_listener = Some(Arc::new(listener));
    }

    pub fn off_error(&self) {
        self.state().error_listener = None;
    }

    /// Payload sent with the namespace connect request.
    pub fn set_auth(&self, auth: Value) {
        self.state().auth = Some(auth);
    }

    /// Emit an event. Queued until the namespace is connected.
    pub fn emit(&self, name: impl Into<String>, args: Vec<Value>) {
        self.send_emit(name.into(), args, None);
    }

    /// Emit an event and invoke `ack` with the reply payload.
    pub fn emit_with_ack<F>(&self, name: impl Into<String>, args: Vec<Value>, ack: F)
    where
        F: FnOnce(Vec<Value>) + Send + 'static,
    {
        self.send_emit(name.into(), args, Some(Box::new(ack)));
    }

    fn send_emit(&self, name: String, args: Vec<Value>, ack: Option<AckCallback>) {
        let command = Command::Emit {
            namespace: self.inner.namespace.clone(),
            name,
            args,
            ack,
        };
        if self.inner.commands.send(command).is_err() {
            debug!(namespace = %self.inner.namespace, "Client is shut down, emit dropped");
        }
    }

    /// Leave the namespace and drop it from the client.
    pub fn close(&self) {
        let command = Command::CloseSocket(self.inner.namespace.clone());
        if self.inner.commands.send(command).is_err() {
            debug!(namespace = %self.inner.namespace, "Client is shut down, close dropped");
        }
    }

    /// Build the packet for an emit, registering its ack. Returns `None`
    /// when the packet was queued instead.
    pub(crate) fn prepare_emit(
        &self,
        name: String,
        args: Vec<Value>,
        ack: Option<AckCallback>,
    ) -> Option<Packet> {
        let mut packet = Packet::event(self.inner.namespace.clone(), name, args);
        let mut state = self.state();
        if let Some(ack) = ack {
            let id = state.next_id;
            state.next_id += 1;
            state.acks.insert(id, ack);
            packet = packet.with_id(id);
        }
        if state.connected {
            Some(packet)
        } else {
            trace!(namespace = %self.inner.namespace, queued = state.queue.len() + 1, "Emit queued");
            state.queue.push_back(packet);
            None
        }
    }

    fn connected(&self, state: &mut SocketState) -> Dispatch {
        let newly = !state.connected;
        state.connected = true;
        state.requested = true;
        Dispatch {
            outbound: state.queue.drain(..).collect(),
            lifecycle: newly.then_some(Lifecycle::Connected),
        }
    }

    fn dispatch_event(&self, packet: Packet) -> Dispatch {
        let mut payload = packet.payload.into_iter();
        let Some(Value::String(name)) = payload.next() else {
            debug!(namespace = %self.inner.namespace, "Event without a name dropped");
            return Dispatch::default();
        };

        let listener = self.state().listeners.get(&name).cloned();
        let Some(listener) = listener else {
            trace!(namespace = %self.inner.namespace, event = %name, "No listener");
            return Dispatch::default();
        };

        let mut event = Event {
            namespace: self.inner.namespace.clone(),
            name,
            args: payload.collect(),
            ack_id: packet.id,
            reply: None,
        };
        listener(&mut event);

        match (packet.id, event.reply) {
            (Some(id), Some(reply)) => Dispatch {
                outbound: vec![Packet::ack(self.inner.namespace.clone(), id, reply)],
                lifecycle: None,
            },
            _ => Dispatch::default(),
        }
    }

    fn dispatch_ack(&self, packet: Packet) {
        let Some(id) = packet.id else {
            debug!(namespace = %self.inner.namespace, "Ack without an id dropped");
            return;
        };
        let callback = self.state().acks.remove(&id);
        match callback {
            Some(callback) => callback(packet.payload),
            None => debug!(namespace = %self.inner.namespace, id, "Unknown ack id"),
        }
    }
}

impl NamespaceLink for Socket {
    fn on_open(&self, revision: Revision) -> Dispatch {
        let mut state = self.state();
        if state.requested || state.connected {
            return Dispatch::default();
        }
        if self.inner.namespace == DEFAULT_NAMESPACE && !revision.connects_default_namespace() {
            return self.connected(&mut state);
        }
        state.requested = true;
        debug!(namespace = %self.inner.namespace, "Requesting namespace");
        Dispatch {
            outbound: vec![Packet::connect(
                self.inner.namespace.clone(),
                state.auth.clone(),
            )],
            lifecycle: None,
        }
    }

    fn on_message_packet(&self, packet: Packet) -> Dispatch {
        match packet.kind {
            PacketKind::Connect => {
                debug!(namespace = %self.inner.namespace, "Namespace connected");
                let mut state = self.state();
                self.connected(&mut state)
            }
            PacketKind::Disconnect => {
                debug!(namespace = %self.inner.namespace, "Namespace closed by server");
                self.state().reset(true);
                Dispatch {
                    outbound: Vec::new(),
                    lifecycle: Some(Lifecycle::Disconnected),
                }
            }
            PacketKind::Event | PacketKind::BinaryEvent => self.dispatch_event(packet),
            PacketKind::Ack | PacketKind::BinaryAck => {
                self.dispatch_ack(packet);
                Dispatch::default()
            }
            PacketKind::ConnectError => {
                let listener = {
                    let mut state = self.state();
                    state.reset(false);
                    state.error_listener.clone()
                };
                let data = packet.payload.into_iter().next().unwrap_or_default();
                debug!(namespace = %self.inner.namespace, error = ?data, "Connect error");
                if let Some(listener) = listener {
                    listener(&data);
                }
                Dispatch::default()
            }
        }
    }

    fn on_close(&self) -> Vec<Packet> {
        let mut state = self.state();
        let was_connected = state.connected;
        state.reset(true);
        if was_connected {
            vec![Packet::disconnect(self.inner.namespace.clone())]
        } else {
            Vec::new()
        }
    }

    fn on_disconnect(&self, final_close: bool) {
        self.state().reset(final_close);
    }
}
