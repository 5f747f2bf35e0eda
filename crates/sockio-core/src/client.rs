//! The client handle and the task that drives it.
//!
//! [`Client::spawn`] starts one tokio task owning the transport, the timers,
//! the [`Engine`] and the codec. Every public method returns immediately:
//! work is marshaled to the task as a [`Command`], and outcomes come back
//! through listeners.

use dashmap::DashMap;
use sockio_protocol::{FrameKind, Packet, PacketCodec, Value, WireFrame, DEFAULT_NAMESPACE};
use sockio_transport::{
    ConnectionId, EventSink, Headers, Transport, TransportError, TransportEvent, TransportState,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::ClientConfig;
use crate::endpoint::{Endpoint, Query};
use crate::engine::{
    ClientEvent, CloseReason, ConnectionState, Effect, Engine, Input, ReconnectPolicy, TimerKind,
};
use crate::error::ClientError;
use crate::metrics;
use crate::socket::{normalize_namespace, AckCallback, Lifecycle, NamespaceLink, Socket};
use crate::timer::TimerSet;

/// Work marshaled to the client task.
pub(crate) enum Command {
    /// Feed an input to the engine.
    Engine(Input),
    Emit {
        namespace: String,
        name: String,
        args: Vec<Value>,
        ack: Option<AckCallback>,
    },
    SocketCreated(String),
    CloseSocket(String),
    Shutdown,
}

type Callback = Arc<dyn Fn() + Send + Sync>;
type ReconnectCallback = Arc<dyn Fn(u32, Duration) + Send + Sync>;
type CloseCallback = Arc<dyn Fn(CloseReason) + Send + Sync>;
type SocketCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    open: Option<Callback>,
    fail: Option<Callback>,
    reconnecting: Option<Callback>,
    reconnect: Option<ReconnectCallback>,
    close: Option<CloseCallback>,
    socket_open: Option<SocketCallback>,
    socket_close: Option<SocketCallback>,
}

/// State shared between the handle and the task.
struct Shared {
    sockets: DashMap<String, Socket>,
    listeners: Mutex<Listeners>,
}

impl Shared {
    fn listeners(&self) -> MutexGuard<'_, Listeners> {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the registry, so no map guard is held while sockets run
    /// application code.
    fn sockets(&self) -> Vec<Socket> {
        self.sockets.iter().map(|entry| entry.value().clone()).collect()
    }

    fn socket(&self, namespace: &str) -> Option<Socket> {
        self.sockets.get(namespace).map(|entry| entry.value().clone())
    }
}

/// Observable session status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Status {
    pub state: ConnectionState,
    pub session_id: Option<String>,
}

/// Builder for [`Client`].
#[derive(Debug, Clone)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            config: ClientConfig::new(url),
        }
    }

    #[must_use]
    pub fn revision(mut self, revision: sockio_protocol::Revision) -> Self {
        self.config.engine.revision = revision;
        self
    }

    /// Resource path used when the URL has none.
    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.config.engine.path = path.into();
        self
    }

    #[must_use]
    pub fn reconnect_attempts(mut self, attempts: Option<u32>) -> Self {
        self.config.reconnect.attempts = attempts;
        self
    }

    #[must_use]
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect.delay_ms = delay.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn reconnect_delay_max(mut self, delay: Duration) -> Self {
        self.config.reconnect.delay_max_ms = delay.as_millis() as u64;
        self
    }

    /// Query parameter sent with every connection attempt.
    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.query.insert(key.into(), value.into());
        self
    }

    /// Header sent with every connection attempt.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.headers.insert(name.into(), value.into());
        self
    }

    /// Start the client over `transport`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be used.
    pub fn build<T: Transport + 'static>(self, transport: T) -> Result<Client, ClientError> {
        Client::with_config(self.config, transport)
    }

    /// Start the client over a WebSocket transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be used.
    #[cfg(feature = "websocket")]
    pub fn build_websocket(self) -> Result<Client, ClientError> {
        self.build(sockio_transport::WebSocketTransport::default())
    }
}

/// A realtime client session.
///
/// Must be created inside a tokio runtime. Dropping the client shuts its
/// task down.
pub struct Client {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<Status>,
    defaults: (Query, Headers),
    task: Option<JoinHandle<()>>,
}

impl Client {
    /// Start a client for `url` with default settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be used.
    pub fn spawn<T: Transport + 'static>(url: &str, transport: T) -> Result<Self, ClientError> {
        Self::with_config(ClientConfig::new(url), transport)
    }

    #[must_use]
    pub fn builder(url: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(url)
    }

    /// Start a client from a configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration or URL is invalid.
    pub fn with_config<T: Transport + 'static>(
        config: ClientConfig,
        mut transport: T,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let endpoint = Endpoint::parse(&config.url, &config.engine.path)?;
        let policy = ReconnectPolicy::new(
            config.reconnect.attempts,
            config.reconnect.delay(),
            config.reconnect.delay_max(),
        );

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (sink, event_rx) = EventSink::channel();
        let (status_tx, status) = watch::channel(Status::default());
        transport.set_event_sink(sink);

        let shared = Arc::new(Shared {
            sockets: DashMap::new(),
            listeners: Mutex::new(Listeners::default()),
        });

        let revision = config.engine.revision;
        let driver = Driver {
            engine: Engine::new(revision, policy),
            codec: PacketCodec::new(revision),
            transport,
            endpoint,
            timers: TimerSet::new(),
            shared: Arc::clone(&shared),
            commands: commands.clone(),
            status: status_tx,
            current: None,
        };

        info!(url = %config.url, %revision, "Starting client");
        let task = tokio::spawn(driver.run(command_rx, event_rx));

        Ok(Self {
            shared,
            commands,
            status,
            defaults: (config.query, config.headers),
            task: Some(task),
        })
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Client task is gone, command dropped");
        }
    }

    /// Open the session. `query` and `headers` are merged over the
    /// configured defaults. A no-op while connecting or connected.
    pub fn connect(&self, query: Query, headers: Headers) {
        let (mut merged_query, mut merged_headers) = self.defaults.clone();
        merged_query.extend(query);
        merged_headers.extend(headers);
        self.send(Command::Engine(Input::Connect {
            query: merged_query,
            headers: merged_headers,
        }));
    }

    /// Close the session and every namespace.
    pub fn close(&self) {
        self.send(Command::Engine(Input::Close));
    }

    /// Close the session and wait for the client task to finish.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Shutdown`] if the task had already failed.
    pub async fn shutdown(mut self) -> Result<(), ClientError> {
        self.send(Command::Shutdown);
        match self.task.take() {
            Some(task) => task.await.map_err(|_| ClientError::Shutdown),
            None => Ok(()),
        }
    }

    /// The socket for `namespace`, created on first use.
    pub fn socket(&self, namespace: &str) -> Socket {
        let namespace = normalize_namespace(namespace);
        if let Some(socket) = self.shared.socket(&namespace) {
            return socket;
        }
        let mut created = false;
        let socket = self
            .shared
            .sockets
            .entry(namespace.clone())
            .or_insert_with(|| {
                created = true;
                Socket::new(namespace.clone(), self.commands.clone())
            })
            .value()
            .clone();
        if created {
            self.send(Command::SocketCreated(namespace));
        }
        socket
    }

    pub fn set_reconnect_attempts(&self, attempts: Option<u32>) {
        self.send(Command::Engine(Input::SetReconnectAttempts(attempts)));
    }

    pub fn set_reconnect_delay(&self, delay: Duration) {
        self.send(Command::Engine(Input::SetReconnectDelay(delay)));
    }

    pub fn set_reconnect_delay_max(&self, delay: Duration) {
        self.send(Command::Engine(Input::SetReconnectDelayMax(delay)));
    }

    /// Session id from the current handshake.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.status.borrow().session_id.clone()
    }

    /// Whether the session is open.
    #[must_use]
    pub fn opened(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    /// A receiver that observes every status change.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<Status> {
        self.status.clone()
    }

    pub fn on_open<F: Fn() + Send + Sync + 'static>(&self, listener: F) {
        self.shared.listeners().open = Some(Arc::new(listener));
    }

    pub fn on_fail<F: Fn() + Send + Sync + 'static>(&self, listener: F) {
        self.shared.listeners().fail = Some(Arc::new(listener));
    }

    pub fn on_reconnecting<F: Fn() + Send + Sync + 'static>(&self, listener: F) {
        self.shared.listeners().reconnecting = Some(Arc::new(listener));
    }

    /// Called when a reconnect is scheduled, with the number of attempts
    /// already made and the delay before the next one.
    pub fn on_reconnect<F: Fn(u32, Duration) + Send + Sync + 'static>(&self, listener: F) {
        self.shared.listeners().reconnect = Some(Arc::new(listener));
    }

    pub fn on_close<F: Fn(CloseReason) + Send + Sync + 'static>(&self, listener: F) {
        self.shared.listeners().close = Some(Arc::new(listener));
    }

    pub fn on_socket_open<F: Fn(&str) + Send + Sync + 'static>(&self, listener: F) {
        self.shared.listeners().socket_open = Some(Arc::new(listener));
    }

    pub fn on_socket_close<F: Fn(&str) + Send + Sync + 'static>(&self, listener: F) {
        self.shared.listeners().socket_close = Some(Arc::new(listener));
    }

    /// Remove the open, fail, reconnecting, reconnect and close listeners.
    pub fn clear_con_listeners(&self) {
        let mut listeners = self.shared.listeners();
        listeners.open = None;
        listeners.fail = None;
        listeners.reconnecting = None;
        listeners.reconnect = None;
        listeners.close = None;
    }

    pub fn clear_socket_listeners(&self) {
        let mut listeners = self.shared.listeners();
        listeners.socket_open = None;
        listeners.socket_close = None;
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.commands.send(Command::Shutdown).is_err() {
            trace!("Client task already stopped");
        }
    }
}

/// How long shutdown waits for the transport to confirm the close.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// The client task.
struct Driver<T> {
    engine: Engine,
    codec: PacketCodec,
    transport: T,
    endpoint: Endpoint,
    timers: TimerSet<TimerKind>,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Sender<Status>,
    current: Option<ConnectionId>,
}

impl<T: Transport> Driver<T> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<(ConnectionId, TransportEvent)>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.command(command),
                },
                Some((id, event)) = events.recv() => self.transport_event(id, event),
                kind = self.timers.next() => self.handle(Input::TimerFired(kind)),
            }
        }
        self.shutdown(&mut events).await;
    }

    /// Close the session the way `close()` does, wait for the transport to
    /// confirm, then release everything.
    async fn shutdown(
        &mut self,
        events: &mut mpsc::UnboundedReceiver<(ConnectionId, TransportEvent)>,
    ) {
        debug!("Client task shutting down");
        self.handle(Input::Close);

        let drain = async {
            while self.engine.state() != ConnectionState::Closed {
                match events.recv().await {
                    Some((id, event)) => self.transport_event(id, event),
                    None => break,
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("Transport did not confirm the close in time");
        }

        self.timers.cancel_all();
        for socket in self.shared.sockets() {
            socket.on_disconnect(true);
        }
        self.shared.sockets.clear();
        if self.transport.state() != TransportState::Closed {
            if let Err(e) = self.transport.close(crate::engine::REASON_USER) {
                debug!(error = %e, "Transport close on shutdown failed");
            }
        }
        self.current = None;
        metrics::set_connected(false);
        self.status.send_replace(Status::default());
    }

    fn command(&mut self, command: Command) {
        match command {
            Command::Engine(input) => self.handle(input),
            Command::Emit {
                namespace,
                name,
                args,
                ack,
            } => {
                let Some(socket) = self.shared.socket(&namespace) else {
                    debug!(namespace = %namespace, event = %name, "Emit on closed namespace dropped");
                    return;
                };
                if let Some(packet) = socket.prepare_emit(name, args, ack) {
                    self.send(packet);
                }
                self.update_ack_gauge();
            }
            Command::SocketCreated(namespace) => {
                if self.engine.state() != ConnectionState::Open {
                    return;
                }
                if let Some(socket) = self.shared.socket(&namespace) {
                    let dispatch = socket.on_open(self.engine.revision());
                    self.apply_dispatch(&namespace, dispatch.outbound, dispatch.lifecycle);
                }
            }
            Command::CloseSocket(namespace) => {
                if let Some((_, socket)) = self.shared.sockets.remove(&namespace) {
                    self.close_socket(&socket);
                    self.update_ack_gauge();
                }
            }
            Command::Shutdown => {}
        }
    }

    fn transport_event(&mut self, id: ConnectionId, event: TransportEvent) {
        if self.current != Some(id) {
            trace!(connection = %id, "Ignoring event from a stale connection");
            return;
        }
        match event {
            TransportEvent::Opened => self.handle(Input::TransportOpened),
            TransportEvent::Closed { normal } => {
                self.current = None;
                self.handle(Input::TransportClosed { normal });
            }
            TransportEvent::Message(frame) => self.frame(frame),
            TransportEvent::HttpResponse { status, .. } => {
                warn!(connection = %id, status, "Server answered with plain HTTP");
            }
        }
    }

    fn frame(&mut self, frame: WireFrame) {
        metrics::record_frame(frame.len(), "in");
        self.handle(Input::FrameReceived);
        match self.codec.feed(frame) {
            Ok(Some(packet)) if packet.frame == FrameKind::Message => self.route(packet),
            Ok(Some(packet)) => self.handle(Input::Packet(packet)),
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Dropping undecodable frame");
                metrics::record_decode_error();
            }
        }
    }

    fn route(&mut self, packet: Packet) {
        if self.engine.state() != ConnectionState::Open {
            return;
        }
        let namespace = packet.namespace.clone();
        let Some(socket) = self.shared.socket(&namespace) else {
            debug!(namespace = %namespace, kind = ?packet.kind, "Packet for unknown namespace dropped");
            return;
        };
        let dispatch = socket.on_message_packet(packet);
        self.apply_dispatch(&namespace, dispatch.outbound, dispatch.lifecycle);
        self.update_ack_gauge();
    }

    fn apply_dispatch(
        &mut self,
        namespace: &str,
        outbound: Vec<Packet>,
        lifecycle: Option<Lifecycle>,
    ) {
        for packet in outbound {
            self.send(packet);
        }
        match lifecycle {
            Some(Lifecycle::Connected) => {
                let listener = self.shared.listeners().socket_open.clone();
                if let Some(listener) = listener {
                    listener(namespace);
                }
            }
            Some(Lifecycle::Disconnected) => {
                self.shared.sockets.remove(namespace);
                let listener = self.shared.listeners().socket_close.clone();
                if let Some(listener) = listener {
                    listener(namespace);
                }
            }
            None => {}
        }
    }

    fn close_socket(&mut self, socket: &Socket) {
        for packet in socket.on_close() {
            self.send(packet);
        }
        let listener = self.shared.listeners().socket_close.clone();
        if let Some(listener) = listener {
            listener(socket.namespace());
        }
    }

    /// Run an input through the engine, carrying out its effects.
    fn handle(&mut self, input: Input) {
        let mut inputs = VecDeque::from([input]);
        while let Some(input) = inputs.pop_front() {
            for effect in self.engine.handle(input) {
                if let Some(next) = self.apply(effect) {
                    inputs.push_back(next);
                }
            }
        }
        self.publish_status();
    }

    fn apply(&mut self, effect: Effect) -> Option<Input> {
        match effect {
            Effect::OpenTransport { query, headers } => {
                let url = self.endpoint.connection_url(
                    self.engine.revision().number(),
                    self.engine.session_id(),
                    unix_time(),
                    &query,
                );
                debug!(url = %url, transport = self.transport.name(), "Opening transport");
                match self.transport.open(&url, &headers) {
                    Ok(id) => {
                        self.current = Some(id);
                        None
                    }
                    Err(e) => {
                        warn!(error = %e, "Transport open failed");
                        self.current = None;
                        Some(Input::TransportClosed { normal: false })
                    }
                }
            }
            Effect::CloseTransport { reason } => match self.transport.close(reason) {
                Ok(()) => None,
                Err(TransportError::NotConnected) => {
                    debug!(reason, "Transport already closed");
                    self.current = None;
                    Some(Input::TransportClosed { normal: true })
                }
                Err(e) => {
                    warn!(error = %e, "Transport close failed");
                    self.current = None;
                    Some(Input::TransportClosed { normal: false })
                }
            },
            Effect::Send(packet) => {
                self.send(packet);
                None
            }
            Effect::ArmTimer { kind, delay } => {
                self.timers.arm(kind, delay);
                None
            }
            Effect::CancelTimer(kind) => {
                self.timers.cancel(kind);
                None
            }
            Effect::ResetCodec => {
                self.codec.reset();
                None
            }
            Effect::SocketsOpen => {
                self.open_sockets();
                None
            }
            Effect::SocketsDisconnect { final_close } => {
                for socket in self.shared.sockets() {
                    socket.on_disconnect(final_close);
                }
                self.update_ack_gauge();
                None
            }
            Effect::SocketsClose => {
                let sockets = self.shared.sockets();
                self.shared.sockets.clear();
                for socket in &sockets {
                    self.close_socket(socket);
                }
                self.update_ack_gauge();
                None
            }
            Effect::Notify(event) => {
                self.notify(event);
                None
            }
        }
    }

    fn open_sockets(&mut self) {
        if !self.shared.sockets.contains_key(DEFAULT_NAMESPACE) {
            self.shared
                .sockets
                .entry(DEFAULT_NAMESPACE.to_string())
                .or_insert_with(|| Socket::new(DEFAULT_NAMESPACE.to_string(), self.commands.clone()));
        }
        let revision = self.engine.revision();
        for socket in self.shared.sockets() {
            let dispatch = socket.on_open(revision);
            self.apply_dispatch(socket.namespace(), dispatch.outbound, dispatch.lifecycle);
        }
    }

    fn send(&mut self, packet: Packet) {
        if self.transport.state() != TransportState::Open {
            debug!(frame = ?packet.frame, "Transport not open, packet dropped");
            return;
        }
        let frames = match self.codec.encode(&packet) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(error = %e, "Failed to encode packet");
                return;
            }
        };
        for frame in frames {
            metrics::record_frame(frame.len(), "out");
            if let Err(e) = self.transport.write(frame) {
                warn!(error = %e, "Write failed");
                return;
            }
        }
    }

    fn notify(&mut self, event: ClientEvent) {
        let listeners = self.shared.listeners();
        match event {
            ClientEvent::Open => {
                let listener = listeners.open.clone();
                drop(listeners);
                if let Some(listener) = listener {
                    listener();
                }
            }
            ClientEvent::Fail => {
                let listener = listeners.fail.clone();
                drop(listeners);
                if let Some(listener) = listener {
                    listener();
                }
            }
            ClientEvent::Reconnecting => {
                metrics::record_reconnect();
                let listener = listeners.reconnecting.clone();
                drop(listeners);
                if let Some(listener) = listener {
                    listener();
                }
            }
            ClientEvent::Reconnect { attempt, delay } => {
                let listener = listeners.reconnect.clone();
                drop(listeners);
                if let Some(listener) = listener {
                    listener(attempt, delay);
                }
            }
            ClientEvent::Close(reason) => {
                let listener = listeners.close.clone();
                drop(listeners);
                if let Some(listener) = listener {
                    listener(reason);
                }
            }
        }
    }

    fn update_ack_gauge(&self) {
        let pending = self
            .shared
            .sockets
            .iter()
            .map(|entry| entry.value().pending_acks())
            .sum();
        metrics::set_acks_pending(pending);
    }

    fn publish_status(&self) {
        let status = Status {
            state: self.engine.state(),
            session_id: self.engine.session_id().map(str::to_string),
        };
        metrics::set_connected(status.state == ConnectionState::Open);
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}
