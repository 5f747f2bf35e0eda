//! Interactive session.
//!
//! Prints subscribed events as JSON lines on stdout and emits one event
//! per stdin line until interrupted.

use crate::config::Config;
use crate::metrics;
use anyhow::{anyhow, bail, Result};
use serde_json::json;
use sockio_core::{Client, Event, Query, Socket};
use sockio_protocol::Value;
use sockio_transport::{Headers, WebSocketTransport};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// One parsed input line.
#[derive(Debug, Clone, PartialEq)]
pub struct EmitLine {
    pub namespace: String,
    pub event: String,
    pub args: Vec<Value>,
    /// Set by a trailing `?` on the event name.
    pub want_ack: bool,
}

/// Parse `<namespace> <event>[?] [json]`. Blank lines and `#` comments
/// yield `None`. A JSON array is spread into the argument list; any other
/// JSON value becomes the single argument.
pub fn parse_line(line: &str) -> Result<Option<EmitLine>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let (namespace, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    if !namespace.starts_with('/') {
        bail!("namespace must start with '/': {namespace}");
    }

    let rest = rest.trim_start();
    let (event, payload) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    if event.is_empty() {
        bail!("missing event name");
    }
    let (event, want_ack) = match event.strip_suffix('?') {
        Some(name) if !name.is_empty() => (name, true),
        _ => (event, false),
    };

    let payload = payload.trim();
    let args = if payload.is_empty() {
        Vec::new()
    } else {
        let parsed: serde_json::Value =
            serde_json::from_str(payload).map_err(|e| anyhow!("invalid JSON payload: {e}"))?;
        match parsed {
            serde_json::Value::Array(items) => items.into_iter().map(Value::from).collect(),
            other => vec![Value::from(other)],
        }
    };

    Ok(Some(EmitLine {
        namespace: namespace.to_string(),
        event: event.to_string(),
        args,
        want_ack,
    }))
}

/// Render a value for display. Binary payloads are summarized.
pub fn to_json(value: &Value) -> serde_json::Value {
    value.to_json_with(&mut |data| json!({ "binary": data.len() }))
}

fn args_json(args: &[Value]) -> serde_json::Value {
    serde_json::Value::Array(args.iter().map(to_json).collect())
}

fn print_event(event: &mut Event) {
    println!(
        "{}",
        json!({
            "namespace": event.namespace(),
            "event": event.name(),
            "args": args_json(event.args()),
        })
    );
    if event.need_ack() {
        event.ack(Vec::new());
    }
}

fn subscribe(socket: &Socket, events: &[String]) {
    for name in events {
        socket.on(name.clone(), print_event);
    }
    let namespace = socket.namespace().to_string();
    socket.on_error(move |data| {
        warn!(namespace = %namespace, error = %to_json(data), "Namespace connect refused");
    });
}

fn register_listeners(client: &Client, failed: Arc<Notify>) {
    client.on_open(|| info!("Session open"));
    client.on_fail(move || {
        error!("Could not establish a session");
        failed.notify_one();
    });
    client.on_reconnecting(|| info!("Connection lost, reconnecting"));
    client.on_reconnect(|attempt, delay| {
        info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
    });
    client.on_close(|reason| info!(?reason, "Session closed"));
    client.on_socket_open(|namespace| info!(namespace, "Namespace connected"));
    client.on_socket_close(|namespace| info!(namespace, "Namespace disconnected"));
}

fn emit(client: &Client, line: EmitLine) {
    let socket = client.socket(&line.namespace);
    debug!(namespace = %line.namespace, event = %line.event, "Emit");
    if line.want_ack {
        let namespace = line.namespace.clone();
        let event = line.event.clone();
        socket.emit_with_ack(line.event, line.args, move |reply| {
            println!(
                "{}",
                json!({ "namespace": namespace, "ack": event, "args": args_json(&reply) })
            );
        });
    } else {
        socket.emit(line.event, line.args);
    }
}

/// Run the client until ctrl-c, or until it gives up connecting.
///
/// # Errors
///
/// Returns an error if the client cannot be started or never connects.
pub async fn run(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }
    metrics::init_metrics();

    let url = config.client.url.clone();
    let client = Client::with_config(config.client, WebSocketTransport::default())?;
    let failed = Arc::new(Notify::new());
    register_listeners(&client, Arc::clone(&failed));

    for (namespace, events) in &config.subscribe {
        subscribe(&client.socket(namespace), events);
    }

    client.connect(Query::new(), Headers::new());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut outcome = Ok(());

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match parse_line(&line) {
                    Ok(Some(parsed)) => emit(&client, parsed),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Ignoring input line"),
                },
                Ok(None) => {
                    debug!("stdin closed, listening only");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!(error = %e, "stdin read failed, listening only");
                    stdin_open = false;
                }
            },
            _ = failed.notified() => {
                outcome = Err(anyhow!("Could not connect to {url}"));
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    client.shutdown().await?;
    outcome
}
