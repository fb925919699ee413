//! Connection hub
//!
//! Owns the connection registry and is the only writer to a [`Connection`].
//! Each registered connection gets a read loop (inbound frames dispatched to
//! [`MessageHandler`]s by envelope type) and a write loop (draining the bounded
//! outbound queue). A maintenance task pings every connection and unregisters
//! the ones that stay silent past the liveness timeout.

use fleet_proto::{message_type, Command, CommandAction, Envelope, ResourceKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::connection::{Connection, SendError};
use crate::handler::{DeliveryObserver, LifecycleHandler, MessageContext, MessageHandler};
use crate::registry::ConnectionRegistry;
use crate::transport::{Frame, FrameSink, FrameSource};

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Silence after which a connection is considered dead
    pub liveness_timeout: Duration,
    /// How often connections are checked against `liveness_timeout`
    pub sweep_interval: Duration,
    pub ping_interval: Duration,
    /// Outbound frames buffered per connection before it is closed
    pub queue_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            liveness_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(1),
            ping_interval: Duration::from_secs(3),
            queue_capacity: 256,
        }
    }
}

pub struct Hub {
    config: HubConfig,
    registry: ConnectionRegistry,
    handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
    lifecycle: RwLock<Vec<Arc<dyn LifecycleHandler>>>,
    observers: RwLock<Vec<Arc<dyn DeliveryObserver>>>,
    next_uid: AtomicU64,
    shutdown: CancellationToken,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            registry: ConnectionRegistry::new(),
            handlers: RwLock::new(HashMap::new()),
            lifecycle: RwLock::new(Vec::new()),
            observers: RwLock::new(Vec::new()),
            next_uid: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Route envelopes of `msg_type` to `handler`, replacing any previous one
    pub fn register_handler(&self, msg_type: &str, handler: Arc<dyn MessageHandler>) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        if handlers.insert(msg_type.to_string(), handler).is_some() {
            warn!(msg_type, "Replaced existing message handler");
        }
    }

    pub fn add_lifecycle_handler(&self, handler: Arc<dyn LifecycleHandler>) {
        self.lifecycle
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
    }

    pub fn add_delivery_observer(&self, observer: Arc<dyn DeliveryObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    /// Take ownership of an authenticated transport
    ///
    /// A live connection for the same resource is closed first; it goes away
    /// without an offline callback. Exactly one online callback fires.
    pub fn register<S, R>(
        self: &Arc<Self>,
        kind: ResourceKind,
        id: &str,
        remote_addr: Option<String>,
        sink: S,
        source: R,
    ) -> Arc<Connection>
    where
        S: FrameSink,
        R: FrameSource,
    {
        let conn_uid = self.next_uid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let conn = Arc::new(Connection::new(
            kind,
            id.to_string(),
            conn_uid,
            remote_addr,
            tx,
            self.shutdown.child_token(),
        ));

        if let Some(old) = self.registry.register_or_replace(conn.clone()) {
            old.close();
        }

        // Online before the loops exist, so an immediate close cannot overtake it
        for handler in self.lifecycle_handlers() {
            handler.on_online(kind, id);
        }

        tokio::spawn(write_loop(self.clone(), conn.clone(), sink, rx));
        tokio::spawn(read_loop(self.clone(), conn.clone(), source));

        conn
    }

    /// Remove connection `conn_uid` if it is still the current one
    ///
    /// Idempotent; returns whether this call removed it.
    pub fn unregister(&self, kind: ResourceKind, id: &str, conn_uid: u64) -> bool {
        let Some(conn) = self.registry.remove_if_current(kind, id, conn_uid) else {
            return false;
        };
        conn.close();

        if self.shutdown.is_cancelled() {
            debug!(%kind, id, conn_uid, "Connection closed during shutdown");
            return true;
        }

        info!(%kind, id, conn_uid, "Connection unregistered");
        for handler in self.lifecycle_handlers() {
            handler.on_offline(kind, id);
        }
        true
    }

    /// Drop the current session of a resource (admin action)
    pub fn disconnect(&self, kind: ResourceKind, id: &str) -> bool {
        match self.registry.get(kind, id) {
            Some(conn) => self.unregister(kind, id, conn.conn_uid),
            None => false,
        }
    }

    /// Route an inbound envelope to the handler for its type
    pub async fn dispatch(&self, ctx: &MessageContext, envelope: Envelope) {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(envelope.msg_type.as_str())
            .cloned();

        match handler {
            Some(handler) => handler.handle(ctx, envelope).await,
            None if envelope.msg_type == message_type::HEARTBEAT => {
                trace!(kind = %ctx.kind, id = %ctx.id, "Heartbeat");
            }
            None => {
                warn!(
                    kind = %ctx.kind,
                    id = %ctx.id,
                    msg_type = %envelope.msg_type,
                    "No handler for message type, dropping"
                );
            }
        }
    }

    /// Queue an envelope to a locally connected resource
    ///
    /// A full queue closes the connection.
    pub fn send(&self, kind: ResourceKind, id: &str, envelope: &Envelope) -> Result<(), SendError> {
        let conn = self
            .registry
            .get(kind, id)
            .ok_or_else(|| SendError::NotConnected {
                kind,
                id: id.to_string(),
            })?;

        let text = envelope
            .encode()
            .map_err(|e| SendError::Encode(e.to_string()))?;

        match conn.try_send(Frame::Text(text)) {
            Ok(()) => {
                trace!(%kind, id, msg_type = %envelope.msg_type, "Queued message");
                for observer in self.delivery_observers() {
                    observer.on_delivered(kind, id, envelope);
                }
                Ok(())
            }
            Err(e @ SendError::QueueFull { .. }) => {
                warn!(%kind, id, conn_uid = conn.conn_uid, "Outbound queue full, closing connection");
                self.unregister(kind, id, conn.conn_uid);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Send a `command`; returns whether the resource is connected here
    pub fn send_command(
        &self,
        kind: ResourceKind,
        id: &str,
        action: CommandAction,
        payload: serde_json::Value,
    ) -> bool {
        let envelope = match command_envelope(id, Command::new(action, payload)) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(%kind, id, %action, error = %e, "Failed to build command");
                return false;
            }
        };
        self.send(kind, id, &envelope).is_ok()
    }

    pub fn is_online(&self, kind: ResourceKind, id: &str) -> bool {
        self.registry.contains(kind, id)
    }

    pub fn online_ids(&self, kind: ResourceKind) -> Vec<String> {
        self.registry.ids(kind)
    }

    pub fn connection(&self, kind: ResourceKind, id: &str) -> Option<Arc<Connection>> {
        self.registry.get(kind, id)
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Ping every connection and sweep the silent ones until shutdown
    pub async fn run_maintenance(self: Arc<Self>) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        let mut ping = tokio::time::interval(self.config.ping_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("Hub maintenance stopped");
                    return;
                }
                _ = sweep.tick() => self.sweep_idle(),
                _ = ping.tick() => self.ping_all(),
            }
        }
    }

    fn sweep_idle(&self) {
        for conn in self.registry.all() {
            let idle = conn.idle_for();
            if idle > self.config.liveness_timeout {
                warn!(
                    kind = %conn.kind,
                    id = %conn.id,
                    conn_uid = conn.conn_uid,
                    idle_ms = idle.as_millis() as u64,
                    "Liveness timeout, dropping connection"
                );
                self.unregister(conn.kind, &conn.id, conn.conn_uid);
            }
        }
    }

    fn ping_all(&self) {
        for conn in self.registry.all() {
            if let Err(SendError::QueueFull { .. }) = conn.try_send(Frame::Ping(Vec::new())) {
                warn!(kind = %conn.kind, id = %conn.id, "Outbound queue full on ping, closing connection");
                self.unregister(conn.kind, &conn.id, conn.conn_uid);
            }
        }
    }

    /// Close every connection and stop background loops
    ///
    /// Lifecycle callbacks are not fired for connections closed this way.
    pub fn shutdown(&self) {
        info!(connections = self.registry.len(), "Hub shutting down");
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn lifecycle_handlers(&self) -> Vec<Arc<dyn LifecycleHandler>> {
        self.lifecycle
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn delivery_observers(&self) -> Vec<Arc<dyn DeliveryObserver>> {
        self.observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Wrap a command in an envelope addressed to `id`
pub fn command_envelope(id: &str, command: Command) -> Result<Envelope, SendError> {
    Envelope::new(message_type::COMMAND, id, &command).map_err(|e| SendError::Encode(e.to_string()))
}

async fn read_loop<R: FrameSource>(hub: Arc<Hub>, conn: Arc<Connection>, mut source: R) {
    let cancel = conn.cancel_token().clone();
    let ctx = MessageContext::local(conn.kind, conn.id.clone(), conn.conn_uid);

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = source.recv() => frame,
        };

        match frame {
            Ok(Some(Frame::Text(text))) => {
                conn.touch();
                match Envelope::decode(&text) {
                    Ok(envelope) => hub.dispatch(&ctx, envelope).await,
                    Err(e) => warn!(
                        kind = %conn.kind,
                        id = %conn.id,
                        error = %e,
                        "Dropping malformed message"
                    ),
                }
            }
            Ok(Some(Frame::Ping(payload))) => {
                conn.touch();
                let _ = conn.try_send(Frame::Pong(payload));
            }
            Ok(Some(Frame::Pong(_))) => conn.touch(),
            Ok(Some(Frame::Close)) | Ok(None) => {
                debug!(kind = %conn.kind, id = %conn.id, "Connection closed by peer");
                break;
            }
            Err(e) => {
                warn!(kind = %conn.kind, id = %conn.id, error = %e, "Read failed");
                break;
            }
        }
    }

    hub.unregister(conn.kind, &conn.id, conn.conn_uid);
}

async fn write_loop<S: FrameSink>(
    hub: Arc<Hub>,
    conn: Arc<Connection>,
    mut sink: S,
    mut rx: mpsc::Receiver<Frame>,
) {
    let cancel = conn.cancel_token().clone();

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        if let Err(e) = sink.send(frame).await {
            warn!(kind = %conn.kind, id = %conn.id, error = %e, "Write failed");
            break;
        }
    }

    let _ = sink.close().await;
    hub.unregister(conn.kind, &conn.id, conn.conn_uid);
}
