//! Cross-instance event bus
//!
//! Makes the hubs of several server instances behave as one:
//!
//! - commands for a resource connected elsewhere are broadcast on the command
//!   topic of its kind; every instance tries local delivery and ignores the
//!   command if the target is not connected there
//! - online/offline transitions are published, in the order the hub reported
//!   them, tagged with the originating instance; each instance drops its own
//!   events when they come back, so local subscribers see every transition
//!   exactly once
//! - every instance re-announces what it holds each `presence_refresh`, and
//!   remote presence not refreshed within `presence_ttl` is forgotten. Presence
//!   feeds displays and outcome labels only; delivery never depends on it
//! - `probe_result` envelopes that land on an instance with no waiting probe
//!   are relayed to the others

use dashmap::DashMap;
use fleet_proto::{
    topics, BusCommand, BusProbeResult, Envelope, ResourceKind, StatusEvent,
};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::broker::{Broker, BrokerMessage, BusError, Subscription};
use crate::connection::SendError;
use crate::handler::{LifecycleHandler, MessageContext};
use crate::hub::Hub;
use crate::reconnect::{Backoff, BackoffConfig};

const TOPICS: [&str; 4] = [
    topics::AGENT_COMMANDS,
    topics::NODE_COMMANDS,
    topics::STATUS_EVENTS,
    topics::PROBE_RESULTS,
];

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Tag stamped on every status event this instance publishes
    pub instance_id: String,
    pub resubscribe: BackoffConfig,
    /// Buffer of the local status event fan-out
    pub local_buffer: usize,
    /// How often locally held resources are re-announced
    pub presence_refresh: Duration,
    /// Age after which an unrefreshed remote presence entry is ignored
    pub presence_ttl: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            resubscribe: BackoffConfig::default(),
            local_buffer: 256,
            presence_refresh: Duration::from_secs(30),
            presence_ttl: Duration::from_secs(90),
        }
    }
}

pub struct EventBus {
    config: BusConfig,
    broker: Arc<dyn Broker>,
    hub: Arc<Hub>,
    local_status: broadcast::Sender<StatusEvent>,
    /// Resources reported online by other instances
    remote_presence: DashMap<(ResourceKind, String), Presence>,
    subscribed: watch::Sender<bool>,
    outbox: mpsc::UnboundedSender<StatusEvent>,
    outbox_rx: Mutex<Option<mpsc::UnboundedReceiver<StatusEvent>>>,
}

#[derive(Debug, Clone)]
struct Presence {
    origin: String,
    seen_at: Instant,
}

impl EventBus {
    pub fn new(config: BusConfig, broker: Arc<dyn Broker>, hub: Arc<Hub>) -> Self {
        let (local_status, _) = broadcast::channel(config.local_buffer.max(1));
        let (subscribed, _) = watch::channel(false);
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        Self {
            config,
            broker,
            hub,
            local_status,
            remote_presence: DashMap::new(),
            subscribed,
            outbox,
            outbox_rx: Mutex::new(Some(outbox_rx)),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    /// Broadcast a command for a resource that is not connected here
    pub async fn publish_command(
        &self,
        kind: ResourceKind,
        target_id: &str,
        envelope: Envelope,
    ) -> Result<(), BusError> {
        let command = BusCommand::Deliver {
            target_id: target_id.to_string(),
            envelope,
        };
        publish_json(self.broker.as_ref(), kind.command_topic(), &command).await
    }

    /// Ask every instance to drop its session for the resource
    pub async fn publish_disconnect(&self, kind: ResourceKind, target_id: &str) -> Result<(), BusError> {
        let command = BusCommand::Disconnect {
            target_id: target_id.to_string(),
        };
        publish_json(self.broker.as_ref(), kind.command_topic(), &command).await
    }

    pub async fn publish_status(&self, event: &StatusEvent) -> Result<(), BusError> {
        publish_json(self.broker.as_ref(), topics::STATUS_EVENTS, event).await
    }

    pub async fn publish_probe_result(
        &self,
        agent_id: &str,
        envelope: Envelope,
    ) -> Result<(), BusError> {
        let relay = BusProbeResult {
            agent_id: agent_id.to_string(),
            envelope,
        };
        publish_json(self.broker.as_ref(), topics::PROBE_RESULTS, &relay).await
    }

    /// Status transitions seen by this instance or relayed from others
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.local_status.subscribe()
    }

    pub fn is_online_remote(&self, kind: ResourceKind, id: &str) -> bool {
        self.remote_presence
            .get(&(kind, id.to_string()))
            .is_some_and(|p| p.seen_at.elapsed() < self.config.presence_ttl)
    }

    /// Connected here or reported online by another instance
    pub fn is_online_anywhere(&self, kind: ResourceKind, id: &str) -> bool {
        self.hub.is_online(kind, id) || self.is_online_remote(kind, id)
    }

    pub fn is_subscribed(&self) -> bool {
        *self.subscribed.borrow()
    }

    /// Resolves once a broker subscription is active
    pub async fn wait_subscribed(&self) {
        let mut rx = self.subscribed.subscribe();
        let _ = rx.wait_for(|subscribed| *subscribed).await;
    }

    /// Subscribe loop; resubscribes with backoff until `cancel` fires
    ///
    /// Also starts the publisher that drains status events in order.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let outbox = self
            .outbox_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match outbox {
            Some(rx) => {
                tokio::spawn(self.clone().publish_loop(rx, cancel.clone()));
            }
            None => warn!("Event bus already running, not starting a second publisher"),
        }

        let mut backoff = Backoff::new(self.config.resubscribe.clone());

        loop {
            match self.broker.subscribe(&TOPICS).await {
                Ok(subscription) => {
                    backoff.reset();
                    self.subscribed.send_replace(true);
                    info!(instance_id = %self.config.instance_id, "Event bus subscribed");
                    // Others may have missed transitions while we were away
                    self.announce_presence();

                    let cancelled = self.consume(subscription, &cancel).await;
                    self.subscribed.send_replace(false);
                    if cancelled {
                        debug!("Event bus stopped");
                        return;
                    }
                    warn!("Event bus subscription lost, resubscribing");
                }
                Err(e) => warn!(error = %e, "Event bus subscribe failed"),
            }

            if !backoff.sleep(&cancel).await {
                debug!("Event bus stopped while resubscribing");
                return;
            }
        }
    }

    /// Returns true when stopped by cancellation, false when the subscription closed
    async fn consume(&self, mut subscription: Subscription, cancel: &CancellationToken) -> bool {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => return true,
                message = subscription.recv() => message,
            };
            match message {
                Some(message) => self.handle_message(message).await,
                None => return false,
            }
        }
    }

    async fn handle_message(&self, message: BrokerMessage) {
        match message.topic.as_str() {
            topics::AGENT_COMMANDS => self.deliver_command(ResourceKind::Agent, &message.payload),
            topics::NODE_COMMANDS => self.deliver_command(ResourceKind::Node, &message.payload),
            topics::STATUS_EVENTS => self.apply_status(&message.payload),
            topics::PROBE_RESULTS => self.relay_probe_result(&message.payload).await,
            other => trace!(topic = other, "Ignoring message on unknown topic"),
        }
    }

    fn deliver_command(&self, kind: ResourceKind, payload: &str) {
        let command: BusCommand = match serde_json::from_str(payload) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "Malformed bus command");
                return;
            }
        };

        match command {
            BusCommand::Deliver { target_id, envelope } => {
                match self.hub.send(kind, &target_id, &envelope) {
                    Ok(()) => debug!(
                        %kind,
                        id = %target_id,
                        msg_type = %envelope.msg_type,
                        "Delivered relayed message"
                    ),
                    Err(SendError::NotConnected { .. }) => {}
                    Err(e) => warn!(%kind, id = %target_id, error = %e, "Relayed delivery failed"),
                }
            }
            BusCommand::Disconnect { target_id } => {
                if self.hub.disconnect(kind, &target_id) {
                    info!(%kind, id = %target_id, "Session dropped on request of another instance");
                }
            }
        }
    }

    fn apply_status(&self, payload: &str) {
        let event: StatusEvent = match serde_json::from_str(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Malformed status event");
                return;
            }
        };

        if event.origin == self.config.instance_id {
            return;
        }

        let key = (event.kind, event.id.clone());
        if event.online {
            self.remote_presence.insert(
                key,
                Presence {
                    origin: event.origin.clone(),
                    seen_at: Instant::now(),
                },
            );
        } else {
            self.remote_presence
                .remove_if(&key, |_, p| p.origin == event.origin);
        }

        if event.refresh {
            trace!(kind = %event.kind, id = %event.id, origin = %event.origin, "Presence refreshed");
            return;
        }

        debug!(
            kind = %event.kind,
            id = %event.id,
            online = event.online,
            origin = %event.origin,
            "Remote status event"
        );
        let _ = self.local_status.send(event);
    }

    async fn relay_probe_result(&self, payload: &str) {
        let relay: BusProbeResult = match serde_json::from_str(payload) {
            Ok(relay) => relay,
            Err(e) => {
                warn!(error = %e, "Malformed relayed probe result");
                return;
            }
        };
        let ctx = MessageContext::relayed(ResourceKind::Agent, relay.agent_id);
        self.hub.dispatch(&ctx, relay.envelope).await;
    }

    fn status_event(&self, kind: ResourceKind, id: &str, online: bool, refresh: bool) -> StatusEvent {
        StatusEvent {
            kind,
            id: id.to_string(),
            online,
            origin: self.config.instance_id.clone(),
            timestamp: chrono::Utc::now().timestamp(),
            refresh,
        }
    }

    fn emit(&self, kind: ResourceKind, id: &str, online: bool) {
        let event = self.status_event(kind, id, online, false);
        let _ = self.local_status.send(event.clone());
        if self.outbox.send(event).is_err() {
            debug!(%kind, id, "Status publisher stopped, event not relayed");
        }
    }

    /// Queue a refresh for every resource held here
    fn announce_presence(&self) {
        for kind in [ResourceKind::Agent, ResourceKind::Node] {
            for id in self.hub.online_ids(kind) {
                let _ = self.outbox.send(self.status_event(kind, &id, true, true));
            }
        }
    }

    /// Publishes queued status events one at a time, preserving hub order
    async fn publish_loop(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<StatusEvent>,
        cancel: CancellationToken,
    ) {
        let mut refresh = tokio::time::interval(self.config.presence_refresh);
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        refresh.tick().await;

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Status publisher stopped");
                    return;
                }
                _ = refresh.tick() => {
                    self.announce_presence();
                    continue;
                }
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };

            if let Err(e) = publish_json(self.broker.as_ref(), topics::STATUS_EVENTS, &event).await {
                warn!(kind = %event.kind, id = %event.id, error = %e, "Failed to publish status event");
            }
        }
    }
}

impl LifecycleHandler for EventBus {
    fn on_online(&self, kind: ResourceKind, id: &str) {
        self.emit(kind, id, true);
    }

    fn on_offline(&self, kind: ResourceKind, id: &str) {
        self.emit(kind, id, false);
    }
}

async fn publish_json<T: Serialize>(
    broker: &dyn Broker,
    topic: &str,
    value: &T,
) -> Result<(), BusError> {
    let payload = serde_json::to_string(value)?;
    broker.publish(topic, payload).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::hub::{command_envelope, HubConfig};
    use crate::transport::channel_pair;
    use fleet_proto::{Command, CommandAction};
    use std::time::Duration;

    struct Instance {
        hub: Arc<Hub>,
        bus: Arc<EventBus>,
    }

    fn config(name: &str) -> BusConfig {
        BusConfig {
            instance_id: name.to_string(),
            resubscribe: BackoffConfig {
                base: Duration::from_millis(10),
                ceiling: Duration::from_millis(50),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn instance(name: &str, broker: Arc<MemoryBroker>, cancel: &CancellationToken) -> Instance {
        instance_with(config(name), broker, cancel).await
    }

    async fn instance_with(config: BusConfig, broker: Arc<MemoryBroker>, cancel: &CancellationToken) -> Instance {
        let hub = Arc::new(Hub::new(HubConfig::default()));
        let bus = Arc::new(EventBus::new(config, broker, hub.clone()));
        hub.add_lifecycle_handler(bus.clone());
        tokio::spawn(bus.clone().run(cancel.clone()));
        bus.wait_subscribed().await;
        Instance { hub, bus }
    }

    #[tokio::test]
    async fn test_command_reaches_other_instance() {
        let broker = Arc::new(MemoryBroker::new());
        let cancel = CancellationToken::new();
        let a = instance("a", broker.clone(), &cancel).await;
        let b = instance("b", broker.clone(), &cancel).await;

        let (sink, source, mut peer) = channel_pair(8);
        b.hub.register(ResourceKind::Agent, "fa_001", None, sink, source);
        assert!(!a.hub.is_online(ResourceKind::Agent, "fa_001"));

        let envelope = command_envelope(
            "fa_001",
            Command::new(CommandAction::RestartRule, serde_json::json!({"rule_id": 1})),
        )
        .unwrap();
        a.bus
            .publish_command(ResourceKind::Agent, "fa_001", envelope)
            .await
            .unwrap();

        let received = peer.recv_envelope().await.unwrap();
        let command: Command = received.parse_data().unwrap();
        assert_eq!(command.action, CommandAction::RestartRule);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_disconnect_reaches_other_instance() {
        let broker = Arc::new(MemoryBroker::new());
        let cancel = CancellationToken::new();
        let a = instance("a", broker.clone(), &cancel).await;
        let b = instance("b", broker.clone(), &cancel).await;

        let (sink, source, mut peer) = channel_pair(8);
        b.hub.register(ResourceKind::Agent, "fa_001", None, sink, source);

        a.bus
            .publish_disconnect(ResourceKind::Agent, "fa_001")
            .await
            .unwrap();

        assert!(tokio::time::timeout(Duration::from_secs(2), peer.recv_envelope())
            .await
            .unwrap()
            .is_none());
        assert!(!b.hub.is_online(ResourceKind::Agent, "fa_001"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_status_events_are_not_duplicated_locally() {
        let broker = Arc::new(MemoryBroker::new());
        let cancel = CancellationToken::new();
        let a = instance("a", broker.clone(), &cancel).await;
        let b = instance("b", broker.clone(), &cancel).await;

        let mut local_a = a.bus.subscribe_status();
        let mut local_b = b.bus.subscribe_status();

        let (sink, source, _peer) = channel_pair(8);
        a.hub.register(ResourceKind::Node, "node_01", None, sink, source);

        let event = local_b.recv().await.unwrap();
        assert_eq!(event.origin, "a");
        assert!(event.online);
        assert!(b.bus.is_online_remote(ResourceKind::Node, "node_01"));
        assert!(b.bus.is_online_anywhere(ResourceKind::Node, "node_01"));
        assert!(!a.bus.is_online_remote(ResourceKind::Node, "node_01"));

        let event = local_a.recv().await.unwrap();
        assert_eq!(event.id, "node_01");
        // The copy that comes back through the broker is dropped
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            local_a.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));

        a.hub.disconnect(ResourceKind::Node, "node_01");
        let event = local_b.recv().await.unwrap();
        assert!(!event.online);
        assert!(!b.bus.is_online_remote(ResourceKind::Node, "node_01"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_resubscribes_after_broker_loss() {
        let broker = Arc::new(MemoryBroker::new());
        let cancel = CancellationToken::new();
        let a = instance("a", broker.clone(), &cancel).await;
        let b = instance("b", broker.clone(), &cancel).await;

        broker.set_offline(true);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!b.bus.is_subscribed());

        broker.set_offline(false);
        b.bus.wait_subscribed().await;
        a.bus.wait_subscribed().await;

        let mut local_b = b.bus.subscribe_status();
        let (sink, source, _peer) = channel_pair(8);
        a.hub.register(ResourceKind::Agent, "fa_002", None, sink, source);

        let event = tokio::time::timeout(Duration::from_secs(2), local_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.id, "fa_002");
        cancel.cancel();
    }

    async fn eventually(what: &str, check: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_late_instance_learns_presence_from_refresh() {
        let broker = Arc::new(MemoryBroker::new());
        let cancel = CancellationToken::new();
        let a = instance_with(
            BusConfig {
                presence_refresh: Duration::from_millis(50),
                ..config("a")
            },
            broker.clone(),
            &cancel,
        )
        .await;

        let (sink, source, _peer) = channel_pair(8);
        a.hub.register(ResourceKind::Agent, "fa_001", None, sink, source);

        // Subscribes after the online transition was published
        let b = instance("b", broker.clone(), &cancel).await;
        let mut local_b = b.bus.subscribe_status();
        eventually("presence on b", || {
            b.bus.is_online_remote(ResourceKind::Agent, "fa_001")
        })
        .await;

        // Refreshes update presence without reaching status subscribers
        assert!(matches!(
            local_b.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_presence_expires_when_refreshes_stop() {
        let broker = Arc::new(MemoryBroker::new());
        let cancel_a = CancellationToken::new();
        let cancel_b = CancellationToken::new();
        let a = instance_with(
            BusConfig {
                presence_refresh: Duration::from_millis(50),
                ..config("a")
            },
            broker.clone(),
            &cancel_a,
        )
        .await;
        let b = instance_with(
            BusConfig {
                presence_ttl: Duration::from_millis(200),
                ..config("b")
            },
            broker.clone(),
            &cancel_b,
        )
        .await;

        let (sink, source, _peer) = channel_pair(8);
        a.hub.register(ResourceKind::Node, "node_01", None, sink, source);
        eventually("presence on b", || {
            b.bus.is_online_remote(ResourceKind::Node, "node_01")
        })
        .await;

        // Instance a dies without saying goodbye
        cancel_a.cancel();
        eventually("presence expired", || {
            !b.bus.is_online_remote(ResourceKind::Node, "node_01")
        })
        .await;
        assert!(!b.bus.is_online_anywhere(ResourceKind::Node, "node_01"));
        cancel_b.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_transitions_arrive_in_order() {
        let broker = Arc::new(MemoryBroker::new());
        let cancel = CancellationToken::new();
        let a = instance("a", broker.clone(), &cancel).await;
        let b = instance("b", broker.clone(), &cancel).await;
        let mut local_b = b.bus.subscribe_status();

        let mut peers = Vec::new();
        for _ in 0..20 {
            let (sink, source, peer) = channel_pair(8);
            a.hub.register(ResourceKind::Agent, "flappy", None, sink, source);
            a.hub.disconnect(ResourceKind::Agent, "flappy");
            peers.push(peer);
        }

        let mut seen = Vec::new();
        while seen.len() < 40 {
            let event = tokio::time::timeout(Duration::from_secs(5), local_b.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push(event.online);
        }
        let expected: Vec<bool> = (0..40).map(|i| i % 2 == 0).collect();
        assert_eq!(seen, expected);
        assert!(!b.bus.is_online_remote(ResourceKind::Agent, "flappy"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_stops_on_cancel() {
        let broker = Arc::new(MemoryBroker::new());
        let cancel = CancellationToken::new();
        let hub = Arc::new(Hub::new(HubConfig::default()));
        let bus = Arc::new(EventBus::new(BusConfig::default(), broker, hub));

        let task = tokio::spawn(bus.clone().run(cancel.clone()));
        bus.wait_subscribed().await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(!bus.is_subscribed());
    }
}
