//! Config sync
//!
//! Pushes each agent the rules that reference it, rendered from that agent's
//! point of view in the chain. A full sync is sent whenever an agent connects;
//! single rule mutations go out as incremental diffs. Every payload carries the
//! agent's config version at send time.
//!
//! Each payload queued to a local connection is recorded as pending and arms a
//! per-agent ack watchdog. A successful `config_ack` at version V retires every
//! pending version up to V. A failed ack, or none before the timeout, triggers
//! a full resync. The first retry goes out at once; consecutive failures space
//! the following ones out along [`ConfigSyncConfig::resync_backoff`], without
//! ever giving up while the agent stays connected.

use async_trait::async_trait;
use dashmap::DashMap;
use fleet_auth::HandshakeTokens;
use fleet_chain::chain::Peer;
use fleet_chain::{Agent, Rule};
use fleet_db::{FleetStore, RuleChange, StoreError};
use fleet_proto::{
    message_type, Command, CommandAction, ConfigAck, ConfigSyncPayload, Envelope, HopEndpoint,
    ProtoError, ResourceKind, RuleSync,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::broker::BusError;
use crate::connection::SendError;
use crate::entitlement::{rule_resource, Entitlements};
use crate::event_bus::EventBus;
use crate::handler::{DeliveryObserver, LifecycleHandler, MessageContext, MessageHandler};
use crate::hub::{command_envelope, Hub};
use crate::reconnect::BackoffConfig;
use crate::task_tracker::TaskTracker;

#[derive(Debug, Clone)]
pub struct ConfigSyncConfig {
    pub ack_timeout: Duration,
    /// Spacing of repeated resyncs to an agent that keeps failing
    pub resync_backoff: BackoffConfig,
    /// Protocols agents must refuse to forward
    pub blocked_protocols: Vec<String>,
}

impl Default for ConfigSyncConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(15),
            resync_backoff: BackoffConfig {
                base: Duration::from_secs(1),
                ceiling: Duration::from_secs(300),
                factor: 2,
            },
            blocked_protocols: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Agent {0} not found")]
    UnknownAgent(String),

    #[error("Agent {0} is offline")]
    Offline(String),

    #[error("Delivery failed: {0}")]
    Send(#[from] SendError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Failed to encode payload: {0}")]
    Encode(#[from] ProtoError),
}

/// Where a payload went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued to a connection on this instance
    Local,
    /// Broadcast for the instance holding the connection
    Relayed,
}

/// How one rule mutation looks to one agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleDiff {
    Added,
    Updated,
    Removed,
}

impl RuleDiff {
    /// `None` when the agent neither had nor gets the rule
    pub fn classify(change: &RuleChange, agent_id: &str) -> Option<Self> {
        let had = change
            .previous
            .as_ref()
            .is_some_and(|r| r.enabled && r.references(agent_id));
        let has = change
            .current
            .as_ref()
            .is_some_and(|r| r.enabled && r.references(agent_id));

        match (had, has) {
            (false, true) => Some(RuleDiff::Added),
            (true, true) => Some(RuleDiff::Updated),
            (true, false) => Some(RuleDiff::Removed),
            (false, false) => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct AgentSyncState {
    acked_version: u64,
    pending: BTreeSet<u64>,
    resync_attempts: u32,
}

pub struct ConfigSyncService {
    config: ConfigSyncConfig,
    store: Arc<dyn FleetStore>,
    hub: Arc<Hub>,
    bus: Option<Arc<EventBus>>,
    tokens: Arc<HandshakeTokens>,
    entitlements: Arc<dyn Entitlements>,
    states: DashMap<String, AgentSyncState>,
    watchdogs: TaskTracker,
    retries: TaskTracker,
    this: Weak<Self>,
}

impl ConfigSyncService {
    pub fn new(
        config: ConfigSyncConfig,
        store: Arc<dyn FleetStore>,
        hub: Arc<Hub>,
        bus: Option<Arc<EventBus>>,
        tokens: Arc<HandshakeTokens>,
        entitlements: Arc<dyn Entitlements>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config,
            store,
            hub,
            bus,
            tokens,
            entitlements,
            states: DashMap::new(),
            watchdogs: TaskTracker::new(),
            retries: TaskTracker::new(),
            this: this.clone(),
        })
    }

    /// Register with the hub: ack handler, lifecycle hooks, delivery tracking
    pub fn attach(self: &Arc<Self>) {
        self.hub
            .register_handler(message_type::CONFIG_ACK, self.clone());
        self.hub.add_lifecycle_handler(self.clone());
        self.hub.add_delivery_observer(self.clone());
    }

    /// Send the agent every enabled rule that references it
    pub async fn full_sync(&self, agent_id: &str) -> Result<Delivery, SyncError> {
        let agent = self
            .store
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| SyncError::UnknownAgent(agent_id.to_string()))?;
        // Version first: content may be newer than the version, never older
        let version = agent.config_version;

        let rules = if agent.enabled {
            self.store.rules_for_agent(agent_id).await?
        } else {
            debug!(agent_id, "Agent disabled, syncing an empty rule set");
            Vec::new()
        };

        let peers = self.peer_index().await?;
        let mut added = Vec::with_capacity(rules.len());
        for rule in &rules {
            if let Some(view) = self.render(rule, agent_id, &peers).await {
                added.push(view);
            }
        }

        let payload = ConfigSyncPayload {
            version,
            full_sync: true,
            added,
            updated: Vec::new(),
            removed: Vec::new(),
            client_token: self.tokens.issue(agent_id),
            blocked_protocols: self.config.blocked_protocols.clone(),
        };
        self.deliver(agent_id, payload).await
    }

    /// Send an incremental diff stamped with `version`
    pub async fn push_diff(
        &self,
        agent_id: &str,
        version: u64,
        added: Vec<RuleSync>,
        updated: Vec<RuleSync>,
        removed: Vec<i64>,
    ) -> Result<Delivery, SyncError> {
        let payload = ConfigSyncPayload {
            version,
            full_sync: false,
            added,
            updated,
            removed,
            client_token: self.tokens.issue(agent_id),
            blocked_protocols: self.config.blocked_protocols.clone(),
        };
        self.deliver(agent_id, payload).await
    }

    /// Push the diffs produced by one committed rule mutation
    ///
    /// Agents that cannot be reached are skipped; they get a full sync when
    /// they connect. A rule that cannot be rendered for an agent falls back to
    /// a full sync for that agent.
    pub async fn apply_rule_change(
        &self,
        change: &RuleChange,
    ) -> Vec<(String, Result<Delivery, SyncError>)> {
        let peers = match self.peer_index().await {
            Ok(peers) => peers,
            Err(e) => {
                warn!(error = %e, "Cannot load agents for rule diff");
                return Vec::new();
            }
        };

        let mut results = Vec::with_capacity(change.versions.len());
        for entry in &change.versions {
            let agent_id = entry.agent_id.as_str();
            let Some(diff) = RuleDiff::classify(change, agent_id) else {
                continue;
            };

            let result = match (diff, &change.current, &change.previous) {
                (RuleDiff::Removed, _, Some(previous)) => {
                    self.push_diff(agent_id, entry.version, Vec::new(), Vec::new(), vec![previous.id])
                        .await
                }
                (diff, Some(current), _) => match self.render(current, agent_id, &peers).await {
                    Some(view) if diff == RuleDiff::Added => {
                        self.push_diff(agent_id, entry.version, vec![view], Vec::new(), Vec::new())
                            .await
                    }
                    Some(view) => {
                        self.push_diff(agent_id, entry.version, Vec::new(), vec![view], Vec::new())
                            .await
                    }
                    None => self.full_sync(agent_id).await,
                },
                _ => self.full_sync(agent_id).await,
            };

            match &result {
                Err(SyncError::Offline(_)) => {
                    debug!(agent_id, "Agent offline, diff deferred to next full sync")
                }
                Err(e) => warn!(agent_id, error = %e, "Failed to push rule diff"),
                Ok(_) => {}
            }
            results.push((entry.agent_id.clone(), result));
        }
        results
    }

    /// Resync every agent that dials `agent_id` after its endpoint changed
    ///
    /// Dependents are derived from the current rule set on every call.
    pub async fn notify_exit_port_change(&self, agent_id: &str) -> Result<Vec<String>, SyncError> {
        let rules = self.store.rules_for_agent(agent_id).await?;
        let dependents: BTreeSet<String> = rules
            .iter()
            .flat_map(|rule| rule.predecessors_of(agent_id))
            .collect();

        info!(
            agent_id,
            dependents = dependents.len(),
            "Agent endpoint changed, resyncing dependents"
        );

        let mut synced = Vec::new();
        for dependent in dependents {
            match self.full_sync(&dependent).await {
                Ok(_) => synced.push(dependent),
                Err(SyncError::Offline(_)) => {
                    debug!(agent_id = %dependent, "Dependent offline, will sync on connect")
                }
                Err(e) => warn!(agent_id = %dependent, error = %e, "Dependent resync failed"),
            }
        }
        Ok(synced)
    }

    /// Highest version the agent has acknowledged
    pub fn acked_version(&self, agent_id: &str) -> u64 {
        self.states
            .get(agent_id)
            .map(|s| s.acked_version)
            .unwrap_or(0)
    }

    /// Versions delivered here and not yet acknowledged
    pub fn pending_versions(&self, agent_id: &str) -> Vec<u64> {
        self.states
            .get(agent_id)
            .map(|s| s.pending.iter().copied().collect())
            .unwrap_or_default()
    }

    async fn deliver(
        &self,
        agent_id: &str,
        payload: ConfigSyncPayload,
    ) -> Result<Delivery, SyncError> {
        let envelope = Envelope::new(message_type::CONFIG_SYNC, agent_id, &payload)?;

        match self.hub.send(ResourceKind::Agent, agent_id, &envelope) {
            Ok(()) => {
                info!(
                    agent_id,
                    version = payload.version,
                    full_sync = payload.full_sync,
                    added = payload.added.len(),
                    updated = payload.updated.len(),
                    removed = payload.removed.len(),
                    "Config sync sent"
                );
                Ok(Delivery::Local)
            }
            Err(SendError::NotConnected { .. }) => self.relay(agent_id, envelope).await,
            Err(e) => Err(e.into()),
        }
    }

    /// Broadcast for whichever instance holds the agent
    ///
    /// Remote presence is not consulted: it may lag, and an instance holding
    /// the agent delivers while the others ignore the message.
    async fn relay(&self, agent_id: &str, envelope: Envelope) -> Result<Delivery, SyncError> {
        let Some(bus) = self.bus.as_ref() else {
            return Err(SyncError::Offline(agent_id.to_string()));
        };

        match bus
            .publish_command(ResourceKind::Agent, agent_id, envelope)
            .await
        {
            Ok(()) => {
                debug!(agent_id, "Config sync relayed to owning instance");
                Ok(Delivery::Relayed)
            }
            Err(BusError::PayloadTooLarge { size, .. }) => {
                // Ask the agent to pull its config instead
                warn!(agent_id, size, "Config sync too large to relay, requesting reload");
                let reload = command_envelope(
                    agent_id,
                    Command::new(CommandAction::ReloadConfig, serde_json::Value::Null),
                )?;
                bus.publish_command(ResourceKind::Agent, agent_id, reload)
                    .await?;
                Ok(Delivery::Relayed)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Rule as seen by `agent_id`, or `None` if it must be left out
    async fn render(
        &self,
        rule: &Rule,
        agent_id: &str,
        peers: &HashMap<String, Agent>,
    ) -> Option<RuleSync> {
        if let Some(owner) = &rule.owner_id {
            if !self
                .entitlements
                .is_entitled(owner, &rule_resource(rule.id))
                .await
            {
                info!(rule_id = rule.id, owner = %owner, "Owner not entitled, rule left out");
                return None;
            }
        }

        let lookup = |peer_id: &str| {
            peers
                .get(peer_id)
                .filter(|a| a.enabled && a.is_dialable())
                .map(|a| Peer {
                    endpoint: HopEndpoint {
                        agent_id: a.id.clone(),
                        address: a.address.clone(),
                        ws_port: a.ws_port,
                        tls_port: a.tls_port,
                    },
                    online: self.is_online(&a.id),
                })
        };

        match rule.sync_view(agent_id, lookup) {
            Ok(view) => view,
            Err(e) => {
                warn!(rule_id = rule.id, agent_id, error = %e, "Rule cannot be rendered, left out");
                None
            }
        }
    }

    async fn peer_index(&self) -> Result<HashMap<String, Agent>, StoreError> {
        Ok(self
            .store
            .list_agents()
            .await?
            .into_iter()
            .map(|a| (a.id.clone(), a))
            .collect())
    }

    fn is_online(&self, agent_id: &str) -> bool {
        match &self.bus {
            Some(bus) => bus.is_online_anywhere(ResourceKind::Agent, agent_id),
            None => self.hub.is_online(ResourceKind::Agent, agent_id),
        }
    }

    fn arm_watchdog(&self, agent_id: &str, version: u64) {
        let this = self.this.clone();
        let timeout = self.config.ack_timeout;
        let id = agent_id.to_string();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            // Detached so re-arming from the resync cannot abort it
            if let Some(service) = this.upgrade() {
                tokio::spawn(async move { service.on_ack_timeout(&id, version).await });
            }
        });
        self.watchdogs.register(agent_id, handle);
    }

    async fn on_ack_timeout(&self, agent_id: &str, version: u64) {
        if self.acked_version(agent_id) >= version {
            return;
        }
        warn!(agent_id, version, "Config ack timed out");
        self.resync(agent_id).await;
    }

    /// Full resync after a failed or missing ack
    async fn resync(&self, agent_id: &str) {
        let attempt = {
            let mut state = self.states.entry(agent_id.to_string()).or_default();
            state.pending.clear();
            state.resync_attempts = state.resync_attempts.saturating_add(1);
            state.resync_attempts
        };
        let delay = resync_delay(&self.config.resync_backoff, attempt);

        if delay.is_zero() {
            self.send_resync(agent_id, attempt).await;
            return;
        }

        if attempt % 10 == 0 {
            error!(agent_id, attempt, "Agent keeps failing config sync");
        }
        let Some(service) = self.this.upgrade() else {
            return;
        };
        debug!(agent_id, attempt, delay_ms = delay.as_millis() as u64, "Resync scheduled");
        let id = agent_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            service.send_resync(&id, attempt).await;
        });
        self.retries.register(agent_id, handle);
    }

    async fn send_resync(&self, agent_id: &str, attempt: u32) {
        if !self.hub.is_online(ResourceKind::Agent, agent_id) {
            debug!(agent_id, "Agent left before resync, next connect syncs it");
            return;
        }
        match self.full_sync(agent_id).await {
            Ok(_) => info!(agent_id, attempt, "Config resync sent"),
            Err(e) => warn!(agent_id, attempt, error = %e, "Config resync failed"),
        }
    }

    /// Failed or missing acks since the last success
    pub fn resync_attempts(&self, agent_id: &str) -> u32 {
        self.states
            .get(agent_id)
            .map(|s| s.resync_attempts)
            .unwrap_or(0)
    }

    fn handle_ack(&self, agent_id: &str, ack: &ConfigAck) -> bool {
        let mut state = self.states.entry(agent_id.to_string()).or_default();
        if !ack.success {
            return false;
        }

        if ack.version > state.acked_version {
            state.acked_version = ack.version;
        }
        state.pending.retain(|v| *v > ack.version);
        state.resync_attempts = 0;
        let settled = state.pending.is_empty();
        drop(state);

        if settled {
            self.watchdogs.cancel(agent_id);
        }
        self.retries.cancel(agent_id);
        info!(agent_id, version = ack.version, "Config acknowledged");
        true
    }
}

/// Delay before resync number `attempt` (1-based) in a failing streak
fn resync_delay(backoff: &BackoffConfig, attempt: u32) -> Duration {
    match attempt {
        0 | 1 => Duration::ZERO,
        n => backoff.delay_for(n - 2),
    }
}

#[async_trait]
impl MessageHandler for ConfigSyncService {
    async fn handle(&self, ctx: &MessageContext, envelope: Envelope) {
        if ctx.kind != ResourceKind::Agent {
            return;
        }

        let ack: ConfigAck = match envelope.parse_data() {
            Ok(ack) => ack,
            Err(e) => {
                warn!(agent_id = %ctx.id, error = %e, "Malformed config ack");
                return;
            }
        };

        if !self.handle_ack(&ctx.id, &ack) {
            warn!(
                agent_id = %ctx.id,
                version = ack.version,
                error = ack.error.as_deref().unwrap_or("unknown"),
                "Agent rejected config"
            );
            self.resync(&ctx.id).await;
        }
    }
}

impl LifecycleHandler for ConfigSyncService {
    fn on_online(&self, kind: ResourceKind, id: &str) {
        if kind != ResourceKind::Agent {
            return;
        }

        if let Some(mut state) = self.states.get_mut(id) {
            state.pending.clear();
            state.resync_attempts = 0;
        }
        self.retries.cancel(id);

        let Some(service) = self.this.upgrade() else {
            return;
        };
        let id = id.to_string();
        tokio::spawn(async move {
            if let Err(e) = service.full_sync(&id).await {
                warn!(agent_id = %id, error = %e, "Initial config sync failed");
            }
        });
    }

    fn on_offline(&self, kind: ResourceKind, id: &str) {
        if kind != ResourceKind::Agent {
            return;
        }
        self.watchdogs.cancel(id);
        self.retries.cancel(id);
        if let Some(mut state) = self.states.get_mut(id) {
            state.pending.clear();
        }
    }
}

impl DeliveryObserver for ConfigSyncService {
    fn on_delivered(&self, kind: ResourceKind, id: &str, envelope: &Envelope) {
        if kind != ResourceKind::Agent || envelope.msg_type != message_type::CONFIG_SYNC {
            return;
        }
        let Some(version) = envelope.data.get("version").and_then(|v| v.as_u64()) else {
            return;
        };

        self.states
            .entry(id.to_string())
            .or_default()
            .pending
            .insert(version);
        self.arm_watchdog(id, version);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_db::store::AgentVersion;

    fn change(previous: Option<Rule>, current: Option<Rule>) -> RuleChange {
        RuleChange {
            previous,
            current,
            versions: vec![AgentVersion {
                agent_id: "entry".to_string(),
                version: 1,
            }],
        }
    }

    #[test]
    fn test_resync_delay_grows_without_limit_on_attempts() {
        let backoff = BackoffConfig {
            base: Duration::from_secs(1),
            ceiling: Duration::from_secs(60),
            factor: 2,
        };
        let delays: Vec<u64> = (1..=9)
            .map(|attempt| resync_delay(&backoff, attempt).as_secs())
            .collect();
        assert_eq!(delays, vec![0, 1, 2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(resync_delay(&backoff, u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_classify() {
        let rule = Rule::direct(1, "entry", 443, "10.0.0.9", 443).with_next_hop("exit");
        let mut disabled = rule.clone();
        disabled.enabled = false;
        let moved = Rule::direct(1, "other", 443, "10.0.0.9", 443).with_next_hop("exit");

        assert_eq!(
            RuleDiff::classify(&change(None, Some(rule.clone())), "entry"),
            Some(RuleDiff::Added)
        );
        assert_eq!(
            RuleDiff::classify(&change(Some(rule.clone()), Some(rule.clone())), "exit"),
            Some(RuleDiff::Updated)
        );
        assert_eq!(
            RuleDiff::classify(&change(Some(rule.clone()), Some(disabled.clone())), "entry"),
            Some(RuleDiff::Removed)
        );
        assert_eq!(
            RuleDiff::classify(&change(Some(rule.clone()), None), "exit"),
            Some(RuleDiff::Removed)
        );
        assert_eq!(
            RuleDiff::classify(&change(Some(rule.clone()), Some(moved)), "entry"),
            Some(RuleDiff::Removed)
        );
        assert_eq!(
            RuleDiff::classify(&change(Some(disabled.clone()), Some(disabled)), "entry"),
            None
        );
    }
}
