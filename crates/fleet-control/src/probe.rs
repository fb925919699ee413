//! On-demand reachability probes
//!
//! A probe sends the rule's entry agent a `probe_task` and waits, bounded by
//! [`ProbeConfig::timeout`], for the `probe_result` with the same correlation
//! id. A probe requested while another one for the same rule is in flight
//! joins the running one and gets the same outcome.
//!
//! The wait runs on its own task, so a caller that gives up early never leaves
//! a stale entry behind.

use async_trait::async_trait;
use dashmap::DashMap;
use fleet_chain::{HealthTracker, LoadBalancer, Rule};
use fleet_db::{FleetStore, StoreError};
use fleet_proto::{message_type, Envelope, ProbeResult, ProbeTask, ResourceKind};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::connection::SendError;
use crate::event_bus::EventBus;
use crate::handler::{MessageContext, MessageHandler};
use crate::hub::Hub;

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// How long to wait for the agent's result
    pub timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Rule {0} not found")]
    RuleNotFound(i64),

    #[error("Rule {0} is disabled")]
    RuleDisabled(i64),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnreachableReason {
    /// Not connected to any instance
    Offline,
    /// Connected, but no result arrived in time
    NoResponse,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Success {
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_agent_id: Option<String>,
        latency_ms: Option<u64>,
    },
    /// The agent ran the probe and the target could not be reached
    ProbeFailed {
        error: String,
        latency_ms: Option<u64>,
    },
    AgentUnreachable { reason: UnreachableReason },
}

impl ProbeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ProbeOutcome::Success { .. })
    }
}

struct Waiter {
    agent_id: String,
    tx: oneshot::Sender<ProbeResult>,
}

type OutcomeRx = watch::Receiver<Option<ProbeOutcome>>;

pub struct ProbeService {
    config: ProbeConfig,
    store: Arc<dyn FleetStore>,
    hub: Arc<Hub>,
    bus: Option<Arc<EventBus>>,
    balancer: Arc<LoadBalancer>,
    health: Arc<HealthTracker>,
    in_flight: Mutex<HashMap<i64, OutcomeRx>>,
    waiters: DashMap<String, Waiter>,
}

impl ProbeService {
    pub fn new(
        config: ProbeConfig,
        store: Arc<dyn FleetStore>,
        hub: Arc<Hub>,
        bus: Option<Arc<EventBus>>,
        balancer: Arc<LoadBalancer>,
        health: Arc<HealthTracker>,
    ) -> Self {
        Self {
            config,
            store,
            hub,
            bus,
            balancer,
            health,
            in_flight: Mutex::new(HashMap::new()),
            waiters: DashMap::new(),
        }
    }

    pub fn attach(self: &Arc<Self>) {
        self.hub
            .register_handler(message_type::PROBE_RESULT, self.clone());
    }

    /// Probe a rule's forwarding path end to end
    pub async fn probe_rule(self: &Arc<Self>, rule_id: i64) -> Result<ProbeOutcome, ProbeError> {
        let rule = self
            .store
            .get_rule(rule_id)
            .await?
            .ok_or(ProbeError::RuleNotFound(rule_id))?;
        if !rule.enabled {
            return Err(ProbeError::RuleDisabled(rule_id));
        }

        let mut rx = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            match in_flight.get(&rule_id) {
                Some(rx) => {
                    debug!(rule_id, "Probe already running, joining it");
                    rx.clone()
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    in_flight.insert(rule_id, rx.clone());
                    tokio::spawn(self.clone().run(rule, tx));
                    rx
                }
            }
        };

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        Ok(outcome.unwrap_or(ProbeOutcome::AgentUnreachable {
            reason: UnreachableReason::NoResponse,
        }))
    }

    /// Rules with a probe currently in flight
    pub fn in_flight(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    async fn run(self: Arc<Self>, rule: Rule, tx: watch::Sender<Option<ProbeOutcome>>) {
        let outcome = self.execute(&rule).await;
        info!(rule_id = rule.id, outcome = ?outcome, "Probe finished");

        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&rule.id);
        let _ = tx.send(Some(outcome));
    }

    async fn execute(&self, rule: &Rule) -> ProbeOutcome {
        let agent_id = rule.agent_id.as_str();
        // Without a bus nothing else can hold the connection
        if self.bus.is_none() && !self.hub.is_online(ResourceKind::Agent, agent_id) {
            return ProbeOutcome::AgentUnreachable {
                reason: UnreachableReason::Offline,
            };
        }

        let exit_agent_id = if rule.exit_agents.is_empty() {
            None
        } else {
            match self.balancer.select(rule, &self.health) {
                Some(exit) => Some(exit),
                None => {
                    return ProbeOutcome::ProbeFailed {
                        error: "no healthy exit agent".to_string(),
                        latency_ms: None,
                    }
                }
            }
        };

        let correlation_id = uuid::Uuid::new_v4().to_string();
        let task = ProbeTask {
            correlation_id: correlation_id.clone(),
            rule_id: rule.id,
            target_address: rule.target_address.clone(),
            target_port: rule.target_port,
            exit_agent_id: exit_agent_id.clone(),
            // Leave the agent room to report before we stop waiting
            timeout_ms: (self.config.timeout.as_millis() as u64) * 4 / 5,
        };
        let envelope = match Envelope::new(message_type::PROBE_TASK, agent_id, &task) {
            Ok(envelope) => envelope,
            Err(e) => {
                return ProbeOutcome::ProbeFailed {
                    error: e.to_string(),
                    latency_ms: None,
                }
            }
        };

        let (result_tx, result_rx) = oneshot::channel();
        self.waiters.insert(
            correlation_id.clone(),
            Waiter {
                agent_id: agent_id.to_string(),
                tx: result_tx,
            },
        );

        if !self.deliver(agent_id, envelope).await {
            self.waiters.remove(&correlation_id);
            return ProbeOutcome::AgentUnreachable {
                reason: UnreachableReason::Offline,
            };
        }
        debug!(rule_id = rule.id, agent_id, %correlation_id, "Probe task sent");

        match tokio::time::timeout(self.config.timeout, result_rx).await {
            Ok(Ok(result)) if result.success => ProbeOutcome::Success {
                exit_agent_id,
                latency_ms: result.latency_ms,
            },
            Ok(Ok(result)) => ProbeOutcome::ProbeFailed {
                error: result.error.unwrap_or_else(|| "probe failed".to_string()),
                latency_ms: result.latency_ms,
            },
            Ok(Err(_)) | Err(_) => {
                self.waiters.remove(&correlation_id);
                // Presence only tells the two kinds of silence apart
                let reason = if self.is_online(agent_id) {
                    UnreachableReason::NoResponse
                } else {
                    UnreachableReason::Offline
                };
                warn!(rule_id = rule.id, agent_id, ?reason, "Probe timed out");
                ProbeOutcome::AgentUnreachable { reason }
            }
        }
    }

    async fn deliver(&self, agent_id: &str, envelope: Envelope) -> bool {
        match self.hub.send(ResourceKind::Agent, agent_id, &envelope) {
            Ok(()) => true,
            Err(SendError::NotConnected { .. }) => {
                // Whichever instance holds the agent delivers it
                let Some(bus) = self.bus.as_ref() else {
                    return false;
                };
                match bus
                    .publish_command(ResourceKind::Agent, agent_id, envelope)
                    .await
                {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(agent_id, error = %e, "Failed to relay probe task");
                        false
                    }
                }
            }
            Err(e) => {
                warn!(agent_id, error = %e, "Failed to send probe task");
                false
            }
        }
    }

    fn is_online(&self, agent_id: &str) -> bool {
        match &self.bus {
            Some(bus) => bus.is_online_anywhere(ResourceKind::Agent, agent_id),
            None => self.hub.is_online(ResourceKind::Agent, agent_id),
        }
    }
}

#[async_trait]
impl MessageHandler for ProbeService {
    async fn handle(&self, ctx: &MessageContext, envelope: Envelope) {
        let result: ProbeResult = match envelope.parse_data() {
            Ok(result) => result,
            Err(e) => {
                warn!(id = %ctx.id, error = %e, "Malformed probe result");
                return;
            }
        };

        if let Some((_, waiter)) = self
            .waiters
            .remove_if(&result.correlation_id, |_, w| w.agent_id == ctx.id)
        {
            let _ = waiter.tx.send(result);
            return;
        }

        if ctx.is_relayed() {
            trace_unknown(&ctx.id, &result);
            return;
        }

        // The probe may have been started on another instance
        match &self.bus {
            Some(bus) => {
                if let Err(e) = bus.publish_probe_result(&ctx.id, envelope).await {
                    warn!(agent_id = %ctx.id, error = %e, "Failed to relay probe result");
                }
            }
            None => trace_unknown(&ctx.id, &result),
        }
    }
}

fn trace_unknown(agent_id: &str, result: &ProbeResult) {
    debug!(
        agent_id,
        correlation_id = %result.correlation_id,
        rule_id = result.rule_id,
        "Probe result with no waiting probe, ignoring"
    );
}
