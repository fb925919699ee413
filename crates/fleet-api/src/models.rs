//! Request and response bodies

use chrono::{DateTime, Utc};
use fleet_chain::{Agent, ExitAgentRef, ExitHealth, Node, Rule};
use fleet_control::{Delivery, ProbeOutcome, UnreachableReason};
use fleet_proto::{HealthCheckPolicy, LoadBalanceStrategy, Protocol, TunnelType};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Error response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Health check response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Identifies this server instance on the event bus
    pub instance_id: String,
    /// Agents and nodes connected to this instance
    pub connections: usize,
    /// Whether the cross-instance bus subscription is active
    pub bus_subscribed: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AgentView {
    pub id: String,
    pub name: String,
    /// entry, exit or boundary
    pub role: String,
    pub address: String,
    pub ws_port: u16,
    pub tls_port: u16,
    pub enabled: bool,
    pub mute_notifications: bool,
    pub config_version: u64,
    /// Last config version the agent acknowledged to this instance
    pub acked_version: u64,
    /// Connected to any instance
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub version: Option<String>,
}

impl AgentView {
    pub fn new(agent: Agent, online: bool, acked_version: u64) -> Self {
        Self {
            role: agent.role.as_str().to_string(),
            id: agent.id,
            name: agent.name,
            address: agent.address,
            ws_port: agent.ws_port,
            tls_port: agent.tls_port,
            enabled: agent.enabled,
            mute_notifications: agent.mute_notifications,
            config_version: agent.config_version,
            acked_version,
            online,
            last_seen: agent.last_seen,
            version: agent.version,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AgentList {
    pub agents: Vec<AgentView>,
    pub total: usize,
}

/// Create or edit an agent
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UpsertAgentRequest {
    pub name: Option<String>,
    /// entry, exit or boundary
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub ws_port: u16,
    #[serde(default)]
    pub tls_port: u16,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub mute_notifications: bool,
}

fn default_role() -> String {
    "entry".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct NodeRequest {
    pub name: Option<String>,
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub mute_notifications: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct NodeView {
    pub id: String,
    pub name: String,
    pub address: String,
    pub enabled: bool,
    pub mute_notifications: bool,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

impl NodeView {
    pub fn new(node: Node, online: bool) -> Self {
        Self {
            id: node.id,
            name: node.name,
            address: node.address,
            enabled: node.enabled,
            mute_notifications: node.mute_notifications,
            online,
            last_seen: node.last_seen,
        }
    }
}

/// Member of a rule's exit group
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ExitAgentBody {
    pub agent_id: String,
    /// 0 marks a backup-only agent
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// Create or replace a forwarding rule
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RuleRequest {
    #[serde(default)]
    pub name: Option<String>,
    pub owner_id: Option<String>,
    /// Entry agent
    pub agent_id: String,
    pub listen_port: u16,
    pub target_address: String,
    pub target_port: u16,
    #[schema(value_type = String, example = "tcp")]
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    #[schema(value_type = String, example = "ws")]
    #[serde(default = "default_tunnel_type")]
    pub tunnel_type: TunnelType,
    #[serde(default)]
    pub chain_agent_ids: Vec<String>,
    pub next_hop_agent_id: Option<String>,
    #[serde(default)]
    pub exit_agents: Vec<ExitAgentBody>,
    #[schema(value_type = String, example = "failover")]
    #[serde(default = "default_strategy")]
    pub load_balance_strategy: LoadBalanceStrategy,
    #[serde(default)]
    pub unhealthy_threshold: Option<u32>,
    #[serde(default)]
    pub healthy_threshold: Option<u32>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_protocol() -> Protocol {
    Protocol::Tcp
}

fn default_tunnel_type() -> TunnelType {
    TunnelType::Ws
}

fn default_strategy() -> LoadBalanceStrategy {
    LoadBalanceStrategy::Failover
}

impl RuleRequest {
    /// Build the rule to store under `id` (0 inserts)
    pub fn into_rule(self, id: i64) -> Rule {
        let defaults = HealthCheckPolicy::default();
        Rule {
            id,
            name: self.name.unwrap_or_else(|| format!("{}:{}", self.agent_id, self.listen_port)),
            owner_id: self.owner_id,
            agent_id: self.agent_id,
            listen_port: self.listen_port,
            target_address: self.target_address,
            target_port: self.target_port,
            protocol: self.protocol,
            tunnel_type: self.tunnel_type,
            chain_agent_ids: self.chain_agent_ids,
            next_hop_agent_id: self.next_hop_agent_id.filter(|id| !id.is_empty()),
            exit_agents: self
                .exit_agents
                .into_iter()
                .map(|e| ExitAgentRef::new(e.agent_id, e.weight))
                .collect(),
            load_balance_strategy: self.load_balance_strategy,
            health_check: HealthCheckPolicy {
                unhealthy_threshold: self
                    .unhealthy_threshold
                    .unwrap_or(defaults.unhealthy_threshold),
                healthy_threshold: self.healthy_threshold.unwrap_or(defaults.healthy_threshold),
            },
            enabled: self.enabled,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RuleView {
    pub id: i64,
    pub name: String,
    pub owner_id: Option<String>,
    pub agent_id: String,
    pub listen_port: u16,
    pub target_address: String,
    pub target_port: u16,
    pub protocol: String,
    pub tunnel_type: String,
    pub chain_agent_ids: Vec<String>,
    pub next_hop_agent_id: Option<String>,
    pub exit_agents: Vec<ExitAgentBody>,
    pub load_balance_strategy: String,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
    pub enabled: bool,
}

impl From<Rule> for RuleView {
    fn from(rule: Rule) -> Self {
        Self {
            id: rule.id,
            name: rule.name,
            owner_id: rule.owner_id,
            agent_id: rule.agent_id,
            listen_port: rule.listen_port,
            target_address: rule.target_address,
            target_port: rule.target_port,
            protocol: rule.protocol.as_str().to_string(),
            tunnel_type: rule.tunnel_type.as_str().to_string(),
            chain_agent_ids: rule.chain_agent_ids,
            next_hop_agent_id: rule.next_hop_agent_id,
            exit_agents: rule
                .exit_agents
                .into_iter()
                .map(|e| ExitAgentBody {
                    agent_id: e.agent_id,
                    weight: e.weight,
                })
                .collect(),
            load_balance_strategy: rule.load_balance_strategy.as_str().to_string(),
            unhealthy_threshold: rule.health_check.unhealthy_threshold,
            healthy_threshold: rule.health_check.healthy_threshold,
            enabled: rule.enabled,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RuleList {
    pub rules: Vec<RuleView>,
    pub total: usize,
}

/// Outcome of pushing a change to one agent
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AgentDelivery {
    pub agent_id: String,
    /// local, relayed, offline or failed
    pub delivery: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentDelivery {
    pub fn delivered(agent_id: String, delivery: Delivery) -> Self {
        Self {
            agent_id,
            delivery: delivery_name(delivery).to_string(),
            error: None,
        }
    }

    pub fn failed(agent_id: String, delivery: &str, error: String) -> Self {
        Self {
            agent_id,
            delivery: delivery.to_string(),
            error: Some(error),
        }
    }
}

pub fn delivery_name(delivery: Delivery) -> &'static str {
    match delivery {
        Delivery::Local => "local",
        Delivery::Relayed => "relayed",
    }
}

/// A committed rule mutation and where its diffs went
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RuleChangeResponse {
    /// The rule after the change; absent on delete
    pub rule: Option<RuleView>,
    pub deliveries: Vec<AgentDelivery>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SyncResponse {
    pub agent_id: String,
    /// local or relayed
    pub delivery: String,
}

/// Result of an on-demand probe
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ProbeResponse {
    pub rule_id: i64,
    /// success, probe_failed or agent_unreachable
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// offline or no_response, for unreachable agents
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ProbeResponse {
    pub fn new(rule_id: i64, outcome: ProbeOutcome) -> Self {
        let mut response = Self {
            rule_id,
            status: String::new(),
            exit_agent_id: None,
            latency_ms: None,
            error: None,
            reason: None,
        };
        match outcome {
            ProbeOutcome::Success {
                exit_agent_id,
                latency_ms,
            } => {
                response.status = "success".to_string();
                response.exit_agent_id = exit_agent_id;
                response.latency_ms = latency_ms;
            }
            ProbeOutcome::ProbeFailed { error, latency_ms } => {
                response.status = "probe_failed".to_string();
                response.error = Some(error);
                response.latency_ms = latency_ms;
            }
            ProbeOutcome::AgentUnreachable { reason } => {
                response.status = "agent_unreachable".to_string();
                response.reason = Some(
                    match reason {
                        UnreachableReason::Offline => "offline",
                        UnreachableReason::NoResponse => "no_response",
                    }
                    .to_string(),
                );
            }
        }
        response
    }
}

/// Health of one exit agent for one rule
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ExitHealthView {
    pub agent_id: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_error: Option<String>,
    pub last_latency_ms: Option<u64>,
    /// Absent until the first report
    pub updated_at: Option<DateTime<Utc>>,
}

impl ExitHealthView {
    pub fn new(agent_id: String, health: Option<ExitHealth>) -> Self {
        match health {
            Some(h) => Self {
                agent_id,
                healthy: h.healthy,
                consecutive_failures: h.consecutive_failures,
                consecutive_successes: h.consecutive_successes,
                last_error: h.last_error,
                last_latency_ms: h.last_latency_ms,
                updated_at: Some(h.updated_at),
            },
            None => Self {
                agent_id,
                healthy: true,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_error: None,
                last_latency_ms: None,
                updated_at: None,
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RuleHealthResponse {
    pub rule_id: i64,
    /// Exit the balancer would pick right now
    pub selected: Option<String>,
    pub exits: Vec<ExitHealthView>,
}

/// Send a command to an agent or node
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CommandRequest {
    /// reload_config, restart_rule, stop_rule, probe, update, api_url_changed, config_relocate
    pub action: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CommandResponse {
    pub command_id: String,
    /// local or relayed
    pub delivery: String,
    /// Whether any instance last saw the target connected
    pub online: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RedeemRequest {
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RedeemResponse {
    /// Agent the token was issued to
    pub agent_id: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AlertView {
    /// agent or node
    pub kind: String,
    pub id: String,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AlertList {
    pub alerts: Vec<AlertView>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_request_defaults() {
        let request: RuleRequest = serde_json::from_value(serde_json::json!({
            "agent_id": "fa_001",
            "listen_port": 8080,
            "target_address": "10.0.0.5",
            "target_port": 80,
            "exit_agents": [{"agent_id": "fx_001"}, {"agent_id": "fx_002", "weight": 0}],
            "unhealthy_threshold": 5
        }))
        .unwrap();

        let rule = request.into_rule(0);
        assert_eq!(rule.name, "fa_001:8080");
        assert_eq!(rule.protocol, Protocol::Tcp);
        assert_eq!(rule.exit_agents[0].weight, 1);
        assert_eq!(rule.exit_agents[1].weight, 0);
        assert_eq!(rule.health_check.unhealthy_threshold, 5);
        assert_eq!(rule.health_check.healthy_threshold, 2);
        assert!(rule.enabled);
    }

    #[test]
    fn test_probe_response_shape() {
        let response = ProbeResponse::new(
            7,
            ProbeOutcome::AgentUnreachable {
                reason: UnreachableReason::NoResponse,
            },
        );
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "agent_unreachable");
        assert_eq!(json["reason"], "no_response");
        assert!(json.get("latency_ms").is_none());
    }
}
