//! Agents, nodes and rules

use chrono::{DateTime, Utc};
use fleet_proto::{HealthCheckPolicy, LoadBalanceStrategy, Protocol, TunnelType};
use serde::{Deserialize, Serialize};

/// Position an agent is deployed for
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    #[default]
    Entry,
    Exit,
    /// Sits at a network boundary and may act as entry, relay or exit
    Boundary,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Entry => "entry",
            AgentRole::Exit => "exit",
            AgentRole::Boundary => "boundary",
        }
    }
}

impl std::str::FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "entry" => Ok(AgentRole::Entry),
            "exit" => Ok(AgentRole::Exit),
            "boundary" => Ok(AgentRole::Boundary),
            other => Err(format!("unknown agent role: {}", other)),
        }
    }
}

/// A forwarding process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub role: AgentRole,
    pub address: String,
    /// Plain WebSocket tunnel port
    pub ws_port: u16,
    pub tls_port: u16,
    pub enabled: bool,
    pub mute_notifications: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub version: Option<String>,
    /// Bumped on every rule mutation affecting this agent
    pub config_version: u64,
}

impl Agent {
    pub fn new(id: impl Into<String>, role: AgentRole) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            role,
            address: String::new(),
            ws_port: 0,
            tls_port: 0,
            enabled: true,
            mute_notifications: false,
            last_seen: None,
            version: None,
            config_version: 0,
        }
    }

    /// Whether the agent advertises anything another hop could dial
    pub fn is_dialable(&self) -> bool {
        !self.address.is_empty() && (self.ws_port != 0 || self.tls_port != 0)
    }
}

/// A relay/origin node; same lifecycle as an agent, separate id space
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub address: String,
    pub enabled: bool,
    pub mute_notifications: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub version: Option<String>,
}

impl Node {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            address: String::new(),
            enabled: true,
            mute_notifications: false,
            last_seen: None,
            version: None,
        }
    }
}

/// Member of an exit group
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ExitAgentRef {
    pub agent_id: String,
    /// 0 marks a backup-only agent
    pub weight: u32,
}

impl ExitAgentRef {
    pub fn new(agent_id: impl Into<String>, weight: u32) -> Self {
        Self {
            agent_id: agent_id.into(),
            weight,
        }
    }
}

/// One forwarding directive
///
/// The forwarding path is `agent_id`, then `chain_agent_ids` in order, then
/// either `next_hop_agent_id` or one member of `exit_agents`. At most one of
/// the two exit fields may be populated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rule {
    pub id: i64,
    pub name: String,
    /// Subject checked against entitlements before the rule is synced
    pub owner_id: Option<String>,
    /// Entry agent
    pub agent_id: String,
    pub listen_port: u16,
    pub target_address: String,
    pub target_port: u16,
    pub protocol: Protocol,
    pub tunnel_type: TunnelType,
    /// Relays between the entry agent and the exit, in order
    pub chain_agent_ids: Vec<String>,
    pub next_hop_agent_id: Option<String>,
    pub exit_agents: Vec<ExitAgentRef>,
    pub load_balance_strategy: LoadBalanceStrategy,
    pub health_check: HealthCheckPolicy,
    pub enabled: bool,
}

impl Rule {
    /// A single-agent rule forwarding `listen_port` to `target`
    pub fn direct(
        id: i64,
        agent_id: impl Into<String>,
        listen_port: u16,
        target_address: impl Into<String>,
        target_port: u16,
    ) -> Self {
        Self {
            id,
            name: format!("rule-{}", id),
            owner_id: None,
            agent_id: agent_id.into(),
            listen_port,
            target_address: target_address.into(),
            target_port,
            protocol: Protocol::Tcp,
            tunnel_type: TunnelType::Ws,
            chain_agent_ids: Vec::new(),
            next_hop_agent_id: None,
            exit_agents: Vec::new(),
            load_balance_strategy: LoadBalanceStrategy::Failover,
            health_check: HealthCheckPolicy::default(),
            enabled: true,
        }
    }

    pub fn with_chain(mut self, chain: Vec<String>) -> Self {
        self.chain_agent_ids = chain;
        self
    }

    pub fn with_next_hop(mut self, agent_id: impl Into<String>) -> Self {
        self.next_hop_agent_id = Some(agent_id.into());
        self
    }

    pub fn with_exit_group(
        mut self,
        exits: Vec<ExitAgentRef>,
        strategy: LoadBalanceStrategy,
    ) -> Self {
        self.exit_agents = exits;
        self.load_balance_strategy = strategy;
        self
    }
}
