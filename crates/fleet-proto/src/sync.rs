//! Config sync payload (`config_sync`, server -> agent)

use serde::{Deserialize, Serialize};

/// Transport used between two hops of a chain
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TunnelType {
    /// Plaintext WebSocket
    #[default]
    Ws,
    Tls,
    /// Multiplexed WebSocket
    WsMux,
    /// Multiplexed TLS
    TlsMux,
}

impl TunnelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelType::Ws => "ws",
            TunnelType::Tls => "tls",
            TunnelType::WsMux => "ws_mux",
            TunnelType::TlsMux => "tls_mux",
        }
    }

    /// Whether the hop is dialled on the agent's TLS port
    pub fn uses_tls(&self) -> bool {
        matches!(self, TunnelType::Tls | TunnelType::TlsMux)
    }
}

impl std::str::FromStr for TunnelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ws" => Ok(TunnelType::Ws),
            "tls" => Ok(TunnelType::Tls),
            "ws_mux" => Ok(TunnelType::WsMux),
            "tls_mux" => Ok(TunnelType::TlsMux),
            other => Err(format!("unknown tunnel type: {}", other)),
        }
    }
}

/// Forwarded transport protocol
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    /// TCP and UDP on the same port
    TcpUdp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::TcpUdp => "tcp_udp",
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "tcp_udp" => Ok(Protocol::TcpUdp),
            other => Err(format!("unknown protocol: {}", other)),
        }
    }
}

/// Role an agent plays for one rule
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChainRole {
    /// Single-agent rule: listen and forward straight to the target
    Independent,
    /// Entry of a chain: listens on the public port
    FirstHop,
    Intermediate,
    /// Exit of a chain: forwards to the target
    LastHop,
}

/// Exit selection strategy for rules with several exit agents
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    #[default]
    Failover,
    Weighted,
}

impl LoadBalanceStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalanceStrategy::Failover => "failover",
            LoadBalanceStrategy::Weighted => "weighted",
        }
    }
}

impl std::str::FromStr for LoadBalanceStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "failover" => Ok(LoadBalanceStrategy::Failover),
            "weighted" => Ok(LoadBalanceStrategy::Weighted),
            other => Err(format!("unknown load balance strategy: {}", other)),
        }
    }
}

/// Consecutive report thresholds for flipping an exit agent's health
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct HealthCheckPolicy {
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
}

impl Default for HealthCheckPolicy {
    fn default() -> Self {
        Self {
            unhealthy_threshold: 3,
            healthy_threshold: 2,
        }
    }
}

/// Where the next hop of a chain can be dialled
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HopEndpoint {
    pub agent_id: String,
    pub address: String,
    pub ws_port: u16,
    pub tls_port: u16,
}

/// One candidate of an exit group
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExitAgentInfo {
    pub agent_id: String,
    pub weight: u32,
    pub address: String,
    pub ws_port: u16,
    pub tls_port: u16,
    pub online: bool,
}

/// A rule as seen by one agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleSync {
    pub id: i64,
    pub name: String,
    pub listen_port: u16,
    pub target_address: String,
    pub target_port: u16,
    pub protocol: Protocol,
    pub tunnel_type: TunnelType,
    pub chain_role: ChainRole,
    pub chain_position: u32,
    pub is_last_in_chain: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chain_agent_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_hop: Option<HopEndpoint>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exit_agents: Vec<ExitAgentInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balance_strategy: Option<LoadBalanceStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckPolicy>,
}

/// `config_sync` payload
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigSyncPayload {
    pub version: u64,
    pub full_sync: bool,
    #[serde(default)]
    pub added: Vec<RuleSync>,
    #[serde(default)]
    pub updated: Vec<RuleSync>,
    #[serde(default)]
    pub removed: Vec<i64>,
    #[serde(default)]
    pub client_token: String,
    #[serde(default)]
    pub blocked_protocols: Vec<String>,
}
