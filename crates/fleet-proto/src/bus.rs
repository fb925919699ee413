//! Messages relayed between control-plane instances

use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;

/// Broker topics shared by every instance
pub mod topics {
    pub const AGENT_COMMANDS: &str = "fleet_agent_commands";
    pub const NODE_COMMANDS: &str = "fleet_node_commands";
    pub const STATUS_EVENTS: &str = "fleet_status_events";
    pub const PROBE_RESULTS: &str = "fleet_probe_results";
}

/// Class of connected resource; agents and nodes have independent id spaces
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Agent,
    Node,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Agent => "agent",
            ResourceKind::Node => "node",
        }
    }

    /// Topic carrying commands for this kind of resource
    pub fn command_topic(&self) -> &'static str {
        match self {
            ResourceKind::Agent => topics::AGENT_COMMANDS,
            ResourceKind::Node => topics::NODE_COMMANDS,
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Work for whichever instance holds the target's connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BusCommand {
    /// Queue `envelope` to the target
    Deliver { target_id: String, envelope: Envelope },
    /// Close the target's session
    Disconnect { target_id: String },
}

impl BusCommand {
    pub fn target_id(&self) -> &str {
        match self {
            BusCommand::Deliver { target_id, .. } | BusCommand::Disconnect { target_id } => {
                target_id
            }
        }
    }
}

/// Online/offline transition observed by one instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusEvent {
    pub kind: ResourceKind,
    pub id: String,
    pub online: bool,
    /// Instance that observed the transition
    pub origin: String,
    pub timestamp: i64,
    /// Periodic re-announcement of a resource still online, not a transition
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub refresh: bool,
}

/// `probe_result` that reached an instance other than the one waiting for it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusProbeResult {
    pub agent_id: String,
    pub envelope: Envelope,
}
