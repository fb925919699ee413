//! Typed payloads carried in the envelope `data` field

use serde::{Deserialize, Serialize};

/// Actions a server-side `command` can ask an agent to perform
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    ReloadConfig,
    RestartRule,
    StopRule,
    Probe,
    Update,
    ApiUrlChanged,
    ConfigRelocate,
}

impl CommandAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandAction::ReloadConfig => "reload_config",
            CommandAction::RestartRule => "restart_rule",
            CommandAction::StopRule => "stop_rule",
            CommandAction::Probe => "probe",
            CommandAction::Update => "update",
            CommandAction::ApiUrlChanged => "api_url_changed",
            CommandAction::ConfigRelocate => "config_relocate",
        }
    }
}

impl std::fmt::Display for CommandAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `command` payload (server -> agent)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Command {
    pub command_id: String,
    pub action: CommandAction,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Command {
    pub fn new(action: CommandAction, payload: serde_json::Value) -> Self {
        Self {
            command_id: uuid::Uuid::new_v4().to_string(),
            action,
            payload,
        }
    }
}

/// Per-rule traffic counters piggybacked on a status report
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrafficSample {
    pub rule_id: i64,
    #[serde(default)]
    pub bytes_in: u64,
    #[serde(default)]
    pub bytes_out: u64,
}

/// `status` payload (agent/node -> server)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traffic: Vec<TrafficSample>,
}

/// `event` payload (agent -> server)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentEvent {
    #[serde(default)]
    pub level: EventLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    #[default]
    Info,
    Warn,
    Error,
}

/// `config_ack` payload (agent -> server)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigAck {
    pub version: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `rule_sync_status` payload (agent -> server)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleSyncStatus {
    pub rule_id: i64,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `tunnel_health_report` payload (entry agent -> server)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelHealthReport {
    pub rule_id: i64,
    pub exit_agent_id: String,
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default)]
    pub checked_at: i64,
}

/// `probe_task` payload (server -> agent)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeTask {
    pub correlation_id: String,
    pub rule_id: i64,
    pub target_address: String,
    pub target_port: u16,
    /// Exit agent the entry agent would currently pick for this rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_agent_id: Option<String>,
    pub timeout_ms: u64,
}

/// `probe_result` payload (agent -> server)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeResult {
    pub correlation_id: String,
    #[serde(default)]
    pub rule_id: i64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_action_wire_names() {
        let cmd = Command::new(CommandAction::ApiUrlChanged, serde_json::json!({"url": "x"}));
        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(value["action"], "api_url_changed");
        assert!(!cmd.command_id.is_empty());

        let parsed: CommandAction = serde_json::from_str(r#""config_relocate""#).unwrap();
        assert_eq!(parsed, CommandAction::ConfigRelocate);
        assert_eq!(parsed.to_string(), "config_relocate");
    }

    #[test]
    fn test_status_report_with_traffic() {
        let raw = r#"{"address":"10.0.0.2","ws_port":8443,"traffic":[{"rule_id":3,"bytes_in":10,"bytes_out":20}]}"#;
        let report: StatusReport = serde_json::from_str(raw).unwrap();
        assert_eq!(report.address.as_deref(), Some("10.0.0.2"));
        assert_eq!(report.ws_port, Some(8443));
        assert!(report.tls_port.is_none());
        assert_eq!(
            report.traffic,
            vec![TrafficSample {
                rule_id: 3,
                bytes_in: 10,
                bytes_out: 20
            }]
        );
    }

    #[test]
    fn test_empty_status_report() {
        let report: StatusReport = serde_json::from_str("{}").unwrap();
        assert_eq!(report, StatusReport::default());
    }

    #[test]
    fn test_health_report_optional_fields() {
        let raw = r#"{"rule_id":1,"exit_agent_id":"ex_1","healthy":false,"error":"refused","checked_at":1}"#;
        let report: TunnelHealthReport = serde_json::from_str(raw).unwrap();
        assert!(!report.healthy);
        assert_eq!(report.error.as_deref(), Some("refused"));
        assert!(report.fail_count.is_none());
        assert!(report.latency_ms.is_none());
    }

    #[test]
    fn test_event_level_default() {
        let event: AgentEvent = serde_json::from_str(r#"{"message":"started"}"#).unwrap();
        assert_eq!(event.level, EventLevel::Info);
    }
}
