//! `tunnel_health_report` handling
//!
//! Entry agents report the result of each tunnel health check against an exit
//! agent. Reports feed the [`HealthTracker`] using the rule's own thresholds.

use async_trait::async_trait;
use fleet_chain::{HealthTracker, HealthTransition, Rule};
use fleet_db::FleetStore;
use fleet_proto::{message_type, Envelope, ResourceKind, TunnelHealthReport};
use std::sync::Arc;
use tracing::{info, warn};

use crate::handler::{MessageContext, MessageHandler};
use crate::hub::Hub;

pub struct TunnelHealthHandler {
    store: Arc<dyn FleetStore>,
    health: Arc<HealthTracker>,
}

impl TunnelHealthHandler {
    pub fn new(store: Arc<dyn FleetStore>, health: Arc<HealthTracker>) -> Self {
        Self { store, health }
    }

    pub fn attach(self: &Arc<Self>, hub: &Hub) {
        hub.register_handler(message_type::TUNNEL_HEALTH_REPORT, self.clone());
    }

    /// Apply a report from `reporter`; `None` when it was ignored or caused no flip
    pub async fn apply(&self, reporter: &str, report: TunnelHealthReport) -> Option<HealthTransition> {
        let rule = match self.store.get_rule(report.rule_id).await {
            Ok(Some(rule)) => rule,
            Ok(None) => {
                warn!(agent_id = reporter, rule_id = report.rule_id, "Health report for unknown rule, ignoring");
                return None;
            }
            Err(e) => {
                warn!(rule_id = report.rule_id, error = %e, "Cannot load rule for health report");
                return None;
            }
        };

        if !is_exit_of(&rule, &report.exit_agent_id) {
            warn!(
                agent_id = reporter,
                rule_id = rule.id,
                exit_agent_id = %report.exit_agent_id,
                "Health report for an agent that is not an exit of the rule"
            );
            return None;
        }

        let transition = self.health.record(
            rule.id,
            &report.exit_agent_id,
            report.healthy,
            rule.health_check,
            report.error,
            report.latency_ms,
        );
        if transition == Some(HealthTransition::BecameUnhealthy) {
            info!(
                rule_id = rule.id,
                exit_agent_id = %report.exit_agent_id,
                fail_count = report.fail_count.unwrap_or_default(),
                "Exit agent excluded from selection"
            );
        }
        transition
    }
}

fn is_exit_of(rule: &Rule, agent_id: &str) -> bool {
    rule.next_hop_agent_id.as_deref() == Some(agent_id)
        || rule.chain_agent_ids.iter().any(|id| id == agent_id)
        || rule.exit_agents.iter().any(|e| e.agent_id == agent_id)
}

#[async_trait]
impl MessageHandler for TunnelHealthHandler {
    async fn handle(&self, ctx: &MessageContext, envelope: Envelope) {
        if ctx.kind != ResourceKind::Agent {
            return;
        }
        match envelope.parse_data::<TunnelHealthReport>() {
            Ok(report) => {
                self.apply(&ctx.id, report).await;
            }
            Err(e) => warn!(agent_id = %ctx.id, error = %e, "Malformed tunnel health report"),
        }
    }
}
