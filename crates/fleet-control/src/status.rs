//! Handlers for agent self-reports: `status`, `event`, `rule_sync_status`

use async_trait::async_trait;
use fleet_db::{FleetStore, StoreError};
use fleet_proto::{
    message_type, AgentEvent, Envelope, EventLevel, ResourceKind, RuleSyncStatus, StatusReport,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config_sync::ConfigSyncService;
use crate::handler::{MessageContext, MessageHandler};
use crate::hub::Hub;
use crate::traffic::TrafficBuffer;

pub struct StatusHandler {
    store: Arc<dyn FleetStore>,
    traffic: Arc<TrafficBuffer>,
    sync: Arc<ConfigSyncService>,
}

impl StatusHandler {
    pub fn new(
        store: Arc<dyn FleetStore>,
        traffic: Arc<TrafficBuffer>,
        sync: Arc<ConfigSyncService>,
    ) -> Self {
        Self {
            store,
            traffic,
            sync,
        }
    }

    pub fn attach(self: &Arc<Self>, hub: &Hub) {
        hub.register_handler(message_type::STATUS, self.clone());
        hub.register_handler(message_type::EVENT, self.clone());
        hub.register_handler(message_type::RULE_SYNC_STATUS, self.clone());
    }

    async fn on_status(&self, ctx: &MessageContext, envelope: &Envelope) {
        let report: StatusReport = match envelope.parse_data() {
            Ok(report) => report,
            Err(e) => {
                warn!(kind = %ctx.kind, id = %ctx.id, error = %e, "Malformed status report");
                return;
            }
        };

        if ctx.kind == ResourceKind::Node {
            if let Err(e) = self.store.touch_node(&ctx.id).await {
                warn!(node_id = %ctx.id, error = %e, "Failed to record node status");
            }
            return;
        }

        if !report.traffic.is_empty() {
            self.record_traffic(&ctx.id, &report).await;
        }

        match self.store.record_agent_report(&ctx.id, &report).await {
            Ok(result) if result.endpoint_changed => {
                info!(
                    agent_id = %ctx.id,
                    address = %result.agent.address,
                    ws_port = result.agent.ws_port,
                    tls_port = result.agent.tls_port,
                    "Agent endpoint changed"
                );
                let sync = self.sync.clone();
                let agent_id = ctx.id.clone();
                tokio::spawn(async move {
                    if let Err(e) = sync.notify_exit_port_change(&agent_id).await {
                        warn!(%agent_id, error = %e, "Failed to resync dependents");
                    }
                });
            }
            Ok(_) => debug!(agent_id = %ctx.id, "Status recorded"),
            Err(StoreError::NotFound { .. }) => {
                warn!(agent_id = %ctx.id, "Status from unknown agent, ignoring")
            }
            Err(e) => warn!(agent_id = %ctx.id, error = %e, "Failed to record status"),
        }
    }

    /// Ids of the enabled rules the agent takes part in
    async fn rules_of(&self, agent_id: &str) -> Option<HashSet<i64>> {
        match self.store.rules_for_agent(agent_id).await {
            Ok(rules) => Some(rules.into_iter().map(|r| r.id).collect()),
            Err(e) => {
                warn!(%agent_id, error = %e, "Failed to load rules for agent report");
                None
            }
        }
    }

    async fn record_traffic(&self, agent_id: &str, report: &StatusReport) {
        let Some(owned) = self.rules_of(agent_id).await else {
            return;
        };
        for sample in &report.traffic {
            if owned.contains(&sample.rule_id) {
                self.traffic
                    .record(sample.rule_id, sample.bytes_in, sample.bytes_out);
            } else {
                warn!(%agent_id, rule_id = sample.rule_id, "Traffic for a rule the agent does not serve, ignoring");
            }
        }
    }

    fn on_event(&self, ctx: &MessageContext, envelope: &Envelope) {
        let event: AgentEvent = match envelope.parse_data() {
            Ok(event) => event,
            Err(e) => {
                warn!(id = %ctx.id, error = %e, "Malformed agent event");
                return;
            }
        };

        let rule_id = event.rule_id.unwrap_or_default();
        match event.level {
            EventLevel::Info => info!(id = %ctx.id, rule_id, "Agent event: {}", event.message),
            EventLevel::Warn => warn!(id = %ctx.id, rule_id, "Agent event: {}", event.message),
            EventLevel::Error => error!(id = %ctx.id, rule_id, "Agent event: {}", event.message),
        }
    }

    async fn on_rule_sync_status(&self, ctx: &MessageContext, envelope: &Envelope) {
        let report: RuleSyncStatus = match envelope.parse_data() {
            Ok(report) => report,
            Err(e) => {
                warn!(id = %ctx.id, error = %e, "Malformed rule sync status");
                return;
            }
        };

        let serves = self
            .rules_of(&ctx.id)
            .await
            .is_some_and(|owned| owned.contains(&report.rule_id));
        if !serves {
            warn!(
                agent_id = %ctx.id,
                rule_id = report.rule_id,
                "Sync status for a rule the agent does not serve, ignoring"
            );
            return;
        }

        match self
            .store
            .record_rule_sync_status(report.rule_id, &report.status, report.error.as_deref())
            .await
        {
            Ok(true) => debug!(
                agent_id = %ctx.id,
                rule_id = report.rule_id,
                status = %report.status,
                "Rule sync status recorded"
            ),
            Ok(false) => warn!(
                agent_id = %ctx.id,
                rule_id = report.rule_id,
                "Sync status for unknown rule, ignoring"
            ),
            Err(e) => warn!(rule_id = report.rule_id, error = %e, "Failed to record rule sync status"),
        }
    }
}

#[async_trait]
impl MessageHandler for StatusHandler {
    async fn handle(&self, ctx: &MessageContext, envelope: Envelope) {
        match envelope.msg_type.as_str() {
            message_type::STATUS => self.on_status(ctx, &envelope).await,
            message_type::EVENT => self.on_event(ctx, &envelope),
            message_type::RULE_SYNC_STATUS => self.on_rule_sync_status(ctx, &envelope).await,
            other => debug!(msg_type = other, "Unexpected message for status handler"),
        }
    }
}
