//! Exit selection for rules with an exit group
//!
//! `failover` walks the group in descending weight order and takes the first
//! healthy agent; weight 0 members are only used when every weighted member is
//! unhealthy. `weighted` spreads selections over healthy members in proportion
//! to their weight (smooth weighted round robin), with the same backup rule.

use dashmap::DashMap;
use fleet_proto::LoadBalanceStrategy;
use std::collections::HashMap;

use crate::health::HealthTracker;
use crate::model::{ExitAgentRef, Rule};

/// Picks an exit agent per connection
#[derive(Debug, Default)]
pub struct LoadBalancer {
    /// rule id -> agent id -> current smooth-WRR weight
    weighted_state: DashMap<i64, HashMap<String, i64>>,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Choose the exit for the next connection of `rule`
    ///
    /// Returns `None` when the rule has no exit group or no member is healthy.
    pub fn select(&self, rule: &Rule, health: &HealthTracker) -> Option<String> {
        if rule.exit_agents.is_empty() {
            return None;
        }

        let healthy: Vec<&ExitAgentRef> = rule
            .exit_agents
            .iter()
            .filter(|e| health.is_healthy(rule.id, &e.agent_id))
            .collect();

        let (primary, backups): (Vec<&ExitAgentRef>, Vec<&ExitAgentRef>) =
            healthy.into_iter().partition(|e| e.weight > 0);

        if primary.is_empty() {
            return backups.first().map(|e| e.agent_id.clone());
        }

        match rule.load_balance_strategy {
            LoadBalanceStrategy::Failover => select_failover(&primary),
            LoadBalanceStrategy::Weighted => Some(self.select_weighted(rule.id, &primary)),
        }
    }

    fn select_weighted(&self, rule_id: i64, candidates: &[&ExitAgentRef]) -> String {
        let mut state = self.weighted_state.entry(rule_id).or_default();
        state.retain(|id, _| candidates.iter().any(|c| &c.agent_id == id));

        let total: i64 = candidates.iter().map(|c| i64::from(c.weight)).sum();
        let mut best: Option<(&str, i64)> = None;

        for candidate in candidates {
            let current = state.entry(candidate.agent_id.clone()).or_insert(0);
            *current += i64::from(candidate.weight);
            if best.map(|(_, w)| *current > w).unwrap_or(true) {
                best = Some((candidate.agent_id.as_str(), *current));
            }
        }

        // candidates is non-empty, so best is set
        let chosen = best.map(|(id, _)| id.to_string()).unwrap_or_default();
        if let Some(current) = state.get_mut(&chosen) {
            *current -= total;
        }
        chosen
    }

    pub fn forget_rule(&self, rule_id: i64) {
        self.weighted_state.remove(&rule_id);
    }
}

/// Highest weight wins; ties keep configuration order
fn select_failover(candidates: &[&ExitAgentRef]) -> Option<String> {
    let mut ordered: Vec<&&ExitAgentRef> = candidates.iter().collect();
    ordered.sort_by(|a, b| b.weight.cmp(&a.weight));
    ordered.first().map(|e| e.agent_id.clone())
}
