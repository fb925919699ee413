//! Exit agent health with hysteresis
//!
//! Entry agents send a `tunnel_health_report` for every check they run against an
//! exit agent. A healthy exit needs `unhealthy_threshold` consecutive failures
//! before it is excluded, and `healthy_threshold` consecutive successes before it
//! is included again.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fleet_proto::HealthCheckPolicy;
use tracing::{debug, info};

/// Health state of one exit agent for one rule
#[derive(Debug, Clone, PartialEq)]
pub struct ExitHealth {
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_error: Option<String>,
    pub last_latency_ms: Option<u64>,
    pub updated_at: DateTime<Utc>,
}

impl Default for ExitHealth {
    fn default() -> Self {
        Self {
            healthy: true,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_error: None,
            last_latency_ms: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    BecameUnhealthy,
    BecameHealthy,
}

/// Health of every (rule, exit agent) pair seen in reports
#[derive(Debug, Default)]
pub struct HealthTracker {
    states: DashMap<(i64, String), ExitHealth>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one report; returns the transition it caused, if any
    pub fn record(
        &self,
        rule_id: i64,
        exit_agent_id: &str,
        healthy: bool,
        policy: HealthCheckPolicy,
        error: Option<String>,
        latency_ms: Option<u64>,
    ) -> Option<HealthTransition> {
        let mut state = self
            .states
            .entry((rule_id, exit_agent_id.to_string()))
            .or_default();

        state.updated_at = Utc::now();
        state.last_latency_ms = latency_ms;

        if healthy {
            state.consecutive_successes = state.consecutive_successes.saturating_add(1);
            state.consecutive_failures = 0;
            state.last_error = None;
        } else {
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            state.consecutive_successes = 0;
            state.last_error = error;
        }

        let transition = if state.healthy
            && state.consecutive_failures >= policy.unhealthy_threshold.max(1)
        {
            state.healthy = false;
            Some(HealthTransition::BecameUnhealthy)
        } else if !state.healthy
            && state.consecutive_successes >= policy.healthy_threshold.max(1)
        {
            state.healthy = true;
            Some(HealthTransition::BecameHealthy)
        } else {
            None
        };

        match transition {
            Some(t) => info!(
                rule_id,
                exit_agent_id,
                transition = ?t,
                "Exit agent health changed"
            ),
            None => debug!(
                rule_id,
                exit_agent_id,
                failures = state.consecutive_failures,
                successes = state.consecutive_successes,
                "Recorded tunnel health report"
            ),
        }

        transition
    }

    /// Exits with no reports yet are considered healthy
    pub fn is_healthy(&self, rule_id: i64, exit_agent_id: &str) -> bool {
        self.states
            .get(&(rule_id, exit_agent_id.to_string()))
            .map(|s| s.healthy)
            .unwrap_or(true)
    }

    pub fn get(&self, rule_id: i64, exit_agent_id: &str) -> Option<ExitHealth> {
        self.states
            .get(&(rule_id, exit_agent_id.to_string()))
            .map(|s| s.clone())
    }

    /// Drop all state for a deleted rule
    pub fn forget_rule(&self, rule_id: i64) {
        self.states.retain(|(id, _), _| *id != rule_id);
    }
}
