//! Chain hop derivation and rule invariants

use fleet_proto::{ChainRole, ExitAgentInfo, HopEndpoint, LoadBalanceStrategy, RuleSync};
use thiserror::Error;

use crate::model::Rule;

/// Rule validation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("Rule {0} has no entry agent")]
    MissingEntryAgent(i64),

    #[error("Rule {0} sets both a next hop and an exit group")]
    BothExitKinds(i64),

    #[error("Agent {agent_id} appears more than once in rule {rule_id}")]
    DuplicateHop { rule_id: i64, agent_id: String },

    #[error("Rule {0}: weighted exit group needs at least one non-zero weight")]
    NoWeightedExit(i64),

    #[error("Rule {0}: health-check thresholds must be at least 1")]
    InvalidHealthCheck(i64),

    #[error("Rule {0}: listen and target ports must be non-zero")]
    InvalidPort(i64),

    #[error("Rule {rule_id}: next hop {agent_id} is unknown or has no address")]
    UnresolvedHop { rule_id: i64, agent_id: String },
}

/// What an agent forwards to for a given rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextHop {
    /// Last hop: connect to the rule target
    Target,
    Agent(String),
    /// Pick one member of the exit group
    ExitGroup,
}

/// One agent's place in a rule's chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    pub position: u32,
    pub role: ChainRole,
    pub is_last: bool,
    pub next: NextHop,
}

/// Dialable view of a peer agent used when rendering a sync entry
#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    pub endpoint: HopEndpoint,
    pub online: bool,
}

impl Rule {
    /// Check the structural invariants of the rule
    pub fn validate(&self) -> Result<(), ChainError> {
        if self.agent_id.is_empty() {
            return Err(ChainError::MissingEntryAgent(self.id));
        }
        if self.next_hop_agent_id.is_some() && !self.exit_agents.is_empty() {
            return Err(ChainError::BothExitKinds(self.id));
        }
        if self.listen_port == 0 || self.target_port == 0 {
            return Err(ChainError::InvalidPort(self.id));
        }
        if self.health_check.unhealthy_threshold == 0 || self.health_check.healthy_threshold == 0 {
            return Err(ChainError::InvalidHealthCheck(self.id));
        }
        if !self.exit_agents.is_empty()
            && self.load_balance_strategy == LoadBalanceStrategy::Weighted
            && self.exit_agents.iter().all(|e| e.weight == 0)
        {
            return Err(ChainError::NoWeightedExit(self.id));
        }

        let mut seen = std::collections::HashSet::new();
        let all = self
            .linear_path()
            .into_iter()
            .chain(self.exit_agents.iter().map(|e| e.agent_id.as_str()));
        for agent_id in all {
            if !seen.insert(agent_id) {
                return Err(ChainError::DuplicateHop {
                    rule_id: self.id,
                    agent_id: agent_id.to_string(),
                });
            }
        }

        Ok(())
    }

    /// Entry agent, relays, then the single next hop if any
    pub fn linear_path(&self) -> Vec<&str> {
        let mut path = Vec::with_capacity(self.chain_agent_ids.len() + 2);
        path.push(self.agent_id.as_str());
        path.extend(self.chain_agent_ids.iter().map(String::as_str));
        if let Some(next) = &self.next_hop_agent_id {
            path.push(next.as_str());
        }
        path
    }

    /// Number of positions in the chain; an exit group counts as one
    pub fn hop_count(&self) -> usize {
        self.linear_path().len() + usize::from(!self.exit_agents.is_empty())
    }

    /// Every agent the rule touches, entry first
    pub fn referenced_agents(&self) -> Vec<String> {
        self.linear_path()
            .into_iter()
            .map(str::to_string)
            .chain(self.exit_agents.iter().map(|e| e.agent_id.clone()))
            .collect()
    }

    pub fn references(&self, agent_id: &str) -> bool {
        self.hop_for(agent_id).is_some()
    }

    /// Agents that dial `agent_id` directly for this rule
    pub fn predecessors_of(&self, agent_id: &str) -> Vec<String> {
        let path = self.linear_path();
        if self.exit_agents.iter().any(|e| e.agent_id == agent_id) {
            return path.last().map(|p| vec![p.to_string()]).unwrap_or_default();
        }
        match path.iter().position(|p| *p == agent_id) {
            Some(idx) if idx > 0 => vec![path[idx - 1].to_string()],
            _ => Vec::new(),
        }
    }

    /// Where `agent_id` sits in this rule's chain
    pub fn hop_for(&self, agent_id: &str) -> Option<Hop> {
        let path = self.linear_path();
        let total = self.hop_count();
        let has_group = !self.exit_agents.is_empty();

        let position = if let Some(idx) = path.iter().position(|p| *p == agent_id) {
            idx
        } else if self.exit_agents.iter().any(|e| e.agent_id == agent_id) {
            path.len()
        } else {
            return None;
        };

        let is_last = position + 1 == total;
        let role = if total == 1 {
            ChainRole::Independent
        } else if position == 0 {
            ChainRole::FirstHop
        } else if is_last {
            ChainRole::LastHop
        } else {
            ChainRole::Intermediate
        };

        let next = if is_last {
            NextHop::Target
        } else if position + 1 < path.len() {
            NextHop::Agent(path[position + 1].to_string())
        } else if has_group {
            NextHop::ExitGroup
        } else {
            NextHop::Target
        };

        Some(Hop {
            position: position as u32,
            role,
            is_last,
            next,
        })
    }

    /// Render the rule as seen by `agent_id`
    ///
    /// Returns `Ok(None)` when the rule does not reference the agent. Exit group
    /// members that `lookup` cannot resolve are left out of the group.
    pub fn sync_view<F>(&self, agent_id: &str, lookup: F) -> Result<Option<RuleSync>, ChainError>
    where
        F: Fn(&str) -> Option<Peer>,
    {
        let Some(hop) = self.hop_for(agent_id) else {
            return Ok(None);
        };

        let mut next_hop = None;
        let mut exit_agents = Vec::new();
        match &hop.next {
            NextHop::Target => {}
            NextHop::Agent(next_id) => {
                let peer = lookup(next_id).ok_or_else(|| ChainError::UnresolvedHop {
                    rule_id: self.id,
                    agent_id: next_id.clone(),
                })?;
                next_hop = Some(peer.endpoint);
            }
            NextHop::ExitGroup => {
                for member in &self.exit_agents {
                    match lookup(&member.agent_id) {
                        Some(peer) => exit_agents.push(ExitAgentInfo {
                            agent_id: member.agent_id.clone(),
                            weight: member.weight,
                            address: peer.endpoint.address,
                            ws_port: peer.endpoint.ws_port,
                            tls_port: peer.endpoint.tls_port,
                            online: peer.online,
                        }),
                        None => tracing::warn!(
                            rule_id = self.id,
                            exit_agent_id = %member.agent_id,
                            "Exit agent unknown, leaving it out of the exit group"
                        ),
                    }
                }
                if exit_agents.is_empty() {
                    return Err(ChainError::UnresolvedHop {
                        rule_id: self.id,
                        agent_id: self
                            .exit_agents
                            .first()
                            .map(|e| e.agent_id.clone())
                            .unwrap_or_default(),
                    });
                }
            }
        }

        let grouped = !exit_agents.is_empty();
        let chain_agent_ids = if self.hop_count() > 1 {
            let mut ids: Vec<String> = self.linear_path().into_iter().map(str::to_string).collect();
            // Group members occupy the slot after the path
            if hop.position as usize == ids.len() {
                ids.push(agent_id.to_string());
            }
            ids
        } else {
            Vec::new()
        };

        Ok(Some(RuleSync {
            id: self.id,
            name: self.name.clone(),
            listen_port: self.listen_port,
            target_address: self.target_address.clone(),
            target_port: self.target_port,
            protocol: self.protocol,
            tunnel_type: self.tunnel_type,
            chain_role: hop.role,
            chain_position: hop.position,
            is_last_in_chain: hop.is_last,
            chain_agent_ids,
            next_hop,
            exit_agents,
            load_balance_strategy: grouped.then_some(self.load_balance_strategy),
            health_check: grouped.then_some(self.health_check),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ExitAgentRef;

    fn peer(id: &str, online: bool) -> Option<Peer> {
        Some(Peer {
            endpoint: HopEndpoint {
                agent_id: id.to_string(),
                address: format!("{}.example.net", id),
                ws_port: 8080,
                tls_port: 8443,
            },
            online,
        })
    }

    fn chained() -> Rule {
        Rule::direct(1, "entry", 443, "10.0.0.9", 443)
            .with_chain(vec!["relay".to_string()])
            .with_next_hop("exit")
    }

    #[test]
    fn test_independent_rule() {
        let rule = Rule::direct(1, "fa_001", 2222, "10.0.0.5", 22);
        assert!(rule.validate().is_ok());

        let hop = rule.hop_for("fa_001").unwrap();
        assert_eq!(hop.role, ChainRole::Independent);
        assert_eq!(hop.position, 0);
        assert!(hop.is_last);
        assert_eq!(hop.next, NextHop::Target);
        assert!(rule.hop_for("other").is_none());
    }

    #[test]
    fn test_linear_chain_roles() {
        let rule = chained();
        assert_eq!(rule.hop_count(), 3);

        let entry = rule.hop_for("entry").unwrap();
        assert_eq!(entry.role, ChainRole::FirstHop);
        assert_eq!(entry.next, NextHop::Agent("relay".to_string()));

        let relay = rule.hop_for("relay").unwrap();
        assert_eq!(relay.role, ChainRole::Intermediate);
        assert_eq!(relay.position, 1);
        assert!(!relay.is_last);

        let exit = rule.hop_for("exit").unwrap();
        assert_eq!(exit.role, ChainRole::LastHop);
        assert!(exit.is_last);
        assert_eq!(exit.next, NextHop::Target);
    }

    #[test]
    fn test_exit_group_hops() {
        let rule = Rule::direct(2, "entry", 443, "10.0.0.9", 443).with_exit_group(
            vec![ExitAgentRef::new("ex_a", 10), ExitAgentRef::new("ex_b", 0)],
            LoadBalanceStrategy::Failover,
        );
        assert!(rule.validate().is_ok());

        assert_eq!(rule.hop_for("entry").unwrap().next, NextHop::ExitGroup);
        let member = rule.hop_for("ex_b").unwrap();
        assert_eq!(member.position, 1);
        assert_eq!(member.role, ChainRole::LastHop);
        assert_eq!(rule.predecessors_of("ex_a"), vec!["entry".to_string()]);
    }

    #[test]
    fn test_predecessors() {
        let rule = chained();
        assert_eq!(rule.predecessors_of("exit"), vec!["relay".to_string()]);
        assert_eq!(rule.predecessors_of("relay"), vec!["entry".to_string()]);
        assert!(rule.predecessors_of("entry").is_empty());
        assert!(rule.predecessors_of("nobody").is_empty());
    }

    #[test]
    fn test_validate_both_exit_kinds() {
        let mut rule = chained();
        rule.exit_agents = vec![ExitAgentRef::new("ex_a", 1)];
        assert_eq!(rule.validate(), Err(ChainError::BothExitKinds(1)));
    }

    #[test]
    fn test_validate_duplicate_hop() {
        let rule = Rule::direct(3, "a", 1, "t", 1)
            .with_chain(vec!["b".to_string()])
            .with_next_hop("a");
        assert!(matches!(
            rule.validate(),
            Err(ChainError::DuplicateHop { .. })
        ));
    }

    #[test]
    fn test_validate_weighted_all_backups() {
        let rule = Rule::direct(4, "a", 1, "t", 1).with_exit_group(
            vec![ExitAgentRef::new("x", 0), ExitAgentRef::new("y", 0)],
            LoadBalanceStrategy::Weighted,
        );
        assert_eq!(rule.validate(), Err(ChainError::NoWeightedExit(4)));
    }

    #[test]
    fn test_validate_thresholds_and_ports() {
        let mut rule = Rule::direct(5, "a", 1, "t", 1);
        rule.health_check.healthy_threshold = 0;
        assert_eq!(rule.validate(), Err(ChainError::InvalidHealthCheck(5)));

        let rule = Rule::direct(6, "a", 0, "t", 1);
        assert_eq!(rule.validate(), Err(ChainError::InvalidPort(6)));
    }

    #[test]
    fn test_sync_view_positions_match_path() {
        let rule = chained();
        let view = rule
            .sync_view("relay", |id| peer(id, true))
            .unwrap()
            .unwrap();

        assert_eq!(view.chain_agent_ids, vec!["entry", "relay", "exit"]);
        assert_eq!(
            view.chain_agent_ids[view.chain_position as usize],
            "relay".to_string()
        );
        assert!(!view.is_last_in_chain);
        assert_eq!(view.next_hop.unwrap().agent_id, "exit");
        assert!(view.exit_agents.is_empty());
        assert!(view.load_balance_strategy.is_none());
    }

    #[test]
    fn test_sync_view_exit_group() {
        let rule = Rule::direct(7, "entry", 443, "10.0.0.9", 443).with_exit_group(
            vec![
                ExitAgentRef::new("ex_a", 10),
                ExitAgentRef::new("ex_b", 5),
                ExitAgentRef::new("gone", 1),
            ],
            LoadBalanceStrategy::Weighted,
        );

        let view = rule
            .sync_view("entry", |id| match id {
                "gone" => None,
                "ex_b" => peer(id, false),
                _ => peer(id, true),
            })
            .unwrap()
            .unwrap();

        assert!(view.next_hop.is_none());
        assert_eq!(view.exit_agents.len(), 2);
        assert!(view.exit_agents[0].online);
        assert!(!view.exit_agents[1].online);
        assert_eq!(view.load_balance_strategy, Some(LoadBalanceStrategy::Weighted));
        assert_eq!(view.health_check, Some(rule.health_check));
    }

    #[test]
    fn test_sync_view_places_group_member_in_chain() {
        let rule = Rule::direct(8, "entry", 443, "10.0.0.9", 443)
            .with_chain(vec!["relay".to_string()])
            .with_exit_group(
                vec![ExitAgentRef::new("ex_a", 10), ExitAgentRef::new("ex_b", 5)],
                LoadBalanceStrategy::Failover,
            );

        for member in ["ex_a", "ex_b"] {
            let view = rule.sync_view(member, |id| peer(id, true)).unwrap().unwrap();
            assert_eq!(view.chain_agent_ids, vec!["entry", "relay", member]);
            assert_eq!(view.chain_position, 2);
            assert_eq!(view.chain_agent_ids[view.chain_position as usize], member);
            assert!(view.is_last_in_chain);
            assert_eq!(view.chain_role, ChainRole::LastHop);
        }

        // The entry still sees only the linear part and picks from the group
        let entry = rule.sync_view("entry", |id| peer(id, true)).unwrap().unwrap();
        assert_eq!(entry.chain_agent_ids, vec!["entry", "relay"]);
        assert_eq!(entry.chain_position, 0);
    }

    #[test]
    fn test_sync_view_unresolved_next_hop() {
        let rule = chained();
        let err = rule.sync_view("entry", |_| None).unwrap_err();
        assert_eq!(
            err,
            ChainError::UnresolvedHop {
                rule_id: 1,
                agent_id: "relay".to_string()
            }
        );
        assert!(rule.sync_view("stranger", |_| None).unwrap().is_none());
    }
}
