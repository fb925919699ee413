//! Repository for agents, nodes and rules

use async_trait::async_trait;
use chrono::Utc;
use fleet_chain::{Agent, AgentRole, ExitAgentRef, Node, Rule};
use fleet_proto::{HealthCheckPolicy, StatusReport};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    IntoActiveModel, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::entities::{agent, node, rule};
use crate::{StoreError, StoreResult};

/// Result of writing an agent's self-report or an admin edit
#[derive(Debug, Clone, PartialEq)]
pub struct AgentReport {
    pub agent: Agent,
    /// Address or one of the tunnel ports differs from the stored value
    pub endpoint_changed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentVersion {
    pub agent_id: String,
    pub version: u64,
}

/// A committed rule mutation
///
/// `versions` lists every agent referenced by the old or the new rule together
/// with its config version after the bump.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleChange {
    pub previous: Option<Rule>,
    pub current: Option<Rule>,
    pub versions: Vec<AgentVersion>,
}

impl RuleChange {
    pub fn version_for(&self, agent_id: &str) -> Option<u64> {
        self.versions
            .iter()
            .find(|v| v.agent_id == agent_id)
            .map(|v| v.version)
    }
}

#[async_trait]
pub trait FleetStore: Send + Sync {
    async fn get_agent(&self, id: &str) -> StoreResult<Option<Agent>>;

    async fn list_agents(&self) -> StoreResult<Vec<Agent>>;

    /// Create or edit an agent; an existing agent keeps its config version
    async fn upsert_agent(&self, agent: &Agent) -> StoreResult<AgentReport>;

    /// Apply the optional fields of a `status` report and refresh `last_seen`
    async fn record_agent_report(&self, id: &str, report: &StatusReport)
        -> StoreResult<AgentReport>;

    async fn touch_agent(&self, id: &str) -> StoreResult<()>;

    async fn get_node(&self, id: &str) -> StoreResult<Option<Node>>;

    async fn upsert_node(&self, node: &Node) -> StoreResult<Node>;

    async fn touch_node(&self, id: &str) -> StoreResult<()>;

    async fn get_rule(&self, id: i64) -> StoreResult<Option<Rule>>;

    async fn list_rules(&self) -> StoreResult<Vec<Rule>>;

    /// Insert (`rule.id == 0`) or update a rule and bump affected config versions
    async fn save_rule(&self, rule: Rule) -> StoreResult<RuleChange>;

    async fn delete_rule(&self, id: i64) -> StoreResult<RuleChange>;

    /// Enabled rules that reference `agent_id` at any hop
    async fn rules_for_agent(&self, agent_id: &str) -> StoreResult<Vec<Rule>>;

    async fn config_version(&self, agent_id: &str) -> StoreResult<u64>;

    /// Store a `rule_sync_status` report; returns false for unknown rules
    async fn record_rule_sync_status(
        &self,
        rule_id: i64,
        status: &str,
        error: Option<&str>,
    ) -> StoreResult<bool>;
}

/// [`FleetStore`] backed by SeaORM
#[derive(Clone)]
pub struct SeaOrmStore {
    db: DatabaseConnection,
}

impl SeaOrmStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    async fn enabled_rules(&self) -> StoreResult<Vec<Rule>> {
        rule::Entity::find()
            .filter(rule::Column::Enabled.eq(true))
            .order_by_asc(rule::Column::Id)
            .all(&self.db)
            .await?
            .into_iter()
            .map(rule_from_model)
            .collect()
    }
}

#[async_trait]
impl FleetStore for SeaOrmStore {
    async fn get_agent(&self, id: &str) -> StoreResult<Option<Agent>> {
        agent::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .map(agent_from_model)
            .transpose()
    }

    async fn list_agents(&self) -> StoreResult<Vec<Agent>> {
        agent::Entity::find()
            .order_by_asc(agent::Column::Id)
            .all(&self.db)
            .await?
            .into_iter()
            .map(agent_from_model)
            .collect()
    }

    async fn upsert_agent(&self, input: &Agent) -> StoreResult<AgentReport> {
        let existing = agent::Entity::find_by_id(input.id.as_str())
            .one(&self.db)
            .await?;

        let (model, endpoint_changed) = match existing {
            Some(model) => {
                let changed = model.address != input.address
                    || model.ws_port != i32::from(input.ws_port)
                    || model.tls_port != i32::from(input.tls_port);
                let mut active = model.into_active_model();
                active.name = Set(input.name.clone());
                active.role = Set(input.role.as_str().to_string());
                active.address = Set(input.address.clone());
                active.ws_port = Set(i32::from(input.ws_port));
                active.tls_port = Set(i32::from(input.tls_port));
                active.enabled = Set(input.enabled);
                active.mute_notifications = Set(input.mute_notifications);
                (active.update(&self.db).await?, changed)
            }
            None => {
                let active = agent::ActiveModel {
                    id: Set(input.id.clone()),
                    name: Set(input.name.clone()),
                    role: Set(input.role.as_str().to_string()),
                    address: Set(input.address.clone()),
                    ws_port: Set(i32::from(input.ws_port)),
                    tls_port: Set(i32::from(input.tls_port)),
                    enabled: Set(input.enabled),
                    mute_notifications: Set(input.mute_notifications),
                    last_seen: Set(input.last_seen),
                    version: Set(input.version.clone()),
                    config_version: Set(to_db_version(input.config_version)),
                    created_at: Set(Utc::now()),
                };
                info!(agent_id = %input.id, role = input.role.as_str(), "Agent created");
                (active.insert(&self.db).await?, false)
            }
        };

        Ok(AgentReport {
            agent: agent_from_model(model)?,
            endpoint_changed,
        })
    }

    async fn record_agent_report(
        &self,
        id: &str,
        report: &StatusReport,
    ) -> StoreResult<AgentReport> {
        let model = agent::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                kind: "agent",
                id: id.to_string(),
            })?;

        let mut endpoint_changed = false;
        let mut active = model.clone().into_active_model();

        if let Some(address) = report.address.as_ref().filter(|a| **a != model.address) {
            active.address = Set(address.clone());
            endpoint_changed = true;
        }
        if let Some(port) = report.ws_port.map(i32::from).filter(|p| *p != model.ws_port) {
            active.ws_port = Set(port);
            endpoint_changed = true;
        }
        if let Some(port) = report.tls_port.map(i32::from).filter(|p| *p != model.tls_port) {
            active.tls_port = Set(port);
            endpoint_changed = true;
        }
        if report.version.is_some() {
            active.version = Set(report.version.clone());
        }
        active.last_seen = Set(Some(Utc::now()));

        let model = active.update(&self.db).await?;
        if endpoint_changed {
            info!(
                agent_id = %id,
                address = %model.address,
                ws_port = model.ws_port,
                tls_port = model.tls_port,
                "Agent endpoint changed"
            );
        }

        Ok(AgentReport {
            agent: agent_from_model(model)?,
            endpoint_changed,
        })
    }

    async fn touch_agent(&self, id: &str) -> StoreResult<()> {
        agent::Entity::update_many()
            .col_expr(
                agent::Column::LastSeen,
                sea_orm::sea_query::Expr::value(Utc::now()),
            )
            .filter(agent::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn get_node(&self, id: &str) -> StoreResult<Option<Node>> {
        Ok(node::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .map(node_from_model))
    }

    async fn upsert_node(&self, input: &Node) -> StoreResult<Node> {
        let existing = node::Entity::find_by_id(input.id.as_str())
            .one(&self.db)
            .await?;

        let model = match existing {
            Some(model) => {
                let mut active = model.into_active_model();
                active.name = Set(input.name.clone());
                active.address = Set(input.address.clone());
                active.enabled = Set(input.enabled);
                active.mute_notifications = Set(input.mute_notifications);
                active.update(&self.db).await?
            }
            None => {
                node::ActiveModel {
                    id: Set(input.id.clone()),
                    name: Set(input.name.clone()),
                    address: Set(input.address.clone()),
                    enabled: Set(input.enabled),
                    mute_notifications: Set(input.mute_notifications),
                    last_seen: Set(input.last_seen),
                    version: Set(input.version.clone()),
                    created_at: Set(Utc::now()),
                }
                .insert(&self.db)
                .await?
            }
        };

        Ok(node_from_model(model))
    }

    async fn touch_node(&self, id: &str) -> StoreResult<()> {
        node::Entity::update_many()
            .col_expr(
                node::Column::LastSeen,
                sea_orm::sea_query::Expr::value(Utc::now()),
            )
            .filter(node::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn get_rule(&self, id: i64) -> StoreResult<Option<Rule>> {
        rule::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .map(rule_from_model)
            .transpose()
    }

    async fn list_rules(&self) -> StoreResult<Vec<Rule>> {
        rule::Entity::find()
            .order_by_asc(rule::Column::Id)
            .all(&self.db)
            .await?
            .into_iter()
            .map(rule_from_model)
            .collect()
    }

    async fn save_rule(&self, input: Rule) -> StoreResult<RuleChange> {
        input.validate()?;

        let txn = self.db.begin().await?;

        for agent_id in input.referenced_agents() {
            if agent::Entity::find_by_id(agent_id.as_str())
                .one(&txn)
                .await?
                .is_none()
            {
                return Err(StoreError::UnknownAgent {
                    rule_id: input.id,
                    agent_id,
                });
            }
        }

        let chain_agent_ids = encode_json("chain_agent_ids", &input.chain_agent_ids)?;
        let exit_agents = encode_json("exit_agents", &input.exit_agents)?;
        let now = Utc::now();

        let (previous, model) = if input.id == 0 {
            let active = rule::ActiveModel {
                name: Set(input.name.clone()),
                owner_id: Set(input.owner_id.clone()),
                agent_id: Set(input.agent_id.clone()),
                listen_port: Set(i32::from(input.listen_port)),
                target_address: Set(input.target_address.clone()),
                target_port: Set(i32::from(input.target_port)),
                protocol: Set(input.protocol.as_str().to_string()),
                tunnel_type: Set(input.tunnel_type.as_str().to_string()),
                chain_agent_ids: Set(chain_agent_ids),
                next_hop_agent_id: Set(input.next_hop_agent_id.clone()),
                exit_agents: Set(exit_agents),
                load_balance_strategy: Set(input.load_balance_strategy.as_str().to_string()),
                unhealthy_threshold: Set(threshold(input.health_check.unhealthy_threshold)),
                healthy_threshold: Set(threshold(input.health_check.healthy_threshold)),
                enabled: Set(input.enabled),
                traffic_in: Set(0),
                traffic_out: Set(0),
                sync_status: Set(None),
                sync_error: Set(None),
                synced_at: Set(None),
                created_at: Set(now),
                updated_at: Set(now),
                ..Default::default()
            };
            (None, active.insert(&txn).await?)
        } else {
            let existing = rule::Entity::find_by_id(input.id)
                .one(&txn)
                .await?
                .ok_or_else(|| StoreError::NotFound {
                    kind: "rule",
                    id: input.id.to_string(),
                })?;
            let previous = rule_from_model(existing.clone())?;

            let mut active = existing.into_active_model();
            active.name = Set(input.name.clone());
            active.owner_id = Set(input.owner_id.clone());
            active.agent_id = Set(input.agent_id.clone());
            active.listen_port = Set(i32::from(input.listen_port));
            active.target_address = Set(input.target_address.clone());
            active.target_port = Set(i32::from(input.target_port));
            active.protocol = Set(input.protocol.as_str().to_string());
            active.tunnel_type = Set(input.tunnel_type.as_str().to_string());
            active.chain_agent_ids = Set(chain_agent_ids);
            active.next_hop_agent_id = Set(input.next_hop_agent_id.clone());
            active.exit_agents = Set(exit_agents);
            active.load_balance_strategy = Set(input.load_balance_strategy.as_str().to_string());
            active.unhealthy_threshold = Set(threshold(input.health_check.unhealthy_threshold));
            active.healthy_threshold = Set(threshold(input.health_check.healthy_threshold));
            active.enabled = Set(input.enabled);
            active.updated_at = Set(now);
            (Some(previous), active.update(&txn).await?)
        };

        let current = rule_from_model(model)?;
        let versions = bump_versions(&txn, previous.as_ref(), Some(&current)).await?;
        txn.commit().await?;

        info!(
            rule_id = current.id,
            created = previous.is_none(),
            enabled = current.enabled,
            agents = versions.len(),
            "Rule saved"
        );

        Ok(RuleChange {
            previous,
            current: Some(current),
            versions,
        })
    }

    async fn delete_rule(&self, id: i64) -> StoreResult<RuleChange> {
        let txn = self.db.begin().await?;

        let existing = rule::Entity::find_by_id(id)
            .one(&txn)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                kind: "rule",
                id: id.to_string(),
            })?;
        let previous = rule_from_model(existing)?;

        rule::Entity::delete_by_id(id).exec(&txn).await?;
        let versions = bump_versions(&txn, Some(&previous), None).await?;
        txn.commit().await?;

        info!(rule_id = id, agents = versions.len(), "Rule deleted");

        Ok(RuleChange {
            previous: Some(previous),
            current: None,
            versions,
        })
    }

    // Chain membership lives in JSON columns, so filtering happens here
    async fn rules_for_agent(&self, agent_id: &str) -> StoreResult<Vec<Rule>> {
        Ok(self
            .enabled_rules()
            .await?
            .into_iter()
            .filter(|r| r.references(agent_id))
            .collect())
    }

    async fn config_version(&self, agent_id: &str) -> StoreResult<u64> {
        agent::Entity::find_by_id(agent_id)
            .one(&self.db)
            .await?
            .map(|a| from_db_version(a.config_version))
            .ok_or_else(|| StoreError::NotFound {
                kind: "agent",
                id: agent_id.to_string(),
            })
    }

    async fn record_rule_sync_status(
        &self,
        rule_id: i64,
        status: &str,
        error: Option<&str>,
    ) -> StoreResult<bool> {
        let Some(model) = rule::Entity::find_by_id(rule_id).one(&self.db).await? else {
            return Ok(false);
        };

        let mut active = model.into_active_model();
        active.sync_status = Set(Some(status.to_string()));
        active.sync_error = Set(error.map(str::to_string));
        active.synced_at = Set(Some(Utc::now()));
        active.update(&self.db).await?;

        debug!(rule_id, status, "Recorded rule sync status");
        Ok(true)
    }
}

/// Increment the config version of every agent either rule references
async fn bump_versions<C: ConnectionTrait>(
    conn: &C,
    previous: Option<&Rule>,
    current: Option<&Rule>,
) -> StoreResult<Vec<AgentVersion>> {
    let agents: BTreeSet<String> = previous
        .into_iter()
        .chain(current)
        .flat_map(Rule::referenced_agents)
        .collect();

    if agents.is_empty() {
        return Ok(Vec::new());
    }

    // Increment in SQL so concurrent writers never reuse a version
    agent::Entity::update_many()
        .col_expr(
            agent::Column::ConfigVersion,
            Expr::col(agent::Column::ConfigVersion).add(1),
        )
        .filter(agent::Column::Id.is_in(agents.iter().map(String::as_str)))
        .exec(conn)
        .await?;

    // A previous rule may name an agent that was removed since
    let versions = agent::Entity::find()
        .filter(agent::Column::Id.is_in(agents.iter().map(String::as_str)))
        .order_by_asc(agent::Column::Id)
        .all(conn)
        .await?
        .into_iter()
        .map(|model| AgentVersion {
            agent_id: model.id,
            version: from_db_version(model.config_version),
        })
        .collect();
    Ok(versions)
}

fn agent_from_model(model: agent::Model) -> StoreResult<Agent> {
    Ok(Agent {
        role: model
            .role
            .parse::<AgentRole>()
            .map_err(|reason| StoreError::Corrupt {
                column: "agents.role",
                reason,
            })?,
        ws_port: port("agents.ws_port", model.ws_port)?,
        tls_port: port("agents.tls_port", model.tls_port)?,
        id: model.id,
        name: model.name,
        address: model.address,
        enabled: model.enabled,
        mute_notifications: model.mute_notifications,
        last_seen: model.last_seen,
        version: model.version,
        config_version: from_db_version(model.config_version),
    })
}

fn node_from_model(model: node::Model) -> Node {
    Node {
        id: model.id,
        name: model.name,
        address: model.address,
        enabled: model.enabled,
        mute_notifications: model.mute_notifications,
        last_seen: model.last_seen,
        version: model.version,
    }
}

fn rule_from_model(model: rule::Model) -> StoreResult<Rule> {
    let corrupt = |column: &'static str| move |reason: String| StoreError::Corrupt { column, reason };

    let chain_agent_ids: Vec<String> = serde_json::from_str(&model.chain_agent_ids)
        .map_err(|e| StoreError::Corrupt {
            column: "rules.chain_agent_ids",
            reason: e.to_string(),
        })?;
    let exit_agents: Vec<ExitAgentRef> =
        serde_json::from_str(&model.exit_agents).map_err(|e| StoreError::Corrupt {
            column: "rules.exit_agents",
            reason: e.to_string(),
        })?;

    Ok(Rule {
        id: model.id,
        listen_port: port("rules.listen_port", model.listen_port)?,
        target_port: port("rules.target_port", model.target_port)?,
        protocol: model.protocol.parse().map_err(corrupt("rules.protocol"))?,
        tunnel_type: model
            .tunnel_type
            .parse()
            .map_err(corrupt("rules.tunnel_type"))?,
        load_balance_strategy: model
            .load_balance_strategy
            .parse()
            .map_err(corrupt("rules.load_balance_strategy"))?,
        health_check: HealthCheckPolicy {
            unhealthy_threshold: u32::try_from(model.unhealthy_threshold).unwrap_or(1),
            healthy_threshold: u32::try_from(model.healthy_threshold).unwrap_or(1),
        },
        name: model.name,
        owner_id: model.owner_id,
        agent_id: model.agent_id,
        target_address: model.target_address,
        chain_agent_ids,
        next_hop_agent_id: model.next_hop_agent_id,
        exit_agents,
        enabled: model.enabled,
    })
}

fn encode_json<T: serde::Serialize>(column: &'static str, value: &T) -> StoreResult<String> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt {
        column,
        reason: e.to_string(),
    })
}

fn port(column: &'static str, value: i32) -> StoreResult<u16> {
    u16::try_from(value).map_err(|_| StoreError::Corrupt {
        column,
        reason: format!("{} is not a port", value),
    })
}

fn threshold(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_db_version(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

fn from_db_version(version: i64) -> u64 {
    u64::try_from(version).unwrap_or(0)
}
