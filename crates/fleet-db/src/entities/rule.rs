//! Forwarding rule entity

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "rules")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub name: String,

    /// Subject checked against entitlements
    pub owner_id: Option<String>,

    /// Entry agent
    pub agent_id: String,

    pub listen_port: i32,

    pub target_address: String,

    pub target_port: i32,

    #[sea_orm(column_type = "String(StringLen::N(16))")]
    pub protocol: String,

    #[sea_orm(column_type = "String(StringLen::N(16))")]
    pub tunnel_type: String,

    /// JSON array of relay agent ids
    #[sea_orm(column_type = "Text")]
    pub chain_agent_ids: String,

    pub next_hop_agent_id: Option<String>,

    /// JSON array of `{agent_id, weight}`
    #[sea_orm(column_type = "Text")]
    pub exit_agents: String,

    #[sea_orm(column_type = "String(StringLen::N(16))")]
    pub load_balance_strategy: String,

    pub unhealthy_threshold: i32,

    pub healthy_threshold: i32,

    pub enabled: bool,

    /// Cumulative bytes, maintained by the traffic sink
    pub traffic_in: i64,

    pub traffic_out: i64,

    /// Last `rule_sync_status` reported by an agent
    pub sync_status: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub sync_error: Option<String>,

    pub synced_at: Option<ChronoDateTimeUtc>,

    pub created_at: ChronoDateTimeUtc,

    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::agent::Entity",
        from = "Column::AgentId",
        to = "super::agent::Column::Id"
    )]
    Agent,
}

impl Related<super::agent::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Agent.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
