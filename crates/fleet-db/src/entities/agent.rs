//! Agent entity

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "agents")]
pub struct Model {
    /// Stable external id (e.g. `fa_001`)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    pub name: String,

    /// entry, exit or boundary
    #[sea_orm(column_type = "String(StringLen::N(16))")]
    pub role: String,

    pub address: String,

    pub ws_port: i32,

    pub tls_port: i32,

    pub enabled: bool,

    pub mute_notifications: bool,

    pub last_seen: Option<ChronoDateTimeUtc>,

    /// Last self-reported software version
    pub version: Option<String>,

    /// Bumped on every rule mutation referencing this agent
    pub config_version: i64,

    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::rule::Entity")]
    Rules,
}

impl Related<super::rule::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Rules.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
