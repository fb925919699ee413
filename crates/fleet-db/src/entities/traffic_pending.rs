//! Durable traffic cache tier
//!
//! One row per (server instance, rule) holding bytes not yet moved into
//! `traffic_stats`.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "traffic_pending")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub instance_id: String,

    #[sea_orm(primary_key, auto_increment = false)]
    pub rule_id: i64,

    pub bytes_in: i64,

    pub bytes_out: i64,

    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
