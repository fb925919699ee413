//! Two-tier traffic storage
//!
//! The in-memory buffer in the control plane flushes into [`TrafficCache`]
//! (`traffic_pending`, one row per instance and rule) on a short interval. A slower
//! job moves the cached totals into the [`TrafficSink`] (`traffic_stats` hourly
//! buckets plus the cumulative counters on `rules`), draining the cache in the
//! same transaction.

use async_trait::async_trait;
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::entities::{rule, traffic_pending, traffic_stat};
use crate::StoreResult;

/// Bytes accumulated for one rule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficDelta {
    pub rule_id: i64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl TrafficDelta {
    pub fn new(rule_id: i64, bytes_in: u64, bytes_out: u64) -> Self {
        Self {
            rule_id,
            bytes_in,
            bytes_out,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.bytes_in == 0 && self.bytes_out == 0
    }
}

/// Durable buffer between the hot report path and the system of record
#[async_trait]
pub trait TrafficCache: Send + Sync {
    /// Add deltas to the cached totals
    async fn add(&self, batch: &[TrafficDelta]) -> StoreResult<()>;

    /// Current cached totals
    async fn snapshot(&self) -> StoreResult<Vec<TrafficDelta>>;
}

/// System of record for traffic
#[async_trait]
pub trait TrafficSink: Send + Sync {
    /// Add a cache snapshot to the system of record and subtract it from the
    /// cache, both or neither
    ///
    /// Deltas added to the cache after the snapshot was taken stay there.
    async fn persist_and_commit(&self, snapshot: &[TrafficDelta], at: DateTime<Utc>) -> StoreResult<()>;
}

/// SeaORM implementation of both tiers, scoped to one server instance
#[derive(Clone)]
pub struct SeaOrmTrafficStore {
    db: DatabaseConnection,
    instance_id: String,
}

impl SeaOrmTrafficStore {
    pub fn new(db: DatabaseConnection, instance_id: impl Into<String>) -> Self {
        Self {
            db,
            instance_id: instance_id.into(),
        }
    }
}

#[async_trait]
impl TrafficCache for SeaOrmTrafficStore {
    async fn add(&self, batch: &[TrafficDelta]) -> StoreResult<()> {
        let merged = merge(batch);
        if merged.is_empty() {
            return Ok(());
        }

        let txn = self.db.begin().await?;
        let now = Utc::now();

        for delta in merged.values() {
            let result = traffic_pending::Entity::update_many()
                .col_expr(
                    traffic_pending::Column::BytesIn,
                    Expr::col(traffic_pending::Column::BytesIn).add(to_i64(delta.bytes_in)),
                )
                .col_expr(
                    traffic_pending::Column::BytesOut,
                    Expr::col(traffic_pending::Column::BytesOut).add(to_i64(delta.bytes_out)),
                )
                .col_expr(traffic_pending::Column::UpdatedAt, Expr::value(now))
                .filter(traffic_pending::Column::InstanceId.eq(self.instance_id.as_str()))
                .filter(traffic_pending::Column::RuleId.eq(delta.rule_id))
                .exec(&txn)
                .await?;

            if result.rows_affected == 0 {
                traffic_pending::ActiveModel {
                    instance_id: Set(self.instance_id.clone()),
                    rule_id: Set(delta.rule_id),
                    bytes_in: Set(to_i64(delta.bytes_in)),
                    bytes_out: Set(to_i64(delta.bytes_out)),
                    updated_at: Set(now),
                }
                .insert(&txn)
                .await?;
            }
        }

        txn.commit().await?;
        debug!(rules = merged.len(), "Cached traffic deltas");
        Ok(())
    }

    async fn snapshot(&self) -> StoreResult<Vec<TrafficDelta>> {
        let rows = traffic_pending::Entity::find()
            .filter(traffic_pending::Column::InstanceId.eq(self.instance_id.as_str()))
            .all(&self.db)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| TrafficDelta {
                rule_id: row.rule_id,
                bytes_in: to_u64(row.bytes_in),
                bytes_out: to_u64(row.bytes_out),
            })
            .filter(|d| !d.is_zero())
            .collect())
    }
}

#[async_trait]
impl TrafficSink for SeaOrmTrafficStore {
    async fn persist_and_commit(&self, snapshot: &[TrafficDelta], at: DateTime<Utc>) -> StoreResult<()> {
        let merged = merge(snapshot);
        if merged.is_empty() {
            return Ok(());
        }

        let bucket = at.duration_trunc(TimeDelta::hours(1)).unwrap_or(at);
        let txn = self.db.begin().await?;

        for delta in merged.values() {
            let totals = rule::Entity::update_many()
                .col_expr(
                    rule::Column::TrafficIn,
                    Expr::col(rule::Column::TrafficIn).add(to_i64(delta.bytes_in)),
                )
                .col_expr(
                    rule::Column::TrafficOut,
                    Expr::col(rule::Column::TrafficOut).add(to_i64(delta.bytes_out)),
                )
                .filter(rule::Column::Id.eq(delta.rule_id))
                .exec(&txn)
                .await?;

            if totals.rows_affected == 0 {
                debug!(rule_id = delta.rule_id, "Dropping traffic for deleted rule");
            } else {
                add_to_bucket(&txn, delta, bucket).await?;
            }
            self.subtract_pending(&txn, delta).await?;
        }

        traffic_pending::Entity::delete_many()
            .filter(traffic_pending::Column::InstanceId.eq(self.instance_id.as_str()))
            .filter(traffic_pending::Column::BytesIn.lte(0))
            .filter(traffic_pending::Column::BytesOut.lte(0))
            .exec(&txn)
            .await?;

        txn.commit().await?;
        debug!(rules = merged.len(), bucket = %bucket, "Persisted traffic");
        Ok(())
    }
}

impl SeaOrmTrafficStore {
    async fn subtract_pending<C: ConnectionTrait>(&self, conn: &C, delta: &TrafficDelta) -> StoreResult<()> {
        traffic_pending::Entity::update_many()
            .col_expr(
                traffic_pending::Column::BytesIn,
                Expr::col(traffic_pending::Column::BytesIn).sub(to_i64(delta.bytes_in)),
            )
            .col_expr(
                traffic_pending::Column::BytesOut,
                Expr::col(traffic_pending::Column::BytesOut).sub(to_i64(delta.bytes_out)),
            )
            .filter(traffic_pending::Column::InstanceId.eq(self.instance_id.as_str()))
            .filter(traffic_pending::Column::RuleId.eq(delta.rule_id))
            .exec(conn)
            .await?;
        Ok(())
    }
}

async fn add_to_bucket<C: ConnectionTrait>(
    conn: &C,
    delta: &TrafficDelta,
    bucket: DateTime<Utc>,
) -> StoreResult<()> {
    let result = traffic_stat::Entity::update_many()
        .col_expr(
            traffic_stat::Column::BytesIn,
            Expr::col(traffic_stat::Column::BytesIn).add(to_i64(delta.bytes_in)),
        )
        .col_expr(
            traffic_stat::Column::BytesOut,
            Expr::col(traffic_stat::Column::BytesOut).add(to_i64(delta.bytes_out)),
        )
        .filter(traffic_stat::Column::RuleId.eq(delta.rule_id))
        .filter(traffic_stat::Column::Bucket.eq(bucket))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        traffic_stat::ActiveModel {
            rule_id: Set(delta.rule_id),
            bucket: Set(bucket),
            bytes_in: Set(to_i64(delta.bytes_in)),
            bytes_out: Set(to_i64(delta.bytes_out)),
            ..Default::default()
        }
        .insert(conn)
        .await?;
    }
    Ok(())
}

/// Sum deltas per rule
pub fn merge(batch: &[TrafficDelta]) -> BTreeMap<i64, TrafficDelta> {
    let mut merged: BTreeMap<i64, TrafficDelta> = BTreeMap::new();
    for delta in batch.iter().filter(|d| !d.is_zero()) {
        let entry = merged
            .entry(delta.rule_id)
            .or_insert_with(|| TrafficDelta::new(delta.rule_id, 0, 0));
        entry.bytes_in = entry.bytes_in.saturating_add(delta.bytes_in);
        entry.bytes_out = entry.bytes_out.saturating_add(delta.bytes_out);
    }
    merged
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_sums_per_rule() {
        let merged = merge(&[
            TrafficDelta::new(1, 10, 20),
            TrafficDelta::new(2, 5, 0),
            TrafficDelta::new(1, 1, 2),
            TrafficDelta::new(3, 0, 0),
        ]);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[&1], TrafficDelta::new(1, 11, 22));
        assert_eq!(merged[&2], TrafficDelta::new(2, 5, 0));
    }
}
