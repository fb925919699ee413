//! Fleet persistence
//!
//! SeaORM entities and migrations for agents, nodes, rules and traffic, the
//! [`FleetStore`] repository the control plane reads and writes through, and the
//! two traffic tiers ([`TrafficCache`] and [`TrafficSink`]).

pub mod entities;
pub mod migrator;
pub mod store;
pub mod traffic;

use sea_orm::{Database, DatabaseConnection, DbErr};
use sea_orm_migration::MigratorTrait;
use thiserror::Error;

pub use store::{AgentReport, AgentVersion, FleetStore, RuleChange, SeaOrmStore};
pub use traffic::{SeaOrmTrafficStore, TrafficCache, TrafficDelta, TrafficSink};

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    #[error("Invalid rule: {0}")]
    InvalidRule(#[from] fleet_chain::ChainError),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Rule {rule_id} references unknown agent {agent_id}")]
    UnknownAgent { rule_id: i64, agent_id: String },

    #[error("Corrupt {column} column: {reason}")]
    Corrupt {
        column: &'static str,
        reason: String,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Connect to the database at `url` (`sqlite::memory:`, `sqlite://fleet.db?mode=rwc`,
/// `postgres://...`)
pub async fn connect(url: &str) -> Result<DatabaseConnection, DbErr> {
    tracing::debug!(url = %redact(url), "Connecting to database");
    Database::connect(url).await
}

/// Apply all pending migrations
pub async fn migrate(db: &DatabaseConnection) -> Result<(), DbErr> {
    migrator::Migrator::up(db, None).await
}

/// Strip credentials from a connection URL before logging it
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            format!("{}://***{}", &url[..scheme], &url[at..])
        }
        _ => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact() {
        assert_eq!(
            redact("postgres://fleet:secret@db:5432/fleet"),
            "postgres://***@db:5432/fleet"
        );
        assert_eq!(redact("sqlite::memory:"), "sqlite::memory:");
    }
}
