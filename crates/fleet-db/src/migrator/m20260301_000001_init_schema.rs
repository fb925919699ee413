//! Initial schema: agents, nodes, rules and the two traffic tiers

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Agent::Table)
                    .if_not_exists()
                    .col(string_len(Agent::Id, 64).primary_key())
                    .col(string_len(Agent::Name, 255).not_null())
                    .col(string_len(Agent::Role, 16).not_null().default("entry"))
                    .col(string_len(Agent::Address, 255).not_null().default(""))
                    .col(integer(Agent::WsPort).not_null().default(0))
                    .col(integer(Agent::TlsPort).not_null().default(0))
                    .col(boolean(Agent::Enabled).not_null().default(true))
                    .col(boolean(Agent::MuteNotifications).not_null().default(false))
                    .col(timestamp_with_time_zone_null(Agent::LastSeen))
                    .col(string_len_null(Agent::Version, 64))
                    .col(big_integer(Agent::ConfigVersion).not_null().default(0))
                    .col(
                        timestamp_with_time_zone(Agent::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Node::Table)
                    .if_not_exists()
                    .col(string_len(Node::Id, 64).primary_key())
                    .col(string_len(Node::Name, 255).not_null())
                    .col(string_len(Node::Address, 255).not_null().default(""))
                    .col(boolean(Node::Enabled).not_null().default(true))
                    .col(boolean(Node::MuteNotifications).not_null().default(false))
                    .col(timestamp_with_time_zone_null(Node::LastSeen))
                    .col(string_len_null(Node::Version, 64))
                    .col(
                        timestamp_with_time_zone(Node::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Rule::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Rule::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(string_len(Rule::Name, 255).not_null())
                    .col(string_len_null(Rule::OwnerId, 64))
                    .col(string_len(Rule::AgentId, 64).not_null())
                    .col(integer(Rule::ListenPort).not_null())
                    .col(string_len(Rule::TargetAddress, 255).not_null())
                    .col(integer(Rule::TargetPort).not_null())
                    .col(string_len(Rule::Protocol, 16).not_null().default("tcp"))
                    .col(string_len(Rule::TunnelType, 16).not_null().default("ws"))
                    .col(text(Rule::ChainAgentIds).not_null())
                    .col(string_len_null(Rule::NextHopAgentId, 64))
                    .col(text(Rule::ExitAgents).not_null())
                    .col(
                        string_len(Rule::LoadBalanceStrategy, 16)
                            .not_null()
                            .default("failover"),
                    )
                    .col(integer(Rule::UnhealthyThreshold).not_null().default(3))
                    .col(integer(Rule::HealthyThreshold).not_null().default(2))
                    .col(boolean(Rule::Enabled).not_null().default(true))
                    .col(big_integer(Rule::TrafficIn).not_null().default(0))
                    .col(big_integer(Rule::TrafficOut).not_null().default(0))
                    .col(string_len_null(Rule::SyncStatus, 32))
                    .col(text_null(Rule::SyncError))
                    .col(timestamp_with_time_zone_null(Rule::SyncedAt))
                    .col(
                        timestamp_with_time_zone(Rule::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(Rule::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_rules_agent_id")
                            .from(Rule::Table, Rule::AgentId)
                            .to(Agent::Table, Agent::Id)
                            .on_delete(ForeignKeyAction::Restrict),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_rules_agent_id")
                    .table(Rule::Table)
                    .col(Rule::AgentId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(TrafficPending::Table)
                    .if_not_exists()
                    .col(string_len(TrafficPending::InstanceId, 64).not_null())
                    .col(big_integer(TrafficPending::RuleId).not_null())
                    .col(big_integer(TrafficPending::BytesIn).not_null().default(0))
                    .col(big_integer(TrafficPending::BytesOut).not_null().default(0))
                    .col(
                        timestamp_with_time_zone(TrafficPending::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .primary_key(
                        Index::create()
                            .col(TrafficPending::InstanceId)
                            .col(TrafficPending::RuleId),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(TrafficStat::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(TrafficStat::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(big_integer(TrafficStat::RuleId).not_null())
                    .col(timestamp_with_time_zone(TrafficStat::Bucket).not_null())
                    .col(big_integer(TrafficStat::BytesIn).not_null().default(0))
                    .col(big_integer(TrafficStat::BytesOut).not_null().default(0))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_traffic_stats_rule_bucket")
                    .table(TrafficStat::Table)
                    .col(TrafficStat::RuleId)
                    .col(TrafficStat::Bucket)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(TrafficStat::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(TrafficPending::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Rule::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Node::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Agent::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum Agent {
    #[sea_orm(iden = "agents")]
    Table,
    Id,
    Name,
    Role,
    Address,
    WsPort,
    TlsPort,
    Enabled,
    MuteNotifications,
    LastSeen,
    Version,
    ConfigVersion,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Node {
    #[sea_orm(iden = "nodes")]
    Table,
    Id,
    Name,
    Address,
    Enabled,
    MuteNotifications,
    LastSeen,
    Version,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Rule {
    #[sea_orm(iden = "rules")]
    Table,
    Id,
    Name,
    OwnerId,
    AgentId,
    ListenPort,
    TargetAddress,
    TargetPort,
    Protocol,
    TunnelType,
    ChainAgentIds,
    NextHopAgentId,
    ExitAgents,
    LoadBalanceStrategy,
    UnhealthyThreshold,
    HealthyThreshold,
    Enabled,
    TrafficIn,
    TrafficOut,
    SyncStatus,
    SyncError,
    SyncedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum TrafficPending {
    Table,
    InstanceId,
    RuleId,
    BytesIn,
    BytesOut,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum TrafficStat {
    #[sea_orm(iden = "traffic_stats")]
    Table,
    Id,
    RuleId,
    Bucket,
    BytesIn,
    BytesOut,
}
