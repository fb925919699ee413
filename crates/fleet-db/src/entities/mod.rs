//! Database entities

pub mod agent;
pub mod node;
pub mod rule;
pub mod traffic_pending;
pub mod traffic_stat;

pub use agent::Entity as Agent;
pub use node::Entity as Node;
pub use rule::Entity as Rule;
pub use traffic_pending::Entity as TrafficPending;
pub use traffic_stat::Entity as TrafficStat;

pub mod prelude {
    pub use super::agent::Entity as Agent;
    pub use super::node::Entity as Node;
    pub use super::rule::Entity as Rule;
    pub use super::traffic_pending::Entity as TrafficPending;
    pub use super::traffic_stat::Entity as TrafficStat;
}
