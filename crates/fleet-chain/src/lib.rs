//! Tunnel chain model
//!
//! Describes the forwarding topology the control plane pushes to agents: agents
//! and nodes, rules with their ordered chain of hops, exit groups with their
//! load-balancing strategy, and the health hysteresis applied to exit agents.

pub mod balance;
pub mod chain;
pub mod health;
pub mod model;

pub use balance::LoadBalancer;
pub use chain::{ChainError, Hop, NextHop};
pub use health::{ExitHealth, HealthTracker, HealthTransition};
pub use model::{Agent, AgentRole, ExitAgentRef, Node, Rule};
