//! Fleet control plane core
//!
//! The [`Hub`] owns every agent and node connection held by this instance and
//! routes their messages to the registered handlers. Around it sit the services
//! that keep the fleet consistent: [`ConfigSyncService`] pushes rule sets and
//! tracks acknowledgements, [`ProbeService`] runs on-demand reachability checks,
//! [`TrafficBuffer`] absorbs traffic reports, and the [`EventBus`] joins the hubs
//! of several instances into one.

pub mod alert;
pub mod broker;
pub mod config_sync;
pub mod connection;
pub mod entitlement;
pub mod event_bus;
pub mod handler;
pub mod hub;
pub mod notifier;
pub mod probe;
pub mod reconnect;
pub mod registry;
pub mod status;
pub mod task_tracker;
pub mod traffic;
pub mod transport;
pub mod tunnel_health;

pub use alert::{AlertDispatcher, AlertState, AlertTracker};
pub use broker::{Broker, BusError, MemoryBroker, PgBroker};
pub use config_sync::{ConfigSyncConfig, ConfigSyncService, Delivery, SyncError};
pub use connection::{Connection, SendError};
pub use entitlement::{AllowAll, Entitlements, Suspended};
pub use event_bus::{BusConfig, EventBus};
pub use handler::{DeliveryObserver, LifecycleHandler, MessageContext, MessageHandler};
pub use hub::{Hub, HubConfig};
pub use notifier::{LogNotifier, Notification, NotificationEvent, Notifier, NotifyError, WebhookNotifier};
pub use probe::{ProbeConfig, ProbeError, ProbeOutcome, ProbeService, UnreachableReason};
pub use reconnect::{Backoff, BackoffConfig};
pub use status::StatusHandler;
pub use traffic::{TrafficBuffer, TrafficConfig};
pub use transport::{channel_pair, Frame, FrameSink, FrameSource, TransportError};
pub use tunnel_health::TunnelHealthHandler;
