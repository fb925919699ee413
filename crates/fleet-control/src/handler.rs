//! Capability traits the hub calls into

use async_trait::async_trait;
use fleet_proto::{Envelope, ResourceKind};

/// Who an inbound message came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContext {
    pub kind: ResourceKind,
    /// Authenticated id of the connection, not the envelope's `agent_id`
    pub id: String,
    /// `None` when the message was relayed from another instance
    pub conn_uid: Option<u64>,
}

impl MessageContext {
    pub fn local(kind: ResourceKind, id: impl Into<String>, conn_uid: u64) -> Self {
        Self {
            kind,
            id: id.into(),
            conn_uid: Some(conn_uid),
        }
    }

    pub fn relayed(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            conn_uid: None,
        }
    }

    pub fn is_relayed(&self) -> bool {
        self.conn_uid.is_none()
    }
}

/// Handles inbound envelopes of the types it is registered for
///
/// Errors are the handler's to log; the hub never sees them.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: &MessageContext, envelope: Envelope);
}

/// Online/offline callbacks
///
/// Called synchronously in registration order on the register/unregister path,
/// so implementations must not block. Spawn anything slow.
pub trait LifecycleHandler: Send + Sync {
    fn on_online(&self, kind: ResourceKind, id: &str);

    fn on_offline(&self, kind: ResourceKind, id: &str);
}

/// Told about every envelope queued to a local connection
pub trait DeliveryObserver: Send + Sync {
    fn on_delivered(&self, kind: ResourceKind, id: &str, envelope: &Envelope);
}
