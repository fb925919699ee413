//! One live agent or node connection

use chrono::{DateTime, Utc};
use fleet_proto::ResourceKind;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::transport::Frame;

/// Outbound delivery errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("{kind} {id} is not connected to this instance")]
    NotConnected { kind: ResourceKind, id: String },

    #[error("Outbound queue full for {kind} {id}; connection closed")]
    QueueFull { kind: ResourceKind, id: String },

    #[error("Failed to encode message: {0}")]
    Encode(String),
}

/// Hub-side state of a connected agent or node
///
/// Holds the write end of the bounded outbound queue drained by the
/// connection's write loop. Never persisted.
#[derive(Debug)]
pub struct Connection {
    pub kind: ResourceKind,
    pub id: String,
    /// Distinguishes successive connections of the same resource
    pub conn_uid: u64,
    pub connected_at: DateTime<Utc>,
    pub remote_addr: Option<String>,
    outbound: mpsc::Sender<Frame>,
    last_activity: Mutex<Instant>,
    cancel: CancellationToken,
}

impl Connection {
    pub(crate) fn new(
        kind: ResourceKind,
        id: String,
        conn_uid: u64,
        remote_addr: Option<String>,
        outbound: mpsc::Sender<Frame>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            kind,
            id,
            conn_uid,
            connected_at: Utc::now(),
            remote_addr,
            outbound,
            last_activity: Mutex::new(Instant::now()),
            cancel,
        }
    }

    /// Record inbound activity
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    /// Queue a frame without waiting
    pub fn try_send(&self, frame: Frame) -> Result<(), SendError> {
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull {
                kind: self.kind,
                id: self.id.clone(),
            },
            mpsc::error::TrySendError::Closed(_) => SendError::NotConnected {
                kind: self.kind,
                id: self.id.clone(),
            },
        })
    }

    /// Stop both loops of this connection
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(capacity: usize) -> (Connection, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = Connection::new(
            ResourceKind::Agent,
            "fa_001".to_string(),
            1,
            None,
            tx,
            CancellationToken::new(),
        );
        (conn, rx)
    }

    #[tokio::test]
    async fn test_queue_full() {
        let (conn, _rx) = connection(1);
        conn.try_send(Frame::Ping(Vec::new())).unwrap();
        assert!(matches!(
            conn.try_send(Frame::Ping(Vec::new())),
            Err(SendError::QueueFull { .. })
        ));
    }

    #[tokio::test]
    async fn test_send_after_write_loop_gone() {
        let (conn, rx) = connection(1);
        drop(rx);
        assert!(matches!(
            conn.try_send(Frame::Close),
            Err(SendError::NotConnected { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_tracking() {
        let (conn, _rx) = connection(1);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(conn.idle_for() >= Duration::from_secs(5));
        conn.touch();
        assert!(conn.idle_for() < Duration::from_secs(1));
    }
}
