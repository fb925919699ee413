//! Pub/sub brokers behind the event bus
//!
//! [`MemoryBroker`] connects instances living in one process (tests, single-node
//! deployments). [`PgBroker`] uses Postgres `LISTEN`/`NOTIFY`, so a fleet that
//! already shares a Postgres database needs no extra infrastructure.

use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Postgres rejects NOTIFY payloads of 8000 bytes or more
pub const PG_NOTIFY_LIMIT: usize = 7999;

const SUBSCRIPTION_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Payload of {size} bytes exceeds the broker limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Failed to encode bus message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<sqlx::Error> for BusError {
    fn from(e: sqlx::Error) -> Self {
        BusError::Unavailable(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: String,
}

/// Messages for the subscribed topics; closes when the broker connection drops
pub type Subscription = mpsc::Receiver<BrokerMessage>;

#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BusError>;

    async fn subscribe(&self, topics: &[&'static str]) -> Result<Subscription, BusError>;
}

/// In-process broker; clone the `Arc` into every instance that should share it
pub struct MemoryBroker {
    tx: broadcast::Sender<BrokerMessage>,
    generation: Mutex<CancellationToken>,
    offline: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            tx,
            generation: Mutex::new(CancellationToken::new()),
            offline: AtomicBool::new(false),
        }
    }

    /// Close every open subscription, as a lost broker connection would
    pub fn drop_subscribers(&self) {
        let mut generation = self.generation.lock().unwrap_or_else(|e| e.into_inner());
        generation.cancel();
        *generation = CancellationToken::new();
    }

    /// While offline, publish and subscribe fail
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
        if offline {
            self.drop_subscribers();
        }
    }

    fn check_online(&self) -> Result<(), BusError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BusError::Unavailable("memory broker offline".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BusError> {
        self.check_online()?;
        // No subscribers is not an error
        let _ = self.tx.send(BrokerMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, topics: &[&'static str]) -> Result<Subscription, BusError> {
        self.check_online()?;

        let mut rx = self.tx.subscribe();
        let cancel = self
            .generation
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let topics: Vec<&'static str> = topics.to_vec();
        let (out, sub) = mpsc::channel(SUBSCRIPTION_BUFFER);

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = rx.recv() => message,
                };
                match message {
                    Ok(message) if topics.contains(&message.topic.as_str()) => {
                        if out.send(message).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Memory broker subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(sub)
    }
}

/// Postgres `LISTEN`/`NOTIFY` broker
pub struct PgBroker {
    pool: PgPool,
}

impl PgBroker {
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let pool = PgPoolOptions::new().max_connections(4).connect(url).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Broker for PgBroker {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BusError> {
        if payload.len() > PG_NOTIFY_LIMIT {
            return Err(BusError::PayloadTooLarge {
                size: payload.len(),
                limit: PG_NOTIFY_LIMIT,
            });
        }

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(topic)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, topics: &[&'static str]) -> Result<Subscription, BusError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen_all(topics.iter().copied()).await?;
        debug!(?topics, "Listening for notifications");

        let (out, sub) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(async move {
            loop {
                match listener.try_recv().await {
                    Ok(Some(notification)) => {
                        let message = BrokerMessage {
                            topic: notification.channel().to_string(),
                            payload: notification.payload().to_string(),
                        };
                        if out.send(message).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        warn!("Postgres listener connection lost");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Postgres listener failed");
                        break;
                    }
                }
            }
        });

        Ok(sub)
    }
}
