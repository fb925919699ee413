//! One-time handshake tokens
//!
//! Every config sync payload carries a fresh `client_token`. The entry agent
//! presents it to the next hop when opening a tunnel, and the next hop redeems
//! it with the control plane exactly once.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Unknown or already redeemed handshake token")]
    Unknown,

    #[error("Handshake token expired")]
    Expired,
}

#[derive(Debug, Clone)]
struct IssuedToken {
    agent_id: String,
    expires_at: DateTime<Utc>,
}

/// Issues and redeems one-time handshake tokens
pub struct HandshakeTokens {
    ttl: Duration,
    tokens: Mutex<HashMap<String, IssuedToken>>,
}

impl HandshakeTokens {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a token bound to `agent_id`
    pub fn issue(&self, agent_id: &str) -> String {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let issued = IssuedToken {
            agent_id: agent_id.to_string(),
            expires_at: Utc::now() + self.ttl,
        };

        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        tokens.insert(token.clone(), issued);
        token
    }

    /// Consume a token, returning the agent it was issued to
    pub fn redeem(&self, token: &str) -> Result<String, HandshakeError> {
        let issued = {
            let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
            tokens.remove(token)
        };

        match issued {
            Some(issued) if issued.expires_at < Utc::now() => Err(HandshakeError::Expired),
            Some(issued) => Ok(issued.agent_id),
            None => Err(HandshakeError::Unknown),
        }
    }

    /// Drop expired tokens; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        let before = tokens.len();
        tokens.retain(|_, t| t.expires_at >= now);
        let removed = before - tokens.len();
        if removed > 0 {
            debug!(removed, "Purged expired handshake tokens");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandshakeTokens {
    fn default() -> Self {
        Self::new(Duration::minutes(10))
    }
}
