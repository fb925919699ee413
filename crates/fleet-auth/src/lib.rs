//! Authentication for agents, nodes and administrators of the fleet control plane

pub mod handshake;
pub mod jwt;

pub use handshake::{HandshakeError, HandshakeTokens};
pub use jwt::{FleetClaims, JwtError, JwtValidator, TokenKind};

// Re-export useful types
pub use jsonwebtoken::Algorithm;
