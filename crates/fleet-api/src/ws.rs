//! Agent and node WebSocket endpoints
//!
//! The bearer token is checked before the upgrade; once upgraded the socket is
//! split and handed to the [`Hub`](fleet_control::Hub), which owns it from then on.

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        RawQuery, State,
    },
    http::HeaderMap,
    response::Response,
};
use fleet_auth::TokenKind;
use fleet_control::{Frame, FrameSink, FrameSource, TransportError};
use fleet_proto::ResourceKind;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::middleware::bearer_token;
use crate::AppState;

pub struct WsSink {
    inner: SplitSink<WebSocket, Message>,
}

pub struct WsSource {
    inner: SplitStream<WebSocket>,
}

/// Split an upgraded socket into hub transport halves
pub fn split(socket: WebSocket) -> (WsSink, WsSource) {
    let (sink, stream) = socket.split();
    (WsSink { inner: sink }, WsSource { inner: stream })
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Ping(payload) => Message::Ping(payload.into()),
            Frame::Pong(payload) => Message::Pong(payload.into()),
            Frame::Close => Message::Close(None),
        };
        self.inner
            .send(message)
            .await
            .map_err(|e| TransportError::WebSocketError(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner
            .close()
            .await
            .map_err(|e| TransportError::WebSocketError(e.to_string()))
    }
}

#[async_trait]
impl FrameSource for WsSource {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        let Some(message) = self.inner.next().await else {
            return Ok(None);
        };
        let message = message.map_err(|e| TransportError::WebSocketError(e.to_string()))?;

        let frame = match message {
            Message::Text(text) => Frame::Text(text.as_str().to_owned()),
            Message::Binary(data) => {
                let text = String::from_utf8(data.to_vec())
                    .map_err(|_| TransportError::ProtocolError("Binary frame is not UTF-8".to_string()))?;
                Frame::Text(text)
            }
            Message::Ping(payload) => Frame::Ping(payload.to_vec()),
            Message::Pong(payload) => Frame::Pong(payload.to_vec()),
            Message::Close(_) => Frame::Close,
        };
        Ok(Some(frame))
    }
}

/// Upgrade an agent connection
#[utoipa::path(
    get,
    path = "/ws/agent",
    responses(
        (status = 101, description = "Switching protocols"),
        (status = 401, description = "Missing or invalid token", body = crate::models::ErrorResponse),
        (status = 403, description = "Token not issued to a known agent", body = crate::models::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "connections"
)]
pub async fn agent_ws(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let id = authenticate(&state, &headers, query.as_deref(), ResourceKind::Agent).await?;
    Ok(upgrade(state, ws, ResourceKind::Agent, id, remote_addr(&headers)))
}

/// Upgrade a node connection
#[utoipa::path(
    get,
    path = "/ws/node",
    responses(
        (status = 101, description = "Switching protocols"),
        (status = 401, description = "Missing or invalid token", body = crate::models::ErrorResponse),
        (status = 403, description = "Token not issued to a known node", body = crate::models::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "connections"
)]
pub async fn node_ws(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let id = authenticate(&state, &headers, query.as_deref(), ResourceKind::Node).await?;
    Ok(upgrade(state, ws, ResourceKind::Node, id, remote_addr(&headers)))
}

/// Resolve the resource id a connection may register as
async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    query: Option<&str>,
    kind: ResourceKind,
) -> Result<String, ApiError> {
    let token = bearer_token(headers, query)
        .ok_or_else(|| ApiError::Unauthorized("Missing bearer token".to_string()))?;

    let token_kind = match kind {
        ResourceKind::Agent => TokenKind::Agent,
        ResourceKind::Node => TokenKind::Node,
    };
    let claims = state.jwt.authenticate(&token, token_kind)?;

    let known = match kind {
        ResourceKind::Agent => state.store.get_agent(&claims.sub).await?.is_some(),
        ResourceKind::Node => state.store.get_node(&claims.sub).await?.is_some(),
    };
    if !known {
        warn!(%kind, id = %claims.sub, "Rejected connection for unregistered resource");
        return Err(ApiError::Forbidden(format!("Unknown {} {}", kind, claims.sub)));
    }

    Ok(claims.sub)
}

fn upgrade(
    state: Arc<AppState>,
    ws: WebSocketUpgrade,
    kind: ResourceKind,
    id: String,
    remote_addr: Option<String>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        let (sink, source) = split(socket);
        let conn = state.hub.register(kind, &id, remote_addr, sink, source);
        info!(
            %kind,
            %id,
            conn_uid = conn.conn_uid,
            remote_addr = conn.remote_addr.as_deref().unwrap_or("-"),
            "Connection registered"
        );

        let touched = match kind {
            ResourceKind::Agent => state.store.touch_agent(&id).await,
            ResourceKind::Node => state.store.touch_node(&id).await,
        };
        if let Err(e) = touched {
            debug!(%kind, %id, error = %e, "Failed to refresh last_seen");
        }
    })
}

fn remote_addr(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.split(',').next())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
}
