use axum::{
    extract::{Path, RawQuery, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use fleet_auth::TokenKind;
use fleet_chain::{Agent, AgentRole, Node};
use fleet_control::hub::command_envelope;
use fleet_control::{Delivery, SendError, SyncError};
use fleet_proto::{Command, CommandAction, LoadBalanceStrategy, ResourceKind};
use futures::Stream;
use std::convert::Infallible;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::middleware::bearer_token;
use crate::models::*;
use crate::AppState;

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "health"
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        instance_id: state.bus.instance_id().to_string(),
        connections: state.hub.connection_count(),
        bus_subscribed: state.bus.is_subscribed(),
    })
}

// ========== Agents ==========

/// List all agents
#[utoipa::path(
    get,
    path = "/api/agents",
    responses(
        (status = 200, description = "List of agents", body = AgentList),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "agents"
)]
pub async fn list_agents(State(state): State<Arc<AppState>>) -> Result<Json<AgentList>, ApiError> {
    let agents: Vec<AgentView> = state
        .store
        .list_agents()
        .await?
        .into_iter()
        .map(|agent| agent_view(&state, agent))
        .collect();
    let total = agents.len();
    Ok(Json(AgentList { agents, total }))
}

/// Get an agent
#[utoipa::path(
    get,
    path = "/api/agents/{id}",
    params(("id" = String, Path, description = "Agent ID")),
    responses(
        (status = 200, description = "Agent found", body = AgentView),
        (status = 404, description = "Agent not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "agents"
)]
pub async fn get_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<AgentView>, ApiError> {
    let agent = state
        .store
        .get_agent(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Agent {} not found", id)))?;
    Ok(Json(agent_view(&state, agent)))
}

/// Create or edit an agent
///
/// A changed address or port resyncs every agent that dials this one; toggling
/// `enabled` resyncs the agent itself.
#[utoipa::path(
    put,
    path = "/api/agents/{id}",
    params(("id" = String, Path, description = "Agent ID")),
    request_body = UpsertAgentRequest,
    responses(
        (status = 200, description = "Agent saved", body = AgentView),
        (status = 400, description = "Invalid request", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "agents"
)]
pub async fn upsert_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpsertAgentRequest>,
) -> Result<Json<AgentView>, ApiError> {
    let role = AgentRole::from_str(&req.role).map_err(ApiError::BadRequest)?;
    let previous = state.store.get_agent(&id).await?;
    let was_enabled = previous.as_ref().map(|a| a.enabled);

    let mut agent = previous.unwrap_or_else(|| Agent::new(id.clone(), role));
    agent.role = role;
    if let Some(name) = req.name {
        agent.name = name;
    }
    agent.address = req.address;
    agent.ws_port = req.ws_port;
    agent.tls_port = req.tls_port;
    agent.enabled = req.enabled;
    agent.mute_notifications = req.mute_notifications;

    let report = state.store.upsert_agent(&agent).await?;
    info!(agent_id = %id, endpoint_changed = report.endpoint_changed, "Agent saved");

    if report.endpoint_changed {
        match state.sync.notify_exit_port_change(&id).await {
            Ok(resynced) if !resynced.is_empty() => {
                info!(agent_id = %id, ?resynced, "Resynced agents dialing this agent")
            }
            Ok(_) => {}
            Err(e) => warn!(agent_id = %id, error = %e, "Failed to resync dependents"),
        }
    }

    if was_enabled.is_some_and(|enabled| enabled != report.agent.enabled) {
        match state.sync.full_sync(&id).await {
            Ok(_) | Err(SyncError::Offline(_)) => {}
            Err(e) => warn!(agent_id = %id, error = %e, "Failed to resync agent"),
        }
    }

    Ok(Json(agent_view(&state, report.agent)))
}

/// Drop the agent's connection wherever it is held
#[utoipa::path(
    delete,
    path = "/api/agents/{id}/session",
    params(("id" = String, Path, description = "Agent ID")),
    responses(
        (status = 204, description = "Connection closed on this instance"),
        (status = 202, description = "Close relayed to the other instances"),
        (status = 404, description = "Agent not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "agents"
)]
pub async fn disconnect_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.hub.disconnect(ResourceKind::Agent, &id) {
        info!(agent_id = %id, "Agent disconnected by admin");
        return Ok(StatusCode::NO_CONTENT);
    }

    if state.store.get_agent(&id).await?.is_none() {
        return Err(ApiError::NotFound(format!("Agent {} not found", id)));
    }
    state
        .bus
        .publish_disconnect(ResourceKind::Agent, &id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    info!(agent_id = %id, "Agent disconnect relayed");
    Ok(StatusCode::ACCEPTED)
}

/// Push the agent's full rule set
#[utoipa::path(
    post,
    path = "/api/agents/{id}/sync",
    params(("id" = String, Path, description = "Agent ID")),
    responses(
        (status = 200, description = "Full sync sent", body = SyncResponse),
        (status = 404, description = "Agent not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "agents"
)]
pub async fn sync_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SyncResponse>, ApiError> {
    let delivery = state.sync.full_sync(&id).await?;
    Ok(Json(SyncResponse {
        agent_id: id,
        delivery: delivery_name(delivery).to_string(),
    }))
}

/// Send a command to an agent
#[utoipa::path(
    post,
    path = "/api/agents/{id}/commands",
    params(("id" = String, Path, description = "Agent ID")),
    request_body = CommandRequest,
    responses(
        (status = 202, description = "Command queued", body = CommandResponse),
        (status = 400, description = "Unknown action", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "agents"
)]
pub async fn agent_command(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<CommandRequest>,
) -> Result<(StatusCode, Json<CommandResponse>), ApiError> {
    send_command(&state, ResourceKind::Agent, &id, req).await
}

// ========== Nodes ==========

/// Get a node
#[utoipa::path(
    get,
    path = "/api/nodes/{id}",
    params(("id" = String, Path, description = "Node ID")),
    responses(
        (status = 200, description = "Node found", body = NodeView),
        (status = 404, description = "Node not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "nodes"
)]
pub async fn get_node(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<NodeView>, ApiError> {
    let node = state
        .store
        .get_node(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Node {} not found", id)))?;
    let online = state.bus.is_online_anywhere(ResourceKind::Node, &id);
    Ok(Json(NodeView::new(node, online)))
}

/// Create or edit a node
#[utoipa::path(
    put,
    path = "/api/nodes/{id}",
    params(("id" = String, Path, description = "Node ID")),
    request_body = NodeRequest,
    responses(
        (status = 200, description = "Node saved", body = NodeView)
    ),
    security(("bearer_auth" = [])),
    tag = "nodes"
)]
pub async fn upsert_node(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<NodeRequest>,
) -> Result<Json<NodeView>, ApiError> {
    let mut node = state
        .store
        .get_node(&id)
        .await?
        .unwrap_or_else(|| Node::new(id.clone()));
    if let Some(name) = req.name {
        node.name = name;
    }
    node.address = req.address;
    node.enabled = req.enabled;
    node.mute_notifications = req.mute_notifications;

    let node = state.store.upsert_node(&node).await?;
    debug!(node_id = %id, "Node saved");
    let online = state.bus.is_online_anywhere(ResourceKind::Node, &id);
    Ok(Json(NodeView::new(node, online)))
}

/// Send a command to a node
#[utoipa::path(
    post,
    path = "/api/nodes/{id}/commands",
    params(("id" = String, Path, description = "Node ID")),
    request_body = CommandRequest,
    responses(
        (status = 202, description = "Command queued", body = CommandResponse),
        (status = 400, description = "Unknown action", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "nodes"
)]
pub async fn node_command(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<CommandRequest>,
) -> Result<(StatusCode, Json<CommandResponse>), ApiError> {
    send_command(&state, ResourceKind::Node, &id, req).await
}

// ========== Rules ==========

/// List all rules
#[utoipa::path(
    get,
    path = "/api/rules",
    responses(
        (status = 200, description = "List of rules", body = RuleList)
    ),
    security(("bearer_auth" = [])),
    tag = "rules"
)]
pub async fn list_rules(State(state): State<Arc<AppState>>) -> Result<Json<RuleList>, ApiError> {
    let rules: Vec<RuleView> = state
        .store
        .list_rules()
        .await?
        .into_iter()
        .map(RuleView::from)
        .collect();
    let total = rules.len();
    Ok(Json(RuleList { rules, total }))
}

/// Get a rule
#[utoipa::path(
    get,
    path = "/api/rules/{id}",
    params(("id" = i64, Path, description = "Rule ID")),
    responses(
        (status = 200, description = "Rule found", body = RuleView),
        (status = 404, description = "Rule not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "rules"
)]
pub async fn get_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<RuleView>, ApiError> {
    let rule = state
        .store
        .get_rule(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Rule {} not found", id)))?;
    Ok(Json(rule.into()))
}

/// Create a rule and push it to every agent on its path
#[utoipa::path(
    post,
    path = "/api/rules",
    request_body = RuleRequest,
    responses(
        (status = 201, description = "Rule created", body = RuleChangeResponse),
        (status = 400, description = "Invalid rule", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "rules"
)]
pub async fn create_rule(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RuleRequest>,
) -> Result<(StatusCode, Json<RuleChangeResponse>), ApiError> {
    let change = state.store.save_rule(req.into_rule(0)).await?;
    let response = publish_change(&state, change).await;
    if let Some(rule) = &response.rule {
        info!(rule_id = rule.id, agent_id = %rule.agent_id, "Rule created");
    }
    Ok((StatusCode::CREATED, Json(response)))
}

/// Replace a rule
#[utoipa::path(
    put,
    path = "/api/rules/{id}",
    params(("id" = i64, Path, description = "Rule ID")),
    request_body = RuleRequest,
    responses(
        (status = 200, description = "Rule updated", body = RuleChangeResponse),
        (status = 400, description = "Invalid rule", body = ErrorResponse),
        (status = 404, description = "Rule not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "rules"
)]
pub async fn update_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<RuleRequest>,
) -> Result<Json<RuleChangeResponse>, ApiError> {
    if state.store.get_rule(id).await?.is_none() {
        return Err(ApiError::NotFound(format!("Rule {} not found", id)));
    }
    let change = state.store.save_rule(req.into_rule(id)).await?;

    // Exit membership may have changed
    if change.previous.as_ref().map(|r| &r.exit_agents)
        != change.current.as_ref().map(|r| &r.exit_agents)
    {
        state.balancer.forget_rule(id);
    }

    info!(rule_id = id, "Rule updated");
    Ok(Json(publish_change(&state, change).await))
}

/// Delete a rule and withdraw it from its agents
#[utoipa::path(
    delete,
    path = "/api/rules/{id}",
    params(("id" = i64, Path, description = "Rule ID")),
    responses(
        (status = 200, description = "Rule deleted", body = RuleChangeResponse),
        (status = 404, description = "Rule not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "rules"
)]
pub async fn delete_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<RuleChangeResponse>, ApiError> {
    let change = state.store.delete_rule(id).await?;
    state.health.forget_rule(id);
    state.balancer.forget_rule(id);
    info!(rule_id = id, "Rule deleted");
    Ok(Json(publish_change(&state, change).await))
}

/// Probe a rule's forwarding path end to end
#[utoipa::path(
    post,
    path = "/api/rules/{id}/probe",
    params(("id" = i64, Path, description = "Rule ID")),
    responses(
        (status = 200, description = "Probe finished", body = ProbeResponse),
        (status = 404, description = "Rule not found", body = ErrorResponse),
        (status = 409, description = "Rule disabled", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "rules"
)]
pub async fn probe_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<ProbeResponse>, ApiError> {
    let outcome = state.probe.probe_rule(id).await?;
    Ok(Json(ProbeResponse::new(id, outcome)))
}

/// Health of a rule's exit agents
#[utoipa::path(
    get,
    path = "/api/rules/{id}/health",
    params(("id" = i64, Path, description = "Rule ID")),
    responses(
        (status = 200, description = "Exit health", body = RuleHealthResponse),
        (status = 404, description = "Rule not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "rules"
)]
pub async fn rule_health(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<RuleHealthResponse>, ApiError> {
    let rule = state
        .store
        .get_rule(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Rule {} not found", id)))?;

    let exit_ids: Vec<String> = match &rule.next_hop_agent_id {
        Some(next_hop) => vec![next_hop.clone()],
        None => rule.exit_agents.iter().map(|e| e.agent_id.clone()).collect(),
    };
    let exits = exit_ids
        .into_iter()
        .map(|agent_id| {
            let health = state.health.get(id, &agent_id);
            ExitHealthView::new(agent_id, health)
        })
        .collect();

    // Weighted selection advances the round robin, so only failover is previewed
    let selected = match rule.load_balance_strategy {
        LoadBalanceStrategy::Failover => state.balancer.select(&rule, &state.health),
        LoadBalanceStrategy::Weighted => None,
    };

    Ok(Json(RuleHealthResponse {
        rule_id: id,
        selected,
        exits,
    }))
}

// ========== Alerts & events ==========

/// Resources currently offline with an open alert on this instance
#[utoipa::path(
    get,
    path = "/api/alerts",
    responses(
        (status = 200, description = "Firing alerts", body = AlertList)
    ),
    security(("bearer_auth" = [])),
    tag = "alerts"
)]
pub async fn list_alerts(State(state): State<Arc<AppState>>) -> Json<AlertList> {
    let alerts = state
        .alerts
        .firing()
        .into_iter()
        .map(|(kind, id, since)| AlertView {
            kind: kind.as_str().to_string(),
            id,
            since,
        })
        .collect();
    Json(AlertList { alerts })
}

/// Stream online/offline transitions as Server-Sent Events
#[utoipa::path(
    get,
    path = "/api/events",
    responses(
        (status = 200, description = "SSE stream of status events", body = String, content_type = "text/event-stream")
    ),
    security(("bearer_auth" = [])),
    tag = "alerts"
)]
pub async fn status_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!("SSE client connected");

    let stream = BroadcastStream::new(state.bus.subscribe_status()).filter_map(|result| {
        let event = match result {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "SSE client lagging, events dropped");
                return None;
            }
        };
        let json = serde_json::to_string(&event).ok()?;
        Some(Ok(Event::default().event("status").data(json)))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

// ========== Handshake ==========

/// Redeem a one-time handshake token
///
/// Called by an agent with its own bearer token; returns the agent the
/// handshake token was issued to.
#[utoipa::path(
    post,
    path = "/api/handshake/redeem",
    request_body = RedeemRequest,
    responses(
        (status = 200, description = "Token redeemed", body = RedeemResponse),
        (status = 401, description = "Unknown, used or expired token", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "connections"
)]
pub async fn redeem_handshake(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    Json(req): Json<RedeemRequest>,
) -> Result<Json<RedeemResponse>, ApiError> {
    let token = bearer_token(&headers, query.as_deref())
        .ok_or_else(|| ApiError::Unauthorized("Missing bearer token".to_string()))?;
    let claims = state.jwt.authenticate(&token, TokenKind::Agent)?;

    let agent_id = state
        .tokens
        .redeem(&req.token)
        .map_err(|e| ApiError::Unauthorized(e.to_string()))?;
    info!(redeemed_by = %claims.sub, %agent_id, "Handshake token redeemed");
    Ok(Json(RedeemResponse { agent_id }))
}

// ========== Helpers ==========

fn agent_view(state: &AppState, agent: Agent) -> AgentView {
    let online = state.bus.is_online_anywhere(ResourceKind::Agent, &agent.id);
    let acked = state.sync.acked_version(&agent.id);
    AgentView::new(agent, online, acked)
}

async fn publish_change(state: &AppState, change: fleet_db::RuleChange) -> RuleChangeResponse {
    let rule = change.current.clone().map(RuleView::from);
    let deliveries = state
        .sync
        .apply_rule_change(&change)
        .await
        .into_iter()
        .map(|(agent_id, result)| match result {
            Ok(delivery) => AgentDelivery::delivered(agent_id, delivery),
            Err(SyncError::Offline(_)) => {
                AgentDelivery::failed(agent_id, "offline", "Agent offline; synced on reconnect".to_string())
            }
            Err(e) => AgentDelivery::failed(agent_id, "failed", e.to_string()),
        })
        .collect();
    RuleChangeResponse { rule, deliveries }
}

async fn send_command(
    state: &AppState,
    kind: ResourceKind,
    id: &str,
    req: CommandRequest,
) -> Result<(StatusCode, Json<CommandResponse>), ApiError> {
    let action: CommandAction = serde_json::from_value(serde_json::Value::String(req.action.clone()))
        .map_err(|_| ApiError::BadRequest(format!("Unknown command action: {}", req.action)))?;

    let command = Command::new(action, req.payload);
    let command_id = command.command_id.clone();
    let envelope = command_envelope(id, command).map_err(|e| ApiError::Internal(e.to_string()))?;

    let delivery = match state.hub.send(kind, id, &envelope) {
        Ok(()) => Delivery::Local,
        Err(SendError::NotConnected { .. }) => {
            state
                .bus
                .publish_command(kind, id, envelope)
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))?;
            Delivery::Relayed
        }
        Err(e) => return Err(ApiError::Conflict(e.to_string())),
    };

    info!(%kind, id, %action, %command_id, delivery = delivery_name(delivery), "Command sent");
    Ok((
        StatusCode::ACCEPTED,
        Json(CommandResponse {
            command_id,
            delivery: delivery_name(delivery).to_string(),
            online: state.bus.is_online_anywhere(kind, id),
        }),
    ))
}
