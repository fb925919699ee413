//! HTTP surface of the control plane
//!
//! Agents and nodes connect through `/ws/agent` and `/ws/node`; operators use
//! the admin-token protected `/api` routes.

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod ws;

use axum::{
    http::{header, Method},
    middleware as axum_middleware,
    routing::{delete, get, post, put},
    Json, Router,
};
use fleet_auth::HandshakeTokens;
use fleet_chain::{HealthTracker, LoadBalancer};
use fleet_control::{AlertTracker, ConfigSyncService, EventBus, Hub, ProbeService};
use fleet_db::FleetStore;
use std::{future::Future, net::SocketAddr, sync::Arc};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};

pub use error::ApiError;
pub use middleware::JwtState;

/// Application state shared across handlers
pub struct AppState {
    pub store: Arc<dyn FleetStore>,
    pub hub: Arc<Hub>,
    pub bus: Arc<EventBus>,
    pub sync: Arc<ConfigSyncService>,
    pub probe: Arc<ProbeService>,
    pub health: Arc<HealthTracker>,
    pub balancer: Arc<LoadBalancer>,
    pub alerts: Arc<AlertTracker>,
    pub tokens: Arc<HandshakeTokens>,
    pub jwt: Arc<JwtState>,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Fleet Control API",
        version = "0.1.0",
        description = "Control plane for a fleet of forwarding agents"
    ),
    paths(
        handlers::health_check,
        handlers::list_agents,
        handlers::get_agent,
        handlers::upsert_agent,
        handlers::disconnect_agent,
        handlers::sync_agent,
        handlers::agent_command,
        handlers::get_node,
        handlers::upsert_node,
        handlers::node_command,
        handlers::list_rules,
        handlers::get_rule,
        handlers::create_rule,
        handlers::update_rule,
        handlers::delete_rule,
        handlers::probe_rule,
        handlers::rule_health,
        handlers::list_alerts,
        handlers::status_events,
        handlers::redeem_handshake,
        ws::agent_ws,
        ws::node_ws,
    ),
    components(
        schemas(
            models::ErrorResponse,
            models::HealthResponse,
            models::AgentView,
            models::AgentList,
            models::UpsertAgentRequest,
            models::NodeRequest,
            models::NodeView,
            models::ExitAgentBody,
            models::RuleRequest,
            models::RuleView,
            models::RuleList,
            models::AgentDelivery,
            models::RuleChangeResponse,
            models::SyncResponse,
            models::ProbeResponse,
            models::ExitHealthView,
            models::RuleHealthResponse,
            models::CommandRequest,
            models::CommandResponse,
            models::RedeemRequest,
            models::RedeemResponse,
            models::AlertView,
            models::AlertList,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "agents", description = "Agent management, sync and commands"),
        (name = "nodes", description = "Node management and commands"),
        (name = "rules", description = "Forwarding rules, probes and exit health"),
        (name = "alerts", description = "Offline alerts and status event stream"),
        (name = "connections", description = "Agent and node connection endpoints"),
        (name = "health", description = "Service health")
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Address to bind the API server
    pub bind_addr: SocketAddr,
    /// Enable permissive CORS (for dashboards served elsewhere)
    pub enable_cors: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            enable_cors: false,
        }
    }
}

/// API Server
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: Arc<AppState>) -> Self {
        Self { config, state }
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let public_router = Router::new()
            .route("/api/health", get(handlers::health_check))
            .route("/api/openapi.json", get(openapi_json))
            // Connection endpoints authenticate their own subject
            .route("/ws/agent", get(ws::agent_ws))
            .route("/ws/node", get(ws::node_ws))
            .route("/api/handshake/redeem", post(handlers::redeem_handshake))
            .with_state(self.state.clone());

        let admin_router = Router::new()
            .route("/api/agents", get(handlers::list_agents))
            .route(
                "/api/agents/{id}",
                get(handlers::get_agent).put(handlers::upsert_agent),
            )
            .route("/api/agents/{id}/session", delete(handlers::disconnect_agent))
            .route("/api/agents/{id}/sync", post(handlers::sync_agent))
            .route("/api/agents/{id}/commands", post(handlers::agent_command))
            .route(
                "/api/nodes/{id}",
                get(handlers::get_node).put(handlers::upsert_node),
            )
            .route("/api/nodes/{id}/commands", post(handlers::node_command))
            .route(
                "/api/rules",
                get(handlers::list_rules).post(handlers::create_rule),
            )
            .route(
                "/api/rules/{id}",
                get(handlers::get_rule)
                    .put(handlers::update_rule)
                    .delete(handlers::delete_rule),
            )
            .route("/api/rules/{id}/probe", post(handlers::probe_rule))
            .route("/api/rules/{id}/health", get(handlers::rule_health))
            .route("/api/alerts", get(handlers::list_alerts))
            .route("/api/events", get(handlers::status_events))
            .with_state(self.state.clone())
            .layer(axum_middleware::from_fn_with_state(
                self.state.jwt.clone(),
                middleware::require_admin,
            ));

        let mut router = public_router
            .merge(admin_router)
            .layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            router = router.layer(
                CorsLayer::new()
                    .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
                    .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
                    .allow_origin(Any),
            );
        }

        router
    }

    /// Serve until `shutdown` resolves
    pub async fn start<F>(self, shutdown: F) -> Result<(), anyhow::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.build_router();

        info!("Starting API server on {}", self.config.bind_addr);
        info!(
            "OpenAPI spec: http://{}/api/openapi.json",
            self.config.bind_addr
        );

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        info!("API server stopped");
        Ok(())
    }
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
