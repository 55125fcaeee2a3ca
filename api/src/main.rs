use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use relay_gateway::backend::HttpBackendClient;
use relay_gateway::config::GatewayConfig;
use relay_gateway::workspace::BackendWorkspaceAuthority;
use relay_gateway::Gateway;

mod auth;
mod error;
mod middleware;
mod routes;
mod state;

const WORKSPACE_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Relay Gateway API",
        version = "0.1.0",
        description = "Tool governance and task dispatch gateway. Agents speak MCP at /mcp; \
                       workers lease tasks via /v1/dispatch."
    ),
    paths(
        routes::health::health_check,
        routes::confirm::issue_confirmation,
        routes::dispatch::next_tasks,
        routes::dispatch::ack_task,
        routes::dispatch::progress_task,
        routes::dispatch::submit_result,
        routes::dispatch::list_inflight,
        routes::dispatch::enqueue_task,
    ),
    components(schemas(
        HealthResponse,
        relay_core::error::ApiError,
        relay_core::dispatch::TaskStatus,
        relay_core::dispatch::TerminalStatus,
        relay_core::dispatch::AttachmentEncoding,
        relay_core::dispatch::Attachment,
        relay_core::dispatch::TaskLease,
        relay_core::dispatch::TaskOutcome,
        relay_core::dispatch::SubmitReceipt,
        routes::confirm::IssueConfirmationRequest,
        routes::confirm::IssueConfirmationResponse,
        routes::dispatch::NextTasksRequest,
        routes::dispatch::TaskListResponse,
        routes::dispatch::AckRequest,
        routes::dispatch::ProgressRequest,
        routes::dispatch::SubmitResultRequest,
        routes::dispatch::EnqueueRequest,
        routes::dispatch::EnqueueResponse,
    )),
    modifiers(&SecurityAddon)
)]
struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            utoipa::openapi::security::SecurityScheme::Http(
                utoipa::openapi::security::Http::new(
                    utoipa::openapi::security::HttpAuthScheme::Bearer,
                ),
            ),
        );
    }
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[tokio::main]
async fn main() {
    // Load .env if present (dev only)
    let _ = dotenvy::dotenv();

    // Structured JSON logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_api=debug,relay_gateway=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let backend_url =
        std::env::var("RELAY_BACKEND_URL").expect("RELAY_BACKEND_URL must be set");
    let backend_token = std::env::var("RELAY_BACKEND_SERVICE_TOKEN")
        .ok()
        .filter(|token| !token.trim().is_empty());

    let config = GatewayConfig::from_env();
    let backend = Arc::new(
        HttpBackendClient::new(backend_url, backend_token, &config)
            .expect("Failed to build backend client"),
    );
    let workspace = Arc::new(BackendWorkspaceAuthority::new(
        backend.clone(),
        WORKSPACE_CACHE_TTL,
    ));
    let gateway = Arc::new(Gateway::new(config, backend, workspace));

    let auth_config = auth::AuthConfig::from_env();
    if auth_config.open_mode() {
        tracing::warn!(
            event = "auth_open_mode",
            "RELAY_API_KEYS is not set; accepting any bearer token (development mode)"
        );
    }

    let app_state = state::AppState {
        gateway,
        auth: auth_config,
    };

    let cors_layer = middleware::cors::build_cors_layer();

    let app = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .merge(routes::health::router())
        .merge(routes::mcp_http::router().layer(middleware::rate_limit::mcp_layer()))
        .merge(routes::dispatch::worker_router().layer(middleware::rate_limit::dispatch_layer()))
        .merge(routes::dispatch::enqueue_router())
        .merge(routes::confirm::router().layer(middleware::rate_limit::confirm_layer()))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer),
        )
        .with_state(app_state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Relay API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .unwrap();
}
