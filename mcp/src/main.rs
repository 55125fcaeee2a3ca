use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay_gateway::Gateway;
use relay_gateway::backend::HttpBackendClient;
use relay_gateway::config::GatewayConfig;
use relay_gateway::server::{GatewayServer, ServeArgs, stdio_client_id};
use relay_gateway::util::resolve_token;
use relay_gateway::workspace::BackendWorkspaceAuthority;

const WORKSPACE_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Parser)]
#[command(
    name = "relay-mcp",
    version,
    about = "Relay MCP server — tool governance gateway over stdio"
)]
struct Cli {
    /// Backend engine base URL
    #[arg(long, env = "RELAY_BACKEND_URL", default_value = "http://localhost:8080")]
    backend_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the MCP server over stdio
    Serve(ServeArgs),
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    // Stdout carries the MCP frames; logs go to stderr.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_gateway=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let Commands::Serve(args) = cli.command;

    let token = args.token.clone().or_else(resolve_token);
    let client_id = args
        .client_id
        .clone()
        .unwrap_or_else(|| stdio_client_id(token.as_deref()));

    let config = GatewayConfig::from_env();
    let backend = match HttpBackendClient::new(cli.backend_url.clone(), token, &config) {
        Ok(backend) => Arc::new(backend),
        Err(err) => {
            let payload = json!({
                "error": "backend_client_error",
                "message": err.to_string(),
            });
            eprintln!("{payload}");
            std::process::exit(1);
        }
    };
    let workspace = Arc::new(BackendWorkspaceAuthority::new(
        backend.clone(),
        WORKSPACE_CACHE_TTL,
    ));
    let gateway = Arc::new(Gateway::new(config, backend, workspace));

    let server = GatewayServer::new(gateway, client_id);
    match server.serve_stdio().await {
        Ok(()) => {}
        Err(err) => {
            let payload = json!({
                "error": "mcp_server_error",
                "message": err,
            });
            eprintln!("{payload}");
            std::process::exit(1);
        }
    }
}
