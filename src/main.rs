#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use dotenv::dotenv;
use poem::{EndpointExt, Route, Server, listener::TcpListener, middleware::Tracing};
use poem_mcpserver::{McpServer, streamable_http};
use tracing::info;
use tunnel_broker::mcp::TunnelTools;
use tunnel_broker::tunnel::{BrokerConfig, TunnelBroker};

/// How long in-flight MCP requests get to finish after Ctrl-C
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();

    let config = BrokerConfig::from_env();
    info!(
        "Port pools: standard {}, reverse {}, sshd {}",
        config.standard_ports, config.reverse_ports, config.sshd_ports
    );
    let broker = Arc::new(TunnelBroker::new(config)?);

    let mcp_port: u16 = std::env::var("MCP_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);
    let mcp_addr = format!("0.0.0.0:{}", mcp_port);
    info!("Starting MCP server on {}", mcp_addr);

    let tools = TunnelTools::new(broker.clone());
    let app = Route::new()
        .at(
            "/",
            streamable_http::endpoint(move |_| McpServer::new().tools(tools.clone())),
        )
        .with(Tracing);

    info!("Tunnel broker is ready");
    info!("Use create_standard_tunnel or create_reverse_tunnel to provision tunnels");

    Server::new(TcpListener::bind(mcp_addr))
        .name("Tunnel Broker")
        .run_with_graceful_shutdown(
            app,
            async {
                let _ = tokio::signal::ctrl_c().await;
                info!("Shutdown requested");
            },
            Some(SHUTDOWN_TIMEOUT),
        )
        .await?;

    info!("Deleting all tunnels");
    broker.delete_all().await;

    Ok(())
}
