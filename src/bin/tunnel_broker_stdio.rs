#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use dotenv::dotenv;
use poem_mcpserver::McpServer;
use tunnel_broker::mcp::TunnelTools;
use tunnel_broker::tunnel::{BrokerConfig, TunnelBroker};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // stdout carries the protocol
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let broker = Arc::new(TunnelBroker::new(BrokerConfig::from_env())?);
    let tools = TunnelTools::new(broker.clone());
    poem_mcpserver::stdio::stdio(McpServer::new().tools(tools)).await?;

    broker.delete_all().await;
    Ok(())
}
