use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (TSIRCD_LOG_JSON=1), human-readable otherwise.
    let json_logs = std::env::var("TSIRCD_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("tsircd=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .init();
    }

    let config = tsircd::config::ServerConfig::parse();
    tracing::info!(
        client_addr = %config.client_addr,
        peer_addr = %config.peer_addr,
        "starting {}",
        config.server_name
    );
    if !config.remote_servers.is_empty() {
        tracing::info!(peers = config.remote_servers.len(), "configured peer links");
    }

    let server = tsircd::server::Server::new(config);
    server.run().await
}
