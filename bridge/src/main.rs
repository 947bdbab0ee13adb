use anyhow::Result;
use bridge::config::{Args, Config};
use bridge::listener;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = Arc::new(Config::load(&args)?);
    if config.auth_token.is_some() {
        info!("bearer token authentication enabled");
    }
    info!(
        "agents: discovery {}, daily {}",
        config.discovery_agent,
        config.daily_agent.as_deref().unwrap_or("(discovery)")
    );

    let addr: SocketAddr = format!("{}:{}", args.address, args.port).parse()?;
    info!("Listening on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    listener::serve(listener, config).await
}
