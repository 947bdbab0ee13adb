//! Agent-side session establishment.
//!
//! The provider prefers short-lived signed WebSocket URLs issued over HTTPS;
//! when that path fails for any reason (non-2xx, timeout, malformed body,
//! handshake error) we fall back once to the direct endpoint with the API
//! key in a request header. Everything past the handshake is the call's
//! business.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::http::{Request, Uri};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{info, warn};

use crate::config::Config;

pub type AgentSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Which transport the agent session ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    SignedUrl,
    Direct,
}

const SIGNED_URL_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Deserialize)]
struct SignedUrlResponse {
    signed_url: String,
}

/// Open the agent WebSocket: signed URL first, direct WSS as the one-shot
/// fallback.
pub async fn connect(config: &Config, agent_id: &str) -> Result<(AgentSocket, Route)> {
    match connect_signed(config, agent_id).await {
        Ok(ws) => Ok((ws, Route::SignedUrl)),
        Err(e) => {
            warn!("signed-url connect failed ({e:#}), falling back to direct endpoint");
            let ws = connect_direct(config, agent_id)
                .await
                .context("direct connect failed")?;
            Ok((ws, Route::Direct))
        }
    }
}

async fn connect_signed(config: &Config, agent_id: &str) -> Result<AgentSocket> {
    let client = reqwest::Client::builder()
        .timeout(SIGNED_URL_TIMEOUT)
        .build()?;
    let response = client
        .get(&config.signed_url_endpoint)
        .query(&[("agent_id", agent_id)])
        .header("xi-api-key", &config.api_key)
        .send()
        .await?
        .error_for_status()?;
    let body: SignedUrlResponse = response.json().await?;
    let (ws, _) = connect_async(&body.signed_url).await?;
    info!("agent connected via signed url");
    Ok(ws)
}

/// Direct connection with the API key as a header. Also used for the single
/// mid-handshake retry after a signed transport dies early.
pub async fn connect_direct(config: &Config, agent_id: &str) -> Result<AgentSocket> {
    let url = format!("{}?agent_id={}", config.ws_endpoint, agent_id);
    let uri: Uri = url.parse().with_context(|| format!("bad ws endpoint {url}"))?;
    let host = uri.host().context("ws endpoint has no host")?;
    let host = match uri.port_u16() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let request = Request::builder()
        .uri(&url)
        .header("Host", host)
        .header("xi-api-key", &config.api_key)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", generate_key())
        .body(())?;
    let (ws, _) = connect_async(request).await?;
    info!("agent connected via direct endpoint");
    Ok(ws)
}
