//! Accept loop, HTTP sniffing, and WebSocket upgrade.
//!
//! Telephony and plain HTTP probes share one port, so each accepted TCP
//! stream is peeked (never consumed) before the handshake: requests without
//! an `Upgrade: websocket` header are answered as health checks, upgrades
//! are validated for path and optional bearer token, and everything that
//! survives becomes a [`Call`].

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use crate::call::Call;
use crate::config::Config;

const WS_PATHS: &[&str] = &["/ws", "/media-stream"];
const HEALTH_PATHS: &[&str] = &["/health", "/", "/status"];

pub async fn serve(listener: TcpListener, config: Arc<Config>) -> Result<()> {
    while let Ok((stream, peer_addr)) = listener.accept().await {
        info!("Connection from {}", peer_addr);
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, config).await {
                error!("Connection error: {e:#}");
            }
        });
    }
    Ok(())
}

async fn handle_connection(stream: TcpStream, config: Arc<Config>) -> Result<()> {
    let request = peek_request(&stream).await?;
    let Some((path, query)) = parse_request_target(&request) else {
        return respond(stream, "400 Bad Request", "bad request\n").await;
    };

    if !is_upgrade(&request) {
        let (status, body) = if HEALTH_PATHS.contains(&path.as_str()) {
            ("200 OK", "bridge ok\n")
        } else {
            ("404 Not Found", "not found\n")
        };
        return respond(stream, status, body).await;
    }

    if !WS_PATHS.contains(&path.as_str()) {
        return respond(stream, "404 Not Found", "not found\n").await;
    }

    // A query token is checked here; its absence defers auth to the
    // telephony start event.
    let mut upgrade_authorized = false;
    if let Some(expected) = &config.auth_token {
        match query_param(&query, "token") {
            Some(token) if token == *expected => upgrade_authorized = true,
            Some(_) => {
                warn!("rejecting upgrade with bad token");
                return respond(stream, "401 Unauthorized", "unauthorized\n").await;
            }
            None => {}
        }
    }

    let ws = tokio_tungstenite::accept_async(stream).await?;
    Call::new(config, upgrade_authorized).run(ws).await
}

/// Peek the request head without consuming it, so the tungstenite handshake
/// still sees the full request afterwards.
async fn peek_request(stream: &TcpStream) -> Result<String> {
    let mut buf = [0u8; 2048];
    for _ in 0..100 {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            anyhow::bail!("connection closed before request");
        }
        let head = &buf[..n];
        if head.windows(4).any(|w| w == b"\r\n\r\n") || n == buf.len() {
            return Ok(String::from_utf8_lossy(head).into_owned());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    anyhow::bail!("timed out waiting for request headers");
}

fn parse_request_target(request: &str) -> Option<(String, String)> {
    let line = request.lines().next()?;
    let target = line.split_whitespace().nth(1)?;
    match target.split_once('?') {
        Some((path, query)) => Some((path.to_string(), query.to_string())),
        None => Some((target.to_string(), String::new())),
    }
}

fn is_upgrade(request: &str) -> bool {
    request.lines().any(|line| {
        line.split_once(':').is_some_and(|(name, value)| {
            name.trim().eq_ignore_ascii_case("upgrade")
                && value.trim().eq_ignore_ascii_case("websocket")
        })
    })
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

async fn respond(mut stream: TcpStream, status: &str, body: &str) -> Result<()> {
    // consume the peeked request so the close is clean
    let mut drain = [0u8; 2048];
    let _ = stream.try_read(&mut drain);
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const UPGRADE: &str = "GET /ws?token=abc HTTP/1.1\r\nHost: x\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n";
    const PLAIN: &str = "GET /health HTTP/1.1\r\nHost: x\r\n\r\n";

    #[test]
    fn detects_upgrade_requests() {
        assert!(is_upgrade(UPGRADE));
        assert!(!is_upgrade(PLAIN));
    }

    #[test]
    fn extracts_path_and_query() {
        assert_eq!(
            parse_request_target(UPGRADE),
            Some(("/ws".into(), "token=abc".into()))
        );
        assert_eq!(parse_request_target(PLAIN), Some(("/health".into(), String::new())));
        assert_eq!(parse_request_target(""), None);
    }

    #[test]
    fn finds_query_params() {
        assert_eq!(query_param("token=abc&x=1", "token").as_deref(), Some("abc"));
        assert_eq!(query_param("x=1", "token"), None);
        assert_eq!(query_param("", "token"), None);
    }
}
