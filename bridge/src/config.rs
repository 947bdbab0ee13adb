//! Startup configuration. Everything is resolved once in `main` and shared
//! as an immutable `Arc<Config>`; nothing here changes after startup.

use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "bridge")]
pub struct Args {
    #[arg(short, long, default_value = "[::]", help = "address to listen on")]
    pub address: String,

    #[arg(short, long, default_value = "8080", help = "port to listen on")]
    pub port: u16,

    #[arg(long, help = "path to a file holding the AI provider API key")]
    pub api_key_file: String,

    #[arg(long, help = "agent id for discovery-mode calls")]
    pub discovery_agent: String,

    #[arg(
        long,
        help = "agent id for daily-mode calls (falls back to the discovery agent)"
    )]
    pub daily_agent: Option<String>,

    #[arg(
        long,
        help = "path to an optional bearer token the telephony side must present"
    )]
    pub token_file: Option<String>,

    #[arg(
        long,
        default_value = "api.elevenlabs.io",
        help = "AI provider host; signed-url and WebSocket endpoints derive from it"
    )]
    pub api_origin: String,

    #[arg(long, help = "full signed-url endpoint override")]
    pub signed_url_endpoint: Option<String>,

    #[arg(long, help = "full direct WebSocket endpoint override")]
    pub ws_endpoint: Option<String>,

    #[arg(
        long,
        default_value = "800",
        help = "caller silence that ends a turn, ms"
    )]
    pub silence_ms: u64,

    #[arg(long, default_value = "3000", help = "hard cap on a caller turn, ms")]
    pub utterance_max_ms: u64,

    #[arg(long, default_value = "200", help = "upstream audio packet size, ms")]
    pub buffer_ms: u64,

    #[arg(
        long,
        default_value = "1000",
        help = "how long to wait for agent metadata before assuming μ-law, ms"
    )]
    pub metadata_fallback_ms: u64,

    #[arg(
        long,
        default_value = "50",
        help = "log every Nth outbound frame (0 disables)"
    )]
    pub log_every: u64,
}

/// The call mode tag carried in the telephony start event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Discovery,
    Daily,
}

impl Mode {
    pub fn parse(tag: Option<&str>) -> Self {
        match tag {
            Some("daily") => Self::Daily,
            _ => Self::Discovery,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Daily => "daily",
        }
    }
}

#[derive(Debug)]
pub struct Config {
    pub api_key: String,
    pub auth_token: Option<String>,
    pub discovery_agent: String,
    pub daily_agent: Option<String>,
    pub signed_url_endpoint: String,
    pub ws_endpoint: String,
    pub silence: Duration,
    pub utterance_max: Duration,
    pub buffer_ms: u64,
    pub metadata_fallback: Duration,
    pub log_every: u64,
}

impl Config {
    pub fn load(args: &Args) -> Result<Self> {
        let api_key = read_secret(&args.api_key_file)?;
        let auth_token = args.token_file.as_deref().map(read_secret).transpose()?;
        let signed_url_endpoint = args.signed_url_endpoint.clone().unwrap_or_else(|| {
            format!(
                "https://{}/v1/convai/conversation/get_signed_url",
                args.api_origin
            )
        });
        let ws_endpoint = args
            .ws_endpoint
            .clone()
            .unwrap_or_else(|| format!("wss://{}/v1/convai/conversation", args.api_origin));
        Ok(Self {
            api_key,
            auth_token,
            discovery_agent: args.discovery_agent.clone(),
            daily_agent: args.daily_agent.clone(),
            signed_url_endpoint,
            ws_endpoint,
            silence: Duration::from_millis(args.silence_ms),
            utterance_max: Duration::from_millis(args.utterance_max_ms),
            buffer_ms: args.buffer_ms,
            metadata_fallback: Duration::from_millis(args.metadata_fallback_ms),
            log_every: args.log_every,
        })
    }

    /// Default agent for a call that named none in its start parameters.
    pub fn agent_for(&self, mode: Mode) -> &str {
        match mode {
            Mode::Daily => self.daily_agent.as_deref().unwrap_or(&self.discovery_agent),
            Mode::Discovery => &self.discovery_agent,
        }
    }

    /// Upstream packet size in 20 ms frames.
    pub fn packet_frames(&self) -> usize {
        (self.buffer_ms / bridge_protocol::FRAME_MS).max(1) as usize
    }
}

fn read_secret(path: &str) -> Result<String> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;
    Ok(contents.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            api_key: "k".into(),
            auth_token: None,
            discovery_agent: "disc".into(),
            daily_agent: None,
            signed_url_endpoint: String::new(),
            ws_endpoint: String::new(),
            silence: Duration::from_millis(800),
            utterance_max: Duration::from_millis(3000),
            buffer_ms: 200,
            metadata_fallback: Duration::from_millis(1000),
            log_every: 50,
        }
    }

    #[test]
    fn mode_parsing_defaults_to_discovery() {
        assert_eq!(Mode::parse(Some("daily")), Mode::Daily);
        assert_eq!(Mode::parse(Some("discovery")), Mode::Discovery);
        assert_eq!(Mode::parse(Some("garbage")), Mode::Discovery);
        assert_eq!(Mode::parse(None), Mode::Discovery);
    }

    #[test]
    fn daily_mode_falls_back_to_discovery_agent() {
        let mut c = config();
        assert_eq!(c.agent_for(Mode::Daily), "disc");
        c.daily_agent = Some("daily".into());
        assert_eq!(c.agent_for(Mode::Daily), "daily");
        assert_eq!(c.agent_for(Mode::Discovery), "disc");
    }

    #[test]
    fn packet_frames_from_buffer_ms() {
        let mut c = config();
        assert_eq!(c.packet_frames(), 10);
        c.buffer_ms = 0; // degenerate config still buffers one frame
        assert_eq!(c.packet_frames(), 1);
    }
}
