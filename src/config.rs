use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    WebSocket,
    Stream,
    Auto,
}

impl std::str::FromStr for TransportKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "websocket" | "ws" => Ok(Self::WebSocket),
            "stream" | "http" => Ok(Self::Stream),
            "auto" => Ok(Self::Auto),
            other => bail!("unknown transport kind '{other}'"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub api_base_url: String,
    pub live_transport: TransportKind,
    pub live_ws_url: String,
    pub live_stream_url: String,
    pub live_topic: String,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub heartbeat_incoming_ms: u64,
    pub heartbeat_outgoing_ms: u64,
    pub connect_timeout_ms: u64,
    pub http_timeout_ms: u64,
    pub notification_buffer: usize,
    pub resync_concurrency: usize,
    pub resync_on_reconnect: bool,
    pub session_file: Option<PathBuf>,
    pub preload_resources: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080/api".into(),
            live_transport: TransportKind::Auto,
            live_ws_url: "ws://localhost:8080/ws/websocket".into(),
            live_stream_url: "http://localhost:8080/api/data-changes/stream".into(),
            live_topic: "/topic/data-changes".into(),
            reconnect_delay_ms: 3000,
            max_reconnect_attempts: 5,
            heartbeat_incoming_ms: 4000,
            heartbeat_outgoing_ms: 4000,
            connect_timeout_ms: 10_000,
            http_timeout_ms: 30_000,
            notification_buffer: 256,
            resync_concurrency: 4,
            resync_on_reconnect: true,
            session_file: None,
            preload_resources: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let api_base_url = lookup("API_BASE_URL").unwrap_or(defaults.api_base_url);
        let live_transport = match lookup("LIVE_TRANSPORT") {
            Some(v) => v.parse().context("LIVE_TRANSPORT must be websocket, stream or auto")?,
            None => defaults.live_transport,
        };
        let live_ws_url = lookup("LIVE_WS_URL").unwrap_or(defaults.live_ws_url);
        let live_stream_url = lookup("LIVE_STREAM_URL").unwrap_or(defaults.live_stream_url);
        let live_topic = lookup("LIVE_TOPIC").unwrap_or(defaults.live_topic);
        let reconnect_delay_ms = lookup("RECONNECT_DELAY_MS")
            .unwrap_or_else(|| defaults.reconnect_delay_ms.to_string())
            .parse()
            .context("RECONNECT_DELAY_MS must be a number")?;
        let max_reconnect_attempts = lookup("MAX_RECONNECT_ATTEMPTS")
            .unwrap_or_else(|| defaults.max_reconnect_attempts.to_string())
            .parse()
            .context("MAX_RECONNECT_ATTEMPTS must be a number")?;
        let heartbeat_incoming_ms = lookup("HEARTBEAT_INCOMING_MS")
            .unwrap_or_else(|| defaults.heartbeat_incoming_ms.to_string())
            .parse()
            .context("HEARTBEAT_INCOMING_MS must be a number")?;
        let heartbeat_outgoing_ms = lookup("HEARTBEAT_OUTGOING_MS")
            .unwrap_or_else(|| defaults.heartbeat_outgoing_ms.to_string())
            .parse()
            .context("HEARTBEAT_OUTGOING_MS must be a number")?;
        let connect_timeout_ms = lookup("CONNECT_TIMEOUT_MS")
            .unwrap_or_else(|| defaults.connect_timeout_ms.to_string())
            .parse()
            .context("CONNECT_TIMEOUT_MS must be a number")?;
        let http_timeout_ms = lookup("HTTP_TIMEOUT_MS")
            .unwrap_or_else(|| defaults.http_timeout_ms.to_string())
            .parse()
            .context("HTTP_TIMEOUT_MS must be a number")?;
        let notification_buffer: usize = lookup("NOTIFICATION_BUFFER")
            .unwrap_or_else(|| defaults.notification_buffer.to_string())
            .parse()
            .context("NOTIFICATION_BUFFER must be a number")?;
        if notification_buffer == 0 {
            bail!("NOTIFICATION_BUFFER must be greater than zero");
        }
        let resync_concurrency: usize = lookup("RESYNC_CONCURRENCY")
            .unwrap_or_else(|| defaults.resync_concurrency.to_string())
            .parse()
            .context("RESYNC_CONCURRENCY must be a number")?;
        let resync_on_reconnect = lookup("RESYNC_ON_RECONNECT")
            .unwrap_or_else(|| defaults.resync_on_reconnect.to_string())
            .parse()
            .context("RESYNC_ON_RECONNECT must be true or false")?;
        let session_file = lookup("SESSION_FILE")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);
        let preload_resources = lookup("PRELOAD_RESOURCES")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            api_base_url,
            live_transport,
            live_ws_url,
            live_stream_url,
            live_topic,
            reconnect_delay_ms,
            max_reconnect_attempts,
            heartbeat_incoming_ms,
            heartbeat_outgoing_ms,
            connect_timeout_ms,
            http_timeout_ms,
            notification_buffer,
            resync_concurrency: resync_concurrency.max(1),
            resync_on_reconnect,
            session_file,
            preload_resources,
        })
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}
