use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, Stream, StreamExt};
use reqwest::Client;
use tokio::net::TcpStream;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_stream::wrappers::LinesStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::SessionStore;
use crate::config::{Config, TransportKind};
use crate::stomp::{self, Frame, HeartBeat, StompError};

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("stomp error: {0}")]
    Stomp(#[from] StompError),
    #[error("server rejected the connection: {0}")]
    Rejected(String),
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("no traffic from server within {0:?}")]
    HeartbeatTimeout(Duration),
    #[error("connection closed during handshake")]
    Closed,
    #[error("stream error: {0}")]
    Stream(String),
}

/// Raw message bodies received on the live channel, in arrival order. The stream ends or yields
/// an error when the connection is lost.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// One way of reaching the server's push channel.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Opens a connection subscribed to the change-notification topic.
    async fn open(&self) -> Result<FrameStream, TransportError>;
}

pub fn build_transport(config: &Config, session: SessionStore) -> Arc<dyn Transport> {
    let ws = || -> Arc<dyn Transport> {
        Arc::new(WsTransport::new(
            config.live_ws_url.clone(),
            config.live_topic.clone(),
            (config.heartbeat_outgoing_ms, config.heartbeat_incoming_ms),
            config.connect_timeout(),
            session.clone(),
        ))
    };
    let stream = || -> Arc<dyn Transport> {
        Arc::new(StreamTransport::new(
            config.live_stream_url.clone(),
            config.connect_timeout(),
            session.clone(),
        ))
    };

    match config.live_transport {
        TransportKind::WebSocket => ws(),
        TransportKind::Stream => stream(),
        TransportKind::Auto => Arc::new(FallbackTransport::new(ws(), stream())),
    }
}

type WsConnection = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// STOMP over a native WebSocket.
pub struct WsTransport {
    url: String,
    topic: String,
    heart_beat: (u64, u64),
    connect_timeout: Duration,
    session: SessionStore,
}

impl WsTransport {
    /// `heart_beat` is the client's `(outgoing, incoming)` wish in milliseconds.
    pub fn new(
        url: String,
        topic: String,
        heart_beat: (u64, u64),
        connect_timeout: Duration,
        session: SessionStore,
    ) -> Self {
        Self {
            url,
            topic,
            heart_beat,
            connect_timeout,
            session,
        }
    }

    async fn handshake(&self) -> Result<WsSession, TransportError> {
        let (mut ws, _response) = tokio_tungstenite::connect_async(self.url.as_str()).await?;

        let host = reqwest::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(String::from))
            .unwrap_or_else(|| "localhost".into());
        let mut connect = Frame::new("CONNECT")
            .header("accept-version", "1.2,1.1,1.0")
            .header("host", host)
            .header(
                "heart-beat",
                format!("{},{}", self.heart_beat.0, self.heart_beat.1),
            );
        if let Some(token) = self.session.token() {
            connect = connect.header("Authorization", format!("Bearer {token}"));
        }
        ws.send(Message::Text(connect.encode())).await?;

        let server_heart_beat = 'handshake: loop {
            let text = match ws.next().await.ok_or(TransportError::Closed)?? {
                Message::Text(text) => text,
                Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Message::Close(_) => return Err(TransportError::Closed),
                _ => continue,
            };
            for frame in stomp::decode_all(&text)? {
                match frame.command.as_str() {
                    "CONNECTED" => {
                        let hb = match frame.get("heart-beat") {
                            Some(v) => stomp::parse_heart_beat(v)?,
                            None => (0, 0),
                        };
                        break 'handshake hb;
                    }
                    "ERROR" => return Err(TransportError::Rejected(error_message(&frame))),
                    other => debug!(command = other, "ignoring frame before CONNECTED"),
                }
            }
        };

        let heart_beat = stomp::negotiate_heart_beat(self.heart_beat, server_heart_beat);
        let subscription_id = format!("sub-{}", Uuid::new_v4());
        let subscribe = Frame::new("SUBSCRIBE")
            .header("id", subscription_id.as_str())
            .header("destination", self.topic.as_str())
            .header("ack", "auto");
        ws.send(Message::Text(subscribe.encode())).await?;

        info!(url = %self.url, topic = %self.topic, ?heart_beat, "stomp session established");
        Ok(WsSession::new(ws, subscription_id, heart_beat))
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn open(&self) -> Result<FrameStream, TransportError> {
        let session = tokio::time::timeout(self.connect_timeout, self.handshake())
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout))??;
        Ok(session.into_stream())
    }
}

fn error_message(frame: &Frame) -> String {
    match (frame.get("message"), frame.body.trim()) {
        (Some(message), "") => message.to_string(),
        (Some(message), body) => format!("{message}: {body}"),
        (None, body) => body.to_string(),
    }
}

enum WsEvent {
    Inbound(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
    SendHeartbeat,
    Silent,
}

struct WsSession {
    ws: WsConnection,
    subscription_id: String,
    outgoing: Option<Interval>,
    silence_limit: Option<Duration>,
    last_seen: Instant,
    pending: VecDeque<String>,
    done: bool,
}

impl WsSession {
    fn new(ws: WsConnection, subscription_id: String, heart_beat: HeartBeat) -> Self {
        let outgoing = heart_beat.send_every.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        Self {
            ws,
            subscription_id,
            outgoing,
            silence_limit: heart_beat.expect_every.map(|d| d * 2),
            last_seen: Instant::now(),
            pending: VecDeque::new(),
            done: false,
        }
    }

    fn into_stream(self) -> FrameStream {
        Box::pin(futures::stream::unfold(self, |mut session| async move {
            let item = session.next_body().await?;
            Some((item, session))
        }))
    }

    async fn next_body(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            if let Some(body) = self.pending.pop_front() {
                return Some(Ok(body));
            }
            if self.done {
                return None;
            }

            let deadline = self.silence_limit.map(|limit| self.last_seen + limit);
            let event = {
                let ws = &mut self.ws;
                let outgoing = &mut self.outgoing;
                tokio::select! {
                    msg = ws.next() => WsEvent::Inbound(msg),
                    _ = tick(outgoing) => WsEvent::SendHeartbeat,
                    _ = sleep_until(deadline) => WsEvent::Silent,
                }
            };

            match event {
                WsEvent::Inbound(None) => {
                    debug!("websocket stream ended");
                    self.done = true;
                }
                WsEvent::Inbound(Some(Err(e))) => return Some(self.fail(e.into())),
                WsEvent::Inbound(Some(Ok(msg))) => {
                    self.last_seen = Instant::now();
                    match msg {
                        Message::Text(text) => {
                            if let Err(e) = self.handle_text(&text) {
                                return Some(self.fail(e));
                            }
                        }
                        Message::Binary(bytes) => {
                            if let Err(e) = self.handle_text(&String::from_utf8_lossy(&bytes)) {
                                return Some(self.fail(e));
                            }
                        }
                        Message::Close(frame) => {
                            debug!(?frame, "server closed websocket");
                            self.done = true;
                        }
                        _ => {}
                    }
                }
                WsEvent::SendHeartbeat => {
                    if let Err(e) = self.ws.send(Message::Text("\n".into())).await {
                        return Some(self.fail(e.into()));
                    }
                }
                WsEvent::Silent => {
                    let limit = self.silence_limit.unwrap_or_default();
                    return Some(self.fail(TransportError::HeartbeatTimeout(limit)));
                }
            }
        }
    }

    fn handle_text(&mut self, text: &str) -> Result<(), TransportError> {
        for decoded in stomp::decode_frames(text) {
            let frame = match decoded {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "dropping undecodable stomp frame");
                    continue;
                }
            };
            match frame.command.as_str() {
                "MESSAGE" => {
                    let ours = frame
                        .get("subscription")
                        .map_or(true, |id| id == self.subscription_id);
                    if ours {
                        self.pending.push_back(frame.body);
                    } else {
                        debug!(subscription = ?frame.get("subscription"), "message for another subscription");
                    }
                }
                "ERROR" => return Err(TransportError::Rejected(error_message(&frame))),
                other => debug!(command = other, "ignoring stomp frame"),
            }
        }
        Ok(())
    }

    fn fail(&mut self, error: TransportError) -> Result<String, TransportError> {
        self.done = true;
        self.pending.clear();
        Err(error)
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Newline-delimited JSON over a long-lived HTTP response. Blank lines are keep-alives.
pub struct StreamTransport {
    client: Client,
    url: String,
    connect_timeout: Duration,
    session: SessionStore,
}

impl StreamTransport {
    pub fn new(url: String, connect_timeout: Duration, session: SessionStore) -> Self {
        Self {
            client: Client::new(),
            url,
            connect_timeout,
            session,
        }
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn name(&self) -> &'static str {
        "stream"
    }

    async fn open(&self) -> Result<FrameStream, TransportError> {
        use tokio::io::AsyncBufReadExt;

        let mut request = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "application/x-ndjson");
        if let Some(token) = self.session.token() {
            request = request.bearer_auth(token);
        }

        let resp = tokio::time::timeout(self.connect_timeout, request.send())
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout))??
            .error_for_status()?;
        info!(url = %self.url, "change stream opened");

        let reader = tokio_util::io::StreamReader::new(
            resp.bytes_stream().map(|r| r.map_err(std::io::Error::other)),
        );
        let lines = LinesStream::new(tokio::io::BufReader::new(reader).lines());

        let stream = lines.filter_map(|line_result| async move {
            match line_result {
                Ok(line) if line.trim().is_empty() => None,
                Ok(line) => Some(Ok(line)),
                Err(e) => Some(Err(TransportError::Stream(e.to_string()))),
            }
        });
        Ok(Box::pin(stream))
    }
}

/// Tries `primary` first and falls back to `fallback` when it cannot connect.
pub struct FallbackTransport {
    primary: Arc<dyn Transport>,
    fallback: Arc<dyn Transport>,
}

impl FallbackTransport {
    pub fn new(primary: Arc<dyn Transport>, fallback: Arc<dyn Transport>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl Transport for FallbackTransport {
    fn name(&self) -> &'static str {
        "auto"
    }

    async fn open(&self) -> Result<FrameStream, TransportError> {
        match self.primary.open().await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                warn!(
                    transport = self.primary.name(),
                    fallback = self.fallback.name(),
                    error = %e,
                    "primary transport failed, falling back"
                );
                self.fallback.open().await
            }
        }
    }
}
