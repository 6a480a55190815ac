//! In-process fakes for the backend: an axum server speaking STOMP over WebSocket and a
//! scripted [`Transport`].

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use tokio::sync::broadcast;

use crate::stomp::{decode_all, Frame};
use crate::transport::{FrameStream, Transport, TransportError};

pub async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

#[derive(Clone, Debug)]
enum ServerCmd {
    Push(String),
    Raw(String),
    Kick,
}

#[derive(Default)]
struct ScriptState {
    initial: Vec<String>,
    reject: Option<String>,
    heart_beat: String,
    destination: Option<String>,
    authorization: Option<String>,
    connects: usize,
    subscribes: usize,
}

/// Behaviour and recorded traffic of the fake STOMP broker.
#[derive(Clone)]
pub struct StompScript {
    state: Arc<Mutex<ScriptState>>,
    live: broadcast::Sender<ServerCmd>,
}

impl StompScript {
    /// Sends `initial` to every subscriber right after it subscribes.
    pub fn messages(initial: Vec<String>) -> Self {
        let (live, _) = broadcast::channel(64);
        Self {
            state: Arc::new(Mutex::new(ScriptState {
                initial,
                heart_beat: "0,0".into(),
                ..Default::default()
            })),
            live,
        }
    }

    /// Answers CONNECT with an ERROR frame.
    pub fn reject(reason: &str) -> Self {
        let script = Self::messages(Vec::new());
        script.state.lock().unwrap().reject = Some(reason.into());
        script
    }

    pub fn with_server_heart_beat(self, value: &str) -> Self {
        self.state.lock().unwrap().heart_beat = value.into();
        self
    }

    pub fn subscribed_to(&self) -> Option<String> {
        self.state.lock().unwrap().destination.clone()
    }

    pub fn authorization(&self) -> Option<String> {
        self.state.lock().unwrap().authorization.clone()
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    /// Sends a MESSAGE to every connected subscriber.
    pub fn push(&self, body: &str) {
        let _ = self.live.send(ServerCmd::Push(body.into()));
    }

    /// Sends `text` verbatim as one WebSocket message to every subscriber.
    pub fn push_raw(&self, text: &str) {
        let _ = self.live.send(ServerCmd::Raw(text.into()));
    }

    /// Drops every open connection.
    pub fn kick(&self) {
        let _ = self.live.send(ServerCmd::Kick);
    }

    pub async fn wait_for_subscribes(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.state.lock().unwrap().subscribes < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("subscriber never arrived");
    }
}

pub fn stomp_router(script: StompScript) -> Router {
    Router::new().route(
        "/ws",
        get(move |ws: WebSocketUpgrade| {
            let script = script.clone();
            async move { ws.on_upgrade(move |socket| stomp_session(socket, script)) }
        }),
    )
}

async fn send_frame(socket: &mut WebSocket, frame: Frame) -> bool {
    socket.send(Message::Text(frame.encode())).await.is_ok()
}

fn message_frame(subscription: &str, body: &str) -> Frame {
    Frame::new("MESSAGE")
        .header("destination", "/topic/data-changes")
        .header("subscription", subscription)
        .header("message-id", uuid::Uuid::new_v4().to_string())
        .with_body(body)
}

async fn stomp_session(mut socket: WebSocket, script: StompScript) {
    let mut live = script.live.subscribe();
    let mut subscription: Option<String> = None;

    loop {
        tokio::select! {
            inbound = socket.recv() => {
                let Some(Ok(msg)) = inbound else { return };
                let Message::Text(text) = msg else { continue };
                for frame in decode_all(&text).unwrap_or_default() {
                    match frame.command.as_str() {
                        "CONNECT" | "STOMP" => {
                            let (reject, heart_beat) = {
                                let mut state = script.state.lock().unwrap();
                                state.connects += 1;
                                state.authorization = frame.get("Authorization").map(String::from);
                                (state.reject.clone(), state.heart_beat.clone())
                            };
                            if let Some(reason) = reject {
                                let error = Frame::new("ERROR").header("message", reason);
                                send_frame(&mut socket, error).await;
                                return;
                            }
                            let connected = Frame::new("CONNECTED")
                                .header("version", "1.2")
                                .header("heart-beat", heart_beat);
                            if !send_frame(&mut socket, connected).await {
                                return;
                            }
                        }
                        "SUBSCRIBE" => {
                            let id = frame.get("id").unwrap_or_default().to_string();
                            let initial = {
                                let mut state = script.state.lock().unwrap();
                                state.subscribes += 1;
                                state.destination = frame.get("destination").map(String::from);
                                state.initial.clone()
                            };
                            for body in initial {
                                if !send_frame(&mut socket, message_frame(&id, &body)).await {
                                    return;
                                }
                            }
                            subscription = Some(id);
                        }
                        _ => {}
                    }
                }
            }
            cmd = live.recv() => match cmd {
                Ok(ServerCmd::Push(body)) => {
                    if let Some(id) = &subscription {
                        if !send_frame(&mut socket, message_frame(id, &body)).await {
                            return;
                        }
                    }
                }
                Ok(ServerCmd::Raw(text)) => {
                    if subscription.is_some() && socket.send(Message::Text(text)).await.is_err() {
                        return;
                    }
                }
                Ok(ServerCmd::Kick) | Err(_) => return,
            }
        }
    }
}

/// What one `open()` call of a [`ScriptedTransport`] does.
pub enum Outcome {
    Fail,
    /// Yields the bodies, then stays open.
    Hold(Vec<String>),
    /// Yields the bodies, then the connection ends.
    End(Vec<String>),
    /// Connects, then panics on the first read.
    Panic,
}

/// Plays back one [`Outcome`] per `open()`; fails once the script is exhausted.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Outcome>>,
    opens: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Outcome>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            opens: AtomicUsize::new(0),
        })
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn open(&self) -> Result<FrameStream, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let outcome = self.script.lock().unwrap().pop_front().unwrap_or(Outcome::Fail);
        match outcome {
            Outcome::Fail => Err(TransportError::Closed),
            Outcome::Hold(bodies) => Ok(Box::pin(
                futures::stream::iter(bodies.into_iter().map(Ok::<String, TransportError>))
                    .chain(futures::stream::pending()),
            )),
            Outcome::End(bodies) => Ok(Box::pin(futures::stream::iter(
                bodies.into_iter().map(Ok::<String, TransportError>),
            ))),
            Outcome::Panic => Ok(Box::pin(futures::stream::poll_fn(
                |_| -> std::task::Poll<Option<Result<String, TransportError>>> {
                    panic!("frame decoder exploded")
                },
            ))),
        }
    }
}
