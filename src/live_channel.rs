use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::{Stream, StreamExt};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::reconnect::{ReconnectPolicy, RetryDecision};
use crate::transport::{FrameStream, Transport, TransportError};
use crate::types::{ChangeNotification, ConnectionState};

/// Client side of the server's push channel.
///
/// Owns at most one connection at a time, reconnects with a fixed delay up to a fixed number of
/// attempts, and re-emits every well-formed change notification. It never touches the cache.
#[derive(Clone)]
pub struct LiveChannel {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    notifications: broadcast::Sender<ChangeNotification>,
    session: Mutex<Option<Session>>,
}

struct Session {
    cancel: CancellationToken,
    retry_pending: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

enum PumpEnd {
    Cancelled,
    Closed,
    Failed(TransportError),
}

impl LiveChannel {
    pub fn new(transport: Arc<dyn Transport>, policy: ReconnectPolicy, buffer: usize) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (notifications, _) = broadcast::channel(buffer.max(1));
        Self {
            inner: Arc::new(Inner {
                transport,
                policy,
                state,
                notifications,
                session: Mutex::new(None),
            }),
        }
    }

    pub fn from_config(config: &Config, transport: Arc<dyn Transport>) -> Self {
        let policy = ReconnectPolicy::new(config.max_reconnect_attempts, config.reconnect_delay());
        Self::new(transport, policy, config.notification_buffer)
    }

    /// Starts connecting. No-op while connecting or connected; cancels a pending retry otherwise.
    pub fn connect(&self) {
        let mut slot = self.inner.lock_session();

        let current = *self.inner.state.borrow();
        if current != ConnectionState::Disconnected {
            debug!(state = ?current, "connect ignored, live channel already active");
            return;
        }

        if let Some(previous) = slot.take() {
            previous.cancel.cancel();
            previous.handle.abort();
        }

        self.inner.state.send_replace(ConnectionState::Connecting);

        let cancel = CancellationToken::new();
        let retry_pending = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(run_connection(
            self.inner.clone(),
            cancel.clone(),
            retry_pending.clone(),
        ));

        *slot = Some(Session {
            cancel,
            retry_pending,
            handle,
        });
    }

    /// Tears the connection down and cancels any pending retry. Safe to call repeatedly.
    pub fn disconnect(&self) {
        let previous = self.inner.lock_session().take();
        if let Some(session) = previous {
            session.cancel.cancel();
            session.handle.abort();
            info!("live channel disconnected");
        }
        self.inner.state.send_if_modified(|s| {
            if *s == ConnectionState::Disconnected {
                false
            } else {
                *s = ConnectionState::Disconnected;
                true
            }
        });
    }

    pub fn notifications(&self) -> broadcast::Receiver<ChangeNotification> {
        self.inner.notifications.subscribe()
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// `true` while connected, starting with the current value.
    pub fn connectivity(&self) -> impl Stream<Item = bool> + Send + 'static {
        WatchStream::new(self.state()).map(ConnectionState::is_connected)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.borrow().is_connected()
    }

    /// Whether a reconnect is currently scheduled.
    pub fn has_pending_retry(&self) -> bool {
        self.inner
            .lock_session()
            .as_ref()
            .is_some_and(|s| s.retry_pending.load(Ordering::SeqCst))
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.policy.attempts()
    }

    /// Parses one inbound body and re-emits it. Malformed bodies are logged and dropped.
    pub fn handle_frame(&self, body: &str) -> bool {
        self.inner.handle_frame(body)
    }
}

impl Inner {
    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// State writes from a cancelled connection task are discarded.
    fn set_state(&self, cancel: &CancellationToken, next: ConnectionState) {
        self.state.send_if_modified(|s| {
            if cancel.is_cancelled() || *s == next {
                false
            } else {
                *s = next;
                true
            }
        });
    }

    fn handle_frame(&self, body: &str) -> bool {
        let notification = match serde_json::from_str::<ChangeNotification>(body) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "error parsing live channel message");
                return false;
            }
        };

        debug!(
            resource = %notification.data_type_id,
            change = ?notification.change_type,
            "change notification received"
        );
        if self.notifications.send(notification).is_err() {
            debug!("no subscribers for change notification");
        }
        true
    }

    async fn pump(&self, mut frames: FrameStream, cancel: &CancellationToken) -> PumpEnd {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return PumpEnd::Cancelled,
                next = frames.next() => next,
            };
            match next {
                Some(Ok(body)) => {
                    self.handle_frame(&body);
                }
                Some(Err(e)) => return PumpEnd::Failed(e),
                None => return PumpEnd::Closed,
            }
        }
    }
}

/// Marks the channel disconnected when the connection task ends, including by panic, unless a
/// newer `connect`/`disconnect` already took over.
struct ExitGuard {
    inner: Arc<Inner>,
    cancel: CancellationToken,
    retry_pending: Arc<AtomicBool>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.retry_pending.store(false, Ordering::SeqCst);
        if std::thread::panicking() {
            error!("live channel connection task panicked");
        }
        self.inner.set_state(&self.cancel, ConnectionState::Disconnected);
    }
}

async fn run_connection(
    inner: Arc<Inner>,
    cancel: CancellationToken,
    retry_pending: Arc<AtomicBool>,
) {
    let _guard = ExitGuard {
        inner: inner.clone(),
        cancel: cancel.clone(),
        retry_pending: retry_pending.clone(),
    };

    loop {
        inner.set_state(&cancel, ConnectionState::Connecting);

        let opened = tokio::select! {
            _ = cancel.cancelled() => return,
            opened = inner.transport.open() => opened,
        };

        match opened {
            Ok(frames) => {
                inner.policy.reset();
                inner.set_state(&cancel, ConnectionState::Connected);
                info!(transport = inner.transport.name(), "live channel connected");

                match inner.pump(frames, &cancel).await {
                    PumpEnd::Cancelled => return,
                    PumpEnd::Closed => info!("live channel connection closed by server"),
                    PumpEnd::Failed(e) => warn!(error = %e, "live channel connection lost"),
                }
            }
            Err(e) => {
                warn!(transport = inner.transport.name(), error = %e, "live channel connect failed");
            }
        }

        inner.set_state(&cancel, ConnectionState::Disconnected);

        match inner.policy.next() {
            RetryDecision::Retry { attempt, delay } => {
                info!(
                    attempt,
                    max = inner.policy.max_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "attempting to reconnect"
                );
                retry_pending.store(true, Ordering::SeqCst);
                let cancelled = tokio::select! {
                    _ = cancel.cancelled() => true,
                    _ = tokio::time::sleep(delay) => false,
                };
                retry_pending.store(false, Ordering::SeqCst);
                if cancelled {
                    return;
                }
            }
            RetryDecision::GiveUp { attempts } => {
                error!(attempts, "max reconnection attempts reached");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::broadcast::error::TryRecvError;

    use super::*;
    use crate::test_support::{serve, stomp_router, Outcome, ScriptedTransport, StompScript};
    use crate::types::ChangeType;

    const CREATE_ORDER: &str = r#"{"changeType":"CREATE","dataTypeId":"orders","data":{"id":"1"}}"#;

    fn channel(transport: Arc<ScriptedTransport>) -> LiveChannel {
        LiveChannel::new(transport, ReconnectPolicy::default(), 16)
    }

    async fn wait_for(channel: &LiveChannel, target: ConnectionState) {
        let mut state = channel.state();
        tokio::time::timeout(Duration::from_secs(30), state.wait_for(|s| *s == target))
            .await
            .expect("state never reached")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent() {
        let transport = ScriptedTransport::new(vec![Outcome::Hold(vec![])]);
        let live = channel(transport.clone());

        live.connect();
        live.connect();
        wait_for(&live, ConnectionState::Connected).await;
        live.connect();

        assert_eq!(transport.opens(), 1);
        assert!(live.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_stops_after_max_attempts() {
        let transport = ScriptedTransport::new(vec![]);
        let live = channel(transport.clone());
        let mut connectivity = Box::pin(live.connectivity());
        assert_eq!(connectivity.next().await, Some(false));

        live.connect();
        tokio::time::sleep(Duration::from_secs(60)).await;

        // one explicit connect plus five automatic retries
        assert_eq!(transport.opens(), 6);
        assert_eq!(live.reconnect_attempts(), 5);
        assert!(!live.has_pending_retry());
        assert!(!live.is_connected());
        assert_eq!(*live.state().borrow(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(transport.opens(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_wait_the_fixed_delay() {
        let transport = ScriptedTransport::new(vec![]);
        let live = channel(transport.clone());

        live.connect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.opens(), 1);
        assert!(live.has_pending_retry());

        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert_eq!(transport.opens(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_connect_after_giving_up_tries_once_more() {
        let transport = ScriptedTransport::new(vec![]);
        let live = channel(transport.clone());

        live.connect();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.opens(), 6);

        live.connect();
        tokio::time::sleep(Duration::from_secs(60)).await;

        // attempts are only reset by a successful connection
        assert_eq!(transport.opens(), 7);
        assert!(!live.has_pending_retry());
    }

    #[tokio::test(start_paused = true)]
    async fn successful_connection_resets_attempts() {
        let transport = ScriptedTransport::new(vec![
            Outcome::Fail,
            Outcome::Fail,
            Outcome::End(vec![]),
            Outcome::Hold(vec![]),
        ]);
        let live = channel(transport.clone());

        live.connect();
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(transport.opens(), 3);
        assert_eq!(live.reconnect_attempts(), 1);

        wait_for(&live, ConnectionState::Connected).await;
        assert_eq!(transport.opens(), 4);
        assert_eq!(live.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_retry() {
        let transport = ScriptedTransport::new(vec![]);
        let live = channel(transport.clone());

        live.connect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(live.has_pending_retry());

        live.disconnect();
        live.disconnect();
        assert!(!live.has_pending_retry());
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(transport.opens(), 1);
        assert_eq!(*live.state().borrow(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_closes_active_connection() {
        let transport = ScriptedTransport::new(vec![Outcome::Hold(vec![])]);
        let live = channel(transport.clone());

        live.connect();
        wait_for(&live, ConnectionState::Connected).await;
        live.disconnect();

        assert!(!live.is_connected());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn well_formed_frames_are_emitted() {
        let transport = ScriptedTransport::new(vec![Outcome::Hold(vec![
            "garbage".into(),
            CREATE_ORDER.into(),
        ])]);
        let live = channel(transport);
        let mut notifications = live.notifications();

        live.connect();
        let received = notifications.recv().await.unwrap();

        assert_eq!(
            received,
            ChangeNotification::new(ChangeType::Create, "orders", json!({"id": "1"}))
        );
        assert!(live.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_connection_leaves_channel_reconnectable() {
        let transport = ScriptedTransport::new(vec![Outcome::Panic, Outcome::Hold(vec![])]);
        let live = channel(transport.clone());

        live.connect();
        wait_for(&live, ConnectionState::Disconnected).await;
        assert_eq!(transport.opens(), 1);
        assert!(!live.has_pending_retry());

        live.connect();
        wait_for(&live, ConnectionState::Connected).await;
        assert_eq!(transport.opens(), 2);
    }

    #[tokio::test]
    async fn malformed_frame_is_dropped_without_side_effects() {
        let live = channel(ScriptedTransport::new(vec![]));
        let mut notifications = live.notifications();

        assert!(!live.handle_frame("{not json"));
        assert!(!live.handle_frame(r#"{"changeType":"CREATE"}"#));

        assert!(matches!(notifications.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(*live.state().borrow(), ConnectionState::Disconnected);

        assert!(live.handle_frame(CREATE_ORDER));
        assert!(notifications.try_recv().is_ok());
    }

    #[tokio::test]
    async fn reconnects_to_stomp_broker_after_server_drop() {
        let script = StompScript::messages(vec![]);
        let addr = serve(stomp_router(script.clone())).await;

        let transport = Arc::new(crate::transport::WsTransport::new(
            format!("ws://{addr}/ws"),
            "/topic/data-changes".into(),
            (0, 0),
            Duration::from_secs(5),
            crate::auth::SessionStore::in_memory(),
        ));
        let live = LiveChannel::new(transport, ReconnectPolicy::new(5, Duration::from_millis(50)), 16);
        let mut notifications = live.notifications();

        live.connect();
        script.wait_for_subscribes(1).await;
        script.push(CREATE_ORDER);
        let first = tokio::time::timeout(Duration::from_secs(5), notifications.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.data_type_id, "orders");

        script.kick();
        script.wait_for_subscribes(2).await;
        assert_eq!(script.connects(), 2);

        script.push(r#"{"changeType":"DELETE","dataTypeId":"orders","data":{"id":"1"}}"#);
        let second = tokio::time::timeout(Duration::from_secs(5), notifications.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.change_type, ChangeType::Delete);

        live.disconnect();
    }
}
