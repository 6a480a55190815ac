use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, warn};

use crate::auth::SessionStore;
use crate::gateway::{GatewayError, ResourceGateway};
use crate::types::ResourceName;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoticeKind {
    Success,
    Error,
}

/// User-facing outcome of a resource operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
}

impl Notice {
    fn success(message: String) -> Self {
        Self {
            kind: NoticeKind::Success,
            message,
        }
    }

    fn error(message: String) -> Self {
        Self {
            kind: NoticeKind::Error,
            message,
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Verb {
    Load,
    Create,
    Update,
    Delete,
}

impl Verb {
    fn as_str(self) -> &'static str {
        match self {
            Verb::Load => "load",
            Verb::Create => "create",
            Verb::Update => "update",
            Verb::Delete => "delete",
        }
    }

    fn past(self) -> &'static str {
        match self {
            Verb::Load => "loaded",
            Verb::Create => "created",
            Verb::Update => "updated",
            Verb::Delete => "deleted",
        }
    }
}

fn error_message(err: &GatewayError, verb: Verb, resource: &str) -> String {
    match err {
        GatewayError::Unreachable(_) => "Network error. Please check your connection.".into(),
        GatewayError::Server(_) => "Server error. Please try again later.".into(),
        GatewayError::Unauthorized => "Your session has expired. Please log in again.".into(),
        GatewayError::Forbidden => "You do not have permission to perform this action.".into(),
        GatewayError::NotFound(_) => "The requested resource was not found.".into(),
        _ => format!("Failed to {} {resource}", verb.as_str()),
    }
}

/// Loading state of one resource: true while at least one operation is in flight.
struct LoadingFlag {
    in_flight: Mutex<usize>,
    tx: watch::Sender<bool>,
}

impl LoadingFlag {
    fn new() -> Self {
        Self {
            in_flight: Mutex::new(0),
            tx: watch::channel(false).0,
        }
    }

    fn begin(self: &Arc<Self>) -> InFlight {
        let mut n = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        *n += 1;
        self.tx.send_replace(true);
        InFlight(self.clone())
    }
}

/// Ends one in-flight operation when dropped, so an abandoned call cannot leave the flag set.
struct InFlight(Arc<LoadingFlag>);

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut n = self.0.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        *n = n.saturating_sub(1);
        if *n == 0 {
            self.0.tx.send_replace(false);
        }
    }
}

/// Runs resource operations on behalf of views: tracks a loading flag per resource and turns
/// every outcome into a [`Notice`].
pub struct ResourceOrchestrator {
    gateway: Arc<dyn ResourceGateway>,
    session: SessionStore,
    notices: broadcast::Sender<Notice>,
    loading: DashMap<ResourceName, Arc<LoadingFlag>>,
}

impl ResourceOrchestrator {
    pub fn new(gateway: Arc<dyn ResourceGateway>, session: SessionStore) -> Self {
        let (notices, _) = broadcast::channel(64);
        Self {
            gateway,
            session,
            notices,
            loading: DashMap::new(),
        }
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// Loading flag for `resource`; `false` until an operation starts.
    pub fn loading(&self, resource: &str) -> watch::Receiver<bool> {
        self.flag(resource).tx.subscribe()
    }

    /// Reads the collection into the cache. Success is silent.
    pub async fn load(&self, resource: &str) -> Result<Value, GatewayError> {
        self.run(resource, Verb::Load, self.gateway.load(resource)).await
    }

    pub async fn create(&self, resource: &str, body: &Value) -> Result<Value, GatewayError> {
        self.run(resource, Verb::Create, self.gateway.create(resource, body))
            .await
    }

    /// Does nothing when `id` is empty.
    pub async fn update(
        &self,
        resource: &str,
        id: &str,
        body: &Value,
    ) -> Result<Option<Value>, GatewayError> {
        if id.trim().is_empty() {
            error!(resource, %body, "resource id is missing");
            return Ok(None);
        }
        self.run(resource, Verb::Update, self.gateway.update(resource, id, body))
            .await
            .map(Some)
    }

    pub async fn delete(&self, resource: &str, id: &str) -> Result<Value, GatewayError> {
        self.run(resource, Verb::Delete, self.gateway.delete(resource, id))
            .await
    }

    fn flag(&self, resource: &str) -> Arc<LoadingFlag> {
        self.loading
            .entry(Arc::from(resource))
            .or_insert_with(|| Arc::new(LoadingFlag::new()))
            .clone()
    }

    async fn run<F>(&self, resource: &str, verb: Verb, call: F) -> Result<Value, GatewayError>
    where
        F: std::future::Future<Output = Result<Value, GatewayError>>,
    {
        let in_flight = self.flag(resource).begin();
        let result = call.await;
        drop(in_flight);

        match &result {
            Ok(_) => {
                debug!(resource, verb = verb.as_str(), "resource operation succeeded");
                if !matches!(verb, Verb::Load) {
                    self.notify(Notice::success(format!("{resource} {} successfully", verb.past())));
                }
            }
            Err(e) => {
                warn!(resource, verb = verb.as_str(), error = %e, "resource operation failed");
                if matches!(e, GatewayError::Unauthorized) {
                    if let Err(e) = self.session.clear() {
                        error!(error = %e, "failed to clear session");
                    }
                }
                self.notify(Notice::error(error_message(e, verb, resource)));
            }
        }
        result
    }

    fn notify(&self, notice: Notice) {
        if self.notices.send(notice).is_err() {
            debug!("no listeners for notice");
        }
    }
}
