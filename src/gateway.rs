use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde_json::Value;
use tracing::debug;

use crate::auth::SessionStore;
use crate::cache::ResourceCache;
use crate::config::Config;

#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error("server unreachable: {0}")]
    Unreachable(#[source] reqwest::Error),
    #[error("unauthenticated")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("server error: {0}")]
    Server(u16),
    #[error("unexpected status: {0}")]
    Status(u16),
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("{0} id is missing")]
    MissingId(String),
}

impl GatewayError {
    fn from_status(status: StatusCode, url: &Url) -> Self {
        match status.as_u16() {
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound(url.path().to_string()),
            code @ 500..=599 => Self::Server(code),
            code => Self::Status(code),
        }
    }

    /// HTTP status the error stands for; 0 when the server could not be reached.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Unreachable(_) => Some(0),
            Self::Unauthorized => Some(401),
            Self::Forbidden => Some(403),
            Self::NotFound(_) => Some(404),
            Self::Server(code) | Self::Status(code) => Some(*code),
            Self::Request(e) => e.status().map(|s| s.as_u16()),
            Self::Decode(_) | Self::InvalidUrl(_) | Self::MissingId(_) => None,
        }
    }
}

/// REST access to `/api/<resource>[/<id>][/...]`.
///
/// Only [`ResourceGateway::load`] writes into the cache. Mutations rely on the server echoing the
/// change over the live channel.
#[async_trait]
pub trait ResourceGateway: Send + Sync {
    /// Sends `body` (if any) to `path` below the API root and decodes the JSON reply.
    /// Empty replies decode as `null`.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, GatewayError>;

    fn cache(&self) -> &ResourceCache;

    async fn list(&self, resource: &str) -> Result<Value, GatewayError> {
        self.request(Method::GET, resource, None).await
    }

    async fn fetch(&self, resource: &str, id: &str) -> Result<Value, GatewayError> {
        let path = item_path(resource, id)?;
        self.request(Method::GET, &path, None).await
    }

    async fn create(&self, resource: &str, body: &Value) -> Result<Value, GatewayError> {
        self.request(Method::POST, resource, Some(body)).await
    }

    async fn update(&self, resource: &str, id: &str, body: &Value) -> Result<Value, GatewayError> {
        let path = item_path(resource, id)?;
        self.request(Method::PUT, &path, Some(body)).await
    }

    async fn delete(&self, resource: &str, id: &str) -> Result<Value, GatewayError> {
        let path = item_path(resource, id)?;
        self.request(Method::DELETE, &path, None).await
    }

    /// Reads the whole collection and stores it in the cache.
    async fn load(&self, resource: &str) -> Result<Value, GatewayError> {
        let data = self.list(resource).await?;
        self.cache().set(resource, data.clone());
        Ok(data)
    }
}

fn item_path(resource: &str, id: &str) -> Result<String, GatewayError> {
    if id.trim().is_empty() {
        return Err(GatewayError::MissingId(resource.to_string()));
    }
    Ok(format!("{resource}/{id}"))
}

pub struct HttpGateway {
    client: Client,
    base_url: Url,
    session: SessionStore,
    cache: ResourceCache,
}

impl HttpGateway {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        session: SessionStore,
        cache: ResourceCache,
    ) -> Result<Self, GatewayError> {
        let base_url =
            Url::parse(base_url).map_err(|e| GatewayError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(GatewayError::InvalidUrl(base_url.to_string()));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(GatewayError::Request)?;

        Ok(Self {
            client,
            base_url,
            session,
            cache,
        })
    }

    pub fn from_config(
        config: &Config,
        session: SessionStore,
        cache: ResourceCache,
    ) -> Result<Self, GatewayError> {
        Self::new(&config.api_base_url, config.http_timeout(), session, cache)
    }

    fn url(&self, path: &str) -> Result<Url, GatewayError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| GatewayError::InvalidUrl(self.base_url.to_string()))?;
            segments.pop_if_empty();
            segments.extend(path.split('/').filter(|s| !s.is_empty()));
        }
        Ok(url)
    }
}

#[async_trait]
impl ResourceGateway for HttpGateway {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, GatewayError> {
        let url = self.url(path)?;
        debug!(%method, %url, "api request");

        let mut request = self.client.request(method, url.clone());
        if let Some(token) = self.session.token() {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let resp = request.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                GatewayError::Unreachable(e)
            } else {
                GatewayError::Request(e)
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(GatewayError::from_status(status, &url));
        }

        let bytes = resp.bytes().await.map_err(GatewayError::Request)?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn cache(&self) -> &ResourceCache {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use axum::extract::Path;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    use super::*;
    use crate::test_support::serve;

    fn api() -> Router {
        Router::new()
            .route(
                "/api/orders",
                get(|| async { Json(json!([{"id": "1"}, {"id": "2"}])) })
                    .post(|Json(body): Json<Value>| async move {
                        (AxumStatus::CREATED, Json(json!({"id": "3", "echo": body})))
                    }),
            )
            .route(
                "/api/orders/:id",
                get(|Path(id): Path<String>| async move { Json(json!({"id": id})) })
                    .put(|Path(id): Path<String>, Json(body): Json<Value>| async move {
                        Json(json!({"id": id, "echo": body}))
                    })
                    .delete(|| async { AxumStatus::NO_CONTENT }),
            )
            .route(
                "/api/orders/invoice/next-number",
                get(|| async { Json(json!({"next": 1001})) }),
            )
            .route(
                "/api/whoami",
                get(|headers: HeaderMap| async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    Json(json!({ "authorization": auth }))
                }),
            )
            .route("/api/secret", get(|| async { AxumStatus::UNAUTHORIZED }))
            .route("/api/forbidden", get(|| async { AxumStatus::FORBIDDEN }))
            .route("/api/boom", get(|| async { AxumStatus::BAD_GATEWAY }))
            .route("/api/teapot", get(|| async { AxumStatus::IM_A_TEAPOT }))
            .route("/api/broken", get(|| async { "{not json" }))
    }

    async fn gateway(session: SessionStore) -> (HttpGateway, ResourceCache) {
        let addr = serve(api()).await;
        let cache = ResourceCache::new();
        let gateway = HttpGateway::new(
            &format!("http://{addr}/api"),
            Duration::from_secs(5),
            session,
            cache.clone(),
        )
        .unwrap();
        (gateway, cache)
    }

    #[tokio::test]
    async fn load_stores_collection_in_cache() {
        let (gateway, cache) = gateway(SessionStore::in_memory()).await;

        let data = gateway.load("orders").await.unwrap();

        assert_eq!(data, json!([{"id": "1"}, {"id": "2"}]));
        assert_eq!(cache.select("orders").items().len(), 2);
    }

    #[tokio::test]
    async fn mutations_do_not_touch_cache() {
        let (gateway, cache) = gateway(SessionStore::in_memory()).await;

        let created = gateway.create("orders", &json!({"total": 5})).await.unwrap();
        assert_eq!(created["echo"], json!({"total": 5}));

        let updated = gateway.update("orders", "2", &json!({"total": 6})).await.unwrap();
        assert_eq!(updated["id"], json!("2"));

        let deleted = gateway.delete("orders", "2").await.unwrap();
        assert_eq!(deleted, Value::Null);

        assert!(cache.get("orders").is_none());
    }

    #[tokio::test]
    async fn fetch_and_sub_paths() {
        let (gateway, _) = gateway(SessionStore::in_memory()).await;

        assert_eq!(gateway.fetch("orders", "7").await.unwrap(), json!({"id": "7"}));
        let next = gateway
            .request(Method::GET, "orders/invoice/next-number", None)
            .await
            .unwrap();
        assert_eq!(next, json!({"next": 1001}));
    }

    #[tokio::test]
    async fn empty_id_is_rejected_before_sending() {
        let (gateway, _) = gateway(SessionStore::in_memory()).await;
        let err = gateway.update("orders", "", &json!({})).await.unwrap_err();
        assert!(matches!(err, GatewayError::MissingId(ref r) if r == "orders"));
    }

    #[tokio::test]
    async fn bearer_token_is_attached() {
        let session = SessionStore::in_memory();
        session.set_token("tok").unwrap();
        let (gateway, _) = gateway(session).await;

        let reply = gateway.list("whoami").await.unwrap();
        assert_eq!(reply["authorization"], json!("Bearer tok"));
    }

    #[tokio::test]
    async fn statuses_map_to_error_kinds() {
        let (gateway, _) = gateway(SessionStore::in_memory()).await;

        assert!(matches!(gateway.list("secret").await, Err(GatewayError::Unauthorized)));
        assert!(matches!(gateway.list("forbidden").await, Err(GatewayError::Forbidden)));
        assert!(matches!(gateway.list("missing").await, Err(GatewayError::NotFound(_))));
        assert!(matches!(gateway.list("boom").await, Err(GatewayError::Server(502))));
        assert!(matches!(gateway.list("teapot").await, Err(GatewayError::Status(418))));
        assert!(matches!(gateway.list("broken").await, Err(GatewayError::Decode(_))));
    }

    #[tokio::test]
    async fn unreachable_server_reports_status_zero() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let gateway = HttpGateway::new(
            &format!("http://{addr}/api"),
            Duration::from_secs(5),
            SessionStore::in_memory(),
            ResourceCache::new(),
        )
        .unwrap();

        let err = gateway.list("orders").await.unwrap_err();
        assert!(matches!(err, GatewayError::Unreachable(_)));
        assert_eq!(err.status(), Some(0));
    }

    #[test]
    fn rejects_unusable_base_url() {
        let err = HttpGateway::new(
            "mailto:ops@example.com",
            Duration::from_secs(1),
            SessionStore::in_memory(),
            ResourceCache::new(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, GatewayError::InvalidUrl(_)));
    }
}
