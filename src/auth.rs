use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

pub const JWT_TOKEN_KEY: &str = "jwtToken";
pub const HAS_USERS_KEY: &str = "hasUsers";
pub const CURRENT_USER_KEY: &str = "currentUser";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to persist session: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize session: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid token: {0}")]
    Invalid(String),
}

/// Client-side persisted key space: auth token, "has any users" flag and current user.
///
/// Values are kept as strings, the way a browser's local storage keeps them. When a file is
/// configured every write is flushed to it as a JSON object.
#[derive(Clone, Default)]
pub struct SessionStore {
    values: Arc<DashMap<String, String>>,
    file: Option<Arc<PathBuf>>,
}

impl SessionStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens a file-backed store. A missing file starts empty; an unreadable one is logged and
    /// treated as empty.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let values = DashMap::new();

        match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<BTreeMap<String, String>>(&text) {
                Ok(stored) => {
                    for (k, v) in stored {
                        values.insert(k, v);
                    }
                }
                Err(e) => warn!(path = %path.display(), error = %e, "ignoring corrupt session file"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no session file yet");
            }
            Err(e) => warn!(path = %path.display(), error = %e, "failed to read session file"),
        }

        Self {
            values: Arc::new(values),
            file: Some(Arc::new(path)),
        }
    }

    pub fn token(&self) -> Option<String> {
        self.values.get(JWT_TOKEN_KEY).map(|v| v.value().clone())
    }

    pub fn set_token(&self, token: &str) -> Result<(), SessionError> {
        self.values.insert(JWT_TOKEN_KEY.into(), token.into());
        self.persist()
    }

    pub fn has_users(&self) -> Option<bool> {
        match self.values.get(HAS_USERS_KEY)?.value().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }

    pub fn set_has_users(&self, has_users: bool) -> Result<(), SessionError> {
        self.values
            .insert(HAS_USERS_KEY.into(), has_users.to_string());
        self.persist()
    }

    pub fn current_user(&self) -> Option<Value> {
        let stored = self.values.get(CURRENT_USER_KEY)?;
        match serde_json::from_str(stored.value()) {
            Ok(user) => Some(user),
            Err(e) => {
                warn!(error = %e, "error parsing stored user");
                None
            }
        }
    }

    pub fn set_current_user(&self, user: &Value) -> Result<(), SessionError> {
        let text = serde_json::to_string(user)?;
        self.values.insert(CURRENT_USER_KEY.into(), text);
        self.persist()
    }

    pub fn is_authenticated(&self) -> bool {
        self.current_user().is_some() && self.token().is_some()
    }

    /// Logout: forgets the token and the current user. The "has users" flag survives.
    pub fn clear(&self) -> Result<(), SessionError> {
        self.values.remove(JWT_TOKEN_KEY);
        self.values.remove(CURRENT_USER_KEY);
        self.persist()
    }

    fn persist(&self) -> Result<(), SessionError> {
        let Some(path) = self.file.as_deref() else {
            return Ok(());
        };
        let snapshot: BTreeMap<String, String> = self
            .values
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        let text = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

/// Reads the `sub` claim of a JWT without checking its signature. Only for display and logs.
pub fn token_subject(token: &str) -> Result<String, AuthError> {
    let parts: Vec<&str> = token.splitn(3, '.').collect();
    if parts.len() != 3 {
        return Err(AuthError::Invalid("malformed JWT".into()));
    }

    let payload_bytes = base64_url_decode(parts[1])
        .map_err(|e| AuthError::Invalid(format!("base64 decode error: {e}")))?;

    let payload: Value = serde_json::from_slice(&payload_bytes)
        .map_err(|e| AuthError::Invalid(format!("invalid JSON payload: {e}")))?;

    payload["sub"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(String::from)
        .ok_or_else(|| AuthError::Invalid("missing 'sub' claim".into()))
}

fn base64_url_decode(input: &str) -> Result<Vec<u8>, String> {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    URL_SAFE_NO_PAD
        .decode(input.trim_end_matches('='))
        .map_err(|e| e.to_string())
}
