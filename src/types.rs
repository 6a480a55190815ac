use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name of a resource collection ("orders", "customers", ...). Used as the cache key.
pub type ResourceName = Arc<str>;

/// A single record of a collection. Expected, but not guaranteed, to carry an `id`.
pub type Entity = Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
    #[serde(other)]
    Unknown,
}

/// Message pushed by the backend over the live channel after a write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotification {
    pub change_type: ChangeType,
    pub data_type_id: String,
    #[serde(default)]
    pub data: Entity,
}

impl ChangeNotification {
    pub fn new(change_type: ChangeType, data_type_id: impl Into<String>, data: Entity) -> Self {
        Self {
            change_type,
            data_type_id: data_type_id.into(),
            data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

/// Returns the `id` member of an entity, if it is an object that has one.
pub fn entity_id(entity: &Entity) -> Option<&Value> {
    entity.as_object()?.get("id")
}
