use std::ops::Deref;
use std::sync::Arc;

use dashmap::DashMap;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::debug;

use crate::types::{entity_id, ChangeNotification, ChangeType, Entity, ResourceName};

/// Current value of one collection; `None` until something has been stored for it.
pub type Snapshot = Option<Arc<Value>>;

/// In-memory store of every resource collection the application has loaded.
///
/// Each collection lives behind its own `watch` channel, so a mutation is applied under that
/// channel's lock and readers only ever see whole snapshots. The map holds at most one channel
/// per name; a channel may exist without an entry when a selector was created first.
#[derive(Clone, Default)]
pub struct ResourceCache {
    entries: Arc<DashMap<ResourceName, watch::Sender<Snapshot>>>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the entry for `name` wholesale. Entry point for REST reads.
    pub fn set(&self, name: &str, data: Value) {
        let data = Arc::new(data);
        self.with_channel(name, |tx| {
            tx.send_replace(Some(data));
        });
        debug!(resource = name, "cache entry replaced");
    }

    pub fn get(&self, name: &str) -> Option<Arc<Value>> {
        let tx = self.entries.get(name)?;
        let snapshot = tx.value().borrow().clone();
        snapshot
    }

    /// Reactive accessor for `name`. Valid before any data exists; reads as empty until then.
    pub fn select(&self, name: &str) -> Selection {
        let rx = self.with_channel(name, |tx| tx.subscribe());
        Selection {
            name: ResourceName::from(name),
            rx,
        }
    }

    /// Applies a live change notification. Returns whether the collection changed.
    pub fn apply(&self, notification: &ChangeNotification) -> bool {
        let name = notification.data_type_id.as_str();
        let change = notification.change_type;
        let data = &notification.data;

        let changed = match change {
            ChangeType::Create => {
                self.with_channel(name, |tx| tx.send_if_modified(|s| apply_create(s, data)))
            }
            ChangeType::Update | ChangeType::Delete => match self.entries.get(name) {
                Some(tx) => tx.value().send_if_modified(|s| match change {
                    ChangeType::Update => apply_update(s, data),
                    _ => apply_delete(s, data),
                }),
                None => false,
            },
            ChangeType::Unknown => {
                debug!(resource = name, "ignoring notification with unknown change type");
                return false;
            }
        };

        if changed {
            debug!(resource = name, ?change, "applied change notification");
        } else {
            debug!(resource = name, ?change, "change notification left cache unchanged");
        }
        changed
    }

    /// Names of every collection that currently holds an entry.
    pub fn resource_names(&self) -> Vec<ResourceName> {
        self.entries
            .iter()
            .filter(|r| r.value().borrow().is_some())
            .map(|r| r.key().clone())
            .collect()
    }

    fn with_channel<R>(&self, name: &str, f: impl FnOnce(&watch::Sender<Snapshot>) -> R) -> R {
        if let Some(tx) = self.entries.get(name) {
            return f(tx.value());
        }
        let tx = self
            .entries
            .entry(ResourceName::from(name))
            .or_insert_with(|| watch::channel(None).0);
        f(tx.value())
    }
}

fn has_id(items: &[Value], id: &Value) -> bool {
    items.iter().any(|item| entity_id(item) == Some(id))
}

fn apply_create(snapshot: &mut Snapshot, data: &Entity) -> bool {
    let duplicate = match snapshot.as_deref() {
        Some(Value::Array(items)) => entity_id(data).is_some_and(|id| has_id(items, id)),
        _ => {
            *snapshot = Some(Arc::new(Value::Array(vec![data.clone()])));
            return true;
        }
    };
    if duplicate {
        return false;
    }

    if let Some(Value::Array(items)) = snapshot.as_mut().map(Arc::make_mut) {
        items.push(data.clone());
        return true;
    }
    false
}

fn apply_update(snapshot: &mut Snapshot, data: &Entity) -> bool {
    let Some(id) = entity_id(data) else {
        return false;
    };
    match snapshot.as_deref() {
        Some(Value::Array(items)) if has_id(items, id) => {}
        _ => return false,
    }

    if let Some(Value::Array(items)) = snapshot.as_mut().map(Arc::make_mut) {
        for item in items.iter_mut() {
            if entity_id(item) == Some(id) {
                *item = data.clone();
            }
        }
        return true;
    }
    false
}

fn apply_delete(snapshot: &mut Snapshot, data: &Entity) -> bool {
    let Some(id) = entity_id(data) else {
        return false;
    };
    match snapshot.as_deref() {
        Some(Value::Array(items)) if has_id(items, id) => {}
        _ => return false,
    }

    if let Some(Value::Array(items)) = snapshot.as_mut().map(Arc::make_mut) {
        items.retain(|item| entity_id(item) != Some(id));
        return true;
    }
    false
}

/// A collection's entities, borrowed from a snapshot. Empty when the entry is absent or is not
/// an array.
#[derive(Clone, Debug, Default)]
pub struct Items(Snapshot);

impl Items {
    pub fn snapshot(&self) -> &Snapshot {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<Entity> {
        self.deref().to_vec()
    }
}

impl Deref for Items {
    type Target = [Entity];

    fn deref(&self) -> &[Entity] {
        match self.0.as_deref() {
            Some(Value::Array(items)) => items.as_slice(),
            _ => &[],
        }
    }
}

/// Read handle over one collection, obtained from [`ResourceCache::select`].
#[derive(Clone)]
pub struct Selection {
    name: ResourceName,
    rx: watch::Receiver<Snapshot>,
}

impl Selection {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The raw stored value, if an entry exists.
    pub fn snapshot(&self) -> Snapshot {
        self.rx.borrow().clone()
    }

    pub fn items(&self) -> Items {
        Items(self.snapshot())
    }

    /// Whether the collection changed since this handle last looked at it.
    pub fn has_changed(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }

    /// Waits for the next change and returns the new items. `None` once the cache is gone.
    pub async fn changed(&mut self) -> Option<Items> {
        self.rx.changed().await.ok()?;
        Some(Items(self.rx.borrow_and_update().clone()))
    }

    /// Stream of the collection's items, starting with the current value.
    pub fn into_stream(self) -> impl Stream<Item = Items> + Send + 'static {
        WatchStream::new(self.rx).map(Items)
    }
}
