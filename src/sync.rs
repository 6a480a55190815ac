use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::ResourceCache;
use crate::config::Config;
use crate::gateway::ResourceGateway;
use crate::types::{ChangeNotification, ConnectionState};

#[derive(Clone, Copy, Debug)]
pub struct SyncOptions {
    pub resync_on_reconnect: bool,
    pub concurrency: usize,
}

impl SyncOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            resync_on_reconnect: config.resync_on_reconnect,
            concurrency: config.resync_concurrency,
        }
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            resync_on_reconnect: true,
            concurrency: 4,
        }
    }
}

/// Applies live notifications to the cache until the channel closes or `cancel` fires.
///
/// Missed notifications (subscriber lag, or a reconnect after the channel had been up) are
/// repaired by reloading every collection the cache holds.
pub async fn run_sync_loop(
    cache: ResourceCache,
    gateway: Arc<dyn ResourceGateway>,
    mut notifications: broadcast::Receiver<ChangeNotification>,
    mut state: watch::Receiver<ConnectionState>,
    options: SyncOptions,
    cancel: CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let mut seen_connected = state.borrow_and_update().is_connected();
    let mut watching_state = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("sync loop cancelled");
                return;
            }
            received = notifications.recv() => match received {
                Ok(notification) => {
                    cache.apply(&notification);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "sync loop lagged behind live channel, resyncing");
                    resync(&cache, &gateway, &semaphore).await;
                }
                Err(RecvError::Closed) => {
                    info!("live channel closed, sync loop stopping");
                    return;
                }
            },
            changed = state.changed(), if watching_state => {
                if changed.is_err() {
                    watching_state = false;
                    continue;
                }
                // Equal values never notify, so a change that lands on Connected always
                // passed through a disconnect.
                if !state.borrow_and_update().is_connected() {
                    continue;
                }
                if seen_connected && options.resync_on_reconnect {
                    info!("live channel reconnected, resyncing");
                    resync(&cache, &gateway, &semaphore).await;
                }
                seen_connected = true;
            }
        }
    }
}

/// Reloads every collection currently held by the cache.
pub async fn resync(
    cache: &ResourceCache,
    gateway: &Arc<dyn ResourceGateway>,
    semaphore: &Arc<Semaphore>,
) {
    let names = cache.resource_names();
    info!(resource_count = names.len(), "resync: reloading cached collections");

    let mut handles = Vec::with_capacity(names.len());
    for name in names {
        let gateway = gateway.clone();
        let semaphore = semaphore.clone();

        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire().await;
            if let Err(e) = gateway.load(&name).await {
                warn!(resource = %name, error = %e, "failed to reload collection");
            }
        }));
    }

    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "reload task panicked");
        }
    }
}
