use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub mod auth;
pub mod cache;
pub mod config;
pub mod gateway;
pub mod live_channel;
pub mod orchestrator;
pub mod reconnect;
pub mod stomp;
pub mod sync;
pub mod transport;
pub mod types;

#[cfg(test)]
mod test_support;

use auth::SessionStore;
use cache::ResourceCache;
use config::Config;
use gateway::{HttpGateway, ResourceGateway};
use live_channel::LiveChannel;
use orchestrator::ResourceOrchestrator;
use sync::SyncOptions;
use transport::Transport;

/// Composition root: one cache, one live channel and one gateway shared by every consumer.
pub struct App {
    pub config: Config,
    pub session: SessionStore,
    pub cache: ResourceCache,
    pub live: LiveChannel,
    pub gateway: Arc<dyn ResourceGateway>,
    pub orchestrator: Arc<ResourceOrchestrator>,
    shutdown: CancellationToken,
    sync_task: Mutex<Option<JoinHandle<()>>>,
}

impl App {
    /// Builds everything from `config` and starts syncing.
    pub async fn initialize(config: Config) -> anyhow::Result<Arc<Self>> {
        let session = match &config.session_file {
            Some(path) => SessionStore::open(path),
            None => SessionStore::in_memory(),
        };
        let transport = transport::build_transport(&config, session.clone());
        let app = Self::assemble(config, session, transport)?;
        app.start();
        Ok(app)
    }

    /// Wires the components without starting any task.
    pub fn assemble(
        config: Config,
        session: SessionStore,
        transport: Arc<dyn Transport>,
    ) -> anyhow::Result<Arc<Self>> {
        let cache = ResourceCache::new();
        let gateway: Arc<dyn ResourceGateway> = Arc::new(
            HttpGateway::from_config(&config, session.clone(), cache.clone())
                .context("failed to build resource gateway")?,
        );
        let live = LiveChannel::from_config(&config, transport);
        let orchestrator = Arc::new(ResourceOrchestrator::new(gateway.clone(), session.clone()));

        Ok(Arc::new(Self {
            config,
            session,
            cache,
            live,
            gateway,
            orchestrator,
            shutdown: CancellationToken::new(),
            sync_task: Mutex::new(None),
        }))
    }

    /// Subscribes the cache to the live channel, then connects. Calling it again is a no-op.
    pub fn start(&self) {
        let mut slot = self.sync_task.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }

        *slot = Some(tokio::spawn(sync::run_sync_loop(
            self.cache.clone(),
            self.gateway.clone(),
            self.live.notifications(),
            self.live.state(),
            SyncOptions::from_config(&self.config),
            self.shutdown.clone(),
        )));
        drop(slot);

        self.live.connect();
        info!("edge-sync started");
    }

    /// Disconnects the live channel and stops the sync loop.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.live.disconnect();

        let task = self
            .sync_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "sync loop panicked");
            }
        }
        info!("edge-sync stopped");
    }
}
