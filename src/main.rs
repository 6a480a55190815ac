use futures::StreamExt;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use edge_sync::auth::token_subject;
use edge_sync::config::Config;
use edge_sync::orchestrator::NoticeKind;
use edge_sync::App;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    let preload = config.preload_resources.clone();
    let app = App::initialize(config).await?;

    match app.session.token().as_deref().map(token_subject) {
        Some(Ok(subject)) => info!(%subject, "using stored session"),
        Some(Err(e)) => warn!(error = %e, "stored token is unreadable"),
        None => info!("no stored session, requests are anonymous"),
    }

    let mut notices = app.orchestrator.notices();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            match notice.kind {
                NoticeKind::Success => info!(message = %notice.message, "notice"),
                NoticeKind::Error => warn!(message = %notice.message, "notice"),
            }
        }
    });

    let mut connectivity = Box::pin(app.live.connectivity());
    tokio::spawn(async move {
        while let Some(connected) = connectivity.next().await {
            info!(connected, "live channel connectivity");
        }
    });

    for resource in preload {
        let mut changes = Box::pin(app.cache.select(&resource).into_stream());
        let name = resource.clone();
        tokio::spawn(async move {
            while let Some(items) = changes.next().await {
                info!(resource = %name, size = items.len(), "collection changed");
            }
        });

        if let Err(e) = app.orchestrator.load(&resource).await {
            error!(%resource, error = %e, "initial load failed");
        }
    }

    shutdown_signal().await;
    app.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
