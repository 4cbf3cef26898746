use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use support_relay::config::RelayConfig;
use support_relay::feed::{EventDispatcher, FeedClient, ReconnectSupervisor};
use support_relay::store::LibSqlThreadStore;
use support_relay::surface::DiscordConnector;
use support_relay::worker::{WorkerDeps, WorkerRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = RelayConfig::from_env()?;

    eprintln!("📡 Support Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Feed: {}", config.feed_url);
    eprintln!("   Database: {}", config.db_path);

    let store = Arc::new(LibSqlThreadStore::new_local(Path::new(&config.db_path)).await?);
    let connector = Arc::new(DiscordConnector::new());
    let registry = WorkerRegistry::new(
        WorkerDeps { store, connector },
        config.worker_grace,
    );
    let dispatcher = Arc::new(EventDispatcher::new(Arc::clone(&registry)));

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    let client = Arc::new(FeedClient::new(&config.feed_url, &config.feed_api_key));
    let supervisor = ReconnectSupervisor::new(config.reconnect);

    let connect = {
        let client = Arc::clone(&client);
        move || {
            let client = Arc::clone(&client);
            async move { client.connect().await }
        }
    };
    let handler = {
        let dispatcher = Arc::clone(&dispatcher);
        let shutdown = shutdown.clone();
        move |mut conn: support_relay::feed::FeedConnection| {
            let dispatcher = Arc::clone(&dispatcher);
            let shutdown = shutdown.clone();
            async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        batch = conn.next_batch() => {
                            for event in batch? {
                                dispatcher.dispatch(event).await;
                            }
                        }
                    }
                }
            }
        }
    };

    let result = supervisor.run(connect, handler, shutdown.clone()).await;

    tracing::info!("Stopping workers");
    registry.shutdown_all().await;

    if let Err(e) = result {
        tracing::error!(error = %e, "Relay exited with error");
        return Err(e.into());
    }
    Ok(())
}
