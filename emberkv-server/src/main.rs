mod service;
mod watch;

use std::sync::Arc;
use std::time::Duration;

use emberkv_core::{Store, StoreConfig};
use emberkv_proto::ember_kv_server::EmberKvServer;
use service::EmberKvService;
use tonic::transport::Server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use watch::WatchHub;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "emberkv_server=info,tonic=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Configuration from environment variables
    let host = std::env::var("EMBERKV_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = std::env::var("EMBERKV_PORT").unwrap_or_else(|_| "9980".to_string());
    let db_root = std::env::var("EMBERKV_DB_ROOT").unwrap_or_else(|_| "db".to_string());
    let sweep_interval: u64 = std::env::var("EMBERKV_SWEEP_INTERVAL")
        .unwrap_or_else(|_| "60".to_string())
        .parse()
        .unwrap_or(60);

    let addr = format!("{}:{}", host, port).parse()?;

    let config = StoreConfig::default()
        .with_db_root(&db_root)
        .with_sweep_interval(Duration::from_secs(sweep_interval));
    let store = Store::open(config).await?;

    // The watch hub is the store's sole observer in production.
    let hub = Arc::new(WatchHub::new());
    store.set_observer(hub.clone());

    let service = EmberKvService::new(store.clone(), Arc::clone(&hub));

    tracing::info!("emberkv gRPC server listening on {}", addr);
    tracing::info!("   db root: {}", db_root);
    tracing::info!("   sweep interval: {}s", sweep_interval);

    Server::builder()
        .add_service(EmberKvServer::new(service))
        .serve_with_shutdown(addr, async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received, stopping server...");
        })
        .await?;

    store.shutdown().await;
    tracing::info!("server shutdown complete");
    Ok(())
}
