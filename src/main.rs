//! shopcore HTTP service

use anyhow::Result;
use shopcore::{api, notify::{LogNotifier, NatsNotifier, Notifier}, store::{MemoryStore, PgStore, Store}, AppConfig, CommerceService};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())).with(tracing_subscriber::fmt::layer()).init();
    let config = AppConfig::from_env()?;

    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url, config.database_max_connections).await?;
            store.migrate().await?;
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };
    let notifier: Arc<dyn Notifier> = match &config.nats_url {
        Some(url) => match NatsNotifier::connect(url).await {
            Ok(nats) => Arc::new(nats),
            Err(e) => {
                tracing::warn!(error = %e, "NATS unavailable, events will only be logged");
                Arc::new(LogNotifier)
            }
        },
        None => Arc::new(LogNotifier),
    };

    let service = CommerceService::new(store, notifier, Arc::new(config.core));
    let app = api::router(service).layer(TraceLayer::new_for_http()).layer(CorsLayer::permissive());

    tracing::info!("shopcore listening on 0.0.0.0:{}", config.port);
    axum::serve(tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?, app).await?;
    Ok(())
}
