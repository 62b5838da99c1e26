//! Tessera client binary.
//!
//! Connects to a Tessera server, keeps the configured collections in sync
//! and logs every change until interrupted.

use tessera_client::{now_millis, ClientConfig, SyncClient};
use tessera_engine::{CollectionOptions, Engine, SyncMode};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tessera_client=info,tessera_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = ClientConfig::from_env()?;

    let mut engine = Engine::new().with_sync(config.sync_options());
    engine.on_not_authorized(|| tracing::error!("server rejected the session"))?;

    let now = now_millis();
    for id in &config.collections {
        engine.create_collection(CollectionOptions::new(id.clone()).sync_mode(SyncMode::Auto), now)?;

        let collection = id.clone();
        engine.collection_mut(id)?.subscribe(move |models| {
            tracing::info!(collection = %collection, models = models.len(), "collection changed");
        });
    }

    if config.collections.is_empty() {
        tracing::warn!("TESSERA_COLLECTIONS is empty, only the link will be kept alive");
    }

    let client = SyncClient::start(engine, config);

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    client.shutdown().await?;

    Ok(())
}
