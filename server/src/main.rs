//! Tessera Server binary.

use tessera_server::config::Config;
use tessera_server::AppState;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tessera_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    if config.auth_secret.is_none() {
        tracing::warn!("AUTH_SECRET not set, accepting unauthenticated connections");
    }

    let addr = config.addr();
    tracing::info!("Starting Tessera Server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    tessera_server::serve(listener, AppState::new(config)).await?;

    Ok(())
}
