//! Podium settlement daemon.
//!
//! Wires settings, the Postgres store, the ledger gateway, and the engine
//! together, then runs until interrupted. The HTTP surface is served by the
//! platform process and talks to the same engine handle.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use podium_core::{LeaderLock, QueryPort, StateStore};
use podium_engine::Engine;
use podium_gateway::{GatewayConfig, LedgerGateway, SolanaGateway};
use podium_settings::EngineSettings;
use podium_store::{schema, PgLeaderLock, PgQueryPort, PgStateStore, LEADER_LOCK_KEY};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = EngineSettings::from_env();
    let database_url = settings
        .database_url
        .clone()
        .context("DATABASE_URL is required")?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .context("failed to connect to the database")?;
    schema::migrate(&pool).await?;

    let store = Arc::new(PgStateStore::new(pool.clone())) as Arc<dyn StateStore>;
    let queries = Arc::new(PgQueryPort::new(pool.clone())) as Arc<dyn QueryPort>;
    let lock =
        Arc::new(PgLeaderLock::new(database_url, LEADER_LOCK_KEY)) as Arc<dyn LeaderLock>;

    let gateway: Option<Arc<dyn LedgerGateway>> = match GatewayConfig::from_settings(&settings) {
        Some(config) => match SolanaGateway::connect(config).await {
            Ok(gateway) => Some(Arc::new(gateway)),
            Err(e) => {
                warn!(error = %e, "ledger gateway failed to initialize, engine disabled");
                None
            }
        },
        None => {
            warn!("gateway configuration incomplete, engine disabled");
            None
        }
    };

    let engine = Engine::new(settings, store, queries, lock, gateway);
    engine.start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");
    engine.stop().await;
    pool.close().await;
    Ok(())
}
