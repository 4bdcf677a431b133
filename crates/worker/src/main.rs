//! Runs the periodic carrier-delivery reconciliation job.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;

use depotflow_infra::config::{CarrierConfig, StoreConfig};
use depotflow_infra::{
    DeliveryReconciler, Dispatcher, FulfillmentConfig, FulfillmentStore, HttpCarrierTracker,
    InMemoryFulfillmentStore, PostgresFulfillmentStore,
};
use depotflow_observability::LogFormat;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_format: LogFormat = match std::env::var("LOG_FORMAT") {
        Ok(raw) if !raw.trim().is_empty() => raw.parse().context("LOG_FORMAT")?,
        _ => LogFormat::default(),
    };
    depotflow_observability::init(log_format);

    let config = FulfillmentConfig::from_env().context("loading configuration")?;
    let Some(carrier) = config.carrier.clone() else {
        tracing::warn!("CARRIER_API_URL not set; delivery reconciliation disabled");
        return Ok(());
    };

    match &config.store {
        StoreConfig::InMemory => {
            tracing::warn!("USE_PERSISTENT_STORES not set; reconciling an empty in-memory store");
            run(InMemoryFulfillmentStore::new(), &carrier, &config).await
        }
        StoreConfig::Postgres {
            database_url,
            max_connections,
        } => {
            let store = PostgresFulfillmentStore::connect(database_url, *max_connections)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("applying migrations")?;
            run(store, &carrier, &config).await
        }
    }
}

async fn run<S>(store: S, carrier: &CarrierConfig, config: &FulfillmentConfig) -> anyhow::Result<()>
where
    S: FulfillmentStore + 'static,
{
    let tracker = HttpCarrierTracker::new(carrier).context("building carrier client")?;
    let reconciler = Arc::new(DeliveryReconciler::new(
        Dispatcher::new(store),
        tracker,
        carrier.lookup_timeout,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = reconciler.spawn(config.reconcile_interval, shutdown_rx);
    tracing::info!(
        interval_secs = config.reconcile_interval.as_secs(),
        "reconciler started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    tracing::info!("shutdown requested; finishing current item");
    let _ = shutdown_tx.send(true);
    handle.await.context("reconciler task panicked")?;
    Ok(())
}
