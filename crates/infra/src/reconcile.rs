//! Periodic carrier-delivery reconciliation.
//!
//! ```text
//! read phase (one short transaction, no lookups)
//!   ↓  listings still `shipped` + their tracking number and shipment
//! per item, no transaction held:
//!   carrier lookup (bounded by the lookup timeout)
//!   ↓  delivered?
//!   ReconcileDelivery (its own transaction, same path as a staff advance)
//! ```
//!
//! Items are independent: a failed lookup or apply is recorded in the
//! summary and the batch moves on. Shutdown is checked between items.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use depotflow_auth::Principal;
use depotflow_core::{ListingId, ProductId, ShipmentId};
use depotflow_sales::{OrderStatus, ShippingStatus};
use depotflow_shipping::ShipmentStatus;

use crate::carrier::CarrierTracker;
use crate::dispatcher::Dispatcher;
use crate::error::{CarrierError, DispatchError};
use crate::operations::ReconcileDelivery;
use crate::queries::release;
use crate::store::{FulfillmentStore, UnitOfWork};

/// A listing awaiting delivery confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDelivery {
    pub listing_id: ListingId,
    pub product_id: ProductId,
    pub shipment_id: Option<ShipmentId>,
    pub tracking_number: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Carrier timeout or error. Retried on the next scheduled run.
    ExternalLookupFailed,
    /// The delivery could not be applied.
    ApplyFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileFailure {
    pub listing_id: ListingId,
    pub tracking_number: Option<String>,
    pub kind: FailureKind,
    pub message: String,
}

/// Batch result of one reconciliation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileSummary {
    pub total_processed: usize,
    pub updated_count: usize,
    /// Listings without a tracking number.
    pub skipped_count: usize,
    pub errors: Vec<ReconcileFailure>,
    pub interrupted: bool,
}

pub struct DeliveryReconciler<S, C> {
    dispatcher: Dispatcher<S>,
    carrier: C,
    lookup_timeout: Duration,
    actor: Principal,
}

impl<S, C> DeliveryReconciler<S, C>
where
    S: FulfillmentStore,
    C: CarrierTracker,
{
    pub fn new(dispatcher: Dispatcher<S>, carrier: C, lookup_timeout: Duration) -> Self {
        Self {
            dispatcher,
            carrier,
            lookup_timeout,
            actor: Principal::system(),
        }
    }

    /// Read phase: listings still `shipped`, oldest shipment first.
    pub async fn pending(&self) -> Result<Vec<PendingDelivery>, DispatchError> {
        let mut tx = self.dispatcher.store().begin().await?;
        let result = collect_pending(tx.as_mut()).await;
        release(tx).await;
        result
    }

    /// Process every pending delivery once.
    ///
    /// Only a failed read phase is an error; per-item failures land in the
    /// summary.
    #[instrument(skip_all, err)]
    pub async fn run_once(
        &self,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<ReconcileSummary, DispatchError> {
        let pending = self.pending().await?;
        let mut summary = ReconcileSummary::default();

        for item in pending {
            if *shutdown.borrow() {
                summary.interrupted = true;
                break;
            }
            summary.total_processed += 1;

            let Some(tracking_number) = item.tracking_number.clone() else {
                debug!(listing_id = %item.listing_id, "no tracking number, skipped");
                summary.skipped_count += 1;
                continue;
            };

            let status = match self.lookup(&tracking_number).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(listing_id = %item.listing_id, %tracking_number, error = %e, "carrier lookup failed");
                    summary.errors.push(ReconcileFailure {
                        listing_id: item.listing_id,
                        tracking_number: Some(tracking_number),
                        kind: FailureKind::ExternalLookupFailed,
                        message: e.to_string(),
                    });
                    continue;
                }
            };
            if !status.is_delivered {
                continue;
            }

            let op = ReconcileDelivery {
                listing_id: item.listing_id,
                shipment_id: item.shipment_id,
                delivered_at: status.delivered_at,
            };
            match self.dispatcher.dispatch(&self.actor, &op).await {
                Ok(true) => summary.updated_count += 1,
                Ok(false) => debug!(listing_id = %item.listing_id, "already delivered"),
                Err(e) => {
                    warn!(listing_id = %item.listing_id, error = %e, "delivery could not be applied");
                    summary.errors.push(ReconcileFailure {
                        listing_id: item.listing_id,
                        tracking_number: Some(tracking_number),
                        kind: FailureKind::ApplyFailed,
                        message: e.to_string(),
                    });
                }
            }
        }

        info!(
            processed = summary.total_processed,
            updated = summary.updated_count,
            skipped = summary.skipped_count,
            failed = summary.errors.len(),
            interrupted = summary.interrupted,
            "reconciliation run finished"
        );
        Ok(summary)
    }

    async fn lookup(
        &self,
        tracking_number: &str,
    ) -> Result<crate::carrier::DeliveryStatus, CarrierError> {
        match tokio::time::timeout(self.lookup_timeout, self.carrier.lookup(tracking_number)).await
        {
            Ok(result) => result,
            Err(_) => Err(CarrierError::Timeout(self.lookup_timeout.as_millis() as u64)),
        }
    }
}

impl<S, C> DeliveryReconciler<S, C>
where
    S: FulfillmentStore + 'static,
    C: CarrierTracker + 'static,
{
    /// Run on a fixed interval until `shutdown` flips to `true`.
    ///
    /// The first run starts immediately. A run in progress finishes its
    /// current item before the loop exits.
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once(&shutdown).await {
                            error!(error = %e, "reconciliation run failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("reconciler stopped");
        })
    }
}

async fn collect_pending(tx: &mut dyn UnitOfWork) -> Result<Vec<PendingDelivery>, DispatchError> {
    let listings = tx
        .listings_by_shipping_status(ShippingStatus::Shipped, None)
        .await?;

    let mut pending = Vec::with_capacity(listings.len());
    for listing in listings {
        let product_id = listing.product_id();
        let shipment = tx
            .shipments_for_product(product_id)
            .await?
            .into_iter()
            .filter(|s| s.status() == ShipmentStatus::Shipped)
            .max_by_key(|s| (s.tracking_number().is_some(), s.created_at()));

        let mut tracking_number = shipment
            .as_ref()
            .and_then(|s| s.tracking_number())
            .map(str::to_string);
        if tracking_number.is_none() {
            tracking_number = tx
                .orders_for_product(product_id)
                .await?
                .into_iter()
                .filter(|o| o.status() == OrderStatus::Shipped)
                .find_map(|o| o.tracking_number().map(str::to_string));
        }

        pending.push(PendingDelivery {
            listing_id: listing.id_typed(),
            product_id,
            shipment_id: shipment.map(|s| s.id_typed()),
            tracking_number: tracking_number.filter(|t| !t.trim().is_empty()),
        });
    }
    Ok(pending)
}
