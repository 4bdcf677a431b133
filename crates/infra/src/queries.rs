//! Read-side projections.
//!
//! Queries open a unit of work, read, and roll it back. They never write and
//! never record activity.

use std::cmp::Reverse;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{instrument, warn};

use depotflow_auth::{authorize, Permission, Principal};
use depotflow_core::{BundleId, DomainError, LocationId, OrderId, ProductId, ShipmentId};
use depotflow_events::{
    merge_timeline, ActivityFilter, ActivityPage, Pagination, SortOrder, TimelineEntry,
};
use depotflow_inventory::{replay_location, verify_chain, InventoryMovement};
use depotflow_products::{Condition, InspectionProgressView, Product, ProductStatus};
use depotflow_sales::{Listing, ShippingStatus};
use depotflow_shipping::{Priority, Shipment, ShipmentStatus, StaffQueue, StatusMilestone};

use crate::error::DispatchError;
use crate::operations::shipments::legacy_siblings;
use crate::operations::{load_product, load_shipment};
use crate::store::{FulfillmentStore, UnitOfWork};

/// Product with its current slot resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductView {
    pub product_id: ProductId,
    pub sku: String,
    pub name: Option<String>,
    pub category: String,
    pub status: ProductStatus,
    pub condition: Option<Condition>,
    pub location_id: Option<LocationId>,
    pub location_code: Option<String>,
    /// The cached location matches a replay of the movement ledger.
    pub ledger_consistent: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipmentHistory {
    pub shipment_id: ShipmentId,
    pub status: ShipmentStatus,
    pub queue: StaffQueue,
    pub milestones: Vec<StatusMilestone>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleView {
    pub bundle_id: BundleId,
    pub order_id: Option<OrderId>,
    pub shipment_ids: Vec<ShipmentId>,
    pub product_ids: Vec<ProductId>,
    /// Membership came from the notes payload; no bundle row exists yet.
    pub legacy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub shipment_id: ShipmentId,
    pub order_id: Option<OrderId>,
    pub product_id: Option<ProductId>,
    pub bundle_id: Option<BundleId>,
    pub status: ShipmentStatus,
    pub queue: StaffQueue,
    pub priority: Priority,
    pub deadline: Option<DateTime<Utc>>,
    pub tracking_number: Option<String>,
}

impl From<&Shipment> for QueueEntry {
    fn from(s: &Shipment) -> Self {
        Self {
            shipment_id: s.id_typed(),
            order_id: s.order_id(),
            product_id: s.product_id(),
            bundle_id: s.bundle_id().cloned(),
            status: s.status(),
            queue: StaffQueue::for_status(s.status()),
            priority: s.priority(),
            deadline: s.deadline(),
            tracking_number: s.tracking_number().map(str::to_string),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FulfillmentQueries<S> {
    store: S,
}

impl<S: FulfillmentStore> FulfillmentQueries<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Resolve a product by id, exact SKU, or SKU suffix, in that order.
    ///
    /// A suffix matching several SKUs resolves to the first in SKU order.
    #[instrument(skip(self))]
    pub async fn find_product(&self, key: &str) -> Result<Option<Product>, DispatchError> {
        let mut tx = self.store.begin().await?;
        let result = find_product(tx.as_mut(), key).await;
        release(tx).await;
        result
    }

    pub async fn product_view(&self, id: ProductId) -> Result<ProductView, DispatchError> {
        let mut tx = self.store.begin().await?;
        let result = product_view(tx.as_mut(), id).await;
        release(tx).await;
        result
    }

    /// Ledger entries for a product, newest first.
    pub async fn movement_history(
        &self,
        product_id: ProductId,
    ) -> Result<Vec<InventoryMovement>, DispatchError> {
        let mut tx = self.store.begin().await?;
        let result = async {
            load_product(tx.as_mut(), product_id).await?;
            let mut movements = tx.movements_for_product(product_id).await?;
            if let Err(e) = verify_chain(&movements) {
                warn!(%product_id, error = %e, "movement ledger chain is broken");
            }
            movements.reverse();
            Ok::<_, DispatchError>(movements)
        }
        .await;
        release(tx).await;
        result
    }

    pub async fn shipment_history(&self, id: ShipmentId) -> Result<ShipmentHistory, DispatchError> {
        let mut tx = self.store.begin().await?;
        let result = load_shipment(tx.as_mut(), id).await.map(|s| ShipmentHistory {
            shipment_id: s.id_typed(),
            status: s.status(),
            queue: StaffQueue::for_status(s.status()),
            milestones: s.status_history(),
        });
        release(tx).await;
        result
    }

    /// The bundle a shipment belongs to, if any.
    pub async fn bundle_membership(
        &self,
        shipment_id: ShipmentId,
    ) -> Result<Option<BundleView>, DispatchError> {
        let mut tx = self.store.begin().await?;
        let result = bundle_membership(tx.as_mut(), shipment_id).await;
        release(tx).await;
        result
    }

    /// Paginated audit log. Newest first unless `order` says otherwise.
    #[instrument(skip(self, actor), fields(actor = %actor.name), err)]
    pub async fn activities(
        &self,
        actor: &Principal,
        filter: &ActivityFilter,
        pagination: Pagination,
        order: SortOrder,
    ) -> Result<ActivityPage, DispatchError> {
        authorize(actor, Permission::ViewActivity)?;
        let mut tx = self.store.begin().await?;
        let result = tx
            .activities(filter, pagination, order)
            .await
            .map_err(DispatchError::from);
        release(tx).await;
        result
    }

    /// Activities, movements, order and shipment milestones of one product,
    /// oldest first.
    pub async fn product_timeline(
        &self,
        product_id: ProductId,
    ) -> Result<Vec<TimelineEntry>, DispatchError> {
        let mut tx = self.store.begin().await?;
        let result = product_timeline(tx.as_mut(), product_id).await;
        release(tx).await;
        result
    }

    /// Shipments in a staff queue, most urgent first.
    pub async fn staff_queue(&self, queue: StaffQueue) -> Result<Vec<QueueEntry>, DispatchError> {
        let mut tx = self.store.begin().await?;
        let result = tx.shipments_by_status(queue.statuses()).await;
        release(tx).await;

        let mut entries: Vec<QueueEntry> = result?.iter().map(QueueEntry::from).collect();
        entries.sort_by_key(|e| (Reverse(e.priority), e.deadline.is_none(), e.deadline));
        Ok(entries)
    }

    pub async fn inspection_progress(
        &self,
        product_id: ProductId,
    ) -> Result<InspectionProgressView, DispatchError> {
        let mut tx = self.store.begin().await?;
        let result = load_product(tx.as_mut(), product_id).await;
        release(tx).await;
        Ok(result?.inspection_progress())
    }

    /// Latest delivered listings, newest delivery first.
    pub async fn recent_deliveries(&self, limit: usize) -> Result<Vec<Listing>, DispatchError> {
        let mut tx = self.store.begin().await?;
        let result = tx
            .listings_by_shipping_status(ShippingStatus::Delivered, Some(limit))
            .await;
        release(tx).await;
        Ok(result?)
    }
}

/// Roll back a read-only unit of work.
pub(crate) async fn release(tx: Box<dyn UnitOfWork>) {
    if let Err(e) = tx.rollback().await {
        warn!(error = %e, "read rollback failed");
    }
}

async fn find_product(
    tx: &mut dyn UnitOfWork,
    key: &str,
) -> Result<Option<Product>, DispatchError> {
    let key = key.trim();
    if key.is_empty() {
        return Err(DomainError::validation("product key must not be empty").into());
    }
    if let Ok(id) = key.parse::<ProductId>() {
        if let Some(product) = tx.product(id).await? {
            return Ok(Some(product));
        }
    }
    if let Some(product) = tx.product_by_sku(key).await? {
        return Ok(Some(product));
    }
    let mut candidates = tx.products_by_sku_suffix(key).await?;
    candidates.sort_by(|a, b| a.sku().cmp(b.sku()));
    Ok(candidates.into_iter().next())
}

async fn product_view(tx: &mut dyn UnitOfWork, id: ProductId) -> Result<ProductView, DispatchError> {
    let product = load_product(tx, id).await?;
    let location_code = match product.current_location_id() {
        Some(location_id) => tx.location(location_id).await?.map(|l| l.code),
        None => None,
    };
    let movements = tx.movements_for_product(id).await?;
    let ledger_consistent = replay_location(&movements) == product.current_location_id();
    Ok(ProductView {
        product_id: product.id_typed(),
        sku: product.sku().to_string(),
        name: product.name().map(str::to_string),
        category: product.category().to_string(),
        status: product.status(),
        condition: product.condition(),
        location_id: product.current_location_id(),
        location_code,
        ledger_consistent,
        updated_at: product.updated_at(),
    })
}

async fn bundle_membership(
    tx: &mut dyn UnitOfWork,
    shipment_id: ShipmentId,
) -> Result<Option<BundleView>, DispatchError> {
    let shipment = load_shipment(tx, shipment_id).await?;

    if let Some(bundle_id) = shipment.bundle_id().cloned() {
        let Some(bundle) = tx.bundle(&bundle_id).await? else {
            return Err(DomainError::bundle_inconsistent(format!(
                "bundle {bundle_id} has no bundle row"
            ))
            .into());
        };
        let members = tx.shipments_in_bundle(&bundle_id).await?;
        return Ok(Some(BundleView {
            bundle_id,
            order_id: Some(bundle.order_id),
            product_ids: members.iter().filter_map(Shipment::product_id).collect(),
            shipment_ids: bundle.shipment_ids,
            legacy: false,
        }));
    }

    let Some(notes) = shipment.legacy_bundle() else {
        return Ok(None);
    };
    let siblings = legacy_siblings(tx, &notes).await?;
    let shipment_ids = notes.resolve_members(&siblings)?;
    Ok(Some(BundleView {
        bundle_id: notes.bundle_id(),
        order_id: shipment.order_id(),
        shipment_ids,
        product_ids: notes.product_ids(),
        legacy: true,
    }))
}

async fn product_timeline(
    tx: &mut dyn UnitOfWork,
    product_id: ProductId,
) -> Result<Vec<TimelineEntry>, DispatchError> {
    load_product(tx, product_id).await?;

    let filter = ActivityFilter::for_product(product_id);
    let mut activities = Vec::new();
    let mut page = 1;
    loop {
        let batch = tx
            .activities(
                &filter,
                Pagination::new(page, Pagination::MAX_PER_PAGE),
                SortOrder::OldestFirst,
            )
            .await?;
        let fetched = batch.items.len() as u64;
        activities.extend(batch.items.iter().map(TimelineEntry::from));
        if fetched == 0 || u64::from(page) * u64::from(Pagination::MAX_PER_PAGE) >= batch.total {
            break;
        }
        page += 1;
    }

    let movements = tx
        .movements_for_product(product_id)
        .await?
        .iter()
        .map(TimelineEntry::from)
        .collect();
    let orders = tx
        .orders_for_product(product_id)
        .await?
        .iter()
        .flat_map(|o| o.milestones())
        .collect();
    let shipments = tx
        .shipments_for_product(product_id)
        .await?
        .iter()
        .flat_map(Shipment::milestones)
        .collect();

    Ok(merge_timeline([activities, movements, orders, shipments]))
}
