use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use depotflow_core::{
    AggregateRoot, BundleId, ExpectedVersion, ListingId, LocationId, MovementId, OrderId,
    ProductId, ReturnId, ShipmentId,
};
use depotflow_events::{Activity, ActivityFilter, ActivityPage, Pagination, SortOrder};
use depotflow_inventory::{InventoryMovement, Location};
use depotflow_products::{matches_sku_suffix, Product};
use depotflow_sales::{Listing, Order, ReturnRequest, ShippingStatus};
use depotflow_shipping::{Bundle, Shipment, ShipmentStatus};

use super::{FulfillmentStore, UnitOfWork};
use crate::error::StoreError;

#[derive(Debug, Clone, Default)]
struct State {
    products: BTreeMap<ProductId, Product>,
    locations: BTreeMap<LocationId, Location>,
    /// Append order; the last entry for a product is its latest movement.
    movements: Vec<InventoryMovement>,
    orders: BTreeMap<OrderId, Order>,
    listings: BTreeMap<ListingId, Listing>,
    shipments: BTreeMap<ShipmentId, Shipment>,
    bundles: BTreeMap<BundleId, Bundle>,
    returns: BTreeMap<ReturnId, ReturnRequest>,
    activities: Vec<Activity>,
}

/// In-memory store.
///
/// Intended for tests/dev. Units of work are fully serialized: `begin` waits
/// for the previous unit of work to finish, so every unit sees a consistent
/// snapshot and commits atomically.
#[derive(Debug, Clone, Default)]
pub struct InMemoryFulfillmentStore {
    state: Arc<Mutex<State>>,
    fail_activity_writes: Arc<AtomicBool>,
}

impl InMemoryFulfillmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every activity insert fail until switched off again.
    pub fn fail_activity_writes(&self, fail: bool) {
        self.fail_activity_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl FulfillmentStore for InMemoryFulfillmentStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(InMemoryUnitOfWork {
            guard,
            staged,
            fail_activity_writes: self.fail_activity_writes.clone(),
        }))
    }
}

struct InMemoryUnitOfWork {
    guard: OwnedMutexGuard<State>,
    staged: State,
    fail_activity_writes: Arc<AtomicBool>,
}

fn check_version<A: AggregateRoot>(
    stored: Option<&A>,
    expected: ExpectedVersion,
    what: &str,
) -> Result<(), StoreError> {
    let stored = stored.ok_or_else(|| StoreError::Conflict(format!("{what} no longer exists")))?;
    if !expected.matches(stored.version()) {
        return Err(StoreError::Conflict(format!(
            "{what}: expected {expected:?}, found version {}",
            stored.version()
        )));
    }
    Ok(())
}

fn insert_new<K: Ord, V>(map: &mut BTreeMap<K, V>, key: K, value: V, what: &str) -> Result<(), StoreError> {
    if map.contains_key(&key) {
        return Err(StoreError::Conflict(format!("{what} already exists")));
    }
    map.insert(key, value);
    Ok(())
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    async fn product(&mut self, id: ProductId) -> Result<Option<Product>, StoreError> {
        Ok(self.staged.products.get(&id).cloned())
    }

    async fn product_by_sku(&mut self, sku: &str) -> Result<Option<Product>, StoreError> {
        Ok(self.staged.products.values().find(|p| p.sku() == sku).cloned())
    }

    async fn products_by_sku_suffix(&mut self, suffix: &str) -> Result<Vec<Product>, StoreError> {
        Ok(self
            .staged
            .products
            .values()
            .filter(|p| matches_sku_suffix(p.sku(), suffix))
            .cloned()
            .collect())
    }

    async fn insert_product(&mut self, product: &Product) -> Result<(), StoreError> {
        if self.staged.products.values().any(|p| p.sku() == product.sku()) {
            return Err(StoreError::Conflict(format!("sku {} already exists", product.sku())));
        }
        insert_new(
            &mut self.staged.products,
            product.id_typed(),
            product.clone(),
            "product",
        )
    }

    async fn update_product(
        &mut self,
        product: &Product,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let id = product.id_typed();
        check_version(self.staged.products.get(&id), expected, "product")?;
        self.staged.products.insert(id, product.clone());
        Ok(())
    }

    async fn location(&mut self, id: LocationId) -> Result<Option<Location>, StoreError> {
        Ok(self.staged.locations.get(&id).cloned())
    }

    async fn location_by_code(&mut self, code: &str) -> Result<Option<Location>, StoreError> {
        Ok(self.staged.locations.values().find(|l| l.code == code).cloned())
    }

    async fn insert_location(&mut self, location: &Location) -> Result<(), StoreError> {
        if self.staged.locations.values().any(|l| l.code == location.code) {
            return Err(StoreError::Conflict(format!(
                "location code {} already exists",
                location.code
            )));
        }
        insert_new(
            &mut self.staged.locations,
            location.id,
            location.clone(),
            "location",
        )
    }

    async fn movement(&mut self, id: MovementId) -> Result<Option<InventoryMovement>, StoreError> {
        Ok(self.staged.movements.iter().find(|m| m.id == id).cloned())
    }

    async fn latest_movement(
        &mut self,
        product_id: ProductId,
    ) -> Result<Option<InventoryMovement>, StoreError> {
        Ok(self
            .staged
            .movements
            .iter()
            .rev()
            .find(|m| m.product_id == product_id)
            .cloned())
    }

    async fn movements_for_product(
        &mut self,
        product_id: ProductId,
    ) -> Result<Vec<InventoryMovement>, StoreError> {
        Ok(self
            .staged
            .movements
            .iter()
            .filter(|m| m.product_id == product_id)
            .cloned()
            .collect())
    }

    async fn insert_movement(&mut self, movement: &InventoryMovement) -> Result<(), StoreError> {
        if self.staged.movements.iter().any(|m| m.id == movement.id) {
            return Err(StoreError::Conflict("movement already exists".to_string()));
        }
        self.staged.movements.push(movement.clone());
        Ok(())
    }

    async fn delete_movement(&mut self, id: MovementId) -> Result<(), StoreError> {
        let before = self.staged.movements.len();
        self.staged.movements.retain(|m| m.id != id);
        if self.staged.movements.len() == before {
            return Err(StoreError::Conflict(format!("movement {id} already deleted")));
        }
        Ok(())
    }

    async fn order(&mut self, id: OrderId) -> Result<Option<Order>, StoreError> {
        Ok(self.staged.orders.get(&id).cloned())
    }

    async fn orders_for_product(&mut self, product_id: ProductId) -> Result<Vec<Order>, StoreError> {
        Ok(self
            .staged
            .orders
            .values()
            .filter(|o| o.contains_product(product_id))
            .cloned()
            .collect())
    }

    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError> {
        if self
            .staged
            .orders
            .values()
            .any(|o| o.order_number() == order.order_number())
        {
            return Err(StoreError::Conflict(format!(
                "order number {} already exists",
                order.order_number()
            )));
        }
        insert_new(&mut self.staged.orders, order.id_typed(), order.clone(), "order")
    }

    async fn update_order(
        &mut self,
        order: &Order,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let id = order.id_typed();
        check_version(self.staged.orders.get(&id), expected, "order")?;
        self.staged.orders.insert(id, order.clone());
        Ok(())
    }

    async fn listing(&mut self, id: ListingId) -> Result<Option<Listing>, StoreError> {
        Ok(self.staged.listings.get(&id).cloned())
    }

    async fn listings_for_product(
        &mut self,
        product_id: ProductId,
    ) -> Result<Vec<Listing>, StoreError> {
        Ok(self
            .staged
            .listings
            .values()
            .filter(|l| l.product_id() == product_id)
            .cloned()
            .collect())
    }

    async fn listings_by_shipping_status(
        &mut self,
        status: ShippingStatus,
        limit: Option<usize>,
    ) -> Result<Vec<Listing>, StoreError> {
        let mut matched: Vec<Listing> = self
            .staged
            .listings
            .values()
            .filter(|l| l.shipping_status() == status)
            .cloned()
            .collect();
        match status {
            ShippingStatus::Delivered => {
                matched.sort_by(|a, b| b.delivered_at().cmp(&a.delivered_at()))
            }
            _ => matched.sort_by_key(|l| l.shipped_at()),
        }
        if let Some(limit) = limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn insert_listing(&mut self, listing: &Listing) -> Result<(), StoreError> {
        if self
            .staged
            .listings
            .values()
            .any(|l| l.product_id() == listing.product_id() && l.platform() == listing.platform())
        {
            return Err(StoreError::Conflict(format!(
                "listing on {} already exists for product {}",
                listing.platform(),
                listing.product_id()
            )));
        }
        insert_new(
            &mut self.staged.listings,
            listing.id_typed(),
            listing.clone(),
            "listing",
        )
    }

    async fn update_listing(
        &mut self,
        listing: &Listing,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let id = listing.id_typed();
        check_version(self.staged.listings.get(&id), expected, "listing")?;
        self.staged.listings.insert(id, listing.clone());
        Ok(())
    }

    async fn shipment(&mut self, id: ShipmentId) -> Result<Option<Shipment>, StoreError> {
        Ok(self.staged.shipments.get(&id).cloned())
    }

    async fn shipments_for_order(
        &mut self,
        order_id: OrderId,
    ) -> Result<Vec<Shipment>, StoreError> {
        Ok(self
            .staged
            .shipments
            .values()
            .filter(|s| s.order_id() == Some(order_id))
            .cloned()
            .collect())
    }

    async fn shipments_for_product(
        &mut self,
        product_id: ProductId,
    ) -> Result<Vec<Shipment>, StoreError> {
        Ok(self
            .staged
            .shipments
            .values()
            .filter(|s| {
                s.product_id() == Some(product_id)
                    || s.legacy_bundle()
                        .is_some_and(|notes| notes.product_ids().contains(&product_id))
            })
            .cloned()
            .collect())
    }

    async fn shipments_by_status(
        &mut self,
        statuses: &[ShipmentStatus],
    ) -> Result<Vec<Shipment>, StoreError> {
        Ok(self
            .staged
            .shipments
            .values()
            .filter(|s| statuses.contains(&s.status()))
            .cloned()
            .collect())
    }

    async fn shipments_in_bundle(
        &mut self,
        bundle_id: &BundleId,
    ) -> Result<Vec<Shipment>, StoreError> {
        Ok(self
            .staged
            .shipments
            .values()
            .filter(|s| s.bundle_id() == Some(bundle_id))
            .cloned()
            .collect())
    }

    async fn legacy_bundle_shipments(&mut self) -> Result<Vec<Shipment>, StoreError> {
        Ok(self
            .staged
            .shipments
            .values()
            .filter(|s| s.bundle_id().is_none() && s.legacy_bundle().is_some())
            .cloned()
            .collect())
    }

    async fn insert_shipment(&mut self, shipment: &Shipment) -> Result<(), StoreError> {
        insert_new(
            &mut self.staged.shipments,
            shipment.id_typed(),
            shipment.clone(),
            "shipment",
        )
    }

    async fn update_shipment(
        &mut self,
        shipment: &Shipment,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let id = shipment.id_typed();
        check_version(self.staged.shipments.get(&id), expected, "shipment")?;
        self.staged.shipments.insert(id, shipment.clone());
        Ok(())
    }

    async fn bundle(&mut self, id: &BundleId) -> Result<Option<Bundle>, StoreError> {
        Ok(self.staged.bundles.get(id).cloned())
    }

    async fn insert_bundle(&mut self, bundle: &Bundle) -> Result<(), StoreError> {
        insert_new(
            &mut self.staged.bundles,
            bundle.id.clone(),
            bundle.clone(),
            "bundle",
        )
    }

    async fn return_request(&mut self, id: ReturnId) -> Result<Option<ReturnRequest>, StoreError> {
        Ok(self.staged.returns.get(&id).cloned())
    }

    async fn returns_for_product(
        &mut self,
        product_id: ProductId,
    ) -> Result<Vec<ReturnRequest>, StoreError> {
        Ok(self
            .staged
            .returns
            .values()
            .filter(|r| r.product_id() == product_id)
            .cloned()
            .collect())
    }

    async fn insert_return(&mut self, request: &ReturnRequest) -> Result<(), StoreError> {
        insert_new(
            &mut self.staged.returns,
            request.id_typed(),
            request.clone(),
            "return",
        )
    }

    async fn update_return(
        &mut self,
        request: &ReturnRequest,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let id = request.id_typed();
        check_version(self.staged.returns.get(&id), expected, "return")?;
        self.staged.returns.insert(id, request.clone());
        Ok(())
    }

    async fn insert_activity(&mut self, activity: &Activity) -> Result<(), StoreError> {
        if self.fail_activity_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("activity log unavailable".to_string()));
        }
        self.staged.activities.push(activity.clone());
        Ok(())
    }

    async fn activities(
        &mut self,
        filter: &ActivityFilter,
        pagination: Pagination,
        order: SortOrder,
    ) -> Result<ActivityPage, StoreError> {
        Ok(ActivityPage::paginate(
            self.staged.activities.iter().cloned(),
            filter,
            pagination,
            order,
        ))
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        let mut guard = this.guard;
        *guard = this.staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
