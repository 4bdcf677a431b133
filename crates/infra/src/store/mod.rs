//! Transactional persistence for fulfillment state.
//!
//! Every operation runs inside one [`UnitOfWork`]. Reads that precede a write
//! lock the row (Postgres `FOR UPDATE`; the in-memory store serializes whole
//! units of work). Writes stay invisible until `commit`.

mod in_memory;
mod postgres;

pub use in_memory::InMemoryFulfillmentStore;
pub use postgres::PostgresFulfillmentStore;

use async_trait::async_trait;

use depotflow_core::{
    AggregateRoot, BundleId, ExpectedVersion, ListingId, LocationId, MovementId, OrderId,
    ProductId, ReturnId, ShipmentId,
};
use depotflow_events::{Activity, ActivityFilter, ActivityPage, Pagination, SortOrder};
use depotflow_inventory::{InventoryMovement, Location};
use depotflow_products::Product;
use depotflow_sales::{Listing, Order, ReturnRequest, ShippingStatus};
use depotflow_shipping::{Bundle, Shipment, ShipmentStatus};

use crate::error::StoreError;

/// Opens units of work.
#[async_trait]
pub trait FulfillmentStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError>;
}

/// One transaction.
///
/// Dropping a unit of work without committing discards its writes.
#[async_trait]
pub trait UnitOfWork: Send {
    // Products
    async fn product(&mut self, id: ProductId) -> Result<Option<Product>, StoreError>;
    async fn product_by_sku(&mut self, sku: &str) -> Result<Option<Product>, StoreError>;
    async fn products_by_sku_suffix(&mut self, suffix: &str) -> Result<Vec<Product>, StoreError>;
    async fn insert_product(&mut self, product: &Product) -> Result<(), StoreError>;
    async fn update_product(
        &mut self,
        product: &Product,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError>;

    // Locations
    async fn location(&mut self, id: LocationId) -> Result<Option<Location>, StoreError>;
    async fn location_by_code(&mut self, code: &str) -> Result<Option<Location>, StoreError>;
    async fn insert_location(&mut self, location: &Location) -> Result<(), StoreError>;

    // Ledger
    async fn movement(&mut self, id: MovementId) -> Result<Option<InventoryMovement>, StoreError>;
    async fn latest_movement(
        &mut self,
        product_id: ProductId,
    ) -> Result<Option<InventoryMovement>, StoreError>;
    /// Oldest first.
    async fn movements_for_product(
        &mut self,
        product_id: ProductId,
    ) -> Result<Vec<InventoryMovement>, StoreError>;
    async fn insert_movement(&mut self, movement: &InventoryMovement) -> Result<(), StoreError>;
    async fn delete_movement(&mut self, id: MovementId) -> Result<(), StoreError>;

    // Orders
    async fn order(&mut self, id: OrderId) -> Result<Option<Order>, StoreError>;
    async fn orders_for_product(&mut self, product_id: ProductId) -> Result<Vec<Order>, StoreError>;
    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError>;
    async fn update_order(&mut self, order: &Order, expected: ExpectedVersion)
    -> Result<(), StoreError>;

    // Listings
    async fn listing(&mut self, id: ListingId) -> Result<Option<Listing>, StoreError>;
    async fn listings_for_product(
        &mut self,
        product_id: ProductId,
    ) -> Result<Vec<Listing>, StoreError>;
    /// Shipped listings oldest shipment first; delivered listings newest
    /// delivery first.
    async fn listings_by_shipping_status(
        &mut self,
        status: ShippingStatus,
        limit: Option<usize>,
    ) -> Result<Vec<Listing>, StoreError>;
    async fn insert_listing(&mut self, listing: &Listing) -> Result<(), StoreError>;
    async fn update_listing(
        &mut self,
        listing: &Listing,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError>;

    // Shipments and bundles
    async fn shipment(&mut self, id: ShipmentId) -> Result<Option<Shipment>, StoreError>;
    async fn shipments_for_order(&mut self, order_id: OrderId)
    -> Result<Vec<Shipment>, StoreError>;
    async fn shipments_for_product(
        &mut self,
        product_id: ProductId,
    ) -> Result<Vec<Shipment>, StoreError>;
    async fn shipments_by_status(
        &mut self,
        statuses: &[ShipmentStatus],
    ) -> Result<Vec<Shipment>, StoreError>;
    async fn shipments_in_bundle(
        &mut self,
        bundle_id: &BundleId,
    ) -> Result<Vec<Shipment>, StoreError>;
    /// Shipments without a bundle row whose notes carry a bundle payload.
    async fn legacy_bundle_shipments(&mut self) -> Result<Vec<Shipment>, StoreError>;
    async fn insert_shipment(&mut self, shipment: &Shipment) -> Result<(), StoreError>;
    async fn update_shipment(
        &mut self,
        shipment: &Shipment,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError>;
    async fn bundle(&mut self, id: &BundleId) -> Result<Option<Bundle>, StoreError>;
    async fn insert_bundle(&mut self, bundle: &Bundle) -> Result<(), StoreError>;

    // Returns
    async fn return_request(&mut self, id: ReturnId) -> Result<Option<ReturnRequest>, StoreError>;
    async fn returns_for_product(
        &mut self,
        product_id: ProductId,
    ) -> Result<Vec<ReturnRequest>, StoreError>;
    async fn insert_return(&mut self, request: &ReturnRequest) -> Result<(), StoreError>;
    async fn update_return(
        &mut self,
        request: &ReturnRequest,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError>;

    // Activity log
    async fn insert_activity(&mut self, activity: &Activity) -> Result<(), StoreError>;
    async fn activities(
        &mut self,
        filter: &ActivityFilter,
        pagination: Pagination,
        order: SortOrder,
    ) -> Result<ActivityPage, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Aggregates that can be written back through a unit of work.
#[async_trait]
pub trait Stored: AggregateRoot + Sync {
    async fn insert(&self, tx: &mut dyn UnitOfWork) -> Result<(), StoreError>;
    async fn save(&self, tx: &mut dyn UnitOfWork, expected: ExpectedVersion)
    -> Result<(), StoreError>;
}

#[async_trait]
impl Stored for Product {
    async fn insert(&self, tx: &mut dyn UnitOfWork) -> Result<(), StoreError> {
        tx.insert_product(self).await
    }

    async fn save(
        &self,
        tx: &mut dyn UnitOfWork,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        tx.update_product(self, expected).await
    }
}

#[async_trait]
impl Stored for Order {
    async fn insert(&self, tx: &mut dyn UnitOfWork) -> Result<(), StoreError> {
        tx.insert_order(self).await
    }

    async fn save(
        &self,
        tx: &mut dyn UnitOfWork,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        tx.update_order(self, expected).await
    }
}

#[async_trait]
impl Stored for Listing {
    async fn insert(&self, tx: &mut dyn UnitOfWork) -> Result<(), StoreError> {
        tx.insert_listing(self).await
    }

    async fn save(
        &self,
        tx: &mut dyn UnitOfWork,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        tx.update_listing(self, expected).await
    }
}

#[async_trait]
impl Stored for Shipment {
    async fn insert(&self, tx: &mut dyn UnitOfWork) -> Result<(), StoreError> {
        tx.insert_shipment(self).await
    }

    async fn save(
        &self,
        tx: &mut dyn UnitOfWork,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        tx.update_shipment(self, expected).await
    }
}

#[async_trait]
impl Stored for ReturnRequest {
    async fn insert(&self, tx: &mut dyn UnitOfWork) -> Result<(), StoreError> {
        tx.insert_return(self).await
    }

    async fn save(
        &self,
        tx: &mut dyn UnitOfWork,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        tx.update_return(self, expected).await
    }
}
