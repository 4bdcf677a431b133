//! Back-office operations, one struct per use case.
//!
//! Each implements [`Operation`](crate::dispatcher::Operation) and is run by
//! the [`Dispatcher`](crate::dispatcher::Dispatcher).

pub mod ledger;
pub mod lifecycle;
pub mod listings;
pub mod orders;
pub mod returns;
pub mod shipments;

pub use ledger::{MoveProduct, RegisterLocation, UndoMovement};
pub use lifecycle::{RecordInspection, RegisterProduct, TransitionProduct};
pub use listings::CreateListing;
pub use orders::{CancelOrder, ConfirmOrder, PlaceOrder, StartProcessing};
pub use returns::{ApproveReturn, CompleteReturn, RejectReturn, RequestReturn, RestockReturned};
pub use shipments::{
    AdvanceShipment, BackfillBundles, BackfillReport, CreateShipment, ReconcileDelivery,
};

use depotflow_core::{DomainError, ListingId, OrderId, ProductId, ReturnId, ShipmentId};
use depotflow_products::Product;
use depotflow_sales::{Listing, Order, ReturnRequest};
use depotflow_shipping::Shipment;

use crate::error::DispatchError;
use crate::store::UnitOfWork;

pub(crate) async fn load_product(
    tx: &mut dyn UnitOfWork,
    id: ProductId,
) -> Result<Product, DispatchError> {
    tx.product(id)
        .await?
        .ok_or_else(|| DomainError::not_found(format!("product {id}")).into())
}

pub(crate) async fn load_order(tx: &mut dyn UnitOfWork, id: OrderId) -> Result<Order, DispatchError> {
    tx.order(id)
        .await?
        .ok_or_else(|| DomainError::not_found(format!("order {id}")).into())
}

pub(crate) async fn load_listing(
    tx: &mut dyn UnitOfWork,
    id: ListingId,
) -> Result<Listing, DispatchError> {
    tx.listing(id)
        .await?
        .ok_or_else(|| DomainError::not_found(format!("listing {id}")).into())
}

pub(crate) async fn load_shipment(
    tx: &mut dyn UnitOfWork,
    id: ShipmentId,
) -> Result<Shipment, DispatchError> {
    tx.shipment(id)
        .await?
        .ok_or_else(|| DomainError::not_found(format!("shipment {id}")).into())
}

pub(crate) async fn load_return(
    tx: &mut dyn UnitOfWork,
    id: ReturnId,
) -> Result<ReturnRequest, DispatchError> {
    tx.return_request(id)
        .await?
        .ok_or_else(|| DomainError::not_found(format!("return {id}")).into())
}
