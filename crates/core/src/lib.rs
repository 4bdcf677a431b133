//! `depotflow-core`: domain foundation building blocks.
//!
//! Typed ids, the aggregate traits and the shared domain error. No IO.

pub mod aggregate;
pub mod entity;
pub mod error;
pub mod id;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{
    ActivityId, BundleId, ListingId, LocationId, MovementId, OrderId, OrderItemId, ProductId,
    ReturnId, ShipmentId, UserId,
};
