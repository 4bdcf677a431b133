//! `depotflow-products`: product lifecycle state machine.

pub mod inspection;
pub mod product;
pub mod status;

pub use inspection::{Condition, InspectionProgressView, PhotoSlot, ProductMetadata};
pub use product::{
    ForceReturn, InspectionProgressSaved, LocationAssigned, MirrorShipment, Product,
    ProductCommand, ProductEvent, ProductRegistered, RegisterProduct, ReleaseReservation,
    RestockProduct, SaveInspectionProgress, AssignLocation, ShipmentMilestone, StatusChanged,
    TransitionStatus, matches_sku_suffix,
};
pub use status::ProductStatus;
