//! `depotflow-shipping`: shipments and bundles.
//!
//! A bundle is a set of shipments that form one physical parcel and must move
//! through pick/pack/ship/deliver in lock-step.

pub mod bundle;
pub mod queue;
pub mod shipment;

pub use bundle::{plan_bundle_advance, Bundle, BundleItem, BundleMembership, BundleNotes};
pub use queue::StaffQueue;
pub use shipment::{
    CreateShipment, Priority, Shipment, ShipmentCommand, ShipmentEvent, ShipmentStatus,
    StatusMilestone,
};
