//! Infrastructure layer: persistence, operation dispatch, synchronization,
//! carrier reconciliation and config.

pub mod carrier;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod operations;
pub mod queries;
pub mod reconcile;
pub mod store;
pub mod sync;

#[cfg(test)]
mod integration_tests;

pub use carrier::{CarrierTracker, DeliveryStatus, HttpCarrierTracker};
pub use config::FulfillmentConfig;
pub use dispatcher::{Dispatcher, OpContext, Operation};
pub use error::{CarrierError, ConfigError, DispatchError, StoreError};
pub use queries::FulfillmentQueries;
pub use reconcile::{DeliveryReconciler, ReconcileSummary};
pub use store::{FulfillmentStore, InMemoryFulfillmentStore, PostgresFulfillmentStore, UnitOfWork};
