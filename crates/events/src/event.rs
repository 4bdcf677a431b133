use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use depotflow_core::{OrderId, ProductId};

use crate::ActivityKind;

/// A domain-agnostic event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
/// - produced only by accepted commands
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "shipping.shipment.advanced").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;
}

/// What an event contributes to the activity log.
///
/// Actor and timestamp are attached by the writer; the event only describes
/// itself.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub kind: ActivityKind,
    pub description: String,
    pub product_id: Option<ProductId>,
    pub order_id: Option<OrderId>,
    pub metadata: JsonValue,
}

impl AuditRecord {
    pub fn new(kind: ActivityKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            product_id: None,
            order_id: None,
            metadata: JsonValue::Null,
        }
    }

    pub fn product(mut self, product_id: ProductId) -> Self {
        self.product_id = Some(product_id);
        self
    }

    pub fn order(mut self, order_id: OrderId) -> Self {
        self.order_id = Some(order_id);
        self
    }

    pub fn metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Events that leave a trace in the activity log.
///
/// Returning `None` marks a pure mirror/bookkeeping event (listing mirrors,
/// location cache refreshes) whose audit entry is written by another event
/// of the same operation.
pub trait AuditEvent: Event {
    fn audit(&self) -> Option<AuditRecord>;
}
