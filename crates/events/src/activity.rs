//! Activity audit log model.
//!
//! Activities are append-only: never updated, never deleted. They are the
//! only queryable history of who changed what.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use depotflow_core::{ActivityId, Entity, OrderId, ProductId, UserId};

use crate::AuditRecord;

/// Activity type tag.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    ProductRegistered,
    StatusChange,
    InspectionProgress,
    Inspection,
    InventoryMovement,
    Delete,
    LocationRegistered,
    ListingCreated,
    OrderCreated,
    OrderStatus,
    OrderCancelled,
    ShipmentCreated,
    ShipmentStatus,
    Shipping,
    Delivery,
    ReturnRequest,
    ReturnApproved,
    ReturnRejected,
    ReturnCompleted,
    BundleBackfill,
}

impl ActivityKind {
    pub const ALL: [ActivityKind; 20] = [
        ActivityKind::ProductRegistered,
        ActivityKind::StatusChange,
        ActivityKind::InspectionProgress,
        ActivityKind::Inspection,
        ActivityKind::InventoryMovement,
        ActivityKind::Delete,
        ActivityKind::LocationRegistered,
        ActivityKind::ListingCreated,
        ActivityKind::OrderCreated,
        ActivityKind::OrderStatus,
        ActivityKind::OrderCancelled,
        ActivityKind::ShipmentCreated,
        ActivityKind::ShipmentStatus,
        ActivityKind::Shipping,
        ActivityKind::Delivery,
        ActivityKind::ReturnRequest,
        ActivityKind::ReturnApproved,
        ActivityKind::ReturnRejected,
        ActivityKind::ReturnCompleted,
        ActivityKind::BundleBackfill,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::ProductRegistered => "product_registered",
            ActivityKind::StatusChange => "status_change",
            ActivityKind::InspectionProgress => "inspection_progress",
            ActivityKind::Inspection => "inspection",
            ActivityKind::InventoryMovement => "inventory_movement",
            ActivityKind::Delete => "delete",
            ActivityKind::LocationRegistered => "location_registered",
            ActivityKind::ListingCreated => "listing_created",
            ActivityKind::OrderCreated => "order_created",
            ActivityKind::OrderStatus => "order_status",
            ActivityKind::OrderCancelled => "order_cancelled",
            ActivityKind::ShipmentCreated => "shipment_created",
            ActivityKind::ShipmentStatus => "shipment_status",
            ActivityKind::Shipping => "shipping",
            ActivityKind::Delivery => "delivery",
            ActivityKind::ReturnRequest => "return_request",
            ActivityKind::ReturnApproved => "return_approved",
            ActivityKind::ReturnRejected => "return_rejected",
            ActivityKind::ReturnCompleted => "return_completed",
            ActivityKind::BundleBackfill => "bundle_backfill",
        }
    }
}

impl core::fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for ActivityKind {
    type Err = depotflow_core::DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActivityKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| depotflow_core::DomainError::validation(format!("unknown activity type '{s}'")))
    }
}

/// One audit log row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub id: ActivityId,
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    pub description: String,
    /// `None` when the system actor performed the operation.
    pub user_id: Option<UserId>,
    pub product_id: Option<ProductId>,
    pub order_id: Option<OrderId>,
    pub metadata: JsonValue,
    pub created_at: DateTime<Utc>,
}

impl Activity {
    pub fn from_record(record: AuditRecord, user_id: Option<UserId>, at: DateTime<Utc>) -> Self {
        Self {
            id: ActivityId::new(),
            kind: record.kind,
            description: record.description,
            user_id,
            product_id: record.product_id,
            order_id: record.order_id,
            metadata: record.metadata,
            created_at: at,
        }
    }
}

impl Entity for Activity {
    type Id = ActivityId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// Activity query filter. Unset fields match everything; the date range is
/// inclusive on both ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivityFilter {
    pub kind: Option<ActivityKind>,
    pub user_id: Option<UserId>,
    pub product_id: Option<ProductId>,
    pub order_id: Option<OrderId>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl ActivityFilter {
    pub fn for_product(product_id: ProductId) -> Self {
        Self {
            product_id: Some(product_id),
            ..Self::default()
        }
    }

    pub fn matches(&self, activity: &Activity) -> bool {
        if self.kind.is_some_and(|k| k != activity.kind) {
            return false;
        }
        if self.user_id.is_some() && self.user_id != activity.user_id {
            return false;
        }
        if self.product_id.is_some() && self.product_id != activity.product_id {
            return false;
        }
        if self.order_id.is_some() && self.order_id != activity.order_id {
            return false;
        }
        if self.from.is_some_and(|from| activity.created_at < from) {
            return false;
        }
        if self.to.is_some_and(|to| activity.created_at > to) {
            return false;
        }
        true
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

/// 1-based page request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Pagination {
    pub page: u32,
    pub per_page: u32,
}

impl Pagination {
    pub const MAX_PER_PAGE: u32 = 200;

    pub fn new(page: u32, per_page: u32) -> Self {
        Self {
            page: page.max(1),
            per_page: per_page.clamp(1, Self::MAX_PER_PAGE),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.per_page)
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(1, 50)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityPage {
    pub items: Vec<Activity>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

impl ActivityPage {
    /// Filter, order and slice an in-memory activity set.
    ///
    /// Ties on `created_at` are broken by id, which is time-ordered.
    pub fn paginate(
        activities: impl IntoIterator<Item = Activity>,
        filter: &ActivityFilter,
        pagination: Pagination,
        order: SortOrder,
    ) -> Self {
        let mut matched: Vec<Activity> = activities
            .into_iter()
            .filter(|a| filter.matches(a))
            .collect();
        matched.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        if order == SortOrder::NewestFirst {
            matched.reverse();
        }

        let total = matched.len() as u64;
        let items = matched
            .into_iter()
            .skip(pagination.offset() as usize)
            .take(pagination.per_page as usize)
            .collect();

        Self {
            items,
            total,
            page: pagination.page,
            per_page: pagination.per_page,
        }
    }
}
