use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use depotflow_core::{
    Aggregate, AggregateRoot, BundleId, DomainError, OrderId, ProductId, ShipmentId,
};
use depotflow_events::{
    ActivityKind, AuditEvent, AuditRecord, Event, TimelineEntry, TimelineKind,
};

use crate::{BundleMembership, BundleNotes};

/// Default time allowed between shipment creation and dispatch.
pub const DEFAULT_DEADLINE_DAYS: i64 = 3;

/// Declared value (minor units) above which a shipment is high priority.
pub const HIGH_PRIORITY_THRESHOLD: u64 = 500_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShipmentStatus {
    Pending,
    Picked,
    Packed,
    Shipped,
    Delivered,
}

impl ShipmentStatus {
    pub const ALL: [ShipmentStatus; 5] = [
        ShipmentStatus::Pending,
        ShipmentStatus::Picked,
        ShipmentStatus::Packed,
        ShipmentStatus::Shipped,
        ShipmentStatus::Delivered,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ShipmentStatus::Pending => "pending",
            ShipmentStatus::Picked => "picked",
            ShipmentStatus::Packed => "packed",
            ShipmentStatus::Shipped => "shipped",
            ShipmentStatus::Delivered => "delivered",
        }
    }

    /// The only legal successor; no skipping, no backward moves.
    pub fn next(&self) -> Option<ShipmentStatus> {
        match self {
            ShipmentStatus::Pending => Some(ShipmentStatus::Picked),
            ShipmentStatus::Picked => Some(ShipmentStatus::Packed),
            ShipmentStatus::Packed => Some(ShipmentStatus::Shipped),
            ShipmentStatus::Shipped => Some(ShipmentStatus::Delivered),
            ShipmentStatus::Delivered => None,
        }
    }

    /// Whether `target` is a legal advance from this status.
    ///
    /// Forward by one step, plus `pending -> packed` as a combined
    /// pick-and-pack.
    pub fn accepts(&self, target: ShipmentStatus) -> bool {
        self.next() == Some(target)
            || (*self == ShipmentStatus::Pending && target == ShipmentStatus::Packed)
    }
}

impl core::fmt::Display for ShipmentStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for ShipmentStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ShipmentStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown shipment status '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn from_declared_value(value: u64) -> Self {
        if value > HIGH_PRIORITY_THRESHOLD {
            Priority::High
        } else {
            Priority::Normal
        }
    }
}

/// A status together with the time it was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMilestone {
    pub status: ShipmentStatus,
    pub at: DateTime<Utc>,
}

/// Aggregate root: Shipment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shipment {
    id: ShipmentId,
    order_id: Option<OrderId>,
    /// `None` only on legacy bundle rows whose members live in `notes`.
    product_id: Option<ProductId>,
    bundle_id: Option<BundleId>,
    status: ShipmentStatus,
    carrier: Option<String>,
    method: Option<String>,
    tracking_number: Option<String>,
    priority: Priority,
    deadline: Option<DateTime<Utc>>,
    notes: Option<String>,
    created_at: Option<DateTime<Utc>>,
    picked_at: Option<DateTime<Utc>>,
    packed_at: Option<DateTime<Utc>>,
    shipped_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl Shipment {
    pub fn empty(id: ShipmentId) -> Self {
        Self {
            id,
            order_id: None,
            product_id: None,
            bundle_id: None,
            status: ShipmentStatus::Pending,
            carrier: None,
            method: None,
            tracking_number: None,
            priority: Priority::Normal,
            deadline: None,
            notes: None,
            created_at: None,
            picked_at: None,
            packed_at: None,
            shipped_at: None,
            delivered_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> ShipmentId {
        self.id
    }

    pub fn order_id(&self) -> Option<OrderId> {
        self.order_id
    }

    pub fn product_id(&self) -> Option<ProductId> {
        self.product_id
    }

    pub fn bundle_id(&self) -> Option<&BundleId> {
        self.bundle_id.as_ref()
    }

    pub fn status(&self) -> ShipmentStatus {
        self.status
    }

    pub fn carrier(&self) -> Option<&str> {
        self.carrier.as_deref()
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    pub fn tracking_number(&self) -> Option<&str> {
        self.tracking_number.as_deref()
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    /// Bundle payload embedded in `notes`, if any.
    pub fn legacy_bundle(&self) -> Option<BundleNotes> {
        self.notes.as_deref().and_then(BundleNotes::parse)
    }

    /// Reached statuses in order, from the transition timestamps.
    pub fn status_history(&self) -> Vec<StatusMilestone> {
        [
            (ShipmentStatus::Pending, self.created_at),
            (ShipmentStatus::Picked, self.picked_at),
            (ShipmentStatus::Packed, self.packed_at),
            (ShipmentStatus::Shipped, self.shipped_at),
            (ShipmentStatus::Delivered, self.delivered_at),
        ]
        .into_iter()
        .filter_map(|(status, at)| at.map(|at| StatusMilestone { status, at }))
        .collect()
    }

    pub fn milestones(&self) -> Vec<TimelineEntry> {
        self.status_history()
            .into_iter()
            .map(|m| {
                TimelineEntry::new(
                    TimelineKind::Shipment,
                    format!("{}:{}", self.id, m.status),
                    m.at,
                    format!("Shipment {}", m.status),
                )
                .with_detail(json!({
                    "shipmentId": self.id,
                    "bundleId": self.bundle_id,
                    "trackingNumber": self.tracking_number,
                }))
            })
            .collect()
    }
}

impl AggregateRoot for Shipment {
    type Id = ShipmentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateShipment.
///
/// With `bundle` set, the legacy notes payload is written as well so older
/// readers still see the grouping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateShipment {
    pub shipment_id: ShipmentId,
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub bundle: Option<BundleMembership>,
    pub carrier: Option<String>,
    pub method: Option<String>,
    pub tracking_number: Option<String>,
    pub priority: Option<Priority>,
    /// Sum of the declared values of the parcel's products.
    pub declared_value: u64,
    pub deadline: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShipmentCommand {
    Create(CreateShipment),
    Advance {
        target: ShipmentStatus,
        occurred_at: DateTime<Utc>,
    },
    AttachBundle {
        bundle_id: BundleId,
        occurred_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentCreated {
    pub shipment_id: ShipmentId,
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub bundle_id: Option<BundleId>,
    pub carrier: Option<String>,
    pub method: Option<String>,
    pub tracking_number: Option<String>,
    pub priority: Priority,
    pub deadline: DateTime<Utc>,
    pub notes: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentAdvanced {
    pub shipment_id: ShipmentId,
    pub order_id: Option<OrderId>,
    pub product_id: Option<ProductId>,
    pub bundle_id: Option<BundleId>,
    pub from: ShipmentStatus,
    pub to: ShipmentStatus,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleAttached {
    pub shipment_id: ShipmentId,
    pub bundle_id: BundleId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShipmentEvent {
    ShipmentCreated(ShipmentCreated),
    ShipmentAdvanced(ShipmentAdvanced),
    BundleAttached(BundleAttached),
}

impl Event for ShipmentEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ShipmentEvent::ShipmentCreated(_) => "shipping.shipment.created",
            ShipmentEvent::ShipmentAdvanced(_) => "shipping.shipment.advanced",
            ShipmentEvent::BundleAttached(_) => "shipping.shipment.bundle_attached",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ShipmentEvent::ShipmentCreated(e) => e.occurred_at,
            ShipmentEvent::ShipmentAdvanced(e) => e.occurred_at,
            ShipmentEvent::BundleAttached(e) => e.occurred_at,
        }
    }
}

impl AuditEvent for ShipmentEvent {
    fn audit(&self) -> Option<AuditRecord> {
        match self {
            ShipmentEvent::ShipmentCreated(e) => Some(
                AuditRecord::new(ActivityKind::ShipmentCreated, "Shipment created")
                    .product(e.product_id)
                    .order(e.order_id)
                    .metadata(json!({
                        "shipmentId": e.shipment_id,
                        "bundleId": e.bundle_id,
                        "carrier": e.carrier,
                        "priority": e.priority,
                        "deadline": e.deadline,
                    })),
            ),
            ShipmentEvent::ShipmentAdvanced(e) => {
                let mut record = AuditRecord::new(
                    ActivityKind::ShipmentStatus,
                    format!("Shipment status changed from {} to {}", e.from, e.to),
                )
                .metadata(json!({
                    "shipmentId": e.shipment_id,
                    "bundleId": e.bundle_id,
                    "oldStatus": e.from,
                    "newStatus": e.to,
                }));
                record.product_id = e.product_id;
                record.order_id = e.order_id;
                Some(record)
            }
            ShipmentEvent::BundleAttached(_) => None,
        }
    }
}

impl Aggregate for Shipment {
    type Command = ShipmentCommand;
    type Event = ShipmentEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ShipmentEvent::ShipmentCreated(e) => {
                self.id = e.shipment_id;
                self.order_id = Some(e.order_id);
                self.product_id = Some(e.product_id);
                self.bundle_id = e.bundle_id.clone();
                self.status = ShipmentStatus::Pending;
                self.carrier = e.carrier.clone();
                self.method = e.method.clone();
                self.tracking_number = e.tracking_number.clone();
                self.priority = e.priority;
                self.deadline = Some(e.deadline);
                self.notes = e.notes.clone();
                self.created_at = Some(e.occurred_at);
                self.created = true;
            }
            ShipmentEvent::ShipmentAdvanced(e) => {
                self.status = e.to;
                let stamp = Some(e.occurred_at);
                match e.to {
                    ShipmentStatus::Picked => self.picked_at = stamp,
                    ShipmentStatus::Packed => {
                        if e.from == ShipmentStatus::Pending {
                            self.picked_at = stamp;
                        }
                        self.packed_at = stamp;
                    }
                    ShipmentStatus::Shipped => self.shipped_at = stamp,
                    ShipmentStatus::Delivered => self.delivered_at = stamp,
                    ShipmentStatus::Pending => {}
                }
            }
            ShipmentEvent::BundleAttached(e) => {
                self.bundle_id = Some(e.bundle_id.clone());
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            ShipmentCommand::Create(cmd) => self.handle_create(cmd),
            ShipmentCommand::Advance {
                target,
                occurred_at,
            } => self.handle_advance(*target, *occurred_at),
            ShipmentCommand::AttachBundle {
                bundle_id,
                occurred_at,
            } => self.handle_attach_bundle(bundle_id, *occurred_at),
        }
    }
}

impl Shipment {
    fn ensure_created(&self) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found(format!("shipment {}", self.id)));
        }
        Ok(())
    }

    /// Validates `target` against the current status.
    pub fn check_advance(&self, target: ShipmentStatus) -> Result<(), DomainError> {
        self.ensure_created()?;
        if !self.status.accepts(target) {
            return Err(DomainError::invalid_transition(format!(
                "shipment {}: {} -> {}",
                self.id, self.status, target
            )));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateShipment) -> Result<Vec<ShipmentEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("shipment already exists"));
        }

        let deadline = cmd
            .deadline
            .unwrap_or(cmd.occurred_at + Duration::days(DEFAULT_DEADLINE_DAYS));
        if deadline < cmd.occurred_at {
            return Err(DomainError::validation("deadline must not be in the past"));
        }

        let notes = match &cmd.bundle {
            Some(membership) => {
                if !membership.members.contains(&cmd.product_id) {
                    return Err(DomainError::validation(
                        "bundle membership must include the shipment's product",
                    ));
                }
                Some(BundleNotes::for_membership(membership).to_json()?)
            }
            None => cmd.notes.clone(),
        };

        Ok(vec![ShipmentEvent::ShipmentCreated(ShipmentCreated {
            shipment_id: cmd.shipment_id,
            order_id: cmd.order_id,
            product_id: cmd.product_id,
            bundle_id: cmd.bundle.as_ref().map(|b| b.bundle_id.clone()),
            carrier: cmd.carrier.clone(),
            method: cmd.method.clone(),
            tracking_number: cmd.tracking_number.clone(),
            priority: cmd
                .priority
                .unwrap_or_else(|| Priority::from_declared_value(cmd.declared_value)),
            deadline,
            notes,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_advance(
        &self,
        target: ShipmentStatus,
        occurred_at: DateTime<Utc>,
    ) -> Result<Vec<ShipmentEvent>, DomainError> {
        self.check_advance(target)?;

        Ok(vec![ShipmentEvent::ShipmentAdvanced(ShipmentAdvanced {
            shipment_id: self.id,
            order_id: self.order_id,
            product_id: self.product_id,
            bundle_id: self.bundle_id.clone(),
            from: self.status,
            to: target,
            occurred_at,
        })])
    }

    fn handle_attach_bundle(
        &self,
        bundle_id: &BundleId,
        occurred_at: DateTime<Utc>,
    ) -> Result<Vec<ShipmentEvent>, DomainError> {
        self.ensure_created()?;

        match &self.bundle_id {
            Some(current) if current == bundle_id => Ok(vec![]),
            Some(current) => Err(DomainError::conflict(format!(
                "shipment {} already belongs to bundle {}",
                self.id, current
            ))),
            None => Ok(vec![ShipmentEvent::BundleAttached(BundleAttached {
                shipment_id: self.id,
                bundle_id: bundle_id.clone(),
                occurred_at,
            })]),
        }
    }
}
