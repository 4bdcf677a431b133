use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use depotflow_core::{Aggregate, AggregateRoot, DomainError, OrderId, OrderItemId, ProductId};
use depotflow_events::{
    ActivityKind, AuditEvent, AuditRecord, Event, TimelineEntry, TimelineKind,
};

/// Order status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Processing => "processing",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order line linking the order to one product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: OrderItemId,
    pub product_id: ProductId,
    pub quantity: u32,
    /// Price in smallest currency unit.
    pub unit_price: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrderItem {
    pub product_id: ProductId,
    pub quantity: u32,
    pub unit_price: u64,
}

/// Aggregate root: Order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    id: OrderId,
    order_number: String,
    customer_id: String,
    status: OrderStatus,
    items: Vec<OrderItem>,
    tracking_number: Option<String>,
    carrier: Option<String>,
    created_at: Option<DateTime<Utc>>,
    shipped_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl Order {
    /// Create an empty, not-yet-created aggregate instance.
    pub fn empty(id: OrderId) -> Self {
        Self {
            id,
            order_number: String::new(),
            customer_id: String::new(),
            status: OrderStatus::Pending,
            items: Vec::new(),
            tracking_number: None,
            carrier: None,
            created_at: None,
            shipped_at: None,
            delivered_at: None,
            cancelled_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> OrderId {
        self.id
    }

    pub fn order_number(&self) -> &str {
        &self.order_number
    }

    pub fn customer_id(&self) -> &str {
        &self.customer_id
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn items(&self) -> &[OrderItem] {
        &self.items
    }

    pub fn tracking_number(&self) -> Option<&str> {
        self.tracking_number.as_deref()
    }

    pub fn carrier(&self) -> Option<&str> {
        self.carrier.as_deref()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn shipped_at(&self) -> Option<DateTime<Utc>> {
        self.shipped_at
    }

    pub fn delivered_at(&self) -> Option<DateTime<Utc>> {
        self.delivered_at
    }

    pub fn contains_product(&self, product_id: ProductId) -> bool {
        self.items.iter().any(|i| i.product_id == product_id)
    }

    pub fn product_ids(&self) -> Vec<ProductId> {
        self.items.iter().map(|i| i.product_id).collect()
    }

    /// Returns may only be requested once the goods left the warehouse.
    pub fn accepts_returns(&self) -> bool {
        matches!(self.status, OrderStatus::Shipped | OrderStatus::Delivered)
    }

    pub fn total(&self) -> u64 {
        self.items
            .iter()
            .map(|i| i.unit_price.saturating_mul(u64::from(i.quantity)))
            .sum()
    }

    /// Shipping milestones for the merged product timeline.
    pub fn milestones(&self) -> Vec<TimelineEntry> {
        let mut entries = Vec::new();
        if let Some(at) = self.created_at {
            entries.push(
                TimelineEntry::new(
                    TimelineKind::OrderPlaced,
                    self.id,
                    at,
                    format!("Order {} placed", self.order_number),
                )
                .with_detail(json!({ "orderNumber": self.order_number })),
            );
        }
        if let Some(at) = self.shipped_at {
            entries.push(
                TimelineEntry::new(
                    TimelineKind::OrderShipped,
                    self.id,
                    at,
                    format!("Order {} shipped", self.order_number),
                )
                .with_detail(json!({
                    "trackingNumber": self.tracking_number,
                    "carrier": self.carrier,
                })),
            );
        }
        if let Some(at) = self.delivered_at {
            entries.push(TimelineEntry::new(
                TimelineKind::OrderDelivered,
                self.id,
                at,
                format!("Order {} delivered", self.order_number),
            ));
        }
        entries
    }
}

impl AggregateRoot for Order {
    type Id = OrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: PlaceOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceOrder {
    pub order_id: OrderId,
    pub order_number: String,
    pub customer_id: String,
    pub items: Vec<NewOrderItem>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkShipped. Tracking details are optional; a later value never
/// erases an earlier one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkShipped {
    pub tracking_number: Option<String>,
    pub carrier: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderCommand {
    PlaceOrder(PlaceOrder),
    Confirm { occurred_at: DateTime<Utc> },
    StartProcessing { occurred_at: DateTime<Utc> },
    MarkShipped(MarkShipped),
    MarkDelivered { occurred_at: DateTime<Utc> },
    Cancel { reason: String, occurred_at: DateTime<Utc> },
}

/// Event: OrderPlaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: OrderId,
    pub order_number: String,
    pub customer_id: String,
    pub items: Vec<OrderItem>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderStatusChanged (confirm / start processing).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatusChanged {
    pub order_id: OrderId,
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderShipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderShipped {
    pub order_id: OrderId,
    pub order_number: String,
    pub previous: OrderStatus,
    pub tracking_number: Option<String>,
    pub carrier: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderDelivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDelivered {
    pub order_id: OrderId,
    pub order_number: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancelled {
    pub order_id: OrderId,
    pub previous: OrderStatus,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderEvent {
    OrderPlaced(OrderPlaced),
    OrderStatusChanged(OrderStatusChanged),
    OrderShipped(OrderShipped),
    OrderDelivered(OrderDelivered),
    OrderCancelled(OrderCancelled),
}

impl Event for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::OrderPlaced(_) => "sales.order.placed",
            OrderEvent::OrderStatusChanged(_) => "sales.order.status_changed",
            OrderEvent::OrderShipped(_) => "sales.order.shipped",
            OrderEvent::OrderDelivered(_) => "sales.order.delivered",
            OrderEvent::OrderCancelled(_) => "sales.order.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            OrderEvent::OrderPlaced(e) => e.occurred_at,
            OrderEvent::OrderStatusChanged(e) => e.occurred_at,
            OrderEvent::OrderShipped(e) => e.occurred_at,
            OrderEvent::OrderDelivered(e) => e.occurred_at,
            OrderEvent::OrderCancelled(e) => e.occurred_at,
        }
    }
}

impl AuditEvent for OrderEvent {
    fn audit(&self) -> Option<AuditRecord> {
        let record = match self {
            OrderEvent::OrderPlaced(e) => AuditRecord::new(
                ActivityKind::OrderCreated,
                format!("Order {} placed with {} item(s)", e.order_number, e.items.len()),
            )
            .order(e.order_id)
            .metadata(json!({
                "orderNumber": e.order_number,
                "productIds": e.items.iter().map(|i| i.product_id).collect::<Vec<_>>(),
            })),
            OrderEvent::OrderStatusChanged(e) => AuditRecord::new(
                ActivityKind::OrderStatus,
                format!("Order status changed from {} to {}", e.from, e.to),
            )
            .order(e.order_id)
            .metadata(json!({ "oldStatus": e.from, "newStatus": e.to })),
            OrderEvent::OrderShipped(e) => AuditRecord::new(
                ActivityKind::Shipping,
                format!("Order {} shipped", e.order_number),
            )
            .order(e.order_id)
            .metadata(json!({
                "oldStatus": e.previous,
                "newStatus": OrderStatus::Shipped,
                "trackingNumber": e.tracking_number,
                "carrier": e.carrier,
            })),
            OrderEvent::OrderDelivered(e) => AuditRecord::new(
                ActivityKind::Delivery,
                format!("Order {} delivered", e.order_number),
            )
            .order(e.order_id)
            .metadata(json!({
                "oldStatus": OrderStatus::Shipped,
                "newStatus": OrderStatus::Delivered,
            })),
            OrderEvent::OrderCancelled(e) => AuditRecord::new(
                ActivityKind::OrderCancelled,
                format!("Order cancelled: {}", e.reason),
            )
            .order(e.order_id)
            .metadata(json!({ "oldStatus": e.previous, "reason": e.reason })),
        };
        Some(record)
    }
}

impl Aggregate for Order {
    type Command = OrderCommand;
    type Event = OrderEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            OrderEvent::OrderPlaced(e) => {
                self.id = e.order_id;
                self.order_number = e.order_number.clone();
                self.customer_id = e.customer_id.clone();
                self.items = e.items.clone();
                self.status = OrderStatus::Pending;
                self.created_at = Some(e.occurred_at);
                self.created = true;
            }
            OrderEvent::OrderStatusChanged(e) => {
                self.status = e.to;
            }
            OrderEvent::OrderShipped(e) => {
                self.status = OrderStatus::Shipped;
                self.shipped_at = Some(e.occurred_at);
                if e.tracking_number.is_some() {
                    self.tracking_number = e.tracking_number.clone();
                }
                if e.carrier.is_some() {
                    self.carrier = e.carrier.clone();
                }
            }
            OrderEvent::OrderDelivered(e) => {
                self.status = OrderStatus::Delivered;
                self.delivered_at = Some(e.occurred_at);
            }
            OrderEvent::OrderCancelled(e) => {
                self.status = OrderStatus::Cancelled;
                self.cancelled_at = Some(e.occurred_at);
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            OrderCommand::PlaceOrder(cmd) => self.handle_place(cmd),
            OrderCommand::Confirm { occurred_at } => {
                self.handle_status_step(OrderStatus::Pending, OrderStatus::Confirmed, *occurred_at)
            }
            OrderCommand::StartProcessing { occurred_at } => self.handle_status_step(
                OrderStatus::Confirmed,
                OrderStatus::Processing,
                *occurred_at,
            ),
            OrderCommand::MarkShipped(cmd) => self.handle_mark_shipped(cmd),
            OrderCommand::MarkDelivered { occurred_at } => self.handle_mark_delivered(*occurred_at),
            OrderCommand::Cancel {
                reason,
                occurred_at,
            } => self.handle_cancel(reason, *occurred_at),
        }
    }
}

impl Order {
    fn ensure_created(&self) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found(format!("order {}", self.id)));
        }
        Ok(())
    }

    fn reject(&self, to: OrderStatus) -> DomainError {
        DomainError::invalid_transition(format!(
            "order {}: {} -> {}",
            self.order_number, self.status, to
        ))
    }

    fn handle_place(&self, cmd: &PlaceOrder) -> Result<Vec<OrderEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("order already exists"));
        }
        if cmd.order_number.trim().is_empty() {
            return Err(DomainError::validation("order number must not be empty"));
        }
        if cmd.items.is_empty() {
            return Err(DomainError::validation("order must contain at least one item"));
        }

        let mut items: Vec<OrderItem> = Vec::with_capacity(cmd.items.len());
        for item in &cmd.items {
            if item.quantity == 0 {
                return Err(DomainError::validation("quantity must be positive"));
            }
            if items.iter().any(|i| i.product_id == item.product_id) {
                return Err(DomainError::validation(format!(
                    "product {} appears twice in the order",
                    item.product_id
                )));
            }
            items.push(OrderItem {
                id: OrderItemId::new(),
                product_id: item.product_id,
                quantity: item.quantity,
                unit_price: item.unit_price,
            });
        }

        Ok(vec![OrderEvent::OrderPlaced(OrderPlaced {
            order_id: cmd.order_id,
            order_number: cmd.order_number.trim().to_string(),
            customer_id: cmd.customer_id.clone(),
            items,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_status_step(
        &self,
        from: OrderStatus,
        to: OrderStatus,
        occurred_at: DateTime<Utc>,
    ) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_created()?;

        if self.status == to {
            return Ok(vec![]);
        }
        if self.status != from {
            return Err(self.reject(to));
        }

        Ok(vec![OrderEvent::OrderStatusChanged(OrderStatusChanged {
            order_id: self.id,
            from,
            to,
            occurred_at,
        })])
    }

    fn handle_mark_shipped(&self, cmd: &MarkShipped) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_created()?;

        match self.status {
            OrderStatus::Shipped => Ok(vec![]),
            OrderStatus::Confirmed | OrderStatus::Processing => {
                Ok(vec![OrderEvent::OrderShipped(OrderShipped {
                    order_id: self.id,
                    order_number: self.order_number.clone(),
                    previous: self.status,
                    tracking_number: cmd.tracking_number.clone(),
                    carrier: cmd.carrier.clone(),
                    occurred_at: cmd.occurred_at,
                })])
            }
            _ => Err(self.reject(OrderStatus::Shipped)),
        }
    }

    fn handle_mark_delivered(
        &self,
        occurred_at: DateTime<Utc>,
    ) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_created()?;

        match self.status {
            OrderStatus::Delivered => Ok(vec![]),
            OrderStatus::Shipped => Ok(vec![OrderEvent::OrderDelivered(OrderDelivered {
                order_id: self.id,
                order_number: self.order_number.clone(),
                occurred_at,
            })]),
            _ => Err(self.reject(OrderStatus::Delivered)),
        }
    }

    fn handle_cancel(
        &self,
        reason: &str,
        occurred_at: DateTime<Utc>,
    ) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_created()?;

        match self.status {
            OrderStatus::Pending | OrderStatus::Confirmed | OrderStatus::Processing => {
                Ok(vec![OrderEvent::OrderCancelled(OrderCancelled {
                    order_id: self.id,
                    previous: self.status,
                    reason: reason.to_string(),
                    occurred_at,
                })])
            }
            _ => Err(self.reject(OrderStatus::Cancelled)),
        }
    }
}
