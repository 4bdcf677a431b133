//! Marketplace listing: a mirror of shipping progress per (product, platform).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use depotflow_core::{Aggregate, AggregateRoot, DomainError, ListingId, ProductId};
use depotflow_events::{ActivityKind, AuditEvent, AuditRecord, Event};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShippingStatus {
    NotShipped,
    Shipped,
    Delivered,
}

impl ShippingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShippingStatus::NotShipped => "not_shipped",
            ShippingStatus::Shipped => "shipped",
            ShippingStatus::Delivered => "delivered",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            ShippingStatus::NotShipped => 0,
            ShippingStatus::Shipped => 1,
            ShippingStatus::Delivered => 2,
        }
    }
}

impl core::fmt::Display for ShippingStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate root: Listing.
///
/// Never a source of truth: shipping fields are written only by the
/// synchronizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    id: ListingId,
    product_id: ProductId,
    platform: String,
    price: Option<u64>,
    shipping_status: ShippingStatus,
    shipped_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
    created_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl Listing {
    pub fn empty(id: ListingId) -> Self {
        Self {
            id,
            product_id: ProductId::from_uuid(Uuid::nil()),
            platform: String::new(),
            price: None,
            shipping_status: ShippingStatus::NotShipped,
            shipped_at: None,
            delivered_at: None,
            created_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> ListingId {
        self.id
    }

    pub fn product_id(&self) -> ProductId {
        self.product_id
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn price(&self) -> Option<u64> {
        self.price
    }

    pub fn shipping_status(&self) -> ShippingStatus {
        self.shipping_status
    }

    pub fn shipped_at(&self) -> Option<DateTime<Utc>> {
        self.shipped_at
    }

    pub fn delivered_at(&self) -> Option<DateTime<Utc>> {
        self.delivered_at
    }
}

impl AggregateRoot for Listing {
    type Id = ListingId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateListing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateListing {
    pub listing_id: ListingId,
    pub product_id: ProductId,
    pub platform: String,
    pub price: Option<u64>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListingCommand {
    CreateListing(CreateListing),
    MarkShipped { occurred_at: DateTime<Utc> },
    MarkDelivered { occurred_at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingCreated {
    pub listing_id: ListingId,
    pub product_id: ProductId,
    pub platform: String,
    pub price: Option<u64>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingStatusChanged {
    pub listing_id: ListingId,
    pub from: ShippingStatus,
    pub to: ShippingStatus,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListingEvent {
    ListingCreated(ListingCreated),
    ShippingStatusChanged(ShippingStatusChanged),
}

impl Event for ListingEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ListingEvent::ListingCreated(_) => "sales.listing.created",
            ListingEvent::ShippingStatusChanged(_) => "sales.listing.shipping_status_changed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ListingEvent::ListingCreated(e) => e.occurred_at,
            ListingEvent::ShippingStatusChanged(e) => e.occurred_at,
        }
    }
}

impl AuditEvent for ListingEvent {
    fn audit(&self) -> Option<AuditRecord> {
        match self {
            ListingEvent::ListingCreated(e) => Some(
                AuditRecord::new(
                    ActivityKind::ListingCreated,
                    format!("Listed on {}", e.platform),
                )
                .product(e.product_id)
                .metadata(json!({
                    "listingId": e.listing_id,
                    "platform": e.platform,
                    "price": e.price,
                })),
            ),
            // Mirrors are recorded by the order's shipping/delivery activity.
            ListingEvent::ShippingStatusChanged(_) => None,
        }
    }
}

impl Aggregate for Listing {
    type Command = ListingCommand;
    type Event = ListingEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ListingEvent::ListingCreated(e) => {
                self.id = e.listing_id;
                self.product_id = e.product_id;
                self.platform = e.platform.clone();
                self.price = e.price;
                self.shipping_status = ShippingStatus::NotShipped;
                self.created_at = Some(e.occurred_at);
                self.created = true;
            }
            ListingEvent::ShippingStatusChanged(e) => {
                self.shipping_status = e.to;
                match e.to {
                    ShippingStatus::Shipped => self.shipped_at = Some(e.occurred_at),
                    ShippingStatus::Delivered => {
                        // Delivery straight from not_shipped also stamps shipped_at.
                        if self.shipped_at.is_none() {
                            self.shipped_at = Some(e.occurred_at);
                        }
                        self.delivered_at = Some(e.occurred_at);
                    }
                    ShippingStatus::NotShipped => {}
                }
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            ListingCommand::CreateListing(cmd) => self.handle_create(cmd),
            ListingCommand::MarkShipped { occurred_at } => {
                self.handle_advance(ShippingStatus::Shipped, *occurred_at)
            }
            ListingCommand::MarkDelivered { occurred_at } => {
                self.handle_advance(ShippingStatus::Delivered, *occurred_at)
            }
        }
    }
}

impl Listing {
    fn handle_create(&self, cmd: &CreateListing) -> Result<Vec<ListingEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("listing already exists"));
        }
        let platform = cmd.platform.trim();
        if platform.is_empty() {
            return Err(DomainError::validation("platform must not be empty"));
        }

        Ok(vec![ListingEvent::ListingCreated(ListingCreated {
            listing_id: cmd.listing_id,
            product_id: cmd.product_id,
            platform: platform.to_string(),
            price: cmd.price,
            occurred_at: cmd.occurred_at,
        })])
    }

    /// Forward-only; repeating the current state is a no-op.
    fn handle_advance(
        &self,
        to: ShippingStatus,
        occurred_at: DateTime<Utc>,
    ) -> Result<Vec<ListingEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found(format!("listing {}", self.id)));
        }
        if self.shipping_status == to {
            return Ok(vec![]);
        }
        if to.rank() < self.shipping_status.rank() {
            return Err(DomainError::invalid_transition(format!(
                "listing {}: {} -> {}",
                self.id, self.shipping_status, to
            )));
        }

        Ok(vec![ListingEvent::ShippingStatusChanged(ShippingStatusChanged {
            listing_id: self.id,
            from: self.shipping_status,
            to,
            occurred_at,
        })])
    }
}
