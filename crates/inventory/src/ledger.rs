use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use depotflow_core::{DomainError, Entity, LocationId, MovementId, ProductId, UserId};
use depotflow_events::{
    ActivityKind, AuditEvent, AuditRecord, Event, TimelineEntry, TimelineKind,
};

use crate::Location;

/// Who performed a move. The name is denormalized so history stays readable
/// after user renames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovedBy {
    pub user_id: Option<UserId>,
    pub name: String,
}

/// Append-only ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryMovement {
    pub id: MovementId,
    pub product_id: ProductId,
    /// `None` means the product had no prior location.
    pub from_location_id: Option<LocationId>,
    pub to_location_id: LocationId,
    pub moved_by: MovedBy,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Entity for InventoryMovement {
    type Id = MovementId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl From<&InventoryMovement> for TimelineEntry {
    fn from(m: &InventoryMovement) -> Self {
        TimelineEntry::new(TimelineKind::Movement, m.id, m.created_at, "Inventory moved")
            .with_detail(json!({
                "fromLocationId": m.from_location_id,
                "toLocationId": m.to_location_id,
                "movedBy": m.moved_by.name,
                "notes": m.notes,
            }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveRequest {
    pub product_id: ProductId,
    pub to_location_id: LocationId,
    pub moved_by: MovedBy,
    pub notes: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Validate a move and build its ledger entry.
///
/// `current` is the product's cached location, `target` the resolved
/// destination slot (`None` if the id does not exist).
pub fn plan_move(
    current: Option<LocationId>,
    target: Option<&Location>,
    request: MoveRequest,
) -> Result<InventoryMovement, DomainError> {
    if current == Some(request.to_location_id) {
        return Err(DomainError::SameLocation);
    }
    let target = target
        .filter(|loc| loc.id == request.to_location_id)
        .ok_or_else(|| DomainError::location_not_found(request.to_location_id.to_string()))?;

    Ok(InventoryMovement {
        id: MovementId::new(),
        product_id: request.product_id,
        from_location_id: current,
        to_location_id: target.id,
        moved_by: request.moved_by,
        notes: request.notes.filter(|n| !n.trim().is_empty()),
        created_at: request.occurred_at,
    })
}

/// Only the most recent movement of a product may be undone.
pub fn check_undo(
    movement: &InventoryMovement,
    latest: Option<&InventoryMovement>,
) -> Result<(), DomainError> {
    match latest {
        Some(latest) if latest.id == movement.id => Ok(()),
        Some(latest) => Err(DomainError::not_latest(format!(
            "movement {} is not the latest for product {} (latest is {})",
            movement.id, movement.product_id, latest.id
        ))),
        None => Err(DomainError::not_found(format!("movement {}", movement.id))),
    }
}

/// Recompute the current location from the ledger (oldest first).
pub fn replay_location(movements: &[InventoryMovement]) -> Option<LocationId> {
    movements.last().map(|m| m.to_location_id)
}

/// Check the causal chain: each entry starts where the previous one ended.
pub fn verify_chain(movements: &[InventoryMovement]) -> Result<(), DomainError> {
    let mut expected_from: Option<LocationId> = None;
    for (idx, m) in movements.iter().enumerate() {
        if idx > 0 && m.from_location_id != expected_from {
            return Err(DomainError::conflict(format!(
                "movement {} starts at {:?}, previous entry ended at {:?}",
                m.id, m.from_location_id, expected_from
            )));
        }
        expected_from = Some(m.to_location_id);
    }
    Ok(())
}

/// Event: a product was moved. Location codes are captured for the audit
/// trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductMoved {
    pub movement: InventoryMovement,
    pub from_code: Option<String>,
    pub to_code: String,
}

/// Event: the latest movement was deleted and the location restored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementReverted {
    pub movement: InventoryMovement,
    pub from_code: Option<String>,
    pub to_code: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationRegistered {
    pub location: Location,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    ProductMoved(ProductMoved),
    MovementReverted(MovementReverted),
    LocationRegistered(LocationRegistered),
}

impl Event for LedgerEvent {
    fn event_type(&self) -> &'static str {
        match self {
            LedgerEvent::ProductMoved(_) => "inventory.movement.recorded",
            LedgerEvent::MovementReverted(_) => "inventory.movement.reverted",
            LedgerEvent::LocationRegistered(_) => "inventory.location.registered",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            LedgerEvent::ProductMoved(e) => e.movement.created_at,
            LedgerEvent::MovementReverted(e) => e.occurred_at,
            LedgerEvent::LocationRegistered(e) => e.occurred_at,
        }
    }
}

impl AuditEvent for LedgerEvent {
    fn audit(&self) -> Option<AuditRecord> {
        let record = match self {
            LedgerEvent::ProductMoved(e) => {
                let from = e.from_code.as_deref().unwrap_or("none");
                AuditRecord::new(
                    ActivityKind::InventoryMovement,
                    format!("Moved from {from} to {}", e.to_code),
                )
                .product(e.movement.product_id)
                .metadata(json!({
                    "movementId": e.movement.id,
                    "fromLocationId": e.movement.from_location_id,
                    "toLocationId": e.movement.to_location_id,
                    "fromLocation": e.from_code,
                    "toLocation": e.to_code,
                    "notes": e.movement.notes,
                }))
            }
            LedgerEvent::MovementReverted(e) => AuditRecord::new(
                ActivityKind::Delete,
                format!("Undid movement {}", e.movement.id),
            )
            .product(e.movement.product_id)
            .metadata(json!({
                "deletedMovement": {
                    "id": e.movement.id,
                    "fromLocationId": e.movement.from_location_id,
                    "toLocationId": e.movement.to_location_id,
                    "from": e.from_code,
                    "to": e.to_code,
                    "movedBy": e.movement.moved_by.name,
                    "createdAt": e.movement.created_at,
                }
            })),
            LedgerEvent::LocationRegistered(e) => AuditRecord::new(
                ActivityKind::LocationRegistered,
                format!("Registered location {}", e.location.code),
            )
            .metadata(json!({
                "locationId": e.location.id,
                "code": e.location.code,
                "zone": e.location.zone,
                "capacity": e.location.capacity,
            })),
        };
        Some(record)
    }
}
