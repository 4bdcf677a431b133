use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use depotflow_core::{Aggregate, AggregateRoot, DomainError, LocationId, ProductId, UserId};
use depotflow_events::{ActivityKind, AuditEvent, AuditRecord, Event};

use crate::inspection::{fallback_step, STEP_PHOTOGRAPHY, STEP_SHELVING};
use crate::{Condition, InspectionProgressView, PhotoSlot, ProductMetadata, ProductStatus};

/// Terminal shipment events mirrored onto the product.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShipmentMilestone {
    Shipped,
    Delivered,
}

impl ShipmentMilestone {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShipmentMilestone::Shipped => "shipped",
            ShipmentMilestone::Delivered => "delivered",
        }
    }
}

/// `true` when `sku` ends with `-{suffix}` (e.g. `006` matches `CAM-X-006`).
pub fn matches_sku_suffix(sku: &str, suffix: &str) -> bool {
    let suffix = suffix.trim();
    !suffix.is_empty() && sku.ends_with(&format!("-{suffix}"))
}

/// Aggregate root: Product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    id: ProductId,
    sku: String,
    category: String,
    name: Option<String>,
    /// Declared value in minor currency units.
    declared_value: u64,
    status: ProductStatus,
    current_location_id: Option<LocationId>,
    metadata: ProductMetadata,
    condition: Option<Condition>,
    inspected_at: Option<DateTime<Utc>>,
    inspected_by: Option<UserId>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl Product {
    /// Create an empty, not-yet-created aggregate instance.
    pub fn empty(id: ProductId) -> Self {
        Self {
            id,
            sku: String::new(),
            category: String::new(),
            name: None,
            declared_value: 0,
            status: ProductStatus::Inbound,
            current_location_id: None,
            metadata: ProductMetadata::default(),
            condition: None,
            inspected_at: None,
            inspected_by: None,
            created_at: None,
            updated_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> ProductId {
        self.id
    }

    pub fn sku(&self) -> &str {
        &self.sku
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn declared_value(&self) -> u64 {
        self.declared_value
    }

    pub fn status(&self) -> ProductStatus {
        self.status
    }

    pub fn current_location_id(&self) -> Option<LocationId> {
        self.current_location_id
    }

    pub fn metadata(&self) -> &ProductMetadata {
        &self.metadata
    }

    pub fn condition(&self) -> Option<Condition> {
        self.condition
    }

    pub fn inspected_at(&self) -> Option<DateTime<Utc>> {
        self.inspected_at
    }

    pub fn inspected_by(&self) -> Option<UserId> {
        self.inspected_by
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn inspection_progress(&self) -> InspectionProgressView {
        let (current_step, step_recorded) = match self.metadata.current_step {
            Some(step) => (step, true),
            None => (fallback_step(self.status), false),
        };
        InspectionProgressView {
            product_id: self.id,
            sku: self.sku.clone(),
            status: self.status,
            current_step,
            step_recorded,
            checklist: self.metadata.checklist.clone(),
            photo_slots: self.metadata.photo_slots.clone(),
            inspection_completed: self.metadata.inspection_completed,
            photography_completed: self.metadata.photography_completed,
            skip_photography: self.metadata.skip_photography,
            condition: self.condition,
            inspected_at: self.inspected_at,
            inspected_by: self.inspected_by,
        }
    }
}

impl AggregateRoot for Product {
    type Id = ProductId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: RegisterProduct (intake).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterProduct {
    pub product_id: ProductId,
    pub sku: String,
    pub category: String,
    pub name: Option<String>,
    pub declared_value: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: TransitionStatus along the forward graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionStatus {
    pub target: ProductStatus,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SaveInspectionProgress.
///
/// `None` fields keep their stored value; a provided checklist is merged
/// key-by-key into the stored one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveInspectionProgress {
    pub step: u8,
    pub checklist: Option<BTreeMap<String, JsonValue>>,
    pub photo_slots: Option<Vec<PhotoSlot>>,
    pub skip_photography: Option<bool>,
    pub condition: Option<Condition>,
    pub notes: Option<String>,
    pub inspector: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AssignLocation. Only the location ledger issues this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignLocation {
    pub location_id: Option<LocationId>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MirrorShipment. Only the synchronizer issues this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorShipment {
    pub milestone: ShipmentMilestone,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ForceReturn (approved return).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForceReturn {
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RestockProduct after a return.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestockProduct {
    pub target: ProductStatus,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReleaseReservation (order cancelled before shipping).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseReservation {
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProductCommand {
    RegisterProduct(RegisterProduct),
    TransitionStatus(TransitionStatus),
    SaveInspectionProgress(SaveInspectionProgress),
    AssignLocation(AssignLocation),
    MirrorShipment(MirrorShipment),
    ForceReturn(ForceReturn),
    RestockProduct(RestockProduct),
    ReleaseReservation(ReleaseReservation),
}

/// Event: ProductRegistered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRegistered {
    pub product_id: ProductId,
    pub sku: String,
    pub category: String,
    pub name: Option<String>,
    pub declared_value: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StatusChanged. Every status write goes through this event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChanged {
    pub product_id: ProductId,
    pub sku: String,
    pub from: ProductStatus,
    pub to: ProductStatus,
    pub reason: String,
    /// Clears inspection metadata so the sub-flow can run again.
    pub reset_inspection: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Event: InspectionProgressSaved. Carries the merged result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectionProgressSaved {
    pub product_id: ProductId,
    pub sku: String,
    pub previous_step: Option<u8>,
    pub step: u8,
    pub checklist: BTreeMap<String, JsonValue>,
    pub photo_slots: Vec<PhotoSlot>,
    pub skip_photography: bool,
    pub condition: Option<Condition>,
    pub notes: Option<String>,
    pub inspector: Option<UserId>,
    pub completed: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LocationAssigned (current-location cache refresh).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationAssigned {
    pub product_id: ProductId,
    pub from: Option<LocationId>,
    pub to: Option<LocationId>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProductEvent {
    ProductRegistered(ProductRegistered),
    StatusChanged(StatusChanged),
    InspectionProgressSaved(InspectionProgressSaved),
    LocationAssigned(LocationAssigned),
}

impl Event for ProductEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ProductEvent::ProductRegistered(_) => "products.product.registered",
            ProductEvent::StatusChanged(_) => "products.product.status_changed",
            ProductEvent::InspectionProgressSaved(_) => "products.product.inspection_saved",
            ProductEvent::LocationAssigned(_) => "products.product.location_assigned",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ProductEvent::ProductRegistered(e) => e.occurred_at,
            ProductEvent::StatusChanged(e) => e.occurred_at,
            ProductEvent::InspectionProgressSaved(e) => e.occurred_at,
            ProductEvent::LocationAssigned(e) => e.occurred_at,
        }
    }
}

impl AuditEvent for ProductEvent {
    fn audit(&self) -> Option<AuditRecord> {
        match self {
            ProductEvent::ProductRegistered(e) => Some(
                AuditRecord::new(
                    ActivityKind::ProductRegistered,
                    format!("Registered product {}", e.sku),
                )
                .product(e.product_id)
                .metadata(json!({
                    "sku": e.sku,
                    "category": e.category,
                    "declaredValue": e.declared_value,
                })),
            ),
            ProductEvent::StatusChanged(e) => Some(
                AuditRecord::new(
                    ActivityKind::StatusChange,
                    format!("Status of {} changed from {} to {}", e.sku, e.from, e.to),
                )
                .product(e.product_id)
                .metadata(json!({
                    "oldStatus": e.from,
                    "newStatus": e.to,
                    "reason": e.reason,
                })),
            ),
            ProductEvent::InspectionProgressSaved(e) if e.completed => Some(
                AuditRecord::new(
                    ActivityKind::Inspection,
                    format!("Inspection completed for {}", e.sku),
                )
                .product(e.product_id)
                .metadata(json!({
                    "step": e.step,
                    "condition": e.condition,
                    "skipPhotography": e.skip_photography,
                    "photoCount": e.photo_slots.len(),
                })),
            ),
            ProductEvent::InspectionProgressSaved(e) => Some(
                AuditRecord::new(
                    ActivityKind::InspectionProgress,
                    format!("Inspection step {} saved for {}", e.step, e.sku),
                )
                .product(e.product_id)
                .metadata(json!({
                    "previousStep": e.previous_step,
                    "step": e.step,
                })),
            ),
            ProductEvent::LocationAssigned(_) => None,
        }
    }
}

impl Aggregate for Product {
    type Command = ProductCommand;
    type Event = ProductEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ProductEvent::ProductRegistered(e) => {
                self.id = e.product_id;
                self.sku = e.sku.clone();
                self.category = e.category.clone();
                self.name = e.name.clone();
                self.declared_value = e.declared_value;
                self.status = ProductStatus::Inbound;
                self.current_location_id = None;
                self.metadata = ProductMetadata::default();
                self.created_at = Some(e.occurred_at);
                self.created = true;
            }
            ProductEvent::StatusChanged(e) => {
                self.status = e.to;
                if e.reset_inspection {
                    let extra = core::mem::take(&mut self.metadata.extra);
                    self.metadata = ProductMetadata {
                        extra,
                        ..ProductMetadata::default()
                    };
                }
            }
            ProductEvent::InspectionProgressSaved(e) => {
                let has_photos = e.photo_slots.iter().any(|p| !p.url.trim().is_empty());
                self.metadata.current_step = Some(e.step);
                self.metadata.checklist = e.checklist.clone();
                self.metadata.photo_slots = e.photo_slots.clone();
                self.metadata.skip_photography = e.skip_photography;
                self.metadata.photography_completed =
                    e.step > STEP_PHOTOGRAPHY && has_photos && !e.skip_photography;
                self.metadata.notes = e.notes.clone();
                self.condition = e.condition;
                if e.completed {
                    self.metadata.inspection_completed = true;
                    self.inspected_at = Some(e.occurred_at);
                    self.inspected_by = e.inspector;
                }
            }
            ProductEvent::LocationAssigned(e) => {
                self.current_location_id = e.to;
            }
        }

        self.updated_at = Some(Event::occurred_at(event));
        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            ProductCommand::RegisterProduct(cmd) => self.handle_register(cmd),
            ProductCommand::TransitionStatus(cmd) => self.handle_transition(cmd),
            ProductCommand::SaveInspectionProgress(cmd) => self.handle_inspection(cmd),
            ProductCommand::AssignLocation(cmd) => self.handle_assign_location(cmd),
            ProductCommand::MirrorShipment(cmd) => self.handle_mirror_shipment(cmd),
            ProductCommand::ForceReturn(cmd) => self.handle_force_return(cmd),
            ProductCommand::RestockProduct(cmd) => self.handle_restock(cmd),
            ProductCommand::ReleaseReservation(cmd) => self.handle_release(cmd),
        }
    }
}

impl Product {
    fn ensure_created(&self) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found(format!("product {}", self.id)));
        }
        Ok(())
    }

    fn status_changed(
        &self,
        to: ProductStatus,
        reason: impl Into<String>,
        reset_inspection: bool,
        occurred_at: DateTime<Utc>,
    ) -> ProductEvent {
        ProductEvent::StatusChanged(StatusChanged {
            product_id: self.id,
            sku: self.sku.clone(),
            from: self.status,
            to,
            reason: reason.into(),
            reset_inspection,
            occurred_at,
        })
    }

    fn reject(&self, to: impl core::fmt::Display) -> DomainError {
        DomainError::invalid_transition(format!("{} -> {} (product {})", self.status, to, self.sku))
    }

    fn handle_register(&self, cmd: &RegisterProduct) -> Result<Vec<ProductEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("product already exists"));
        }

        let sku = cmd.sku.trim();
        if sku.is_empty() {
            return Err(DomainError::validation("sku must not be empty"));
        }
        if cmd.category.trim().is_empty() {
            return Err(DomainError::validation("category must not be empty"));
        }

        Ok(vec![ProductEvent::ProductRegistered(ProductRegistered {
            product_id: cmd.product_id,
            sku: sku.to_string(),
            category: cmd.category.trim().to_string(),
            name: cmd.name.clone(),
            declared_value: cmd.declared_value,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_transition(&self, cmd: &TransitionStatus) -> Result<Vec<ProductEvent>, DomainError> {
        self.ensure_created()?;

        if cmd.target == ProductStatus::Returned {
            return Err(DomainError::invalid_transition(
                "returned is only reachable through an approved return",
            ));
        }
        if !self.status.can_transition_to(cmd.target) {
            return Err(self.reject(cmd.target));
        }
        if self.status == ProductStatus::Inspection && !self.metadata.inspection_completed {
            return Err(DomainError::invalid_transition(
                "inspection must be completed before the product can be stored",
            ));
        }

        let reason = cmd.reason.clone().unwrap_or_else(|| "manual transition".to_string());
        Ok(vec![self.status_changed(cmd.target, reason, false, cmd.occurred_at)])
    }

    fn handle_inspection(
        &self,
        cmd: &SaveInspectionProgress,
    ) -> Result<Vec<ProductEvent>, DomainError> {
        self.ensure_created()?;

        if self.status != ProductStatus::Inspection {
            return Err(DomainError::invalid_transition(format!(
                "inspection progress can only be recorded in inspection (current: {})",
                self.status
            )));
        }
        if self.metadata.inspection_completed {
            return Err(DomainError::invalid_transition("inspection already completed"));
        }
        if !(1..=STEP_SHELVING).contains(&cmd.step) {
            return Err(DomainError::validation(format!(
                "inspection step must be between 1 and {STEP_SHELVING}"
            )));
        }

        let previous_step = self.metadata.current_step;
        if let Some(prev) = previous_step {
            if cmd.step < prev {
                return Err(DomainError::invalid_transition(format!(
                    "inspection step cannot go back from {prev} to {}",
                    cmd.step
                )));
            }
        }

        let photo_slots = cmd
            .photo_slots
            .clone()
            .unwrap_or_else(|| self.metadata.photo_slots.clone());
        let skip_photography = cmd.skip_photography.unwrap_or(self.metadata.skip_photography);
        let has_photos = photo_slots.iter().any(|p| !p.url.trim().is_empty());
        if cmd.step > STEP_PHOTOGRAPHY && !has_photos && !skip_photography {
            return Err(DomainError::invalid_transition(
                "photography requires at least one photo or skipPhotography",
            ));
        }

        let mut checklist = self.metadata.checklist.clone();
        if let Some(answers) = &cmd.checklist {
            checklist.extend(answers.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        Ok(vec![ProductEvent::InspectionProgressSaved(InspectionProgressSaved {
            product_id: self.id,
            sku: self.sku.clone(),
            previous_step,
            step: cmd.step,
            checklist,
            photo_slots,
            skip_photography,
            condition: cmd.condition.or(self.condition),
            notes: cmd.notes.clone().or_else(|| self.metadata.notes.clone()),
            inspector: cmd.inspector,
            completed: cmd.step == STEP_SHELVING,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_assign_location(
        &self,
        cmd: &AssignLocation,
    ) -> Result<Vec<ProductEvent>, DomainError> {
        self.ensure_created()?;

        if self.current_location_id == cmd.location_id {
            return Ok(vec![]);
        }

        Ok(vec![ProductEvent::LocationAssigned(LocationAssigned {
            product_id: self.id,
            from: self.current_location_id,
            to: cmd.location_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_mirror_shipment(
        &self,
        cmd: &MirrorShipment,
    ) -> Result<Vec<ProductEvent>, DomainError> {
        self.ensure_created()?;

        let target = match (cmd.milestone, self.status) {
            // Returned while in transit; the return owns the product now.
            (_, ProductStatus::Returned)
            | (ShipmentMilestone::Shipped, ProductStatus::Shipping)
            | (ShipmentMilestone::Delivered, ProductStatus::Sold | ProductStatus::Delivered) => {
                return Ok(vec![]);
            }
            (
                ShipmentMilestone::Shipped,
                ProductStatus::Ordered | ProductStatus::Workstation,
            ) => ProductStatus::Shipping,
            (
                ShipmentMilestone::Delivered,
                ProductStatus::Ordered | ProductStatus::Workstation | ProductStatus::Shipping,
            ) => ProductStatus::Sold,
            (ShipmentMilestone::Shipped, _) => return Err(self.reject(ProductStatus::Shipping)),
            (ShipmentMilestone::Delivered, _) => return Err(self.reject(ProductStatus::Sold)),
        };

        Ok(vec![self.status_changed(
            target,
            format!("shipment {}", cmd.milestone.as_str()),
            false,
            cmd.occurred_at,
        )])
    }

    fn handle_force_return(&self, cmd: &ForceReturn) -> Result<Vec<ProductEvent>, DomainError> {
        self.ensure_created()?;

        if self.status == ProductStatus::Returned {
            return Ok(vec![]);
        }

        Ok(vec![self.status_changed(
            ProductStatus::Returned,
            cmd.reason.clone(),
            false,
            cmd.occurred_at,
        )])
    }

    fn handle_restock(&self, cmd: &RestockProduct) -> Result<Vec<ProductEvent>, DomainError> {
        self.ensure_created()?;

        if self.status != ProductStatus::Returned {
            return Err(DomainError::invalid_transition(format!(
                "only returned products can be restocked (current: {})",
                self.status
            )));
        }
        if !cmd.target.is_restock_target() {
            return Err(self.reject(cmd.target));
        }

        Ok(vec![self.status_changed(
            cmd.target,
            "restocked after return",
            cmd.target == ProductStatus::Inspection,
            cmd.occurred_at,
        )])
    }

    fn handle_release(&self, cmd: &ReleaseReservation) -> Result<Vec<ProductEvent>, DomainError> {
        self.ensure_created()?;

        match self.status {
            ProductStatus::Listing => Ok(vec![]),
            ProductStatus::Ordered | ProductStatus::Workstation => Ok(vec![self.status_changed(
                ProductStatus::Listing,
                cmd.reason.clone(),
                false,
                cmd.occurred_at,
            )]),
            _ => Err(self.reject(ProductStatus::Listing)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depotflow_events::execute;

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn registered(sku: &str) -> Product {
        let id = ProductId::new();
        let mut product = Product::empty(id);
        execute(
            &mut product,
            &ProductCommand::RegisterProduct(RegisterProduct {
                product_id: id,
                sku: sku.to_string(),
                category: "camera".to_string(),
                name: None,
                declared_value: 120_000,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        product
    }

    fn transition(product: &mut Product, target: ProductStatus) -> Result<Vec<ProductEvent>, DomainError> {
        execute(
            product,
            &ProductCommand::TransitionStatus(TransitionStatus {
                target,
                reason: None,
                occurred_at: test_time(),
            }),
        )
    }

    fn inspect(product: &mut Product, step: u8) -> Result<Vec<ProductEvent>, DomainError> {
        execute(product, &ProductCommand::SaveInspectionProgress(step_cmd(step)))
    }

    fn step_cmd(step: u8) -> SaveInspectionProgress {
        SaveInspectionProgress {
            step,
            checklist: None,
            photo_slots: None,
            skip_photography: None,
            condition: None,
            notes: None,
            inspector: None,
            occurred_at: test_time(),
        }
    }

    fn photo() -> Vec<PhotoSlot> {
        vec![PhotoSlot {
            slot: "front".to_string(),
            url: "https://img.example/front.jpg".to_string(),
        }]
    }

    /// Walks a fresh product through inspection into storage.
    fn stored(sku: &str) -> Product {
        let mut product = registered(sku);
        transition(&mut product, ProductStatus::Inspection).unwrap();
        let mut cmd = step_cmd(2);
        cmd.photo_slots = Some(photo());
        execute(&mut product, &ProductCommand::SaveInspectionProgress(cmd)).unwrap();
        inspect(&mut product, 4).unwrap();
        transition(&mut product, ProductStatus::Storage).unwrap();
        product
    }

    fn at(status: ProductStatus) -> Product {
        let mut product = stored("CAM-X-001");
        let path = [
            ProductStatus::Listing,
            ProductStatus::Ordered,
            ProductStatus::Workstation,
            ProductStatus::Shipping,
            ProductStatus::Sold,
        ];
        for next in path {
            if product.status() == status {
                break;
            }
            transition(&mut product, next).unwrap();
        }
        assert_eq!(product.status(), status);
        product
    }

    #[test]
    fn register_starts_inbound_without_location() {
        let product = registered("CAM-X-006");
        assert_eq!(product.status(), ProductStatus::Inbound);
        assert_eq!(product.current_location_id(), None);
        assert_eq!(product.version(), 1);
    }

    #[test]
    fn register_twice_is_a_conflict() {
        let product = registered("CAM-X-006");
        let err = product
            .handle(&ProductCommand::RegisterProduct(RegisterProduct {
                product_id: product.id_typed(),
                sku: "CAM-X-006".to_string(),
                category: "camera".to_string(),
                name: None,
                declared_value: 0,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn unknown_product_is_not_found() {
        let product = Product::empty(ProductId::new());
        let err = product
            .handle(&ProductCommand::TransitionStatus(TransitionStatus {
                target: ProductStatus::Inspection,
                reason: None,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::NotFound(_)));
    }

    #[test]
    fn sold_to_inbound_is_invalid() {
        let mut product = at(ProductStatus::Sold);
        let version = product.version();
        let err = transition(&mut product, ProductStatus::Inbound).unwrap_err();
        match err {
            DomainError::InvalidTransition(msg) if msg.contains("sold -> inbound") => {}
            other => panic!("Expected InvalidTransition, got {other:?}"),
        }
        assert_eq!(product.version(), version);
    }

    #[test]
    fn status_change_audit_carries_old_and_new() {
        let mut product = registered("CAM-X-002");
        let events = transition(&mut product, ProductStatus::Inspection).unwrap();
        assert_eq!(events.len(), 1);

        let record = events[0].audit().unwrap();
        assert_eq!(record.kind, ActivityKind::StatusChange);
        assert_eq!(record.metadata["oldStatus"], "inbound");
        assert_eq!(record.metadata["newStatus"], "inspection");
        assert_eq!(record.metadata["reason"], "manual transition");
    }

    #[test]
    fn storage_requires_completed_inspection() {
        let mut product = registered("CAM-X-003");
        transition(&mut product, ProductStatus::Inspection).unwrap();
        let err = transition(&mut product, ProductStatus::Storage).unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));
    }

    #[test]
    fn inspection_steps_never_go_back() {
        let mut product = registered("CAM-X-004");
        transition(&mut product, ProductStatus::Inspection).unwrap();
        let mut cmd = step_cmd(3);
        cmd.skip_photography = Some(true);
        execute(&mut product, &ProductCommand::SaveInspectionProgress(cmd)).unwrap();

        let before = product.clone();
        let err = inspect(&mut product, 2).unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(msg) if msg.contains("cannot go back")));
        assert_eq!(product, before);

        // Re-saving the same step is allowed.
        inspect(&mut product, 3).unwrap();
        assert_eq!(product.metadata().current_step, Some(3));
    }

    #[test]
    fn leaving_photography_requires_photo_or_skip() {
        let mut product = registered("CAM-X-005");
        transition(&mut product, ProductStatus::Inspection).unwrap();
        inspect(&mut product, 2).unwrap();

        let err = inspect(&mut product, 3).unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(msg) if msg.contains("photo")));
        assert_eq!(product.metadata().current_step, Some(2));

        let mut cmd = step_cmd(3);
        cmd.photo_slots = Some(photo());
        execute(&mut product, &ProductCommand::SaveInspectionProgress(cmd)).unwrap();
        assert!(product.metadata().photography_completed);
    }

    #[test]
    fn step_four_completes_and_freezes_inspection() {
        let mut product = registered("CAM-X-007");
        transition(&mut product, ProductStatus::Inspection).unwrap();
        let inspector = UserId::new();
        let mut cmd = step_cmd(4);
        cmd.skip_photography = Some(true);
        cmd.condition = Some(Condition::LikeNew);
        cmd.inspector = Some(inspector);
        cmd.checklist = Some(BTreeMap::from([("lens".to_string(), json!("clean"))]));
        let events = execute(&mut product, &ProductCommand::SaveInspectionProgress(cmd)).unwrap();

        assert!(product.metadata().inspection_completed);
        assert!(product.inspected_at().is_some());
        assert_eq!(product.inspected_by(), Some(inspector));
        assert_eq!(product.condition(), Some(Condition::LikeNew));
        assert_eq!(events[0].audit().unwrap().kind, ActivityKind::Inspection);

        let err = inspect(&mut product, 4).unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(msg) if msg.contains("already completed")));
    }

    #[test]
    fn checklist_answers_merge() {
        let mut product = registered("CAM-X-008");
        transition(&mut product, ProductStatus::Inspection).unwrap();
        let mut first = step_cmd(1);
        first.checklist = Some(BTreeMap::from([("body".to_string(), json!("ok"))]));
        execute(&mut product, &ProductCommand::SaveInspectionProgress(first)).unwrap();
        let mut second = step_cmd(1);
        second.checklist = Some(BTreeMap::from([("lens".to_string(), json!("scratch"))]));
        execute(&mut product, &ProductCommand::SaveInspectionProgress(second)).unwrap();

        assert_eq!(product.metadata().checklist.len(), 2);
    }

    #[test]
    fn inspection_outside_phase_is_rejected() {
        let mut product = registered("CAM-X-009");
        let err = inspect(&mut product, 1).unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));
    }

    #[test]
    fn progress_view_falls_back_to_status() {
        let product = stored("CAM-X-010");
        let view = product.inspection_progress();
        assert_eq!(view.current_step, 4);
        assert!(view.step_recorded);

        let fresh = registered("CAM-X-011");
        let view = fresh.inspection_progress();
        assert_eq!(view.current_step, 1);
        assert!(!view.step_recorded);
    }

    #[test]
    fn mirror_shipment_moves_to_shipping_then_sold() {
        let mut product = at(ProductStatus::Workstation);
        let shipped = MirrorShipment {
            milestone: ShipmentMilestone::Shipped,
            occurred_at: test_time(),
        };
        execute(&mut product, &ProductCommand::MirrorShipment(shipped.clone())).unwrap();
        assert_eq!(product.status(), ProductStatus::Shipping);

        // Repeating is a no-op.
        let events = execute(&mut product, &ProductCommand::MirrorShipment(shipped)).unwrap();
        assert!(events.is_empty());

        execute(
            &mut product,
            &ProductCommand::MirrorShipment(MirrorShipment {
                milestone: ShipmentMilestone::Delivered,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        assert_eq!(product.status(), ProductStatus::Sold);
    }

    #[test]
    fn mirror_shipment_rejects_unordered_products() {
        let mut product = at(ProductStatus::Listing);
        let err = execute(
            &mut product,
            &ProductCommand::MirrorShipment(MirrorShipment {
                milestone: ShipmentMilestone::Shipped,
                occurred_at: test_time(),
            }),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));
    }

    #[test]
    fn mirror_shipment_leaves_returned_products_alone() {
        let mut product = at(ProductStatus::Shipping);
        execute(
            &mut product,
            &ProductCommand::ForceReturn(ForceReturn {
                reason: "return approved in transit".to_string(),
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        for milestone in [ShipmentMilestone::Shipped, ShipmentMilestone::Delivered] {
            let events = execute(
                &mut product,
                &ProductCommand::MirrorShipment(MirrorShipment {
                    milestone,
                    occurred_at: test_time(),
                }),
            )
            .unwrap();
            assert!(events.is_empty());
        }
        assert_eq!(product.status(), ProductStatus::Returned);
    }

    #[test]
    fn force_return_works_from_any_status() {
        for status in [
            ProductStatus::Storage,
            ProductStatus::Ordered,
            ProductStatus::Shipping,
            ProductStatus::Sold,
        ] {
            let mut product = at(status);
            execute(
                &mut product,
                &ProductCommand::ForceReturn(ForceReturn {
                    reason: "return approved".to_string(),
                    occurred_at: test_time(),
                }),
            )
            .unwrap();
            assert_eq!(product.status(), ProductStatus::Returned);
        }
    }

    #[test]
    fn restock_to_inspection_resets_sub_flow() {
        let mut product = at(ProductStatus::Sold);
        execute(
            &mut product,
            &ProductCommand::ForceReturn(ForceReturn {
                reason: "return approved".to_string(),
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        let err = execute(
            &mut product,
            &ProductCommand::RestockProduct(RestockProduct {
                target: ProductStatus::Ordered,
                occurred_at: test_time(),
            }),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));

        execute(
            &mut product,
            &ProductCommand::RestockProduct(RestockProduct {
                target: ProductStatus::Inspection,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        assert_eq!(product.status(), ProductStatus::Inspection);
        assert_eq!(product.metadata().current_step, None);
        assert!(!product.metadata().inspection_completed);
        inspect(&mut product, 1).unwrap();
    }

    #[test]
    fn release_reservation_returns_to_listing() {
        let mut product = at(ProductStatus::Workstation);
        execute(
            &mut product,
            &ProductCommand::ReleaseReservation(ReleaseReservation {
                reason: "order cancelled".to_string(),
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        assert_eq!(product.status(), ProductStatus::Listing);
    }

    #[test]
    fn assign_location_is_not_audited() {
        let mut product = registered("CAM-X-012");
        let events = execute(
            &mut product,
            &ProductCommand::AssignLocation(AssignLocation {
                location_id: Some(LocationId::new()),
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        assert!(events[0].audit().is_none());
    }

    #[test]
    fn sku_suffix_matching() {
        assert!(matches_sku_suffix("CAM-X-006", "006"));
        assert!(!matches_sku_suffix("CAM-X-1006", "006"));
        assert!(!matches_sku_suffix("CAM-X-006", ""));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_status() -> impl Strategy<Value = ProductStatus> {
            proptest::sample::select(ProductStatus::ALL.to_vec())
        }

        fn arb_command() -> impl Strategy<Value = ProductCommand> {
            prop_oneof![
                arb_status().prop_map(|target| ProductCommand::TransitionStatus(TransitionStatus {
                    target,
                    reason: None,
                    occurred_at: test_time(),
                })),
                (0u8..6, any::<bool>(), any::<bool>()).prop_map(|(step, skip, photos)| {
                    let mut cmd = step_cmd(step);
                    cmd.skip_photography = Some(skip);
                    cmd.photo_slots = photos.then(photo);
                    ProductCommand::SaveInspectionProgress(cmd)
                }),
                any::<bool>().prop_map(|delivered| ProductCommand::MirrorShipment(MirrorShipment {
                    milestone: if delivered { ShipmentMilestone::Delivered } else { ShipmentMilestone::Shipped },
                    occurred_at: test_time(),
                })),
                Just(ProductCommand::ForceReturn(ForceReturn {
                    reason: "return approved".to_string(),
                    occurred_at: test_time(),
                })),
                arb_status().prop_map(|target| ProductCommand::RestockProduct(RestockProduct {
                    target,
                    occurred_at: test_time(),
                })),
            ]
        }

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 256,
                ..ProptestConfig::default()
            })]

            /// Property: status stays within the enumeration and rejected
            /// commands leave the product untouched.
            #[test]
            fn status_is_always_enumerated(commands in proptest::collection::vec(arb_command(), 0..40)) {
                let mut product = registered("PROP-001");
                for cmd in commands {
                    let before = product.clone();
                    if execute(&mut product, &cmd).is_err() {
                        prop_assert_eq!(&product, &before);
                    }
                    prop_assert!(ProductStatus::ALL.contains(&product.status()));
                }
            }

            /// Property: the inspection step never decreases while the
            /// product stays in inspection.
            #[test]
            fn inspection_step_is_monotonic(commands in proptest::collection::vec(arb_command(), 0..40)) {
                let mut product = registered("PROP-002");
                transition(&mut product, ProductStatus::Inspection).unwrap();
                let mut last_step = None;
                for cmd in commands {
                    let _ = execute(&mut product, &cmd);
                    if product.status() != ProductStatus::Inspection {
                        break;
                    }
                    let step = product.metadata().current_step;
                    prop_assert!(step >= last_step);
                    last_step = step;
                }
            }
        }
    }
}
