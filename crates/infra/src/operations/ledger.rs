//! Location Ledger operations.
//!
//! The movement log is the source of truth; `Product.current_location_id` is
//! a cached index rewritten in the same unit of work as every ledger write.

use async_trait::async_trait;
use tracing::debug;

use depotflow_auth::Permission;
use depotflow_core::{DomainError, LocationId, MovementId, ProductId};
use depotflow_inventory::{
    check_undo, plan_move, InventoryMovement, LedgerEvent, Location, LocationRegistered,
    MoveRequest, MovedBy, MovementReverted, NewLocation, ProductMoved,
};
use depotflow_products::{AssignLocation, Product, ProductCommand};

use super::load_product;
use crate::dispatcher::{OpContext, Operation};
use crate::error::DispatchError;
use crate::store::UnitOfWork;

#[derive(Debug, Clone)]
pub struct RegisterLocation {
    pub code: String,
    pub zone: String,
    pub capacity: Option<u32>,
    pub name: Option<String>,
}

#[async_trait]
impl Operation for RegisterLocation {
    type Output = Location;

    fn name(&self) -> &'static str {
        "inventory.register_location"
    }

    fn permission(&self) -> Permission {
        Permission::ManageLocations
    }

    async fn run(&self, ctx: &mut OpContext<'_>) -> Result<Location, DispatchError> {
        let location = Location::register(NewLocation {
            code: self.code.clone(),
            zone: self.zone.clone(),
            capacity: self.capacity,
            name: self.name.clone(),
        })?;

        if ctx.tx().location_by_code(&location.code).await?.is_some() {
            return Err(DomainError::conflict(format!(
                "location code '{}' already exists",
                location.code
            ))
            .into());
        }
        ctx.tx().insert_location(&location).await?;

        let now = ctx.now();
        ctx.record(&[LedgerEvent::LocationRegistered(LocationRegistered {
            location: location.clone(),
            occurred_at: now,
        })])
        .await?;
        Ok(location)
    }
}

#[derive(Debug, Clone)]
pub struct MoveProduct {
    pub product_id: ProductId,
    pub to_location_id: LocationId,
    pub notes: Option<String>,
}

#[async_trait]
impl Operation for MoveProduct {
    type Output = InventoryMovement;

    fn name(&self) -> &'static str {
        "inventory.move"
    }

    fn permission(&self) -> Permission {
        Permission::MoveInventory
    }

    async fn run(&self, ctx: &mut OpContext<'_>) -> Result<InventoryMovement, DispatchError> {
        let mut product = load_product(ctx.tx(), self.product_id).await?;
        move_product(ctx, &mut product, self.to_location_id, self.notes.clone()).await
    }
}

/// Append a movement for an already locked product and rewrite its cached
/// location.
pub(crate) async fn move_product(
    ctx: &mut OpContext<'_>,
    product: &mut Product,
    to_location_id: LocationId,
    notes: Option<String>,
) -> Result<InventoryMovement, DispatchError> {
    let target = ctx.tx().location(to_location_id).await?;
    let moved_by = MovedBy {
        user_id: ctx.actor().user_id,
        name: ctx.actor().name.clone(),
    };
    let movement = plan_move(
        product.current_location_id(),
        target.as_ref(),
        MoveRequest {
            product_id: product.id_typed(),
            to_location_id,
            moved_by,
            notes,
            occurred_at: ctx.now(),
        },
    )?;

    ctx.tx().insert_movement(&movement).await?;
    let now = ctx.now();
    ctx.execute(
        product,
        &ProductCommand::AssignLocation(AssignLocation {
            location_id: Some(movement.to_location_id),
            occurred_at: now,
        }),
    )
    .await?;

    let from_code = location_code(ctx.tx(), movement.from_location_id).await?;
    let to_code = target.map(|l| l.code).unwrap_or_default();
    ctx.record(&[LedgerEvent::ProductMoved(ProductMoved {
        movement: movement.clone(),
        from_code,
        to_code,
    })])
    .await?;

    debug!(movement_id = %movement.id, product_id = %movement.product_id, "movement appended");
    Ok(movement)
}

/// Remove the latest movement of a product and restore its previous location.
#[derive(Debug, Clone)]
pub struct UndoMovement {
    pub movement_id: MovementId,
}

#[async_trait]
impl Operation for UndoMovement {
    type Output = InventoryMovement;

    fn name(&self) -> &'static str {
        "inventory.undo"
    }

    fn permission(&self) -> Permission {
        Permission::UndoMovement
    }

    async fn run(&self, ctx: &mut OpContext<'_>) -> Result<InventoryMovement, DispatchError> {
        let movement = ctx
            .tx()
            .movement(self.movement_id)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("movement {}", self.movement_id)))?;

        // Lock the product first so no new movement can land between the
        // latest-check and the delete.
        let mut product = load_product(ctx.tx(), movement.product_id).await?;
        let latest = ctx.tx().latest_movement(movement.product_id).await?;
        check_undo(&movement, latest.as_ref())?;

        ctx.tx().delete_movement(movement.id).await?;
        let now = ctx.now();
        ctx.execute(
            &mut product,
            &ProductCommand::AssignLocation(AssignLocation {
                location_id: movement.from_location_id,
                occurred_at: now,
            }),
        )
        .await?;

        let from_code = location_code(ctx.tx(), movement.from_location_id).await?;
        let to_code = location_code(ctx.tx(), Some(movement.to_location_id)).await?;
        ctx.record(&[LedgerEvent::MovementReverted(MovementReverted {
            movement: movement.clone(),
            from_code,
            to_code,
            occurred_at: now,
        })])
        .await?;
        Ok(movement)
    }
}

async fn location_code(
    tx: &mut dyn UnitOfWork,
    id: Option<LocationId>,
) -> Result<Option<String>, DispatchError> {
    match id {
        Some(id) => Ok(tx.location(id).await?.map(|l| l.code)),
        None => Ok(None),
    }
}
