//! Product intake, manual status transitions and the inspection sub-flow.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use depotflow_auth::Permission;
use depotflow_core::{DomainError, ProductId};
use depotflow_products::{
    Condition, PhotoSlot, Product, ProductCommand, ProductStatus, SaveInspectionProgress,
    TransitionStatus,
};

use super::load_product;
use crate::dispatcher::{OpContext, Operation};
use crate::error::DispatchError;

/// Intake: the product starts `inbound` with no location.
#[derive(Debug, Clone)]
pub struct RegisterProduct {
    pub sku: String,
    pub category: String,
    pub name: Option<String>,
    pub declared_value: u64,
}

#[async_trait]
impl Operation for RegisterProduct {
    type Output = Product;

    fn name(&self) -> &'static str {
        "products.register"
    }

    fn permission(&self) -> Permission {
        Permission::RegisterProduct
    }

    async fn run(&self, ctx: &mut OpContext<'_>) -> Result<Product, DispatchError> {
        let sku = self.sku.trim();
        if ctx.tx().product_by_sku(sku).await?.is_some() {
            return Err(DomainError::conflict(format!("sku '{sku}' already exists")).into());
        }

        let product_id = ProductId::new();
        let mut product = Product::empty(product_id);
        let now = ctx.now();
        ctx.create(
            &mut product,
            &ProductCommand::RegisterProduct(depotflow_products::RegisterProduct {
                product_id,
                sku: sku.to_string(),
                category: self.category.clone(),
                name: self.name.clone(),
                declared_value: self.declared_value,
                occurred_at: now,
            }),
        )
        .await?;
        Ok(product)
    }
}

#[derive(Debug, Clone)]
pub struct TransitionProduct {
    pub product_id: ProductId,
    pub target: ProductStatus,
    pub reason: Option<String>,
}

#[async_trait]
impl Operation for TransitionProduct {
    type Output = Product;

    fn name(&self) -> &'static str {
        "products.transition"
    }

    fn permission(&self) -> Permission {
        Permission::TransitionProduct
    }

    async fn run(&self, ctx: &mut OpContext<'_>) -> Result<Product, DispatchError> {
        if self.target.is_order_driven() {
            return Err(DomainError::invalid_transition(format!(
                "{} is set by orders and shipments, not manually",
                self.target
            ))
            .into());
        }
        let mut product = load_product(ctx.tx(), self.product_id).await?;
        let now = ctx.now();
        ctx.execute(
            &mut product,
            &ProductCommand::TransitionStatus(TransitionStatus {
                target: self.target,
                reason: self.reason.clone(),
                occurred_at: now,
            }),
        )
        .await?;
        Ok(product)
    }
}

/// Save one step of the inspection checklist.
///
/// Step 4 completes the inspection and stamps the acting user as inspector.
#[derive(Debug, Clone, Default)]
pub struct RecordInspection {
    pub product_id: ProductId,
    pub step: u8,
    pub checklist: Option<BTreeMap<String, JsonValue>>,
    pub photo_slots: Option<Vec<PhotoSlot>>,
    pub skip_photography: Option<bool>,
    pub condition: Option<Condition>,
    pub notes: Option<String>,
}

#[async_trait]
impl Operation for RecordInspection {
    type Output = Product;

    fn name(&self) -> &'static str {
        "products.inspect"
    }

    fn permission(&self) -> Permission {
        Permission::RecordInspection
    }

    async fn run(&self, ctx: &mut OpContext<'_>) -> Result<Product, DispatchError> {
        let mut product = load_product(ctx.tx(), self.product_id).await?;
        let command = ProductCommand::SaveInspectionProgress(SaveInspectionProgress {
            step: self.step,
            checklist: self.checklist.clone(),
            photo_slots: self.photo_slots.clone(),
            skip_photography: self.skip_photography,
            condition: self.condition,
            notes: self.notes.clone(),
            inspector: ctx.actor().user_id,
            occurred_at: ctx.now(),
        });
        ctx.execute(&mut product, &command).await?;
        Ok(product)
    }
}
