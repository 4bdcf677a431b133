//! Order placement and the pre-shipping order lifecycle.
//!
//! Shipping and delivery are not exposed here: those order states are
//! mirrors written only by the synchronizer.

use async_trait::async_trait;

use depotflow_auth::Permission;
use depotflow_core::{DomainError, OrderId};
use depotflow_products::{ProductCommand, ProductStatus, ReleaseReservation, TransitionStatus};
use depotflow_sales::{NewOrderItem, Order, OrderCommand};

use super::{load_order, load_product};
use crate::dispatcher::{OpContext, Operation};
use crate::error::DispatchError;

/// Place an order and claim every item's product (`listing → ordered`).
#[derive(Debug, Clone)]
pub struct PlaceOrder {
    pub order_number: String,
    pub customer_id: String,
    pub items: Vec<NewOrderItem>,
}

#[async_trait]
impl Operation for PlaceOrder {
    type Output = Order;

    fn name(&self) -> &'static str {
        "sales.place_order"
    }

    fn permission(&self) -> Permission {
        Permission::ManageOrders
    }

    async fn run(&self, ctx: &mut OpContext<'_>) -> Result<Order, DispatchError> {
        let order_id = OrderId::new();
        let mut order = Order::empty(order_id);
        let now = ctx.now();
        ctx.create(
            &mut order,
            &OrderCommand::PlaceOrder(depotflow_sales::PlaceOrder {
                order_id,
                order_number: self.order_number.clone(),
                customer_id: self.customer_id.clone(),
                items: self.items.clone(),
                occurred_at: now,
            }),
        )
        .await?;

        let claim = ProductCommand::TransitionStatus(TransitionStatus {
            target: ProductStatus::Ordered,
            reason: Some(format!("order {}", order.order_number())),
            occurred_at: now,
        });
        for product_id in order.product_ids() {
            let mut product = load_product(ctx.tx(), product_id).await?;
            ctx.execute(&mut product, &claim).await?;
        }
        Ok(order)
    }
}

#[derive(Debug, Clone)]
pub struct ConfirmOrder {
    pub order_id: OrderId,
}

#[async_trait]
impl Operation for ConfirmOrder {
    type Output = Order;

    fn name(&self) -> &'static str {
        "sales.confirm_order"
    }

    fn permission(&self) -> Permission {
        Permission::ManageOrders
    }

    async fn run(&self, ctx: &mut OpContext<'_>) -> Result<Order, DispatchError> {
        let mut order = load_order(ctx.tx(), self.order_id).await?;
        let now = ctx.now();
        ctx.execute(&mut order, &OrderCommand::Confirm { occurred_at: now })
            .await?;
        Ok(order)
    }
}

#[derive(Debug, Clone)]
pub struct StartProcessing {
    pub order_id: OrderId,
}

#[async_trait]
impl Operation for StartProcessing {
    type Output = Order;

    fn name(&self) -> &'static str {
        "sales.start_processing"
    }

    fn permission(&self) -> Permission {
        Permission::ManageOrders
    }

    async fn run(&self, ctx: &mut OpContext<'_>) -> Result<Order, DispatchError> {
        let mut order = load_order(ctx.tx(), self.order_id).await?;
        let now = ctx.now();
        ctx.execute(&mut order, &OrderCommand::StartProcessing { occurred_at: now })
            .await?;
        Ok(order)
    }
}

/// Cancel before shipping and put claimed products back on sale.
#[derive(Debug, Clone)]
pub struct CancelOrder {
    pub order_id: OrderId,
    pub reason: String,
}

#[async_trait]
impl Operation for CancelOrder {
    type Output = Order;

    fn name(&self) -> &'static str {
        "sales.cancel_order"
    }

    fn permission(&self) -> Permission {
        Permission::ManageOrders
    }

    async fn run(&self, ctx: &mut OpContext<'_>) -> Result<Order, DispatchError> {
        if self.reason.trim().is_empty() {
            return Err(DomainError::validation("cancellation reason must not be empty").into());
        }

        let mut order = load_order(ctx.tx(), self.order_id).await?;
        let now = ctx.now();
        ctx.execute(
            &mut order,
            &OrderCommand::Cancel {
                reason: self.reason.clone(),
                occurred_at: now,
            },
        )
        .await?;

        let release = ProductCommand::ReleaseReservation(ReleaseReservation {
            reason: format!("order {} cancelled", order.order_number()),
            occurred_at: now,
        });
        for product_id in order.product_ids() {
            let mut product = load_product(ctx.tx(), product_id).await?;
            ctx.execute(&mut product, &release).await?;
        }
        Ok(order)
    }
}
