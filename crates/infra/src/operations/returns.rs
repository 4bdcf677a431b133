//! Returns workflow: request, approve (forces the product to `returned`),
//! reject, complete, and restock.

use async_trait::async_trait;

use depotflow_auth::Permission;
use depotflow_core::{DomainError, LocationId, OrderId, ProductId, ReturnId};
use depotflow_products::{Condition, ForceReturn, Product, ProductCommand, ProductStatus, RestockProduct};
use depotflow_sales::{ReturnCommand, ReturnRequest};

use super::ledger::move_product;
use super::{load_order, load_product, load_return};
use crate::dispatcher::{OpContext, Operation};
use crate::error::DispatchError;

#[derive(Debug, Clone)]
pub struct RequestReturn {
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub reason: String,
    pub condition: Option<Condition>,
    pub refund_amount: Option<u64>,
}

#[async_trait]
impl Operation for RequestReturn {
    type Output = ReturnRequest;

    fn name(&self) -> &'static str {
        "sales.request_return"
    }

    fn permission(&self) -> Permission {
        Permission::ManageReturns
    }

    async fn run(&self, ctx: &mut OpContext<'_>) -> Result<ReturnRequest, DispatchError> {
        let order = load_order(ctx.tx(), self.order_id).await?;
        if !order.contains_product(self.product_id) {
            return Err(DomainError::validation(format!(
                "product {} is not part of order {}",
                self.product_id,
                order.order_number()
            ))
            .into());
        }
        if !order.accepts_returns() {
            return Err(DomainError::invalid_transition(format!(
                "order {} is {}; returns need a shipped or delivered order",
                order.order_number(),
                order.status()
            ))
            .into());
        }

        let return_id = ReturnId::new();
        let mut request = ReturnRequest::empty(return_id);
        let now = ctx.now();
        ctx.create(
            &mut request,
            &ReturnCommand::Request(depotflow_sales::RequestReturn {
                return_id,
                order_id: self.order_id,
                product_id: self.product_id,
                reason: self.reason.clone(),
                condition: self.condition,
                refund_amount: self.refund_amount,
                occurred_at: now,
            }),
        )
        .await?;
        Ok(request)
    }
}

/// Approve a pending return. The product becomes `returned` whatever its
/// previous status.
#[derive(Debug, Clone)]
pub struct ApproveReturn {
    pub return_id: ReturnId,
}

#[async_trait]
impl Operation for ApproveReturn {
    type Output = ReturnRequest;

    fn name(&self) -> &'static str {
        "sales.approve_return"
    }

    fn permission(&self) -> Permission {
        Permission::ManageReturns
    }

    async fn run(&self, ctx: &mut OpContext<'_>) -> Result<ReturnRequest, DispatchError> {
        let mut request = load_return(ctx.tx(), self.return_id).await?;
        let now = ctx.now();
        ctx.execute(&mut request, &ReturnCommand::Approve { occurred_at: now })
            .await?;

        let mut product = load_product(ctx.tx(), request.product_id()).await?;
        ctx.execute(
            &mut product,
            &ProductCommand::ForceReturn(ForceReturn {
                reason: format!("return approved: {}", request.reason()),
                occurred_at: now,
            }),
        )
        .await?;
        Ok(request)
    }
}

#[derive(Debug, Clone)]
pub struct RejectReturn {
    pub return_id: ReturnId,
    pub note: String,
}

#[async_trait]
impl Operation for RejectReturn {
    type Output = ReturnRequest;

    fn name(&self) -> &'static str {
        "sales.reject_return"
    }

    fn permission(&self) -> Permission {
        Permission::ManageReturns
    }

    async fn run(&self, ctx: &mut OpContext<'_>) -> Result<ReturnRequest, DispatchError> {
        let mut request = load_return(ctx.tx(), self.return_id).await?;
        let now = ctx.now();
        ctx.execute(
            &mut request,
            &ReturnCommand::Reject {
                note: self.note.clone(),
                occurred_at: now,
            },
        )
        .await?;
        Ok(request)
    }
}

#[derive(Debug, Clone)]
pub struct CompleteReturn {
    pub return_id: ReturnId,
}

#[async_trait]
impl Operation for CompleteReturn {
    type Output = ReturnRequest;

    fn name(&self) -> &'static str {
        "sales.complete_return"
    }

    fn permission(&self) -> Permission {
        Permission::ManageReturns
    }

    async fn run(&self, ctx: &mut OpContext<'_>) -> Result<ReturnRequest, DispatchError> {
        let mut request = load_return(ctx.tx(), self.return_id).await?;
        let now = ctx.now();
        ctx.execute(&mut request, &ReturnCommand::Complete { occurred_at: now })
            .await?;
        Ok(request)
    }
}

/// Put a returned product back into circulation, optionally moving it to a
/// new slot in the same transaction.
#[derive(Debug, Clone)]
pub struct RestockReturned {
    pub product_id: ProductId,
    pub target: ProductStatus,
    pub to_location_id: Option<LocationId>,
}

#[async_trait]
impl Operation for RestockReturned {
    type Output = Product;

    fn name(&self) -> &'static str {
        "sales.restock_returned"
    }

    fn permission(&self) -> Permission {
        Permission::ManageReturns
    }

    async fn run(&self, ctx: &mut OpContext<'_>) -> Result<Product, DispatchError> {
        let mut product = load_product(ctx.tx(), self.product_id).await?;
        let now = ctx.now();
        ctx.execute(
            &mut product,
            &ProductCommand::RestockProduct(RestockProduct {
                target: self.target,
                occurred_at: now,
            }),
        )
        .await?;

        if let Some(to) = self.to_location_id {
            if product.current_location_id() != Some(to) {
                move_product(ctx, &mut product, to, Some("restocked after return".to_string()))
                    .await?;
            }
        }
        Ok(product)
    }
}
