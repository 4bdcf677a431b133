//! Cross-entity status synchronizer.
//!
//! Product status, listing shipping status and order status are three
//! mirrors of one shipment lifecycle. This module is the only writer of the
//! shipping/delivery side of those mirrors. It runs inside the caller's unit
//! of work, so either every mirror moves or the whole operation rolls back.
//!
//! | shipment reaches | listings | products | order |
//! |---|---|---|---|
//! | `picked` / `packed` | - | - | - |
//! | `shipped` | `shipped` + `shipped_at` | `shipping` | `shipped` + tracking |
//! | `delivered` | `delivered` + `delivered_at` | `sold` | `delivered` |
//!
//! Mirrors already past the milestone are left alone, so replays and
//! overlapping shipments of one order are no-ops rather than failures. A
//! product returned while in transit counts as past both milestones.

use chrono::{DateTime, Utc};
use tracing::debug;

use depotflow_core::{OrderId, ProductId};
use depotflow_products::{MirrorShipment, ProductCommand, ProductStatus, ShipmentMilestone};
use depotflow_sales::{ListingCommand, MarkShipped, OrderCommand, OrderStatus, ShippingStatus};
use depotflow_shipping::{Shipment, ShipmentStatus};

use crate::dispatcher::OpContext;
use crate::error::DispatchError;
use crate::operations::{load_order, load_product};

/// What a terminal shipment event fans out to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncScope {
    pub order_id: Option<OrderId>,
    /// Used when there is no order to enumerate items from.
    pub product_id: Option<ProductId>,
    pub tracking_number: Option<String>,
    pub carrier: Option<String>,
}

impl SyncScope {
    pub fn for_shipment(shipment: &Shipment) -> Self {
        Self {
            order_id: shipment.order_id(),
            product_id: shipment.product_id(),
            tracking_number: shipment.tracking_number().map(str::to_string),
            carrier: shipment.carrier().map(str::to_string),
        }
    }
}

/// Milestone a shipment status propagates as, if any.
pub fn milestone_for(status: ShipmentStatus) -> Option<ShipmentMilestone> {
    match status {
        ShipmentStatus::Shipped => Some(ShipmentMilestone::Shipped),
        ShipmentStatus::Delivered => Some(ShipmentMilestone::Delivered),
        ShipmentStatus::Pending | ShipmentStatus::Picked | ShipmentStatus::Packed => None,
    }
}

/// Propagate a shipment's current status to its mirrors.
pub async fn on_shipment_advanced(
    ctx: &mut OpContext<'_>,
    shipment: &Shipment,
    at: DateTime<Utc>,
) -> Result<(), DispatchError> {
    match milestone_for(shipment.status()) {
        Some(milestone) => propagate(ctx, &SyncScope::for_shipment(shipment), milestone, at).await,
        None => Ok(()),
    }
}

/// Move every mirror in `scope` to `milestone`.
///
/// With an order in scope, every order item's product and listings are
/// updated, then the order itself.
pub async fn propagate(
    ctx: &mut OpContext<'_>,
    scope: &SyncScope,
    milestone: ShipmentMilestone,
    at: DateTime<Utc>,
) -> Result<(), DispatchError> {
    let mut order = match scope.order_id {
        Some(id) => Some(load_order(ctx.tx(), id).await?),
        None => None,
    };
    let product_ids = match (&order, scope.product_id) {
        (Some(order), _) => order.product_ids(),
        (None, Some(product_id)) => vec![product_id],
        (None, None) => vec![],
    };

    let listing_command = match milestone {
        ShipmentMilestone::Shipped => ListingCommand::MarkShipped { occurred_at: at },
        ShipmentMilestone::Delivered => ListingCommand::MarkDelivered { occurred_at: at },
    };
    let product_command = ProductCommand::MirrorShipment(MirrorShipment {
        milestone,
        occurred_at: at,
    });

    for product_id in &product_ids {
        let listings = ctx.tx().listings_for_product(*product_id).await?;
        for mut listing in listings {
            if listing_is_ahead(listing.shipping_status(), milestone) {
                continue;
            }
            ctx.execute(&mut listing, &listing_command).await?;
        }

        let mut product = load_product(ctx.tx(), *product_id).await?;
        if !product_is_ahead(product.status(), milestone) {
            ctx.execute(&mut product, &product_command).await?;
        }
    }

    if let Some(order) = order.as_mut() {
        if !order_is_ahead(order.status(), milestone) {
            let command = match milestone {
                ShipmentMilestone::Shipped => OrderCommand::MarkShipped(MarkShipped {
                    tracking_number: scope.tracking_number.clone(),
                    carrier: scope.carrier.clone(),
                    occurred_at: at,
                }),
                ShipmentMilestone::Delivered => OrderCommand::MarkDelivered { occurred_at: at },
            };
            ctx.execute(order, &command).await?;
        }
    }

    debug!(
        order_id = ?scope.order_id,
        products = product_ids.len(),
        milestone = milestone.as_str(),
        "mirrors synchronized"
    );
    Ok(())
}

fn listing_is_ahead(status: ShippingStatus, milestone: ShipmentMilestone) -> bool {
    milestone == ShipmentMilestone::Shipped && status == ShippingStatus::Delivered
}

fn product_is_ahead(status: ProductStatus, milestone: ShipmentMilestone) -> bool {
    status == ProductStatus::Returned
        || (milestone == ShipmentMilestone::Shipped
            && matches!(status, ProductStatus::Sold | ProductStatus::Delivered))
}

fn order_is_ahead(status: OrderStatus, milestone: ShipmentMilestone) -> bool {
    milestone == ShipmentMilestone::Shipped && status == OrderStatus::Delivered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_shipped_and_delivered_propagate() {
        assert_eq!(milestone_for(ShipmentStatus::Pending), None);
        assert_eq!(milestone_for(ShipmentStatus::Picked), None);
        assert_eq!(milestone_for(ShipmentStatus::Packed), None);
        assert_eq!(
            milestone_for(ShipmentStatus::Shipped),
            Some(ShipmentMilestone::Shipped)
        );
        assert_eq!(
            milestone_for(ShipmentStatus::Delivered),
            Some(ShipmentMilestone::Delivered)
        );
    }

    #[test]
    fn delivered_mirrors_are_not_pulled_back_to_shipped() {
        assert!(listing_is_ahead(ShippingStatus::Delivered, ShipmentMilestone::Shipped));
        assert!(!listing_is_ahead(ShippingStatus::Shipped, ShipmentMilestone::Delivered));
        assert!(product_is_ahead(ProductStatus::Sold, ShipmentMilestone::Shipped));
        assert!(!product_is_ahead(ProductStatus::Shipping, ShipmentMilestone::Shipped));
        assert!(product_is_ahead(ProductStatus::Returned, ShipmentMilestone::Shipped));
        assert!(product_is_ahead(ProductStatus::Returned, ShipmentMilestone::Delivered));
        assert!(order_is_ahead(OrderStatus::Delivered, ShipmentMilestone::Shipped));
        assert!(!order_is_ahead(OrderStatus::Shipped, ShipmentMilestone::Delivered));
    }
}
