//! Shipment & Bundle Manager operations.
//!
//! A bundle advances as one unit: every member is validated against the
//! target before any of them is written, and all writes share the caller's
//! unit of work. Bundle rows are authoritative; shipments that only carry the
//! legacy notes payload are grouped by parsing it.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use depotflow_auth::Permission;
use depotflow_core::{BundleId, DomainError, ListingId, OrderId, ProductId, ShipmentId};
use depotflow_events::{ActivityKind, AuditRecord};
use depotflow_products::ShipmentMilestone;
use depotflow_sales::{OrderStatus, ShippingStatus};
use depotflow_shipping::{
    plan_bundle_advance, Bundle, BundleMembership, BundleNotes, Priority, Shipment,
    ShipmentCommand, ShipmentStatus,
};

use super::{load_listing, load_order, load_product, load_shipment};
use crate::dispatcher::{OpContext, Operation};
use crate::error::DispatchError;
use crate::store::UnitOfWork;
use crate::sync::{self, SyncScope};

/// Create shipments for some of an order's products.
///
/// One product gives one shipment. Several products give one shipment each,
/// all joined in a new bundle.
#[derive(Debug, Clone, Default)]
pub struct CreateShipment {
    pub order_id: OrderId,
    pub product_ids: Vec<ProductId>,
    pub carrier: Option<String>,
    pub method: Option<String>,
    pub tracking_number: Option<String>,
    /// Defaults from the summed declared value of the products.
    pub priority: Option<Priority>,
    pub deadline: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

#[async_trait]
impl Operation for CreateShipment {
    type Output = Vec<Shipment>;

    fn name(&self) -> &'static str {
        "shipping.create"
    }

    fn permission(&self) -> Permission {
        Permission::CreateShipment
    }

    async fn run(&self, ctx: &mut OpContext<'_>) -> Result<Vec<Shipment>, DispatchError> {
        if self.product_ids.is_empty() {
            return Err(DomainError::validation("a shipment needs at least one product").into());
        }
        let distinct: BTreeSet<_> = self.product_ids.iter().collect();
        if distinct.len() != self.product_ids.len() {
            return Err(DomainError::validation("products must not repeat within a shipment").into());
        }

        let order = load_order(ctx.tx(), self.order_id).await?;
        if order.status() == OrderStatus::Cancelled {
            return Err(DomainError::invalid_transition(format!(
                "order {} is cancelled",
                order.order_number()
            ))
            .into());
        }

        let mut declared_value: u64 = 0;
        for product_id in &self.product_ids {
            if !order.contains_product(*product_id) {
                return Err(DomainError::validation(format!(
                    "product {product_id} is not part of order {}",
                    order.order_number()
                ))
                .into());
            }
            let product = load_product(ctx.tx(), *product_id).await?;
            declared_value = declared_value.saturating_add(product.declared_value());
        }

        let shipment_ids: Vec<ShipmentId> =
            self.product_ids.iter().map(|_| ShipmentId::new()).collect();
        let now = ctx.now();

        let membership = if self.product_ids.len() > 1 {
            let bundle = Bundle::new(
                BundleId::generate(),
                self.order_id,
                shipment_ids.clone(),
                now,
            )?;
            // The bundle row goes first; member rows reference it.
            ctx.tx().insert_bundle(&bundle).await?;
            Some(BundleMembership {
                bundle_id: bundle.id,
                members: self.product_ids.clone(),
            })
        } else {
            None
        };

        let mut created = Vec::with_capacity(shipment_ids.len());
        for (shipment_id, product_id) in shipment_ids.into_iter().zip(&self.product_ids) {
            let mut shipment = Shipment::empty(shipment_id);
            ctx.create(
                &mut shipment,
                &ShipmentCommand::Create(depotflow_shipping::CreateShipment {
                    shipment_id,
                    order_id: self.order_id,
                    product_id: *product_id,
                    bundle: membership.clone(),
                    carrier: self.carrier.clone(),
                    method: self.method.clone(),
                    tracking_number: self.tracking_number.clone(),
                    priority: self.priority,
                    declared_value,
                    deadline: self.deadline,
                    notes: self.notes.clone(),
                    occurred_at: now,
                }),
            )
            .await?;
            created.push(shipment);
        }

        if let Some(membership) = &membership {
            info!(
                bundle_id = %membership.bundle_id,
                members = created.len(),
                "bundle created"
            );
        }
        Ok(created)
    }
}

/// Move a shipment (and every bundle sibling) one step forward, then
/// propagate terminal milestones to the mirrors.
#[derive(Debug, Clone)]
pub struct AdvanceShipment {
    pub shipment_id: ShipmentId,
    pub target: ShipmentStatus,
}

#[async_trait]
impl Operation for AdvanceShipment {
    type Output = Vec<Shipment>;

    fn name(&self) -> &'static str {
        "shipping.advance"
    }

    fn permission(&self) -> Permission {
        Permission::AdvanceShipment
    }

    async fn run(&self, ctx: &mut OpContext<'_>) -> Result<Vec<Shipment>, DispatchError> {
        let shipment = load_shipment(ctx.tx(), self.shipment_id).await?;
        let now = ctx.now();
        advance_group(ctx, shipment, self.target, now).await
    }
}

/// Advance `shipment` together with its bundle siblings.
pub(crate) async fn advance_group(
    ctx: &mut OpContext<'_>,
    shipment: Shipment,
    target: ShipmentStatus,
    at: DateTime<Utc>,
) -> Result<Vec<Shipment>, DispatchError> {
    let mut members = resolve_group(ctx.tx(), shipment, target).await?;

    let command = ShipmentCommand::Advance {
        target,
        occurred_at: at,
    };
    for member in members.iter_mut() {
        ctx.execute(member, &command).await?;
    }

    // Propagation is order-wide; one pass per order is enough.
    let mut synced_orders = BTreeSet::new();
    for member in &members {
        if let Some(order_id) = member.order_id() {
            if !synced_orders.insert(order_id) {
                continue;
            }
        }
        sync::on_shipment_advanced(ctx, member, at).await?;
    }
    Ok(members)
}

/// Load and validate every shipment that must move with `shipment`.
async fn resolve_group(
    tx: &mut dyn UnitOfWork,
    shipment: Shipment,
    target: ShipmentStatus,
) -> Result<Vec<Shipment>, DispatchError> {
    if let Some(bundle_id) = shipment.bundle_id().cloned() {
        let bundle = tx.bundle(&bundle_id).await?.ok_or_else(|| {
            DomainError::bundle_inconsistent(format!("bundle {bundle_id} has no bundle row"))
        })?;
        let members = tx.shipments_in_bundle(&bundle_id).await?;
        plan_bundle_advance(&bundle_id, &bundle.shipment_ids, &members, target)?;
        return Ok(members);
    }

    if let Some(notes) = shipment.legacy_bundle() {
        let members = legacy_siblings(tx, &notes).await?;
        let expected = notes.resolve_members(&members)?;
        plan_bundle_advance(&notes.bundle_id(), &expected, &members, target)?;
        return Ok(members);
    }

    shipment.check_advance(target)?;
    Ok(vec![shipment])
}

pub(crate) async fn legacy_siblings(
    tx: &mut dyn UnitOfWork,
    notes: &BundleNotes,
) -> Result<Vec<Shipment>, DispatchError> {
    Ok(tx
        .legacy_bundle_shipments()
        .await?
        .into_iter()
        .filter(|s| {
            s.legacy_bundle()
                .is_some_and(|n| n.bundle_id == notes.bundle_id)
        })
        .collect())
}

/// Apply a carrier-confirmed delivery.
///
/// Runs the same path as a staff-driven `delivered` advance. Returns `false`
/// when the listing is no longer `shipped` (someone else got there first).
#[derive(Debug, Clone)]
pub struct ReconcileDelivery {
    pub listing_id: ListingId,
    pub shipment_id: Option<ShipmentId>,
    pub delivered_at: Option<DateTime<Utc>>,
}

#[async_trait]
impl Operation for ReconcileDelivery {
    type Output = bool;

    fn name(&self) -> &'static str {
        "shipping.reconcile_delivery"
    }

    fn permission(&self) -> Permission {
        Permission::AdvanceShipment
    }

    async fn run(&self, ctx: &mut OpContext<'_>) -> Result<bool, DispatchError> {
        let listing = load_listing(ctx.tx(), self.listing_id).await?;
        if listing.shipping_status() != ShippingStatus::Shipped {
            return Ok(false);
        }
        let at = self.delivered_at.unwrap_or_else(|| ctx.now());

        if let Some(shipment_id) = self.shipment_id {
            let shipment = load_shipment(ctx.tx(), shipment_id).await?;
            match shipment.status() {
                ShipmentStatus::Shipped => {
                    advance_group(ctx, shipment, ShipmentStatus::Delivered, at).await?;
                }
                ShipmentStatus::Delivered => {
                    let scope = SyncScope::for_shipment(&shipment);
                    sync::propagate(ctx, &scope, ShipmentMilestone::Delivered, at).await?;
                }
                other => {
                    return Err(DomainError::invalid_transition(format!(
                        "shipment {shipment_id} is {other}; a delivery needs a shipped parcel"
                    ))
                    .into());
                }
            }
            return Ok(true);
        }

        // No shipment row: deliver through the order that shipped the product.
        let orders = ctx.tx().orders_for_product(listing.product_id()).await?;
        let order_id = orders
            .iter()
            .find(|o| o.status() == OrderStatus::Shipped)
            .map(|o| o.id_typed());
        let scope = SyncScope {
            order_id,
            product_id: Some(listing.product_id()),
            tracking_number: None,
            carrier: None,
        };
        sync::propagate(ctx, &scope, ShipmentMilestone::Delivered, at).await?;
        Ok(true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillSkip {
    pub bundle_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillReport {
    pub promoted: Vec<BundleId>,
    pub skipped: Vec<BackfillSkip>,
}

/// Promote notes-only bundles to bundle rows.
///
/// Groups that cannot be resolved cleanly are reported and left untouched.
#[derive(Debug, Clone, Default)]
pub struct BackfillBundles;

#[async_trait]
impl Operation for BackfillBundles {
    type Output = BackfillReport;

    fn name(&self) -> &'static str {
        "shipping.backfill_bundles"
    }

    fn permission(&self) -> Permission {
        Permission::CreateShipment
    }

    async fn run(&self, ctx: &mut OpContext<'_>) -> Result<BackfillReport, DispatchError> {
        let mut groups: BTreeMap<String, Vec<Shipment>> = BTreeMap::new();
        for shipment in ctx.tx().legacy_bundle_shipments().await? {
            if let Some(notes) = shipment.legacy_bundle() {
                groups.entry(notes.bundle_id).or_default().push(shipment);
            }
        }

        let now = ctx.now();
        let mut report = BackfillReport::default();
        for (raw_id, members) in groups {
            match plan_promotion(ctx.tx(), &raw_id, &members, now).await? {
                Ok(bundle) => {
                    promote(ctx, &bundle, members).await?;
                    report.promoted.push(bundle.id);
                }
                Err(reason) => {
                    warn!(bundle_id = %raw_id, %reason, "legacy bundle left as is");
                    report.skipped.push(BackfillSkip {
                        bundle_id: raw_id,
                        reason: reason.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }
}

/// Every check runs before the first write so a skipped group leaves no
/// trace in the transaction.
async fn plan_promotion(
    tx: &mut dyn UnitOfWork,
    raw_id: &str,
    members: &[Shipment],
    now: DateTime<Utc>,
) -> Result<Result<Bundle, DomainError>, DispatchError> {
    let Some(notes) = members.first().and_then(|s| s.legacy_bundle()) else {
        return Ok(Err(DomainError::bundle_inconsistent(format!(
            "bundle {raw_id} has no readable members"
        ))));
    };
    let shipment_ids = match notes.resolve_members(members) {
        Ok(ids) => ids,
        Err(e) => return Ok(Err(e)),
    };

    let orders: BTreeSet<Option<OrderId>> = members.iter().map(|s| s.order_id()).collect();
    let order_id = match orders.into_iter().collect::<Vec<_>>().as_slice() {
        [Some(order_id)] => *order_id,
        _ => {
            return Ok(Err(DomainError::bundle_inconsistent(format!(
                "bundle {raw_id} members do not share one order"
            ))));
        }
    };

    let bundle_id = notes.bundle_id();
    if tx.bundle(&bundle_id).await?.is_some() {
        return Ok(Err(DomainError::conflict(format!(
            "bundle {bundle_id} already has a bundle row"
        ))));
    }
    Ok(Bundle::new(bundle_id, order_id, shipment_ids, now))
}

async fn promote(
    ctx: &mut OpContext<'_>,
    bundle: &Bundle,
    members: Vec<Shipment>,
) -> Result<(), DispatchError> {
    ctx.tx().insert_bundle(bundle).await?;
    let attach = ShipmentCommand::AttachBundle {
        bundle_id: bundle.id.clone(),
        occurred_at: ctx.now(),
    };
    for mut member in members {
        ctx.execute(&mut member, &attach).await?;
    }
    ctx.record_activity(
        AuditRecord::new(
            ActivityKind::BundleBackfill,
            format!("Promoted legacy bundle {}", bundle.id),
        )
        .order(bundle.order_id)
        .metadata(json!({
            "bundleId": bundle.id,
            "shipmentIds": bundle.shipment_ids,
        })),
    )
    .await
}
