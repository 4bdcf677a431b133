//! Bundles: several shipments that travel as one parcel.
//!
//! Bundles are first-class rows. Older data only carries the grouping as a
//! JSON payload in the shipment's `notes`; [`BundleNotes`] reads and writes
//! that payload so both shapes keep working.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use depotflow_core::{BundleId, DomainError, Entity, OrderId, ProductId, ShipmentId};

use crate::{Shipment, ShipmentStatus};

const LEGACY_BUNDLE_TYPE: &str = "sales_bundle";

/// A bundle row: the authoritative member list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    pub id: BundleId,
    pub order_id: OrderId,
    pub shipment_ids: Vec<ShipmentId>,
    pub created_at: DateTime<Utc>,
}

impl Bundle {
    pub fn new(
        id: BundleId,
        order_id: OrderId,
        shipment_ids: Vec<ShipmentId>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        if shipment_ids.len() < 2 {
            return Err(DomainError::validation("a bundle needs at least two shipments"));
        }
        let distinct: BTreeSet<_> = shipment_ids.iter().collect();
        if distinct.len() != shipment_ids.len() {
            return Err(DomainError::validation("bundle shipments must be distinct"));
        }
        Ok(Self {
            id,
            order_id,
            shipment_ids,
            created_at,
        })
    }
}

impl Entity for Bundle {
    type Id = BundleId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// Products packed together under one bundle id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleMembership {
    pub bundle_id: BundleId,
    pub members: Vec<ProductId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleItem {
    pub product_id: ProductId,
}

/// Legacy bundle payload stored in `Shipment.notes`.
///
/// Wire shape: `{"type":"sales_bundle","bundleId":…,"bundleItems":[{"productId":…}],"totalItems":n}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleNotes {
    #[serde(rename = "type")]
    pub kind: String,
    pub bundle_id: String,
    pub bundle_items: Vec<BundleItem>,
    pub total_items: usize,
}

impl BundleNotes {
    pub fn for_membership(membership: &BundleMembership) -> Self {
        Self {
            kind: LEGACY_BUNDLE_TYPE.to_string(),
            bundle_id: membership.bundle_id.to_string(),
            bundle_items: membership
                .members
                .iter()
                .map(|product_id| BundleItem {
                    product_id: *product_id,
                })
                .collect(),
            total_items: membership.members.len(),
        }
    }

    /// `None` for free-text notes or payloads of another type.
    pub fn parse(notes: &str) -> Option<Self> {
        let parsed: BundleNotes = serde_json::from_str(notes).ok()?;
        (parsed.kind == LEGACY_BUNDLE_TYPE).then_some(parsed)
    }

    pub fn to_json(&self) -> Result<String, DomainError> {
        serde_json::to_string(self)
            .map_err(|e| DomainError::validation(format!("bundle notes: {e}")))
    }

    pub fn bundle_id(&self) -> BundleId {
        BundleId::new(self.bundle_id.clone())
    }

    pub fn product_ids(&self) -> Vec<ProductId> {
        self.bundle_items.iter().map(|i| i.product_id).collect()
    }

    /// Resolve a legacy bundle's member shipments.
    ///
    /// `candidates` are shipments whose notes name this bundle. Every listed
    /// product must have exactly one of them.
    pub fn resolve_members(&self, candidates: &[Shipment]) -> Result<Vec<ShipmentId>, DomainError> {
        let mut resolved = Vec::with_capacity(self.bundle_items.len());
        for item in &self.bundle_items {
            let matching: Vec<_> = candidates
                .iter()
                .filter(|s| s.product_id() == Some(item.product_id))
                .collect();
            match matching.as_slice() {
                [one] => resolved.push(one.id_typed()),
                [] => {
                    return Err(DomainError::bundle_inconsistent(format!(
                        "bundle {}: no shipment for product {}",
                        self.bundle_id, item.product_id
                    )));
                }
                _ => {
                    return Err(DomainError::bundle_inconsistent(format!(
                        "bundle {}: several shipments for product {}",
                        self.bundle_id, item.product_id
                    )));
                }
            }
        }
        if resolved.len() != self.total_items {
            return Err(DomainError::bundle_inconsistent(format!(
                "bundle {}: expected {} items, found {}",
                self.bundle_id,
                self.total_items,
                resolved.len()
            )));
        }
        Ok(resolved)
    }
}

/// Check that every member of a bundle can move to `target` together.
///
/// `expected` is the authoritative member list; `members` the loaded rows.
/// Any missing member, stray row or member in a different status fails the
/// whole advance.
pub fn plan_bundle_advance(
    bundle_id: &BundleId,
    expected: &[ShipmentId],
    members: &[Shipment],
    target: ShipmentStatus,
) -> Result<(), DomainError> {
    let expected_set: BTreeSet<ShipmentId> = expected.iter().copied().collect();
    let loaded_set: BTreeSet<ShipmentId> = members.iter().map(|s| s.id_typed()).collect();

    if expected_set != loaded_set || loaded_set.len() != members.len() {
        return Err(DomainError::bundle_inconsistent(format!(
            "bundle {bundle_id}: expected {} members, loaded {}",
            expected_set.len(),
            members.len()
        )));
    }

    let Some(first) = members.first() else {
        return Err(DomainError::bundle_inconsistent(format!(
            "bundle {bundle_id} has no members"
        )));
    };
    if let Some(out_of_step) = members.iter().find(|s| s.status() != first.status()) {
        return Err(DomainError::bundle_inconsistent(format!(
            "bundle {bundle_id}: shipment {} is {} while {} is {}",
            out_of_step.id_typed(),
            out_of_step.status(),
            first.id_typed(),
            first.status()
        )));
    }

    for member in members {
        member.check_advance(target)?;
    }
    Ok(())
}
