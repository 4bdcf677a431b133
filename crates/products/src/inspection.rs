//! Inspection/photography sub-flow data.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use depotflow_core::{DomainError, ProductId, UserId};

use crate::ProductStatus;

/// Steps of the inspection sub-flow.
pub const STEP_CHECKLIST: u8 = 1;
pub const STEP_PHOTOGRAPHY: u8 = 2;
pub const STEP_PACKING: u8 = 3;
pub const STEP_SHELVING: u8 = 4;

/// Condition grade recorded at inspection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    New,
    LikeNew,
    Excellent,
    VeryGood,
    Good,
    Fair,
    Poor,
}

impl Condition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::New => "new",
            Condition::LikeNew => "like_new",
            Condition::Excellent => "excellent",
            Condition::VeryGood => "very_good",
            Condition::Good => "good",
            Condition::Fair => "fair",
            Condition::Poor => "poor",
        }
    }
}

impl core::str::FromStr for Condition {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Condition::New),
            "like_new" => Ok(Condition::LikeNew),
            "excellent" => Ok(Condition::Excellent),
            "very_good" => Ok(Condition::VeryGood),
            "good" => Ok(Condition::Good),
            "fair" => Ok(Condition::Fair),
            "poor" => Ok(Condition::Poor),
            other => Err(DomainError::validation(format!("unknown condition '{other}'"))),
        }
    }
}

/// A photographed angle (e.g. `front`, `serial`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoSlot {
    pub slot: String,
    pub url: String,
}

/// Semi-structured progress record stored on the product.
///
/// Unknown keys written by other tools are preserved in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<u8>,
    #[serde(default)]
    pub checklist: BTreeMap<String, JsonValue>,
    #[serde(default)]
    pub photo_slots: Vec<PhotoSlot>,
    #[serde(default)]
    pub inspection_completed: bool,
    #[serde(default)]
    pub photography_completed: bool,
    #[serde(default)]
    pub skip_photography: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl ProductMetadata {
    pub fn has_photos(&self) -> bool {
        self.photo_slots.iter().any(|p| !p.url.trim().is_empty())
    }
}

/// Read projection of the inspection sub-flow.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectionProgressView {
    pub product_id: ProductId,
    pub sku: String,
    pub status: ProductStatus,
    pub current_step: u8,
    /// `false` when `current_step` was derived from the status.
    pub step_recorded: bool,
    pub checklist: BTreeMap<String, JsonValue>,
    pub photo_slots: Vec<PhotoSlot>,
    pub inspection_completed: bool,
    pub photography_completed: bool,
    pub skip_photography: bool,
    pub condition: Option<Condition>,
    pub inspected_at: Option<DateTime<Utc>>,
    pub inspected_by: Option<UserId>,
}

/// Step implied by the coarse status when none was recorded.
pub fn fallback_step(status: ProductStatus) -> u8 {
    match status {
        ProductStatus::Inbound | ProductStatus::Inspection => STEP_CHECKLIST,
        _ => STEP_SHELVING,
    }
}
