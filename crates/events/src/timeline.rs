//! Merged per-product timeline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};

use crate::Activity;

/// Source of a timeline entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineKind {
    Activity,
    Movement,
    OrderPlaced,
    OrderShipped,
    OrderDelivered,
    Shipment,
}

impl TimelineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimelineKind::Activity => "activity",
            TimelineKind::Movement => "movement",
            TimelineKind::OrderPlaced => "order_placed",
            TimelineKind::OrderShipped => "order_shipped",
            TimelineKind::OrderDelivered => "order_delivered",
            TimelineKind::Shipment => "shipment",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    pub kind: TimelineKind,
    pub entity_id: String,
    pub occurred_at: DateTime<Utc>,
    pub title: String,
    pub detail: JsonValue,
}

impl TimelineEntry {
    pub fn new(
        kind: TimelineKind,
        entity_id: impl core::fmt::Display,
        occurred_at: DateTime<Utc>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            entity_id: entity_id.to_string(),
            occurred_at,
            title: title.into(),
            detail: JsonValue::Null,
        }
    }

    pub fn with_detail(mut self, detail: JsonValue) -> Self {
        self.detail = detail;
        self
    }

    /// Stable identity of the entry, e.g. `movement-0190…`.
    pub fn key(&self) -> String {
        format!("{}-{}", self.kind.as_str(), self.entity_id)
    }
}

impl From<&Activity> for TimelineEntry {
    fn from(a: &Activity) -> Self {
        TimelineEntry::new(TimelineKind::Activity, a.id, a.created_at, a.description.clone())
            .with_detail(json!({
                "type": a.kind,
                "userId": a.user_id,
                "metadata": a.metadata,
            }))
    }
}

/// Merge entries from several sources into one chronological sequence.
///
/// Entries are keyed by `(kind, entity_id)`; when a key appears twice the
/// first occurrence wins. Output is oldest first, ties ordered by key.
pub fn merge_timeline<I>(sources: I) -> Vec<TimelineEntry>
where
    I: IntoIterator<Item = Vec<TimelineEntry>>,
{
    let mut by_key: BTreeMap<(TimelineKind, String), TimelineEntry> = BTreeMap::new();
    for entry in sources.into_iter().flatten() {
        by_key
            .entry((entry.kind, entry.entity_id.clone()))
            .or_insert(entry);
    }

    let mut merged: Vec<TimelineEntry> = by_key.into_values().collect();
    merged.sort_by(|a, b| {
        a.occurred_at
            .cmp(&b.occurred_at)
            .then_with(|| (a.kind, &a.entity_id).cmp(&(b.kind, &b.entity_id)))
    });
    merged
}
