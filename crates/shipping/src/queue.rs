//! Staff-facing queue labels. Presentation only; never used for validation.

use serde::{Deserialize, Serialize};

use depotflow_core::DomainError;

use crate::ShipmentStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaffQueue {
    Workstation,
    Packed,
    Shipped,
    ReadyForPickup,
}

impl StaffQueue {
    pub const ALL: [StaffQueue; 4] = [
        StaffQueue::Workstation,
        StaffQueue::Packed,
        StaffQueue::Shipped,
        StaffQueue::ReadyForPickup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StaffQueue::Workstation => "workstation",
            StaffQueue::Packed => "packed",
            StaffQueue::Shipped => "shipped",
            StaffQueue::ReadyForPickup => "ready_for_pickup",
        }
    }

    pub fn for_status(status: ShipmentStatus) -> Self {
        match status {
            ShipmentStatus::Pending | ShipmentStatus::Picked => StaffQueue::Workstation,
            ShipmentStatus::Packed => StaffQueue::Packed,
            ShipmentStatus::Shipped => StaffQueue::Shipped,
            ShipmentStatus::Delivered => StaffQueue::ReadyForPickup,
        }
    }

    /// Stored statuses shown in this queue.
    pub fn statuses(&self) -> &'static [ShipmentStatus] {
        match self {
            StaffQueue::Workstation => &[ShipmentStatus::Pending, ShipmentStatus::Picked],
            StaffQueue::Packed => &[ShipmentStatus::Packed],
            StaffQueue::Shipped => &[ShipmentStatus::Shipped],
            StaffQueue::ReadyForPickup => &[ShipmentStatus::Delivered],
        }
    }
}

impl core::fmt::Display for StaffQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for StaffQueue {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StaffQueue::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown staff queue '{s}'")))
    }
}
