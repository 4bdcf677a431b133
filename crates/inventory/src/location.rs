use serde::{Deserialize, Serialize};

use depotflow_core::{DomainError, Entity, LocationId};

/// A storage slot. Read-mostly; referenced by products and movements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub id: LocationId,
    /// Unique human code, e.g. `A-01-03`.
    pub code: String,
    pub zone: String,
    pub capacity: Option<u32>,
    pub name: Option<String>,
}

/// Input for registering a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLocation {
    pub code: String,
    pub zone: String,
    pub capacity: Option<u32>,
    pub name: Option<String>,
}

impl Location {
    pub fn register(input: NewLocation) -> Result<Self, DomainError> {
        let code = input.code.trim();
        if code.is_empty() {
            return Err(DomainError::validation("location code must not be empty"));
        }
        if input.zone.trim().is_empty() {
            return Err(DomainError::validation("location zone must not be empty"));
        }
        if input.capacity == Some(0) {
            return Err(DomainError::validation("location capacity must be positive"));
        }

        Ok(Self {
            id: LocationId::new(),
            code: code.to_string(),
            zone: input.zone.trim().to_string(),
            capacity: input.capacity,
            name: input.name,
        })
    }
}

impl Entity for Location {
    type Id = LocationId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
