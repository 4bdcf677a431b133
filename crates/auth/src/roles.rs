use serde::{Deserialize, Serialize};

/// Role attached to every actor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Seller,
    Staff,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Seller => "seller",
            Role::Staff => "staff",
            Role::Admin => "admin",
        }
    }

    /// Staff and admins operate the warehouse floor.
    pub fn is_operator(&self) -> bool {
        matches!(self, Role::Staff | Role::Admin)
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for Role {
    type Err = depotflow_core::DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "seller" => Ok(Role::Seller),
            "staff" => Ok(Role::Staff),
            "admin" => Ok(Role::Admin),
            other => Err(depotflow_core::DomainError::validation(format!(
                "unknown role '{other}'"
            ))),
        }
    }
}
