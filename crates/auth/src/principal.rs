use serde::{Deserialize, Serialize};

use depotflow_core::UserId;

use crate::Role;

/// The actor performing an operation.
///
/// `user_id` is `None` for the system actor (scheduled jobs), which is
/// recorded as an absent user in the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: Option<UserId>,
    pub name: String,
    pub role: Role,
}

impl Principal {
    pub fn user(user_id: UserId, name: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: Some(user_id),
            name: name.into(),
            role,
        }
    }

    /// Actor used by background reconciliation.
    pub fn system() -> Self {
        Self {
            user_id: None,
            name: "system".to_string(),
            role: Role::Admin,
        }
    }

    pub fn is_system(&self) -> bool {
        self.user_id.is_none()
    }
}
