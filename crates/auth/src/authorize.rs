use thiserror::Error;

use crate::{Permission, Principal};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("forbidden: role '{role}' lacks permission '{permission}'")]
    Forbidden {
        role: &'static str,
        permission: &'static str,
    },
}

/// Authorize a principal for one operation.
///
/// - No IO
/// - No panics
/// - No business logic (pure policy check)
pub fn authorize(principal: &Principal, required: Permission) -> Result<(), AuthzError> {
    if required.is_granted_to(principal.role) {
        Ok(())
    } else {
        Err(AuthzError::Forbidden {
            role: principal.role.as_str(),
            permission: required.as_str(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Role;
    use depotflow_core::UserId;

    fn actor(role: Role) -> Principal {
        Principal::user(UserId::new(), "tester", role)
    }

    #[test]
    fn undo_is_admin_only() {
        assert!(authorize(&actor(Role::Admin), Permission::UndoMovement).is_ok());
        let err = authorize(&actor(Role::Staff), Permission::UndoMovement).unwrap_err();
        assert_eq!(
            err,
            AuthzError::Forbidden {
                role: "staff",
                permission: "inventory.undo"
            }
        );
    }

    #[test]
    fn sellers_may_register_and_list_but_not_move() {
        let seller = actor(Role::Seller);
        assert!(authorize(&seller, Permission::RegisterProduct).is_ok());
        assert!(authorize(&seller, Permission::ManageListings).is_ok());
        assert!(authorize(&seller, Permission::MoveInventory).is_err());
        assert!(authorize(&seller, Permission::AdvanceShipment).is_err());
    }

    #[test]
    fn staff_operate_the_floor() {
        let staff = actor(Role::Staff);
        for perm in [
            Permission::MoveInventory,
            Permission::AdvanceShipment,
            Permission::RecordInspection,
            Permission::ManageReturns,
        ] {
            assert!(authorize(&staff, perm).is_ok(), "{perm}");
        }
    }

    #[test]
    fn system_actor_has_no_user() {
        let system = Principal::system();
        assert!(system.is_system());
        assert!(authorize(&system, Permission::AdvanceShipment).is_ok());
    }

    #[test]
    fn roles_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Admin).unwrap(), "\"admin\"");
        assert_eq!("staff".parse::<Role>().unwrap(), Role::Staff);
    }
}
