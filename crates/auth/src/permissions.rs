use crate::Role;

/// Operation-level permission.
///
/// Each mutating operation of the back office declares exactly one of these;
/// the role mapping below is the whole policy.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Permission {
    RegisterProduct,
    TransitionProduct,
    RecordInspection,
    MoveInventory,
    UndoMovement,
    ManageLocations,
    ManageOrders,
    ManageListings,
    CreateShipment,
    AdvanceShipment,
    ManageReturns,
    ViewActivity,
}

impl Permission {
    /// Dotted name used in logs and error messages (e.g. `inventory.move`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::RegisterProduct => "products.register",
            Permission::TransitionProduct => "products.transition",
            Permission::RecordInspection => "products.inspect",
            Permission::MoveInventory => "inventory.move",
            Permission::UndoMovement => "inventory.undo",
            Permission::ManageLocations => "inventory.locations",
            Permission::ManageOrders => "sales.orders",
            Permission::ManageListings => "sales.listings",
            Permission::CreateShipment => "shipping.create",
            Permission::AdvanceShipment => "shipping.advance",
            Permission::ManageReturns => "sales.returns",
            Permission::ViewActivity => "audit.read",
        }
    }

    pub fn allowed_roles(&self) -> &'static [Role] {
        match self {
            Permission::UndoMovement => &[Role::Admin],
            Permission::RegisterProduct | Permission::ManageListings => {
                &[Role::Seller, Role::Staff, Role::Admin]
            }
            _ => &[Role::Staff, Role::Admin],
        }
    }

    pub fn is_granted_to(&self, role: Role) -> bool {
        self.allowed_roles().contains(&role)
    }
}

impl core::fmt::Display for Permission {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
