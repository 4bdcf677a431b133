//! `depotflow-auth`: pure authorization boundary.
//!
//! Identity is supplied by an external provider; this crate only decides
//! whether an already-authenticated principal may perform an operation.

pub mod authorize;
pub mod permissions;
pub mod principal;
pub mod roles;

pub use authorize::{authorize, AuthzError};
pub use permissions::Permission;
pub use principal::Principal;
pub use roles::Role;
