//! `depotflow-inventory`: location ledger domain.
//!
//! Storage slots, the append-only movement log, and the rules that keep the
//! per-product current-location cache consistent with it.

pub mod ledger;
pub mod location;

pub use ledger::{
    check_undo, plan_move, replay_location, verify_chain, InventoryMovement, LedgerEvent,
    LocationRegistered, MoveRequest, MovedBy, MovementReverted, ProductMoved,
};
pub use location::{Location, NewLocation};
