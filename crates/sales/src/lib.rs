//! `depotflow-sales`: buyer orders, marketplace listings and returns.

pub mod listing;
pub mod order;
pub mod returns;

pub use listing::{CreateListing, Listing, ListingCommand, ListingEvent, ShippingStatus};
pub use order::{
    MarkShipped, NewOrderItem, Order, OrderCommand, OrderEvent, OrderItem, OrderStatus,
    PlaceOrder,
};
pub use returns::{RequestReturn, ReturnCommand, ReturnEvent, ReturnRequest, ReturnStatus};
