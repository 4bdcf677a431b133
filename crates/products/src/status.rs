use serde::{Deserialize, Serialize};

use depotflow_core::DomainError;

/// Coarse lifecycle state of a physical product.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    Inbound,
    Inspection,
    Storage,
    Listing,
    Ordered,
    Workstation,
    Shipping,
    Sold,
    Delivered,
    Returned,
}

impl ProductStatus {
    pub const ALL: [ProductStatus; 10] = [
        ProductStatus::Inbound,
        ProductStatus::Inspection,
        ProductStatus::Storage,
        ProductStatus::Listing,
        ProductStatus::Ordered,
        ProductStatus::Workstation,
        ProductStatus::Shipping,
        ProductStatus::Sold,
        ProductStatus::Delivered,
        ProductStatus::Returned,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProductStatus::Inbound => "inbound",
            ProductStatus::Inspection => "inspection",
            ProductStatus::Storage => "storage",
            ProductStatus::Listing => "listing",
            ProductStatus::Ordered => "ordered",
            ProductStatus::Workstation => "workstation",
            ProductStatus::Shipping => "shipping",
            ProductStatus::Sold => "sold",
            ProductStatus::Delivered => "delivered",
            ProductStatus::Returned => "returned",
        }
    }

    /// Forward successors in the main chain.
    ///
    /// `returned` is deliberately absent: it is only reachable through an
    /// approved return.
    pub fn successors(&self) -> &'static [ProductStatus] {
        match self {
            ProductStatus::Inbound => &[ProductStatus::Inspection],
            ProductStatus::Inspection => &[ProductStatus::Storage],
            ProductStatus::Storage => &[ProductStatus::Listing],
            ProductStatus::Listing => &[ProductStatus::Ordered],
            ProductStatus::Ordered => &[ProductStatus::Workstation],
            ProductStatus::Workstation => &[ProductStatus::Shipping],
            ProductStatus::Shipping => &[ProductStatus::Sold, ProductStatus::Delivered],
            ProductStatus::Sold | ProductStatus::Delivered | ProductStatus::Returned => &[],
        }
    }

    pub fn can_transition_to(&self, target: ProductStatus) -> bool {
        self.successors().contains(&target)
    }

    /// States from which an order has claimed the product.
    pub fn is_post_order(&self) -> bool {
        matches!(
            self,
            ProductStatus::Ordered
                | ProductStatus::Workstation
                | ProductStatus::Shipping
                | ProductStatus::Sold
                | ProductStatus::Delivered
        )
    }

    /// States written only by order placement and shipment synchronization.
    pub fn is_order_driven(&self) -> bool {
        matches!(
            self,
            ProductStatus::Ordered
                | ProductStatus::Shipping
                | ProductStatus::Sold
                | ProductStatus::Delivered
        )
    }

    /// States a returned product may be restocked into.
    pub fn is_restock_target(&self) -> bool {
        matches!(
            self,
            ProductStatus::Inspection | ProductStatus::Storage | ProductStatus::Listing
        )
    }
}

impl core::fmt::Display for ProductStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for ProductStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProductStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown product status '{s}'")))
    }
}
