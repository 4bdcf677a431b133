use async_trait::async_trait;

use depotflow_auth::Permission;
use depotflow_core::{DomainError, ListingId, ProductId};
use depotflow_sales::{Listing, ListingCommand};

use super::load_product;
use crate::dispatcher::{OpContext, Operation};
use crate::error::DispatchError;

/// Publish a product on a marketplace. One listing per (product, platform).
#[derive(Debug, Clone)]
pub struct CreateListing {
    pub product_id: ProductId,
    pub platform: String,
    pub price: Option<u64>,
}

#[async_trait]
impl Operation for CreateListing {
    type Output = Listing;

    fn name(&self) -> &'static str {
        "sales.create_listing"
    }

    fn permission(&self) -> Permission {
        Permission::ManageListings
    }

    async fn run(&self, ctx: &mut OpContext<'_>) -> Result<Listing, DispatchError> {
        let product = load_product(ctx.tx(), self.product_id).await?;
        let platform = self.platform.trim();
        let existing = ctx.tx().listings_for_product(product.id_typed()).await?;
        if existing.iter().any(|l| l.platform() == platform) {
            return Err(DomainError::conflict(format!(
                "product {} is already listed on {platform}",
                product.sku()
            ))
            .into());
        }

        let listing_id = ListingId::new();
        let mut listing = Listing::empty(listing_id);
        let now = ctx.now();
        ctx.create(
            &mut listing,
            &ListingCommand::CreateListing(depotflow_sales::CreateListing {
                listing_id,
                product_id: product.id_typed(),
                platform: platform.to_string(),
                price: self.price,
                occurred_at: now,
            }),
        )
        .await?;
        Ok(listing)
    }
}
