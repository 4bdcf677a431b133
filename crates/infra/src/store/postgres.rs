//! Postgres-backed fulfillment store.
//!
//! ## Error Mapping
//!
//! | SQLx error | PostgreSQL code | StoreError |
//! |---|---|---|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (serialization failure) | `40001` | `Conflict` |
//! | Database (deadlock detected) | `40P01` | `Conflict` |
//! | Database (other) | any other | `Backend` |
//! | PoolClosed / Io / other | n/a | `Backend` |
//!
//! Version-guarded updates that touch no row are reported as `Conflict`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgQueryResult, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use depotflow_core::{
    AggregateRoot, BundleId, ExpectedVersion, ListingId, LocationId, MovementId, OrderId,
    ProductId, ReturnId, ShipmentId, UserId,
};
use depotflow_events::{Activity, ActivityFilter, ActivityKind, ActivityPage, Pagination, SortOrder};
use depotflow_inventory::{InventoryMovement, Location, MovedBy};
use depotflow_products::{matches_sku_suffix, Product};
use depotflow_sales::{Listing, Order, ReturnRequest, ShippingStatus};
use depotflow_shipping::{Bundle, Shipment, ShipmentStatus};

use super::{FulfillmentStore, UnitOfWork};
use crate::error::StoreError;

const MIGRATION: &str = include_str!("../../migrations/0001_fulfillment.sql");

/// Postgres-backed store. Cheap to clone; shares one pool.
#[derive(Debug, Clone)]
pub struct PostgresFulfillmentStore {
    pool: Arc<PgPool>,
}

impl PostgresFulfillmentStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Apply the schema. Idempotent.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(MIGRATION)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }
}

#[async_trait]
impl FulfillmentStore for PostgresFulfillmentStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Box::new(PostgresUnitOfWork { tx }))
    }
}

struct PostgresUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("40001") | Some("40P01") => StoreError::Conflict(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|e| StoreError::Corrupt(format!("column {name}: {e}")))
}

fn decode<T: DeserializeOwned>(row: &PgRow, what: &str) -> Result<T, StoreError> {
    let data: JsonValue = column(row, "data")?;
    serde_json::from_value(data).map_err(|e| StoreError::Corrupt(format!("{what}: {e}")))
}

fn decode_all<T: DeserializeOwned>(rows: &[PgRow], what: &str) -> Result<Vec<T>, StoreError> {
    rows.iter().map(|row| decode(row, what)).collect()
}

fn encode<T: Serialize>(value: &T, what: &str) -> Result<JsonValue, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Backend(format!("encode {what}: {e}")))
}

fn expected_param(expected: ExpectedVersion) -> Option<i64> {
    match expected {
        ExpectedVersion::Any => None,
        ExpectedVersion::Exact(v) => Some(v as i64),
    }
}

fn expect_row(result: PgQueryResult, what: &str, expected: ExpectedVersion) -> Result<(), StoreError> {
    if result.rows_affected() == 0 {
        return Err(StoreError::Conflict(format!(
            "{what}: no row at expected version {expected:?}"
        )));
    }
    Ok(())
}

fn location_from_row(row: &PgRow) -> Result<Location, StoreError> {
    let capacity: Option<i32> = column(row, "capacity")?;
    Ok(Location {
        id: LocationId::from_uuid(column(row, "id")?),
        code: column(row, "code")?,
        zone: column(row, "zone")?,
        capacity: capacity.map(|c| c as u32),
        name: column(row, "name")?,
    })
}

fn movement_from_row(row: &PgRow) -> Result<InventoryMovement, StoreError> {
    let from: Option<Uuid> = column(row, "from_location_id")?;
    let user: Option<Uuid> = column(row, "moved_by_user_id")?;
    Ok(InventoryMovement {
        id: MovementId::from_uuid(column(row, "id")?),
        product_id: ProductId::from_uuid(column(row, "product_id")?),
        from_location_id: from.map(LocationId::from_uuid),
        to_location_id: LocationId::from_uuid(column(row, "to_location_id")?),
        moved_by: MovedBy {
            user_id: user.map(UserId::from_uuid),
            name: column(row, "moved_by_name")?,
        },
        notes: column(row, "notes")?,
        created_at: column(row, "created_at")?,
    })
}

fn activity_from_row(row: &PgRow) -> Result<Activity, StoreError> {
    let kind: String = column(row, "type")?;
    let user: Option<Uuid> = column(row, "user_id")?;
    let product: Option<Uuid> = column(row, "product_id")?;
    let order: Option<Uuid> = column(row, "order_id")?;
    Ok(Activity {
        id: depotflow_core::ActivityId::from_uuid(column(row, "id")?),
        kind: kind
            .parse::<ActivityKind>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        description: column(row, "description")?,
        user_id: user.map(UserId::from_uuid),
        product_id: product.map(ProductId::from_uuid),
        order_id: order.map(OrderId::from_uuid),
        metadata: column(row, "metadata")?,
        created_at: column(row, "created_at")?,
    })
}

const MOVEMENT_COLUMNS: &str = "id, product_id, from_location_id, to_location_id, \
     moved_by_user_id, moved_by_name, notes, created_at";

#[async_trait]
impl UnitOfWork for PostgresUnitOfWork {
    async fn product(&mut self, id: ProductId) -> Result<Option<Product>, StoreError> {
        let row = sqlx::query("SELECT data FROM products WHERE id = $1 FOR UPDATE")
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("load_product", e))?;
        row.as_ref().map(|r| decode(r, "product")).transpose()
    }

    async fn product_by_sku(&mut self, sku: &str) -> Result<Option<Product>, StoreError> {
        let row = sqlx::query("SELECT data FROM products WHERE sku = $1 FOR UPDATE")
            .bind(sku)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("load_product_by_sku", e))?;
        row.as_ref().map(|r| decode(r, "product")).transpose()
    }

    async fn products_by_sku_suffix(&mut self, suffix: &str) -> Result<Vec<Product>, StoreError> {
        let suffix = suffix.trim();
        if suffix.is_empty() {
            return Ok(vec![]);
        }
        let rows = sqlx::query("SELECT data FROM products WHERE sku LIKE '%' || $1 ORDER BY sku")
            .bind(suffix)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("load_products_by_sku_suffix", e))?;
        let products: Vec<Product> = decode_all(&rows, "product")?;
        Ok(products
            .into_iter()
            .filter(|p| matches_sku_suffix(p.sku(), suffix))
            .collect())
    }

    #[instrument(skip(self, product), fields(product_id = %product.id_typed()), err)]
    async fn insert_product(&mut self, product: &Product) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO products (id, sku, status, current_location_id, version, data)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(product.id_typed().as_uuid())
        .bind(product.sku())
        .bind(product.status().as_str())
        .bind(product.current_location_id().map(|l| *l.as_uuid()))
        .bind(product.version() as i64)
        .bind(encode(product, "product")?)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_product", e))?;
        Ok(())
    }

    #[instrument(skip(self, product), fields(product_id = %product.id_typed()), err)]
    async fn update_product(
        &mut self,
        product: &Product,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE products
            SET status = $2, current_location_id = $3, version = $4, data = $5, updated_at = now()
            WHERE id = $1 AND ($6::bigint IS NULL OR version = $6)
            "#,
        )
        .bind(product.id_typed().as_uuid())
        .bind(product.status().as_str())
        .bind(product.current_location_id().map(|l| *l.as_uuid()))
        .bind(product.version() as i64)
        .bind(encode(product, "product")?)
        .bind(expected_param(expected))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_product", e))?;
        expect_row(result, "product", expected)
    }

    async fn location(&mut self, id: LocationId) -> Result<Option<Location>, StoreError> {
        let row = sqlx::query("SELECT id, code, zone, capacity, name FROM locations WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("load_location", e))?;
        row.as_ref().map(location_from_row).transpose()
    }

    async fn location_by_code(&mut self, code: &str) -> Result<Option<Location>, StoreError> {
        let row = sqlx::query("SELECT id, code, zone, capacity, name FROM locations WHERE code = $1")
            .bind(code)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("load_location_by_code", e))?;
        row.as_ref().map(location_from_row).transpose()
    }

    async fn insert_location(&mut self, location: &Location) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO locations (id, code, zone, capacity, name) VALUES ($1, $2, $3, $4, $5)")
            .bind(location.id.as_uuid())
            .bind(&location.code)
            .bind(&location.zone)
            .bind(location.capacity.map(|c| c as i32))
            .bind(&location.name)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_location", e))?;
        Ok(())
    }

    async fn movement(&mut self, id: MovementId) -> Result<Option<InventoryMovement>, StoreError> {
        let sql = format!("SELECT {MOVEMENT_COLUMNS} FROM inventory_movements WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("load_movement", e))?;
        row.as_ref().map(movement_from_row).transpose()
    }

    async fn latest_movement(
        &mut self,
        product_id: ProductId,
    ) -> Result<Option<InventoryMovement>, StoreError> {
        let sql = format!(
            "SELECT {MOVEMENT_COLUMNS} FROM inventory_movements \
             WHERE product_id = $1 ORDER BY seq DESC LIMIT 1 FOR UPDATE"
        );
        let row = sqlx::query(&sql)
            .bind(product_id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("load_latest_movement", e))?;
        row.as_ref().map(movement_from_row).transpose()
    }

    async fn movements_for_product(
        &mut self,
        product_id: ProductId,
    ) -> Result<Vec<InventoryMovement>, StoreError> {
        let sql = format!(
            "SELECT {MOVEMENT_COLUMNS} FROM inventory_movements WHERE product_id = $1 ORDER BY seq ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(product_id.as_uuid())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("load_movements", e))?;
        rows.iter().map(movement_from_row).collect()
    }

    async fn insert_movement(&mut self, movement: &InventoryMovement) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO inventory_movements (
                id, product_id, from_location_id, to_location_id,
                moved_by_user_id, moved_by_name, notes, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(movement.id.as_uuid())
        .bind(movement.product_id.as_uuid())
        .bind(movement.from_location_id.map(|l| *l.as_uuid()))
        .bind(movement.to_location_id.as_uuid())
        .bind(movement.moved_by.user_id.map(|u| *u.as_uuid()))
        .bind(&movement.moved_by.name)
        .bind(&movement.notes)
        .bind(movement.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_movement", e))?;
        Ok(())
    }

    async fn delete_movement(&mut self, id: MovementId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM inventory_movements WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_movement", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!("movement {id} already deleted")));
        }
        Ok(())
    }

    async fn order(&mut self, id: OrderId) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query("SELECT data FROM orders WHERE id = $1 FOR UPDATE")
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("load_order", e))?;
        row.as_ref().map(|r| decode(r, "order")).transpose()
    }

    async fn orders_for_product(&mut self, product_id: ProductId) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT o.data FROM orders o
            JOIN order_items i ON i.order_id = o.id
            WHERE i.product_id = $1
            ORDER BY o.id
            "#,
        )
        .bind(product_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("load_orders_for_product", e))?;
        decode_all(&rows, "order")
    }

    #[instrument(skip(self, order), fields(order_id = %order.id_typed()), err)]
    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO orders (id, order_number, status, version, data) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(order.id_typed().as_uuid())
        .bind(order.order_number())
        .bind(order.status().as_str())
        .bind(order.version() as i64)
        .bind(encode(order, "order")?)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_order", e))?;

        for product_id in order.product_ids() {
            sqlx::query("INSERT INTO order_items (order_id, product_id) VALUES ($1, $2)")
                .bind(order.id_typed().as_uuid())
                .bind(product_id.as_uuid())
                .execute(&mut *self.tx)
                .await
                .map_err(|e| map_sqlx_error("insert_order_item", e))?;
        }
        Ok(())
    }

    #[instrument(skip(self, order), fields(order_id = %order.id_typed()), err)]
    async fn update_order(
        &mut self,
        order: &Order,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE orders SET status = $2, version = $3, data = $4
            WHERE id = $1 AND ($5::bigint IS NULL OR version = $5)
            "#,
        )
        .bind(order.id_typed().as_uuid())
        .bind(order.status().as_str())
        .bind(order.version() as i64)
        .bind(encode(order, "order")?)
        .bind(expected_param(expected))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_order", e))?;
        expect_row(result, "order", expected)
    }

    async fn listing(&mut self, id: ListingId) -> Result<Option<Listing>, StoreError> {
        let row = sqlx::query("SELECT data FROM listings WHERE id = $1 FOR UPDATE")
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("load_listing", e))?;
        row.as_ref().map(|r| decode(r, "listing")).transpose()
    }

    async fn listings_for_product(
        &mut self,
        product_id: ProductId,
    ) -> Result<Vec<Listing>, StoreError> {
        let rows = sqlx::query("SELECT data FROM listings WHERE product_id = $1 ORDER BY id FOR UPDATE")
            .bind(product_id.as_uuid())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("load_listings_for_product", e))?;
        decode_all(&rows, "listing")
    }

    async fn listings_by_shipping_status(
        &mut self,
        status: ShippingStatus,
        limit: Option<usize>,
    ) -> Result<Vec<Listing>, StoreError> {
        let order_by = match status {
            ShippingStatus::Delivered => "delivered_at DESC NULLS LAST, id DESC",
            _ => "shipped_at ASC NULLS LAST, id ASC",
        };
        let sql = format!(
            "SELECT data FROM listings WHERE shipping_status = $1 ORDER BY {order_by} LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(limit.map(|l| l as i64))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("load_listings_by_status", e))?;
        decode_all(&rows, "listing")
    }

    async fn insert_listing(&mut self, listing: &Listing) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO listings (id, product_id, platform, shipping_status, shipped_at, delivered_at, version, data)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(listing.id_typed().as_uuid())
        .bind(listing.product_id().as_uuid())
        .bind(listing.platform())
        .bind(listing.shipping_status().as_str())
        .bind(listing.shipped_at())
        .bind(listing.delivered_at())
        .bind(listing.version() as i64)
        .bind(encode(listing, "listing")?)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_listing", e))?;
        Ok(())
    }

    async fn update_listing(
        &mut self,
        listing: &Listing,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE listings
            SET shipping_status = $2, shipped_at = $3, delivered_at = $4, version = $5, data = $6
            WHERE id = $1 AND ($7::bigint IS NULL OR version = $7)
            "#,
        )
        .bind(listing.id_typed().as_uuid())
        .bind(listing.shipping_status().as_str())
        .bind(listing.shipped_at())
        .bind(listing.delivered_at())
        .bind(listing.version() as i64)
        .bind(encode(listing, "listing")?)
        .bind(expected_param(expected))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_listing", e))?;
        expect_row(result, "listing", expected)
    }

    async fn shipment(&mut self, id: ShipmentId) -> Result<Option<Shipment>, StoreError> {
        let row = sqlx::query("SELECT data FROM shipments WHERE id = $1 FOR UPDATE")
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("load_shipment", e))?;
        row.as_ref().map(|r| decode(r, "shipment")).transpose()
    }

    async fn shipments_for_order(
        &mut self,
        order_id: OrderId,
    ) -> Result<Vec<Shipment>, StoreError> {
        let rows = sqlx::query("SELECT data FROM shipments WHERE order_id = $1 ORDER BY id FOR UPDATE")
            .bind(order_id.as_uuid())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("load_shipments_for_order", e))?;
        decode_all(&rows, "shipment")
    }

    async fn shipments_for_product(
        &mut self,
        product_id: ProductId,
    ) -> Result<Vec<Shipment>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM shipments
            WHERE product_id = $1
               OR (bundle_id IS NULL AND notes LIKE '%' || $2 || '%')
            ORDER BY id
            "#,
        )
        .bind(product_id.as_uuid())
        .bind(product_id.to_string())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("load_shipments_for_product", e))?;
        let shipments: Vec<Shipment> = decode_all(&rows, "shipment")?;
        Ok(shipments
            .into_iter()
            .filter(|s| {
                s.product_id() == Some(product_id)
                    || s.legacy_bundle()
                        .is_some_and(|notes| notes.product_ids().contains(&product_id))
            })
            .collect())
    }

    async fn shipments_by_status(
        &mut self,
        statuses: &[ShipmentStatus],
    ) -> Result<Vec<Shipment>, StoreError> {
        let statuses: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        let rows = sqlx::query("SELECT data FROM shipments WHERE status = ANY($1) ORDER BY id")
            .bind(&statuses)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("load_shipments_by_status", e))?;
        decode_all(&rows, "shipment")
    }

    async fn shipments_in_bundle(
        &mut self,
        bundle_id: &BundleId,
    ) -> Result<Vec<Shipment>, StoreError> {
        let rows = sqlx::query("SELECT data FROM shipments WHERE bundle_id = $1 ORDER BY id FOR UPDATE")
            .bind(bundle_id.as_str())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("load_bundle_shipments", e))?;
        decode_all(&rows, "shipment")
    }

    async fn legacy_bundle_shipments(&mut self) -> Result<Vec<Shipment>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM shipments
            WHERE bundle_id IS NULL AND notes LIKE '%sales_bundle%'
            ORDER BY id
            FOR UPDATE
            "#,
        )
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("load_legacy_bundle_shipments", e))?;
        let shipments: Vec<Shipment> = decode_all(&rows, "shipment")?;
        Ok(shipments
            .into_iter()
            .filter(|s| s.legacy_bundle().is_some())
            .collect())
    }

    #[instrument(skip(self, shipment), fields(shipment_id = %shipment.id_typed()), err)]
    async fn insert_shipment(&mut self, shipment: &Shipment) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO shipments (id, order_id, product_id, bundle_id, status, notes, version, data)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(shipment.id_typed().as_uuid())
        .bind(shipment.order_id().map(|o| *o.as_uuid()))
        .bind(shipment.product_id().map(|p| *p.as_uuid()))
        .bind(shipment.bundle_id().map(|b| b.as_str().to_string()))
        .bind(shipment.status().as_str())
        .bind(shipment.notes())
        .bind(shipment.version() as i64)
        .bind(encode(shipment, "shipment")?)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_shipment", e))?;
        Ok(())
    }

    #[instrument(skip(self, shipment), fields(shipment_id = %shipment.id_typed()), err)]
    async fn update_shipment(
        &mut self,
        shipment: &Shipment,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE shipments
            SET bundle_id = $2, status = $3, notes = $4, version = $5, data = $6
            WHERE id = $1 AND ($7::bigint IS NULL OR version = $7)
            "#,
        )
        .bind(shipment.id_typed().as_uuid())
        .bind(shipment.bundle_id().map(|b| b.as_str().to_string()))
        .bind(shipment.status().as_str())
        .bind(shipment.notes())
        .bind(shipment.version() as i64)
        .bind(encode(shipment, "shipment")?)
        .bind(expected_param(expected))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_shipment", e))?;
        expect_row(result, "shipment", expected)
    }

    async fn bundle(&mut self, id: &BundleId) -> Result<Option<Bundle>, StoreError> {
        let row = sqlx::query("SELECT id, order_id, shipment_ids, created_at FROM bundles WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("load_bundle", e))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let bundle_id: String = column(&row, "id")?;
        let shipment_ids: Vec<Uuid> = column(&row, "shipment_ids")?;
        Ok(Some(Bundle {
            id: BundleId::new(bundle_id),
            order_id: OrderId::from_uuid(column(&row, "order_id")?),
            shipment_ids: shipment_ids.into_iter().map(ShipmentId::from_uuid).collect(),
            created_at: column(&row, "created_at")?,
        }))
    }

    async fn insert_bundle(&mut self, bundle: &Bundle) -> Result<(), StoreError> {
        let shipment_ids: Vec<Uuid> = bundle.shipment_ids.iter().map(|s| *s.as_uuid()).collect();
        sqlx::query("INSERT INTO bundles (id, order_id, shipment_ids, created_at) VALUES ($1, $2, $3, $4)")
            .bind(bundle.id.as_str())
            .bind(bundle.order_id.as_uuid())
            .bind(&shipment_ids)
            .bind(bundle.created_at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_bundle", e))?;
        Ok(())
    }

    async fn return_request(&mut self, id: ReturnId) -> Result<Option<ReturnRequest>, StoreError> {
        let row = sqlx::query("SELECT data FROM returns WHERE id = $1 FOR UPDATE")
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("load_return", e))?;
        row.as_ref().map(|r| decode(r, "return")).transpose()
    }

    async fn returns_for_product(
        &mut self,
        product_id: ProductId,
    ) -> Result<Vec<ReturnRequest>, StoreError> {
        let rows = sqlx::query("SELECT data FROM returns WHERE product_id = $1 ORDER BY id")
            .bind(product_id.as_uuid())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("load_returns_for_product", e))?;
        decode_all(&rows, "return")
    }

    async fn insert_return(&mut self, request: &ReturnRequest) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO returns (id, order_id, product_id, status, version, data) VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(request.id_typed().as_uuid())
        .bind(request.order_id().as_uuid())
        .bind(request.product_id().as_uuid())
        .bind(request.status().as_str())
        .bind(request.version() as i64)
        .bind(encode(request, "return")?)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_return", e))?;
        Ok(())
    }

    async fn update_return(
        &mut self,
        request: &ReturnRequest,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE returns SET status = $2, version = $3, data = $4
            WHERE id = $1 AND ($5::bigint IS NULL OR version = $5)
            "#,
        )
        .bind(request.id_typed().as_uuid())
        .bind(request.status().as_str())
        .bind(request.version() as i64)
        .bind(encode(request, "return")?)
        .bind(expected_param(expected))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_return", e))?;
        expect_row(result, "return", expected)
    }

    async fn insert_activity(&mut self, activity: &Activity) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO activities (id, type, description, user_id, product_id, order_id, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(activity.id.as_uuid())
        .bind(activity.kind.as_str())
        .bind(&activity.description)
        .bind(activity.user_id.map(|u| *u.as_uuid()))
        .bind(activity.product_id.map(|p| *p.as_uuid()))
        .bind(activity.order_id.map(|o| *o.as_uuid()))
        .bind(&activity.metadata)
        .bind(activity.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_activity", e))?;
        Ok(())
    }

    async fn activities(
        &mut self,
        filter: &ActivityFilter,
        pagination: Pagination,
        order: SortOrder,
    ) -> Result<ActivityPage, StoreError> {
        const WHERE: &str = r#"
            WHERE ($1::text IS NULL OR type = $1)
              AND ($2::uuid IS NULL OR user_id = $2)
              AND ($3::uuid IS NULL OR product_id = $3)
              AND ($4::uuid IS NULL OR order_id = $4)
              AND ($5::timestamptz IS NULL OR created_at >= $5)
              AND ($6::timestamptz IS NULL OR created_at <= $6)
        "#;
        let kind = filter.kind.map(|k| k.as_str());
        let user = filter.user_id.map(|u| *u.as_uuid());
        let product = filter.product_id.map(|p| *p.as_uuid());
        let order_id = filter.order_id.map(|o| *o.as_uuid());

        let count_sql = format!("SELECT COUNT(*) AS total FROM activities {WHERE}");
        let count_row = sqlx::query(&count_sql)
            .bind(kind)
            .bind(user)
            .bind(product)
            .bind(order_id)
            .bind(filter.from)
            .bind(filter.to)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("count_activities", e))?;
        let total: i64 = column(&count_row, "total")?;

        let direction = match order {
            SortOrder::NewestFirst => "DESC",
            SortOrder::OldestFirst => "ASC",
        };
        let page_sql = format!(
            "SELECT id, type, description, user_id, product_id, order_id, metadata, created_at \
             FROM activities {WHERE} ORDER BY created_at {direction}, id {direction} LIMIT $7 OFFSET $8"
        );
        let rows = sqlx::query(&page_sql)
            .bind(kind)
            .bind(user)
            .bind(product)
            .bind(order_id)
            .bind(filter.from)
            .bind(filter.to)
            .bind(pagination.per_page as i64)
            .bind(pagination.offset() as i64)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("query_activities", e))?;

        Ok(ActivityPage {
            items: rows.iter().map(activity_from_row).collect::<Result<_, _>>()?,
            total: total as u64,
            page: pagination.page,
            per_page: pagination.per_page,
        })
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}
