//! Integration tests for the full operation pipeline.
//!
//! Tests: Operation → Dispatcher → UnitOfWork → Synchronizer → activity log
//!
//! Verifies:
//! - Ledger moves and undos keep the cached location in step with the ledger
//! - Bundle members never observably diverge
//! - Shipment milestones reach orders, listings and products atomically
//! - A failed audit write rolls the whole operation back
//! - Reconciliation isolates per-item failures

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::watch;

    use depotflow_auth::{Principal, Role};
    use depotflow_core::{
        BundleId, DomainError, ExpectedVersion, ListingId, LocationId, OrderId, ProductId,
        ShipmentId, UserId,
    };
    use depotflow_events::{ActivityFilter, ActivityKind, Pagination, SortOrder, TimelineKind};
    use depotflow_inventory::{InventoryMovement, Location};
    use depotflow_products::{Product, ProductStatus};
    use depotflow_sales::{Listing, NewOrderItem, Order, OrderStatus, ReturnStatus, ShippingStatus};
    use depotflow_shipping::{
        BundleMembership, BundleNotes, Shipment, ShipmentCommand, ShipmentStatus, StaffQueue,
    };

    use crate::carrier::fake::{Script, ScriptedCarrier};
    use crate::carrier::DeliveryStatus;
    use crate::dispatcher::Dispatcher;
    use crate::error::{CarrierError, DispatchError, StoreError};
    use crate::operations::*;
    use crate::queries::FulfillmentQueries;
    use crate::reconcile::{DeliveryReconciler, FailureKind};
    use crate::store::{FulfillmentStore, InMemoryFulfillmentStore, UnitOfWork};

    type TestDispatcher = Dispatcher<InMemoryFulfillmentStore>;

    fn staff() -> Principal {
        Principal::user(UserId::new(), "Sam Staff", Role::Staff)
    }

    fn admin() -> Principal {
        Principal::user(UserId::new(), "Ada Admin", Role::Admin)
    }

    fn seller() -> Principal {
        Principal::user(UserId::new(), "Sol Seller", Role::Seller)
    }

    fn setup() -> (InMemoryFulfillmentStore, TestDispatcher) {
        let store = InMemoryFulfillmentStore::new();
        let dispatcher = Dispatcher::new(store.clone());
        (store, dispatcher)
    }

    async fn location(d: &TestDispatcher, code: &str) -> Location {
        d.dispatch(
            &admin(),
            &RegisterLocation {
                code: code.to_string(),
                zone: "A".to_string(),
                capacity: Some(10),
                name: None,
            },
        )
        .await
        .unwrap()
    }

    async fn register(d: &TestDispatcher, sku: &str, declared_value: u64) -> Product {
        d.dispatch(
            &seller(),
            &RegisterProduct {
                sku: sku.to_string(),
                category: "camera".to_string(),
                name: Some(format!("Item {sku}")),
                declared_value,
            },
        )
        .await
        .unwrap()
    }

    async fn transition(d: &TestDispatcher, product_id: ProductId, target: ProductStatus) {
        d.dispatch(
            &staff(),
            &TransitionProduct {
                product_id,
                target,
                reason: None,
            },
        )
        .await
        .unwrap();
    }

    /// Registered, inspected, stored and listed on one platform.
    async fn listed(d: &TestDispatcher, sku: &str) -> (ProductId, ListingId) {
        let product_id = register(d, sku, 10_000).await.id_typed();
        transition(d, product_id, ProductStatus::Inspection).await;
        d.dispatch(
            &staff(),
            &RecordInspection {
                product_id,
                step: 4,
                skip_photography: Some(true),
                ..RecordInspection::default()
            },
        )
        .await
        .unwrap();
        transition(d, product_id, ProductStatus::Storage).await;
        transition(d, product_id, ProductStatus::Listing).await;
        let listing = d
            .dispatch(
                &seller(),
                &CreateListing {
                    product_id,
                    platform: "ebay".to_string(),
                    price: Some(12_000),
                },
            )
            .await
            .unwrap();
        (product_id, listing.id_typed())
    }

    async fn confirmed_order(d: &TestDispatcher, number: &str, products: &[ProductId]) -> OrderId {
        let order = d
            .dispatch(
                &staff(),
                &PlaceOrder {
                    order_number: number.to_string(),
                    customer_id: "cust-1".to_string(),
                    items: products
                        .iter()
                        .map(|product_id| NewOrderItem {
                            product_id: *product_id,
                            quantity: 1,
                            unit_price: 12_000,
                        })
                        .collect(),
                },
            )
            .await
            .unwrap();
        d.dispatch(&staff(), &ConfirmOrder { order_id: order.id_typed() })
            .await
            .unwrap();
        order.id_typed()
    }

    async fn ship(
        d: &TestDispatcher,
        order_id: OrderId,
        products: &[ProductId],
        tracking_number: Option<&str>,
    ) -> Vec<Shipment> {
        d.dispatch(
            &staff(),
            &CreateShipment {
                order_id,
                product_ids: products.to_vec(),
                carrier: Some("ups".to_string()),
                tracking_number: tracking_number.map(str::to_string),
                ..CreateShipment::default()
            },
        )
        .await
        .unwrap()
    }

    async fn advance(
        d: &TestDispatcher,
        shipment_id: ShipmentId,
        target: ShipmentStatus,
    ) -> Result<Vec<Shipment>, DispatchError> {
        d.dispatch(&staff(), &AdvanceShipment { shipment_id, target })
            .await
    }

    async fn advance_to_shipped(d: &TestDispatcher, shipment_id: ShipmentId) {
        for target in [ShipmentStatus::Picked, ShipmentStatus::Packed, ShipmentStatus::Shipped] {
            advance(d, shipment_id, target).await.unwrap();
        }
    }

    async fn get_product(store: &InMemoryFulfillmentStore, id: ProductId) -> Product {
        let mut tx = store.begin().await.unwrap();
        let product = tx.product(id).await.unwrap().unwrap();
        tx.rollback().await.unwrap();
        product
    }

    async fn get_order(store: &InMemoryFulfillmentStore, id: OrderId) -> Order {
        let mut tx = store.begin().await.unwrap();
        let order = tx.order(id).await.unwrap().unwrap();
        tx.rollback().await.unwrap();
        order
    }

    async fn get_listing(store: &InMemoryFulfillmentStore, id: ListingId) -> Listing {
        let mut tx = store.begin().await.unwrap();
        let listing = tx.listing(id).await.unwrap().unwrap();
        tx.rollback().await.unwrap();
        listing
    }

    async fn get_shipment(store: &InMemoryFulfillmentStore, id: ShipmentId) -> Shipment {
        let mut tx = store.begin().await.unwrap();
        let shipment = tx.shipment(id).await.unwrap().unwrap();
        tx.rollback().await.unwrap();
        shipment
    }

    async fn movements(store: &InMemoryFulfillmentStore, id: ProductId) -> Vec<InventoryMovement> {
        let mut tx = store.begin().await.unwrap();
        let movements = tx.movements_for_product(id).await.unwrap();
        tx.rollback().await.unwrap();
        movements
    }

    async fn activity_count(store: &InMemoryFulfillmentStore) -> u64 {
        let mut tx = store.begin().await.unwrap();
        let page = tx
            .activities(
                &ActivityFilter::default(),
                Pagination::default(),
                SortOrder::NewestFirst,
            )
            .await
            .unwrap();
        tx.rollback().await.unwrap();
        page.total
    }

    fn domain_error(err: DispatchError) -> DomainError {
        match err {
            DispatchError::Domain(e) => e,
            other => panic!("Expected a domain error, got {other:?}"),
        }
    }

    // ----- Location Ledger -----

    #[tokio::test]
    async fn move_then_undo_restores_the_empty_location() {
        let (store, d) = setup();
        let loc = location(&d, "LOC-A01").await;
        let product = register(&d, "CAM-001", 1_000).await;
        assert_eq!(product.current_location_id(), None);

        let movement = d
            .dispatch(
                &staff(),
                &MoveProduct {
                    product_id: product.id_typed(),
                    to_location_id: loc.id,
                    notes: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(movement.from_location_id, None);
        assert_eq!(movement.to_location_id, loc.id);
        assert_eq!(
            get_product(&store, product.id_typed()).await.current_location_id(),
            Some(loc.id)
        );
        assert_eq!(movements(&store, product.id_typed()).await.len(), 1);

        d.dispatch(&admin(), &UndoMovement { movement_id: movement.id })
            .await
            .unwrap();
        assert_eq!(
            get_product(&store, product.id_typed()).await.current_location_id(),
            None
        );
        assert!(movements(&store, product.id_typed()).await.is_empty());
    }

    #[tokio::test]
    async fn undo_of_an_older_movement_is_rejected_and_changes_nothing() {
        let (store, d) = setup();
        let a = location(&d, "LOC-A01").await;
        let b = location(&d, "LOC-B01").await;
        let product_id = register(&d, "CAM-002", 1_000).await.id_typed();

        let first = d
            .dispatch(
                &staff(),
                &MoveProduct {
                    product_id,
                    to_location_id: a.id,
                    notes: None,
                },
            )
            .await
            .unwrap();
        d.dispatch(
            &staff(),
            &MoveProduct {
                product_id,
                to_location_id: b.id,
                notes: Some("rebalancing".to_string()),
            },
        )
        .await
        .unwrap();

        let err = d
            .dispatch(&admin(), &UndoMovement { movement_id: first.id })
            .await
            .unwrap_err();
        match domain_error(err) {
            DomainError::NotLatest(_) => {}
            other => panic!("Expected NotLatest, got {other:?}"),
        }
        assert_eq!(
            get_product(&store, product_id).await.current_location_id(),
            Some(b.id)
        );
        assert_eq!(movements(&store, product_id).await.len(), 2);
    }

    #[tokio::test]
    async fn undoing_the_same_movement_twice_fails_the_second_time() {
        let (store, d) = setup();
        let a = location(&d, "LOC-A01").await;
        let b = location(&d, "LOC-B01").await;
        let product_id = register(&d, "CAM-003", 1_000).await.id_typed();
        for to in [a.id, b.id] {
            d.dispatch(
                &staff(),
                &MoveProduct {
                    product_id,
                    to_location_id: to,
                    notes: None,
                },
            )
            .await
            .unwrap();
        }
        let latest = movements(&store, product_id).await.pop().unwrap();

        let (ada, alex) = (admin(), admin());
        let undo = UndoMovement { movement_id: latest.id };
        let (first, second) = tokio::join!(d.dispatch(&ada, &undo), d.dispatch(&alex, &undo));
        assert!(first.is_ok() != second.is_ok());
        assert_eq!(
            get_product(&store, product_id).await.current_location_id(),
            Some(a.id)
        );
    }

    #[tokio::test]
    async fn moves_to_the_same_or_an_unknown_slot_are_rejected() {
        let (_, d) = setup();
        let a = location(&d, "LOC-A01").await;
        let product_id = register(&d, "CAM-004", 1_000).await.id_typed();
        let mv = |to: LocationId| MoveProduct {
            product_id,
            to_location_id: to,
            notes: None,
        };
        d.dispatch(&staff(), &mv(a.id)).await.unwrap();

        let err = d.dispatch(&staff(), &mv(a.id)).await.unwrap_err();
        assert_eq!(domain_error(err), DomainError::SameLocation);

        let err = d.dispatch(&staff(), &mv(LocationId::new())).await.unwrap_err();
        match domain_error(err) {
            DomainError::LocationNotFound(_) => {}
            other => panic!("Expected LocationNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_location_codes_and_skus_conflict() {
        let (_, d) = setup();
        location(&d, "LOC-A01").await;
        let err = d
            .dispatch(
                &admin(),
                &RegisterLocation {
                    code: "LOC-A01".to_string(),
                    zone: "B".to_string(),
                    capacity: None,
                    name: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(domain_error(err), DomainError::Conflict(_)));

        register(&d, "CAM-005", 1).await;
        let err = d
            .dispatch(
                &seller(),
                &RegisterProduct {
                    sku: "CAM-005".to_string(),
                    category: "camera".to_string(),
                    name: None,
                    declared_value: 1,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(domain_error(err), DomainError::Conflict(_)));
    }

    // ----- Role gating -----

    #[tokio::test]
    async fn roles_gate_operations_before_any_io() {
        let (store, d) = setup();
        let loc = location(&d, "LOC-A01").await;
        let product_id = register(&d, "CAM-006", 1_000).await.id_typed();
        let before = activity_count(&store).await;

        let err = d
            .dispatch(
                &seller(),
                &MoveProduct {
                    product_id,
                    to_location_id: loc.id,
                    notes: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Forbidden(_)));

        let movement = d
            .dispatch(
                &staff(),
                &MoveProduct {
                    product_id,
                    to_location_id: loc.id,
                    notes: None,
                },
            )
            .await
            .unwrap();
        let err = d
            .dispatch(&staff(), &UndoMovement { movement_id: movement.id })
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Forbidden(_)));

        // Only the successful move left a trace.
        assert_eq!(activity_count(&store).await, before + 1);
    }

    // ----- Product lifecycle -----

    #[tokio::test]
    async fn storage_requires_a_completed_inspection() {
        let (store, d) = setup();
        let product_id = register(&d, "CAM-007", 1_000).await.id_typed();
        transition(&d, product_id, ProductStatus::Inspection).await;

        let err = d
            .dispatch(
                &staff(),
                &TransitionProduct {
                    product_id,
                    target: ProductStatus::Storage,
                    reason: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(domain_error(err), DomainError::InvalidTransition(_)));
        assert_eq!(get_product(&store, product_id).await.status(), ProductStatus::Inspection);

        let inspector = staff();
        let product = d
            .dispatch(
                &inspector,
                &RecordInspection {
                    product_id,
                    step: 4,
                    skip_photography: Some(true),
                    ..RecordInspection::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(product.inspected_by(), inspector.user_id);
        transition(&d, product_id, ProductStatus::Storage).await;
    }

    #[tokio::test]
    async fn order_driven_statuses_cannot_be_set_by_hand() {
        let (store, d) = setup();
        let (unsold, _) = listed(&d, "CAM-014").await;
        let (p1, l1) = listed(&d, "CAM-015").await;
        let order_id = confirmed_order(&d, "ORD-15", &[p1]).await;

        let manual = |product_id: ProductId, target: ProductStatus| TransitionProduct {
            product_id,
            target,
            reason: None,
        };
        let err = d
            .dispatch(&staff(), &manual(unsold, ProductStatus::Ordered))
            .await
            .unwrap_err();
        assert!(matches!(domain_error(err), DomainError::InvalidTransition(_)));
        assert_eq!(get_product(&store, unsold).await.status(), ProductStatus::Listing);

        // Moving to the workstation stays a staff step.
        transition(&d, p1, ProductStatus::Workstation).await;
        for target in [
            ProductStatus::Shipping,
            ProductStatus::Sold,
            ProductStatus::Delivered,
        ] {
            let err = d.dispatch(&admin(), &manual(p1, target)).await.unwrap_err();
            match domain_error(err) {
                DomainError::InvalidTransition(_) => {}
                other => panic!("Expected InvalidTransition, got {other:?}"),
            }
        }
        assert_eq!(get_product(&store, p1).await.status(), ProductStatus::Workstation);
        assert_eq!(get_order(&store, order_id).await.status(), OrderStatus::Confirmed);
        assert_eq!(
            get_listing(&store, l1).await.shipping_status(),
            ShippingStatus::NotShipped
        );
    }

    #[tokio::test]
    async fn inspection_progress_view_falls_back_to_status() {
        let (store, d) = setup();
        let queries = FulfillmentQueries::new(store.clone());
        let product_id = register(&d, "CAM-008", 1_000).await.id_typed();
        transition(&d, product_id, ProductStatus::Inspection).await;

        let view = queries.inspection_progress(product_id).await.unwrap();
        assert_eq!(view.current_step, 1);
        assert!(!view.step_recorded);

        d.dispatch(
            &staff(),
            &RecordInspection {
                product_id,
                step: 2,
                ..RecordInspection::default()
            },
        )
        .await
        .unwrap();
        let view = queries.inspection_progress(product_id).await.unwrap();
        assert_eq!(view.current_step, 2);
        assert!(view.step_recorded);

        let err = d
            .dispatch(
                &staff(),
                &RecordInspection {
                    product_id,
                    step: 1,
                    ..RecordInspection::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(domain_error(err), DomainError::InvalidTransition(_)));
    }

    // ----- Orders -----

    #[tokio::test]
    async fn placing_and_cancelling_an_order_reserves_and_releases_products() {
        let (store, d) = setup();
        let (p1, _) = listed(&d, "CAM-010").await;
        let (p2, _) = listed(&d, "CAM-011").await;

        let order_id = confirmed_order(&d, "ORD-10", &[p1, p2]).await;
        assert_eq!(get_product(&store, p1).await.status(), ProductStatus::Ordered);
        assert_eq!(get_product(&store, p2).await.status(), ProductStatus::Ordered);

        let err = d
            .dispatch(
                &staff(),
                &CancelOrder {
                    order_id,
                    reason: " ".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(domain_error(err), DomainError::Validation(_)));

        let order = d
            .dispatch(
                &staff(),
                &CancelOrder {
                    order_id,
                    reason: "customer changed mind".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(order.status(), OrderStatus::Cancelled);
        assert_eq!(get_product(&store, p1).await.status(), ProductStatus::Listing);
        assert_eq!(get_product(&store, p2).await.status(), ProductStatus::Listing);

        let err = d
            .dispatch(
                &staff(),
                &CreateShipment {
                    order_id,
                    product_ids: vec![p1],
                    ..CreateShipment::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(domain_error(err), DomainError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn shipments_only_cover_products_of_the_order() {
        let (_, d) = setup();
        let (p1, _) = listed(&d, "CAM-012").await;
        let (stranger, _) = listed(&d, "CAM-013").await;
        let order_id = confirmed_order(&d, "ORD-12", &[p1]).await;

        let err = d
            .dispatch(
                &staff(),
                &CreateShipment {
                    order_id,
                    product_ids: vec![p1, stranger],
                    ..CreateShipment::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(domain_error(err), DomainError::Validation(_)));
    }

    // ----- Shipments, bundles and synchronization -----

    #[tokio::test]
    async fn shipped_milestone_reaches_every_item_of_the_order() {
        let (store, d) = setup();
        let (p1, l1) = listed(&d, "CAM-020").await;
        let (p2, l2) = listed(&d, "CAM-021").await;
        let order_id = confirmed_order(&d, "ORD-20", &[p1, p2]).await;
        let shipment = ship(&d, order_id, &[p1], Some("1Z999")).await.remove(0);

        advance(&d, shipment.id_typed(), ShipmentStatus::Picked).await.unwrap();
        advance(&d, shipment.id_typed(), ShipmentStatus::Packed).await.unwrap();
        // Picking and packing do not touch the mirrors.
        assert_eq!(get_order(&store, order_id).await.status(), OrderStatus::Confirmed);
        assert_eq!(
            get_listing(&store, l1).await.shipping_status(),
            ShippingStatus::NotShipped
        );

        advance(&d, shipment.id_typed(), ShipmentStatus::Shipped).await.unwrap();

        let order = get_order(&store, order_id).await;
        assert_eq!(order.status(), OrderStatus::Shipped);
        assert_eq!(order.tracking_number(), Some("1Z999"));
        for listing_id in [l1, l2] {
            let listing = get_listing(&store, listing_id).await;
            assert_eq!(listing.shipping_status(), ShippingStatus::Shipped);
            assert!(listing.shipped_at().is_some());
        }
        for product_id in [p1, p2] {
            assert_eq!(get_product(&store, product_id).await.status(), ProductStatus::Shipping);
        }
    }

    #[tokio::test]
    async fn delivered_milestone_completes_every_mirror() {
        let (store, d) = setup();
        let (p1, l1) = listed(&d, "CAM-022").await;
        let (p2, l2) = listed(&d, "CAM-023").await;
        let order_id = confirmed_order(&d, "ORD-22", &[p1, p2]).await;
        let shipments = ship(&d, order_id, &[p1, p2], Some("1Z998")).await;
        advance_to_shipped(&d, shipments[0].id_typed()).await;
        advance(&d, shipments[0].id_typed(), ShipmentStatus::Delivered)
            .await
            .unwrap();

        assert_eq!(get_order(&store, order_id).await.status(), OrderStatus::Delivered);
        for listing_id in [l1, l2] {
            assert_eq!(
                get_listing(&store, listing_id).await.shipping_status(),
                ShippingStatus::Delivered
            );
        }
        for product_id in [p1, p2] {
            assert_eq!(get_product(&store, product_id).await.status(), ProductStatus::Sold);
        }
        for s in &shipments {
            assert_eq!(
                get_shipment(&store, s.id_typed()).await.status(),
                ShipmentStatus::Delivered
            );
        }
    }

    #[tokio::test]
    async fn bundle_members_advance_in_lock_step() {
        let (store, d) = setup();
        let (p1, _) = listed(&d, "CAM-030").await;
        let (p2, _) = listed(&d, "CAM-031").await;
        let order_id = confirmed_order(&d, "ORD-30", &[p1, p2]).await;
        let shipments = ship(&d, order_id, &[p1, p2], None).await;
        let (s1, s2) = (shipments[0].id_typed(), shipments[1].id_typed());
        assert!(shipments[0].bundle_id().is_some());
        assert_eq!(shipments[0].bundle_id(), shipments[1].bundle_id());

        advance(&d, s1, ShipmentStatus::Picked).await.unwrap();
        advance(&d, s1, ShipmentStatus::Packed).await.unwrap();
        assert_eq!(get_shipment(&store, s2).await.status(), ShipmentStatus::Packed);

        // Either member drives the whole bundle.
        let moved = advance(&d, s2, ShipmentStatus::Shipped).await.unwrap();
        assert_eq!(moved.len(), 2);
        assert_eq!(get_shipment(&store, s1).await.status(), ShipmentStatus::Shipped);
        assert_eq!(get_shipment(&store, s2).await.status(), ShipmentStatus::Shipped);

        let err = advance(&d, s1, ShipmentStatus::Shipped).await.unwrap_err();
        assert!(matches!(domain_error(err), DomainError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn pick_and_pack_from_pending_moves_the_whole_bundle() {
        let (store, d) = setup();
        let (p1, _) = listed(&d, "CAM-038").await;
        let (p2, _) = listed(&d, "CAM-039").await;
        let order_id = confirmed_order(&d, "ORD-38", &[p1, p2]).await;
        let shipments = ship(&d, order_id, &[p1, p2], Some("1Z996")).await;
        let (s1, s2) = (shipments[0].id_typed(), shipments[1].id_typed());

        let moved = advance(&d, s1, ShipmentStatus::Packed).await.unwrap();
        assert_eq!(moved.len(), 2);
        for id in [s1, s2] {
            let shipment = get_shipment(&store, id).await;
            assert_eq!(shipment.status(), ShipmentStatus::Packed);
            let history: Vec<_> = shipment.status_history().iter().map(|m| m.status).collect();
            assert_eq!(
                history,
                vec![
                    ShipmentStatus::Pending,
                    ShipmentStatus::Picked,
                    ShipmentStatus::Packed
                ]
            );
        }
        assert_eq!(get_order(&store, order_id).await.status(), OrderStatus::Confirmed);

        advance(&d, s2, ShipmentStatus::Shipped).await.unwrap();
        assert_eq!(get_shipment(&store, s1).await.status(), ShipmentStatus::Shipped);
        assert_eq!(get_shipment(&store, s2).await.status(), ShipmentStatus::Shipped);

        let err = advance(&d, s1, ShipmentStatus::Shipped).await.unwrap_err();
        assert!(matches!(domain_error(err), DomainError::InvalidTransition(_)));
        assert_eq!(get_shipment(&store, s1).await.status(), ShipmentStatus::Shipped);
        assert_eq!(get_shipment(&store, s2).await.status(), ShipmentStatus::Shipped);
        assert_eq!(get_order(&store, order_id).await.status(), OrderStatus::Shipped);
    }

    #[tokio::test]
    async fn diverged_bundle_is_refused_without_partial_writes() {
        let (store, d) = setup();
        let (p1, _) = listed(&d, "CAM-032").await;
        let (p2, _) = listed(&d, "CAM-033").await;
        let order_id = confirmed_order(&d, "ORD-32", &[p1, p2]).await;
        let shipments = ship(&d, order_id, &[p1, p2], None).await;
        let (s1, s2) = (shipments[0].id_typed(), shipments[1].id_typed());

        // Simulate a writer that bypassed the bundle path.
        {
            let mut tx = store.begin().await.unwrap();
            let mut rogue = tx.shipment(s2).await.unwrap().unwrap();
            let expected = ExpectedVersion::Exact(depotflow_core::AggregateRoot::version(&rogue));
            depotflow_events::execute(
                &mut rogue,
                &ShipmentCommand::Advance {
                    target: ShipmentStatus::Picked,
                    occurred_at: chrono::Utc::now(),
                },
            )
            .unwrap();
            tx.update_shipment(&rogue, expected).await.unwrap();
            tx.commit().await.unwrap();
        }

        let err = advance(&d, s1, ShipmentStatus::Picked).await.unwrap_err();
        assert!(matches!(domain_error(err), DomainError::BundleInconsistent(_)));
        assert_eq!(get_shipment(&store, s1).await.status(), ShipmentStatus::Pending);
        assert_eq!(get_shipment(&store, s2).await.status(), ShipmentStatus::Picked);
    }

    #[tokio::test]
    async fn concurrent_advances_of_one_bundle_apply_once() {
        let (store, d) = setup();
        let (p1, _) = listed(&d, "CAM-034").await;
        let (p2, _) = listed(&d, "CAM-035").await;
        let order_id = confirmed_order(&d, "ORD-34", &[p1, p2]).await;
        let shipments = ship(&d, order_id, &[p1, p2], None).await;
        let (s1, s2) = (shipments[0].id_typed(), shipments[1].id_typed());

        let (a, b) = tokio::join!(
            advance(&d, s1, ShipmentStatus::Picked),
            advance(&d, s2, ShipmentStatus::Picked),
        );
        assert!(a.is_ok() != b.is_ok());
        assert_eq!(get_shipment(&store, s1).await.status(), ShipmentStatus::Picked);
        assert_eq!(get_shipment(&store, s2).await.status(), ShipmentStatus::Picked);
    }

    #[tokio::test]
    async fn failed_audit_write_rolls_back_the_whole_advance() {
        let (store, d) = setup();
        let (p1, l1) = listed(&d, "CAM-036").await;
        let (p2, _) = listed(&d, "CAM-037").await;
        let order_id = confirmed_order(&d, "ORD-36", &[p1, p2]).await;
        let shipments = ship(&d, order_id, &[p1, p2], Some("1Z997")).await;
        let s1 = shipments[0].id_typed();
        advance(&d, s1, ShipmentStatus::Picked).await.unwrap();
        advance(&d, s1, ShipmentStatus::Packed).await.unwrap();
        let before = activity_count(&store).await;

        store.fail_activity_writes(true);
        let err = advance(&d, s1, ShipmentStatus::Shipped).await.unwrap_err();
        assert!(matches!(err, DispatchError::Store(StoreError::Backend(_))));
        store.fail_activity_writes(false);

        for s in &shipments {
            assert_eq!(
                get_shipment(&store, s.id_typed()).await.status(),
                ShipmentStatus::Packed
            );
        }
        assert_eq!(get_order(&store, order_id).await.status(), OrderStatus::Confirmed);
        assert_eq!(
            get_listing(&store, l1).await.shipping_status(),
            ShippingStatus::NotShipped
        );
        assert_eq!(get_product(&store, p1).await.status(), ProductStatus::Ordered);
        assert_eq!(activity_count(&store).await, before);

        advance(&d, s1, ShipmentStatus::Shipped).await.unwrap();
        assert_eq!(get_order(&store, order_id).await.status(), OrderStatus::Shipped);
    }

    #[tokio::test]
    async fn legacy_bundles_advance_together_and_backfill_to_rows() {
        let (store, d) = setup();
        let (p1, _) = listed(&d, "CAM-040").await;
        let (p2, _) = listed(&d, "CAM-041").await;
        let order_id = confirmed_order(&d, "ORD-40", &[p1, p2]).await;

        let legacy_id = BundleId::new("BUNDLE-LEGACY00001");
        let notes = BundleNotes::for_membership(&BundleMembership {
            bundle_id: legacy_id.clone(),
            members: vec![p1, p2],
        })
        .to_json()
        .unwrap();
        let mut ids = Vec::new();
        for product_id in [p1, p2] {
            let created = d
                .dispatch(
                    &staff(),
                    &CreateShipment {
                        order_id,
                        product_ids: vec![product_id],
                        notes: Some(notes.clone()),
                        ..CreateShipment::default()
                    },
                )
                .await
                .unwrap();
            assert_eq!(created[0].bundle_id(), None);
            ids.push(created[0].id_typed());
        }

        advance(&d, ids[0], ShipmentStatus::Picked).await.unwrap();
        assert_eq!(get_shipment(&store, ids[1]).await.status(), ShipmentStatus::Picked);

        let report = d.dispatch(&staff(), &BackfillBundles).await.unwrap();
        assert_eq!(report.promoted, vec![legacy_id.clone()]);
        assert!(report.skipped.is_empty());
        for id in &ids {
            assert_eq!(get_shipment(&store, *id).await.bundle_id(), Some(&legacy_id));
        }

        let report = d.dispatch(&staff(), &BackfillBundles).await.unwrap();
        assert!(report.promoted.is_empty());

        advance(&d, ids[1], ShipmentStatus::Packed).await.unwrap();
        assert_eq!(get_shipment(&store, ids[0]).await.status(), ShipmentStatus::Packed);

        let view = FulfillmentQueries::new(store.clone())
            .bundle_membership(ids[0])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(view.bundle_id, legacy_id);
        assert!(!view.legacy);
        assert_eq!(view.shipment_ids.len(), 2);
    }

    #[tokio::test]
    async fn broken_legacy_bundles_are_reported_not_promoted() {
        let (store, d) = setup();
        let (p1, _) = listed(&d, "CAM-042").await;
        let (p2, _) = listed(&d, "CAM-043").await;
        let order_id = confirmed_order(&d, "ORD-42", &[p1, p2]).await;
        let notes = BundleNotes::for_membership(&BundleMembership {
            bundle_id: BundleId::new("BUNDLE-LEGACY00002"),
            members: vec![p1, p2],
        })
        .to_json()
        .unwrap();
        // Only one of the two members was ever created.
        let created = d
            .dispatch(
                &staff(),
                &CreateShipment {
                    order_id,
                    product_ids: vec![p1],
                    notes: Some(notes),
                    ..CreateShipment::default()
                },
            )
            .await
            .unwrap();

        let report = d.dispatch(&staff(), &BackfillBundles).await.unwrap();
        assert!(report.promoted.is_empty());
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].bundle_id, "BUNDLE-LEGACY00002");
        assert_eq!(get_shipment(&store, created[0].id_typed()).await.bundle_id(), None);

        let err = advance(&d, created[0].id_typed(), ShipmentStatus::Picked)
            .await
            .unwrap_err();
        assert!(matches!(domain_error(err), DomainError::BundleInconsistent(_)));
    }

    // ----- Returns -----

    #[tokio::test]
    async fn approved_return_forces_returned_and_restock_relocates() {
        let (store, d) = setup();
        let shelf = location(&d, "LOC-R01").await;
        let (p1, _) = listed(&d, "CAM-050").await;
        let order_id = confirmed_order(&d, "ORD-50", &[p1]).await;

        let request = RequestReturn {
            order_id,
            product_id: p1,
            reason: "scratched lens".to_string(),
            condition: None,
            refund_amount: Some(12_000),
        };
        let err = d.dispatch(&staff(), &request).await.unwrap_err();
        assert!(matches!(domain_error(err), DomainError::InvalidTransition(_)));

        let shipment = ship(&d, order_id, &[p1], None).await.remove(0);
        advance_to_shipped(&d, shipment.id_typed()).await;
        advance(&d, shipment.id_typed(), ShipmentStatus::Delivered)
            .await
            .unwrap();
        assert_eq!(get_product(&store, p1).await.status(), ProductStatus::Sold);

        let requested = d.dispatch(&staff(), &request).await.unwrap();
        assert_eq!(requested.status(), ReturnStatus::Pending);
        let approved = d
            .dispatch(&staff(), &ApproveReturn { return_id: requested.id_typed() })
            .await
            .unwrap();
        assert_eq!(approved.status(), ReturnStatus::Approved);
        assert_eq!(get_product(&store, p1).await.status(), ProductStatus::Returned);

        let err = d
            .dispatch(
                &staff(),
                &RejectReturn {
                    return_id: requested.id_typed(),
                    note: "too late".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(domain_error(err), DomainError::InvalidTransition(_)));

        d.dispatch(&staff(), &CompleteReturn { return_id: requested.id_typed() })
            .await
            .unwrap();

        let err = d
            .dispatch(
                &staff(),
                &RestockReturned {
                    product_id: p1,
                    target: ProductStatus::Sold,
                    to_location_id: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(domain_error(err), DomainError::InvalidTransition(_)));

        let product = d
            .dispatch(
                &staff(),
                &RestockReturned {
                    product_id: p1,
                    target: ProductStatus::Storage,
                    to_location_id: Some(shelf.id),
                },
            )
            .await
            .unwrap();
        assert_eq!(product.status(), ProductStatus::Storage);
        assert_eq!(product.current_location_id(), Some(shelf.id));
        assert_eq!(movements(&store, p1).await.len(), 1);
    }

    #[tokio::test]
    async fn returns_require_the_product_to_belong_to_the_order() {
        let (_, d) = setup();
        let (p1, _) = listed(&d, "CAM-052").await;
        let (other, _) = listed(&d, "CAM-053").await;
        let order_id = confirmed_order(&d, "ORD-52", &[p1]).await;

        let err = d
            .dispatch(
                &staff(),
                &RequestReturn {
                    order_id,
                    product_id: other,
                    reason: "wrong item".to_string(),
                    condition: None,
                    refund_amount: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(domain_error(err), DomainError::Validation(_)));
    }

    // ----- Reconciliation -----

    async fn shipped_listing(
        d: &TestDispatcher,
        n: usize,
        tracking_number: Option<&str>,
    ) -> (ProductId, ListingId, OrderId) {
        let (product_id, listing_id) = listed(d, &format!("REC-{n:03}")).await;
        let order_id = confirmed_order(d, &format!("ORD-R{n:03}"), &[product_id]).await;
        let shipment = ship(d, order_id, &[product_id], tracking_number).await.remove(0);
        advance_to_shipped(d, shipment.id_typed()).await;
        (product_id, listing_id, order_id)
    }

    #[tokio::test]
    async fn reconciliation_isolates_lookup_failures() {
        let (store, d) = setup();
        let mut carrier = ScriptedCarrier::new();
        let mut listings = Vec::new();
        for n in 0..10 {
            let tracking = format!("TRK-{n}");
            let script = match n {
                2 | 5 => Script::Fail(CarrierError::Transport("connection reset".to_string())),
                8 => Script::Hang,
                _ => Script::Answer(DeliveryStatus::delivered(None)),
            };
            carrier = carrier.with(&tracking, script);
            listings.push((n, shipped_listing(&d, n, Some(&tracking)).await));
        }

        let reconciler =
            DeliveryReconciler::new(Dispatcher::new(store.clone()), carrier, Duration::from_millis(50));
        let (_tx, rx) = watch::channel(false);
        let summary = reconciler.run_once(&rx).await.unwrap();

        assert_eq!(summary.total_processed, 10);
        assert_eq!(summary.updated_count, 7);
        assert_eq!(summary.skipped_count, 0);
        assert_eq!(summary.errors.len(), 3);
        assert!(!summary.interrupted);
        assert!(summary
            .errors
            .iter()
            .all(|e| e.kind == FailureKind::ExternalLookupFailed));
        let timed_out = summary
            .errors
            .iter()
            .find(|e| e.tracking_number.as_deref() == Some("TRK-8"))
            .unwrap();
        assert!(timed_out.message.contains("timed out"));

        for (n, (product_id, listing_id, order_id)) in listings {
            let failed = matches!(n, 2 | 5 | 8);
            let expected_listing = if failed {
                ShippingStatus::Shipped
            } else {
                ShippingStatus::Delivered
            };
            assert_eq!(get_listing(&store, listing_id).await.shipping_status(), expected_listing);
            let expected_order = if failed {
                OrderStatus::Shipped
            } else {
                OrderStatus::Delivered
            };
            assert_eq!(get_order(&store, order_id).await.status(), expected_order);
            if !failed {
                assert_eq!(get_product(&store, product_id).await.status(), ProductStatus::Sold);
            }
        }

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["updatedCount"], 7);
        assert_eq!(json["errors"][0]["kind"], "external_lookup_failed");
    }

    #[tokio::test]
    async fn reconciliation_skips_untracked_and_ignores_in_transit() {
        let (store, d) = setup();
        let (_, untracked, _) = shipped_listing(&d, 1, None).await;
        let (_, moving, _) = shipped_listing(&d, 2, Some("TRK-MOVING")).await;
        let carrier = ScriptedCarrier::new();

        let reconciler =
            DeliveryReconciler::new(Dispatcher::new(store.clone()), carrier, Duration::from_secs(1));
        let (_tx, rx) = watch::channel(false);
        let summary = reconciler.run_once(&rx).await.unwrap();

        assert_eq!(summary.total_processed, 2);
        assert_eq!(summary.skipped_count, 1);
        assert_eq!(summary.updated_count, 0);
        assert!(summary.errors.is_empty());
        for listing_id in [untracked, moving] {
            assert_eq!(
                get_listing(&store, listing_id).await.shipping_status(),
                ShippingStatus::Shipped
            );
        }
    }

    #[tokio::test]
    async fn reconciliation_stops_between_items_on_shutdown() {
        let (store, d) = setup();
        shipped_listing(&d, 1, Some("TRK-1")).await;
        let carrier =
            ScriptedCarrier::new().with("TRK-1", Script::Answer(DeliveryStatus::delivered(None)));
        let reconciler =
            DeliveryReconciler::new(Dispatcher::new(store.clone()), carrier, Duration::from_secs(1));

        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let summary = reconciler.run_once(&rx).await.unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.total_processed, 0);
    }

    #[tokio::test]
    async fn return_approved_in_transit_does_not_block_delivery() {
        let (store, d) = setup();
        let (product_id, listing_id, order_id) = shipped_listing(&d, 60, Some("TRK-60")).await;
        let requested = d
            .dispatch(
                &staff(),
                &RequestReturn {
                    order_id,
                    product_id,
                    reason: "buyer cancelled in transit".to_string(),
                    condition: None,
                    refund_amount: None,
                },
            )
            .await
            .unwrap();
        d.dispatch(&staff(), &ApproveReturn { return_id: requested.id_typed() })
            .await
            .unwrap();
        assert_eq!(get_product(&store, product_id).await.status(), ProductStatus::Returned);

        let carrier =
            ScriptedCarrier::new().with("TRK-60", Script::Answer(DeliveryStatus::delivered(None)));
        let reconciler =
            DeliveryReconciler::new(Dispatcher::new(store.clone()), carrier, Duration::from_secs(1));
        let (_tx, rx) = watch::channel(false);
        let summary = reconciler.run_once(&rx).await.unwrap();

        assert_eq!(summary.updated_count, 1);
        assert!(summary.errors.is_empty());
        assert_eq!(
            get_listing(&store, listing_id).await.shipping_status(),
            ShippingStatus::Delivered
        );
        assert_eq!(get_order(&store, order_id).await.status(), OrderStatus::Delivered);
        assert_eq!(get_product(&store, product_id).await.status(), ProductStatus::Returned);

        let mut tx = store.begin().await.unwrap();
        let shipments = tx.shipments_for_product(product_id).await.unwrap();
        tx.rollback().await.unwrap();
        assert!(shipments.iter().all(|s| s.status() == ShipmentStatus::Delivered));

        let again = reconciler.run_once(&rx).await.unwrap();
        assert_eq!(again.total_processed, 0);
    }

    #[tokio::test]
    async fn delivery_applied_twice_is_a_no_op() {
        let (store, d) = setup();
        let (_, listing_id, order_id) = shipped_listing(&d, 1, Some("TRK-1")).await;
        let op = ReconcileDelivery {
            listing_id,
            shipment_id: None,
            delivered_at: None,
        };

        assert!(d.dispatch(&Principal::system(), &op).await.unwrap());
        assert!(!d.dispatch(&Principal::system(), &op).await.unwrap());
        assert_eq!(get_order(&store, order_id).await.status(), OrderStatus::Delivered);
    }

    // ----- Audit log and projections -----

    #[tokio::test]
    async fn activity_log_and_timeline_follow_a_product() {
        let (store, d) = setup();
        let queries = FulfillmentQueries::new(store.clone());
        let loc = location(&d, "LOC-T01").await;
        let (p1, _) = listed(&d, "CAM-060").await;
        let mover = staff();
        d.dispatch(
            &mover,
            &MoveProduct {
                product_id: p1,
                to_location_id: loc.id,
                notes: None,
            },
        )
        .await
        .unwrap();
        let order_id = confirmed_order(&d, "ORD-60", &[p1]).await;
        let shipment = ship(&d, order_id, &[p1], Some("1Z960")).await.remove(0);
        advance_to_shipped(&d, shipment.id_typed()).await;

        let filter = ActivityFilter {
            kind: Some(ActivityKind::InventoryMovement),
            user_id: mover.user_id,
            ..ActivityFilter::default()
        };
        let page = queries
            .activities(&admin(), &filter, Pagination::new(1, 10), SortOrder::NewestFirst)
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].product_id, Some(p1));

        let all = queries
            .activities(
                &admin(),
                &ActivityFilter::for_product(p1),
                Pagination::new(1, 200),
                SortOrder::NewestFirst,
            )
            .await
            .unwrap();
        assert!(all
            .items
            .windows(2)
            .all(|w| w[0].created_at >= w[1].created_at));

        let err = queries
            .activities(&seller(), &filter, Pagination::default(), SortOrder::NewestFirst)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Forbidden(_)));

        let timeline = queries.product_timeline(p1).await.unwrap();
        assert!(timeline
            .windows(2)
            .all(|w| w[0].occurred_at <= w[1].occurred_at));
        let kinds: Vec<TimelineKind> = timeline.iter().map(|e| e.kind).collect();
        for kind in [
            TimelineKind::Activity,
            TimelineKind::Movement,
            TimelineKind::OrderPlaced,
            TimelineKind::OrderShipped,
            TimelineKind::Shipment,
        ] {
            assert!(kinds.contains(&kind), "missing {kind:?}");
        }

        let view = queries.product_view(p1).await.unwrap();
        assert_eq!(view.location_code.as_deref(), Some("LOC-T01"));
        assert!(view.ledger_consistent);
        assert_eq!(view.status, ProductStatus::Shipping);

        let history = queries.shipment_history(shipment.id_typed()).await.unwrap();
        assert_eq!(history.queue, StaffQueue::Shipped);
        assert_eq!(history.milestones.len(), 4);
    }

    #[tokio::test]
    async fn lookup_by_id_sku_or_suffix() {
        let (store, d) = setup();
        let queries = FulfillmentQueries::new(store.clone());
        let a = register(&d, "CAM-X-006", 1).await;
        register(&d, "LENS-Y-006", 1).await;
        register(&d, "CAM-X-1006", 1).await;

        let by_id = queries
            .find_product(&a.id_typed().to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_id.sku(), "CAM-X-006");
        let by_sku = queries.find_product("LENS-Y-006").await.unwrap().unwrap();
        assert_eq!(by_sku.sku(), "LENS-Y-006");
        let by_suffix = queries.find_product("006").await.unwrap().unwrap();
        assert_eq!(by_suffix.sku(), "CAM-X-006");
        assert!(queries.find_product("999").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn staff_queue_lists_urgent_work_first() {
        let (store, d) = setup();
        let queries = FulfillmentQueries::new(store.clone());
        let (cheap, _) = listed(&d, "CAM-070").await;
        let pricey = register(&d, "CAM-071", 900_000).await.id_typed();
        transition(&d, pricey, ProductStatus::Inspection).await;
        d.dispatch(
            &staff(),
            &RecordInspection {
                product_id: pricey,
                step: 4,
                skip_photography: Some(true),
                ..RecordInspection::default()
            },
        )
        .await
        .unwrap();
        transition(&d, pricey, ProductStatus::Storage).await;
        transition(&d, pricey, ProductStatus::Listing).await;

        let o1 = confirmed_order(&d, "ORD-70", &[cheap]).await;
        let o2 = confirmed_order(&d, "ORD-71", &[pricey]).await;
        ship(&d, o1, &[cheap], None).await;
        ship(&d, o2, &[pricey], None).await;

        let queue = queries.staff_queue(StaffQueue::Workstation).await.unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].product_id, Some(pricey));
        assert!(queries.staff_queue(StaffQueue::Packed).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recent_deliveries_list_newest_first() {
        let (store, d) = setup();
        let queries = FulfillmentQueries::new(store.clone());
        let (_, first, _) = shipped_listing(&d, 1, Some("TRK-1")).await;
        let (_, second, _) = shipped_listing(&d, 2, Some("TRK-2")).await;
        for listing_id in [first, second] {
            d.dispatch(
                &Principal::system(),
                &ReconcileDelivery {
                    listing_id,
                    shipment_id: None,
                    delivered_at: None,
                },
            )
            .await
            .unwrap();
        }

        let recent = queries.recent_deliveries(1).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id_typed(), second);
    }
}
