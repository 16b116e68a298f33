//! Order and refund workflows against a real Postgres.
//!
//! Set `TEST_DATABASE_URL` to a scratch database to run these; without it
//! every test returns early. Each test seeds its own rows, so they can share
//! one database and run in parallel.

use std::{collections::HashMap, time::Duration};

use diesel::{ExpressionMethods, QueryDsl, SelectableHelper, TextExpressionMethods};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use diesel_migrations::{EmbeddedMigrations, embed_migrations};
use serde_json::json;
use storefront::{
    api::payments::{ChargeObject, CheckoutSessionObject},
    domain::{
        inventory::CART_CONVERTED,
        order_status::OrderStatus,
        refunds::{REFUND_FAILED, REFUND_PENDING, REFUND_SUCCEEDED},
    },
    models::{
        CartEntity, CreateAbandonedCartEntity, CreateCartEntity, CreateCartItemEntity,
        CreateCouponEntity, CreateProductEntity, CreateVariantEntity, InventoryMovementEntity,
        OrderEntity, RefundEntity,
    },
    platform::{aliases::DbPool, db},
    schema::{
        abandoned_carts, cart_items, carts, coupons, inventory_movements, orders, outbox,
        product_variants, products, refunds,
    },
    services::{
        orders::{self as order_service, MaterializeOutcome, metadata},
        refunds::{self as refund_service, EXTERNAL_REFUND_REASON, RefundRequest},
    },
};
use tokio::sync::OnceCell;
use uuid::Uuid;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");
const UNIT_PRICE: i64 = 2500;

static MIGRATED: OnceCell<()> = OnceCell::const_new();

async fn database() -> Option<DbPool> {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL is not set, skipping database test");
        return None;
    };
    MIGRATED
        .get_or_init(|| async {
            db::run_migrations_blocking(MIGRATIONS, &url)
                .await
                .expect("migrations should apply");
        })
        .await;
    Some(db::create_pool(&url))
}

struct Seeded {
    variant_id: i32,
    cart_id: i32,
    quantity: i32,
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

/// One product with one variant, and an active cart holding `quantity` of it.
async fn seed_cart(conn: &mut AsyncPgConnection, stock: i32, quantity: i32) -> Seeded {
    let product_id: i32 = diesel::insert_into(products::table)
        .values(CreateProductEntity {
            slug: unique("tee"),
            name: "Tee".into(),
            description: "Plain tee".into(),
            category: "shirts".into(),
            price_cents: UNIT_PRICE,
            image_url: None,
        })
        .returning(products::id)
        .get_result(conn)
        .await
        .unwrap();

    let variant_id: i32 = diesel::insert_into(product_variants::table)
        .values(CreateVariantEntity {
            product_id,
            sku: unique("TEE-M"),
            name: "M".into(),
            price_cents: None,
            stock,
        })
        .returning(product_variants::id)
        .get_result(conn)
        .await
        .unwrap();

    let cart: CartEntity = diesel::insert_into(carts::table)
        .values(CreateCartEntity {
            customer_id: Uuid::new_v4(),
            email: Some("shopper@example.com".into()),
            status: "ACTIVE".into(),
        })
        .returning(CartEntity::as_returning())
        .get_result(conn)
        .await
        .unwrap();

    diesel::insert_into(cart_items::table)
        .values(CreateCartItemEntity {
            cart_id: cart.id,
            variant_id,
            quantity,
        })
        .execute(conn)
        .await
        .unwrap();

    Seeded {
        variant_id,
        cart_id: cart.id,
        quantity,
    }
}

fn paid_session(seeded: &Seeded, extra: &[(&str, String)]) -> CheckoutSessionObject {
    let subtotal = UNIT_PRICE * seeded.quantity as i64;
    let mut metadata = HashMap::from([
        (metadata::CART_ID.to_string(), seeded.cart_id.to_string()),
        (metadata::SUBTOTAL.to_string(), subtotal.to_string()),
        (metadata::DISCOUNT.to_string(), "0".to_string()),
        (metadata::TAX.to_string(), "0".to_string()),
    ]);
    for (key, value) in extra {
        metadata.insert(key.to_string(), value.clone());
    }
    CheckoutSessionObject {
        id: unique("cs_test"),
        payment_intent: Some(unique("pi")),
        payment_status: "paid".into(),
        amount_total: None,
        currency: Some("usd".into()),
        client_reference_id: Some(seeded.cart_id.to_string()),
        customer_details: None,
        metadata,
    }
}

async fn materialize(conn: &mut AsyncPgConnection, session: CheckoutSessionObject) -> MaterializeOutcome {
    conn.transaction(move |conn| {
        Box::pin(async move {
            let outcome = order_service::materialize_from_session(conn, &session, "usd").await?;
            Ok::<MaterializeOutcome, anyhow::Error>(outcome)
        })
    })
    .await
    .unwrap()
}

fn created(outcome: MaterializeOutcome) -> OrderEntity {
    match outcome {
        MaterializeOutcome::Created(order) => order,
        MaterializeOutcome::AlreadyProcessed(order) => {
            panic!("order #{} already existed", order.id)
        }
    }
}

async fn stock_of(conn: &mut AsyncPgConnection, variant_id: i32) -> i32 {
    product_variants::table
        .find(variant_id)
        .select(product_variants::stock)
        .get_result(conn)
        .await
        .unwrap()
}

async fn movements(conn: &mut AsyncPgConnection, variant_id: i32) -> Vec<InventoryMovementEntity> {
    inventory_movements::table
        .filter(inventory_movements::variant_id.eq(variant_id))
        .order_by(inventory_movements::id.asc())
        .select(InventoryMovementEntity::as_select())
        .load(conn)
        .await
        .unwrap()
}

async fn outbox_count(conn: &mut AsyncPgConnection, event_type: &str, order_id: i32) -> i64 {
    outbox::table
        .filter(outbox::event_type.eq(event_type))
        .filter(outbox::payload.like(format!("%\"order_id\":{order_id},%")))
        .count()
        .get_result(conn)
        .await
        .unwrap()
}

async fn reload(conn: &mut AsyncPgConnection, order_id: i32) -> OrderEntity {
    orders::table
        .find(order_id)
        .select(OrderEntity::as_select())
        .get_result(conn)
        .await
        .unwrap()
}

async fn paid_order(conn: &mut AsyncPgConnection, stock: i32, quantity: i32) -> (Seeded, OrderEntity) {
    let seeded = seed_cart(conn, stock, quantity).await;
    let order = created(materialize(conn, paid_session(&seeded, &[])).await);
    (seeded, order)
}

#[tokio::test]
async fn paid_session_becomes_an_order_once() {
    let Some(pool) = database().await else { return };
    let conn = &mut pool.get().await.unwrap();

    let seeded = seed_cart(conn, 10, 2).await;
    let session = paid_session(&seeded, &[]);
    let session_id = session.id.clone();
    let order = created(materialize(conn, session).await);

    assert_eq!(order.status, OrderStatus::Processing.as_str());
    assert_eq!(order.subtotal_cents, 5000);
    assert_eq!(order.total_cents, 5000);
    assert_eq!(order.hold_reason, None);
    assert_eq!(stock_of(conn, seeded.variant_id).await, 8);

    let moves = movements(conn, seeded.variant_id).await;
    assert_eq!(moves.len(), 1);
    assert_eq!(moves[0].delta, -2);
    assert_eq!(moves[0].reason, "order_placed");
    assert_eq!(moves[0].order_id, Some(order.id));

    let cart_status: String = carts::table
        .find(seeded.cart_id)
        .select(carts::status)
        .get_result(conn)
        .await
        .unwrap();
    assert_eq!(cart_status, CART_CONVERTED);
    assert_eq!(outbox_count(conn, "order.confirmed", order.id).await, 1);

    // Same session again: nothing new is created or decremented.
    let mut replay = paid_session(&seeded, &[]);
    replay.id = session_id;
    match materialize(conn, replay).await {
        MaterializeOutcome::AlreadyProcessed(existing) => assert_eq!(existing.id, order.id),
        MaterializeOutcome::Created(_) => panic!("replay created a second order"),
    }
    assert_eq!(stock_of(conn, seeded.variant_id).await, 8);
    assert_eq!(movements(conn, seeded.variant_id).await.len(), 1);
    assert_eq!(outbox_count(conn, "order.confirmed", order.id).await, 1);
}

#[tokio::test]
async fn oversold_stock_stops_at_zero() {
    let Some(pool) = database().await else { return };
    let conn = &mut pool.get().await.unwrap();

    let (seeded, _) = paid_order(conn, 1, 3).await;
    assert_eq!(stock_of(conn, seeded.variant_id).await, 0);
    let moves = movements(conn, seeded.variant_id).await;
    assert_eq!(moves[0].delta, -1);
}

#[tokio::test]
async fn coupon_is_redeemed_and_abandoned_cart_recovered() {
    let Some(pool) = database().await else { return };
    let conn = &mut pool.get().await.unwrap();

    let seeded = seed_cart(conn, 10, 2).await;
    let code = unique("SAVE").to_uppercase();
    diesel::insert_into(coupons::table)
        .values(CreateCouponEntity {
            code: code.clone(),
            kind: "FIXED".into(),
            value: 500,
            min_subtotal_cents: 0,
            max_redemptions: None,
            starts_at: None,
            expires_at: None,
        })
        .execute(conn)
        .await
        .unwrap();
    let cart: CartEntity = diesel::update(carts::table.find(seeded.cart_id))
        .set(carts::coupon_code.eq(Some(code.clone())))
        .returning(CartEntity::as_returning())
        .get_result(conn)
        .await
        .unwrap();
    diesel::insert_into(abandoned_carts::table)
        .values(CreateAbandonedCartEntity {
            cart_id: cart.id,
            customer_id: cart.customer_id,
            email: "shopper@example.com".into(),
        })
        .execute(conn)
        .await
        .unwrap();

    let session = paid_session(
        &seeded,
        &[
            (metadata::DISCOUNT, "500".to_string()),
            (metadata::COUPON, code.clone()),
        ],
    );
    let order = created(materialize(conn, session).await);
    assert_eq!(order.discount_cents, 500);
    assert_eq!(order.coupon_code.as_deref(), Some(code.as_str()));
    assert_eq!(order.status, OrderStatus::Processing.as_str());

    let redemptions: i32 = coupons::table
        .filter(coupons::code.eq(&code))
        .select(coupons::redemption_count)
        .get_result(conn)
        .await
        .unwrap();
    assert_eq!(redemptions, 1);

    let recovered: Option<chrono::DateTime<chrono::Utc>> = abandoned_carts::table
        .filter(abandoned_carts::cart_id.eq(cart.id))
        .select(abandoned_carts::recovered_at)
        .get_result(conn)
        .await
        .unwrap();
    assert!(recovered.is_some());
}

#[tokio::test]
async fn stock_changed_while_the_order_is_written_is_kept() {
    let Some(pool) = database().await else { return };
    let conn = &mut pool.get().await.unwrap();
    let seeded = seed_cart(conn, 10, 2).await;
    let session = paid_session(&seeded, &[]);

    // A second writer holds the variant row and adds 50 units.
    let mut restocker = pool.get_owned().await.unwrap();
    diesel::sql_query("BEGIN").execute(&mut *restocker).await.unwrap();
    diesel::update(product_variants::table.find(seeded.variant_id))
        .set(product_variants::stock.eq(product_variants::stock + 50))
        .execute(&mut *restocker)
        .await
        .unwrap();

    let order_pool = pool.clone();
    let writer = tokio::spawn(async move {
        let mut conn = order_pool.get_owned().await.unwrap();
        materialize(&mut conn, session).await
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    diesel::sql_query("COMMIT").execute(&mut *restocker).await.unwrap();

    created(writer.await.unwrap());
    assert_eq!(stock_of(conn, seeded.variant_id).await, 58);
}

#[tokio::test]
async fn cart_edited_after_checkout_holds_the_order() {
    let Some(pool) = database().await else { return };
    let conn = &mut pool.get().await.unwrap();

    let seeded = seed_cart(conn, 10, 2).await;
    // Checked out with one unit, then a second one was added.
    let session = paid_session(&seeded, &[(metadata::SUBTOTAL, UNIT_PRICE.to_string())]);
    let order = created(materialize(conn, session).await);

    assert_eq!(order.status, OrderStatus::Pending.as_str());
    let reason = order.hold_reason.clone().expect("order should be held");
    assert!(reason.contains("subtotal 2500 -> 5000"), "{reason}");

    // Releasing the hold is an explicit status change.
    let released = conn
        .transaction(move |conn| {
            Box::pin(async move {
                let order = order_service::change_status(conn, &order, OrderStatus::Processing).await?;
                Ok::<OrderEntity, anyhow::Error>(order)
            })
        })
        .await
        .unwrap();
    assert_eq!(released.status, OrderStatus::Processing.as_str());
    assert_eq!(released.hold_reason, None);
}

#[tokio::test]
async fn cancelling_returns_items_to_stock() {
    let Some(pool) = database().await else { return };
    let conn = &mut pool.get().await.unwrap();

    let (seeded, order) = paid_order(conn, 10, 2).await;
    assert_eq!(stock_of(conn, seeded.variant_id).await, 8);

    let cancelled = conn
        .transaction(move |conn| {
            Box::pin(async move {
                let order = order_service::change_status(conn, &order, OrderStatus::Cancelled).await?;
                Ok::<OrderEntity, anyhow::Error>(order)
            })
        })
        .await
        .unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled.as_str());
    assert_eq!(stock_of(conn, seeded.variant_id).await, 10);

    let moves = movements(conn, seeded.variant_id).await;
    assert_eq!(moves.last().map(|m| (m.delta, m.reason.as_str())), Some((2, "order_cancelled")));
    assert_eq!(outbox_count(conn, "order.status_changed", cancelled.id).await, 1);
}

async fn reserve(
    conn: &mut AsyncPgConnection,
    order_id: i32,
    amount_cents: Option<i64>,
    restock: bool,
) -> Result<refund_service::Reservation, storefront::platform::app_error::AppError> {
    conn.transaction(move |conn| {
        Box::pin(async move {
            refund_service::reserve(
                conn,
                order_id,
                RefundRequest {
                    amount_cents,
                    reason: "Damaged in transit".into(),
                    restock,
                },
            )
            .await
        })
    })
    .await
}

async fn finalize(
    conn: &mut AsyncPgConnection,
    refund_id: Uuid,
    provider_ref: &str,
    provider_status: &str,
) -> Option<refund_service::RefundRes> {
    let provider_ref = provider_ref.to_string();
    let provider_status = provider_status.to_string();
    conn.transaction(move |conn| {
        Box::pin(async move {
            refund_service::finalize(conn, refund_id, &provider_ref, &provider_status).await
        })
    })
    .await
    .unwrap()
}

async fn reconcile(conn: &mut AsyncPgConnection, charge: serde_json::Value) -> usize {
    let charge: ChargeObject = serde_json::from_value(charge).unwrap();
    conn.transaction(move |conn| {
        Box::pin(async move { refund_service::reconcile_charge(conn, &charge).await })
    })
    .await
    .unwrap()
}

async fn refunds_of(conn: &mut AsyncPgConnection, order_id: i32) -> Vec<RefundEntity> {
    refunds::table
        .filter(refunds::order_id.eq(order_id))
        .order_by(refunds::created_at.asc())
        .select(RefundEntity::as_select())
        .load(conn)
        .await
        .unwrap()
}

#[tokio::test]
async fn refunds_move_totals_only_when_confirmed() {
    let Some(pool) = database().await else { return };
    let conn = &mut pool.get().await.unwrap();
    let (_, order) = paid_order(conn, 10, 2).await;

    let first = reserve(conn, order.id, Some(3000), false).await.unwrap();
    assert_eq!(first.refund.status, REFUND_PENDING);
    assert_eq!(reload(conn, order.id).await.refunded_cents, 0);

    // The in-flight 3000 already counts against the balance.
    assert!(reserve(conn, order.id, Some(2500), false).await.is_err());
    let second = reserve(conn, order.id, None, false).await.unwrap();
    assert_eq!(second.refund.amount_cents, 2000);

    let res = finalize(conn, first.refund.id, &unique("re"), "succeeded")
        .await
        .expect("first confirmation applies");
    assert_eq!(res.order.refunded_cents, 3000);
    assert_eq!(res.order.status, OrderStatus::Processing.as_str());
    assert!(finalize(conn, first.refund.id, "re_again", "succeeded").await.is_none());

    let res = finalize(conn, second.refund.id, &unique("re"), "succeeded")
        .await
        .unwrap();
    assert_eq!(res.order.refunded_cents, 5000);
    assert_eq!(res.order.status, OrderStatus::Refunded.as_str());
    assert_eq!(outbox_count(conn, "order.refunded", order.id).await, 2);
}

#[tokio::test]
async fn failed_processor_call_frees_the_reservation() {
    let Some(pool) = database().await else { return };
    let conn = &mut pool.get().await.unwrap();
    let (_, order) = paid_order(conn, 10, 2).await;

    let held = reserve(conn, order.id, None, false).await.unwrap();
    refund_service::release(conn, held.refund.id).await.unwrap();

    let again = reserve(conn, order.id, None, false).await.unwrap();
    assert_eq!(again.refund.amount_cents, 5000);
    let statuses: Vec<String> = refunds_of(conn, order.id)
        .await
        .into_iter()
        .map(|refund| refund.status)
        .collect();
    assert_eq!(statuses, vec![REFUND_FAILED.to_string(), REFUND_PENDING.to_string()]);

    // Declined by the processor: the row fails and the order is untouched.
    assert!(finalize(conn, again.refund.id, &unique("re"), "failed").await.is_none());
    assert_eq!(reload(conn, order.id).await.refunded_cents, 0);
}

#[tokio::test]
async fn webhook_confirming_first_keeps_the_admin_refund() {
    let Some(pool) = database().await else { return };
    let conn = &mut pool.get().await.unwrap();
    let (seeded, order) = paid_order(conn, 10, 2).await;

    let held = reserve(conn, order.id, Some(2000), true).await.unwrap();
    let provider_ref = unique("re");
    let charge = json!({
        "id": unique("ch"),
        "payment_intent": order.payment_intent_id,
        "amount_refunded": 2000,
        "refunds": { "data": [{
            "id": provider_ref,
            "amount": 2000,
            "status": "succeeded",
            "metadata": { "refund_id": held.refund.id.to_string() }
        }]}
    });

    assert_eq!(reconcile(conn, charge.clone()).await, 1);
    // The processor's reply lands afterwards and changes nothing.
    assert!(finalize(conn, held.refund.id, &provider_ref, "succeeded").await.is_none());
    assert_eq!(reconcile(conn, charge).await, 0);

    let recorded = refunds_of(conn, order.id).await;
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].status, REFUND_SUCCEEDED);
    assert_eq!(recorded[0].reason, "Damaged in transit");
    assert_eq!(recorded[0].provider_ref.as_deref(), Some(provider_ref.as_str()));
    assert!(recorded[0].restocked);

    assert_eq!(reload(conn, order.id).await.refunded_cents, 2000);
    assert_eq!(stock_of(conn, seeded.variant_id).await, 10);
}

#[tokio::test]
async fn dashboard_refunds_are_recorded_once() {
    let Some(pool) = database().await else { return };
    let conn = &mut pool.get().await.unwrap();
    let (_, order) = paid_order(conn, 10, 2).await;

    let charge = json!({
        "id": unique("ch"),
        "payment_intent": order.payment_intent_id,
        "amount_refunded": 1000,
        "refunds": { "data": [{ "id": unique("re"), "amount": 1000, "metadata": {} }]}
    });
    assert_eq!(reconcile(conn, charge.clone()).await, 1);
    assert_eq!(reconcile(conn, charge).await, 0);

    let recorded = refunds_of(conn, order.id).await;
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].reason, EXTERNAL_REFUND_REASON);
    assert!(!recorded[0].restocked);
    assert_eq!(reload(conn, order.id).await.refunded_cents, 1000);
}
