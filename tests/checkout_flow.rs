use rust_decimal::Decimal;
use sea_orm::ActiveValue::NotSet;
use sea_orm::{ActiveModelTrait, ConnectionTrait, EntityTrait, Set, Statement};
use std::str::FromStr;
use uuid::Uuid;

use storefront_api::{
    db::{create_orm_conn, create_pool, run_migrations},
    dto::{
        auth::{LoginRequest, RegisterRequest},
        cart::{AddToCartRequest, BulkUpdateCartRequest, UpdateCartItemRequest},
        orders::{
            CancelOrderRequest, CheckoutRequest, ShippingAddressInput, UpdateOrderStatusRequest,
        },
    },
    entity::{
        orders::{OrderStatus, PaymentMethod, PaymentStatus},
        products::{ActiveModel as ProductActive, Entity as Products},
        users::ActiveModel as UserActive,
    },
    error::AppError,
    middleware::auth::AuthUser,
    routes::params::{Pagination, UserQuery},
    services::{admin_service, auth_service, cart_service, order_service, user_service},
    state::AppState,
};

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

fn address() -> ShippingAddressInput {
    ShippingAddressInput {
        street: "1 Main St".into(),
        city: "Pune".into(),
        state: "MH".into(),
        postal_code: "411001".into(),
        country: None,
    }
}

fn checkout_request() -> CheckoutRequest {
    CheckoutRequest {
        shipping_address: address(),
        payment_method: None,
        notes: Some("leave at the door".into()),
    }
}

// Full storefront flow against a real database: cart merge rules, the
// checkout transaction, the concurrent-checkout race, cancellation with
// stock restoration, and the status state machine. Runs as one test so the
// shared database is not truncated concurrently.
#[tokio::test]
async fn cart_checkout_cancel_and_concurrency_flow() -> anyhow::Result<()> {
    // Allow skipping when no DB is configured in the environment.
    let database_url =
        match std::env::var("TEST_DATABASE_URL").or_else(|_| std::env::var("DATABASE_URL")) {
            Ok(url) => url,
            Err(_) => {
                eprintln!(
                    "Skipping test: set TEST_DATABASE_URL or DATABASE_URL to run integration flow tests."
                );
                return Ok(());
            }
        };

    let state = setup_state(&database_url).await?;

    let customer_id = create_user(&state, "customer", "customer@example.com").await?;
    let rival_id = create_user(&state, "customer", "rival@example.com").await?;
    let admin_id = create_user(&state, "admin", "admin@example.com").await?;

    let customer = AuthUser {
        user_id: customer_id,
        role: "customer".into(),
    };
    let rival = AuthUser {
        user_id: rival_id,
        role: "customer".into(),
    };
    let admin = AuthUser {
        user_id: admin_id,
        role: "admin".into(),
    };

    let widget = create_product(&state, "Widget", "500", 10).await?;

    // --- Cart merge: adding 2 then 3 of the same product yields one line of 5.
    cart_service::add_to_cart(
        &state.pool,
        &customer,
        AddToCartRequest {
            product_id: widget,
            quantity: 2,
        },
    )
    .await?;
    let view = cart_service::add_to_cart(
        &state.pool,
        &customer,
        AddToCartRequest {
            product_id: widget,
            quantity: 3,
        },
    )
    .await?
    .data
    .unwrap();
    assert_eq!(view.items.len(), 1);
    assert_eq!(view.items[0].quantity, 5);
    assert_eq!(view.total_items, 5);
    assert_eq!(view.total_amount, dec("2500"));

    // Zero quantity on update removes the line instead of erroring.
    let line_id = view.items[0].id;
    let view = cart_service::update_cart_item(
        &state.pool,
        &customer,
        line_id,
        UpdateCartItemRequest { quantity: 0 },
    )
    .await?
    .data
    .unwrap();
    assert!(view.items.is_empty());
    assert_eq!(view.total_amount, Decimal::ZERO);

    // Updating a line that is gone is a NotFound, not a silent no-op.
    let err = cart_service::update_cart_item(
        &state.pool,
        &customer,
        line_id,
        UpdateCartItemRequest { quantity: 1 },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::NotFound));

    // --- Bulk replace: one request swaps the whole cart, all-or-nothing.
    cart_service::add_to_cart(
        &state.pool,
        &customer,
        AddToCartRequest {
            product_id: widget,
            quantity: 1,
        },
    )
    .await?;
    let view = cart_service::bulk_update(
        &state.pool,
        &customer,
        BulkUpdateCartRequest {
            items: vec![AddToCartRequest {
                product_id: widget,
                quantity: 4,
            }],
        },
    )
    .await?
    .data
    .unwrap();
    // Replaced, not merged with the existing line.
    assert_eq!(view.items.len(), 1);
    assert_eq!(view.items[0].quantity, 4);

    // A failing item rolls the whole replacement back.
    let err = cart_service::bulk_update(
        &state.pool,
        &customer,
        BulkUpdateCartRequest {
            items: vec![AddToCartRequest {
                product_id: widget,
                quantity: 11,
            }],
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::InsufficientStock { .. }));
    let view = cart_service::view_cart(&state.pool, &customer)
        .await?
        .data
        .unwrap();
    assert_eq!(view.items[0].quantity, 4);

    // An empty items array is rejected outright.
    let err = cart_service::bulk_update(
        &state.pool,
        &customer,
        BulkUpdateCartRequest { items: Vec::new() },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    cart_service::clear_cart(&state.pool, &customer).await?;

    // --- Checkout with an empty cart fails.
    let err = order_service::checkout(&state, &customer, checkout_request())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::EmptyCart));

    // --- Checkout end to end: price 500 x 2 -> subtotal 1000, shipping 50
    // (1000 is not strictly above the free-shipping threshold), tax 180.
    cart_service::add_to_cart(
        &state.pool,
        &customer,
        AddToCartRequest {
            product_id: widget,
            quantity: 2,
        },
    )
    .await?;
    let placed = order_service::checkout(&state, &customer, checkout_request())
        .await?
        .data
        .unwrap();
    let order = placed.order;
    assert!(order.order_number.starts_with("ORD-"));
    assert_eq!(order.order_status, OrderStatus::Placed);
    assert_eq!(order.payment_status, PaymentStatus::Pending);
    assert_eq!(order.payment_method, PaymentMethod::CashOnDelivery);
    assert_eq!(order.subtotal, dec("1000"));
    assert_eq!(order.shipping_cost, dec("50"));
    assert_eq!(order.tax, dec("180.00"));
    assert_eq!(order.total_amount, dec("1230.00"));
    assert_eq!(order.total_items, 2);
    assert_eq!(order.shipping_address.country, "India");
    assert_eq!(placed.items.len(), 1);
    assert_eq!(placed.items[0].price, dec("500"));

    // Stock reserved, cart cleared.
    assert_eq!(product_stock(&state, widget).await?, 8);
    let view = cart_service::view_cart(&state.pool, &customer)
        .await?
        .data
        .unwrap();
    assert!(view.items.is_empty());

    // --- Cancellation restores exactly what checkout consumed, additively:
    // the admin restocks 5 in between, and the +2 lands on top of that.
    admin_service::adjust_inventory(&state, &admin, widget, 5).await?;
    assert_eq!(product_stock(&state, widget).await?, 13);

    let cancelled = order_service::cancel_order(
        &state,
        &customer,
        order.id,
        CancelOrderRequest { reason: None },
    )
    .await?
    .data
    .unwrap();
    assert_eq!(cancelled.order.order_status, OrderStatus::Cancelled);
    assert!(cancelled.order.cancelled_at.is_some());
    assert_eq!(
        cancelled.order.cancellation_reason.as_deref(),
        Some("Cancelled by user")
    );
    assert_eq!(product_stock(&state, widget).await?, 15);

    // Cancelling again hits the terminal-state guard.
    let err = order_service::cancel_order(
        &state,
        &customer,
        order.id,
        CancelOrderRequest { reason: None },
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        AppError::InvalidTransition {
            from: OrderStatus::Cancelled,
            ..
        }
    ));

    // --- State machine: drive a fresh order to delivered, then cancellation
    // must fail and leave the order untouched.
    cart_service::add_to_cart(
        &state.pool,
        &customer,
        AddToCartRequest {
            product_id: widget,
            quantity: 1,
        },
    )
    .await?;
    let delivered = order_service::checkout(&state, &customer, checkout_request())
        .await?
        .data
        .unwrap()
        .order;

    // Skipping straight to shipped is not a declared edge.
    let err = admin_service::update_order_status(
        &state,
        &admin,
        delivered.id,
        UpdateOrderStatusRequest {
            status: OrderStatus::Shipped,
            tracking_number: None,
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition { .. }));

    for (status, tracking) in [
        (OrderStatus::Processing, None),
        (OrderStatus::Shipped, Some("TRK-123".to_string())),
        (OrderStatus::Delivered, None),
    ] {
        admin_service::update_order_status(
            &state,
            &admin,
            delivered.id,
            UpdateOrderStatusRequest {
                status,
                tracking_number: tracking,
            },
        )
        .await?;
    }

    let after = admin_service::get_order_admin(&state, &admin, delivered.id)
        .await?
        .data
        .unwrap()
        .order;
    assert_eq!(after.order_status, OrderStatus::Delivered);
    assert_eq!(after.payment_status, PaymentStatus::Completed);
    assert!(after.delivered_at.is_some());
    assert_eq!(after.tracking_number.as_deref(), Some("TRK-123"));

    let stock_before = product_stock(&state, widget).await?;
    let err = order_service::cancel_order(
        &state,
        &customer,
        delivered.id,
        CancelOrderRequest {
            reason: Some("too late".into()),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        AppError::InvalidTransition {
            from: OrderStatus::Delivered,
            ..
        }
    ));
    let unchanged = admin_service::get_order_admin(&state, &admin, delivered.id)
        .await?
        .data
        .unwrap()
        .order;
    assert_eq!(unchanged.order_status, OrderStatus::Delivered);
    assert!(unchanged.cancelled_at.is_none());
    assert!(unchanged.cancellation_reason.is_none());
    assert_eq!(product_stock(&state, widget).await?, stock_before);

    // --- Cancelling a multi-product order restores every line.
    let alpha = create_product(&state, "Alpha", "200", 6).await?;
    let beta = create_product(&state, "Beta", "300", 6).await?;
    cart_service::bulk_update(
        &state.pool,
        &customer,
        BulkUpdateCartRequest {
            items: vec![
                AddToCartRequest {
                    product_id: alpha,
                    quantity: 2,
                },
                AddToCartRequest {
                    product_id: beta,
                    quantity: 3,
                },
            ],
        },
    )
    .await?;
    let multi = order_service::checkout(&state, &customer, checkout_request())
        .await?
        .data
        .unwrap();
    assert_eq!(multi.items.len(), 2);
    assert_eq!(product_stock(&state, alpha).await?, 4);
    assert_eq!(product_stock(&state, beta).await?, 3);
    order_service::cancel_order(
        &state,
        &customer,
        multi.order.id,
        CancelOrderRequest { reason: None },
    )
    .await?;
    assert_eq!(product_stock(&state, alpha).await?, 6);
    assert_eq!(product_stock(&state, beta).await?, 6);

    // --- Concurrency: stock 10, two carts wanting 7 each. Exactly one
    // checkout succeeds and stock never goes negative or double-decrements.
    let gadget = create_product(&state, "Gadget", "100", 10).await?;
    for user in [&customer, &rival] {
        cart_service::add_to_cart(
            &state.pool,
            user,
            AddToCartRequest {
                product_id: gadget,
                quantity: 7,
            },
        )
        .await?;
    }

    let (first, second) = tokio::join!(
        order_service::checkout(&state, &customer, checkout_request()),
        order_service::checkout(&state, &rival, checkout_request()),
    );
    let outcomes = [first, second];
    let successes = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1, "exactly one concurrent checkout must win");
    let loser = outcomes
        .into_iter()
        .find(|r| r.is_err())
        .unwrap()
        .unwrap_err();
    assert!(matches!(loser, AppError::InsufficientStock { .. }));
    assert_eq!(product_stock(&state, gadget).await?, 3);

    // --- User management: the role and activation flags the rest of the
    // flow trusts are themselves admin-managed.
    let me = user_service::get_me(&state.pool, &customer)
        .await?
        .data
        .unwrap();
    assert_eq!(me.email, "customer@example.com");
    assert!(me.is_active);

    let err = user_service::update_role(&state.pool, &customer, rival_id, "admin")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden));

    let err = user_service::update_role(&state.pool, &admin, rival_id, "superuser")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let err = user_service::update_role(&state.pool, &admin, admin_id, "customer")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let promoted = user_service::update_role(&state.pool, &admin, rival_id, "admin")
        .await?
        .data
        .unwrap();
    assert_eq!(promoted.role, "admin");

    let err = user_service::update_status(&state.pool, &admin, admin_id, false)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let listed = user_service::list_users(
        &state.pool,
        &admin,
        UserQuery {
            pagination: Pagination {
                page: None,
                per_page: None,
            },
            q: Some("rival".into()),
        },
    )
    .await?
    .data
    .unwrap();
    assert_eq!(listed.items.len(), 1);
    assert_eq!(listed.items[0].email, "rival@example.com");

    // Deactivated accounts keep their history but cannot log in.
    let registered = auth_service::register_user(
        &state.pool,
        RegisterRequest {
            email: "gate@example.com".into(),
            password: "secret123".into(),
        },
    )
    .await?
    .data
    .unwrap();
    let off = user_service::update_status(&state.pool, &admin, registered.id, false)
        .await?
        .data
        .unwrap();
    assert!(!off.is_active);
    let err = auth_service::login_user(
        &state.pool,
        LoginRequest {
            email: "gate@example.com".into(),
            password: "secret123".into(),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::Unauthorized(_)));

    Ok(())
}

async fn setup_state(database_url: &str) -> anyhow::Result<AppState> {
    let orm = create_orm_conn(database_url).await?;
    run_migrations(&orm).await?;
    let pool = create_pool(database_url).await?;

    // Clean tables between runs
    let backend = orm.get_database_backend();
    orm.execute(Statement::from_string(
        backend,
        "TRUNCATE TABLE order_items, orders, cart_items, audit_logs, products, users RESTART IDENTITY CASCADE",
    ))
    .await?;

    Ok(AppState { pool, orm })
}

async fn create_user(state: &AppState, role: &str, email: &str) -> anyhow::Result<Uuid> {
    let user = UserActive {
        id: Set(Uuid::new_v4()),
        email: Set(email.to_string()),
        password_hash: Set("dummy".into()),
        role: Set(role.into()),
        is_active: Set(true),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await?;

    Ok(user.id)
}

async fn create_product(
    state: &AppState,
    name: &str,
    price: &str,
    stock: i32,
) -> anyhow::Result<Uuid> {
    let product = ProductActive {
        id: Set(Uuid::new_v4()),
        name: Set(name.to_string()),
        description: Set(Some(format!("{name} for testing"))),
        price: Set(dec(price)),
        stock: Set(stock),
        image: NotSet,
        category: Set(None),
        is_active: Set(true),
        created_at: NotSet,
        updated_at: NotSet,
    }
    .insert(&state.orm)
    .await?;

    Ok(product.id)
}

async fn product_stock(state: &AppState, id: Uuid) -> anyhow::Result<i32> {
    let product = Products::find_by_id(id)
        .one(&state.orm)
        .await?
        .expect("product exists");
    Ok(product.stock)
}
