use std::collections::HashMap;

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::ActiveValue::NotSet;
use sea_orm::sea_query::LockType;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::orders::{CancelOrderRequest, CheckoutRequest, OrderList, OrderWithItems, ShippingAddressInput},
    entity::{
        cart_items::{Column as CartCol, Entity as CartItems},
        order_items::{ActiveModel as OrderItemActive, Column as OrderItemCol, Entity as OrderItems},
        orders::{ActiveModel as OrderActive, Column as OrderCol, Entity as Orders, OrderStatus, PaymentStatus},
        products::{Column as ProdCol, Entity as Products, Model as ProductModel},
    },
    error::{AppError, AppResult},
    middleware::auth::AuthUser,
    models::{Order, OrderItem, ShippingAddress},
    pricing,
    response::{ApiResponse, Meta},
    routes::params::OrderListQuery,
    services::product_service::{reduce_stock, restore_stock},
    state::AppState,
};

const DEFAULT_COUNTRY: &str = "India";
const MAX_NOTES_LEN: usize = 500;

pub async fn list_orders(
    state: &AppState,
    user: &AuthUser,
    query: OrderListQuery,
) -> AppResult<ApiResponse<OrderList>> {
    let (page, limit, offset) = query.pagination.normalize();
    let mut condition = Condition::all().add(OrderCol::UserId.eq(user.user_id));
    if let Some(status) = query.status {
        condition = condition.add(OrderCol::OrderStatus.eq(status));
    }

    let finder = Orders::find()
        .filter(condition)
        .order_by_desc(OrderCol::CreatedAt);

    let total = finder.clone().count(&state.orm).await? as i64;

    let orders = finder
        .limit(limit as u64)
        .offset(offset as u64)
        .all(&state.orm)
        .await?
        .into_iter()
        .map(Order::from)
        .collect();

    let meta = Meta::new(page, limit, total);
    Ok(ApiResponse::success("Orders", OrderList { items: orders }, Some(meta)))
}

pub async fn get_order(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<OrderWithItems>> {
    let order = Orders::find()
        .filter(
            Condition::all()
                .add(OrderCol::Id.eq(id))
                .add(OrderCol::UserId.eq(user.user_id)),
        )
        .one(&state.orm)
        .await?;
    let order = match order {
        Some(o) => o,
        None => return Err(AppError::NotFound),
    };

    let items = OrderItems::find()
        .filter(OrderItemCol::OrderId.eq(order.id))
        .all(&state.orm)
        .await?
        .into_iter()
        .map(OrderItem::from)
        .collect();

    Ok(ApiResponse::success(
        "OK",
        OrderWithItems {
            order: Order::from(order),
            items,
        },
        Some(Meta::empty()),
    ))
}

/// Convert the user's cart into an immutable order.
///
/// Runs as one Postgres transaction: cart and product rows are locked, every
/// line is re-priced from the live product, stock is reserved with a
/// conditional decrement per product, the order and its item snapshots are
/// inserted, and the cart is cleared. Any failure rolls the whole unit back,
/// so a partially-decremented state is never visible.
pub async fn checkout(
    state: &AppState,
    user: &AuthUser,
    payload: CheckoutRequest,
) -> AppResult<ApiResponse<OrderWithItems>> {
    let address = validate_address(payload.shipping_address)?;
    let notes = match payload.notes {
        Some(notes) => {
            let notes = notes.trim().to_string();
            if notes.len() > MAX_NOTES_LEN {
                return Err(AppError::Validation(
                    "Notes cannot exceed 500 characters".into(),
                ));
            }
            (!notes.is_empty()).then_some(notes)
        }
        None => None,
    };
    let payment_method = payload.payment_method.unwrap_or_default();

    let txn = state.orm.begin().await?;

    let lines = CartItems::find()
        .filter(CartCol::UserId.eq(user.user_id))
        .order_by_asc(CartCol::CreatedAt)
        .lock(LockType::Update)
        .all(&txn)
        .await?;
    if lines.is_empty() {
        return Err(AppError::EmptyCart);
    }

    // Lock product rows in a stable order so two concurrent checkouts over
    // overlapping products cannot deadlock.
    let mut product_ids: Vec<Uuid> = lines.iter().map(|line| line.product_id).collect();
    product_ids.sort_unstable();
    let products: HashMap<Uuid, ProductModel> = Products::find()
        .filter(ProdCol::Id.is_in(product_ids))
        .order_by_asc(ProdCol::Id)
        .lock(LockType::Update)
        .all(&txn)
        .await?
        .into_iter()
        .map(|product| (product.id, product))
        .collect();

    // Advisory pre-checks; the conditional decrement below is authoritative.
    let mut priced: Vec<(Decimal, i32)> = Vec::with_capacity(lines.len());
    for line in &lines {
        let product = products
            .get(&line.product_id)
            .ok_or(AppError::NotFound)?;
        if !product.is_active {
            return Err(AppError::ProductUnavailable {
                name: product.name.clone(),
            });
        }
        if product.stock < line.quantity {
            return Err(AppError::InsufficientStock {
                name: product.name.clone(),
                available: product.stock,
            });
        }
        priced.push((product.price, line.quantity));
    }

    let totals = pricing::order_totals(&priced);

    let order = OrderActive {
        id: Set(Uuid::new_v4()),
        order_number: Set(generate_order_number()),
        user_id: Set(user.user_id),
        payment_method: Set(payment_method),
        payment_status: Set(PaymentStatus::Pending),
        order_status: Set(OrderStatus::Placed),
        total_items: Set(totals.total_items),
        subtotal: Set(totals.subtotal),
        shipping_cost: Set(totals.shipping_cost),
        tax: Set(totals.tax),
        total_amount: Set(totals.total_amount),
        street: Set(address.street),
        city: Set(address.city),
        state: Set(address.state),
        postal_code: Set(address.postal_code),
        country: Set(address.country),
        notes: Set(notes),
        tracking_number: Set(None),
        cancellation_reason: Set(None),
        delivered_at: Set(None),
        cancelled_at: Set(None),
        created_at: NotSet,
        updated_at: NotSet,
    }
    .insert(&txn)
    .await?;

    let mut items: Vec<OrderItem> = Vec::with_capacity(lines.len());
    for line in &lines {
        let product = &products[&line.product_id];

        // Snapshot of the product at this instant; later price or name
        // changes never touch the order.
        let item = OrderItemActive {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            product_id: Set(line.product_id),
            name: Set(product.name.clone()),
            price: Set(product.price),
            quantity: Set(line.quantity),
            image: Set(product.image.clone()),
            created_at: NotSet,
        }
        .insert(&txn)
        .await?;
        items.push(OrderItem::from(item));

        if !reduce_stock(&txn, line.product_id, line.quantity).await? {
            // Returning drops the transaction, rolling back the order row
            // and every decrement applied so far.
            let available = Products::find_by_id(line.product_id)
                .one(&txn)
                .await?
                .map_or(0, |p| p.stock);
            return Err(AppError::InsufficientStock {
                name: product.name.clone(),
                available,
            });
        }
    }

    CartItems::delete_many()
        .filter(CartCol::UserId.eq(user.user_id))
        .exec(&txn)
        .await?;

    txn.commit().await?;

    tracing::info!(
        order_number = %order.order_number,
        user_id = %user.user_id,
        total = %order.total_amount,
        "order placed"
    );

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "checkout",
        Some("orders"),
        Some(serde_json::json!({ "order_id": order.id, "order_number": order.order_number })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Order created successfully",
        OrderWithItems {
            order: Order::from(order),
            items,
        },
        Some(Meta::empty()),
    ))
}

/// Cancel an order and replay its stock back into the catalog. The status
/// change and the restorations commit together; one cannot land without the
/// other.
pub async fn cancel_order(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    payload: CancelOrderRequest,
) -> AppResult<ApiResponse<OrderWithItems>> {
    let txn = state.orm.begin().await?;

    let mut finder = Orders::find().filter(OrderCol::Id.eq(id));
    if !user.is_admin() {
        finder = finder.filter(OrderCol::UserId.eq(user.user_id));
    }
    let order = finder.lock(LockType::Update).one(&txn).await?;
    let order = match order {
        Some(o) => o,
        None => return Err(AppError::NotFound),
    };

    if !order.order_status.is_cancellable() {
        return Err(AppError::InvalidTransition {
            from: order.order_status,
            to: OrderStatus::Cancelled,
        });
    }

    let mut items = OrderItems::find()
        .filter(OrderItemCol::OrderId.eq(order.id))
        .all(&txn)
        .await?;
    // Same product order as checkout's locks, so an overlapping checkout
    // cannot deadlock against the restoration.
    items.sort_unstable_by_key(|item| item.product_id);

    // Additive restoration: exactly what checkout consumed, per line, on top
    // of whatever the stock is now.
    for item in &items {
        restore_stock(&txn, item.product_id, item.quantity).await?;
    }

    let reason = payload
        .reason
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| "Cancelled by user".to_string());

    let now = Utc::now();
    let mut active: OrderActive = order.into();
    active.order_status = Set(OrderStatus::Cancelled);
    active.cancelled_at = Set(Some(now.into()));
    active.cancellation_reason = Set(Some(reason));
    active.updated_at = Set(now.into());
    let order = active.update(&txn).await?;

    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "order_cancel",
        Some("orders"),
        Some(serde_json::json!({ "order_id": order.id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    let items = items.into_iter().map(OrderItem::from).collect();
    Ok(ApiResponse::success(
        "Order cancelled successfully",
        OrderWithItems {
            order: Order::from(order),
            items,
        },
        Some(Meta::empty()),
    ))
}

fn validate_address(input: ShippingAddressInput) -> Result<ShippingAddress, AppError> {
    let street = input.street.trim().to_string();
    let city = input.city.trim().to_string();
    let state = input.state.trim().to_string();
    let postal_code = input.postal_code.trim().to_string();
    if street.is_empty() || city.is_empty() || state.is_empty() || postal_code.is_empty() {
        return Err(AppError::Validation(
            "Complete shipping address is required".into(),
        ));
    }
    let country = input
        .country
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| DEFAULT_COUNTRY.to_string());
    Ok(ShippingAddress {
        street,
        city,
        state,
        postal_code,
        country,
    })
}

/// Unique human-readable order number, generated once at creation.
fn generate_order_number() -> String {
    let timestamp = Utc::now().timestamp_millis();
    let suffix = Uuid::new_v4().simple().to_string()[..6].to_uppercase();
    format!("ORD-{timestamp}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::orders::PaymentMethod;

    fn address() -> ShippingAddressInput {
        ShippingAddressInput {
            street: " 1 Main St ".into(),
            city: "Pune".into(),
            state: "MH".into(),
            postal_code: "411001".into(),
            country: None,
        }
    }

    #[test]
    fn address_is_trimmed_and_country_defaults() {
        let addr = validate_address(address()).unwrap();
        assert_eq!(addr.street, "1 Main St");
        assert_eq!(addr.country, DEFAULT_COUNTRY);
    }

    #[test]
    fn blank_required_field_is_rejected() {
        let mut input = address();
        input.postal_code = "   ".into();
        assert!(matches!(
            validate_address(input),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn payment_method_defaults_to_cash_on_delivery() {
        assert_eq!(PaymentMethod::default(), PaymentMethod::CashOnDelivery);
    }

    #[test]
    fn order_numbers_carry_prefix_and_are_unique() {
        let a = generate_order_number();
        let b = generate_order_number();
        assert!(a.starts_with("ORD-"));
        assert_ne!(a, b);
    }
}
