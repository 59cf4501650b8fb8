use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::sea_query::LockType;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, EntityTrait, FromQueryResult, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::{
        orders::{OrderList, OrderStats, OrderStatsEntry, OrderWithItems, UpdateOrderStatusRequest},
        products::ProductList,
    },
    entity::{
        order_items::{Column as OrderItemCol, Entity as OrderItems},
        orders::{ActiveModel as OrderActive, Column as OrderCol, Entity as Orders, OrderStatus, PaymentStatus},
        products::{ActiveModel as ProductActive, Column as ProdCol, Entity as Products},
    },
    error::{AppError, AppResult},
    middleware::auth::{AuthUser, ensure_admin},
    models::{Order, OrderItem, Product},
    response::{ApiResponse, Meta},
    routes::params::{LowStockQuery, OrderListQuery, OrderStatsQuery},
    services::product_service::restore_stock,
    state::AppState,
};

pub async fn list_all_orders(
    state: &AppState,
    user: &AuthUser,
    query: OrderListQuery,
) -> AppResult<ApiResponse<OrderList>> {
    ensure_admin(user)?;
    let (page, limit, offset) = query.pagination.normalize();

    let mut condition = Condition::all();
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

pub async fn get_order_admin(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<OrderWithItems>> {
    ensure_admin(user)?;
    let order = Orders::find_by_id(id).one(&state.orm).await?;
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
        "Order found",
        OrderWithItems {
            order: Order::from(order),
            items,
        },
        Some(Meta::empty()),
    ))
}

/// Drive an order through its fulfilment state machine. Undeclared edges are
/// rejected. `delivered` stamps `delivered_at` and completes payment;
/// `cancelled` stamps `cancelled_at` and restores stock in the same
/// transaction so the two can never drift apart.
pub async fn update_order_status(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    payload: UpdateOrderStatusRequest,
) -> AppResult<ApiResponse<Order>> {
    ensure_admin(user)?;

    let txn = state.orm.begin().await?;

    let order = Orders::find_by_id(id)
        .lock(LockType::Update)
        .one(&txn)
        .await?;
    let order = match order {
        Some(o) => o,
        None => return Err(AppError::NotFound),
    };

    let from = order.order_status;
    let to = payload.status;
    if !from.can_transition_to(to) {
        return Err(AppError::InvalidTransition { from, to });
    }

    if to == OrderStatus::Cancelled {
        let mut items = OrderItems::find()
            .filter(OrderItemCol::OrderId.eq(order.id))
            .all(&txn)
            .await?;
        // Same product order as checkout's locks, so an overlapping checkout
        // cannot deadlock against the restoration.
        items.sort_unstable_by_key(|item| item.product_id);
        for item in &items {
            restore_stock(&txn, item.product_id, item.quantity).await?;
        }
    }

    let now = Utc::now();
    let mut active: OrderActive = order.into();
    active.order_status = Set(to);
    match to {
        OrderStatus::Delivered => {
            active.delivered_at = Set(Some(now.into()));
            active.payment_status = Set(PaymentStatus::Completed);
        }
        OrderStatus::Cancelled => {
            active.cancelled_at = Set(Some(now.into()));
        }
        _ => {}
    }
    if let Some(tracking) = payload.tracking_number {
        active.tracking_number = Set(Some(tracking));
    }
    active.updated_at = Set(now.into());
    let order = active.update(&txn).await?;

    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "order_status_update",
        Some("orders"),
        Some(serde_json::json!({ "order_id": order.id, "status": order.order_status.as_str() })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Order status updated",
        Order::from(order),
        Some(Meta::empty()),
    ))
}

pub async fn order_stats(
    state: &AppState,
    user: &AuthUser,
    query: OrderStatsQuery,
) -> AppResult<ApiResponse<OrderStats>> {
    ensure_admin(user)?;

    #[derive(Debug, FromQueryResult)]
    struct StatusRow {
        order_status: OrderStatus,
        count: i64,
        total_amount: Option<Decimal>,
    }

    let mut condition = Condition::all();
    if let Some(start) = query.start_date {
        condition = condition.add(OrderCol::CreatedAt.gte(start));
    }
    if let Some(end) = query.end_date {
        condition = condition.add(OrderCol::CreatedAt.lte(end));
    }

    let rows = Orders::find()
        .select_only()
        .column(OrderCol::OrderStatus)
        .column_as(OrderCol::Id.count(), "count")
        .column_as(OrderCol::TotalAmount.sum(), "total_amount")
        .filter(condition)
        .group_by(OrderCol::OrderStatus)
        .into_model::<StatusRow>()
        .all(&state.orm)
        .await?;

    let status_breakdown: Vec<OrderStatsEntry> = rows
        .into_iter()
        .map(|row| OrderStatsEntry {
            status: row.order_status,
            count: row.count,
            total_amount: row.total_amount.unwrap_or(Decimal::ZERO),
        })
        .collect();

    let total_orders = status_breakdown.iter().map(|entry| entry.count).sum();
    let total_revenue = status_breakdown.iter().map(|entry| entry.total_amount).sum();

    Ok(ApiResponse::success(
        "Order statistics",
        OrderStats {
            total_orders,
            total_revenue,
            status_breakdown,
        },
        Some(Meta::empty()),
    ))
}

pub async fn list_low_stock(
    state: &AppState,
    user: &AuthUser,
    query: LowStockQuery,
) -> AppResult<ApiResponse<ProductList>> {
    ensure_admin(user)?;
    let threshold = query.threshold.unwrap_or(5);
    let (page, limit, offset) = query.pagination.normalize();

    let finder = Products::find()
        .filter(ProdCol::Stock.lte(threshold))
        .filter(ProdCol::IsActive.eq(true))
        .order_by_asc(ProdCol::Stock)
        .order_by_desc(ProdCol::CreatedAt);

    let total = finder.clone().count(&state.orm).await? as i64;

    let items = finder
        .limit(limit as u64)
        .offset(offset as u64)
        .all(&state.orm)
        .await?
        .into_iter()
        .map(Product::from)
        .collect();

    let meta = Meta::new(page, limit, total);
    Ok(ApiResponse::success("Low stock", ProductList { items }, Some(meta)))
}

/// Manual restock/correction. The only stock writer besides checkout and
/// cancellation; stock may never go negative.
pub async fn adjust_inventory(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    delta: i32,
) -> AppResult<ApiResponse<Product>> {
    ensure_admin(user)?;
    if delta == 0 {
        return Err(AppError::Validation("delta must not be 0".into()));
    }

    let txn = state.orm.begin().await?;
    let product = Products::find_by_id(id)
        .lock(LockType::Update)
        .one(&txn)
        .await?;
    let product = match product {
        Some(p) => p,
        None => return Err(AppError::NotFound),
    };

    let new_stock = product.stock + delta;
    if new_stock < 0 {
        return Err(AppError::Validation("stock cannot be negative".into()));
    }

    let mut active: ProductActive = product.into();
    active.stock = Set(new_stock);
    active.updated_at = Set(Utc::now().into());
    let updated = active.update(&txn).await?;

    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "inventory_adjust",
        Some("products"),
        Some(serde_json::json!({ "product_id": updated.id, "delta": delta })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Inventory updated",
        Product::from(updated),
        Some(Meta::empty()),
    ))
}
