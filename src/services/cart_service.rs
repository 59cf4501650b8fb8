use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::FromRow;
use uuid::Uuid;

use crate::{
    audit::log_audit,
    db::DbPool,
    dto::cart::{AddToCartRequest, BulkUpdateCartRequest, CartLineDto, CartView, UpdateCartItemRequest},
    error::{AppError, AppResult},
    middleware::auth::AuthUser,
    models::Product,
    response::{ApiResponse, Meta},
};

#[derive(FromRow)]
struct CartLineRow {
    line_id: Uuid,
    quantity: i32,
    line_price: Decimal,
    product_id: Uuid,
    name: String,
    description: Option<String>,
    price: Decimal,
    stock: i32,
    image: String,
    category: Option<String>,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct ProductRow {
    name: String,
    price: Decimal,
    stock: i32,
    is_active: bool,
}

/// The user's cart with aggregates recomputed from the lines on every read.
pub async fn view_cart(pool: &DbPool, user: &AuthUser) -> AppResult<ApiResponse<CartView>> {
    let view = load_cart(pool, user).await?;
    Ok(ApiResponse::success("OK", view, Some(Meta::empty())))
}

async fn load_cart(pool: &DbPool, user: &AuthUser) -> AppResult<CartView> {
    let rows = sqlx::query_as::<_, CartLineRow>(
        r#"
        SELECT ci.id AS line_id, ci.quantity, ci.price AS line_price,
               p.id AS product_id, p.name, p.description, p.price, p.stock,
               p.image, p.category, p.is_active, p.created_at, p.updated_at
        FROM cart_items ci
        JOIN products p ON p.id = ci.product_id
        WHERE ci.user_id = $1
        ORDER BY ci.created_at
        "#,
    )
    .bind(user.user_id)
    .fetch_all(pool)
    .await?;

    let items = rows
        .into_iter()
        .map(|row| CartLineDto {
            id: row.line_id,
            quantity: row.quantity,
            price: row.line_price,
            line_total: row.line_price * Decimal::from(row.quantity),
            product: Product {
                id: row.product_id,
                name: row.name,
                description: row.description,
                price: row.price,
                stock: row.stock,
                image: row.image,
                category: row.category,
                is_active: row.is_active,
                created_at: row.created_at,
                updated_at: row.updated_at,
            },
        })
        .collect();

    Ok(CartView::from_lines(items))
}

/// Add a product to the cart, merging into an existing line. The merge is a
/// single upsert statement so concurrent adds for the same product cannot
/// lose an update. Stock checks here are advisory; checkout re-validates
/// atomically.
pub async fn add_to_cart(
    pool: &DbPool,
    user: &AuthUser,
    payload: AddToCartRequest,
) -> AppResult<ApiResponse<CartView>> {
    if payload.quantity <= 0 {
        return Err(AppError::Validation(
            "Quantity must be a positive integer".into(),
        ));
    }

    let product: Option<ProductRow> =
        sqlx::query_as("SELECT name, price, stock, is_active FROM products WHERE id = $1")
            .bind(payload.product_id)
            .fetch_optional(pool)
            .await?;
    let product = match product {
        Some(p) => p,
        None => return Err(AppError::NotFound),
    };
    if !product.is_active {
        return Err(AppError::ProductUnavailable { name: product.name });
    }

    let existing: Option<(i32,)> = sqlx::query_as(
        "SELECT quantity FROM cart_items WHERE user_id = $1 AND product_id = $2",
    )
    .bind(user.user_id)
    .bind(payload.product_id)
    .fetch_optional(pool)
    .await?;

    let requested_total = existing.map_or(0, |(q,)| q) + payload.quantity;
    if requested_total > product.stock {
        return Err(AppError::InsufficientStock {
            name: product.name,
            available: product.stock,
        });
    }

    // Merge rule: quantity accumulates, the price snapshot is refreshed to
    // the product's current price even on merge.
    sqlx::query(
        r#"
        INSERT INTO cart_items (id, user_id, product_id, quantity, price)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (user_id, product_id) DO UPDATE
        SET quantity = cart_items.quantity + EXCLUDED.quantity,
            price = EXCLUDED.price,
            updated_at = now()
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user.user_id)
    .bind(payload.product_id)
    .bind(payload.quantity)
    .bind(product.price)
    .execute(pool)
    .await?;

    if let Err(err) = log_audit(
        pool,
        Some(user.user_id),
        "cart_add",
        Some("cart_items"),
        Some(serde_json::json!({ "product_id": payload.product_id, "quantity": payload.quantity })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    let view = load_cart(pool, user).await?;
    Ok(ApiResponse::success(
        "Item added to cart",
        view,
        Some(Meta::empty()),
    ))
}

/// Set a line's quantity. Zero or negative removes the line instead of
/// failing. The price snapshot is refreshed on a quantity change.
pub async fn update_cart_item(
    pool: &DbPool,
    user: &AuthUser,
    line_id: Uuid,
    payload: UpdateCartItemRequest,
) -> AppResult<ApiResponse<CartView>> {
    if payload.quantity <= 0 {
        return remove_cart_item_inner(pool, user, line_id, "cart_update").await;
    }

    let line: Option<(Uuid, String, i32)> = sqlx::query_as(
        r#"
        SELECT p.id, p.name, p.stock
        FROM cart_items ci
        JOIN products p ON p.id = ci.product_id
        WHERE ci.id = $1 AND ci.user_id = $2
        "#,
    )
    .bind(line_id)
    .bind(user.user_id)
    .fetch_optional(pool)
    .await?;
    let (_, name, stock) = match line {
        Some(l) => l,
        None => return Err(AppError::NotFound),
    };

    if payload.quantity > stock {
        return Err(AppError::InsufficientStock {
            name,
            available: stock,
        });
    }

    let result = sqlx::query(
        r#"
        UPDATE cart_items ci
        SET quantity = $3, price = p.price, updated_at = now()
        FROM products p
        WHERE ci.id = $1 AND ci.user_id = $2 AND p.id = ci.product_id
        "#,
    )
    .bind(line_id)
    .bind(user.user_id)
    .bind(payload.quantity)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound);
    }

    if let Err(err) = log_audit(
        pool,
        Some(user.user_id),
        "cart_update",
        Some("cart_items"),
        Some(serde_json::json!({ "line_id": line_id, "quantity": payload.quantity })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    let view = load_cart(pool, user).await?;
    Ok(ApiResponse::success(
        "Cart item updated",
        view,
        Some(Meta::empty()),
    ))
}

/// Replace the whole cart in one request. Every product must exist, be
/// active, and cover the requested quantity, or the previous cart survives
/// untouched; the delete and inserts run in one transaction. A product
/// repeated in the payload collapses to its last entry.
pub async fn bulk_update(
    pool: &DbPool,
    user: &AuthUser,
    payload: BulkUpdateCartRequest,
) -> AppResult<ApiResponse<CartView>> {
    if payload.items.is_empty() {
        return Err(AppError::Validation(
            "Items array is required and cannot be empty".into(),
        ));
    }

    let mut txn = pool.begin().await?;

    sqlx::query("DELETE FROM cart_items WHERE user_id = $1")
        .bind(user.user_id)
        .execute(&mut *txn)
        .await?;

    for item in &payload.items {
        if item.quantity <= 0 {
            return Err(AppError::Validation(
                "Quantity must be a positive integer".into(),
            ));
        }

        let product: Option<ProductRow> = sqlx::query_as(
            "SELECT name, price, stock, is_active FROM products WHERE id = $1",
        )
        .bind(item.product_id)
        .fetch_optional(&mut *txn)
        .await?;
        let product = match product {
            Some(p) => p,
            None => return Err(AppError::NotFound),
        };
        if !product.is_active {
            return Err(AppError::ProductUnavailable { name: product.name });
        }
        if item.quantity > product.stock {
            return Err(AppError::InsufficientStock {
                name: product.name,
                available: product.stock,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO cart_items (id, user_id, product_id, quantity, price)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id, product_id) DO UPDATE
            SET quantity = EXCLUDED.quantity,
                price = EXCLUDED.price,
                updated_at = now()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user.user_id)
        .bind(item.product_id)
        .bind(item.quantity)
        .bind(product.price)
        .execute(&mut *txn)
        .await?;
    }

    txn.commit().await?;

    if let Err(err) = log_audit(
        pool,
        Some(user.user_id),
        "cart_bulk_update",
        Some("cart_items"),
        Some(serde_json::json!({ "item_count": payload.items.len() })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    let view = load_cart(pool, user).await?;
    Ok(ApiResponse::success(
        "Cart updated",
        view,
        Some(Meta::empty()),
    ))
}

pub async fn remove_cart_item(
    pool: &DbPool,
    user: &AuthUser,
    line_id: Uuid,
) -> AppResult<ApiResponse<CartView>> {
    remove_cart_item_inner(pool, user, line_id, "cart_remove").await
}

async fn remove_cart_item_inner(
    pool: &DbPool,
    user: &AuthUser,
    line_id: Uuid,
    action: &str,
) -> AppResult<ApiResponse<CartView>> {
    let result = sqlx::query("DELETE FROM cart_items WHERE id = $1 AND user_id = $2")
        .bind(line_id)
        .bind(user.user_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound);
    }

    if let Err(err) = log_audit(
        pool,
        Some(user.user_id),
        action,
        Some("cart_items"),
        Some(serde_json::json!({ "line_id": line_id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    let view = load_cart(pool, user).await?;
    Ok(ApiResponse::success(
        "Item removed from cart",
        view,
        Some(Meta::empty()),
    ))
}

/// Empty the cart. Used by the explicit endpoint; successful checkout clears
/// the cart inside its own transaction.
pub async fn clear_cart(pool: &DbPool, user: &AuthUser) -> AppResult<ApiResponse<CartView>> {
    sqlx::query("DELETE FROM cart_items WHERE user_id = $1")
        .bind(user.user_id)
        .execute(pool)
        .await?;

    if let Err(err) = log_audit(
        pool,
        Some(user.user_id),
        "cart_clear",
        Some("cart_items"),
        None,
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Cart cleared",
        CartView::from_lines(Vec::new()),
        Some(Meta::empty()),
    ))
}
