use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::Product;

#[derive(Debug, Deserialize, ToSchema)]
pub struct AddToCartRequest {
    pub product_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateCartItemRequest {
    pub quantity: i32,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct BulkUpdateCartRequest {
    pub items: Vec<AddToCartRequest>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CartLineDto {
    pub id: Uuid,
    pub product: Product,
    pub quantity: i32,
    #[schema(value_type = String)]
    pub price: Decimal,
    #[schema(value_type = String)]
    pub line_total: Decimal,
}

/// The cart as returned to clients. `total_items` and `total_amount` are
/// folds over `items`, computed on read and never stored.
#[derive(Debug, Serialize, ToSchema)]
pub struct CartView {
    pub items: Vec<CartLineDto>,
    pub total_items: i32,
    #[schema(value_type = String)]
    pub total_amount: Decimal,
}

impl CartView {
    pub fn from_lines(items: Vec<CartLineDto>) -> Self {
        let total_items = items.iter().map(|line| line.quantity).sum();
        let total_amount = items.iter().map(|line| line.line_total).sum();
        Self {
            items,
            total_items,
            total_amount,
        }
    }
}
