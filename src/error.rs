use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::entity::orders::OrderStatus;
use crate::response::{ApiResponse, Meta};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not Found")]
    NotFound,

    #[error("{0}")]
    Validation(String),

    #[error("Cart is empty")]
    EmptyCart,

    #[error("Only {available} items available for {name}")]
    InsufficientStock { name: String, available: i32 },

    #[error("Product {name} is no longer available")]
    ProductUnavailable { name: String },

    #[error("Cannot change order status from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden")]
    Forbidden,

    #[error("Database error")]
    DbError(#[from] sqlx::Error),

    #[error("ORM error")]
    OrmError(#[from] sea_orm::DbErr),

    #[error("Internal Server Error")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Stable machine-readable discriminator carried alongside the
    /// human-readable message in the error envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound => "not_found",
            AppError::Validation(_) => "validation",
            AppError::EmptyCart => "empty_cart",
            AppError::InsufficientStock { .. } => "insufficient_stock",
            AppError::ProductUnavailable { .. } => "product_unavailable",
            AppError::InvalidTransition { .. } => "invalid_transition",
            AppError::Unauthorized(_) => "unauthorized",
            AppError::Forbidden => "forbidden",
            AppError::DbError(_) | AppError::OrmError(_) | AppError::Internal(_) => "internal",
        }
    }
}

#[derive(Serialize)]
struct ErrorData {
    error: &'static str,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Validation(_) | AppError::EmptyCart | AppError::ProductUnavailable { .. } => {
                StatusCode::BAD_REQUEST
            }
            AppError::InsufficientStock { .. } | AppError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::DbError(_) | AppError::OrmError(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        // Infrastructure failures keep their generic Display message so no
        // internal detail reaches the client.
        let body = ApiResponse {
            message: self.to_string(),
            data: Some(ErrorData { error: self.kind() }),
            meta: Some(Meta::empty()),
        };

        (status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable_discriminators() {
        assert_eq!(AppError::NotFound.kind(), "not_found");
        assert_eq!(AppError::EmptyCart.kind(), "empty_cart");
        assert_eq!(
            AppError::InsufficientStock {
                name: "Widget".into(),
                available: 3,
            }
            .kind(),
            "insufficient_stock"
        );
        assert_eq!(
            AppError::InvalidTransition {
                from: OrderStatus::Delivered,
                to: OrderStatus::Cancelled,
            }
            .kind(),
            "invalid_transition"
        );
        assert_eq!(
            AppError::Internal(anyhow::anyhow!("boom")).kind(),
            "internal"
        );
    }

    #[test]
    fn kind_is_distinct_from_display_message() {
        let err = AppError::InsufficientStock {
            name: "Widget".into(),
            available: 3,
        };
        assert_eq!(err.to_string(), "Only 3 items available for Widget");
        assert_ne!(err.to_string(), err.kind());
    }
}
