use utoipa::{
    Modify, OpenApi,
    openapi::{
        self,
        OpenApi as OpenApiSpec,
        security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    },
};
use utoipa_scalar::{Scalar, Servable};

use crate::{
    dto::{
        auth::{LoginRequest, LoginResponse, RegisterRequest},
        cart::{AddToCartRequest, BulkUpdateCartRequest, CartLineDto, CartView, UpdateCartItemRequest},
        orders::{
            CancelOrderRequest, CheckoutRequest, OrderList, OrderStats, OrderStatsEntry,
            OrderWithItems, ShippingAddressInput, UpdateOrderStatusRequest,
        },
        products,
        users::{UpdateRoleRequest, UpdateUserStatusRequest, UserList},
    },
    entity::orders::{OrderStatus, PaymentMethod, PaymentStatus},
    models::{Order, OrderItem, Product, ShippingAddress, User},
    response::{ApiResponse, Meta},
    routes::{admin, auth, cart, health, orders, params, products as product_routes, users},
};

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health_check,
        auth::login,
        auth::register,
        auth::me,
        users::list_users,
        users::get_user,
        users::update_role,
        users::update_user_status,
        product_routes::list_products,
        product_routes::get_product,
        product_routes::create_product,
        product_routes::update_product,
        product_routes::delete_product,
        cart::get_cart,
        cart::add_to_cart,
        cart::bulk_update_cart,
        cart::update_cart_item,
        cart::remove_cart_item,
        cart::clear_cart,
        orders::list_orders,
        orders::checkout,
        orders::get_order,
        orders::cancel_order,
        admin::list_all_orders,
        admin::order_stats,
        admin::get_order_admin,
        admin::update_order_status,
        admin::list_low_stock,
        admin::adjust_inventory
    ),
    components(
        schemas(
            User,
            RegisterRequest,
            LoginRequest,
            LoginResponse,
            UpdateRoleRequest,
            UpdateUserStatusRequest,
            UserList,
            Product,
            products::CreateProductRequest,
            products::UpdateProductRequest,
            AddToCartRequest,
            UpdateCartItemRequest,
            BulkUpdateCartRequest,
            ShippingAddress,
            Order,
            OrderItem,
            OrderStatus,
            PaymentStatus,
            PaymentMethod,
            CartLineDto,
            CartView,
            CheckoutRequest,
            ShippingAddressInput,
            CancelOrderRequest,
            UpdateOrderStatusRequest,
            OrderList,
            OrderWithItems,
            OrderStats,
            OrderStatsEntry,
            admin::InventoryAdjustRequest,
            products::ProductList,
            params::Pagination,
            params::ProductQuery,
            params::OrderListQuery,
            params::LowStockQuery,
            health::HealthData,
            Meta,
            ApiResponse<User>,
            ApiResponse<UserList>,
            ApiResponse<LoginResponse>,
            ApiResponse<Product>,
            ApiResponse<Order>,
            ApiResponse<products::ProductList>,
            ApiResponse<CartView>,
            ApiResponse<OrderWithItems>,
            ApiResponse<OrderList>,
            ApiResponse<OrderStats>
        )
    ),
    security(
        ("bearer_auth" = [])
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Health check endpoint"),
        (name = "Auth", description = "Authentication endpoints"),
        (name = "Users", description = "User management endpoints"),
        (name = "Products", description = "Product catalog endpoints"),
        (name = "Cart", description = "Cart endpoints"),
        (name = "Orders", description = "Checkout and order lifecycle endpoints"),
        (name = "Admin", description = "Admin endpoints"),
    )
)]
pub struct ApiDoc;

pub fn scalar_docs() -> Scalar<OpenApiSpec> {
    Scalar::with_url("/docs", ApiDoc::openapi())
}
