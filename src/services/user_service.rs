use uuid::Uuid;

use crate::{
    audit::log_audit,
    db::DbPool,
    dto::users::UserList,
    error::{AppError, AppResult},
    middleware::auth::{AuthUser, ROLE_ADMIN, ROLE_CUSTOMER, ensure_admin},
    models::User,
    response::{ApiResponse, Meta},
    routes::params::UserQuery,
};

fn validate_role(role: &str) -> Result<(), AppError> {
    if role != ROLE_CUSTOMER && role != ROLE_ADMIN {
        return Err(AppError::Validation(
            "Role must be either \"customer\" or \"admin\"".into(),
        ));
    }
    Ok(())
}

/// The caller's own account.
pub async fn get_me(pool: &DbPool, user: &AuthUser) -> AppResult<ApiResponse<User>> {
    let me: Option<User> = sqlx::query_as("SELECT * FROM users WHERE id = $1")
        .bind(user.user_id)
        .fetch_optional(pool)
        .await?;
    let me = match me {
        Some(u) => u,
        None => return Err(AppError::NotFound),
    };
    Ok(ApiResponse::success("OK", me, Some(Meta::empty())))
}

pub async fn list_users(
    pool: &DbPool,
    user: &AuthUser,
    query: UserQuery,
) -> AppResult<ApiResponse<UserList>> {
    ensure_admin(user)?;
    let (page, limit, offset) = query.pagination.normalize();
    let pattern = query
        .q
        .as_deref()
        .filter(|q| !q.is_empty())
        .map(|q| format!("%{q}%"));

    let total: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM users WHERE ($1::text IS NULL OR email ILIKE $1)",
    )
    .bind(pattern.as_deref())
    .fetch_one(pool)
    .await?;

    let items: Vec<User> = sqlx::query_as(
        r#"
        SELECT * FROM users
        WHERE ($1::text IS NULL OR email ILIKE $1)
        ORDER BY created_at DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(pattern.as_deref())
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    let meta = Meta::new(page, limit, total.0);
    Ok(ApiResponse::success("Users", UserList { items }, Some(meta)))
}

pub async fn get_user(pool: &DbPool, user: &AuthUser, id: Uuid) -> AppResult<ApiResponse<User>> {
    ensure_admin(user)?;
    let found: Option<User> = sqlx::query_as("SELECT * FROM users WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    let found = match found {
        Some(u) => u,
        None => return Err(AppError::NotFound),
    };
    Ok(ApiResponse::success("User found", found, Some(Meta::empty())))
}

/// Promote or demote an account. Admins cannot change their own role, so the
/// system cannot be left without an admin by accident.
pub async fn update_role(
    pool: &DbPool,
    user: &AuthUser,
    id: Uuid,
    role: &str,
) -> AppResult<ApiResponse<User>> {
    ensure_admin(user)?;
    validate_role(role)?;
    if id == user.user_id {
        return Err(AppError::Validation("Cannot change your own role".into()));
    }

    let updated: Option<User> =
        sqlx::query_as("UPDATE users SET role = $2 WHERE id = $1 RETURNING *")
            .bind(id)
            .bind(role)
            .fetch_optional(pool)
            .await?;
    let updated = match updated {
        Some(u) => u,
        None => return Err(AppError::NotFound),
    };

    if let Err(err) = log_audit(
        pool,
        Some(user.user_id),
        "user_role_update",
        Some("users"),
        Some(serde_json::json!({ "user_id": updated.id, "role": role })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        format!("User role updated to {role}"),
        updated,
        Some(Meta::empty()),
    ))
}

/// Activate or deactivate an account. Deactivated accounts keep their rows
/// and history but can no longer log in. Self-deactivation is rejected.
pub async fn update_status(
    pool: &DbPool,
    user: &AuthUser,
    id: Uuid,
    is_active: bool,
) -> AppResult<ApiResponse<User>> {
    ensure_admin(user)?;
    if id == user.user_id && !is_active {
        return Err(AppError::Validation(
            "Cannot deactivate your own account".into(),
        ));
    }

    let updated: Option<User> =
        sqlx::query_as("UPDATE users SET is_active = $2 WHERE id = $1 RETURNING *")
            .bind(id)
            .bind(is_active)
            .fetch_optional(pool)
            .await?;
    let updated = match updated {
        Some(u) => u,
        None => return Err(AppError::NotFound),
    };

    if let Err(err) = log_audit(
        pool,
        Some(user.user_id),
        "user_status_update",
        Some("users"),
        Some(serde_json::json!({ "user_id": updated.id, "is_active": is_active })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    let action = if is_active { "activated" } else { "deactivated" };
    Ok(ApiResponse::success(
        format!("User {action} successfully"),
        updated,
        Some(Meta::empty()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_known_roles_are_accepted() {
        assert!(validate_role("customer").is_ok());
        assert!(validate_role("admin").is_ok());
        assert!(matches!(
            validate_role("superuser"),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(validate_role(""), Err(AppError::Validation(_))));
    }
}
