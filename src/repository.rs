use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    PgConnection, PgPool, Postgres, postgres::PgRow, query_builder::QueryBuilder,
};
use tokio::time::Instant;

use crate::{
    context::RequestContext,
    error::{AppError, AppResult, FieldError},
    models::{
        Module, ModuleDetail, ModuleInput, ModuleList, NewUser, Permission,
        PermissionDetail, PermissionList, RefreshToken, Role, RoleDetail, RoleInput, RoleList, UpdateUserInput,
        User, UserAccess, UserDetail, UserList,
    },
    query::{AllowList, ListQuery, Page, QuerySpec},
    tx::TxManager,
};

// --- Allow-lists: public query keys -> qualified columns ---

pub const USER_FIELDS: AllowList = AllowList::new(&[
    ("name", "u.name"),
    ("username", "u.username"),
    ("email", "u.email"),
    ("role", "r.name"),
    ("created", "u.created_at"),
    ("updated", "u.updated_at"),
]);

pub const ROLE_FIELDS: AllowList = AllowList::new(&[
    ("name", "r.name"),
    ("is_admin", "r.is_admin"),
    ("created", "r.created_at"),
    ("updated", "r.updated_at"),
]);

pub const PERMISSION_FIELDS: AllowList = AllowList::new(&[
    ("name", "p.name"),
    ("module", "m.name"),
    ("created", "p.created_at"),
    ("updated", "p.updated_at"),
]);

pub const MODULE_FIELDS: AllowList = AllowList::new(&[
    ("name", "m.name"),
    ("created", "m.created_at"),
    ("updated", "m.updated_at"),
]);

/// Repository Trait
///
/// The persistence contract the handlers work against. Every call takes the
/// request's [`RequestContext`] so a cancelled or expired request aborts its
/// database work.
///
/// **Send + Sync + async_trait** keep `Arc<dyn Repository>` shareable across
/// Axum's task boundaries, and let tests swap in an in-memory mock.
#[async_trait]
pub trait Repository: Send + Sync {
    // --- Users ---
    async fn list_users(&self, ctx: &RequestContext, spec: &QuerySpec) -> AppResult<Page<UserList>>;
    async fn get_user(&self, ctx: &RequestContext, id: i64) -> AppResult<UserDetail>;
    // Role and admin flag of a live user; used by the auth extractor.
    async fn get_user_access(&self, ctx: &RequestContext, id: i64) -> AppResult<UserAccess>;
    async fn find_user_by_login(&self, ctx: &RequestContext, username_or_email: &str) -> AppResult<User>;
    async fn create_user(&self, ctx: &RequestContext, user: NewUser) -> AppResult<UserDetail>;
    async fn update_user(&self, ctx: &RequestContext, id: i64, input: UpdateUserInput) -> AppResult<UserDetail>;
    async fn update_password(&self, ctx: &RequestContext, id: i64, password_hash: String) -> AppResult<()>;
    // Soft delete; also revokes the user's refresh tokens.
    async fn delete_user(&self, ctx: &RequestContext, id: i64) -> AppResult<()>;

    // --- Refresh Tokens ---
    async fn store_refresh_token(
        &self,
        ctx: &RequestContext,
        user_id: i64,
        token: String,
        expired_at: DateTime<Utc>,
    ) -> AppResult<()>;
    // Atomically consumes `old_token` and stores `new_token`. Unknown or expired -> Unauthorized.
    async fn rotate_refresh_token(
        &self,
        ctx: &RequestContext,
        user_id: i64,
        old_token: String,
        new_token: String,
        expired_at: DateTime<Utc>,
    ) -> AppResult<()>;

    // --- Roles ---
    async fn list_roles(&self, ctx: &RequestContext, spec: &QuerySpec) -> AppResult<Page<RoleList>>;
    async fn get_role(&self, ctx: &RequestContext, id: i64) -> AppResult<RoleDetail>;
    async fn create_role(&self, ctx: &RequestContext, input: RoleInput) -> AppResult<RoleDetail>;
    async fn update_role(&self, ctx: &RequestContext, id: i64, input: RoleInput) -> AppResult<RoleDetail>;
    async fn delete_role(&self, ctx: &RequestContext, id: i64) -> AppResult<()>;

    // --- Permissions ---
    async fn list_permissions(&self, ctx: &RequestContext, spec: &QuerySpec) -> AppResult<Page<PermissionList>>;
    async fn get_permission(&self, ctx: &RequestContext, id: i64) -> AppResult<PermissionDetail>;

    // --- Modules ---
    async fn list_modules(&self, ctx: &RequestContext, spec: &QuerySpec) -> AppResult<Page<ModuleList>>;
    async fn get_module(&self, ctx: &RequestContext, id: i64) -> AppResult<ModuleDetail>;
    async fn create_module(&self, ctx: &RequestContext, input: ModuleInput) -> AppResult<ModuleDetail>;
    async fn update_module(&self, ctx: &RequestContext, id: i64, input: ModuleInput) -> AppResult<ModuleDetail>;
    async fn delete_module(&self, ctx: &RequestContext, id: i64) -> AppResult<()>;
}

/// RepositoryState
///
/// The concrete type used to share the persistence layer across the application state.
pub type RepositoryState = Arc<dyn Repository>;

/// PostgresRepository
///
/// The `Repository` implementation backed by PostgreSQL. Multi-statement
/// writes go through its [`TxManager`].
pub struct PostgresRepository {
    pool: PgPool,
    tx: TxManager<PgPool>,
}

impl PostgresRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            tx: TxManager::new(pool.clone()),
            pool,
        }
    }

    /// fetch_page
    ///
    /// Runs one list query and its count. `select` and `count` must both end
    /// in a `WHERE` clause; the composed scopes append to it. The count only
    /// sees the filter and search scopes so it reflects every matching row.
    async fn fetch_page<T>(
        &self,
        ctx: &RequestContext,
        location: &'static str,
        select: &str,
        count: &str,
        spec: &QuerySpec,
        allowed: &AllowList,
    ) -> AppResult<Page<T>>
    where
        T: for<'r> sqlx::FromRow<'r, PgRow> + Send + Unpin,
    {
        let query = ListQuery::compose(spec, allowed);

        let mut rows = QueryBuilder::<Postgres>::new(select);
        query.push_all(&mut rows);

        let mut total = QueryBuilder::<Postgres>::new(count);
        query.count_scope().push_predicates(&mut total);

        let items = observe(ctx, location, rows.build_query_as::<T>().fetch_all(&self.pool)).await?;
        let total_count = observe(
            ctx,
            location,
            total.build_query_scalar::<i64>().fetch_one(&self.pool),
        )
        .await?;

        Ok(Page::new(items, total_count.max(0) as u64))
    }

    async fn role_permissions(&self, ctx: &RequestContext, role_id: i64) -> AppResult<Vec<PermissionList>> {
        observe(
            ctx,
            "repository.role_permissions",
            sqlx::query_as::<_, PermissionList>(
                r#"
                SELECT p.id, p.uuid, p.name, p.module_id, m.name AS module
                FROM role_permissions rp
                JOIN permissions p ON p.id = rp.permission_id
                JOIN modules m ON m.id = p.module_id
                WHERE rp.role_id = $1 AND p.deleted_at IS NULL
                ORDER BY p.id
                "#,
            )
            .bind(role_id)
            .fetch_all(&self.pool),
        )
        .await
    }

    async fn soft_delete(
        &self,
        ctx: &RequestContext,
        location: &'static str,
        sql: &'static str,
        id: i64,
        what: &str,
    ) -> AppResult<()> {
        let result = observe(ctx, location, sqlx::query(sql).bind(id).execute(&self.pool)).await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(what.to_string()));
        }
        Ok(())
    }
}

/// Runs one database call under the request's deadline and cancellation,
/// logging its duration and any failure.
async fn observe<T, F>(ctx: &RequestContext, location: &'static str, fut: F) -> AppResult<T>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    let started = Instant::now();
    let result = ctx.run(async { fut.await.map_err(AppError::from) }).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match &result {
        Ok(_) => tracing::debug!(location, identifier = %ctx.identifier(), elapsed_ms, "query ok"),
        Err(e) if e.status_code().is_server_error() => tracing::error!(
            location,
            identifier = %ctx.identifier(),
            elapsed_ms,
            error = %e,
            "query failed"
        ),
        Err(e) => tracing::warn!(
            location,
            identifier = %ctx.identifier(),
            elapsed_ms,
            error = %e,
            "query rejected"
        ),
    }

    result
}

/// Fails with `permissions/exists` unless every id names a live permission.
async fn ensure_permissions_exist(conn: &mut PgConnection, ids: &[i64]) -> AppResult<()> {
    let found: Vec<Permission> = sqlx::query_as(
        r#"
        SELECT id, uuid, module_id, name, created_at, updated_at, deleted_at
        FROM permissions
        WHERE id = ANY($1) AND deleted_at IS NULL
        "#,
    )
    .bind(ids)
    .fetch_all(&mut *conn)
    .await?;

    let missing: Vec<i64> = ids
        .iter()
        .copied()
        .filter(|id| !found.iter().any(|p| p.id == *id))
        .collect();

    if !missing.is_empty() {
        tracing::debug!(location = "repository.ensure_permissions_exist", ?missing, "unknown permission ids");
        return Err(AppError::Validation(vec![FieldError::new("permissions", "exists")]));
    }
    Ok(())
}

async fn link_permissions(conn: &mut PgConnection, role_id: i64, ids: &[i64]) -> AppResult<()> {
    ensure_permissions_exist(conn, ids).await?;
    sqlx::query(
        r#"
        INSERT INTO role_permissions (role_id, permission_id)
        SELECT $1, UNNEST($2::BIGINT[])
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(role_id)
    .bind(ids)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn replace_role(conn: &mut PgConnection, id: i64, input: &RoleInput) -> AppResult<()> {
    let updated = sqlx::query(
        "UPDATE roles SET name = $1, is_admin = $2, updated_at = NOW() WHERE id = $3 AND deleted_at IS NULL",
    )
    .bind(input.name.trim())
    .bind(input.is_admin)
    .bind(id)
    .execute(&mut *conn)
    .await?;

    if updated.rows_affected() == 0 {
        return Err(AppError::NotFound("Role".to_string()));
    }

    sqlx::query("DELETE FROM role_permissions WHERE role_id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await?;

    link_permissions(conn, id, &input.permissions).await
}

const USER_DETAIL_SELECT: &str = r#"
    SELECT u.id, u.uuid, u.role_id, r.name AS role, u.name, u.username, u.email,
           u.validated_at, u.created_at, u.updated_at
    FROM users u
    JOIN roles r ON r.id = u.role_id
    WHERE u.id = $1 AND u.deleted_at IS NULL
"#;

#[async_trait]
impl Repository for PostgresRepository {
    async fn list_users(&self, ctx: &RequestContext, spec: &QuerySpec) -> AppResult<Page<UserList>> {
        self.fetch_page(
            ctx,
            "repository.list_users",
            "SELECT u.id, u.uuid, u.name, u.username, u.email, r.name AS role \
             FROM users u JOIN roles r ON r.id = u.role_id WHERE u.deleted_at IS NULL",
            "SELECT COUNT(*) FROM users u JOIN roles r ON r.id = u.role_id WHERE u.deleted_at IS NULL",
            spec,
            &USER_FIELDS,
        )
        .await
    }

    async fn get_user(&self, ctx: &RequestContext, id: i64) -> AppResult<UserDetail> {
        observe(
            ctx,
            "repository.get_user",
            sqlx::query_as::<_, UserDetail>(USER_DETAIL_SELECT)
                .bind(id)
                .fetch_optional(&self.pool),
        )
        .await?
        .ok_or_else(|| AppError::NotFound("User".to_string()))
    }

    async fn get_user_access(&self, ctx: &RequestContext, id: i64) -> AppResult<UserAccess> {
        observe(
            ctx,
            "repository.get_user_access",
            sqlx::query_as::<_, UserAccess>(
                r#"
                SELECT u.id, u.role_id, r.is_admin
                FROM users u
                JOIN roles r ON r.id = u.role_id
                WHERE u.id = $1 AND u.deleted_at IS NULL AND r.deleted_at IS NULL
                "#,
            )
            .bind(id)
            .fetch_optional(&self.pool),
        )
        .await?
        .ok_or(AppError::Unauthorized)
    }

    async fn find_user_by_login(&self, ctx: &RequestContext, username_or_email: &str) -> AppResult<User> {
        observe(
            ctx,
            "repository.find_user_by_login",
            sqlx::query_as::<_, User>(
                r#"
                SELECT id, uuid, role_id, username, name, email, password,
                       validated_at, created_at, updated_at, deleted_at
                FROM users
                WHERE (username = $1 OR email = $1) AND deleted_at IS NULL
                "#,
            )
            .bind(username_or_email.trim())
            .fetch_optional(&self.pool),
        )
        .await?
        .ok_or_else(|| AppError::NotFound("User".to_string()))
    }

    async fn create_user(&self, ctx: &RequestContext, user: NewUser) -> AppResult<UserDetail> {
        let id: i64 = observe(
            ctx,
            "repository.create_user",
            sqlx::query_scalar(
                r#"
                INSERT INTO users (role_id, username, name, email, password)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING id
                "#,
            )
            .bind(user.role_id)
            .bind(user.username.trim())
            .bind(user.name.trim())
            .bind(user.email.trim())
            .bind(&user.password_hash)
            .fetch_one(&self.pool),
        )
        .await?;

        self.get_user(ctx, id).await
    }

    async fn update_user(&self, ctx: &RequestContext, id: i64, input: UpdateUserInput) -> AppResult<UserDetail> {
        let updated = observe(
            ctx,
            "repository.update_user",
            sqlx::query(
                r#"
                UPDATE users
                SET role_id = $1, username = $2, name = $3, email = $4, updated_at = NOW()
                WHERE id = $5 AND deleted_at IS NULL
                "#,
            )
            .bind(input.role_id)
            .bind(input.username.trim())
            .bind(input.name.trim())
            .bind(input.email.trim())
            .bind(id)
            .execute(&self.pool),
        )
        .await?;

        if updated.rows_affected() == 0 {
            return Err(AppError::NotFound("User".to_string()));
        }
        self.get_user(ctx, id).await
    }

    async fn update_password(&self, ctx: &RequestContext, id: i64, password_hash: String) -> AppResult<()> {
        let updated = observe(
            ctx,
            "repository.update_password",
            sqlx::query(
                "UPDATE users SET password = $1, updated_at = NOW() WHERE id = $2 AND deleted_at IS NULL",
            )
            .bind(&password_hash)
            .bind(id)
            .execute(&self.pool),
        )
        .await?;

        if updated.rows_affected() == 0 {
            return Err(AppError::NotFound("User".to_string()));
        }
        Ok(())
    }

    async fn delete_user(&self, ctx: &RequestContext, id: i64) -> AppResult<()> {
        self.tx
            .transaction(ctx, move |conn| {
                Box::pin(async move {
                    let deleted = sqlx::query(
                        "UPDATE users SET deleted_at = NOW() WHERE id = $1 AND deleted_at IS NULL",
                    )
                    .bind(id)
                    .execute(&mut **conn)
                    .await?;

                    if deleted.rows_affected() == 0 {
                        return Err(AppError::NotFound("User".to_string()));
                    }

                    sqlx::query("DELETE FROM refresh_tokens WHERE user_id = $1")
                        .bind(id)
                        .execute(&mut **conn)
                        .await?;
                    Ok(())
                })
            })
            .await
    }

    async fn store_refresh_token(
        &self,
        ctx: &RequestContext,
        user_id: i64,
        token: String,
        expired_at: DateTime<Utc>,
    ) -> AppResult<()> {
        observe(
            ctx,
            "repository.store_refresh_token",
            sqlx::query("INSERT INTO refresh_tokens (user_id, token, expired_at) VALUES ($1, $2, $3)")
                .bind(user_id)
                .bind(&token)
                .bind(expired_at)
                .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn rotate_refresh_token(
        &self,
        ctx: &RequestContext,
        user_id: i64,
        old_token: String,
        new_token: String,
        expired_at: DateTime<Utc>,
    ) -> AppResult<()> {
        self.tx
            .transaction(ctx, move |conn| {
                Box::pin(async move {
                    let consumed: Option<RefreshToken> = sqlx::query_as(
                        r#"
                        DELETE FROM refresh_tokens
                        WHERE token = $1 AND user_id = $2 AND expired_at > NOW()
                        RETURNING id, user_id, token, expired_at, created_at
                        "#,
                    )
                    .bind(&old_token)
                    .bind(user_id)
                    .fetch_optional(&mut **conn)
                    .await?;

                    let Some(consumed) = consumed else {
                        return Err(AppError::Unauthorized);
                    };
                    tracing::debug!(
                        location = "repository.rotate_refresh_token",
                        token_id = consumed.id,
                        issued_at = %consumed.created_at,
                        "refresh token consumed"
                    );

                    sqlx::query(
                        "INSERT INTO refresh_tokens (user_id, token, expired_at) VALUES ($1, $2, $3)",
                    )
                    .bind(user_id)
                    .bind(&new_token)
                    .bind(expired_at)
                    .execute(&mut **conn)
                    .await?;
                    Ok(())
                })
            })
            .await
    }

    async fn list_roles(&self, ctx: &RequestContext, spec: &QuerySpec) -> AppResult<Page<RoleList>> {
        self.fetch_page(
            ctx,
            "repository.list_roles",
            "SELECT r.id, r.uuid, r.name, r.is_admin FROM roles r WHERE r.deleted_at IS NULL",
            "SELECT COUNT(*) FROM roles r WHERE r.deleted_at IS NULL",
            spec,
            &ROLE_FIELDS,
        )
        .await
    }

    async fn get_role(&self, ctx: &RequestContext, id: i64) -> AppResult<RoleDetail> {
        let role = observe(
            ctx,
            "repository.get_role",
            sqlx::query_as::<_, Role>(
                r#"
                SELECT id, uuid, name, is_admin, created_at, updated_at, deleted_at
                FROM roles
                WHERE id = $1 AND deleted_at IS NULL
                "#,
            )
            .bind(id)
            .fetch_optional(&self.pool),
        )
        .await?
        .ok_or_else(|| AppError::NotFound("Role".to_string()))?;

        let permissions = self.role_permissions(ctx, role.id).await?;
        Ok(RoleDetail::from_role(role, permissions))
    }

    /// create_role
    ///
    /// Inserts the role and its permission links as one unit through
    /// `TxManager::transaction`: any failure leaves neither behind.
    async fn create_role(&self, ctx: &RequestContext, input: RoleInput) -> AppResult<RoleDetail> {
        let id = self
            .tx
            .transaction(ctx, move |conn| {
                Box::pin(async move {
                    let id: i64 = sqlx::query_scalar(
                        "INSERT INTO roles (name, is_admin) VALUES ($1, $2) RETURNING id",
                    )
                    .bind(input.name.trim())
                    .bind(input.is_admin)
                    .fetch_one(&mut **conn)
                    .await?;

                    link_permissions(&mut **conn, id, &input.permissions).await?;
                    Ok::<_, AppError>(id)
                })
            })
            .await?;

        self.get_role(ctx, id).await
    }

    /// update_role
    ///
    /// Replaces the role row and its permission set with the manual API:
    /// `begin_tx`, work on the handle, then `deferred_cleanup` decides
    /// commit or rollback from the outcome.
    async fn update_role(&self, ctx: &RequestContext, id: i64, input: RoleInput) -> AppResult<RoleDetail> {
        let mut handle = self.tx.begin_tx(ctx).await?;

        let outcome = match handle.conn() {
            Ok(conn) => ctx.run(replace_role(&mut **conn, id, &input)).await,
            Err(e) => Err(e),
        };

        self.tx.deferred_cleanup(handle, outcome).await?;
        self.get_role(ctx, id).await
    }

    async fn delete_role(&self, ctx: &RequestContext, id: i64) -> AppResult<()> {
        self.soft_delete(
            ctx,
            "repository.delete_role",
            "UPDATE roles SET deleted_at = NOW() WHERE id = $1 AND deleted_at IS NULL",
            id,
            "Role",
        )
        .await
    }

    async fn list_permissions(&self, ctx: &RequestContext, spec: &QuerySpec) -> AppResult<Page<PermissionList>> {
        self.fetch_page(
            ctx,
            "repository.list_permissions",
            "SELECT p.id, p.uuid, p.name, p.module_id, m.name AS module \
             FROM permissions p JOIN modules m ON m.id = p.module_id WHERE p.deleted_at IS NULL",
            "SELECT COUNT(*) FROM permissions p JOIN modules m ON m.id = p.module_id WHERE p.deleted_at IS NULL",
            spec,
            &PERMISSION_FIELDS,
        )
        .await
    }

    async fn get_permission(&self, ctx: &RequestContext, id: i64) -> AppResult<PermissionDetail> {
        observe(
            ctx,
            "repository.get_permission",
            sqlx::query_as::<_, PermissionDetail>(
                r#"
                SELECT p.id, p.uuid, p.name, p.module_id, m.name AS module, p.created_at, p.updated_at
                FROM permissions p
                JOIN modules m ON m.id = p.module_id
                WHERE p.id = $1 AND p.deleted_at IS NULL
                "#,
            )
            .bind(id)
            .fetch_optional(&self.pool),
        )
        .await?
        .ok_or_else(|| AppError::NotFound("Permission".to_string()))
    }

    async fn list_modules(&self, ctx: &RequestContext, spec: &QuerySpec) -> AppResult<Page<ModuleList>> {
        self.fetch_page(
            ctx,
            "repository.list_modules",
            "SELECT m.id, m.uuid, m.name FROM modules m WHERE m.deleted_at IS NULL",
            "SELECT COUNT(*) FROM modules m WHERE m.deleted_at IS NULL",
            spec,
            &MODULE_FIELDS,
        )
        .await
    }

    async fn get_module(&self, ctx: &RequestContext, id: i64) -> AppResult<ModuleDetail> {
        let module = observe(
            ctx,
            "repository.get_module",
            sqlx::query_as::<_, Module>(
                "SELECT id, uuid, name, created_at, updated_at, deleted_at FROM modules WHERE id = $1 AND deleted_at IS NULL",
            )
            .bind(id)
            .fetch_optional(&self.pool),
        )
        .await?
        .ok_or_else(|| AppError::NotFound("Module".to_string()))?;

        let permissions = observe(
            ctx,
            "repository.get_module",
            sqlx::query_as::<_, PermissionList>(
                r#"
                SELECT p.id, p.uuid, p.name, p.module_id, m.name AS module
                FROM permissions p
                JOIN modules m ON m.id = p.module_id
                WHERE p.module_id = $1 AND p.deleted_at IS NULL
                ORDER BY p.id
                "#,
            )
            .bind(module.id)
            .fetch_all(&self.pool),
        )
        .await?;

        Ok(ModuleDetail::from_module(module, permissions))
    }

    async fn create_module(&self, ctx: &RequestContext, input: ModuleInput) -> AppResult<ModuleDetail> {
        let id: i64 = observe(
            ctx,
            "repository.create_module",
            sqlx::query_scalar("INSERT INTO modules (name) VALUES ($1) RETURNING id")
                .bind(input.name.trim())
                .fetch_one(&self.pool),
        )
        .await?;

        self.get_module(ctx, id).await
    }

    async fn update_module(&self, ctx: &RequestContext, id: i64, input: ModuleInput) -> AppResult<ModuleDetail> {
        let updated = observe(
            ctx,
            "repository.update_module",
            sqlx::query(
                "UPDATE modules SET name = $1, updated_at = NOW() WHERE id = $2 AND deleted_at IS NULL",
            )
            .bind(input.name.trim())
            .bind(id)
            .execute(&self.pool),
        )
        .await?;

        if updated.rows_affected() == 0 {
            return Err(AppError::NotFound("Module".to_string()));
        }
        self.get_module(ctx, id).await
    }

    async fn delete_module(&self, ctx: &RequestContext, id: i64) -> AppResult<()> {
        self.soft_delete(
            ctx,
            "repository.delete_module",
            "UPDATE modules SET deleted_at = NOW() WHERE id = $1 AND deleted_at IS NULL",
            id,
            "Module",
        )
        .await
    }
}
