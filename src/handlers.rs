use crate::{
    AppState,
    auth::{self, AuthUser, TokenKind},
    context::RequestContext,
    error::{AppError, AppResult, FieldError},
    models::{
        CreateUserInput, LoginInput, ModuleDetail, ModuleInput, ModuleList, NewUser,
        PermissionDetail, PermissionList, RefreshInput, ResetPasswordInput, RoleDetail, RoleInput,
        RoleList, TokenPair, UpdateUserInput, UserDetail, UserList,
    },
    pagination::PaginationMeta,
    query::{ListParams, Page, QuerySpec},
    response::ApiResponse,
};
use axum::{
    Json,
    extract::{
        OriginalUri, Path, Query, State,
        rejection::{JsonRejection, PathRejection},
    },
    http::StatusCode,
};

// --- Extraction Helpers ---

/// Unwraps a JSON body, turning axum's rejection into the envelope's 400.
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> AppResult<T> {
    payload.map(|Json(value)| value).map_err(|rejection| {
        tracing::debug!(error = %rejection, "request body rejected");
        AppError::BadRequest("Invalid or malformed request body".to_string())
    })
}

fn path_id(path: Result<Path<i64>, PathRejection>) -> AppResult<i64> {
    match path {
        Ok(Path(id)) if id > 0 => Ok(id),
        _ => Err(AppError::BadRequest("Invalid ID format".to_string())),
    }
}

fn validated(errors: Vec<FieldError>) -> AppResult<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(AppError::Validation(errors))
    }
}

/// Wraps one page of results in the envelope with its pagination block,
/// whose links are derived from the URL the client actually requested.
fn page_response<T>(
    ctx: &RequestContext,
    message: &str,
    spec: &QuerySpec,
    uri: &OriginalUri,
    page: Page<T>,
) -> ApiResponse<Vec<T>> {
    let pagination = PaginationMeta::build(spec, &uri.0.to_string(), page.total_count);
    ApiResponse::ok(message, page.items)
        .with_pagination(pagination)
        .with_request_id(ctx.request_id.clone())
}

// --- Auth ---

/// login
///
/// [Public Route] Exchanges username-or-email and password for an access and
/// refresh token pair. The refresh token is persisted so it can be rotated.
/// Unknown user and wrong password produce the same 400.
#[utoipa::path(
    post,
    path = "/api/v1/auth/login",
    request_body = LoginInput,
    responses(
        (status = 200, description = "Logged in", body = TokenPair),
        (status = 400, description = "Invalid credentials")
    )
)]
pub async fn login(
    State(state): State<AppState>,
    ctx: RequestContext,
    payload: Result<Json<LoginInput>, JsonRejection>,
) -> AppResult<ApiResponse<TokenPair>> {
    let input = body(payload)?;
    validated(input.validate())?;

    let invalid = || AppError::BadRequest("Invalid email / username or password".to_string());

    let user = match state.repo.find_user_by_login(&ctx, &input.username_or_email).await {
        Ok(user) => user,
        Err(AppError::NotFound(_)) => return Err(invalid()),
        Err(e) => return Err(e),
    };

    if !auth::verify_password(input.password, user.password.clone()).await {
        return Err(invalid());
    }

    let (pair, refresh_expires_at) = auth::issue_pair(user.id, &state.config)?;
    state
        .repo
        .store_refresh_token(&ctx, user.id, pair.refresh_token.clone(), refresh_expires_at)
        .await?;

    tracing::info!(location = "handlers.login", identifier = %ctx.identifier(), user_id = user.id, "user logged in");
    Ok(ApiResponse::ok(format!("{} user successfully login", user.name), pair)
        .with_request_id(ctx.request_id.clone()))
}

/// refresh
///
/// [Public Route] Rotates a refresh token: the presented token is consumed
/// and a new pair is issued, atomically. A token can be used only once.
#[utoipa::path(
    post,
    path = "/api/v1/auth/refresh",
    request_body = RefreshInput,
    responses(
        (status = 200, description = "Token refreshed", body = TokenPair),
        (status = 401, description = "Unknown, expired or reused refresh token")
    )
)]
pub async fn refresh(
    State(state): State<AppState>,
    ctx: RequestContext,
    payload: Result<Json<RefreshInput>, JsonRejection>,
) -> AppResult<ApiResponse<TokenPair>> {
    let input = body(payload)?;
    if input.refresh_token.trim().is_empty() {
        return Err(AppError::Validation(vec![FieldError::new("refresh_token", "required")]));
    }

    let claims = auth::verify_token(&input.refresh_token, TokenKind::Refresh, &state.config)?;
    let (pair, refresh_expires_at) = auth::issue_pair(claims.sub, &state.config)?;

    state
        .repo
        .rotate_refresh_token(
            &ctx,
            claims.sub,
            input.refresh_token,
            pair.refresh_token.clone(),
            refresh_expires_at,
        )
        .await?;

    Ok(ApiResponse::ok("Token successfully refreshed", pair).with_request_id(ctx.request_id.clone()))
}

// --- Users ---

/// list_users
///
/// [Admin Route] Paginated user list. Accepts the common list parameters;
/// sortable/filterable keys: `name`, `username`, `email`, `role`, `created`, `updated`.
#[utoipa::path(
    get,
    path = "/api/v1/users",
    params(ListParams),
    responses((status = 200, description = "User data found", body = [UserList]))
)]
pub async fn list_users(
    State(state): State<AppState>,
    ctx: RequestContext,
    uri: OriginalUri,
    Query(params): Query<ListParams>,
) -> AppResult<ApiResponse<Vec<UserList>>> {
    let spec = QuerySpec::parse(&params, state.config.page_defaults);
    let page = state.repo.list_users(&ctx, &spec).await?;
    Ok(page_response(&ctx, "User data found", &spec, &uri, page))
}

/// get_user
///
/// [Authenticated Route] A user may read their own record; admins may read any.
#[utoipa::path(
    get,
    path = "/api/v1/users/{id}",
    params(("id" = i64, Path, description = "User id")),
    responses(
        (status = 200, description = "User data found", body = UserDetail),
        (status = 403, description = "Not self or admin"),
        (status = 404, description = "User not found")
    )
)]
pub async fn get_user(
    user: AuthUser,
    State(state): State<AppState>,
    ctx: RequestContext,
    path: Result<Path<i64>, PathRejection>,
) -> AppResult<ApiResponse<UserDetail>> {
    let id = path_id(path)?;
    user.require_self_or_admin(id)?;

    let detail = state.repo.get_user(&ctx, id).await?;
    Ok(ApiResponse::ok("User data found", detail).with_request_id(ctx.request_id.clone()))
}

#[utoipa::path(
    post,
    path = "/api/v1/users",
    request_body = CreateUserInput,
    responses(
        (status = 201, description = "User successfully created", body = UserDetail),
        (status = 400, description = "Validation failed")
    )
)]
pub async fn create_user(
    State(state): State<AppState>,
    ctx: RequestContext,
    payload: Result<Json<CreateUserInput>, JsonRejection>,
) -> AppResult<ApiResponse<UserDetail>> {
    let input = body(payload)?;
    validated(input.validate())?;

    let password_hash = auth::hash_password(input.password).await?;
    let new_user = NewUser {
        role_id: input.role_id,
        username: input.username,
        name: input.name,
        email: input.email,
        password_hash,
    };

    let detail = state.repo.create_user(&ctx, new_user).await?;
    Ok(ApiResponse::created("User successfully created", detail).with_request_id(ctx.request_id.clone()))
}

/// update_user
///
/// [Authenticated Route] Self-or-admin. Only admins may move a user to another role.
#[utoipa::path(
    put,
    path = "/api/v1/users/{id}",
    params(("id" = i64, Path, description = "User id")),
    request_body = UpdateUserInput,
    responses(
        (status = 200, description = "User successfully updated", body = UserDetail),
        (status = 403, description = "Not self or admin")
    )
)]
pub async fn update_user(
    user: AuthUser,
    State(state): State<AppState>,
    ctx: RequestContext,
    path: Result<Path<i64>, PathRejection>,
    payload: Result<Json<UpdateUserInput>, JsonRejection>,
) -> AppResult<ApiResponse<UserDetail>> {
    let id = path_id(path)?;
    user.require_self_or_admin(id)?;

    let input = body(payload)?;
    validated(input.validate())?;

    if !user.is_admin && input.role_id != user.role_id {
        return Err(AppError::Forbidden);
    }

    let detail = state.repo.update_user(&ctx, id, input).await?;
    Ok(ApiResponse::ok("User successfully updated", detail).with_request_id(ctx.request_id.clone()))
}

#[utoipa::path(
    put,
    path = "/api/v1/users/{id}/reset-password",
    params(("id" = i64, Path, description = "User id")),
    request_body = ResetPasswordInput,
    responses((status = 200, description = "Password successfully reset"))
)]
pub async fn reset_password(
    State(state): State<AppState>,
    ctx: RequestContext,
    path: Result<Path<i64>, PathRejection>,
    payload: Result<Json<ResetPasswordInput>, JsonRejection>,
) -> AppResult<ApiResponse<()>> {
    let id = path_id(path)?;
    let input = body(payload)?;
    validated(input.validate())?;

    let password_hash = auth::hash_password(input.password).await?;
    state.repo.update_password(&ctx, id, password_hash).await?;

    Ok(ApiResponse::message(StatusCode::OK, "Password successfully reset").with_request_id(ctx.request_id.clone()))
}

#[utoipa::path(
    delete,
    path = "/api/v1/users/{id}",
    params(("id" = i64, Path, description = "User id")),
    responses(
        (status = 200, description = "User successfully deleted"),
        (status = 404, description = "User not found")
    )
)]
pub async fn delete_user(
    user: AuthUser,
    State(state): State<AppState>,
    ctx: RequestContext,
    path: Result<Path<i64>, PathRejection>,
) -> AppResult<ApiResponse<()>> {
    let id = path_id(path)?;
    if id == user.id {
        return Err(AppError::BadRequest("Cannot delete your own account".to_string()));
    }

    state.repo.delete_user(&ctx, id).await?;
    Ok(ApiResponse::message(StatusCode::OK, "User successfully deleted").with_request_id(ctx.request_id.clone()))
}

// --- Roles ---

/// list_roles
///
/// [Authenticated Route] Sortable/filterable keys: `name`, `is_admin`, `created`, `updated`.
#[utoipa::path(
    get,
    path = "/api/v1/roles",
    params(ListParams),
    responses((status = 200, description = "Role data found", body = [RoleList]))
)]
pub async fn list_roles(
    State(state): State<AppState>,
    ctx: RequestContext,
    uri: OriginalUri,
    Query(params): Query<ListParams>,
) -> AppResult<ApiResponse<Vec<RoleList>>> {
    let spec = QuerySpec::parse(&params, state.config.page_defaults);
    let page = state.repo.list_roles(&ctx, &spec).await?;
    Ok(page_response(&ctx, "Role data found", &spec, &uri, page))
}

#[utoipa::path(
    get,
    path = "/api/v1/roles/{id}",
    params(("id" = i64, Path, description = "Role id")),
    responses(
        (status = 200, description = "Role data found", body = RoleDetail),
        (status = 404, description = "Role not found")
    )
)]
pub async fn get_role(
    State(state): State<AppState>,
    ctx: RequestContext,
    path: Result<Path<i64>, PathRejection>,
) -> AppResult<ApiResponse<RoleDetail>> {
    let id = path_id(path)?;
    let detail = state.repo.get_role(&ctx, id).await?;
    Ok(ApiResponse::ok("Role data found", detail).with_request_id(ctx.request_id.clone()))
}

/// create_role
///
/// [Admin Route] Creates the role and links its permissions in one transaction.
#[utoipa::path(
    post,
    path = "/api/v1/roles",
    request_body = RoleInput,
    responses(
        (status = 201, description = "Role successfully created", body = RoleDetail),
        (status = 400, description = "Validation failed")
    )
)]
pub async fn create_role(
    State(state): State<AppState>,
    ctx: RequestContext,
    payload: Result<Json<RoleInput>, JsonRejection>,
) -> AppResult<ApiResponse<RoleDetail>> {
    let input = body(payload)?;
    validated(input.validate())?;

    let detail = state.repo.create_role(&ctx, input).await?;
    Ok(ApiResponse::created("Role successfully created", detail).with_request_id(ctx.request_id.clone()))
}

/// update_role
///
/// [Admin Route] Replaces the role's name, admin flag and whole permission set.
#[utoipa::path(
    put,
    path = "/api/v1/roles/{id}",
    params(("id" = i64, Path, description = "Role id")),
    request_body = RoleInput,
    responses(
        (status = 200, description = "Role successfully updated", body = RoleDetail),
        (status = 404, description = "Role not found")
    )
)]
pub async fn update_role(
    State(state): State<AppState>,
    ctx: RequestContext,
    path: Result<Path<i64>, PathRejection>,
    payload: Result<Json<RoleInput>, JsonRejection>,
) -> AppResult<ApiResponse<RoleDetail>> {
    let id = path_id(path)?;
    let input = body(payload)?;
    validated(input.validate())?;

    let detail = state.repo.update_role(&ctx, id, input).await?;
    Ok(ApiResponse::ok("Role successfully updated", detail).with_request_id(ctx.request_id.clone()))
}

#[utoipa::path(
    delete,
    path = "/api/v1/roles/{id}",
    params(("id" = i64, Path, description = "Role id")),
    responses(
        (status = 200, description = "Role successfully deleted"),
        (status = 404, description = "Role not found")
    )
)]
pub async fn delete_role(
    State(state): State<AppState>,
    ctx: RequestContext,
    path: Result<Path<i64>, PathRejection>,
) -> AppResult<ApiResponse<()>> {
    let id = path_id(path)?;
    state.repo.delete_role(&ctx, id).await?;
    Ok(ApiResponse::message(StatusCode::OK, "Role successfully deleted").with_request_id(ctx.request_id.clone()))
}

// --- Permissions ---

#[utoipa::path(
    get,
    path = "/api/v1/permissions",
    params(ListParams),
    responses((status = 200, description = "Permission data found", body = [PermissionList]))
)]
pub async fn list_permissions(
    State(state): State<AppState>,
    ctx: RequestContext,
    uri: OriginalUri,
    Query(params): Query<ListParams>,
) -> AppResult<ApiResponse<Vec<PermissionList>>> {
    let spec = QuerySpec::parse(&params, state.config.page_defaults);
    let page = state.repo.list_permissions(&ctx, &spec).await?;
    Ok(page_response(&ctx, "Permission data found", &spec, &uri, page))
}

#[utoipa::path(
    get,
    path = "/api/v1/permissions/{id}",
    params(("id" = i64, Path, description = "Permission id")),
    responses(
        (status = 200, description = "Permission data found", body = PermissionDetail),
        (status = 404, description = "Permission not found")
    )
)]
pub async fn get_permission(
    State(state): State<AppState>,
    ctx: RequestContext,
    path: Result<Path<i64>, PathRejection>,
) -> AppResult<ApiResponse<PermissionDetail>> {
    let id = path_id(path)?;
    let detail = state.repo.get_permission(&ctx, id).await?;
    Ok(ApiResponse::ok("Permission data found", detail).with_request_id(ctx.request_id.clone()))
}

// --- Modules ---

#[utoipa::path(
    get,
    path = "/api/v1/modules",
    params(ListParams),
    responses((status = 200, description = "Module data found", body = [ModuleList]))
)]
pub async fn list_modules(
    State(state): State<AppState>,
    ctx: RequestContext,
    uri: OriginalUri,
    Query(params): Query<ListParams>,
) -> AppResult<ApiResponse<Vec<ModuleList>>> {
    let spec = QuerySpec::parse(&params, state.config.page_defaults);
    let page = state.repo.list_modules(&ctx, &spec).await?;
    Ok(page_response(&ctx, "Module data found", &spec, &uri, page))
}

#[utoipa::path(
    get,
    path = "/api/v1/modules/{id}",
    params(("id" = i64, Path, description = "Module id")),
    responses(
        (status = 200, description = "Module data found", body = ModuleDetail),
        (status = 404, description = "Module not found")
    )
)]
pub async fn get_module(
    State(state): State<AppState>,
    ctx: RequestContext,
    path: Result<Path<i64>, PathRejection>,
) -> AppResult<ApiResponse<ModuleDetail>> {
    let id = path_id(path)?;
    let detail = state.repo.get_module(&ctx, id).await?;
    Ok(ApiResponse::ok("Module data found", detail).with_request_id(ctx.request_id.clone()))
}

#[utoipa::path(
    post,
    path = "/api/v1/modules",
    request_body = ModuleInput,
    responses(
        (status = 201, description = "Module successfully created", body = ModuleDetail),
        (status = 400, description = "Validation failed")
    )
)]
pub async fn create_module(
    State(state): State<AppState>,
    ctx: RequestContext,
    payload: Result<Json<ModuleInput>, JsonRejection>,
) -> AppResult<ApiResponse<ModuleDetail>> {
    let input = body(payload)?;
    validated(input.validate())?;

    let detail = state.repo.create_module(&ctx, input).await?;
    Ok(ApiResponse::created("Module successfully created", detail).with_request_id(ctx.request_id.clone()))
}

#[utoipa::path(
    put,
    path = "/api/v1/modules/{id}",
    params(("id" = i64, Path, description = "Module id")),
    request_body = ModuleInput,
    responses(
        (status = 200, description = "Module successfully updated", body = ModuleDetail),
        (status = 404, description = "Module not found")
    )
)]
pub async fn update_module(
    State(state): State<AppState>,
    ctx: RequestContext,
    path: Result<Path<i64>, PathRejection>,
    payload: Result<Json<ModuleInput>, JsonRejection>,
) -> AppResult<ApiResponse<ModuleDetail>> {
    let id = path_id(path)?;
    let input = body(payload)?;
    validated(input.validate())?;

    let detail = state.repo.update_module(&ctx, id, input).await?;
    Ok(ApiResponse::ok("Module successfully updated", detail).with_request_id(ctx.request_id.clone()))
}

#[utoipa::path(
    delete,
    path = "/api/v1/modules/{id}",
    params(("id" = i64, Path, description = "Module id")),
    responses(
        (status = 200, description = "Module successfully deleted"),
        (status = 404, description = "Module not found")
    )
)]
pub async fn delete_module(
    State(state): State<AppState>,
    ctx: RequestContext,
    path: Result<Path<i64>, PathRejection>,
) -> AppResult<ApiResponse<()>> {
    let id = path_id(path)?;
    state.repo.delete_module(&ctx, id).await?;
    Ok(ApiResponse::message(StatusCode::OK, "Module successfully deleted").with_request_id(ctx.request_id.clone()))
}
