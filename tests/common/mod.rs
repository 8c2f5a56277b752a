#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode},
};
use chrono::{DateTime, Utc};
use rbac_portal::{
    AppConfig, AppState, create_router,
    auth,
    context::RequestContext,
    error::{AppError, AppResult, FieldError},
    models::{
        Module, ModuleDetail, ModuleInput, ModuleList, NewUser, Permission, PermissionDetail,
        PermissionList, RefreshToken, Role, RoleDetail, RoleInput, RoleList, UpdateUserInput,
        User, UserAccess, UserDetail, UserList,
    },
    query::{Page, QuerySpec},
    repository::{Repository, RepositoryState},
};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tower::ServiceExt;
use uuid::Uuid;

pub const ADMIN_ID: i64 = 1;
pub const MEMBER_ID: i64 = 2;
pub const ADMIN_PASSWORD: &str = "admin-password";
pub const MEMBER_PASSWORD: &str = "member-password";

// --- MOCK REPOSITORY IMPLEMENTATION ---

/// In-memory rows behind `MockRepo`.
#[derive(Default)]
pub struct MockStore {
    pub modules: Vec<Module>,
    pub permissions: Vec<Permission>,
    pub roles: Vec<Role>,
    pub role_permissions: Vec<(i64, i64)>,
    pub users: Vec<User>,
    pub refresh_tokens: Vec<RefreshToken>,
    next_id: i64,
}

impl MockStore {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn live_user(&self, id: i64) -> Option<&User> {
        self.users.iter().find(|u| u.id == id && u.deleted_at.is_none())
    }

    fn live_role(&self, id: i64) -> Option<&Role> {
        self.roles.iter().find(|r| r.id == id && r.deleted_at.is_none())
    }

    fn live_module(&self, id: i64) -> Option<&Module> {
        self.modules.iter().find(|m| m.id == id && m.deleted_at.is_none())
    }

    fn user_detail(&self, user: &User) -> UserDetail {
        UserDetail {
            id: user.id,
            uuid: user.uuid,
            role_id: user.role_id,
            role: self.live_role(user.role_id).map(|r| r.name.clone()).unwrap_or_default(),
            name: user.name.clone(),
            username: user.username.clone(),
            email: user.email.clone(),
            validated_at: user.validated_at,
            created_at: user.created_at,
            updated_at: user.updated_at,
        }
    }

    fn permission_list(&self, permission: &Permission) -> PermissionList {
        PermissionList {
            id: permission.id,
            uuid: permission.uuid,
            name: permission.name.clone(),
            module_id: permission.module_id,
            module: self
                .modules
                .iter()
                .find(|m| m.id == permission.module_id)
                .map(|m| m.name.clone())
                .unwrap_or_default(),
        }
    }

    fn role_detail(&self, role: &Role) -> RoleDetail {
        let permissions = self
            .role_permissions
            .iter()
            .filter(|(role_id, _)| *role_id == role.id)
            .filter_map(|(_, pid)| self.permissions.iter().find(|p| p.id == *pid))
            .map(|p| self.permission_list(p))
            .collect();
        RoleDetail::from_role(role.clone(), permissions)
    }

    fn module_detail(&self, module: &Module) -> ModuleDetail {
        let permissions = self
            .permissions
            .iter()
            .filter(|p| p.module_id == module.id && p.deleted_at.is_none())
            .map(|p| self.permission_list(p))
            .collect();
        ModuleDetail::from_module(module.clone(), permissions)
    }

    fn check_unique_user(&self, id: Option<i64>, username: &str, email: &str) -> AppResult<()> {
        let others = self
            .users
            .iter()
            .filter(|u| u.deleted_at.is_none() && Some(u.id) != id);
        let mut errors = Vec::new();
        for user in others {
            if user.username == username {
                errors.push(FieldError::new("username", "duplicate"));
            }
            if user.email == email {
                errors.push(FieldError::new("email", "duplicate"));
            }
        }
        if errors.is_empty() { Ok(()) } else { Err(AppError::Validation(errors)) }
    }

    fn check_role(&self, id: Option<i64>, input: &RoleInput) -> AppResult<()> {
        if self
            .roles
            .iter()
            .any(|r| r.deleted_at.is_none() && r.name == input.name && Some(r.id) != id)
        {
            return Err(AppError::Validation(vec![FieldError::new("name", "duplicate")]));
        }
        let all_exist = input
            .permissions
            .iter()
            .all(|pid| self.permissions.iter().any(|p| p.id == *pid && p.deleted_at.is_none()));
        if !all_exist {
            return Err(AppError::Validation(vec![FieldError::new("permissions", "exists")]));
        }
        Ok(())
    }
}

/// MockRepo
///
/// An in-memory `Repository` used by the handler and router tests. It keeps
/// the same visibility rules as the Postgres implementation (soft-deleted
/// rows are invisible) and records which operations were called.
#[derive(Default)]
pub struct MockRepo {
    pub store: Mutex<MockStore>,
    pub calls: Mutex<Vec<&'static str>>,
}

impl MockRepo {
    /// Two roles (admin, member), one module with two permissions, and one user per role.
    pub async fn seeded() -> Arc<Self> {
        let admin_hash = auth::hash_password(ADMIN_PASSWORD.to_string()).await.unwrap();
        let member_hash = auth::hash_password(MEMBER_PASSWORD.to_string()).await.unwrap();

        let repo = MockRepo::default();
        {
            let mut store = repo.store.lock().unwrap();
            store.next_id = 100;
            store.modules.push(Module {
                id: 1,
                uuid: Uuid::new_v4(),
                name: "User Management".into(),
                ..Module::default()
            });
            for (id, name) in [(1, "view_user"), (2, "create_user")] {
                store.permissions.push(Permission {
                    id,
                    uuid: Uuid::new_v4(),
                    module_id: 1,
                    name: name.into(),
                    ..Permission::default()
                });
            }
            store.roles.push(Role {
                id: 1,
                uuid: Uuid::new_v4(),
                name: "Admin".into(),
                is_admin: true,
                ..Role::default()
            });
            store.roles.push(Role {
                id: 2,
                uuid: Uuid::new_v4(),
                name: "Member".into(),
                is_admin: false,
                ..Role::default()
            });
            store.role_permissions = vec![(1, 1), (1, 2), (2, 1)];
            store.users.push(User {
                id: ADMIN_ID,
                uuid: Uuid::new_v4(),
                role_id: 1,
                username: "admin".into(),
                name: "Administrator".into(),
                email: "admin@example.com".into(),
                password: admin_hash,
                ..User::default()
            });
            store.users.push(User {
                id: MEMBER_ID,
                uuid: Uuid::new_v4(),
                role_id: 2,
                username: "member".into(),
                name: "Member".into(),
                email: "member@example.com".into(),
                password: member_hash,
                ..User::default()
            });
        }
        Arc::new(repo)
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn called(&self, call: &str) -> bool {
        self.calls.lock().unwrap().iter().any(|c| *c == call)
    }

    fn check(&self, ctx: &RequestContext) -> AppResult<()> {
        if ctx.is_cancelled() { Err(AppError::Cancelled) } else { Ok(()) }
    }
}

/// Applies only the page window; filtering and ordering are covered by the
/// query module's own tests and the database tests.
fn paginate<T: Clone>(items: Vec<T>, spec: &QuerySpec) -> Page<T> {
    let total = items.len() as u64;
    let page = items
        .into_iter()
        .skip(spec.offset() as usize)
        .take(spec.limit as usize)
        .collect();
    Page::new(page, total)
}

#[async_trait]
impl Repository for MockRepo {
    async fn list_users(&self, ctx: &RequestContext, spec: &QuerySpec) -> AppResult<Page<UserList>> {
        self.check(ctx)?;
        self.record("list_users");
        let store = self.store.lock().unwrap();
        let rows = store
            .users
            .iter()
            .filter(|u| u.deleted_at.is_none())
            .map(|u| UserList {
                id: u.id,
                uuid: u.uuid,
                name: u.name.clone(),
                username: u.username.clone(),
                email: u.email.clone(),
                role: store.live_role(u.role_id).map(|r| r.name.clone()).unwrap_or_default(),
            })
            .collect();
        Ok(paginate(rows, spec))
    }

    async fn get_user(&self, ctx: &RequestContext, id: i64) -> AppResult<UserDetail> {
        self.check(ctx)?;
        self.record("get_user");
        let store = self.store.lock().unwrap();
        store
            .live_user(id)
            .map(|u| store.user_detail(u))
            .ok_or_else(|| AppError::NotFound("User".into()))
    }

    async fn get_user_access(&self, ctx: &RequestContext, id: i64) -> AppResult<UserAccess> {
        self.check(ctx)?;
        let store = self.store.lock().unwrap();
        let user = store.live_user(id).ok_or(AppError::Unauthorized)?;
        let role = store.live_role(user.role_id).ok_or(AppError::Unauthorized)?;
        Ok(UserAccess {
            id: user.id,
            role_id: role.id,
            is_admin: role.is_admin,
        })
    }

    async fn find_user_by_login(&self, ctx: &RequestContext, username_or_email: &str) -> AppResult<User> {
        self.check(ctx)?;
        self.record("find_user_by_login");
        let store = self.store.lock().unwrap();
        store
            .users
            .iter()
            .find(|u| {
                u.deleted_at.is_none()
                    && (u.username == username_or_email || u.email == username_or_email)
            })
            .cloned()
            .ok_or_else(|| AppError::NotFound("User".into()))
    }

    async fn create_user(&self, ctx: &RequestContext, user: NewUser) -> AppResult<UserDetail> {
        self.check(ctx)?;
        self.record("create_user");
        let mut store = self.store.lock().unwrap();
        store.check_unique_user(None, &user.username, &user.email)?;
        if store.live_role(user.role_id).is_none() {
            return Err(AppError::Validation(vec![FieldError::new("role_id", "exists")]));
        }
        let id = store.next_id();
        let now = Utc::now();
        let row = User {
            id,
            uuid: Uuid::new_v4(),
            role_id: user.role_id,
            username: user.username,
            name: user.name,
            email: user.email,
            password: user.password_hash,
            validated_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        let detail = store.user_detail(&row);
        store.users.push(row);
        Ok(detail)
    }

    async fn update_user(&self, ctx: &RequestContext, id: i64, input: UpdateUserInput) -> AppResult<UserDetail> {
        self.check(ctx)?;
        self.record("update_user");
        let mut store = self.store.lock().unwrap();
        if store.live_user(id).is_none() {
            return Err(AppError::NotFound("User".into()));
        }
        store.check_unique_user(Some(id), &input.username, &input.email)?;
        let user = store
            .users
            .iter_mut()
            .find(|u| u.id == id)
            .ok_or_else(|| AppError::NotFound("User".into()))?;
        user.role_id = input.role_id;
        user.username = input.username;
        user.name = input.name;
        user.email = input.email;
        user.updated_at = Utc::now();
        let user = user.clone();
        Ok(store.user_detail(&user))
    }

    async fn update_password(&self, ctx: &RequestContext, id: i64, password_hash: String) -> AppResult<()> {
        self.check(ctx)?;
        self.record("update_password");
        let mut store = self.store.lock().unwrap();
        let user = store
            .users
            .iter_mut()
            .find(|u| u.id == id && u.deleted_at.is_none())
            .ok_or_else(|| AppError::NotFound("User".into()))?;
        user.password = password_hash;
        Ok(())
    }

    async fn delete_user(&self, ctx: &RequestContext, id: i64) -> AppResult<()> {
        self.check(ctx)?;
        self.record("delete_user");
        let mut store = self.store.lock().unwrap();
        let user = store
            .users
            .iter_mut()
            .find(|u| u.id == id && u.deleted_at.is_none())
            .ok_or_else(|| AppError::NotFound("User".into()))?;
        user.deleted_at = Some(Utc::now());
        store.refresh_tokens.retain(|t| t.user_id != id);
        Ok(())
    }

    async fn store_refresh_token(
        &self,
        ctx: &RequestContext,
        user_id: i64,
        token: String,
        expired_at: DateTime<Utc>,
    ) -> AppResult<()> {
        self.check(ctx)?;
        self.record("store_refresh_token");
        let mut store = self.store.lock().unwrap();
        let id = store.next_id();
        store.refresh_tokens.push(RefreshToken {
            id,
            user_id,
            token,
            expired_at,
            created_at: Utc::now(),
        });
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
        self.check(ctx)?;
        self.record("rotate_refresh_token");
        let mut store = self.store.lock().unwrap();
        let now = Utc::now();
        let position = store
            .refresh_tokens
            .iter()
            .position(|t| t.token == old_token && t.user_id == user_id && t.expired_at > now)
            .ok_or(AppError::Unauthorized)?;
        store.refresh_tokens.remove(position);
        let id = store.next_id();
        store.refresh_tokens.push(RefreshToken {
            id,
            user_id,
            token: new_token,
            expired_at,
            created_at: now,
        });
        Ok(())
    }

    async fn list_roles(&self, ctx: &RequestContext, spec: &QuerySpec) -> AppResult<Page<RoleList>> {
        self.check(ctx)?;
        self.record("list_roles");
        let store = self.store.lock().unwrap();
        let rows = store
            .roles
            .iter()
            .filter(|r| r.deleted_at.is_none())
            .map(|r| RoleList {
                id: r.id,
                uuid: r.uuid,
                name: r.name.clone(),
                is_admin: r.is_admin,
            })
            .collect();
        Ok(paginate(rows, spec))
    }

    async fn get_role(&self, ctx: &RequestContext, id: i64) -> AppResult<RoleDetail> {
        self.check(ctx)?;
        self.record("get_role");
        let store = self.store.lock().unwrap();
        store
            .live_role(id)
            .map(|r| store.role_detail(r))
            .ok_or_else(|| AppError::NotFound("Role".into()))
    }

    async fn create_role(&self, ctx: &RequestContext, input: RoleInput) -> AppResult<RoleDetail> {
        self.check(ctx)?;
        self.record("create_role");
        let mut store = self.store.lock().unwrap();
        store.check_role(None, &input)?;
        let id = store.next_id();
        let now = Utc::now();
        let role = Role {
            id,
            uuid: Uuid::new_v4(),
            name: input.name,
            is_admin: input.is_admin,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        for pid in input.permissions {
            store.role_permissions.push((id, pid));
        }
        store.roles.push(role.clone());
        Ok(store.role_detail(&role))
    }

    async fn update_role(&self, ctx: &RequestContext, id: i64, input: RoleInput) -> AppResult<RoleDetail> {
        self.check(ctx)?;
        self.record("update_role");
        let mut store = self.store.lock().unwrap();
        if store.live_role(id).is_none() {
            return Err(AppError::NotFound("Role".into()));
        }
        store.check_role(Some(id), &input)?;
        store.role_permissions.retain(|(role_id, _)| *role_id != id);
        for pid in &input.permissions {
            store.role_permissions.push((id, *pid));
        }
        let role = store
            .roles
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| AppError::NotFound("Role".into()))?;
        role.name = input.name;
        role.is_admin = input.is_admin;
        role.updated_at = Utc::now();
        let role = role.clone();
        Ok(store.role_detail(&role))
    }

    async fn delete_role(&self, ctx: &RequestContext, id: i64) -> AppResult<()> {
        self.check(ctx)?;
        self.record("delete_role");
        let mut store = self.store.lock().unwrap();
        let role = store
            .roles
            .iter_mut()
            .find(|r| r.id == id && r.deleted_at.is_none())
            .ok_or_else(|| AppError::NotFound("Role".into()))?;
        role.deleted_at = Some(Utc::now());
        Ok(())
    }

    async fn list_permissions(&self, ctx: &RequestContext, spec: &QuerySpec) -> AppResult<Page<PermissionList>> {
        self.check(ctx)?;
        self.record("list_permissions");
        let store = self.store.lock().unwrap();
        let rows = store
            .permissions
            .iter()
            .filter(|p| p.deleted_at.is_none())
            .map(|p| store.permission_list(p))
            .collect();
        Ok(paginate(rows, spec))
    }

    async fn get_permission(&self, ctx: &RequestContext, id: i64) -> AppResult<PermissionDetail> {
        self.check(ctx)?;
        self.record("get_permission");
        let store = self.store.lock().unwrap();
        let permission = store
            .permissions
            .iter()
            .find(|p| p.id == id && p.deleted_at.is_none())
            .ok_or_else(|| AppError::NotFound("Permission".into()))?;
        let list = store.permission_list(permission);
        Ok(PermissionDetail {
            id: list.id,
            uuid: list.uuid,
            name: list.name,
            module_id: list.module_id,
            module: list.module,
            created_at: permission.created_at,
            updated_at: permission.updated_at,
        })
    }

    async fn list_modules(&self, ctx: &RequestContext, spec: &QuerySpec) -> AppResult<Page<ModuleList>> {
        self.check(ctx)?;
        self.record("list_modules");
        let store = self.store.lock().unwrap();
        let rows = store
            .modules
            .iter()
            .filter(|m| m.deleted_at.is_none())
            .map(|m| ModuleList {
                id: m.id,
                uuid: m.uuid,
                name: m.name.clone(),
            })
            .collect();
        Ok(paginate(rows, spec))
    }

    async fn get_module(&self, ctx: &RequestContext, id: i64) -> AppResult<ModuleDetail> {
        self.check(ctx)?;
        self.record("get_module");
        let store = self.store.lock().unwrap();
        store
            .live_module(id)
            .map(|m| store.module_detail(m))
            .ok_or_else(|| AppError::NotFound("Module".into()))
    }

    async fn create_module(&self, ctx: &RequestContext, input: ModuleInput) -> AppResult<ModuleDetail> {
        self.check(ctx)?;
        self.record("create_module");
        let mut store = self.store.lock().unwrap();
        if store.modules.iter().any(|m| m.deleted_at.is_none() && m.name == input.name) {
            return Err(AppError::Validation(vec![FieldError::new("name", "duplicate")]));
        }
        let id = store.next_id();
        let now = Utc::now();
        let module = Module {
            id,
            uuid: Uuid::new_v4(),
            name: input.name,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        store.modules.push(module.clone());
        Ok(store.module_detail(&module))
    }

    async fn update_module(&self, ctx: &RequestContext, id: i64, input: ModuleInput) -> AppResult<ModuleDetail> {
        self.check(ctx)?;
        self.record("update_module");
        let mut store = self.store.lock().unwrap();
        let module = store
            .modules
            .iter_mut()
            .find(|m| m.id == id && m.deleted_at.is_none())
            .ok_or_else(|| AppError::NotFound("Module".into()))?;
        module.name = input.name;
        module.updated_at = Utc::now();
        let module = module.clone();
        Ok(store.module_detail(&module))
    }

    async fn delete_module(&self, ctx: &RequestContext, id: i64) -> AppResult<()> {
        self.check(ctx)?;
        self.record("delete_module");
        let mut store = self.store.lock().unwrap();
        let module = store
            .modules
            .iter_mut()
            .find(|m| m.id == id && m.deleted_at.is_none())
            .ok_or_else(|| AppError::NotFound("Module".into()))?;
        module.deleted_at = Some(Utc::now());
        Ok(())
    }
}

// --- State and Router Helpers ---

pub fn create_test_state(repo: Arc<MockRepo>) -> AppState {
    AppState {
        repo: repo as RepositoryState,
        config: AppConfig::default(),
    }
}

pub fn test_router(repo: Arc<MockRepo>) -> Router {
    create_router(create_test_state(repo))
}

/// Sends one request through the full router stack and returns the status
/// and the decoded JSON body (`Value::Null` for non-JSON bodies).
/// `as_user` uses the local `x-user-id` bypass.
pub async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    as_user: Option<i64>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(id) = as_user {
        builder = builder.header("x-user-id", id.to_string());
    }
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}
