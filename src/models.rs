use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use ts_rs::TS;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::FieldError;

// --- Core Entities (Mapped to Database) ---

/// Module
///
/// A functional area of the product (e.g. "User Management") that groups permissions.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, Default)]
pub struct Module {
    pub id: i64,
    pub uuid: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    // Soft-delete marker; rows with a value are invisible to the API.
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Permission
///
/// A single grant (e.g. "view_user") belonging to one module.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, Default)]
pub struct Permission {
    pub id: i64,
    pub uuid: Uuid,
    pub module_id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Role
///
/// A named set of permissions (many-to-many through `role_permissions`).
/// `is_admin` roles bypass the self-only checks.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, Default)]
pub struct Role {
    pub id: i64,
    pub uuid: Uuid,
    pub name: String,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// User
///
/// An account record. `password` holds the argon2 PHC string and is never serialized.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, Default)]
pub struct User {
    pub id: i64,
    pub uuid: Uuid,
    pub role_id: i64,
    pub username: String,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    pub validated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// RefreshToken
///
/// A refresh JWT issued at login, stored so it can be rotated and revoked.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, Default)]
pub struct RefreshToken {
    pub id: i64,
    pub user_id: i64,
    pub token: String,
    pub expired_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// The slice of a user the authorization checks need, resolved on every request.
#[derive(Debug, Clone, FromRow, Default, PartialEq)]
pub struct UserAccess {
    pub id: i64,
    pub role_id: i64,
    pub is_admin: bool,
}

// --- Output Schemas ---

/// UserList
///
/// Compact user row for list endpoints; `role` is the role name (joined).
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, FromRow, Default, PartialEq)]
#[ts(export)]
pub struct UserList {
    pub id: i64,
    pub uuid: Uuid,
    pub name: String,
    pub username: String,
    pub email: String,
    pub role: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, FromRow, Default)]
#[ts(export)]
pub struct UserDetail {
    pub id: i64,
    pub uuid: Uuid,
    pub role_id: i64,
    pub role: String,
    pub name: String,
    pub username: String,
    pub email: String,
    #[ts(type = "string | null")]
    pub validated_at: Option<DateTime<Utc>>,
    #[ts(type = "string")]
    pub created_at: DateTime<Utc>,
    #[ts(type = "string")]
    pub updated_at: DateTime<Utc>,
}

/// PermissionList
///
/// Permission row with its module name resolved, also embedded in role and module details.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, FromRow, Default, PartialEq)]
#[ts(export)]
pub struct PermissionList {
    pub id: i64,
    pub uuid: Uuid,
    pub name: String,
    pub module_id: i64,
    pub module: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, FromRow, Default)]
#[ts(export)]
pub struct PermissionDetail {
    pub id: i64,
    pub uuid: Uuid,
    pub name: String,
    pub module_id: i64,
    pub module: String,
    #[ts(type = "string")]
    pub created_at: DateTime<Utc>,
    #[ts(type = "string")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, FromRow, Default, PartialEq)]
#[ts(export)]
pub struct RoleList {
    pub id: i64,
    pub uuid: Uuid,
    pub name: String,
    pub is_admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct RoleDetail {
    pub id: i64,
    pub uuid: Uuid,
    pub name: String,
    pub is_admin: bool,
    pub permissions: Vec<PermissionList>,
    #[ts(type = "string")]
    pub created_at: DateTime<Utc>,
    #[ts(type = "string")]
    pub updated_at: DateTime<Utc>,
}

impl RoleDetail {
    pub fn from_role(role: Role, permissions: Vec<PermissionList>) -> Self {
        Self {
            id: role.id,
            uuid: role.uuid,
            name: role.name,
            is_admin: role.is_admin,
            permissions,
            created_at: role.created_at,
            updated_at: role.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, FromRow, Default, PartialEq)]
#[ts(export)]
pub struct ModuleList {
    pub id: i64,
    pub uuid: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct ModuleDetail {
    pub id: i64,
    pub uuid: Uuid,
    pub name: String,
    pub permissions: Vec<PermissionList>,
    #[ts(type = "string")]
    pub created_at: DateTime<Utc>,
    #[ts(type = "string")]
    pub updated_at: DateTime<Utc>,
}

impl ModuleDetail {
    pub fn from_module(module: Module, permissions: Vec<PermissionList>) -> Self {
        Self {
            id: module.id,
            uuid: module.uuid,
            name: module.name,
            permissions,
            created_at: module.created_at,
            updated_at: module.updated_at,
        }
    }
}

/// TokenPair
///
/// Returned by login and refresh.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

// --- Request Payloads (Input Schemas) ---

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct LoginInput {
    pub username_or_email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct RefreshInput {
    pub refresh_token: String,
}

/// CreateUserInput
///
/// Payload for `POST /users`. The password is hashed before it reaches the repository.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct CreateUserInput {
    pub role_id: i64,
    pub username: String,
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct UpdateUserInput {
    pub role_id: i64,
    pub username: String,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct ResetPasswordInput {
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct RoleInput {
    pub name: String,
    #[serde(default)]
    pub is_admin: bool,
    /// Permission ids granted to the role.
    #[serde(default)]
    pub permissions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct ModuleInput {
    pub name: String,
}

/// Persisted form of a new user: validated fields plus the password hash.
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub role_id: i64,
    pub username: String,
    pub name: String,
    pub email: String,
    pub password_hash: String,
}

// --- Input Validation ---

pub const MIN_PASSWORD_LEN: usize = 8;

fn required(errors: &mut Vec<FieldError>, field: &str, value: &str) {
    if value.trim().is_empty() {
        errors.push(FieldError::new(field, "required"));
    }
}

fn email(errors: &mut Vec<FieldError>, value: &str) {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return;
    }
    let valid = trimmed
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.') && !domain.starts_with('.'));
    if !valid {
        errors.push(FieldError::new("email", "email"));
    }
}

fn password(errors: &mut Vec<FieldError>, value: &str) {
    if value.is_empty() {
        errors.push(FieldError::new("password", "required"));
    } else if value.chars().count() < MIN_PASSWORD_LEN {
        errors.push(FieldError::new("password", "min"));
    }
}

impl LoginInput {
    pub fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        required(&mut errors, "username_or_email", &self.username_or_email);
        required(&mut errors, "password", &self.password);
        errors
    }
}

impl CreateUserInput {
    pub fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        required(&mut errors, "username", &self.username);
        required(&mut errors, "name", &self.name);
        required(&mut errors, "email", &self.email);
        email(&mut errors, &self.email);
        password(&mut errors, &self.password);
        if self.role_id <= 0 {
            errors.push(FieldError::new("role_id", "required"));
        }
        errors
    }
}

impl UpdateUserInput {
    pub fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        required(&mut errors, "username", &self.username);
        required(&mut errors, "name", &self.name);
        required(&mut errors, "email", &self.email);
        email(&mut errors, &self.email);
        if self.role_id <= 0 {
            errors.push(FieldError::new("role_id", "required"));
        }
        errors
    }
}

impl ResetPasswordInput {
    pub fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        password(&mut errors, &self.password);
        errors
    }
}

impl RoleInput {
    pub fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        required(&mut errors, "name", &self.name);
        if self.permissions.is_empty() {
            errors.push(FieldError::new("permissions", "required"));
        }
        errors
    }
}

impl ModuleInput {
    pub fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        required(&mut errors, "name", &self.name);
        errors
    }
}
