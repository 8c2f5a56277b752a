use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::ErrorKind};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    config::{AppConfig, Env},
    context::RequestContext,
    error::{AppError, AppResult},
    models::{TokenPair, UserAccess},
    repository::RepositoryState,
};

/// Which secret a token is signed with and what it may be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// Claims
///
/// The JWT payload for both access and refresh tokens.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (sub): the numeric id of the user.
    pub sub: i64,
    /// Expiration Time (exp), seconds since the epoch.
    pub exp: usize,
    /// Issued At (iat).
    pub iat: usize,
    /// Unique token id; keeps two tokens issued in the same second distinct.
    pub jti: Uuid,
    pub kind: TokenKind,
}

fn secret_for(kind: TokenKind, config: &AppConfig) -> &[u8] {
    match kind {
        TokenKind::Access => config.jwt_access_secret.as_bytes(),
        TokenKind::Refresh => config.jwt_refresh_secret.as_bytes(),
    }
}

/// Signs a token of `kind` for `user_id`. Returns the token and its expiry.
pub fn issue_token(
    user_id: i64,
    kind: TokenKind,
    config: &AppConfig,
) -> AppResult<(String, DateTime<Utc>)> {
    let ttl = match kind {
        TokenKind::Access => config.jwt_access_ttl,
        TokenKind::Refresh => config.jwt_refresh_ttl,
    };
    let now = Utc::now();
    let expires_at = now
        + ChronoDuration::from_std(ttl).map_err(|e| AppError::Internal(e.to_string()))?;

    let claims = Claims {
        sub: user_id,
        exp: expires_at.timestamp() as usize,
        iat: now.timestamp() as usize,
        jti: Uuid::new_v4(),
        kind,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret_for(kind, config)),
    )
    .map_err(|e| AppError::Internal(format!("failed generating token: {}", e)))?;

    Ok((token, expires_at))
}

/// Issues a fresh access/refresh pair. The refresh expiry is returned so the
/// caller can persist it alongside the token.
pub fn issue_pair(user_id: i64, config: &AppConfig) -> AppResult<(TokenPair, DateTime<Utc>)> {
    let (access_token, _) = issue_token(user_id, TokenKind::Access, config)?;
    let (refresh_token, refresh_expires_at) = issue_token(user_id, TokenKind::Refresh, config)?;
    Ok((
        TokenPair {
            access_token,
            refresh_token,
        },
        refresh_expires_at,
    ))
}

/// Decodes and validates a token of the expected `kind`. Expired, forged,
/// malformed, or wrong-kind tokens are all `Unauthorized`.
pub fn verify_token(token: &str, kind: TokenKind, config: &AppConfig) -> AppResult<Claims> {
    let mut validation = Validation::default();
    validation.validate_exp = true;

    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret_for(kind, config)),
        &validation,
    )
    .map_err(|e| {
        match e.kind() {
            ErrorKind::ExpiredSignature => tracing::debug!("token expired"),
            _ => tracing::debug!(error = %e, "token rejected"),
        }
        AppError::Unauthorized
    })?;

    if data.claims.kind != kind {
        return Err(AppError::Unauthorized);
    }
    Ok(data.claims)
}

// --- Passwords ---

/// Hashes with argon2id off the async runtime.
pub async fn hash_password(password: String) -> AppResult<String> {
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| AppError::Internal(format!("password hashing failed: {}", e)))
    })
    .await
    .map_err(|e| AppError::Internal(e.to_string()))?
}

/// Checks `password` against a stored PHC string. A malformed hash never matches.
pub async fn verify_password(password: String, hash: String) -> bool {
    tokio::task::spawn_blocking(move || {
        let Ok(parsed) = PasswordHash::new(&hash) else {
            return false;
        };
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    })
    .await
    .unwrap_or(false)
}

/// AuthUser
///
/// The resolved identity of an authenticated request, re-loaded from the
/// database so role changes and deletions apply immediately.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthUser {
    pub id: i64,
    pub role_id: i64,
    pub is_admin: bool,
}

impl From<UserAccess> for AuthUser {
    fn from(access: UserAccess) -> Self {
        Self {
            id: access.id,
            role_id: access.role_id,
            is_admin: access.is_admin,
        }
    }
}

impl AuthUser {
    pub fn require_admin(&self) -> AppResult<()> {
        if self.is_admin {
            Ok(())
        } else {
            Err(AppError::Forbidden)
        }
    }

    /// Passes when the caller is acting on their own record or is an admin.
    pub fn require_self_or_admin(&self, user_id: i64) -> AppResult<()> {
        if self.id == user_id || self.is_admin {
            Ok(())
        } else {
            Err(AppError::Forbidden)
        }
    }
}

/// AuthUser Extractor Implementation
///
/// 1. Local bypass: in `Env::Local` an `x-user-id` header naming a live user
///    authenticates directly.
/// 2. Otherwise an `Authorization: Bearer <access token>` header is required.
/// 3. The token subject is re-loaded from the repository to resolve the role.
///
/// Rejection: `AppError::Unauthorized`, rendered as a 401 envelope.
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    RepositoryState: FromRef<S>,
    AppConfig: FromRef<S>,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let repo = RepositoryState::from_ref(state);
        let config = AppConfig::from_ref(state);
        let ctx = RequestContext::from_request_parts(parts, state).await?;

        if config.env == Env::Local {
            let bypass_id = parts
                .headers
                .get("x-user-id")
                .and_then(|value| value.to_str().ok())
                .and_then(|raw| raw.parse::<i64>().ok());

            if let Some(user_id) = bypass_id {
                if let Ok(access) = repo.get_user_access(&ctx, user_id).await {
                    return Ok(access.into());
                }
            }
        }

        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(AppError::Unauthorized)?;

        let claims = verify_token(token, TokenKind::Access, &config)?;

        let access = repo
            .get_user_access(&ctx, claims.sub)
            .await
            .map_err(|e| match e {
                AppError::NotFound(_) => AppError::Unauthorized,
                other => other,
            })?;

        Ok(access.into())
    }
}
