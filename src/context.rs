use std::{future::Future, time::Duration};

use axum::{
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{config::AppConfig, error::AppError};

/// RequestContext
///
/// The per-request handle threaded through every data-access call.
/// It carries the correlation id set by `SetRequestIdLayer`, a deadline
/// derived from `AppConfig::request_timeout`, and a cancellation token a
/// caller can trip to abort in-flight work.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: Option<String>,
    deadline: Instant,
    cancel: CancellationToken,
}

impl RequestContext {
    pub fn new(request_id: Option<String>, timeout: Duration) -> Self {
        Self {
            request_id,
            deadline: Instant::now() + timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// A context for background/test use with a generous deadline.
    pub fn background() -> Self {
        Self::new(None, Duration::from_secs(60))
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || Instant::now() >= self.deadline
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn identifier(&self) -> &str {
        self.request_id.as_deref().unwrap_or("unknown")
    }

    /// run
    ///
    /// Drives `fut` until it completes, the token is cancelled, or the deadline
    /// passes. In the latter two cases the future is dropped (aborting the
    /// database call it wraps) and `AppError::Cancelled` is returned.
    pub async fn run<T, E, F>(&self, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<AppError>,
    {
        if self.cancel.is_cancelled() {
            return Err(AppError::Cancelled.into());
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(AppError::Cancelled.into()),
            _ = tokio::time::sleep_until(self.deadline) => {
                tracing::warn!(identifier = %self.identifier(), "request deadline exceeded");
                Err(AppError::Cancelled.into())
            }
            result = fut => result,
        }
    }
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
    AppConfig: FromRef<S>,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let config = AppConfig::from_ref(state);

        let request_id = parts
            .headers
            .get("x-request-id")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        Ok(RequestContext::new(request_id, config.request_timeout))
    }
}
