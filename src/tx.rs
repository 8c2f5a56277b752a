use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures_util::{FutureExt, future::BoxFuture};
use sqlx::{PgPool, Postgres};
use tokio::time::Instant;

use crate::{context::RequestContext, error::AppError};

// --- Connection Abstraction ---

/// TxConnection
///
/// One open database transaction. Consumed by whichever of `commit` or
/// `rollback` terminates it.
#[async_trait]
pub trait TxConnection: Send + Sized {
    async fn commit(self) -> Result<(), AppError>;
    async fn rollback(self) -> Result<(), AppError>;
}

/// TxConnector
///
/// Something that can open transactions, i.e. the connection pool.
/// Implemented for `PgPool` in production and by recording mocks in tests.
#[async_trait]
pub trait TxConnector: Send + Sync {
    type Conn: TxConnection;

    async fn begin(&self) -> Result<Self::Conn, AppError>;
}

#[async_trait]
impl TxConnection for sqlx::Transaction<'static, Postgres> {
    async fn commit(self) -> Result<(), AppError> {
        sqlx::Transaction::commit(self)
            .await
            .map_err(|e| AppError::Transaction(format!("commit failed: {}", e)))
    }

    async fn rollback(self) -> Result<(), AppError> {
        sqlx::Transaction::rollback(self)
            .await
            .map_err(|e| AppError::Transaction(format!("rollback failed: {}", e)))
    }
}

#[async_trait]
impl TxConnector for PgPool {
    type Conn = sqlx::Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Conn, AppError> {
        sqlx::Pool::begin(self)
            .await
            .map_err(|e| AppError::Connection(e.to_string()))
    }
}

// --- Transaction Handle ---

enum TxState<C> {
    Empty,
    Open(C),
    Committed,
    RolledBack,
}

/// TxHandle
///
/// Exclusive ownership of one transaction from `begin_tx` until it is
/// committed or rolled back. A default (`empty`) handle stands for "no
/// transaction" and is rejected by `commit_tx`/`rollback_tx`.
///
/// The handle is not `Clone`; it is moved along the single call chain that
/// owns it. If it is dropped while still open the underlying sqlx
/// transaction rolls back on drop.
pub struct TxHandle<C> {
    state: TxState<C>,
}

impl<C> TxHandle<C> {
    pub fn empty() -> Self {
        Self {
            state: TxState::Empty,
        }
    }

    fn open(conn: C) -> Self {
        Self {
            state: TxState::Open(conn),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, TxState::Open(_))
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, TxState::Committed | TxState::RolledBack)
    }

    /// The live connection, for running statements inside the transaction.
    pub fn conn(&mut self) -> Result<&mut C, AppError> {
        match &mut self.state {
            TxState::Open(conn) => Ok(conn),
            _ => Err(AppError::NoTransaction),
        }
    }

    fn state_name(&self) -> &'static str {
        state_name(&self.state)
    }
}

impl<C> Default for TxHandle<C> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<C> std::fmt::Debug for TxHandle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxHandle")
            .field("state", &self.state_name())
            .finish()
    }
}

// --- Transaction Manager ---

/// TxManager
///
/// Transaction lifecycle over a [`TxConnector`]. Offers the automatic
/// [`transaction`](Self::transaction) wrapper and the manual
/// `begin_tx` / `commit_tx` / `rollback_tx` API, with
/// [`deferred_cleanup`](Self::deferred_cleanup) and [`scoped`](Self::scoped)
/// guaranteeing every handle is terminated exactly once on every exit path.
#[derive(Clone)]
pub struct TxManager<C> {
    connector: C,
}

impl<C: TxConnector> TxManager<C> {
    pub fn new(connector: C) -> Self {
        Self { connector }
    }

    /// transaction
    ///
    /// Begins a transaction, runs `work` with its connection, then commits on
    /// `Ok` or rolls back on `Err`. A panic inside `work` rolls back and is
    /// re-raised. A failed commit after successful work is returned as the error.
    pub async fn transaction<T, E, F>(&self, ctx: &RequestContext, work: F) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut C::Conn) -> BoxFuture<'c, Result<T, E>> + Send,
        T: Send,
        E: From<AppError> + Send,
    {
        let started = Instant::now();
        let handle = self.begin_tx(ctx).await?;
        let result = self.scoped(ctx, handle, work).await;

        tracing::debug!(
            location = "tx.transaction",
            identifier = %ctx.identifier(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            committed = result.is_ok(),
            "transaction finished"
        );

        result
    }

    /// Starts a transaction explicitly. Pool exhaustion blocks until the
    /// pool's acquire timeout or the context's deadline, whichever is first.
    pub async fn begin_tx(&self, ctx: &RequestContext) -> Result<TxHandle<C::Conn>, AppError> {
        match ctx.run(self.connector.begin()).await {
            Ok(conn) => Ok(TxHandle::open(conn)),
            Err(e) => {
                tracing::error!(
                    location = "tx.begin",
                    identifier = %ctx.identifier(),
                    error = %e,
                    "failed to begin transaction"
                );
                Err(e)
            }
        }
    }

    /// Commits an open handle. Empty or already finished handles are rejected
    /// with `NoTransaction`.
    pub async fn commit_tx(&self, handle: &mut TxHandle<C::Conn>) -> Result<(), AppError> {
        match std::mem::replace(&mut handle.state, TxState::Committed) {
            TxState::Open(conn) => {
                if let Err(e) = conn.commit().await {
                    // The connection was consumed; the server discards the transaction.
                    handle.state = TxState::RolledBack;
                    tracing::error!(location = "tx.commit", error = %e, "commit failed");
                    return Err(e);
                }
                Ok(())
            }
            previous => {
                handle.state = previous;
                Err(AppError::NoTransaction)
            }
        }
    }

    /// Rolls back an open handle. Rolling back a handle that is already
    /// committed or rolled back is accepted as a no-op; an empty handle is
    /// rejected with `NoTransaction`.
    pub async fn rollback_tx(&self, handle: &mut TxHandle<C::Conn>) -> Result<(), AppError> {
        match std::mem::replace(&mut handle.state, TxState::RolledBack) {
            TxState::Open(conn) => conn.rollback().await.inspect_err(|e| {
                tracing::error!(location = "tx.rollback", error = %e, "rollback failed");
            }),
            TxState::Empty => {
                handle.state = TxState::Empty;
                Err(AppError::NoTransaction)
            }
            finished => {
                tracing::debug!(
                    location = "tx.rollback",
                    state = state_name(&finished),
                    "rollback on finished transaction ignored"
                );
                handle.state = finished;
                Ok(())
            }
        }
    }

    /// deferred_cleanup
    ///
    /// Terminates `handle` according to the outcome of the work done with it
    /// and returns the (possibly replaced) outcome:
    /// - `Err(e)`: roll back, return `Err(e)` unchanged.
    /// - `Ok(v)`: commit; if the commit fails its error becomes the result.
    ///
    /// Empty or already finished handles leave the outcome untouched.
    /// Panics are handled by [`scoped`](Self::scoped), which calls this.
    pub async fn deferred_cleanup<T, E>(
        &self,
        mut handle: TxHandle<C::Conn>,
        outcome: Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<AppError>,
    {
        if !handle.is_open() {
            if handle.is_finished() {
                tracing::warn!(
                    location = "tx.deferred_cleanup",
                    state = handle.state_name(),
                    "transaction was already terminated"
                );
            }
            return outcome;
        }

        match outcome {
            Err(business) => {
                // The business error wins over any rollback failure, which is only logged.
                let _ = self.rollback_tx(&mut handle).await;
                Err(business)
            }
            Ok(value) => match self.commit_tx(&mut handle).await {
                Ok(()) => Ok(value),
                Err(commit_err) => Err(commit_err.into()),
            },
        }
    }

    /// scoped
    ///
    /// Runs `work` against an already open `handle` and terminates it on every
    /// exit path: commit on `Ok`, rollback on `Err`, rollback then re-raise on
    /// panic. Cancellation of `ctx` drops the work and rolls back.
    pub async fn scoped<T, E, F>(
        &self,
        ctx: &RequestContext,
        mut handle: TxHandle<C::Conn>,
        work: F,
    ) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut C::Conn) -> BoxFuture<'c, Result<T, E>> + Send,
        T: Send,
        E: From<AppError> + Send,
    {
        let caught = {
            let conn = match handle.conn() {
                Ok(conn) => conn,
                Err(e) => return Err(e.into()),
            };
            AssertUnwindSafe(async move { ctx.run(work(conn)).await })
                .catch_unwind()
                .await
        };

        match caught {
            Ok(outcome) => self.deferred_cleanup(handle, outcome).await,
            Err(panic) => {
                tracing::error!(
                    location = "tx.scoped",
                    identifier = %ctx.identifier(),
                    "panic inside transaction, rolling back"
                );
                let _ = self.rollback_tx(&mut handle).await;
                std::panic::resume_unwind(panic)
            }
        }
    }
}

fn state_name<C>(state: &TxState<C>) -> &'static str {
    match state {
        TxState::Empty => "empty",
        TxState::Open(_) => "open",
        TxState::Committed => "committed",
        TxState::RolledBack => "rolled_back",
    }
}
