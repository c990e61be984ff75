//! PostgreSQL transaction coordinator
//!
//! The open transaction is published through a task-local slot for the
//! duration of a scope. [`PgCredentialStore`](super::PgCredentialStore) reads
//! that slot, so every statement it issues inside the scope joins the
//! transaction without the orchestrator handing connections around.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use sqlx::postgres::PgArguments;
use sqlx::query::{Query, QueryAs};
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::Mutex;

use crate::core::auth::{Outcome, TransactionCoordinator, TransactionScope};
use crate::core::db::database_failure;

type SharedTransaction = Arc<Mutex<Option<Transaction<'static, Postgres>>>>;

tokio::task_local! {
    static ACTIVE_TRANSACTION: SharedTransaction;
}

fn active_transaction() -> Option<SharedTransaction> {
    ACTIVE_TRANSACTION.try_with(Arc::clone).ok()
}

fn finished_transaction() -> sqlx::Error {
    sqlx::Error::Protocol("transaction already finished".to_string())
}

/// Fetch at most one row, inside the active transaction when there is one
pub(crate) async fn fetch_optional<'q, O>(
    pool: &PgPool,
    query: QueryAs<'q, Postgres, O, PgArguments>,
) -> Result<Option<O>, sqlx::Error>
where
    O: Send + Unpin + for<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow>,
{
    match active_transaction() {
        Some(shared) => {
            let mut guard = shared.lock().await;
            let tx = guard.as_mut().ok_or_else(finished_transaction)?;
            query.fetch_optional(&mut **tx).await
        }
        None => query.fetch_optional(pool).await,
    }
}

/// Execute a statement, inside the active transaction when there is one
pub(crate) async fn execute<'q>(
    pool: &PgPool,
    query: Query<'q, Postgres, PgArguments>,
) -> Result<u64, sqlx::Error> {
    let result = match active_transaction() {
        Some(shared) => {
            let mut guard = shared.lock().await;
            let tx = guard.as_mut().ok_or_else(finished_transaction)?;
            query.execute(&mut **tx).await?
        }
        None => query.execute(pool).await?,
    };
    Ok(result.rows_affected())
}

/// Coordinator backed by a pooled PostgreSQL transaction.
///
/// A scope started while another is active on the same task joins the outer
/// transaction.
#[derive(Clone)]
pub struct PgTransactionCoordinator {
    pool: PgPool,
}

impl PgTransactionCoordinator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TransactionCoordinator for PgTransactionCoordinator {
    async fn run<'a>(&'a self, scope: TransactionScope<'a>) -> Outcome<()> {
        if active_transaction().is_some() {
            return scope.await;
        }

        let tx = self
            .pool
            .begin()
            .await
            .map_err(|err| database_failure("begin transaction", err))?;
        let shared: SharedTransaction = Arc::new(Mutex::new(Some(tx)));

        // Dropping `shared` before completion drops the transaction, which
        // rolls it back.
        let result = ACTIVE_TRANSACTION
            .scope(Arc::clone(&shared), AssertUnwindSafe(scope).catch_unwind())
            .await;
        let tx = shared.lock().await.take();

        match result {
            Ok(Ok(())) => {
                let tx = tx.ok_or_else(|| database_failure("commit", finished_transaction()))?;
                tx.commit()
                    .await
                    .map_err(|err| database_failure("commit", err))?;
                tracing::debug!("transaction committed");
                Ok(())
            }
            Ok(Err(failure)) => {
                rollback(tx).await;
                Err(failure)
            }
            Err(panic) => {
                rollback(tx).await;
                std::panic::resume_unwind(panic)
            }
        }
    }
}

async fn rollback(tx: Option<Transaction<'static, Postgres>>) {
    if let Some(tx) = tx {
        match tx.rollback().await {
            Ok(()) => tracing::debug!("transaction rolled back"),
            Err(err) => tracing::error!(error = %err, "transaction rollback failed"),
        }
    }
}
