//! Transaction Management
//!
//! Scoped transactions over the execution-engine collaborator: commit on
//! success, roll back on failure, never retried.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::backends::{EngineTransaction, ExecutionEngine, Row};
use crate::error::{OrmError, OrmResult};
use crate::query::Statement;

/// An open transaction plus the engine it was started on
pub struct TransactionScope {
    engine: Arc<dyn ExecutionEngine>,
    inner: Option<Box<dyn EngineTransaction>>,
}

impl TransactionScope {
    pub async fn begin(engine: Arc<dyn ExecutionEngine>) -> OrmResult<Self> {
        debug!("Beginning transaction on {}", engine.backend());
        let tx = engine.begin_transaction().await?;
        Ok(Self {
            engine,
            inner: Some(tx),
        })
    }

    pub fn engine(&self) -> &Arc<dyn ExecutionEngine> {
        &self.engine
    }

    /// Check if the transaction is still active (not committed or rolled back)
    pub fn is_active(&self) -> bool {
        self.inner.is_some()
    }

    pub(crate) fn handle(&mut self) -> OrmResult<&mut (dyn EngineTransaction + 'static)> {
        match self.inner.as_deref_mut() {
            Some(tx) => Ok(tx),
            None => Err(consumed()),
        }
    }

    pub async fn execute(&mut self, statement: &Statement) -> OrmResult<Vec<Row>> {
        self.handle()?.execute(statement).await
    }

    pub async fn commit(mut self) -> OrmResult<()> {
        let tx = self.inner.take().ok_or_else(consumed)?;
        debug!("Committing transaction");
        tx.commit().await
    }

    pub async fn rollback(mut self) -> OrmResult<()> {
        let tx = self.inner.take().ok_or_else(consumed)?;
        debug!("Rolling back transaction");
        tx.rollback().await
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        if self.inner.is_some() {
            // Can't await here; the engine's handle releases the transaction
            warn!("Transaction dropped without explicit commit or rollback");
        }
    }
}

fn consumed() -> OrmError {
    OrmError::Transaction("Transaction has already been consumed".to_string())
}

/// Run `f` inside a transaction
///
/// Commits when `f` succeeds and rolls back when it fails. Concurrency
/// conflicts (`StaleWrite`, `LockTimeout`) are returned as they are; the
/// caller decides whether to run the work again.
pub async fn with_transaction<F, R>(engine: Arc<dyn ExecutionEngine>, f: F) -> OrmResult<R>
where
    F: for<'t> FnOnce(&'t mut TransactionScope) -> BoxFuture<'t, OrmResult<R>>,
{
    let mut scope = TransactionScope::begin(engine).await?;

    match f(&mut scope).await {
        Ok(value) => {
            scope.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = scope.rollback().await {
                warn!("Rollback after '{}' failed: {}", e, rollback);
            }
            Err(e)
        }
    }
}
