//! Globally unique id allocation through the singleton counter node.

use std::time::Duration;

use lyph_core::{EntityId, StoreConfig};
use lyph_graph::{GraphError, Row, Statement, StatementExecutor};

use crate::error::{Result, StoreError};

/// Hands out monotonically increasing ids under the counter's lock flag.
#[derive(Debug, Clone)]
pub struct IdentityAllocator {
    attempts: u32,
    backoff: Duration,
}

impl IdentityAllocator {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            attempts: config.id_lock_attempts.max(1),
            backoff: Duration::from_millis(config.id_lock_backoff_ms),
        }
    }

    /// Reserve `count` consecutive ids.
    pub async fn reserve(
        &self,
        executor: &dyn StatementExecutor,
        count: u32,
    ) -> Result<Vec<EntityId>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let rows = self
            .with_lock(executor, Statement::ReserveIds { count })
            .await?;
        let first = rows
            .first()
            .ok_or_else(|| StoreError::validation("id counter returned no reservation"))?
            .int("first")?;
        tracing::debug!(first, count, "Reserved ids");
        Ok((0..i64::from(count)).map(|i| EntityId(first + i)).collect())
    }

    /// Make sure the counter never hands out `id` or anything below it.
    pub async fn claim(&self, executor: &dyn StatementExecutor, id: EntityId) -> Result<()> {
        self.with_lock(
            executor,
            Statement::RaiseIdFloor {
                at_least: EntityId(id.0 + 1),
            },
        )
        .await?;
        Ok(())
    }

    /// Run one counter statement between acquiring and releasing the lock,
    /// all in a single batch. A failure anywhere rolls the flag back with
    /// the statement, and a dropped future never commits half of it.
    async fn with_lock(
        &self,
        executor: &dyn StatementExecutor,
        statement: Statement,
    ) -> Result<Vec<Row>> {
        for attempt in 1..=self.attempts {
            let batch = vec![Statement::AcquireIdLock, statement.clone(), Statement::ReleaseIdLock];
            match executor.execute(batch).await {
                Ok(results) => return Ok(results.into_iter().nth(1).unwrap_or_default()),
                Err(GraphError::LockHeld) => {
                    tracing::debug!(attempt, "Id counter lock busy, backing off");
                    if attempt < self.attempts {
                        tokio::time::sleep(self.backoff).await;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        tracing::warn!(attempts = self.attempts, "Gave up waiting for the id counter lock");
        Err(StoreError::IdLockContended {
            attempts: self.attempts,
        })
    }
}
