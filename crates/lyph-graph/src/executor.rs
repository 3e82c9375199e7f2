//! The statement execution seam between the store and a graph backend.

use std::sync::Arc;

use async_trait::async_trait;

use crate::client::GraphError;
use crate::statement::{Row, Statement};

/// Runs batches of statements against a graph backend.
///
/// All statements passed to one `execute` call form a single atomic unit:
/// either every statement takes effect, or the call fails and none does.
/// The result holds one row list per statement, in order.
#[async_trait]
pub trait StatementExecutor: Send + Sync {
    async fn execute(&self, statements: Vec<Statement>) -> Result<Vec<Vec<Row>>, GraphError>;

    /// Run a single statement and return its rows.
    async fn execute_one(&self, statement: Statement) -> Result<Vec<Row>, GraphError> {
        let mut results = self.execute(vec![statement]).await?;
        Ok(results.pop().unwrap_or_default())
    }
}

#[async_trait]
impl<T: StatementExecutor + ?Sized> StatementExecutor for Arc<T> {
    async fn execute(&self, statements: Vec<Statement>) -> Result<Vec<Vec<Row>>, GraphError> {
        (**self).execute(statements).await
    }
}
