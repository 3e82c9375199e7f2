//! FIFO serialization of store operations.

use std::time::Instant;

use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Hands out one turn at a time, in request order.
///
/// `tokio::sync::Mutex` queues waiters fairly, so operations run in the order
/// they asked for a turn and never interleave.
#[derive(Debug, Default)]
pub struct OperationQueue {
    turn: Mutex<()>,
}

/// Exclusive right to touch the graph; released on drop.
pub struct QueueTurn<'a> {
    _guard: MutexGuard<'a, ()>,
    operation: &'static str,
    id: Uuid,
    started: Instant,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for this operation's turn.
    pub async fn enter(&self, operation: &'static str) -> QueueTurn<'_> {
        let id = Uuid::new_v4();
        let guard = self.turn.lock().await;
        tracing::debug!(op_id = %id, operation, "Operation started");
        QueueTurn {
            _guard: guard,
            operation,
            id,
            started: Instant::now(),
        }
    }
}

impl QueueTurn<'_> {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for QueueTurn<'_> {
    fn drop(&mut self) {
        tracing::debug!(
            op_id = %self.id,
            operation = self.operation,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Operation finished"
        );
    }
}
