//! Pending completions — single-resolution waiters keyed by correlation id.
//!
//! A waiter is resolved by removing its sender from the table. Removal is
//! atomic, so exactly one of response, timeout or cancellation wins and
//! every later attempt finds nothing to resolve.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tether_core::TetherError;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

type Waiter<T> = oneshot::Sender<Result<T, TetherError>>;
type Outcome<T> = oneshot::Receiver<Result<T, TetherError>>;

/// Table of outstanding waiters.
pub struct PendingCompletions<T> {
    waiters: Arc<DashMap<String, Waiter<T>>>,
}

impl<T> Clone for PendingCompletions<T> {
    fn clone(&self) -> Self {
        Self {
            waiters: self.waiters.clone(),
        }
    }
}

impl<T> Default for PendingCompletions<T> {
    fn default() -> Self {
        Self {
            waiters: Arc::new(DashMap::new()),
        }
    }
}

impl<T: Send + 'static> PendingCompletions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `id`. Fails if one is already outstanding.
    pub fn register(&self, id: &str) -> Result<PendingCompletion<T>, TetherError> {
        let (tx, rx) = oneshot::channel();
        match self.waiters.entry(id.to_string()) {
            Entry::Occupied(_) => return Err(TetherError::DuplicateExchange(id.to_string())),
            Entry::Vacant(e) => {
                e.insert(tx);
            }
        }
        Ok(PendingCompletion {
            id: id.to_string(),
            rx: Some(rx),
            table: self.clone(),
        })
    }

    /// Resolve the waiter for `id`. Returns false if it was already resolved or never existed.
    pub fn resolve(&self, id: &str, outcome: Result<T, TetherError>) -> bool {
        match self.waiters.remove(id) {
            Some((_, tx)) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.waiters.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

/// The waiting half of a registered completion.
///
/// Dropping it removes the table entry, so an abandoned waiter never lingers.
pub struct PendingCompletion<T: Send + 'static> {
    id: String,
    rx: Option<Outcome<T>>,
    table: PendingCompletions<T>,
}

impl<T: Send + 'static> PendingCompletion<T> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the outcome, racing `timeout` and the caller's `cancel` signal.
    pub async fn wait(
        mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<T, TetherError> {
        let Some(mut rx) = self.rx.take() else {
            return Err(TetherError::Cancelled);
        };

        let lost = tokio::select! {
            biased;
            outcome = &mut rx => return outcome.unwrap_or(Err(TetherError::Cancelled)),
            _ = tokio::time::sleep(timeout) => TetherError::Timeout(timeout),
            _ = cancel.cancelled() => TetherError::Cancelled,
        };
        self.settle(rx, lost).await
    }

    /// Timeout or cancellation fired. Whoever removes the entry decides.
    async fn settle(&self, rx: Outcome<T>, lost: TetherError) -> Result<T, TetherError> {
        if self.table.waiters.remove(&self.id).is_some() {
            tracing::debug!(id = %self.id, outcome = %lost, "pending completion abandoned");
            return Err(lost);
        }
        // A response removed the entry first; its outcome is already in flight.
        rx.await.unwrap_or(Err(lost))
    }
}

impl<T: Send + 'static> Drop for PendingCompletion<T> {
    fn drop(&mut self) {
        self.table.waiters.remove(&self.id);
    }
}
