//! Exchange registry — in-flight exchanges keyed by handle or request id.
//!
//! A concurrent map with per-entry idle tracking. The sweep snapshots
//! expired keys first and then removes each one individually, so no shard
//! lock is held across the whole pass.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tether_core::TetherError;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

struct Tracked<T> {
    value: T,
    created_at: Instant,
    last_activity: Instant,
    timeout: Duration,
}

impl<T> Tracked<T> {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_activity) > self.timeout
    }
}

/// Concurrent table of exchanges owned by the peer that minted their ids.
pub struct ExchangeRegistry<T> {
    /// Label used in logs ("rpc", "tunnel").
    name: &'static str,
    entries: Arc<DashMap<String, Tracked<T>>>,
}

impl<T> Clone for ExchangeRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            entries: self.entries.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> ExchangeRegistry<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Track a new exchange. A duplicate id is a handle-generation bug and fails.
    pub fn insert(&self, id: String, value: T, timeout: Duration) -> Result<(), TetherError> {
        use dashmap::mapref::entry::Entry;
        match self.entries.entry(id) {
            Entry::Occupied(e) => Err(TetherError::DuplicateExchange(e.key().clone())),
            Entry::Vacant(e) => {
                let now = Instant::now();
                e.insert(Tracked {
                    value,
                    created_at: now,
                    last_activity: now,
                    timeout,
                });
                Ok(())
            }
        }
    }

    /// Mutate an exchange in place and refresh its activity timestamp.
    ///
    /// `f` runs under the entry's shard lock and must not touch this registry.
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut entry = self.entries.get_mut(id)?;
        entry.last_activity = Instant::now();
        Some(f(&mut entry.value))
    }

    pub fn remove(&self, id: &str) -> Option<T> {
        self.entries.remove(id).map(|(_, tracked)| tracked.value)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Age of an exchange since creation.
    pub fn age(&self, id: &str) -> Option<Duration> {
        self.entries.get(id).map(|e| e.created_at.elapsed())
    }

    /// Drop every exchange. Used when the owning channel goes away.
    pub fn clear(&self) {
        let count = self.entries.len();
        self.entries.clear();
        if count > 0 {
            tracing::info!(registry = self.name, count, "dropped in-flight exchanges");
        }
    }

    /// Evict every exchange idle for longer than its timeout. Returns the count.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().is_expired(now))
            .map(|e| e.key().clone())
            .collect();

        let mut evicted = 0;
        for id in expired {
            // Re-check: the exchange may have seen activity since the snapshot.
            if self.entries.remove_if(&id, |_, t| t.is_expired(now)).is_some() {
                tracing::warn!(registry = self.name, id, "evicted idle exchange");
                evicted += 1;
            }
        }
        evicted
    }

    /// Run [`sweep`](Self::sweep) every `interval` until shutdown.
    pub fn spawn_sweeper(
        &self,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        tracing::info!(registry = registry.name, "exchange sweeper shutting down");
                        registry.clear();
                        return;
                    }
                    _ = ticker.tick() => {
                        let evicted = registry.sweep();
                        if evicted > 0 {
                            tracing::debug!(registry = registry.name, evicted, remaining = registry.len(), "sweep complete");
                        }
                    }
                }
            }
        })
    }
}
