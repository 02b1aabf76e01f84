//! TTL cache for the backend's model list.
//!
//! One shared snapshot behind a read-mostly lock. Refreshes are serialised by
//! an async mutex; while one is in flight, readers holding a stale snapshot
//! are served it immediately and only readers with nothing cached wait.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::types::ModelRecord;
use super::ModelSource;
use crate::gateway::resilience::SharedClock;
use crate::gateway::GatewayError;

struct Snapshot {
    models: Arc<Vec<ModelRecord>>,
    fetched_at: DateTime<Utc>,
}

pub struct ModelCache {
    snapshot: RwLock<Option<Arc<Snapshot>>>,
    refresh: tokio::sync::Mutex<()>,
    ttl: Duration,
    clock: SharedClock,
}

impl ModelCache {
    pub fn new(ttl: Duration, clock: SharedClock) -> Self {
        Self {
            snapshot: RwLock::new(None),
            refresh: tokio::sync::Mutex::new(()),
            ttl,
            clock,
        }
    }

    /// Cached models, refreshing from `source` when expired or forced.
    pub async fn get(
        &self,
        source: &dyn ModelSource,
        force_refresh: bool,
    ) -> Result<Arc<Vec<ModelRecord>>, GatewayError> {
        let seen = self.current();
        if !force_refresh {
            if let Some(snap) = seen.as_ref().filter(|s| self.is_fresh(s)) {
                return Ok(Arc::clone(&snap.models));
            }
        }

        let _guard = match self.refresh.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                if let (false, Some(stale)) = (force_refresh, seen.as_ref()) {
                    tracing::debug!("model refresh in flight, serving stale list");
                    return Ok(Arc::clone(&stale.models));
                }
                self.refresh.lock().await
            }
        };

        // A refresh may have landed between our read and taking the lock.
        if let Some(current) = self.current() {
            let replaced = seen.as_ref().map_or(true, |s| !Arc::ptr_eq(s, &current));
            if replaced && (force_refresh || self.is_fresh(&current)) {
                return Ok(Arc::clone(&current.models));
            }
        }

        let models = Arc::new(source.fetch_models().await?);
        let snapshot = Arc::new(Snapshot {
            models: Arc::clone(&models),
            fetched_at: self.clock.utc(),
        });
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
        tracing::debug!(count = models.len(), "model list refreshed");
        Ok(models)
    }

    /// Drop the cached snapshot so the next read fetches.
    pub fn invalidate(&self) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn current(&self) -> Option<Arc<Snapshot>> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_fresh(&self, snapshot: &Snapshot) -> bool {
        let age = (self.clock.utc() - snapshot.fetched_at)
            .to_std()
            .unwrap_or_default();
        age < self.ttl
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
