//! Model state manager - availability tracking on top of the model cache
//! and the optional accelerator.

use std::sync::Arc;
use std::time::Duration;

use super::accelerator::{AcceleratorSlot, ModelAccelerator};
use super::cache::ModelCache;
use super::errors::ModelError;
use super::types::{is_available, ModelRecord, ModelStatus};
use super::ModelSource;
use crate::config::ModelsSettings;
use crate::gateway::resilience::SharedClock;

pub struct ModelStateManager {
    source: Arc<dyn ModelSource>,
    cache: ModelCache,
    accelerator: AcceleratorSlot,
    load_ttl_secs: u64,
    confirm_attempts: u32,
    confirm_interval: Duration,
}

impl ModelStateManager {
    pub fn new(
        source: Arc<dyn ModelSource>,
        accelerator: AcceleratorSlot,
        settings: &ModelsSettings,
        clock: SharedClock,
    ) -> Self {
        Self {
            source,
            cache: ModelCache::new(Duration::from_secs(settings.cache_ttl_secs), clock),
            accelerator,
            load_ttl_secs: settings.load_ttl_secs,
            confirm_attempts: settings.confirm_attempts.max(1),
            confirm_interval: Duration::from_millis(settings.confirm_interval_ms),
        }
    }

    /// The backend's models, from cache unless expired or forced.
    pub async fn list_models(&self, force_refresh: bool) -> Result<Arc<Vec<ModelRecord>>, ModelError> {
        Ok(self.cache.get(self.source.as_ref(), force_refresh).await?)
    }

    /// Forget the cached model list.
    pub fn invalidate(&self) {
        self.cache.invalidate();
    }

    /// Check that `model_id` exists on the backend.
    ///
    /// A miss against a cached list is re-checked once against a fresh one
    /// before failing.
    pub async fn validate(&self, model_id: &str) -> Result<(), ModelError> {
        if self.list_models(false).await?.iter().any(|m| m.id == model_id) {
            return Ok(());
        }
        let fresh = self.list_models(true).await?;
        if fresh.iter().any(|m| m.id == model_id) {
            return Ok(());
        }
        Err(ModelError::NotFound {
            requested: model_id.to_string(),
            available: fresh.iter().map(|m| m.id.clone()).collect(),
        })
    }

    /// Make sure `model_id` can serve a request. Idempotent.
    ///
    /// An accepted load request is never taken as proof: availability is
    /// re-observed until confirmed or the attempts run out.
    pub async fn ensure_available(&self, model_id: &str) -> Result<(), ModelError> {
        let accelerator = self.accelerator.get().await;

        let status = self.observe(model_id, accelerator).await?;
        if status.is_some_and(is_available) {
            tracing::debug!(model = model_id, status = ?status, "model already available");
            return Ok(());
        }

        let Some(accelerator) = accelerator else {
            tracing::debug!(
                model = model_id,
                status = ?status,
                "no accelerator, relying on backend just-in-time loading"
            );
            return Ok(());
        };

        tracing::info!(model = model_id, status = ?status, "loading model");
        if !accelerator.load(model_id, self.load_ttl_secs).await {
            tracing::warn!(model = model_id, "accelerator rejected load request");
        }

        for attempt in 1..=self.confirm_attempts {
            let status = self.observe(model_id, Some(accelerator)).await?;
            if status.is_some_and(is_available) {
                tracing::info!(model = model_id, attempt, "model load confirmed");
                self.cache.invalidate();
                return Ok(());
            }
            tracing::debug!(model = model_id, attempt, status = ?status, "model not yet available");
            if attempt < self.confirm_attempts {
                tokio::time::sleep(self.confirm_interval).await;
            }
        }

        Err(ModelError::Unavailable {
            model: model_id.to_string(),
            detail: accelerator.status().await.last_error,
        })
    }

    /// Current status of one model, freshly observed.
    async fn observe(
        &self,
        model_id: &str,
        accelerator: Option<&Arc<dyn ModelAccelerator>>,
    ) -> Result<Option<ModelStatus>, ModelError> {
        let records = match accelerator {
            Some(acc) => Arc::new(acc.list_loaded().await),
            None => self.list_models(true).await?,
        };
        Ok(records.iter().find(|m| m.id == model_id).map(|m| m.status))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
