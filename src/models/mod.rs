//! Model State Manager - backend model availability with a TTL cache.
//!
//! This module handles:
//! - Listing the backend's models through a shared, time-bounded snapshot
//! - Validating requested model ids
//! - Making a model available through an optional accelerator, confirming
//!   the load by observation

pub mod accelerator;
pub mod cache;
pub mod errors;
pub mod manager;
pub mod types;

use async_trait::async_trait;

use crate::gateway::GatewayError;

pub use accelerator::{AcceleratorHealth, AcceleratorSlot, LmsAccelerator, ModelAccelerator};
pub use cache::ModelCache;
pub use errors::ModelError;
pub use manager::ModelStateManager;
pub use types::{is_available, ModelRecord, ModelStatus};

/// Where the model list comes from.
#[async_trait]
pub trait ModelSource: Send + Sync {
    async fn fetch_models(&self) -> Result<Vec<ModelRecord>, GatewayError>;
}
