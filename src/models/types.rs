//! Model availability types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Backend-reported lifecycle state of one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Unloaded,
    Loading,
    Loaded,
    /// Loaded but inactive. The backend reactivates it on the next request.
    Idle,
}

impl ModelStatus {
    /// Map a backend `state`/`status` string.
    ///
    /// Unrecognised or missing states are `Unloaded`: a backend that does not
    /// report state makes no claim that the model is resident.
    pub fn from_backend(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("loaded") | Some("ready") | Some("running") => ModelStatus::Loaded,
            Some("idle") => ModelStatus::Idle,
            Some("loading") => ModelStatus::Loading,
            _ => ModelStatus::Unloaded,
        }
    }
}

/// `true` iff the model can serve a request right now.
pub fn is_available(status: ModelStatus) -> bool {
    matches!(status, ModelStatus::Loaded | ModelStatus::Idle)
}

/// One model as last observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelRecord {
    pub id: String,
    pub status: ModelStatus,
    pub last_observed_at: DateTime<Utc>,
}

impl ModelRecord {
    pub fn is_available(&self) -> bool {
        is_available(self.status)
    }
}
