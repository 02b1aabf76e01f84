//! Optional model accelerator - a collaborator that can load and unload
//! models ahead of the first request.
//!
//! The relay works without one (the backend loads models just in time); it is
//! only consulted when present. Absence is detected once per slot and cached.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tokio::sync::OnceCell;

use super::types::{ModelRecord, ModelStatus};
use crate::gateway::resilience::SharedClock;

/// Structured health signal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AcceleratorHealth {
    pub reachable: bool,
    pub last_error: Option<String>,
}

#[async_trait]
pub trait ModelAccelerator: Send + Sync {
    /// Models currently resident.
    async fn list_loaded(&self) -> Vec<ModelRecord>;

    /// Ask for `model_id` to be loaded with an idle TTL. `true` means the
    /// request was accepted, not that the model is ready.
    async fn load(&self, model_id: &str, ttl_secs: u64) -> bool;

    async fn unload(&self, model_id: &str) -> bool;

    async fn status(&self) -> AcceleratorHealth;
}

// ─── Slot ────────────────────────────────────────────────────────────────────

/// Holds a candidate accelerator and checks it at most once.
pub struct AcceleratorSlot {
    candidate: Option<Arc<dyn ModelAccelerator>>,
    resolved: OnceCell<Option<Arc<dyn ModelAccelerator>>>,
}

impl AcceleratorSlot {
    pub fn new(candidate: Option<Arc<dyn ModelAccelerator>>) -> Self {
        Self {
            candidate,
            resolved: OnceCell::new(),
        }
    }

    /// A slot with nothing in it.
    pub fn empty() -> Self {
        Self::new(None)
    }

    /// The accelerator, if one is attached and answered its first status check.
    pub async fn get(&self) -> Option<&Arc<dyn ModelAccelerator>> {
        self.resolved
            .get_or_init(|| async {
                let candidate = self.candidate.as_ref()?;
                let health = candidate.status().await;
                if health.reachable {
                    tracing::info!("model accelerator available");
                    Some(Arc::clone(candidate))
                } else {
                    tracing::debug!(
                        error = ?health.last_error,
                        "model accelerator unreachable, relying on just-in-time loading"
                    );
                    None
                }
            })
            .await
            .as_ref()
    }
}

// ─── LM Studio CLI ───────────────────────────────────────────────────────────

/// Timeout for a single `lms` invocation. Loads of large models are slow.
const LMS_TIMEOUT: Duration = Duration::from_secs(120);

/// Accelerator backed by the LM Studio `lms` command-line tool.
pub struct LmsAccelerator {
    binary: String,
    clock: SharedClock,
    last_error: Mutex<Option<String>>,
}

impl LmsAccelerator {
    pub fn new(binary: impl Into<String>, clock: SharedClock) -> Self {
        Self {
            binary: binary.into(),
            clock,
            last_error: Mutex::new(None),
        }
    }

    /// `lms` from `PATH`, or from LM Studio's default install location.
    pub fn locate(clock: SharedClock) -> Self {
        let bundled = dirs::home_dir()
            .map(|h| h.join(".lmstudio").join("bin").join("lms"))
            .filter(|p| p.is_file());
        match bundled {
            Some(path) => Self::new(path.display().to_string(), clock),
            None => Self::new("lms", clock),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, String> {
        let output = tokio::time::timeout(
            LMS_TIMEOUT,
            Command::new(&self.binary).args(args).kill_on_drop(true).output(),
        )
        .await;

        let result = match output {
            Err(_) => Err(format!("`lms {}` timed out", args.join(" "))),
            Ok(Err(e)) => Err(format!("failed to run {}: {e}", self.binary)),
            Ok(Ok(out)) if out.status.success() => Ok(String::from_utf8_lossy(&out.stdout).into_owned()),
            Ok(Ok(out)) => Err(format!(
                "`lms {}` exited with {}: {}",
                args.join(" "),
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )),
        };

        let mut last_error = self.last_error.lock().unwrap_or_else(PoisonError::into_inner);
        match &result {
            Ok(_) => *last_error = None,
            Err(e) => {
                tracing::warn!(error = %e, "lms command failed");
                *last_error = Some(e.clone());
            }
        }
        result
    }

    fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ModelAccelerator for LmsAccelerator {
    async fn list_loaded(&self) -> Vec<ModelRecord> {
        match self.run(&["ps", "--json"]).await {
            Ok(stdout) => parse_lms_ps(&stdout, self.clock.utc()),
            Err(_) => Vec::new(),
        }
    }

    async fn load(&self, model_id: &str, ttl_secs: u64) -> bool {
        let ttl = ttl_secs.to_string();
        self.run(&["load", model_id, "--ttl", &ttl, "-y"]).await.is_ok()
    }

    async fn unload(&self, model_id: &str) -> bool {
        self.run(&["unload", model_id]).await.is_ok()
    }

    async fn status(&self) -> AcceleratorHealth {
        let reachable = self.run(&["status"]).await.is_ok();
        AcceleratorHealth {
            reachable,
            last_error: self.last_error(),
        }
    }
}

/// Parse `lms ps --json`: an array of loaded model objects.
fn parse_lms_ps(stdout: &str, observed_at: chrono::DateTime<chrono::Utc>) -> Vec<ModelRecord> {
    let Ok(serde_json::Value::Array(entries)) = serde_json::from_str(stdout.trim()) else {
        tracing::warn!("unexpected `lms ps --json` output");
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            let id = ["identifier", "modelKey", "path"]
                .iter()
                .find_map(|key| entry.get(*key).and_then(|v| v.as_str()))?;
            // Everything `ps` lists is resident; a reported status refines it.
            let status = match entry.get("status").and_then(|v| v.as_str()) {
                Some(raw) => ModelStatus::from_backend(Some(raw)),
                None => ModelStatus::Loaded,
            };
            Some(ModelRecord {
                id: id.to_string(),
                status,
                last_observed_at: observed_at,
            })
        })
        .collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
