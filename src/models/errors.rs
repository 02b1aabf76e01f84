//! Model state error types.

use thiserror::Error;

use crate::gateway::GatewayError;

#[derive(Debug, Error)]
pub enum ModelError {
    /// The requested model is not in the backend's listing.
    #[error("model '{requested}' not found (available: {})", available.join(", "))]
    NotFound {
        requested: String,
        available: Vec<String>,
    },

    /// The model exists but could not be made available.
    #[error("model '{model}' is not available{}", detail.as_ref().map(|d| format!(": {d}")).unwrap_or_default())]
    Unavailable {
        model: String,
        /// Last error reported by the accelerator, if one is attached.
        detail: Option<String>,
    },

    /// The backend reported no models at all.
    #[error("backend reports no models")]
    NoModels,

    /// Listing models failed.
    #[error(transparent)]
    Backend(#[from] GatewayError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_lists_alternatives() {
        let err = ModelError::NotFound {
            requested: "gpt-9".into(),
            available: vec!["qwen".into(), "llama".into()],
        };
        assert_eq!(err.to_string(), "model 'gpt-9' not found (available: qwen, llama)");
    }

    #[test]
    fn test_unavailable_detail_is_optional() {
        let bare = ModelError::Unavailable {
            model: "qwen".into(),
            detail: None,
        };
        assert_eq!(bare.to_string(), "model 'qwen' is not available");

        let detailed = ModelError::Unavailable {
            model: "qwen".into(),
            detail: Some("out of memory".into()),
        };
        assert!(detailed.to_string().ends_with(": out of memory"));
    }
}
