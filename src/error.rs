//! Error taxonomy for the analysis workflow.
//!
//! Per-item errors are classified into a closed set so the orchestrator can
//! decide, per variant, whether an item counts as skipped or failed and
//! whether the whole run must abort. Collaborator calls surface
//! `anyhow::Error`; the workflow wraps them into this taxonomy at the point
//! where the distinction matters.

use thiserror::Error;

use crate::models::ItemOutcome;

#[derive(Debug, Error)]
pub enum AnalysisError {
    /// Bad request parameters (missing target collection, unknown source).
    /// Surfaced immediately; no checkpoint is touched.
    #[error("validation error: {0}")]
    Validation(String),

    /// Timeout, connection, rate-limit, or 5xx failure that survived the
    /// retry budget. Recorded as a per-item failure.
    #[error("transient API failure: {0}")]
    Transient(String),

    /// The item has no fulltext and no multimodal text. Not
    /// operator-actionable, so recorded as skipped rather than failed.
    #[error("no analyzable content: {0}")]
    ContentUnavailable(String),

    /// The LLM returned an empty or invalid analysis. A contract
    /// violation, recorded as a failure.
    #[error("llm contract violation: {0}")]
    LlmContract(String),

    /// The LLM client could not be constructed (bad credentials,
    /// unsupported provider). Fatal for the whole run, surfaced before any
    /// item is touched.
    #[error("llm client initialization failed: {0}")]
    ClientInit(String),

    /// Anything else from a collaborator call.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AnalysisError {
    /// Map a per-item error onto its terminal outcome. Content
    /// unavailability is the one variant that lands in the skipped bucket.
    pub fn into_outcome(self) -> ItemOutcome {
        match self {
            AnalysisError::ContentUnavailable(reason) => ItemOutcome::Skipped { reason },
            other => ItemOutcome::Failed {
                error: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_unavailable_maps_to_skipped() {
        let outcome = AnalysisError::ContentUnavailable("no fulltext".into()).into_outcome();
        assert!(outcome.is_skipped());
    }

    #[test]
    fn test_other_variants_map_to_failed() {
        for err in [
            AnalysisError::Transient("timeout".into()),
            AnalysisError::LlmContract("empty".into()),
            AnalysisError::Validation("bad".into()),
        ] {
            assert!(err.into_outcome().is_failed());
        }
    }
}
