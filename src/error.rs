//! Error taxonomy for the retrieval engine and the agent loop.
//!
//! Most internals return [`anyhow::Result`] with context attached. The
//! variants of [`RagError`] mark the boundaries where the caller needs to
//! know *which kind* of failure happened, because the propagation policy
//! differs per kind:
//!
//! | Variant | Policy |
//! |---------|--------|
//! | [`RagError::LoadFailure`] | skip the file, continue the batch |
//! | [`RagError::IndexUnavailable`] | retrieval returns empty results |
//! | [`RagError::ToolExecutionFailure`] | folded into tool output text |
//! | [`RagError::SecurityRejection`] | replaced by a fixed refusal sentinel |
//! | [`RagError::InferenceFailure`] | fatal to the current turn |
//! | [`RagError::InvalidDecision`] | fatal to the current turn |
//! | [`RagError::IterationLimit`] | fatal to the current turn |

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RagError {
    #[error("failed to load {}: {reason}", path.display())]
    LoadFailure { path: PathBuf, reason: String },

    #[error("no index has been built yet")]
    IndexUnavailable,

    #[error("tool '{tool}' failed: {reason}")]
    ToolExecutionFailure { tool: String, reason: String },

    #[error("code rejected by the safety gate")]
    SecurityRejection,

    #[error("model inference failed: {0}")]
    InferenceFailure(String),

    #[error("model returned an invalid memory decision: {0}")]
    InvalidDecision(String),

    #[error("turn exceeded {limit} reasoning iterations without a final answer")]
    IterationLimit { limit: usize },
}

impl RagError {
    /// Whether this error aborts the current conversation turn.
    ///
    /// Everything below the turn level is recovered locally and turned into
    /// data the reasoning step can see.
    pub fn is_fatal_to_turn(&self) -> bool {
        matches!(
            self,
            RagError::InferenceFailure(_)
                | RagError::InvalidDecision(_)
                | RagError::IterationLimit { .. }
        )
    }
}
