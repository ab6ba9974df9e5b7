//! CodeExecutor trait: the boundary to the sandboxed execution kernel.
//!
//! The agent loop never hands step memory to the kernel. It sends a code
//! string tagged with the completion that produced it and gets back a
//! structured result, including an optional request to finalize the session
//! (for code that decides on the answer itself).

use crate::error::ExecutionError;
use crate::language::Language;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A request to run one code directive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// The completion whose output contained the directive
    pub completion_id: String,

    /// Source code to run
    pub code: String,

    /// Language the code is written in
    pub language: Language,
}

/// A final answer produced out-of-band (by executed code or the host),
/// rather than by the model's next text response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeRecord {
    /// Visible answer text
    pub content: String,

    /// Execution record ids to surface in the answer
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commit_ids: Vec<String>,
}

/// Structured result of running one directive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionOutput {
    /// Captured stdout/stderr/display text (may be empty)
    pub output: String,

    /// Whether the code ran without raising
    #[serde(default = "default_success")]
    pub success: bool,

    /// Images the code displayed, as data URLs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,

    /// Set when the code asked to finish the session with this answer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalize: Option<FinalizeRecord>,
}

fn default_success() -> bool {
    true
}

impl ExecutionOutput {
    /// A successful run with captured text.
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            success: true,
            images: Vec::new(),
            finalize: None,
        }
    }

    /// A run where the code itself raised (traceback in `output`).
    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            success: false,
            images: Vec::new(),
            finalize: None,
        }
    }
}

/// The core CodeExecutor trait.
///
/// Implementations must multiplex independent sessions by completion id and
/// must not block one session's call on another's.
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    /// A human-readable name for this executor (e.g., "pyodide-kernel").
    fn name(&self) -> &str;

    /// Prepare the kernel. Called once when the executor is attached to a
    /// session; a failure here blocks the session until reconfigured.
    async fn initialize(&self) -> std::result::Result<(), ExecutionError> {
        Ok(())
    }

    /// Run one directive and capture its output.
    async fn execute(
        &self,
        request: ExecutionRequest,
    ) -> std::result::Result<ExecutionOutput, ExecutionError>;
}
