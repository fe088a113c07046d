use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a tool call did not succeed. Timeouts are reported separately as
/// [`crate::ExecutionResult::Timeout`].
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("invalid arguments: {0}")]
    Validation(String),

    #[error("execution failed: {0}")]
    Execution(String),
}
