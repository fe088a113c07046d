//! Tools the model can call during a conversation.
//!
//! Each tool implements the [`Tool`] trait and is registered with a
//! [`ToolExecutor`], which validates arguments against the tool's JSON
//! schema, runs it under a timeout and records every call.

pub mod builtin;
pub mod error;
pub mod executor;
pub mod schema;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use parley_core::protocol::ToolDefinition;

pub use error::ToolError;
pub use executor::{ExecutionResult, ToolExecution, ToolExecutor};
pub use schema::ParamType;

/// Broad grouping used when listing tools.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    #[default]
    General,
    Information,
    Utility,
    Communication,
    Custom,
}

impl std::fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::General => "general",
            Self::Information => "information",
            Self::Utility => "utility",
            Self::Communication => "communication",
            Self::Custom => "custom",
        };
        f.write_str(label)
    }
}

/// The core tool trait. Every built-in and application tool implements this.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name as exposed to the model (e.g., "get_weather"). Unique per executor.
    fn name(&self) -> &str;

    /// Human-readable description for the model.
    fn description(&self) -> &str;

    fn category(&self) -> ToolCategory {
        ToolCategory::General
    }

    /// JSON Schema describing the tool's parameters: an object with typed
    /// `properties` and a `required` list.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with already-validated arguments.
    async fn execute(&self, params: serde_json::Value) -> anyhow::Result<String>;
}

/// Snapshot of a registered tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
    pub category: ToolCategory,
    pub parameters: serde_json::Value,
}

impl ToolMetadata {
    pub fn of(tool: &dyn Tool) -> Self {
        Self {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            category: tool.category(),
            parameters: tool.parameters_schema(),
        }
    }

    /// Function definition advertised to the model in `session.update`.
    pub fn to_definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            self.name.clone(),
            self.description.clone(),
            self.parameters.clone(),
        )
    }
}
