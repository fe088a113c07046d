//! Small built-in tools, useful for demos and smoke tests.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{FixedOffset, Utc};
use serde::Deserialize;

use crate::{Tool, ToolCategory, ToolExecutor};

/// Register every built-in tool.
pub fn register_builtins(executor: &ToolExecutor) {
    executor.register(Arc::new(CurrentTimeTool));
    executor.register(Arc::new(CalculateTool));
}

pub struct CurrentTimeTool;

#[derive(Deserialize)]
struct TimeParams {
    /// Offset from UTC in minutes.
    #[serde(default)]
    utc_offset_minutes: Option<i64>,
}

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time, in UTC or at a fixed UTC offset."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Information
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "utc_offset_minutes": {
                    "type": "integer",
                    "description": "Offset from UTC in minutes (e.g. 540 for UTC+9). Defaults to 0."
                }
            }
        })
    }

    async fn execute(&self, params: serde_json::Value) -> anyhow::Result<String> {
        let params: TimeParams = serde_json::from_value(params)?;
        let minutes = params.utc_offset_minutes.unwrap_or(0);
        let seconds = i32::try_from(minutes * 60)
            .map_err(|_| anyhow::anyhow!("utc_offset_minutes out of range: {minutes}"))?;
        let offset = FixedOffset::east_opt(seconds)
            .ok_or_else(|| anyhow::anyhow!("utc_offset_minutes out of range: {minutes}"))?;
        Ok(Utc::now().with_timezone(&offset).to_rfc3339())
    }
}

pub struct CalculateTool;

#[derive(Deserialize)]
struct CalcParams {
    a: f64,
    b: f64,
    operation: String,
}

#[async_trait]
impl Tool for CalculateTool {
    fn name(&self) -> &str {
        "calculate"
    }

    fn description(&self) -> &str {
        "Apply a basic arithmetic operation (add, subtract, multiply, divide) to two numbers."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Utility
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "a": { "type": "number", "description": "Left operand" },
                "b": { "type": "number", "description": "Right operand" },
                "operation": {
                    "type": "string",
                    "enum": ["add", "subtract", "multiply", "divide"]
                }
            },
            "required": ["a", "b", "operation"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> anyhow::Result<String> {
        let params: CalcParams = serde_json::from_value(params)?;
        let value = match params.operation.as_str() {
            "add" => params.a + params.b,
            "subtract" => params.a - params.b,
            "multiply" => params.a * params.b,
            "divide" => {
                if params.b == 0.0 {
                    anyhow::bail!("division by zero");
                }
                params.a / params.b
            }
            other => anyhow::bail!("unknown operation: {other}"),
        };
        Ok(value.to_string())
    }
}
