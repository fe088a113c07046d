use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, warn};

use parley_core::config::ToolsConfig;
use parley_core::protocol::ToolDefinition;

use crate::error::ToolError;
use crate::schema::validate_arguments;
use crate::{Tool, ToolMetadata};

pub const DEFAULT_HISTORY_CAPACITY: usize = 100;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum ExecutionResult {
    Success(String),
    Failure(ToolError),
    Timeout,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Output for the model: the result itself, or a readable error.
    pub fn to_output(&self) -> String {
        match self {
            Self::Success(output) => output.clone(),
            Self::Failure(e) => format!("Error: {e}"),
            Self::Timeout => "Error: tool execution timed out".to_string(),
        }
    }
}

/// Record of one call, kept in the executor's history.
#[derive(Debug, Clone, Serialize)]
pub struct ToolExecution {
    pub id: String,
    pub tool_name: String,
    pub arguments: String,
    pub result: ExecutionResult,
    pub timestamp: DateTime<Utc>,
    pub duration: Duration,
}

/// Registry of tools plus a bounded execution history.
pub struct ToolExecutor {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    history: Mutex<VecDeque<ToolExecution>>,
    history_capacity: usize,
    default_timeout: Duration,
}

impl Default for ToolExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolExecutor {
    pub fn new() -> Self {
        Self::with_history_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_history_capacity(capacity: usize) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            history_capacity: capacity,
            default_timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn from_config(config: &ToolsConfig) -> Self {
        let mut executor = Self::with_history_capacity(config.history_capacity);
        executor.default_timeout = config.timeout();
        executor
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&self, tool: Arc<dyn Tool>) -> Option<Arc<dyn Tool>> {
        let name = tool.name().to_string();
        let previous = self
            .tools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), tool);
        if previous.is_some() {
            info!(tool = %name, "Replaced tool");
        } else {
            debug!(tool = %name, "Registered tool");
        }
        previous
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Metadata of every registered tool, sorted by name.
    pub fn available_tools(&self) -> Vec<ToolMetadata> {
        let tools = self.tools.read().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<ToolMetadata> =
            tools.values().map(|t| ToolMetadata::of(t.as_ref())).collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Function definitions for `session.update`.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.available_tools()
            .iter()
            .map(ToolMetadata::to_definition)
            .collect()
    }

    /// Look up, validate and run a tool, cancelling it after `timeout`.
    ///
    /// The call is recorded in the history whatever the outcome. Dropping the
    /// returned future aborts the tool body and records the call as cancelled.
    pub async fn execute(&self, name: &str, arguments: &str, timeout: Duration) -> ToolExecution {
        let call = PendingCall::begin(self, name, arguments);
        let result = self.run(name, arguments, timeout).await;

        match &result {
            ExecutionResult::Success(_) => info!(
                tool = name,
                duration_ms = call.started.elapsed().as_millis() as u64,
                "Tool succeeded"
            ),
            ExecutionResult::Failure(e) => warn!(tool = name, error = %e, "Tool failed"),
            ExecutionResult::Timeout => warn!(
                tool = name,
                timeout_ms = timeout.as_millis() as u64,
                "Tool timed out"
            ),
        }
        call.finish(result)
    }

    /// Like [`execute`](Self::execute), flattened to the string given to the model.
    pub async fn execute_simple(&self, name: &str, arguments: &str, timeout: Duration) -> String {
        self.execute(name, arguments, timeout).await.result.to_output()
    }

    async fn run(&self, name: &str, arguments: &str, timeout: Duration) -> ExecutionResult {
        let Some(tool) = self.get(name) else {
            return ExecutionResult::Failure(ToolError::NotFound(name.to_string()));
        };

        let params = match validate_arguments(&tool.parameters_schema(), arguments) {
            Ok(params) => params,
            Err(e) => return ExecutionResult::Failure(e),
        };

        // The body runs as its own task, aborted on timeout or when this future is dropped.
        let task = tokio::spawn(async move { tool.execute(params).await });
        let mut handle = AbortOnDropHandle::new(task);
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(Ok(output))) => ExecutionResult::Success(output),
            Ok(Ok(Err(e))) => ExecutionResult::Failure(ToolError::Execution(format!("{e:#}"))),
            Ok(Err(join_error)) => ExecutionResult::Failure(ToolError::Execution(
                if join_error.is_panic() {
                    "tool panicked".to_string()
                } else {
                    join_error.to_string()
                },
            )),
            Err(_) => {
                handle.abort();
                ExecutionResult::Timeout
            }
        }
    }

    fn record(&self, execution: ToolExecution) {
        if self.history_capacity == 0 {
            return;
        }
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        while history.len() >= self.history_capacity {
            history.pop_front();
        }
        history.push_back(execution);
    }

    /// Executions, oldest first.
    pub fn history(&self) -> Vec<ToolExecution> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn history_capacity(&self) -> usize {
        self.history_capacity
    }

}

/// A call in progress. Finishing records its result; dropping it unfinished
/// records a cancellation.
struct PendingCall<'a> {
    executor: &'a ToolExecutor,
    id: String,
    tool_name: String,
    arguments: String,
    timestamp: DateTime<Utc>,
    started: Instant,
    finished: bool,
}

impl<'a> PendingCall<'a> {
    fn begin(executor: &'a ToolExecutor, name: &str, arguments: &str) -> Self {
        Self {
            executor,
            id: uuid::Uuid::new_v4().to_string(),
            tool_name: name.to_string(),
            arguments: arguments.to_string(),
            timestamp: Utc::now(),
            started: Instant::now(),
            finished: false,
        }
    }

    fn execution(&self, result: ExecutionResult) -> ToolExecution {
        ToolExecution {
            id: self.id.clone(),
            tool_name: self.tool_name.clone(),
            arguments: self.arguments.clone(),
            result,
            timestamp: self.timestamp,
            duration: self.started.elapsed(),
        }
    }

    fn finish(mut self, result: ExecutionResult) -> ToolExecution {
        self.finished = true;
        let execution = self.execution(result);
        self.executor.record(execution.clone());
        execution
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        info!(tool = %self.tool_name, "Tool call cancelled");
        let execution = self.execution(ExecutionResult::Failure(ToolError::Execution(
            "cancelled".to_string(),
        )));
        self.executor.record(execution);
    }
}
