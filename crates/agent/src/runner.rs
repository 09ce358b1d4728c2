//! Bounded-timeout tool invocation.

use std::collections::HashMap;
use std::time::Duration;

use warden_memory::{ErrorKind, Observation};
use warden_tools::{ToolCall, ToolRegistry};

/// Runs authorized tool calls with a per-tool-configurable deadline and folds
/// every outcome — success, tool error, nonzero exit, timeout — into an
/// [`Observation`] for the transcript.  Failures are reported to the model,
/// never retried here.
#[derive(Debug, Clone)]
pub struct ToolRunner {
    default_timeout: Duration,
    overrides: HashMap<String, Duration>,
}

impl ToolRunner {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            default_timeout,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, tool_name: impl Into<String>, timeout: Duration) -> Self {
        self.overrides.insert(tool_name.into(), timeout);
        self
    }

    pub fn timeout_for(&self, tool_name: &str) -> Duration {
        self.overrides
            .get(tool_name)
            .copied()
            .unwrap_or(self.default_timeout)
    }

    /// Execute one authorized call.  On deadline expiry the in-flight future
    /// is dropped, which kills any `kill_on_drop` subprocess rather than
    /// leaking it.
    pub async fn run(&self, registry: &ToolRegistry, call: &ToolCall) -> Observation {
        let Some(tool) = registry.lookup(call.tool_name()) else {
            // Validation precedes authorization, so this cannot happen for a
            // minted ToolCall; refuse loudly if it ever does.
            return Observation::failure(
                ErrorKind::ProtocolViolation,
                format!("unknown tool: {}", call.tool_name()),
            );
        };

        let timeout = self.timeout_for(call.tool_name());
        tracing::info!(tool = call.tool_name(), timeout_secs = timeout.as_secs(), "executing tool");

        match tokio::time::timeout(timeout, tool.run(call.arguments())).await {
            Err(_) => Observation::failure(
                ErrorKind::ToolExecution,
                format!(
                    "'{}' timed out after {}s",
                    call.tool_name(),
                    timeout.as_secs()
                ),
            ),
            Ok(Err(err)) => {
                Observation::failure(ErrorKind::ToolExecution, err.to_string())
            }
            Ok(Ok(output)) if output.success => Observation::success(output.output),
            Ok(Ok(output)) => Observation::failure(ErrorKind::ToolExecution, output.output),
        }
    }
}
