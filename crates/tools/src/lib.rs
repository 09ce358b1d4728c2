use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Tool trait and registry ──────────────────────────────────────────────────

/// JSON-friendly type hint for a tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl Default for ParamType {
    fn default() -> Self {
        Self::String
    }
}

/// Danger classification for a concrete tool invocation.
///
/// | Class         | Meaning                                                  |
/// |---------------|----------------------------------------------------------|
/// | `Safe`        | Read-only, workspace-bounded.                            |
/// | `Sensitive`   | Writes or spawns processes; recoverable.                 |
/// | `Destructive` | Matches a known-irreversible pattern; always re-prompted.|
///
/// Classification is a pure function of (tool name, arguments): identical
/// calls always classify identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DangerClass {
    Safe,
    Sensitive,
    Destructive,
}

impl Default for DangerClass {
    fn default() -> Self {
        Self::Safe
    }
}

/// Optional rich metadata about a tool (baseline danger, grouping).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolMetadata {
    /// Classification when no argument inspection overrides it.
    pub base_danger: DangerClass,
    pub read_only: bool,
    pub group: String,
}

/// Describes a single parameter that a tool accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParam {
    pub name: String,
    pub description: String,
    pub required: bool,
    /// JSON Schema type for the parameter (default: String).
    #[serde(default)]
    pub param_type: ParamType,
}

impl Default for ToolParam {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            required: false,
            param_type: ParamType::String,
        }
    }
}

impl ToolParam {
    /// Convenience constructor for the most common case (required string param).
    pub fn required(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: true,
            param_type: ParamType::String,
        }
    }

    /// Convenience constructor for an optional string param.
    pub fn optional(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: false,
            param_type: ParamType::String,
        }
    }

    pub fn typed(mut self, param_type: ParamType) -> Self {
        self.param_type = param_type;
        self
    }
}

/// Static metadata about a tool, used by the LLM to decide which tool to call
/// and by the registry to validate proposed arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub params: Vec<ToolParam>,
    #[serde(default)]
    pub metadata: ToolMetadata,
}

/// Argument payload for a tool call.  Key order is preserved as the model
/// emitted it (`serde_json` is built with `preserve_order`).
pub type ToolArgs = serde_json::Map<String, Value>;

/// A validated, immutable request to perform one concrete local action.
///
/// Constructed only by [`ToolRegistry::validate`]; once built, the call never
/// changes — classification and permission-key derivation can rely on that.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    tool_name: String,
    arguments: ToolArgs,
    call_id: String,
}

impl ToolCall {
    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    pub fn arguments(&self) -> &ToolArgs {
        &self.arguments
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Compact `key=value` rendering of up to `max` arguments, for prompts
    /// and logs.
    pub fn describe_args(&self, max: usize) -> String {
        let mut parts: Vec<String> = self
            .arguments
            .iter()
            .take(max)
            .map(|(k, v)| {
                let s = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let truncated: String = s.chars().take(80).collect();
                format!("{k}={truncated}")
            })
            .collect();
        if self.arguments.len() > max {
            parts.push(format!("(+{} more)", self.arguments.len() - max));
        }
        parts.join(", ")
    }
}

/// The result returned after a tool runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub output: String,
}

/// Trait implemented by every tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;

    /// Deterministic danger classification for a concrete argument set.
    /// Defaults to the tool's static baseline; tools that can become
    /// dangerous depending on their arguments (shell) override this.
    fn classify(&self, _args: &ToolArgs) -> DangerClass {
        self.spec().metadata.base_danger
    }

    /// Resource scope at which an authorization decision for this tool is
    /// cached (a normalized path, a command prefix).  `None` scopes the
    /// decision to the tool as a whole.
    fn permission_scope(&self, _args: &ToolArgs) -> Option<String> {
        None
    }

    async fn run(&self, args: &ToolArgs) -> Result<ToolOutput>;
}

// ── Proposal validation ──────────────────────────────────────────────────────

/// An unvalidated tool call as parsed from model output.
#[derive(Debug, Clone)]
pub struct ToolProposal {
    pub tool_name: String,
    pub arguments: ToolArgs,
    pub call_id: String,
}

/// Why a proposed call was rejected before reaching the policy layer.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("tool '{tool}' missing required param: {param}")]
    MissingParam { tool: String, param: String },
    #[error("tool '{tool}' param '{param}' expected {expected}, got {got}")]
    WrongType {
        tool: String,
        param: String,
        expected: &'static str,
        got: &'static str,
    },
    #[error("tool '{tool}' does not accept param: {param}")]
    UnexpectedParam { tool: String, param: String },
}

fn type_name(param_type: ParamType) -> &'static str {
    match param_type {
        ParamType::String => "string",
        ParamType::Number => "number",
        ParamType::Integer => "integer",
        ParamType::Boolean => "boolean",
        ParamType::Array => "array",
        ParamType::Object => "object",
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn value_matches(param_type: ParamType, value: &Value) -> bool {
    match param_type {
        ParamType::String => value.is_string(),
        ParamType::Number => value.is_number(),
        ParamType::Integer => value.is_i64() || value.is_u64(),
        ParamType::Boolean => value.is_boolean(),
        ParamType::Array => value.is_array(),
        ParamType::Object => value.is_object(),
    }
}

/// Central registry for all available tools.  Registration happens once at
/// startup; the registry is read-only during a run.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn list_specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec()).collect()
    }

    pub fn lookup(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.spec().name == name)
            .map(|t| t.as_ref())
    }

    /// Validate a proposed call against the named tool's declared schema and
    /// mint the immutable [`ToolCall`].  Invalid payloads never reach a tool.
    pub fn validate(&self, proposal: ToolProposal) -> Result<ToolCall, ValidationError> {
        let tool = self
            .lookup(&proposal.tool_name)
            .ok_or_else(|| ValidationError::UnknownTool(proposal.tool_name.clone()))?;
        let spec = tool.spec();

        for param in &spec.params {
            match proposal.arguments.get(&param.name) {
                Some(value) => {
                    if !value_matches(param.param_type, value) {
                        return Err(ValidationError::WrongType {
                            tool: spec.name.clone(),
                            param: param.name.clone(),
                            expected: type_name(param.param_type),
                            got: value_kind(value),
                        });
                    }
                }
                None if param.required => {
                    return Err(ValidationError::MissingParam {
                        tool: spec.name.clone(),
                        param: param.name.clone(),
                    });
                }
                None => {}
            }
        }

        // Closed schema: keys the tool never declared are a protocol error,
        // not something to silently drop.
        for key in proposal.arguments.keys() {
            if !spec.params.iter().any(|p| &p.name == key) {
                return Err(ValidationError::UnexpectedParam {
                    tool: spec.name.clone(),
                    param: key.clone(),
                });
            }
        }

        Ok(ToolCall {
            tool_name: proposal.tool_name,
            arguments: proposal.arguments,
            call_id: proposal.call_id,
        })
    }
}

// ── Built-in tools ───────────────────────────────────────────────────────────

pub mod builtins;
pub use builtins::{
    ListFilesTool, ReadFileTool, SearchFilesTool, ShellExecuteTool, WriteFileTool,
};

// ── ToolRegistry tests ───────────────────────────────────────────────────────
