//! Model provider interface and the Ollama-backed implementation.
//!
//! The execution loop is agnostic to which backend proposes steps: anything
//! implementing [`ModelProvider`] will do.  This crate also owns the text
//! protocol — transcript rendering on the way in, action parsing on the way
//! out — so the parser can be tested as a pure function.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use warden_memory::{AgentStep, Observation};
use warden_tools::{ToolArgs, ToolSpec};

// ── Provider interface ───────────────────────────────────────────────────────

/// An unvalidated action as extracted from model output.  Validation against
/// the tool's declared schema happens in the registry, not here.
#[derive(Debug, Clone)]
pub struct ActionProposal {
    pub tool_name: String,
    pub arguments: ToolArgs,
    pub call_id: String,
    /// Free-form reasoning the model emitted alongside the action.
    pub thought: Option<String>,
}

/// What the model wants to do next.
#[derive(Debug, Clone)]
pub enum ModelTurn {
    /// Task complete; `summary` is the model's final answer.
    Finish { summary: String },
    /// Prose with neither an action nor a finish marker.  The loop appends
    /// it and asks again (the step limit bounds how long that can go on).
    Thought(String),
    /// Exactly one proposed action.
    Action(ActionProposal),
}

/// Uniform "propose next step" interface consumed by the execution loop.
///
/// Implementations must not panic on backend failures — return `Err` and the
/// loop reports it to the model as a failure observation.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn propose(&self, task: &str, steps: &[AgentStep]) -> Result<ModelTurn>;

    fn name(&self) -> &str;
}

// ── Text protocol ────────────────────────────────────────────────────────────

/// Marker the model emits when the task is done.
const FINISH_MARKER: &str = "FINISH";

/// Render the system prompt: available tools plus the action protocol.
pub fn render_system_prompt(agent_name: &str, specs: &[ToolSpec]) -> String {
    let tool_lines: Vec<String> = specs
        .iter()
        .map(|spec| {
            let params: Vec<String> = spec
                .params
                .iter()
                .map(|p| {
                    if p.required {
                        p.name.clone()
                    } else {
                        format!("{}?", p.name)
                    }
                })
                .collect();
            format!(
                "- {}({}): {}",
                spec.name,
                params.join(", "),
                spec.description
            )
        })
        .collect();

    format!(
        r#"You are {agent_name}, an assistant that completes tasks using local tools.

You can use the following tools:
{tools}

To use a tool, output a single JSON object in this format:
{{"tool": "tool_name", "args": {{"param": "value"}}}}

One tool call per reply. Explain your reasoning before the JSON.
When the task is complete, reply with {FINISH_MARKER} followed by a short summary."#,
        tools = tool_lines.join("\n"),
    )
}

/// Render the transcript the way the model sees it.
pub fn render_transcript(task: &str, steps: &[AgentStep]) -> String {
    let mut out = format!("Task: {task}\n");
    for step in steps {
        match step {
            AgentStep::Thought(text) => {
                out.push_str("\nAssistant: ");
                out.push_str(text);
                out.push('\n');
            }
            AgentStep::Action(call) => {
                out.push_str(&format!(
                    "\nAssistant action: {} {}\n",
                    call.tool_name(),
                    serde_json::Value::Object(call.arguments().clone()),
                ));
            }
            AgentStep::Observation(obs) => {
                let rendered = match obs {
                    Observation::Success { payload } => format!("Result: {payload}"),
                    Observation::Failure { kind, message } => {
                        format!("Result (failed, {kind:?}): {message}")
                    }
                };
                out.push('\n');
                out.push_str(&rendered);
                out.push('\n');
            }
        }
    }
    out
}

/// Parse one model reply into a [`ModelTurn`].
///
/// The finish marker wins over an embedded JSON object; a reply with neither
/// is a plain thought.  Malformed JSON that merely *looks* like an action is
/// also a thought — the model gets another turn rather than a hard error.
pub fn parse_model_turn(content: &str) -> ModelTurn {
    let trimmed = content.trim();

    if let Some(rest) = strip_finish_marker(trimmed) {
        return ModelTurn::Finish {
            summary: rest.to_string(),
        };
    }

    if let Some((thought, action)) = extract_action(trimmed) {
        return ModelTurn::Action(ActionProposal {
            tool_name: action.tool,
            arguments: action.args,
            call_id: Uuid::new_v4().to_string(),
            thought,
        });
    }

    ModelTurn::Thought(trimmed.to_string())
}

fn strip_finish_marker(content: &str) -> Option<&str> {
    if let Some(rest) = content.strip_prefix(FINISH_MARKER) {
        return Some(rest.trim_start_matches([':', ' ', '\n']).trim());
    }
    // Models often put the marker last: "All set. FINISH"
    content.strip_suffix(FINISH_MARKER).map(str::trim)
}

#[derive(Debug, Deserialize)]
struct WireAction {
    tool: String,
    #[serde(default)]
    args: ToolArgs,
}

/// Find the first `{"tool": ...}` object in the reply.  Scans balanced-brace
/// candidates so prose containing stray braces before the action doesn't
/// break extraction.
fn extract_action(content: &str) -> Option<(Option<String>, WireAction)> {
    let bytes = content.as_bytes();
    let mut start = None;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' if start.is_some() => in_string = true,
            b'{' => {
                if start.is_none() {
                    start = Some(i);
                }
                depth += 1;
            }
            b'}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        let s = start.take()?;
                        let candidate = &content[s..=i];
                        if let Ok(action) = serde_json::from_str::<WireAction>(candidate) {
                            let thought = content[..s].trim();
                            let thought =
                                (!thought.is_empty()).then(|| thought.to_string());
                            return Some((thought, action));
                        }
                        // Not an action object; keep scanning after it.
                        start = None;
                    }
                }
            }
            _ => {}
        }
    }
    None
}

// ── Ollama provider ──────────────────────────────────────────────────────────

pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    system_prompt: String,
}

impl OllamaProvider {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, system_prompt: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            system_prompt,
        }
    }
}

#[async_trait]
impl ModelProvider for OllamaProvider {
    async fn propose(&self, task: &str, steps: &[AgentStep]) -> Result<ModelTurn> {
        let endpoint = format!("{}/api/generate", self.base_url.trim_end_matches('/'));
        let prompt = render_transcript(task, steps);

        let payload = json!({
            "model": self.model,
            "system": self.system_prompt,
            "prompt": prompt,
            "stream": false
        });

        let response = self.client.post(&endpoint).json(&payload).send().await?;
        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            anyhow::bail!("ollama error ({status}): {body}");
        }

        let content = body
            .get("response")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("ollama response missing text: {body}"))?;

        tracing::debug!(model = %self.model, chars = content.len(), "model reply received");
        Ok(parse_model_turn(content))
    }

    fn name(&self) -> &str {
        "ollama"
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use warden_memory::ErrorKind;
    use warden_tools::{ToolMetadata, ToolParam, ToolSpec};

    // ── parse_model_turn ───────────────────────────────────────────────────

    #[test]
    fn parses_finish_with_summary() {
        match parse_model_turn("FINISH: created the file as requested") {
            ModelTurn::Finish { summary } => {
                assert_eq!(summary, "created the file as requested")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_bare_finish() {
        match parse_model_turn("FINISH") {
            ModelTurn::Finish { summary } => assert!(summary.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_trailing_finish_marker() {
        match parse_model_turn("All three files updated. FINISH") {
            ModelTurn::Finish { summary } => {
                assert_eq!(summary, "All three files updated.")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_action_with_leading_thought() {
        let reply = r#"I should look at the directory first.
{"tool": "list_files", "args": {"path": "."}}"#;
        match parse_model_turn(reply) {
            ModelTurn::Action(action) => {
                assert_eq!(action.tool_name, "list_files");
                assert_eq!(action.arguments["path"], "." );
                assert_eq!(
                    action.thought.as_deref(),
                    Some("I should look at the directory first.")
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_action_without_thought() {
        let reply = r#"{"tool": "read_file", "args": {"path": "Cargo.toml"}}"#;
        match parse_model_turn(reply) {
            ModelTurn::Action(action) => {
                assert_eq!(action.tool_name, "read_file");
                assert!(action.thought.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_args_defaults_to_empty() {
        match parse_model_turn(r#"{"tool": "list_files"}"#) {
            ModelTurn::Action(action) => assert!(action.arguments.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn prose_without_action_is_a_thought() {
        match parse_model_turn("Let me think about this some more.") {
            ModelTurn::Thought(text) => {
                assert_eq!(text, "Let me think about this some more.")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn non_action_json_is_a_thought() {
        match parse_model_turn(r#"{"observation": "interesting"}"#) {
            ModelTurn::Thought(_) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn stray_braces_before_action_are_skipped() {
        let reply = r#"The config uses {} placeholders. {"tool": "read_file", "args": {"path": "x"}}"#;
        match parse_model_turn(reply) {
            ModelTurn::Action(action) => assert_eq!(action.tool_name, "read_file"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn braces_inside_json_strings_do_not_confuse_extraction() {
        let reply = r#"{"tool": "write_file", "args": {"path": "a.rs", "content": "fn main() {}"}}"#;
        match parse_model_turn(reply) {
            ModelTurn::Action(action) => {
                assert_eq!(action.arguments["content"], "fn main() {}")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn each_action_gets_a_fresh_call_id() {
        let reply = r#"{"tool": "list_files", "args": {}}"#;
        let (a, b) = (parse_model_turn(reply), parse_model_turn(reply));
        match (a, b) {
            (ModelTurn::Action(a), ModelTurn::Action(b)) => {
                assert_ne!(a.call_id, b.call_id)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    // ── rendering ──────────────────────────────────────────────────────────

    #[test]
    fn system_prompt_lists_tools_and_protocol() {
        let specs = vec![ToolSpec {
            name: "read_file".into(),
            description: "Read a file".into(),
            params: vec![
                ToolParam::required("path", "the path"),
                ToolParam::optional("max_bytes", "cap"),
            ],
            metadata: ToolMetadata::default(),
        }];
        let prompt = render_system_prompt("Warden", &specs);
        assert!(prompt.contains("read_file(path, max_bytes?)"));
        assert!(prompt.contains("\"tool\""));
        assert!(prompt.contains("FINISH"));
    }

    #[test]
    fn transcript_renders_failures_with_kind() {
        let steps = vec![
            AgentStep::Thought("checking".into()),
            AgentStep::Observation(Observation::failure(
                ErrorKind::ToolExecution,
                "timed out",
            )),
        ];
        let rendered = render_transcript("do things", &steps);
        assert!(rendered.starts_with("Task: do things"));
        assert!(rendered.contains("checking"));
        assert!(rendered.contains("failed"));
        assert!(rendered.contains("timed out"));
    }
}
