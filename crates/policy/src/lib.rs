//! Permission policy engine: decides, records, and replays authorization
//! decisions for proposed tool calls.
//!
//! The engine owns the one piece of process-wide mutable state — the durable
//! [`PermissionStore`] — behind a mutex.  Components receive a handle
//! explicitly; there is no ambient singleton.

pub mod store;

use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use warden_tools::{DangerClass, ToolCall, ToolRegistry};

pub use store::{PermissionRecord, PermissionStore, default_store_path};

// ── Keys and decisions ───────────────────────────────────────────────────────

/// The scope at which an authorization decision is cached.
///
/// Two calls deriving the same key must receive the same stored decision.
/// Derivation is deterministic: the tool name plus the tool's own notion of
/// resource scope (a normalized path, a command's leading token).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermissionKey {
    pub tool: String,
    pub scope: Option<String>,
}

impl PermissionKey {
    pub fn derive(registry: &ToolRegistry, call: &ToolCall) -> Self {
        let scope = registry
            .lookup(call.tool_name())
            .and_then(|tool| tool.permission_scope(call.arguments()));
        Self {
            tool: call.tool_name().to_string(),
            scope,
        }
    }
}

impl std::fmt::Display for PermissionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}({})", self.tool, scope),
            None => write!(f, "{}", self.tool),
        }
    }
}

/// The four answers a user can give to a permission prompt.
/// Only the Always variants are durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    AllowOnce,
    AllowAlways,
    DenyOnce,
    DenyAlways,
}

impl PermissionDecision {
    pub fn allows(self) -> bool {
        matches!(self, Self::AllowOnce | Self::AllowAlways)
    }

    fn durable(self) -> Option<DurableDecision> {
        match self {
            Self::AllowAlways => Some(DurableDecision::AllowAlways),
            Self::DenyAlways => Some(DurableDecision::DenyAlways),
            Self::AllowOnce | Self::DenyOnce => None,
        }
    }
}

/// The subset of decisions that may be persisted.  Separate type so the
/// store cannot hold a once-only answer by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurableDecision {
    AllowAlways,
    DenyAlways,
}

/// Outcome of consulting the policy for one proposed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
    /// The caller must present the four-way prompt and feed the answer back
    /// through [`PolicyEngine::resolve`].
    Ask { prompt: String },
}

// ── Engine ───────────────────────────────────────────────────────────────────

pub struct PolicyEngine {
    store: Mutex<PermissionStore>,
}

impl PolicyEngine {
    pub fn new(store: PermissionStore) -> Self {
        Self {
            store: Mutex::new(store),
        }
    }

    // A poisoned mutex only means another thread panicked mid-operation; the
    // store itself is a plain Vec + map and stays coherent, so recover it.
    fn store(&self) -> std::sync::MutexGuard<'_, PermissionStore> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Decide whether a validated call may run.
    ///
    /// Destructive calls always come back [`Verdict::Ask`] — a stored
    /// AllowAlways grant never silently authorizes a destructively classified
    /// call.  That is a hard invariant, not a UX default.
    pub fn decide(&self, registry: &ToolRegistry, call: &ToolCall) -> Verdict {
        let Some(tool) = registry.lookup(call.tool_name()) else {
            // Calls reach the engine only after schema validation, so the
            // tool must exist; refuse outright if that ever stops holding.
            tracing::warn!(tool = call.tool_name(), "decide() on unregistered tool");
            return Verdict::Deny;
        };

        let class = tool.classify(call.arguments());
        let key = PermissionKey::derive(registry, call);

        if class == DangerClass::Destructive {
            tracing::info!(key = %key, "destructive call — stored grants bypassed, asking");
            return Verdict::Ask {
                prompt: render_prompt(class, &key, call),
            };
        }

        let stored = self.store().lookup(&key);
        match stored {
            Some(DurableDecision::DenyAlways) => {
                tracing::info!(key = %key, "denied by stored policy");
                Verdict::Deny
            }
            Some(DurableDecision::AllowAlways) => {
                tracing::debug!(key = %key, "allowed by stored policy");
                Verdict::Allow
            }
            None => Verdict::Ask {
                prompt: render_prompt(class, &key, call),
            },
        }
    }

    /// Record the user's answer to an Ask.
    ///
    /// Always-scoped answers are persisted synchronously — the write completes
    /// (or its error surfaces to the caller) before the loop proceeds.
    /// Once-scoped answers leave the store untouched, so resolving the same
    /// call twice with a once answer never mutates durable state.
    pub fn resolve(&self, key: &PermissionKey, decision: PermissionDecision) -> Result<()> {
        let Some(durable) = decision.durable() else {
            return Ok(());
        };

        let mut store = self.store();
        store.upsert(PermissionRecord {
            key: key.clone(),
            decision: durable,
            created_at: Utc::now(),
        });
        store
            .flush()
            .with_context(|| format!("persist permission decision for {key}"))?;
        tracing::info!(key = %key, ?durable, "persisted permission decision");
        Ok(())
    }

    /// All persisted records, for `permissions list`.
    pub fn list_records(&self) -> Vec<PermissionRecord> {
        self.store().records().to_vec()
    }

    /// Drop the record for `key` and flush.  Returns whether one existed.
    pub fn reset(&self, key: &PermissionKey) -> Result<bool> {
        let mut store = self.store();
        let existed = store.reset(key);
        if existed {
            store.flush().context("persist permission reset")?;
        }
        Ok(existed)
    }

    /// Drop every record and flush.  Returns how many were removed.
    pub fn reset_all(&self) -> Result<usize> {
        let mut store = self.store();
        let n = store.reset_all();
        store.flush().context("persist permission reset")?;
        Ok(n)
    }
}

/// Risk summary shown in the permission prompt.
fn render_prompt(class: DangerClass, key: &PermissionKey, call: &ToolCall) -> String {
    let tag = match class {
        DangerClass::Safe => "SAFE",
        DangerClass::Sensitive => "SENSITIVE",
        DangerClass::Destructive => "DESTRUCTIVE",
    };
    let args = call.describe_args(2);
    if args.is_empty() {
        format!("[{tag}] {key}")
    } else {
        format!("[{tag}] {key}: {args}")
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result as AnyResult;
    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::TempDir;
    use warden_tools::{
        Tool, ToolArgs, ToolMetadata, ToolOutput, ToolParam, ToolProposal, ToolSpec,
    };

    /// A safe tool scoped by its `path` argument.
    struct ListTool;

    #[async_trait]
    impl Tool for ListTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "list_files".into(),
                description: "list".into(),
                params: vec![ToolParam::optional("path", "dir")],
                metadata: ToolMetadata {
                    base_danger: DangerClass::Safe,
                    read_only: true,
                    group: "filesystem".into(),
                },
            }
        }
        fn permission_scope(&self, args: &ToolArgs) -> Option<String> {
            args.get("path").and_then(|v| v.as_str()).map(str::to_string)
        }
        async fn run(&self, _args: &ToolArgs) -> AnyResult<ToolOutput> {
            Ok(ToolOutput {
                success: true,
                output: "ok".into(),
            })
        }
    }

    /// A shell-like tool whose classification depends on its command.
    struct ShellTool;

    #[async_trait]
    impl Tool for ShellTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "shell_execute".into(),
                description: "shell".into(),
                params: vec![ToolParam::required("cmd", "command")],
                metadata: ToolMetadata {
                    base_danger: DangerClass::Sensitive,
                    read_only: false,
                    group: "shell".into(),
                },
            }
        }
        fn classify(&self, args: &ToolArgs) -> DangerClass {
            let cmd = args.get("cmd").and_then(|v| v.as_str()).unwrap_or("");
            if cmd.contains("rm -rf") {
                DangerClass::Destructive
            } else {
                DangerClass::Sensitive
            }
        }
        fn permission_scope(&self, args: &ToolArgs) -> Option<String> {
            args.get("cmd")
                .and_then(|v| v.as_str())
                .and_then(|c| c.split_whitespace().next())
                .map(str::to_string)
        }
        async fn run(&self, _args: &ToolArgs) -> AnyResult<ToolOutput> {
            Ok(ToolOutput {
                success: true,
                output: "ran".into(),
            })
        }
    }

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::default();
        reg.register(Box::new(ListTool));
        reg.register(Box::new(ShellTool));
        reg
    }

    fn call(reg: &ToolRegistry, tool: &str, pairs: &[(&str, serde_json::Value)]) -> ToolCall {
        reg.validate(ToolProposal {
            tool_name: tool.into(),
            arguments: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            call_id: "c-1".into(),
        })
        .unwrap()
    }

    fn engine(dir: &TempDir) -> PolicyEngine {
        PolicyEngine::new(PermissionStore::open(dir.path().join("permissions.toml")))
    }

    // ── Scenario A: fresh store, safe call ─────────────────────────────────

    #[test]
    fn fresh_store_asks_then_allow_always_sticks() {
        let dir = TempDir::new().unwrap();
        let reg = registry();
        let eng = engine(&dir);
        let c = call(&reg, "list_files", &[("path", json!("."))]);

        let Verdict::Ask { .. } = eng.decide(&reg, &c) else {
            panic!("fresh store must ask");
        };

        let key = PermissionKey::derive(&reg, &c);
        eng.resolve(&key, PermissionDecision::AllowAlways).unwrap();

        // Second identical call in the same run: no prompt.
        let again = call(&reg, "list_files", &[("path", json!("."))]);
        assert_eq!(eng.decide(&reg, &again), Verdict::Allow);
    }

    // ── Scenario B: destructive override ───────────────────────────────────

    #[test]
    fn destructive_always_asks_despite_allow_always() {
        let dir = TempDir::new().unwrap();
        let reg = registry();
        let eng = engine(&dir);

        let destructive = call(&reg, "shell_execute", &[("cmd", json!("rm -rf /"))]);
        let key = PermissionKey::derive(&reg, &destructive);
        eng.resolve(&key, PermissionDecision::AllowAlways).unwrap();

        match eng.decide(&reg, &destructive) {
            Verdict::Ask { prompt } => assert!(prompt.contains("DESTRUCTIVE")),
            other => panic!("destructive call must ask, got {other:?}"),
        }
    }

    #[test]
    fn sensitive_call_with_grant_is_allowed() {
        let dir = TempDir::new().unwrap();
        let reg = registry();
        let eng = engine(&dir);

        let benign = call(&reg, "shell_execute", &[("cmd", json!("git status"))]);
        let key = PermissionKey::derive(&reg, &benign);
        eng.resolve(&key, PermissionDecision::AllowAlways).unwrap();

        assert_eq!(eng.decide(&reg, &benign), Verdict::Allow);
    }

    // ── deny records ───────────────────────────────────────────────────────

    #[test]
    fn deny_always_denies_without_prompt() {
        let dir = TempDir::new().unwrap();
        let reg = registry();
        let eng = engine(&dir);

        let c = call(&reg, "list_files", &[("path", json!("secrets"))]);
        let key = PermissionKey::derive(&reg, &c);
        eng.resolve(&key, PermissionDecision::DenyAlways).unwrap();

        assert_eq!(eng.decide(&reg, &c), Verdict::Deny);
    }

    // ── durability ─────────────────────────────────────────────────────────

    #[test]
    fn allow_always_survives_reload() {
        let dir = TempDir::new().unwrap();
        let reg = registry();
        let path = dir.path().join("permissions.toml");

        {
            let eng = PolicyEngine::new(PermissionStore::open(&path));
            let c = call(&reg, "list_files", &[("path", json!("src"))]);
            let key = PermissionKey::derive(&reg, &c);
            eng.resolve(&key, PermissionDecision::AllowAlways).unwrap();
        }

        let eng = PolicyEngine::new(PermissionStore::open(&path));
        let c = call(&reg, "list_files", &[("path", json!("src"))]);
        assert_eq!(eng.decide(&reg, &c), Verdict::Allow);
    }

    #[test]
    fn once_decisions_never_touch_the_store() {
        let dir = TempDir::new().unwrap();
        let reg = registry();
        let eng = engine(&dir);

        let c = call(&reg, "list_files", &[("path", json!("."))]);
        let key = PermissionKey::derive(&reg, &c);
        eng.resolve(&key, PermissionDecision::AllowOnce).unwrap();
        eng.resolve(&key, PermissionDecision::AllowOnce).unwrap();
        eng.resolve(&key, PermissionDecision::DenyOnce).unwrap();

        assert!(eng.list_records().is_empty(), "once answers must not persist");
        assert!(matches!(eng.decide(&reg, &c), Verdict::Ask { .. }));
    }

    // ── key derivation ─────────────────────────────────────────────────────

    #[test]
    fn identical_calls_derive_identical_keys() {
        let reg = registry();
        let a = call(&reg, "shell_execute", &[("cmd", json!("git status"))]);
        let b = call(&reg, "shell_execute", &[("cmd", json!("git status"))]);
        assert_eq!(
            PermissionKey::derive(&reg, &a),
            PermissionKey::derive(&reg, &b)
        );
    }

    #[test]
    fn scope_separates_decisions() {
        let dir = TempDir::new().unwrap();
        let reg = registry();
        let eng = engine(&dir);

        let git = call(&reg, "shell_execute", &[("cmd", json!("git status"))]);
        let key = PermissionKey::derive(&reg, &git);
        eng.resolve(&key, PermissionDecision::AllowAlways).unwrap();

        // Different leading token, different scope: still asks.
        let cargo = call(&reg, "shell_execute", &[("cmd", json!("cargo build"))]);
        assert!(matches!(eng.decide(&reg, &cargo), Verdict::Ask { .. }));
    }

    #[test]
    fn key_display_includes_scope() {
        let key = PermissionKey {
            tool: "read_file".into(),
            scope: Some("src/lib.rs".into()),
        };
        assert_eq!(key.to_string(), "read_file(src/lib.rs)");
        let bare = PermissionKey {
            tool: "read_file".into(),
            scope: None,
        };
        assert_eq!(bare.to_string(), "read_file");
    }

    // ── prompt rendering ───────────────────────────────────────────────────

    #[test]
    fn prompt_names_tool_and_danger() {
        let dir = TempDir::new().unwrap();
        let reg = registry();
        let eng = engine(&dir);
        let c = call(&reg, "shell_execute", &[("cmd", json!("git status"))]);
        match eng.decide(&reg, &c) {
            Verdict::Ask { prompt } => {
                assert!(prompt.contains("SENSITIVE"));
                assert!(prompt.contains("shell_execute"));
                assert!(prompt.contains("git status"));
            }
            other => panic!("expected ask, got {other:?}"),
        }
    }

    // ── reset (operator-facing) ────────────────────────────────────────────

    #[test]
    fn reset_reopens_the_question() {
        let dir = TempDir::new().unwrap();
        let reg = registry();
        let eng = engine(&dir);

        let c = call(&reg, "list_files", &[("path", json!("."))]);
        let key = PermissionKey::derive(&reg, &c);
        eng.resolve(&key, PermissionDecision::DenyAlways).unwrap();
        assert_eq!(eng.decide(&reg, &c), Verdict::Deny);

        assert!(eng.reset(&key).unwrap());
        assert!(matches!(eng.decide(&reg, &c), Verdict::Ask { .. }));
    }

    #[test]
    fn reset_all_reports_count() {
        let dir = TempDir::new().unwrap();
        let reg = registry();
        let eng = engine(&dir);

        for path in ["a", "b"] {
            let c = call(&reg, "list_files", &[("path", json!(path))]);
            let key = PermissionKey::derive(&reg, &c);
            eng.resolve(&key, PermissionDecision::AllowAlways).unwrap();
        }
        assert_eq!(eng.reset_all().unwrap(), 2);
        assert!(eng.list_records().is_empty());
    }
}
