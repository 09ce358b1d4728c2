use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub name: String,
    /// Root directory tools are confined to.  Relative paths in tool
    /// arguments resolve against this.
    pub workspace_path: String,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            name: "Warden".to_string(),
            workspace_path: ".".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub provider: String,
    pub model: String,
    /// Base URL for the Ollama API.  Overridden at runtime by the
    /// `OLLAMA_BASE_URL` environment variable when set.
    pub base_url: String,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            model: "llama3.1:8b".to_string(),
            base_url: "http://localhost:11434".to_string(),
        }
    }
}

// ── Safety config ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetySection {
    /// Hard ceiling on loop iterations.  Exceeding it aborts the run — this
    /// is the backstop against a model that never emits a finish signal.
    pub max_steps: usize,
    /// Default per-invocation tool timeout in seconds.  Individual tools can
    /// be overridden in `[tools] timeout_overrides`.
    pub tool_timeout_secs: u64,
    /// Transcript bound: oldest steps are summarized away past this many
    /// entries.
    pub context_max_entries: usize,
}

impl Default for SafetySection {
    fn default() -> Self {
        Self {
            max_steps: 25,
            tool_timeout_secs: 30,
            context_max_entries: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ToolsSection {
    /// Per-tool timeout overrides in seconds, keyed by tool name.
    pub timeout_overrides: HashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PermissionsSection {
    /// Override for the permission store location.  Empty means the default
    /// per-user path (`~/.warden/permissions.toml`).  The
    /// `WARDEN_PERMISSIONS_PATH` environment variable takes precedence over
    /// both.
    pub store_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySection {
    pub log_level: String,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentSection,
    pub llm: LlmSection,
    pub safety: SafetySection,
    pub tools: ToolsSection,
    pub permissions: PermissionsSection,
    pub telemetry: TelemetrySection,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(url) = env::var("OLLAMA_BASE_URL") {
            if !url.is_empty() {
                config.llm.base_url = url;
            }
        }

        if let Ok(path) = env::var("WARDEN_PERMISSIONS_PATH") {
            if !path.is_empty() {
                config.permissions.store_path = path;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Effective timeout for a named tool: the per-tool override when one is
    /// configured, otherwise the global default.
    pub fn tool_timeout_secs(&self, tool_name: &str) -> u64 {
        self.tools
            .timeout_overrides
            .get(tool_name)
            .copied()
            .unwrap_or(self.safety.tool_timeout_secs)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
