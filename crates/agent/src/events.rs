//! Loop lifecycle events for UI display.

use serde::{Deserialize, Serialize};

use warden_policy::PermissionDecision;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LoopEvent {
    Thought(String),
    ActionProposed { tool: String, args: String },
    PermissionRequested { prompt: String },
    PermissionResolved { decision: PermissionDecision },
    ActionDenied { tool: String, by_policy: bool },
    ToolStart { tool: String },
    ToolEnd { tool: String, success: bool, output: String },
    Warning(String),
}
