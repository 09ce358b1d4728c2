//! Built-in tool implementations.

mod fs;
mod search;
mod shell;

pub use fs::{ListFilesTool, ReadFileTool, WriteFileTool};
pub use search::SearchFilesTool;
pub use shell::ShellExecuteTool;

use std::path::PathBuf;

use crate::ToolRegistry;

/// Build the standard registry of built-in tools rooted at `workspace_root`.
pub fn default_registry(workspace_root: PathBuf) -> ToolRegistry {
    let mut registry = ToolRegistry::default();
    registry.register(Box::new(ReadFileTool {
        workspace_root: workspace_root.clone(),
    }));
    registry.register(Box::new(WriteFileTool {
        workspace_root: workspace_root.clone(),
    }));
    registry.register(Box::new(ListFilesTool {
        workspace_root: workspace_root.clone(),
    }));
    registry.register(Box::new(SearchFilesTool {
        workspace_root: workspace_root.clone(),
    }));
    registry.register(Box::new(ShellExecuteTool { workspace_root }));
    registry
}
