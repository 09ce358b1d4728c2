//! File system tools: read, write, and list files.

use std::path::{Component, Path, PathBuf};

use anyhow::{Result, bail};
use async_trait::async_trait;
use globset::GlobBuilder;
use walkdir::WalkDir;

use crate::{
    DangerClass, Tool, ToolArgs, ToolMetadata, ToolOutput, ToolParam, ToolSpec,
};

/// Find the largest byte offset ≤ `max` that falls on a UTF-8 character
/// boundary.  Safe to use as `&s[..truncate_byte_boundary(s, max)]`.
pub(super) fn truncate_byte_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

/// Lexically resolve `.` and `..` in a path *without* hitting the filesystem.
///
/// Essential for write-path validation: `canonicalize()` fails when the file
/// (or its parent directories) don't exist yet, but we still need to verify
/// that the normalized path stays inside the workspace.  Also the basis of
/// permission-key scopes: two spellings of the same path must derive the same
/// scope.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

/// Verify that `rel_path` (relative to `root`) does not escape the workspace.
///
/// Returns the full normalized path on success.
fn checked_path(root: &Path, rel_path: &str) -> Result<PathBuf> {
    let full = root.join(rel_path);
    let normalized = normalize_path(&full);
    let root_normalized = normalize_path(root);
    if !normalized.starts_with(&root_normalized) {
        bail!("path escapes workspace boundary: {}", normalized.display());
    }
    Ok(normalized)
}

/// Permission scope for a path argument: the normalized relative path.
fn path_scope(args: &ToolArgs, key: &str) -> Option<String> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(|p| normalize_path(Path::new(p)).to_string_lossy().to_string())
}

pub struct ReadFileTool {
    pub workspace_root: PathBuf,
}

#[async_trait]
impl Tool for ReadFileTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "read_file".to_string(),
            description: "Read the contents of a file within the workspace.".to_string(),
            params: vec![
                ToolParam::required("path", "Relative path from workspace root"),
                ToolParam::optional("max_bytes", "Maximum bytes to read (default: 65536)")
                    .typed(crate::ParamType::Integer),
            ],
            metadata: ToolMetadata {
                base_danger: DangerClass::Safe,
                read_only: true,
                group: "filesystem".to_string(),
            },
        }
    }

    fn permission_scope(&self, args: &ToolArgs) -> Option<String> {
        path_scope(args, "path")
    }

    async fn run(&self, args: &ToolArgs) -> Result<ToolOutput> {
        let rel_path = args
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required param: path"))?;

        let full = checked_path(&self.workspace_root, rel_path)?;

        let max_bytes: usize = args
            .get("max_bytes")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(65536);

        let content = std::fs::read_to_string(&full)?;
        let truncated = if content.len() > max_bytes {
            let end = truncate_byte_boundary(&content, max_bytes);
            format!("{}…[truncated at {} bytes]", &content[..end], max_bytes)
        } else {
            content
        };

        Ok(ToolOutput {
            success: true,
            output: truncated,
        })
    }
}

pub struct WriteFileTool {
    pub workspace_root: PathBuf,
}

#[async_trait]
impl Tool for WriteFileTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "write_file".to_string(),
            description: "Write content to a file within the workspace (creates or overwrites)."
                .to_string(),
            params: vec![
                ToolParam::required("path", "Relative path from workspace root"),
                ToolParam::required("content", "File content to write"),
            ],
            metadata: ToolMetadata {
                base_danger: DangerClass::Sensitive,
                read_only: false,
                group: "filesystem".to_string(),
            },
        }
    }

    fn permission_scope(&self, args: &ToolArgs) -> Option<String> {
        path_scope(args, "path")
    }

    async fn run(&self, args: &ToolArgs) -> Result<ToolOutput> {
        let rel_path = args
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required param: path"))?;
        let content = args
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required param: content"))?;

        let full = checked_path(&self.workspace_root, rel_path)?;

        // Ensure parent directories exist.
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(&full, content)?;
        Ok(ToolOutput {
            success: true,
            output: format!("wrote {} bytes to {}", content.len(), rel_path),
        })
    }
}

pub struct ListFilesTool {
    pub workspace_root: PathBuf,
}

#[async_trait]
impl Tool for ListFilesTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "list_files".to_string(),
            description: "List files under a directory within the workspace.".to_string(),
            params: vec![
                ToolParam::optional("path", "Relative directory to list (default: workspace root)"),
                ToolParam::optional("glob", "Only list entries matching this glob (e.g. *.rs)"),
                ToolParam::optional("max_entries", "Maximum entries to return (default: 200)")
                    .typed(crate::ParamType::Integer),
            ],
            metadata: ToolMetadata {
                base_danger: DangerClass::Safe,
                read_only: true,
                group: "filesystem".to_string(),
            },
        }
    }

    fn permission_scope(&self, args: &ToolArgs) -> Option<String> {
        Some(
            path_scope(args, "path").unwrap_or_else(|| ".".to_string()),
        )
    }

    async fn run(&self, args: &ToolArgs) -> Result<ToolOutput> {
        let rel_path = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let max_entries: usize = args
            .get("max_entries")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(200);
        let matcher = args
            .get("glob")
            .and_then(|v| v.as_str())
            .map(|g| {
                GlobBuilder::new(g)
                    .literal_separator(false)
                    .build()
                    .map(|g| g.compile_matcher())
            })
            .transpose()
            .map_err(|e| anyhow::anyhow!("invalid glob: {e}"))?;

        let full = checked_path(&self.workspace_root, rel_path)?;

        let mut lines = Vec::new();
        let mut total = 0usize;
        for entry in WalkDir::new(&full)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| {
                !e.file_name()
                    .to_str()
                    .map(|n| n.starts_with('.'))
                    .unwrap_or(false)
            })
        {
            let entry = entry?;
            let rel = entry.path().strip_prefix(&full).unwrap_or(entry.path());
            if let Some(matcher) = &matcher {
                if !matcher.is_match(rel) {
                    continue;
                }
            }
            total += 1;
            if lines.len() < max_entries {
                let marker = if entry.file_type().is_dir() { "/" } else { "" };
                lines.push(format!("{}{marker}", rel.display()));
            }
        }

        if total > max_entries {
            lines.push(format!("…({} more entries)", total - max_entries));
        }

        Ok(ToolOutput {
            success: true,
            output: lines.join("\n"),
        })
    }
}
