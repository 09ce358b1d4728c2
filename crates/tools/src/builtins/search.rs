//! Content search over non-ignored workspace files.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use async_trait::async_trait;
use ignore::WalkBuilder;
use regex::Regex;

use crate::{
    DangerClass, Tool, ToolArgs, ToolMetadata, ToolOutput, ToolParam, ToolSpec,
};

use super::fs::normalize_path;

pub struct SearchFilesTool {
    pub workspace_root: PathBuf,
}

#[async_trait]
impl Tool for SearchFilesTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "search_files".to_string(),
            description: "Search file contents with a regular expression. Respects \
                .gitignore and skips binary files."
                .to_string(),
            params: vec![
                ToolParam::required("pattern", "Regular expression to search for"),
                ToolParam::optional("path", "Relative directory to search (default: workspace root)"),
                ToolParam::optional("max_matches", "Maximum matching lines to return (default: 100)")
                    .typed(crate::ParamType::Integer),
            ],
            metadata: ToolMetadata {
                base_danger: DangerClass::Safe,
                read_only: true,
                group: "search".to_string(),
            },
        }
    }

    fn permission_scope(&self, args: &ToolArgs) -> Option<String> {
        let scope = args
            .get("path")
            .and_then(|v| v.as_str())
            .map(|p| normalize_path(Path::new(p)).to_string_lossy().to_string())
            .unwrap_or_else(|| ".".to_string());
        Some(scope)
    }

    async fn run(&self, args: &ToolArgs) -> Result<ToolOutput> {
        let pattern = args
            .get("pattern")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required param: pattern"))?;
        let rel_path = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let max_matches: usize = args
            .get("max_matches")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(100);

        let regex = Regex::new(pattern)
            .map_err(|e| anyhow::anyhow!("invalid search pattern: {e}"))?;

        let root = normalize_path(&self.workspace_root.join(rel_path));
        if !root.starts_with(normalize_path(&self.workspace_root)) {
            bail!("path escapes workspace boundary: {}", root.display());
        }

        let mut matches = Vec::new();
        let mut truncated = false;

        'files: for entry in WalkBuilder::new(&root).hidden(true).build() {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            // Skip files that aren't valid UTF-8 (binary).
            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            let display = entry
                .path()
                .strip_prefix(&root)
                .unwrap_or(entry.path())
                .display()
                .to_string();
            for (idx, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    if matches.len() >= max_matches {
                        truncated = true;
                        break 'files;
                    }
                    matches.push(format!("{display}:{}: {}", idx + 1, line.trim_end()));
                }
            }
        }

        let mut output = matches.join("\n");
        if truncated {
            output.push_str(&format!("\n…(stopped at {max_matches} matches)"));
        }
        if output.is_empty() {
            output = format!("no matches for /{pattern}/");
        }

        Ok(ToolOutput {
            success: true,
            output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn args(pairs: &[(&str, serde_json::Value)]) -> ToolArgs {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn finds_matching_lines_with_location() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha\nneedle here\nomega").unwrap();
        let tool = SearchFilesTool {
            workspace_root: dir.path().to_path_buf(),
        };
        let out = tool
            .run(&args(&[("pattern", json!("needle"))]))
            .await
            .unwrap();
        assert!(out.success);
        assert!(out.output.contains("a.txt:2: needle here"));
    }

    #[tokio::test]
    async fn reports_no_matches() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "nothing to see").unwrap();
        let tool = SearchFilesTool {
            workspace_root: dir.path().to_path_buf(),
        };
        let out = tool
            .run(&args(&[("pattern", json!("unfindable"))]))
            .await
            .unwrap();
        assert!(out.output.contains("no matches"));
    }

    #[tokio::test]
    async fn invalid_pattern_is_an_error() {
        let dir = TempDir::new().unwrap();
        let tool = SearchFilesTool {
            workspace_root: dir.path().to_path_buf(),
        };
        let result = tool.run(&args(&[("pattern", json!("([unclosed"))])).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn honors_max_matches() {
        let dir = TempDir::new().unwrap();
        let many = (0..20).map(|i| format!("hit {i}")).collect::<Vec<_>>().join("\n");
        std::fs::write(dir.path().join("many.txt"), many).unwrap();
        let tool = SearchFilesTool {
            workspace_root: dir.path().to_path_buf(),
        };
        let out = tool
            .run(&args(&[
                ("pattern", json!("hit")),
                ("max_matches", json!(5)),
            ]))
            .await
            .unwrap();
        assert_eq!(out.output.matches("hit").count(), 5);
        assert!(out.output.contains("stopped at 5 matches"));
    }

    #[test]
    fn scope_defaults_to_dot() {
        let tool = SearchFilesTool {
            workspace_root: PathBuf::from("/ws"),
        };
        assert_eq!(tool.permission_scope(&ToolArgs::new()).as_deref(), Some("."));
        assert_eq!(
            tool.permission_scope(&args(&[("path", json!("src/./core"))]))
                .as_deref(),
            Some("src/core")
        );
    }
}
