//! Shell execution tool and the destructive-command classifier.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::Result;
use async_trait::async_trait;

use crate::{
    DangerClass, Tool, ToolArgs, ToolMetadata, ToolOutput, ToolParam, ToolSpec,
};

use super::fs::truncate_byte_boundary;

/// Substrings that mark a shell command as irreversible.  Matching is plain
/// substring search over the whitespace-collapsed command, so argument
/// reordering or extra spaces don't dodge the classifier.
const DESTRUCTIVE_PATTERNS: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "rm -r ",
    "rm --recursive",
    "mkfs",
    "dd of=/dev/",
    "> /dev/sd",
    ":(){",
    "shutdown",
    "reboot",
    "halt -f",
    "git push --force",
    "git push -f",
    "git reset --hard",
    "git clean -fd",
    "chmod -r 777",
    "chown -r ",
    "truncate -s 0",
    "| sh",
    "| bash",
];

/// Deterministic danger classification for a shell command.
///
/// A pure function of the command string: the same command always classifies
/// the same way.  Anything not matching the destructive table is `Sensitive`
/// (a shell can always write).
pub fn classify_command(command: &str) -> DangerClass {
    let collapsed = command
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    for pattern in DESTRUCTIVE_PATTERNS {
        if collapsed.contains(pattern) {
            return DangerClass::Destructive;
        }
    }
    DangerClass::Sensitive
}

/// Permission scope for a command: its first token (the program being run).
/// `git status` and `git diff` share one decision; `cargo build` gets its own.
pub fn command_scope(command: &str) -> Option<String> {
    command.split_whitespace().next().map(str::to_string)
}

pub struct ShellExecuteTool {
    pub workspace_root: PathBuf,
}

#[async_trait]
impl Tool for ShellExecuteTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "shell_execute".to_string(),
            description: "Execute a shell command within the workspace directory. \
                Each invocation runs in a fresh shell — `cd` does not persist \
                between calls. Chain commands with `&&` if you need them to \
                share working directory or state."
                .to_string(),
            params: vec![
                ToolParam::required("command", "Shell command to execute"),
            ],
            metadata: ToolMetadata {
                base_danger: DangerClass::Sensitive,
                read_only: false,
                group: "shell".to_string(),
            },
        }
    }

    fn classify(&self, args: &ToolArgs) -> DangerClass {
        args.get("command")
            .and_then(|v| v.as_str())
            .map(classify_command)
            .unwrap_or(DangerClass::Sensitive)
    }

    fn permission_scope(&self, args: &ToolArgs) -> Option<String> {
        args.get("command")
            .and_then(|v| v.as_str())
            .and_then(command_scope)
    }

    async fn run(&self, args: &ToolArgs) -> Result<ToolOutput> {
        let command = args
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required param: command"))?;

        // kill_on_drop: when the runner's deadline expires (or the user
        // interrupts), dropping this future must actually terminate the child
        // rather than leak it.
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.workspace_root)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = if stderr.is_empty() {
            stdout.to_string()
        } else {
            format!("{stdout}\n[stderr] {stderr}")
        };

        // Truncate output to prevent context explosion
        let max_output = 32768;
        let result = if combined.len() > max_output {
            let end = truncate_byte_boundary(&combined, max_output);
            format!("{}…[truncated at {} bytes]", &combined[..end], max_output)
        } else {
            combined
        };

        Ok(ToolOutput {
            success: output.status.success(),
            output: result,
        })
    }
}
