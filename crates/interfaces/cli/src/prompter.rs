//! Terminal rendering of permission prompts.

use std::io::{self, Write};

use async_trait::async_trait;

use warden_agent::PermissionPrompt;
use warden_policy::PermissionDecision;

/// Human-in-the-loop gate for tool authorization.
///
/// Presents the risk summary and the four standard answers.  Anything
/// unrecognized (including EOF on a closed stdin) counts as deny-once — the
/// prompt never fails open.
pub struct TerminalPrompter;

#[async_trait]
impl PermissionPrompt for TerminalPrompter {
    async fn present(
        &self,
        prompt: &str,
        _options: &[PermissionDecision],
    ) -> PermissionDecision {
        let prompt = prompt.to_string();
        tokio::task::spawn_blocking(move || ask(&prompt))
            .await
            .unwrap_or(PermissionDecision::DenyOnce)
    }
}

fn ask(prompt: &str) -> PermissionDecision {
    println!("\n─── Permission required ────────────────────────────");
    println!("  {prompt}");
    println!("────────────────────────────────────────────────────");
    print!("  [y] allow once  [a] allow always  [n] deny once  [d] deny always: ");
    let _ = io::stdout().flush();

    let mut input = String::new();
    if io::stdin().read_line(&mut input).is_err() {
        return PermissionDecision::DenyOnce;
    }

    match input.trim().to_lowercase().as_str() {
        "y" | "yes" => PermissionDecision::AllowOnce,
        "a" | "always" => PermissionDecision::AllowAlways,
        "d" | "never" => PermissionDecision::DenyAlways,
        _ => PermissionDecision::DenyOnce,
    }
}
