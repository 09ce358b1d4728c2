mod exit_codes;
mod prompter;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use warden_agent::{
    AbortReason, AgentLoop, LoopEvent, LoopOutcome, ToolRunner,
};
use warden_config::AppConfig;
use warden_llm::{OllamaProvider, render_system_prompt};
use warden_memory::Observation;
use warden_policy::{PermissionKey, PermissionStore, PolicyEngine, default_store_path};
use warden_tools::builtins::default_registry;

use prompter::TerminalPrompter;

#[derive(Debug, Parser)]
#[command(
    name = "warden",
    version,
    about = "An agentic CLI assistant with permission-gated tool execution"
)]
struct Cli {
    /// Task to run (shorthand for `warden run <task>`).
    task: Option<String>,

    /// Path to an alternate configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the agent on a task.
    Run { task: String },
    /// Write a default configuration file.
    Init,
    /// Check configuration, tools, and the permission store.
    Doctor,
    /// Inspect or reset stored permission decisions.
    Permissions {
        #[command(subcommand)]
        command: PermissionCommands,
    },
}

#[derive(Debug, Subcommand)]
enum PermissionCommands {
    /// List persisted decisions.
    List,
    /// Drop a stored decision (or all of them), reopening the question.
    Reset {
        #[arg(long)]
        tool: Option<String>,
        #[arg(long, requires = "tool")]
        scope: Option<String>,
        #[arg(long, conflicts_with = "tool")]
        all: bool,
    },
}

fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".warden")
        .join("config.toml")
}

fn store_path(config: &AppConfig) -> PathBuf {
    if config.permissions.store_path.is_empty() {
        default_store_path()
    } else {
        PathBuf::from(&config.permissions.store_path)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = match AppConfig::load_from(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load {}: {err:#}", config_path.display());
            return ExitCode::from(exit_codes::ERROR as u8);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.telemetry.log_level.clone())),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Some(Commands::Run { task }) => run_task(&task, &config).await,
        Some(Commands::Init) => handle_init(&config_path),
        Some(Commands::Doctor) => handle_doctor(&config),
        Some(Commands::Permissions { command }) => handle_permissions(command, &config),
        None => match cli.task {
            Some(task) => run_task(&task, &config).await,
            None => {
                println!("warden {}", env!("CARGO_PKG_VERSION"));
                println!("\nUse --help for usage information");
                Ok(exit_codes::OK)
            }
        },
    };

    match result {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_codes::ERROR as u8)
        }
    }
}

async fn run_task(task: &str, config: &AppConfig) -> Result<i32> {
    let workspace_root = std::fs::canonicalize(&config.agent.workspace_path)
        .with_context(|| format!("resolve workspace path {}", config.agent.workspace_path))?;

    let registry = default_registry(workspace_root);
    let store = PermissionStore::open(store_path(config));
    let engine = PolicyEngine::new(store);

    let system_prompt = render_system_prompt(&config.agent.name, &registry.list_specs());
    let provider = OllamaProvider::new(
        config.llm.base_url.clone(),
        config.llm.model.clone(),
        system_prompt,
    );

    let mut runner = ToolRunner::new(std::time::Duration::from_secs(
        config.safety.tool_timeout_secs,
    ));
    for (tool, secs) in &config.tools.timeout_overrides {
        runner = runner.with_override(tool, std::time::Duration::from_secs(*secs));
    }

    let (event_tx, event_rx) = tokio::sync::mpsc::unbounded_channel();
    let printer = spawn_event_printer(event_rx);

    let mut agent = AgentLoop::new(
        task,
        &provider,
        &registry,
        &engine,
        runner,
        config.safety.max_steps,
        config.safety.context_max_entries,
    )
    .with_events(event_tx);

    // Ctrl-c aborts the conversation; an in-flight tool subprocess is killed.
    let interrupt = agent.interrupt_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.trigger();
        }
    });

    println!("Task: {task}\n");
    let outcome = agent.run(&TerminalPrompter).await;
    drop(agent);
    let _ = printer.await;

    match outcome {
        LoopOutcome::Finished { summary } => {
            println!("\n✓ Task finished");
            if !summary.is_empty() {
                println!("\n{summary}");
            }
            Ok(exit_codes::OK)
        }
        LoopOutcome::Aborted {
            reason,
            last_observation,
        } => {
            let (label, code) = match reason {
                AbortReason::UserInterrupt => ("interrupted by user", exit_codes::ABORTED_USER),
                AbortReason::StepLimitExceeded => {
                    ("step limit exceeded", exit_codes::STEP_LIMIT)
                }
            };
            println!("\n✗ Task aborted: {label}");
            if let Some(obs) = last_observation {
                let rendered = match obs {
                    Observation::Success { payload } => payload,
                    Observation::Failure { message, .. } => message,
                };
                println!("last observation: {rendered}");
            }
            Ok(code)
        }
    }
}

fn spawn_event_printer(
    mut rx: tokio::sync::mpsc::UnboundedReceiver<LoopEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                LoopEvent::Thought(text) => println!("· {text}"),
                LoopEvent::ActionProposed { tool, args } => {
                    println!("→ {tool}({args})")
                }
                LoopEvent::ToolEnd { tool, success, output } => {
                    let mark = if success { "✓" } else { "✗" };
                    let head: String = output.chars().take(200).collect();
                    println!("{mark} {tool}: {head}");
                }
                LoopEvent::ActionDenied { tool, by_policy } => {
                    let source = if by_policy { "policy" } else { "user" };
                    println!("✗ {tool} denied by {source}");
                }
                LoopEvent::Warning(text) => eprintln!("! {text}"),
                // Prompt rendering is handled by the prompter itself.
                LoopEvent::PermissionRequested { .. }
                | LoopEvent::PermissionResolved { .. }
                | LoopEvent::ToolStart { .. } => {}
            }
        }
    })
}

fn handle_init(config_path: &PathBuf) -> Result<i32> {
    if config_path.exists() {
        println!("configuration already exists at {}", config_path.display());
        return Ok(exit_codes::OK);
    }
    let config = AppConfig::default();
    config.save_to(config_path)?;
    println!("✓ wrote default configuration to {}", config_path.display());
    println!("\nTry: warden \"list the files in this directory\"");
    Ok(exit_codes::OK)
}

fn handle_doctor(config: &AppConfig) -> Result<i32> {
    println!("warden {}\n", env!("CARGO_PKG_VERSION"));
    println!("model:           {} ({})", config.llm.model, config.llm.base_url);
    println!("workspace:       {}", config.agent.workspace_path);
    println!("max steps:       {}", config.safety.max_steps);
    println!("tool timeout:    {}s", config.safety.tool_timeout_secs);

    let path = store_path(config);
    let store = PermissionStore::open(&path);
    println!(
        "permission store: {} ({} records)",
        path.display(),
        store.records().len()
    );

    let registry = default_registry(PathBuf::from(&config.agent.workspace_path));
    let names: Vec<String> = registry.list_specs().iter().map(|s| s.name.clone()).collect();
    println!("tools:           {}", names.join(", "));

    Ok(exit_codes::OK)
}

fn handle_permissions(command: PermissionCommands, config: &AppConfig) -> Result<i32> {
    let engine = PolicyEngine::new(PermissionStore::open(store_path(config)));

    match command {
        PermissionCommands::List => {
            let records = engine.list_records();
            if records.is_empty() {
                println!("no stored decisions");
                return Ok(exit_codes::OK);
            }
            for record in records {
                println!(
                    "{:<40} {:<12} {}",
                    record.key.to_string(),
                    format!("{:?}", record.decision).to_lowercase(),
                    record.created_at.format("%Y-%m-%d %H:%M UTC"),
                );
            }
            Ok(exit_codes::OK)
        }
        PermissionCommands::Reset { tool, scope, all } => {
            if all {
                let n = engine.reset_all()?;
                println!("✓ removed {n} stored decision(s)");
                return Ok(exit_codes::OK);
            }
            let Some(tool) = tool else {
                anyhow::bail!("pass --tool <name> (with optional --scope) or --all");
            };
            let key = PermissionKey { tool, scope };
            if engine.reset(&key)? {
                println!("✓ removed stored decision for {key}");
            } else {
                println!("no stored decision for {key}");
            }
            Ok(exit_codes::OK)
        }
    }
}
