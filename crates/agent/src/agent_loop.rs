//! The agent execution loop: a plain state machine alternating between model
//! reasoning and gated tool execution.
//!
//! Driven through [`AgentLoop::advance`] and [`AgentLoop::resume`] so tests
//! can feed synthetic permission answers directly; [`AgentLoop::run`] is the
//! thin driver that wires a real prompter in.  Exactly one step is in flight
//! at a time and the state machine is the only scheduler.

use tokio::sync::mpsc::UnboundedSender;

use warden_llm::{ModelProvider, ModelTurn};
use warden_memory::{AgentStep, ContextMemory, ErrorKind, Observation};
use warden_policy::{PermissionDecision, PermissionKey, PolicyEngine, Verdict};
use warden_tools::{ToolCall, ToolProposal, ToolRegistry};

use crate::events::LoopEvent;
use crate::interrupt::InterruptHandle;
use crate::runner::ToolRunner;

/// The four answers every permission prompt must offer.
pub const PERMISSION_OPTIONS: [PermissionDecision; 4] = [
    PermissionDecision::AllowOnce,
    PermissionDecision::AllowAlways,
    PermissionDecision::DenyOnce,
    PermissionDecision::DenyAlways,
];

/// Contract between the loop and whatever renders permission prompts.
/// The loop defines the options; the UI only chooses among them.
#[async_trait::async_trait]
pub trait PermissionPrompt: Send + Sync {
    async fn present(
        &self,
        prompt: &str,
        options: &[PermissionDecision],
    ) -> PermissionDecision;
}

/// Exactly one of these is active per conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Thinking,
    AwaitingPermission,
    Executing,
    Finished,
    Aborted,
}

/// Why a conversation ended without a model finish signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    UserInterrupt,
    StepLimitExceeded,
}

/// Terminal result reported to the caller for exit-code mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    Finished {
        summary: String,
    },
    Aborted {
        reason: AbortReason,
        last_observation: Option<Observation>,
    },
}

/// What the driver should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopTurn {
    /// The loop made internal progress; call `advance` again.
    Progress,
    /// The single designed suspension point: block for a user decision and
    /// feed it back through `resume`.
    AwaitingPermission { prompt: String },
    Terminal(LoopOutcome),
}

struct PendingAction {
    call: ToolCall,
    key: PermissionKey,
    prompt: String,
}

pub struct AgentLoop<'a> {
    task: String,
    provider: &'a dyn ModelProvider,
    registry: &'a ToolRegistry,
    engine: &'a PolicyEngine,
    runner: ToolRunner,
    memory: ContextMemory,
    state: LoopState,
    pending: Option<PendingAction>,
    outcome: Option<LoopOutcome>,
    steps_taken: usize,
    max_steps: usize,
    interrupt: InterruptHandle,
    events: Option<UnboundedSender<LoopEvent>>,
}

impl<'a> AgentLoop<'a> {
    pub fn new(
        task: impl Into<String>,
        provider: &'a dyn ModelProvider,
        registry: &'a ToolRegistry,
        engine: &'a PolicyEngine,
        runner: ToolRunner,
        max_steps: usize,
        memory_bound: usize,
    ) -> Self {
        Self {
            task: task.into(),
            provider,
            registry,
            engine,
            runner,
            memory: ContextMemory::new(memory_bound),
            state: LoopState::Thinking,
            pending: None,
            outcome: None,
            steps_taken: 0,
            max_steps,
            interrupt: InterruptHandle::new(),
            events: None,
        }
    }

    pub fn with_events(mut self, tx: UnboundedSender<LoopEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Handle the UI layer uses to abort the conversation.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn steps_taken(&self) -> usize {
        self.steps_taken
    }

    pub fn memory(&self) -> &ContextMemory {
        &self.memory
    }

    fn emit(&self, event: LoopEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Advance the machine by one transition.
    pub async fn advance(&mut self) -> LoopTurn {
        match self.state {
            LoopState::Finished | LoopState::Aborted => {
                LoopTurn::Terminal(self.outcome.clone().unwrap_or(LoopOutcome::Aborted {
                    reason: AbortReason::UserInterrupt,
                    last_observation: None,
                }))
            }
            LoopState::AwaitingPermission => LoopTurn::AwaitingPermission {
                prompt: self
                    .pending
                    .as_ref()
                    .map(|p| p.prompt.clone())
                    .unwrap_or_default(),
            },
            // Executing is transient inside `execute`; seeing it here means
            // the caller polled mid-transition — just ask again.
            LoopState::Executing => LoopTurn::Progress,
            LoopState::Thinking => self.think().await,
        }
    }

    async fn think(&mut self) -> LoopTurn {
        if self.interrupt.is_triggered() {
            return self.abort(AbortReason::UserInterrupt);
        }

        self.steps_taken += 1;
        if self.steps_taken > self.max_steps {
            tracing::warn!(
                max_steps = self.max_steps,
                "step limit exceeded — aborting runaway loop"
            );
            return self.abort(AbortReason::StepLimitExceeded);
        }

        self.memory.trim();

        let turn = {
            let provider = self.provider;
            let task = self.task.as_str();
            let steps = self.memory.steps();
            let interrupt = self.interrupt.clone();
            tokio::select! {
                turn = provider.propose(task, steps) => Some(turn),
                _ = interrupt.triggered() => None,
            }
        };

        let turn = match turn {
            None => return self.abort(AbortReason::UserInterrupt),
            Some(Err(err)) => {
                tracing::warn!(error = %err, "provider failure — reported to the model");
                self.emit(LoopEvent::Warning(format!("provider error: {err}")));
                self.memory.push(AgentStep::Observation(Observation::failure(
                    ErrorKind::Provider,
                    err.to_string(),
                )));
                return LoopTurn::Progress;
            }
            Some(Ok(turn)) => turn,
        };

        match turn {
            ModelTurn::Finish { summary } => {
                self.state = LoopState::Finished;
                let outcome = LoopOutcome::Finished { summary };
                self.outcome = Some(outcome.clone());
                LoopTurn::Terminal(outcome)
            }
            ModelTurn::Thought(text) => {
                self.emit(LoopEvent::Thought(text.clone()));
                self.memory.push(AgentStep::Thought(text));
                LoopTurn::Progress
            }
            ModelTurn::Action(action) => {
                if let Some(thought) = &action.thought {
                    self.emit(LoopEvent::Thought(thought.clone()));
                    self.memory.push(AgentStep::Thought(thought.clone()));
                }
                let proposal = ToolProposal {
                    tool_name: action.tool_name,
                    arguments: action.arguments,
                    call_id: action.call_id,
                };
                match self.registry.validate(proposal) {
                    Err(err) => {
                        tracing::info!(error = %err, "rejected malformed proposal");
                        self.memory.push(AgentStep::Observation(Observation::failure(
                            ErrorKind::ProtocolViolation,
                            err.to_string(),
                        )));
                        LoopTurn::Progress
                    }
                    Ok(call) => self.gate(call).await,
                }
            }
        }
    }

    /// Route a validated call through the policy engine.
    async fn gate(&mut self, call: ToolCall) -> LoopTurn {
        self.emit(LoopEvent::ActionProposed {
            tool: call.tool_name().to_string(),
            args: call.describe_args(3),
        });
        self.memory.push(AgentStep::Action(call.clone()));

        match self.engine.decide(self.registry, &call) {
            Verdict::Allow => self.execute(call).await,
            Verdict::Deny => {
                self.emit(LoopEvent::ActionDenied {
                    tool: call.tool_name().to_string(),
                    by_policy: true,
                });
                self.memory.push(AgentStep::Observation(Observation::failure(
                    ErrorKind::PermissionDenied,
                    "denied by policy",
                )));
                LoopTurn::Progress
            }
            Verdict::Ask { prompt } => {
                let key = PermissionKey::derive(self.registry, &call);
                self.emit(LoopEvent::PermissionRequested {
                    prompt: prompt.clone(),
                });
                self.pending = Some(PendingAction {
                    call,
                    key,
                    prompt: prompt.clone(),
                });
                self.state = LoopState::AwaitingPermission;
                LoopTurn::AwaitingPermission { prompt }
            }
        }
    }

    /// Feed a user decision back into a suspended loop.
    pub async fn resume(&mut self, decision: PermissionDecision) -> LoopTurn {
        if self.state != LoopState::AwaitingPermission {
            return self.advance().await;
        }
        let Some(pending) = self.pending.take() else {
            self.state = LoopState::Thinking;
            return LoopTurn::Progress;
        };

        // Persist durable answers before anything runs.  A failed write is
        // surfaced and the session still honors the answer — worst case the
        // question is asked again next run, never silently granted.
        if let Err(err) = self.engine.resolve(&pending.key, decision) {
            tracing::warn!(key = %pending.key, error = %err, "failed to persist permission decision");
            self.emit(LoopEvent::Warning(format!(
                "could not persist decision for {}: {err}",
                pending.key
            )));
        }
        self.emit(LoopEvent::PermissionResolved { decision });

        if decision.allows() {
            self.execute(pending.call).await
        } else {
            self.emit(LoopEvent::ActionDenied {
                tool: pending.call.tool_name().to_string(),
                by_policy: false,
            });
            self.memory.push(AgentStep::Observation(Observation::failure(
                ErrorKind::PermissionDenied,
                "denied by user",
            )));
            self.state = LoopState::Thinking;
            LoopTurn::Progress
        }
    }

    /// Run an authorized call with interrupt-aware cancellation.
    async fn execute(&mut self, call: ToolCall) -> LoopTurn {
        self.state = LoopState::Executing;
        self.emit(LoopEvent::ToolStart {
            tool: call.tool_name().to_string(),
        });

        let observation = {
            let runner = &self.runner;
            let registry = self.registry;
            let interrupt = self.interrupt.clone();
            tokio::select! {
                obs = runner.run(registry, &call) => Some(obs),
                _ = interrupt.triggered() => None,
            }
            // The in-flight tool future is dropped here on interrupt, which
            // kills any kill_on_drop subprocess it spawned.
        };

        match observation {
            Some(obs) => {
                self.emit(LoopEvent::ToolEnd {
                    tool: call.tool_name().to_string(),
                    success: obs.is_success(),
                    output: match &obs {
                        Observation::Success { payload } => payload.clone(),
                        Observation::Failure { message, .. } => message.clone(),
                    },
                });
                self.memory.push(AgentStep::Observation(obs));
                self.state = LoopState::Thinking;
                LoopTurn::Progress
            }
            None => {
                // The action was authorized and observed as interrupted —
                // never left dangling without an observation.
                self.memory.push(AgentStep::Observation(Observation::failure(
                    ErrorKind::UserAbort,
                    format!("'{}' interrupted by user", call.tool_name()),
                )));
                self.abort(AbortReason::UserInterrupt)
            }
        }
    }

    fn abort(&mut self, reason: AbortReason) -> LoopTurn {
        self.state = LoopState::Aborted;
        let outcome = LoopOutcome::Aborted {
            reason,
            last_observation: self.memory.last_observation().cloned(),
        };
        self.outcome = Some(outcome.clone());
        LoopTurn::Terminal(outcome)
    }

    /// Drive the machine to completion, blocking on `prompter` at the
    /// suspension point.
    pub async fn run(&mut self, prompter: &dyn PermissionPrompt) -> LoopOutcome {
        loop {
            match self.advance().await {
                LoopTurn::Progress => {}
                LoopTurn::AwaitingPermission { prompt } => {
                    let decision = prompter.present(&prompt, &PERMISSION_OPTIONS).await;
                    self.resume(decision).await;
                }
                LoopTurn::Terminal(outcome) => return outcome,
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
