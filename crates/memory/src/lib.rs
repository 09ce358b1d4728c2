//! Bounded conversation transcript fed back to the model each turn.
//!
//! The transcript is an append-only sequence of [`AgentStep`]s owned by the
//! execution loop.  When it grows past its bound, the oldest prefix is
//! collapsed into a single placeholder thought — causal order is preserved
//! and the most recent unresolved action/observation pair is never dropped.

use serde::{Deserialize, Serialize};

use warden_tools::ToolCall;

// ── Step types ───────────────────────────────────────────────────────────────

/// Recoverable and terminal failure categories carried by observations.
///
/// Only `StepLimitExceeded` and `UserAbort` terminate the loop; every other
/// kind is reported back to the model, which is expected to adapt its plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Provider,
    ToolExecution,
    PolicyStore,
    ProtocolViolation,
    PermissionDenied,
    StepLimitExceeded,
    UserAbort,
}

/// The result of executing (or refusing to execute) an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Observation {
    Success { payload: String },
    Failure { kind: ErrorKind, message: String },
}

impl Observation {
    pub fn success(payload: impl Into<String>) -> Self {
        Self::Success {
            payload: payload.into(),
        }
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// One entry in the transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStep {
    Thought(String),
    Action(ToolCall),
    Observation(Observation),
}

impl AgentStep {
    pub fn is_action(&self) -> bool {
        matches!(self, Self::Action(_))
    }

    pub fn is_observation(&self) -> bool {
        matches!(self, Self::Observation(_))
    }
}

// ── Bounded transcript ───────────────────────────────────────────────────────

/// Append-only, bounded step log.  The loop owns exactly one of these per
/// conversation and is the only writer.
#[derive(Debug)]
pub struct ContextMemory {
    steps: Vec<AgentStep>,
    max_entries: usize,
    /// Total steps dropped by trimming over the life of the conversation.
    trimmed_total: usize,
}

impl ContextMemory {
    pub fn new(max_entries: usize) -> Self {
        Self {
            steps: Vec::new(),
            max_entries: max_entries.max(2),
            trimmed_total: 0,
        }
    }

    pub fn push(&mut self, step: AgentStep) {
        self.steps.push(step);
    }

    pub fn steps(&self) -> &[AgentStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn trimmed_total(&self) -> usize {
        self.trimmed_total
    }

    pub fn last_observation(&self) -> Option<&Observation> {
        self.steps.iter().rev().find_map(|s| match s {
            AgentStep::Observation(obs) => Some(obs),
            _ => None,
        })
    }

    /// Index of the first step that trimming must not touch: the most recent
    /// action together with everything after it (its observation, trailing
    /// thoughts).  An unresolved action at the tail is part of in-flight
    /// work and is never eligible.
    fn protected_from(&self) -> usize {
        self.steps
            .iter()
            .rposition(AgentStep::is_action)
            .unwrap_or(self.steps.len())
    }

    /// Drop the oldest steps until the transcript fits its bound, replacing
    /// the dropped prefix with a single placeholder thought so the model can
    /// see that earlier context existed.
    ///
    /// Returns the number of steps dropped (0 when already within bound).
    pub fn trim(&mut self) -> usize {
        if self.steps.len() <= self.max_entries {
            return 0;
        }

        let over = self.steps.len() - self.max_entries;
        // +1 makes room for the placeholder we are about to insert.
        let want = over + 1;
        let droppable = self.protected_from();
        let dropping = want.min(droppable);
        if dropping == 0 {
            return 0;
        }

        self.steps.drain(..dropping);
        self.trimmed_total += dropping;
        self.steps.insert(
            0,
            AgentStep::Thought(format!(
                "[{} earlier steps summarized away]",
                self.trimmed_total
            )),
        );
        tracing::debug!(
            dropped = dropping,
            total_dropped = self.trimmed_total,
            len = self.steps.len(),
            "trimmed transcript"
        );
        dropping
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
