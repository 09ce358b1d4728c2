pub mod agent_loop;
pub mod events;
pub mod interrupt;
pub mod runner;

pub use agent_loop::{
    AbortReason, AgentLoop, LoopOutcome, LoopState, LoopTurn, PERMISSION_OPTIONS,
    PermissionPrompt,
};
pub use events::LoopEvent;
pub use interrupt::InterruptHandle;
pub use runner::ToolRunner;
