//! Contract between the runtime and the agent step.

use std::future::Future;
use std::pin::Pin;

use crate::accountant::{ActionExecutor, ActionOutcome, StepAccount, TokenUsage};
use crate::models::checkpoint::{Checkpoint, MilestoneFlags};
use crate::models::event::StepFragment;
use crate::models::turn::{ActionCall, Turn};
use crate::orchestrator::bridge::FragmentSink;
use crate::Result;

/// Everything one step invocation may read or report through.
///
/// `checkpoint` is the working copy: the new turn is already appended and
/// the history already passed through the budget cycle.
pub struct StepRequest<'a> {
    /// Session being stepped.
    pub session_id: &'a str,
    /// Working copy of the session's checkpoint.
    pub checkpoint: &'a Checkpoint,
    /// The inbound turn (also the last entry of `checkpoint.turns`).
    pub new_turn: &'a Turn,
    /// Action and token accounting for this step.
    pub account: &'a StepAccount,
    /// Incremental output channel.
    pub sink: &'a FragmentSink,
}

impl StepRequest<'_> {
    /// Run a batch of requested actions under the session's action cap.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Cancelled` if the streaming consumer went away.
    pub async fn dispatch(
        &self,
        calls: &[ActionCall],
        executor: &dyn ActionExecutor,
    ) -> Result<Vec<ActionOutcome>> {
        self.account.run_batch(calls, executor, self.sink).await
    }

    /// Push a piece of assistant text.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Cancelled` if the streaming consumer went away.
    pub async fn emit_delta(&self, text: impl Into<String>) -> Result<()> {
        self.sink.emit(StepFragment::TextDelta(text.into())).await
    }

    /// Push an informational note.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Cancelled` if the streaming consumer went away.
    pub async fn progress(&self, message: impl Into<String>) -> Result<()> {
        self.sink.emit(StepFragment::ProgressNote(message.into())).await
    }

    /// Record one model call's token usage.
    pub fn record_usage(&self, usage: TokenUsage) {
        self.account.record_usage(usage);
    }
}

/// What a successful step produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput {
    /// Turns to append after the inbound turn, in order.
    pub turns: Vec<Turn>,
    /// Milestone flags to overlay onto the checkpoint.
    pub milestones: MilestoneFlags,
}

impl StepOutput {
    /// Output consisting of a single assistant reply.
    #[must_use]
    pub fn reply(text: impl Into<String>) -> Self {
        Self {
            turns: vec![Turn::assistant(text)],
            milestones: MilestoneFlags::new(),
        }
    }
}

/// The external reasoning computation: one step over a session.
pub trait AgentStep: Send + Sync {
    /// Consume the working checkpoint and new turn, producing output turns.
    ///
    /// # Errors
    ///
    /// Any error is surfaced to the caller as a step execution failure and
    /// nothing is committed.
    fn step<'a>(
        &'a self,
        request: StepRequest<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<StepOutput>> + Send + 'a>>;
}
