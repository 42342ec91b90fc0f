//! Explicit step pipeline.
//!
//! Stages run in a fixed order under the session lock:
//! load, append, compact, step, merge, commit. Nothing is written unless
//! every stage succeeds.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, info_span, warn, Instrument};

use crate::accountant::ActionAccountant;
use crate::budget::{BudgetDecision, ContextBudgetManager};
use crate::models::checkpoint::Checkpoint;
use crate::models::turn::{Role, Turn};
use crate::orchestrator::bridge::FragmentSink;
use crate::orchestrator::lock_manager::SessionLockManager;
use crate::orchestrator::step::{AgentStep, StepRequest};
use crate::persistence::CheckpointStore;
use crate::{AppError, Result};

/// Result of one committed step.
#[derive(Debug, Clone)]
pub struct StepReply {
    /// Session that was stepped.
    pub session_id: String,
    /// Text of the last assistant turn produced, or empty.
    pub text: String,
    /// Turns the step appended after the inbound turn.
    pub output_turns: Vec<Turn>,
    /// The checkpoint as committed.
    pub checkpoint: Checkpoint,
    /// What the budget cycle did, if it ran.
    pub budget: Option<BudgetDecision>,
}

/// Wires the store, locks, budget, accountant and step together.
pub struct StepPipeline {
    store: Arc<CheckpointStore>,
    locks: Arc<SessionLockManager>,
    budget: Option<ContextBudgetManager>,
    accountant: ActionAccountant,
    step: Arc<dyn AgentStep>,
}

impl std::fmt::Debug for StepPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepPipeline")
            .field("store", &self.store.path())
            .field("locks", &self.locks)
            .field("budget", &self.budget)
            .field("accountant", &self.accountant)
            .finish_non_exhaustive()
    }
}

impl StepPipeline {
    /// Assemble a pipeline. `budget` of `None` disables compression.
    #[must_use]
    pub fn new(
        store: Arc<CheckpointStore>,
        locks: Arc<SessionLockManager>,
        budget: Option<ContextBudgetManager>,
        accountant: ActionAccountant,
        step: Arc<dyn AgentStep>,
    ) -> Self {
        Self {
            store,
            locks,
            budget,
            accountant,
            step,
        }
    }

    /// Shared checkpoint store.
    #[must_use]
    pub fn store(&self) -> &Arc<CheckpointStore> {
        &self.store
    }

    /// Shared lock manager.
    #[must_use]
    pub fn locks(&self) -> &Arc<SessionLockManager> {
        &self.locks
    }

    /// Run one step for `session_id` with `turn` as the new input.
    ///
    /// # Errors
    ///
    /// Returns `AppError::StepExecution` if the step faulted or produced
    /// invalid output, and `AppError::Cancelled` if the streaming consumer
    /// went away. The stored checkpoint is unchanged in both cases.
    pub async fn run(
        &self,
        session_id: &str,
        turn: Turn,
        sink: &FragmentSink,
    ) -> Result<StepReply> {
        let span = info_span!("step", session_id);
        async move {
            let guard = self.locks.acquire(session_id).await;
            let result = self.run_locked(session_id, turn, sink).await;
            drop(guard);
            result
        }
        .instrument(span)
        .await
    }

    async fn run_locked(
        &self,
        session_id: &str,
        turn: Turn,
        sink: &FragmentSink,
    ) -> Result<StepReply> {
        let mut working = self.store.get(session_id).unwrap_or_default();
        working.turns.push(turn.clone());

        let budget = match &self.budget {
            Some(budget) => Some(budget.apply(&mut working.turns).await),
            None => None,
        };

        let account = self.accountant.open(&working);
        let output = self
            .step
            .step(StepRequest {
                session_id,
                checkpoint: &working,
                new_turn: &turn,
                account: &account,
                sink,
            })
            .await
            .map_err(classify_step_error)
            .inspect_err(|err| warn!(%err, "agent step failed; checkpoint left unchanged"))?;

        if sink.is_cancelled() {
            warn!("stream consumer went away; discarding step output");
            return Err(AppError::Cancelled(
                "stream consumer stopped reading; step output discarded".into(),
            ));
        }

        let delta = account.delta();
        working.turns.extend(output.turns.iter().cloned());
        working.milestone_flags.merge(output.milestones);
        working.apply_counters(delta);
        working.updated_at = Utc::now();

        self.store
            .put(session_id, working.clone())
            .map_err(|err| AppError::step("InvalidStepOutput", err.message()))?;

        let text = output
            .turns
            .iter()
            .rev()
            .find(|turn| turn.role == Role::Assistant && !turn.is_summary())
            .map(Turn::text)
            .unwrap_or_default();

        info!(
            turns = working.turns.len(),
            actions = delta.actions,
            action_count = working.action_count,
            tokens_in = delta.tokens_in,
            tokens_out = delta.tokens_out,
            "step committed"
        );

        Ok(StepReply {
            session_id: session_id.to_owned(),
            text,
            output_turns: output.turns,
            checkpoint: working,
            budget,
        })
    }
}

/// Surface step failures as `StepExecution`, keeping cancellation distinct.
fn classify_step_error(err: AppError) -> AppError {
    match err {
        AppError::StepExecution { .. } | AppError::Cancelled(_) => err,
        other => AppError::step(other.error_type(), other.message()),
    }
}
