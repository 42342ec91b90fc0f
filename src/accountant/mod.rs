//! Action accounting.
//!
//! Caps the number of side-effecting actions a session may take. A
//! refused action is data, not an error: it becomes an action-result turn
//! telling the step to answer without further actions.
//!
//! Counters merge additively. Each executed action contributes `+1` and
//! each model call contributes its reported token usage; the step's total
//! is folded into the stored counters at commit, never overwritten.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::config::{AccountantConfig, CountingPolicy};
use crate::models::checkpoint::{Checkpoint, CounterDelta};
use crate::models::event::{ActionStatus, StepFragment};
use crate::models::turn::{ActionCall, Turn};
use crate::orchestrator::bridge::FragmentSink;
use crate::Result;

/// Executes one side-effecting action on behalf of the step.
pub trait ActionExecutor: Send + Sync {
    /// Run `call` and return its textual result.
    ///
    /// # Errors
    ///
    /// Any error is recorded as a failed action; it does not abort the step.
    fn execute<'a>(
        &'a self,
        call: &'a ActionCall,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;
}

/// What happened to one requested action.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    /// The action ran and counted against the cap.
    Executed {
        /// The requested call.
        call: ActionCall,
        /// Executor output.
        output: String,
    },
    /// The action ran and failed; it does not count.
    Failed {
        /// The requested call.
        call: ActionCall,
        /// Failure description.
        message: String,
    },
    /// The action was refused because the cap was reached.
    Refused {
        /// The requested call.
        call: ActionCall,
        /// Refusal text addressed to the step.
        message: String,
    },
}

impl ActionOutcome {
    /// The call this outcome answers.
    #[must_use]
    pub fn call(&self) -> &ActionCall {
        match self {
            Self::Executed { call, .. } | Self::Failed { call, .. } | Self::Refused { call, .. } => {
                call
            }
        }
    }

    /// Whether the action counted against the cap.
    #[must_use]
    pub fn counted(&self) -> bool {
        matches!(self, Self::Executed { .. })
    }

    /// Whether the action was refused.
    #[must_use]
    pub fn is_refused(&self) -> bool {
        matches!(self, Self::Refused { .. })
    }

    /// Render as the action-result turn the step appends to its output.
    #[must_use]
    pub fn into_turn(self) -> Turn {
        match self {
            Self::Executed { call, output } => Turn::action_result(call.id, output),
            Self::Failed { call, message } => Turn::action_result(call.id, format!("Error: {message}")),
            Self::Refused { call, message } => Turn::action_result(call.id, message),
        }
    }
}

/// Token usage reported by one model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    /// Prompt tokens.
    pub input_tokens: u64,
    /// Completion tokens.
    pub output_tokens: u64,
}

/// Refusal text for an action that would exceed the cap.
#[must_use]
pub fn refusal_message(count: u64, limit: u64, action: &str) -> String {
    format!(
        "Action limit exceeded: {count} >= {limit}. Maximum allowed actions is {limit}. \
         Cannot execute action '{action}'. Please provide a final response to the user \
         without making additional action calls."
    )
}

/// Session-level action cap and counting policy.
#[derive(Debug, Clone)]
pub struct ActionAccountant {
    limit: u64,
    policy: CountingPolicy,
}

impl ActionAccountant {
    /// Create an accountant from the `[accountant]` configuration section.
    #[must_use]
    pub fn new(config: &AccountantConfig) -> Self {
        Self {
            limit: config.max_actions,
            policy: config.policy,
        }
    }

    /// Configured cap.
    #[must_use]
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Start accounting for one step against `checkpoint`'s counters.
    #[must_use]
    pub fn open(&self, checkpoint: &Checkpoint) -> StepAccount {
        StepAccount {
            limit: self.limit,
            policy: self.policy,
            count: AtomicU64::new(checkpoint.action_count),
            executed: AtomicU64::new(0),
            tokens_in: AtomicU64::new(0),
            tokens_out: AtomicU64::new(0),
        }
    }
}

/// Counters for one in-flight step.
#[derive(Debug)]
pub struct StepAccount {
    limit: u64,
    policy: CountingPolicy,
    count: AtomicU64,
    executed: AtomicU64,
    tokens_in: AtomicU64,
    tokens_out: AtomicU64,
}

impl StepAccount {
    /// Stored count plus actions executed so far in this step.
    #[must_use]
    pub fn action_count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Actions still allowed before the cap.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.action_count())
    }

    /// Add one model call's usage.
    pub fn record_usage(&self, usage: TokenUsage) {
        self.tokens_in.fetch_add(usage.input_tokens, Ordering::SeqCst);
        self.tokens_out.fetch_add(usage.output_tokens, Ordering::SeqCst);
    }

    /// This step's additive contribution to the stored counters.
    #[must_use]
    pub fn delta(&self) -> CounterDelta {
        CounterDelta {
            actions: self.executed.load(Ordering::SeqCst),
            tokens_in: self.tokens_in.load(Ordering::SeqCst),
            tokens_out: self.tokens_out.load(Ordering::SeqCst),
        }
    }

    /// Run a batch of actions requested together, concurrently.
    ///
    /// Outcomes are returned in request order. Under
    /// [`CountingPolicy::BatchSnapshot`] every call is checked against the
    /// count seen before the batch, so a batch may overshoot the cap by at
    /// most `batch - 1`; under [`CountingPolicy::Strict`] each call reserves
    /// a slot first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Cancelled` if the fragment sink gave up.
    pub async fn run_batch(
        &self,
        calls: &[ActionCall],
        executor: &dyn ActionExecutor,
        sink: &FragmentSink,
    ) -> Result<Vec<ActionOutcome>> {
        let snapshot = self.action_count();
        let outcomes = join_all(
            calls
                .iter()
                .map(|call| self.run_one(call, snapshot, executor, sink)),
        )
        .await
        .into_iter()
        .collect::<Result<Vec<_>>>()?;

        if self.policy == CountingPolicy::BatchSnapshot {
            let executed = outcomes.iter().filter(|outcome| outcome.counted()).count();
            let executed = u64::try_from(executed).unwrap_or(u64::MAX);
            self.count.fetch_add(executed, Ordering::SeqCst);
        }
        debug!(
            requested = calls.len(),
            action_count = self.action_count(),
            limit = self.limit,
            "action batch finished"
        );
        Ok(outcomes)
    }

    async fn run_one(
        &self,
        call: &ActionCall,
        snapshot: u64,
        executor: &dyn ActionExecutor,
        sink: &FragmentSink,
    ) -> Result<ActionOutcome> {
        if let Err(observed) = self.admit(snapshot) {
            warn!(action = %call.name, count = observed, limit = self.limit, "action refused");
            sink.emit(StepFragment::ToolEnd {
                name: call.name.clone(),
                call_id: call.id.clone(),
                status: ActionStatus::Refused,
            })
            .await?;
            return Ok(ActionOutcome::Refused {
                message: refusal_message(observed, self.limit, &call.name),
                call: call.clone(),
            });
        }

        sink.emit(StepFragment::ToolStart {
            name: call.name.clone(),
            call_id: call.id.clone(),
        })
        .await?;

        let (outcome, status) = match executor.execute(call).await {
            Ok(output) => {
                self.executed.fetch_add(1, Ordering::SeqCst);
                (
                    ActionOutcome::Executed {
                        call: call.clone(),
                        output,
                    },
                    ActionStatus::Completed,
                )
            }
            Err(err) => {
                if self.policy == CountingPolicy::Strict {
                    self.count.fetch_sub(1, Ordering::SeqCst);
                }
                let message = err.message();
                (
                    ActionOutcome::Failed {
                        call: call.clone(),
                        message: message.clone(),
                    },
                    ActionStatus::Failed(message),
                )
            }
        };

        sink.emit(StepFragment::ToolEnd {
            name: call.name.clone(),
            call_id: call.id.clone(),
            status,
        })
        .await?;
        Ok(outcome)
    }

    /// Decide whether one more action may run; `Err` carries the count
    /// that blocked it.
    fn admit(&self, snapshot: u64) -> std::result::Result<(), u64> {
        match self.policy {
            CountingPolicy::BatchSnapshot => {
                if snapshot < self.limit {
                    Ok(())
                } else {
                    Err(snapshot)
                }
            }
            CountingPolicy::Strict => self
                .count
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                    (count < self.limit).then_some(count + 1)
                })
                .map(|_| ()),
        }
    }
}
