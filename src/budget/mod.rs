//! Context budget management.
//!
//! One cycle per step: measure the turn list, and when it reaches the
//! trigger threshold split it into an older prefix and a recent suffix,
//! summarize the prefix through the delegated [`Summarizer`], and splice the
//! summary in front of the suffix. A list that already starts with a summary
//! turn is left alone, which makes a second call without new turns a no-op.
//!
//! Any summarization failure leaves the list untouched.

pub mod summarizer;
pub mod tokens;

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{BudgetConfig, KeepPolicy, TriggerPolicy};
use crate::models::turn::{Role, Turn};

pub use summarizer::{summary_prompt, Summarizer};
pub use tokens::{heuristic_count, TokenCounter, TokenEstimate};

/// Fallback estimates above this many turns get a tighter threshold.
const SAFETY_MARGIN_MIN_TURNS: usize = 20;
/// Threshold multiplier applied under the safety margin.
const SAFETY_MARGIN: f64 = 0.9;

/// Why a cycle did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Compression is disabled in configuration.
    Disabled,
    /// The first turn is already a summary.
    AlreadySummarized,
    /// There are no turns.
    Empty,
}

/// Result of one budget cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BudgetDecision {
    /// The cycle did not run.
    Skipped(SkipReason),
    /// Below threshold, or nothing eligible for compression.
    Pass {
        /// Measured size.
        tokens: u64,
        /// Effective threshold.
        threshold: u64,
        /// Whether `tokens` is a heuristic estimate.
        estimated: bool,
    },
    /// The prefix was replaced by a summary turn.
    Compressed {
        /// Turn count before splicing.
        turns_before: usize,
        /// Turn count after splicing.
        turns_after: usize,
        /// Measured size before.
        tokens_before: u64,
        /// Measured size after.
        tokens_after: u64,
    },
    /// Summarization failed; the turn list is unchanged.
    Aborted {
        /// Failure description.
        reason: String,
    },
}

impl BudgetDecision {
    /// Whether the turn list was rewritten.
    #[must_use]
    pub fn compressed(&self) -> bool {
        matches!(self, Self::Compressed { .. })
    }
}

/// Decides when turn history must be compressed and performs it.
pub struct ContextBudgetManager {
    config: BudgetConfig,
    counter: Option<Arc<dyn TokenCounter>>,
    summarizer: Arc<dyn Summarizer>,
}

impl std::fmt::Debug for ContextBudgetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextBudgetManager")
            .field("config", &self.config)
            .field("exact_counter", &self.counter.is_some())
            .finish_non_exhaustive()
    }
}

impl ContextBudgetManager {
    /// Create a manager that estimates tokens with the character heuristic.
    #[must_use]
    pub fn new(config: BudgetConfig, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            config,
            counter: None,
            summarizer,
        }
    }

    /// Prefer `counter` over the heuristic.
    #[must_use]
    pub fn with_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = Some(counter);
        self
    }

    /// Budget configuration in effect.
    #[must_use]
    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    /// Measure `turns` plus the instruction prefix.
    #[must_use]
    pub fn measure(&self, turns: &[Turn]) -> TokenEstimate {
        tokens::measure(self.counter.as_deref(), &self.config.instruction_prefix, turns)
    }

    /// Effective trigger threshold for a measurement over `turn_count` turns.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)] // Token counts are far below 2^52.
    pub fn threshold(&self, estimate: TokenEstimate, turn_count: usize) -> u64 {
        match self.config.trigger {
            TriggerPolicy::Tokens(limit) => limit,
            TriggerPolicy::Fraction(fraction) => {
                let mut threshold = self.config.max_input_tokens as f64 * fraction;
                if estimate.estimated && turn_count > SAFETY_MARGIN_MIN_TURNS {
                    threshold *= SAFETY_MARGIN;
                }
                threshold as u64
            }
        }
    }

    /// Index where the verbatim suffix starts; `0` means nothing to compress.
    ///
    /// The suffix always holds at least the newest turn and never starts
    /// with an action-result turn, so a result is never separated from the
    /// assistant turn that requested it.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)] // Turn counts are far below 2^52.
    pub fn split_point(&self, turns: &[Turn]) -> usize {
        let len = turns.len();
        let keep = match self.config.keep {
            KeepPolicy::Turns(count) => count,
            KeepPolicy::Fraction(fraction) => (len as f64 * fraction) as usize,
        }
        .max(1);
        if keep >= len {
            return 0;
        }
        let mut split = len - keep;
        while split > 0 && turns[split].role == Role::ActionResult {
            split -= 1;
        }
        split
    }

    /// Run one budget cycle over `turns`, rewriting it in place on success.
    pub async fn apply(&self, turns: &mut Vec<Turn>) -> BudgetDecision {
        if !self.config.enabled {
            return BudgetDecision::Skipped(SkipReason::Disabled);
        }
        let Some(first) = turns.first() else {
            return BudgetDecision::Skipped(SkipReason::Empty);
        };
        if first.is_summary() {
            debug!("history already summarized; skipping budget cycle");
            return BudgetDecision::Skipped(SkipReason::AlreadySummarized);
        }

        let estimate = self.measure(turns);
        let threshold = self.threshold(estimate, turns.len());
        debug!(
            tokens = estimate.tokens,
            threshold,
            estimated = estimate.estimated,
            turns = turns.len(),
            "context measured"
        );
        let pass = BudgetDecision::Pass {
            tokens: estimate.tokens,
            threshold,
            estimated: estimate.estimated,
        };
        if estimate.tokens < threshold {
            return pass;
        }

        let split = self.split_point(turns);
        if split == 0 {
            debug!(turns = turns.len(), "over budget but nothing eligible to compress");
            return pass;
        }

        let prompt = summary_prompt(&turns[..split], self.config.trim_tokens_to_summarize);
        let summary = match self.summarizer.summarize(&prompt).await {
            Ok(summary) if !summary.trim().is_empty() => summary,
            Ok(_) => {
                warn!("summarizer returned empty text; keeping history unchanged");
                return BudgetDecision::Aborted {
                    reason: "empty summary".into(),
                };
            }
            Err(err) => {
                warn!(%err, "summarization failed; keeping history unchanged");
                return BudgetDecision::Aborted {
                    reason: err.message(),
                };
            }
        };

        let turns_before = turns.len();
        let suffix = turns.split_off(split);
        turns.clear();
        turns.push(Turn::summary(&summary));
        turns.extend(suffix);

        let tokens_after = self.measure(turns).tokens;
        info!(
            turns_before,
            turns_after = turns.len(),
            tokens_before = estimate.tokens,
            tokens_after,
            "conversation history compressed"
        );
        BudgetDecision::Compressed {
            turns_before,
            turns_after: turns.len(),
            tokens_before: estimate.tokens,
            tokens_after,
        }
    }
}
