//! Checkpoint model: the durable snapshot of one session.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::turn::{Role, Turn};
use crate::{AppError, Result};

/// Value of a single milestone flag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum MilestoneValue {
    /// Boolean milestone (e.g. "persona clarified").
    Flag(bool),
    /// Free-form milestone value.
    Text(String),
}

/// Opaque milestone flags set by the agent step.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct MilestoneFlags(BTreeMap<String, MilestoneValue>);

impl MilestoneFlags {
    /// Empty flag set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a boolean flag.
    pub fn set_flag(&mut self, name: impl Into<String>, value: bool) {
        self.0.insert(name.into(), MilestoneValue::Flag(value));
    }

    /// Set a text value.
    pub fn set_text(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), MilestoneValue::Text(value.into()));
    }

    /// Look up a flag value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&MilestoneValue> {
        self.0.get(name)
    }

    /// Whether the named flag is set to `true`.
    #[must_use]
    pub fn is_set(&self, name: &str) -> bool {
        matches!(self.0.get(name), Some(MilestoneValue::Flag(true)))
    }

    /// Overlay `updates` onto this set; later values win.
    pub fn merge(&mut self, updates: MilestoneFlags) {
        self.0.extend(updates.0);
    }

    /// Number of flags.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no flags are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over `(name, value)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &MilestoneValue)> {
        self.0.iter()
    }
}

/// Additive counter changes produced by one step.
///
/// Deltas are merged by summation, never by overwrite, so increments
/// recorded against the same snapshot are all retained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDelta {
    /// Successfully executed actions.
    pub actions: u64,
    /// Input tokens reported by model calls.
    pub tokens_in: u64,
    /// Output tokens reported by model calls.
    pub tokens_out: u64,
}

impl CounterDelta {
    /// Commutative merge of two deltas.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self {
            actions: self.actions.saturating_add(other.actions),
            tokens_in: self.tokens_in.saturating_add(other.tokens_in),
            tokens_out: self.tokens_out.saturating_add(other.tokens_out),
        }
    }
}

/// Durable snapshot of a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Checkpoint {
    /// Ordered conversation turns.
    #[serde(default)]
    pub turns: Vec<Turn>,
    /// Milestone flags set by the agent step.
    #[serde(default)]
    pub milestone_flags: MilestoneFlags,
    /// Side-effecting actions executed so far.
    #[serde(default)]
    pub action_count: u64,
    /// Cumulative input tokens.
    #[serde(default)]
    pub tokens_in: u64,
    /// Cumulative output tokens.
    #[serde(default)]
    pub tokens_out: u64,
    /// Last commit timestamp.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    /// Fields written by other producers; preserved, never interpreted.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl Checkpoint {
    /// Fresh checkpoint for a session's first turn.
    #[must_use]
    pub fn new() -> Self {
        Self {
            turns: Vec::new(),
            milestone_flags: MilestoneFlags::new(),
            action_count: 0,
            tokens_in: 0,
            tokens_out: 0,
            updated_at: Utc::now(),
            extra: serde_json::Map::new(),
        }
    }

    /// Checkpoint seeded with the given turns.
    #[must_use]
    pub fn with_turns(turns: Vec<Turn>) -> Self {
        Self {
            turns,
            ..Self::new()
        }
    }

    /// Fold a step's counter delta into the cumulative totals.
    pub fn apply_counters(&mut self, delta: CounterDelta) {
        self.action_count = self.action_count.saturating_add(delta.actions);
        self.tokens_in = self.tokens_in.saturating_add(delta.tokens_in);
        self.tokens_out = self.tokens_out.saturating_add(delta.tokens_out);
    }

    /// Whether history has been compressed at least once.
    #[must_use]
    pub fn is_summarized(&self) -> bool {
        self.turns.first().is_some_and(Turn::is_summary)
    }

    /// Check structural invariants enforced at the store boundary.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if a summary turn appears anywhere but the
    /// head of the list, or an action-result turn lacks its call id.
    pub fn validate(&self) -> Result<()> {
        for (index, turn) in self.turns.iter().enumerate() {
            if turn.summary && index != 0 {
                return Err(AppError::Store(format!(
                    "summary turn at position {index}; only the first turn may be a summary"
                )));
            }
            if turn.role == Role::ActionResult && turn.action_call_id.is_none() {
                return Err(AppError::Store(format!(
                    "action-result turn {} has no action_call_id",
                    turn.id
                )));
            }
        }
        Ok(())
    }
}
