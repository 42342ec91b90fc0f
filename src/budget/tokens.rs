//! Token counting for the context budget.
//!
//! Counting is best-effort. An exact [`TokenCounter`] is used when one is
//! configured; otherwise, or when it fails, a character heuristic stands in
//! and the result is flagged as an estimate.

use crate::models::turn::Turn;
use crate::Result;

/// Characters per token assumed by the heuristic, expressed as `2 / 5`.
const HEURISTIC_TOKENS_NUM: u64 = 2;
const HEURISTIC_TOKENS_DEN: u64 = 5;

/// Per-turn overhead assumed by the heuristic (role, formatting).
pub const HEURISTIC_TURN_OVERHEAD: u64 = 10;

/// Exact tokenizer for turn lists.
pub trait TokenCounter: Send + Sync {
    /// Count the tokens of `prefix` plus `turns`.
    ///
    /// # Errors
    ///
    /// Any error makes the caller fall back to the heuristic.
    fn count(&self, prefix: &str, turns: &[Turn]) -> Result<u64>;
}

/// A token count and whether it came from the heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenEstimate {
    /// Token count.
    pub tokens: u64,
    /// `true` when produced by the character heuristic.
    pub estimated: bool,
}

/// Character heuristic: one token per 2.5 characters plus a fixed per-turn
/// overhead. A non-empty instruction prefix counts as one extra turn.
#[must_use]
pub fn heuristic_count(prefix: &str, turns: &[Turn]) -> u64 {
    let mut chars = to_u64(turns.iter().map(|turn| turn.content.char_len()).sum());
    let mut count = to_u64(turns.len());
    if !prefix.is_empty() {
        chars = chars.saturating_add(to_u64(prefix.chars().count()));
        count += 1;
    }
    chars.saturating_mul(HEURISTIC_TOKENS_NUM) / HEURISTIC_TOKENS_DEN
        + count.saturating_mul(HEURISTIC_TURN_OVERHEAD)
}

/// Count with `counter` when available, falling back to the heuristic.
#[must_use]
pub fn measure(counter: Option<&dyn TokenCounter>, prefix: &str, turns: &[Turn]) -> TokenEstimate {
    if let Some(counter) = counter {
        match counter.count(prefix, turns) {
            Ok(tokens) => {
                return TokenEstimate {
                    tokens,
                    estimated: false,
                }
            }
            Err(err) => {
                tracing::debug!(%err, "token counter failed; using character heuristic");
            }
        }
    }
    TokenEstimate {
        tokens: heuristic_count(prefix, turns),
        estimated: true,
    }
}

fn to_u64(value: usize) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

#[cfg(feature = "tokenizer")]
pub use tiktoken::TiktokenCounter;

#[cfg(feature = "tokenizer")]
mod tiktoken {
    use tiktoken_rs::CoreBPE;

    use super::{to_u64, TokenCounter};
    use crate::models::turn::Turn;
    use crate::{AppError, Result};

    /// Per-message framing tokens added by chat-format encodings.
    const MESSAGE_OVERHEAD: u64 = 4;

    /// Exact counter backed by the `cl100k_base` BPE.
    pub struct TiktokenCounter {
        bpe: CoreBPE,
    }

    impl std::fmt::Debug for TiktokenCounter {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("TiktokenCounter(cl100k_base)")
        }
    }

    impl TiktokenCounter {
        /// Load the `cl100k_base` encoding.
        ///
        /// # Errors
        ///
        /// Returns `AppError::Config` if the encoding cannot be built.
        pub fn cl100k() -> Result<Self> {
            let bpe = tiktoken_rs::cl100k_base()
                .map_err(|err| AppError::Config(format!("failed to load tokenizer: {err}")))?;
            Ok(Self { bpe })
        }

        fn encode_len(&self, text: &str) -> u64 {
            to_u64(self.bpe.encode_with_special_tokens(text).len())
        }
    }

    impl TokenCounter for TiktokenCounter {
        fn count(&self, prefix: &str, turns: &[Turn]) -> Result<u64> {
            let mut total = 0_u64;
            if !prefix.is_empty() {
                total += self.encode_len(prefix) + MESSAGE_OVERHEAD;
            }
            for turn in turns {
                total = total.saturating_add(self.encode_len(&turn.text()) + MESSAGE_OVERHEAD);
            }
            Ok(total)
        }
    }
}
