//! Summarization prompt and the delegated summarizer contract.

use std::future::Future;
use std::pin::Pin;

use tracing::warn;

use crate::models::turn::Turn;
use crate::Result;

/// Marker appended to a prompt that was cut to its size cap.
pub const TRUNCATION_MARKER: &str = "\n\n[Content truncated...]";

const PROMPT_HEADER: &str = "Please provide a concise summary of the following conversation history.\n\
Focus on key points, decisions, and context that would be important for continuing the conversation.\n\
Do not include every detail, but preserve important information that might be referenced later.\n\
\n\
Conversation history to summarize:\n";

/// Characters per token assumed when trimming the prompt.
const TRIM_CHARS_PER_TOKEN: u64 = 4;

/// Produces summary text for a rendered conversation prefix.
pub trait Summarizer: Send + Sync {
    /// Summarize `prompt`.
    ///
    /// # Errors
    ///
    /// Any error aborts the compression; the history is left unchanged.
    fn summarize<'a>(
        &'a self,
        prompt: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;
}

/// Render the summarization prompt for `turns`.
///
/// Turns with no text are skipped. When `trim_tokens` is non-zero the prompt
/// is cut to `4 * trim_tokens` characters and marked as truncated.
#[must_use]
pub fn summary_prompt(turns: &[Turn], trim_tokens: u64) -> String {
    let body = turns
        .iter()
        .filter_map(|turn| {
            let text = turn.text();
            (!text.is_empty()).then(|| format!("{}: {text}", turn.role.label()))
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    let prompt = format!("{PROMPT_HEADER}{body}");

    if trim_tokens == 0 {
        return prompt;
    }
    let max_chars = usize::try_from(trim_tokens.saturating_mul(TRIM_CHARS_PER_TOKEN))
        .unwrap_or(usize::MAX);
    match prompt.char_indices().nth(max_chars) {
        Some((cut, _)) => {
            warn!(
                chars = prompt.chars().count(),
                max_chars, "trimming summarization prompt"
            );
            format!("{}{TRUNCATION_MARKER}", &prompt[..cut])
        }
        None => prompt,
    }
}
