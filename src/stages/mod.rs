//! The model-backed pipeline stages.
//!
//! Each stage owns handles to the store and the completion service, reads its
//! inputs from the store, and persists its primary artifact before returning.

pub mod briefing;
pub mod drafting;
pub mod extraction;
pub mod planning;

use serde::de::DeserializeOwned;

use crate::error::PipelineError;
use crate::openai::{CompletionRequest, CompletionService};
use crate::structured;

/// Characters of the preceding chapter handed to the next one for continuity.
pub const PREVIOUS_TAIL_CHARS: usize = 1500;

const MAX_PARTIAL_WORD_BYTES: usize = 40;

/// Calls the model and decodes a shape the caller cannot do without.
pub(crate) async fn complete_critical<T: DeserializeOwned>(
    llm: &dyn CompletionService,
    request: CompletionRequest,
) -> Result<T, PipelineError> {
    let raw = llm
        .complete(request)
        .await
        .map_err(PipelineError::Completion)?;
    Ok(structured::decode(&raw)?)
}

/// Last `max_chars` characters of `content`, starting on a word boundary when
/// one is available.
pub fn tail_excerpt(content: &str, max_chars: usize) -> String {
    let total = content.chars().count();
    if total <= max_chars {
        return content.trim().to_owned();
    }
    let skip = total - max_chars;
    let start = content
        .char_indices()
        .nth(skip)
        .map(|(idx, _)| idx)
        .unwrap_or(content.len());
    let tail = &content[start..];
    let starts_mid_word = !content[..start].ends_with(char::is_whitespace);
    let tail = match tail.find(char::is_whitespace) {
        Some(ws) if starts_mid_word && ws < MAX_PARTIAL_WORD_BYTES => &tail[ws..],
        _ => tail,
    };
    tail.trim().to_owned()
}

pub(crate) fn persistence(err: anyhow::Error) -> PipelineError {
    PipelineError::Persistence(err)
}
