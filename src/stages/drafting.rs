//! Chapter prose from a committed brief.

use std::sync::Arc;

use anyhow::Context as _;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::formats::{Chapter, ChapterBrief};
use crate::openai::{CompletionRequest, CompletionService, Message, ModelTier};
use crate::stages::briefing::previous_chapter_tail;
use crate::stages::{complete_critical, persistence};
use crate::store::BookStore;
use crate::structured::StructuredOutputError;

#[derive(Debug, Deserialize)]
struct RawChapter {
    #[serde(default)]
    title: Option<String>,
    content: String,
    #[serde(default)]
    word_count: Option<u32>,
    #[serde(default)]
    facts_integrated_count: u32,
}

#[derive(Debug, Serialize)]
struct DraftInput<'a> {
    brief: &'a ChapterBrief,
    previous_chapter_tail: Option<String>,
}

pub struct DraftingStage {
    store: Arc<dyn BookStore>,
    llm: Arc<dyn CompletionService>,
}

impl DraftingStage {
    pub fn new(store: Arc<dyn BookStore>, llm: Arc<dyn CompletionService>) -> Self {
        Self { store, llm }
    }

    pub async fn draft(&self, user_id: &str, chapter_order: u32) -> Result<Chapter, PipelineError> {
        let brief = self
            .store
            .list_briefs(user_id)
            .await
            .map_err(persistence)?
            .into_iter()
            .find(|b| b.chapter_order == chapter_order)
            .ok_or_else(|| {
                PipelineError::precondition(format!("brief for chapter {chapter_order}"))
            })?;
        let previous_tail =
            previous_chapter_tail(self.store.as_ref(), user_id, chapter_order).await?;

        tracing::info!(
            user_id,
            chapter_order,
            target_length = brief.target_length,
            facts = brief.facts_to_integrate.len(),
            "drafting chapter"
        );

        let request = draft_request(&brief, previous_tail)?;
        let raw: RawChapter = complete_critical(self.llm.as_ref(), request).await?;
        let chapter = finalize_chapter(raw, &brief)?;

        self.store
            .put_chapter(user_id, &chapter)
            .await
            .map_err(persistence)?;
        tracing::info!(
            user_id,
            chapter_order,
            words = chapter.word_count,
            facts_integrated = chapter.facts_integrated_count,
            "chapter committed"
        );
        Ok(chapter)
    }
}

fn draft_request(
    brief: &ChapterBrief,
    previous_chapter_tail: Option<String>,
) -> Result<CompletionRequest, PipelineError> {
    let input = DraftInput {
        brief,
        previous_chapter_tail,
    };
    let input_json = serde_json::to_string_pretty(&input)
        .context("serialize draft input")
        .map_err(persistence)?;

    let instructions = "You are ghost-writing a memoir in the narrator's own voice.\n\
\n\
Task: Write ONE chapter following the brief.\n\
\n\
Hard rules:\n\
- Write in the first person.\n\
- Integrate EVERY entry of `facts_to_integrate`.\n\
- Reproduce names, places, and dates exactly as given. Do not invent new ones.\n\
- Match the register of `previous_chapter_tail` when present.\n\
- Aim for `target_length` words.\n\
\n\
Output:\n\
- Output ONLY a single JSON object.\n\
- Schema:\n\
  {\"title\":\"...\",\"content\":\"...\",\"word_count\":0,\"facts_integrated_count\":0}\n\
- `word_count` and `facts_integrated_count` describe the content you wrote.\n";

    Ok(CompletionRequest {
        tier: ModelTier::Deep,
        messages: vec![
            Message::system(instructions),
            Message::user(format!(
                "BEGIN_DRAFT_INPUT_JSON\n{}\nEND_DRAFT_INPUT_JSON",
                input_json.trim_end()
            )),
        ],
        structured: true,
        temperature: 0.7,
    })
}

fn finalize_chapter(raw: RawChapter, brief: &ChapterBrief) -> Result<Chapter, PipelineError> {
    let content = raw.content.trim();
    if content.is_empty() {
        return Err(StructuredOutputError::WrongShape {
            detail: format!("chapter {} has empty content", brief.chapter_order),
        }
        .into());
    }
    // Counts are self-reported; only fill in a missing word count.
    let word_count = raw
        .word_count
        .unwrap_or_else(|| content.split_whitespace().count() as u32);

    Ok(Chapter {
        chapter_order: brief.chapter_order,
        title: raw
            .title
            .map(|t| t.trim().to_owned())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| brief.title.clone()),
        content: content.to_owned(),
        word_count,
        facts_integrated_count: raw.facts_integrated_count,
        committed_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::testing::ScriptedLlm;
    use crate::store::LocalFsBookStore;

    fn brief(order: u32) -> ChapterBrief {
        ChapterBrief {
            chapter_order: order,
            title: format!("Chapter {order}"),
            narrative_instructions: "Tell it plainly.".to_owned(),
            transition_in: String::new(),
            transition_out: String::new(),
            style_notes: String::new(),
            facts_to_integrate: vec!["Lyon".to_owned()],
            structure_suggestion: String::new(),
            target_length: 800,
            emotional_tone: "nostalgic".to_owned(),
        }
    }

    #[tokio::test]
    async fn drafting_without_brief_is_a_precondition_error() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let store = Arc::new(LocalFsBookStore::new(temp.path()));
        let stage = DraftingStage::new(store, Arc::new(ScriptedLlm::default()));

        let err = stage.draft("u1", 2).await.unwrap_err();
        assert_eq!(err.to_string(), "missing prerequisite: brief for chapter 2");
        Ok(())
    }

    #[tokio::test]
    async fn draft_persists_self_reported_counts() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let store = Arc::new(LocalFsBookStore::new(temp.path()));
        store.upsert_brief("u1", &brief(1)).await?;
        let llm = Arc::new(ScriptedLlm::new([
            "```json\n{\"content\":\"I was born in Lyon.\",\"word_count\":999,\"facts_integrated_count\":1}\n```",
        ]));
        let stage = DraftingStage::new(store.clone(), llm);

        let chapter = stage.draft("u1", 1).await?;
        assert_eq!(chapter.title, "Chapter 1");
        assert_eq!(chapter.word_count, 999);
        assert_eq!(chapter.facts_integrated_count, 1);

        let stored = store.get_chapter("u1", 1).await?.expect("committed chapter");
        assert_eq!(stored.content, "I was born in Lyon.");
        Ok(())
    }

    #[tokio::test]
    async fn empty_or_malformed_chapter_is_not_committed() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let store = Arc::new(LocalFsBookStore::new(temp.path()));
        store.upsert_brief("u1", &brief(1)).await?;
        let llm = Arc::new(ScriptedLlm::new([r#"{"content":"   "}"#, "Once upon a time"]));
        let stage = DraftingStage::new(store.clone(), llm);

        let err = stage.draft("u1", 1).await.unwrap_err();
        assert!(matches!(err, PipelineError::UpstreamFormat(_)));
        let err = stage.draft("u1", 1).await.unwrap_err();
        assert!(matches!(err, PipelineError::UpstreamFormat(_)));
        assert!(store.get_chapter("u1", 1).await?.is_none());
        Ok(())
    }

    #[test]
    fn missing_word_count_is_counted_from_content() -> anyhow::Result<()> {
        let raw = RawChapter {
            title: Some("  ".to_owned()),
            content: "one two  three".to_owned(),
            word_count: None,
            facts_integrated_count: 0,
        };
        let chapter = finalize_chapter(raw, &brief(3))?;
        assert_eq!(chapter.word_count, 3);
        assert_eq!(chapter.title, "Chapter 3");
        Ok(())
    }
}
