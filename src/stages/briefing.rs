//! Per-chapter writing brief derived from the plan.

use std::sync::Arc;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::formats::{ChapterBrief, ChapterOutline, Fact, GlobalPlan, PlanStatus};
use crate::openai::{CompletionRequest, CompletionService, Message, ModelTier};
use crate::stages::{PREVIOUS_TAIL_CHARS, complete_critical, persistence, tail_excerpt};
use crate::store::BookStore;

pub const DEFAULT_TARGET_LENGTH: u32 = 1500;
pub const MIN_TARGET_LENGTH: u32 = 300;
pub const MAX_TARGET_LENGTH: u32 = 6000;

#[derive(Debug, Deserialize)]
struct RawBrief {
    #[serde(default)]
    title: Option<String>,
    narrative_instructions: String,
    #[serde(default)]
    transition_in: String,
    #[serde(default)]
    transition_out: String,
    #[serde(default)]
    style_notes: String,
    #[serde(default)]
    facts_to_integrate: Vec<String>,
    #[serde(default)]
    structure_suggestion: String,
    #[serde(default)]
    target_length: Option<u32>,
    #[serde(default)]
    emotional_tone: String,
}

#[derive(Debug, Serialize)]
struct BriefInput<'a> {
    chapter: &'a ChapterOutline,
    total_chapters: u32,
    narrative_arc: &'a str,
    tone: &'a str,
    transition_in: Option<&'a str>,
    transition_out: Option<&'a str>,
    facts: Vec<FactLine<'a>>,
    previous_chapter_tail: Option<String>,
}

#[derive(Debug, Serialize)]
struct FactLine<'a> {
    category: &'a str,
    value: &'a str,
    context: &'a str,
}

pub struct BriefingStage {
    store: Arc<dyn BookStore>,
    llm: Arc<dyn CompletionService>,
}

impl BriefingStage {
    pub fn new(store: Arc<dyn BookStore>, llm: Arc<dyn CompletionService>) -> Self {
        Self { store, llm }
    }

    pub async fn brief(
        &self,
        user_id: &str,
        chapter_order: u32,
    ) -> Result<ChapterBrief, PipelineError> {
        let plan = self
            .store
            .get_plan(user_id)
            .await
            .map_err(persistence)?
            .ok_or_else(|| PipelineError::precondition("no book plan exists yet"))?;
        if plan.status == PlanStatus::Erroneous {
            return Err(PipelineError::precondition(
                "book plan is flagged erroneous; discard it and plan again",
            ));
        }
        let outline = plan.outline(chapter_order).ok_or_else(|| {
            PipelineError::precondition(format!("plan has no chapter {chapter_order}"))
        })?;

        let previous_tail =
            previous_chapter_tail(self.store.as_ref(), user_id, chapter_order).await?;
        let facts = self.chapter_facts(user_id, outline).await?;

        tracing::info!(
            user_id,
            chapter_order,
            facts = facts.len(),
            "briefing chapter"
        );

        let request = brief_request(&plan, outline, &facts, previous_tail)?;
        let raw: RawBrief = complete_critical(self.llm.as_ref(), request).await?;
        let brief = finalize_brief(raw, &plan, outline, &facts);

        self.store
            .upsert_brief(user_id, &brief)
            .await
            .map_err(persistence)?;
        Ok(brief)
    }

    async fn chapter_facts(
        &self,
        user_id: &str,
        outline: &ChapterOutline,
    ) -> Result<Vec<Fact>, PipelineError> {
        let mut facts = Vec::new();
        for session_id in &outline.source_sessions {
            let mut session_facts = self
                .store
                .list_facts(user_id, session_id)
                .await
                .map_err(persistence)?;
            facts.append(&mut session_facts);
        }
        Ok(facts)
    }
}

/// Tail of chapter `chapter_order - 1`. Fails when that chapter should exist
/// but has not been committed.
pub(crate) async fn previous_chapter_tail(
    store: &dyn BookStore,
    user_id: &str,
    chapter_order: u32,
) -> Result<Option<String>, PipelineError> {
    if chapter_order <= 1 {
        return Ok(None);
    }
    let previous = chapter_order - 1;
    let chapter = store
        .get_chapter(user_id, previous)
        .await
        .map_err(persistence)?
        .ok_or_else(|| {
            PipelineError::precondition(format!(
                "chapter {previous} must be written before chapter {chapter_order}"
            ))
        })?;
    Ok(Some(tail_excerpt(&chapter.content, PREVIOUS_TAIL_CHARS)))
}

fn brief_request(
    plan: &GlobalPlan,
    outline: &ChapterOutline,
    facts: &[Fact],
    previous_chapter_tail: Option<String>,
) -> Result<CompletionRequest, PipelineError> {
    let order = outline.order;
    let input = BriefInput {
        chapter: outline,
        total_chapters: plan.total_chapters(),
        narrative_arc: &plan.narrative_arc,
        tone: &plan.tone,
        transition_in: order.checked_sub(1).and_then(|prev| plan.transition(prev, order)),
        transition_out: plan.transition(order, order + 1),
        facts: facts
            .iter()
            .map(|f| FactLine {
                category: f.category.as_str(),
                value: &f.value,
                context: &f.context,
            })
            .collect(),
        previous_chapter_tail,
    };
    let input_json = serde_json::to_string_pretty(&input)
        .context("serialize brief input")
        .map_err(persistence)?;

    let instructions = "You are a memoir editor preparing a writer's brief.\n\
\n\
Task: Write instructions for ONE chapter. Do NOT write the chapter itself.\n\
\n\
Hard rules:\n\
- No prose for the book; only instructions, transition phrasing, and fact placement.\n\
- `facts_to_integrate` must list EVERY provided fact value, verbatim.\n\
- Keep continuity with `previous_chapter_tail` when present.\n\
- `target_length` is a word count.\n\
\n\
Output:\n\
- Output ONLY a single JSON object.\n\
- Schema:\n\
  {\"title\":\"...\",\"narrative_instructions\":\"...\",\"transition_in\":\"...\",\"transition_out\":\"...\",\
\"style_notes\":\"...\",\"facts_to_integrate\":[\"...\"],\"structure_suggestion\":\"...\",\
\"target_length\":1500,\"emotional_tone\":\"...\"}\n";

    Ok(CompletionRequest {
        tier: ModelTier::Deep,
        messages: vec![
            Message::system(instructions),
            Message::user(format!(
                "BEGIN_BRIEF_INPUT_JSON\n{}\nEND_BRIEF_INPUT_JSON",
                input_json.trim_end()
            )),
        ],
        structured: true,
        temperature: 0.4,
    })
}

fn finalize_brief(
    raw: RawBrief,
    plan: &GlobalPlan,
    outline: &ChapterOutline,
    facts: &[Fact],
) -> ChapterBrief {
    let order = outline.order;
    let or_plan = |text: String, fallback: Option<&str>| {
        if text.trim().is_empty() {
            fallback.unwrap_or_default().to_owned()
        } else {
            text.trim().to_owned()
        }
    };

    let transition_in = or_plan(
        raw.transition_in,
        order.checked_sub(1).and_then(|prev| plan.transition(prev, order)),
    );
    let transition_out = or_plan(raw.transition_out, plan.transition(order, order + 1));

    ChapterBrief {
        chapter_order: order,
        title: raw
            .title
            .map(|t| t.trim().to_owned())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| outline.title.clone()),
        narrative_instructions: raw.narrative_instructions.trim().to_owned(),
        transition_in,
        transition_out,
        style_notes: raw.style_notes,
        facts_to_integrate: cover_all_facts(raw.facts_to_integrate, facts),
        structure_suggestion: raw.structure_suggestion,
        target_length: raw
            .target_length
            .unwrap_or(DEFAULT_TARGET_LENGTH)
            .clamp(MIN_TARGET_LENGTH, MAX_TARGET_LENGTH),
        emotional_tone: raw.emotional_tone,
    }
}

/// Keeps the model's entries and appends every fact none of them mentions.
fn cover_all_facts(listed: Vec<String>, facts: &[Fact]) -> Vec<String> {
    let mut entries = listed
        .into_iter()
        .map(|e| e.trim().to_owned())
        .filter(|e| !e.is_empty())
        .collect::<Vec<_>>();
    let entry_words = entries.iter().map(|e| words(e)).collect::<Vec<_>>();

    for fact in facts {
        let needle = words(&fact.value);
        let mentioned = !needle.is_empty()
            && entry_words
                .iter()
                .any(|e| e.windows(needle.len()).any(|w| w == needle.as_slice()));
        let already_added = entries.iter().any(|e| e.eq_ignore_ascii_case(&fact.value));
        if !mentioned && !already_added {
            entries.push(fact.value.clone());
        }
    }
    entries
}

/// Lowercase alphanumeric words, so matches land on word boundaries.
fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}
