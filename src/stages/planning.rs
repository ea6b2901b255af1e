//! Whole-book planning ("architect") over every session of a user.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::Context as _;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::formats::{
    Anachronism, ChapterOutline, Fact, GlobalPlan, PlanStatus, QualityScores, Session,
    transition_key,
};
use crate::openai::{CompletionRequest, CompletionService, Message, ModelTier};
use crate::stages::{complete_critical, persistence};
use crate::store::BookStore;
use crate::structured::StructuredOutputError;

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    narrative_arc: String,
    #[serde(default)]
    themes: Vec<String>,
    #[serde(default)]
    tone: String,
    chapters_outline: Vec<RawOutline>,
    #[serde(default)]
    transitions_map: BTreeMap<String, String>,
    #[serde(default)]
    anachronisms: Vec<Anachronism>,
    #[serde(default)]
    quality_scores: Option<RawScores>,
}

#[derive(Debug, Deserialize)]
struct RawOutline {
    #[serde(default)]
    order: Option<u32>,
    title: String,
    #[serde(default)]
    age_range: String,
    #[serde(default)]
    narrative_goal: String,
    #[serde(default)]
    key_themes: Vec<String>,
    #[serde(default)]
    source_sessions: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawScores {
    #[serde(default)]
    chronological_coherence: Option<f64>,
    #[serde(default)]
    narrative_potential: Option<f64>,
}

#[derive(Debug, Serialize)]
struct PlanInputSession<'a> {
    session_id: &'a str,
    era: &'a str,
    topic: &'a str,
    summary: String,
    facts: Vec<&'a Fact>,
}

pub struct PlanningStage {
    store: Arc<dyn BookStore>,
    llm: Arc<dyn CompletionService>,
}

impl PlanningStage {
    pub fn new(store: Arc<dyn BookStore>, llm: Arc<dyn CompletionService>) -> Self {
        Self { store, llm }
    }

    /// The persisted plan, unless it is missing or flagged erroneous.
    pub async fn usable_plan(&self, user_id: &str) -> Result<Option<GlobalPlan>, PipelineError> {
        let plan = self.store.get_plan(user_id).await.map_err(persistence)?;
        Ok(plan.filter(|p| p.status == PlanStatus::Ready && !p.chapters_outline.is_empty()))
    }

    /// Builds and persists a fresh plan. `relaxed` accepts incomplete sessions
    /// as long as one of them has content.
    pub async fn plan(&self, user_id: &str, relaxed: bool) -> Result<GlobalPlan, PipelineError> {
        let sessions = self
            .store
            .list_sessions(user_id)
            .await
            .map_err(persistence)?;
        check_ready(&sessions, relaxed)?;

        let mut facts_by_session = Vec::with_capacity(sessions.len());
        for session in &sessions {
            let facts = self
                .store
                .list_facts(user_id, &session.session_id)
                .await
                .map_err(persistence)?;
            let summary = self
                .store
                .get_analysis(user_id, &session.session_id)
                .await
                .map_err(persistence)?
                .map(|a| a.summary_text)
                .unwrap_or_default();
            facts_by_session.push((facts, summary));
        }

        let inputs = sessions
            .iter()
            .zip(facts_by_session.iter())
            .map(|(session, (facts, summary))| PlanInputSession {
                session_id: &session.session_id,
                era: &session.era,
                topic: &session.topic,
                summary: summary.clone(),
                facts: facts.iter().collect(),
            })
            .collect::<Vec<_>>();
        let fact_count = inputs.iter().map(|s| s.facts.len()).sum::<usize>();

        tracing::info!(
            user_id,
            sessions = sessions.len(),
            facts = fact_count,
            relaxed,
            "planning book"
        );

        let raw: RawPlan = complete_critical(self.llm.as_ref(), plan_request(&inputs)?).await?;
        let known_sessions = sessions
            .iter()
            .map(|s| s.session_id.as_str())
            .collect::<HashSet<_>>();
        let plan = normalize_plan(raw, &known_sessions)?;

        self.store
            .put_plan(user_id, &plan)
            .await
            .map_err(persistence)?;
        tracing::info!(
            user_id,
            chapters = plan.total_chapters(),
            anachronisms = plan.anachronisms.len(),
            coherence = plan.quality_scores.chronological_coherence,
            "plan ready"
        );
        Ok(plan)
    }
}

fn check_ready(sessions: &[Session], relaxed: bool) -> Result<(), PipelineError> {
    if sessions.is_empty() {
        return Err(PipelineError::precondition("no interview sessions recorded"));
    }
    if relaxed {
        if sessions.iter().any(|s| s.has_content()) {
            return Ok(());
        }
        return Err(PipelineError::precondition(
            "no interview session has any content",
        ));
    }
    let open = sessions.iter().filter(|s| !s.complete).count();
    if open > 0 {
        return Err(PipelineError::precondition(format!(
            "{open} interview session(s) not yet complete"
        )));
    }
    Ok(())
}

fn plan_request(inputs: &[PlanInputSession<'_>]) -> Result<CompletionRequest, PipelineError> {
    let input_json = serde_json::to_string_pretty(inputs)
        .context("serialize plan input")
        .map_err(persistence)?;

    let instructions = "You are the architect of a first-person memoir.\n\
\n\
Task: Design the whole book from the interview material.\n\
\n\
Hard rules:\n\
- Use ONLY the provided facts and summaries.\n\
- Chapters need not follow the interview sessions; group material by story.\n\
- Number chapters from 1 in reading order.\n\
- `source_sessions` lists the session_id values whose facts feed each chapter.\n\
- `transitions_map` keys look like \"1->2\" and hold one sentence bridging the two chapters.\n\
- List every fact whose stated age or date contradicts the era it was told in under `anachronisms`.\n\
- `chronological_coherence` is 1.0 only when `anachronisms` is empty.\n\
\n\
Output:\n\
- Output ONLY a single JSON object.\n\
- Schema:\n\
  {\"narrative_arc\":\"...\",\"themes\":[\"...\"],\"tone\":\"...\",\
\"chapters_outline\":[{\"order\":1,\"title\":\"...\",\"age_range\":\"...\",\"narrative_goal\":\"...\",\
\"key_themes\":[\"...\"],\"source_sessions\":[\"...\"]}],\
\"transitions_map\":{\"1->2\":\"...\"},\
\"anachronisms\":[{\"fact\":\"...\",\"session_id\":\"...\",\"issue\":\"...\"}],\
\"quality_scores\":{\"chronological_coherence\":0.0,\"narrative_potential\":0.0}}\n";

    Ok(CompletionRequest {
        tier: ModelTier::Deep,
        messages: vec![
            Message::system(instructions),
            Message::user(format!(
                "BEGIN_PLAN_INPUT_JSON\n{}\nEND_PLAN_INPUT_JSON",
                input_json.trim_end()
            )),
        ],
        structured: true,
        temperature: 0.4,
    })
}

fn normalize_plan(
    raw: RawPlan,
    known_sessions: &HashSet<&str>,
) -> Result<GlobalPlan, PipelineError> {
    let mut outlines = raw
        .chapters_outline
        .into_iter()
        .filter(|o| !o.title.trim().is_empty())
        .enumerate()
        .map(|(idx, o)| (o.order.unwrap_or(u32::MAX), idx, o))
        .collect::<Vec<_>>();
    if outlines.is_empty() {
        return Err(StructuredOutputError::WrongShape {
            detail: "plan has no chapters".to_owned(),
        }
        .into());
    }
    // Stable on the model's listing order for ties and missing orders.
    outlines.sort_by_key(|(order, idx, _)| (*order, *idx));

    let mut renumbered = BTreeMap::new();
    let chapters_outline = outlines
        .into_iter()
        .enumerate()
        .map(|(idx, (raw_order, _, o))| {
            let order = idx as u32 + 1;
            if raw_order != u32::MAX {
                renumbered.insert(raw_order, order);
            }
            ChapterOutline {
                order,
                title: o.title.trim().to_owned(),
                age_range: o.age_range,
                narrative_goal: o.narrative_goal,
                key_themes: o.key_themes,
                source_sessions: o
                    .source_sessions
                    .into_iter()
                    .filter(|s| known_sessions.contains(s.as_str()))
                    .collect(),
            }
        })
        .collect::<Vec<_>>();
    let total = chapters_outline.len() as u32;

    let mut transitions_map = BTreeMap::new();
    for (key, text) in raw.transitions_map {
        let Some((from, to)) = parse_transition_key(&key) else {
            continue;
        };
        let (Some(&from), Some(&to)) = (renumbered.get(&from), renumbered.get(&to)) else {
            continue;
        };
        if to == from + 1 && to <= total && !text.trim().is_empty() {
            transitions_map.insert(transition_key(from, to), text.trim().to_owned());
        }
    }

    let scores = raw.quality_scores.unwrap_or_default();
    let quality_scores = QualityScores {
        chronological_coherence: coherence_score(
            scores.chronological_coherence,
            raw.anachronisms.is_empty(),
        ),
        narrative_potential: unit(scores.narrative_potential.unwrap_or(0.5)),
    };

    Ok(GlobalPlan {
        narrative_arc: raw.narrative_arc,
        themes: raw.themes,
        tone: raw.tone,
        chapters_outline,
        transitions_map,
        anachronisms: raw.anachronisms,
        quality_scores,
        status: PlanStatus::Ready,
        created_at: Utc::now(),
    })
}

fn parse_transition_key(key: &str) -> Option<(u32, u32)> {
    let (from, to) = key.split_once("->")?;
    Some((from.trim().parse().ok()?, to.trim().parse().ok()?))
}

/// 1.0 exactly when nothing was flagged, and below 1.0 otherwise.
fn coherence_score(reported: Option<f64>, no_anachronisms: bool) -> f64 {
    if no_anachronisms {
        return 1.0;
    }
    unit(reported.unwrap_or(0.5)).min(0.99)
}

fn unit(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}
