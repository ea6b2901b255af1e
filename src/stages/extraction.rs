//! Fact extraction ("analyst") over the newest turns of one session.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::formats::{
    AnalysisResult, BonusTopic, BonusTopicStatus, Fact, FactCategory, Session, Utterance,
};
use crate::glossary;
use crate::openai::{CompletionRequest, CompletionService, Message, ModelTier};
use crate::stages::persistence;
use crate::store::BookStore;
use crate::structured;

pub const UTTERANCE_WINDOW: usize = 12;
/// Sessions with more analysis passes than this blend densities instead of replacing them.
pub const DENSITY_BLEND_AFTER_PASSES: u32 = 3;
pub const DENSITY_PRIOR_WEIGHT: f64 = 0.7;

pub const BONUS_MIN_CANDIDATE_FACTS: usize = 3;
pub const BONUS_MIN_FACT_CHARS: usize = 12;
pub const BONUS_MIN_RELEVANCE: f64 = 0.85;
/// Overlap ratio above which a proposed topic duplicates an existing one.
pub const DUPLICATE_OVERLAP: f64 = 0.5;

#[derive(Debug, Clone, Serialize)]
pub struct ExtractionOutcome {
    pub facts_added: usize,
    pub density_score: f64,
    pub bonus_topic: Option<BonusTopic>,
}

#[derive(Debug, Default, Deserialize)]
struct AnalystOutput {
    #[serde(default)]
    facts: Vec<RawFact>,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    density_score: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawFact {
    category: String,
    value: String,
    #[serde(default)]
    context: String,
}

#[derive(Debug, Default, Deserialize)]
struct BonusOutput {
    #[serde(default)]
    topics: Vec<BonusCandidate>,
}

#[derive(Debug, Clone, Deserialize)]
struct BonusCandidate {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    keywords: Vec<String>,
    relevance_score: f64,
}

#[derive(Debug, Serialize)]
struct AnalystInput<'a> {
    era: &'a str,
    topic: &'a str,
    utterances: Vec<&'a str>,
}

/// One async lock per user. Entries are dropped once nobody holds or waits
/// on them.
#[derive(Default)]
struct UserLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

struct UserGuard<'a> {
    locks: &'a UserLocks,
    user_id: String,
    lock: Arc<tokio::sync::Mutex<()>>,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl UserLocks {
    async fn lock(&self, user_id: &str) -> UserGuard<'_> {
        let lock = {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            inner.entry(user_id.to_owned()).or_default().clone()
        };
        let guard = lock.clone().lock_owned().await;
        UserGuard {
            locks: self,
            user_id: user_id.to_owned(),
            lock,
            guard: Some(guard),
        }
    }
}

impl Drop for UserGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut inner = self.locks.inner.lock().unwrap_or_else(|p| p.into_inner());
        // The map and this guard hold the only references: nobody is waiting.
        if Arc::strong_count(&self.lock) == 2 {
            inner.remove(&self.user_id);
        }
    }
}

/// Analyst pass over one session. Runs for the same user are serialized:
/// the analysis, facts, glossary and bonus topics are all read-modify-write.
pub struct FactExtractionStage {
    store: Arc<dyn BookStore>,
    llm: Arc<dyn CompletionService>,
    locks: UserLocks,
}

impl FactExtractionStage {
    pub fn new(store: Arc<dyn BookStore>, llm: Arc<dyn CompletionService>) -> Self {
        Self {
            store,
            llm,
            locks: UserLocks::default(),
        }
    }

    pub async fn run(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<ExtractionOutcome, PipelineError> {
        let _guard = self.locks.lock(user_id).await;
        self.run_locked(user_id, session_id).await
    }

    async fn run_locked(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<ExtractionOutcome, PipelineError> {
        let session = self
            .store
            .get_session(user_id, session_id)
            .await
            .map_err(persistence)?
            .ok_or_else(|| PipelineError::precondition(format!("session {session_id} not found")))?;
        let prior = self
            .store
            .get_analysis(user_id, session_id)
            .await
            .map_err(persistence)?;

        let utterances = recent_utterances(&session.utterances, UTTERANCE_WINDOW);
        if utterances.is_empty() {
            tracing::debug!(user_id, session_id, "no utterances to analyse");
            return Ok(ExtractionOutcome {
                facts_added: 0,
                density_score: prior.map(|p| p.density_score).unwrap_or(0.0),
                bonus_topic: None,
            });
        }

        let corpus = utterances
            .iter()
            .map(|u| u.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let raw = self
            .llm
            .complete(analyst_request(&session, &utterances)?)
            .await
            .map_err(PipelineError::Completion)?;
        let output: AnalystOutput = structured::decode_or_default(&raw, "analyst");

        let known = self
            .store
            .list_facts(user_id, session_id)
            .await
            .map_err(persistence)?;
        let facts = new_facts(
            &known,
            accept_facts(user_id, session_id, output.facts, &corpus),
        );
        self.store
            .append_facts(user_id, session_id, &facts)
            .await
            .map_err(persistence)?;

        let analysis = next_analysis(prior.as_ref(), &output.summary, output.density_score);
        self.store
            .put_analysis(user_id, session_id, &analysis)
            .await
            .map_err(persistence)?;

        tracing::info!(
            user_id,
            session_id,
            facts = facts.len(),
            density = analysis.density_score,
            passes = analysis.passes,
            "analysis pass complete"
        );

        self.update_glossary(user_id, &facts).await;
        let bonus_topic = self.propose_bonus_topic(user_id, session_id, &facts).await;

        Ok(ExtractionOutcome {
            facts_added: facts.len(),
            density_score: analysis.density_score,
            bonus_topic,
        })
    }

    async fn update_glossary(&self, user_id: &str, facts: &[Fact]) {
        let names = facts
            .iter()
            .filter(|f| f.category.is_proper_name())
            .map(|f| f.value.clone())
            .collect::<Vec<_>>();
        if names.is_empty() {
            return;
        }
        let result = async {
            let existing = self.store.get_glossary(user_id).await?;
            let merged = glossary::merge_entries(existing, names, glossary::GLOSSARY_CHAR_BUDGET);
            self.store.put_glossary(user_id, &merged).await
        }
        .await;
        if let Err(err) = result {
            tracing::warn!(user_id, ?err, "glossary update failed");
        }
    }

    async fn propose_bonus_topic(
        &self,
        user_id: &str,
        session_id: &str,
        facts: &[Fact],
    ) -> Option<BonusTopic> {
        if !passes_bonus_prefilter(facts) {
            return None;
        }

        let raw = match self.llm.complete(bonus_request(facts).ok()?).await {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(user_id, session_id, ?err, "bonus topic classification failed");
                return None;
            }
        };
        let output: BonusOutput = structured::decode_or_default(&raw, "bonus topics");

        let existing = match self.store.list_bonus_topics(user_id).await {
            Ok(existing) => existing,
            Err(err) => {
                tracing::warn!(user_id, ?err, "cannot load bonus topics; skipping proposal");
                return None;
            }
        };

        let mut candidates = output
            .topics
            .into_iter()
            .filter(|c| c.relevance_score >= BONUS_MIN_RELEVANCE && !c.title.trim().is_empty())
            .collect::<Vec<_>>();
        candidates.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));

        let chosen = candidates
            .into_iter()
            .find(|c| !is_duplicate_topic(&c.title, &c.keywords, &existing))?;

        let topic = BonusTopic {
            title: chosen.title.trim().to_owned(),
            description: chosen.description,
            category: chosen.category,
            keywords: chosen.keywords,
            origin_session: session_id.to_owned(),
            status: BonusTopicStatus::Proposed,
            created_at: Utc::now(),
        };
        if let Err(err) = self.store.add_bonus_topic(user_id, &topic).await {
            tracing::warn!(user_id, ?err, "failed to persist bonus topic");
            return None;
        }
        tracing::info!(user_id, session_id, title = %topic.title, "bonus topic proposed");
        Some(topic)
    }
}

/// Newest `window` non-empty utterances, in chronological order.
fn recent_utterances(utterances: &[Utterance], window: usize) -> Vec<&Utterance> {
    let mut recent = utterances
        .iter()
        .rev()
        .filter(|u| !u.text.trim().is_empty())
        .take(window)
        .collect::<Vec<_>>();
    recent.reverse();
    recent
}

fn analyst_request(
    session: &Session,
    utterances: &[&Utterance],
) -> Result<CompletionRequest, PipelineError> {
    let input = AnalystInput {
        era: &session.era,
        topic: &session.topic,
        utterances: utterances.iter().map(|u| u.text.as_str()).collect(),
    };
    let input_json = serde_json::to_string_pretty(&input)
        .context("serialize analyst input")
        .map_err(persistence)?;
    let categories = FactCategory::ALL
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    let instructions = format!(
        "You are a biographer's analyst.\n\
\n\
Task: Extract verifiable facts from what the narrator said.\n\
\n\
Hard rules:\n\
- Use ONLY what the narrator said. Do not infer or invent facts.\n\
- Each fact has exactly one category, one of: {categories}.\n\
- `summary` is two or three sentences about the new material only.\n\
- `density_score` is a number from 0 to 1 rating how rich in concrete detail the text is.\n\
\n\
Output:\n\
- Output ONLY a single JSON object (no commentary).\n\
- Schema:\n\
  {{\"facts\":[{{\"category\":\"...\",\"value\":\"...\",\"context\":\"...\"}}],\"summary\":\"...\",\"density_score\":0.0}}\n"
    );

    Ok(CompletionRequest {
        tier: ModelTier::Fast,
        messages: vec![
            Message::system(instructions),
            Message::user(format!(
                "BEGIN_ANALYST_INPUT_JSON\n{}\nEND_ANALYST_INPUT_JSON",
                input_json.trim_end()
            )),
        ],
        structured: true,
        temperature: 0.2,
    })
}

fn bonus_request(facts: &[Fact]) -> anyhow::Result<CompletionRequest> {
    let items = facts
        .iter()
        .map(|f| serde_json::json!({ "category": f.category, "value": f.value, "context": f.context }))
        .collect::<Vec<_>>();
    let input_json = serde_json::to_string_pretty(&items).context("serialize bonus input")?;

    Ok(CompletionRequest {
        tier: ModelTier::Fast,
        messages: vec![
            Message::system(
                "You are a memoir editor.\n\
\n\
Task: Decide whether these facts reveal an exceptional story that deserves its own \
bonus chapter outside the chronological narrative.\n\
\n\
Output:\n\
- Output ONLY a single JSON object.\n\
- Schema:\n\
  {\"topics\":[{\"title\":\"...\",\"description\":\"...\",\"category\":\"...\",\"keywords\":[\"...\"],\"relevance_score\":0.0}]}\n\
- Return an empty `topics` array when nothing stands out.\n",
            ),
            Message::user(format!(
                "BEGIN_BONUS_INPUT_JSON\n{}\nEND_BONUS_INPUT_JSON",
                input_json.trim_end()
            )),
        ],
        structured: true,
        temperature: 0.3,
    })
}

fn accept_facts(user_id: &str, session_id: &str, raw: Vec<RawFact>, corpus: &str) -> Vec<Fact> {
    let corpus = corpus.to_lowercase();
    let mut facts = Vec::new();
    for item in raw {
        let value = item.value.trim();
        if value.is_empty() {
            continue;
        }
        let category = match item.category.parse::<FactCategory>() {
            Ok(category) => category,
            Err(_) => {
                tracing::debug!(category = %item.category, "dropping fact with unknown category");
                continue;
            }
        };
        if !is_grounded(value, &corpus) {
            tracing::debug!(value, "dropping fact absent from the narrator's words");
            continue;
        }
        facts.push(Fact {
            owner: user_id.to_owned(),
            source_session: session_id.to_owned(),
            category,
            value: value.to_owned(),
            context: item.context.trim().to_owned(),
        });
    }
    facts
}

/// Drops facts already stored for the session, or repeated in the batch,
/// matching on category and case-insensitive value. A rerun after a partial
/// write therefore appends nothing twice.
fn new_facts(known: &[Fact], candidates: Vec<Fact>) -> Vec<Fact> {
    let mut seen = known.iter().map(fact_key).collect::<HashSet<_>>();
    candidates
        .into_iter()
        .filter(|f| seen.insert(fact_key(f)))
        .collect()
}

fn fact_key(fact: &Fact) -> (FactCategory, String) {
    (fact.category, fact.value.trim().to_lowercase())
}

/// A fact is grounded when one of its significant words occurs in the input.
fn is_grounded(value: &str, lowercase_corpus: &str) -> bool {
    let value = value.to_lowercase();
    let mut significant = value
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3 || w.chars().all(|c| c.is_ascii_digit()))
        .filter(|w| !w.is_empty())
        .peekable();
    if significant.peek().is_none() {
        return lowercase_corpus.contains(value.trim());
    }
    significant.any(|w| lowercase_corpus.contains(w))
}

fn next_analysis(
    prior: Option<&AnalysisResult>,
    new_summary: &str,
    new_density: Option<f64>,
) -> AnalysisResult {
    let passes = prior.map(|p| p.passes).unwrap_or(0);

    let density_score = match new_density {
        Some(new) => blend_density(prior.map(|p| (p.density_score, p.passes)), new),
        None => prior.map(|p| p.density_score).unwrap_or(0.0),
    };

    let mut summary_text = prior.map(|p| p.summary_text.clone()).unwrap_or_default();
    let new_summary = new_summary.trim();
    if !new_summary.is_empty() {
        if !summary_text.is_empty() {
            summary_text.push_str("\n\n");
        }
        summary_text.push_str(new_summary);
    }

    AnalysisResult {
        summary_text,
        density_score,
        passes: passes + 1,
    }
}

/// Blends a new density with the prior one once the session is mature.
/// `prior` is `(density, passes)`.
pub fn blend_density(prior: Option<(f64, u32)>, new: f64) -> f64 {
    let new = clamp_unit(new);
    let blended = match prior {
        Some((prior_density, passes)) if passes > DENSITY_BLEND_AFTER_PASSES => {
            prior_density * DENSITY_PRIOR_WEIGHT + new * (1.0 - DENSITY_PRIOR_WEIGHT)
        }
        _ => new,
    };
    clamp_unit(blended)
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

/// Cheap gate before the bonus-topic classification call.
pub fn passes_bonus_prefilter(facts: &[Fact]) -> bool {
    facts
        .iter()
        .filter(|f| matches!(f.category, FactCategory::Event | FactCategory::Activity))
        .filter(|f| f.value.trim().chars().count() >= BONUS_MIN_FACT_CHARS)
        .count()
        >= BONUS_MIN_CANDIDATE_FACTS
}

pub fn is_duplicate_topic(title: &str, keywords: &[String], existing: &[BonusTopic]) -> bool {
    let new_title = title_tokens(title);
    let new_keywords = keyword_set(keywords);
    existing.iter().any(|topic| {
        overlap(&new_title, &title_tokens(&topic.title)) > DUPLICATE_OVERLAP
            || overlap(&new_keywords, &keyword_set(&topic.keywords)) > DUPLICATE_OVERLAP
    })
}

fn title_tokens(title: &str) -> HashSet<String> {
    title
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 3)
        .map(str::to_owned)
        .collect()
}

fn keyword_set(keywords: &[String]) -> HashSet<String> {
    keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect()
}

/// Share of `new` found in `existing`.
fn overlap(new: &HashSet<String>, existing: &HashSet<String>) -> f64 {
    if new.is_empty() {
        return 0.0;
    }
    let shared = new.intersection(existing).count();
    shared as f64 / new.len() as f64
}
