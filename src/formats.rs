use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub user_id: String,
    pub endpoint: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Account {
    pub user_id: String,
    pub paid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactCategory {
    Person,
    Place,
    Date,
    Event,
    Activity,
    Object,
    Emotion,
    Relation,
}

impl FactCategory {
    pub const ALL: [FactCategory; 8] = [
        FactCategory::Person,
        FactCategory::Place,
        FactCategory::Date,
        FactCategory::Event,
        FactCategory::Activity,
        FactCategory::Object,
        FactCategory::Emotion,
        FactCategory::Relation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FactCategory::Person => "person",
            FactCategory::Place => "place",
            FactCategory::Date => "date",
            FactCategory::Event => "event",
            FactCategory::Activity => "activity",
            FactCategory::Object => "object",
            FactCategory::Emotion => "emotion",
            FactCategory::Relation => "relation",
        }
    }

    /// Categories that name something a transcriber should spell consistently.
    pub fn is_proper_name(self) -> bool {
        matches!(self, FactCategory::Person | FactCategory::Place)
    }
}

impl fmt::Display for FactCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FactCategory {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        FactCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| anyhow::anyhow!("unknown fact category: {raw:?}"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub owner: String,
    pub source_session: String,
    pub category: FactCategory,
    pub value: String,
    #[serde(default)]
    pub context: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Utterance {
    pub text: String,
    pub spoken_at: DateTime<Utc>,
}

/// One era of biographical conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub owner: String,
    #[serde(default)]
    pub era: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub utterances: Vec<Utterance>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn has_content(&self) -> bool {
        self.utterances.iter().any(|u| !u.text.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub summary_text: String,
    pub density_score: f64,
    #[serde(default)]
    pub passes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BonusTopicStatus {
    Proposed,
    Accepted,
    Dismissed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BonusTopic {
    pub title: String,
    pub description: String,
    pub category: String,
    pub keywords: Vec<String>,
    pub origin_session: String,
    pub status: BonusTopicStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Ready,
    Erroneous,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterOutline {
    pub order: u32,
    pub title: String,
    pub age_range: String,
    pub narrative_goal: String,
    pub key_themes: Vec<String>,
    /// Session ids whose facts feed this chapter.
    pub source_sessions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anachronism {
    pub fact: String,
    pub session_id: String,
    pub issue: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityScores {
    pub chronological_coherence: f64,
    pub narrative_potential: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalPlan {
    pub narrative_arc: String,
    pub themes: Vec<String>,
    pub tone: String,
    pub chapters_outline: Vec<ChapterOutline>,
    /// Keyed by `transition_key(k, k + 1)`.
    pub transitions_map: BTreeMap<String, String>,
    pub anachronisms: Vec<Anachronism>,
    pub quality_scores: QualityScores,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
}

impl GlobalPlan {
    pub fn outline(&self, order: u32) -> Option<&ChapterOutline> {
        self.chapters_outline.iter().find(|c| c.order == order)
    }

    pub fn total_chapters(&self) -> u32 {
        self.chapters_outline.len() as u32
    }

    pub fn transition(&self, from: u32, to: u32) -> Option<&str> {
        self.transitions_map
            .get(&transition_key(from, to))
            .map(String::as_str)
    }
}

pub fn transition_key(from: u32, to: u32) -> String {
    format!("{from}->{to}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterBrief {
    pub chapter_order: u32,
    pub title: String,
    pub narrative_instructions: String,
    #[serde(default)]
    pub transition_in: String,
    #[serde(default)]
    pub transition_out: String,
    #[serde(default)]
    pub style_notes: String,
    pub facts_to_integrate: Vec<String>,
    #[serde(default)]
    pub structure_suggestion: String,
    pub target_length: u32,
    #[serde(default)]
    pub emotional_tone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    pub chapter_order: u32,
    pub title: String,
    pub content: String,
    pub word_count: u32,
    pub facts_integrated_count: u32,
    pub committed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    NoPlan,
    Planning,
    InProgress,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationState {
    pub status: GenerationStatus,
    pub current_chapter: u32,
    pub total_chapters: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Default for GenerationState {
    fn default() -> Self {
        Self {
            status: GenerationStatus::NoPlan,
            current_chapter: 0,
            total_chapters: 0,
            message: None,
            updated_at: Utc::now(),
        }
    }
}
