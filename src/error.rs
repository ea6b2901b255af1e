//! Error taxonomy shared by the pipeline stages and the orchestrator.
//!
//! Storage and transport layers report `anyhow::Error`; the stage APIs wrap
//! those into [`PipelineError`] so callers can decide between surfacing,
//! retrying later, or degrading.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::admission::DenyReason;
use crate::structured::StructuredOutputError;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The caller does not hold a paid entitlement. Never retried.
    #[error("billing is not active for user {user_id}")]
    Entitlement { user_id: String },

    /// A rate window or the lifetime cap denied the attempt.
    #[error("quota exceeded for {endpoint}: {reason}")]
    QuotaExceeded { endpoint: String, reason: DenyReason },

    /// The completion service answered, but not with the expected structure.
    #[error("unusable model output: {0}")]
    UpstreamFormat(#[from] StructuredOutputError),

    /// The completion service could not be reached or returned an error status.
    #[error("completion call failed: {0:#}")]
    Completion(anyhow::Error),

    /// A required prior artifact is missing.
    #[error("missing prerequisite: {0}")]
    Precondition(String),

    #[error("persistence failure: {0:#}")]
    Persistence(anyhow::Error),
}

impl PipelineError {
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    /// Whether a later attempt of the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Entitlement { .. } | Self::Precondition(_) => false,
            Self::QuotaExceeded { reason, .. } => !matches!(reason, DenyReason::LifetimeCap { .. }),
            Self::UpstreamFormat(_) | Self::Completion(_) | Self::Persistence(_) => true,
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::Entitlement { .. } => 402,
            Self::QuotaExceeded { .. } => 429,
            Self::UpstreamFormat(_) | Self::Completion(_) => 502,
            Self::Precondition(_) => 409,
            Self::Persistence(_) => 500,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Entitlement { .. } => "entitlement",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::UpstreamFormat(_) => "upstream_format",
            Self::Completion(_) => "completion",
            Self::Precondition(_) => "precondition",
            Self::Persistence(_) => "persistence",
        }
    }
}

/// Pipeline step that produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Admission,
    Extraction,
    Planning,
    Briefing,
    Drafting,
    Bookkeeping,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Admission => "admission",
            Stage::Extraction => "extraction",
            Stage::Planning => "planning",
            Stage::Briefing => "briefing",
            Stage::Drafting => "drafting",
            Stage::Bookkeeping => "bookkeeping",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by the orchestrator: the failing stage, the chapter it was
/// working on (if any), and the underlying cause.
#[derive(Debug, Error)]
#[error("{stage} failed{}: {source}", chapter_suffix(.chapter_order))]
pub struct StageError {
    pub stage: Stage,
    pub chapter_order: Option<u32>,
    #[source]
    pub source: PipelineError,
}

impl StageError {
    pub fn new(stage: Stage, source: PipelineError) -> Self {
        Self {
            stage,
            chapter_order: None,
            source,
        }
    }

    pub fn in_chapter(stage: Stage, chapter_order: u32, source: PipelineError) -> Self {
        Self {
            stage,
            chapter_order: Some(chapter_order),
            source,
        }
    }
}

fn chapter_suffix(chapter_order: &Option<u32>) -> String {
    match chapter_order {
        Some(order) => format!(" (chapter {order})"),
        None => String::new(),
    }
}
