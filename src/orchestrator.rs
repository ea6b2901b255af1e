//! "Generate book": admission, planning once, then brief and draft each
//! chapter in order.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::admission::{AdmissionController, endpoints};
use crate::error::{PipelineError, Stage, StageError};
use crate::formats::{Chapter, GenerationState, GenerationStatus, GlobalPlan, PlanStatus};
use crate::openai::CompletionService;
use crate::stages::briefing::BriefingStage;
use crate::stages::drafting::DraftingStage;
use crate::stages::planning::PlanningStage;
use crate::stages::persistence;
use crate::store::BookStore;

#[derive(Debug, Clone, Copy, Default)]
pub struct GenerateOptions {
    /// Accept incomplete sessions as long as one has content.
    pub relaxed: bool,
    /// Continue after the committed chapter prefix instead of deleting it.
    pub resume: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookStats {
    pub chapters: u32,
    pub total_words: u64,
    pub total_facts_integrated: u64,
    pub anachronisms_fixed: u32,
}

pub struct BookOrchestrator {
    store: Arc<dyn BookStore>,
    admission: Arc<AdmissionController>,
    planning: PlanningStage,
    briefing: BriefingStage,
    drafting: DraftingStage,
}

impl BookOrchestrator {
    pub fn new(
        store: Arc<dyn BookStore>,
        llm: Arc<dyn CompletionService>,
        admission: Arc<AdmissionController>,
    ) -> Self {
        Self {
            planning: PlanningStage::new(store.clone(), llm.clone()),
            briefing: BriefingStage::new(store.clone(), llm.clone()),
            drafting: DraftingStage::new(store.clone(), llm),
            store,
            admission,
        }
    }

    pub async fn generate_book(
        &self,
        user_id: &str,
        options: GenerateOptions,
    ) -> Result<BookStats, StageError> {
        if let Err(err) = self.admission.gate(user_id, endpoints::DRAFTING_RUN).await {
            self.admission
                .record_usage(
                    user_id,
                    endpoints::DRAFTING_RUN,
                    false,
                    Some(serde_json::json!({ "denied": err.kind() })),
                )
                .await;
            return Err(StageError::new(Stage::Admission, err));
        }

        let result = self.run_pipeline(user_id, options).await;

        let meta = match &result {
            Ok(stats) => serde_json::json!({
                "chapters": stats.chapters,
                "total_words": stats.total_words,
                "relaxed": options.relaxed,
                "resume": options.resume,
            }),
            Err(err) => serde_json::json!({
                "stage": err.stage,
                "chapter_order": err.chapter_order,
                "error": err.source.kind(),
            }),
        };
        self.admission
            .record_usage(user_id, endpoints::DRAFTING_RUN, result.is_ok(), Some(meta))
            .await;

        if let Err(err) = &result {
            self.set_state(
                user_id,
                GenerationStatus::Error,
                None,
                None,
                Some(err.to_string()),
            )
            .await;
        }
        result
    }

    async fn run_pipeline(
        &self,
        user_id: &str,
        options: GenerateOptions,
    ) -> Result<BookStats, StageError> {
        let start = if options.resume {
            let committed = self
                .recover_state(user_id)
                .await
                .map_err(|err| StageError::new(Stage::Bookkeeping, err))?;
            committed + 1
        } else {
            let removed = self
                .store
                .delete_chapters(user_id)
                .await
                .map_err(|err| StageError::new(Stage::Bookkeeping, persistence(err)))?;
            tracing::info!(user_id, removed, "cleared previous chapters");
            1
        };

        let plan = match self
            .planning
            .usable_plan(user_id)
            .await
            .map_err(|err| StageError::new(Stage::Planning, err))?
        {
            Some(plan) => {
                tracing::info!(user_id, chapters = plan.total_chapters(), "reusing plan");
                plan
            }
            None => {
                self.set_state(user_id, GenerationStatus::Planning, Some(0), None, None)
                    .await;
                self.planning
                    .plan(user_id, options.relaxed)
                    .await
                    .map_err(|err| StageError::new(Stage::Planning, err))?
            }
        };
        let total = plan.total_chapters();

        self.set_state(
            user_id,
            GenerationStatus::InProgress,
            Some(start.saturating_sub(1).min(total)),
            Some(total),
            None,
        )
        .await;

        for order in start..=total {
            self.briefing
                .brief(user_id, order)
                .await
                .map_err(|err| StageError::in_chapter(Stage::Briefing, order, err))?;
            self.drafting
                .draft(user_id, order)
                .await
                .map_err(|err| StageError::in_chapter(Stage::Drafting, order, err))?;
            self.set_state(
                user_id,
                GenerationStatus::InProgress,
                Some(order),
                Some(total),
                None,
            )
            .await;
        }

        let chapters = self
            .store
            .list_chapters(user_id)
            .await
            .map_err(|err| StageError::new(Stage::Bookkeeping, persistence(err)))?;
        verify_contiguous(&chapters, total)
            .map_err(|err| StageError::new(Stage::Bookkeeping, err))?;

        self.set_state(
            user_id,
            GenerationStatus::Completed,
            Some(total),
            Some(total),
            None,
        )
        .await;

        let stats = book_stats(&chapters, &plan);
        tracing::info!(
            user_id,
            chapters = stats.chapters,
            total_words = stats.total_words,
            "book complete"
        );
        Ok(stats)
    }

    /// Re-derives `current_chapter` from the committed chapters and returns
    /// the length of the contiguous prefix starting at 1.
    pub async fn recover_state(&self, user_id: &str) -> Result<u32, PipelineError> {
        let chapters = self
            .store
            .list_chapters(user_id)
            .await
            .map_err(persistence)?;
        let committed = contiguous_prefix(&chapters);

        let mut state = self
            .store
            .get_state(user_id)
            .await
            .map_err(persistence)?
            .unwrap_or_default();
        if state.current_chapter != committed {
            tracing::warn!(
                user_id,
                recorded = state.current_chapter,
                committed,
                "generation state disagrees with committed chapters"
            );
        }
        state.current_chapter = committed;
        state.updated_at = Utc::now();
        self.store
            .put_state(user_id, &state)
            .await
            .map_err(persistence)?;
        Ok(committed)
    }

    /// Drops the plan and its briefs so the next run plans again.
    pub async fn discard_plan(&self, user_id: &str) -> Result<(), PipelineError> {
        self.store.delete_plan(user_id).await.map_err(persistence)?;
        self.store.clear_briefs(user_id).await.map_err(persistence)?;
        tracing::info!(user_id, "plan discarded");
        Ok(())
    }

    pub async fn mark_plan_erroneous(&self, user_id: &str) -> Result<(), PipelineError> {
        let mut plan = self
            .store
            .get_plan(user_id)
            .await
            .map_err(persistence)?
            .ok_or_else(|| PipelineError::precondition("no book plan exists yet"))?;
        plan.status = PlanStatus::Erroneous;
        self.store
            .put_plan(user_id, &plan)
            .await
            .map_err(persistence)?;
        tracing::info!(user_id, "plan flagged erroneous");
        Ok(())
    }

    /// State writes are bookkeeping; a failure is logged and the run goes on.
    async fn set_state(
        &self,
        user_id: &str,
        status: GenerationStatus,
        current_chapter: Option<u32>,
        total_chapters: Option<u32>,
        message: Option<String>,
    ) {
        let result = async {
            let mut state = self.store.get_state(user_id).await?.unwrap_or_default();
            state.status = status;
            if let Some(current) = current_chapter {
                state.current_chapter = current;
            }
            if let Some(total) = total_chapters {
                state.total_chapters = total;
            }
            state.message = message;
            state.updated_at = Utc::now();
            self.store.put_state(user_id, &state).await
        }
        .await;
        if let Err(err) = result {
            tracing::warn!(user_id, ?status, ?err, "failed to persist generation state");
        }
    }
}

fn contiguous_prefix(chapters: &[Chapter]) -> u32 {
    let mut next = 1;
    for chapter in chapters {
        if chapter.chapter_order == next {
            next += 1;
        } else if chapter.chapter_order > next {
            break;
        }
    }
    next - 1
}

fn verify_contiguous(chapters: &[Chapter], total: u32) -> Result<(), PipelineError> {
    let orders = chapters.iter().map(|c| c.chapter_order).collect::<Vec<_>>();
    let expected = (1..=total).collect::<Vec<_>>();
    if orders != expected {
        return Err(PipelineError::Persistence(anyhow::anyhow!(
            "committed chapters {orders:?} do not match 1..={total}"
        )));
    }
    Ok(())
}

fn book_stats(chapters: &[Chapter], plan: &GlobalPlan) -> BookStats {
    BookStats {
        chapters: chapters.len() as u32,
        total_words: chapters.iter().map(|c| u64::from(c.word_count)).sum(),
        total_facts_integrated: chapters
            .iter()
            .map(|c| u64::from(c.facts_integrated_count))
            .sum(),
        anachronisms_fixed: plan.anachronisms.len() as u32,
    }
}

/// Generation state and committed chapters, in order.
#[derive(Debug, Clone, Serialize)]
pub struct BookSnapshot {
    pub state: GenerationState,
    pub chapters: Vec<Chapter>,
}

pub async fn read_book(store: &dyn BookStore, user_id: &str) -> anyhow::Result<BookSnapshot> {
    let state = store.get_state(user_id).await?.unwrap_or_default();
    let chapters = store.list_chapters(user_id).await?;
    Ok(BookSnapshot { state, chapters })
}
