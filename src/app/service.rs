//! Service handles constructed once at startup and shared by the CLI and the
//! HTTP service.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::admission::{AdmissionController, Decision, endpoints};
use crate::app::model::{AddTurnRequest, AddTurnResponse, ExtractionTask, TaskRecord};
use crate::app::queue::{ExtractionQueue, RetryPolicy, TaskHandler};
use crate::config::Settings;
use crate::error::{PipelineError, Stage, StageError};
use crate::formats::{Account, Session, Utterance};
use crate::glossary;
use crate::ledger::LocalFsUsageLedger;
use crate::openai::{CompletionService, OpenAiClient};
use crate::orchestrator::{BookOrchestrator, BookSnapshot, BookStats, GenerateOptions};
use crate::stages::extraction::{ExtractionOutcome, FactExtractionStage};
use crate::stages::persistence;
use crate::store::{BookStore, LocalFsBookStore};
use crate::transcribe::{OpenAiTranscriber, Transcriber};

/// Gated fact extraction for one session. Also the queue's task handler.
pub struct ExtractionRunner {
    admission: Arc<AdmissionController>,
    stage: FactExtractionStage,
}

impl ExtractionRunner {
    pub fn new(
        store: Arc<dyn BookStore>,
        llm: Arc<dyn CompletionService>,
        admission: Arc<AdmissionController>,
    ) -> Self {
        Self {
            admission,
            stage: FactExtractionStage::new(store, llm),
        }
    }

    pub async fn run(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<ExtractionOutcome, PipelineError> {
        let endpoint = endpoints::FACT_EXTRACTION;
        if let Err(err) = self.admission.gate(user_id, endpoint).await {
            let meta = serde_json::json!({ "denied": err.kind() });
            self.admission
                .record_usage(user_id, endpoint, false, Some(meta))
                .await;
            return Err(err);
        }

        let result = self.stage.run(user_id, session_id).await;
        let meta = match &result {
            Ok(outcome) => serde_json::json!({
                "session_id": session_id,
                "facts_added": outcome.facts_added,
            }),
            Err(err) => serde_json::json!({ "session_id": session_id, "error": err.kind() }),
        };
        self.admission
            .record_usage(user_id, endpoint, result.is_ok(), Some(meta))
            .await;
        result
    }
}

#[async_trait]
impl TaskHandler for ExtractionRunner {
    async fn handle(&self, task: &ExtractionTask) -> Result<(), PipelineError> {
        self.run(&task.user_id, &task.session_id).await.map(|_| ())
    }
}

pub struct LifebookService {
    store: Arc<dyn BookStore>,
    admission: Arc<AdmissionController>,
    llm: Option<Arc<dyn CompletionService>>,
    transcriber: Option<Arc<dyn Transcriber>>,
    /// Shared by the queue and inline extraction so both take the same locks.
    extraction: Option<Arc<ExtractionRunner>>,
    queue: Option<ExtractionQueue>,
}

impl LifebookService {
    pub fn new(
        store: Arc<dyn BookStore>,
        admission: Arc<AdmissionController>,
        llm: Option<Arc<dyn CompletionService>>,
        transcriber: Option<Arc<dyn Transcriber>>,
    ) -> Self {
        let extraction = llm.as_ref().map(|llm| {
            Arc::new(ExtractionRunner::new(
                store.clone(),
                llm.clone(),
                admission.clone(),
            ))
        });
        Self {
            store,
            admission,
            llm,
            transcriber,
            extraction,
            queue: None,
        }
    }

    /// Local-filesystem store and ledger under `settings.data_dir`; OpenAI
    /// clients only when an API key is configured.
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let store = Arc::new(LocalFsBookStore::new(settings.data_dir.clone()));
        let ledger = Arc::new(LocalFsUsageLedger::new(settings.data_dir.clone()));
        let admission = Arc::new(AdmissionController::new(
            ledger,
            store.clone(),
            settings.quotas.clone(),
        ));

        let (llm, transcriber) = match settings.openai_api_key.as_deref() {
            Some(api_key) => {
                let llm: Arc<dyn CompletionService> =
                    Arc::new(OpenAiClient::new(settings.openai_config()?)?);
                let transcriber: Arc<dyn Transcriber> = Arc::new(OpenAiTranscriber::new(
                    &settings.openai_base_url,
                    api_key,
                    settings.transcription_model.clone(),
                    settings.http_timeout,
                )?);
                (Some(llm), Some(transcriber))
            }
            None => {
                tracing::warn!("OPENAI_API_KEY is not set; model-backed operations are disabled");
                (None, None)
            }
        };

        Ok(Self::new(store, admission, llm, transcriber))
    }

    /// Routes post-turn extraction through a background queue. Must be
    /// called inside a tokio runtime.
    pub fn with_extraction_queue(
        mut self,
        capacity: usize,
        max_concurrency: usize,
        retry: RetryPolicy,
    ) -> Self {
        if let Some(runner) = self.extraction.clone() {
            self.queue = Some(ExtractionQueue::start(
                runner,
                capacity,
                max_concurrency,
                retry,
            ));
        }
        self
    }

    pub fn store(&self) -> &Arc<dyn BookStore> {
        &self.store
    }

    fn llm(&self) -> Result<Arc<dyn CompletionService>, PipelineError> {
        self.llm
            .clone()
            .ok_or_else(|| PipelineError::precondition("OPENAI_API_KEY is not configured"))
    }

    fn orchestrator(&self) -> Result<BookOrchestrator, PipelineError> {
        Ok(BookOrchestrator::new(
            self.store.clone(),
            self.llm()?,
            self.admission.clone(),
        ))
    }

    pub async fn check_access(&self, user_id: &str, endpoint: &str) -> Decision {
        self.admission.check_access(user_id, endpoint).await
    }

    pub async fn grant(&self, user_id: &str, paid: bool) -> anyhow::Result<Account> {
        let account = Account {
            user_id: user_id.to_owned(),
            paid,
        };
        self.store.put_account(&account).await?;
        tracing::info!(user_id, paid, "account entitlement updated");
        Ok(account)
    }

    /// Appends an utterance, creating the session on first use, then queues
    /// extraction when a queue is configured.
    pub async fn add_turn(
        &self,
        session_id: &str,
        request: AddTurnRequest,
    ) -> Result<AddTurnResponse, PipelineError> {
        let text = request.text.trim();
        if text.is_empty() {
            return Err(PipelineError::precondition("turn text is empty"));
        }
        let user_id = request.user_id.as_str();
        let now = Utc::now();

        let mut session = self
            .store
            .get_session(user_id, session_id)
            .await
            .map_err(persistence)?
            .unwrap_or_else(|| Session {
                session_id: session_id.to_owned(),
                owner: user_id.to_owned(),
                era: String::new(),
                topic: String::new(),
                complete: false,
                utterances: Vec::new(),
                created_at: now,
            });
        if session.complete {
            return Err(PipelineError::precondition(format!(
                "session {session_id} is already complete"
            )));
        }
        if let Some(era) = request.era.filter(|e| !e.trim().is_empty()) {
            session.era = era;
        }
        if let Some(topic) = request.topic.filter(|t| !t.trim().is_empty()) {
            session.topic = topic;
        }
        session.utterances.push(Utterance {
            text: text.to_owned(),
            spoken_at: now,
        });
        self.store
            .put_session(&session)
            .await
            .map_err(persistence)?;

        let extraction_task_id = match &self.queue {
            Some(queue) => {
                let task = ExtractionTask {
                    user_id: user_id.to_owned(),
                    session_id: session_id.to_owned(),
                };
                match queue.enqueue(task).await {
                    Ok(task_id) => Some(task_id),
                    Err(err) => {
                        tracing::warn!(user_id, session_id, %err, "extraction not queued");
                        None
                    }
                }
            }
            None => None,
        };

        Ok(AddTurnResponse {
            session_id: session_id.to_owned(),
            utterances: session.utterances.len(),
            extraction_task_id,
        })
    }

    pub async fn complete_session(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Session, PipelineError> {
        let mut session = self
            .store
            .get_session(user_id, session_id)
            .await
            .map_err(persistence)?
            .ok_or_else(|| PipelineError::precondition(format!("session {session_id} not found")))?;
        session.complete = true;
        self.store
            .put_session(&session)
            .await
            .map_err(persistence)?;
        tracing::info!(user_id, session_id, "session complete");
        Ok(session)
    }

    /// Runs extraction inline, bypassing the queue.
    pub async fn extract_now(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<ExtractionOutcome, PipelineError> {
        let runner = self
            .extraction
            .as_ref()
            .ok_or_else(|| PipelineError::precondition("OPENAI_API_KEY is not configured"))?;
        runner.run(user_id, session_id).await
    }

    pub async fn task_status(&self, task_id: Uuid) -> Option<TaskRecord> {
        match &self.queue {
            Some(queue) => queue.status(task_id).await,
            None => None,
        }
    }

    pub async fn generate_book(
        &self,
        user_id: &str,
        options: GenerateOptions,
    ) -> Result<BookStats, StageError> {
        let orchestrator = self
            .orchestrator()
            .map_err(|err| StageError::new(Stage::Admission, err))?;
        orchestrator.generate_book(user_id, options).await
    }

    pub async fn discard_plan(&self, user_id: &str) -> Result<(), PipelineError> {
        self.orchestrator()?.discard_plan(user_id).await
    }

    pub async fn mark_plan_erroneous(&self, user_id: &str) -> Result<(), PipelineError> {
        self.orchestrator()?.mark_plan_erroneous(user_id).await
    }

    pub async fn book(&self, user_id: &str) -> anyhow::Result<BookSnapshot> {
        crate::orchestrator::read_book(self.store.as_ref(), user_id).await
    }

    /// Gated speech-to-text with the user's glossary as the spelling hint.
    pub async fn transcribe(
        &self,
        user_id: &str,
        audio: Vec<u8>,
        file_name: &str,
    ) -> Result<String, PipelineError> {
        let transcriber = self
            .transcriber
            .clone()
            .ok_or_else(|| PipelineError::precondition("OPENAI_API_KEY is not configured"))?;
        let endpoint = endpoints::TRANSCRIPTION;
        if let Err(err) = self.admission.gate(user_id, endpoint).await {
            let meta = serde_json::json!({ "denied": err.kind() });
            self.admission
                .record_usage(user_id, endpoint, false, Some(meta))
                .await;
            return Err(err);
        }

        let hint = match self.store.get_glossary(user_id).await {
            Ok(entries) => {
                glossary::transcription_hint(&entries, glossary::TRANSCRIPTION_HINT_MAX_CHARS)
            }
            Err(err) => {
                tracing::warn!(user_id, ?err, "glossary unavailable; transcribing without hint");
                String::new()
            }
        };

        let result = transcriber
            .transcribe(audio, file_name, &hint)
            .await
            .map_err(PipelineError::Completion);
        self.admission
            .record_usage(
                user_id,
                endpoint,
                result.is_ok(),
                Some(serde_json::json!({ "hint_chars": hint.chars().count() })),
            )
            .await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::QuotaTable;
    use crate::stages::testing::ScriptedLlm;

    struct EchoTranscriber;

    #[async_trait]
    impl Transcriber for EchoTranscriber {
        async fn transcribe(
            &self,
            audio: Vec<u8>,
            _file_name: &str,
            hint: &str,
        ) -> anyhow::Result<String> {
            Ok(format!("{} bytes [{hint}]", audio.len()))
        }
    }

    fn service(
        temp: &tempfile::TempDir,
        llm: Option<Arc<dyn CompletionService>>,
    ) -> LifebookService {
        let store = Arc::new(LocalFsBookStore::new(temp.path()));
        let ledger = Arc::new(LocalFsUsageLedger::new(temp.path()));
        let admission = Arc::new(AdmissionController::new(
            ledger,
            store.clone(),
            QuotaTable::default(),
        ));
        LifebookService::new(store, admission, llm, Some(Arc::new(EchoTranscriber)))
    }

    fn turn(text: &str) -> AddTurnRequest {
        AddTurnRequest {
            user_id: "u1".to_owned(),
            text: text.to_owned(),
            era: Some("childhood".to_owned()),
            topic: None,
        }
    }

    #[tokio::test]
    async fn turns_accumulate_until_session_completes() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let service = service(&temp, None);

        service.add_turn("s1", turn("I was born in Lyon.")).await?;
        let response = service.add_turn("s1", turn("My father baked bread.")).await?;
        assert_eq!(response.utterances, 2);
        assert!(response.extraction_task_id.is_none());

        let session = service.complete_session("u1", "s1").await?;
        assert!(session.complete);
        assert_eq!(session.era, "childhood");

        let err = service.add_turn("s1", turn("One more thing.")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Precondition(_)));
        Ok(())
    }

    #[tokio::test]
    async fn extraction_requires_entitlement_and_records_usage() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let llm: Arc<dyn CompletionService> = Arc::new(ScriptedLlm::new([
            r#"{"facts":[{"category":"place","value":"Lyon","context":""}],"summary":"Lyon.","density_score":0.5}"#,
        ]));
        let service = service(&temp, Some(llm));
        service.add_turn("s1", turn("I was born in Lyon.")).await?;

        let err = service.extract_now("u1", "s1").await.unwrap_err();
        assert_eq!(err.status_code(), 402);

        service.grant("u1", true).await?;
        let outcome = service.extract_now("u1", "s1").await?;
        assert_eq!(outcome.facts_added, 1);

        let decision = service.check_access("u1", endpoints::FACT_EXTRACTION).await;
        assert!(decision.allowed);
        // Two records so far (one denial, one success) out of 20 per minute.
        assert_eq!(decision.remaining, Some(17));
        Ok(())
    }

    #[tokio::test]
    async fn transcription_uses_glossary_hint() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let service = service(&temp, None);
        service.grant("u1", true).await?;
        service
            .store()
            .put_glossary("u1", &["Lyon".to_owned(), "Marcel".to_owned()])
            .await?;

        let text = service.transcribe("u1", vec![0; 4], "turn.webm").await?;
        assert_eq!(text, "4 bytes [Lyon, Marcel]");
        Ok(())
    }

    #[tokio::test]
    async fn generation_without_model_is_a_precondition_error() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let service = service(&temp, None);
        let err = service
            .generate_book("u1", GenerateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err.source, PipelineError::Precondition(_)));
        Ok(())
    }
}
