mod openai_stub;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use lifebook::admission::{AdmissionController, QuotaPolicy, QuotaTable, endpoints};
use lifebook::app::model::AddTurnRequest;
use lifebook::app::service::LifebookService;
use lifebook::error::{PipelineError, Stage};
use lifebook::formats::GenerationStatus;
use lifebook::ledger::LocalFsUsageLedger;
use lifebook::openai::{CompletionService, OpenAiClient, OpenAiConfig};
use lifebook::orchestrator::GenerateOptions;
use lifebook::store::LocalFsBookStore;

use openai_stub::{OpenAiStub, OpenAiStubConfig};

const USER: &str = "ada";

fn quotas() -> QuotaTable {
    let mut table = QuotaTable::default();
    table.endpoints.insert(
        endpoints::DRAFTING_RUN.to_owned(),
        QuotaPolicy {
            max_per_minute: 100,
            max_per_hour: 100,
            max_per_day: 100,
            lifetime_max: Some(3),
        },
    );
    table
}

fn service(data_dir: &Path, stub: &OpenAiStub) -> LifebookService {
    let store = Arc::new(LocalFsBookStore::new(data_dir));
    let ledger = Arc::new(LocalFsUsageLedger::new(data_dir));
    let admission = Arc::new(AdmissionController::new(ledger, store.clone(), quotas()));
    let llm: Arc<dyn CompletionService> = Arc::new(
        OpenAiClient::new(OpenAiConfig {
            base_url: stub.base_url.clone(),
            api_key: "test-key".to_owned(),
            fast_model: "stub-fast".to_owned(),
            deep_model: "stub-deep".to_owned(),
            timeout: Duration::from_secs(10),
        })
        .expect("build client"),
    );
    LifebookService::new(store, admission, Some(llm), None)
}

async fn interview(service: &LifebookService) {
    service.grant(USER, true).await.expect("grant");
    let turns = [
        ("s1-childhood", "I was born in Lyon in 1950."),
        ("s1-childhood", "My father Marcel ran a bakery."),
        ("s2-army", "I served in Toulon for two years."),
    ];
    for (session, text) in turns {
        service
            .add_turn(
                session,
                AddTurnRequest {
                    user_id: USER.to_owned(),
                    text: text.to_owned(),
                    era: Some(session.to_owned()),
                    topic: None,
                },
            )
            .await
            .expect("add turn");
    }
    for session in ["s1-childhood", "s2-army"] {
        service
            .complete_session(USER, session)
            .await
            .expect("complete session");
        let outcome = service
            .extract_now(USER, session)
            .await
            .expect("extract facts");
        assert!(outcome.facts_added > 0, "no facts for {session}");
    }
}

fn orders(chapters: &[lifebook::formats::Chapter]) -> Vec<u32> {
    chapters.iter().map(|c| c.chapter_order).collect()
}

#[tokio::test]
async fn generates_a_contiguous_book_from_interviews() {
    let stub = OpenAiStub::spawn(OpenAiStubConfig::default());
    let tmp = tempfile::tempdir().expect("tempdir");
    let service = service(tmp.path(), &stub);
    interview(&service).await;

    let stats = service
        .generate_book(USER, GenerateOptions::default())
        .await
        .expect("generate book");
    assert_eq!(stats.chapters, 2);
    assert_eq!(stats.total_facts_integrated, 3);
    assert_eq!(stats.anachronisms_fixed, 0);

    let book = service.book(USER).await.expect("read book");
    assert_eq!(orders(&book.chapters), vec![1, 2]);
    assert_eq!(book.state.status, GenerationStatus::Completed);
    assert_eq!(book.state.current_chapter, 2);
    assert!(book.chapters[0].content.contains("Marcel"));
    assert!(book.chapters[1].content.contains("Toulon"));
}

#[tokio::test]
async fn regeneration_replaces_previous_chapters() {
    let stub = OpenAiStub::spawn(OpenAiStubConfig::default());
    let tmp = tempfile::tempdir().expect("tempdir");
    let service = service(tmp.path(), &stub);
    interview(&service).await;

    service
        .generate_book(USER, GenerateOptions::default())
        .await
        .expect("first run");
    let first = service.book(USER).await.expect("read book").chapters;

    service
        .generate_book(USER, GenerateOptions::default())
        .await
        .expect("second run");
    let second = service.book(USER).await.expect("read book").chapters;

    assert_eq!(orders(&second), vec![1, 2]);
    for (old, new) in first.iter().zip(&second) {
        assert!(new.committed_at >= old.committed_at);
    }
}

#[tokio::test]
async fn failed_chapter_keeps_prefix_and_resume_finishes() {
    let failing = OpenAiStub::spawn(OpenAiStubConfig {
        fail_draft_for_chapter: Some(2),
    });
    let tmp = tempfile::tempdir().expect("tempdir");
    let service_a = service(tmp.path(), &failing);
    interview(&service_a).await;

    let err = service_a
        .generate_book(USER, GenerateOptions::default())
        .await
        .expect_err("chapter 2 draft fails");
    assert_eq!(err.stage, Stage::Drafting);
    assert_eq!(err.chapter_order, Some(2));
    assert!(err.source.is_retryable());

    let book = service_a.book(USER).await.expect("read book");
    assert_eq!(orders(&book.chapters), vec![1]);
    assert_eq!(book.state.status, GenerationStatus::Error);

    let healthy = OpenAiStub::spawn(OpenAiStubConfig::default());
    let service_b = service(tmp.path(), &healthy);
    service_b
        .generate_book(
            USER,
            GenerateOptions {
                resume: true,
                ..GenerateOptions::default()
            },
        )
        .await
        .expect("resume");

    // Plan reused, chapter 1 kept: one brief and one draft.
    assert_eq!(healthy.request_count(), 2);
    let book = service_b.book(USER).await.expect("read book");
    assert_eq!(orders(&book.chapters), vec![1, 2]);
    assert_eq!(book.state.status, GenerationStatus::Completed);
}

#[tokio::test]
async fn lifetime_cap_blocks_fourth_run_before_any_model_call() {
    let stub = OpenAiStub::spawn(OpenAiStubConfig::default());
    let tmp = tempfile::tempdir().expect("tempdir");
    let service = service(tmp.path(), &stub);
    interview(&service).await;

    for run in 1..=3 {
        service
            .generate_book(USER, GenerateOptions::default())
            .await
            .unwrap_or_else(|err| panic!("run {run}: {err}"));
    }

    let before = stub.request_count();
    let err = service
        .generate_book(USER, GenerateOptions::default())
        .await
        .expect_err("fourth run denied");
    assert_eq!(stub.request_count(), before);
    assert_eq!(err.stage, Stage::Admission);
    assert!(matches!(err.source, PipelineError::QuotaExceeded { .. }));
    assert_eq!(err.source.status_code(), 429);
    assert!(!err.source.is_retryable());

    let decision = service.check_access(USER, endpoints::DRAFTING_RUN).await;
    assert!(!decision.allowed);
    assert_eq!(decision.remaining, Some(0));
}
