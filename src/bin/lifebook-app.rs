use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use clap::Parser;
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use lifebook::app::model::{AddTurnRequest, ErrorResponse, GenerateBookRequest};
use lifebook::app::queue::RetryPolicy;
use lifebook::app::service::LifebookService;
use lifebook::config::Settings;
use lifebook::error::{PipelineError, StageError};
use lifebook::orchestrator::GenerateOptions;

const MAX_AUDIO_BYTES: usize = 25 * 1024 * 1024;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct AppArgs {
    #[arg(long, default_value = "127.0.0.1:8080")]
    addr: SocketAddr,

    /// Overrides LIFEBOOK_DATA_DIR.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Pending extraction tasks before new turns skip extraction.
    #[arg(long, default_value_t = 256)]
    queue_capacity: usize,

    #[arg(long, default_value_t = 2)]
    max_concurrency: usize,

    #[arg(long, default_value_t = 3)]
    extraction_attempts: u32,
}

#[derive(Clone)]
struct AppState {
    service: Arc<LifebookService>,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    lifebook::logging::init()?;

    let args = AppArgs::parse();
    tracing::info!(?args, "starting lifebook-app");

    let settings = Settings::from_env()?.with_data_dir(args.data_dir.clone());
    tracing::info!(data_dir = %settings.data_dir.display(), "using local filesystem store");

    let retry = RetryPolicy {
        max_attempts: args.extraction_attempts,
        ..RetryPolicy::default()
    };
    let service = LifebookService::from_settings(&settings)?.with_extraction_queue(
        args.queue_capacity,
        args.max_concurrency,
        retry,
    );
    let app = router(AppState {
        service: Arc::new(service),
    });

    let listener = tokio::net::TcpListener::bind(args.addr)
        .await
        .map_err(|err| anyhow::anyhow!("bind {}: {err}", args.addr))?;
    tracing::info!(addr = %args.addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok\n" }))
        .route("/users/:user_id/access/:endpoint", get(check_access))
        .route("/users/:user_id/account", post(grant_account))
        .route("/users/:user_id/book", get(read_book).post(generate_book))
        .route("/users/:user_id/plan", axum::routing::delete(discard_plan))
        .route("/users/:user_id/plan/erroneous", post(mark_plan_erroneous))
        .route("/users/:user_id/transcriptions", post(transcribe))
        .route("/sessions/:session_id/turns", post(add_turn))
        .route("/sessions/:session_id/complete", post(complete_session))
        .route("/sessions/:session_id/extract", post(extract_now))
        .route("/tasks/:task_id", get(task_status))
        .layer(DefaultBodyLimit::max(MAX_AUDIO_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(?err, "failed to listen for shutdown signal");
        // Keep serving; there is no way to be told to stop.
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        Self {
            status: status_of(&err),
            body: ErrorResponse {
                error: err.to_string(),
                kind: err.kind().to_owned(),
                stage: None,
                chapter_order: None,
                retryable: err.is_retryable(),
            },
        }
    }
}

impl From<StageError> for ApiError {
    fn from(err: StageError) -> Self {
        Self {
            status: status_of(&err.source),
            body: ErrorResponse {
                error: err.to_string(),
                kind: err.source.kind().to_owned(),
                stage: Some(err.stage.to_string()),
                chapter_order: err.chapter_order,
                retryable: err.source.is_retryable(),
            },
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(?err, "request failed");
        Self::from(PipelineError::Persistence(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn status_of(err: &PipelineError) -> StatusCode {
    StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

async fn check_access(
    State(state): State<AppState>,
    Path((user_id, endpoint)): Path<(String, String)>,
) -> Response {
    let decision = state.service.check_access(&user_id, &endpoint).await;
    let status =
        StatusCode::from_u16(decision.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(decision)).into_response()
}

#[derive(Debug, Deserialize)]
struct GrantRequest {
    paid: bool,
}

async fn grant_account(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(request): Json<GrantRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let account = state.service.grant(&user_id, request.paid).await?;
    Ok(Json(account))
}

async fn generate_book(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    request: Option<Json<GenerateBookRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let stats = state
        .service
        .generate_book(
            &user_id,
            GenerateOptions {
                relaxed: request.relaxed,
                resume: request.resume,
            },
        )
        .await?;
    Ok(Json(stats))
}

async fn read_book(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let book = state.service.book(&user_id).await?;
    Ok(Json(book))
}

async fn discard_plan(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.service.discard_plan(&user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn mark_plan_erroneous(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.service.mark_plan_erroneous(&user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct TranscriptionQuery {
    #[serde(default)]
    file_name: Option<String>,
}

async fn transcribe(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<TranscriptionQuery>,
    audio: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    if audio.is_empty() {
        return Err(PipelineError::precondition("audio body is empty").into());
    }
    let file_name = query.file_name.unwrap_or_else(|| "audio.webm".to_owned());
    let text = state
        .service
        .transcribe(&user_id, audio.to_vec(), &file_name)
        .await?;
    Ok(Json(serde_json::json!({ "text": text })))
}

async fn add_turn(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<AddTurnRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state.service.add_turn(&session_id, request).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

#[derive(Debug, Deserialize)]
struct SessionOwner {
    user_id: String,
}

async fn complete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<SessionOwner>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .service
        .complete_session(&request.user_id, &session_id)
        .await?;
    Ok(Json(session))
}

/// Inline extraction, for sessions whose queued task failed or was skipped.
async fn extract_now(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<SessionOwner>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state
        .service
        .extract_now(&request.user_id, &session_id)
        .await?;
    Ok(Json(outcome))
}

async fn task_status(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<impl IntoResponse, StatusCode> {
    let record = state
        .service
        .task_status(task_id)
        .await
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(record))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Method, Request};
    use lifebook::admission::{AdmissionController, QuotaTable};
    use lifebook::ledger::LocalFsUsageLedger;
    use lifebook::openai::{CompletionRequest, CompletionService};
    use lifebook::store::LocalFsBookStore;
    use tower::ServiceExt;

    use super::*;

    struct FixedAnalyst;

    #[async_trait::async_trait]
    impl CompletionService for FixedAnalyst {
        async fn complete(&self, _request: CompletionRequest) -> anyhow::Result<String> {
            Ok(serde_json::json!({
                "facts": [{ "category": "place", "value": "Lyon", "context": "" }],
                "summary": "Lyon.",
                "density_score": 0.5,
            })
            .to_string())
        }
    }

    fn app(temp: &tempfile::TempDir) -> (Router, Arc<LifebookService>) {
        let store = Arc::new(LocalFsBookStore::new(temp.path()));
        let ledger = Arc::new(LocalFsUsageLedger::new(temp.path()));
        let admission = Arc::new(AdmissionController::new(
            ledger,
            store.clone(),
            QuotaTable::default(),
        ));
        let llm: Arc<dyn CompletionService> = Arc::new(FixedAnalyst);
        let service = Arc::new(LifebookService::new(store, admission, Some(llm), None));
        let router = router(AppState {
            service: service.clone(),
        });
        (router, service)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn extract_route_runs_inline_extraction() {
        let temp = tempfile::TempDir::new().unwrap();
        let (app, service) = app(&temp);
        service.grant("u1", true).await.unwrap();
        service
            .add_turn(
                "s1",
                AddTurnRequest {
                    user_id: "u1".to_owned(),
                    text: "I was born in Lyon.".to_owned(),
                    era: None,
                    topic: None,
                },
            )
            .await
            .unwrap();

        let resp = app
            .oneshot(post_json(
                "/sessions/s1/extract",
                serde_json::json!({ "user_id": "u1" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["facts_added"], 1);
    }

    #[tokio::test]
    async fn erroneous_plan_route_reports_missing_plan() {
        let temp = tempfile::TempDir::new().unwrap();
        let (app, _service) = app(&temp);

        let req = Request::builder()
            .method(Method::POST)
            .uri("/users/u1/plan/erroneous")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["kind"], "precondition");
    }
}
