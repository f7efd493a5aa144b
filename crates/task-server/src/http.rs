use std::net::SocketAddr;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use task_wire::{
    CancelStepRequest, CancelStepResponse, CaptureRequest, CaptureResponse, CompleteStepRequest,
    CompleteStepResponse, EventDto, MicroStepDto, ProgressDto, ResolveClarificationRequest,
    StartStepResponse, TaskDto,
};

use crate::error::ApiError;
use crate::state::AppState;

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/capture", post(capture))
        .route("/steps/{step_id}/start", post(start_step))
        .route("/steps/{step_id}/complete", post(complete_step))
        .route("/steps/{step_id}/cancel", post(cancel_step))
        .route("/tasks/{task_id}/clarify", post(resolve_clarification))
        .route("/tasks/{task_id}/progress", get(progress))
        .route("/events", get(events))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds and serves the router, shutting down gracefully on Ctrl-C.
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

async fn capture(
    State(state): State<AppState>,
    Json(request): Json<CaptureRequest>,
) -> Result<Json<CaptureResponse>, ApiError> {
    task_wire::validate_capture_request(&request).map_err(ApiError::from)?;

    let result = state
        .capture
        .capture(&request.user_id, &request.text, request.mode)
        .await
        .map_err(ApiError::from)?;

    let micro_steps: Vec<MicroStepDto> = result.steps.iter().map(MicroStepDto::from).collect();
    let clarifications = result
        .steps
        .iter()
        .flat_map(task_wire::ClarificationDto::from_step)
        .collect();
    let breakdown = task_wire::Breakdown::from_steps(&result.steps);

    Ok(Json(CaptureResponse {
        task: TaskDto::from_domain(&result.task, &result.steps),
        micro_steps,
        clarifications,
        breakdown,
        persisted: result.persisted,
        processing_ms: result.latency_ms,
    }))
}

async fn start_step(
    State(state): State<AppState>,
    Path(step_id): Path<Uuid>,
) -> Result<Json<StartStepResponse>, ApiError> {
    let step = state.runtime.start_step(step_id).await.map_err(ApiError::from)?;
    Ok(Json(StartStepResponse {
        step: MicroStepDto::from(&step),
        emitted_events: Vec::new(),
    }))
}

async fn complete_step(
    State(state): State<AppState>,
    Path(step_id): Path<Uuid>,
    Json(request): Json<CompleteStepRequest>,
) -> Result<Json<CompleteStepResponse>, ApiError> {
    let (step, xp_total, streak) = state
        .runtime
        .complete_step(step_id, request.actual_minutes)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(CompleteStepResponse {
        step: MicroStepDto::from(&step),
        xp_awarded: xp_total,
        streak,
    }))
}

async fn cancel_step(
    State(state): State<AppState>,
    Path(step_id): Path<Uuid>,
    Json(request): Json<CancelStepRequest>,
) -> Result<Json<CancelStepResponse>, ApiError> {
    let step = state
        .runtime
        .cancel_step(step_id, request.reason)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(CancelStepResponse {
        step: MicroStepDto::from(&step),
    }))
}

/// Answers one clarification need raised during capture (spec.md §6
/// scenario D's follow-up). Not a literal endpoint from spec.md's §6 table,
/// which only describes the request/response shape; the path is this
/// crate's own addition, grounded on the same `State<AppState>` +
/// `Path`/`Json` extractor pattern the rest of this router uses.
async fn resolve_clarification(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Json(request): Json<ResolveClarificationRequest>,
) -> Result<Json<CaptureResponse>, ApiError> {
    let (task, steps, persisted) = state
        .capture
        .resolve_clarification(task_id, request.step_id, &request.field, &request.answer)
        .await
        .map_err(ApiError::from)?;

    let micro_steps: Vec<MicroStepDto> = steps.iter().map(MicroStepDto::from).collect();
    let clarifications = steps
        .iter()
        .flat_map(task_wire::ClarificationDto::from_step)
        .collect();
    let breakdown = task_wire::Breakdown::from_steps(&steps);

    Ok(Json(CaptureResponse {
        task: TaskDto::from_domain(&task, &steps),
        micro_steps,
        clarifications,
        breakdown,
        persisted,
        processing_ms: 0,
    }))
}

async fn progress(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<ProgressDto>, ApiError> {
    let progress = state.store.get_progress(task_id).await.map_err(ApiError::from)?;
    Ok(Json(ProgressDto {
        total: progress.total,
        completed: progress.completed,
        in_progress: progress.in_progress,
        percent: progress.percent,
        minutes_est: progress.total_minutes_est,
        minutes_actual: progress.total_minutes_actual,
    }))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    since: Option<Uuid>,
    user_id: String,
}

async fn events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<EventDto>>, ApiError> {
    let events = state
        .store
        .list_events_since(&query.user_id, query.since)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(events.iter().map(EventDto::from).collect()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use task_classify::Classifier;
    use task_core::{ConfigStore, EventBus};
    use task_decompose::Decomposer;
    use task_heuristics::HeuristicSplitter;
    use task_llm::{LlmClient, ProviderRegistry};
    use task_runtime::{HandlerRegistry, MicroStepRuntime};
    use task_split::SplitProxy;
    use task_store::Store;

    use super::*;

    async fn test_state() -> AppState {
        let store = Arc::new(Store::open_in_memory().await.expect("store"));
        let events = EventBus::new();
        let llm = Arc::new(LlmClient::new(ProviderRegistry::new(None, None), 4));
        let split_proxy = SplitProxy::new(
            LlmClient::new(ProviderRegistry::new(None, None), 4),
            HeuristicSplitter::new(),
        );
        let decomposer = Arc::new(Decomposer::new(split_proxy, Classifier::new()));
        let runtime = Arc::new(MicroStepRuntime::new(
            store.clone(),
            events.clone(),
            HandlerRegistry::new(),
            16,
        ));
        let config = ConfigStore::in_memory(Default::default());
        AppState::new(store, events, runtime, decomposer, llm, config, 5000)
    }

    #[tokio::test]
    async fn capture_in_auto_mode_persists_and_returns_breakdown() {
        let state = test_state().await;
        let app = app_router(state);
        let req = Request::builder()
            .method("POST")
            .uri("/capture")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({"user_id": "u1", "text": "reply to alice", "mode": "auto"}).to_string(),
            ))
            .expect("request");
        let resp = app.oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        let payload: Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(payload.get("persisted").and_then(Value::as_bool), Some(true));
        assert!(payload.get("breakdown").is_some());
    }

    #[tokio::test]
    async fn capture_with_empty_text_is_rejected() {
        let state = test_state().await;
        let app = app_router(state);
        let req = Request::builder()
            .method("POST")
            .uri("/capture")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({"user_id": "u1", "text": "   "}).to_string(),
            ))
            .expect("request");
        let resp = app.oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn progress_route_reports_zero_for_unknown_task() {
        let state = test_state().await;
        let app = app_router(state);
        let req = Request::builder()
            .method("GET")
            .uri(format!("/tasks/{}/progress", Uuid::new_v4()))
            .body(Body::empty())
            .expect("request");
        let resp = app.oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        let payload: Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(payload.get("total").and_then(Value::as_u64), Some(0));
    }

    #[tokio::test]
    async fn events_route_returns_empty_list_for_fresh_user() {
        let state = test_state().await;
        let app = app_router(state);
        let req = Request::builder()
            .method("GET")
            .uri("/events?user_id=u1")
            .body(Body::empty())
            .expect("request");
        let resp = app.oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        let payload: Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(payload.as_array().expect("array").len(), 0);
    }

    #[tokio::test]
    async fn clarify_capture_can_be_completed_via_clarify_route() {
        let state = test_state().await;
        let capture = state.capture.clone();
        let app = app_router(state);

        let result = capture
            .capture("u1", "send email about the refund", task_wire::CaptureMode::Clarify)
            .await
            .expect("capture");
        let Some(need) = result.steps.iter().find_map(|s| {
            s.clarification_needs
                .first()
                .map(|n| (s.step_id, n.field.clone()))
        }) else {
            // Nothing to clarify for this text under the current heuristic; the
            // capture already persisted, so there is no follow-up route to test.
            return;
        };
        assert!(!result.persisted);
        let (step_id, field) = need;

        let req = Request::builder()
            .method("POST")
            .uri(format!("/tasks/{}/clarify", result.task.task_id))
            .header("content-type", "application/json")
            .body(Body::from(
                json!({"step_id": step_id, "field": field, "answer": "the Acme invoice"}).to_string(),
            ))
            .expect("request");
        let resp = app.oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        let payload: Value = serde_json::from_slice(&body).expect("json");
        assert!(payload.get("persisted").is_some());
    }
}
