//! The agent's HTTP surface: `GET /v1/ping`, `POST /v1/run`,
//! `POST /v1/stop`, `POST /v1/change_out`, plus
//! an ambient `GET /healthz`. Errors serialize as `{code, message}`;
//! successes with nothing to report use 204.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::state::{ChangeOutRequest, RunRequest, StopRequest};
use crate::{AgentError, AgentState};

pub fn router(state: Arc<AgentState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/ping", get(ping))
        .route("/v1/run", post(run))
        .route("/v1/stop", post(stop))
        .route("/v1/change_out", post(change_out))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn ping(State(state): State<Arc<AgentState>>) -> impl IntoResponse {
    Json(state.telemetry_snapshot().await)
}

async fn run(State(state): State<Arc<AgentState>>, Json(req): Json<RunRequest>) -> Response {
    match state.run(req).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => err.into_response(),
    }
}

async fn stop(State(state): State<Arc<AgentState>>, Json(req): Json<StopRequest>) -> Response {
    match state.stop(&req.runtime_name).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => err.into_response(),
    }
}

async fn change_out(State(state): State<Arc<AgentState>>, Json(req): Json<ChangeOutRequest>) -> Response {
    match state.change_out(&req).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => err.into_response(),
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        let status = match &self {
            AgentError::AlreadyRunning(_) => StatusCode::CONFLICT,
            AgentError::NotRunning(_) => StatusCode::NOT_FOUND,
            AgentError::BadAddress(_) => StatusCode::BAD_REQUEST,
            AgentError::DialTimedOut => StatusCode::GATEWAY_TIMEOUT,
            AgentError::Store(_) | AgentError::Runtime(_) | AgentError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let code = match &self {
            AgentError::AlreadyRunning(_) => "already_running",
            AgentError::NotRunning(_) => "not_running",
            AgentError::BadAddress(_) => "bad_address",
            AgentError::DialTimedOut => "dial_timed_out",
            AgentError::Store(_) => "store_error",
            AgentError::Runtime(_) => "runtime_error",
            AgentError::Io(_) => "io_error",
        };
        (status, Json(ErrorBody { code, message: self.to_string() })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use gs_kvstore::MemActionStore;
    use tower::ServiceExt;

    #[tokio::test]
    async fn healthz_reports_ok() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = crate::config::AgentConfig::default();
        config.temp_dir = dir.path().join("bin");
        config.control_socket_dir = dir.path().join("control");
        let state = AgentState::new(config, Arc::new(MemActionStore::new()));
        let app = router(state);

        let response = app.oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn stopping_unknown_runtime_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = crate::config::AgentConfig::default();
        config.temp_dir = dir.path().join("bin");
        config.control_socket_dir = dir.path().join("control");
        let state = AgentState::new(config, Arc::new(MemActionStore::new()));
        let app = router(state);

        let body = serde_json::to_vec(&StopRequest { runtime_name: "s_a".into() }).unwrap();
        let response = app
            .oneshot(Request::builder().method("POST").uri("/v1/stop").header("content-type", "application/json").body(Body::from(body)).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
