use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use growda_core::TrainingService;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

pub type AppState = Arc<TrainingService>;

#[derive(Debug, Deserialize)]
pub struct TrainRoundRequest {
    #[serde(default = "one_round")]
    pub num_rounds: u64,
    #[serde(default)]
    pub reset_model: bool,
}

fn one_round() -> u64 { 1 }

impl Default for TrainRoundRequest {
    fn default() -> Self { Self { num_rounds: one_round(), reset_model: false } }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/status", get(status))
        .route("/training_status", get(status))
        .route("/metrics/history", get(history))
        .route("/train_round", post(train_round))
        .with_state(state)
}

async fn root() -> Json<Value> {
    Json(json!({"message": "Welcome to Growda API - Federated Learning for Pneumonia Detection"}))
}

async fn status(State(svc): State<AppState>) -> Json<Value> { Json(json!(svc.status())) }

async fn history(State(svc): State<AppState>) -> Json<Value> {
    let history = tokio::task::spawn_blocking(move || svc.metrics_history()).await.unwrap_or_else(|e| {
        error!(error = %e, "history reader panicked");
        Vec::new()
    });
    Json(json!({"history": history}))
}

fn bad_request(error: String) -> Response { (StatusCode::BAD_REQUEST, Json(json!({"error": error}))).into_response() }

/// Starts a run in the background and answers immediately. An empty body
/// trains a single round; a body that does not parse is refused.
async fn train_round(State(svc): State<AppState>, body: Bytes) -> Response {
    let req = if body.iter().all(u8::is_ascii_whitespace) {
        TrainRoundRequest::default()
    } else {
        match serde_json::from_slice::<TrainRoundRequest>(&body) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "train_round body rejected");
                return bad_request(format!("invalid request body: {e}"));
            }
        }
    };
    match svc.start_training_run(req.num_rounds, req.reset_model) {
        Ok(_handle) => {
            info!(num_rounds = req.num_rounds, reset_model = req.reset_model, "train_round_accepted");
            let mut body = json!(svc.status());
            body["success"] = json!(true);
            body["in_progress"] = json!(true);
            Json(body).into_response()
        }
        Err(e) => bad_request(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use growda_core::{hospitals, AggregationStrategy, FedAvgConfig, HistoryStore, LocalRuntime, SharedState};
    use growda_core::model::LayerSpec;
    use growda_core::SequentialFactory;
    use tower::ServiceExt;

    fn app(dir: &std::path::Path) -> (Router, AppState) {
        let factory = Arc::new(SequentialFactory::new(vec![LayerSpec::new("dense/kernel", &[2, 2]), LayerSpec::new("dense/bias", &[2])]));
        let strategy = AggregationStrategy::new(FedAvgConfig::default(), factory, dir.join("global_model.bin"), HistoryStore::new(dir.join("metrics_history.json")), SharedState::new());
        let svc = Arc::new(TrainingService::new(strategy, LocalRuntime::new(hospitals(2, 5)), 3));
        (router(Arc::clone(&svc)), svc)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Body) -> (StatusCode, Value) {
        let req = Request::builder().method(method).uri(uri).header("content-type", "application/json").body(body).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn status_before_any_training() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(dir.path());
        let (code, body) = call(&app, "GET", "/status", Body::empty()).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["round"], 0);
        assert_eq!(body["global_accuracy"], 0.0);
        assert_eq!(body["total_rounds"], 3);
        assert_eq!(body["in_progress"], false);
        assert!(body["last_update"].is_string());
        let (_, alias) = call(&app, "GET", "/training_status", Body::empty()).await;
        assert_eq!(alias["total_rounds"], 3);
        let (_, root) = call(&app, "GET", "/", Body::empty()).await;
        assert!(root["message"].as_str().unwrap().starts_with("Welcome to Growda"));
    }

    #[tokio::test]
    async fn train_round_runs_in_background_and_rejects_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let (app, svc) = app(dir.path());
        assert!(svc.state().try_begin_training());
        let (code, body) = call(&app, "POST", "/train_round", Body::empty()).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Training already in progress");
        svc.state().finish_training();

        let (code, body) = call(&app, "POST", "/train_round", Body::from(r#"{"num_rounds": 2}"#)).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["in_progress"], true);

        while svc.status().in_progress { tokio::task::yield_now().await; }
        let (_, hist) = call(&app, "GET", "/metrics/history", Body::empty()).await;
        let rounds: Vec<u64> = hist["history"].as_array().unwrap().iter().map(|h| h["round"].as_u64().unwrap()).collect();
        assert_eq!(rounds, vec![1, 2]);
        assert_eq!(hist["history"][0]["clients"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn zero_rounds_is_a_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(dir.path());
        let (code, body) = call(&app, "POST", "/train_round", Body::from(r#"{"num_rounds": 0}"#)).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "num_rounds must be between 1 and 100");
    }

    #[tokio::test]
    async fn malformed_body_does_not_start_a_run() {
        let dir = tempfile::tempdir().unwrap();
        let (app, svc) = app(dir.path());
        for bad in [r#"{"num_rounds": "x"}"#, r#"{"num_rounds": -1}"#, "not json", r#"{"num_rounds": 1e400}"#] {
            let (code, body) = call(&app, "POST", "/train_round", Body::from(bad)).await;
            assert_eq!(code, StatusCode::BAD_REQUEST, "{bad}");
            assert!(body["error"].as_str().unwrap().starts_with("invalid request body"), "{bad}");
        }
        assert!(!svc.status().in_progress);
        assert!(svc.metrics_history().is_empty());
        assert!(!dir.path().join("global_model.bin").exists());
    }
}
