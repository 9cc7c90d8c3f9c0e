pub mod health;

use axum::{
    routing::{get, post, put},
    Router,
};

use crate::generation::handlers as generation;
use crate::grid::handlers as grid;
use crate::profile::handlers as profile;
use crate::queue::handlers as jobs;
use crate::quota::handlers as quota;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/api/v1/status", get(jobs::handle_status))
        // Submissions
        .route("/api/v1/generations", post(generation::handle_generate))
        .route(
            "/api/v1/grids/:grid_id/actions",
            post(grid::handle_grid_action),
        )
        // Lookups
        .route(
            "/api/v1/jobs/:job_id",
            get(jobs::handle_get_job).delete(jobs::handle_cancel_job),
        )
        .route("/api/v1/grids/:grid_id", get(grid::handle_get_grid))
        .route("/api/v1/users/:user_id/usage", get(quota::handle_usage))
        // Profiles
        .route(
            "/api/v1/users/:user_id/settings",
            get(profile::handle_get_settings).put(profile::handle_update_settings),
        )
        .route(
            "/api/v1/users/:user_id/references",
            get(profile::handle_list_references).delete(profile::handle_clear_references),
        )
        .route(
            "/api/v1/users/:user_id/references/:slot",
            put(profile::handle_save_reference).delete(profile::handle_delete_reference),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request, StatusCode};
    use serde_json::{json, Value};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use super::*;
    use crate::admission::AdmissionController;
    use crate::config::Config;
    use crate::generation::client::{GenerationClient, GenerationError, GenerationRequest};
    use crate::generation::gemini::DEFAULT_MODEL;
    use crate::generation::images::MemoryImageStore;
    use crate::grid::GridRegistry;
    use crate::models::Candidate;
    use crate::orchestrator::{EngineSettings, LogPresenter, Orchestrator};
    use crate::profile::UserProfiles;
    use crate::quota::{DayBoundary, QuotaLedger};
    use crate::store::MemoryStore;

    struct InstantClient;

    #[async_trait]
    impl GenerationClient for InstantClient {
        async fn generate(
            &self,
            request: &GenerationRequest,
        ) -> Result<Vec<Candidate>, GenerationError> {
            Ok((0..request.candidate_count)
                .map(|i| Candidate {
                    index: i as u8,
                    image_ref: format!("generations/{}-{i}.png", request.job_id),
                    parent_job_id: request.job_id,
                })
                .collect())
        }
    }

    /// Forwards each request it renders so tests can inspect the resolved
    /// parameters.
    struct RecordingClient(tokio::sync::mpsc::UnboundedSender<GenerationRequest>);

    #[async_trait]
    impl GenerationClient for RecordingClient {
        async fn generate(
            &self,
            request: &GenerationRequest,
        ) -> Result<Vec<Candidate>, GenerationError> {
            let _ = self.0.send(request.clone());
            InstantClient.generate(request).await
        }
    }

    fn app() -> Router {
        app_with(Arc::new(InstantClient))
    }

    fn app_with(client: Arc<dyn GenerationClient>) -> Router {
        let config = Config::for_tests();
        let store = Arc::new(MemoryStore::new());
        let quota = Arc::new(QuotaLedger::new(
            config.daily_limit,
            DayBoundary::utc(),
            store.clone(),
        ));
        let grids = Arc::new(GridRegistry::new(
            config.grid_retention,
            store.clone(),
            Arc::new(MemoryImageStore::new()),
        ));
        let profiles = Arc::new(UserProfiles::new(
            config.gemini_model.clone(),
            store.clone(),
            store,
        ));
        let (orchestrator, _tasks) = Orchestrator::start(
            EngineSettings::from(&config),
            Arc::new(AdmissionController::new(config.rate_limit_per_minute)),
            quota,
            grids,
            client,
            Arc::new(LogPresenter),
            CancellationToken::new(),
        );
        build_router(AppState {
            orchestrator,
            profiles,
            config,
        })
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = call(&app(), Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_generation_is_accepted_and_trackable() {
        let app = app();
        let (status, body) = call(
            &app,
            Method::POST,
            "/api/v1/generations",
            Some(json!({ "user_id": 501, "prompt": "a paper boat", "style": "watercolor", "quality": "2K" })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["kind"], "original");
        let job_id = body["job_id"].as_str().unwrap().to_string();

        let (status, job) = call(&app, Method::GET, &format!("/api/v1/jobs/{job_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["job_id"], job_id);
        assert_eq!(job["user_id"], 501);
    }

    #[tokio::test]
    async fn test_unknown_style_is_a_validation_error() {
        let (status, body) = call(
            &app(),
            Method::POST,
            "/api/v1/generations",
            Some(json!({ "user_id": 1, "prompt": "x", "style": "vaporwave" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_blank_prompt_is_an_invalid_request() {
        let (status, body) = call(
            &app(),
            Method::POST,
            "/api/v1/generations",
            Some(json!({ "user_id": 1, "prompt": "  " })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["code"], "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn test_unknown_grid_and_action_are_not_found() {
        let app = app();
        let grid = uuid::Uuid::new_v4();

        let (status, body) = call(&app, Method::GET, &format!("/api/v1/grids/{grid}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");

        let (status, _) = call(
            &app,
            Method::POST,
            &format!("/api/v1/grids/{grid}/actions"),
            Some(json!({ "user_id": 1, "action": "upscale", "index": 0 })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cancel_unknown_job_is_not_found() {
        let uri = format!("/api/v1/jobs/{}", uuid::Uuid::new_v4());
        let (status, _) = call(&app(), Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_usage_report() {
        let (status, body) = call(&app(), Method::GET, "/api/v1/users/77/usage", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user_id"], 77);
        assert_eq!(body["limit"], 15);
        assert_eq!(body["used"], 0);
        assert!(body["resets_in"].is_string());
    }

    #[tokio::test]
    async fn test_status_reports_engine_limits() {
        let (status, body) = call(&app(), Method::GET, "/api/v1/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["model"], DEFAULT_MODEL);
        assert_eq!(body["rate_limit_per_minute"], 10);
        assert_eq!(body["queue_capacity"], 64);
    }

    #[tokio::test]
    async fn test_settings_round_trip_and_reject_unknown_model() {
        let app = app();
        let (status, body) = call(&app, Method::GET, "/api/v1/users/9/settings", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["model"], DEFAULT_MODEL);
        assert_eq!(body["quality"], "1K");

        let (status, body) = call(
            &app,
            Method::PUT,
            "/api/v1/users/9/settings",
            Some(json!({ "quality": "4K", "style": "anime" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["quality"], "4K");
        assert_eq!(body["style"], "anime");
        assert_eq!(body["aspect_ratio"], "1:1");

        let (status, body) = call(
            &app,
            Method::PUT,
            "/api/v1/users/9/settings",
            Some(json!({ "model": "midjourney" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_reference_library_slots() {
        let app = app();
        let image = json!({ "mime_type": "image/png", "data": "aGVsbG8=", "filename": "cat.png" });

        let (status, body) = call(
            &app,
            Method::PUT,
            "/api/v1/users/9/references/2",
            Some(image.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["slot"], 2);
        assert_eq!(body["filename"], "cat.png");

        let (status, _) = call(
            &app,
            Method::PUT,
            "/api/v1/users/9/references/6",
            Some(image.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = call(&app, Method::GET, "/api/v1/users/9/references", None).await;
        assert_eq!(body["references"].as_array().unwrap().len(), 1);

        let (status, _) = call(&app, Method::DELETE, "/api/v1/users/9/references/2", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&app, Method::DELETE, "/api/v1/users/9/references/2", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        for slot in [1, 3] {
            let uri = format!("/api/v1/users/9/references/{slot}");
            call(&app, Method::PUT, &uri, Some(image.clone())).await;
        }
        let (status, body) = call(&app, Method::DELETE, "/api/v1/users/9/references", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cleared"], 2);
    }

    #[tokio::test]
    async fn test_generation_uses_saved_settings_and_references() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let app = app_with(Arc::new(RecordingClient(tx)));

        call(
            &app,
            Method::PUT,
            "/api/v1/users/12/settings",
            Some(json!({ "model": "gemini-2.5-flash-image", "style": "comic", "aspect_ratio": "9:16" })),
        )
        .await;
        call(
            &app,
            Method::PUT,
            "/api/v1/users/12/references/1",
            Some(json!({ "mime_type": "image/jpeg", "data": "aGVsbG8=" })),
        )
        .await;

        let (status, _) = call(
            &app,
            Method::POST,
            "/api/v1/generations",
            Some(json!({ "user_id": 12, "prompt": "a lighthouse", "quality": "2K" })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let request = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.model.as_deref(), Some("gemini-2.5-flash-image"));
        assert_eq!(request.style, crate::models::Style::Comic);
        assert_eq!(request.aspect_ratio, crate::models::AspectRatio::Portrait);
        assert_eq!(request.quality, crate::models::Quality::TwoK);
        assert_eq!(request.references.len(), 1);
        assert_eq!(request.references[0].mime_type, "image/jpeg");
    }
}
