//! Axum router construction.

mod download;
mod health;
mod upscale;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::{middleware, Router};
use w2x_core::ConfigProvider;

use crate::middleware::trace;
use crate::state::AppState;

/// Build the complete application router.
///
/// The request body limit follows `api.max_input_size_mb` as loaded at
/// startup (with a little headroom); the core re-checks the live value on
/// every submission.
pub fn build(state: Arc<AppState>) -> Router {
    let limit_mb = state.settings.settings().api.max_input_size_mb;
    let body_limit = if limit_mb == 0 {
        DefaultBodyLimit::disable()
    } else {
        let bytes = usize::try_from(limit_mb.saturating_add(1).saturating_mul(1024 * 1024))
            .unwrap_or(usize::MAX);
        DefaultBodyLimit::max(bytes)
    };

    Router::new()
        .merge(health::router())
        .merge(upscale::router())
        .merge(download::router())
        .layer(body_limit)
        .layer(middleware::from_fn(trace::trace_middleware))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;
    use w2x_core::runner::{ProcessOutput, ProcessSpec};
    use w2x_core::{
        CacheLayout, Coordinator, ProcessExecutor, RunnerError, SharedConfig, SqliteStore,
    };

    use super::*;
    use crate::config::Config;

    /// Writes a fixed PNG-ish payload to the `-o` path.
    struct StubExecutor;

    #[async_trait]
    impl ProcessExecutor for StubExecutor {
        async fn execute(&self, spec: ProcessSpec) -> Result<ProcessOutput, RunnerError> {
            let pos = spec.args.iter().position(|a| a == "-o").expect("-o flag");
            tokio::fs::write(PathBuf::from(&spec.args[pos + 1]), b"\x89PNG-out").await?;
            Ok(ProcessOutput {
                exit_code: Some(0),
                ..Default::default()
            })
        }
    }

    async fn app(dir: &tempfile::TempDir) -> Router {
        let settings = Arc::new(SharedConfig::default());
        settings.update(|s| {
            s.upscaler.path = Some(PathBuf::from("/opt/stub-upscaler"));
            s.cache.cache_dir = dir.path().join("cache");
            s.cache.temp_dir = dir.path().join("tmp");
        });
        let layout = CacheLayout::from_settings(&settings.settings().cache);
        layout.init().await.expect("roots");

        let url = format!("sqlite://{}", dir.path().join("w2x.db").display());
        let store = SqliteStore::connect(&url).await.expect("store");
        let coordinator = Coordinator::new(store, settings.clone(), Arc::new(StubExecutor), layout);

        build(Arc::new(AppState {
            config: Arc::new(Config::from_env()),
            settings,
            coordinator,
        }))
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn health_reports_queue_depth() {
        let dir = tempfile::tempdir().expect("tempdir");
        let response = app(&dir)
            .await
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(trace::X_TRACE_ID));

        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["pending"], 0);
        assert_eq!(body["active"], 0);
        assert_eq!(body["tasks"]["queued"], 0);
        assert_eq!(body["tasks"]["failed"], 0);
    }

    #[tokio::test]
    async fn submit_then_download() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = app(&dir).await;

        let response = app
            .clone()
            .oneshot(
                Request::post("/api/upscale?sourceKey=manga&cid=12&format=png&scale=4")
                    .body(Body::from("raw image"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = json_body(response).await;
        assert_eq!(body["cached"], false);
        let url = body["downloadUrl"].as_str().expect("download url").to_owned();
        assert_eq!(url, format!("/api/download/{}", body["taskId"].as_str().unwrap()));

        let ready = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let response = app
                    .clone()
                    .oneshot(Request::get(url.as_str()).body(Body::empty()).unwrap())
                    .await
                    .unwrap();
                if response.status() == StatusCode::OK {
                    return response;
                }
                assert_eq!(response.status(), StatusCode::ACCEPTED);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("result ready");

        assert_eq!(ready.headers()[axum::http::header::CONTENT_TYPE], "image/png");
        let bytes = ready.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"\x89PNG-out");

        // Same bytes and params again: served from cache.
        let again = app
            .clone()
            .oneshot(
                Request::post("/api/upscale?sourceKey=manga&cid=12&format=png&scale=4")
                    .body(Body::from("raw image"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::OK);
        let body = json_body(again).await;
        assert_eq!(body["cached"], true);
        assert_eq!(body["status"], "completed");

        let health = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(json_body(health).await["tasks"]["completed"], 1);
    }

    #[tokio::test]
    async fn rejects_bad_requests() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = app(&dir).await;

        let empty = app
            .clone()
            .oneshot(
                Request::post("/api/upscale?sourceKey=s&cid=1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(empty.status(), StatusCode::BAD_REQUEST);

        let traversal = app
            .clone()
            .oneshot(
                Request::post("/api/upscale?sourceKey=..&cid=1")
                    .body(Body::from("x"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(traversal.status(), StatusCode::BAD_REQUEST);

        let missing = app
            .oneshot(Request::get("/api/download/unknown").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
