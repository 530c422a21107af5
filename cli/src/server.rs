/*
    swapify-sync | Background reconciliation engine for Swapify shared playlists.
    Copyright (C) 2025  Israel Alberto Roldan Vega

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU Affero General Public License as published
    by the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU Affero General Public License for more details.

    You should have received a copy of the GNU Affero General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

//! HTTP trigger for on-demand cycles.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::{info, warn};
use serde_json::{json, Value};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use swapify_core::Engine;

pub const SECRET_HEADER: &str = "x-swapify-secret";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    /// Empty means the trigger is closed.
    pub trigger_secret: Arc<str>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, trigger_secret: &str) -> Self {
        Self {
            engine,
            trigger_secret: Arc::from(trigger_secret),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/cycle", post(trigger_cycle))
        .route("/health", get(health))
        .with_state(state)
}

pub async fn serve<F>(state: AppState, bind: SocketAddr, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("Trigger listening on {}", listener.local_addr()?);
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn trigger_cycle(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let provided = headers
        .get(SECRET_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !secret_matches(&state.trigger_secret, provided) {
        warn!("Rejected cycle trigger with a bad secret");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid trigger secret" })),
        )
            .into_response();
    }

    match state.engine.run_cycle().await {
        Some(report) => Json(report).into_response(),
        None => Json(json!({ "status": "busy" })).into_response(),
    }
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "module": "swapify-sync",
        "version": env!("CARGO_PKG_VERSION"),
        "cycles_run": state.engine.cycles_run(),
    }))
}

/// Compares without an early exit on the first differing byte.
fn secret_matches(expected: &str, provided: &str) -> bool {
    if expected.is_empty() || expected.len() != provided.len() {
        return false;
    }
    expected
        .bytes()
        .zip(provided.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::{DateTime, Utc};
    use std::time::Duration;
    use swapify_core::models::{PlaybackSnapshot, PlaylistPage};
    use swapify_core::{
        ApiError, EngineConfig, GatedSpotify, NotificationQueue, RateBudget, SpotifyApi, Store,
    };
    use tower::util::ServiceExt;

    /// Spotify with nothing playing and empty playlists.
    struct IdleSpotify;

    #[async_trait]
    impl SpotifyApi for IdleSpotify {
        async fn current_playback(&self, _: &str) -> Result<Option<PlaybackSnapshot>, ApiError> {
            Ok(None)
        }
        async fn recently_played(
            &self,
            _: &str,
            _: Option<DateTime<Utc>>,
        ) -> Result<Vec<PlaybackSnapshot>, ApiError> {
            Ok(Vec::new())
        }
        async fn playlist_page(&self, _: &str, _: &str, _: u32) -> Result<PlaylistPage, ApiError> {
            Ok(PlaylistPage::default())
        }
        async fn add_items(&self, _: &str, _: &str, _: &[String]) -> Result<(), ApiError> {
            Ok(())
        }
        async fn remove_items(&self, _: &str, _: &str, _: &[String]) -> Result<(), ApiError> {
            Ok(())
        }
        async fn reorder_items(&self, _: &str, _: &str, _: u32, _: u32) -> Result<(), ApiError> {
            Ok(())
        }
        async fn create_playlist(&self, _: &str, _: &str, _: &str) -> Result<String, ApiError> {
            Ok("archive".to_string())
        }
    }

    async fn app(secret: &str) -> Router {
        let store = Store::in_memory().await.unwrap();
        let config = EngineConfig::default();
        let api = GatedSpotify::new(
            Arc::new(IdleSpotify),
            Arc::new(RateBudget::new(config.budget)),
            Duration::from_secs(1),
        );
        let engine = Engine::new(store, api, NotificationQueue::disabled(), config);
        build_router(AppState::new(Arc::new(engine), secret))
    }

    fn trigger(secret: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri("/api/cycle");
        if let Some(secret) = secret {
            builder = builder.header(SECRET_HEADER, secret);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_needs_no_secret() {
        let response = app("s3cret")
            .await
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["cycles_run"], 0);
    }

    #[tokio::test]
    async fn test_wrong_or_missing_secret_is_unauthorized() {
        let app = app("s3cret").await;
        let response = app.clone().oneshot(trigger(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let response = app.oneshot(trigger(Some("guess"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_empty_secret_closes_the_trigger() {
        let response = app("").await.oneshot(trigger(Some(""))).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_valid_trigger_returns_counters() {
        let response = app("s3cret").await.oneshot(trigger(Some("s3cret"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["users_polled"], 0);
        assert_eq!(body["aborted"], false);
    }

    #[test]
    fn test_secret_comparison() {
        assert!(secret_matches("abc", "abc"));
        assert!(!secret_matches("abc", "abd"));
        assert!(!secret_matches("abc", "abcd"));
        assert!(!secret_matches("", ""));
    }
}
