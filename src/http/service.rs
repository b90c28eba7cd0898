//! HTTP endpoints for rate-limit decisions.

use axum::extract::{ConnectInfo, MatchedPath, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::metrics::Metrics;
use crate::ratelimit::{CallerKey, RateLimiterBackend, Verdict};

/// Remaining quota, as a response header.
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
/// Reset time in epoch seconds, as a response header.
pub const RESET_HEADER: &str = "x-ratelimit-reset";

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    limiter: Arc<dyn RateLimiterBackend>,
    metrics: Arc<Metrics>,
    request_timeout: Duration,
}

impl AppState {
    /// Bundle the limiter, metrics and per-decision deadline.
    pub fn new(
        limiter: Arc<dyn RateLimiterBackend>,
        metrics: Arc<Metrics>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            limiter,
            metrics,
            request_timeout,
        }
    }

    /// The limiter deciding requests.
    pub fn limiter(&self) -> &Arc<dyn RateLimiterBackend> {
        &self.limiter
    }

    /// The metrics this state records into.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}

/// JSON body of a decision response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionBody {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

impl From<&Verdict> for DecisionBody {
    fn from(verdict: &Verdict) -> Self {
        Self {
            allowed: verdict.allowed(),
            remaining: verdict.remaining(),
            reset_at: verdict.reset_at(),
        }
    }
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/rate-limit", post(check_rate_limit))
        .route("/healthz", get(healthz))
        .route("/metrics", get(render_metrics))
        .route_layer(middleware::from_fn_with_state(state.clone(), track_duration))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Decide whether the calling principal may proceed.
///
/// A store failure becomes a plain 500; it is never reported as a denial
/// and is not counted as a decision.
async fn check_rate_limit(State(state): State<AppState>, request: Request) -> Response {
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string());
    let key = CallerKey::resolve(request.headers(), remote_addr.as_deref());
    let now = Utc::now();

    match state
        .limiter
        .allow_within(&key, now, state.request_timeout)
        .await
    {
        Ok(verdict) => {
            state.metrics.record_decision(verdict.allowed());
            info!(
                key = %key,
                allowed = verdict.allowed(),
                remaining = verdict.remaining(),
                reset_at = %verdict.reset_at(),
                "Rate limit decision made"
            );
            decision_response(&verdict, now)
        }
        Err(err) => {
            state.metrics.record_store_error(err.kind());
            error!(key = %key, error = %err, "Rate limit decision failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

fn decision_response(verdict: &Verdict, now: DateTime<Utc>) -> Response {
    let status = if verdict.allowed() {
        StatusCode::OK
    } else {
        StatusCode::TOO_MANY_REQUESTS
    };

    let mut response = (status, Json(DecisionBody::from(verdict))).into_response();
    let headers = response.headers_mut();
    headers.insert(REMAINING_HEADER, HeaderValue::from(verdict.remaining()));
    headers.insert(RESET_HEADER, HeaderValue::from(verdict.reset_at().timestamp()));
    if !verdict.allowed() {
        headers.insert(
            header::RETRY_AFTER,
            HeaderValue::from(verdict.retry_after(now).as_secs()),
        );
    }
    response
}

async fn healthz() -> &'static str {
    "Health's ok"
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn track_duration(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let method = request.method().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    state
        .metrics
        .observe_request(&path, &method, response.status().as_u16(), start.elapsed());
    response
}
