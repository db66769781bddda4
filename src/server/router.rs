//! HTTP router and handlers

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State},
    http::{HeaderName, HeaderValue, Method, Request, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{debug, warn};

use crate::cache::Cached;
use crate::error::codes;
use crate::failsafe::RateLimiter;
use crate::feeds::{Aggregator, FeedSnapshot};
use crate::{Error, Result};

const X_CACHE: HeaderName = HeaderName::from_static("x-cache");
const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Shared application state
pub struct AppState {
    /// Feeds
    pub aggregator: Arc<Aggregator>,
    /// Inbound rate limiter
    pub rate_limiter: Arc<RateLimiter>,
    /// Per-request deadline
    pub request_timeout: Duration,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/gas", get(gas_handler))
        .route("/liquidations", get(liquidations_handler))
        .route("/whales", get(whales_handler))
        .route("/block-height", get(block_height_handler))
        .route("/providers", get(providers_handler))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.rate_limiter),
            rate_limit_middleware,
        ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET]);

    Router::new()
        .route("/health", get(health_handler))
        .nest("/api/v2", api)
        .fallback(not_found_handler)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(CatchPanicLayer::new())
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    state.request_timeout,
                ))
                .layer(CompressionLayer::new())
                .layer(cors),
        )
        .with_state(state)
}

/// Query parameters for `/api/v2/gas`
#[derive(Debug, Deserialize)]
pub struct GasQuery {
    /// `all` (default) or a network name
    pub network: Option<String>,
}

/// Error body returned by every endpoint
#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: String,
    code: &'a str,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.aggregator.provider_health();
    let unhealthy: Vec<&str> = health
        .iter()
        .filter(|h| !h.healthy)
        .map(|h| h.provider.as_str())
        .collect();

    // Fallbacks keep every feed answering, so the service itself stays 200
    Json(json!({
        "status": if unhealthy.is_empty() { "healthy" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "providers": {
            "tracked": health.len(),
            "unhealthy": unhealthy,
        }
    }))
}

async fn gas_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<GasQuery>,
) -> Response {
    let feed = &state.aggregator.gas;
    feed_response(feed.snapshot(query.network.as_deref()).await, feed.ttl())
}

async fn liquidations_handler(State(state): State<Arc<AppState>>) -> Response {
    let feed = &state.aggregator.liquidations;
    feed_response(feed.snapshot().await, feed.ttl())
}

async fn whales_handler(State(state): State<Arc<AppState>>) -> Response {
    let feed = &state.aggregator.whales;
    feed_response(feed.snapshot().await, feed.ttl())
}

async fn block_height_handler(State(state): State<Arc<AppState>>) -> Response {
    let feed = &state.aggregator.block_height;
    feed_response(feed.snapshot().await, feed.ttl())
}

async fn providers_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let aggregator = &state.aggregator;
    let gas: Map<String, Value> = aggregator
        .gas
        .providers()
        .into_iter()
        .map(|(network, names)| (network.to_string(), json!(names)))
        .collect();

    Json(json!({
        "feeds": {
            "gas": gas,
            "liquidations": aggregator.liquidations.providers(),
            "whales": aggregator.whales.providers(),
            "block_height": aggregator.block_height.providers(),
        },
        "health": aggregator.provider_health(),
        "cache": {
            "gas": aggregator.gas.cache_stats(),
            "liquidations": aggregator.liquidations.cache_stats(),
            "whales": aggregator.whales.cache_stats(),
            "block_height": aggregator.block_height.cache_stats(),
        },
    }))
}

async fn not_found_handler(request: Request<Body>) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            error: format!("No route for {} {}", request.method(), request.uri().path()),
            code: codes::NOT_FOUND,
        }),
    )
        .into_response()
}

/// 200 with the snapshot as JSON plus caching headers, or the error
fn feed_response<T: Serialize>(result: Result<Cached<FeedSnapshot<T>>>, ttl: Duration) -> Response {
    let cached = match result {
        Ok(cached) => cached,
        Err(e) => return error_response(&e),
    };

    let ttl_secs = ttl.as_secs().max(1);
    let cache_control = format!(
        "public, s-maxage={ttl_secs}, stale-while-revalidate={}",
        ttl_secs * 2
    );

    (
        StatusCode::OK,
        [
            (header::CACHE_CONTROL, cache_control),
            (X_CACHE, cached.freshness.header_value().to_string()),
            (header::AGE, cached.age.as_secs().to_string()),
        ],
        Json(cached.value),
    )
        .into_response()
}

fn error_response(error: &Error) -> Response {
    let status = StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        warn!(status = status.as_u16(), error = %error, "Request failed");
    } else {
        debug!(status = status.as_u16(), error = %error, "Request rejected");
    }

    (
        status,
        Json(ErrorBody {
            error: error.to_string(),
            code: error.error_code(),
        }),
    )
        .into_response()
}

/// Inbound rate limit; health checks bypass it
async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !limiter.is_enabled() {
        return next.run(request).await;
    }

    let limit = HeaderValue::from(limiter.limit());
    let Some(permit) = limiter.try_acquire() else {
        debug!(path = %request.uri().path(), "Inbound rate limit exceeded");
        return rate_limited_response(limit);
    };

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(X_RATELIMIT_LIMIT, limit);
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(permit.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(permit.reset_at));
    response
}

/// Create a 429 Rate Limited response
fn rate_limited_response(limit: HeaderValue) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [
            (header::RETRY_AFTER, HeaderValue::from_static("1")),
            (X_RATELIMIT_LIMIT, limit),
            (X_RATELIMIT_REMAINING, HeaderValue::from_static("0")),
        ],
        Json(ErrorBody {
            error: "Rate limit exceeded. Try again later.".to_string(),
            code: codes::RATE_LIMITED,
        }),
    )
        .into_response()
}
