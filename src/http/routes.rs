//! HTTP routes.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{middleware, Extension, Json, Router};
use serde::{Serialize, Serializer};
use serde_json::{json, Value};

use super::middleware::{rate_limit, ClientId};
use crate::ratelimit::{BucketMetrics, RateLimiter};

/// Body of `GET /api/status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusResponse {
    #[serde(serialize_with = "two_decimals")]
    pub capacity: f64,
    #[serde(serialize_with = "two_decimals")]
    pub rate: f64,
    #[serde(serialize_with = "two_decimals")]
    pub available_tokens: f64,
}

impl From<BucketMetrics> for StatusResponse {
    fn from(metrics: BucketMetrics) -> Self {
        Self {
            capacity: metrics.capacity,
            rate: metrics.rate,
            available_tokens: metrics.available_tokens,
        }
    }
}

fn two_decimals<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64((value * 100.0).round() / 100.0)
}

/// Build the application router with rate limiting applied to every route.
pub fn router(rate_limiter: Arc<RateLimiter>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/data", get(data))
        .route("/api/status", get(status))
        .layer(middleware::from_fn_with_state(rate_limiter.clone(), rate_limit))
        .with_state(rate_limiter)
}

async fn index() -> Json<Value> {
    Json(json!({ "message": "Hello, World!" }))
}

async fn data() -> Json<Value> {
    Json(json!({ "data": [1, 2, 3, 4, 5] }))
}

async fn status(
    State(rate_limiter): State<Arc<RateLimiter>>,
    Extension(ClientId(client)): Extension<ClientId>,
) -> Json<StatusResponse> {
    Json(rate_limiter.get_metrics(&client).into())
}
