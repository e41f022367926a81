//! HTTP surface of the dispatch server

use super::error::DispatchError;
use super::pipeline::{Completed, Pipeline};
use crate::health::HealthResponse;
use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use voxshift_common::AudioId;

/// Raw query parameters, validated by hand so malformed ids get a readable 400
#[derive(Debug, Deserialize)]
pub struct GenerateParams {
    pub source_id: Option<String>,
    pub reference_id: Option<String>,
}

pub fn build_router(pipeline: Pipeline) -> Router {
    Router::new()
        .route("/", get(generate))
        .route("/queue", get(queue_size))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(pipeline)
}

/// GET /?source_id=<id>&reference_id=<id>
async fn generate(
    State(pipeline): State<Pipeline>,
    Query(params): Query<GenerateParams>,
) -> Result<Json<Completed>, DispatchError> {
    let source_id = parse_id(params.source_id.as_deref(), "source_id")?;
    let reference_id = parse_id(params.reference_id.as_deref(), "reference_id")?;

    let completed = pipeline.submit(source_id, reference_id).await?;
    Ok(Json(completed))
}

fn parse_id(raw: Option<&str>, name: &str) -> Result<AudioId, DispatchError> {
    raw.and_then(|value| value.parse::<AudioId>().ok())
        .ok_or_else(|| DispatchError::BadRequest(format!("Malformed {}", name)))
}

/// GET /queue
///
/// Plain-text depth of the incoming queue, polled by the load balancer.
async fn queue_size(State(pipeline): State<Pipeline>) -> String {
    pipeline.queue_size().to_string()
}

async fn health(State(pipeline): State<Pipeline>) -> Json<HealthResponse> {
    Json(HealthResponse {
        queue_size: Some(pipeline.queue_size()),
        ..HealthResponse::ok()
    })
}
