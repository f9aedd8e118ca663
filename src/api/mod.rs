//! HTTP status surface. Everything is read-only apart from flushing an open bucket.

use crate::config::EndpointConfig;
use crate::pipeline::{BucketAssembler, EndpointRegistry};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
	pub registry: Arc<EndpointRegistry>,
	pub assembler: BucketAssembler,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Health {
	status: &'static str,
	open_buckets: usize,
	endpoints: Vec<String>,
}

pub fn routes() -> Router<AppState> {
	Router::new()
		.route("/health", get(health))
		.route("/endpoints", get(all_endpoints))
		.route("/endpoints/{aet}", get(endpoint))
		.route("/endpoints/{aet}/buckets/{value}/close", post(close_bucket))
}

async fn health(State(state): State<AppState>) -> Json<Health> {
	let endpoints = state
		.registry
		.snapshot()
		.endpoints()
		.map(|endpoint| endpoint.aet.clone())
		.collect();

	Json(Health {
		status: "UP",
		open_buckets: state.assembler.open_buckets(),
		endpoints,
	})
}

async fn all_endpoints(State(state): State<AppState>) -> Json<Vec<EndpointConfig>> {
	Json(state.registry.snapshot().endpoints().cloned().collect())
}

async fn endpoint(State(state): State<AppState>, Path(aet): Path<String>) -> Response {
	match state.registry.snapshot().endpoint(&aet) {
		Some(endpoint) => Json(endpoint.clone()).into_response(),
		None => (StatusCode::NOT_FOUND, format!("No endpoint configured for {aet}")).into_response(),
	}
}

/// Closes the bucket `{aet}/{value}` now instead of waiting for its timeout.
async fn close_bucket(
	State(state): State<AppState>,
	Path((aet, value)): Path<(String, String)>,
) -> StatusCode {
	if state.assembler.close_bucket(&format!("{aet}/{value}")) {
		StatusCode::ACCEPTED
	} else {
		StatusCode::NOT_FOUND
	}
}
