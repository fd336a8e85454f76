//! `/`, `/ping`, `/_status`, `/health` (§4.7.8).
//!
//! Grounded in `server/src/lib.rs`'s `mod health { healthz, readyz }` pair,
//! generalized from a fixed liveness/readiness split to the four routes the
//! cluster surface names.

use std::sync::Arc;

use axum::Json;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;

use crate::cluster::Cluster;

/// `ws_path` is the path the wire upgrade route already claims; `/` is only
/// registered here as a liveness alias when the wire socket lives elsewhere.
pub fn router(cluster: Arc<Cluster>, ws_path: &str) -> Router {
    let mut router = Router::new()
        .route("/ping", get(ping))
        .route("/_status", get(status))
        .route("/health", get(status));
    if ws_path != "/" {
        router = router.route("/", get(ping));
    }
    router.with_state(cluster)
}

async fn ping(axum::extract::State(cluster): axum::extract::State<Arc<Cluster>>) -> (StatusCode, &'static str) {
    if cluster.is_ready().await {
        (StatusCode::OK, "Ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable")
    }
}

async fn status(axum::extract::State(cluster): axum::extract::State<Arc<Cluster>>) -> Json<mesh_protocol::StatusResponse> {
    Json(cluster.status().await)
}
