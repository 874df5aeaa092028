use axum::{routing::get, Router};

use crate::server::AppState;

use super::health::health;
use super::metrics::prometheus_metrics;
use super::queue::{
    create_snapshot, delete_items, enqueue_item, latest_snapshot, list_items, patch_queue,
};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        // Health & metrics
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        // Operation queue
        .route(
            "/dy-queue",
            get(list_items)
                .post(enqueue_item)
                .delete(delete_items)
                .patch(patch_queue),
        )
        .route(
            "/dy-queue/snapshot",
            get(latest_snapshot).post(create_snapshot),
        )
}
