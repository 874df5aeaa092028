//! API layer - HTTP endpoint handlers.

mod health;
mod metrics;
pub mod queue;
pub mod retry;
mod routes;

pub use health::health;
pub use metrics::prometheus_metrics;
pub use queue::{
    create_snapshot, delete_items, enqueue_item, latest_snapshot, list_items, patch_queue,
};
pub use retry::RetryPolicy;
pub use routes::api_routes;
