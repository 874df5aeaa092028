// Infrastructure layer (shared components)
pub mod infrastructure;

// Cross-cutting modules
pub mod config;
pub mod error;
pub mod metrics;

// Domain layer
pub mod queue;
pub mod snapshot;
pub mod store;

// Application layer
pub mod api;
pub mod server;

// Supporting modules
pub mod tasks;
