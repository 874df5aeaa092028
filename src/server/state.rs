use std::sync::Arc;
use std::time::Instant;

use crate::api::RetryPolicy;
use crate::config::Settings;
use crate::queue::OperationQueue;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub queue: Arc<OperationQueue>,
    pub retry: Arc<RetryPolicy>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(settings: Settings, queue: Arc<OperationQueue>) -> Self {
        let retry = Arc::new(RetryPolicy::from_config(&settings.retry));

        Self {
            settings: Arc::new(settings),
            queue,
            retry,
            start_time: Instant::now(),
        }
    }
}
