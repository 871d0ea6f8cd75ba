use std::sync::Arc;

use crate::config::Config;
use crate::observability::Metrics;
use crate::producer::Producer;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub producer: Arc<Producer>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(config: Config, producer: Producer, metrics: Arc<Metrics>) -> Self {
        Self {
            config: Arc::new(config),
            producer: Arc::new(producer),
            metrics,
        }
    }
}
