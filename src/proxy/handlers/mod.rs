// HTTP handlers and shared application state

pub mod health;
pub mod openai;

use std::sync::Arc;
use std::time::Instant;

use crate::models::config::Config;
use crate::proxy::admission::AdmissionGate;
use crate::proxy::monitor::Counters;
use crate::proxy::upstream::client::UpstreamClient;

/// State shared by all handlers: the frozen config snapshot, the atomic
/// counters, the admission gate, and the pooled upstream client.
#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub counters: Arc<Counters>,
    pub gate: AdmissionGate,
    pub upstream: Arc<UpstreamClient>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(cfg: Arc<Config>) -> Self {
        let counters = Arc::new(Counters::new());
        let gate = AdmissionGate::new(cfg.max_concurrent_connections, counters.clone());
        let upstream = Arc::new(UpstreamClient::new(cfg.clone()));
        Self {
            cfg,
            counters,
            gate,
            upstream,
            started_at: Instant::now(),
        }
    }
}
