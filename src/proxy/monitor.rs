// Runtime counters and system status snapshots
//
// Four process-wide totals mutated only through atomic add, a read-only
// status projection for /status, and the optional 30s memory watchdog.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use sysinfo::System;
use tracing::{debug, warn};

use crate::models::config::Config;

// ============================================================================
// Counters
// ============================================================================

/// Monotonic request totals plus the current in-flight gauge. Shared across
/// all request tasks; every mutation is a single atomic RMW.
#[derive(Debug, Default)]
pub struct Counters {
    total_requests: AtomicU64,
    error_count: AtomicU64,
    total_response_ms: AtomicU64,
    current_connections: AtomicI64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response_time_ms(&self, ms: u64) {
        self.total_response_ms.fetch_add(ms, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.current_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.current_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn total_response_ms(&self) -> u64 {
        self.total_response_ms.load(Ordering::Relaxed)
    }

    pub fn current_connections(&self) -> i64 {
        self.current_connections.load(Ordering::Relaxed)
    }

    pub fn average_response_ms(&self) -> u64 {
        let total = self.total_requests();
        if total == 0 {
            return 0;
        }
        self.total_response_ms() / total
    }

    /// Error percentage over all recorded requests, truncated to a whole percent.
    pub fn error_rate_percent(&self) -> u64 {
        let total = self.total_requests();
        if total == 0 {
            return 0;
        }
        self.error_count() * 100 / total
    }
}

// ============================================================================
// Status snapshot
// ============================================================================

#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    pub current_connections: i64,
    pub max_connections: usize,
    pub memory_usage_mb: u64,
    pub memory_limit_mb: u64,
    pub total_requests: u64,
    pub error_count: u64,
    pub uptime_seconds: u64,
}

/// Project the counters plus memory stats into the /status shape.
pub fn system_status(cfg: &Config, counters: &Counters, started_at: Instant) -> StatusSnapshot {
    StatusSnapshot {
        current_connections: counters.current_connections(),
        max_connections: cfg.max_concurrent_connections,
        memory_usage_mb: memory_usage_mb(),
        memory_limit_mb: cfg.memory_limit_mb,
        total_requests: counters.total_requests(),
        error_count: counters.error_count(),
        uptime_seconds: started_at.elapsed().as_secs(),
    }
}

/// Resident memory of this process in MiB, 0 when unavailable.
pub fn memory_usage_mb() -> u64 {
    let Ok(pid) = sysinfo::get_current_pid() else {
        return 0;
    };
    let mut sys = System::new();
    if !sys.refresh_process(pid) {
        return 0;
    }
    sys.process(pid).map(|p| p.memory() / 1024 / 1024).unwrap_or(0)
}

// ============================================================================
// Memory watchdog
// ============================================================================

/// Spawn the 30s metrics ticker: logs a status line and warns when resident
/// memory exceeds the configured limit.
pub fn spawn_memory_watchdog(
    cfg: Arc<Config>,
    counters: Arc<Counters>,
    started_at: Instant,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let status = system_status(&cfg, &counters, started_at);
            debug!(
                "[Watchdog] connections={}/{} memory={}MB/{}MB requests={} errors={}",
                status.current_connections,
                status.max_connections,
                status.memory_usage_mb,
                status.memory_limit_mb,
                status.total_requests,
                status.error_count,
            );
            if status.memory_usage_mb > cfg.memory_limit_mb {
                warn!(
                    "[Watchdog] memory usage above limit: {}MB > {}MB",
                    status.memory_usage_mb, cfg.memory_limit_mb
                );
            }
        }
    })
}

// ============================================================================
// Tests
// ============================================================================
