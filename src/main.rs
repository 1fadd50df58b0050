use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use zai_gateway::models::config::{Config, DESCRIPTION, VERSION};
use zai_gateway::proxy::common::mask_api_key;
use zai_gateway::proxy::handlers::AppState;
use zai_gateway::proxy::monitor::spawn_memory_watchdog;
use zai_gateway::proxy::server::GatewayServer;

#[tokio::main]
async fn main() {
    let cfg = Arc::new(Config::from_env());

    let default_level = if cfg.debug_mode { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    info!("zai-gateway v{} - {}", VERSION, DESCRIPTION);
    info!("performance mode: {}", cfg.performance_mode.as_str());
    info!(
        "retries: {} base delay: {}ms request timeout: {}ms stream timeout: {}ms",
        cfg.max_retries, cfg.retry_delay_ms, cfg.request_timeout_ms, cfg.stream_timeout_ms
    );
    info!(
        "pacing: {}-{}ms  max concurrent: {}  stream buffer: {} bytes",
        cfg.random_delay_min_ms,
        cfg.random_delay_max_ms,
        cfg.max_concurrent_connections,
        cfg.stream_buffer_size
    );
    info!(
        "connection check: {} (interval {})  anonymous tokens: {}  think tags: {:?}",
        !cfg.disable_connection_check,
        cfg.connection_check_interval,
        cfg.anon_token_enabled,
        cfg.think_tags_mode
    );
    info!(
        "models: {}  api key: {}",
        cfg.public_model_names().join(", "),
        mask_api_key(&cfg.default_api_key)
    );
    info!("upstream: {}", cfg.upstream_url);

    let state = AppState::new(cfg.clone());

    if cfg.enable_metrics {
        spawn_memory_watchdog(cfg.clone(), state.counters.clone(), state.started_at);
    }

    let (server, handle) = match GatewayServer::start(cfg, state).await {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("failed to start gateway: {}", e);
            std::process::exit(1);
        }
    };

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown requested");
    server.stop().await;
    handle.await.ok();
}
