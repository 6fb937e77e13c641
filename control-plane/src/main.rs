use std::net::SocketAddr;

use anyhow::Context;
use control_plane::{load_or_default, Engine};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "control_plane=info".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting control plane");

    let config_path = std::env::var("CONTROL_PLANE_CONFIG").unwrap_or_else(|_| "config".into());
    let cfg = load_or_default(&config_path);

    if cfg.metrics.enabled {
        let addr: SocketAddr = cfg
            .metrics
            .listen_addr
            .parse()
            .context("invalid metrics.listen_addr")?;
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install prometheus exporter")?;
        info!(%addr, "prometheus metrics endpoint started");
    }

    let engine = Engine::init(&cfg)
        .await
        .context("failed to initialize control plane engine")?;

    let waf_poll_interval = std::time::Duration::from_millis(cfg.nginx.poll_interval_ms.max(250));
    let waf_ingestor = engine.waf_ingestor.clone();
    let waf_poll_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(waf_poll_interval);
        loop {
            ticker.tick().await;
            waf_ingestor.poll_once().await;
        }
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal"),
        Err(err) => warn!(%err, "failed to listen for shutdown signal"),
    }

    waf_poll_task.abort();
    engine.shutdown().await;

    Ok(())
}
