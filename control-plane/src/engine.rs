//! Composition root: builds every component from one `EngineConfig`,
//! wires them together, and owns the background tasks (reload worker,
//! scheduler tick loop, ban queue flusher, ban sync, broadcaster
//! heartbeat) for the process's lifetime.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::ban_queue::BanQueue;
use crate::ban_sync::BanSync;
use crate::broadcaster::Broadcaster;
use crate::certs::CertOrchestrator;
use crate::config::EngineConfig;
use crate::crypto::CredCrypto;
use crate::detection::DetectionEngine;
use crate::error::Result;
use crate::nginxops::NginxOps;
use crate::providers::ProviderRegistry;
use crate::reconciler::ConfigReconciler;
use crate::reload::ReloadManager;
use crate::scheduler::Scheduler;
use crate::secret::Secret;
use crate::stats_cache::{StatsCache, StatsRange};
use crate::store::Store;
use crate::waf_ingest::{WafIngestConfig as IngestPaths, WafIngestor};

pub struct Engine {
    pub store: Store,
    pub crypto: CredCrypto,
    pub broadcaster: Arc<Broadcaster>,
    pub reload: Arc<ReloadManager>,
    pub reconciler: Arc<ConfigReconciler>,
    pub detection: Arc<DetectionEngine>,
    pub providers: Arc<ProviderRegistry>,
    pub ban_queue: Arc<BanQueue>,
    pub ban_sync: Arc<BanSync>,
    pub waf_ingestor: Arc<WafIngestor>,
    pub certs: Arc<CertOrchestrator>,
    pub stats_cache: Arc<StatsCache>,
    pub scheduler: Arc<Scheduler>,
    reload_task: tokio::task::JoinHandle<()>,
    scheduler_task: tokio::task::JoinHandle<()>,
    ban_queue_task: tokio::task::JoinHandle<()>,
    ban_sync_task: tokio::task::JoinHandle<()>,
    heartbeat_task: tokio::task::JoinHandle<()>,
}

impl Engine {
    pub async fn init(cfg: &EngineConfig) -> Result<Self> {
        let store = Store::open(&cfg.store.db_path).await?;

        let master_secret = Secret::from_env_or(
            "CONTROL_PLANE_MASTER_SECRET",
            store
                .get_setting(&cfg.crypto.secret_source)
                .await?
                .unwrap_or_else(|| cfg.crypto.secret_source.clone()),
        );
        let crypto = CredCrypto::new(master_secret.into_inner());

        let nginx = Arc::new(NginxOps::new(&cfg.nginx)?);
        let reload = ReloadManager::new(nginx);
        let reconciler = Arc::new(ConfigReconciler::new(store.clone(), reload.clone(), &cfg.nginx));

        let broadcaster = Broadcaster::new(cfg.broadcaster.subscriber_queue_capacity);
        let detection = Arc::new(DetectionEngine::new(store.clone()));
        detection.refresh_whitelist().await?;

        let providers = ProviderRegistry::new();
        providers.refresh(&store, &crypto).await?;

        let ban_queue = BanQueue::new(
            providers.clone(),
            store.clone(),
            cfg.ban.max_retries,
            cfg.ban.inter_op_spacing_ms,
        );

        let ban_sync = BanSync::new(store.clone(), providers.clone(), ban_queue.clone());

        let ingest_cfg = IngestPaths {
            audit_log_paths: cfg.waf.audit_log_paths.iter().map(PathBuf::from).collect(),
            dedup_capacity: cfg.waf.dedup_capacity,
            backfill_window_minutes: cfg.waf.backfill_window_minutes,
            backfill_fallback_minutes: cfg.waf.backfill_fallback_minutes,
        };
        let waf_ingestor = Arc::new(WafIngestor::new(
            store.clone(),
            broadcaster.clone(),
            detection.clone(),
            ban_queue.clone(),
            &ingest_cfg,
        ));

        let certs = Arc::new(CertOrchestrator::new(
            store.clone(),
            reconciler.clone(),
            crypto.clone(),
            cfg.acme.clone(),
        ));

        let stats_cache = StatsCache::new(store.clone(), StatsRange::default());
        stats_cache.refresh().await?;

        let scheduler = Scheduler::new(
            store.clone(),
            crypto.clone(),
            detection.clone(),
            providers.clone(),
            waf_ingestor.clone(),
            certs.clone(),
            stats_cache.clone(),
            cfg.scheduler.tick_interval_seconds,
        );

        let reload_task = tokio::spawn(reload.clone().run());
        let scheduler_task = tokio::spawn(scheduler.clone().run());
        let ban_queue_task = tokio::spawn(
            ban_queue
                .clone()
                .run(Duration::from_secs(cfg.ban.flush_interval_seconds)),
        );
        let ban_sync_task = tokio::spawn(
            ban_sync
                .clone()
                .run(Duration::from_secs(cfg.ban.sync_interval_seconds)),
        );
        let heartbeat_task = tokio::spawn(
            broadcaster
                .clone()
                .run_heartbeat(Duration::from_secs(cfg.broadcaster.heartbeat_interval_seconds)),
        );

        info!("control plane engine initialized");

        Ok(Self {
            store,
            crypto,
            broadcaster,
            reload,
            reconciler,
            detection,
            providers,
            ban_queue,
            ban_sync,
            waf_ingestor,
            certs,
            stats_cache,
            scheduler,
            reload_task,
            scheduler_task,
            ban_queue_task,
            ban_sync_task,
            heartbeat_task,
        })
    }

    /// Tails whatever new bytes have been appended to the configured WAF
    /// log files since the last call. Run this from a tight loop or its
    /// own ticker, independent of the scheduler's coarser interval.
    pub async fn poll_waf_logs(&self) {
        self.waf_ingestor.poll_once().await;
    }

    pub async fn shutdown(self) {
        self.scheduler.shutdown();
        self.reload.shutdown();
        self.ban_queue.shutdown();
        self.ban_sync.shutdown();
        self.broadcaster.shutdown_heartbeat();
        let _ = tokio::join!(
            self.reload_task,
            self.scheduler_task,
            self.ban_queue_task,
            self.ban_sync_task,
            self.heartbeat_task
        );
        info!("control plane engine shut down");
    }
}
