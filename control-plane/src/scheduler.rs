//! A single ticker that fans out to every periodic maintenance task this
//! engine runs on a shared cadence: ban expiry, certificate renewal,
//! detection-counter GC, WAF backfill, and provider-registry refresh.
//! `BanQueue`'s flush and `BanSync`'s provider reconciliation run on their
//! own independent tickers (see `ban_queue::BanQueue::run`,
//! `ban_sync::BanSync::run`) since both have their own rate-sensitive
//! cadences that must hold regardless of this interval. One tick interval
//! drives everything listed above so there's a single place to reason
//! about startup ordering and overlap — a tick that takes longer than the
//! interval just runs the next one back-to-back, ticks never stack
//! concurrently.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::certs::CertOrchestrator;
use crate::crypto::CredCrypto;
use crate::detection::DetectionEngine;
use crate::providers::ProviderRegistry;
use crate::stats_cache::StatsCache;
use crate::store::Store;
use crate::waf_ingest::WafIngestor;

const COUNTER_MAX_AGE_SECONDS: i64 = 3600;

pub struct Scheduler {
    store: Store,
    crypto: CredCrypto,
    detection: Arc<DetectionEngine>,
    providers: Arc<ProviderRegistry>,
    waf_ingestor: Arc<WafIngestor>,
    certs: Arc<CertOrchestrator>,
    stats_cache: Arc<StatsCache>,
    tick_interval: Duration,
    shutdown: AtomicBool,
    notify: Notify,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        crypto: CredCrypto,
        detection: Arc<DetectionEngine>,
        providers: Arc<ProviderRegistry>,
        waf_ingestor: Arc<WafIngestor>,
        certs: Arc<CertOrchestrator>,
        stats_cache: Arc<StatsCache>,
        tick_interval_seconds: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            crypto,
            detection,
            providers,
            waf_ingestor,
            certs,
            stats_cache,
            tick_interval: Duration::from_secs(tick_interval_seconds),
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Runs the tick loop until `shutdown` is called. Spawn this as its
    /// own task from the composition root.
    pub async fn run(self: Arc<Self>) {
        info!(interval_s = self.tick_interval.as_secs(), "scheduler started");
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            self.tick().await;
            tokio::select! {
                _ = tokio::time::sleep(self.tick_interval) => {}
                _ = self.notify.notified() => {}
            }
        }
        info!("scheduler stopped");
    }

    async fn tick(&self) {
        if let Err(err) = self.providers.refresh(&self.store, &self.crypto).await {
            warn!(error = %err, "provider registry refresh failed");
        }

        self.sweep_expired_bans().await;
        self.detection.gc_counters(COUNTER_MAX_AGE_SECONDS);

        if let Err(err) = self.waf_ingestor.backfill_unresolved().await {
            warn!(error = %err, "waf backfill sweep failed");
        }

        match self.certs.renew_due().await {
            Ok(renewed) if !renewed.is_empty() => info!(count = renewed.len(), "certificates renewed"),
            Ok(_) => {}
            Err(err) => error!(error = %err, "certificate renewal sweep failed"),
        }

        if let Err(err) = self.stats_cache.refresh().await {
            warn!(error = %err, "stats cache refresh failed");
        }
    }

    async fn sweep_expired_bans(&self) {
        let expired = match self.store.list_expired_bans().await {
            Ok(bans) => bans,
            Err(err) => {
                warn!(error = %err, "failed to list expired bans");
                return;
            }
        };
        for ban in expired {
            if let Err(err) = self.store.unban(ban.id).await {
                warn!(ban_id = ban.id, error = %err, "failed to mark ban expired in store");
            }
        }
    }
}
