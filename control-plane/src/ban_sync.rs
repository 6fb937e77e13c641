//! Periodically reconciles desired ban state (active, non-whitelisted rows
//! in the store) against each provider's actual banned-IP list, enqueuing
//! corrective ops on `BanQueue` so drift self-heals without an operator
//! noticing. Runs on its own ticker, independent of the scheduler and of
//! `BanQueue`'s flush cadence. Errors on one integration never stop the
//! others — each is swallowed and recorded against that integration alone.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use tokio::sync::{Notify, RwLock};
use tracing::warn;

use crate::ban_queue::{BanAction, BanOp, BanQueue};
use crate::providers::ProviderRegistry;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct SyncStatus {
    pub last_run: Option<DateTime<Utc>>,
    pub last_duration_ms: Option<u64>,
    pub last_error: Option<String>,
}

pub struct BanSync {
    store: Store,
    registry: Arc<ProviderRegistry>,
    ban_queue: Arc<BanQueue>,
    status: RwLock<SyncStatus>,
    shutdown: AtomicBool,
    notify: Notify,
}

impl BanSync {
    pub fn new(store: Store, registry: Arc<ProviderRegistry>, ban_queue: Arc<BanQueue>) -> Arc<Self> {
        Arc::new(Self {
            store,
            registry,
            ban_queue,
            status: RwLock::new(SyncStatus {
                last_run: None,
                last_duration_ms: None,
                last_error: None,
            }),
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    pub async fn status(&self) -> SyncStatus {
        self.status.read().await.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Runs its own ticker on `interval`, separate from both the
    /// scheduler's tick and `BanQueue`'s flush ticker. Spawn this once
    /// from the composition root; it exits when `shutdown()` is called.
    pub async fn run(self: Arc<Self>, interval: Duration) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            self.run_once().await;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.notify.notified() => {}
            }
        }
    }

    /// One full sync cycle across every configured integration. Call this
    /// on the configured sync interval from the scheduler.
    pub async fn run_once(&self) {
        let started = std::time::Instant::now();
        let mut last_error = None;

        let whitelist_nets = match self.store.list_whitelist().await {
            Ok(rows) => whitelist_nets(&rows),
            Err(err) => {
                last_error = Some(err.to_string());
                Vec::new()
            }
        };

        let desired: HashSet<_> = match self.store.list_active_bans().await {
            Ok(bans) => bans
                .into_iter()
                .map(|b| b.ip_address)
                .filter(|ip| !whitelist_nets.iter().any(|net| net.contains(ip)))
                .collect(),
            Err(err) => {
                last_error = Some(err.to_string());
                HashSet::new()
            }
        };

        for integration_id in self.registry.all_ids() {
            if let Err(err) = self.sync_integration(integration_id, &desired).await {
                warn!(integration_id, error = %err, "ban sync failed for integration");
                last_error = Some(err.to_string());
            }
        }

        let mut status = self.status.write().await;
        status.last_run = Some(Utc::now());
        status.last_duration_ms = Some(started.elapsed().as_millis() as u64);
        status.last_error = last_error;
    }

    async fn sync_integration(
        &self,
        integration_id: i64,
        desired: &HashSet<std::net::IpAddr>,
    ) -> crate::error::Result<()> {
        let provider = match self.registry.get(integration_id) {
            Some(p) => p,
            None => return Ok(()),
        };
        if !provider.capabilities().supports_list {
            return Ok(());
        }
        let actual: HashSet<_> = provider.get_banned_ips().await?.into_iter().collect();

        for missing in desired.difference(&actual) {
            self.ban_queue.enqueue(
                integration_id,
                BanOp {
                    action: BanAction::Ban,
                    ip: *missing,
                    reason: Some("sync: present in store but not at provider".into()),
                    duration_s: None,
                    severity: None,
                    ban_record_id: None,
                    provider_ban_id: None,
                    retry_count: 0,
                },
            );
        }
        for extra in actual.difference(desired) {
            self.ban_queue.enqueue(
                integration_id,
                BanOp {
                    action: BanAction::Unban,
                    ip: *extra,
                    reason: Some("sync: present at provider but not in store".into()),
                    duration_s: None,
                    severity: None,
                    ban_record_id: None,
                    provider_ban_id: None,
                    retry_count: 0,
                },
            );
        }
        Ok(())
    }
}

/// Parses whitelist rows into CIDR nets so a sync cycle can keep
/// whitelisted IPs out of the desired-ban set even if they somehow
/// ended up with an active `ip_bans` row.
fn whitelist_nets(rows: &[control_plane_types::IpWhitelist]) -> Vec<IpNet> {
    rows.iter()
        .filter_map(|row| {
            if let Some(range) = &row.ip_range {
                range.parse::<IpNet>().ok()
            } else {
                row.ip_address.map(IpNet::from)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_once_with_no_integrations_records_a_clean_run() {
        let store = Store::open(":memory:").await.unwrap();
        let registry = ProviderRegistry::new();
        let ban_queue = BanQueue::new(registry.clone(), store.clone(), 3, 100);
        let sync = BanSync::new(store, registry, ban_queue);
        sync.run_once().await;
        let status = sync.status().await;
        assert!(status.last_run.is_some());
        assert!(status.last_error.is_none());
    }

    #[test]
    fn whitelist_nets_excludes_matching_single_ip_and_range() {
        use control_plane_types::{IpWhitelist, WhitelistType};
        let rows = vec![
            IpWhitelist {
                id: 1,
                ip_address: Some("203.0.113.5".parse().unwrap()),
                ip_range: None,
                entry_type: WhitelistType::Manual,
                reason: "trusted".into(),
                priority: 0,
                added_by: None,
            },
            IpWhitelist {
                id: 2,
                ip_address: None,
                ip_range: Some("198.51.100.0/24".into()),
                entry_type: WhitelistType::System,
                reason: "internal range".into(),
                priority: 0,
                added_by: None,
            },
        ];
        let nets = whitelist_nets(&rows);
        let single: std::net::IpAddr = "203.0.113.5".parse().unwrap();
        let in_range: std::net::IpAddr = "198.51.100.42".parse().unwrap();
        let outside: std::net::IpAddr = "203.0.113.6".parse().unwrap();
        assert!(nets.iter().any(|n| n.contains(&single)));
        assert!(nets.iter().any(|n| n.contains(&in_range)));
        assert!(!nets.iter().any(|n| n.contains(&outside)));
    }
}
