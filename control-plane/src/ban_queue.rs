//! Per-integration priority FIFO with duplicate
//! suppression, its own independent flush ticker, batching where a
//! provider supports it, and bounded retries with exponential backoff.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use control_plane_types::{IntegrationNotification, Severity};
use dashmap::DashMap;
use metrics::counter;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::providers::{ProviderHandle, ProviderRegistry};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanAction {
    Ban,
    Unban,
}

#[derive(Debug, Clone)]
pub struct BanOp {
    pub action: BanAction,
    pub ip: IpAddr,
    pub reason: Option<String>,
    pub duration_s: Option<u64>,
    pub severity: Option<Severity>,
    pub ban_record_id: Option<i64>,
    pub provider_ban_id: Option<String>,
    pub retry_count: u32,
}

fn priority_rank(severity: Option<Severity>) -> u8 {
    match severity {
        Some(Severity::Critical) => 1,
        Some(Severity::High) => 2,
        Some(Severity::Medium) => 3,
        Some(Severity::Low) => 4,
        None => 5,
    }
}

struct IntegrationQueue {
    ops: VecDeque<BanOp>,
    processing: bool,
}

pub struct BanQueue {
    queues: DashMap<i64, IntegrationQueue>,
    registry: Arc<ProviderRegistry>,
    store: Store,
    max_retries: u32,
    inter_op_spacing: Duration,
    shutdown: AtomicBool,
    notify: Notify,
}

impl BanQueue {
    pub fn new(registry: Arc<ProviderRegistry>, store: Store, max_retries: u32, inter_op_spacing_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            queues: DashMap::new(),
            registry,
            store,
            max_retries,
            inter_op_spacing: Duration::from_millis(inter_op_spacing_ms),
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Runs its own ticker on `interval`, independent of the scheduler's
    /// cadence and of `BanSync`'s ticker, so the ≥5 s inter-flush spacing
    /// this integration's rate limit depends on holds regardless of how
    /// the scheduler's own tick interval is configured. Spawn this once
    /// from the composition root; it exits when `shutdown()` is called.
    pub async fn run(self: Arc<Self>, interval: Duration) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            self.flush_all().await;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.notify.notified() => {}
            }
        }
    }

    pub fn enqueue(&self, integration_id: i64, op: BanOp) {
        let mut entry = self.queues.entry(integration_id).or_insert_with(|| IntegrationQueue {
            ops: VecDeque::new(),
            processing: false,
        });
        let duplicate = entry
            .ops
            .iter()
            .any(|existing| existing.action == op.action && existing.ip == op.ip);
        if duplicate {
            return;
        }
        let rank = priority_rank(op.severity);
        let insert_at = entry
            .ops
            .iter()
            .position(|existing| priority_rank(existing.severity) > rank)
            .unwrap_or(entry.ops.len());
        entry.ops.insert(insert_at, op);
    }

    /// Runs one flush cycle across every integration not currently
    /// flushing. Call this on `run`'s own ticker, or directly from a test.
    pub async fn flush_all(&self) {
        let integration_ids: Vec<i64> = self.queues.iter().map(|e| *e.key()).collect();
        let futures = integration_ids.into_iter().map(|id| self.flush_one(id));
        futures::future::join_all(futures).await;
    }

    async fn flush_one(&self, integration_id: i64) {
        {
            let mut entry = match self.queues.get_mut(&integration_id) {
                Some(e) => e,
                None => return,
            };
            if entry.processing || entry.ops.is_empty() {
                return;
            }
            entry.processing = true;
        }

        let provider = match self.registry.get(integration_id) {
            Some(p) => p,
            None => {
                if let Some(mut entry) = self.queues.get_mut(&integration_id) {
                    entry.processing = false;
                }
                return;
            }
        };

        let ops: Vec<BanOp> = {
            let entry = self.queues.get(&integration_id).unwrap();
            entry.ops.iter().cloned().collect()
        };

        let (succeeded, failed) = self.execute(&provider, &ops).await;

        for op in succeeded.iter().filter(|o| o.action == BanAction::Ban) {
            if let Some(ban_id) = op.ban_record_id {
                let notification = IntegrationNotification {
                    integration_id: provider.integration_id(),
                    integration_name: provider.name().to_string(),
                    provider_ban_id: op.provider_ban_id.clone(),
                    notified_at: Utc::now(),
                };
                if let Err(err) = self.store.record_integration_notified(ban_id, &notification).await {
                    warn!(ban_id, error = %err, "failed to record integration notification");
                }
            }
        }

        if let Some(mut entry) = self.queues.get_mut(&integration_id) {
            entry.ops.retain(|op| {
                if succeeded.iter().any(|s| s.ip == op.ip && s.action == op.action) {
                    false
                } else if let Some(bumped) = failed.iter().find(|f| f.ip == op.ip && f.action == op.action) {
                    if bumped.retry_count > self.max_retries {
                        warn!(ip = %op.ip, "dropping ban op after exceeding retry cap");
                        false
                    } else {
                        true
                    }
                } else {
                    true
                }
            });
            for bumped in &failed {
                if let Some(existing) = entry
                    .ops
                    .iter_mut()
                    .find(|o| o.ip == bumped.ip && o.action == bumped.action)
                {
                    existing.retry_count = bumped.retry_count;
                }
            }
            entry.processing = false;
        }

        let bans_sent = succeeded.iter().filter(|o| o.action == BanAction::Ban).count() as u64;
        let unbans_sent = succeeded.iter().filter(|o| o.action == BanAction::Unban).count() as u64;
        let outcome_ok = !succeeded.is_empty() || ops.is_empty();
        let _ = self
            .store
            .record_integration_outcome(integration_id, outcome_ok, None, bans_sent, unbans_sent)
            .await;
        counter!("control_plane_ban_ops_flushed_total").increment(succeeded.len() as u64);
    }

    async fn execute(&self, provider: &ProviderHandle, ops: &[BanOp]) -> (Vec<BanOp>, Vec<BanOp>) {
        let mut succeeded = Vec::new();
        let mut failed = Vec::new();

        let bans: Vec<&BanOp> = ops.iter().filter(|o| o.action == BanAction::Ban).collect();
        let unbans: Vec<&BanOp> = ops.iter().filter(|o| o.action == BanAction::Unban).collect();

        if provider.capabilities().supports_batch {
            if !bans.is_empty() {
                match provider.batch_ban(&bans).await {
                    Ok(_) => succeeded.extend(bans.iter().map(|o| (*o).clone())),
                    Err(_) => failed.extend(bans.iter().map(|o| bump(o))),
                }
            }
            if !unbans.is_empty() {
                match provider.batch_unban(&unbans).await {
                    Ok(_) => succeeded.extend(unbans.iter().map(|o| (*o).clone())),
                    Err(_) => failed.extend(unbans.iter().map(|o| bump(o))),
                }
            }
        } else {
            for op in ops {
                match op.action {
                    BanAction::Ban => match provider.ban(op).await {
                        Ok(provider_ban_id) => {
                            let mut done = op.clone();
                            done.provider_ban_id = provider_ban_id;
                            succeeded.push(done);
                        }
                        Err(_) => failed.push(bump(op)),
                    },
                    BanAction::Unban => match provider.unban(op).await {
                        Ok(()) => succeeded.push(op.clone()),
                        Err(_) => failed.push(bump(op)),
                    },
                }
                tokio::time::sleep(self.inter_op_spacing).await;
            }
        }

        (succeeded, failed)
    }
}

fn bump(op: &BanOp) -> BanOp {
    let mut op = op.clone();
    op.retry_count += 1;
    op
}
