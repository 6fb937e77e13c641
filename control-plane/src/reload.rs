//! At most one nginx reload in flight at a
//! time, coalescing concurrent requests into a single cycle and handing
//! every caller a stable id to poll. A single worker consumes a queue,
//! woken by `tokio::sync::Notify` instead of a channel so `queue_reload`
//! never blocks on the worker being ready.

use std::collections::VecDeque;
use std::sync::Arc;

use lru::LruCache;
use metrics::counter;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, Notify};
use tracing::{error, info, warn};

use crate::error::Result;
use crate::nginxops::{NginxOps, OpOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ReloadStatus {
    pub reload_id: u64,
    pub state: ReloadState,
    pub error: Option<String>,
}

const MIN_RETENTION: usize = 256;

struct Inner {
    queue: VecDeque<u64>,
    statuses: LruCache<u64, ReloadStatus>,
}

pub struct ReloadManager {
    next_id: AtomicU64,
    inner: Mutex<Inner>,
    notify: Notify,
    shutdown: Arc<AtomicBool>,
    nginx: Arc<NginxOps>,
}

impl ReloadManager {
    pub fn new(nginx: Arc<NginxOps>) -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                statuses: LruCache::new(NonZeroUsize::new(MIN_RETENTION).unwrap()),
            }),
            notify: Notify::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            nginx,
        })
    }

    /// Allocates a monotone reload id, appends it to the FIFO, and returns
    /// immediately — the actual `nginx -t`/`reload` happens on the worker.
    pub async fn queue_reload(&self) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().await;
        inner.queue.push_back(id);
        inner.statuses.put(
            id,
            ReloadStatus {
                reload_id: id,
                state: ReloadState::Pending,
                error: None,
            },
        );
        drop(inner);
        self.notify.notify_one();
        id
    }

    pub async fn get_reload_status(&self, id: u64) -> Option<ReloadStatus> {
        self.inner.lock().await.statuses.get(&id).cloned()
    }

    /// Runs `nginx -t` synchronously, outside the coalesced worker loop, so
    /// a caller can validate a config it just wrote before committing to it.
    pub async fn test_now(&self) -> Result<OpOutcome> {
        self.nginx.test().await
    }

    /// Runs the single worker loop. Spawn this once from the composition
    /// root; it exits when `shutdown()` is called.
    pub async fn run(self: Arc<Self>) {
        loop {
            self.notify.notified().await;
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            loop {
                let coalesced = {
                    let mut inner = self.inner.lock().await;
                    if inner.queue.is_empty() {
                        break;
                    }
                    let ids: Vec<u64> = inner.queue.drain(..).collect();
                    for id in &ids {
                        if let Some(status) = inner.statuses.get_mut(id) {
                            status.state = ReloadState::Running;
                        }
                    }
                    ids
                };

                let result = self.nginx.safe_reload().await;
                let mut inner = self.inner.lock().await;
                match result {
                    Ok(_) => {
                        counter!("control_plane_reloads_succeeded_total").increment(1);
                        for id in &coalesced {
                            if let Some(status) = inner.statuses.get_mut(id) {
                                status.state = ReloadState::Succeeded;
                                status.error = None;
                            }
                        }
                        info!(count = coalesced.len(), "coalesced reload succeeded");
                    }
                    Err(err) => {
                        counter!("control_plane_reloads_failed_total").increment(1);
                        let message = err.to_string();
                        for id in &coalesced {
                            if let Some(status) = inner.statuses.get_mut(id) {
                                status.state = ReloadState::Failed;
                                status.error = Some(message.clone());
                            }
                        }
                        warn!(error = %message, count = coalesced.len(), "coalesced reload failed");
                    }
                }
            }
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NginxConfig, NginxMode};

    fn noop_nginx_config(dir: &std::path::Path) -> NginxConfig {
        NginxConfig {
            mode: NginxMode::SignalFile,
            binary_path: "nginx".into(),
            conf_dir: dir.to_string_lossy().to_string(),
            ssl_dir: dir.to_string_lossy().to_string(),
            test_timeout_seconds: 5,
            reload_timeout_seconds: 5,
            signal_dir: Some(dir.to_string_lossy().to_string()),
            poll_interval_ms: 5,
        }
    }

    #[tokio::test]
    async fn concurrent_callers_observe_a_single_coalesced_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = noop_nginx_config(dir.path());
        let nginx = Arc::new(NginxOps::new(&cfg).unwrap());
        let manager = ReloadManager::new(nginx);

        let worker = tokio::spawn(manager.clone().run());

        // Fire the watcher in the background so every queued reload
        // eventually resolves OK without this test depending on nginx.
        let watch_dir = dir.path().to_path_buf();
        let watcher = tokio::spawn(async move {
            for _ in 0..50 {
                if watch_dir.join(".nginx-reload-signal").exists() {
                    tokio::fs::write(watch_dir.join(".nginx-test-result"), "OK\n")
                        .await
                        .unwrap();
                    tokio::fs::write(watch_dir.join(".nginx-reload-result"), "OK\n")
                        .await
                        .unwrap();
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        });

        let mut ids = Vec::new();
        for _ in 0..20 {
            ids.push(manager.queue_reload().await);
        }

        let mut succeeded = 0;
        for _ in 0..200 {
            succeeded = 0;
            for id in &ids {
                if let Some(status) = manager.get_reload_status(*id).await {
                    if status.state == ReloadState::Succeeded {
                        succeeded += 1;
                    }
                }
            }
            if succeeded == ids.len() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(succeeded, ids.len());

        manager.shutdown();
        let _ = watcher.await;
        let _ = worker.await;
    }

    #[tokio::test]
    async fn retains_all_observed_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = noop_nginx_config(dir.path());
        let nginx = Arc::new(NginxOps::new(&cfg).unwrap());
        let manager = ReloadManager::new(nginx);
        let id = manager.queue_reload().await;
        assert!(manager.get_reload_status(id).await.is_some());
    }
}
