//! The idempotent per-proxy sequence that
//! turns desired state into a written, enabled (or disabled), reloaded
//! nginx config file, with `config_status` tracking outcome.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use control_plane_types::*;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::config::NginxConfig;
use crate::configgen::{self, RenderInput};
use crate::error::{EngineError, Result};
use crate::reload::ReloadManager;
use crate::store::Store;

pub struct ConfigReconciler {
    store: Store,
    reload: Arc<ReloadManager>,
    conf_dir: PathBuf,
}

pub struct ReconcileOutcome {
    pub proxy_id: i64,
    pub reload_id: Option<u64>,
    pub error: Option<String>,
}

impl ConfigReconciler {
    pub fn new(store: Store, reload: Arc<ReloadManager>, nginx_cfg: &NginxConfig) -> Self {
        Self {
            store,
            reload,
            conf_dir: PathBuf::from(&nginx_cfg.conf_dir),
        }
    }

    /// Renders, writes, enables, and reloads the config for a single proxy id.
    pub async fn reconcile(&self, proxy_id: i64) -> Result<ReconcileOutcome> {
        let proxy = self
            .store
            .get_proxy(proxy_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("proxy {proxy_id}")))?;

        match self.write_and_enable(&proxy).await {
            Ok(()) => {
                let reload_id = self.reload.queue_reload().await;
                self.store
                    .update_proxy_config_status(proxy.id, ConfigStatus::Active, None)
                    .await?;
                Ok(ReconcileOutcome {
                    proxy_id: proxy.id,
                    reload_id: Some(reload_id),
                    error: None,
                })
            }
            Err(err) => {
                self.store
                    .update_proxy_config_status(proxy.id, ConfigStatus::Error, Some(&err.to_string()))
                    .await?;
                warn!(proxy_id, error = %err, "reconciliation failed, previous good file (if any) left in place");
                Ok(ReconcileOutcome {
                    proxy_id: proxy.id,
                    reload_id: None,
                    error: Some(err.to_string()),
                })
            }
        }
    }

    /// Bulk variant: reconciles every id's file write, then issues a
    /// single `queueReload()` for the whole batch. Per-item errors are
    /// accumulated; a partial success is reported rather than aborting.
    pub async fn regenerate_multiple(&self, proxy_ids: &[i64]) -> Result<Vec<ReconcileOutcome>> {
        let mut outcomes = Vec::with_capacity(proxy_ids.len());
        let mut any_succeeded = false;

        for &id in proxy_ids {
            let proxy = match self.store.get_proxy(id).await? {
                Some(p) => p,
                None => {
                    outcomes.push(ReconcileOutcome {
                        proxy_id: id,
                        reload_id: None,
                        error: Some(format!("proxy {id} not found")),
                    });
                    continue;
                }
            };

            match self.write_and_enable(&proxy).await {
                Ok(()) => {
                    self.store
                        .update_proxy_config_status(id, ConfigStatus::Active, None)
                        .await?;
                    any_succeeded = true;
                    outcomes.push(ReconcileOutcome {
                        proxy_id: id,
                        reload_id: None,
                        error: None,
                    });
                }
                Err(err) => {
                    self.store
                        .update_proxy_config_status(id, ConfigStatus::Error, Some(&err.to_string()))
                        .await?;
                    outcomes.push(ReconcileOutcome {
                        proxy_id: id,
                        reload_id: None,
                        error: Some(err.to_string()),
                    });
                }
            }
        }

        if any_succeeded {
            let reload_id = self.reload.queue_reload().await;
            for outcome in outcomes.iter_mut() {
                if outcome.error.is_none() {
                    outcome.reload_id = Some(reload_id);
                }
            }
        }
        Ok(outcomes)
    }

    /// Attempts to fully remove a proxy's written config after a creation
    /// failure, so no orphan file is left behind.
    pub async fn compensate_failed_creation(&self, proxy: &Proxy) {
        let path = self.conf_dir.join(&proxy.config_filename);
        let disabled = path.with_extension("disabled");
        let _ = tokio::fs::remove_file(&path).await;
        let _ = tokio::fs::remove_file(&disabled).await;
    }

    async fn write_and_enable(&self, proxy: &Proxy) -> Result<()> {
        let content = self.render_content(proxy).await?;

        let active_path = self.conf_dir.join(&proxy.config_filename);
        let disabled_path = pathbuf_with_suffix(&active_path, "disabled");
        let target_path = if proxy.enabled { &active_path } else { &disabled_path };
        let other_path = if proxy.enabled { &disabled_path } else { &active_path };

        let target_backup = self.backup_if_exists(target_path).await?;
        self.backup_if_exists(other_path).await?;
        self.write_atomic(target_path, &content).await?;

        match self.reload.test_now().await {
            Ok(outcome) if outcome.ok => {}
            Ok(outcome) => {
                self.restore_or_remove(target_path, target_backup.as_deref()).await;
                return Err(EngineError::NginxTestFailed(outcome.output));
            }
            Err(err) => {
                self.restore_or_remove(target_path, target_backup.as_deref()).await;
                return Err(err);
            }
        }

        // Enable/disable via rename between `.conf`/`.disabled`.
        if proxy.enabled && disabled_path.exists() {
            let _ = tokio::fs::remove_file(&disabled_path).await;
        } else if !proxy.enabled && active_path.exists() {
            let _ = tokio::fs::remove_file(&active_path).await;
        }

        Ok(())
    }

    /// Restores the config at `path` from its most recent backup (copy, not
    /// rename, so the backup remains available for inspection), or removes
    /// it entirely if there was no previous content to fall back to.
    async fn restore_or_remove(&self, path: &Path, backup: Option<&Path>) {
        match backup {
            Some(backup_path) => {
                if let Err(err) = tokio::fs::copy(backup_path, path).await {
                    warn!(path = %path.display(), error = %err, "failed to restore previous config after failed nginx test");
                }
            }
            None => {
                let _ = tokio::fs::remove_file(path).await;
            }
        }
    }

    async fn render_content(&self, proxy: &Proxy) -> Result<String> {
        if proxy.is_custom_editor() {
            let text = match &proxy.content {
                ProxyContent::Raw { text } => text.clone(),
                ProxyContent::Structured { .. } => unreachable!(),
            };
            return Ok(text);
        }

        let modules = self.store.modules_for_proxy(proxy.id).await?;
        let waf_profile = match proxy.waf_profile_id {
            Some(id) => self.store.get_waf_profile(id).await?,
            None => None,
        };

        let rendered = configgen::render_proxy(&RenderInput {
            proxy,
            modules: &modules,
            waf_profile: waf_profile.as_ref(),
        });

        if !proxy.ssl_enabled {
            return Ok(rendered);
        }

        match proxy.ssl_cert_id {
            Some(cert_id) => match self.store.get_cert(cert_id).await? {
                Some(cert) => Ok(configgen::substitute_ssl_paths(
                    &rendered,
                    &cert.cert_path,
                    &cert.key_path,
                )),
                None => {
                    warn!(proxy_id = proxy.id, cert_id, "ssl enabled but referenced cert missing");
                    Ok(rendered)
                }
            },
            None => {
                warn!(proxy_id = proxy.id, "ssl enabled but no cert attached");
                Ok(rendered)
            }
        }
    }

    /// Copies `path` aside if it exists, returning the backup's path so a
    /// failed write can be rolled back to it.
    async fn backup_if_exists(&self, path: &Path) -> Result<Option<PathBuf>> {
        if tokio::fs::metadata(path).await.is_ok() {
            let backup_path = path.with_file_name(format!(
                "{}.backup.{}",
                path.file_name().unwrap().to_string_lossy(),
                Utc::now().timestamp_millis()
            ));
            tokio::fs::copy(path, &backup_path).await?;
            Ok(Some(backup_path))
        } else {
            Ok(None)
        }
    }

    async fn write_atomic(&self, path: &Path, content: &str) -> Result<()> {
        tokio::fs::create_dir_all(self.conf_dir.as_path()).await.ok();
        let tmp_path = path.with_extension(format!("tmp.{}", std::process::id()));
        {
            let mut f = tokio::fs::File::create(&tmp_path).await?;
            f.write_all(content.as_bytes()).await?;
            f.flush().await?;
        }
        tokio::fs::rename(&tmp_path, path).await?;
        Ok(())
    }
}

fn pathbuf_with_suffix(path: &Path, ext: &str) -> PathBuf {
    let stem = path.file_stem().unwrap_or_default().to_string_lossy();
    path.with_file_name(format!("{stem}.{ext}"))
}
