//! Uniform interface to the external systems that actually carry out a ban
//! or unban: a firewalld/UFW/ipset/iptables child process on the same host,
//! or a UniFi controller's HTTP API. `ProviderRegistry` builds a handle per
//! enabled `BanIntegration` row, decrypting its stored credential once and
//! keeping the provider alive for the life of the process.

mod firewall_cli;
mod unifi;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use control_plane_types::{BanIntegration, Credential};
use dashmap::DashMap;
use tracing::warn;

use crate::ban_queue::BanOp;
use crate::crypto::{CredCrypto, KeyDomain};
use crate::error::{EngineError, Result};
use crate::store::Store;

pub use firewall_cli::FirewallCliProvider;
pub use unifi::UnifiProvider;

#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub supports_batch: bool,
    pub supports_list: bool,
}

/// Every provider speaks this interface; `ban`/`unban` return the
/// provider-assigned ban id when the backend hands one back (UniFi does,
/// CLI tools don't).
#[async_trait]
pub trait BanProvider: Send + Sync {
    async fn test_connection(&self) -> Result<()>;
    async fn ban(&self, ip: IpAddr, reason: &str) -> Result<Option<String>>;
    async fn unban(&self, ip: IpAddr) -> Result<()>;
    async fn get_banned_ips(&self) -> Result<Vec<IpAddr>>;
    fn capabilities(&self) -> Capabilities;

    async fn batch_ban(&self, _ops: &[(IpAddr, &str)]) -> Result<()> {
        Err(EngineError::Internal("provider does not support batch ban".into()))
    }

    async fn batch_unban(&self, _ips: &[IpAddr]) -> Result<()> {
        Err(EngineError::Internal("provider does not support batch unban".into()))
    }
}

/// Thin wrapper so `BanQueue` can call the `BanOp`-shaped methods it deals
/// in without every provider needing to know about `BanOp`.
pub struct ProviderHandle {
    inner: Arc<dyn BanProvider>,
    integration_id: i64,
    name: String,
}

impl ProviderHandle {
    pub fn integration_id(&self) -> i64 {
        self.integration_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    pub async fn ban(&self, op: &BanOp) -> Result<Option<String>> {
        self.inner.ban(op.ip, op.reason.as_deref().unwrap_or("")).await
    }

    pub async fn unban(&self, op: &BanOp) -> Result<()> {
        self.inner.unban(op.ip).await
    }

    pub async fn batch_ban(&self, ops: &[&BanOp]) -> Result<()> {
        let pairs: Vec<(IpAddr, &str)> = ops.iter().map(|o| (o.ip, o.reason.as_deref().unwrap_or(""))).collect();
        self.inner.batch_ban(&pairs).await
    }

    pub async fn batch_unban(&self, ops: &[&BanOp]) -> Result<()> {
        let ips: Vec<IpAddr> = ops.iter().map(|o| o.ip).collect();
        self.inner.batch_unban(&ips).await
    }

    pub async fn get_banned_ips(&self) -> Result<Vec<IpAddr>> {
        self.inner.get_banned_ips().await
    }

    pub async fn test_connection(&self) -> Result<()> {
        self.inner.test_connection().await
    }
}

pub struct ProviderRegistry {
    handles: DashMap<i64, Arc<ProviderHandle>>,
}

impl ProviderRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handles: DashMap::new(),
        })
    }

    pub fn get(&self, integration_id: i64) -> Option<Arc<ProviderHandle>> {
        self.handles.get(&integration_id).map(|e| e.clone())
    }

    pub fn all_ids(&self) -> Vec<i64> {
        self.handles.iter().map(|e| *e.key()).collect()
    }

    /// Rebuilds every handle from the enabled `ban_integrations` rows,
    /// decrypting each integration's credential with `crypto`. A row whose
    /// credential fails to decrypt or whose `provider_type` is unknown is
    /// skipped with a warning rather than aborting the whole refresh.
    pub async fn refresh(&self, store: &Store, crypto: &CredCrypto) -> Result<()> {
        let integrations = store.list_enabled_ban_integrations().await?;
        let mut seen = std::collections::HashSet::new();

        for integration in integrations {
            seen.insert(integration.id);
            match build_provider(&integration, store, crypto).await {
                Ok(provider) => {
                    self.handles.insert(
                        integration.id,
                        Arc::new(ProviderHandle {
                            inner: provider,
                            integration_id: integration.id,
                            name: integration.name.clone(),
                        }),
                    );
                }
                Err(err) => {
                    warn!(integration_id = integration.id, error = %err, "skipping ban integration");
                }
            }
        }

        self.handles.retain(|id, _| seen.contains(id));
        Ok(())
    }
}

async fn build_provider(
    integration: &BanIntegration,
    store: &Store,
    crypto: &CredCrypto,
) -> Result<Arc<dyn BanProvider>> {
    let config: HashMap<String, serde_json::Value> = integration
        .config_json
        .as_object()
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .collect();

    let credential: Option<Credential> = match integration.credential_id {
        Some(id) => store.get_credential(id).await?,
        None => None,
    };

    match integration.provider_type.as_str() {
        "firewalld" | "ufw" | "ipset" | "iptables" => Ok(Arc::new(FirewallCliProvider::new(
            integration.provider_type.clone(),
            &config,
        )?)),
        "unifi" => {
            let cred = credential.ok_or_else(|| {
                EngineError::Internal(format!(
                    "unifi integration '{}' has no credential attached",
                    integration.name
                ))
            })?;
            let secret: unifi::UnifiCredential =
                crypto.decrypt(KeyDomain::CertCredential, &cred.credentials_encrypted)?;
            Ok(Arc::new(UnifiProvider::new(&config, secret)?))
        }
        other => Err(EngineError::InvalidInput(format!(
            "unknown ban provider type '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refresh_skips_unknown_provider_type() {
        let store = Store::open(":memory:").await.unwrap();
        let crypto = CredCrypto::new("test-secret");
        let registry = ProviderRegistry::new();
        // No integrations configured: refresh should be a no-op, not an error.
        registry.refresh(&store, &crypto).await.unwrap();
        assert!(registry.all_ids().is_empty());
    }
}
