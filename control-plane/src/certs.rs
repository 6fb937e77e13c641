//! Issues and renews TLS certificates by invoking an external ACME client
//! as a child process, never a shell. DNS-01 credentials are written to a
//! temp file with `0600` permissions just before the call and removed
//! immediately after, success or failure.

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use control_plane_types::*;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::AcmeConfig;
use crate::crypto::{CredCrypto, KeyDomain};
use crate::error::{EngineError, Result};
use crate::reconciler::ConfigReconciler;
use crate::settings::SettingsView;
use crate::store::{NewCert, Store};
use crate::validator::Validator;

pub struct CertOrchestrator {
    store: Store,
    settings: SettingsView,
    reconciler: std::sync::Arc<ConfigReconciler>,
    crypto: CredCrypto,
    cfg: AcmeConfig,
}

pub struct IssueRequest<'a> {
    pub name: &'a str,
    pub domain_names: &'a [String],
    pub challenge_type: ChallengeType,
    pub dns_credential_id: Option<i64>,
    pub auto_renew: bool,
}

impl CertOrchestrator {
    pub fn new(store: Store, reconciler: std::sync::Arc<ConfigReconciler>, crypto: CredCrypto, cfg: AcmeConfig) -> Self {
        let settings = SettingsView::new(store.clone());
        Self {
            store,
            settings,
            reconciler,
            crypto,
            cfg,
        }
    }

    pub async fn issue(&self, req: IssueRequest<'_>) -> Result<Cert> {
        for domain in req.domain_names {
            Validator::validate_domain(domain.trim_start_matches("*."))?;
            if req.challenge_type == ChallengeType::Http01 && domain.starts_with("*.") {
                return Err(EngineError::InvalidInput(
                    "wildcard domains require dns-01, not http-01".into(),
                ));
            }
        }

        let cert_dir = PathBuf::from(&self.cfg.letsencrypt_dir).join(req.name);
        let cert_path = cert_dir.join("fullchain.pem");
        let key_path = cert_dir.join("privkey.pem");

        self.run_acme_command(req.name, req.domain_names, req.challenge_type, req.dns_credential_id)
            .await?;

        let expires_at = Utc::now() + chrono::Duration::days(90);
        self.store
            .insert_cert(&NewCert {
                name: req.name.to_string(),
                domain_names: req.domain_names.to_vec(),
                issuer: Some("Let's Encrypt".into()),
                expires_at: Some(expires_at),
                cert_path: cert_path.to_string_lossy().to_string(),
                key_path: key_path.to_string_lossy().to_string(),
                source: CertSource::Acme,
                auto_renew: req.auto_renew,
                challenge_type: Some(req.challenge_type),
                dns_credential_id: req.dns_credential_id,
                acme_config: None,
            })
            .await
    }

    /// Scheduler entry point: finds every cert within the renewal window
    /// and re-issues it in place.
    pub async fn renew_due(&self) -> Result<Vec<i64>> {
        let due = self.store.list_certs_due_for_renewal(self.cfg.renewal_threshold_days).await?;
        let mut renewed = Vec::new();
        for cert in due {
            let challenge_type = cert.challenge_type.unwrap_or(ChallengeType::Http01);
            match self
                .run_acme_command(&cert.name, &cert.domain_names, challenge_type, cert.dns_credential_id)
                .await
            {
                Ok(()) => {
                    renewed.push(cert.id);
                    let affected = self.store.list_proxies_by_cert(cert.id).await?;
                    let ids: Vec<i64> = affected.iter().map(|p| p.id).collect();
                    if !ids.is_empty() {
                        self.reconciler.regenerate_multiple(&ids).await?;
                    }
                    info!(cert_id = cert.id, name = %cert.name, "certificate renewed");
                }
                Err(err) => {
                    warn!(cert_id = cert.id, name = %cert.name, error = %err, "certificate renewal failed");
                }
            }
        }
        Ok(renewed)
    }

    /// Removes a cert's files and row, disabling SSL on every proxy that
    /// referenced it, clearing the `admin_cert_id` setting if it pointed at
    /// this cert, and regenerating affected configs so nginx never points
    /// at a cert file that's gone.
    pub async fn delete(&self, cert_id: i64) -> Result<()> {
        let cert = self
            .store
            .get_cert(cert_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("cert {cert_id}")))?;

        let affected_proxy_ids = self.store.clear_ssl_for_cert(cert_id).await?;
        if !affected_proxy_ids.is_empty() {
            self.reconciler.regenerate_multiple(&affected_proxy_ids).await?;
        }

        if self.settings.admin_cert_id().await? == Some(cert_id) {
            self.settings.set_admin_cert_id(None).await?;
        }

        let _ = tokio::fs::remove_file(&cert.cert_path).await;
        let _ = tokio::fs::remove_file(&cert.key_path).await;
        self.store.delete_cert(cert_id).await
    }

    async fn run_acme_command(
        &self,
        name: &str,
        domain_names: &[String],
        challenge_type: ChallengeType,
        dns_credential_id: Option<i64>,
    ) -> Result<()> {
        Validator::validate_identifier(name)?;
        for domain in domain_names {
            Validator::validate_domain(domain.trim_start_matches("*."))?;
        }

        let mut args = vec![
            "certonly".to_string(),
            "--non-interactive".to_string(),
            "--agree-tos".to_string(),
            "--config-dir".to_string(),
            self.cfg.letsencrypt_dir.clone(),
            "--cert-name".to_string(),
            name.to_string(),
        ];
        for domain in domain_names {
            args.push("-d".to_string());
            args.push(domain.clone());
        }

        let mut credentials_file: Option<PathBuf> = None;
        match challenge_type {
            ChallengeType::Http01 => {
                args.push("--webroot".to_string());
                args.push("--webroot-path".to_string());
                args.push(self.cfg.challenge_webroot.clone());
            }
            ChallengeType::Dns01 => {
                let credential_id = dns_credential_id
                    .ok_or_else(|| EngineError::InvalidInput("dns-01 requires a dns_credential_id".into()))?;
                let credential = self
                    .store
                    .get_credential(credential_id)
                    .await?
                    .ok_or_else(|| EngineError::NotFound(format!("credential {credential_id}")))?;
                let secret: String = self
                    .crypto
                    .decrypt(KeyDomain::CertCredential, &credential.credentials_encrypted)?;

                tokio::fs::create_dir_all(&self.cfg.credentials_dir).await?;
                let path = PathBuf::from(&self.cfg.credentials_dir).join(format!("{name}.ini"));
                write_credentials_file(&path, &secret).await?;
                args.push(format!("--dns-{}", credential.provider));
                args.push(format!("--dns-{}-credentials", credential.provider));
                args.push(path.to_string_lossy().to_string());
                credentials_file = Some(path);
            }
        }

        Validator::sanitize_argv(&args)?;
        let result = self.spawn_acme(&args).await;

        if let Some(path) = credentials_file {
            let _ = tokio::fs::remove_file(&path).await;
        }

        result
    }

    async fn spawn_acme(&self, args: &[String]) -> Result<()> {
        let mut cmd = Command::new(&self.cfg.cli_path);
        cmd.args(args);
        let output = timeout(Duration::from_secs(self.cfg.command_timeout_seconds), cmd.output())
            .await
            .map_err(|_| EngineError::TransientFailure(format!("{} timed out", self.cfg.cli_path)))?
            .map_err(|e| EngineError::ExternalFailure(format!("failed to spawn {}: {e}", self.cfg.cli_path)))?;
        if !output.status.success() {
            return Err(EngineError::ExternalFailure(format!(
                "{} exited with {}: {}",
                self.cfg.cli_path,
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }
}

#[cfg(unix)]
async fn write_credentials_file(path: &std::path::Path, contents: &str) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(contents.as_bytes()).await?;
    file.set_permissions(std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn write_credentials_file(path: &std::path::Path, contents: &str) -> Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(contents.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NginxConfig, NginxMode};
    use crate::nginxops::NginxOps;
    use crate::reload::ReloadManager;

    fn acme_config(dir: &std::path::Path) -> AcmeConfig {
        AcmeConfig {
            cli_path: "/bin/false".into(),
            challenge_webroot: dir.join("challenge").to_string_lossy().to_string(),
            letsencrypt_dir: dir.join("le").to_string_lossy().to_string(),
            credentials_dir: dir.join("creds").to_string_lossy().to_string(),
            command_timeout_seconds: 2,
            renewal_threshold_days: 30,
        }
    }

    async fn test_orchestrator(dir: &std::path::Path) -> CertOrchestrator {
        let store = Store::open(":memory:").await.unwrap();
        let nginx_cfg = NginxConfig {
            mode: NginxMode::SignalFile,
            binary_path: "nginx".into(),
            conf_dir: dir.to_string_lossy().to_string(),
            ssl_dir: dir.to_string_lossy().to_string(),
            test_timeout_seconds: 1,
            reload_timeout_seconds: 1,
            signal_dir: Some(dir.to_string_lossy().to_string()),
            poll_interval_ms: 5,
        };
        let nginx = std::sync::Arc::new(NginxOps::new(&nginx_cfg).unwrap());
        let reload = ReloadManager::new(nginx);
        let reconciler = std::sync::Arc::new(ConfigReconciler::new(store.clone(), reload, &nginx_cfg));
        let crypto = CredCrypto::new("test-secret");
        CertOrchestrator::new(store, reconciler, crypto, acme_config(dir))
    }

    #[tokio::test]
    async fn wildcard_domain_rejects_http01() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path()).await;
        let err = orchestrator
            .issue(IssueRequest {
                name: "wild",
                domain_names: &["*.example.com".to_string()],
                challenge_type: ChallengeType::Http01,
                dns_credential_id: None,
                auto_renew: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn delete_clears_admin_cert_id_when_it_points_at_the_deleted_cert() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path()).await;
        let cert = orchestrator
            .store
            .insert_cert(&NewCert {
                name: "admin".into(),
                domain_names: vec!["admin.example.com".into()],
                issuer: None,
                expires_at: None,
                cert_path: dir.path().join("fullchain.pem").to_string_lossy().to_string(),
                key_path: dir.path().join("privkey.pem").to_string_lossy().to_string(),
                source: CertSource::Upload,
                auto_renew: false,
                challenge_type: None,
                dns_credential_id: None,
                acme_config: None,
            })
            .await
            .unwrap();
        orchestrator
            .store
            .set_setting("admin_cert_id", &cert.id.to_string())
            .await
            .unwrap();

        orchestrator.delete(cert.id).await.unwrap();

        assert!(orchestrator.store.get_setting("admin_cert_id").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_leaves_unrelated_admin_cert_id_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path()).await;
        let cert = orchestrator
            .store
            .insert_cert(&NewCert {
                name: "other".into(),
                domain_names: vec!["other.example.com".into()],
                issuer: None,
                expires_at: None,
                cert_path: dir.path().join("fullchain.pem").to_string_lossy().to_string(),
                key_path: dir.path().join("privkey.pem").to_string_lossy().to_string(),
                source: CertSource::Upload,
                auto_renew: false,
                challenge_type: None,
                dns_credential_id: None,
                acme_config: None,
            })
            .await
            .unwrap();
        orchestrator.store.set_setting("admin_cert_id", "999").await.unwrap();

        orchestrator.delete(cert.id).await.unwrap();

        assert_eq!(
            orchestrator.store.get_setting("admin_cert_id").await.unwrap().as_deref(),
            Some("999")
        );
    }

    #[tokio::test]
    async fn dns01_without_credential_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path()).await;
        let err = orchestrator
            .issue(IssueRequest {
                name: "dnscert",
                domain_names: &["example.com".to_string()],
                challenge_type: ChallengeType::Dns01,
                dns_credential_id: None,
                auto_renew: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }
}
