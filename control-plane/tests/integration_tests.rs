//! End-to-end tests that exercise several components together through
//! their public APIs, rather than a single module in isolation.

use std::sync::Arc;

use anyhow::Result;
use control_plane::config::{EngineConfig, NginxMode};
use control_plane::reconciler::ConfigReconciler;
use control_plane::reload::ReloadManager;
use control_plane::nginxops::NginxOps;
use control_plane::store::{NewIpBan, NewProxy, Store};
use control_plane::stats_cache::{StatsCache, StatsRange};
use control_plane::Engine;
use control_plane_types::{ForwardScheme, ProxyContent, ProxyType, Severity};

/// Builds a config rooted at a temp directory, in signal-file mode so no
/// real `nginx` binary is required, with metrics disabled so repeated test
/// runs never fight over a listen address.
fn test_config(root: &std::path::Path) -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.store.db_path = ":memory:".into();
    cfg.nginx.mode = NginxMode::SignalFile;
    cfg.nginx.conf_dir = root.join("conf").to_string_lossy().into_owned();
    cfg.nginx.ssl_dir = root.join("ssl").to_string_lossy().into_owned();
    cfg.nginx.signal_dir = Some(root.join("signal").to_string_lossy().into_owned());
    cfg.acme.challenge_webroot = root.join("acme-challenge").to_string_lossy().into_owned();
    cfg.acme.letsencrypt_dir = root.join("letsencrypt").to_string_lossy().into_owned();
    cfg.acme.credentials_dir = root.join("certbot-credentials").to_string_lossy().into_owned();
    cfg.waf.audit_log_paths = vec![root.join("audit.json").to_string_lossy().into_owned()];
    cfg.metrics.enabled = false;
    cfg
}

#[cfg(test)]
mod reconcile_tests {
    use super::*;

    #[tokio::test]
    async fn creating_a_reverse_proxy_writes_an_enabled_config_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let conf_dir = dir.path().join("conf");
        tokio::fs::create_dir_all(&conf_dir).await?;

        let store = Store::open(":memory:").await?;
        let nginx_cfg = control_plane::config::NginxConfig {
            mode: NginxMode::SignalFile,
            binary_path: "nginx".into(),
            conf_dir: conf_dir.to_string_lossy().into_owned(),
            ssl_dir: dir.path().join("ssl").to_string_lossy().into_owned(),
            test_timeout_seconds: 5,
            reload_timeout_seconds: 5,
            signal_dir: Some(dir.path().join("signal").to_string_lossy().into_owned()),
            poll_interval_ms: 5,
        };
        let nginx = Arc::new(NginxOps::new(&nginx_cfg)?);
        let reload = ReloadManager::new(nginx);
        let reconciler = ConfigReconciler::new(store.clone(), reload.clone(), &nginx_cfg);

        let proxy = store
            .create_proxy(&NewProxy {
                name: "example".into(),
                proxy_type: ProxyType::Reverse,
                enabled: true,
                content: ProxyContent::Structured {
                    domain_names: vec!["example.test".into()],
                    forward_scheme: ForwardScheme::Http,
                    forward_host: "127.0.0.1".into(),
                    forward_port: 8080,
                    advanced_config: None,
                },
                incoming_port: None,
                stream_protocol: None,
                ssl_enabled: false,
                ssl_cert_id: None,
                launch_url: None,
                waf_profile_id: None,
                config_filename: "example.conf".into(),
            })
            .await?;

        let outcome = reconciler.reconcile(proxy.id).await?;
        assert!(outcome.error.is_none());

        let written = tokio::fs::read_to_string(conf_dir.join("example.conf")).await?;
        assert!(written.contains("example.test"));
        assert!(written.contains("127.0.0.1:8080"));
        assert!(!conf_dir.join("example.conf.disabled").exists());

        let reloaded = store.get_proxy(proxy.id).await?.unwrap();
        assert_eq!(reloaded.config_status, control_plane_types::ConfigStatus::Active);
        Ok(())
    }

    #[tokio::test]
    async fn disabling_a_proxy_moves_its_config_out_of_the_active_path() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let conf_dir = dir.path().join("conf");
        tokio::fs::create_dir_all(&conf_dir).await?;

        let store = Store::open(":memory:").await?;
        let nginx_cfg = control_plane::config::NginxConfig {
            mode: NginxMode::SignalFile,
            binary_path: "nginx".into(),
            conf_dir: conf_dir.to_string_lossy().into_owned(),
            ssl_dir: dir.path().join("ssl").to_string_lossy().into_owned(),
            test_timeout_seconds: 5,
            reload_timeout_seconds: 5,
            signal_dir: Some(dir.path().join("signal").to_string_lossy().into_owned()),
            poll_interval_ms: 5,
        };
        let nginx = Arc::new(NginxOps::new(&nginx_cfg)?);
        let reload = ReloadManager::new(nginx);
        let reconciler = ConfigReconciler::new(store.clone(), reload.clone(), &nginx_cfg);

        let proxy = store
            .create_proxy(&NewProxy {
                name: "disabled-site".into(),
                proxy_type: ProxyType::Reverse,
                enabled: false,
                content: ProxyContent::Structured {
                    domain_names: vec!["off.test".into()],
                    forward_scheme: ForwardScheme::Http,
                    forward_host: "127.0.0.1".into(),
                    forward_port: 8081,
                    advanced_config: None,
                },
                incoming_port: None,
                stream_protocol: None,
                ssl_enabled: false,
                ssl_cert_id: None,
                launch_url: None,
                waf_profile_id: None,
                config_filename: "off.conf".into(),
            })
            .await?;

        reconciler.reconcile(proxy.id).await?;

        assert!(!conf_dir.join("off.conf").exists());
        let written = tokio::fs::read_to_string(conf_dir.join("off.conf.disabled")).await?;
        assert!(written.contains("off.test"));
        Ok(())
    }
}

#[cfg(test)]
mod stats_cache_tests {
    use super::*;

    #[tokio::test]
    async fn refresh_reflects_events_recorded_since_the_last_call() -> Result<()> {
        let store = Store::open(":memory:").await?;
        let cache = StatsCache::new(store.clone(), StatsRange::default());
        assert!(cache.get().is_none());

        store
            .insert_waf_event(&control_plane::store::NewWafEvent {
                timestamp: chrono::Utc::now(),
                proxy_id: None,
                client_ip: "198.51.100.20".parse().unwrap(),
                attack_type: "sqli".into(),
                severity: Severity::Critical,
                blocked: true,
                request_uri: "/login".into(),
                raw_log: serde_json::json!({}),
                http_status: Some(403),
            })
            .await?;

        cache.refresh().await?;
        let stats = cache.get().expect("stats populated after refresh");
        assert_eq!(stats.total_events, 1);
        assert_eq!(stats.blocked_events, 1);
        assert_eq!(stats.by_severity.critical, 1);
        Ok(())
    }
}

#[cfg(test)]
mod ban_lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn expired_bans_are_unbanned_but_not_reported_active() -> Result<()> {
        let store = Store::open(":memory:").await?;
        let ip: std::net::IpAddr = "203.0.113.50".parse().unwrap();

        store
            .insert_ban(&NewIpBan {
                ip_address: ip,
                reason: "test".into(),
                severity: Severity::High,
                auto_banned: true,
                detection_rule_id: None,
                expires_at: Some(chrono::Utc::now() - chrono::Duration::seconds(1)),
                banned_by: None,
            })
            .await?;

        let expired = store.list_expired_bans().await?;
        assert_eq!(expired.len(), 1);

        for ban in &expired {
            store.unban(ban.id).await?;
        }

        assert!(store.list_expired_bans().await?.is_empty());
        assert!(store.list_active_bans().await?.is_empty());
        Ok(())
    }
}

#[cfg(test)]
mod engine_lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn engine_initializes_and_shuts_down_cleanly() -> Result<()> {
        let dir = tempfile::tempdir()?;
        tokio::fs::create_dir_all(dir.path().join("conf")).await?;
        tokio::fs::create_dir_all(dir.path().join("signal")).await?;
        tokio::fs::create_dir_all(dir.path().join("ssl")).await?;
        let cfg = test_config(dir.path());

        let engine = Engine::init(&cfg).await?;
        engine.poll_waf_logs().await;
        engine.shutdown().await;
        Ok(())
    }
}
