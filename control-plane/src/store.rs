//! Embedded relational store: schema, settings key/value,
//! audit log sink, and CRUD for every persisted entity in
//! `control_plane_types::entities`. A single connection behind
//! `Arc<tokio::sync::Mutex<rusqlite::Connection>>`; all statements are
//! parameterized, never string-built.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use control_plane_types::*;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::error::{EngineError, Result};

const SCHEMA_MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        r#"
        CREATE TABLE IF NOT EXISTS proxies (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            proxy_type TEXT NOT NULL,
            enabled INTEGER NOT NULL,
            content_json TEXT NOT NULL,
            incoming_port INTEGER,
            stream_protocol TEXT,
            ssl_enabled INTEGER NOT NULL,
            ssl_cert_id INTEGER,
            launch_url TEXT,
            waf_profile_id INTEGER,
            config_filename TEXT NOT NULL,
            config_status TEXT NOT NULL,
            config_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS modules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            description TEXT,
            content TEXT NOT NULL,
            tag TEXT NOT NULL,
            level TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS proxy_modules (
            assoc_id INTEGER PRIMARY KEY AUTOINCREMENT,
            proxy_id INTEGER NOT NULL,
            module_id INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS certs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            domain_names_json TEXT NOT NULL,
            issuer TEXT,
            expires_at TEXT,
            cert_path TEXT NOT NULL,
            key_path TEXT NOT NULL,
            source TEXT NOT NULL,
            auto_renew INTEGER NOT NULL,
            challenge_type TEXT,
            dns_credential_id INTEGER,
            acme_config_json TEXT
        );

        CREATE TABLE IF NOT EXISTS waf_profiles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            ruleset TEXT NOT NULL,
            paranoia_level INTEGER NOT NULL,
            config_json TEXT NOT NULL,
            enabled INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS waf_exclusions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            profile_id INTEGER NOT NULL,
            rule_id TEXT NOT NULL,
            path_pattern TEXT,
            parameter_name TEXT,
            reason TEXT
        );

        CREATE TABLE IF NOT EXISTS waf_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            proxy_id INTEGER,
            client_ip TEXT NOT NULL,
            attack_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            blocked INTEGER NOT NULL,
            request_uri TEXT NOT NULL,
            raw_log_json TEXT NOT NULL,
            http_status INTEGER
        );

        CREATE TABLE IF NOT EXISTS credentials (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            credential_type TEXT NOT NULL,
            provider TEXT NOT NULL,
            credentials_encrypted TEXT NOT NULL,
            created_by INTEGER
        );

        CREATE TABLE IF NOT EXISTS ban_integrations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            provider_type TEXT NOT NULL,
            credential_id INTEGER,
            config_json TEXT NOT NULL,
            enabled INTEGER NOT NULL,
            last_success TEXT,
            last_error TEXT,
            total_bans_sent INTEGER NOT NULL DEFAULT 0,
            total_unbans_sent INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS ip_bans (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ip_address TEXT NOT NULL,
            reason TEXT NOT NULL,
            severity TEXT NOT NULL,
            auto_banned INTEGER NOT NULL,
            detection_rule_id INTEGER,
            banned_at TEXT NOT NULL,
            expires_at TEXT,
            banned_by INTEGER,
            integrations_notified_json TEXT NOT NULL,
            unbanned_at TEXT
        );

        CREATE TABLE IF NOT EXISTS ip_whitelist (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ip_address TEXT,
            ip_range TEXT,
            entry_type TEXT NOT NULL,
            reason TEXT NOT NULL,
            priority INTEGER NOT NULL,
            added_by INTEGER
        );

        CREATE TABLE IF NOT EXISTS detection_rules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            threshold INTEGER NOT NULL,
            time_window_s INTEGER NOT NULL,
            attack_types_json TEXT,
            severity_filter TEXT NOT NULL,
            proxy_id INTEGER,
            ban_duration_s INTEGER NOT NULL,
            ban_severity TEXT NOT NULL,
            priority INTEGER NOT NULL,
            enabled INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            at TEXT NOT NULL,
            actor TEXT,
            action TEXT NOT NULL,
            entity TEXT NOT NULL,
            entity_id INTEGER,
            detail_json TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_waf_events_proxy ON waf_events(proxy_id);
        CREATE INDEX IF NOT EXISTS idx_waf_events_client_ip ON waf_events(client_ip, timestamp);
        CREATE INDEX IF NOT EXISTS idx_ip_bans_ip ON ip_bans(ip_address);
        "#,
    ),
];

/// Embedded relational store. Cloning is cheap: the connection lives behind
/// an `Arc<Mutex<_>>` so every clone shares the same on-disk database.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub async fn open(db_path: &str) -> Result<Self> {
        let conn = if db_path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(db_path)?
        };
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (id INTEGER PRIMARY KEY);",
        )?;
        for (id, sql) in SCHEMA_MIGRATIONS {
            let applied: bool = conn
                .query_row(
                    "SELECT 1 FROM schema_migrations WHERE id = ?1",
                    params![id],
                    |_| Ok(true),
                )
                .optional()?
                .unwrap_or(false);
            if applied {
                continue;
            }
            conn.execute_batch(sql)?;
            conn.execute(
                "INSERT INTO schema_migrations (id) VALUES (?1)",
                params![id],
            )?;
        }
        Ok(())
    }

    // --- Settings -----------------------------------------------------

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub async fn delete_setting(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(())
    }

    // --- Audit log ------------------------------------------------------

    pub async fn append_audit(
        &self,
        actor: Option<&str>,
        action: &str,
        entity: &str,
        entity_id: Option<i64>,
        detail: Option<&serde_json::Value>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO audit_log (at, actor, action, entity, entity_id, detail_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                Utc::now().to_rfc3339(),
                actor,
                action,
                entity,
                entity_id,
                detail.map(|v| v.to_string())
            ],
        )?;
        Ok(())
    }

    // --- Proxies ---------------------------------------------------------

    pub async fn create_proxy(&self, p: &NewProxy) -> Result<Proxy> {
        let conn = self.conn.lock().await;
        let now = Utc::now();
        let content_json = serde_json::to_string(&p.content)?;
        let res = conn.execute(
            "INSERT INTO proxies
                (name, proxy_type, enabled, content_json, incoming_port, stream_protocol,
                 ssl_enabled, ssl_cert_id, launch_url, waf_profile_id, config_filename,
                 config_status, config_error, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
            params![
                p.name,
                proxy_type_str(p.proxy_type),
                p.enabled as i64,
                content_json,
                p.incoming_port,
                p.stream_protocol,
                p.ssl_enabled as i64,
                p.ssl_cert_id,
                p.launch_url,
                p.waf_profile_id,
                p.config_filename,
                config_status_str(ConfigStatus::Pending),
                Option::<String>::None,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ],
        );
        match res {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(EngineError::Conflict(format!(
                    "a proxy named '{}' already exists",
                    p.name
                )))
            }
            Err(e) => return Err(e.into()),
        }
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_proxy(id)
            .await?
            .ok_or_else(|| EngineError::Internal("proxy vanished after insert".into()))
    }

    pub async fn get_proxy(&self, id: i64) -> Result<Option<Proxy>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, name, proxy_type, enabled, content_json, incoming_port, stream_protocol,
                    ssl_enabled, ssl_cert_id, launch_url, waf_profile_id, config_filename,
                    config_status, config_error, created_at, updated_at
             FROM proxies WHERE id = ?1",
            params![id],
            row_to_proxy,
        )
        .optional()
        .map_err(EngineError::from)
    }

    pub async fn list_proxies(&self) -> Result<Vec<Proxy>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, name, proxy_type, enabled, content_json, incoming_port, stream_protocol,
                    ssl_enabled, ssl_cert_id, launch_url, waf_profile_id, config_filename,
                    config_status, config_error, created_at, updated_at
             FROM proxies ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_proxy)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub async fn list_proxies_by_cert(&self, cert_id: i64) -> Result<Vec<Proxy>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, name, proxy_type, enabled, content_json, incoming_port, stream_protocol,
                    ssl_enabled, ssl_cert_id, launch_url, waf_profile_id, config_filename,
                    config_status, config_error, created_at, updated_at
             FROM proxies WHERE ssl_cert_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![cert_id], row_to_proxy)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub async fn update_proxy_content(
        &self,
        id: i64,
        content: &ProxyContent,
        ssl_enabled: bool,
        ssl_cert_id: Option<i64>,
        waf_profile_id: Option<i64>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let content_json = serde_json::to_string(content)?;
        let n = conn.execute(
            "UPDATE proxies SET content_json = ?1, ssl_enabled = ?2, ssl_cert_id = ?3,
                    waf_profile_id = ?4, updated_at = ?5 WHERE id = ?6",
            params![
                content_json,
                ssl_enabled as i64,
                ssl_cert_id,
                waf_profile_id,
                Utc::now().to_rfc3339(),
                id
            ],
        )?;
        if n == 0 {
            return Err(EngineError::NotFound(format!("proxy {id}")));
        }
        Ok(())
    }

    pub async fn update_proxy_config_status(
        &self,
        id: i64,
        status: ConfigStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE proxies SET config_status = ?1, config_error = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                config_status_str(status),
                error,
                Utc::now().to_rfc3339(),
                id
            ],
        )?;
        Ok(())
    }

    pub async fn clear_ssl_for_cert(&self, cert_id: i64) -> Result<Vec<i64>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT id FROM proxies WHERE ssl_cert_id = ?1")?;
        let ids: Vec<i64> = stmt
            .query_map(params![cert_id], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        conn.execute(
            "UPDATE proxies SET ssl_enabled = 0, ssl_cert_id = NULL, updated_at = ?1
             WHERE ssl_cert_id = ?2",
            params![Utc::now().to_rfc3339(), cert_id],
        )?;
        Ok(ids)
    }

    pub async fn delete_proxy(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM proxy_modules WHERE proxy_id = ?1", params![id])?;
        let n = conn.execute("DELETE FROM proxies WHERE id = ?1", params![id])?;
        if n == 0 {
            return Err(EngineError::NotFound(format!("proxy {id}")));
        }
        Ok(())
    }

    // --- Modules -----------------------------------------------------------

    pub async fn modules_for_proxy(&self, proxy_id: i64) -> Result<Vec<Module>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT m.id, m.name, m.description, m.content, m.tag, m.level
             FROM modules m JOIN proxy_modules pm ON pm.module_id = m.id
             WHERE pm.proxy_id = ?1 ORDER BY pm.assoc_id",
        )?;
        let rows = stmt.query_map(params![proxy_id], row_to_module)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub async fn proxies_referencing_module(&self, module_id: i64) -> Result<Vec<i64>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT DISTINCT proxy_id FROM proxy_modules WHERE module_id = ?1")?;
        let ids: Vec<i64> = stmt
            .query_map(params![module_id], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        Ok(ids)
    }

    // --- Certs ---------------------------------------------------------

    pub async fn get_cert(&self, id: i64) -> Result<Option<Cert>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, name, domain_names_json, issuer, expires_at, cert_path, key_path,
                    source, auto_renew, challenge_type, dns_credential_id, acme_config_json
             FROM certs WHERE id = ?1",
            params![id],
            row_to_cert,
        )
        .optional()
        .map_err(EngineError::from)
    }

    pub async fn list_certs_due_for_renewal(&self, threshold_days: i64) -> Result<Vec<Cert>> {
        let conn = self.conn.lock().await;
        let cutoff = (Utc::now() + chrono::Duration::days(threshold_days)).to_rfc3339();
        let mut stmt = conn.prepare(
            "SELECT id, name, domain_names_json, issuer, expires_at, cert_path, key_path,
                    source, auto_renew, challenge_type, dns_credential_id, acme_config_json
             FROM certs WHERE auto_renew = 1 AND expires_at IS NOT NULL AND expires_at <= ?1",
        )?;
        let rows = stmt.query_map(params![cutoff], row_to_cert)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub async fn insert_cert(&self, c: &NewCert) -> Result<Cert> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO certs
                (name, domain_names_json, issuer, expires_at, cert_path, key_path, source,
                 auto_renew, challenge_type, dns_credential_id, acme_config_json)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            params![
                c.name,
                serde_json::to_string(&c.domain_names)?,
                c.issuer,
                c.expires_at.map(|d| d.to_rfc3339()),
                c.cert_path,
                c.key_path,
                cert_source_str(c.source),
                c.auto_renew as i64,
                c.challenge_type.map(challenge_type_str),
                c.dns_credential_id,
                c.acme_config.as_ref().map(|v| v.to_string()),
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_cert(id)
            .await?
            .ok_or_else(|| EngineError::Internal("cert vanished after insert".into()))
    }

    pub async fn delete_cert(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        let n = conn.execute("DELETE FROM certs WHERE id = ?1", params![id])?;
        if n == 0 {
            return Err(EngineError::NotFound(format!("cert {id}")));
        }
        Ok(())
    }

    // --- WAF profiles ----------------------------------------------------

    pub async fn get_waf_profile(&self, id: i64) -> Result<Option<WafProfile>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, name, ruleset, paranoia_level, config_json, enabled
             FROM waf_profiles WHERE id = ?1",
            params![id],
            row_to_waf_profile,
        )
        .optional()
        .map_err(EngineError::from)
    }

    pub async fn exclusions_for_profile(&self, profile_id: i64) -> Result<Vec<WafExclusion>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, profile_id, rule_id, path_pattern, parameter_name, reason
             FROM waf_exclusions WHERE profile_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![profile_id], |row| {
            Ok(WafExclusion {
                id: row.get(0)?,
                profile_id: row.get(1)?,
                rule_id: row.get(2)?,
                path_pattern: row.get(3)?,
                parameter_name: row.get(4)?,
                reason: row.get(5)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    // --- WAF events ------------------------------------------------------

    pub async fn insert_waf_event(&self, e: &NewWafEvent) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO waf_events
                (timestamp, proxy_id, client_ip, attack_type, severity, blocked,
                 request_uri, raw_log_json, http_status)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                e.timestamp.to_rfc3339(),
                e.proxy_id,
                e.client_ip.to_string(),
                e.attack_type,
                severity_str(e.severity),
                e.blocked as i64,
                e.request_uri,
                e.raw_log.to_string(),
                e.http_status,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn unresolved_waf_events(&self) -> Result<Vec<WafEvent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, proxy_id, client_ip, attack_type, severity, blocked,
                    request_uri, raw_log_json, http_status
             FROM waf_events WHERE proxy_id IS NULL",
        )?;
        let rows = stmt.query_map([], row_to_waf_event)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub async fn events_for_ip_between(
        &self,
        ip: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<WafEvent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, proxy_id, client_ip, attack_type, severity, blocked,
                    request_uri, raw_log_json, http_status
             FROM waf_events WHERE client_ip = ?1 AND timestamp >= ?2 AND timestamp <= ?3
               AND proxy_id IS NOT NULL",
        )?;
        let rows = stmt.query_map(
            params![ip, since.to_rfc3339(), until.to_rfc3339()],
            row_to_waf_event,
        )?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub async fn assign_waf_event_proxy(&self, event_id: i64, proxy_id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE waf_events SET proxy_id = ?1 WHERE id = ?2",
            params![proxy_id, event_id],
        )?;
        Ok(())
    }

    /// Counts for the stats cache: total events and blocked events in
    /// `[since, until]`, grouped by severity.
    pub async fn waf_event_counts_between(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<(Severity, i64, i64)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT severity, COUNT(*), SUM(blocked)
             FROM waf_events WHERE timestamp >= ?1 AND timestamp <= ?2
             GROUP BY severity",
        )?;
        let rows = stmt.query_map(params![since.to_rfc3339(), until.to_rfc3339()], |row| {
            let severity: String = row.get(0)?;
            let total: i64 = row.get(1)?;
            let blocked: i64 = row.get(2)?;
            Ok((severity, total, blocked))
        })?;
        let mut out = Vec::new();
        for r in rows {
            let (severity, total, blocked) = r?;
            out.push((severity_from_str(&severity)?, total, blocked));
        }
        Ok(out)
    }

    // --- Whitelist -------------------------------------------------------

    pub async fn list_whitelist(&self) -> Result<Vec<IpWhitelist>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, ip_address, ip_range, entry_type, reason, priority, added_by
             FROM ip_whitelist ORDER BY priority DESC, id",
        )?;
        let rows = stmt.query_map([], row_to_whitelist)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    // --- Detection rules ---------------------------------------------------

    pub async fn list_enabled_detection_rules(&self) -> Result<Vec<DetectionRule>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, name, threshold, time_window_s, attack_types_json, severity_filter,
                    proxy_id, ban_duration_s, ban_severity, priority, enabled
             FROM detection_rules WHERE enabled = 1 ORDER BY priority",
        )?;
        let rows = stmt.query_map([], row_to_detection_rule)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    // --- IP bans -----------------------------------------------------------

    pub async fn active_ban_for_ip(&self, ip: &str) -> Result<Option<IpBan>> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        conn.query_row(
            "SELECT id, ip_address, reason, severity, auto_banned, detection_rule_id, banned_at,
                    expires_at, banned_by, integrations_notified_json, unbanned_at
             FROM ip_bans
             WHERE ip_address = ?1 AND unbanned_at IS NULL
               AND (expires_at IS NULL OR expires_at > ?2)
             ORDER BY id DESC LIMIT 1",
            params![ip, now],
            row_to_ip_ban,
        )
        .optional()
        .map_err(EngineError::from)
    }

    pub async fn list_active_bans(&self) -> Result<Vec<IpBan>> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let mut stmt = conn.prepare(
            "SELECT id, ip_address, reason, severity, auto_banned, detection_rule_id, banned_at,
                    expires_at, banned_by, integrations_notified_json, unbanned_at
             FROM ip_bans WHERE unbanned_at IS NULL AND (expires_at IS NULL OR expires_at > ?1)",
        )?;
        let rows = stmt.query_map(params![now], row_to_ip_ban)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Bans whose `expires_at` has passed but that are still marked active
    /// (`unbanned_at IS NULL`) — the set the expiry sweep needs to both
    /// close out locally and unban at every provider.
    pub async fn list_expired_bans(&self) -> Result<Vec<IpBan>> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let mut stmt = conn.prepare(
            "SELECT id, ip_address, reason, severity, auto_banned, detection_rule_id, banned_at,
                    expires_at, banned_by, integrations_notified_json, unbanned_at
             FROM ip_bans WHERE unbanned_at IS NULL AND expires_at IS NOT NULL AND expires_at <= ?1",
        )?;
        let rows = stmt.query_map(params![now], row_to_ip_ban)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub async fn insert_ban(&self, ban: &NewIpBan) -> Result<IpBan> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO ip_bans
                (ip_address, reason, severity, auto_banned, detection_rule_id, banned_at,
                 expires_at, banned_by, integrations_notified_json, unbanned_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,'[]',NULL)",
            params![
                ban.ip_address.to_string(),
                ban.reason,
                severity_str(ban.severity),
                ban.auto_banned as i64,
                ban.detection_rule_id,
                Utc::now().to_rfc3339(),
                ban.expires_at.map(|d| d.to_rfc3339()),
                ban.banned_by,
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.active_ban_for_ip(&ban.ip_address.to_string())
            .await?
            .filter(|b| b.id == id)
            .ok_or_else(|| EngineError::Internal("ban vanished after insert".into()))
    }

    pub async fn extend_ban_expiry(&self, id: i64, new_expiry: Option<DateTime<Utc>>) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE ip_bans SET expires_at = ?1 WHERE id = ?2",
            params![new_expiry.map(|d| d.to_rfc3339()), id],
        )?;
        Ok(())
    }

    pub async fn unban(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE ip_bans SET unbanned_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    pub async fn record_integration_notified(
        &self,
        ban_id: i64,
        notification: &IntegrationNotification,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let current: String = conn.query_row(
            "SELECT integrations_notified_json FROM ip_bans WHERE id = ?1",
            params![ban_id],
            |row| row.get(0),
        )?;
        let mut list: Vec<IntegrationNotification> =
            serde_json::from_str(&current).unwrap_or_default();
        list.push(notification.clone());
        conn.execute(
            "UPDATE ip_bans SET integrations_notified_json = ?1 WHERE id = ?2",
            params![serde_json::to_string(&list)?, ban_id],
        )?;
        Ok(())
    }

    // --- Ban integrations --------------------------------------------------

    pub async fn list_enabled_ban_integrations(&self) -> Result<Vec<BanIntegration>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, name, provider_type, credential_id, config_json, enabled, last_success,
                    last_error, total_bans_sent, total_unbans_sent
             FROM ban_integrations WHERE enabled = 1 ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_ban_integration)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub async fn record_integration_outcome(
        &self,
        id: i64,
        success: bool,
        error: Option<&str>,
        bans_delta: u64,
        unbans_delta: u64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        if success {
            conn.execute(
                "UPDATE ban_integrations SET last_success = ?1, last_error = NULL,
                    total_bans_sent = total_bans_sent + ?2, total_unbans_sent = total_unbans_sent + ?3
                 WHERE id = ?4",
                params![Utc::now().to_rfc3339(), bans_delta, unbans_delta, id],
            )?;
        } else {
            conn.execute(
                "UPDATE ban_integrations SET last_error = ?1 WHERE id = ?2",
                params![error, id],
            )?;
        }
        Ok(())
    }

    // --- Credentials -----------------------------------------------------

    pub async fn get_credential(&self, id: i64) -> Result<Option<Credential>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, name, credential_type, provider, credentials_encrypted, created_by
             FROM credentials WHERE id = ?1",
            params![id],
            row_to_credential,
        )
        .optional()
        .map_err(EngineError::from)
    }
}

/// Fields needed to create a Proxy; `id`/timestamps/status are assigned by
/// the store.
pub struct NewProxy {
    pub name: String,
    pub proxy_type: ProxyType,
    pub enabled: bool,
    pub content: ProxyContent,
    pub incoming_port: Option<u16>,
    pub stream_protocol: Option<String>,
    pub ssl_enabled: bool,
    pub ssl_cert_id: Option<i64>,
    pub launch_url: Option<String>,
    pub waf_profile_id: Option<i64>,
    pub config_filename: String,
}

pub struct NewCert {
    pub name: String,
    pub domain_names: Vec<String>,
    pub issuer: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub cert_path: String,
    pub key_path: String,
    pub source: CertSource,
    pub auto_renew: bool,
    pub challenge_type: Option<ChallengeType>,
    pub dns_credential_id: Option<i64>,
    pub acme_config: Option<serde_json::Value>,
}

pub struct NewWafEvent {
    pub timestamp: DateTime<Utc>,
    pub proxy_id: Option<i64>,
    pub client_ip: std::net::IpAddr,
    pub attack_type: String,
    pub severity: Severity,
    pub blocked: bool,
    pub request_uri: String,
    pub raw_log: serde_json::Value,
    pub http_status: Option<u16>,
}

pub struct NewIpBan {
    pub ip_address: std::net::IpAddr,
    pub reason: String,
    pub severity: Severity,
    pub auto_banned: bool,
    pub detection_rule_id: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub banned_by: Option<i64>,
}

fn proxy_type_str(t: ProxyType) -> &'static str {
    match t {
        ProxyType::Reverse => "reverse",
        ProxyType::Stream => "stream",
        ProxyType::NotFound404 => "404",
    }
}

fn proxy_type_from_str(s: &str) -> rusqlite::Result<ProxyType> {
    match s {
        "reverse" => Ok(ProxyType::Reverse),
        "stream" => Ok(ProxyType::Stream),
        "404" => Ok(ProxyType::NotFound404),
        other => Err(rusqlite::Error::InvalidColumnType(
            0,
            format!("unknown proxy_type '{other}'"),
            rusqlite::types::Type::Text,
        )),
    }
}

fn config_status_str(s: ConfigStatus) -> &'static str {
    match s {
        ConfigStatus::Pending => "pending",
        ConfigStatus::Active => "active",
        ConfigStatus::Error => "error",
    }
}

fn config_status_from_str(s: &str) -> rusqlite::Result<ConfigStatus> {
    match s {
        "pending" => Ok(ConfigStatus::Pending),
        "active" => Ok(ConfigStatus::Active),
        "error" => Ok(ConfigStatus::Error),
        other => Err(rusqlite::Error::InvalidColumnType(
            0,
            format!("unknown config_status '{other}'"),
            rusqlite::types::Type::Text,
        )),
    }
}

fn cert_source_str(s: CertSource) -> &'static str {
    match s {
        CertSource::Upload => "upload",
        CertSource::Acme => "acme",
    }
}

fn cert_source_from_str(s: &str) -> rusqlite::Result<CertSource> {
    match s {
        "upload" => Ok(CertSource::Upload),
        "acme" => Ok(CertSource::Acme),
        other => Err(rusqlite::Error::InvalidColumnType(
            0,
            format!("unknown cert source '{other}'"),
            rusqlite::types::Type::Text,
        )),
    }
}

fn challenge_type_str(c: ChallengeType) -> &'static str {
    match c {
        ChallengeType::Http01 => "http-01",
        ChallengeType::Dns01 => "dns-01",
    }
}

fn challenge_type_from_str(s: &str) -> rusqlite::Result<ChallengeType> {
    match s {
        "http-01" => Ok(ChallengeType::Http01),
        "dns-01" => Ok(ChallengeType::Dns01),
        other => Err(rusqlite::Error::InvalidColumnType(
            0,
            format!("unknown challenge_type '{other}'"),
            rusqlite::types::Type::Text,
        )),
    }
}

fn severity_str(s: Severity) -> &'static str {
    s.as_str()
}

fn severity_from_str(s: &str) -> rusqlite::Result<Severity> {
    match s {
        "LOW" => Ok(Severity::Low),
        "MEDIUM" => Ok(Severity::Medium),
        "HIGH" => Ok(Severity::High),
        "CRITICAL" => Ok(Severity::Critical),
        other => Err(rusqlite::Error::InvalidColumnType(
            0,
            format!("unknown severity '{other}'"),
            rusqlite::types::Type::Text,
        )),
    }
}

fn row_to_proxy(row: &rusqlite::Row) -> rusqlite::Result<Proxy> {
    let content_json: String = row.get(4)?;
    let content: ProxyContent = serde_json::from_str(&content_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let created_at: String = row.get(14)?;
    let updated_at: String = row.get(15)?;
    Ok(Proxy {
        id: row.get(0)?,
        name: row.get(1)?,
        proxy_type: proxy_type_from_str(&row.get::<_, String>(2)?)?,
        enabled: row.get::<_, i64>(3)? != 0,
        content,
        incoming_port: row.get(5)?,
        stream_protocol: row.get(6)?,
        ssl_enabled: row.get::<_, i64>(7)? != 0,
        ssl_cert_id: row.get(8)?,
        launch_url: row.get(9)?,
        waf_profile_id: row.get(10)?,
        config_filename: row.get(11)?,
        config_status: config_status_from_str(&row.get::<_, String>(12)?)?,
        config_error: row.get(13)?,
        created_at: parse_rfc3339(&created_at)?,
        updated_at: parse_rfc3339(&updated_at)?,
    })
}

fn row_to_module(row: &rusqlite::Row) -> rusqlite::Result<Module> {
    let level: String = row.get(5)?;
    Ok(Module {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        content: row.get(3)?,
        tag: row.get(4)?,
        level: match level.as_str() {
            "server" => ModuleLevel::Server,
            "location" => ModuleLevel::Location,
            "redirect" => ModuleLevel::Redirect,
            other => {
                return Err(rusqlite::Error::InvalidColumnType(
                    5,
                    format!("unknown module level '{other}'"),
                    rusqlite::types::Type::Text,
                ))
            }
        },
    })
}

fn row_to_cert(row: &rusqlite::Row) -> rusqlite::Result<Cert> {
    let domain_names_json: String = row.get(2)?;
    let domain_names: Vec<String> = serde_json::from_str(&domain_names_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let expires_at: Option<String> = row.get(4)?;
    let challenge_type: Option<String> = row.get(9)?;
    let acme_config_json: Option<String> = row.get(11)?;
    Ok(Cert {
        id: row.get(0)?,
        name: row.get(1)?,
        domain_names,
        issuer: row.get(3)?,
        expires_at: expires_at.map(|s| parse_rfc3339(&s)).transpose()?,
        cert_path: row.get(5)?,
        key_path: row.get(6)?,
        source: cert_source_from_str(&row.get::<_, String>(7)?)?,
        auto_renew: row.get::<_, i64>(8)? != 0,
        challenge_type: challenge_type
            .map(|s| challenge_type_from_str(&s))
            .transpose()?,
        dns_credential_id: row.get(10)?,
        acme_config: acme_config_json
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e: serde_json::Error| {
                rusqlite::Error::FromSqlConversionFailure(
                    11,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
    })
}

fn row_to_waf_profile(row: &rusqlite::Row) -> rusqlite::Result<WafProfile> {
    let config_json: String = row.get(4)?;
    Ok(WafProfile {
        id: row.get(0)?,
        name: row.get(1)?,
        ruleset: row.get(2)?,
        paranoia_level: row.get(3)?,
        config_json: serde_json::from_str(&config_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?,
        enabled: row.get::<_, i64>(5)? != 0,
    })
}

fn row_to_whitelist(row: &rusqlite::Row) -> rusqlite::Result<IpWhitelist> {
    let ip: Option<String> = row.get(1)?;
    let entry_type: String = row.get(3)?;
    Ok(IpWhitelist {
        id: row.get(0)?,
        ip_address: ip.and_then(|s| s.parse().ok()),
        ip_range: row.get(2)?,
        entry_type: match entry_type.as_str() {
            "manual" => WhitelistType::Manual,
            "system" => WhitelistType::System,
            other => {
                return Err(rusqlite::Error::InvalidColumnType(
                    3,
                    format!("unknown whitelist type '{other}'"),
                    rusqlite::types::Type::Text,
                ))
            }
        },
        reason: row.get(4)?,
        priority: row.get(5)?,
        added_by: row.get(6)?,
    })
}

fn row_to_detection_rule(row: &rusqlite::Row) -> rusqlite::Result<DetectionRule> {
    let attack_types_json: Option<String> = row.get(4)?;
    let severity_filter: String = row.get(5)?;
    let ban_severity: String = row.get(8)?;
    Ok(DetectionRule {
        id: row.get(0)?,
        name: row.get(1)?,
        threshold: row.get(2)?,
        time_window_s: row.get(3)?,
        attack_types: attack_types_json
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e: serde_json::Error| {
                rusqlite::Error::FromSqlConversionFailure(
                    4,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
        severity_filter: match severity_filter.as_str() {
            "ALL" => SeverityFilter::All,
            "LOW" => SeverityFilter::Low,
            "MEDIUM" => SeverityFilter::Medium,
            "HIGH" => SeverityFilter::High,
            "CRITICAL" => SeverityFilter::Critical,
            other => {
                return Err(rusqlite::Error::InvalidColumnType(
                    5,
                    format!("unknown severity filter '{other}'"),
                    rusqlite::types::Type::Text,
                ))
            }
        },
        proxy_id: row.get(6)?,
        ban_duration_s: row.get(7)?,
        ban_severity: severity_from_str(&ban_severity)?,
        priority: row.get(9)?,
        enabled: row.get::<_, i64>(10)? != 0,
    })
}

fn row_to_waf_event(row: &rusqlite::Row) -> rusqlite::Result<WafEvent> {
    let timestamp: String = row.get(1)?;
    let client_ip: String = row.get(3)?;
    let severity: String = row.get(5)?;
    let raw_log_json: String = row.get(8)?;
    Ok(WafEvent {
        id: row.get(0)?,
        timestamp: parse_rfc3339(&timestamp)?,
        proxy_id: row.get(2)?,
        client_ip: client_ip.parse().map_err(|_| {
            rusqlite::Error::InvalidColumnType(
                3,
                "invalid ip".into(),
                rusqlite::types::Type::Text,
            )
        })?,
        attack_type: row.get(4)?,
        severity: severity_from_str(&severity)?,
        blocked: row.get::<_, i64>(6)? != 0,
        request_uri: row.get(7)?,
        raw_log: serde_json::from_str(&raw_log_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
        })?,
        http_status: row.get(9)?,
    })
}

fn row_to_ip_ban(row: &rusqlite::Row) -> rusqlite::Result<IpBan> {
    let ip: String = row.get(1)?;
    let severity: String = row.get(3)?;
    let banned_at: String = row.get(6)?;
    let expires_at: Option<String> = row.get(7)?;
    let integrations_notified_json: String = row.get(9)?;
    let unbanned_at: Option<String> = row.get(10)?;
    Ok(IpBan {
        id: row.get(0)?,
        ip_address: ip.parse().map_err(|_| {
            rusqlite::Error::InvalidColumnType(
                1,
                "invalid ip".into(),
                rusqlite::types::Type::Text,
            )
        })?,
        reason: row.get(2)?,
        severity: severity_from_str(&severity)?,
        auto_banned: row.get::<_, i64>(4)? != 0,
        detection_rule_id: row.get(5)?,
        banned_at: parse_rfc3339(&banned_at)?,
        expires_at: expires_at.map(|s| parse_rfc3339(&s)).transpose()?,
        banned_by: row.get(8)?,
        integrations_notified: serde_json::from_str(&integrations_notified_json)
            .unwrap_or_default(),
        unbanned_at: unbanned_at.map(|s| parse_rfc3339(&s)).transpose()?,
    })
}

fn row_to_ban_integration(row: &rusqlite::Row) -> rusqlite::Result<BanIntegration> {
    let config_json: String = row.get(4)?;
    let last_success: Option<String> = row.get(6)?;
    Ok(BanIntegration {
        id: row.get(0)?,
        name: row.get(1)?,
        provider_type: row.get(2)?,
        credential_id: row.get(3)?,
        config_json: serde_json::from_str(&config_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?,
        enabled: row.get::<_, i64>(5)? != 0,
        last_success: last_success.map(|s| parse_rfc3339(&s)).transpose()?,
        last_error: row.get(7)?,
        total_bans_sent: row.get::<_, i64>(8)? as u64,
        total_unbans_sent: row.get::<_, i64>(9)? as u64,
    })
}

fn row_to_credential(row: &rusqlite::Row) -> rusqlite::Result<Credential> {
    let credential_type: String = row.get(2)?;
    Ok(Credential {
        id: row.get(0)?,
        name: row.get(1)?,
        credential_type: match credential_type.as_str() {
            "dns" => CredentialType::Dns,
            "ban" => CredentialType::Ban,
            other => {
                return Err(rusqlite::Error::InvalidColumnType(
                    2,
                    format!("unknown credential type '{other}'"),
                    rusqlite::types::Type::Text,
                ))
            }
        },
        provider: row.get(3)?,
        credentials_encrypted: row.get(4)?,
        created_by: row.get(5)?,
    })
}

fn parse_rfc3339(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> Store {
        Store::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn create_and_fetch_proxy_round_trips() {
        let store = test_store().await;
        let proxy = store
            .create_proxy(&NewProxy {
                name: "app".into(),
                proxy_type: ProxyType::Reverse,
                enabled: true,
                content: ProxyContent::Structured {
                    domain_names: vec!["app.example.com".into()],
                    forward_scheme: ForwardScheme::Http,
                    forward_host: "10.0.0.5".into(),
                    forward_port: 3000,
                    advanced_config: None,
                },
                incoming_port: None,
                stream_protocol: None,
                ssl_enabled: false,
                ssl_cert_id: None,
                launch_url: None,
                waf_profile_id: None,
                config_filename: "1-app.conf".into(),
            })
            .await
            .unwrap();
        assert_eq!(proxy.config_status, ConfigStatus::Pending);
        let fetched = store.get_proxy(proxy.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "app");
        assert_eq!(fetched.domain_names(), &["app.example.com".to_string()]);
    }

    #[tokio::test]
    async fn duplicate_proxy_name_is_a_conflict() {
        let store = test_store().await;
        let make = || NewProxy {
            name: "dup".into(),
            proxy_type: ProxyType::Reverse,
            enabled: true,
            content: ProxyContent::Raw {
                text: "server {}".into(),
            },
            incoming_port: None,
            stream_protocol: None,
            ssl_enabled: false,
            ssl_cert_id: None,
            launch_url: None,
            waf_profile_id: None,
            config_filename: "1-dup.conf".into(),
        };
        store.create_proxy(&make()).await.unwrap();
        let err = store.create_proxy(&make()).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn cert_delete_cascade_clears_referencing_proxies() {
        let store = test_store().await;
        let cert = store
            .insert_cert(&NewCert {
                name: "cert-a".into(),
                domain_names: vec!["a.example.com".into()],
                issuer: None,
                expires_at: None,
                cert_path: "/data/ssl/a.crt".into(),
                key_path: "/data/ssl/a.key".into(),
                source: CertSource::Upload,
                auto_renew: false,
                challenge_type: None,
                dns_credential_id: None,
                acme_config: None,
            })
            .await
            .unwrap();
        let proxy = store
            .create_proxy(&NewProxy {
                name: "a".into(),
                proxy_type: ProxyType::Reverse,
                enabled: true,
                content: ProxyContent::Structured {
                    domain_names: vec!["a.example.com".into()],
                    forward_scheme: ForwardScheme::Http,
                    forward_host: "10.0.0.5".into(),
                    forward_port: 3000,
                    advanced_config: None,
                },
                incoming_port: None,
                stream_protocol: None,
                ssl_enabled: true,
                ssl_cert_id: Some(cert.id),
                launch_url: None,
                waf_profile_id: None,
                config_filename: "1-a.conf".into(),
            })
            .await
            .unwrap();
        let affected = store.clear_ssl_for_cert(cert.id).await.unwrap();
        assert_eq!(affected, vec![proxy.id]);
        let refreshed = store.get_proxy(proxy.id).await.unwrap().unwrap();
        assert!(!refreshed.ssl_enabled);
        assert!(refreshed.ssl_cert_id.is_none());
    }

    #[tokio::test]
    async fn active_ban_lookup_excludes_unbanned_and_expired() {
        let store = test_store().await;
        let ip: std::net::IpAddr = "203.0.113.9".parse().unwrap();
        let ban = store
            .insert_ban(&NewIpBan {
                ip_address: ip,
                reason: "sqli".into(),
                severity: Severity::High,
                auto_banned: true,
                detection_rule_id: None,
                expires_at: Some(Utc::now() + chrono::Duration::seconds(60)),
                banned_by: None,
            })
            .await
            .unwrap();
        assert!(store.active_ban_for_ip(&ip.to_string()).await.unwrap().is_some());
        store.unban(ban.id).await.unwrap();
        assert!(store.active_ban_for_ip(&ip.to_string()).await.unwrap().is_none());
    }
}
