//! Tails the configured WAF audit log files, turns each JSON line into a
//! `WafEvent`, resolves it to the `Proxy` that served the request, and
//! fans it out to the `Store`, the `Broadcaster`, and `DetectionEngine`.
//! Dedup uses an LRU keyed on `(transaction_id, rule_id)` so a retried log
//! write (or a log file that's rotated and re-tailed from its start) never
//! double-counts an event.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use control_plane_types::Severity;
use lru::LruCache;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::ban_queue::{BanAction, BanOp, BanQueue};
use crate::broadcaster::{Broadcaster, Topic};
use crate::detection::DetectionEngine;
use crate::error::Result;
use crate::store::{NewWafEvent, Store};

pub struct WafIngestConfig {
    pub audit_log_paths: Vec<PathBuf>,
    pub dedup_capacity: usize,
    pub backfill_window_minutes: i64,
    pub backfill_fallback_minutes: i64,
}

struct RawLogLine {
    transaction_id: String,
    rule_id: String,
    timestamp: DateTime<Utc>,
    client_ip: std::net::IpAddr,
    attack_type: String,
    severity: Severity,
    blocked: bool,
    request_uri: String,
    host: Option<String>,
    http_status: Option<u16>,
    raw: serde_json::Value,
}

fn parse_line(line: &str) -> Option<RawLogLine> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    let transaction = &value["transaction"];
    let tx_id = transaction["id"].as_str()?.to_string();

    let messages = value["messages"].as_array();
    let first_rule = messages
        .and_then(|m| m.first())
        .and_then(|m| m["details"]["ruleId"].as_str())
        .unwrap_or("unknown")
        .to_string();

    let client_ip: std::net::IpAddr = transaction["client_ip"].as_str()?.parse().ok()?;
    let timestamp = transaction["time"]
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let severity = match transaction["severity"].as_str().unwrap_or("MEDIUM") {
        "CRITICAL" | "critical" => Severity::Critical,
        "HIGH" | "high" => Severity::High,
        "LOW" | "low" => Severity::Low,
        _ => Severity::Medium,
    };

    let request_uri = transaction["request"]["uri"].as_str().unwrap_or("/").to_string();
    let host = transaction["request"]["headers"]["Host"].as_str().map(str::to_string);
    let http_status = transaction["response"]["http_code"].as_u64().map(|v| v as u16);

    // Derived, never trusted from the log line: a request is blocked iff
    // ModSecurity returned one of its interruption codes or any matched
    // rule carried a deny action.
    let any_rule_denies = messages
        .map(|m| m.iter().any(|entry| entry["details"]["action"].as_str() == Some("deny")))
        .unwrap_or(false);
    let blocked = matches!(http_status, Some(403) | Some(406)) || any_rule_denies;

    let attack_type = messages
        .and_then(|m| m.first())
        .and_then(|m| m["details"]["tags"].as_array())
        .and_then(|tags| tags.first())
        .and_then(|t| t.as_str())
        .unwrap_or("unknown")
        .to_string();

    Some(RawLogLine {
        transaction_id: tx_id,
        rule_id: first_rule,
        timestamp,
        client_ip,
        attack_type,
        severity,
        blocked,
        request_uri,
        host,
        http_status,
        raw: value,
    })
}

pub struct WafIngestor {
    store: Store,
    broadcaster: Arc<Broadcaster>,
    detection: Arc<DetectionEngine>,
    ban_queue: Arc<BanQueue>,
    dedup: Mutex<LruCache<(String, String), ()>>,
    offsets: Mutex<HashMap<PathBuf, u64>>,
    paths: Vec<PathBuf>,
    backfill_window_minutes: i64,
    backfill_fallback_minutes: i64,
    healthy: AtomicBool,
}

impl WafIngestor {
    pub fn new(
        store: Store,
        broadcaster: Arc<Broadcaster>,
        detection: Arc<DetectionEngine>,
        ban_queue: Arc<BanQueue>,
        cfg: &WafIngestConfig,
    ) -> Self {
        Self {
            store,
            broadcaster,
            detection,
            ban_queue,
            dedup: Mutex::new(LruCache::new(
                NonZeroUsize::new(cfg.dedup_capacity.max(1)).unwrap(),
            )),
            offsets: Mutex::new(HashMap::new()),
            paths: cfg.audit_log_paths.clone(),
            backfill_window_minutes: cfg.backfill_window_minutes,
            backfill_fallback_minutes: cfg.backfill_fallback_minutes,
            healthy: AtomicBool::new(true),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// One pass over every configured file: read any bytes appended since
    /// the last call, parse complete lines, and process each. Call this on
    /// the scheduler's tick; a partial trailing line (the writer hasn't
    /// flushed a newline yet) is left for the next pass.
    pub async fn poll_once(&self) {
        for path in &self.paths {
            if let Err(err) = self.poll_file(path).await {
                warn!(path = %path.display(), error = %err, "waf log tail failed, pausing ingestion for this file");
                self.healthy.store(false, Ordering::SeqCst);
                return;
            }
        }
        self.healthy.store(true, Ordering::SeqCst);
    }

    async fn poll_file(&self, path: &Path) -> Result<()> {
        let mut file = match tokio::fs::File::open(path).await {
            Ok(f) => f,
            Err(_) => return Ok(()), // file not present yet; not a failure
        };

        let mut offsets = self.offsets.lock().await;
        let start = *offsets.get(path).unwrap_or(&0);
        let metadata = file.metadata().await?;
        if metadata.len() < start {
            // file was truncated/rotated; restart from the top.
            offsets.insert(path.to_path_buf(), 0);
            drop(offsets);
            return Box::pin(self.poll_file(path)).await;
        }
        file.seek(std::io::SeekFrom::Start(start)).await?;
        drop(offsets);

        let mut reader = tokio::io::BufReader::new(file);
        let mut consumed: u64 = start;
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await?;
            if n == 0 || !line.ends_with('\n') {
                break;
            }
            consumed += n as u64;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if let Some(parsed) = parse_line(trimmed) {
                self.process(parsed).await?;
            } else {
                debug!(path = %path.display(), "skipping unparseable waf log line");
            }
        }

        self.offsets.lock().await.insert(path.to_path_buf(), consumed);
        Ok(())
    }

    async fn process(&self, line: RawLogLine) -> Result<()> {
        {
            let mut dedup = self.dedup.lock().await;
            let key = (line.transaction_id.clone(), line.rule_id.clone());
            if dedup.contains(&key) {
                return Ok(());
            }
            dedup.put(key, ());
        }

        let proxy_id = match &line.host {
            Some(host) => self.resolve_proxy_by_host(host).await?,
            None => None,
        };

        let event_id = self
            .store
            .insert_waf_event(&NewWafEvent {
                timestamp: line.timestamp,
                proxy_id,
                client_ip: line.client_ip,
                attack_type: line.attack_type.clone(),
                severity: line.severity,
                blocked: line.blocked,
                request_uri: line.request_uri.clone(),
                raw_log: line.raw.clone(),
                http_status: line.http_status,
            })
            .await?;

        self.broadcaster.publish(
            Topic::Waf,
            crate::broadcaster::Event::Waf {
                event: serde_json::json!({
                    "id": event_id,
                    "proxy_id": proxy_id,
                    "client_ip": line.client_ip.to_string(),
                    "attack_type": line.attack_type,
                    "severity": line.severity.as_str(),
                    "blocked": line.blocked,
                }),
            },
        );

        let event = control_plane_types::WafEvent {
            id: event_id,
            timestamp: line.timestamp,
            proxy_id,
            client_ip: line.client_ip,
            attack_type: line.attack_type,
            severity: line.severity,
            blocked: line.blocked,
            request_uri: line.request_uri,
            raw_log: line.raw,
            http_status: line.http_status,
        };
        let decided = self.detection.on_event(&event).await?;
        for ban in decided {
            self.dispatch_ban(ban.ban_id, ban.ip, ban.duration_s, ban.reason).await?;
        }

        Ok(())
    }

    async fn resolve_proxy_by_host(&self, host: &str) -> Result<Option<i64>> {
        let bare_host = host.split(':').next().unwrap_or(host);
        let proxies = self.store.list_proxies().await?;
        Ok(proxies
            .iter()
            .find(|p| p.domain_names().iter().any(|d| d == bare_host))
            .map(|p| p.id))
    }

    /// Sweeps events with no resolved proxy and assigns them to whichever
    /// proxy saw the majority of that client IP's traffic in the
    /// surrounding window, falling back to a wider window before giving up.
    pub async fn backfill_unresolved(&self) -> Result<()> {
        let unresolved = self.store.unresolved_waf_events().await?;
        for event in unresolved {
            let windows = [self.backfill_window_minutes, self.backfill_fallback_minutes];
            let mut resolved = None;
            for minutes in windows {
                let since = event.timestamp - chrono::Duration::minutes(minutes);
                let until = event.timestamp + chrono::Duration::minutes(minutes);
                let candidates = self
                    .store
                    .events_for_ip_between(&event.client_ip.to_string(), since, until)
                    .await?;
                if let Some(majority) = majority_proxy(&candidates) {
                    resolved = Some(majority);
                    break;
                }
            }
            if let Some(proxy_id) = resolved {
                self.store.assign_waf_event_proxy(event.id, proxy_id).await?;
            }
        }
        Ok(())
    }

    async fn dispatch_ban(&self, ban_id: i64, ip: std::net::IpAddr, duration_s: u64, reason: String) -> Result<()> {
        let integrations = self.store.list_enabled_ban_integrations().await?;
        for integration in integrations {
            self.ban_queue.enqueue(
                integration.id,
                BanOp {
                    action: BanAction::Ban,
                    ip,
                    reason: Some(reason.clone()),
                    duration_s: Some(duration_s),
                    severity: None,
                    ban_record_id: Some(ban_id),
                    provider_ban_id: None,
                    retry_count: 0,
                },
            );
        }
        self.broadcaster.publish(
            Topic::Ban,
            crate::broadcaster::Event::Ban {
                event_type: crate::broadcaster::BanEventType::BanCreated,
                data: serde_json::json!({"ip": ip.to_string(), "reason": reason}),
            },
        );
        Ok(())
    }
}

fn majority_proxy(events: &[control_plane_types::WafEvent]) -> Option<i64> {
    let mut counts: HashMap<i64, usize> = HashMap::new();
    for e in events {
        if let Some(id) = e.proxy_id {
            *counts.entry(id).or_insert(0) += 1;
        }
    }
    counts.into_iter().max_by_key(|(_, count)| *count).map(|(id, _)| id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_well_formed_modsecurity_audit_line() {
        let line = serde_json::json!({
            "transaction": {
                "id": "tx-1",
                "client_ip": "203.0.113.9",
                "time": "2026-01-01T00:00:00Z",
                "severity": "HIGH",
                "blocked": true,
                "request": {"uri": "/login", "headers": {"Host": "app.example.com:443"}},
                "response": {"http_code": 403},
            },
            "messages": [{"details": {"ruleId": "942100", "tags": ["sqli"]}}],
        })
        .to_string();
        let parsed = parse_line(&line).unwrap();
        assert_eq!(parsed.transaction_id, "tx-1");
        assert_eq!(parsed.rule_id, "942100");
        assert_eq!(parsed.attack_type, "sqli");
        assert_eq!(parsed.host.as_deref(), Some("app.example.com:443"));
        assert!(parsed.blocked);
    }

    #[test]
    fn malformed_line_does_not_parse() {
        assert!(parse_line("not json at all").is_none());
    }

    #[test]
    fn blocked_is_derived_from_status_and_rule_action_not_trusted() {
        let passed_through = serde_json::json!({
            "transaction": {
                "id": "tx-2",
                "client_ip": "203.0.113.9",
                "time": "2026-01-01T00:00:00Z",
                "severity": "LOW",
                "blocked": true,
                "request": {"uri": "/", "headers": {}},
                "response": {"http_code": 200},
            },
            "messages": [{"details": {"ruleId": "900100", "action": "log"}}],
        })
        .to_string();
        let parsed = parse_line(&passed_through).unwrap();
        assert!(!parsed.blocked);

        let denied_without_403 = serde_json::json!({
            "transaction": {
                "id": "tx-3",
                "client_ip": "203.0.113.9",
                "time": "2026-01-01T00:00:00Z",
                "severity": "HIGH",
                "blocked": false,
                "request": {"uri": "/", "headers": {}},
                "response": {"http_code": 200},
            },
            "messages": [{"details": {"ruleId": "942100", "action": "deny"}}],
        })
        .to_string();
        let parsed = parse_line(&denied_without_403).unwrap();
        assert!(parsed.blocked);
    }

    #[test]
    fn majority_proxy_picks_the_most_common_id() {
        let make = |proxy_id: Option<i64>| control_plane_types::WafEvent {
            id: 0,
            timestamp: Utc::now(),
            proxy_id,
            client_ip: "203.0.113.9".parse().unwrap(),
            attack_type: "sqli".into(),
            severity: Severity::High,
            blocked: true,
            request_uri: "/".into(),
            raw_log: serde_json::json!({}),
            http_status: None,
        };
        let events = vec![make(Some(1)), make(Some(2)), make(Some(1))];
        assert_eq!(majority_proxy(&events), Some(1));
    }
}
