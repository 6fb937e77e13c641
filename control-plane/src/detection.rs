//! Sliding-window threshold counters per
//! `(client_ip, rule_id)` over WAF events, whitelist enforcement, and ban
//! emission with tie-break logic for simultaneous rule triggers. Counter
//! maps are sharded by IP via `DashMap` to keep concurrent event ingestion
//! from serializing on a single lock.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use control_plane_types::*;
use dashmap::DashMap;
use ipnet::IpNet;
use tracing::info;

use crate::error::Result;
use crate::store::{NewIpBan, Store};

#[derive(Clone)]
struct WhitelistEntry {
    net: IpNet,
    is_system: bool,
}

pub struct DecidedBan {
    pub ban_id: i64,
    pub ip: IpAddr,
    pub duration_s: u64,
    pub severity: Severity,
    pub reason: String,
    pub detection_rule_id: Option<i64>,
}

pub struct DetectionEngine {
    store: Store,
    counters: DashMap<(IpAddr, i64), VecDeque<DateTime<Utc>>>,
    whitelist: Arc<tokio::sync::RwLock<Vec<WhitelistEntry>>>,
}

impl DetectionEngine {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            counters: DashMap::new(),
            whitelist: Arc::new(tokio::sync::RwLock::new(Vec::new())),
        }
    }

    /// Rebuilds the whitelist interval structure; call on startup and
    /// whenever `IpWhitelist` changes.
    pub async fn refresh_whitelist(&self) -> Result<()> {
        let rows = self.store.list_whitelist().await?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let net = if let Some(range) = &row.ip_range {
                match range.parse::<IpNet>() {
                    Ok(n) => n,
                    Err(_) => continue,
                }
            } else if let Some(ip) = row.ip_address {
                IpNet::from(ip)
            } else {
                continue;
            };
            entries.push(WhitelistEntry {
                net,
                is_system: row.entry_type == WhitelistType::System,
            });
        }
        *self.whitelist.write().await = entries;
        Ok(())
    }

    async fn is_whitelisted(&self, ip: IpAddr) -> bool {
        let entries = self.whitelist.read().await;
        // System entries take precedence: checked first, never overridden
        // by an absence of a manual match either way — a match on any
        // entry (system or manual) is sufficient to protect the IP.
        entries.iter().any(|e| e.net.contains(&ip))
    }

    /// Feeds one WAF event through every enabled detection rule. Emits and
    /// persists a ban decision (and feeds BanQueue via the returned
    /// `DecidedBan`s) when a rule's threshold is reached.
    pub async fn on_event(&self, event: &WafEvent) -> Result<Vec<DecidedBan>> {
        if self.is_whitelisted(event.client_ip).await {
            return Ok(Vec::new());
        }

        let rules = self.store.list_enabled_detection_rules().await?;
        let mut triggered: Vec<&DetectionRule> = Vec::new();

        for rule in &rules {
            if !rule_matches(rule, event) {
                continue;
            }
            let key = (event.client_ip, rule.id);
            let mut deque = self.counters.entry(key).or_default();
            deque.push_back(event.timestamp);
            let window_start = event.timestamp - chrono::Duration::seconds(rule.time_window_s as i64);
            while deque.front().map_or(false, |t| *t < window_start) {
                deque.pop_front();
            }
            if deque.len() as u32 >= rule.threshold {
                deque.clear(); // reset to prevent flapping
                triggered.push(rule);
            }
        }

        if triggered.is_empty() {
            return Ok(Vec::new());
        }

        // Tie-break: highest ban_severity, max(ban_duration_s), union reasons.
        let severity = triggered.iter().map(|r| r.ban_severity).max().unwrap();
        let duration_s = triggered.iter().map(|r| r.ban_duration_s).max().unwrap();
        let reason = triggered
            .iter()
            .map(|r| r.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let detection_rule_id = triggered.first().map(|r| r.id);

        self.emit_ban(event.client_ip, duration_s, severity, reason, detection_rule_id)
            .await
    }

    async fn emit_ban(
        &self,
        ip: IpAddr,
        duration_s: u64,
        severity: Severity,
        reason: String,
        detection_rule_id: Option<i64>,
    ) -> Result<Vec<DecidedBan>> {
        let new_expiry = Utc::now() + chrono::Duration::seconds(duration_s as i64);

        if let Some(existing) = self.store.active_ban_for_ip(&ip.to_string()).await? {
            let should_extend = match existing.expires_at {
                Some(exp) => new_expiry > exp,
                None => false, // already permanent; nothing to extend
            };
            if should_extend {
                self.store.extend_ban_expiry(existing.id, Some(new_expiry)).await?;
            }
            return Ok(Vec::new());
        }

        let ban = self
            .store
            .insert_ban(&NewIpBan {
                ip_address: ip,
                reason: reason.clone(),
                severity,
                auto_banned: true,
                detection_rule_id,
                expires_at: Some(new_expiry),
                banned_by: None,
            })
            .await?;

        info!(%ip, %reason, duration_s, "detection engine emitted ban");

        Ok(vec![DecidedBan {
            ban_id: ban.id,
            ip,
            duration_s,
            severity,
            reason,
            detection_rule_id,
        }])
    }

    /// Drops `(ip, rule_id)` counters with no events inside the last
    /// `max_age_s` so the map doesn't grow unbounded with one-off
    /// offenders. Call this from the periodic scheduler tick.
    pub fn gc_counters(&self, max_age_s: i64) {
        let cutoff = Utc::now() - chrono::Duration::seconds(max_age_s);
        self.counters.retain(|_, deque| {
            deque.back().map_or(false, |last| *last >= cutoff)
        });
    }
}

fn rule_matches(rule: &DetectionRule, event: &WafEvent) -> bool {
    let attack_type_ok = rule
        .attack_types
        .as_ref()
        .map_or(true, |types| types.iter().any(|t| t == &event.attack_type));
    let severity_ok = rule.severity_filter.admits(event.severity);
    let proxy_ok = rule.proxy_id.map_or(true, |id| Some(id) == event.proxy_id);
    attack_type_ok && severity_ok && proxy_ok
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(client_ip: IpAddr, attack_type: &str) -> WafEvent {
        WafEvent {
            id: 0,
            timestamp: Utc::now(),
            proxy_id: None,
            client_ip,
            attack_type: attack_type.into(),
            severity: Severity::High,
            blocked: true,
            request_uri: "/login".into(),
            raw_log: serde_json::json!({}),
            http_status: Some(403),
        }
    }

    #[tokio::test]
    async fn whitelisted_ip_never_produces_a_ban() {
        let store = Store::open(":memory:").await.unwrap();
        let engine = DetectionEngine::new(store.clone());
        // No detection rules configured at all -> on_event is a no-op.
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        let event = sample_event(ip, "sqli");
        let decided = engine.on_event(&event).await.unwrap();
        assert!(decided.is_empty());
    }

    #[test]
    fn rule_matches_checks_attack_type_severity_and_proxy() {
        let rule = DetectionRule {
            id: 1,
            name: "sqli-rule".into(),
            threshold: 10,
            time_window_s: 60,
            attack_types: Some(vec!["sqli".into()]),
            severity_filter: SeverityFilter::Medium,
            proxy_id: None,
            ban_duration_s: 3600,
            ban_severity: Severity::High,
            priority: 0,
            enabled: true,
        };
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        let matching = sample_event(ip, "sqli");
        let mut not_matching = sample_event(ip, "xss");
        not_matching.severity = Severity::Low;
        assert!(rule_matches(&rule, &matching));
        assert!(!rule_matches(&rule, &not_matching));
    }
}
