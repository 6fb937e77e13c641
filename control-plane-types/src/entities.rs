//! Persisted entity shapes. These are plain data; the Store crate
//! owns reading/writing them and enforcing invariants around foreign keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `type` of a Proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    Reverse,
    Stream,
    #[serde(rename = "404")]
    NotFound404,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardScheme {
    Http,
    Https,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigStatus {
    Pending,
    Active,
    Error,
}

/// Tagged representation of the legacy `domain_names="N/A"` sentinel: a proxy
/// either supplies structured fields for ConfigGen to render, or an operator
/// has handed it a complete raw nginx block ("custom-editor mode").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ProxyContent {
    Structured {
        domain_names: Vec<String>,
        forward_scheme: ForwardScheme,
        forward_host: String,
        forward_port: u16,
        advanced_config: Option<String>,
    },
    Raw {
        text: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proxy {
    pub id: i64,
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
    pub config_status: ConfigStatus,
    pub config_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Proxy {
    /// Custom-editor mode is equivalent to the legacy `domain_names == "N/A"` with
    /// non-empty `advanced_config`; here that's represented directly as the
    /// `Raw` variant rather than overloading a column.
    pub fn is_custom_editor(&self) -> bool {
        matches!(self.content, ProxyContent::Raw { .. })
    }

    pub fn domain_names(&self) -> &[String] {
        match &self.content {
            ProxyContent::Structured { domain_names, .. } => domain_names,
            ProxyContent::Raw { .. } => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleLevel {
    Server,
    Location,
    Redirect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub content: String,
    pub tag: String,
    pub level: ModuleLevel,
}

/// Many-to-many join row; `assoc_id` is the association's own monotone id
/// and establishes per-proxy module ordering (ordered by
/// insertion id").
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProxyModule {
    pub assoc_id: i64,
    pub proxy_id: i64,
    pub module_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CertSource {
    Upload,
    Acme,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChallengeType {
    Http01,
    Dns01,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cert {
    pub id: i64,
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

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WafProfile {
    pub id: i64,
    pub name: String,
    pub ruleset: String,
    pub paranoia_level: u8,
    pub config_json: serde_json::Value,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WafExclusion {
    pub id: i64,
    pub profile_id: i64,
    pub rule_id: String,
    pub path_pattern: Option<String>,
    pub parameter_name: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WafEvent {
    pub id: i64,
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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialType {
    Dns,
    Ban,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: i64,
    pub name: String,
    pub credential_type: CredentialType,
    pub provider: String,
    /// AEAD envelope produced by `CredCrypto`; never logged or displayed.
    pub credentials_encrypted: String,
    pub created_by: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanIntegration {
    pub id: i64,
    pub name: String,
    pub provider_type: String,
    pub credential_id: Option<i64>,
    pub config_json: serde_json::Value,
    pub enabled: bool,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub total_bans_sent: u64,
    pub total_unbans_sent: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationNotification {
    pub integration_id: i64,
    pub integration_name: String,
    pub provider_ban_id: Option<String>,
    pub notified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpBan {
    pub id: i64,
    pub ip_address: std::net::IpAddr,
    pub reason: String,
    pub severity: Severity,
    pub auto_banned: bool,
    pub detection_rule_id: Option<i64>,
    pub banned_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub banned_by: Option<i64>,
    pub integrations_notified: Vec<IntegrationNotification>,
    pub unbanned_at: Option<DateTime<Utc>>,
}

impl IpBan {
    /// Active ⇔ not unbanned AND (no expiry OR not yet expired).
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.unbanned_at.is_none() && self.expires_at.map_or(true, |exp| exp > now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WhitelistType {
    Manual,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpWhitelist {
    pub id: i64,
    pub ip_address: Option<std::net::IpAddr>,
    pub ip_range: Option<String>,
    pub entry_type: WhitelistType,
    pub reason: String,
    pub priority: i32,
    pub added_by: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SeverityFilter {
    All,
    Low,
    Medium,
    High,
    Critical,
}

impl SeverityFilter {
    /// Admits by ordinal ≥: a `High` filter admits `High` and `Critical` events.
    pub fn admits(&self, severity: Severity) -> bool {
        match self {
            SeverityFilter::All => true,
            SeverityFilter::Low => severity >= Severity::Low,
            SeverityFilter::Medium => severity >= Severity::Medium,
            SeverityFilter::High => severity >= Severity::High,
            SeverityFilter::Critical => severity >= Severity::Critical,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionRule {
    pub id: i64,
    pub name: String,
    pub threshold: u32,
    pub time_window_s: u64,
    pub attack_types: Option<Vec<String>>,
    pub severity_filter: SeverityFilter,
    pub proxy_id: Option<i64>,
    pub ban_duration_s: u64,
    pub ban_severity: Severity,
    pub priority: i32,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Setting {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: i64,
    pub at: DateTime<Utc>,
    pub actor: Option<String>,
    pub action: String,
    pub entity: String,
    pub entity_id: Option<i64>,
    pub detail_json: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_editor_mode_is_the_raw_variant() {
        let proxy = Proxy {
            id: 1,
            name: "custom".into(),
            proxy_type: ProxyType::Reverse,
            enabled: true,
            content: ProxyContent::Raw {
                text: "server { listen 80; }".into(),
            },
            incoming_port: None,
            stream_protocol: None,
            ssl_enabled: false,
            ssl_cert_id: None,
            launch_url: None,
            waf_profile_id: None,
            config_filename: "1-custom.conf".into(),
            config_status: ConfigStatus::Pending,
            config_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(proxy.is_custom_editor());
        assert!(proxy.domain_names().is_empty());
    }

    #[test]
    fn severity_filter_ordinal_admits_correctly() {
        assert!(SeverityFilter::Medium.admits(Severity::High));
        assert!(!SeverityFilter::High.admits(Severity::Low));
        assert!(SeverityFilter::All.admits(Severity::Low));
    }

    #[test]
    fn ip_ban_active_requires_no_unban_and_unexpired() {
        let now = Utc::now();
        let mut ban = IpBan {
            id: 1,
            ip_address: "203.0.113.9".parse().unwrap(),
            reason: "test".into(),
            severity: Severity::High,
            auto_banned: true,
            detection_rule_id: Some(1),
            banned_at: now,
            expires_at: Some(now + chrono::Duration::seconds(60)),
            banned_by: None,
            integrations_notified: vec![],
            unbanned_at: None,
        };
        assert!(ban.is_active(now));
        ban.unbanned_at = Some(now);
        assert!(!ban.is_active(now));
    }
}
