//! UniFi controller integration: logs into the controller's local API and
//! manages its firewall group of banned addresses over HTTPS via `reqwest`.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{EngineError, Result};
use crate::validator::Validator;

use super::{BanProvider, Capabilities};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiCredential {
    pub username: String,
    pub password: String,
}

pub struct UnifiProvider {
    client: reqwest::Client,
    controller_url: String,
    site: String,
    firewall_group_id: String,
    credential: UnifiCredential,
    cookie: Mutex<Option<String>>,
}

impl UnifiProvider {
    pub fn new(config: &HashMap<String, serde_json::Value>, credential: UnifiCredential) -> Result<Self> {
        let controller_url = config
            .get("controller_url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::InvalidInput("unifi config missing 'controller_url'".into()))?
            .trim_end_matches('/')
            .to_string();
        let site = config
            .get("site")
            .and_then(|v| v.as_str())
            .unwrap_or("default")
            .to_string();
        let firewall_group_id = config
            .get("firewall_group_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::InvalidInput("unifi config missing 'firewall_group_id'".into()))?
            .to_string();

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.get("insecure_tls").and_then(|v| v.as_bool()).unwrap_or(false))
            .build()
            .map_err(EngineError::from)?;

        Ok(Self {
            client,
            controller_url,
            site,
            firewall_group_id,
            credential,
            cookie: Mutex::new(None),
        })
    }

    async fn login(&self) -> Result<String> {
        let resp = self
            .client
            .post(format!("{}/api/login", self.controller_url))
            .json(&serde_json::json!({
                "username": self.credential.username,
                "password": self.credential.password,
            }))
            .send()
            .await
            .map_err(EngineError::from)?;
        let cookie = resp
            .headers()
            .get(reqwest::header::SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| EngineError::ExternalFailure("unifi login returned no session cookie".into()))?
            .to_string();
        Ok(cookie)
    }

    async fn session_cookie(&self) -> Result<String> {
        let mut guard = self.cookie.lock().await;
        if let Some(c) = guard.as_ref() {
            return Ok(c.clone());
        }
        let c = self.login().await?;
        *guard = Some(c.clone());
        Ok(c)
    }

    fn group_url(&self) -> String {
        format!(
            "{}/api/s/{}/rest/firewallgroup/{}",
            self.controller_url, self.site, self.firewall_group_id
        )
    }

    async fn fetch_group(&self) -> Result<UnifiFirewallGroup> {
        let cookie = self.session_cookie().await?;
        let resp = self
            .client
            .get(self.group_url())
            .header(reqwest::header::COOKIE, cookie)
            .send()
            .await
            .map_err(EngineError::from)?;
        let wrapper: UnifiGroupResponse = resp.json().await.map_err(EngineError::from)?;
        wrapper
            .data
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::ExternalFailure("unifi firewall group not found".into()))
    }

    async fn put_group(&self, group: &UnifiFirewallGroup) -> Result<()> {
        let cookie = self.session_cookie().await?;
        let resp = self
            .client
            .put(self.group_url())
            .header(reqwest::header::COOKIE, cookie)
            .json(group)
            .send()
            .await
            .map_err(EngineError::from)?;
        if !resp.status().is_success() {
            return Err(EngineError::ExternalFailure(format!(
                "unifi firewall group update failed: {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct UnifiGroupResponse {
    data: Vec<UnifiFirewallGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UnifiFirewallGroup {
    #[serde(rename = "_id")]
    id: String,
    name: String,
    group_type: String,
    group_members: Vec<String>,
}

#[async_trait]
impl BanProvider for UnifiProvider {
    async fn test_connection(&self) -> Result<()> {
        self.fetch_group().await.map(|_| ())
    }

    async fn ban(&self, ip: IpAddr, _reason: &str) -> Result<Option<String>> {
        Validator::validate_ip_or_cidr(&ip.to_string())?;
        let mut group = self.fetch_group().await?;
        let ip_str = ip.to_string();
        if !group.group_members.contains(&ip_str) {
            group.group_members.push(ip_str);
            self.put_group(&group).await?;
        }
        Ok(Some(group.id))
    }

    async fn unban(&self, ip: IpAddr) -> Result<()> {
        Validator::validate_ip_or_cidr(&ip.to_string())?;
        let mut group = self.fetch_group().await?;
        let ip_str = ip.to_string();
        group.group_members.retain(|m| m != &ip_str);
        self.put_group(&group).await
    }

    async fn get_banned_ips(&self) -> Result<Vec<IpAddr>> {
        let group = self.fetch_group().await?;
        Ok(group.group_members.iter().filter_map(|m| m.parse().ok()).collect())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_batch: false,
            supports_list: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_controller_url_is_rejected() {
        let config = HashMap::new();
        let credential = UnifiCredential {
            username: "admin".into(),
            password: "hunter2".into(),
        };
        let err = UnifiProvider::new(&config, credential).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }
}
