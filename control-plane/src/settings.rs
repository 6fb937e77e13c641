//! Typed accessors over the raw `settings` key/value table for the keys
//! spec.md §6 calls authoritative. The `security_*_enabled` and
//! `notification_*` families have a per-deployment key set rather than a
//! fixed one, so those stay reachable through `raw()` instead of getting
//! a dedicated accessor each.

use crate::error::Result;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultServerBehavior {
    Drop,
    NotFound404,
    Custom,
}

impl DefaultServerBehavior {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "drop" => Some(Self::Drop),
            "404" => Some(Self::NotFound404),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Drop => "drop",
            Self::NotFound404 => "404",
            Self::Custom => "custom",
        }
    }
}

pub struct SettingsView {
    store: Store,
}

impl SettingsView {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Escape hatch to the untyped key/value table, for the
    /// `security_*_enabled`/`notification_*` families and anything else
    /// not named here.
    pub fn raw(&self) -> &Store {
        &self.store
    }

    pub async fn default_server_behavior(&self) -> Result<Option<DefaultServerBehavior>> {
        Ok(self
            .store
            .get_setting("default_server_behavior")
            .await?
            .and_then(|v| DefaultServerBehavior::parse(&v)))
    }

    pub async fn set_default_server_behavior(&self, value: DefaultServerBehavior) -> Result<()> {
        self.store.set_setting("default_server_behavior", value.as_str()).await
    }

    pub async fn default_server_custom_page(&self) -> Result<Option<String>> {
        self.store.get_setting("default_server_custom_page").await
    }

    pub async fn default_server_custom_url(&self) -> Result<Option<String>> {
        self.store.get_setting("default_server_custom_url").await
    }

    pub async fn admin_cert_id(&self) -> Result<Option<i64>> {
        Ok(self
            .store
            .get_setting("admin_cert_id")
            .await?
            .and_then(|v| v.parse().ok()))
    }

    pub async fn set_admin_cert_id(&self, cert_id: Option<i64>) -> Result<()> {
        match cert_id {
            Some(id) => self.store.set_setting("admin_cert_id", &id.to_string()).await,
            None => self.store.delete_setting("admin_cert_id").await,
        }
    }

    pub async fn security_default_deny_countries(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .get_setting("security_default_deny_countries")
            .await?
            .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default())
    }

    pub async fn security_geoip_database_path(&self) -> Result<Option<String>> {
        self.store.get_setting("security_geoip_database_path").await
    }

    pub async fn waf_enabled(&self) -> Result<bool> {
        Ok(self.bool_setting("waf_enabled").await?)
    }

    pub async fn waf_mode(&self) -> Result<Option<String>> {
        self.store.get_setting("waf_mode").await
    }

    pub async fn waf_default_profile_id(&self) -> Result<Option<i64>> {
        Ok(self
            .store
            .get_setting("waf_default_profile_id")
            .await?
            .and_then(|v| v.parse().ok()))
    }

    pub async fn notifications_enabled(&self) -> Result<bool> {
        Ok(self.bool_setting("notifications_enabled").await?)
    }

    pub async fn jwt_secret(&self) -> Result<Option<String>> {
        self.store.get_setting("jwt_secret").await
    }

    async fn bool_setting(&self, key: &str) -> Result<bool> {
        Ok(self
            .store
            .get_setting(key)
            .await?
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unset_keys_default_to_none_or_false() {
        let store = Store::open(":memory:").await.unwrap();
        let settings = SettingsView::new(store);
        assert_eq!(settings.default_server_behavior().await.unwrap(), None);
        assert_eq!(settings.admin_cert_id().await.unwrap(), None);
        assert!(!settings.waf_enabled().await.unwrap());
        assert!(settings.security_default_deny_countries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn round_trips_typed_values() {
        let store = Store::open(":memory:").await.unwrap();
        let settings = SettingsView::new(store);
        settings.set_default_server_behavior(DefaultServerBehavior::NotFound404).await.unwrap();
        assert_eq!(
            settings.default_server_behavior().await.unwrap(),
            Some(DefaultServerBehavior::NotFound404)
        );

        settings.set_admin_cert_id(Some(7)).await.unwrap();
        assert_eq!(settings.admin_cert_id().await.unwrap(), Some(7));
        settings.set_admin_cert_id(None).await.unwrap();
        assert_eq!(settings.admin_cert_id().await.unwrap(), None);

        settings.raw().set_setting("waf_enabled", "true").await.unwrap();
        assert!(settings.waf_enabled().await.unwrap());
    }

    #[tokio::test]
    async fn malformed_enum_value_is_none_not_an_error() {
        let store = Store::open(":memory:").await.unwrap();
        store.set_setting("default_server_behavior", "nonsense").await.unwrap();
        let settings = SettingsView::new(store);
        assert_eq!(settings.default_server_behavior().await.unwrap(), None);
    }
}
