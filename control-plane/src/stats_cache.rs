//! Caches a rolling aggregate of WAF activity so dashboard reads never
//! hit the store directly. `Scheduler` refreshes it on every tick;
//! everything else only reads the cached `Stats` snapshot.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use control_plane_types::Severity;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::store::Store;

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct SeverityCounts {
    pub low: i64,
    pub medium: i64,
    pub high: i64,
    pub critical: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Stats {
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    pub total_events: i64,
    pub blocked_events: i64,
    pub by_severity: SeverityCounts,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct StatsRange {
    pub window_hours: i64,
}

impl Default for StatsRange {
    fn default() -> Self {
        Self { window_hours: 24 }
    }
}

pub struct StatsCache {
    store: Store,
    current: RwLock<Option<Stats>>,
    range: StatsRange,
}

impl StatsCache {
    pub fn new(store: Store, range: StatsRange) -> Arc<Self> {
        Arc::new(Self {
            store,
            current: RwLock::new(None),
            range,
        })
    }

    /// Returns the last computed snapshot, if `refresh` has run at least
    /// once. Never blocks on a store query.
    pub async fn get(&self) -> Option<Stats> {
        self.current.read().await.clone()
    }

    pub async fn refresh(&self) -> Result<()> {
        let until = Utc::now();
        let since = until - chrono::Duration::hours(self.range.window_hours);
        let counts = self.store.waf_event_counts_between(since, until).await?;

        let mut by_severity = SeverityCounts::default();
        let mut total_events = 0i64;
        let mut blocked_events = 0i64;
        for (severity, total, blocked) in counts {
            total_events += total;
            blocked_events += blocked;
            match severity {
                Severity::Low => by_severity.low += total,
                Severity::Medium => by_severity.medium += total,
                Severity::High => by_severity.high += total,
                Severity::Critical => by_severity.critical += total,
            }
        }

        let stats = Stats {
            range_start: since,
            range_end: until,
            total_events,
            blocked_events,
            by_severity,
            computed_at: Utc::now(),
        };
        *self.current.write().await = Some(stats);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_is_none_before_first_refresh() {
        let store = Store::open(":memory:").await.unwrap();
        let cache = StatsCache::new(store, StatsRange::default());
        assert!(cache.get().await.is_none());
    }

    #[tokio::test]
    async fn refresh_with_no_events_reports_zero_counts() {
        let store = Store::open(":memory:").await.unwrap();
        let cache = StatsCache::new(store, StatsRange::default());
        cache.refresh().await.unwrap();
        let stats = cache.get().await.unwrap();
        assert_eq!(stats.total_events, 0);
        assert_eq!(stats.blocked_events, 0);
    }
}
