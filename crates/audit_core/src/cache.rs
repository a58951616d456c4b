//! Report cache port and the structured cache key.
//!
//! Caches hold derived, disposable data only — a cache is an
//! optimization, never a correctness dependency, so the port is
//! infallible: adapters swallow and log their own backend errors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::report::ReportFormat;
use crate::types::{EntityKind, TimeWindow};

// ── Cache key ─────────────────────────────────────────────────

/// Structured key for every cached query. Rendered to a deterministic
/// string with a distinct prefix per variant and labeled fields, so that
/// parameter shapes can never collide the way concatenated keys can.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheKey {
    EntityChanges {
        kind: EntityKind,
        entity_id: Uuid,
        tenant_id: Option<Uuid>,
        window: Option<TimeWindow>,
    },
    TenantChanges {
        tenant_id: Uuid,
        window: TimeWindow,
        service_types: Vec<String>,
    },
    AuditReport {
        tenant_id: Option<Uuid>,
        window: TimeWindow,
        service_types: Vec<String>,
    },
    VisualizationData {
        tenant_id: Uuid,
        window: TimeWindow,
    },
    PerformanceMetrics {
        tenant_id: Option<Uuid>,
        window: TimeWindow,
    },
    ComplianceStatus {
        tenant_id: Option<Uuid>,
        window: TimeWindow,
    },
    ComplianceReport {
        tenant_id: Uuid,
        utility_types: Vec<String>,
        window: TimeWindow,
        format: ReportFormat,
    },
    ComplianceSchedule {
        tenant_id: Uuid,
    },
}

fn opt_uuid(id: &Option<Uuid>) -> String {
    id.map(|u| u.to_string()).unwrap_or_else(|| "all".into())
}

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339()
}

fn window(w: &TimeWindow) -> String {
    format!("from={};to={}", ts(&w.start), ts(&w.end))
}

fn opt_window(w: &Option<TimeWindow>) -> String {
    w.as_ref()
        .map(window)
        .unwrap_or_else(|| "from=all;to=all".into())
}

fn list(items: &[String]) -> String {
    if items.is_empty() {
        "all".into()
    } else {
        items.join(",")
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EntityChanges {
                kind,
                entity_id,
                tenant_id,
                window: w,
            } => write!(
                f,
                "entity_changes:kind={kind};entity={entity_id};tenant={};{}",
                opt_uuid(tenant_id),
                opt_window(w)
            ),
            Self::TenantChanges {
                tenant_id,
                window: w,
                service_types,
            } => write!(
                f,
                "tenant_changes:tenant={tenant_id};{};types={}",
                window(w),
                list(service_types)
            ),
            Self::AuditReport {
                tenant_id,
                window: w,
                service_types,
            } => write!(
                f,
                "audit_report:tenant={};{};types={}",
                opt_uuid(tenant_id),
                window(w),
                list(service_types)
            ),
            Self::VisualizationData {
                tenant_id,
                window: w,
            } => write!(f, "audit_visualization:tenant={tenant_id};{}", window(w)),
            Self::PerformanceMetrics {
                tenant_id,
                window: w,
            } => write!(
                f,
                "performance_metrics:tenant={};{}",
                opt_uuid(tenant_id),
                window(w)
            ),
            Self::ComplianceStatus {
                tenant_id,
                window: w,
            } => write!(
                f,
                "compliance_status:tenant={};{}",
                opt_uuid(tenant_id),
                window(w)
            ),
            Self::ComplianceReport {
                tenant_id,
                utility_types,
                window: w,
                format,
            } => write!(
                f,
                "compliance_report:tenant={tenant_id};types={};{};format={}",
                list(utility_types),
                window(w),
                format.as_str()
            ),
            Self::ComplianceSchedule { tenant_id } => {
                write!(f, "compliance_schedule:tenant={tenant_id}")
            }
        }
    }
}

// ── Port ──────────────────────────────────────────────────────

/// TTL key/value cache for derived reports.
#[async_trait]
pub trait ReportCache: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Option<serde_json::Value>;
    async fn put(&self, key: &CacheKey, value: serde_json::Value, ttl: Duration);
}

/// Fetch a cached value deserialized into its report type. A value that
/// no longer deserializes (schema drift) reads as a miss.
pub async fn get_typed<T: DeserializeOwned>(cache: &dyn ReportCache, key: &CacheKey) -> Option<T> {
    let value = cache.get(key).await?;
    serde_json::from_value(value).ok()
}

pub async fn put_typed<T: Serialize>(
    cache: &dyn ReportCache,
    key: &CacheKey,
    value: &T,
    ttl: Duration,
) {
    if let Ok(value) = serde_json::to_value(value) {
        cache.put(key, value, ttl).await;
    }
}

// ── In-memory implementation ──────────────────────────────────

#[derive(Debug, Clone)]
struct CachedEntry {
    value: serde_json::Value,
    stored_at: DateTime<Utc>,
    ttl_seconds: u64,
}

impl CachedEntry {
    fn is_expired(&self) -> bool {
        let age = Utc::now().timestamp() - self.stored_at.timestamp();
        age > self.ttl_seconds as i64
    }
}

/// Process-local TTL cache.
#[derive(Default)]
pub struct InMemoryReportCache {
    entries: Arc<RwLock<HashMap<String, CachedEntry>>>,
}

impl InMemoryReportCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReportCache for InMemoryReportCache {
    async fn get(&self, key: &CacheKey) -> Option<serde_json::Value> {
        let entries = self.entries.read().await;
        entries
            .get(&key.to_string())
            .filter(|e| !e.is_expired())
            .map(|e| e.value.clone())
    }

    async fn put(&self, key: &CacheKey, value: serde_json::Value, ttl: Duration) {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            CachedEntry {
                value,
                stored_at: Utc::now(),
                ttl_seconds: ttl.as_secs(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_window() -> TimeWindow {
        TimeWindow::new(
            "2026-01-01T00:00:00Z".parse().unwrap(),
            "2026-01-31T00:00:00Z".parse().unwrap(),
        )
    }

    #[test]
    fn keys_are_deterministic_and_distinct_per_shape() {
        let tenant = Uuid::new_v4();
        let w = sample_window();
        let a = CacheKey::AuditReport {
            tenant_id: Some(tenant),
            window: w,
            service_types: vec!["water".into()],
        };
        let b = CacheKey::AuditReport {
            tenant_id: Some(tenant),
            window: w,
            service_types: vec!["water".into()],
        };
        assert_eq!(a.to_string(), b.to_string());

        // Same parameters under a different query shape must not collide.
        let c = CacheKey::TenantChanges {
            tenant_id: tenant,
            window: w,
            service_types: vec!["water".into()],
        };
        assert_ne!(a.to_string(), c.to_string());
    }

    #[test]
    fn one_day_window_shift_changes_the_key() {
        let tenant = Uuid::new_v4();
        let w = sample_window();
        let shifted = TimeWindow::new(w.start - chrono::Duration::days(1), w.end);
        let a = CacheKey::VisualizationData {
            tenant_id: tenant,
            window: w,
        };
        let b = CacheKey::VisualizationData {
            tenant_id: tenant,
            window: shifted,
        };
        assert_ne!(a.to_string(), b.to_string());
    }

    #[tokio::test]
    async fn get_returns_fresh_values_and_misses_on_absent_keys() {
        let cache = InMemoryReportCache::new();
        let key = CacheKey::ComplianceSchedule {
            tenant_id: Uuid::new_v4(),
        };
        assert!(cache.get(&key).await.is_none());

        cache
            .put(&key, serde_json::json!({"x": 1}), Duration::from_secs(60))
            .await;
        assert_eq!(cache.get(&key).await.unwrap()["x"], 1);
    }

    #[tokio::test]
    async fn zero_ttl_entries_expire() {
        let cache = InMemoryReportCache::new();
        let key = CacheKey::ComplianceSchedule {
            tenant_id: Uuid::new_v4(),
        };
        cache
            .put(&key, serde_json::json!(true), Duration::from_secs(0))
            .await;
        // Entry ages out once its stored_at second has passed.
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn typed_round_trip() {
        let cache = InMemoryReportCache::new();
        let key = CacheKey::ComplianceSchedule {
            tenant_id: Uuid::new_v4(),
        };
        put_typed(&cache, &key, &vec![1u32, 2, 3], Duration::from_secs(60)).await;
        let back: Vec<u32> = get_typed(&cache, &key).await.unwrap();
        assert_eq!(back, vec![1, 2, 3]);
    }
}
