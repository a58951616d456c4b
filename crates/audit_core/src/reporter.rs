//! Audit reporter — composes the cached, bounded-cost audit report for
//! a tenant and window, plus the derived visualization data.
//!
//! Sub-computations are best-effort: a failing metrics collector or an
//! unreachable ledger degrades the affected section to an empty/default
//! value, records the degradation on the report, and logs at warn. The
//! report itself never fails outright for those errors.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Timelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::{get_typed, put_typed, CacheKey, ReportCache};
use crate::compliance::ComplianceAssessor;
use crate::detector::AnomalyDetector;
use crate::ports::{ChangeLogStore, PerformanceMetricsSource, Result};
use crate::report::*;
use crate::tracker::DEFAULT_WINDOW_DAYS;
use crate::types::*;

const REPORT_TTL: Duration = Duration::from_secs(300);
const VISUALIZATION_TTL: Duration = Duration::from_secs(300);
const METRICS_TTL: Duration = Duration::from_secs(600);

/// Tuning hint derived from performance thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationHint {
    pub area: String,
    pub recommendation: String,
    pub expected_improvement: String,
}

pub struct AuditReporter {
    ledger: Arc<dyn ChangeLogStore>,
    detector: AnomalyDetector,
    assessor: Arc<ComplianceAssessor>,
    performance: Arc<dyn PerformanceMetricsSource>,
    cache: Arc<dyn ReportCache>,
}

impl AuditReporter {
    pub fn new(
        ledger: Arc<dyn ChangeLogStore>,
        detector: AnomalyDetector,
        assessor: Arc<ComplianceAssessor>,
        performance: Arc<dyn PerformanceMetricsSource>,
        cache: Arc<dyn ReportCache>,
    ) -> Self {
        Self {
            ledger,
            detector,
            assessor,
            performance,
            cache,
        }
    }

    // ── Report generation ─────────────────────────────────────

    /// Build (or serve from cache) the composite audit report. The cache
    /// key carries every parameter — any difference bypasses the cache.
    pub async fn generate_report(
        &self,
        tenant_id: Option<Uuid>,
        window: Option<TimeWindow>,
        service_types: &[String],
    ) -> Result<AuditReport> {
        let window = window.unwrap_or_else(|| TimeWindow::last_days(DEFAULT_WINDOW_DAYS));
        let key = CacheKey::AuditReport {
            tenant_id,
            window,
            service_types: service_types.to_vec(),
        };
        if let Some(cached) = get_typed(self.cache.as_ref(), &key).await {
            return Ok(cached);
        }

        let mut degraded = Vec::new();

        let change_records = match self
            .ledger
            .changes_for_tenant(tenant_id, window, &EntityKind::ALL)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "change stream unavailable, degrading report");
                degraded.push("change_records".to_string());
                Vec::new()
            }
        };

        // Anomaly detection is pure over the fetched records; with a
        // degraded fetch it degrades to the empty list alongside it.
        let anomalies = self.detector.detect(&change_records);

        let performance = match self.collect_performance(tenant_id, window).await {
            Ok(metrics) => metrics,
            Err(e) => {
                tracing::warn!(error = %e, "performance metrics unavailable, degrading report");
                degraded.push("performance_metrics".to_string());
                PerformanceMetrics::default()
            }
        };

        let compliance = match self.assessor.status(tenant_id, window).await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(error = %e, "compliance status unavailable, degrading report");
                degraded.push("compliance_status".to_string());
                ComplianceStatus::default()
            }
        };

        let report = AuditReport {
            tenant_id,
            window,
            summary: summarize(&change_records, window),
            anomalies,
            performance,
            compliance,
            change_records,
            degraded,
            generated_at: Utc::now(),
        };

        put_typed(self.cache.as_ref(), &key, &report, REPORT_TTL).await;
        Ok(report)
    }

    async fn collect_performance(
        &self,
        tenant_id: Option<Uuid>,
        window: TimeWindow,
    ) -> Result<PerformanceMetrics> {
        let key = CacheKey::PerformanceMetrics { tenant_id, window };
        if let Some(cached) = get_typed(self.cache.as_ref(), &key).await {
            return Ok(cached);
        }
        let metrics = self.performance.collect(tenant_id, window).await?;
        put_typed(self.cache.as_ref(), &key, &metrics, METRICS_TTL).await;
        Ok(metrics)
    }

    // ── Visualization ─────────────────────────────────────────

    /// Chart inputs for the audit dashboard: change timeline, actor
    /// activity heatmap, entity-kind breakdown.
    pub async fn visualization_data(
        &self,
        tenant_id: Uuid,
        window: Option<TimeWindow>,
    ) -> Result<AuditVisualizationData> {
        let window = window.unwrap_or_else(|| TimeWindow::last_days(DEFAULT_WINDOW_DAYS));
        let key = CacheKey::VisualizationData { tenant_id, window };
        if let Some(cached) = get_typed(self.cache.as_ref(), &key).await {
            return Ok(cached);
        }

        let records = self
            .ledger
            .changes_for_tenant(Some(tenant_id), window, &EntityKind::ALL)
            .await?;

        let mut data = AuditVisualizationData::default();
        for record in &records {
            *data.change_timeline.entry(record.day_key()).or_insert(0) += 1;
            *data
                .entity_kind_breakdown
                .entry(record.entity_kind.as_str().to_string())
                .or_insert(0) += 1;
            if let Some(actor) = record.actor_id {
                *data
                    .actor_activity
                    .entry(actor.to_string())
                    .or_default()
                    .entry(record.occurred_at.hour())
                    .or_insert(0) += 1;
            }
        }

        put_typed(self.cache.as_ref(), &key, &data, VISUALIZATION_TTL).await;
        Ok(data)
    }
}

// ── Summary ───────────────────────────────────────────────────

fn summarize(records: &[ChangeRecord], window: TimeWindow) -> AuditSummary {
    let mut summary = AuditSummary {
        total_changes: records.len(),
        period_start: Some(window.start),
        period_end: Some(window.end),
        ..AuditSummary::default()
    };
    for record in records {
        if record.is_system() {
            summary.system_changes += 1;
        } else {
            summary.user_changes += 1;
        }
        *summary
            .by_event
            .entry(record.event.as_str().to_string())
            .or_insert(0) += 1;
        *summary
            .by_entity_kind
            .entry(record.entity_kind.as_str().to_string())
            .or_insert(0) += 1;
    }
    summary
}

// ── Performance composition ───────────────────────────────────

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Overall performance score: equally weighted billing, response and
/// error components, each normalized against its target latency.
pub fn overall_performance_score(metrics: &PerformanceMetrics) -> f64 {
    let billing_score =
        (1000.0 / metrics.billing.average_processing_time_ms.max(1.0) * 100.0).min(100.0);
    let response_score =
        (500.0 / metrics.response.average_response_time_ms.max(1.0) * 100.0).min(100.0);
    let error_score = (100.0 - metrics.response.error_rate_pct * 10.0).max(0.0);

    round2((billing_score + response_score + error_score) / 3.0)
}

/// Threshold alerts over the collected metrics.
pub fn performance_alerts(metrics: &PerformanceMetrics) -> Vec<PerformanceAlert> {
    let mut alerts = Vec::new();

    if metrics.billing.average_processing_time_ms > 300.0 {
        alerts.push(PerformanceAlert {
            metric: "billing_performance".into(),
            severity: "warning".into(),
            message: "Billing calculation time exceeds recommended threshold".into(),
        });
    }

    if metrics.response.average_response_time_ms > 500.0 {
        alerts.push(PerformanceAlert {
            metric: "response_performance".into(),
            severity: "warning".into(),
            message: "System response time exceeds recommended threshold".into(),
        });
    }

    if metrics.response.error_rate_pct > 1.0 {
        alerts.push(PerformanceAlert {
            metric: "error_rate".into(),
            severity: "high".into(),
            message: "Error rate exceeds acceptable threshold".into(),
        });
    }

    alerts
}

/// Tuning hints for metrics that are degraded but not yet alerting.
pub fn optimization_hints(metrics: &PerformanceMetrics) -> Vec<OptimizationHint> {
    let mut hints = Vec::new();

    if metrics.billing.average_processing_time_ms > 200.0 {
        hints.push(OptimizationHint {
            area: "billing_performance".into(),
            recommendation: "Consider implementing calculation result caching".into(),
            expected_improvement: "30-50% reduction in calculation time".into(),
        });
    }

    if metrics.response.average_response_time_ms > 300.0 {
        hints.push(OptimizationHint {
            area: "system_performance".into(),
            recommendation: "Review database query optimization and indexing".into(),
            expected_improvement: "20-40% reduction in response time".into(),
        });
    }

    hints
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(calc_ms: f64, response_ms: f64, error_pct: f64) -> PerformanceMetrics {
        PerformanceMetrics {
            billing: BillingMetrics {
                average_processing_time_ms: calc_ms,
                ..BillingMetrics::default()
            },
            response: ResponseMetrics {
                average_response_time_ms: response_ms,
                error_rate_pct: error_pct,
                ..ResponseMetrics::default()
            },
            ..PerformanceMetrics::default()
        }
    }

    #[test]
    fn fast_system_scores_a_clean_hundred() {
        let m = metrics(100.0, 100.0, 0.0);
        assert_eq!(overall_performance_score(&m), 100.0);
    }

    #[test]
    fn slow_components_drag_the_score_down() {
        // billing 2000ms → 50; response 1000ms → 50; 2% errors → 80.
        let m = metrics(2000.0, 1000.0, 2.0);
        assert_eq!(overall_performance_score(&m), 60.0);
    }

    #[test]
    fn alerts_fire_only_past_thresholds() {
        assert!(performance_alerts(&metrics(300.0, 500.0, 1.0)).is_empty());

        let alerts = performance_alerts(&metrics(301.0, 501.0, 1.1));
        assert_eq!(alerts.len(), 3);
        assert!(alerts.iter().any(|a| a.metric == "error_rate" && a.severity == "high"));
    }

    #[test]
    fn hints_cover_the_band_below_alerting() {
        let hints = optimization_hints(&metrics(250.0, 350.0, 0.0));
        assert_eq!(hints.len(), 2);
        assert!(performance_alerts(&metrics(250.0, 350.0, 0.0)).is_empty());
    }

    #[test]
    fn summary_splits_user_and_system_changes() {
        let window = TimeWindow::last_days(1);
        let mut record = ChangeRecord {
            id: Uuid::new_v4(),
            entity_kind: EntityKind::UtilityService,
            entity_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            actor_id: None,
            event: ChangeEvent::Created,
            old_state: None,
            new_state: None,
            occurred_at: Utc::now(),
            seq: 1,
            note: None,
            metadata: serde_json::json!({}),
        };
        let system = record.clone();
        record.actor_id = Some(Uuid::new_v4());
        record.event = ChangeEvent::Updated;

        let summary = summarize(&[system, record], window);
        assert_eq!(summary.total_changes, 2);
        assert_eq!(summary.system_changes, 1);
        assert_eq!(summary.user_changes, 1);
        assert_eq!(summary.by_event["created"], 1);
        assert_eq!(summary.by_event["updated"], 1);
    }
}
