//! Compliance aggregation — the operational compliance status consumed
//! by the audit report, and the full regulatory-style compliance report.
//!
//! Ledger-derived scores (audit-trail completeness, retention) are
//! computed here; security, data-quality and regulatory sub-scores are
//! injected from external collaborators and only aggregated.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::cache::{get_typed, put_typed, CacheKey, ReportCache};
use crate::ports::{ChangeLogStore, ComplianceSignalSource, Result};
use crate::report::*;
use crate::reporter::AuditReporter;
use crate::tracker::DEFAULT_WINDOW_DAYS;
use crate::types::TimeWindow;

const STATUS_TTL: StdDuration = StdDuration::from_secs(900);
const REPORT_TTL: StdDuration = StdDuration::from_secs(1800);
const SCHEDULE_TTL: StdDuration = StdDuration::from_secs(86_400 * 30);

/// Operational retention requirement checked by the status assessment.
const STATUS_RETENTION_DAYS: i64 = 90;

/// Retention requirements per data category for the full report.
const RETENTION_REQUIREMENTS: [(&str, i64); 4] = [
    ("audit_logs", 2555),
    ("financial_records", 2555),
    ("utility_data", 1825),
    ("personal_data", 1095),
];

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

// ── Status assessor ───────────────────────────────────────────

/// Computes the compliance status embedded in every audit report.
pub struct ComplianceAssessor {
    ledger: Arc<dyn ChangeLogStore>,
    signals: Arc<dyn ComplianceSignalSource>,
    cache: Arc<dyn ReportCache>,
}

impl ComplianceAssessor {
    pub fn new(
        ledger: Arc<dyn ChangeLogStore>,
        signals: Arc<dyn ComplianceSignalSource>,
        cache: Arc<dyn ReportCache>,
    ) -> Self {
        Self {
            ledger,
            signals,
            cache,
        }
    }

    /// Aggregate compliance posture: mean of the five sub-scores.
    pub async fn status(
        &self,
        tenant_id: Option<Uuid>,
        window: TimeWindow,
    ) -> Result<ComplianceStatus> {
        let key = CacheKey::ComplianceStatus { tenant_id, window };
        if let Some(cached) = get_typed(self.cache.as_ref(), &key).await {
            return Ok(cached);
        }

        let audit_trail = self.assess_audit_trail(tenant_id, window).await?;
        let retention = self.assess_retention(tenant_id).await?;
        let regulatory = self.signals.regulatory_compliance(tenant_id, window).await?;
        let security = self.signals.security_compliance(tenant_id, window).await?;
        let data_quality = self.signals.data_quality(tenant_id, window).await?;

        let overall_score = round2(
            [
                audit_trail.score,
                retention.score,
                regulatory.score,
                security.score,
                data_quality.score,
            ]
            .iter()
            .sum::<f64>()
                / 5.0,
        );

        let violations = self.identify_violations(tenant_id, window).await?;
        let recommendations =
            build_recommendations(&audit_trail, &data_quality, &security);

        let status = ComplianceStatus {
            overall_score,
            audit_trail,
            retention,
            regulatory,
            security,
            data_quality,
            violations,
            recommendations,
            assessed_at: Some(Utc::now()),
        };

        put_typed(self.cache.as_ref(), &key, &status, STATUS_TTL).await;
        Ok(status)
    }

    async fn assess_audit_trail(
        &self,
        tenant_id: Option<Uuid>,
        window: TimeWindow,
    ) -> Result<Scorecard> {
        let total = self.ledger.count_in_window(tenant_id, window).await?;
        let complete = self
            .ledger
            .count_complete_in_window(tenant_id, window)
            .await?;
        let rate = if total > 0 {
            complete as f64 / total as f64 * 100.0
        } else {
            100.0
        };

        let issues = if rate < 95.0 {
            vec!["Incomplete audit trail entries detected".to_string()]
        } else {
            Vec::new()
        };

        Ok(Scorecard {
            score: round2(rate.min(100.0)),
            standing: ComplianceStanding::from_score(rate, 95.0, 80.0),
            issues,
            details: json!({
                "total_audits": total,
                "complete_audits": complete,
                "completeness_rate": round2(rate),
            }),
        })
    }

    async fn assess_retention(&self, tenant_id: Option<Uuid>) -> Result<Scorecard> {
        let oldest = self.ledger.oldest_for_tenant(tenant_id).await?;
        let actual_days = oldest
            .as_ref()
            .map(|r| (Utc::now() - r.occurred_at).num_days())
            .unwrap_or(0);
        let score =
            (actual_days as f64 / STATUS_RETENTION_DAYS as f64 * 100.0).min(100.0);

        let issues = if score < 95.0 {
            vec!["Audit history does not yet cover the retention period".to_string()]
        } else {
            Vec::new()
        };

        Ok(Scorecard {
            score: round2(score),
            standing: ComplianceStanding::from_score(score, 95.0, 80.0),
            issues,
            details: json!({
                "required_days": STATUS_RETENTION_DAYS,
                "actual_days": actual_days,
                "oldest_record_date": oldest.map(|r| r.occurred_at.date_naive()),
            }),
        })
    }

    async fn identify_violations(
        &self,
        tenant_id: Option<Uuid>,
        window: TimeWindow,
    ) -> Result<Vec<ComplianceViolation>> {
        let mut violations = Vec::new();

        let total = self.ledger.count_in_window(tenant_id, window).await?;
        let complete = self
            .ledger
            .count_complete_in_window(tenant_id, window)
            .await?;
        if total > complete {
            violations.push(ComplianceViolation {
                kind: "missing_audit_trail".into(),
                severity: "high".into(),
                description: "Operations recorded without complete audit information".into(),
                count: (total - complete) as usize,
            });
        }

        let unattributed = self
            .ledger
            .count_unattributed_in_window(tenant_id, window)
            .await?;
        if unattributed > 0 {
            violations.push(ComplianceViolation {
                kind: "unauthorized_changes".into(),
                severity: "critical".into(),
                description: "Changes made without actor attribution".into(),
                count: unattributed as usize,
            });
        }

        Ok(violations)
    }
}

fn build_recommendations(
    audit_trail: &Scorecard,
    data_quality: &Scorecard,
    security: &Scorecard,
) -> Vec<Recommendation> {
    let mut recommendations = Vec::new();

    if audit_trail.score < 95.0 {
        recommendations.push(Recommendation {
            priority: "high".into(),
            category: "audit_trail".into(),
            title: "Improve Audit Trail Completeness".into(),
            description:
                "Ensure all critical operations are properly audited with complete information"
                    .into(),
            action_items: vec![
                "Review audit configuration for all entities".into(),
                "Implement mandatory audit fields validation".into(),
                "Add automated audit completeness monitoring".into(),
            ],
        });
    }

    if data_quality.score < 90.0 {
        recommendations.push(Recommendation {
            priority: "medium".into(),
            category: "data_quality".into(),
            title: "Enhance Data Quality Controls".into(),
            description: "Implement stricter validation and quality assurance processes".into(),
            action_items: vec![
                "Add automated data validation rules".into(),
                "Implement real-time quality monitoring".into(),
                "Provide training on data entry best practices".into(),
            ],
        });
    }

    if security.score < 90.0 {
        recommendations.push(Recommendation {
            priority: "critical".into(),
            category: "security".into(),
            title: "Strengthen Security Measures".into(),
            description: "Enhance security controls and monitoring".into(),
            action_items: vec![
                "Review and update access control policies".into(),
                "Implement additional PII protection measures".into(),
                "Enhance security monitoring and alerting".into(),
            ],
        });
    }

    recommendations
}

// ── Full compliance report ────────────────────────────────────

/// Builds the regulatory-style compliance report for a tenant. Cached
/// longer than the audit report — compliance scoring is more expensive
/// and changes slowly.
pub struct ComplianceReportGenerator {
    reporter: Arc<AuditReporter>,
    ledger: Arc<dyn ChangeLogStore>,
    cache: Arc<dyn ReportCache>,
}

impl ComplianceReportGenerator {
    pub fn new(
        reporter: Arc<AuditReporter>,
        ledger: Arc<dyn ChangeLogStore>,
        cache: Arc<dyn ReportCache>,
    ) -> Self {
        Self {
            reporter,
            ledger,
            cache,
        }
    }

    pub async fn generate(
        &self,
        tenant_id: Uuid,
        utility_types: &[String],
        window: Option<TimeWindow>,
        format: ReportFormat,
    ) -> Result<ComplianceReport> {
        let window = window.unwrap_or_else(|| TimeWindow::last_days(DEFAULT_WINDOW_DAYS));
        let key = CacheKey::ComplianceReport {
            tenant_id,
            utility_types: utility_types.to_vec(),
            window,
            format,
        };
        if let Some(cached) = get_typed(self.cache.as_ref(), &key).await {
            return Ok(cached);
        }

        tracing::info!(
            tenant_id = %tenant_id,
            from = %window.start,
            to = %window.end,
            format = format.as_str(),
            "generating compliance report"
        );

        let audit_report = self
            .reporter
            .generate_report(Some(tenant_id), Some(window), utility_types)
            .await?;
        let status = &audit_report.compliance;

        let data_retention = self.assess_retention_by_category(tenant_id).await?;
        let audit_trail_completeness = self
            .assess_trail_completeness(tenant_id, window)
            .await?;

        let executive_summary = ExecutiveSummary {
            overall_compliance_score: status.overall_score,
            compliance_grade: ComplianceGrade::from_score(status.overall_score),
            audit_events_reviewed: audit_report.summary.total_changes,
            critical_issues_found: audit_report.critical_anomalies().len(),
            recommendations_generated: status.recommendations.len(),
            days_covered: window.days_covered(),
        };

        let compliance_gaps =
            identify_gaps(&audit_trail_completeness, &data_retention, &status.security);
        let recommendations = build_report_recommendations(status);
        let action_plan = build_action_plan();

        let report = ComplianceReport {
            tenant_id,
            window,
            utility_types: utility_types.to_vec(),
            format,
            executive_summary,
            regulatory_compliance: status.regulatory.clone(),
            data_retention,
            audit_trail_completeness,
            security_compliance: status.security.clone(),
            data_quality: status.data_quality.clone(),
            compliance_gaps,
            recommendations,
            action_plan,
            generated_at: Utc::now(),
        };

        put_typed(self.cache.as_ref(), &key, &report, REPORT_TTL).await;
        Ok(report)
    }

    async fn assess_retention_by_category(&self, tenant_id: Uuid) -> Result<RetentionCompliance> {
        let oldest = self.ledger.oldest_for_tenant(Some(tenant_id)).await?;
        let actual_days = oldest
            .as_ref()
            .map(|r| (Utc::now() - r.occurred_at).num_days())
            .unwrap_or(0);

        let mut categories = BTreeMap::new();
        for (category, required_days) in RETENTION_REQUIREMENTS {
            let pct = (actual_days as f64 / required_days as f64 * 100.0).min(100.0);
            categories.insert(
                category.to_string(),
                RetentionCategory {
                    required_days,
                    actual_days,
                    compliant: actual_days >= required_days,
                    compliance_pct: round2(pct),
                },
            );
        }

        let overall_score = round2(
            categories.values().map(|c| c.compliance_pct).sum::<f64>()
                / categories.len() as f64,
        );

        Ok(RetentionCompliance {
            overall_score,
            categories,
            oldest_record_date: oldest.map(|r| r.occurred_at.date_naive()),
        })
    }

    async fn assess_trail_completeness(
        &self,
        tenant_id: Uuid,
        window: TimeWindow,
    ) -> Result<AuditTrailCompleteness> {
        let total = self
            .ledger
            .count_in_window(Some(tenant_id), window)
            .await?;
        let audited = self
            .ledger
            .count_complete_in_window(Some(tenant_id), window)
            .await?;
        let score = if total > 0 {
            audited as f64 / total as f64 * 100.0
        } else {
            100.0
        };

        Ok(AuditTrailCompleteness {
            score: round2(score),
            total_operations: total,
            audited_operations: audited,
            missing_audits: total - audited,
            compliant: score >= 95.0,
        })
    }

    // ── Scheduling ────────────────────────────────────────────

    /// Register a recurring compliance report. The schedule lives in the
    /// cache store for 30 days, refreshed on each registration.
    pub async fn schedule(&self, tenant_id: Uuid, config: ScheduleConfig) -> StoredSchedule {
        let stored = StoredSchedule {
            tenant_id,
            next_run: config.frequency.next_run(Utc::now()),
            config,
        };
        put_typed(
            self.cache.as_ref(),
            &CacheKey::ComplianceSchedule { tenant_id },
            &stored,
            SCHEDULE_TTL,
        )
        .await;
        tracing::info!(tenant_id = %tenant_id, next_run = %stored.next_run, "compliance report scheduled");
        stored
    }

    pub async fn scheduled(&self, tenant_id: Uuid) -> Option<StoredSchedule> {
        get_typed(
            self.cache.as_ref(),
            &CacheKey::ComplianceSchedule { tenant_id },
        )
        .await
    }
}

fn identify_gaps(
    completeness: &AuditTrailCompleteness,
    retention: &RetentionCompliance,
    security: &Scorecard,
) -> Vec<ComplianceGap> {
    let mut gaps = Vec::new();

    if !completeness.compliant {
        gaps.push(ComplianceGap {
            category: "audit_trail".into(),
            severity: "high".into(),
            description: "Missing audit trails for critical operations".into(),
            remediation_effort: "medium".into(),
        });
    }

    if retention.categories.values().any(|c| !c.compliant) {
        gaps.push(ComplianceGap {
            category: "data_retention".into(),
            severity: "medium".into(),
            description: "Data retention policy gaps identified".into(),
            remediation_effort: "low".into(),
        });
    }

    if security.score < 90.0 {
        gaps.push(ComplianceGap {
            category: "security".into(),
            severity: "high".into(),
            description: "Security compliance gaps require attention".into(),
            remediation_effort: "high".into(),
        });
    }

    gaps
}

fn build_report_recommendations(status: &ComplianceStatus) -> Vec<Recommendation> {
    let mut recommendations = status.recommendations.clone();

    if status.overall_score < 90.0 {
        recommendations.push(Recommendation {
            priority: "high".into(),
            category: "overall_compliance".into(),
            title: "Improve Overall Compliance Score".into(),
            description: "Focus on addressing critical compliance gaps to improve overall score"
                .into(),
            action_items: vec!["Review the identified gaps and their remediation efforts".into()],
        });
    }

    recommendations.push(Recommendation {
        priority: "medium".into(),
        category: "data_quality".into(),
        title: "Implement Automated Data Quality Checks".into(),
        description: "Set up automated validation rules for utility service data".into(),
        action_items: vec!["Define validation rules per service type".into()],
    });

    recommendations
}

fn build_action_plan() -> ActionPlan {
    let today = Utc::now().date_naive();
    ActionPlan {
        immediate: vec![
            ActionItem {
                action: "Address critical audit gaps".into(),
                due_date: today + Duration::days(7),
                responsible: "System Administrator".into(),
                priority: "critical".into(),
            },
            ActionItem {
                action: "Review security compliance issues".into(),
                due_date: today + Duration::days(14),
                responsible: "Security Team".into(),
                priority: "high".into(),
            },
        ],
        short_term: vec![
            ActionItem {
                action: "Implement enhanced audit logging".into(),
                due_date: today + Duration::days(30),
                responsible: "Development Team".into(),
                priority: "medium".into(),
            },
            ActionItem {
                action: "Update data retention policies".into(),
                due_date: today + Duration::days(45),
                responsible: "Compliance Officer".into(),
                priority: "medium".into(),
            },
        ],
        long_term: vec![ActionItem {
            action: "Implement automated compliance monitoring".into(),
            due_date: today + Duration::days(90),
            responsible: "Development Team".into(),
            priority: "low".into(),
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryChangeLog, StaticComplianceSignals};
    use crate::types::{ChangeEvent, EntityKind, NewChangeRecord, StateMap};
    use crate::cache::InMemoryReportCache;

    fn assessor(ledger: Arc<InMemoryChangeLog>) -> ComplianceAssessor {
        ComplianceAssessor::new(
            ledger,
            Arc::new(StaticComplianceSignals::default()),
            Arc::new(InMemoryReportCache::new()),
        )
    }

    fn record(tenant: Uuid, complete: bool) -> NewChangeRecord {
        NewChangeRecord {
            entity_kind: EntityKind::UtilityService,
            entity_id: Uuid::new_v4(),
            tenant_id: tenant,
            actor_id: complete.then(Uuid::new_v4),
            event: ChangeEvent::Updated,
            old_state: complete.then(StateMap::new),
            new_state: complete.then(StateMap::new),
            note: None,
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn empty_window_is_fully_complete() {
        let ledger = Arc::new(InMemoryChangeLog::new());
        let status = assessor(ledger)
            .status(Some(Uuid::new_v4()), TimeWindow::last_days(30))
            .await
            .unwrap();
        assert_eq!(status.audit_trail.score, 100.0);
        assert!(status.violations.is_empty());
    }

    #[tokio::test]
    async fn incomplete_rows_lower_completeness_and_raise_violations() {
        let ledger = Arc::new(InMemoryChangeLog::new());
        let tenant = Uuid::new_v4();
        // 3 complete rows, 1 incomplete system row: 75 % complete.
        for _ in 0..3 {
            ledger.append(record(tenant, true)).await.unwrap();
        }
        ledger.append(record(tenant, false)).await.unwrap();

        let status = assessor(ledger)
            .status(Some(tenant), TimeWindow::last_days(30))
            .await
            .unwrap();
        assert_eq!(status.audit_trail.score, 75.0);
        assert_eq!(
            status.audit_trail.standing,
            ComplianceStanding::NonCompliant
        );
        assert_eq!(status.violations.len(), 2);
        assert!(status
            .violations
            .iter()
            .any(|v| v.kind == "unauthorized_changes" && v.count == 1));
        assert!(status
            .recommendations
            .iter()
            .any(|r| r.category == "audit_trail"));
    }

    #[tokio::test]
    async fn overall_score_is_the_mean_of_five_subscores() {
        let ledger = Arc::new(InMemoryChangeLog::new());
        let tenant = Uuid::new_v4();
        ledger.append(record(tenant, true)).await.unwrap();

        // Fresh ledger: retention ≈ 0, everything else 100.
        let status = assessor(ledger)
            .status(Some(tenant), TimeWindow::last_days(30))
            .await
            .unwrap();
        assert_eq!(status.audit_trail.score, 100.0);
        assert_eq!(status.retention.score, 0.0);
        assert_eq!(status.overall_score, 80.0);
    }
}
