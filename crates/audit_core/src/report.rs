//! Report and compliance value types.
//!
//! Everything here is derived data: composed by the reporter and the
//! compliance generator, held only inside the report cache, and always
//! reproducible from the ledger plus injected signals.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{AnomalySignal, ChangeRecord, TimeWindow};

// ── Audit report ──────────────────────────────────────────────

/// Headline statistics for a report window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditSummary {
    pub total_changes: usize,
    pub user_changes: usize,
    pub system_changes: usize,
    pub by_event: BTreeMap<String, usize>,
    pub by_entity_kind: BTreeMap<String, usize>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
}

/// Billing-pipeline throughput signals. Injected from the metrics
/// collaborator; the reporter only aggregates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BillingMetrics {
    pub total_readings_processed: u64,
    pub successful_calculations: u64,
    pub calculation_success_rate: f64,
    pub average_processing_time_ms: f64,
    pub peak_processing_time_ms: f64,
    pub calculations_per_hour: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseMetrics {
    pub average_response_time_ms: f64,
    pub p95_response_time_ms: f64,
    pub p99_response_time_ms: f64,
    pub requests_per_hour: f64,
    pub error_rate_pct: f64,
    pub uptime_pct: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorRateMetrics {
    pub total_errors: u64,
    pub critical_errors: u64,
    pub errors_per_hour: f64,
}

/// Externally collected performance signals for a tenant/window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub billing: BillingMetrics,
    pub response: ResponseMetrics,
    pub errors: ErrorRateMetrics,
    pub collected_at: Option<DateTime<Utc>>,
}

/// Alert derived from performance thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceAlert {
    pub metric: String,
    pub severity: String,
    pub message: String,
}

/// The cached composite report for `(tenant, window, service types)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditReport {
    pub tenant_id: Option<Uuid>,
    pub window: TimeWindow,
    pub summary: AuditSummary,
    pub change_records: Vec<ChangeRecord>,
    pub performance: PerformanceMetrics,
    pub compliance: ComplianceStatus,
    pub anomalies: Vec<AnomalySignal>,
    /// Names of sub-computations that failed and were substituted with
    /// empty/default values. Best effort is a visible contract here.
    pub degraded: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

impl AuditReport {
    pub fn critical_anomalies(&self) -> Vec<&AnomalySignal> {
        self.anomalies
            .iter()
            .filter(|a| a.severity == crate::types::AnomalySeverity::High)
            .collect()
    }
}

/// Derived chart inputs for the audit dashboard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditVisualizationData {
    /// Changes per day, keyed `YYYY-MM-DD`.
    pub change_timeline: BTreeMap<String, usize>,
    /// Per actor, changes per hour-of-day.
    pub actor_activity: BTreeMap<String, BTreeMap<u32, usize>>,
    pub entity_kind_breakdown: BTreeMap<String, usize>,
}

// ── Compliance ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceStanding {
    Compliant,
    Warning,
    NonCompliant,
}

impl ComplianceStanding {
    /// Standard two-threshold banding used by the sub-scores.
    pub fn from_score(score: f64, compliant_at: f64, warning_at: f64) -> Self {
        if score >= compliant_at {
            Self::Compliant
        } else if score >= warning_at {
            Self::Warning
        } else {
            Self::NonCompliant
        }
    }
}

/// One compliance sub-score with its finding list. Security and
/// data-quality cards are injected opaquely from external collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scorecard {
    pub score: f64,
    pub standing: ComplianceStanding,
    pub issues: Vec<String>,
    pub details: serde_json::Value,
}

impl Default for Scorecard {
    fn default() -> Self {
        Self {
            score: 100.0,
            standing: ComplianceStanding::Compliant,
            issues: Vec::new(),
            details: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceViolation {
    pub kind: String,
    pub severity: String,
    pub description: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub priority: String,
    pub category: String,
    pub title: String,
    pub description: String,
    pub action_items: Vec<String>,
}

/// Aggregated compliance posture for a tenant/window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceStatus {
    /// Mean of the five sub-scores, rounded to 2 dp.
    pub overall_score: f64,
    pub audit_trail: Scorecard,
    pub retention: Scorecard,
    pub regulatory: Scorecard,
    pub security: Scorecard,
    pub data_quality: Scorecard,
    pub violations: Vec<ComplianceViolation>,
    pub recommendations: Vec<Recommendation>,
    pub assessed_at: Option<DateTime<Utc>>,
}

impl Default for ComplianceStatus {
    fn default() -> Self {
        Self {
            overall_score: 0.0,
            audit_trail: Scorecard::default(),
            retention: Scorecard::default(),
            regulatory: Scorecard::default(),
            security: Scorecard::default(),
            data_quality: Scorecard::default(),
            violations: Vec::new(),
            recommendations: Vec::new(),
            assessed_at: None,
        }
    }
}

/// Letter grade for an overall compliance score — fixed step function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComplianceGrade {
    #[serde(rename = "A+")]
    APlus,
    #[serde(rename = "A")]
    A,
    #[serde(rename = "B+")]
    BPlus,
    #[serde(rename = "B")]
    B,
    #[serde(rename = "C+")]
    CPlus,
    #[serde(rename = "C")]
    C,
    #[serde(rename = "D+")]
    DPlus,
    #[serde(rename = "D")]
    D,
    #[serde(rename = "F")]
    F,
}

impl ComplianceGrade {
    pub fn from_score(score: f64) -> Self {
        match score {
            s if s >= 95.0 => Self::APlus,
            s if s >= 90.0 => Self::A,
            s if s >= 85.0 => Self::BPlus,
            s if s >= 80.0 => Self::B,
            s if s >= 75.0 => Self::CPlus,
            s if s >= 70.0 => Self::C,
            s if s >= 65.0 => Self::DPlus,
            s if s >= 60.0 => Self::D,
            _ => Self::F,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::APlus => "A+",
            Self::A => "A",
            Self::BPlus => "B+",
            Self::B => "B",
            Self::CPlus => "C+",
            Self::C => "C",
            Self::DPlus => "D+",
            Self::D => "D",
            Self::F => "F",
        }
    }
}

impl std::fmt::Display for ComplianceGrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-category retention score: `min(100, actual/required × 100)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionCategory {
    pub required_days: i64,
    pub actual_days: i64,
    pub compliant: bool,
    pub compliance_pct: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionCompliance {
    pub overall_score: f64,
    pub categories: BTreeMap<String, RetentionCategory>,
    pub oldest_record_date: Option<NaiveDate>,
}

/// Audit-trail completeness: audited operations over total operations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditTrailCompleteness {
    pub score: f64,
    pub total_operations: i64,
    pub audited_operations: i64,
    pub missing_audits: i64,
    pub compliant: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceGap {
    pub category: String,
    pub severity: String,
    pub description: String,
    pub remediation_effort: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionItem {
    pub action: String,
    pub due_date: NaiveDate,
    pub responsible: String,
    pub priority: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionPlan {
    pub immediate: Vec<ActionItem>,
    pub short_term: Vec<ActionItem>,
    pub long_term: Vec<ActionItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutiveSummary {
    pub overall_compliance_score: f64,
    pub compliance_grade: ComplianceGrade,
    pub audit_events_reviewed: usize,
    pub critical_issues_found: usize,
    pub recommendations_generated: usize,
    pub days_covered: i64,
}

/// Output shape of a compliance report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportFormat {
    Detailed,
    Summary,
}

impl ReportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detailed => "detailed",
            Self::Summary => "summary",
        }
    }
}

/// The regulatory-style scorecard composed for a tenant/window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub tenant_id: Uuid,
    pub window: TimeWindow,
    pub utility_types: Vec<String>,
    pub format: ReportFormat,
    pub executive_summary: ExecutiveSummary,
    pub regulatory_compliance: Scorecard,
    pub data_retention: RetentionCompliance,
    pub audit_trail_completeness: AuditTrailCompleteness,
    pub security_compliance: Scorecard,
    pub data_quality: Scorecard,
    pub compliance_gaps: Vec<ComplianceGap>,
    pub recommendations: Vec<Recommendation>,
    pub action_plan: ActionPlan,
    pub generated_at: DateTime<Utc>,
}

// ── Scheduled reports ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportFrequency {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
}

impl ReportFrequency {
    pub fn next_run(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        let days = match self {
            Self::Daily => 1,
            Self::Weekly => 7,
            Self::Monthly => 30,
            Self::Quarterly => 90,
        };
        from + chrono::Duration::days(days)
    }
}

/// Recurring compliance-report delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub frequency: ReportFrequency,
    pub utility_types: Vec<String>,
    pub recipients: Vec<String>,
    pub format: ReportFormat,
    pub delivery_method: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSchedule {
    pub tenant_id: Uuid,
    pub config: ScheduleConfig,
    pub next_run: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grade_boundaries_are_inclusive() {
        assert_eq!(ComplianceGrade::from_score(95.0), ComplianceGrade::APlus);
        assert_eq!(ComplianceGrade::from_score(94.9), ComplianceGrade::A);
        assert_eq!(ComplianceGrade::from_score(90.0), ComplianceGrade::A);
        assert_eq!(ComplianceGrade::from_score(60.0), ComplianceGrade::D);
        assert_eq!(ComplianceGrade::from_score(59.9), ComplianceGrade::F);
        assert_eq!(ComplianceGrade::from_score(0.0), ComplianceGrade::F);
    }

    #[test]
    fn grade_serializes_as_letter() {
        let v = serde_json::to_value(ComplianceGrade::APlus).unwrap();
        assert_eq!(v, "A+");
    }

    #[test]
    fn standing_banding() {
        assert_eq!(
            ComplianceStanding::from_score(96.0, 95.0, 80.0),
            ComplianceStanding::Compliant
        );
        assert_eq!(
            ComplianceStanding::from_score(85.0, 95.0, 80.0),
            ComplianceStanding::Warning
        );
        assert_eq!(
            ComplianceStanding::from_score(50.0, 95.0, 80.0),
            ComplianceStanding::NonCompliant
        );
    }

    #[test]
    fn report_frequency_next_run() {
        let from = Utc::now();
        assert_eq!(
            ReportFrequency::Weekly.next_run(from) - from,
            chrono::Duration::days(7)
        );
    }
}
