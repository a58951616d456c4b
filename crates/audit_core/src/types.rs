//! Core domain types for the audit engine.
//! These are pure value types — no sqlx, no DB dependencies.
//! The postgres adapter has `FromRow` mirror structs and converts into these.

// Several enums intentionally use `from_str() -> Option<Self>` instead of
// `FromStr` because they return None for unknown values rather than an error.
#![allow(clippy::should_implement_trait)]

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Field map snapshot of an audited entity, as stored in the ledger's
/// JSONB `old_state` / `new_state` columns.
pub type StateMap = serde_json::Map<String, serde_json::Value>;

// ── Enums ─────────────────────────────────────────────────────

/// Audited entity kind — discriminator for the shared change-log table.
/// Replaces runtime class resolution: repositories are selected via this
/// tag, never via a stored type name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    UtilityService,
    ServiceConfiguration,
}

impl EntityKind {
    /// Every audited kind, in stable order. The default query universe
    /// for tenant-wide scans.
    pub const ALL: [EntityKind; 2] = [Self::UtilityService, Self::ServiceConfiguration];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UtilityService => "utility_service",
            Self::ServiceConfiguration => "service_configuration",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "utility_service" => Some(Self::UtilityService),
            "service_configuration" => Some(Self::ServiceConfiguration),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of mutation a ledger entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeEvent {
    Created,
    Updated,
    Deleted,
    Rollback,
}

impl ChangeEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::Rollback => "rollback",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "updated" => Some(Self::Updated),
            "deleted" => Some(Self::Deleted),
            "rollback" => Some(Self::Rollback),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── Time window ───────────────────────────────────────────────

/// Inclusive time range for ledger queries and reports.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Window ending now and reaching back `days` days — the default
    /// reporting window is `last_days(30)`.
    pub fn last_days(days: i64) -> Self {
        let end = Utc::now();
        Self {
            start: end - Duration::days(days),
            end,
        }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t <= self.end
    }

    /// Number of calendar days covered, inclusive of both endpoints.
    pub fn days_covered(&self) -> i64 {
        (self.end.date_naive() - self.start.date_naive()).num_days() + 1
    }
}

// ── Ledger entries ────────────────────────────────────────────

/// One immutable fact in the append-only change log.
///
/// `actor_id = None` marks a system-originated mutation. Records for a
/// single entity are totally ordered by `(occurred_at, seq)`; `seq` is the
/// store-assigned insertion sequence that breaks timestamp ties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: Uuid,
    pub entity_kind: EntityKind,
    pub entity_id: Uuid,
    pub tenant_id: Uuid,
    pub actor_id: Option<Uuid>,
    pub event: ChangeEvent,
    pub old_state: Option<StateMap>,
    pub new_state: Option<StateMap>,
    pub occurred_at: DateTime<Utc>,
    pub seq: i64,
    pub note: Option<String>,
    pub metadata: serde_json::Value,
}

impl ChangeRecord {
    pub fn is_system(&self) -> bool {
        self.actor_id.is_none()
    }

    /// Day bucket key used by every per-day aggregation.
    pub fn day_key(&self) -> String {
        self.occurred_at.format("%Y-%m-%d").to_string()
    }

    /// Fields recorded as changed — the keys of `old_state`.
    pub fn changed_fields(&self) -> Vec<String> {
        self.old_state
            .as_ref()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// Insert form of a ledger entry. `id`, `seq` and `occurred_at` are
/// assigned by the store on append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewChangeRecord {
    pub entity_kind: EntityKind,
    pub entity_id: Uuid,
    pub tenant_id: Uuid,
    pub actor_id: Option<Uuid>,
    pub event: ChangeEvent,
    pub old_state: Option<StateMap>,
    pub new_state: Option<StateMap>,
    pub note: Option<String>,
    pub metadata: serde_json::Value,
}

// ── Field-level change summary ────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldChangeKind {
    Added,
    Removed,
    Increased,
    Decreased,
    Modified,
}

/// Old/new pair for one field of a recorded change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldChange {
    pub from: serde_json::Value,
    pub to: serde_json::Value,
    pub kind: FieldChangeKind,
}

impl FieldChange {
    pub fn classify(from: &serde_json::Value, to: &serde_json::Value) -> FieldChangeKind {
        match (from, to) {
            (serde_json::Value::Null, v) if !v.is_null() => FieldChangeKind::Added,
            (v, serde_json::Value::Null) if !v.is_null() => FieldChangeKind::Removed,
            (serde_json::Value::Number(a), serde_json::Value::Number(b)) => {
                let a = a.as_f64().unwrap_or(0.0);
                let b = b.as_f64().unwrap_or(0.0);
                if b > a {
                    FieldChangeKind::Increased
                } else {
                    FieldChangeKind::Decreased
                }
            }
            _ => FieldChangeKind::Modified,
        }
    }
}

/// Per-field diff between two state maps: one entry for each field of
/// `new` whose value differs from `old`.
pub fn change_summary(old: &StateMap, new: &StateMap) -> BTreeMap<String, FieldChange> {
    let mut summary = BTreeMap::new();
    for (field, new_value) in new {
        let old_value = old.get(field).cloned().unwrap_or(serde_json::Value::Null);
        if &old_value != new_value {
            summary.insert(
                field.clone(),
                FieldChange {
                    kind: FieldChange::classify(&old_value, new_value),
                    from: old_value,
                    to: new_value.clone(),
                },
            );
        }
    }
    summary
}

// ── Rollback candidates ───────────────────────────────────────

/// Derived rollback view of one ledger entry against the live entity.
/// Never persisted — recomputed on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackCandidate {
    pub source_change_id: Uuid,
    pub entity_kind: EntityKind,
    pub entity_id: Uuid,
    pub current_state: StateMap,
    /// The state a rollback would restore — the source change's `old_state`.
    pub proposed_state: StateMap,
    pub changed_fields: Vec<String>,
    pub change_summary: BTreeMap<String, FieldChange>,
    pub can_rollback: bool,
    pub warnings: Vec<String>,
}

/// Input to the atomic rollback write path (`RollbackStore::execute`).
#[derive(Debug, Clone)]
pub struct RollbackApply {
    pub source: ChangeRecord,
    pub actor_id: Uuid,
    pub proposed_state: StateMap,
    pub note: String,
    pub metadata: serde_json::Value,
}

/// Result of a committed rollback transaction.
#[derive(Debug, Clone)]
pub struct AppliedRollback {
    pub record: ChangeRecord,
    pub restored_state: StateMap,
}

/// Structured outcome of `RollbackService::perform` — rollback failures
/// are reported here, never thrown across the API boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackOutcome {
    pub success: bool,
    pub message: String,
    pub rollback_id: Option<Uuid>,
    pub entity_state: Option<StateMap>,
    pub errors: Vec<String>,
}

impl RollbackOutcome {
    pub fn failed(message: impl Into<String>, errors: Vec<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            rollback_id: None,
            entity_state: None,
            errors,
        }
    }
}

/// Dependent-system impact of reverting specific fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImpactAnalysis {
    pub warnings: Vec<String>,
    pub has_critical_impact: bool,
    pub affected_systems: Vec<String>,
    pub mitigation_steps: Vec<String>,
}

/// Result of `RollbackService::validate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub impact: ImpactAnalysis,
}

/// Reference back to the change a rollback reverted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginalChangeRef {
    pub id: Uuid,
    pub event: ChangeEvent,
    pub occurred_at: DateTime<Utc>,
    pub actor_id: Option<Uuid>,
}

/// One row of the rollback history for an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackHistoryEntry {
    pub rollback_id: Uuid,
    pub performed_at: DateTime<Utc>,
    pub performed_by: Option<Uuid>,
    pub reason: Option<String>,
    pub original_change: Option<OriginalChangeRef>,
    pub fields_rolled_back: Vec<String>,
}

/// Payload pushed to the notification channel after a committed rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackNotification {
    pub rollback_id: Uuid,
    pub entity_kind: EntityKind,
    pub entity_id: Uuid,
    pub actor_id: Uuid,
    pub reason: Option<String>,
    pub impact: ImpactAnalysis,
}

// ── Anomaly signals ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    HighChangeFrequency,
    BulkChanges,
    ConfigurationRollback,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HighChangeFrequency => "high_change_frequency",
            Self::BulkChanges => "bulk_changes",
            Self::ConfigurationRollback => "configuration_rollback",
        }
    }

    /// Severity is fixed per kind.
    pub fn severity(&self) -> AnomalySeverity {
        match self {
            Self::HighChangeFrequency => AnomalySeverity::Warning,
            Self::BulkChanges => AnomalySeverity::High,
            Self::ConfigurationRollback => AnomalySeverity::Medium,
        }
    }
}

impl std::fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalySeverity {
    Warning,
    Medium,
    High,
}

/// A derived suspicion over a tenant's change stream. Recomputed per
/// report window; only ever persisted inside the report cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalySignal {
    pub kind: AnomalyKind,
    pub severity: AnomalySeverity,
    pub description: String,
    pub detected_at: DateTime<Utc>,
    pub details: serde_json::Value,
}

// ── Pattern analysis ──────────────────────────────────────────

/// Change count attributed to one entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityChangeCount {
    pub entity_kind: EntityKind,
    pub entity_id: Uuid,
    pub change_count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrequencyAnalysis {
    pub average_per_day: f64,
    pub peak_day: Option<String>,
    pub peak_count: usize,
    /// Days with fewer than 0.5× the average change count.
    pub quiet_periods: Vec<String>,
    /// Days with more than 1.5× the average change count.
    pub busy_periods: Vec<String>,
    pub total_days_analyzed: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollbackAnalysis {
    pub total_rollbacks: usize,
    /// Rollbacks as a percentage of all changes, rounded to 2 dp.
    pub rollback_rate: f64,
    /// Top 5 most-rolled-back entities by count.
    pub most_rolled_back: Vec<EntityChangeCount>,
    pub rollbacks_by_actor: BTreeMap<String, usize>,
}

/// Aggregate statistics over a tenant's change stream for a window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangePatterns {
    pub total_changes: usize,
    pub by_event: BTreeMap<String, usize>,
    pub by_actor: BTreeMap<String, usize>,
    pub by_day: BTreeMap<String, usize>,
    pub by_hour: BTreeMap<u32, usize>,
    pub top_changed_entities: Vec<EntityChangeCount>,
    pub frequency: FrequencyAnalysis,
    pub rollbacks: RollbackAnalysis,
}

// ── Tests ─────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(pairs: &[(&str, serde_json::Value)]) -> StateMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn entity_kind_codec_round_trips() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(EntityKind::from_str("meter"), None);
    }

    #[test]
    fn change_event_display() {
        assert_eq!(ChangeEvent::Rollback.to_string(), "rollback");
        assert_eq!(ChangeEvent::from_str("updated"), Some(ChangeEvent::Updated));
    }

    #[test]
    fn anomaly_severity_is_fixed_per_kind() {
        assert_eq!(
            AnomalyKind::HighChangeFrequency.severity(),
            AnomalySeverity::Warning
        );
        assert_eq!(AnomalyKind::BulkChanges.severity(), AnomalySeverity::High);
        assert_eq!(
            AnomalyKind::ConfigurationRollback.severity(),
            AnomalySeverity::Medium
        );
    }

    #[test]
    fn window_days_covered_is_inclusive() {
        let start = "2026-03-01T00:00:00Z".parse().unwrap();
        let end = "2026-03-10T23:59:00Z".parse().unwrap();
        assert_eq!(TimeWindow::new(start, end).days_covered(), 10);
    }

    #[test]
    fn field_change_classification() {
        assert_eq!(
            FieldChange::classify(&json!(null), &json!("x")),
            FieldChangeKind::Added
        );
        assert_eq!(
            FieldChange::classify(&json!("x"), &json!(null)),
            FieldChangeKind::Removed
        );
        assert_eq!(
            FieldChange::classify(&json!(1), &json!(5)),
            FieldChangeKind::Increased
        );
        assert_eq!(
            FieldChange::classify(&json!(5.5), &json!(1.2)),
            FieldChangeKind::Decreased
        );
        assert_eq!(
            FieldChange::classify(&json!("a"), &json!("b")),
            FieldChangeKind::Modified
        );
    }

    #[test]
    fn change_summary_only_reports_differing_fields() {
        let old = state(&[("name", json!("A")), ("rate", json!(10))]);
        let new = state(&[("name", json!("A")), ("rate", json!(12))]);
        let summary = change_summary(&old, &new);
        assert_eq!(summary.len(), 1);
        assert_eq!(summary["rate"].kind, FieldChangeKind::Increased);
    }

    #[test]
    fn change_record_serde_round_trips() {
        let record = ChangeRecord {
            id: Uuid::new_v4(),
            entity_kind: EntityKind::UtilityService,
            entity_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            actor_id: None,
            event: ChangeEvent::Updated,
            old_state: Some(state(&[("name", json!("A"))])),
            new_state: Some(state(&[("name", json!("B"))])),
            occurred_at: Utc::now(),
            seq: 7,
            note: None,
            metadata: json!({}),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["event"], "updated");
        assert_eq!(value["entity_kind"], "utility_service");
        let back: ChangeRecord = serde_json::from_value(value).unwrap();
        assert!(back.is_system());
        assert_eq!(back.changed_fields(), vec!["name".to_string()]);
    }
}
