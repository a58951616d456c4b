//! Change tracker — projects the raw ledger into typed change streams
//! and aggregate statistics, and derives rollback candidates.
//!
//! Read-only except for `execute_rollback`, which delegates to the
//! atomic `RollbackStore` write path. Tenant/entity streams are cached
//! under structured keys; TTL expiry is the only invalidation, since the
//! ledger is append-only.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use crate::cache::{get_typed, put_typed, CacheKey, ReportCache};
use crate::error::AuditError;
use crate::ports::{ChangeLogStore, EntityDirectory, Result, RollbackStore};
use crate::types::*;

const ENTITY_CHANGES_TTL: Duration = Duration::from_secs(600);
const TENANT_CHANGES_TTL: Duration = Duration::from_secs(300);

/// Default reporting window when the caller gives none.
pub const DEFAULT_WINDOW_DAYS: i64 = 30;

pub struct ChangeTracker {
    ledger: Arc<dyn ChangeLogStore>,
    entities: EntityDirectory,
    rollbacks: Arc<dyn RollbackStore>,
    cache: Arc<dyn ReportCache>,
}

impl ChangeTracker {
    pub fn new(
        ledger: Arc<dyn ChangeLogStore>,
        entities: EntityDirectory,
        rollbacks: Arc<dyn RollbackStore>,
        cache: Arc<dyn ReportCache>,
    ) -> Self {
        Self {
            ledger,
            entities,
            rollbacks,
            cache,
        }
    }

    pub fn entities(&self) -> &EntityDirectory {
        &self.entities
    }

    // ── Change streams ────────────────────────────────────────

    /// All changes for one entity, newest first.
    pub async fn changes_for_entity(
        &self,
        kind: EntityKind,
        entity_id: Uuid,
        tenant_id: Option<Uuid>,
        window: Option<TimeWindow>,
    ) -> Result<Vec<ChangeRecord>> {
        let key = CacheKey::EntityChanges {
            kind,
            entity_id,
            tenant_id,
            window,
        };
        if let Some(cached) = get_typed(self.cache.as_ref(), &key).await {
            return Ok(cached);
        }

        let changes = self
            .ledger
            .changes_for_entity(kind, entity_id, tenant_id, window)
            .await?;
        put_typed(self.cache.as_ref(), &key, &changes, ENTITY_CHANGES_TTL).await;
        Ok(changes)
    }

    /// All changes for a tenant, newest first. Defaults to the last 30
    /// days; an optional service-type filter narrows the stream to
    /// entities of those utility types.
    pub async fn changes_for_tenant(
        &self,
        tenant_id: Uuid,
        window: Option<TimeWindow>,
        service_types: &[String],
    ) -> Result<Vec<ChangeRecord>> {
        let window = window.unwrap_or_else(|| TimeWindow::last_days(DEFAULT_WINDOW_DAYS));
        let key = CacheKey::TenantChanges {
            tenant_id,
            window,
            service_types: service_types.to_vec(),
        };
        if let Some(cached) = get_typed(self.cache.as_ref(), &key).await {
            return Ok(cached);
        }

        let mut changes = self
            .ledger
            .changes_for_tenant(Some(tenant_id), window, &EntityKind::ALL)
            .await?;

        if !service_types.is_empty() {
            let mut allowed: Vec<(EntityKind, Uuid)> = Vec::new();
            for kind in EntityKind::ALL {
                let repo = self.entities.get(kind)?;
                for id in repo.ids_for_service_types(tenant_id, service_types).await? {
                    allowed.push((kind, id));
                }
            }
            changes.retain(|r| allowed.contains(&(r.entity_kind, r.entity_id)));
        }

        put_typed(self.cache.as_ref(), &key, &changes, TENANT_CHANGES_TTL).await;
        Ok(changes)
    }

    // ── Pattern analysis ──────────────────────────────────────

    /// Aggregate change statistics for a tenant and window.
    pub async fn analyze_patterns(
        &self,
        tenant_id: Uuid,
        window: Option<TimeWindow>,
    ) -> Result<ChangePatterns> {
        let changes = self.changes_for_tenant(tenant_id, window, &[]).await?;
        Ok(Self::patterns_from(&changes))
    }

    /// Pure aggregation over a fetched change set.
    pub fn patterns_from(changes: &[ChangeRecord]) -> ChangePatterns {
        let by_day = group_by_day(changes);
        ChangePatterns {
            total_changes: changes.len(),
            by_event: group_counts(changes, |r| r.event.as_str().to_string()),
            by_actor: group_counts(changes, actor_key),
            by_hour: changes.iter().fold(BTreeMap::new(), |mut acc, r| {
                use chrono::Timelike;
                *acc.entry(r.occurred_at.hour()).or_insert(0) += 1;
                acc
            }),
            top_changed_entities: top_entities(changes, 10),
            frequency: frequency_analysis(&by_day),
            rollbacks: rollback_analysis(changes),
            by_day,
        }
    }

    // ── Rollback candidates ───────────────────────────────────

    /// Derive the rollback view of one ledger entry. `None` when the
    /// entry is missing or carries no prior state to restore.
    pub async fn rollback_candidate(&self, change_id: Uuid) -> Result<Option<RollbackCandidate>> {
        let Some(record) = self.ledger.get(change_id).await? else {
            return Ok(None);
        };
        let Some(old_state) = record.old_state.clone() else {
            return Ok(None);
        };

        let repo = self.entities.get(record.entity_kind)?;
        let current_state = repo.current_state(record.entity_id).await?;
        let entity_exists = current_state.is_some();

        let has_later = self
            .ledger
            .has_later_change(
                record.entity_kind,
                record.entity_id,
                record.occurred_at,
                record.seq,
            )
            .await?;

        let mut warnings = Vec::new();
        match record.entity_kind {
            EntityKind::UtilityService => {
                let active = repo.count_active_dependents(record.entity_id).await?;
                if active > 0 {
                    warnings.push(format!(
                        "This service has {active} active configurations that may be affected."
                    ));
                }
            }
            EntityKind::ServiceConfiguration => {
                let since = chrono::Utc::now() - chrono::Duration::days(7);
                let recent = repo
                    .count_recent_reading_meters(record.entity_id, since)
                    .await?;
                if recent > 0 {
                    warnings.push(format!(
                        "This configuration has {recent} meters with recent readings that may be affected."
                    ));
                }
            }
        }
        warnings.push("Rolling back this configuration may affect billing calculations.".into());

        let summary = match (&record.old_state, &record.new_state) {
            (Some(old), Some(new)) => change_summary(old, new),
            _ => BTreeMap::new(),
        };

        Ok(Some(RollbackCandidate {
            source_change_id: record.id,
            entity_kind: record.entity_kind,
            entity_id: record.entity_id,
            current_state: current_state.unwrap_or_default(),
            changed_fields: old_state.keys().cloned().collect(),
            change_summary: summary,
            can_rollback: entity_exists && !has_later,
            proposed_state: old_state,
            warnings,
        }))
    }

    /// Thin rollback path for call sites that do not need full impact
    /// analysis: candidate check, then the atomic store execution.
    /// Returns false when the change cannot be rolled back (including a
    /// staleness race lost inside the transaction).
    pub async fn execute_rollback(
        &self,
        change_id: Uuid,
        actor_id: Uuid,
        reason: Option<&str>,
    ) -> Result<bool> {
        let Some(candidate) = self.rollback_candidate(change_id).await? else {
            return Ok(false);
        };
        if !candidate.can_rollback {
            return Ok(false);
        }

        // Candidate existence implies the row is present.
        let source = self
            .ledger
            .get(change_id)
            .await?
            .ok_or_else(|| AuditError::NotFound(format!("change {change_id}")))?;

        let note = match reason {
            Some(reason) => format!("Rollback: {reason}"),
            None => "Configuration rollback performed".to_string(),
        };
        let apply = RollbackApply {
            proposed_state: candidate.proposed_state,
            actor_id,
            note,
            metadata: json!({
                "original_change_id": source.id,
                "rollback_reason": reason,
            }),
            source,
        };

        match self.rollbacks.execute(apply).await {
            Ok(_) => Ok(true),
            Err(AuditError::StaleRollback(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

// ── Aggregation helpers ───────────────────────────────────────

fn actor_key(record: &ChangeRecord) -> String {
    record
        .actor_id
        .map(|a| a.to_string())
        .unwrap_or_else(|| "system".into())
}

fn group_counts(
    changes: &[ChangeRecord],
    key: impl Fn(&ChangeRecord) -> String,
) -> BTreeMap<String, usize> {
    changes.iter().fold(BTreeMap::new(), |mut acc, r| {
        *acc.entry(key(r)).or_insert(0) += 1;
        acc
    })
}

fn group_by_day(changes: &[ChangeRecord]) -> BTreeMap<String, usize> {
    group_counts(changes, |r| r.day_key())
}

fn top_entities(changes: &[ChangeRecord], limit: usize) -> Vec<EntityChangeCount> {
    let counts = changes.iter().fold(BTreeMap::new(), |mut acc, r| {
        *acc.entry((r.entity_kind, r.entity_id)).or_insert(0usize) += 1;
        acc
    });
    let mut entries: Vec<EntityChangeCount> = counts
        .into_iter()
        .map(|((entity_kind, entity_id), change_count)| EntityChangeCount {
            entity_kind,
            entity_id,
            change_count,
        })
        .collect();
    // Count descending; key order breaks ties deterministically.
    entries.sort_by(|a, b| {
        b.change_count
            .cmp(&a.change_count)
            .then(a.entity_kind.cmp(&b.entity_kind))
            .then(a.entity_id.cmp(&b.entity_id))
    });
    entries.truncate(limit);
    entries
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn frequency_analysis(by_day: &BTreeMap<String, usize>) -> FrequencyAnalysis {
    if by_day.is_empty() {
        return FrequencyAnalysis::default();
    }

    let total: usize = by_day.values().sum();
    let average = total as f64 / by_day.len() as f64;
    let peak_count = by_day.values().copied().max().unwrap_or(0);
    // First day reaching the peak, in chronological iteration order.
    let peak_day = by_day
        .iter()
        .find(|(_, count)| **count == peak_count)
        .map(|(day, _)| day.clone());

    let quiet_threshold = average * 0.5;
    let busy_threshold = average * 1.5;

    FrequencyAnalysis {
        average_per_day: round2(average),
        peak_day,
        peak_count,
        quiet_periods: by_day
            .iter()
            .filter(|(_, c)| (**c as f64) < quiet_threshold)
            .map(|(d, _)| d.clone())
            .collect(),
        busy_periods: by_day
            .iter()
            .filter(|(_, c)| (**c as f64) > busy_threshold)
            .map(|(d, _)| d.clone())
            .collect(),
        total_days_analyzed: by_day.len(),
    }
}

fn rollback_analysis(changes: &[ChangeRecord]) -> RollbackAnalysis {
    let rollbacks: Vec<&ChangeRecord> = changes
        .iter()
        .filter(|r| r.event == ChangeEvent::Rollback)
        .collect();
    if rollbacks.is_empty() {
        return RollbackAnalysis::default();
    }

    let owned: Vec<ChangeRecord> = rollbacks.iter().map(|r| (*r).clone()).collect();
    RollbackAnalysis {
        total_rollbacks: rollbacks.len(),
        rollback_rate: round2(rollbacks.len() as f64 / changes.len() as f64 * 100.0),
        most_rolled_back: top_entities(&owned, 5),
        rollbacks_by_actor: group_counts(&owned, actor_key),
    }
}
