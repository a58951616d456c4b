//! Rollback service — validates and executes the reversal of one
//! recorded change.
//!
//! This is the only write path in the engine. The atomic step (staleness
//! re-check, entity mutation, ledger append) is delegated to the
//! `RollbackStore` port; everything around it — structural validation,
//! impact analysis, notification — happens outside the transaction.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::ports::{ChangeLogStore, Result, RollbackNotifier, RollbackStore};
use crate::tracker::ChangeTracker;
use crate::types::*;
use crate::validate::validate_proposed_state;

const CRITICAL_IMPACT_ERROR: &str = "Rollback would have critical impact on dependent systems";
const RECENT_READING_DAYS: i64 = 7;

pub struct RollbackService {
    tracker: Arc<ChangeTracker>,
    ledger: Arc<dyn ChangeLogStore>,
    store: Arc<dyn RollbackStore>,
    notifier: Arc<dyn RollbackNotifier>,
}

impl RollbackService {
    pub fn new(
        tracker: Arc<ChangeTracker>,
        ledger: Arc<dyn ChangeLogStore>,
        store: Arc<dyn RollbackStore>,
        notifier: Arc<dyn RollbackNotifier>,
    ) -> Self {
        Self {
            tracker,
            ledger,
            store,
            notifier,
        }
    }

    // ── Validation ────────────────────────────────────────────

    /// Check whether a rollback is safe to perform. Never mutates state.
    pub async fn validate(&self, change_id: Uuid) -> Result<RollbackValidation> {
        let Some(candidate) = self.tracker.rollback_candidate(change_id).await? else {
            return Ok(RollbackValidation {
                valid: false,
                errors: vec!["Change record not found or invalid for rollback".into()],
                warnings: Vec::new(),
                impact: ImpactAnalysis::default(),
            });
        };

        let mut errors = Vec::new();
        if !candidate.can_rollback {
            errors.push("Configuration cannot be rolled back due to subsequent changes".into());
        }

        errors.extend(validate_proposed_state(
            candidate.entity_kind,
            &candidate.proposed_state,
        ));

        let impact = self.analyze_impact(&candidate).await?;
        if impact.has_critical_impact {
            errors.push(CRITICAL_IMPACT_ERROR.into());
        }

        let mut warnings = impact.warnings.clone();
        warnings.extend(candidate.warnings.clone());

        Ok(RollbackValidation {
            valid: errors.is_empty(),
            errors,
            warnings,
            impact,
        })
    }

    /// Enumerate the dependent systems a rollback would touch. Reverting
    /// billing-critical fields is flagged as critical impact.
    async fn analyze_impact(&self, candidate: &RollbackCandidate) -> Result<ImpactAnalysis> {
        let repo = self.tracker.entities().get(candidate.entity_kind)?;
        let mut impact = ImpactAnalysis::default();

        let proposed = &candidate.proposed_state;
        let current = &candidate.current_state;
        let reverts = |field: &str| {
            proposed
                .get(field)
                .is_some_and(|value| current.get(field) != Some(value))
        };

        match candidate.entity_kind {
            EntityKind::UtilityService => {
                let active = repo.count_active_dependents(candidate.entity_id).await?;
                if active > 0 {
                    impact.warnings.push(format!(
                        "Rollback will affect {active} active service configurations"
                    ));
                    impact.affected_systems.push("Service Configurations".into());
                }

                if reverts("pricing_model") {
                    impact
                        .warnings
                        .push("Pricing model will be reverted, affecting billing calculations".into());
                    impact.affected_systems.push("Billing System".into());
                    impact.has_critical_impact = true;
                }

                if reverts("calculation_formula") {
                    impact.warnings.push(
                        "Calculation formula will be reverted, affecting all future calculations"
                            .into(),
                    );
                    impact.affected_systems.push("Calculation Engine".into());
                    impact.has_critical_impact = true;
                }

                impact.mitigation_steps = vec![
                    "Review all active configurations after rollback".into(),
                    "Recalculate any pending invoices".into(),
                    "Notify affected tenants of changes".into(),
                ];
            }
            EntityKind::ServiceConfiguration => {
                let since = Utc::now() - Duration::days(RECENT_READING_DAYS);
                let recent = repo
                    .count_recent_reading_meters(candidate.entity_id, since)
                    .await?;
                if recent > 0 {
                    impact.warnings.push(format!(
                        "Configuration has {recent} meters with recent readings"
                    ));
                    impact.affected_systems.push("Meter Reading System".into());
                }

                if reverts("rate_schedule") {
                    impact
                        .warnings
                        .push("Rate schedule will be reverted, affecting billing calculations".into());
                    impact.affected_systems.push("Billing System".into());
                    impact.has_critical_impact = true;
                }

                impact.mitigation_steps = vec![
                    "Verify meter readings after rollback".into(),
                    "Recalculate affected invoices".into(),
                    "Update tenant notifications".into(),
                ];
            }
        }

        Ok(impact)
    }

    // ── Execution ─────────────────────────────────────────────

    /// Perform a validated rollback. Always returns a structured outcome;
    /// failures carry their reasons instead of propagating as errors.
    /// Critical impact blocks execution unless the caller explicitly
    /// acknowledges it.
    pub async fn perform(
        &self,
        change_id: Uuid,
        actor_id: Uuid,
        reason: Option<&str>,
        notify: bool,
        acknowledge_critical: bool,
    ) -> Result<RollbackOutcome> {
        let validation = self.validate(change_id).await?;
        let mut errors = validation.errors.clone();
        if acknowledge_critical {
            errors.retain(|e| e != CRITICAL_IMPACT_ERROR);
        }
        if !errors.is_empty() {
            return Ok(RollbackOutcome::failed("Rollback validation failed", errors));
        }

        let Some(source) = self.ledger.get(change_id).await? else {
            return Ok(RollbackOutcome::failed(
                "Rollback validation failed",
                vec![format!("change {change_id} not found")],
            ));
        };
        let Some(candidate) = self.tracker.rollback_candidate(change_id).await? else {
            return Ok(RollbackOutcome::failed(
                "Rollback validation failed",
                vec![format!("change {change_id} is not rollback-eligible")],
            ));
        };

        let apply = RollbackApply {
            proposed_state: candidate.proposed_state,
            actor_id,
            note: build_rollback_note(reason, &source),
            metadata: json!({
                "original_change_id": source.id,
                "rollback_reason": reason,
                "rollback_actor_id": actor_id,
                "impact_analysis": validation.impact.clone(),
            }),
            source,
        };

        match self.store.execute(apply).await {
            Ok(applied) => {
                tracing::info!(
                    change_id = %change_id,
                    rollback_id = %applied.record.id,
                    entity_kind = %applied.record.entity_kind,
                    entity_id = %applied.record.entity_id,
                    actor_id = %actor_id,
                    "configuration rollback performed"
                );

                if notify {
                    let notification = RollbackNotification {
                        rollback_id: applied.record.id,
                        entity_kind: applied.record.entity_kind,
                        entity_id: applied.record.entity_id,
                        actor_id,
                        reason: reason.map(str::to_string),
                        impact: validation.impact,
                    };
                    if let Err(e) = self.notifier.notify(&notification).await {
                        tracing::warn!(
                            rollback_id = %applied.record.id,
                            error = %e,
                            "failed to send rollback notification"
                        );
                    }
                }

                Ok(RollbackOutcome {
                    success: true,
                    message: "Configuration successfully rolled back".into(),
                    rollback_id: Some(applied.record.id),
                    entity_state: Some(applied.restored_state),
                    errors: Vec::new(),
                })
            }
            Err(e) => {
                tracing::error!(change_id = %change_id, actor_id = %actor_id, error = %e, "configuration rollback failed");
                Ok(RollbackOutcome::failed(
                    format!("Rollback failed: {e}"),
                    e.reasons(),
                ))
            }
        }
    }

    // ── History ───────────────────────────────────────────────

    /// Rollback history for one entity, newest first, each entry joined
    /// back to the change it reverted.
    pub async fn history(
        &self,
        kind: EntityKind,
        entity_id: Uuid,
    ) -> Result<Vec<RollbackHistoryEntry>> {
        let rollbacks = self.ledger.rollbacks_for_entity(kind, entity_id).await?;
        let mut entries = Vec::with_capacity(rollbacks.len());

        for rollback in rollbacks {
            let original_id = rollback
                .metadata
                .get("original_change_id")
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok());
            let original_change = match original_id {
                Some(id) => self.ledger.get(id).await?.map(|original| OriginalChangeRef {
                    id: original.id,
                    event: original.event,
                    occurred_at: original.occurred_at,
                    actor_id: original.actor_id,
                }),
                None => None,
            };

            entries.push(RollbackHistoryEntry {
                rollback_id: rollback.id,
                performed_at: rollback.occurred_at,
                performed_by: rollback.actor_id,
                reason: rollback
                    .metadata
                    .get("rollback_reason")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                original_change,
                fields_rolled_back: rollback
                    .new_state
                    .as_ref()
                    .map(|s| s.keys().cloned().collect())
                    .unwrap_or_default(),
            });
        }

        Ok(entries)
    }
}

fn build_rollback_note(reason: Option<&str>, original: &ChangeRecord) -> String {
    let actor = original
        .actor_id
        .map(|a| a.to_string())
        .unwrap_or_else(|| "System".into());
    let mut note = format!(
        "Configuration rollback performed\nOriginal change ID: {}\nOriginal change date: {}\nOriginal change by: {}\n",
        original.id,
        original.occurred_at.to_rfc3339(),
        actor
    );
    if let Some(reason) = reason {
        note.push_str(&format!("Rollback reason: {reason}\n"));
    }
    note
}
