//! Storage and collaborator port traits for the audit engine.
//! Implemented by audit_postgres — core logic depends only on these traits.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AuditError;
use crate::report::{PerformanceMetrics, Scorecard};
use crate::types::*;

pub type Result<T> = std::result::Result<T, AuditError>;

/// The append-only change ledger. The store is the sole owner of the
/// rows; everything else holds read views plus `append` (exercised only
/// by the rollback write path).
///
/// Ordering contract: rows for one entity are totally ordered by
/// `(occurred_at, seq)` — `seq` is assigned on insert and breaks
/// timestamp ties. All listing methods return newest-first.
#[async_trait]
pub trait ChangeLogStore: Send + Sync {
    /// Append one ledger row, assigning `id`, `seq` and `occurred_at`.
    async fn append(&self, record: NewChangeRecord) -> Result<ChangeRecord>;

    /// Load a single row by id.
    async fn get(&self, change_id: Uuid) -> Result<Option<ChangeRecord>>;

    /// All changes for one entity, newest first, optionally bounded by
    /// tenant and window.
    async fn changes_for_entity(
        &self,
        kind: EntityKind,
        entity_id: Uuid,
        tenant_id: Option<Uuid>,
        window: Option<TimeWindow>,
    ) -> Result<Vec<ChangeRecord>>;

    /// All changes within a window, newest first, limited to the given
    /// entity kinds. `tenant_id = None` scans platform-wide.
    async fn changes_for_tenant(
        &self,
        tenant_id: Option<Uuid>,
        window: TimeWindow,
        kinds: &[EntityKind],
    ) -> Result<Vec<ChangeRecord>>;

    /// Staleness probe: does a row later than `(occurred_at, seq)` exist
    /// for this entity?
    async fn has_later_change(
        &self,
        kind: EntityKind,
        entity_id: Uuid,
        occurred_at: DateTime<Utc>,
        seq: i64,
    ) -> Result<bool>;

    /// Rollback entries for one entity, newest first.
    async fn rollbacks_for_entity(
        &self,
        kind: EntityKind,
        entity_id: Uuid,
    ) -> Result<Vec<ChangeRecord>>;

    /// The tenant's earliest row — drives retention scoring.
    async fn oldest_for_tenant(&self, tenant_id: Option<Uuid>) -> Result<Option<ChangeRecord>>;

    /// Total rows for a tenant in a window.
    async fn count_in_window(&self, tenant_id: Option<Uuid>, window: TimeWindow) -> Result<i64>;

    /// Rows carrying an actor and both state snapshots — the numerator
    /// of audit-trail completeness.
    async fn count_complete_in_window(
        &self,
        tenant_id: Option<Uuid>,
        window: TimeWindow,
    ) -> Result<i64>;

    /// Rows without actor attribution — surfaced as unauthorized-change
    /// violations.
    async fn count_unattributed_in_window(
        &self,
        tenant_id: Option<Uuid>,
        window: TimeWindow,
    ) -> Result<i64>;
}

/// Live-state access for one audited entity kind.
///
/// One implementation per `EntityKind`, selected through `EntityDirectory`.
/// Dependent counts feed rollback impact analysis: active configurations
/// under a utility service, meters with recent readings under a
/// configuration. A kind without the concept returns 0.
#[async_trait]
pub trait EntityRepository: Send + Sync {
    fn kind(&self) -> EntityKind;

    /// Current field map of the entity, or None if it no longer exists.
    async fn current_state(&self, entity_id: Uuid) -> Result<Option<StateMap>>;

    async fn count_active_dependents(&self, entity_id: Uuid) -> Result<i64>;

    async fn count_recent_reading_meters(
        &self,
        entity_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64>;

    /// Entities of this kind within a tenant whose service type matches
    /// one of `service_types`. Drives the tenant-stream filter.
    async fn ids_for_service_types(
        &self,
        tenant_id: Uuid,
        service_types: &[String],
    ) -> Result<Vec<Uuid>>;
}

/// Tagged registry of entity repositories — the explicit replacement for
/// resolving a repository from a stored type name at runtime.
#[derive(Clone, Default)]
pub struct EntityDirectory {
    repos: HashMap<EntityKind, Arc<dyn EntityRepository>>,
}

impl EntityDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, repo: Arc<dyn EntityRepository>) -> Self {
        self.repos.insert(repo.kind(), repo);
        self
    }

    pub fn get(&self, kind: EntityKind) -> Result<&Arc<dyn EntityRepository>> {
        self.repos
            .get(&kind)
            .ok_or_else(|| AuditError::InvalidInput(format!("no repository for {kind}")))
    }
}

/// The single write path of the engine.
///
/// `execute` must run the staleness re-check, the entity mutation and the
/// ledger append inside one atomic transaction, serialized per entity
/// (row lock or advisory lock on `(entity_kind, entity_id)`). Two
/// concurrent rollbacks of the same change cannot both succeed: the
/// second observes the first's ledger row and fails with `StaleRollback`.
/// On any failure the transaction rolls back whole — the entity is never
/// left mutated without its ledger row, nor the reverse.
#[async_trait]
pub trait RollbackStore: Send + Sync {
    async fn execute(&self, apply: RollbackApply) -> Result<AppliedRollback>;
}

/// Fire-and-forget delivery of rollback notifications. Callers log
/// failures at warn and never propagate them.
#[async_trait]
pub trait RollbackNotifier: Send + Sync {
    async fn notify(&self, notification: &RollbackNotification) -> Result<()>;
}

/// Notifier that only traces the payload. The default wiring when no
/// delivery channel is configured.
pub struct TracingNotifier;

#[async_trait]
impl RollbackNotifier for TracingNotifier {
    async fn notify(&self, notification: &RollbackNotification) -> Result<()> {
        tracing::info!(
            rollback_id = %notification.rollback_id,
            entity_kind = %notification.entity_kind,
            entity_id = %notification.entity_id,
            "rollback notification"
        );
        Ok(())
    }
}

/// Externally collected performance signals. Opaque inputs: the engine
/// aggregates them, it does not compute them.
#[async_trait]
pub trait PerformanceMetricsSource: Send + Sync {
    async fn collect(
        &self,
        tenant_id: Option<Uuid>,
        window: TimeWindow,
    ) -> Result<PerformanceMetrics>;
}

/// Externally assessed compliance sub-scores (security posture, data
/// quality, regulatory nuances) injected into the compliance
/// aggregation — not derivable from the ledger, so not computed here.
#[async_trait]
pub trait ComplianceSignalSource: Send + Sync {
    async fn security_compliance(
        &self,
        tenant_id: Option<Uuid>,
        window: TimeWindow,
    ) -> Result<Scorecard>;

    async fn data_quality(
        &self,
        tenant_id: Option<Uuid>,
        window: TimeWindow,
    ) -> Result<Scorecard>;

    async fn regulatory_compliance(
        &self,
        tenant_id: Option<Uuid>,
        window: TimeWindow,
    ) -> Result<Scorecard>;
}
