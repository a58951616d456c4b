//! Postgres implementations of the audit_core port traits.
//!
//! Each adapter is a newtype wrapping PgPool. All SQL is runtime-checked
//! (sqlx::query, not sqlx::query!) to avoid a compile-time DB requirement.
//! Schema: `audit.change_log` plus the minimal entity tables the
//! repositories and impact probes query (see migrations/).

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use audit_core::error::AuditError;
use audit_core::ports::{ChangeLogStore, EntityRepository, Result, RollbackStore};
use audit_core::types::*;

use crate::sqlx_types::PgChangeRow;

const CHANGE_COLUMNS: &str = "id, seq, entity_kind, entity_id, tenant_id, actor_id, event, \
     old_state, new_state, occurred_at, note, metadata";

fn into_record(row: PgChangeRow) -> Result<ChangeRecord> {
    row.try_into()
        .map_err(|e: String| AuditError::Internal(anyhow!(e)))
}

fn into_records(rows: Vec<PgChangeRow>) -> Result<Vec<ChangeRecord>> {
    rows.into_iter().map(into_record).collect()
}

fn entity_table(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::UtilityService => "audit.utility_services",
        EntityKind::ServiceConfiguration => "audit.service_configurations",
    }
}

// ── PgChangeLogStore ──────────────────────────────────────────

/// Postgres-backed append-only change ledger.
pub struct PgChangeLogStore {
    pool: PgPool,
}

impl PgChangeLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChangeLogStore for PgChangeLogStore {
    async fn append(&self, record: NewChangeRecord) -> Result<ChangeRecord> {
        let row = sqlx::query_as::<_, PgChangeRow>(&format!(
            r#"
            INSERT INTO audit.change_log (
                entity_kind, entity_id, tenant_id, actor_id, event,
                old_state, new_state, note, metadata
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {CHANGE_COLUMNS}
            "#,
        ))
        .bind(record.entity_kind.as_str())
        .bind(record.entity_id)
        .bind(record.tenant_id)
        .bind(record.actor_id)
        .bind(record.event.as_str())
        .bind(record.old_state.map(Value::Object))
        .bind(record.new_state.map(Value::Object))
        .bind(&record.note)
        .bind(&record.metadata)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        into_record(row)
    }

    async fn get(&self, change_id: Uuid) -> Result<Option<ChangeRecord>> {
        let row = sqlx::query_as::<_, PgChangeRow>(&format!(
            "SELECT {CHANGE_COLUMNS} FROM audit.change_log WHERE id = $1",
        ))
        .bind(change_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        row.map(into_record).transpose()
    }

    async fn changes_for_entity(
        &self,
        kind: EntityKind,
        entity_id: Uuid,
        tenant_id: Option<Uuid>,
        window: Option<TimeWindow>,
    ) -> Result<Vec<ChangeRecord>> {
        let rows = sqlx::query_as::<_, PgChangeRow>(&format!(
            r#"
            SELECT {CHANGE_COLUMNS}
            FROM audit.change_log
            WHERE entity_kind = $1
              AND entity_id = $2
              AND ($3::uuid IS NULL OR tenant_id = $3)
              AND ($4::timestamptz IS NULL OR occurred_at >= $4)
              AND ($5::timestamptz IS NULL OR occurred_at <= $5)
            ORDER BY occurred_at DESC, seq DESC
            "#,
        ))
        .bind(kind.as_str())
        .bind(entity_id)
        .bind(tenant_id)
        .bind(window.map(|w| w.start))
        .bind(window.map(|w| w.end))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        into_records(rows)
    }

    async fn changes_for_tenant(
        &self,
        tenant_id: Option<Uuid>,
        window: TimeWindow,
        kinds: &[EntityKind],
    ) -> Result<Vec<ChangeRecord>> {
        let kind_names: Vec<String> = kinds.iter().map(|k| k.as_str().to_string()).collect();
        let rows = sqlx::query_as::<_, PgChangeRow>(&format!(
            r#"
            SELECT {CHANGE_COLUMNS}
            FROM audit.change_log
            WHERE ($1::uuid IS NULL OR tenant_id = $1)
              AND occurred_at >= $2
              AND occurred_at <= $3
              AND entity_kind = ANY($4)
            ORDER BY occurred_at DESC, seq DESC
            "#,
        ))
        .bind(tenant_id)
        .bind(window.start)
        .bind(window.end)
        .bind(&kind_names)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        into_records(rows)
    }

    async fn has_later_change(
        &self,
        kind: EntityKind,
        entity_id: Uuid,
        occurred_at: DateTime<Utc>,
        seq: i64,
    ) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM audit.change_log
                WHERE entity_kind = $1
                  AND entity_id = $2
                  AND (occurred_at, seq) > ($3, $4)
            )
            "#,
        )
        .bind(kind.as_str())
        .bind(entity_id)
        .bind(occurred_at)
        .bind(seq)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(exists)
    }

    async fn rollbacks_for_entity(
        &self,
        kind: EntityKind,
        entity_id: Uuid,
    ) -> Result<Vec<ChangeRecord>> {
        let rows = sqlx::query_as::<_, PgChangeRow>(&format!(
            r#"
            SELECT {CHANGE_COLUMNS}
            FROM audit.change_log
            WHERE entity_kind = $1
              AND entity_id = $2
              AND event = 'rollback'
            ORDER BY occurred_at DESC, seq DESC
            "#,
        ))
        .bind(kind.as_str())
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        into_records(rows)
    }

    async fn oldest_for_tenant(&self, tenant_id: Option<Uuid>) -> Result<Option<ChangeRecord>> {
        let row = sqlx::query_as::<_, PgChangeRow>(&format!(
            r#"
            SELECT {CHANGE_COLUMNS}
            FROM audit.change_log
            WHERE ($1::uuid IS NULL OR tenant_id = $1)
            ORDER BY occurred_at ASC, seq ASC
            LIMIT 1
            "#,
        ))
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        row.map(into_record).transpose()
    }

    async fn count_in_window(&self, tenant_id: Option<Uuid>, window: TimeWindow) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM audit.change_log
            WHERE ($1::uuid IS NULL OR tenant_id = $1)
              AND occurred_at >= $2 AND occurred_at <= $3
            "#,
        )
        .bind(tenant_id)
        .bind(window.start)
        .bind(window.end)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(count)
    }

    async fn count_complete_in_window(
        &self,
        tenant_id: Option<Uuid>,
        window: TimeWindow,
    ) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM audit.change_log
            WHERE ($1::uuid IS NULL OR tenant_id = $1)
              AND occurred_at >= $2 AND occurred_at <= $3
              AND actor_id IS NOT NULL
              AND old_state IS NOT NULL
              AND new_state IS NOT NULL
            "#,
        )
        .bind(tenant_id)
        .bind(window.start)
        .bind(window.end)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(count)
    }

    async fn count_unattributed_in_window(
        &self,
        tenant_id: Option<Uuid>,
        window: TimeWindow,
    ) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM audit.change_log
            WHERE ($1::uuid IS NULL OR tenant_id = $1)
              AND occurred_at >= $2 AND occurred_at <= $3
              AND actor_id IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(window.start)
        .bind(window.end)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(count)
    }
}

// ── Entity repositories ───────────────────────────────────────

/// Postgres-backed live state for utility services.
pub struct PgUtilityServiceRepo {
    pool: PgPool,
}

impl PgUtilityServiceRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn fetch_state(pool: &PgPool, table: &str, entity_id: Uuid) -> Result<Option<StateMap>> {
    let state = sqlx::query_scalar::<_, Value>(&format!(
        "SELECT state FROM {table} WHERE id = $1",
    ))
    .bind(entity_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| anyhow!(e))?;
    match state {
        None => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(other) => Err(AuditError::Internal(anyhow!(
            "state column is not an object: {other}"
        ))),
    }
}

#[async_trait]
impl EntityRepository for PgUtilityServiceRepo {
    fn kind(&self) -> EntityKind {
        EntityKind::UtilityService
    }

    async fn current_state(&self, entity_id: Uuid) -> Result<Option<StateMap>> {
        fetch_state(&self.pool, "audit.utility_services", entity_id).await
    }

    async fn count_active_dependents(&self, entity_id: Uuid) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM audit.service_configurations
            WHERE utility_service_id = $1 AND is_active
            "#,
        )
        .bind(entity_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(count)
    }

    async fn count_recent_reading_meters(
        &self,
        _entity_id: Uuid,
        _since: DateTime<Utc>,
    ) -> Result<i64> {
        // Meter readings hang off configurations, not services.
        Ok(0)
    }

    async fn ids_for_service_types(
        &self,
        tenant_id: Uuid,
        service_types: &[String],
    ) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM audit.utility_services
            WHERE tenant_id = $1 AND service_type = ANY($2)
            ORDER BY id
            "#,
        )
        .bind(tenant_id)
        .bind(service_types)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(ids)
    }
}

/// Postgres-backed live state for service configurations.
pub struct PgServiceConfigurationRepo {
    pool: PgPool,
}

impl PgServiceConfigurationRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EntityRepository for PgServiceConfigurationRepo {
    fn kind(&self) -> EntityKind {
        EntityKind::ServiceConfiguration
    }

    async fn current_state(&self, entity_id: Uuid) -> Result<Option<StateMap>> {
        fetch_state(&self.pool, "audit.service_configurations", entity_id).await
    }

    async fn count_active_dependents(&self, _entity_id: Uuid) -> Result<i64> {
        Ok(0)
    }

    async fn count_recent_reading_meters(
        &self,
        entity_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(DISTINCT meter_id) FROM audit.meter_readings
            WHERE service_configuration_id = $1 AND recorded_at > $2
            "#,
        )
        .bind(entity_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(count)
    }

    async fn ids_for_service_types(
        &self,
        tenant_id: Uuid,
        service_types: &[String],
    ) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT c.id
            FROM audit.service_configurations c
            JOIN audit.utility_services s ON s.id = c.utility_service_id
            WHERE c.tenant_id = $1 AND s.service_type = ANY($2)
            ORDER BY c.id
            "#,
        )
        .bind(tenant_id)
        .bind(service_types)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(ids)
    }
}

// ── PgRollbackStore ───────────────────────────────────────────

/// Atomic rollback execution: advisory lock, staleness re-check, entity
/// mutation and ledger append in one transaction. Any error rolls the
/// whole transaction back — the entity is never left mutated without its
/// ledger row.
pub struct PgRollbackStore {
    pool: PgPool,
}

impl PgRollbackStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RollbackStore for PgRollbackStore {
    async fn execute(&self, apply: RollbackApply) -> Result<AppliedRollback> {
        let source = &apply.source;
        let table = entity_table(source.entity_kind);

        let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;

        // Serialize concurrent rollbacks of the same entity. Released
        // when the transaction commits or rolls back.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("{}:{}", source.entity_kind, source.entity_id))
            .execute(&mut *tx)
            .await
            .map_err(|e| anyhow!(e))?;

        // Staleness re-check under the lock: the source change must
        // still be the most recent one for the entity.
        let later = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM audit.change_log
                WHERE entity_kind = $1
                  AND entity_id = $2
                  AND (occurred_at, seq) > ($3, $4)
            )
            "#,
        )
        .bind(source.entity_kind.as_str())
        .bind(source.entity_id)
        .bind(source.occurred_at)
        .bind(source.seq)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| anyhow!(e))?;

        if later {
            return Err(AuditError::StaleRollback(format!(
                "change {} is no longer the most recent for {} {}",
                source.id, source.entity_kind, source.entity_id
            )));
        }

        let current = sqlx::query_scalar::<_, Value>(&format!(
            "SELECT state FROM {table} WHERE id = $1 FOR UPDATE",
        ))
        .bind(source.entity_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| anyhow!(e))?;

        let Some(Value::Object(before)) = current else {
            return Err(AuditError::NotFound(format!(
                "{} {}",
                source.entity_kind, source.entity_id
            )));
        };

        let mut restored = before.clone();
        for (field, value) in &apply.proposed_state {
            restored.insert(field.clone(), value.clone());
        }

        let updated = sqlx::query(&format!(
            "UPDATE {table} SET state = $2, updated_at = now() WHERE id = $1",
        ))
        .bind(source.entity_id)
        .bind(Value::Object(restored.clone()))
        .execute(&mut *tx)
        .await
        .map_err(|e| anyhow!(e))?;

        if updated.rows_affected() == 0 {
            return Err(AuditError::Transaction(format!(
                "entity {} vanished during rollback",
                source.entity_id
            )));
        }

        let row = sqlx::query_as::<_, PgChangeRow>(&format!(
            r#"
            INSERT INTO audit.change_log (
                entity_kind, entity_id, tenant_id, actor_id, event,
                old_state, new_state, note, metadata
            ) VALUES ($1, $2, $3, $4, 'rollback', $5, $6, $7, $8)
            RETURNING {CHANGE_COLUMNS}
            "#,
        ))
        .bind(source.entity_kind.as_str())
        .bind(source.entity_id)
        .bind(source.tenant_id)
        .bind(apply.actor_id)
        .bind(Value::Object(before))
        .bind(Value::Object(restored.clone()))
        .bind(&apply.note)
        .bind(&apply.metadata)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| anyhow!(e))?;

        tx.commit().await.map_err(|e| anyhow!(e))?;

        Ok(AppliedRollback {
            record: into_record(row)?,
            restored_state: restored,
        })
    }
}
