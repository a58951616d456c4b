//! sqlx row mirrors of the core types.
//!
//! Core types stay sqlx-free; these structs carry the `FromRow` derives
//! and convert with `TryFrom`, failing on unknown enum strings or
//! non-object state columns.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use audit_core::types::{ChangeEvent, ChangeRecord, EntityKind, StateMap};

#[derive(Debug, sqlx::FromRow)]
pub struct PgChangeRow {
    pub id: Uuid,
    pub seq: i64,
    pub entity_kind: String,
    pub entity_id: Uuid,
    pub tenant_id: Uuid,
    pub actor_id: Option<Uuid>,
    pub event: String,
    pub old_state: Option<serde_json::Value>,
    pub new_state: Option<serde_json::Value>,
    pub occurred_at: DateTime<Utc>,
    pub note: Option<String>,
    pub metadata: serde_json::Value,
}

fn state_column(value: Option<serde_json::Value>) -> Result<Option<StateMap>, String> {
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Object(map)) => Ok(Some(map)),
        Some(other) => Err(format!("state column is not an object: {other}")),
    }
}

impl TryFrom<PgChangeRow> for ChangeRecord {
    type Error = String;

    fn try_from(row: PgChangeRow) -> Result<Self, Self::Error> {
        Ok(ChangeRecord {
            id: row.id,
            entity_kind: EntityKind::from_str(&row.entity_kind)
                .ok_or_else(|| format!("unknown entity_kind: {}", row.entity_kind))?,
            entity_id: row.entity_id,
            tenant_id: row.tenant_id,
            actor_id: row.actor_id,
            event: ChangeEvent::from_str(&row.event)
                .ok_or_else(|| format!("unknown event: {}", row.event))?,
            old_state: state_column(row.old_state)?,
            new_state: state_column(row.new_state)?,
            occurred_at: row.occurred_at,
            seq: row.seq,
            note: row.note,
            metadata: row.metadata,
        })
    }
}
