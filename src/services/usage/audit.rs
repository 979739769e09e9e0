use chrono::{DateTime, Utc};
use sea_orm::{ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set};
use tracing::debug;
use uuid::Uuid;

use crate::dto::usage::{AuditAction, AuditSnapshot, TransactionSnapshot};
use crate::entities::{usage_audit_snapshot, usage_detail, usage_transaction};
use crate::errors::ServiceError;

/// Builds the pre-change copy of a transaction and its details.
pub fn snapshot(
    transaction: &usage_transaction::Model,
    details: &[usage_detail::Model],
    action: AuditAction,
    reason: Option<String>,
    actor: Option<String>,
    captured_at: DateTime<Utc>,
) -> AuditSnapshot {
    AuditSnapshot {
        action,
        reason,
        actor,
        captured_at,
        transaction: TransactionSnapshot::from(transaction),
        details: details.to_vec(),
    }
}

/// Persists a snapshot as an audit row.
pub async fn record<C: ConnectionTrait>(
    conn: &C,
    snapshot: &AuditSnapshot,
) -> Result<usage_audit_snapshot::Model, ServiceError> {
    let original_data = serde_json::json!({
        "transaction": snapshot.transaction,
        "details": snapshot.details,
    });

    let row = usage_audit_snapshot::ActiveModel {
        id: Set(Uuid::new_v4()),
        usage_transaction_id: Set(snapshot.transaction.id),
        action: Set(snapshot.action.to_string()),
        reason: Set(snapshot.reason.clone()),
        actor: Set(snapshot.actor.clone()),
        original_data: Set(original_data),
        captured_at: Set(snapshot.captured_at),
    }
    .insert(conn)
    .await?;

    debug!(
        transaction_id = %snapshot.transaction.id,
        action = %snapshot.action,
        details = snapshot.details.len(),
        "audit snapshot recorded"
    );
    Ok(row)
}

/// Audit rows for a transaction, oldest first.
pub async fn history<C: ConnectionTrait>(
    conn: &C,
    transaction_id: Uuid,
) -> Result<Vec<usage_audit_snapshot::Model>, ServiceError> {
    Ok(usage_audit_snapshot::Entity::find()
        .filter(usage_audit_snapshot::Column::UsageTransactionId.eq(transaction_id))
        .order_by_asc(usage_audit_snapshot::Column::CapturedAt)
        .all(conn)
        .await?)
}
