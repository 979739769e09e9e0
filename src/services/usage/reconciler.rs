//! Edit, delete and reactivation of committed usage.
//!
//! The reconciler runs on the connection of an open transaction and walks the
//! [`UsageLifecycle`] as it goes, so a step taken out of order is an error
//! instead of a half-applied edit.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter, Set,
};
use serde::Serialize;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::allocator::{self, EditAdjustment};
use super::audit;
use super::committer::{self, LockedLots};
use super::lifecycle::UsageLifecycle;
use crate::dto::usage::{
    AuditAction, AuditSnapshot, CommitResult, DeleteResult, EditRecord, FieldChange,
    UsageAllocation, UsageRequest,
};
use crate::entities::{consuming_entity, usage_detail, usage_transaction};
use crate::errors::ServiceError;
use crate::policy::{DeleteMode, EditMode, PolicyConfig};

pub struct EditReconciler<'a, C: ConnectionTrait> {
    conn: &'a C,
    policy: &'a PolicyConfig,
    now: DateTime<Utc>,
    state: UsageLifecycle,
}

impl<'a, C: ConnectionTrait> EditReconciler<'a, C> {
    /// `state` is where the transaction currently sits: `Committed` for edits
    /// and deletes, `Restored` for a soft-deleted transaction being reactivated.
    pub fn new(conn: &'a C, policy: &'a PolicyConfig, now: DateTime<Utc>, state: UsageLifecycle) -> Self {
        Self {
            conn,
            policy,
            now,
            state,
        }
    }

    pub fn state(&self) -> UsageLifecycle {
        self.state
    }

    fn advance(&mut self, next: UsageLifecycle) -> Result<(), ServiceError> {
        self.state = self.state.transition(next)?;
        Ok(())
    }

    /// Replaces the lines of `original` with those of `request` using the
    /// policy's edit mode.
    #[instrument(skip_all, fields(transaction_id = %original.id, mode = %self.policy.edit.mode))]
    pub async fn edit(
        &mut self,
        entity: &consuming_entity::Model,
        original: usage_transaction::Model,
        request: &UsageRequest,
    ) -> Result<CommitResult, ServiceError> {
        self.advance(UsageLifecycle::EditRequested)?;

        if !original.is_active {
            return Err(ServiceError::InvalidStateTransition(format!(
                "usage transaction {} is inactive and cannot be edited",
                original.id
            )));
        }
        if original.consuming_entity_id != request.consuming_entity_id {
            return Err(ServiceError::ValidationError(format!(
                "usage transaction {} belongs to consuming entity {}",
                original.id, original.consuming_entity_id
            )));
        }

        let reason = request.edit_context.as_ref().and_then(|ctx| ctx.reason.clone());
        let details = committer::load_details(self.conn, original.id).await?;
        let mode = self.policy.edit.mode;

        let replaced = match mode {
            EditMode::DirectUpdate => matched_details(&details, &request.allocations)?,
            EditMode::DeleteRecreate => details.clone(),
        };
        let adjustment = EditAdjustment::for_details(&replaced);

        let mut lot_ids = request.lot_ids();
        lot_ids.extend(replaced.iter().map(|detail| detail.stock_lot_id));
        lot_ids.sort();
        lot_ids.dedup();
        let mut lots = committer::lock_lots(self.conn, &lot_ids).await?;

        allocator::validate_allocations(
            entity.id,
            &request.allocations,
            &lots,
            &adjustment,
            &self.policy.validation,
        )?;

        let snapshot = audit::snapshot(
            &original,
            &details,
            AuditAction::Edit,
            reason.clone(),
            request.actor.clone(),
            self.now,
        );
        if self.policy.edit.backup_before_edit {
            audit::record(self.conn, &snapshot).await?;
        }

        let result = match mode {
            EditMode::DirectUpdate => {
                self.direct_update(entity, original, &replaced, request, &mut lots, reason)
                    .await?
            }
            EditMode::DeleteRecreate => {
                self.delete_recreate(entity, original, &details, request, snapshot, reason)
                    .await?
            }
        };

        self.advance(UsageLifecycle::Recommitted)?;
        info!(
            transaction_id = %result.transaction_id,
            total_quantity = %result.total_quantity,
            "usage transaction edited"
        );
        Ok(result)
    }

    async fn direct_update(
        &mut self,
        entity: &consuming_entity::Model,
        original: usage_transaction::Model,
        replaced: &[usage_detail::Model],
        request: &UsageRequest,
        lots: &mut LockedLots,
        reason: Option<String>,
    ) -> Result<CommitResult, ServiceError> {
        let (restored_quantity, restored_cost) =
            committer::restore_details(self.conn, replaced, lots, self.now).await?;

        if !replaced.is_empty() {
            usage_detail::Entity::delete_many()
                .filter(usage_detail::Column::Id.is_in(replaced.iter().map(|detail| detail.id)))
                .exec(self.conn)
                .await?;
        }
        self.advance(UsageLifecycle::Restored)?;

        let before = original.clone();
        let mut active: usage_transaction::ActiveModel = original.into();
        active.usage_date = Set(request.usage_date);
        active.purpose = Set(request.purpose.clone());
        active.notes = Set(request.notes.clone());
        active.updated_at = Set(Some(self.now));
        let updated = active.update(self.conn).await?;

        let lines = committer::apply_lines(
            self.conn,
            updated.id,
            entity.id,
            &request.allocations,
            lots,
            &self.policy.validation,
            self.now,
        )
        .await?;

        let (total_quantity, total_cost) = committer::detail_totals(self.conn, updated.id).await?;
        let updated =
            committer::store_totals(self.conn, updated, total_quantity, total_cost, self.now).await?;

        let added_quantity: Decimal = lines.iter().map(|line| line.quantity).sum();
        let added_cost: Decimal = lines.iter().map(|line| line.line_cost).sum();
        committer::adjust_entity_totals(
            self.conn,
            entity.id,
            added_quantity - restored_quantity,
            added_cost - restored_cost,
            self.now,
        )
        .await?;

        let mut metadata = before.typed_metadata()?;
        metadata.edit_history.push(EditRecord {
            action: AuditAction::Edit,
            mode: Some(EditMode::DirectUpdate),
            edited_at: self.now,
            actor: request.actor.clone(),
            reason,
            changes: field_changes(&before, &updated)?,
        });
        let mut active: usage_transaction::ActiveModel = updated.into();
        active.metadata = Set(metadata.to_json()?);
        active.update(self.conn).await?;

        Ok(CommitResult {
            transaction_id: before.id,
            total_quantity,
            total_cost,
            lines,
            is_update: true,
            supersedes_id: before.supersedes_id,
            warnings: Vec::new(),
        })
    }

    async fn delete_recreate(
        &mut self,
        entity: &consuming_entity::Model,
        original: usage_transaction::Model,
        details: &[usage_detail::Model],
        request: &UsageRequest,
        snapshot: AuditSnapshot,
        reason: Option<String>,
    ) -> Result<CommitResult, ServiceError> {
        let delete_mode = self.policy.edit.delete_mode;
        self.remove(&original, details, delete_mode, snapshot).await?;
        self.advance(UsageLifecycle::Restored)?;

        let supersedes_id = match delete_mode {
            DeleteMode::Soft => Some(original.id),
            DeleteMode::Hard => None,
        };
        let history = original.typed_metadata()?.edit_history;

        let mut result = committer::commit_usage(
            self.conn,
            entity,
            request,
            self.policy,
            supersedes_id,
            history,
            self.now,
        )
        .await?;

        let created = usage_transaction::Entity::find_by_id(result.transaction_id)
            .one(self.conn)
            .await?
            .ok_or_else(|| ServiceError::not_found("Usage transaction", result.transaction_id))?;

        let mut metadata = created.typed_metadata()?;
        metadata.edit_history.push(EditRecord {
            action: AuditAction::Edit,
            mode: Some(EditMode::DeleteRecreate),
            edited_at: self.now,
            actor: request.actor.clone(),
            reason,
            changes: field_changes(&original, &created)?,
        });
        let mut active: usage_transaction::ActiveModel = created.into();
        active.metadata = Set(metadata.to_json()?);
        active.update(self.conn).await?;

        result.is_update = true;
        Ok(result)
    }

    /// Removes a transaction on its own, outside of an edit.
    #[instrument(skip_all, fields(transaction_id = %transaction.id, mode = %mode))]
    pub async fn delete(
        &mut self,
        transaction: usage_transaction::Model,
        mode: DeleteMode,
        reason: Option<String>,
        actor: Option<String>,
    ) -> Result<DeleteResult, ServiceError> {
        self.advance(UsageLifecycle::EditRequested)?;

        let details = committer::load_details(self.conn, transaction.id).await?;
        let action = match mode {
            DeleteMode::Soft => AuditAction::SoftDelete,
            DeleteMode::Hard => AuditAction::HardDelete,
        };
        let snapshot = audit::snapshot(&transaction, &details, action, reason, actor, self.now);
        if self.policy.edit.backup_before_edit {
            audit::record(self.conn, &snapshot).await?;
        }

        let result = self.remove(&transaction, &details, mode, snapshot).await?;
        self.advance(UsageLifecycle::Restored)?;
        Ok(result)
    }

    async fn remove(
        &mut self,
        transaction: &usage_transaction::Model,
        details: &[usage_detail::Model],
        mode: DeleteMode,
        snapshot: AuditSnapshot,
    ) -> Result<DeleteResult, ServiceError> {
        match mode {
            DeleteMode::Soft => {
                if !transaction.is_active {
                    return Err(ServiceError::InvalidStateTransition(format!(
                        "usage transaction {} is already inactive",
                        transaction.id
                    )));
                }

                let (restored_quantity, restored_cost) = self.restore(transaction, details).await?;

                let mut metadata = transaction.typed_metadata()?;
                metadata.tombstone = Some(snapshot);
                let mut active: usage_transaction::ActiveModel = transaction.clone().into();
                active.is_active = Set(false);
                active.deleted_at = Set(Some(self.now));
                active.updated_at = Set(Some(self.now));
                active.metadata = Set(metadata.to_json()?);
                active.update(self.conn).await?;

                debug!(transaction_id = %transaction.id, "usage transaction soft deleted");
                Ok(DeleteResult {
                    transaction_id: transaction.id,
                    mode,
                    restored_quantity,
                    restored_cost,
                    parent_removed: false,
                })
            }
            DeleteMode::Hard => {
                if self.policy.edit.validate_references {
                    let referencing = usage_transaction::Entity::find()
                        .filter(usage_transaction::Column::SupersedesId.eq(transaction.id))
                        .count(self.conn)
                        .await?;
                    if referencing > 0 {
                        return Err(ServiceError::Conflict(format!(
                            "usage transaction {} is referenced by {} other transaction(s)",
                            transaction.id, referencing
                        )));
                    }
                }

                // stock of an inactive transaction was already given back
                let (restored_quantity, restored_cost) = if transaction.is_active {
                    self.restore(transaction, details).await?
                } else {
                    (Decimal::ZERO, Decimal::ZERO)
                };

                usage_detail::Entity::delete_many()
                    .filter(usage_detail::Column::UsageTransactionId.eq(transaction.id))
                    .exec(self.conn)
                    .await?;

                let remaining = usage_detail::Entity::find()
                    .filter(usage_detail::Column::UsageTransactionId.eq(transaction.id))
                    .count(self.conn)
                    .await?;
                let parent_removed = remaining == 0;
                if parent_removed {
                    usage_transaction::Entity::delete_by_id(transaction.id)
                        .exec(self.conn)
                        .await?;
                }

                debug!(transaction_id = %transaction.id, parent_removed, "usage transaction hard deleted");
                Ok(DeleteResult {
                    transaction_id: transaction.id,
                    mode,
                    restored_quantity,
                    restored_cost,
                    parent_removed,
                })
            }
        }
    }

    async fn restore(
        &self,
        transaction: &usage_transaction::Model,
        details: &[usage_detail::Model],
    ) -> Result<(Decimal, Decimal), ServiceError> {
        let lot_ids = distinct_lots(details);
        let mut lots = committer::lock_lots(self.conn, &lot_ids).await?;
        let (quantity, cost) = committer::restore_details(self.conn, details, &mut lots, self.now).await?;
        committer::adjust_entity_totals(
            self.conn,
            transaction.consuming_entity_id,
            -quantity,
            -cost,
            self.now,
        )
        .await?;
        Ok((quantity, cost))
    }

    /// Brings a soft-deleted transaction back, drawing its lines from stock again.
    #[instrument(skip_all, fields(transaction_id = %transaction.id))]
    pub async fn reactivate(
        &mut self,
        transaction: usage_transaction::Model,
        actor: Option<String>,
    ) -> Result<usage_transaction::Model, ServiceError> {
        if transaction.is_active || transaction.deleted_at.is_none() {
            return Err(ServiceError::InvalidStateTransition(format!(
                "usage transaction {} is not soft deleted",
                transaction.id
            )));
        }

        let superseding = usage_transaction::Entity::find()
            .filter(usage_transaction::Column::SupersedesId.eq(transaction.id))
            .filter(usage_transaction::Column::IsActive.eq(true))
            .count(self.conn)
            .await?;
        if superseding > 0 {
            return Err(ServiceError::Conflict(format!(
                "usage transaction {} was replaced by an edit",
                transaction.id
            )));
        }

        let details = committer::load_details(self.conn, transaction.id).await?;
        let mut lots = committer::lock_lots(self.conn, &distinct_lots(&details)).await?;

        let mut needed: HashMap<Uuid, Decimal> = HashMap::new();
        for detail in &details {
            *needed.entry(detail.stock_lot_id).or_default() += detail.quantity;
        }
        for lot_id in distinct_lots(&details) {
            let lot = lots
                .get(&lot_id)
                .ok_or_else(|| ServiceError::not_found("Stock lot", lot_id))?;
            let requested = needed.get(&lot_id).copied().unwrap_or_default();
            if requested > lot.remaining() {
                return Err(ServiceError::InsufficientStock {
                    lot_id: Some(lot_id),
                    requested,
                    available: lot.remaining(),
                });
            }
        }

        let snapshot = audit::snapshot(
            &transaction,
            &details,
            AuditAction::Reactivate,
            None,
            actor.clone(),
            self.now,
        );
        if self.policy.edit.backup_before_edit {
            audit::record(self.conn, &snapshot).await?;
        }

        let mut quantity = Decimal::ZERO;
        let mut cost = Decimal::ZERO;
        for detail in &details {
            let lot = lots
                .get(&detail.stock_lot_id)
                .ok_or_else(|| ServiceError::not_found("Stock lot", detail.stock_lot_id))?;
            let updated =
                committer::write_quantity_used(self.conn, lot, lot.quantity_used + detail.quantity, self.now)
                    .await?;
            lots.insert(updated.id, updated);
            quantity += detail.quantity;
            cost += detail.line_cost;
        }
        committer::adjust_entity_totals(self.conn, transaction.consuming_entity_id, quantity, cost, self.now)
            .await?;

        let mut metadata = transaction.typed_metadata()?;
        metadata.tombstone = None;
        metadata.edit_history.push(EditRecord {
            action: AuditAction::Reactivate,
            mode: None,
            edited_at: self.now,
            actor,
            reason: None,
            changes: vec![FieldChange {
                field: "is_active".to_string(),
                before: serde_json::Value::Bool(false),
                after: serde_json::Value::Bool(true),
            }],
        });

        let mut active: usage_transaction::ActiveModel = transaction.into();
        active.is_active = Set(true);
        active.deleted_at = Set(None);
        active.updated_at = Set(Some(self.now));
        active.metadata = Set(metadata.to_json()?);
        let reactivated = active.update(self.conn).await?;

        self.advance(UsageLifecycle::Recommitted)?;
        Ok(reactivated)
    }
}

/// Details addressed by `existing_detail_id`; an id that is not part of the
/// transaction is an error.
fn matched_details(
    details: &[usage_detail::Model],
    allocations: &[UsageAllocation],
) -> Result<Vec<usage_detail::Model>, ServiceError> {
    let by_id: HashMap<Uuid, &usage_detail::Model> =
        details.iter().map(|detail| (detail.id, detail)).collect();
    let mut matched: Vec<usage_detail::Model> = Vec::new();

    for detail_id in allocations.iter().filter_map(|a| a.existing_detail_id) {
        let detail = by_id
            .get(&detail_id)
            .ok_or_else(|| ServiceError::not_found("Usage detail", detail_id))?;
        if !matched.iter().any(|m| m.id == detail_id) {
            matched.push((*detail).clone());
        }
    }
    Ok(matched)
}

fn distinct_lots(details: &[usage_detail::Model]) -> Vec<Uuid> {
    let mut ids: Vec<Uuid> = details.iter().map(|detail| detail.stock_lot_id).collect();
    ids.sort();
    ids.dedup();
    ids
}

fn push_change<T: Serialize + PartialEq>(
    changes: &mut Vec<FieldChange>,
    field: &str,
    before: &T,
    after: &T,
) -> Result<(), ServiceError> {
    if before != after {
        changes.push(FieldChange {
            field: field.to_string(),
            before: serde_json::to_value(before)?,
            after: serde_json::to_value(after)?,
        });
    }
    Ok(())
}

fn field_changes(
    before: &usage_transaction::Model,
    after: &usage_transaction::Model,
) -> Result<Vec<FieldChange>, ServiceError> {
    let mut changes = Vec::new();
    push_change(&mut changes, "usage_date", &before.usage_date, &after.usage_date)?;
    push_change(&mut changes, "purpose", &before.purpose, &after.purpose)?;
    push_change(&mut changes, "notes", &before.notes, &after.notes)?;
    push_change(&mut changes, "total_quantity", &before.total_quantity, &after.total_quantity)?;
    push_change(&mut changes, "total_cost", &before.total_cost, &after.total_cost)?;
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn transaction(total: Decimal) -> usage_transaction::Model {
        usage_transaction::Model {
            id: Uuid::new_v4(),
            consuming_entity_id: Uuid::new_v4(),
            usage_date: NaiveDate::from_ymd_opt(2024, 7, 1).unwrap(),
            purpose: Some("morning feed".into()),
            notes: None,
            total_quantity: total,
            total_cost: total * dec!(2),
            is_active: true,
            supersedes_id: None,
            actor: None,
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
            updated_at: None,
            deleted_at: None,
        }
    }

    fn detail(lot: Uuid, quantity: Decimal) -> usage_detail::Model {
        usage_detail::Model {
            id: Uuid::new_v4(),
            usage_transaction_id: Uuid::new_v4(),
            stock_lot_id: lot,
            quantity,
            cost_per_unit: dec!(1),
            line_cost: quantity,
            note: None,
            created_at: Utc::now(),
        }
    }

    fn allocation(existing: Option<Uuid>) -> UsageAllocation {
        UsageAllocation {
            stock_lot_id: Uuid::new_v4(),
            quantity: dec!(1),
            note: None,
            existing_detail_id: existing,
        }
    }

    #[test]
    fn changes_list_only_differing_fields() {
        let before = transaction(dec!(40));
        let mut after = before.clone();
        after.total_quantity = dec!(25);
        after.total_cost = dec!(50);
        after.notes = Some("corrected".into());

        let changes = field_changes(&before, &after).unwrap();
        let fields: Vec<_> = changes.iter().map(|c| c.field.as_str()).collect();
        assert_eq!(fields, vec!["notes", "total_quantity", "total_cost"]);
        assert_eq!(changes[0].before, serde_json::Value::Null);
    }

    #[test]
    fn scale_differences_are_not_changes() {
        let before = transaction(dec!(40));
        let mut after = before.clone();
        after.total_quantity = dec!(40.0000);
        assert!(field_changes(&before, &after).unwrap().iter().all(|c| c.field != "total_quantity"));
    }

    #[test]
    fn only_addressed_details_are_matched() {
        let lot = Uuid::new_v4();
        let details = vec![detail(lot, dec!(10)), detail(lot, dec!(5))];

        let matched = matched_details(
            &details,
            &[allocation(Some(details[1].id)), allocation(None), allocation(Some(details[1].id))],
        )
        .unwrap();
        assert_eq!(matched, vec![details[1].clone()]);

        assert!(matched_details(&details, &[allocation(None)]).unwrap().is_empty());
    }

    #[test]
    fn foreign_detail_id_is_rejected() {
        let details = vec![detail(Uuid::new_v4(), dec!(10))];
        let result = matched_details(&details, &[allocation(Some(Uuid::new_v4()))]);
        assert_matches!(result, Err(ServiceError::NotFound(_)));
    }
}
