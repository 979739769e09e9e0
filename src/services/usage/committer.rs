//! Ledger writes: lot locking, guarded quantity updates, detail rows and totals.
//!
//! Every function takes the connection of an open transaction; nothing here
//! commits.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::allocator::{self, EditAdjustment};
use crate::dto::usage::{CommitResult, EditRecord, LineResult, UsageAllocation, UsageMetadata, UsageRequest};
use crate::entities::{consuming_entity, stock_lot, usage_detail, usage_transaction};
use crate::errors::ServiceError;
use crate::policy::{PolicyConfig, ValidationThresholds};

pub type LockedLots = HashMap<Uuid, stock_lot::Model>;

/// Loads and row-locks `lot_ids`, always in `received_date, id` order so
/// concurrent writers acquire locks in the same sequence.
pub async fn lock_lots<C: ConnectionTrait>(
    conn: &C,
    lot_ids: &[Uuid],
) -> Result<LockedLots, ServiceError> {
    if lot_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let lots = stock_lot::Entity::find()
        .filter(stock_lot::Column::Id.is_in(lot_ids.iter().copied()))
        .order_by_asc(stock_lot::Column::ReceivedDate)
        .order_by_asc(stock_lot::Column::Id)
        .lock_exclusive()
        .all(conn)
        .await?;

    debug!(requested = lot_ids.len(), locked = lots.len(), "stock lots locked");
    Ok(lots.into_iter().map(|lot| (lot.id, lot)).collect())
}

/// Sets `quantity_used` only if nobody changed it since `lot` was read.
pub async fn write_quantity_used<C: ConnectionTrait>(
    conn: &C,
    lot: &stock_lot::Model,
    new_used: Decimal,
    now: DateTime<Utc>,
) -> Result<stock_lot::Model, ServiceError> {
    if new_used < Decimal::ZERO {
        return Err(ServiceError::InternalError(format!(
            "quantity used of lot {} would become {}",
            lot.id, new_used
        )));
    }
    if new_used + lot.quantity_mutated > lot.quantity_in {
        return Err(ServiceError::InsufficientStock {
            lot_id: Some(lot.id),
            requested: new_used - lot.quantity_used,
            available: lot.remaining(),
        });
    }

    let result = stock_lot::Entity::update_many()
        .col_expr(stock_lot::Column::QuantityUsed, Expr::value(new_used))
        .col_expr(stock_lot::Column::UpdatedAt, Expr::value(Some(now)))
        .filter(stock_lot::Column::Id.eq(lot.id))
        .filter(stock_lot::Column::QuantityUsed.eq(lot.quantity_used))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        warn!(stock_lot_id = %lot.id, "quantity used changed underneath the ledger write");
        return Err(ServiceError::ConcurrencyConflict(lot.id));
    }

    Ok(stock_lot::Model {
        quantity_used: new_used,
        updated_at: Some(now),
        ..lot.clone()
    })
}

/// Inserts one detail per allocation and draws each from its locked lot.
pub async fn apply_lines<C: ConnectionTrait>(
    conn: &C,
    transaction_id: Uuid,
    consuming_entity_id: Uuid,
    allocations: &[UsageAllocation],
    lots: &mut LockedLots,
    thresholds: &ValidationThresholds,
    now: DateTime<Utc>,
) -> Result<Vec<LineResult>, ServiceError> {
    let mut lines = Vec::with_capacity(allocations.len());

    for allocation in allocations {
        let lot = lots
            .get(&allocation.stock_lot_id)
            .ok_or_else(|| ServiceError::not_found("Stock lot", allocation.stock_lot_id))?;

        allocator::validate_allocation(
            lot,
            consuming_entity_id,
            None,
            allocation.quantity,
            lot.remaining(),
            thresholds,
        )?;

        let cost = allocator::line_cost(allocation.quantity, lot.cost_per_unit)?;
        let detail = usage_detail::ActiveModel {
            id: Set(Uuid::new_v4()),
            usage_transaction_id: Set(transaction_id),
            stock_lot_id: Set(lot.id),
            quantity: Set(allocation.quantity),
            cost_per_unit: Set(lot.cost_per_unit),
            line_cost: Set(cost),
            note: Set(allocation.note.clone()),
            created_at: Set(now),
        }
        .insert(conn)
        .await?;

        let updated = write_quantity_used(conn, lot, lot.quantity_used + allocation.quantity, now).await?;
        let remaining_after = updated.remaining();
        lots.insert(updated.id, updated);

        lines.push(LineResult {
            detail_id: detail.id,
            stock_lot_id: detail.stock_lot_id,
            quantity: detail.quantity,
            cost_per_unit: detail.cost_per_unit,
            line_cost: detail.line_cost,
            remaining_after,
        });
    }

    Ok(lines)
}

/// Gives the quantities of `details` back to their lots.
///
/// Returns the quantity and cost the lots actually got back. A lot never
/// drops below zero used, so a line restored against a short lot only counts
/// what was still drawn.
pub async fn restore_details<C: ConnectionTrait>(
    conn: &C,
    details: &[usage_detail::Model],
    lots: &mut LockedLots,
    now: DateTime<Utc>,
) -> Result<(Decimal, Decimal), ServiceError> {
    let mut quantity = Decimal::ZERO;
    let mut cost = Decimal::ZERO;

    for detail in details {
        let lot = lots
            .get(&detail.stock_lot_id)
            .ok_or_else(|| ServiceError::not_found("Stock lot", detail.stock_lot_id))?;

        let new_used = (lot.quantity_used - detail.quantity).max(Decimal::ZERO);
        let restored = lot.quantity_used - new_used;
        if restored < detail.quantity {
            warn!(
                stock_lot_id = %lot.id,
                usage_detail_id = %detail.id,
                %restored,
                expected = %detail.quantity,
                "lot held less than the detail being restored"
            );
        }
        let updated = write_quantity_used(conn, lot, new_used, now).await?;
        lots.insert(updated.id, updated);

        quantity += restored;
        cost += if restored == detail.quantity {
            detail.line_cost
        } else {
            allocator::line_cost(restored, detail.cost_per_unit)?
        };
    }

    Ok((quantity, cost))
}

pub async fn load_details<C: ConnectionTrait>(
    conn: &C,
    transaction_id: Uuid,
) -> Result<Vec<usage_detail::Model>, ServiceError> {
    Ok(usage_detail::Entity::find()
        .filter(usage_detail::Column::UsageTransactionId.eq(transaction_id))
        .order_by_asc(usage_detail::Column::CreatedAt)
        .order_by_asc(usage_detail::Column::Id)
        .all(conn)
        .await?)
}

/// Sums quantity and cost over the stored details of a transaction.
pub async fn detail_totals<C: ConnectionTrait>(
    conn: &C,
    transaction_id: Uuid,
) -> Result<(Decimal, Decimal), ServiceError> {
    let details = load_details(conn, transaction_id).await?;
    Ok(details.iter().fold((Decimal::ZERO, Decimal::ZERO), |(q, c), d| {
        (q + d.quantity, c + d.line_cost)
    }))
}

pub async fn store_totals<C: ConnectionTrait>(
    conn: &C,
    transaction: usage_transaction::Model,
    total_quantity: Decimal,
    total_cost: Decimal,
    now: DateTime<Utc>,
) -> Result<usage_transaction::Model, ServiceError> {
    let mut active: usage_transaction::ActiveModel = transaction.into();
    active.total_quantity = Set(total_quantity);
    active.total_cost = Set(total_cost);
    active.updated_at = Set(Some(now));
    Ok(active.update(conn).await?)
}

/// Adds signed deltas to the entity's running totals, flooring each at zero.
pub async fn adjust_entity_totals<C: ConnectionTrait>(
    conn: &C,
    consuming_entity_id: Uuid,
    quantity_delta: Decimal,
    cost_delta: Decimal,
    now: DateTime<Utc>,
) -> Result<consuming_entity::Model, ServiceError> {
    let entity = consuming_entity::Entity::find_by_id(consuming_entity_id)
        .lock_exclusive()
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::not_found("Consuming entity", consuming_entity_id))?;

    let quantity = (entity.total_quantity_used + quantity_delta).max(Decimal::ZERO);
    let cost = (entity.total_cost_used + cost_delta).max(Decimal::ZERO);

    let mut active: consuming_entity::ActiveModel = entity.into();
    active.total_quantity_used = Set(quantity);
    active.total_cost_used = Set(cost);
    active.updated_at = Set(Some(now));
    Ok(active.update(conn).await?)
}

/// Writes a brand new usage transaction and draws its lines from stock.
///
/// Restrictions must already have been checked by the caller.
#[instrument(
    skip(conn, entity, request, policy, edit_history),
    fields(consuming_entity_id = %entity.id, lines = request.allocations.len())
)]
pub async fn commit_usage<C: ConnectionTrait>(
    conn: &C,
    entity: &consuming_entity::Model,
    request: &UsageRequest,
    policy: &PolicyConfig,
    supersedes_id: Option<Uuid>,
    edit_history: Vec<EditRecord>,
    now: DateTime<Utc>,
) -> Result<CommitResult, ServiceError> {
    let mut lots = lock_lots(conn, &request.lot_ids()).await?;
    allocator::validate_allocations(
        entity.id,
        &request.allocations,
        &lots,
        &EditAdjustment::none(),
        &policy.validation,
    )?;

    let metadata = UsageMetadata {
        domain: request.domain,
        policy: Some(policy.snapshot()),
        edit_history,
        tombstone: None,
    };

    let transaction = usage_transaction::ActiveModel {
        id: Set(Uuid::new_v4()),
        consuming_entity_id: Set(entity.id),
        usage_date: Set(request.usage_date),
        purpose: Set(request.purpose.clone()),
        notes: Set(request.notes.clone()),
        total_quantity: Set(Decimal::ZERO),
        total_cost: Set(Decimal::ZERO),
        is_active: Set(true),
        supersedes_id: Set(supersedes_id),
        actor: Set(request.actor.clone()),
        metadata: Set(metadata.to_json()?),
        created_at: Set(now),
        updated_at: Set(None),
        deleted_at: Set(None),
    }
    .insert(conn)
    .await?;

    let lines = apply_lines(
        conn,
        transaction.id,
        entity.id,
        &request.allocations,
        &mut lots,
        &policy.validation,
        now,
    )
    .await?;

    let total_quantity: Decimal = lines.iter().map(|line| line.quantity).sum();
    let total_cost: Decimal = lines.iter().map(|line| line.line_cost).sum();
    let transaction = store_totals(conn, transaction, total_quantity, total_cost, now).await?;
    adjust_entity_totals(conn, entity.id, total_quantity, total_cost, now).await?;

    debug!(transaction_id = %transaction.id, %total_quantity, %total_cost, "usage transaction written");

    Ok(CommitResult {
        transaction_id: transaction.id,
        total_quantity,
        total_cost,
        lines,
        is_update: false,
        supersedes_id,
        warnings: Vec::new(),
    })
}
