//! Stock usage ledger: listing, planning, preview, commit, edit, delete and
//! reactivation of usage against stock lots.

pub mod allocator;
pub mod audit;
pub mod committer;
pub mod lifecycle;
pub mod previewer;
pub mod reconciler;
pub mod restrictions;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use metrics::counter;
use sea_orm::{
    ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, QueryTrait,
};
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::db::{DbPool, TxnScope};
use crate::dto::usage::{
    AllocationPlan, AllocationPlanRequest, AvailableLot, CommitResult, DeleteResult,
    DeleteUsageParams, ResourceStockGroup, UsagePreview, UsageRequest, UsageTransactionView,
};
use crate::entities::{
    consuming_entity, stock_lot, usage_audit_snapshot, usage_detail, usage_transaction,
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::policy::{EditMode, PolicyConfig, PolicyConfigProvider, PolicyDomain};

use allocator::EditAdjustment;
use lifecycle::UsageLifecycle;
use reconciler::EditReconciler;
use restrictions::RestrictionContext;

/// Service for recording consumption of stock lots
#[derive(Clone)]
pub struct UsageService {
    db: Arc<DbPool>,
    policies: Arc<dyn PolicyConfigProvider>,
    event_sender: Arc<EventSender>,
}

impl UsageService {
    pub fn new(
        db: Arc<DbPool>,
        policies: Arc<dyn PolicyConfigProvider>,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            db,
            policies,
            event_sender,
        }
    }

    async fn policy_for(&self, entity: &consuming_entity::Model, domain: PolicyDomain) -> PolicyConfig {
        self.policies.get_policy(&entity.tenant_id, domain).await
    }

    /// Lists lots with stock left, grouped by resource and in depletion order.
    #[instrument(skip(self))]
    pub async fn list_available_stock_lots(
        &self,
        consuming_entity_id: Uuid,
        resource_filter: Option<Uuid>,
        domain: PolicyDomain,
    ) -> Result<Vec<ResourceStockGroup>, ServiceError> {
        let db = self.db.as_ref();
        let entity = load_entity(db, consuming_entity_id).await?;
        let policy = self.policy_for(&entity, domain).await;

        let mut lots: Vec<stock_lot::Model> = stock_lot::Entity::find()
            .filter(stock_lot::Column::ConsumingEntityId.eq(consuming_entity_id))
            .apply_if(resource_filter, |query, resource_id| {
                query.filter(stock_lot::Column::ResourceId.eq(resource_id))
            })
            .all(db)
            .await?
            .into_iter()
            .filter(|lot| !lot.is_depleted())
            .collect();
        allocator::order_lots(&mut lots, &policy.depletion);

        let mut groups: Vec<ResourceStockGroup> = Vec::new();
        let mut positions: HashMap<Uuid, usize> = HashMap::new();
        for lot in lots {
            let index = *positions.entry(lot.resource_id).or_insert_with(|| {
                groups.push(ResourceStockGroup {
                    resource_id: lot.resource_id,
                    resource_name: lot.resource_name.clone(),
                    unit: lot.unit.clone(),
                    total_available: Default::default(),
                    lots: Vec::new(),
                });
                groups.len() - 1
            });

            let available = lot.remaining();
            let group = &mut groups[index];
            group.total_available += available;
            group.lots.push(AvailableLot {
                id: lot.id,
                received_date: lot.received_date,
                quantity_in: lot.quantity_in,
                quantity_used: lot.quantity_used,
                quantity_mutated: lot.quantity_mutated,
                available,
                cost_per_unit: lot.cost_per_unit,
            });
        }
        groups.sort_by(|a, b| {
            a.resource_name
                .cmp(&b.resource_name)
                .then(a.resource_id.cmp(&b.resource_id))
        });

        Ok(groups)
    }

    /// Looks a transaction up by id, or the latest active one on `date`.
    ///
    /// Lookups by id also return inactive (soft deleted) transactions.
    #[instrument(skip(self))]
    pub async fn get_existing_usage(
        &self,
        consuming_entity_id: Uuid,
        date: Option<NaiveDate>,
        transaction_id: Option<Uuid>,
    ) -> Result<Option<UsageTransactionView>, ServiceError> {
        let db = self.db.as_ref();

        let found = match (transaction_id, date) {
            (Some(id), _) => usage_transaction::Entity::find_by_id(id)
                .filter(usage_transaction::Column::ConsumingEntityId.eq(consuming_entity_id))
                .one(db)
                .await?,
            (None, Some(date)) => usage_transaction::Entity::find()
                .filter(usage_transaction::Column::ConsumingEntityId.eq(consuming_entity_id))
                .filter(usage_transaction::Column::UsageDate.eq(date))
                .filter(usage_transaction::Column::IsActive.eq(true))
                .order_by_desc(usage_transaction::Column::CreatedAt)
                .one(db)
                .await?,
            (None, None) => {
                return Err(ServiceError::ValidationError(
                    "either a date or a transaction id is required".to_string(),
                ))
            }
        };

        match found {
            Some(transaction) => Ok(Some(view(db, transaction).await?)),
            None => Ok(None),
        }
    }

    /// Splits a total across the entity's lots of one resource.
    #[instrument(skip(self, request), fields(resource_id = %request.resource_id))]
    pub async fn plan_allocations(
        &self,
        consuming_entity_id: Uuid,
        request: AllocationPlanRequest,
    ) -> Result<AllocationPlan, ServiceError> {
        let db = self.db.as_ref();
        let entity = load_entity(db, consuming_entity_id).await?;
        let policy = self.policy_for(&entity, request.domain).await;

        let mut lots = stock_lot::Entity::find()
            .filter(stock_lot::Column::ConsumingEntityId.eq(consuming_entity_id))
            .filter(stock_lot::Column::ResourceId.eq(request.resource_id))
            .all(db)
            .await?;
        allocator::order_lots(&mut lots, &policy.depletion);

        let allocations = allocator::plan_distribution(
            request.total_quantity,
            &lots,
            &EditAdjustment::none(),
            &policy,
        )?;

        Ok(AllocationPlan {
            resource_id: request.resource_id,
            total_quantity: request.total_quantity,
            method: policy.depletion.method,
            distribution: policy.depletion.distribution,
            allocations,
        })
    }

    /// Projects a request onto current stock. Business problems come back as
    /// issues; only a missing entity or edit target is an error.
    #[instrument(skip(self, request), fields(consuming_entity_id = %request.consuming_entity_id))]
    pub async fn preview_usage(&self, request: &UsageRequest) -> Result<UsagePreview, ServiceError> {
        let db = self.db.as_ref();
        let entity = load_entity(db, request.consuming_entity_id).await?;
        let policy = self.policy_for(&entity, request.domain).await;

        let editing_id = request.edit_context.as_ref().map(|ctx| ctx.transaction_id);
        let adjustment = match editing_id {
            Some(id) => {
                let original = load_transaction(db, id).await?;
                let details = committer::load_details(db, original.id).await?;
                match policy.edit.mode {
                    EditMode::DirectUpdate => EditAdjustment::for_details(details.iter().filter(|detail| {
                        request
                            .allocations
                            .iter()
                            .any(|a| a.existing_detail_id == Some(detail.id))
                    })),
                    EditMode::DeleteRecreate => EditAdjustment::for_details(&details),
                }
            }
            None => EditAdjustment::none(),
        };

        let lots: HashMap<Uuid, stock_lot::Model> = stock_lot::Entity::find()
            .filter(stock_lot::Column::Id.is_in(request.lot_ids()))
            .all(db)
            .await?
            .into_iter()
            .map(|lot| (lot.id, lot))
            .collect();

        let preview = previewer::preview(entity.id, &request.allocations, &lots, &adjustment, &policy);
        let context = load_restriction_context(db, entity.id, request, editing_id, Utc::now()).await?;
        let report = restrictions::validate(&request.allocations, &context, &policy.restrictions);

        Ok(previewer::with_restrictions(preview, &report))
    }

    /// Commits a usage submission atomically. Requests carrying an edit
    /// context are routed to [`UsageService::edit_usage`].
    #[instrument(skip(self, request), fields(consuming_entity_id = %request.consuming_entity_id))]
    pub async fn commit_usage(&self, request: UsageRequest) -> Result<CommitResult, ServiceError> {
        if request.is_edit() {
            return self.edit_usage(request).await;
        }
        if let Err(err) = request.validate() {
            let err = ServiceError::from(err);
            record_rejection("commit", &err);
            return Err(err);
        }

        let now = Utc::now();
        let scope = TxnScope::begin(&self.db, "commit_usage").await?;
        let result = self.commit_in(scope.txn(), &request, now).await;
        let result = scope.finish(result).await;

        match &result {
            Ok(committed) => {
                counter!("stockledger.usage.committed", 1);
                info!(
                    transaction_id = %committed.transaction_id,
                    total_quantity = %committed.total_quantity,
                    total_cost = %committed.total_cost,
                    "usage committed"
                );
                self.publish(Event::UsageCommitted {
                    transaction_id: committed.transaction_id,
                    consuming_entity_id: request.consuming_entity_id,
                    total_quantity: committed.total_quantity,
                    total_cost: committed.total_cost,
                    line_count: committed.lines.len(),
                    occurred_at: now,
                })
                .await;
            }
            Err(err) => record_rejection("commit", err),
        }
        result
    }

    async fn commit_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        request: &UsageRequest,
        now: DateTime<Utc>,
    ) -> Result<CommitResult, ServiceError> {
        let entity = load_entity(conn, request.consuming_entity_id).await?;
        let policy = self.policy_for(&entity, request.domain).await;

        let context = load_restriction_context(conn, entity.id, request, None, now).await?;
        let warnings =
            restrictions::validate(&request.allocations, &context, &policy.restrictions).into_result()?;
        let state = UsageLifecycle::New.transition(UsageLifecycle::Previewed)?;

        let mut result =
            committer::commit_usage(conn, &entity, request, &policy, None, Vec::new(), now).await?;
        state.transition(UsageLifecycle::Committed)?;

        result.warnings = warnings;
        Ok(result)
    }

    /// Reconciles an existing transaction with the submitted lines.
    #[instrument(skip(self, request), fields(consuming_entity_id = %request.consuming_entity_id))]
    pub async fn edit_usage(&self, request: UsageRequest) -> Result<CommitResult, ServiceError> {
        let Some(edit_context) = request.edit_context.clone() else {
            return Err(ServiceError::ValidationError(
                "edit requests need an edit context".to_string(),
            ));
        };
        if let Err(err) = request.validate() {
            let err = ServiceError::from(err);
            record_rejection("edit", &err);
            return Err(err);
        }

        let now = Utc::now();
        let scope = TxnScope::begin(&self.db, "edit_usage").await?;
        let result = self.edit_in(scope.txn(), &request, edit_context.transaction_id, now).await;
        let result = scope.finish(result).await;

        match result {
            Ok((committed, mode)) => {
                counter!("stockledger.usage.edited", 1, "mode" => mode.to_string());
                self.publish(Event::UsageEdited {
                    original_transaction_id: edit_context.transaction_id,
                    transaction_id: committed.transaction_id,
                    mode,
                    occurred_at: now,
                })
                .await;
                Ok(committed)
            }
            Err(err) => {
                record_rejection("edit", &err);
                Err(err)
            }
        }
    }

    async fn edit_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        request: &UsageRequest,
        transaction_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(CommitResult, EditMode), ServiceError> {
        let entity = load_entity(conn, request.consuming_entity_id).await?;
        let policy = self.policy_for(&entity, request.domain).await;
        let original = load_transaction(conn, transaction_id).await?;

        let context = load_restriction_context(conn, entity.id, request, Some(original.id), now).await?;
        let warnings =
            restrictions::validate(&request.allocations, &context, &policy.restrictions).into_result()?;

        let mut reconciler = EditReconciler::new(conn, &policy, now, UsageLifecycle::Committed);
        let mut result = reconciler.edit(&entity, original, request).await?;
        result.warnings = warnings;
        Ok((result, policy.edit.mode))
    }

    /// Deletes a transaction and gives its stock back. The mode falls back to
    /// the policy's delete mode.
    #[instrument(skip(self, params))]
    pub async fn delete_usage(
        &self,
        transaction_id: Uuid,
        params: DeleteUsageParams,
    ) -> Result<DeleteResult, ServiceError> {
        let now = Utc::now();
        let scope = TxnScope::begin(&self.db, "delete_usage").await?;
        let result = self.delete_in(scope.txn(), transaction_id, &params, now).await;
        let result = scope.finish(result).await;

        match &result {
            Ok(deleted) => {
                counter!("stockledger.usage.deleted", 1, "mode" => deleted.mode.to_string());
                info!(
                    transaction_id = %transaction_id,
                    mode = %deleted.mode,
                    restored_quantity = %deleted.restored_quantity,
                    "usage deleted"
                );
                self.publish(Event::UsageDeleted {
                    transaction_id,
                    mode: deleted.mode,
                    reason: params.reason.clone(),
                    occurred_at: now,
                })
                .await;
            }
            Err(err) => record_rejection("delete", err),
        }
        result
    }

    async fn delete_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        transaction_id: Uuid,
        params: &DeleteUsageParams,
        now: DateTime<Utc>,
    ) -> Result<DeleteResult, ServiceError> {
        let transaction = load_transaction(conn, transaction_id).await?;
        let entity = load_entity(conn, transaction.consuming_entity_id).await?;
        let domain = transaction.typed_metadata()?.domain;
        let policy = self.policy_for(&entity, domain).await;
        let mode = params.mode.unwrap_or(policy.edit.delete_mode);

        let mut reconciler = EditReconciler::new(conn, &policy, now, UsageLifecycle::Committed);
        reconciler
            .delete(transaction, mode, params.reason.clone(), params.actor.clone())
            .await
    }

    /// Undoes a soft delete.
    #[instrument(skip(self))]
    pub async fn reactivate_usage(
        &self,
        transaction_id: Uuid,
        actor: Option<String>,
    ) -> Result<UsageTransactionView, ServiceError> {
        let now = Utc::now();
        let scope = TxnScope::begin(&self.db, "reactivate_usage").await?;
        let result = self.reactivate_in(scope.txn(), transaction_id, actor, now).await;
        let result = scope.finish(result).await;

        match &result {
            Ok(_) => {
                counter!("stockledger.usage.reactivated", 1);
                self.publish(Event::UsageReactivated {
                    transaction_id,
                    occurred_at: now,
                })
                .await;
            }
            Err(err) => record_rejection("reactivate", err),
        }
        result
    }

    async fn reactivate_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        transaction_id: Uuid,
        actor: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<UsageTransactionView, ServiceError> {
        let transaction = load_transaction(conn, transaction_id).await?;
        let entity = load_entity(conn, transaction.consuming_entity_id).await?;
        let domain = transaction.typed_metadata()?.domain;
        let policy = self.policy_for(&entity, domain).await;

        let mut reconciler = EditReconciler::new(conn, &policy, now, UsageLifecycle::Restored);
        let reactivated = reconciler.reactivate(transaction, actor).await?;
        view(conn, reactivated).await
    }

    /// Audit snapshots recorded for a transaction, oldest first.
    pub async fn audit_history(
        &self,
        transaction_id: Uuid,
    ) -> Result<Vec<usage_audit_snapshot::Model>, ServiceError> {
        audit::history(self.db.as_ref(), transaction_id).await
    }

    async fn publish(&self, event: Event) {
        let name = event.name();
        if let Err(e) = self.event_sender.send(event).await {
            warn!(event = name, error = %e, "Failed to publish usage event");
        }
    }
}

fn record_rejection(operation: &'static str, err: &ServiceError) {
    counter!("stockledger.usage.rejected", 1, "operation" => operation, "code" => err.code());
    if err.is_rejection() {
        info!(operation, code = err.code(), error = %err, "usage request rejected");
    } else {
        warn!(operation, code = err.code(), error = %err, "usage request failed");
    }
}

async fn load_entity<C: ConnectionTrait>(
    conn: &C,
    id: Uuid,
) -> Result<consuming_entity::Model, ServiceError> {
    consuming_entity::Entity::find_by_id(id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::not_found("Consuming entity", id))
}

async fn load_transaction<C: ConnectionTrait>(
    conn: &C,
    id: Uuid,
) -> Result<usage_transaction::Model, ServiceError> {
    usage_transaction::Entity::find_by_id(id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::not_found("Usage transaction", id))
}

async fn view<C: ConnectionTrait>(
    conn: &C,
    transaction: usage_transaction::Model,
) -> Result<UsageTransactionView, ServiceError> {
    let metadata = transaction.typed_metadata()?;
    let details = committer::load_details(conn, transaction.id).await?;
    Ok(UsageTransactionView::new(transaction, metadata, details))
}

/// Gathers what the restriction rules need about the entity's other usage on
/// the request's date. The transaction being edited is left out of the counts.
async fn load_restriction_context<C: ConnectionTrait>(
    conn: &C,
    consuming_entity_id: Uuid,
    request: &UsageRequest,
    editing_transaction_id: Option<Uuid>,
    now: DateTime<Utc>,
) -> Result<RestrictionContext, ServiceError> {
    let same_day = usage_transaction::Entity::find()
        .filter(usage_transaction::Column::ConsumingEntityId.eq(consuming_entity_id))
        .filter(usage_transaction::Column::UsageDate.eq(request.usage_date))
        .filter(usage_transaction::Column::IsActive.eq(true))
        .all(conn)
        .await?;
    let same_day_transactions: Vec<Uuid> = same_day.iter().map(|tx| tx.id).collect();

    let counted: Vec<Uuid> = same_day_transactions
        .iter()
        .copied()
        .filter(|id| Some(*id) != editing_transaction_id)
        .collect();
    let same_day_details = if counted.is_empty() {
        Vec::new()
    } else {
        usage_detail::Entity::find()
            .filter(usage_detail::Column::UsageTransactionId.is_in(counted))
            .all(conn)
            .await?
    };
    let mut same_day_lot_allocations: HashMap<Uuid, usize> = HashMap::new();
    for detail in &same_day_details {
        *same_day_lot_allocations.entry(detail.stock_lot_id).or_insert(0) += 1;
    }

    let last_transaction_at = usage_transaction::Entity::find()
        .filter(usage_transaction::Column::ConsumingEntityId.eq(consuming_entity_id))
        .filter(usage_transaction::Column::IsActive.eq(true))
        .apply_if(editing_transaction_id, |query, id| {
            query.filter(usage_transaction::Column::Id.ne(id))
        })
        .order_by_desc(usage_transaction::Column::CreatedAt)
        .one(conn)
        .await?
        .map(|tx| tx.created_at);

    let lot_received_dates = stock_lot::Entity::find()
        .filter(stock_lot::Column::Id.is_in(request.lot_ids()))
        .all(conn)
        .await?
        .into_iter()
        .map(|lot| (lot.id, lot.received_date))
        .collect();

    Ok(RestrictionContext {
        now,
        usage_date: request.usage_date,
        editing_transaction_id,
        same_day_transactions,
        same_day_lot_allocations,
        same_day_allocation_count: same_day_details.len(),
        last_transaction_at,
        lot_received_dates,
    })
}
