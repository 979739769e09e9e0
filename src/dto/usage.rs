use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;
use validator::Validate;

use crate::entities::{usage_detail, usage_transaction};
use crate::policy::{
    DeleteMode, DepletionMethod, EditMode, PolicyDomain, PolicySnapshot, QuantityDistribution,
};

/// A usage submission: a new commit, or an edit when `edit_context` is set.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct UsageRequest {
    pub consuming_entity_id: Uuid,
    pub usage_date: NaiveDate,
    #[validate(length(max = 100))]
    pub purpose: Option<String>,
    #[validate(length(max = 500))]
    pub notes: Option<String>,
    #[serde(default)]
    pub domain: PolicyDomain,
    #[validate(length(max = 100))]
    pub actor: Option<String>,
    #[validate(length(min = 1))]
    pub allocations: Vec<UsageAllocation>,
    #[serde(default)]
    pub edit_context: Option<EditContext>,
}

impl UsageRequest {
    pub fn is_edit(&self) -> bool {
        self.edit_context.is_some()
    }

    pub fn lot_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.allocations.iter().map(|a| a.stock_lot_id).collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageAllocation {
    pub stock_lot_id: Uuid,
    pub quantity: Decimal,
    #[serde(default)]
    pub note: Option<String>,
    /// Detail row this line replaces when editing with direct update.
    #[serde(default)]
    pub existing_detail_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditContext {
    pub transaction_id: Uuid,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineResult {
    pub detail_id: Uuid,
    pub stock_lot_id: Uuid,
    pub quantity: Decimal,
    pub cost_per_unit: Decimal,
    pub line_cost: Decimal,
    /// Lot availability right after this line was applied.
    pub remaining_after: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitResult {
    pub transaction_id: Uuid,
    pub total_quantity: Decimal,
    pub total_cost: Decimal,
    pub lines: Vec<LineResult>,
    pub is_update: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes_id: Option<Uuid>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PreviewIssueCode {
    NoAllocations,
    LotNotFound,
    WrongEntity,
    InvalidQuantity,
    InsufficientStock,
    RestrictionViolation,
    RestrictionWarning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewIssue {
    pub code: PreviewIssueCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stock_lot_id: Option<Uuid>,
    pub message: String,
}

impl PreviewIssue {
    /// Warnings never block a commit.
    pub fn is_blocking(&self) -> bool {
        self.code != PreviewIssueCode::RestrictionWarning
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewLine {
    pub stock_lot_id: Uuid,
    pub resource_name: Option<String>,
    pub requested: Decimal,
    pub available: Decimal,
    pub remaining: Decimal,
    pub cost_per_unit: Decimal,
    pub line_cost: Decimal,
    pub can_fulfill: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsagePreview {
    pub lines: Vec<PreviewLine>,
    pub total_quantity: Decimal,
    pub total_cost: Decimal,
    pub can_fulfill_all: bool,
    pub issues: Vec<PreviewIssue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailableLot {
    pub id: Uuid,
    pub received_date: NaiveDate,
    pub quantity_in: Decimal,
    pub quantity_used: Decimal,
    pub quantity_mutated: Decimal,
    pub available: Decimal,
    pub cost_per_unit: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStockGroup {
    pub resource_id: Uuid,
    pub resource_name: String,
    pub unit: String,
    pub total_available: Decimal,
    /// Lots in depletion order.
    pub lots: Vec<AvailableLot>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AllocationPlanRequest {
    pub resource_id: Uuid,
    pub total_quantity: Decimal,
    #[serde(default)]
    pub domain: PolicyDomain,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedAllocation {
    pub stock_lot_id: Uuid,
    pub quantity: Decimal,
    pub available: Decimal,
    pub cost_per_unit: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationPlan {
    pub resource_id: Uuid,
    pub total_quantity: Decimal,
    pub method: DepletionMethod,
    pub distribution: QuantityDistribution,
    pub allocations: Vec<PlannedAllocation>,
}

impl AllocationPlan {
    /// Turns the plan into request lines ready for preview or commit.
    pub fn into_allocations(self) -> Vec<UsageAllocation> {
        self.allocations
            .into_iter()
            .map(|planned| UsageAllocation {
                stock_lot_id: planned.stock_lot_id,
                quantity: planned.quantity,
                note: None,
                existing_detail_id: None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeleteUsageParams {
    /// Falls back to the policy's delete mode.
    pub mode: Option<DeleteMode>,
    pub reason: Option<String>,
    pub actor: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReactivateUsageRequest {
    pub actor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteResult {
    pub transaction_id: Uuid,
    pub mode: DeleteMode,
    pub restored_quantity: Decimal,
    pub restored_cost: Decimal,
    /// False when a hard delete left the parent row in place.
    pub parent_removed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AuditAction {
    Edit,
    SoftDelete,
    HardDelete,
    Reactivate,
}

/// Parent row as it looked when the snapshot was taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionSnapshot {
    pub id: Uuid,
    pub consuming_entity_id: Uuid,
    pub usage_date: NaiveDate,
    pub purpose: Option<String>,
    pub notes: Option<String>,
    pub total_quantity: Decimal,
    pub total_cost: Decimal,
    pub is_active: bool,
    pub supersedes_id: Option<Uuid>,
    pub actor: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&usage_transaction::Model> for TransactionSnapshot {
    fn from(model: &usage_transaction::Model) -> Self {
        Self {
            id: model.id,
            consuming_entity_id: model.consuming_entity_id,
            usage_date: model.usage_date,
            purpose: model.purpose.clone(),
            notes: model.notes.clone(),
            total_quantity: model.total_quantity,
            total_cost: model.total_cost,
            is_active: model.is_active,
            supersedes_id: model.supersedes_id,
            actor: model.actor.clone(),
            created_at: model.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditSnapshot {
    pub action: AuditAction,
    pub reason: Option<String>,
    pub actor: Option<String>,
    pub captured_at: DateTime<Utc>,
    pub transaction: TransactionSnapshot,
    pub details: Vec<usage_detail::Model>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub before: serde_json::Value,
    pub after: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditRecord {
    pub action: AuditAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<EditMode>,
    pub edited_at: DateTime<Utc>,
    pub actor: Option<String>,
    pub reason: Option<String>,
    pub changes: Vec<FieldChange>,
}

/// Typed contents of `usage_transactions.metadata`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageMetadata {
    /// Policy domain the transaction was committed under.
    pub domain: PolicyDomain,
    pub policy: Option<PolicySnapshot>,
    pub edit_history: Vec<EditRecord>,
    /// Set while the transaction is soft deleted.
    pub tombstone: Option<AuditSnapshot>,
}

impl UsageMetadata {
    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageTransactionView {
    pub id: Uuid,
    pub consuming_entity_id: Uuid,
    pub usage_date: NaiveDate,
    pub purpose: Option<String>,
    pub notes: Option<String>,
    pub total_quantity: Decimal,
    pub total_cost: Decimal,
    pub is_active: bool,
    pub supersedes_id: Option<Uuid>,
    pub actor: Option<String>,
    pub metadata: UsageMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub details: Vec<usage_detail::Model>,
}

impl UsageTransactionView {
    pub fn new(
        model: usage_transaction::Model,
        metadata: UsageMetadata,
        details: Vec<usage_detail::Model>,
    ) -> Self {
        Self {
            id: model.id,
            consuming_entity_id: model.consuming_entity_id,
            usage_date: model.usage_date,
            purpose: model.purpose,
            notes: model.notes,
            total_quantity: model.total_quantity,
            total_cost: model.total_cost,
            is_active: model.is_active,
            supersedes_id: model.supersedes_id,
            actor: model.actor,
            metadata,
            created_at: model.created_at,
            updated_at: model.updated_at,
            deleted_at: model.deleted_at,
            details,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExistingUsageQuery {
    pub date: Option<NaiveDate>,
    pub transaction_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StockLotQuery {
    pub resource_id: Option<Uuid>,
    #[serde(default)]
    pub domain: PolicyDomain,
}
