use std::collections::HashMap;

use rust_decimal::Decimal;
use uuid::Uuid;

use super::allocator::{self, EditAdjustment};
use super::restrictions::RestrictionReport;
use crate::dto::usage::{
    PreviewIssue, PreviewIssueCode, PreviewLine, UsageAllocation, UsagePreview,
};
use crate::entities::stock_lot;
use crate::errors::ServiceError;
use crate::policy::PolicyConfig;

/// Projects `allocations` onto `lots` without touching anything.
///
/// Lines drawing on the same lot consume its availability in submission
/// order. Problems are reported as issues, never as errors.
pub fn preview(
    consuming_entity_id: Uuid,
    allocations: &[UsageAllocation],
    lots: &HashMap<Uuid, stock_lot::Model>,
    adjustment: &EditAdjustment,
    policy: &PolicyConfig,
) -> UsagePreview {
    let mut issues = Vec::new();
    let mut lines = Vec::with_capacity(allocations.len());
    let mut consumed: HashMap<Uuid, Decimal> = HashMap::new();

    if allocations.is_empty() {
        issues.push(PreviewIssue {
            code: PreviewIssueCode::NoAllocations,
            line_index: None,
            stock_lot_id: None,
            message: "no allocations were submitted".to_string(),
        });
    }

    for (index, allocation) in allocations.iter().enumerate() {
        let Some(lot) = lots.get(&allocation.stock_lot_id) else {
            issues.push(PreviewIssue {
                code: PreviewIssueCode::LotNotFound,
                line_index: Some(index),
                stock_lot_id: Some(allocation.stock_lot_id),
                message: format!("stock lot {} not found", allocation.stock_lot_id),
            });
            lines.push(PreviewLine {
                stock_lot_id: allocation.stock_lot_id,
                resource_name: None,
                requested: allocation.quantity,
                available: Decimal::ZERO,
                remaining: Decimal::ZERO,
                cost_per_unit: Decimal::ZERO,
                line_cost: Decimal::ZERO,
                can_fulfill: false,
            });
            continue;
        };

        let already = consumed.get(&lot.id).copied().unwrap_or_default();
        let available = (allocator::available(lot, adjustment) - already).max(Decimal::ZERO);

        let check = allocator::validate_allocation(
            lot,
            consuming_entity_id,
            None,
            allocation.quantity,
            available,
            &policy.validation,
        )
        .and_then(|()| allocator::line_cost(allocation.quantity, lot.cost_per_unit));

        let (line_cost, can_fulfill) = match check {
            Ok(cost) => {
                *consumed.entry(lot.id).or_default() += allocation.quantity;
                (cost, true)
            }
            Err(err) => {
                issues.push(issue_for(index, lot.id, &err));
                let cost = allocator::line_cost(allocation.quantity, lot.cost_per_unit)
                    .unwrap_or(Decimal::ZERO);
                (cost, false)
            }
        };

        lines.push(PreviewLine {
            stock_lot_id: lot.id,
            resource_name: Some(lot.resource_name.clone()),
            requested: allocation.quantity,
            available,
            remaining: available
                .checked_sub(allocation.quantity)
                .map_or(Decimal::ZERO, |left| left.max(Decimal::ZERO)),
            cost_per_unit: lot.cost_per_unit,
            line_cost,
            can_fulfill,
        });
    }

    let total_quantity = capped_sum(lines.iter().map(|line| line.requested));
    let total_cost = capped_sum(lines.iter().map(|line| line.line_cost));
    let can_fulfill_all = !lines.is_empty() && lines.iter().all(|line| line.can_fulfill);

    UsagePreview {
        lines,
        total_quantity,
        total_cost,
        can_fulfill_all,
        issues,
    }
}

// Saturates instead of overflowing; oversized lines already carry an issue.
fn capped_sum(values: impl Iterator<Item = Decimal>) -> Decimal {
    values
        .fold(Some(Decimal::ZERO), |acc, value| acc.and_then(|sum| sum.checked_add(value)))
        .unwrap_or(Decimal::MAX)
}

fn issue_for(index: usize, lot_id: Uuid, err: &ServiceError) -> PreviewIssue {
    let code = match err {
        ServiceError::InvalidResource(_) => PreviewIssueCode::WrongEntity,
        ServiceError::InsufficientStock { .. } => PreviewIssueCode::InsufficientStock,
        _ => PreviewIssueCode::InvalidQuantity,
    };
    PreviewIssue {
        code,
        line_index: Some(index),
        stock_lot_id: Some(lot_id),
        message: err.to_string(),
    }
}

/// Folds a restriction report into the preview's issue list.
pub fn with_restrictions(mut preview: UsagePreview, report: &RestrictionReport) -> UsagePreview {
    for error in &report.errors {
        preview.issues.push(PreviewIssue {
            code: PreviewIssueCode::RestrictionViolation,
            line_index: None,
            stock_lot_id: None,
            message: error.clone(),
        });
    }
    for warning in &report.warnings {
        preview.issues.push(PreviewIssue {
            code: PreviewIssueCode::RestrictionWarning,
            line_index: None,
            stock_lot_id: None,
            message: warning.clone(),
        });
    }
    if !report.valid {
        preview.can_fulfill_all = false;
    }
    preview
}
