//! Policy-gated submission limits, evaluated before any ledger write.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dto::usage::UsageAllocation;
use crate::errors::ServiceError;
use crate::policy::InputRestrictions;

/// Facts about the entity's existing usage, loaded by the caller.
///
/// Counts exclude the transaction being edited and inactive transactions.
#[derive(Debug, Clone)]
pub struct RestrictionContext {
    pub now: DateTime<Utc>,
    pub usage_date: NaiveDate,
    pub editing_transaction_id: Option<Uuid>,
    /// Active transactions of the entity dated `usage_date`.
    pub same_day_transactions: Vec<Uuid>,
    /// Detail rows per lot on `usage_date`.
    pub same_day_lot_allocations: HashMap<Uuid, usize>,
    /// Detail rows of the entity on `usage_date`.
    pub same_day_allocation_count: usize,
    pub last_transaction_at: Option<DateTime<Utc>>,
    pub lot_received_dates: HashMap<Uuid, NaiveDate>,
}

impl RestrictionContext {
    pub fn is_editing(&self) -> bool {
        self.editing_transaction_id.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestrictionReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl RestrictionReport {
    pub fn into_result(self) -> Result<Vec<String>, ServiceError> {
        if self.valid {
            Ok(self.warnings)
        } else {
            Err(ServiceError::RestrictionViolation {
                errors: self.errors,
            })
        }
    }
}

pub fn validate(
    allocations: &[UsageAllocation],
    ctx: &RestrictionContext,
    rules: &InputRestrictions,
) -> RestrictionReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let editing = ctx.is_editing();

    let mut submitted_per_lot: HashMap<Uuid, usize> = HashMap::new();
    let mut lot_order: Vec<Uuid> = Vec::new();
    for allocation in allocations {
        let count = submitted_per_lot.entry(allocation.stock_lot_id).or_insert(0);
        if *count == 0 {
            lot_order.push(allocation.stock_lot_id);
        }
        *count += 1;
    }

    if rules.one_usage_per_day {
        let others = ctx
            .same_day_transactions
            .iter()
            .filter(|id| Some(**id) != ctx.editing_transaction_id)
            .count();
        if others > 0 {
            errors.push(format!(
                "only one usage transaction is allowed per day; {} already exists on {}",
                others, ctx.usage_date
            ));
        }
    }

    if let Some(limit) = rules.max_lines_per_submission.active() {
        if allocations.len() > limit as usize {
            errors.push(format!(
                "submission has {} lines, the limit is {}",
                allocations.len(),
                limit
            ));
        }
    }

    if !editing {
        if rules.prevent_same_lot_same_day {
            for lot_id in &lot_order {
                if ctx.same_day_lot_allocations.get(lot_id).copied().unwrap_or(0) > 0 {
                    errors.push(format!(
                        "stock lot {} was already used on {}",
                        lot_id, ctx.usage_date
                    ));
                }
            }
        }

        if let Some(limit) = rules.max_allocations_per_lot_per_day.active() {
            for lot_id in &lot_order {
                let existing = ctx.same_day_lot_allocations.get(lot_id).copied().unwrap_or(0);
                let total = existing + submitted_per_lot[lot_id];
                if total > limit as usize {
                    errors.push(format!(
                        "stock lot {} would have {} allocations on {}, the limit is {}",
                        lot_id, total, ctx.usage_date, limit
                    ));
                }
            }
        }

        if let Some(limit) = rules.max_allocations_per_entity_per_day.active() {
            let total = ctx.same_day_allocation_count + allocations.len();
            if total > limit as usize {
                errors.push(format!(
                    "entity would have {} allocations on {}, the limit is {}",
                    total, ctx.usage_date, limit
                ));
            }
        }

        if rules.prevent_duplicate_lots {
            for lot_id in &lot_order {
                if submitted_per_lot[lot_id] > 1 {
                    errors.push(format!("stock lot {} appears more than once", lot_id));
                }
            }
        }

        if let (Some(minutes), Some(last)) = (rules.min_interval_minutes.active(), ctx.last_transaction_at) {
            let elapsed = ctx.now.signed_duration_since(last).num_minutes();
            if elapsed < i64::from(minutes) {
                errors.push(format!(
                    "last usage was {} minutes ago, at least {} minutes must pass",
                    elapsed.max(0),
                    minutes
                ));
            }
        }
    }

    for lot_id in &lot_order {
        let Some(received) = ctx.lot_received_dates.get(lot_id) else {
            continue;
        };
        let age = (ctx.usage_date - *received).num_days();

        if let Some(limit) = rules.stock_age_limit_days.active() {
            if age > i64::from(limit) {
                errors.push(format!(
                    "stock lot {} is {} days old, older than the {} day limit",
                    lot_id, age, limit
                ));
                continue;
            }
        }
        if let Some(threshold) = rules.stock_age_warning_days.active() {
            if age > i64::from(threshold) {
                warnings.push(format!("stock lot {} is {} days old", lot_id, age));
            }
        }
    }

    RestrictionReport {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::LimitRule;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn lot(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn line(n: u128) -> UsageAllocation {
        UsageAllocation {
            stock_lot_id: lot(n),
            quantity: dec!(1),
            note: None,
            existing_detail_id: None,
        }
    }

    fn context() -> RestrictionContext {
        RestrictionContext {
            now: Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap(),
            usage_date: NaiveDate::from_ymd_opt(2024, 6, 10).unwrap(),
            editing_transaction_id: None,
            same_day_transactions: vec![],
            same_day_lot_allocations: HashMap::new(),
            same_day_allocation_count: 0,
            last_transaction_at: None,
            lot_received_dates: HashMap::new(),
        }
    }

    fn no_rules() -> InputRestrictions {
        InputRestrictions {
            one_usage_per_day: false,
            prevent_same_lot_same_day: false,
            max_allocations_per_lot_per_day: LimitRule::disabled(0),
            max_allocations_per_entity_per_day: LimitRule::disabled(0),
            max_lines_per_submission: LimitRule::disabled(0),
            prevent_duplicate_lots: false,
            min_interval_minutes: LimitRule::disabled(0),
            stock_age_limit_days: LimitRule::disabled(0),
            stock_age_warning_days: LimitRule::disabled(0),
        }
    }

    #[test]
    fn everything_disabled_passes() {
        let mut ctx = context();
        ctx.same_day_transactions = vec![Uuid::new_v4()];
        let report = validate(&[line(1), line(1)], &ctx, &no_rules());
        assert!(report.valid);
        assert!(report.into_result().unwrap().is_empty());
    }

    #[test]
    fn one_per_day_ignores_the_edited_transaction() {
        let existing = Uuid::new_v4();
        let rules = InputRestrictions {
            one_usage_per_day: true,
            ..no_rules()
        };
        let mut ctx = context();
        ctx.same_day_transactions = vec![existing];

        assert!(!validate(&[line(1)], &ctx, &rules).valid);

        ctx.editing_transaction_id = Some(existing);
        assert!(validate(&[line(1)], &ctx, &rules).valid);
    }

    #[test]
    fn same_lot_same_day_is_skipped_when_editing() {
        let rules = InputRestrictions {
            prevent_same_lot_same_day: true,
            ..no_rules()
        };
        let mut ctx = context();
        ctx.same_day_lot_allocations.insert(lot(1), 1);

        let report = validate(&[line(1)], &ctx, &rules);
        assert_eq!(report.errors.len(), 1);

        ctx.editing_transaction_id = Some(Uuid::new_v4());
        assert!(validate(&[line(1)], &ctx, &rules).valid);
    }

    #[test]
    fn daily_caps_count_existing_and_submitted() {
        let rules = InputRestrictions {
            max_allocations_per_lot_per_day: LimitRule::enabled(2),
            max_allocations_per_entity_per_day: LimitRule::enabled(3),
            ..no_rules()
        };
        let mut ctx = context();
        ctx.same_day_lot_allocations.insert(lot(1), 1);
        ctx.same_day_allocation_count = 1;

        assert!(validate(&[line(1), line(2)], &ctx, &rules).valid);

        let report = validate(&[line(1), line(1), line(2)], &ctx, &rules);
        assert_eq!(report.errors.len(), 2);
    }

    #[test]
    fn submission_line_limit_applies_when_editing() {
        let rules = InputRestrictions {
            max_lines_per_submission: LimitRule::enabled(1),
            ..no_rules()
        };
        let mut ctx = context();
        ctx.editing_transaction_id = Some(Uuid::new_v4());
        assert!(!validate(&[line(1), line(2)], &ctx, &rules).valid);
    }

    #[test]
    fn duplicate_lots_are_reported_once_per_lot() {
        let rules = InputRestrictions {
            prevent_duplicate_lots: true,
            ..no_rules()
        };
        let report = validate(&[line(1), line(1), line(1), line(2)], &context(), &rules);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains(&lot(1).to_string()));
    }

    #[test]
    fn minimum_interval_since_last_usage() {
        let rules = InputRestrictions {
            min_interval_minutes: LimitRule::enabled(30),
            ..no_rules()
        };
        let mut ctx = context();
        ctx.last_transaction_at = Some(ctx.now - Duration::minutes(10));
        assert!(!validate(&[line(1)], &ctx, &rules).valid);

        ctx.last_transaction_at = Some(ctx.now - Duration::minutes(45));
        assert!(validate(&[line(1)], &ctx, &rules).valid);
    }

    #[test]
    fn stock_age_blocks_over_limit_and_warns_over_threshold() {
        let rules = InputRestrictions {
            stock_age_limit_days: LimitRule::enabled(100),
            stock_age_warning_days: LimitRule::enabled(30),
            ..no_rules()
        };
        let mut ctx = context();
        ctx.lot_received_dates.insert(lot(1), ctx.usage_date - Duration::days(40));
        ctx.lot_received_dates.insert(lot(2), ctx.usage_date - Duration::days(150));

        let report = validate(&[line(1), line(2)], &ctx, &rules);
        assert!(!report.valid);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("150 days"));
    }

    #[test]
    fn failed_report_becomes_restriction_violation() {
        let report = RestrictionReport {
            valid: false,
            errors: vec!["nope".into()],
            warnings: vec![],
        };
        assert!(matches!(
            report.into_result(),
            Err(ServiceError::RestrictionViolation { errors }) if errors == vec!["nope".to_string()]
        ));
    }
}
