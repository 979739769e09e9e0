//! Lot availability, allocation checks, depletion ordering and automatic planning.
//!
//! Everything here is pure: callers load lots (locked, inside the transaction
//! when mutating) and pass them in.

use std::cmp::Ordering;
use std::collections::HashMap;

use rust_decimal::{Decimal, RoundingStrategy};
use uuid::Uuid;

use crate::dto::usage::{PlannedAllocation, UsageAllocation};
use crate::entities::{stock_lot, usage_detail};
use crate::errors::ServiceError;
use crate::policy::{
    DepletionMethod, DepletionPolicy, PolicyConfig, QuantityDistribution, TieBreaker,
    ValidationThresholds,
};

/// Quantity to add back per lot while the details that took it are being edited.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EditAdjustment {
    add_back: HashMap<Uuid, Decimal>,
}

impl EditAdjustment {
    pub fn none() -> Self {
        Self::default()
    }

    /// Sums the quantities of `details` per lot.
    pub fn for_details<'a>(details: impl IntoIterator<Item = &'a usage_detail::Model>) -> Self {
        let mut add_back: HashMap<Uuid, Decimal> = HashMap::new();
        for detail in details {
            *add_back.entry(detail.stock_lot_id).or_default() += detail.quantity;
        }
        Self { add_back }
    }

    pub fn quantity_for(&self, lot_id: Uuid) -> Decimal {
        self.add_back.get(&lot_id).copied().unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.add_back.is_empty()
    }
}

/// What `lot` can still give, counting quantities being edited as free again.
pub fn available(lot: &stock_lot::Model, adjustment: &EditAdjustment) -> Decimal {
    let raw = lot.quantity_in - lot.quantity_used - lot.quantity_mutated
        + adjustment.quantity_for(lot.id);
    raw.max(Decimal::ZERO)
}

/// Checks a single quantity against the policy thresholds.
pub fn validate_quantity(
    quantity: Decimal,
    thresholds: &ValidationThresholds,
) -> Result<(), ServiceError> {
    if quantity <= Decimal::ZERO {
        return Err(ServiceError::InvalidQuantity(format!(
            "quantity must be positive, got {}",
            quantity
        )));
    }
    if quantity < thresholds.min_quantity || quantity > thresholds.max_quantity {
        return Err(ServiceError::InvalidQuantity(format!(
            "quantity {} is outside [{}, {}]",
            quantity, thresholds.min_quantity, thresholds.max_quantity
        )));
    }
    if quantity.normalize().scale() > thresholds.quantity_scale {
        return Err(ServiceError::InvalidQuantity(format!(
            "quantity {} has more than {} decimal places",
            quantity, thresholds.quantity_scale
        )));
    }
    Ok(())
}

/// Validates one requested line against a lot.
///
/// `available` is what the lot can still give to this line, which differs from
/// [`available`] when earlier lines of the same submission already drew on it.
pub fn validate_allocation(
    lot: &stock_lot::Model,
    consuming_entity_id: Uuid,
    resource_filter: Option<Uuid>,
    quantity: Decimal,
    available: Decimal,
    thresholds: &ValidationThresholds,
) -> Result<(), ServiceError> {
    if lot.consuming_entity_id != consuming_entity_id {
        return Err(ServiceError::InvalidResource(format!(
            "stock lot {} does not belong to consuming entity {}",
            lot.id, consuming_entity_id
        )));
    }
    if let Some(resource_id) = resource_filter {
        if lot.resource_id != resource_id {
            return Err(ServiceError::InvalidResource(format!(
                "stock lot {} holds resource {}, expected {}",
                lot.id, lot.resource_id, resource_id
            )));
        }
    }

    validate_quantity(quantity, thresholds)?;

    if quantity > available {
        return Err(ServiceError::InsufficientStock {
            lot_id: Some(lot.id),
            requested: quantity,
            available,
        });
    }
    Ok(())
}

/// Validates every line of a submission against locked lots.
///
/// Lines on the same lot draw availability cumulatively, so two lines of 60
/// against 100 available fail on the second one.
pub fn validate_allocations(
    consuming_entity_id: Uuid,
    allocations: &[UsageAllocation],
    lots: &HashMap<Uuid, stock_lot::Model>,
    adjustment: &EditAdjustment,
    thresholds: &ValidationThresholds,
) -> Result<(), ServiceError> {
    let mut consumed: HashMap<Uuid, Decimal> = HashMap::new();

    for allocation in allocations {
        let lot = lots
            .get(&allocation.stock_lot_id)
            .ok_or_else(|| ServiceError::not_found("Stock lot", allocation.stock_lot_id))?;
        let already = consumed.entry(lot.id).or_default();
        let remaining = (available(lot, adjustment) - *already).max(Decimal::ZERO);

        validate_allocation(
            lot,
            consuming_entity_id,
            None,
            allocation.quantity,
            remaining,
            thresholds,
        )?;
        *already += allocation.quantity;
    }
    Ok(())
}

fn tie_break(a: &stock_lot::Model, b: &stock_lot::Model, tie_breaker: TieBreaker) -> Ordering {
    match tie_breaker {
        TieBreaker::CreatedAt => a.created_at.cmp(&b.created_at),
        TieBreaker::Id => a.id.cmp(&b.id),
        TieBreaker::CostPerUnit => a.cost_per_unit.cmp(&b.cost_per_unit),
    }
}

/// Sorts lots into depletion order.
///
/// FIFO and manual list the oldest receipt first, LIFO the newest. The receipt
/// direction also applies to a `created_at` tie-break; `id` and `cost_per_unit`
/// tie-breaks are always ascending. Lot id settles anything still equal.
pub fn order_lots(lots: &mut [stock_lot::Model], policy: &DepletionPolicy) {
    let newest_first = policy.method == DepletionMethod::Lifo;

    lots.sort_by(|a, b| {
        let by_date = a.received_date.cmp(&b.received_date);
        let by_tie = tie_break(a, b, policy.tie_breaker);

        let (by_date, by_tie) = if newest_first {
            let tie = if policy.tie_breaker == TieBreaker::CreatedAt {
                by_tie.reverse()
            } else {
                by_tie
            };
            (by_date.reverse(), tie)
        } else {
            (by_date, by_tie)
        };

        by_date.then(by_tie).then_with(|| a.id.cmp(&b.id))
    });
}

fn round_down(value: Decimal, scale: u32) -> Decimal {
    value.round_dp_with_strategy(scale, RoundingStrategy::ToZero)
}

/// Places `leftover` on lots with spare capacity, walking `order`.
fn spill(leftover: &mut Decimal, shares: &mut [Decimal], capacity: &[Decimal], order: impl Iterator<Item = usize>) {
    for index in order {
        if *leftover <= Decimal::ZERO {
            break;
        }
        let spare = capacity[index] - shares[index];
        if spare > Decimal::ZERO {
            let take = spare.min(*leftover);
            shares[index] += take;
            *leftover -= take;
        }
    }
}

/// Splits `total` across `lots`, which must already be in depletion order.
pub fn plan_distribution(
    total: Decimal,
    lots: &[stock_lot::Model],
    adjustment: &EditAdjustment,
    policy: &PolicyConfig,
) -> Result<Vec<PlannedAllocation>, ServiceError> {
    if policy.depletion.method == DepletionMethod::Manual {
        return Err(ServiceError::ValidationError(
            "automatic allocation planning is disabled under manual depletion".to_string(),
        ));
    }
    if total <= Decimal::ZERO {
        return Err(ServiceError::InvalidQuantity(format!(
            "total quantity must be positive, got {}",
            total
        )));
    }

    let candidates: Vec<(&stock_lot::Model, Decimal)> = lots
        .iter()
        .map(|lot| (lot, available(lot, adjustment)))
        .filter(|(_, avail)| *avail > Decimal::ZERO)
        .collect();
    let pooled: Decimal = candidates.iter().map(|(_, avail)| *avail).sum();

    if pooled < total {
        return Err(ServiceError::InsufficientStock {
            lot_id: None,
            requested: total,
            available: pooled,
        });
    }

    let scale = policy.validation.quantity_scale;
    let capacity: Vec<Decimal> = candidates.iter().map(|(_, avail)| *avail).collect();
    let mut shares = vec![Decimal::ZERO; candidates.len()];
    let mut leftover = total;

    match policy.depletion.distribution {
        QuantityDistribution::Sequential => {
            spill(&mut leftover, &mut shares, &capacity, 0..candidates.len());
        }
        QuantityDistribution::Proportional => {
            for (index, avail) in capacity.iter().enumerate() {
                let share = round_down(total * *avail / pooled, scale).min(*avail);
                shares[index] = share;
                leftover -= share;
            }
            // rounding remainder goes to the last lot first
            spill(&mut leftover, &mut shares, &capacity, (0..candidates.len()).rev());
        }
        QuantityDistribution::Balanced => {
            let mut by_size: Vec<usize> = (0..candidates.len()).collect();
            by_size.sort_by(|a, b| capacity[*a].cmp(&capacity[*b]));

            for (position, index) in by_size.iter().enumerate() {
                let lots_left = Decimal::from(by_size.len() - position);
                let even = if lots_left == Decimal::ONE {
                    leftover
                } else {
                    round_down(leftover / lots_left, scale)
                };
                let take = even.min(capacity[*index]);
                shares[*index] = take;
                leftover -= take;
            }
            spill(&mut leftover, &mut shares, &capacity, 0..candidates.len());
        }
    }

    if leftover > Decimal::ZERO {
        return Err(ServiceError::InternalError(format!(
            "distribution left {} unplaced",
            leftover
        )));
    }

    Ok(candidates
        .iter()
        .zip(shares)
        .filter(|(_, share)| *share > Decimal::ZERO)
        .map(|((lot, avail), share)| PlannedAllocation {
            stock_lot_id: lot.id,
            quantity: share,
            available: *avail,
            cost_per_unit: lot.cost_per_unit,
        })
        .collect())
}

/// Line cost at column scale.
pub fn line_cost(quantity: Decimal, cost_per_unit: Decimal) -> Result<Decimal, ServiceError> {
    quantity
        .checked_mul(cost_per_unit)
        .map(|cost| cost.round_dp(4))
        .ok_or_else(|| {
            ServiceError::InvalidQuantity(format!(
                "cost of {} at {} per unit is out of range",
                quantity, cost_per_unit
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::DepletionPolicy;
    use assert_matches::assert_matches;
    use chrono::{Duration, NaiveDate, TimeZone, Utc};
    use rstest::rstest;
    use rust_decimal_macros::dec;

    fn entity() -> Uuid {
        Uuid::from_u128(1)
    }

    fn lot(n: u128, day: u32, quantity_in: Decimal, used: Decimal) -> stock_lot::Model {
        stock_lot::Model {
            id: Uuid::from_u128(100 + n),
            consuming_entity_id: entity(),
            resource_id: Uuid::from_u128(7),
            resource_name: "Grower pellets".into(),
            received_date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            quantity_in,
            quantity_used: used,
            quantity_mutated: Decimal::ZERO,
            cost_per_unit: Decimal::from(n as u64),
            unit: "kg".into(),
            created_at: Utc.with_ymd_and_hms(2024, 1, day, 8, 0, 0).unwrap()
                + Duration::minutes(n as i64),
            updated_at: None,
        }
    }

    fn detail(lot_id: Uuid, quantity: Decimal) -> usage_detail::Model {
        usage_detail::Model {
            id: Uuid::new_v4(),
            usage_transaction_id: Uuid::new_v4(),
            stock_lot_id: lot_id,
            quantity,
            cost_per_unit: dec!(1),
            line_cost: quantity,
            note: None,
            created_at: Utc::now(),
        }
    }

    fn policy_with(method: DepletionMethod, distribution: QuantityDistribution) -> PolicyConfig {
        let mut policy = PolicyConfig::default();
        policy.depletion = DepletionPolicy {
            method,
            tie_breaker: TieBreaker::CreatedAt,
            distribution,
        };
        policy
    }

    #[test]
    fn available_adds_back_edited_quantity() {
        let l = lot(1, 1, dec!(100), dec!(40));
        assert_eq!(available(&l, &EditAdjustment::none()), dec!(60));

        let adjustment = EditAdjustment::for_details([&detail(l.id, dec!(40))]);
        assert_eq!(available(&l, &adjustment), dec!(100));
    }

    #[test]
    fn adjustment_sums_per_lot() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let details = vec![detail(a, dec!(5)), detail(a, dec!(7)), detail(b, dec!(1))];
        let adjustment = EditAdjustment::for_details(&details);
        assert_eq!(adjustment.quantity_for(a), dec!(12));
        assert_eq!(adjustment.quantity_for(b), dec!(1));
        assert_eq!(adjustment.quantity_for(Uuid::nil()), Decimal::ZERO);
    }

    #[rstest]
    #[case(dec!(0), "positive")]
    #[case(dec!(-3), "positive")]
    #[case(dec!(0.001), "outside")]
    #[case(dec!(2000000), "outside")]
    #[case(dec!(1.2345), "decimal places")]
    fn rejects_bad_quantities(#[case] quantity: Decimal, #[case] fragment: &str) {
        let result = validate_quantity(quantity, &ValidationThresholds::default());
        assert_matches!(result, Err(ServiceError::InvalidQuantity(msg)) => {
            assert!(msg.contains(fragment), "{msg}");
        });
    }

    #[test]
    fn trailing_zeros_do_not_count_against_scale() {
        assert!(validate_quantity(dec!(12.5000), &ValidationThresholds::default()).is_ok());
    }

    #[test]
    fn allocation_over_available_is_insufficient() {
        let l = lot(1, 1, dec!(100), dec!(40));
        let result = validate_allocation(
            &l,
            entity(),
            None,
            dec!(70),
            available(&l, &EditAdjustment::none()),
            &ValidationThresholds::default(),
        );
        assert_matches!(
            result,
            Err(ServiceError::InsufficientStock { lot_id: Some(id), requested, available })
                if id == l.id && requested == dec!(70) && available == dec!(60)
        );
    }

    #[test]
    fn allocation_checks_scope_and_resource() {
        let l = lot(1, 1, dec!(100), dec!(0));
        let thresholds = ValidationThresholds::default();

        let foreign = validate_allocation(&l, Uuid::new_v4(), None, dec!(1), dec!(100), &thresholds);
        assert_matches!(foreign, Err(ServiceError::InvalidResource(_)));

        let wrong_resource =
            validate_allocation(&l, entity(), Some(Uuid::new_v4()), dec!(1), dec!(100), &thresholds);
        assert_matches!(wrong_resource, Err(ServiceError::InvalidResource(_)));

        assert!(validate_allocation(&l, entity(), Some(l.resource_id), dec!(1), dec!(100), &thresholds).is_ok());
    }

    #[test]
    fn fifo_lists_oldest_first_and_lifo_newest_first() {
        let mut lots = vec![
            lot(2, 20, dec!(10), dec!(0)),
            lot(1, 5, dec!(10), dec!(0)),
            lot(3, 12, dec!(10), dec!(0)),
        ];
        order_lots(&mut lots, &DepletionPolicy::default());
        let days: Vec<_> = lots.iter().map(|l| l.received_date).collect();
        assert!(days.windows(2).all(|w| w[0] <= w[1]));

        let lifo = DepletionPolicy {
            method: DepletionMethod::Lifo,
            ..Default::default()
        };
        order_lots(&mut lots, &lifo);
        assert_eq!(lots[0].id, Uuid::from_u128(102));
        assert_eq!(lots[2].id, Uuid::from_u128(101));
    }

    #[test]
    fn manual_keeps_fifo_display_order() {
        let mut lots = vec![lot(2, 9, dec!(1), dec!(0)), lot(1, 3, dec!(1), dec!(0))];
        let manual = DepletionPolicy {
            method: DepletionMethod::Manual,
            ..Default::default()
        };
        order_lots(&mut lots, &manual);
        assert_eq!(lots[0].id, Uuid::from_u128(101));
    }

    #[rstest]
    #[case(TieBreaker::CreatedAt, 101)]
    #[case(TieBreaker::CostPerUnit, 101)]
    #[case(TieBreaker::Id, 101)]
    fn same_day_lots_use_tie_breaker(#[case] tie_breaker: TieBreaker, #[case] first: u128) {
        let mut lots = vec![lot(3, 4, dec!(1), dec!(0)), lot(1, 4, dec!(1), dec!(0)), lot(2, 4, dec!(1), dec!(0))];
        order_lots(
            &mut lots,
            &DepletionPolicy {
                tie_breaker,
                ..Default::default()
            },
        );
        assert_eq!(lots[0].id, Uuid::from_u128(first));
    }

    #[test]
    fn sequential_plan_fills_in_order() {
        let lots = vec![lot(1, 1, dec!(30), dec!(0)), lot(2, 2, dec!(50), dec!(10)), lot(3, 3, dec!(100), dec!(0))];
        let plan = plan_distribution(
            dec!(60),
            &lots,
            &EditAdjustment::none(),
            &policy_with(DepletionMethod::Fifo, QuantityDistribution::Sequential),
        )
        .unwrap();

        let quantities: Vec<_> = plan.iter().map(|p| p.quantity).collect();
        assert_eq!(quantities, vec![dec!(30), dec!(30)]);
        assert_eq!(plan[1].available, dec!(40));
    }

    #[test]
    fn proportional_plan_follows_availability_share() {
        let lots = vec![lot(1, 1, dec!(20), dec!(0)), lot(2, 2, dec!(60), dec!(0))];
        let plan = plan_distribution(
            dec!(40),
            &lots,
            &EditAdjustment::none(),
            &policy_with(DepletionMethod::Fifo, QuantityDistribution::Proportional),
        )
        .unwrap();
        assert_eq!(plan[0].quantity, dec!(10));
        assert_eq!(plan[1].quantity, dec!(30));
    }

    #[test]
    fn proportional_remainder_lands_on_last_lot() {
        let lots = vec![lot(1, 1, dec!(10), dec!(0)), lot(2, 2, dec!(10), dec!(0)), lot(3, 3, dec!(10), dec!(0))];
        let plan = plan_distribution(
            dec!(10),
            &lots,
            &EditAdjustment::none(),
            &policy_with(DepletionMethod::Fifo, QuantityDistribution::Proportional),
        )
        .unwrap();
        let quantities: Vec<_> = plan.iter().map(|p| p.quantity).collect();
        assert_eq!(quantities, vec![dec!(3.333), dec!(3.333), dec!(3.334)]);
    }

    #[test]
    fn balanced_plan_caps_small_lots() {
        let lots = vec![lot(1, 1, dec!(5), dec!(0)), lot(2, 2, dec!(100), dec!(0)), lot(3, 3, dec!(100), dec!(0))];
        let plan = plan_distribution(
            dec!(45),
            &lots,
            &EditAdjustment::none(),
            &policy_with(DepletionMethod::Fifo, QuantityDistribution::Balanced),
        )
        .unwrap();
        let quantities: Vec<_> = plan.iter().map(|p| p.quantity).collect();
        assert_eq!(quantities, vec![dec!(5), dec!(20), dec!(20)]);
    }

    #[test]
    fn plan_rejects_shortfall_and_manual() {
        let lots = vec![lot(1, 1, dec!(10), dec!(0))];
        let shortfall = plan_distribution(
            dec!(11),
            &lots,
            &EditAdjustment::none(),
            &PolicyConfig::default(),
        );
        assert_matches!(
            shortfall,
            Err(ServiceError::InsufficientStock { lot_id: None, available, .. }) if available == dec!(10)
        );

        let manual = plan_distribution(
            dec!(1),
            &lots,
            &EditAdjustment::none(),
            &policy_with(DepletionMethod::Manual, QuantityDistribution::Sequential),
        );
        assert_matches!(manual, Err(ServiceError::ValidationError(_)));
    }

    #[test]
    fn request_validation_is_cumulative_per_lot() {
        let l = lot(1, 1, dec!(100), dec!(0));
        let lots: HashMap<Uuid, stock_lot::Model> = [(l.id, l.clone())].into_iter().collect();
        let line = |quantity| UsageAllocation {
            stock_lot_id: l.id,
            quantity,
            note: None,
            existing_detail_id: None,
        };
        let thresholds = ValidationThresholds::default();

        assert!(validate_allocations(entity(), &[line(dec!(60)), line(dec!(40))], &lots, &EditAdjustment::none(), &thresholds).is_ok());

        let over = validate_allocations(
            entity(),
            &[line(dec!(60)), line(dec!(60))],
            &lots,
            &EditAdjustment::none(),
            &thresholds,
        );
        assert_matches!(
            over,
            Err(ServiceError::InsufficientStock { available, .. }) if available == dec!(40)
        );

        let missing = validate_allocations(
            entity(),
            &[UsageAllocation { stock_lot_id: Uuid::new_v4(), ..line(dec!(1)) }],
            &lots,
            &EditAdjustment::none(),
            &thresholds,
        );
        assert_matches!(missing, Err(ServiceError::NotFound(_)));
    }

    #[test]
    fn line_cost_rounds_to_four_places() {
        assert_eq!(line_cost(dec!(3), dec!(0.33333)).unwrap(), dec!(1.0000));
        assert_eq!(line_cost(dec!(40), dec!(2.5)).unwrap(), dec!(100));
    }

    #[test]
    fn line_cost_overflow_is_an_invalid_quantity() {
        let huge = Decimal::from_str_exact("50000000000000000000000000000").unwrap();
        assert_matches!(line_cost(huge, dec!(2)), Err(ServiceError::InvalidQuantity(_)));
    }
}
