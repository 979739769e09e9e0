//! Depletion policy configuration.
//!
//! A [`PolicyConfig`] is resolved once per request (see [`provider`]) and passed
//! by argument to every component that branches on policy. It is always fully
//! populated: [`PolicyConfig::default`] is a complete, usable policy.
//!
//! Overrides come in two explicit shapes. [`SystemPolicyOverrides`] carries the
//! protected fields (how edits and deletes behave) and is only writable by the
//! platform; [`UserPolicyOverrides`] carries what a tenant may tune. Neither can
//! express the other's fields.

pub mod provider;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

pub use provider::{InMemoryPolicyProvider, PolicyConfigProvider};

/// Which lots satisfy a request first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DepletionMethod {
    #[default]
    Fifo,
    Lifo,
    Manual,
}

/// Secondary ordering key when two lots share a receipt date.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TieBreaker {
    #[default]
    CreatedAt,
    Id,
    CostPerUnit,
}

/// How an automatic plan splits a total across lots.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum QuantityDistribution {
    #[default]
    Sequential,
    Proportional,
    Balanced,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EditMode {
    #[default]
    DirectUpdate,
    DeleteRecreate,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeleteMode {
    /// Restore the ledger and keep the row as an inactive tombstone.
    #[default]
    Soft,
    /// Restore the ledger and physically remove the rows.
    Hard,
}

/// Consumable domain a policy applies to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PolicyDomain {
    #[default]
    Feed,
    Supply,
    Medication,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DepletionPolicy {
    pub method: DepletionMethod,
    pub tie_breaker: TieBreaker,
    pub distribution: QuantityDistribution,
}

impl Default for DepletionPolicy {
    fn default() -> Self {
        Self {
            method: DepletionMethod::Fifo,
            tie_breaker: TieBreaker::CreatedAt,
            distribution: QuantityDistribution::Sequential,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationThresholds {
    /// Smallest quantity a single line may take (inclusive).
    pub min_quantity: Decimal,
    /// Largest quantity a single line may take (inclusive).
    pub max_quantity: Decimal,
    /// Maximum decimal places accepted on a quantity.
    pub quantity_scale: u32,
}

impl Default for ValidationThresholds {
    fn default() -> Self {
        Self {
            min_quantity: dec!(0.01),
            max_quantity: dec!(1000000),
            quantity_scale: 3,
        }
    }
}

/// A toggle-able numeric limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRule {
    pub enabled: bool,
    pub limit: u32,
}

impl LimitRule {
    pub const fn disabled(limit: u32) -> Self {
        Self {
            enabled: false,
            limit,
        }
    }

    pub const fn enabled(limit: u32) -> Self {
        Self {
            enabled: true,
            limit,
        }
    }

    /// Returns the limit when the rule is active.
    pub fn active(&self) -> Option<u32> {
        self.enabled.then_some(self.limit)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputRestrictions {
    pub one_usage_per_day: bool,
    pub prevent_same_lot_same_day: bool,
    pub max_allocations_per_lot_per_day: LimitRule,
    pub max_allocations_per_entity_per_day: LimitRule,
    pub max_lines_per_submission: LimitRule,
    pub prevent_duplicate_lots: bool,
    /// Minimum minutes between two usage transactions of one entity.
    pub min_interval_minutes: LimitRule,
    /// Lots older than this many days (at the usage date) are refused.
    pub stock_age_limit_days: LimitRule,
    /// Lots older than this many days (at the usage date) produce a warning.
    pub stock_age_warning_days: LimitRule,
}

impl Default for InputRestrictions {
    fn default() -> Self {
        Self {
            one_usage_per_day: false,
            prevent_same_lot_same_day: false,
            max_allocations_per_lot_per_day: LimitRule::disabled(3),
            max_allocations_per_entity_per_day: LimitRule::disabled(10),
            max_lines_per_submission: LimitRule::enabled(50),
            prevent_duplicate_lots: true,
            min_interval_minutes: LimitRule::disabled(30),
            stock_age_limit_days: LimitRule::disabled(365),
            stock_age_warning_days: LimitRule::enabled(180),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditPolicy {
    pub mode: EditMode,
    pub delete_mode: DeleteMode,
    pub backup_before_edit: bool,
    /// Refuse a hard delete while another transaction still points at the target.
    pub validate_references: bool,
}

impl Default for EditPolicy {
    fn default() -> Self {
        Self {
            mode: EditMode::DirectUpdate,
            delete_mode: DeleteMode::Soft,
            backup_before_edit: true,
            validate_references: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub depletion: DepletionPolicy,
    pub validation: ValidationThresholds,
    pub restrictions: InputRestrictions,
    pub edit: EditPolicy,
}

/// Protected fields; only the platform may set these.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemPolicyOverrides {
    pub edit_mode: Option<EditMode>,
    pub delete_mode: Option<DeleteMode>,
    pub backup_before_edit: Option<bool>,
    pub validate_references: Option<bool>,
}

/// Fields a tenant may tune.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserPolicyOverrides {
    pub depletion_method: Option<DepletionMethod>,
    pub tie_breaker: Option<TieBreaker>,
    pub distribution: Option<QuantityDistribution>,
    pub min_quantity: Option<Decimal>,
    pub max_quantity: Option<Decimal>,
    pub restrictions: Option<InputRestrictions>,
}

impl PolicyConfig {
    /// Layers system then user overrides on top of `self`.
    pub fn resolve(&self, system: &SystemPolicyOverrides, user: &UserPolicyOverrides) -> Self {
        let mut policy = self.clone();

        if let Some(mode) = system.edit_mode {
            policy.edit.mode = mode;
        }
        if let Some(mode) = system.delete_mode {
            policy.edit.delete_mode = mode;
        }
        if let Some(backup) = system.backup_before_edit {
            policy.edit.backup_before_edit = backup;
        }
        if let Some(validate) = system.validate_references {
            policy.edit.validate_references = validate;
        }

        if let Some(method) = user.depletion_method {
            policy.depletion.method = method;
        }
        if let Some(tie_breaker) = user.tie_breaker {
            policy.depletion.tie_breaker = tie_breaker;
        }
        if let Some(distribution) = user.distribution {
            policy.depletion.distribution = distribution;
        }
        if let Some(min) = user.min_quantity {
            policy.validation.min_quantity = min;
        }
        if let Some(max) = user.max_quantity {
            policy.validation.max_quantity = max;
        }
        if let Some(restrictions) = &user.restrictions {
            policy.restrictions = restrictions.clone();
        }

        policy
    }

    /// Compact record of the decisions a transaction was committed under.
    pub fn snapshot(&self) -> PolicySnapshot {
        PolicySnapshot {
            depletion_method: self.depletion.method,
            distribution: self.depletion.distribution,
            edit_mode: self.edit.mode,
            delete_mode: self.edit.delete_mode,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub depletion_method: DepletionMethod,
    pub distribution: QuantityDistribution,
    pub edit_mode: EditMode,
    pub delete_mode: DeleteMode,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn default_policy_is_fifo_direct_update_soft() {
        let policy = PolicyConfig::default();
        assert_eq!(policy.depletion.method, DepletionMethod::Fifo);
        assert_eq!(policy.edit.mode, EditMode::DirectUpdate);
        assert_eq!(policy.edit.delete_mode, DeleteMode::Soft);
        assert!(policy.validation.min_quantity <= policy.validation.max_quantity);
    }

    #[test]
    fn resolve_applies_both_override_layers() {
        let system = SystemPolicyOverrides {
            edit_mode: Some(EditMode::DeleteRecreate),
            delete_mode: Some(DeleteMode::Hard),
            ..Default::default()
        };
        let user = UserPolicyOverrides {
            depletion_method: Some(DepletionMethod::Lifo),
            max_quantity: Some(dec!(250)),
            ..Default::default()
        };

        let policy = PolicyConfig::default().resolve(&system, &user);
        assert_eq!(policy.edit.mode, EditMode::DeleteRecreate);
        assert_eq!(policy.edit.delete_mode, DeleteMode::Hard);
        assert_eq!(policy.depletion.method, DepletionMethod::Lifo);
        assert_eq!(policy.validation.max_quantity, dec!(250));
        // untouched fields keep their defaults
        assert!(policy.edit.backup_before_edit);
        assert_eq!(policy.validation.min_quantity, dec!(0.01));
    }

    #[test]
    fn partial_toml_still_yields_full_policy() {
        let policy: PolicyConfig = serde_json::from_str(r#"{"depletion":{"method":"lifo"}}"#).unwrap();
        assert_eq!(policy.depletion.method, DepletionMethod::Lifo);
        assert_eq!(policy.depletion.tie_breaker, TieBreaker::CreatedAt);
        assert_eq!(policy.restrictions, InputRestrictions::default());
    }

    #[test]
    fn enums_round_trip_through_strings() {
        assert_eq!(DeleteMode::from_str("hard").unwrap(), DeleteMode::Hard);
        assert_eq!(EditMode::DeleteRecreate.to_string(), "delete_recreate");
        assert_eq!(PolicyDomain::from_str("medication").unwrap(), PolicyDomain::Medication);
    }
}
