use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "stock_lots")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub consuming_entity_id: Uuid,
    pub resource_id: Uuid,
    pub resource_name: String,
    pub received_date: NaiveDate,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub quantity_in: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub quantity_used: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub quantity_mutated: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub cost_per_unit: Decimal,
    pub unit: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::consuming_entity::Entity",
        from = "Column::ConsumingEntityId",
        to = "super::consuming_entity::Column::Id"
    )]
    ConsumingEntity,
    #[sea_orm(has_many = "super::usage_detail::Entity")]
    UsageDetails,
}

impl Related<super::consuming_entity::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ConsumingEntity.def()
    }
}

impl Related<super::usage_detail::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::UsageDetails.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// `quantity_in - quantity_used - quantity_mutated`, never below zero.
    pub fn remaining(&self) -> Decimal {
        (self.quantity_in - self.quantity_used - self.quantity_mutated).max(Decimal::ZERO)
    }

    pub fn is_depleted(&self) -> bool {
        self.remaining().is_zero()
    }
}
