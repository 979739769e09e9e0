use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Anything stock is consumed against (a flock, a batch, a ward).
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "consuming_entities")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub tenant_id: String,
    pub name: String,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub total_quantity_used: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub total_cost_used: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::stock_lot::Entity")]
    StockLots,
    #[sea_orm(has_many = "super::usage_transaction::Entity")]
    UsageTransactions,
}

impl Related<super::stock_lot::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::StockLots.def()
    }
}

impl Related<super::usage_transaction::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::UsageTransactions.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
