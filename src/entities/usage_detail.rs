use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One allocated line of a usage transaction.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "usage_details")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub usage_transaction_id: Uuid,
    pub stock_lot_id: Uuid,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub quantity: Decimal,
    /// Cost per unit of the lot when the line was taken.
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub cost_per_unit: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub line_cost: Decimal,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::usage_transaction::Entity",
        from = "Column::UsageTransactionId",
        to = "super::usage_transaction::Column::Id"
    )]
    UsageTransaction,
    #[sea_orm(
        belongs_to = "super::stock_lot::Entity",
        from = "Column::StockLotId",
        to = "super::stock_lot::Column::Id"
    )]
    StockLot,
}

impl Related<super::usage_transaction::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::UsageTransaction.def()
    }
}

impl Related<super::stock_lot::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::StockLot.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
