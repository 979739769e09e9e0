use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::dto::usage::UsageMetadata;
use crate::errors::ServiceError;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "usage_transactions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub consuming_entity_id: Uuid,
    pub usage_date: NaiveDate,
    pub purpose: Option<String>,
    #[sea_orm(column_type = "Text", nullable)]
    pub notes: Option<String>,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub total_quantity: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub total_cost: Decimal,
    pub is_active: bool,
    /// Transaction this one replaced through a soft delete-and-recreate.
    pub supersedes_id: Option<Uuid>,
    pub actor: Option<String>,
    pub metadata: Json,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
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
    /// Decodes the metadata column; rows written before any metadata existed decode as empty.
    pub fn typed_metadata(&self) -> Result<UsageMetadata, ServiceError> {
        if self.metadata.is_null() {
            return Ok(UsageMetadata::default());
        }
        Ok(serde_json::from_value(self.metadata.clone())?)
    }
}
