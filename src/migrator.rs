use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240601_000001_create_stock_tables::Migration),
            Box::new(m20240601_000002_create_usage_tables::Migration),
        ]
    }
}

// Migration implementations

mod m20240601_000001_create_stock_tables {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000001_create_stock_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(ConsumingEntities::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(ConsumingEntities::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(ConsumingEntities::TenantId).string().not_null())
                        .col(ColumnDef::new(ConsumingEntities::Name).string().not_null())
                        .col(
                            ColumnDef::new(ConsumingEntities::TotalQuantityUsed)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(ConsumingEntities::TotalCostUsed)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(ConsumingEntities::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ConsumingEntities::UpdatedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .to_owned(),
                )
                .await?;

            // Lot counters: quantity_used + quantity_mutated <= quantity_in
            manager
                .create_table(
                    Table::create()
                        .table(StockLots::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(StockLots::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(StockLots::ConsumingEntityId).uuid().not_null())
                        .col(ColumnDef::new(StockLots::ResourceId).uuid().not_null())
                        .col(ColumnDef::new(StockLots::ResourceName).string().not_null())
                        .col(ColumnDef::new(StockLots::ReceivedDate).date().not_null())
                        .col(ColumnDef::new(StockLots::QuantityIn).decimal().not_null())
                        .col(
                            ColumnDef::new(StockLots::QuantityUsed)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(StockLots::QuantityMutated)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(StockLots::CostPerUnit).decimal().not_null())
                        .col(ColumnDef::new(StockLots::Unit).string().not_null())
                        .col(
                            ColumnDef::new(StockLots::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockLots::UpdatedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_stock_lots_consuming_entity_id")
                                .from(StockLots::Table, StockLots::ConsumingEntityId)
                                .to(ConsumingEntities::Table, ConsumingEntities::Id)
                                .on_delete(ForeignKeyAction::Restrict),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_stock_lots_entity_received")
                        .table(StockLots::Table)
                        .col(StockLots::ConsumingEntityId)
                        .col(StockLots::ReceivedDate)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_stock_lots_resource_id")
                        .table(StockLots::Table)
                        .col(StockLots::ResourceId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(StockLots::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(ConsumingEntities::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum ConsumingEntities {
        Table,
        Id,
        TenantId,
        Name,
        TotalQuantityUsed,
        TotalCostUsed,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    pub(super) enum StockLots {
        Table,
        Id,
        ConsumingEntityId,
        ResourceId,
        ResourceName,
        ReceivedDate,
        QuantityIn,
        QuantityUsed,
        QuantityMutated,
        CostPerUnit,
        Unit,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240601_000002_create_usage_tables {

    use super::m20240601_000001_create_stock_tables::{ConsumingEntities, StockLots};
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000002_create_usage_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(UsageTransactions::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(UsageTransactions::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(UsageTransactions::ConsumingEntityId)
                                .uuid()
                                .not_null(),
                        )
                        .col(ColumnDef::new(UsageTransactions::UsageDate).date().not_null())
                        .col(ColumnDef::new(UsageTransactions::Purpose).string().null())
                        .col(ColumnDef::new(UsageTransactions::Notes).text().null())
                        .col(
                            ColumnDef::new(UsageTransactions::TotalQuantity)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(UsageTransactions::TotalCost)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(UsageTransactions::IsActive)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        // No foreign key: a superseded row may be hard deleted later
                        .col(ColumnDef::new(UsageTransactions::SupersedesId).uuid().null())
                        .col(ColumnDef::new(UsageTransactions::Actor).string().null())
                        .col(ColumnDef::new(UsageTransactions::Metadata).json().not_null())
                        .col(
                            ColumnDef::new(UsageTransactions::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(UsageTransactions::UpdatedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(UsageTransactions::DeletedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_usage_transactions_consuming_entity_id")
                                .from(UsageTransactions::Table, UsageTransactions::ConsumingEntityId)
                                .to(ConsumingEntities::Table, ConsumingEntities::Id)
                                .on_delete(ForeignKeyAction::Restrict),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_usage_transactions_entity_date")
                        .table(UsageTransactions::Table)
                        .col(UsageTransactions::ConsumingEntityId)
                        .col(UsageTransactions::UsageDate)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_usage_transactions_supersedes_id")
                        .table(UsageTransactions::Table)
                        .col(UsageTransactions::SupersedesId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(UsageDetails::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(UsageDetails::Id).uuid().primary_key().not_null())
                        .col(
                            ColumnDef::new(UsageDetails::UsageTransactionId)
                                .uuid()
                                .not_null(),
                        )
                        .col(ColumnDef::new(UsageDetails::StockLotId).uuid().not_null())
                        .col(ColumnDef::new(UsageDetails::Quantity).decimal().not_null())
                        .col(ColumnDef::new(UsageDetails::CostPerUnit).decimal().not_null())
                        .col(ColumnDef::new(UsageDetails::LineCost).decimal().not_null())
                        .col(ColumnDef::new(UsageDetails::Note).string().null())
                        .col(
                            ColumnDef::new(UsageDetails::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_usage_details_usage_transaction_id")
                                .from(UsageDetails::Table, UsageDetails::UsageTransactionId)
                                .to(UsageTransactions::Table, UsageTransactions::Id)
                                .on_delete(ForeignKeyAction::Restrict),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_usage_details_stock_lot_id")
                                .from(UsageDetails::Table, UsageDetails::StockLotId)
                                .to(StockLots::Table, StockLots::Id)
                                .on_delete(ForeignKeyAction::Restrict),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_usage_details_usage_transaction_id")
                        .table(UsageDetails::Table)
                        .col(UsageDetails::UsageTransactionId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_usage_details_stock_lot_id")
                        .table(UsageDetails::Table)
                        .col(UsageDetails::StockLotId)
                        .to_owned(),
                )
                .await?;

            // Snapshots outlive hard-deleted transactions, so no foreign key here
            manager
                .create_table(
                    Table::create()
                        .table(UsageAuditSnapshots::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(UsageAuditSnapshots::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(UsageAuditSnapshots::UsageTransactionId)
                                .uuid()
                                .not_null(),
                        )
                        .col(ColumnDef::new(UsageAuditSnapshots::Action).string().not_null())
                        .col(ColumnDef::new(UsageAuditSnapshots::Reason).string().null())
                        .col(ColumnDef::new(UsageAuditSnapshots::Actor).string().null())
                        .col(
                            ColumnDef::new(UsageAuditSnapshots::OriginalData)
                                .json()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(UsageAuditSnapshots::CapturedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_usage_audit_snapshots_transaction_id")
                        .table(UsageAuditSnapshots::Table)
                        .col(UsageAuditSnapshots::UsageTransactionId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(UsageAuditSnapshots::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(UsageDetails::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(UsageTransactions::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum UsageTransactions {
        Table,
        Id,
        ConsumingEntityId,
        UsageDate,
        Purpose,
        Notes,
        TotalQuantity,
        TotalCost,
        IsActive,
        SupersedesId,
        Actor,
        Metadata,
        CreatedAt,
        UpdatedAt,
        DeletedAt,
    }

    #[derive(DeriveIden)]
    enum UsageDetails {
        Table,
        Id,
        UsageTransactionId,
        StockLotId,
        Quantity,
        CostPerUnit,
        LineCost,
        Note,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum UsageAuditSnapshots {
        Table,
        Id,
        UsageTransactionId,
        Action,
        Reason,
        Actor,
        OriginalData,
        CapturedAt,
    }
}
