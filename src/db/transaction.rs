/*!
 * Transaction scope
 *
 * Wraps a sea-orm `DatabaseTransaction` so that every ledger mutation commits
 * on success and rolls back on error. Dropping a scope without finishing it
 * rolls the transaction back as well.
 */

use std::time::Instant;

use metrics::{counter, histogram};
use sea_orm::{DatabaseConnection, DatabaseTransaction, TransactionTrait};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::errors::ServiceError;

pub struct TxnScope {
    txn: DatabaseTransaction,
    id: Uuid,
    label: &'static str,
    started: Instant,
}

impl TxnScope {
    /// Opens a new database transaction tagged with `label` for logs and metrics.
    pub async fn begin(db: &DatabaseConnection, label: &'static str) -> Result<Self, ServiceError> {
        let txn = db.begin().await.map_err(|e| {
            error!(operation = label, error = %e, "Failed to open transaction");
            ServiceError::db_error(e)
        })?;

        let id = Uuid::new_v4();
        debug!(transaction_id = %id, operation = label, "Starting database transaction");
        counter!("stockledger_db.transaction.started", 1, "operation" => label);

        Ok(Self {
            txn,
            id,
            label,
            started: Instant::now(),
        })
    }

    pub fn txn(&self) -> &DatabaseTransaction {
        &self.txn
    }

    /// Commits on `Ok`, rolls back on `Err`.
    ///
    /// Database errors raised by the work itself or by the commit surface as
    /// `CommitFailed`; business rejections pass through unchanged.
    pub async fn finish<T>(self, result: Result<T, ServiceError>) -> Result<T, ServiceError> {
        let Self {
            txn,
            id,
            label,
            started,
        } = self;

        match result {
            Ok(value) => match txn.commit().await {
                Ok(()) => {
                    let elapsed = started.elapsed();
                    histogram!("stockledger_db.transaction.duration", elapsed, "operation" => label);
                    counter!("stockledger_db.transaction.committed", 1, "operation" => label);
                    debug!(transaction_id = %id, operation = label, "Transaction committed in {:?}", elapsed);
                    Ok(value)
                }
                Err(e) => {
                    counter!("stockledger_db.transaction.failed", 1, "operation" => label);
                    error!(transaction_id = %id, operation = label, error = %e, "Transaction commit failed");
                    Err(ServiceError::CommitFailed(e.to_string()))
                }
            },
            Err(err) => {
                if let Err(rollback_err) = txn.rollback().await {
                    error!(transaction_id = %id, operation = label, error = %rollback_err, "Rollback failed");
                }
                counter!("stockledger_db.transaction.rolled_back", 1, "operation" => label);
                warn!(
                    transaction_id = %id,
                    operation = label,
                    code = err.code(),
                    "Transaction rolled back after {:?}",
                    started.elapsed()
                );

                Err(match err {
                    ServiceError::DatabaseError(db_err) => {
                        error!(transaction_id = %id, operation = label, error = %db_err, "Database error inside transaction");
                        ServiceError::CommitFailed(db_err.to_string())
                    }
                    other => other,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{establish_connection_with_config, run_migrations, DbConfig};
    use crate::entities::consuming_entity;
    use assert_matches::assert_matches;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use sea_orm::{ActiveModelTrait, DbErr, EntityTrait, PaginatorTrait, Set};

    async fn migrated_pool() -> DatabaseConnection {
        let pool = establish_connection_with_config(&DbConfig {
            url: "sqlite::memory:".into(),
            max_connections: 1,
            ..Default::default()
        })
        .await
        .unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    async fn insert_entity<C: sea_orm::ConnectionTrait>(conn: &C) -> Result<Uuid, ServiceError> {
        let id = Uuid::new_v4();
        consuming_entity::ActiveModel {
            id: Set(id),
            tenant_id: Set("tenant".into()),
            name: Set("Barn 2".into()),
            total_quantity_used: Set(Decimal::ZERO),
            total_cost_used: Set(Decimal::ZERO),
            created_at: Set(Utc::now()),
            updated_at: Set(None),
        }
        .insert(conn)
        .await?;
        Ok(id)
    }

    #[tokio::test]
    async fn ok_result_commits() {
        let pool = migrated_pool().await;
        let scope = TxnScope::begin(&pool, "test_commit").await.unwrap();
        let result = insert_entity(scope.txn()).await;
        let id = scope.finish(result).await.unwrap();

        assert!(consuming_entity::Entity::find_by_id(id).one(&pool).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rejection_rolls_back_and_passes_through() {
        let pool = migrated_pool().await;
        let scope = TxnScope::begin(&pool, "test_rollback").await.unwrap();
        let inserted = insert_entity(scope.txn()).await;
        assert!(inserted.is_ok());

        let result: Result<(), ServiceError> = Err(ServiceError::Conflict("nope".into()));
        assert_matches!(scope.finish(result).await, Err(ServiceError::Conflict(_)));
        assert_eq!(consuming_entity::Entity::find().count(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn database_error_becomes_commit_failed() {
        let pool = migrated_pool().await;
        let scope = TxnScope::begin(&pool, "test_db_error").await.unwrap();
        let result: Result<(), ServiceError> =
            Err(ServiceError::DatabaseError(DbErr::Custom("disk full".into())));
        assert_matches!(scope.finish(result).await, Err(ServiceError::CommitFailed(msg)) if msg.contains("disk full"));
    }
}
