#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, Set};
use serde_json::Value;
use stockledger_api::{
    build_router,
    config::AppConfig,
    db::{self, DbPool},
    dto::usage::{UsageAllocation, UsageRequest},
    entities::{consuming_entity, stock_lot, usage_detail, usage_transaction},
    events::{process_events, EventSender},
    policy::{InMemoryPolicyProvider, PolicyConfigProvider, PolicyDomain},
    services::usage::UsageService,
    AppState,
};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const TENANT: &str = "tenant-a";

/// Application state backed by a fresh in-memory SQLite database.
///
/// The pool holds a single connection, so writers are serialised the same
/// way row locks serialise them on Postgres.
pub struct TestContext {
    pub db: Arc<DbPool>,
    pub policies: Arc<InMemoryPolicyProvider>,
    pub service: UsageService,
    pub state: AppState,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestContext {
    pub async fn new() -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        let db = Arc::new(pool);

        let (event_tx, event_rx) = mpsc::channel(cfg.event_channel_capacity);
        let event_task = tokio::spawn(process_events(event_rx));
        let event_sender = Arc::new(EventSender::new(event_tx));

        let policies = Arc::new(InMemoryPolicyProvider::new(cfg.policy.clone()));
        let provider: Arc<dyn PolicyConfigProvider> = policies.clone();
        let service = UsageService::new(db.clone(), provider, event_sender);

        let state = AppState {
            db: db.clone(),
            config: cfg,
            usage_service: service.clone(),
        };

        Self {
            db,
            policies,
            service,
            state,
            _event_task: event_task,
        }
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    pub async fn seed_entity(&self, name: &str) -> consuming_entity::Model {
        consuming_entity::ActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(TENANT.to_string()),
            name: Set(name.to_string()),
            total_quantity_used: Set(Decimal::ZERO),
            total_cost_used: Set(Decimal::ZERO),
            created_at: Set(Utc::now()),
            updated_at: Set(None),
        }
        .insert(self.db.as_ref())
        .await
        .expect("seed consuming entity")
    }

    pub async fn seed_lot(
        &self,
        entity_id: Uuid,
        resource_id: Uuid,
        received_date: NaiveDate,
        quantity_in: Decimal,
        cost_per_unit: Decimal,
    ) -> stock_lot::Model {
        stock_lot::ActiveModel {
            id: Set(Uuid::new_v4()),
            consuming_entity_id: Set(entity_id),
            resource_id: Set(resource_id),
            resource_name: Set(format!("Resource {}", &resource_id.to_string()[..8])),
            received_date: Set(received_date),
            quantity_in: Set(quantity_in),
            quantity_used: Set(Decimal::ZERO),
            quantity_mutated: Set(Decimal::ZERO),
            cost_per_unit: Set(cost_per_unit),
            unit: Set("kg".to_string()),
            created_at: Set(Utc::now()),
            updated_at: Set(None),
        }
        .insert(self.db.as_ref())
        .await
        .expect("seed stock lot")
    }

    pub async fn lot(&self, id: Uuid) -> stock_lot::Model {
        stock_lot::Entity::find_by_id(id)
            .one(self.db.as_ref())
            .await
            .expect("load lot")
            .expect("lot exists")
    }

    pub async fn entity(&self, id: Uuid) -> consuming_entity::Model {
        consuming_entity::Entity::find_by_id(id)
            .one(self.db.as_ref())
            .await
            .expect("load entity")
            .expect("entity exists")
    }

    pub async fn transaction(&self, id: Uuid) -> Option<usage_transaction::Model> {
        usage_transaction::Entity::find_by_id(id)
            .one(self.db.as_ref())
            .await
            .expect("load transaction")
    }

    pub async fn details(&self, transaction_id: Uuid) -> Vec<usage_detail::Model> {
        usage_detail::Entity::find()
            .filter(usage_detail::Column::UsageTransactionId.eq(transaction_id))
            .all(self.db.as_ref())
            .await
            .expect("load details")
    }

    /// Points `newer` at `older` through `supersedes_id`, bypassing the service.
    pub async fn mark_superseded_by(&self, newer: Uuid, older: Uuid) {
        let tx = self.transaction(newer).await.expect("transaction exists");
        let mut active: usage_transaction::ActiveModel = tx.into();
        active.supersedes_id = Set(Some(older));
        active.update(self.db.as_ref()).await.expect("set supersedes_id");
    }

    /// Overwrites a lot's used quantity, bypassing the service.
    pub async fn force_quantity_used(&self, lot_id: Uuid, quantity_used: Decimal) {
        let mut active: stock_lot::ActiveModel = self.lot(lot_id).await.into();
        active.quantity_used = Set(quantity_used);
        active.update(self.db.as_ref()).await.expect("set quantity used");
    }

    pub async fn transaction_count(&self) -> u64 {
        usage_transaction::Entity::find()
            .count(self.db.as_ref())
            .await
            .expect("count transactions")
    }

    /// Sum of detail quantities on `lot_id` across active transactions.
    pub async fn active_detail_sum(&self, lot_id: Uuid) -> Decimal {
        let active: Vec<Uuid> = usage_transaction::Entity::find()
            .filter(usage_transaction::Column::IsActive.eq(true))
            .all(self.db.as_ref())
            .await
            .expect("load transactions")
            .into_iter()
            .map(|tx| tx.id)
            .collect();

        usage_detail::Entity::find()
            .filter(usage_detail::Column::StockLotId.eq(lot_id))
            .all(self.db.as_ref())
            .await
            .expect("load details")
            .into_iter()
            .filter(|detail| active.contains(&detail.usage_transaction_id))
            .map(|detail| detail.quantity)
            .sum()
    }

    /// Sends a JSON request through the full router.
    pub async fn request(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("build request");

        let response = self.router().oneshot(request).await.expect("router response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, value)
    }
}

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
}

pub fn line(stock_lot_id: Uuid, quantity: Decimal) -> UsageAllocation {
    UsageAllocation {
        stock_lot_id,
        quantity,
        note: None,
        existing_detail_id: None,
    }
}

pub fn usage_request(
    consuming_entity_id: Uuid,
    usage_date: NaiveDate,
    allocations: Vec<UsageAllocation>,
) -> UsageRequest {
    UsageRequest {
        consuming_entity_id,
        usage_date,
        purpose: Some("daily feeding".to_string()),
        notes: None,
        domain: PolicyDomain::Feed,
        actor: Some("tester".to_string()),
        allocations,
        edit_context: None,
    }
}
