use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use uuid::Uuid;

use crate::dto::usage::{
    AllocationPlanRequest, DeleteUsageParams, ExistingUsageQuery, ReactivateUsageRequest,
    StockLotQuery, UsageRequest,
};
use crate::errors::ServiceError;
use crate::services::usage::UsageService;
use crate::ApiResponse;

// Trait for usage handler state that provides access to the usage service
pub trait UsageHandlerState: Clone + Send + Sync + 'static {
    fn usage_service(&self) -> &UsageService;
}

/// Create the usage ledger router
pub fn usage_router<S>() -> Router<S>
where
    S: UsageHandlerState,
{
    Router::new()
        .route("/entities/:entity_id/stock-lots", get(list_stock_lots::<S>))
        .route("/entities/:entity_id/usages", get(get_existing_usage::<S>))
        .route("/entities/:entity_id/allocation-plan", post(plan_allocations::<S>))
        .route("/usages", post(commit_usage::<S>))
        .route("/usages/preview", post(preview_usage::<S>))
        .route("/usages/:id", delete(delete_usage::<S>))
        .route("/usages/:id/reactivate", post(reactivate_usage::<S>))
        .route("/usages/:id/audit", get(audit_history::<S>))
}

/// List lots with stock left, grouped by resource
pub async fn list_stock_lots<S>(
    State(state): State<S>,
    Path(entity_id): Path<Uuid>,
    Query(query): Query<StockLotQuery>,
) -> Result<impl IntoResponse, ServiceError>
where
    S: UsageHandlerState,
{
    let groups = state
        .usage_service()
        .list_available_stock_lots(entity_id, query.resource_id, query.domain)
        .await?;
    Ok(Json(ApiResponse::success(groups)))
}

/// Fetch a usage transaction by id or date
pub async fn get_existing_usage<S>(
    State(state): State<S>,
    Path(entity_id): Path<Uuid>,
    Query(query): Query<ExistingUsageQuery>,
) -> Result<impl IntoResponse, ServiceError>
where
    S: UsageHandlerState,
{
    let usage = state
        .usage_service()
        .get_existing_usage(entity_id, query.date, query.transaction_id)
        .await?;
    Ok(Json(ApiResponse::success(usage)))
}

pub async fn plan_allocations<S>(
    State(state): State<S>,
    Path(entity_id): Path<Uuid>,
    Json(request): Json<AllocationPlanRequest>,
) -> Result<impl IntoResponse, ServiceError>
where
    S: UsageHandlerState,
{
    let plan = state.usage_service().plan_allocations(entity_id, request).await?;
    Ok(Json(ApiResponse::success(plan)))
}

/// Dry run of a usage submission; never writes
pub async fn preview_usage<S>(
    State(state): State<S>,
    Json(request): Json<UsageRequest>,
) -> Result<impl IntoResponse, ServiceError>
where
    S: UsageHandlerState,
{
    let preview = state.usage_service().preview_usage(&request).await?;
    Ok(Json(ApiResponse::success(preview)))
}

/// Commit usage, or edit an existing transaction when `edit_context` is present
pub async fn commit_usage<S>(
    State(state): State<S>,
    Json(request): Json<UsageRequest>,
) -> Result<impl IntoResponse, ServiceError>
where
    S: UsageHandlerState,
{
    let status = if request.is_edit() {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    let result = state.usage_service().commit_usage(request).await?;
    Ok((status, Json(ApiResponse::success(result))))
}

pub async fn delete_usage<S>(
    State(state): State<S>,
    Path(id): Path<Uuid>,
    Query(params): Query<DeleteUsageParams>,
) -> Result<impl IntoResponse, ServiceError>
where
    S: UsageHandlerState,
{
    let result = state.usage_service().delete_usage(id, params).await?;
    Ok(Json(ApiResponse::success(result)))
}

pub async fn reactivate_usage<S>(
    State(state): State<S>,
    Path(id): Path<Uuid>,
    body: Option<Json<ReactivateUsageRequest>>,
) -> Result<impl IntoResponse, ServiceError>
where
    S: UsageHandlerState,
{
    let actor = body.and_then(|Json(request)| request.actor);
    let usage = state.usage_service().reactivate_usage(id, actor).await?;
    Ok(Json(ApiResponse::success(usage)))
}

pub async fn audit_history<S>(
    State(state): State<S>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError>
where
    S: UsageHandlerState,
{
    let history = state.usage_service().audit_history(id).await?;
    Ok(Json(ApiResponse::success(history)))
}
