use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error payload returned by every HTTP endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Unprocessable Entity")
    pub error: String,
    /// Machine-readable error code
    pub code: String,
    /// Human-readable error description
    pub message: String,
    /// Individual problems, filled for restriction violations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
    /// ISO 8601 timestamp when error occurred
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    /// `lot_id` is empty when the shortfall is across a resource's pooled lots.
    #[error(
        "Insufficient stock{}: requested {requested}, available {available}",
        .lot_id.map(|id| format!(" on lot {}", id)).unwrap_or_default()
    )]
    InsufficientStock {
        lot_id: Option<Uuid>,
        requested: Decimal,
        available: Decimal,
    },

    #[error("Restriction violation: {}", .errors.join("; "))]
    RestrictionViolation { errors: Vec<String> },

    #[error("Concurrent modification of stock lot {0}")]
    ConcurrencyConflict(Uuid),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Commit failed: {0}")]
    CommitFailed(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::SerializationError(err.to_string())
    }
}

pub trait IntoDbErr {
    fn into_db_err(self) -> DbErr;
}

impl IntoDbErr for DbErr {
    fn into_db_err(self) -> DbErr {
        self
    }
}

impl IntoDbErr for String {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self)
    }
}

impl IntoDbErr for &str {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self.to_string())
    }
}

impl ServiceError {
    /// Generic constructor that normalizes any supported database error input.
    pub fn db_error<E: IntoDbErr>(error: E) -> Self {
        ServiceError::DatabaseError(error.into_db_err())
    }

    pub fn not_found(kind: &str, id: Uuid) -> Self {
        ServiceError::NotFound(format!("{} {} not found", kind, id))
    }

    /// Whether this error was raised by business rules before any write happened.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::ValidationError(_)
                | Self::InvalidQuantity(_)
                | Self::InvalidResource(_)
                | Self::InsufficientStock { .. }
                | Self::RestrictionViolation { .. }
                | Self::NotFound(_)
                | Self::Conflict(_)
                | Self::InvalidStateTransition(_)
        )
    }

    /// Short machine-readable code, also used as a metrics label.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DatabaseError(_) => "database_error",
            Self::NotFound(_) => "reference_not_found",
            Self::ValidationError(_) => "validation_error",
            Self::InvalidQuantity(_) => "invalid_quantity",
            Self::InvalidResource(_) => "invalid_resource",
            Self::InsufficientStock { .. } => "insufficient_stock",
            Self::RestrictionViolation { .. } => "restriction_violation",
            Self::ConcurrencyConflict(_) => "concurrency_conflict",
            Self::Conflict(_) => "conflict",
            Self::InvalidStateTransition(_) => "invalid_state_transition",
            Self::CommitFailed(_) => "commit_failed",
            Self::SerializationError(_) => "serialization_error",
            Self::InternalError(_) => "internal_error",
        }
    }

    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_) | Self::InvalidQuantity(_) | Self::InvalidResource(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::InsufficientStock { .. } | Self::RestrictionViolation { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::ConcurrencyConflict(_) | Self::Conflict(_) | Self::InvalidStateTransition(_) => {
                StatusCode::CONFLICT
            }
            Self::DatabaseError(_)
            | Self::CommitFailed(_)
            | Self::SerializationError(_)
            | Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::CommitFailed(_) => "Usage could not be committed".to_string(),
            Self::SerializationError(_) | Self::InternalError(_) => {
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let details = match &self {
            ServiceError::RestrictionViolation { errors } => errors.clone(),
            _ => Vec::new(),
        };

        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            code: self.code().to_string(),
            message: self.response_message(),
            details,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}
