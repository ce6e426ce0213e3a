//! Application-wide error types.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::draft::FieldErrors;
use crate::order::{OrderId, OrderStatus};

#[derive(Debug, Error)]
pub enum PortalError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backend responded with {status}: {message}")]
    Backend { status: u16, message: String },

    #[error("Order creation failed: {0}")]
    OrderCreation(String),

    #[error("Payment verification timed out after {0}s")]
    VerificationTimeout(u64),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Order {0} has already been paid")]
    AlreadyPaid(OrderId),

    #[error("Invalid document encoding: {0}")]
    Document(#[from] base64::DecodeError),

    #[error("Validation failed on {} field(s)", .0.len())]
    Validation(FieldErrors),

    #[error("Order {order_id} cannot move from {from} to {to}")]
    Transition {
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    },
}

pub type Result<T> = std::result::Result<T, PortalError>;

impl PortalError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::Document(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::AlreadyPaid(_) | Self::Transition { .. } => StatusCode::CONFLICT,
            Self::OrderCreation(_) | Self::Backend { .. } | Self::Http(_) => {
                StatusCode::BAD_GATEWAY
            }
            Self::VerificationTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Database(_) | Self::Migrate(_) | Self::Json(_) | Self::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message safe to show to the registrant. Internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::Validation(_) => "Please fix the errors in the form".to_string(),
            Self::Document(_) => "Uploaded document could not be read".to_string(),
            Self::NotFound(what) => format!("Not found: {what}"),
            Self::AlreadyPaid(order_id) => {
                format!("Order {order_id} has already been paid")
            }
            Self::Transition { order_id, .. } => {
                format!("Order {order_id} is not in a state that allows this action")
            }
            Self::OrderCreation(_) | Self::Backend { .. } | Self::Http(_) => {
                "Failed to initiate payment. Please try again.".to_string()
            }
            Self::VerificationTimeout(_) => "Payment verification timed out".to_string(),
            _ => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for PortalError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }

        let body = match &self {
            Self::Validation(errors) => json!({
                "error": self.public_message(),
                "fields": errors,
            }),
            _ => json!({ "error": self.public_message() }),
        };

        (status, Json(body)).into_response()
    }
}
