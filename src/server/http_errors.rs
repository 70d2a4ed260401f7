use crate::application::{AccountError, AnalysisError, WebhookError};
use axum::http::StatusCode;

pub(super) fn map_account_error(err: &AccountError) -> (StatusCode, serde_json::Value) {
    match err {
        AccountError::Validation(msg) => {
            (StatusCode::BAD_REQUEST, serde_json::json!({ "error": msg }))
        }
        AccountError::DuplicateUsername => (
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "error": "Username already taken" }),
        ),
        AccountError::InvalidCredentials => (
            StatusCode::UNAUTHORIZED,
            serde_json::json!({ "error": "Invalid username or password" }),
        ),
        AccountError::Unauthenticated => (
            StatusCode::UNAUTHORIZED,
            serde_json::json!({ "error": "Missing or invalid authorization token" }),
        ),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": "Account operation failed" }),
        ),
    }
}

pub(super) fn map_analysis_error(err: &AnalysisError) -> (StatusCode, serde_json::Value) {
    match err {
        AnalysisError::QuotaExceeded(usage) => (
            StatusCode::PAYMENT_REQUIRED,
            serde_json::json!({
                "error": "Daily scan limit reached. Upgrade to premium for unlimited scans.",
                "usage": usage
            }),
        ),
        AnalysisError::InvalidInput(msg) => {
            (StatusCode::BAD_REQUEST, serde_json::json!({ "error": msg }))
        }
        AnalysisError::Repository(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": "Failed to record scan usage" }),
        ),
    }
}

pub(super) fn map_webhook_error(err: &WebhookError) -> (StatusCode, serde_json::Value) {
    match err {
        WebhookError::SignatureInvalid => (
            StatusCode::UNAUTHORIZED,
            serde_json::json!({ "error": "Invalid signature" }),
        ),
        WebhookError::Malformed(msg) => (
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "error": format!("Malformed payload: {}", msg) }),
        ),
        WebhookError::Repository(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": "Failed to apply billing event" }),
        ),
    }
}
