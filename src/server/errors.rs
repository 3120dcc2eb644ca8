use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

use crate::domain::errors::{NfseError, ReconciliationError};
use crate::domain::ports::PortalError;

mod codes {
    pub const VALIDATION: &str = "VALIDATION_ERROR";
    pub const CERTIFICATE: &str = "CERTIFICATE_ERROR";
    pub const PLAN_LIMIT: &str = "PLAN_LIMIT_REACHED";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const RECONCILIATION: &str = "RECONCILIATION_ERROR";
    pub const CANCELLATION_REFUSED: &str = "CANCELLATION_REFUSED";
    pub const TRANSMISSION: &str = "TRANSMISSION_ERROR";
    pub const UPSTREAM: &str = "UPSTREAM_UNAVAILABLE";
    pub const UNAUTHENTICATED: &str = "UNAUTHENTICATED";
    pub const INTERNAL: &str = "INTERNAL_ERROR";
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("missing x-user-id header")]
    MissingUser,
    #[error(transparent)]
    Nfse(#[from] NfseError),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Value::is_null")]
    details: Value,
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, Value) {
        let error = match self {
            AppError::MissingUser => {
                return (StatusCode::UNAUTHORIZED, codes::UNAUTHENTICATED, Value::Null);
            }
            AppError::Nfse(e) => e,
        };

        match error {
            NfseError::Validation(v) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                codes::VALIDATION,
                json!({ "fields": v.fields }),
            ),
            NfseError::Certificate(_) => (StatusCode::BAD_REQUEST, codes::CERTIFICATE, Value::Null),
            NfseError::PlanDenied { status, .. } => (
                StatusCode::FORBIDDEN,
                codes::PLAN_LIMIT,
                json!({ "status": status }),
            ),
            NfseError::NotFound { entity, id } => (
                StatusCode::NOT_FOUND,
                codes::NOT_FOUND,
                json!({ "entity": entity, "id": id }),
            ),
            NfseError::Reconciliation(r) => (
                StatusCode::CONFLICT,
                codes::RECONCILIATION,
                reconciliation_details(r),
            ),
            NfseError::CancellationRefused { reason } => (
                StatusCode::CONFLICT,
                codes::CANCELLATION_REFUSED,
                json!({ "reason": reason }),
            ),
            NfseError::Transmission(_) => {
                (StatusCode::BAD_GATEWAY, codes::TRANSMISSION, Value::Null)
            }
            NfseError::Portal(PortalError::Unavailable) => {
                (StatusCode::NOT_FOUND, codes::NOT_FOUND, Value::Null)
            }
            NfseError::Portal(_) | NfseError::Collaborator(_) => {
                (StatusCode::BAD_GATEWAY, codes::UPSTREAM, Value::Null)
            }
            NfseError::Signing(_)
            | NfseError::Artifact(_)
            | NfseError::Vault(_)
            | NfseError::Store(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                codes::INTERNAL,
                Value::Null,
            ),
        }
    }
}

fn reconciliation_details(error: &ReconciliationError) -> Value {
    match error {
        ReconciliationError::InvalidSaleState { expected, actual } => {
            json!({ "expected": expected, "actual": actual })
        }
        ReconciliationError::RemoteRejected { reason } => json!({ "reason": reason }),
        _ => Value::Null,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, details) = self.parts();
        let error = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Service failure: {self:?}");
            "internal error".to_string()
        } else {
            tracing::debug!(%status, code, "Request failed: {self}");
            self.to_string()
        };

        (status, Json(ErrorBody { error, code, details })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::ValidationError;
    use crate::domain::models::SaleStatus;
    use crate::emissor::TransmissionError;
    use crate::store::StoreError;

    fn status_of(error: impl Into<NfseError>) -> StatusCode {
        AppError::from(error.into()).into_response().status()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_of(ValidationError::single("valor", "must be greater than zero")),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_of(crate::pki::CertificateError::WrongPassword),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(NfseError::PlanDenied {
                reason: "limit".into(),
                status: "LIMIT_REACHED".into()
            }),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_of(NfseError::not_found("sale", "x")),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(ReconciliationError::MissingProtocol),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(TransmissionError::Status {
                status: 500,
                body: String::new()
            }),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_of(StoreError::Backend("down".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            AppError::MissingUser.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn test_error_body() {
        let error = AppError::from(NfseError::from(ReconciliationError::InvalidSaleState {
            expected: "PENDENTE",
            actual: SaleStatus::Autorizada,
        }));
        let (status, code, details) = error.parts();

        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(code, "RECONCILIATION_ERROR");
        assert_eq!(details["expected"], "PENDENTE");
        assert_eq!(details["actual"], "AUTORIZADA");
    }

    #[tokio::test]
    async fn test_internal_errors_hide_details() {
        use http_body_util::BodyExt;

        let response = AppError::from(NfseError::from(StoreError::Backend(
            "redis://secret-host refused".into(),
        )))
        .into_response();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(body["code"], "INTERNAL_ERROR");
        assert_eq!(body["error"], "internal error");
        assert!(body.get("details").is_none());
    }
}
