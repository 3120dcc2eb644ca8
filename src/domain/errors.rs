use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::artifact::ArtifactError;
use crate::domain::models::SaleStatus;
use crate::domain::ports::{CollaboratorError, PortalError};
use crate::emissor::TransmissionError;
use crate::pki::CertificateError;
use crate::store::StoreError;
use crate::vault::VaultError;
use crate::xmldsig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Every problem found while validating a document, reported at once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub fields: Vec<FieldError>,
}

impl ValidationError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(field: &str, message: impl Into<String>) -> Self {
        let mut error = Self::new();
        error.push(field, message);
        error
    }

    pub fn push(&mut self, field: &str, message: impl Into<String>) {
        self.fields.push(FieldError {
            field: field.to_string(),
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn has(&self, field: &str) -> bool {
        self.fields.iter().any(|f| f.field == field)
    }

    /// `Ok(())` when nothing was collected.
    pub fn into_result(self) -> Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "validation failed: ")?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}: {}", field.field, field.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// State machine violations and remote/local disagreements.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconciliationError {
    #[error("sale is {actual:?}, expected {expected}")]
    InvalidSaleState {
        expected: &'static str,
        actual: SaleStatus,
    },
    #[error("sale has no invoice with an access key")]
    NoAccessKey,
    #[error("no protocol recorded locally or at the authority; cannot cancel")]
    MissingProtocol,
    #[error("authority reports the invoice as rejected: {reason}")]
    RemoteRejected { reason: String },
    #[error("authority is still processing the invoice")]
    NotYetAuthorized,
    #[error("access key already assigned ({current})")]
    AccessKeyImmutable { current: String },
}

/// Top-level error of every engine operation.
#[derive(Debug, Error)]
pub enum NfseError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Certificate(#[from] CertificateError),

    #[error("signing failed: {0}")]
    Signing(#[from] xmldsig::Error),

    #[error(transparent)]
    Transmission(#[from] TransmissionError),

    #[error(transparent)]
    Reconciliation(#[from] ReconciliationError),

    #[error("plan limit reached: {reason}")]
    PlanDenied { reason: String, status: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("authority refused the cancellation: {reason}")]
    CancellationRefused { reason: String },

    #[error(transparent)]
    Portal(#[from] PortalError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl NfseError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}
