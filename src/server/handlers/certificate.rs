use axum::Json;
use axum::extract::{Path, State};
use secrecy::SecretString;
use serde::Deserialize;
use uuid::Uuid;

use super::ActingUser;
use crate::pki::CertificateSummary;
use crate::server::AppState;
use crate::server::errors::AppError;

#[derive(Deserialize)]
pub struct CertificateUpload {
    /// Base64 PKCS#12 bundle
    pub pfx_base64: SecretString,
    pub password: SecretString,
}

pub async fn register_certificate(
    State(state): State<AppState>,
    ActingUser(user): ActingUser,
    Path(company_id): Path<Uuid>,
    Json(upload): Json<CertificateUpload>,
) -> Result<Json<CertificateSummary>, AppError> {
    let summary = state
        .engine
        .register_certificate(&user, company_id, &upload.pfx_base64, &upload.password)
        .await?;
    Ok(Json(summary))
}
