use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;
use uuid::Uuid;

use super::ActingUser;
use crate::domain::engine::{ConsultReport, SignatureDiagnosis};
use crate::domain::models::{Invoice, Sale, SaleCorrections};
use crate::server::AppState;
use crate::server::errors::AppError;

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub justification: String,
}

pub async fn emit(
    State(state): State<AppState>,
    ActingUser(user): ActingUser,
    Path(sale_id): Path<Uuid>,
) -> Result<Json<Invoice>, AppError> {
    Ok(Json(state.engine.emit(&user, sale_id).await?))
}

/// Body is optional; when present it carries corrections.
pub async fn retry(
    State(state): State<AppState>,
    ActingUser(user): ActingUser,
    Path(sale_id): Path<Uuid>,
    corrections: Option<Json<SaleCorrections>>,
) -> Result<Json<Invoice>, AppError> {
    let corrections = corrections.map(|Json(c)| c);
    Ok(Json(state.engine.retry(&user, sale_id, corrections).await?))
}

pub async fn resubmit(
    State(state): State<AppState>,
    ActingUser(user): ActingUser,
    Path(sale_id): Path<Uuid>,
    Json(corrections): Json<SaleCorrections>,
) -> Result<Json<Sale>, AppError> {
    Ok(Json(
        state
            .engine
            .correct_and_resubmit(&user, sale_id, corrections)
            .await?,
    ))
}

pub async fn consult(
    State(state): State<AppState>,
    ActingUser(user): ActingUser,
    Path(sale_id): Path<Uuid>,
) -> Result<Json<ConsultReport>, AppError> {
    Ok(Json(state.engine.consult(&user, sale_id).await?))
}

pub async fn cancel(
    State(state): State<AppState>,
    ActingUser(user): ActingUser,
    Path(sale_id): Path<Uuid>,
    Json(request): Json<CancelRequest>,
) -> Result<Json<Invoice>, AppError> {
    Ok(Json(
        state
            .engine
            .cancel(&user, sale_id, &request.justification)
            .await?,
    ))
}

pub async fn signature(
    State(state): State<AppState>,
    ActingUser(user): ActingUser,
    Path(sale_id): Path<Uuid>,
) -> Result<Json<SignatureDiagnosis>, AppError> {
    Ok(Json(state.engine.diagnose_signature(&user, sale_id).await?))
}
