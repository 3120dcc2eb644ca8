use axum::extract::{Path, State};
use axum::http::header;
use axum::response::IntoResponse;
use uuid::Uuid;

use super::ActingUser;
use crate::server::AppState;
use crate::server::errors::AppError;

/// The rendered DANFSe as a PDF download.
pub async fn artifact(
    State(state): State<AppState>,
    ActingUser(user): ActingUser,
    Path(invoice_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let document = state.engine.download_artifact(&user, invoice_id).await?;
    let disposition = format!("attachment; filename=\"danfse-{invoice_id}.pdf\"");
    Ok((
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        document,
    ))
}
